use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use serde_json::error::Error as SerdeError;
use thiserror::Error;

use crate::types::Partition;

/// Errors surfaced by a poll. Forwarded on the subscription's error stream,
/// except `ClientClosed` which ends the stream silently.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("kafka client closed")]
    ClientClosed,
    #[error("fetch error: {error}")]
    Fetch {
        partition: Option<Partition>,
        error: KafkaError,
    },
}

impl FetchError {
    pub fn new(partition: Option<Partition>, error: KafkaError) -> Self {
        FetchError::Fetch { partition, error }
    }

    pub fn partition(&self) -> Option<&Partition> {
        match self {
            FetchError::ClientClosed => None,
            FetchError::Fetch { partition, .. } => partition.as_ref(),
        }
    }

    /// Fatal errors mean the client can no longer make progress and the poll
    /// loop must stop after reporting them.
    pub fn is_fatal(&self) -> bool {
        match self {
            FetchError::ClientClosed => false,
            FetchError::Fetch { error, .. } => is_fatal_kafka_error(error),
        }
    }
}

impl From<KafkaError> for FetchError {
    fn from(error: KafkaError) -> Self {
        match error {
            KafkaError::Canceled => FetchError::ClientClosed,
            error => FetchError::new(None, error),
        }
    }
}

fn is_fatal_kafka_error(error: &KafkaError) -> bool {
    match error {
        KafkaError::MessageConsumptionFatal(_) => true,
        KafkaError::MessageConsumption(code) | KafkaError::Global(code) => matches!(
            code,
            RDKafkaErrorCode::Fatal
                | RDKafkaErrorCode::Authentication
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
        ),
        _ => false,
    }
}

/// Errors related to building and running a subscriber.
#[derive(Error, Debug)]
pub enum SubscriberError {
    #[error("invalid subscriber configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to create kafka consumer: {0}")]
    Kafka(#[from] KafkaError),
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to serialize: {error}")]
    SerializationError { error: SerdeError },
    #[error("message is too large for the broker")]
    MessageTooLarge,
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}
