use std::time::Duration;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::PublisherConfig;
use crate::error::PublishError;
use crate::metrics_consts::{
    PRODUCER_QUEUE_BYTES, PRODUCER_QUEUE_DEPTH, PUBLISHED_RECORDS, PUBLISH_ERRORS,
};

pub struct PublisherContext;

impl rdkafka::ClientContext for PublisherContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        metrics::gauge!(PRODUCER_QUEUE_DEPTH).set(stats.msg_cnt as f64);
        metrics::gauge!(PRODUCER_QUEUE_BYTES).set(stats.msg_size as f64);
    }
}

/// A record to publish as part of a batch.
#[derive(Debug, Clone)]
pub struct OutgoingRecord {
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl OutgoingRecord {
    pub fn new(key: Option<String>, payload: Vec<u8>) -> Self {
        Self { key, payload }
    }
}

/// Publishes records to topics on the subscriber's cluster.
#[derive(Clone)]
pub struct Publisher {
    producer: FutureProducer<PublisherContext>,
}

impl Publisher {
    pub fn new(config: &PublisherConfig) -> Result<Self, KafkaError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &config.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<PublisherContext> =
            client_config.create_with_context(PublisherContext)?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        drop(producer.client().fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(Duration::new(10, 0)),
        )?);
        info!("connected to Kafka brokers");

        Ok(Self { producer })
    }

    /// Publish one record and wait for the brokers to acknowledge it.
    pub async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<(), PublishError> {
        let ack = self.enqueue(topic, key, payload)?;
        Self::process_ack(ack).await
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        topic: &str,
        key: Option<&str>,
        value: &T,
    ) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(value).map_err(|error| {
            metrics::counter!(PUBLISH_ERRORS, "cause" => "serialization").increment(1);
            PublishError::SerializationError { error }
        })?;
        self.publish(topic, key, &payload).await
    }

    /// Publish a batch to one topic. Records are queued in order and their
    /// acks awaited concurrently; the batch fails on the first error.
    pub async fn publish_batch(
        &self,
        topic: &str,
        records: Vec<OutgoingRecord>,
    ) -> Result<(), PublishError> {
        let mut set = JoinSet::new();
        for record in records {
            let ack = self.enqueue(topic, record.key.as_deref(), &record.payload)?;
            set.spawn(Self::process_ack(ack));
        }

        while let Some(res) = set.join_next().await {
            match res {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    set.abort_all();
                    return Err(err);
                }
                Err(err) => {
                    set.abort_all();
                    error!("join error while waiting on Kafka ACK: {:?}", err);
                    return Err(PublishError::KafkaProduceCanceled);
                }
            }
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<(), KafkaError> {
        self.producer.flush(Duration::new(30, 0))
    }

    fn enqueue(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<DeliveryFuture, PublishError> {
        match self.producer.send_result(FutureRecord {
            topic,
            payload: Some(payload),
            partition: None,
            key,
            timestamp: None,
            headers: None,
        }) {
            Ok(ack) => Ok(ack),
            Err((e, _)) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageSizeTooLarge) => {
                    metrics::counter!(PUBLISH_ERRORS, "cause" => "message_size").increment(1);
                    Err(PublishError::MessageTooLarge)
                }
                _ => {
                    metrics::counter!(PUBLISH_ERRORS, "cause" => "enqueue").increment(1);
                    error!("failed to produce record: {}", e);
                    Err(PublishError::KafkaProduceError { error: e })
                }
            },
        }
    }

    async fn process_ack(delivery: DeliveryFuture) -> Result<(), PublishError> {
        match delivery.await {
            Err(_) => {
                // Cancelled due to timeout while retrying
                metrics::counter!(PUBLISH_ERRORS, "cause" => "timeout").increment(1);
                error!("failed to produce to Kafka before write timeout");
                Err(PublishError::KafkaProduceCanceled)
            }
            Ok(Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge), _))) => {
                // Rejected by broker due to message size
                metrics::counter!(PUBLISH_ERRORS, "cause" => "message_size").increment(1);
                Err(PublishError::MessageTooLarge)
            }
            Ok(Err((err, _))) => {
                metrics::counter!(PUBLISH_ERRORS, "cause" => "broker").increment(1);
                error!("failed to produce to Kafka: {}", err);
                Err(PublishError::KafkaProduceError { error: err })
            }
            Ok(Ok(_)) => {
                metrics::counter!(PUBLISHED_RECORDS).increment(1);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::DefaultProducerContext;
    use rdkafka::types::{RDKafkaApiKey, RDKafkaRespErr};
    use serde_json::json;

    fn start_on_mocked_publisher() -> (MockCluster<'static, DefaultProducerContext>, Publisher) {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let config = PublisherConfig {
            kafka_hosts: cluster.bootstrap_servers(),
            kafka_tls: false,
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_message_timeout_ms: 500,
            kafka_compression_codec: "none".to_string(),
        };
        let publisher = Publisher::new(&config).expect("failed to create publisher");
        (cluster, publisher)
    }

    #[tokio::test]
    async fn publisher_error_handling() {
        let (cluster, publisher) = start_on_mocked_publisher();
        let topic = "subscriber_output";

        // Wait for producer to be healthy, to keep kafka_message_timeout_ms short and tests faster
        for _ in 0..20 {
            if publisher.publish(topic, Some("k"), b"warmup").await.is_ok() {
                break;
            }
        }

        publisher
            .publish(topic, Some("k"), b"hello")
            .await
            .expect("failed to publish one record");
        publisher
            .publish_json(topic, None, &json!({"event": "signup", "count": 2}))
            .await
            .expect("failed to publish json record");
        publisher
            .publish_batch(
                topic,
                vec![
                    OutgoingRecord::new(Some("a".to_string()), b"one".to_vec()),
                    OutgoingRecord::new(None, b"two".to_vec()),
                ],
            )
            .await
            .expect("failed to publish batch");

        // Producer should reject a 2MB record, twice the default `message.max.bytes`
        let big_payload = vec![b'x'; 2_000_000];
        match publisher.publish(topic, None, &big_payload).await {
            Err(PublishError::MessageTooLarge) => {} // Expected
            Err(err) => panic!("wrong error code {}", err),
            Ok(()) => panic!("should have errored"),
        };

        // Rejected by the broker
        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_MSG_SIZE_TOO_LARGE; 1];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        match publisher.publish(topic, None, b"hello").await {
            Err(PublishError::MessageTooLarge) => {} // Expected
            Err(err) => panic!("wrong error code {}", err),
            Ok(()) => panic!("should have errored"),
        };

        // Transient errors are retried by the producer
        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_BROKER_NOT_AVAILABLE; 2];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        publisher
            .publish(topic, None, b"hello")
            .await
            .expect("failed to publish after recovery");

        // Timeout on a sustained transient error
        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_BROKER_NOT_AVAILABLE; 50];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        match publisher
            .publish_batch(topic, vec![OutgoingRecord::new(None, b"x".to_vec())])
            .await
        {
            Err(PublishError::KafkaProduceCanceled) | Err(PublishError::KafkaProduceError { .. }) => {}
            Err(err) => panic!("wrong error code {}", err),
            Ok(()) => panic!("should have errored"),
        };

        publisher.flush().expect("flush should succeed");
    }
}
