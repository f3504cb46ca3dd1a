pub mod client;
pub mod config;
pub mod error;
pub mod kafka;
pub mod metrics_consts;
pub mod partition_consumer;
pub mod pool;
pub mod publisher;
pub mod subscriber;
pub mod types;

// Used in unit tests and the tests/ directory
pub mod test_utils;

pub use client::{GroupClient, MessageHandler, RebalanceListener};
pub use config::{KafkaConfig, PublisherConfig, SubscriberConfig, DEFAULT_MAX_RECORDS};
pub use error::{FetchError, PublishError, SubscriberError};
pub use publisher::{OutgoingRecord, Publisher};
pub use subscriber::Subscriber;
pub use types::{FetchPartition, Fetches, Partition, PartitionOffset, Record, TopicPartitions};
