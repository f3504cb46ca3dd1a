pub mod client;
pub mod config;
pub mod context;
pub mod offsets;

pub use client::KafkaGroupClient;
pub use config::ConsumerConfigBuilder;
pub use context::SubscriberContext;
pub use offsets::StoredOffsets;
