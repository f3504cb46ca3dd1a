use envconfig::Envconfig;

/// Poll batch cap used when `MAX_RECORDS` is unset or zero.
pub const DEFAULT_MAX_RECORDS: usize = 10000;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    pub kafka_consumer_group: String,

    pub kafka_consumer_topic: String,

    // We default to "earliest" for this, but if you're bringing up a new service, you probably want "latest"
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // interval (in milliseconds) between auto commits, unused when auto commit is off
    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,

    // how long a poll keeps gathering records once the first one arrived
    #[envconfig(default = "100")]
    pub kafka_consumer_batch_timeout_ms: u64,

    // enables static membership and cooperative-sticky assignment when set
    pub kafka_client_id: Option<String>,
}

#[derive(Envconfig, Clone, Debug)]
pub struct SubscriberConfig {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    // handler concurrency per owned partition
    #[envconfig(from = "SUBSCRIBER_WORKERS", default = "1")]
    pub workers: usize,

    // cap on records returned by a single poll, 0 means DEFAULT_MAX_RECORDS
    #[envconfig(from = "SUBSCRIBER_MAX_RECORDS", default = "10000")]
    pub max_records: usize,

    // when disabled, offsets are committed after every dispatched batch and
    // on partition revocation
    #[envconfig(from = "KAFKA_CONSUMER_AUTO_COMMIT", default = "true")]
    pub auto_commit: bool,

    // call allow_rebalance on the client after every poll
    #[envconfig(from = "SUBSCRIBER_BLOCK_REBALANCE", default = "false")]
    pub block_rebalance: bool,
}

impl SubscriberConfig {
    /// Max records per poll after applying the default for an unset value.
    pub fn effective_max_records(&self) -> usize {
        if self.max_records == 0 {
            DEFAULT_MAX_RECORDS
        } else {
            self.max_records
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct PublisherConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
}
