// ==== Worker pool metrics ====
/// Counter for tasks that panicked on a pool worker
pub const WORKER_TASK_PANICS: &str = "kafka_subscriber_worker_task_panics_total";

// ==== Partition consumer metrics ====
/// Counter for records handed to the user handler
pub const RECORDS_HANDLED: &str = "kafka_subscriber_records_handled_total";

/// Counter for batches dropped because their partition was being stopped
pub const BATCHES_DROPPED: &str = "kafka_subscriber_batches_dropped_total";

/// Counter for failed offset commits, labelled by commit kind
pub const COMMIT_FAILURES: &str = "kafka_subscriber_commit_failures_total";

// ==== Subscriber metrics ====
/// Gauge for partitions currently owned by this subscriber
pub const OWNED_PARTITIONS: &str = "kafka_subscriber_owned_partitions";

/// Counter for fetch errors, labelled by severity
pub const FETCH_ERRORS: &str = "kafka_subscriber_fetch_errors_total";

/// Counter for rebalance events, labelled by event type
pub const REBALANCE_EVENTS: &str = "kafka_subscriber_rebalance_events_total";

// ==== Publisher metrics ====
/// Counter for records acknowledged by the brokers
pub const PUBLISHED_RECORDS: &str = "kafka_publisher_records_published_total";

/// Counter for produce failures, labelled by cause
pub const PUBLISH_ERRORS: &str = "kafka_publisher_errors_total";

/// Gauge for messages waiting in the producer queue
pub const PRODUCER_QUEUE_DEPTH: &str = "kafka_publisher_queue_depth";

/// Gauge for bytes waiting in the producer queue
pub const PRODUCER_QUEUE_BYTES: &str = "kafka_publisher_queue_bytes";
