use std::future::Future;
use std::sync::Weak;

use async_trait::async_trait;
use rdkafka::error::KafkaError;

use crate::types::{Fetches, Partition, PartitionOffset, Record, TopicPartitions};

/// Receives consumer group membership changes.
///
/// Called by the group client while it polls, so `revoked` and `lost` may
/// block that poll until the affected partitions have stopped.
#[async_trait]
pub trait RebalanceListener: Send + Sync {
    async fn assigned(&self, partitions: TopicPartitions);

    async fn revoked(&self, partitions: TopicPartitions);

    /// Ownership is already gone, so nothing may be committed for these.
    async fn lost(&self, partitions: TopicPartitions);
}

/// The consumer-group client the subscriber drives.
#[async_trait]
pub trait GroupClient: Send + Sync + 'static {
    /// Install the listener for assign/revoke/lost events. Must be called
    /// before the first poll.
    fn register_listener(&self, listener: Weak<dyn RebalanceListener>);

    /// Wait for up to `max_records` records. A closed client reports
    /// `FetchError::ClientClosed` rather than blocking.
    async fn poll_records(&self, max_records: usize) -> Fetches;

    /// Record that a message has been handled, making its offset eligible for
    /// the next commit of marked offsets.
    fn mark_consumed(&self, partition: &Partition, offset: i64);

    /// Commit explicit next-to-consume offsets.
    async fn commit_offsets(&self, offsets: &[PartitionOffset]) -> Result<(), KafkaError>;

    /// Synchronously commit every offset marked consumed so far.
    async fn commit_marked_offsets(&self) -> Result<(), KafkaError>;

    /// Let a rebalance held back by the last poll proceed. Only meaningful
    /// when rebalances are blocked on poll.
    fn allow_rebalance(&self) {}

    /// Close the client, unblocking any pending poll.
    fn close(&self);
}

/// User callback invoked once per record on one of the partition's workers.
///
/// Handlers own their error handling. With more than one worker per
/// partition, completion order is not fetch order.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, record: Record);
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Record) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, record: Record) {
        (self)(record).await
    }
}
