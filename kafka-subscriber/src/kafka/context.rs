use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};

use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, TopicPartitionList};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::client::RebalanceListener;
use crate::kafka::offsets::StoredOffsets;
use crate::metrics_consts::{COMMIT_FAILURES, REBALANCE_EVENTS};
use crate::types::topic_partitions_from_list;

#[derive(Debug, Clone, Copy)]
enum RebalanceKind {
    Assigned,
    Revoked,
    Lost,
}

impl RebalanceKind {
    fn as_str(self) -> &'static str {
        match self {
            RebalanceKind::Assigned => "assigned",
            RebalanceKind::Revoked => "revoked",
            RebalanceKind::Lost => "lost",
        }
    }
}

/// Bridges librdkafka's rebalance callbacks to the registered listener.
///
/// Callbacks fire on the thread driving the consumer poll. The listener runs
/// to completion inside the callback, so a revocation only finishes once
/// every affected partition has stopped. This blocks a runtime worker thread
/// and requires the multi-threaded tokio runtime.
pub struct SubscriberContext {
    listener: OnceLock<Weak<dyn RebalanceListener>>,
    stored_offsets: StoredOffsets,
    /// Handle to the async runtime for executing async callbacks from sync context
    rt_handle: Handle,
}

impl SubscriberContext {
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Self {
            listener: OnceLock::new(),
            stored_offsets: StoredOffsets::new(),
            rt_handle: Handle::current(),
        }
    }

    pub fn set_listener(&self, listener: Weak<dyn RebalanceListener>) {
        if self.listener.set(listener).is_err() {
            warn!("rebalance listener already registered, ignoring");
        }
    }

    pub fn stored_offsets(&self) -> &StoredOffsets {
        &self.stored_offsets
    }

    fn listener(&self) -> Option<Arc<dyn RebalanceListener>> {
        self.listener.get().and_then(Weak::upgrade)
    }

    fn block_on<F: Future<Output = ()>>(&self, fut: F) {
        tokio::task::block_in_place(|| self.rt_handle.block_on(fut));
    }

    fn notify(&self, kind: RebalanceKind, partitions: &TopicPartitionList) {
        let event = kind.as_str();
        // cooperative-sticky sends empty rebalances whenever membership changes
        if partitions.count() == 0 {
            debug!(event, "skipping empty rebalance");
            return;
        }
        let Some(listener) = self.listener() else {
            warn!(event, "no rebalance listener registered, ignoring rebalance");
            return;
        };

        metrics::counter!(REBALANCE_EVENTS, "event_type" => event).increment(1);
        info!(event, partitions = partitions.count(), "rebalance");

        let partitions = topic_partitions_from_list(partitions);
        match kind {
            RebalanceKind::Assigned => {
                // marks left over from an earlier ownership must not hold back the new one
                self.stored_offsets.forget(&partitions);
                self.block_on(listener.assigned(partitions));
            }
            RebalanceKind::Revoked => {
                self.block_on(listener.revoked(partitions.clone()));
                self.stored_offsets.forget(&partitions);
            }
            RebalanceKind::Lost => {
                self.block_on(listener.lost(partitions.clone()));
                self.stored_offsets.forget(&partitions);
            }
        }
    }
}

impl ClientContext for SubscriberContext {}

impl ConsumerContext for SubscriberContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if base_consumer.assignment_lost() {
                    self.notify(RebalanceKind::Lost, partitions);
                } else {
                    self.notify(RebalanceKind::Revoked, partitions);
                }
            }
            Rebalance::Assign(partitions) => {
                debug!(partitions = partitions.count(), "pre-rebalance assign");
            }
            Rebalance::Error(e) => {
                error!("rebalance error: {e}");
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => self.notify(RebalanceKind::Assigned, partitions),
            Rebalance::Revoke(_) => debug!("post-rebalance revoke"),
            Rebalance::Error(e) => error!("post-rebalance error: {e}"),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => {
                debug!(partitions = offsets.count(), "committed offsets");
            }
            Err(e) => {
                metrics::counter!(COMMIT_FAILURES, "kind" => "callback").increment(1);
                warn!("failed to commit offsets: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::topic_partitions;
    use crate::types::{Partition, TopicPartitions};
    use async_trait::async_trait;
    use rdkafka::Offset;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<(&'static str, TopicPartitions)>>,
    }

    #[async_trait]
    impl RebalanceListener for RecordingListener {
        async fn assigned(&self, partitions: TopicPartitions) {
            self.events.lock().unwrap().push(("assigned", partitions));
        }

        async fn revoked(&self, partitions: TopicPartitions) {
            self.events.lock().unwrap().push(("revoked", partitions));
        }

        async fn lost(&self, partitions: TopicPartitions) {
            self.events.lock().unwrap().push(("lost", partitions));
        }
    }

    fn partition_list(partitions: &[i32]) -> TopicPartitionList {
        let mut list = TopicPartitionList::new();
        for p in partitions {
            list.add_partition_offset("events", *p, Offset::Invalid)
                .unwrap();
        }
        list
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_notify_runs_listener_to_completion() {
        let listener = Arc::new(RecordingListener::default());
        let context = SubscriberContext::new();
        let weak: Weak<dyn RebalanceListener> = Arc::<RecordingListener>::downgrade(&listener);
        context.set_listener(weak);

        context.notify(RebalanceKind::Assigned, &partition_list(&[0, 1]));
        context.notify(RebalanceKind::Revoked, &partition_list(&[1]));
        context.notify(RebalanceKind::Lost, &partition_list(&[0]));

        let events = listener.events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ("assigned", topic_partitions("events", &[0, 1])));
        assert_eq!(events[1], ("revoked", topic_partitions("events", &[1])));
        assert_eq!(events[2], ("lost", topic_partitions("events", &[0])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rebalance_resets_stored_offsets() {
        let listener = Arc::new(RecordingListener::default());
        let context = SubscriberContext::new();
        let weak: Weak<dyn RebalanceListener> = Arc::<RecordingListener>::downgrade(&listener);
        context.set_listener(weak);

        let p0 = Partition::new("events".to_string(), 0);
        let p1 = Partition::new("events".to_string(), 1);
        context.stored_offsets().advance(&p0, 40);
        context.stored_offsets().advance(&p1, 12);

        context.notify(RebalanceKind::Revoked, &partition_list(&[0]));
        assert_eq!(context.stored_offsets().get(&p0), None);
        assert_eq!(context.stored_offsets().get(&p1), Some(12));

        context.notify(RebalanceKind::Assigned, &partition_list(&[1]));
        assert_eq!(context.stored_offsets().get(&p1), None);
        assert!(context.stored_offsets().advance(&p1, 5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_rebalance_is_skipped() {
        let listener = Arc::new(RecordingListener::default());
        let context = SubscriberContext::new();
        let weak: Weak<dyn RebalanceListener> = Arc::<RecordingListener>::downgrade(&listener);
        context.set_listener(weak);

        context.notify(RebalanceKind::Assigned, &TopicPartitionList::new());
        assert!(listener.events.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_listener_is_ignored() {
        let context = SubscriberContext::new();
        {
            let listener = Arc::new(RecordingListener::default());
            let weak: Weak<dyn RebalanceListener> = Arc::<RecordingListener>::downgrade(&listener);
            context.set_listener(weak);
        }
        // must not panic or block once the subscriber is gone
        context.notify(RebalanceKind::Revoked, &partition_list(&[0]));
    }
}
