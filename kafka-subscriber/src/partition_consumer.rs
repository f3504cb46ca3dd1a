//! Partition Consumer - one per owned partition
//!
//! Receives that partition's record batches from the poll loop and submits
//! every record to its own worker pool. The batch channel holds a single
//! batch, so a slow partition pushes back on the poll loop rather than
//! buffering without bound.
//!
//! When offsets are committed manually, the batch's next offset is committed
//! as soon as every record has been *submitted* to the pool, not when the
//! handlers have finished. A crash in between loses those records.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{GroupClient, MessageHandler};
use crate::metrics_consts::{COMMIT_FAILURES, RECORDS_HANDLED};
use crate::pool::WorkerPool;
use crate::types::{next_offset, Partition, PartitionOffset, Record};

pub struct PartitionConsumer {
    partition: Partition,
    batches: mpsc::Sender<Vec<Record>>,
    stop: CancellationToken,
    done: JoinHandle<()>,
}

impl PartitionConsumer {
    /// Spawn the dispatch task for `partition`.
    ///
    /// With `commit_on_dispatch` the consumer commits each batch itself once
    /// it has been fully submitted.
    pub fn start(
        partition: Partition,
        pool: WorkerPool,
        commit_on_dispatch: bool,
        handler: Arc<dyn MessageHandler>,
        client: Arc<dyn GroupClient>,
    ) -> Self {
        let (batches, rx) = mpsc::channel(1);
        let stop = CancellationToken::new();

        let dispatcher = Dispatcher {
            partition: partition.clone(),
            pool,
            commit_on_dispatch,
            handler,
            client,
            stop: stop.clone(),
        };
        let done = tokio::spawn(dispatcher.run(rx));

        Self {
            partition,
            batches,
            stop,
            done,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// A handle the poll loop can deliver batches through without holding
    /// on to the consumer itself.
    pub fn sender(&self) -> BatchSender {
        BatchSender {
            batches: self.batches.clone(),
            stop: self.stop.clone(),
        }
    }

    /// Signal the dispatch task to stop without waiting for it.
    pub fn signal_stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stop the dispatch task and wait for it to exit.
    ///
    /// Records already running on the pool are left to finish on their own;
    /// the rest of an in-flight batch is abandoned.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.done.await {
            error!(partition = %self.partition, "partition consumer task failed: {e}");
        }
    }
}

#[derive(Clone)]
pub struct BatchSender {
    batches: mpsc::Sender<Vec<Record>>,
    stop: CancellationToken,
}

impl BatchSender {
    /// Hand a batch to the partition's dispatch task, waiting while it is
    /// busy with the previous one. Returns false when the batch was dropped
    /// because the partition is stopping.
    pub async fn deliver(&self, records: Vec<Record>) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            sent = self.batches.send(records) => sent.is_ok(),
        }
    }

    /// True once the dispatch task has exited and dropped its end.
    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.batches.is_closed()
    }
}

struct Dispatcher {
    partition: Partition,
    pool: WorkerPool,
    commit_on_dispatch: bool,
    handler: Arc<dyn MessageHandler>,
    client: Arc<dyn GroupClient>,
    stop: CancellationToken,
}

impl Dispatcher {
    async fn run(self, mut batches: mpsc::Receiver<Vec<Record>>) {
        info!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            workers = self.pool.capacity(),
            "partition consumer started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                batch = batches.recv() => match batch {
                    Some(records) => self.dispatch(records).await,
                    None => break,
                },
            }
        }

        info!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            "partition consumer stopped"
        );
    }

    async fn dispatch(&self, records: Vec<Record>) {
        let commit_offset = next_offset(&records);
        let count = records.len();

        for record in records {
            let handler = self.handler.clone();
            let client = self.client.clone();
            let partition = self.partition.clone();
            let task = async move {
                let offset = record.offset;
                handler.handle(record).await;
                client.mark_consumed(&partition, offset);
                metrics::counter!(RECORDS_HANDLED).increment(1);
            };

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    debug!(partition = %self.partition, "stop requested, abandoning rest of batch");
                    return;
                }
                _ = self.pool.schedule(task) => {}
            }
        }

        debug!(partition = %self.partition, count, "batch submitted");

        if !self.commit_on_dispatch {
            return;
        }
        let Some(offset) = commit_offset else {
            return;
        };
        let offsets = [PartitionOffset::new(self.partition.clone(), offset)];
        if let Err(e) = self.client.commit_offsets(&offsets).await {
            metrics::counter!(COMMIT_FAILURES, "kind" => "batch").increment(1);
            warn!(partition = %self.partition, offset, "failed to commit batch offset: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_record, MockGroupClient};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use tokio::time::{sleep, timeout, Duration};

    fn partition() -> Partition {
        Partition::new("events".to_string(), 0)
    }

    fn batch(offsets: std::ops::Range<i64>) -> Vec<Record> {
        offsets.map(|o| test_record("events", 0, o)).collect()
    }

    #[tokio::test]
    async fn test_single_worker_handles_records_in_order() {
        let client = Arc::new(MockGroupClient::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler_seen = seen.clone();
        let handler = Arc::new(move |record: Record| {
            let seen = handler_seen.clone();
            async move {
                seen.lock().unwrap().push(record.offset);
            }
        });

        let consumer = PartitionConsumer::start(
            partition(),
            WorkerPool::new(1),
            false,
            handler,
            client.clone(),
        );
        assert!(consumer.sender().deliver(batch(0..5)).await);
        assert!(consumer.sender().deliver(batch(5..8)).await);

        timeout(Duration::from_secs(1), async {
            while seen.lock().unwrap().len() < 8 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("all records should be handled");

        assert_eq!(*seen.lock().unwrap(), (0..8).collect::<Vec<_>>());
        consumer.stop().await;

        let marked: Vec<i64> = client.marked().into_iter().map(|(_, o)| o).collect();
        assert_eq!(marked, (0..8).collect::<Vec<_>>());
        assert!(client.commits().is_empty());
    }

    #[tokio::test]
    async fn test_commits_next_offset_after_submitting_batch() {
        let client = Arc::new(MockGroupClient::new());
        let handler = Arc::new(|_record: Record| async {});

        let consumer = PartitionConsumer::start(
            partition(),
            WorkerPool::new(2),
            true,
            handler,
            client.clone(),
        );
        assert!(consumer.sender().deliver(batch(40..43)).await);

        timeout(Duration::from_secs(1), async {
            while client.commits().is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("batch offset should be committed");

        assert_eq!(
            client.commits(),
            vec![PartitionOffset::new(partition(), 43)]
        );
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_commit_failure_does_not_stop_consumer() {
        let client = Arc::new(MockGroupClient::new());
        client.fail_commits(true);
        let handled = Arc::new(AtomicUsize::new(0));
        let handler_handled = handled.clone();
        let handler = Arc::new(move |_record: Record| {
            let handled = handler_handled.clone();
            async move {
                handled.fetch_add(1, Ordering::SeqCst);
            }
        });

        let consumer = PartitionConsumer::start(
            partition(),
            WorkerPool::new(1),
            true,
            handler,
            client.clone(),
        );
        assert!(consumer.sender().deliver(batch(0..2)).await);
        assert!(consumer.sender().deliver(batch(2..4)).await);

        timeout(Duration::from_secs(1), async {
            while handled.load(Ordering::SeqCst) < 4 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("consumer should keep dispatching after a failed commit");
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_stop_abandons_rest_of_in_flight_batch() {
        let client = Arc::new(MockGroupClient::new());
        let release = Arc::new(Notify::new());
        let started = Arc::new(AtomicUsize::new(0));

        let handler_release = release.clone();
        let handler_started = started.clone();
        let handler = Arc::new(move |_record: Record| {
            let release = handler_release.clone();
            let started = handler_started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
            }
        });

        let consumer = PartitionConsumer::start(
            partition(),
            WorkerPool::new(1),
            true,
            handler,
            client.clone(),
        );
        assert!(consumer.sender().deliver(batch(0..5)).await);

        timeout(Duration::from_secs(1), async {
            while started.load(Ordering::SeqCst) == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first record should start");

        // the dispatcher is blocked submitting the second record
        timeout(Duration::from_secs(1), consumer.stop())
            .await
            .expect("stop should not wait for the blocked submission");

        release.notify_waiters();
        sleep(Duration::from_millis(20)).await;

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(client.commits().is_empty());
    }

    #[tokio::test]
    async fn test_stop_returns_after_dispatch_task_exits() {
        let client = Arc::new(MockGroupClient::new());
        let release = Arc::new(Notify::new());
        let started = Arc::new(AtomicUsize::new(0));

        let handler_release = release.clone();
        let handler_started = started.clone();
        let handler = Arc::new(move |_record: Record| {
            let release = handler_release.clone();
            let started = handler_started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
            }
        });

        let consumer = PartitionConsumer::start(
            partition(),
            WorkerPool::new(1),
            false,
            handler,
            client,
        );
        let sender = consumer.sender();
        assert!(sender.deliver(batch(0..3)).await);
        timeout(Duration::from_secs(1), async {
            while started.load(Ordering::SeqCst) == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first record should start");
        assert!(!sender.is_closed());

        consumer.stop().await;
        // no yield between stop returning and the check
        assert!(sender.is_closed());

        release.notify_waiters();
    }

    #[tokio::test]
    async fn test_deliver_after_stop_is_dropped() {
        let client = Arc::new(MockGroupClient::new());
        let handled = Arc::new(AtomicUsize::new(0));
        let handler_handled = handled.clone();
        let handler = Arc::new(move |_record: Record| {
            let handled = handler_handled.clone();
            async move {
                handled.fetch_add(1, Ordering::SeqCst);
            }
        });

        let consumer = PartitionConsumer::start(
            partition(),
            WorkerPool::new(1),
            false,
            handler,
            client,
        );
        let sender = consumer.sender();
        consumer.signal_stop();
        assert!(consumer.is_stopping());

        assert!(!sender.deliver(batch(0..3)).await);
        consumer.stop().await;
        assert!(!sender.deliver(batch(3..4)).await);

        sleep(Duration::from_millis(20)).await;
        assert_eq!(handled.load(Ordering::SeqCst), 0);
    }
}
