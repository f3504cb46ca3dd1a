//! Subscriber - drives a consumer group client and fans records out to
//! per-partition consumers.
//!
//! One poll loop per subscription routes each partition's batch to that
//! partition's `PartitionConsumer`. Rebalance callbacks from the client
//! create and stop those consumers concurrently with the loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{GroupClient, MessageHandler, RebalanceListener};
use crate::config::SubscriberConfig;
use crate::error::{FetchError, SubscriberError};
use crate::kafka::KafkaGroupClient;
use crate::metrics_consts::{BATCHES_DROPPED, COMMIT_FAILURES, FETCH_ERRORS, OWNED_PARTITIONS};
use crate::partition_consumer::PartitionConsumer;
use crate::pool::WorkerPool;
use crate::types::{FetchPartition, Partition, TopicPartitions};

type ConsumerRegistry = HashMap<String, HashMap<i32, PartitionConsumer>>;

pub struct Subscriber {
    registry: Arc<PartitionRegistry>,
    client: Arc<dyn GroupClient>,
    max_records: usize,
    block_rebalance: bool,
}

impl Subscriber {
    /// Build a subscriber on an rdkafka consumer for the configured group
    /// and topic.
    ///
    /// Must be called from within a multi-threaded tokio runtime, since
    /// rebalance callbacks block a runtime thread while partitions stop.
    pub fn new<H: MessageHandler>(
        config: SubscriberConfig,
        handler: H,
    ) -> Result<Self, SubscriberError> {
        validate(&config)?;
        let client = KafkaGroupClient::new(&config)?;
        Self::with_client(config, handler, Arc::new(client))
    }

    /// Build a subscriber on any group client.
    pub fn with_client<H: MessageHandler>(
        config: SubscriberConfig,
        handler: H,
        client: Arc<dyn GroupClient>,
    ) -> Result<Self, SubscriberError> {
        validate(&config)?;

        let registry = Arc::new(PartitionRegistry {
            consumers: Mutex::new(HashMap::new()),
            handler: Arc::new(handler),
            client: client.clone(),
            workers: config.workers,
            auto_commit: config.auto_commit,
        });
        let listener: Weak<dyn RebalanceListener> = Arc::<PartitionRegistry>::downgrade(&registry);
        client.register_listener(listener);

        Ok(Self {
            registry,
            client,
            max_records: config.effective_max_records(),
            block_rebalance: config.block_rebalance,
        })
    }

    /// Start the poll loop.
    ///
    /// Fetch errors are forwarded on the returned channel. It closes once
    /// the loop ends: after `shutdown` fires, the client is closed, or a
    /// fatal error has been forwarded. An undrained channel stalls the loop
    /// at the next error.
    pub fn subscribe(&self, shutdown: CancellationToken) -> mpsc::Receiver<FetchError> {
        let (errors, rx) = mpsc::channel(1);
        let poll_loop = PollLoop {
            client: self.client.clone(),
            registry: self.registry.clone(),
            max_records: self.max_records,
            block_rebalance: self.block_rebalance,
            shutdown,
            errors,
        };
        tokio::spawn(poll_loop.run());
        rx
    }

    /// Close the client and stop every partition still owned.
    ///
    /// With auto-commit disabled, offsets marked so far are committed once
    /// those partitions have stopped.
    /// Safe to call more than once.
    pub async fn unsubscribe(&self) -> Result<(), SubscriberError> {
        self.client.close();
        // an assignment already in flight inside the client can still land
        // while earlier partitions are stopping
        loop {
            let owned = self.registry.owned();
            if owned.is_empty() {
                break;
            }
            self.registry.revoked(owned).await;
        }
        Ok(())
    }

    pub async fn assigned(&self, partitions: TopicPartitions) {
        self.registry.assigned(partitions).await;
    }

    pub async fn revoked(&self, partitions: TopicPartitions) {
        self.registry.revoked(partitions).await;
    }

    pub async fn lost(&self, partitions: TopicPartitions) {
        self.registry.lost(partitions).await;
    }

    /// Partitions with a running consumer, sorted.
    pub fn owned_partitions(&self) -> Vec<Partition> {
        let mut owned: Vec<Partition> = self
            .registry
            .owned()
            .into_iter()
            .flat_map(|(topic, partitions)| {
                partitions
                    .into_iter()
                    .map(move |p| Partition::new(topic.clone(), p))
            })
            .collect();
        owned.sort_by(|a, b| {
            (a.topic(), a.partition_number()).cmp(&(b.topic(), b.partition_number()))
        });
        owned
    }
}

fn validate(config: &SubscriberConfig) -> Result<(), SubscriberError> {
    if config.workers == 0 {
        return Err(SubscriberError::InvalidConfig(
            "workers must be at least 1".to_string(),
        ));
    }
    Ok(())
}

struct PollLoop {
    client: Arc<dyn GroupClient>,
    registry: Arc<PartitionRegistry>,
    max_records: usize,
    block_rebalance: bool,
    shutdown: CancellationToken,
    errors: mpsc::Sender<FetchError>,
}

impl PollLoop {
    async fn run(self) {
        info!(max_records = self.max_records, "starting poll loop");

        'poll: loop {
            let fetches = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("subscription cancelled");
                    break;
                }
                fetches = self.client.poll_records(self.max_records) => fetches,
            };

            if fetches.is_client_closed() {
                info!("client closed");
                break;
            }

            let (batches, errors) = fetches.into_parts();
            let mut fatal = false;
            for error in errors {
                fatal |= self.forward(error).await;
            }
            if fatal {
                error!("fatal fetch error, stopping poll loop");
                break;
            }

            for batch in batches {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break 'poll,
                    _ = self.registry.deliver(batch) => {}
                }
            }

            if self.block_rebalance {
                self.client.allow_rebalance();
            }
        }

        info!("poll loop stopped");
    }

    /// Report one fetch error on the stream, returning whether it is fatal.
    async fn forward(&self, error: FetchError) -> bool {
        let fatal = error.is_fatal();
        let severity = if fatal { "fatal" } else { "transient" };
        metrics::counter!(FETCH_ERRORS, "severity" => severity).increment(1);

        let partition = error.partition().map(ToString::to_string);
        if fatal {
            error!(partition, "fatal fetch error: {error}");
        } else {
            warn!(partition, "fetch error: {error}");
        }

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {}
            sent = self.errors.send(error) => {
                if sent.is_err() {
                    debug!("error stream receiver dropped");
                }
            }
        }
        fatal
    }
}

/// The set of running partition consumers, keyed by topic then partition.
struct PartitionRegistry {
    consumers: Mutex<ConsumerRegistry>,
    handler: Arc<dyn MessageHandler>,
    client: Arc<dyn GroupClient>,
    workers: usize,
    auto_commit: bool,
}

impl PartitionRegistry {
    fn lock(&self) -> MutexGuard<'_, ConsumerRegistry> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owned(&self) -> TopicPartitions {
        self.lock()
            .iter()
            .map(|(topic, partitions)| (topic.clone(), partitions.keys().copied().collect()))
            .collect()
    }

    async fn deliver(&self, batch: FetchPartition) {
        let sender = self
            .lock()
            .get(batch.partition.topic())
            .and_then(|partitions| partitions.get(&batch.partition.partition_number()))
            .map(PartitionConsumer::sender);

        let Some(sender) = sender else {
            metrics::counter!(BATCHES_DROPPED, "reason" => "unowned").increment(1);
            warn!(partition = %batch.partition, "no consumer for partition, dropping batch");
            return;
        };

        if !sender.deliver(batch.records).await {
            metrics::counter!(BATCHES_DROPPED, "reason" => "stopping").increment(1);
            debug!(partition = %batch.partition, "partition stopping, dropping batch");
        }
    }

    /// Remove and stop the consumers for `partitions`. The registry lock is
    /// released before waiting on any of them.
    async fn stop_partitions(&self, partitions: &TopicPartitions) {
        let removed: Vec<PartitionConsumer> = {
            let mut consumers = self.lock();
            let mut removed = Vec::new();
            for (topic, numbers) in partitions {
                let Some(topic_consumers) = consumers.get_mut(topic) else {
                    continue;
                };
                for number in numbers {
                    if let Some(consumer) = topic_consumers.remove(number) {
                        consumer.signal_stop();
                        removed.push(consumer);
                    }
                }
                if topic_consumers.is_empty() {
                    consumers.remove(topic);
                }
            }
            removed
        };

        futures::future::join_all(removed.into_iter().map(PartitionConsumer::stop)).await;
        self.report_owned();
    }

    fn report_owned(&self) {
        let owned: usize = self.lock().values().map(HashMap::len).sum();
        metrics::gauge!(OWNED_PARTITIONS).set(owned as f64);
    }
}

#[async_trait]
impl RebalanceListener for PartitionRegistry {
    async fn assigned(&self, partitions: TopicPartitions) {
        {
            let mut consumers = self.lock();
            for (topic, numbers) in partitions {
                let topic_consumers = consumers.entry(topic.clone()).or_default();
                for number in numbers {
                    if topic_consumers.contains_key(&number) {
                        debug!(topic, partition = number, "partition already owned");
                        continue;
                    }
                    info!(topic, partition = number, "partition assigned");
                    let consumer = PartitionConsumer::start(
                        Partition::new(topic.clone(), number),
                        WorkerPool::new(self.workers),
                        !self.auto_commit,
                        self.handler.clone(),
                        self.client.clone(),
                    );
                    topic_consumers.insert(number, consumer);
                }
            }
        }
        self.report_owned();
    }

    async fn revoked(&self, partitions: TopicPartitions) {
        info!(?partitions, "partitions revoked");
        self.stop_partitions(&partitions).await;

        if !self.auto_commit {
            if let Err(e) = self.client.commit_marked_offsets().await {
                metrics::counter!(COMMIT_FAILURES, "kind" => "revoke").increment(1);
                warn!("failed to commit marked offsets on revoke: {e}");
            }
        }
    }

    async fn lost(&self, partitions: TopicPartitions) {
        warn!(?partitions, "partitions lost");
        self.stop_partitions(&partitions).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fetches_for, topic_partitions, MockGroupClient};
    use crate::types::Record;
    use envconfig::Envconfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use tokio::time::{sleep, timeout, Duration};

    fn config() -> SubscriberConfig {
        let env = HashMap::from([
            ("KAFKA_CONSUMER_GROUP".to_string(), "test-group".to_string()),
            ("KAFKA_CONSUMER_TOPIC".to_string(), "events".to_string()),
            ("SUBSCRIBER_WORKERS".to_string(), "1".to_string()),
        ]);
        SubscriberConfig::init_from_hashmap(&env).unwrap()
    }

    #[tokio::test]
    async fn test_revoke_returns_after_dispatch_task_exits() {
        let client = Arc::new(MockGroupClient::new());
        let gate = Arc::new(Notify::new());
        let started = Arc::new(AtomicUsize::new(0));
        let handler = {
            let gate = gate.clone();
            let started = started.clone();
            move |_record: Record| {
                let gate = gate.clone();
                let started = started.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                }
            }
        };

        let subscriber = Subscriber::with_client(config(), handler, client.clone()).unwrap();
        subscriber.assigned(topic_partitions("events", &[0])).await;
        let sender = subscriber
            .registry
            .lock()
            .get("events")
            .and_then(|partitions| partitions.get(&0))
            .map(PartitionConsumer::sender)
            .unwrap();
        let _errors = subscriber.subscribe(CancellationToken::new());

        // one record running, one blocked on submission, one queued, one blocked on delivery
        for offset in 0..4 {
            client.push_fetches(fetches_for("events", 0, offset..offset + 1));
        }
        timeout(Duration::from_secs(1), async {
            while client.poll_count() < 4 || started.load(Ordering::SeqCst) == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("poll loop should block on delivery");
        assert!(!sender.is_closed());

        client.trigger_revoked(topic_partitions("events", &[0])).await;
        // the dispatch loop has already exited, not merely been told to
        assert!(sender.is_closed());
        assert!(subscriber.owned_partitions().is_empty());

        gate.notify_waiters();
        subscriber.unsubscribe().await.unwrap();
    }
}
