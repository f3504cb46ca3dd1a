//! Test helpers: a scripted in-memory group client and record builders.
//! Used by the unit tests and the tests/ directory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::client::{GroupClient, RebalanceListener};
use crate::error::FetchError;
use crate::types::{Fetches, Partition, PartitionOffset, Record, TopicPartitions};

pub fn test_record(topic: &str, partition: i32, offset: i64) -> Record {
    Record {
        topic: topic.to_string(),
        partition,
        offset,
        key: Some(format!("key{offset}").into_bytes()),
        payload: Some(format!("payload{offset}").into_bytes()),
        timestamp: Some(1_700_000_000_000 + offset),
        headers: vec![],
    }
}

/// Build a poll result holding `offsets` for one partition.
pub fn fetches_for(topic: &str, partition: i32, offsets: std::ops::Range<i64>) -> Fetches {
    let mut fetches = Fetches::new();
    for offset in offsets {
        fetches.push_record(test_record(topic, partition, offset));
    }
    fetches
}

pub fn fetch_error(fatal: bool) -> FetchError {
    let error = if fatal {
        KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fatal)
    } else {
        KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut)
    };
    FetchError::new(None, error)
}

pub fn topic_partitions(topic: &str, partitions: &[i32]) -> TopicPartitions {
    TopicPartitions::from([(topic.to_string(), partitions.to_vec())])
}

/// A group client whose polls return scripted results.
///
/// Once the script runs out, a poll waits for more to be pushed or for the
/// client to be closed.
#[derive(Default)]
pub struct MockGroupClient {
    script: Mutex<VecDeque<Fetches>>,
    scripted: Notify,
    closed: CancellationToken,
    polls: AtomicUsize,
    allow_rebalance_calls: AtomicUsize,
    marked_commits: AtomicUsize,
    fail_commits: AtomicBool,
    listener: Mutex<Option<Weak<dyn RebalanceListener>>>,
    assign_on_marked_commit: Mutex<Option<TopicPartitions>>,
    marked: Mutex<Vec<(Partition, i64)>>,
    commits: Mutex<Vec<PartitionOffset>>,
}

impl MockGroupClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_fetches(&self, fetches: Fetches) {
        lock(&self.script).push_back(fetches);
        self.scripted.notify_one();
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Deliver an assignment from inside the next marked-offsets commit,
    /// as a rebalance racing a revocation would.
    pub fn assign_on_next_marked_commit(&self, partitions: TopicPartitions) {
        *lock(&self.assign_on_marked_commit) = Some(partitions);
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn allow_rebalance_count(&self) -> usize {
        self.allow_rebalance_calls.load(Ordering::SeqCst)
    }

    pub fn marked_commit_count(&self) -> usize {
        self.marked_commits.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn marked(&self) -> Vec<(Partition, i64)> {
        lock(&self.marked).clone()
    }

    pub fn commits(&self) -> Vec<PartitionOffset> {
        lock(&self.commits).clone()
    }

    pub fn has_listener(&self) -> bool {
        self.listener().is_some()
    }

    /// Simulate the group assigning partitions to this member.
    pub async fn trigger_assigned(&self, partitions: TopicPartitions) {
        if let Some(listener) = self.listener() {
            listener.assigned(partitions).await;
        }
    }

    pub async fn trigger_revoked(&self, partitions: TopicPartitions) {
        if let Some(listener) = self.listener() {
            listener.revoked(partitions).await;
        }
    }

    pub async fn trigger_lost(&self, partitions: TopicPartitions) {
        if let Some(listener) = self.listener() {
            listener.lost(partitions).await;
        }
    }

    fn listener(&self) -> Option<Arc<dyn RebalanceListener>> {
        lock(&self.listener).as_ref().and_then(Weak::upgrade)
    }

    fn commit_result(&self) -> Result<(), KafkaError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::RebalanceInProgress))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl GroupClient for MockGroupClient {
    fn register_listener(&self, listener: Weak<dyn RebalanceListener>) {
        *lock(&self.listener) = Some(listener);
    }

    async fn poll_records(&self, max_records: usize) -> Fetches {
        self.polls.fetch_add(1, Ordering::SeqCst);
        loop {
            if self.closed.is_cancelled() {
                return Fetches::client_closed();
            }
            let scripted = self.scripted.notified();
            let next = lock(&self.script).pop_front();
            if let Some(fetches) = next {
                assert!(
                    fetches.record_count() <= max_records,
                    "scripted poll exceeds max_records"
                );
                return fetches;
            }
            tokio::select! {
                _ = self.closed.cancelled() => return Fetches::client_closed(),
                _ = scripted => {}
            }
        }
    }

    fn mark_consumed(&self, partition: &Partition, offset: i64) {
        lock(&self.marked).push((partition.clone(), offset));
    }

    async fn commit_offsets(&self, offsets: &[PartitionOffset]) -> Result<(), KafkaError> {
        self.commit_result()?;
        lock(&self.commits).extend_from_slice(offsets);
        Ok(())
    }

    async fn commit_marked_offsets(&self) -> Result<(), KafkaError> {
        let pending = lock(&self.assign_on_marked_commit).take();
        if let Some(partitions) = pending {
            self.trigger_assigned(partitions).await;
        }
        self.commit_result()?;
        self.marked_commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn allow_rebalance(&self) {
        self.allow_rebalance_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
