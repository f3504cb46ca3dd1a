//! Stored Offsets - the highest next-offset handed to librdkafka per partition
//!
//! Records of one partition can finish out of order when several workers
//! run them, so a store is only let through when it moves the partition's
//! offset forward.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::types::{Partition, TopicPartitions};

#[derive(Default)]
pub struct StoredOffsets {
    next: Mutex<HashMap<Partition, i64>>,
}

impl StoredOffsets {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Partition, i64>> {
        self.next.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `next_offset` for `partition`. Returns false, leaving the
    /// tracked offset untouched, when it would not move forward.
    pub fn advance(&self, partition: &Partition, next_offset: i64) -> bool {
        let mut next = self.lock();
        match next.get_mut(partition) {
            Some(current) if next_offset <= *current => {
                debug!(
                    %partition,
                    current = *current,
                    next_offset,
                    "offset behind stored offset, skipping"
                );
                false
            }
            Some(current) => {
                *current = next_offset;
                true
            }
            None => {
                next.insert(partition.clone(), next_offset);
                true
            }
        }
    }

    /// Drop tracking for partitions changing hands.
    pub fn forget(&self, partitions: &TopicPartitions) {
        let mut next = self.lock();
        for (topic, numbers) in partitions {
            for number in numbers {
                next.remove(&Partition::new(topic.clone(), *number));
            }
        }
    }

    pub fn get(&self, partition: &Partition) -> Option<i64> {
        self.lock().get(partition).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::topic_partitions;

    fn partition(number: i32) -> Partition {
        Partition::new("events".to_string(), number)
    }

    #[test]
    fn test_out_of_order_completion_never_moves_backwards() {
        let offsets = StoredOffsets::new();

        assert!(offsets.advance(&partition(0), 6));
        // offset 4 finished after offset 5 on another worker
        assert!(!offsets.advance(&partition(0), 5));
        assert!(!offsets.advance(&partition(0), 6));
        assert_eq!(offsets.get(&partition(0)), Some(6));

        assert!(offsets.advance(&partition(0), 7));
        assert_eq!(offsets.get(&partition(0)), Some(7));
    }

    #[test]
    fn test_partitions_are_tracked_independently() {
        let offsets = StoredOffsets::new();

        assert!(offsets.advance(&partition(0), 100));
        assert!(offsets.advance(&partition(1), 3));
        assert_eq!(offsets.get(&partition(0)), Some(100));
        assert_eq!(offsets.get(&partition(1)), Some(3));
    }

    #[test]
    fn test_forget_allows_lower_offset_after_reassignment() {
        let offsets = StoredOffsets::new();
        offsets.advance(&partition(0), 50);
        offsets.advance(&partition(1), 8);

        offsets.forget(&topic_partitions("events", &[0]));

        assert_eq!(offsets.get(&partition(0)), None);
        assert!(offsets.advance(&partition(0), 20));
        assert_eq!(offsets.get(&partition(1)), Some(8));
    }
}
