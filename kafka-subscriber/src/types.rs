use std::collections::HashMap;

use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::TopicPartitionList;

use crate::error::FetchError;

/// Rebalance payload: topic name to the partitions that moved.
pub type TopicPartitions = HashMap<String, Vec<i32>>;

/// Group a librdkafka partition list by topic.
pub fn topic_partitions_from_list(list: &TopicPartitionList) -> TopicPartitions {
    let mut grouped = TopicPartitions::new();
    for elem in list.elements() {
        grouped
            .entry(elem.topic().to_string())
            .or_default()
            .push(elem.partition());
    }
    grouped
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

/// The next offset to consume for a partition, as sent in an offset commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    partition: Partition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

/// An owned copy of a fetched Kafka message, handed to the user's handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    /// Milliseconds since the epoch, when the broker provided one
    pub timestamp: Option<i64>,
    pub headers: Vec<(String, Option<Vec<u8>>)>,
}

impl Record {
    pub fn from_borrowed_message(message: &BorrowedMessage<'_>) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| (header.key.to_string(), header.value.map(<[u8]>::to_vec)))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            timestamp: message.timestamp().to_millis(),
            headers,
        }
    }

    pub fn topic_partition(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }

    pub fn payload_str(&self) -> Option<&str> {
        self.payload
            .as_deref()
            .and_then(|p| std::str::from_utf8(p).ok())
    }
}

/// The records returned for a single partition by one poll.
#[derive(Debug, Clone)]
pub struct FetchPartition {
    pub partition: Partition,
    pub records: Vec<Record>,
}

impl FetchPartition {
    pub fn new(partition: Partition, records: Vec<Record>) -> Self {
        Self { partition, records }
    }
}

/// Offset to commit once every record in `records` is consumed, None when empty.
pub fn next_offset(records: &[Record]) -> Option<i64> {
    records.iter().map(|r| r.offset).max().map(|o| o + 1)
}

/// Result of one poll: records grouped by partition, plus any errors.
#[derive(Debug, Default)]
pub struct Fetches {
    partitions: Vec<FetchPartition>,
    errors: Vec<FetchError>,
}

impl Fetches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_closed() -> Self {
        Self {
            partitions: vec![],
            errors: vec![FetchError::ClientClosed],
        }
    }

    /// Append a record, keeping fetch order within its partition
    pub fn push_record(&mut self, record: Record) {
        let existing = self.partitions.iter_mut().find(|p| {
            p.partition.topic() == record.topic
                && p.partition.partition_number() == record.partition
        });
        match existing {
            Some(existing) => existing.records.push(record),
            None => {
                let partition = record.topic_partition();
                self.partitions
                    .push(FetchPartition::new(partition, vec![record]));
            }
        }
    }

    pub fn push_error(&mut self, error: FetchError) {
        self.errors.push(error);
    }

    pub fn record_count(&self) -> usize {
        self.partitions.iter().map(|p| p.records.len()).sum()
    }

    pub fn partitions(&self) -> &[FetchPartition] {
        &self.partitions
    }

    pub fn errors(&self) -> &[FetchError] {
        &self.errors
    }

    pub fn is_client_closed(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, FetchError::ClientClosed))
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty() && self.errors.is_empty()
    }

    pub fn into_parts(self) -> (Vec<FetchPartition>, Vec<FetchError>) {
        (self.partitions, self.errors)
    }
}
