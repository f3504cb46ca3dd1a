use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::BorrowedMessage;
use rdkafka::{Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{GroupClient, RebalanceListener};
use crate::config::SubscriberConfig;
use crate::error::FetchError;
use crate::kafka::config::ConsumerConfigBuilder;
use crate::kafka::context::SubscriberContext;
use crate::types::{Fetches, Partition, PartitionOffset, Record};

/// `GroupClient` backed by an rdkafka `StreamConsumer` subscribed to a
/// single topic.
///
/// librdkafka only serves rebalance callbacks from inside a poll, so
/// rebalances are already confined to `poll_records` and `allow_rebalance`
/// has nothing left to release.
pub struct KafkaGroupClient {
    consumer: StreamConsumer<SubscriberContext>,
    batch_timeout: Duration,
    closed: CancellationToken,
}

impl KafkaGroupClient {
    /// Create the consumer and subscribe to the configured topic.
    ///
    /// Must be called from within a multi-threaded tokio runtime.
    pub fn new(config: &SubscriberConfig) -> KafkaResult<Self> {
        let kafka = &config.kafka;

        let mut builder =
            ConsumerConfigBuilder::new(&kafka.kafka_hosts, &kafka.kafka_consumer_group)
                .with_tls(kafka.kafka_tls)
                .with_offset_reset(&kafka.kafka_consumer_offset_reset)
                .with_auto_commit(
                    config.auto_commit,
                    kafka.kafka_consumer_auto_commit_interval_ms,
                );
        if config.block_rebalance || kafka.kafka_client_id.is_some() {
            builder = builder.with_sticky_partition_assignment(kafka.kafka_client_id.as_deref());
        }

        let consumer: StreamConsumer<SubscriberContext> = builder
            .build()
            .create_with_context(SubscriberContext::new())?;
        consumer.subscribe(&[kafka.kafka_consumer_topic.as_str()])?;

        info!(
            topic = kafka.kafka_consumer_topic,
            group = kafka.kafka_consumer_group,
            auto_commit = config.auto_commit,
            "subscribed to kafka topic"
        );

        Ok(Self {
            consumer,
            batch_timeout: Duration::from_millis(kafka.kafka_consumer_batch_timeout_ms),
            closed: CancellationToken::new(),
        })
    }

    /// Add a received message or error to the batch. Returns false once the
    /// batch should be handed back to the caller.
    fn collect(fetches: &mut Fetches, received: KafkaResult<BorrowedMessage<'_>>) -> bool {
        match received {
            Ok(message) => {
                fetches.push_record(Record::from_borrowed_message(&message));
                true
            }
            Err(KafkaError::PartitionEOF(partition)) => {
                debug!(partition, "reached end of partition");
                true
            }
            Err(e) => {
                fetches.push_error(FetchError::from(e));
                false
            }
        }
    }
}

#[async_trait]
impl GroupClient for KafkaGroupClient {
    fn register_listener(&self, listener: Weak<dyn RebalanceListener>) {
        self.consumer.context().set_listener(listener);
    }

    async fn poll_records(&self, max_records: usize) -> Fetches {
        if self.closed.is_cancelled() {
            return Fetches::client_closed();
        }

        let mut fetches = Fetches::new();

        // wait as long as it takes for the first message
        let first = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Fetches::client_closed(),
            received = self.consumer.recv() => received,
        };
        if !Self::collect(&mut fetches, first) {
            return fetches;
        }

        // then gather whatever else arrives within the batch timeout
        let deadline = tokio::time::sleep(self.batch_timeout);
        tokio::pin!(deadline);
        while fetches.record_count() < max_records {
            let received = tokio::select! {
                biased;
                // records gathered so far are still returned, the next poll reports the close
                _ = self.closed.cancelled() => break,
                _ = &mut deadline => break,
                received = self.consumer.recv() => received,
            };
            if !Self::collect(&mut fetches, received) {
                break;
            }
        }

        fetches
    }

    fn mark_consumed(&self, partition: &Partition, offset: i64) {
        // the stored offset is the next one to consume
        let next_offset = offset + 1;
        if !self.consumer.context().stored_offsets().advance(partition, next_offset) {
            return;
        }
        let mut tpl = TopicPartitionList::new();
        let stored = tpl
            .add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(next_offset),
            )
            .and_then(|_| self.consumer.store_offsets(&tpl));
        if let Err(e) = stored {
            warn!(%partition, offset, "failed to store consumed offset: {e}");
        }
    }

    async fn commit_offsets(&self, offsets: &[PartitionOffset]) -> Result<(), KafkaError> {
        let mut tpl = TopicPartitionList::new();
        for offset in offsets {
            tpl.add_partition_offset(
                offset.topic(),
                offset.partition_number(),
                Offset::Offset(offset.offset()),
            )?;
        }
        self.consumer.commit(&tpl, CommitMode::Async)
    }

    async fn commit_marked_offsets(&self) -> Result<(), KafkaError> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            // nothing was marked since the last commit
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            result => result,
        }
    }

    fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.consumer.unsubscribe();
        info!("kafka group client closed");
    }
}
