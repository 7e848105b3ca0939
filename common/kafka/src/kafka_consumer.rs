use std::str::Utf8Error;
use std::sync::{Arc, Weak};

use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    Message,
};
use tracing::{debug, info};

use crate::config::{ConsumerConfig, KafkaConfig};

/// Consumer for a single topic of UTF-8 text records. Offsets are never
/// stored automatically: callers store them once a record is fully handled.
#[derive(Clone)]
pub struct TextConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

/// An owned copy of a consumed record, detached from the consumer buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRecord {
    /// None for tombstones and records without a value
    pub payload: Option<String>,
    /// Record timestamp in epoch milliseconds, when the broker provides one
    pub timestamp_ms: Option<i64>,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum RecvErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("payload at partition {partition} offset {offset} is not UTF-8: {source}")]
    Utf8 {
        partition: i32,
        offset: i64,
        source: Utf8Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
}

impl TextConsumer {
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
    ) -> Result<Self, KafkaError> {
        let mut client_config = common_config.client_config();
        client_config
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                consumer_config
                    .kafka_consumer_commit_interval_ms
                    .to_string(),
            );

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        info!(
            "subscribed to '{}' as consumer group '{}'",
            consumer_config.kafka_consumer_topic, consumer_config.kafka_consumer_group
        );

        let inner = Inner {
            consumer,
            topic: consumer_config.kafka_consumer_topic.clone(),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub async fn text_recv(&self) -> Result<(TextRecord, Offset), RecvErr> {
        let message = self.inner.consumer.recv().await?;

        let offset = Offset {
            handle: Arc::downgrade(&self.inner),
            partition: message.partition(),
            offset: message.offset(),
        };

        let payload = match message.payload().map(std::str::from_utf8).transpose() {
            Ok(payload) => payload.map(str::to_owned),
            Err(source) => {
                let err = RecvErr::Utf8 {
                    partition: message.partition(),
                    offset: message.offset(),
                    source,
                };
                // Poison pills are skipped past even when the caller chooses to stop
                if let Err(store_err) = offset.store() {
                    debug!("failed to store offset past undecodable record: {store_err}");
                }
                return Err(err);
            }
        };

        let record = TextRecord {
            payload,
            timestamp_ms: message.timestamp().to_millis(),
            partition: message.partition(),
            offset: message.offset(),
        };

        Ok((record, offset))
    }

    /// Synchronously commits every stored offset and leaves the group.
    pub fn close(&self) {
        match self
            .inner
            .consumer
            .commit_consumer_state(CommitMode::Sync)
        {
            Ok(()) => info!("committed final offsets for '{}'", self.inner.topic),
            // NoOffset when nothing was consumed since the last auto-commit
            Err(e) => debug!("final offset commit for '{}': {e}", self.inner.topic),
        }
        self.inner.consumer.unsubscribe();
    }
}

pub struct Offset {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl Offset {
    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Marks the record as processed; the next auto-commit picks it up.
    pub fn store(self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset + 1)?;
        Ok(())
    }
}
