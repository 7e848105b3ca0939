use common_kafka::kafka_consumer::RecvErr;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Failure to turn an aggregate update into an output record. Only the
/// affected emission is dropped.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to serialize output record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("window bound {0}ms is outside the representable date range")]
    TimestampOutOfRange(i64),
}

/// Faults that end a pipeline worker. The supervisor replaces the worker;
/// sibling pipelines keep running.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to create consumer: {0}")]
    ConsumerSetup(#[source] KafkaError),
    #[error("fatal consumer error: {0}")]
    Consumer(#[source] KafkaError),
    #[error("undecodable record with fail-fast policy: {0}")]
    Deserialization(#[source] RecvErr),
    #[error("pipeline task panicked: {0}")]
    Panicked(String),
}
