use std::time::Duration;

use chrono::Utc;
use common_kafka::kafka_consumer::{RecvErr, TextConsumer, TextRecord};
use common_kafka::kafka_producer::{send_keyed_record, KafkaContext, KafkaProduceError};
use health::{ComponentStatus, HealthHandle};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::FutureProducer;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DeserializationFailurePolicy;
use crate::error::PipelineError;
use crate::metrics_consts::{
    KAFKA_CONSUMER_ERROR, KAFKA_PRODUCER_ERROR, LATE_RECORDS, MISSING_TIMESTAMP,
    OFFSET_STORE_FAILED, RECORDS_CONSUMED, RECORDS_DROPPED, RECORDS_EMITTED, UNDECODABLE_RECORDS,
};
use crate::output::OutputRecord;
use crate::pipelines::{Aggregator, DropReason, Outcome, PipelineKind, SourceRecord};

const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Consume/produce loop for one pipeline. Owns the pipeline's consumer and
/// aggregate state; a worker that returns is never reused.
pub struct PipelineWorker {
    kind: PipelineKind,
    aggregator: Box<dyn Aggregator>,
    consumer: TextConsumer,
    producer: FutureProducer<KafkaContext>,
    output_topic: String,
    policy: DeserializationFailurePolicy,
    offset_reset: String,
    liveness: HealthHandle,
    shutdown: CancellationToken,
}

pub struct WorkerSettings {
    pub output_topic: String,
    pub policy: DeserializationFailurePolicy,
    pub offset_reset: String,
}

impl PipelineWorker {
    pub fn new(
        kind: PipelineKind,
        consumer: TextConsumer,
        producer: FutureProducer<KafkaContext>,
        settings: WorkerSettings,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            kind,
            aggregator: kind.aggregator(),
            consumer,
            producer,
            output_topic: settings.output_topic,
            policy: settings.policy,
            offset_reset: settings.offset_reset,
            liveness,
            shutdown,
        }
    }

    /// Runs until shutdown (`Ok`) or a fault the pipeline cannot continue
    /// past (`Err`). Records are processed one at a time; shutdown is only
    /// observed between records.
    pub async fn run(mut self) -> Result<(), PipelineError> {
        info!(
            "{} pipeline consuming from '{}', producing to '{}', reporting as '{}'",
            self.kind,
            self.consumer.topic(),
            self.output_topic,
            self.liveness.component()
        );
        self.liveness.report_healthy();

        let mut health_report = interval(HEALTH_REPORT_INTERVAL);
        health_report.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut kafka_error_count = 0_u64;

        let result = loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("{} pipeline stopping on shutdown", self.kind);
                    break Ok(());
                }
                _ = health_report.tick() => {
                    self.liveness.report_healthy();
                    continue;
                }
                received = self.consumer.text_recv() => received,
            };

            match received {
                Ok((record, offset)) => {
                    kafka_error_count = 0;
                    self.handle_record(record).await;
                    let (partition, position) = (offset.partition(), offset.offset());
                    if let Err(e) = offset.store() {
                        warn!(
                            "{} pipeline failed to store offset {partition}:{position}: {e}",
                            self.kind
                        );
                        metrics::counter!(OFFSET_STORE_FAILED, &[("pipeline", self.kind.name())])
                            .increment(1);
                    }
                }
                Err(e @ RecvErr::Utf8 { .. }) => {
                    metrics::counter!(UNDECODABLE_RECORDS, &[("pipeline", self.kind.name())])
                        .increment(1);
                    match self.policy {
                        DeserializationFailurePolicy::LogAndContinue => {
                            warn!("{} pipeline skipping record: {e}", self.kind);
                        }
                        DeserializationFailurePolicy::FailFast => {
                            error!("{} pipeline stopping on record: {e}", self.kind);
                            break Err(PipelineError::Deserialization(e));
                        }
                    }
                }
                Err(RecvErr::Kafka(e)) => {
                    kafka_error_count += 1;
                    if let Some(e) =
                        handle_kafka_error(self.kind, &self.offset_reset, e, kafka_error_count).await
                    {
                        if e == KafkaError::Canceled {
                            break Ok(());
                        }
                        break Err(PipelineError::Consumer(e));
                    }
                }
            }
        };

        self.consumer.close();
        if result.is_err() {
            self.liveness.report_status(ComponentStatus::Unhealthy);
        }
        result
    }

    async fn handle_record(&mut self, record: TextRecord) {
        metrics::counter!(RECORDS_CONSUMED, &[("pipeline", self.kind.name())]).increment(1);

        let timestamp_ms = match record.timestamp_ms {
            Some(timestamp_ms) => timestamp_ms,
            None => {
                metrics::counter!(MISSING_TIMESTAMP, &[("pipeline", self.kind.name())])
                    .increment(1);
                Utc::now().timestamp_millis()
            }
        };

        let source = SourceRecord {
            payload: record.payload.as_deref(),
            timestamp_ms,
        };

        match self.aggregator.process(&source) {
            Outcome::Emit(output) => self.emit(output).await,
            Outcome::Drop(reason) => {
                debug!(
                    "{} pipeline dropped record at {}:{} ({})",
                    self.kind,
                    record.partition,
                    record.offset,
                    reason.as_str()
                );
                if reason == DropReason::WindowClosed {
                    metrics::counter!(LATE_RECORDS, &[("pipeline", self.kind.name())])
                        .increment(1);
                }
                metrics::counter!(
                    RECORDS_DROPPED,
                    &[("pipeline", self.kind.name()), ("reason", reason.as_str())]
                )
                .increment(1);
            }
        }
    }

    async fn emit(&self, output: OutputRecord) {
        match send_keyed_record(
            &self.producer,
            &self.output_topic,
            &output.key,
            &output.payload,
        )
        .await
        {
            Ok(()) => {
                metrics::counter!(RECORDS_EMITTED, &[("pipeline", self.kind.name())])
                    .increment(1);
            }
            Err(e) => {
                // The update is lost but the count stays; the next increment re-emits it
                error!(
                    "{} pipeline failed to produce to '{}': {e}",
                    self.kind, self.output_topic
                );
                let cause = match e {
                    KafkaProduceError::KafkaProduceError { .. } => "send_failed",
                    KafkaProduceError::KafkaProduceCanceled => "send_future_canceled",
                };
                metrics::counter!(
                    KAFKA_PRODUCER_ERROR,
                    &[("pipeline", self.kind.name()), ("error", cause)]
                )
                .increment(1);
            }
        }
    }
}

/// Backs off on transient consumer errors. Returns the error when the
/// consumer cannot continue.
async fn handle_kafka_error(
    kind: PipelineKind,
    offset_reset: &str,
    e: KafkaError,
    current_count: u64,
) -> Option<KafkaError> {
    let pipeline = kind.name();
    match &e {
        KafkaError::MessageConsumption(code) => {
            match code {
                RDKafkaErrorCode::PartitionEOF => {
                    metrics::counter!(
                        KAFKA_CONSUMER_ERROR,
                        &[("pipeline", pipeline), ("level", "info"), ("error", "partition_eof")]
                    )
                    .increment(1);
                }
                RDKafkaErrorCode::OperationTimedOut => {
                    metrics::counter!(
                        KAFKA_CONSUMER_ERROR,
                        &[("pipeline", pipeline), ("level", "info"), ("error", "op_timed_out")]
                    )
                    .increment(1);
                }
                RDKafkaErrorCode::OffsetOutOfRange => {
                    // auto.offset.reset makes librdkafka seek for us
                    warn!("{kind} pipeline offset out of range, seeking to {offset_reset}");
                    metrics::counter!(
                        KAFKA_CONSUMER_ERROR,
                        &[
                            ("pipeline", pipeline),
                            ("level", "info"),
                            ("error", "offset_out_of_range")
                        ]
                    )
                    .increment(1);
                    sleep(Duration::from_millis(500)).await;
                }
                _ => {
                    warn!("{kind} pipeline consumer error: {code:?}");
                    metrics::counter!(
                        KAFKA_CONSUMER_ERROR,
                        &[("pipeline", pipeline), ("level", "warn"), ("error", "consumer")]
                    )
                    .increment(1);
                    sleep(Duration::from_millis(100 * current_count.min(10))).await;
                }
            }
            None
        }

        KafkaError::MessageConsumptionFatal(code) => {
            error!("{kind} pipeline fatal consumer error: {code:?}");
            metrics::counter!(
                KAFKA_CONSUMER_ERROR,
                &[("pipeline", pipeline), ("level", "fatal"), ("error", "consumer")]
            )
            .increment(1);
            Some(e)
        }

        KafkaError::Global(code) => {
            match code {
                RDKafkaErrorCode::AllBrokersDown => {
                    warn!("{kind} pipeline: all brokers down, waiting for reconnect");
                    metrics::counter!(
                        KAFKA_CONSUMER_ERROR,
                        &[("pipeline", pipeline), ("level", "warn"), ("error", "all_brokers_down")]
                    )
                    .increment(1);
                    sleep(Duration::from_secs(current_count.min(5))).await;
                }
                RDKafkaErrorCode::BrokerTransportFailure => {
                    warn!("{kind} pipeline: broker transport failure, waiting for reconnect");
                    metrics::counter!(
                        KAFKA_CONSUMER_ERROR,
                        &[("pipeline", pipeline), ("level", "warn"), ("error", "broker_transport")]
                    )
                    .increment(1);
                    sleep(Duration::from_secs(current_count.min(3))).await;
                }
                RDKafkaErrorCode::Authentication => {
                    error!("{kind} pipeline authentication failed: {code:?}");
                    metrics::counter!(
                        KAFKA_CONSUMER_ERROR,
                        &[("pipeline", pipeline), ("level", "fatal"), ("error", "authentication")]
                    )
                    .increment(1);
                    return Some(e);
                }
                _ => {
                    warn!("{kind} pipeline global Kafka error: {code:?}");
                    metrics::counter!(
                        KAFKA_CONSUMER_ERROR,
                        &[("pipeline", pipeline), ("level", "warn"), ("error", "global")]
                    )
                    .increment(1);
                    sleep(Duration::from_millis(500 * current_count.min(6))).await;
                }
            }
            None
        }

        KafkaError::Canceled => {
            info!("{kind} pipeline consumer canceled");
            Some(e)
        }

        _ => {
            error!("{kind} pipeline unexpected consumer error: {e:?}");
            metrics::counter!(
                KAFKA_CONSUMER_ERROR,
                &[("pipeline", pipeline), ("level", "fatal"), ("error", "unexpected")]
            )
            .increment(1);
            sleep(Duration::from_millis(100 * current_count.min(10))).await;
            None
        }
    }
}
