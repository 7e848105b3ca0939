use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use common_kafka::kafka_producer::{create_kafka_producer, flush_producer, KafkaContext};
use futures::future::join_all;
use health::HealthRegistry;
use rdkafka::producer::FutureProducer;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::metrics_consts::KAFKA_PRODUCER_ERROR;
use crate::pipelines::PipelineKind;
use crate::supervisor::PipelineSupervisor;

const COMPONENT_DEADLINE: Duration = Duration::from_secs(30);

/// Runs the three stats pipelines side by side over one input topic,
/// sharing a single producer.
pub struct StatsService {
    config: Arc<Config>,
    producer: FutureProducer<KafkaContext>,
    health: HealthRegistry,
    shutdown: CancellationToken,
}

impl StatsService {
    pub async fn new(config: Config, health: HealthRegistry) -> Result<Self> {
        let producer_health = health.register("kafka_producer", COMPONENT_DEADLINE);
        let producer = create_kafka_producer(&config.kafka, producer_health)
            .await
            .context("Failed to create Kafka producer")?;

        Ok(Self::with_producer(config, health, producer))
    }

    pub fn with_producer(
        config: Config,
        health: HealthRegistry,
        producer: FutureProducer<KafkaContext>,
    ) -> Self {
        info!(
            "Stats service initialized: consuming from '{}', producing to '{}', '{}' and '{}'",
            config.input_topic,
            config.bot_count_topic,
            config.website_count_topic,
            config.timeseries_topic
        );

        Self {
            config: Arc::new(config),
            producer,
            health,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling the token stops every pipeline between records.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs until every pipeline has stopped, either through the shutdown
    /// token or by exhausting its restarts. Errors if any pipeline gave up.
    pub async fn run(self) -> Result<()> {
        info!("Starting stats service");

        let supervisors = PipelineKind::ALL.map(|kind| {
            let liveness = self
                .health
                .register(format!("pipeline_{kind}"), COMPONENT_DEADLINE);
            let supervisor = PipelineSupervisor::new(
                kind,
                self.config.clone(),
                self.producer.clone(),
                liveness,
                self.shutdown.clone(),
            );
            tokio::spawn(supervisor.run())
        });

        let mut failed = Vec::new();
        for (kind, result) in PipelineKind::ALL.into_iter().zip(join_all(supervisors).await) {
            match result {
                Ok(Ok(())) => info!("{kind} pipeline stopped"),
                Ok(Err(e)) => {
                    error!("{kind} pipeline stopped with error: {e}");
                    failed.push(kind.name());
                }
                Err(e) => {
                    error!("{kind} pipeline supervisor task failed: {e}");
                    failed.push(kind.name());
                }
            }
        }

        shutdown_producer(&self.producer, self.config.producer_flush_timeout());

        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("pipelines failed: {}", failed.join(", ")))
        }
    }

    /// Runs until `signal` resolves, then cancels every pipeline and waits
    /// for them to drain, bounded by the configured shutdown timeout.
    pub async fn run_with_shutdown(self, signal: impl Future<Output = ()>) -> Result<()> {
        let token = self.shutdown_token();
        let producer = self.producer.clone();
        let flush_timeout = self.config.producer_flush_timeout();
        let shutdown_timeout = self.config.shutdown_timeout();

        let run = self.run();
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return result,
            _ = signal => info!("Shutdown signal received, stopping pipelines"),
        }
        token.cancel();

        match tokio::time::timeout(shutdown_timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Pipelines did not stop within {shutdown_timeout:?}, flushing and exiting");
                shutdown_producer(&producer, flush_timeout);
                Err(anyhow!("graceful shutdown timed out"))
            }
        }
    }
}

fn shutdown_producer(producer: &FutureProducer<KafkaContext>, timeout: Duration) {
    info!("Graceful shutdown: flushing producer...");
    match flush_producer(producer, timeout) {
        Ok(()) => info!("Graceful shutdown: completed"),
        Err(e) => {
            warn!("Failed to flush producer on graceful shutdown: {e:?}");
            metrics::counter!(
                KAFKA_PRODUCER_ERROR,
                &[("level", "warn"), ("error", "flush_producer")]
            )
            .increment(1);
        }
    }
}
