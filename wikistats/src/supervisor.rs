use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common_kafka::kafka_consumer::TextConsumer;
use common_kafka::kafka_producer::KafkaContext;
use health::{ComponentStatus, HealthHandle};
use rdkafka::producer::FutureProducer;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::PipelineError;
use crate::metrics_consts::{PIPELINE_FAILED, PIPELINE_RESTARTS};
use crate::pipelines::PipelineKind;
use crate::worker::{PipelineWorker, WorkerSettings};

/// How often a faulted worker may be replaced, and how long to wait first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub backoff: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_restarts: config.pipeline_max_restarts,
            backoff: config.restart_backoff(),
        }
    }

    // Linear back-off, capped at ten times the configured delay
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff * attempt.min(10)
    }
}

/// Keeps one pipeline running. A worker that faults, by error or by panic,
/// is replaced with a fresh consumer and empty state after a back-off;
/// siblings never notice. Gives up once the restart budget is spent.
pub struct PipelineSupervisor {
    kind: PipelineKind,
    config: Arc<Config>,
    producer: FutureProducer<KafkaContext>,
    liveness: HealthHandle,
    shutdown: CancellationToken,
}

impl PipelineSupervisor {
    pub fn new(
        kind: PipelineKind,
        config: Arc<Config>,
        producer: FutureProducer<KafkaContext>,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            kind,
            config,
            producer,
            liveness,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<(), PipelineError> {
        supervise(
            self.kind,
            RestartPolicy::from_config(&self.config),
            self.liveness.clone(),
            self.shutdown.clone(),
            || self.start_worker(),
        )
        .await
    }

    fn start_worker(
        &self,
    ) -> Result<impl Future<Output = Result<(), PipelineError>> + Send + 'static, PipelineError> {
        let consumer = TextConsumer::new(&self.config.kafka, &self.config.consumer_config(self.kind))
            .map_err(PipelineError::ConsumerSetup)?;

        let settings = WorkerSettings {
            output_topic: self.config.output_topic(self.kind).to_string(),
            policy: self.config.deserialization_failure_policy,
            offset_reset: self.config.kafka_consumer_offset_reset.clone(),
        };
        let worker = PipelineWorker::new(
            self.kind,
            consumer,
            self.producer.clone(),
            settings,
            self.liveness.clone(),
            self.shutdown.clone(),
        );

        info!("starting {} pipeline worker", self.kind);
        Ok(worker.run())
    }
}

/// Restart loop behind [`PipelineSupervisor`]. `start_worker` builds a fresh
/// worker for every attempt; each one runs on its own task.
pub async fn supervise<F, Fut>(
    kind: PipelineKind,
    policy: RestartPolicy,
    liveness: HealthHandle,
    shutdown: CancellationToken,
    mut start_worker: F,
) -> Result<(), PipelineError>
where
    F: FnMut() -> Result<Fut, PipelineError>,
    Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
{
    let mut restarts = 0_u32;

    loop {
        let attempt = match start_worker() {
            Ok(worker) => run_isolated(worker).await,
            Err(e) => Err(e),
        };
        let fault = match attempt {
            Ok(()) => return Ok(()),
            Err(fault) => fault,
        };

        if shutdown.is_cancelled() {
            warn!("{kind} pipeline faulted during shutdown: {fault}");
            return Ok(());
        }

        if restarts >= policy.max_restarts {
            error!("{kind} pipeline failed after {restarts} restarts, giving up: {fault}");
            metrics::counter!(PIPELINE_FAILED, &[("pipeline", kind.name())]).increment(1);
            liveness.report_status(ComponentStatus::Unhealthy);
            return Err(fault);
        }

        restarts += 1;
        let backoff = policy.delay(restarts);
        warn!("{kind} pipeline faulted, replacing it in {backoff:?} (attempt {restarts}): {fault}");
        metrics::counter!(PIPELINE_RESTARTS, &[("pipeline", kind.name())]).increment(1);
        liveness.report_status(ComponentStatus::Restarting { attempt: restarts });

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

// A separate task so a panic surfaces here as a JoinError
async fn run_isolated<Fut>(worker: Fut) -> Result<(), PipelineError>
where
    Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
{
    match tokio::spawn(worker).await {
        Ok(result) => result,
        Err(e) => Err(PipelineError::Panicked(join_error_message(e))),
    }
}

fn join_error_message(e: JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    panic_message(e.into_panic())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "non-string panic payload".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use health::HealthRegistry;

    use super::*;

    const DEADLINE: Duration = Duration::from_secs(30);
    const QUICK: RestartPolicy = RestartPolicy {
        max_restarts: 2,
        backoff: Duration::from_millis(10),
    };

    async fn wait_until_healthy(registry: &HealthRegistry, component: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !registry.get_status().components[component].is_healthy() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{component} never became healthy"));
    }

    #[test]
    fn backoff_grows_linearly_up_to_a_cap() {
        let policy = RestartPolicy {
            max_restarts: 20,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(300));
        assert_eq!(policy.delay(15), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn failing_pipeline_leaves_its_siblings_running() {
        let registry = HealthRegistry::new("liveness");
        let shutdown = CancellationToken::new();

        let attempts = Arc::new(AtomicU32::new(0));
        let failing = {
            let attempts = attempts.clone();
            tokio::spawn(supervise(
                PipelineKind::BotCount,
                QUICK,
                registry.register("pipeline_bot_count", DEADLINE),
                shutdown.clone(),
                move || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Ok(async { Err::<(), _>(PipelineError::Panicked("state corrupted".to_string())) })
                },
            ))
        };

        let siblings: Vec<_> = [PipelineKind::WebsiteCount, PipelineKind::EventTimeseries]
            .into_iter()
            .map(|kind| {
                let liveness = registry.register(format!("pipeline_{kind}"), DEADLINE);
                let worker_liveness = liveness.clone();
                let worker_shutdown = shutdown.clone();
                tokio::spawn(supervise(kind, QUICK, liveness, shutdown.clone(), move || {
                    let liveness = worker_liveness.clone();
                    let shutdown = worker_shutdown.clone();
                    Ok(async move {
                        liveness.report_healthy();
                        shutdown.cancelled().await;
                        Ok::<(), PipelineError>(())
                    })
                }))
            })
            .collect();

        let result = tokio::time::timeout(Duration::from_secs(5), failing)
            .await
            .expect("failing pipeline never gave up")
            .unwrap();
        assert!(matches!(result, Err(PipelineError::Panicked(_))), "{result:?}");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(
            registry.get_status().components["pipeline_bot_count"],
            ComponentStatus::Unhealthy
        );

        for component in ["pipeline_website_count", "pipeline_event_timeseries"] {
            wait_until_healthy(&registry, component).await;
        }
        assert!(siblings.iter().all(|sibling| !sibling.is_finished()));

        shutdown.cancel();
        for sibling in siblings {
            let result = tokio::time::timeout(Duration::from_secs(5), sibling)
                .await
                .expect("sibling did not stop on shutdown")
                .unwrap();
            assert!(result.is_ok(), "{result:?}");
        }
    }

    #[tokio::test]
    async fn panicked_worker_is_replaced_and_reports_restarting() {
        let registry = HealthRegistry::new("liveness");
        let liveness = registry.register("pipeline_bot_count", DEADLINE);
        let shutdown = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let seen_on_restart = Arc::new(Mutex::new(Vec::new()));

        let running = {
            let registry = registry.clone();
            let worker_liveness = liveness.clone();
            let worker_shutdown = shutdown.clone();
            let attempts = attempts.clone();
            let seen_on_restart = seen_on_restart.clone();
            tokio::spawn(supervise(
                PipelineKind::BotCount,
                QUICK,
                liveness,
                shutdown.clone(),
                move || {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    let registry = registry.clone();
                    let liveness = worker_liveness.clone();
                    let shutdown = worker_shutdown.clone();
                    let seen_on_restart = seen_on_restart.clone();
                    Ok(async move {
                        if attempt == 0 {
                            panic!("state corrupted");
                        }
                        let status = registry.get_status().components["pipeline_bot_count"].clone();
                        seen_on_restart.lock().unwrap().push(status);
                        liveness.report_healthy();
                        shutdown.cancelled().await;
                        Ok::<(), PipelineError>(())
                    })
                },
            ))
        };

        wait_until_healthy(&registry, "pipeline_bot_count").await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(
            *seen_on_restart.lock().unwrap(),
            vec![ComponentStatus::Restarting { attempt: 1 }]
        );

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("supervisor did not stop on shutdown")
            .unwrap();
        assert!(result.is_ok(), "{result:?}");
    }

    #[tokio::test]
    async fn setup_failures_spend_the_restart_budget() {
        let registry = HealthRegistry::new("liveness");
        let attempts = AtomicU32::new(0);

        let result = supervise(
            PipelineKind::WebsiteCount,
            QUICK,
            registry.register("pipeline_website_count", DEADLINE),
            CancellationToken::new(),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<std::future::Ready<Result<(), PipelineError>>, _>(PipelineError::ConsumerSetup(
                    rdkafka::error::KafkaError::Canceled,
                ))
            },
        )
        .await;

        assert!(matches!(result, Err(PipelineError::ConsumerSetup(_))), "{result:?}");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn panics_are_captured_with_their_message() {
        let handle = tokio::spawn(async { panic!("state corrupted") });
        let message = join_error_message(handle.await.unwrap_err());
        assert_eq!(message, "state corrupted");

        let handle = tokio::spawn(async {
            let key = "en.wikipedia.org";
            panic!("bad key {key}")
        });
        let message = join_error_message(handle.await.unwrap_err());
        assert_eq!(message, "bad key en.wikipedia.org");
    }
}
