use std::str::FromStr;
use std::time::Duration;

use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;
use thiserror::Error;

use crate::pipelines::PipelineKind;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    // Prefix of every pipeline's consumer group
    #[envconfig(default = "wikimedia-stats-application")]
    pub application_id: String,

    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "1000")]
    pub commit_interval_ms: u32,

    #[envconfig(default = "10")]
    pub kafka_producer_graceful_shutdown_secs: u64,

    #[envconfig(default = "wikimedia.recentchange")]
    pub input_topic: String,

    #[envconfig(default = "wikimedia.stats.bots")]
    pub bot_count_topic: String,

    #[envconfig(default = "wikimedia.stats.website")]
    pub website_count_topic: String,

    #[envconfig(default = "wikimedia.stats.timeseries")]
    pub timeseries_topic: String,

    // What a pipeline does with a record whose value is not UTF-8
    #[envconfig(default = "log-and-continue")]
    pub deserialization_failure_policy: DeserializationFailurePolicy,

    // Replacements of a faulted pipeline before giving up on it
    #[envconfig(default = "5")]
    pub pipeline_max_restarts: u32,

    #[envconfig(default = "1000")]
    pub pipeline_restart_backoff_ms: u64,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeserializationFailurePolicy {
    /// Log the record, skip past it and keep consuming
    LogAndContinue,
    /// Surface the record as a pipeline fault
    FailFast,
}

impl FromStr for DeserializationFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_ref() {
            "log-and-continue" => Ok(DeserializationFailurePolicy::LogAndContinue),
            "fail-fast" => Ok(DeserializationFailurePolicy::FailFast),
            _ => Err(format!(
                "Unknown deserialization failure policy: {s}, must be log-and-continue or fail-fast"
            )),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("topic '{0}' is configured both as input and as an output")]
    InputIsOutput(String),
    #[error("output topic '{0}' is shared by two pipelines")]
    SharedOutput(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.commit_interval_ms == 0 {
            return Err(ConfigError::Zero("commit_interval_ms"));
        }

        let outputs: Vec<&str> = PipelineKind::ALL
            .iter()
            .map(|kind| self.output_topic(*kind))
            .collect();
        for (index, topic) in outputs.iter().enumerate() {
            if *topic == self.input_topic {
                return Err(ConfigError::InputIsOutput(topic.to_string()));
            }
            if outputs[..index].contains(topic) {
                return Err(ConfigError::SharedOutput(topic.to_string()));
            }
        }
        Ok(())
    }

    pub fn output_topic(&self, kind: PipelineKind) -> &str {
        match kind {
            PipelineKind::BotCount => &self.bot_count_topic,
            PipelineKind::WebsiteCount => &self.website_count_topic,
            PipelineKind::EventTimeseries => &self.timeseries_topic,
        }
    }

    /// Each pipeline reads the whole input under its own consumer group.
    pub fn consumer_config(&self, kind: PipelineKind) -> ConsumerConfig {
        ConsumerConfig::new(
            format!("{}-{}", self.application_id, kind.name()),
            self.input_topic.clone(),
        )
        .with_offset_reset(self.kafka_consumer_offset_reset.clone())
        .with_commit_interval_ms(self.commit_interval_ms)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.pipeline_restart_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn producer_flush_timeout(&self) -> Duration {
        Duration::from_secs(self.kafka_producer_graceful_shutdown_secs)
    }
}
