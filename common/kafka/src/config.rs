use envconfig::Envconfig;
use rdkafka::ClientConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
}

impl KafkaConfig {
    /// Settings shared by consumers and producers.
    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("statistics.interval.ms", "10000");

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        client_config
    }
}

/// One consumer group reading one topic. Not env-derived: each stats
/// pipeline builds its own from the service config.
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,
    pub kafka_consumer_topic: String,

    // earliest, latest
    pub kafka_consumer_offset_reset: String,

    // Offsets are stored once a record is fully processed, and committed by
    // librdkafka on this interval
    pub kafka_consumer_commit_interval_ms: u32,
}

impl ConsumerConfig {
    pub fn new(group: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            kafka_consumer_group: group.into(),
            kafka_consumer_topic: topic.into(),
            kafka_consumer_offset_reset: "latest".to_string(),
            kafka_consumer_commit_interval_ms: 1000,
        }
    }

    pub fn with_offset_reset(mut self, offset_reset: impl Into<String>) -> Self {
        self.kafka_consumer_offset_reset = offset_reset.into();
        self
    }

    pub fn with_commit_interval_ms(mut self, interval_ms: u32) -> Self {
        self.kafka_consumer_commit_interval_ms = interval_ms;
        self
    }
}
