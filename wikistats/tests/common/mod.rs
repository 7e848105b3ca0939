use std::collections::HashMap;
use std::time::{Duration, Instant};

use envconfig::Envconfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, ClientContext, Message};
use uuid::Uuid;
use wikistats::config::Config;

pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Service config pointed at the mock brokers, with topics and consumer
/// groups unique to the calling test.
pub fn test_config(bootstrap_servers: &str, overrides: &[(&str, &str)]) -> Config {
    let suffix = Uuid::now_v7().to_string();
    let mut env: HashMap<String, String> = HashMap::from([
        ("KAFKA_HOSTS".to_string(), bootstrap_servers.to_string()),
        ("KAFKA_PRODUCER_LINGER_MS".to_string(), "0".to_string()),
        ("KAFKA_CONSUMER_OFFSET_RESET".to_string(), "earliest".to_string()),
        ("APPLICATION_ID".to_string(), format!("wikistats-test-{suffix}")),
        ("COMMIT_INTERVAL_MS".to_string(), "100".to_string()),
        ("INPUT_TOPIC".to_string(), format!("recentchange-{suffix}")),
        ("BOT_COUNT_TOPIC".to_string(), format!("bots-{suffix}")),
        ("WEBSITE_COUNT_TOPIC".to_string(), format!("website-{suffix}")),
        ("TIMESERIES_TOPIC".to_string(), format!("timeseries-{suffix}")),
        ("SHUTDOWN_TIMEOUT_SECS".to_string(), "20".to_string()),
        ("KAFKA_PRODUCER_GRACEFUL_SHUTDOWN_SECS".to_string(), "5".to_string()),
    ]);
    for (key, value) in overrides {
        env.insert(key.to_string(), value.to_string());
    }
    Config::init_from_hashmap(&env).expect("failed to build test config")
}

pub async fn produce_at<C: ClientContext + 'static>(
    producer: &FutureProducer<C>,
    topic: &str,
    payload: Option<&[u8]>,
    timestamp_ms: i64,
) {
    let mut record: FutureRecord<'_, str, [u8]> =
        FutureRecord::to(topic).key("k").timestamp(timestamp_ms);
    if let Some(payload) = payload {
        record = record.payload(payload);
    }
    producer
        .send(record, Duration::from_secs(5))
        .await
        .expect("failed to produce test record");
}

/// Reads `expected` records from the start of `topic`, as (key, value).
pub async fn collect_records(
    bootstrap_servers: &str,
    topic: &str,
    expected: usize,
) -> Vec<(Vec<u8>, String)> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", bootstrap_servers)
        .set("group.id", format!("collector-{}", Uuid::now_v7()))
        .set("auto.offset.reset", "earliest")
        .create()
        .expect("failed to create collector");
    consumer
        .subscribe(&[topic])
        .expect("failed to subscribe collector");

    let deadline = Instant::now() + RECEIVE_TIMEOUT;
    let mut records = Vec::with_capacity(expected);
    while records.len() < expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let message = tokio::time::timeout(remaining, consumer.recv())
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "timed out on '{topic}' after {} of {expected} records",
                    records.len()
                )
            })
            .expect("collector failed to receive");

        let key = message.key().unwrap_or_default().to_vec();
        let value = String::from_utf8(message.payload().unwrap_or_default().to_vec())
            .expect("output is UTF-8");
        records.push((key, value));
    }
    records
}
