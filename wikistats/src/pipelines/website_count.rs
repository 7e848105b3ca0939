use std::time::Duration;

use tracing::{debug, error, warn};

use crate::extract::{extract, non_blank, Extraction};
use crate::output::{encode, windowed_key, WebsiteCount};
use crate::pipelines::{Aggregator, DropReason, Outcome, PipelineKind, SourceRecord};
use crate::store::{WindowUpdate, WindowedCounts};
use crate::window::TumblingWindows;

pub const WINDOW_SIZE: Duration = Duration::from_secs(60);

pub const UNKNOWN_KEY: &str = "unknown";
pub const PARSE_ERROR_KEY: &str = "parse-error";

/// Result of deriving a website from a payload. The two sentinels are
/// filtered out before aggregation and never reach the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebsiteKey {
    Website(String),
    Unknown,
    ParseError,
}

impl WebsiteKey {
    pub fn as_str(&self) -> &str {
        match self {
            WebsiteKey::Website(website) => website,
            WebsiteKey::Unknown => UNKNOWN_KEY,
            WebsiteKey::ParseError => PARSE_ERROR_KEY,
        }
    }
}

pub fn derive_key(payload: Option<&str>) -> WebsiteKey {
    let Some(raw) = non_blank(payload) else {
        warn!("Received null or empty message");
        return WebsiteKey::Unknown;
    };

    match extract(raw) {
        Extraction::Valid(fields) => match fields.server_name {
            // sentinel keys are reserved even when a payload spells them out
            Some(name) if name == UNKNOWN_KEY => WebsiteKey::Unknown,
            Some(name) if name == PARSE_ERROR_KEY => WebsiteKey::ParseError,
            Some(server_name) => WebsiteKey::Website(server_name),
            None => {
                warn!("Missing server_name in message: {raw}");
                WebsiteKey::Unknown
            }
        },
        Extraction::Invalid => {
            error!("Error parsing JSON for website: {raw}");
            WebsiteKey::ParseError
        }
    }
}

/// Edits per website over one-minute tumbling windows.
#[derive(Debug)]
pub struct WebsiteCountAggregator {
    counts: WindowedCounts,
}

impl Default for WebsiteCountAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl WebsiteCountAggregator {
    pub fn new() -> Self {
        Self {
            counts: WindowedCounts::new(TumblingWindows::of_size(WINDOW_SIZE)),
        }
    }
}

impl Aggregator for WebsiteCountAggregator {
    fn kind(&self) -> PipelineKind {
        PipelineKind::WebsiteCount
    }

    fn process(&mut self, record: &SourceRecord<'_>) -> Outcome {
        let website = match derive_key(record.payload) {
            WebsiteKey::Website(website) => website,
            sentinel => {
                debug!("filtering '{}' edit out of website counts", sentinel.as_str());
                let reason = match sentinel {
                    WebsiteKey::ParseError => DropReason::Unparseable,
                    _ => DropReason::UnknownWebsite,
                };
                return Outcome::Drop(reason);
            }
        };

        let (window, count) = match self.counts.increment(&website, record.timestamp_ms) {
            WindowUpdate::Counted { window, count } => (window, count),
            WindowUpdate::Expired { window } => {
                debug!(
                    "dropping late edit for '{website}': window starting {}ms already closed",
                    window.start_ms()
                );
                return Outcome::Drop(DropReason::WindowClosed);
            }
        };

        let encoded = WebsiteCount::new(&website, &window, count)
            .and_then(|value| encode(windowed_key(&website, &window), &value));
        match encoded {
            Ok(output) => Outcome::Emit(output),
            Err(e) => {
                error!("Error serializing website count result for key: {website}: {e:#}");
                Outcome::Drop(DropReason::EncodeFailed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;
    use serde_json::{json, Value};

    use super::*;
    use crate::output::parse_windowed_key;
    use crate::window::Window;

    impl WebsiteCountAggregator {
        fn count(&self, website: &str, window: &Window) -> Option<u64> {
            self.counts.get(website, window)
        }
    }

    fn process(aggregator: &mut WebsiteCountAggregator, payload: &str, timestamp_ms: i64) -> Outcome {
        aggregator.process(&SourceRecord {
            payload: Some(payload),
            timestamp_ms,
        })
    }

    fn emitted(outcome: Outcome) -> (Vec<u8>, Value) {
        let Outcome::Emit(record) = outcome else {
            panic!("expected an emission, got {outcome:?}");
        };
        (record.key, serde_json::from_str(&record.payload).unwrap())
    }

    #[test]
    fn derives_keys_with_sentinels() {
        assert_eq!(derive_key(None), WebsiteKey::Unknown);
        assert_eq!(derive_key(Some("  ")), WebsiteKey::Unknown);
        assert_eq!(derive_key(Some("{}")), WebsiteKey::Unknown);
        assert_eq!(derive_key(Some(r#"{"server_name":null}"#)), WebsiteKey::Unknown);
        assert_eq!(derive_key(Some("{oops")), WebsiteKey::ParseError);
        assert_eq!(
            derive_key(Some(r#"{"server_name":"commons.wikimedia.org"}"#)),
            WebsiteKey::Website("commons.wikimedia.org".to_string())
        );
        assert_eq!(WebsiteKey::Unknown.as_str(), "unknown");
        assert_eq!(WebsiteKey::ParseError.as_str(), "parse-error");
    }

    #[test]
    fn same_window_edits_accumulate() {
        let mut aggregator = WebsiteCountAggregator::new();
        let payload = r#"{"server_name":"en.wikipedia.org"}"#;

        let (first_key, first) = emitted(process(&mut aggregator, payload, 0));
        let (second_key, second) = emitted(process(&mut aggregator, payload, 30_000));

        assert_json_eq!(
            first,
            json!({
                "website": "en.wikipedia.org",
                "count": 1,
                "window_start": "1970-01-01T00:00:00Z",
                "window_end": "1970-01-01T00:01:00Z"
            })
        );
        assert_eq!(second["count"], 2);
        assert_eq!(first["window_start"], second["window_start"]);
        assert_eq!(first["window_end"], second["window_end"]);
        assert_eq!(first_key, second_key);
        assert_eq!(
            parse_windowed_key(&first_key),
            Some(("en.wikipedia.org", 0))
        );
    }

    #[test]
    fn new_window_restarts_the_count() {
        let mut aggregator = WebsiteCountAggregator::new();
        let payload = r#"{"server_name":"en.wikipedia.org"}"#;

        process(&mut aggregator, payload, 59_999);
        let (_, next) = emitted(process(&mut aggregator, payload, 60_000));
        assert_eq!(next["count"], 1);
        assert_eq!(next["window_start"], "1970-01-01T00:01:00Z");
    }

    #[test]
    fn unattributable_edits_are_never_counted() {
        let mut aggregator = WebsiteCountAggregator::new();
        let window = TumblingWindows::of_size(WINDOW_SIZE).window_for(0);

        assert_eq!(
            process(&mut aggregator, "{}", 0),
            Outcome::Drop(DropReason::UnknownWebsite)
        );
        assert_eq!(
            process(&mut aggregator, "not-json", 0),
            Outcome::Drop(DropReason::Unparseable)
        );
        assert_eq!(
            aggregator.process(&SourceRecord {
                payload: None,
                timestamp_ms: 0
            }),
            Outcome::Drop(DropReason::UnknownWebsite)
        );

        assert_eq!(aggregator.count(UNKNOWN_KEY, &window), None);
        assert_eq!(aggregator.count(PARSE_ERROR_KEY, &window), None);
    }

    #[test]
    fn literal_sentinel_names_are_still_filtered() {
        let mut aggregator = WebsiteCountAggregator::new();
        assert_eq!(
            process(&mut aggregator, r#"{"server_name":"unknown"}"#, 0),
            Outcome::Drop(DropReason::UnknownWebsite)
        );
        assert_eq!(
            process(&mut aggregator, r#"{"server_name":"parse-error"}"#, 0),
            Outcome::Drop(DropReason::Unparseable)
        );
    }

    #[test]
    fn late_edits_for_closed_windows_are_dropped() {
        let mut aggregator = WebsiteCountAggregator::new();
        let payload = r#"{"server_name":"de.wikipedia.org"}"#;

        process(&mut aggregator, payload, 10_000);
        process(&mut aggregator, payload, 61_000);
        assert_eq!(
            process(&mut aggregator, payload, 20_000),
            Outcome::Drop(DropReason::WindowClosed)
        );

        let (_, value) = emitted(process(&mut aggregator, payload, 62_000));
        assert_eq!(value["count"], 2);
    }
}
