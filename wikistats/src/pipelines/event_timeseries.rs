use std::time::Duration;

use tracing::{debug, error};

use crate::extract::non_blank;
use crate::output::{encode, windowed_key, EventTimeseries};
use crate::pipelines::{Aggregator, DropReason, Outcome, PipelineKind, SourceRecord};
use crate::store::{WindowUpdate, WindowedCounts};
use crate::window::TumblingWindows;

pub const WINDOW_SIZE: Duration = Duration::from_secs(10);

/// Every event groups under this one key; only the window distinguishes
/// successive output records.
pub const TIMESERIES_KEY: &str = "key-to-group";

/// Total edit volume over ten-second tumbling windows. Payload content is
/// never inspected, so unparseable edits still count.
#[derive(Debug)]
pub struct EventTimeseriesAggregator {
    counts: WindowedCounts,
}

impl Default for EventTimeseriesAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTimeseriesAggregator {
    pub fn new() -> Self {
        Self {
            counts: WindowedCounts::new(TumblingWindows::of_size(WINDOW_SIZE)),
        }
    }
}

impl Aggregator for EventTimeseriesAggregator {
    fn kind(&self) -> PipelineKind {
        PipelineKind::EventTimeseries
    }

    fn process(&mut self, record: &SourceRecord<'_>) -> Outcome {
        if non_blank(record.payload).is_none() {
            return Outcome::Drop(DropReason::Blank);
        }

        let (window, event_count) = match self.counts.increment(TIMESERIES_KEY, record.timestamp_ms) {
            WindowUpdate::Counted { window, count } => (window, count),
            WindowUpdate::Expired { window } => {
                debug!(
                    "dropping late event: timeseries window starting {}ms already closed",
                    window.start_ms()
                );
                return Outcome::Drop(DropReason::WindowClosed);
            }
        };

        let window_size_ms = self.counts.windows().size_ms();
        let encoded = EventTimeseries::new(&window, window_size_ms, event_count)
            .and_then(|value| encode(windowed_key(TIMESERIES_KEY, &window), &value));
        match encoded {
            Ok(output) => Outcome::Emit(output),
            Err(e) => {
                error!("Error serializing timeseries result: {e:#}");
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
    use crate::output::{parse_windowed_key, OutputRecord};
    use crate::window::Window;

    impl EventTimeseriesAggregator {
        fn event_count(&self, window: &Window) -> Option<u64> {
            self.counts.get(TIMESERIES_KEY, window)
        }
    }

    fn process(aggregator: &mut EventTimeseriesAggregator, payload: Option<&str>, timestamp_ms: i64) -> Outcome {
        aggregator.process(&SourceRecord {
            payload,
            timestamp_ms,
        })
    }

    fn emitted(outcome: Outcome) -> OutputRecord {
        match outcome {
            Outcome::Emit(record) => record,
            other => panic!("expected an emission, got {other:?}"),
        }
    }

    fn value(record: &OutputRecord) -> Value {
        serde_json::from_str(&record.payload).unwrap()
    }

    #[test]
    fn counts_any_non_blank_payload() {
        let mut aggregator = EventTimeseriesAggregator::new();

        emitted(process(&mut aggregator, Some(r#"{"bot":true}"#), 1_000));
        emitted(process(&mut aggregator, Some("not-json"), 2_000));
        let third = emitted(process(&mut aggregator, Some("{}"), 9_999));

        assert_json_eq!(
            value(&third),
            json!({
                "start_time": "1970-01-01T00:00:00Z",
                "end_time": "1970-01-01T00:00:10Z",
                "window_size_ms": 10000,
                "event_count": 3
            })
        );
    }

    #[test]
    fn blank_payloads_are_dropped() {
        let mut aggregator = EventTimeseriesAggregator::new();
        let window = TumblingWindows::of_size(WINDOW_SIZE).window_for(0);

        assert_eq!(process(&mut aggregator, None, 0), Outcome::Drop(DropReason::Blank));
        assert_eq!(process(&mut aggregator, Some("\t "), 0), Outcome::Drop(DropReason::Blank));
        assert_eq!(aggregator.event_count(&window), None);
    }

    #[test]
    fn successive_windows_have_distinct_keys() {
        let mut aggregator = EventTimeseriesAggregator::new();

        let first = emitted(process(&mut aggregator, Some("a"), 9_999));
        let second = emitted(process(&mut aggregator, Some("b"), 10_000));

        assert_ne!(first.key, second.key);
        assert_eq!(parse_windowed_key(&first.key), Some((TIMESERIES_KEY, 0)));
        assert_eq!(parse_windowed_key(&second.key), Some((TIMESERIES_KEY, 10_000)));
        assert_eq!(value(&second)["event_count"], 1);
        assert_eq!(value(&second)["start_time"], "1970-01-01T00:00:10Z");
    }

    #[test]
    fn closed_windows_do_not_reopen() {
        let mut aggregator = EventTimeseriesAggregator::new();

        process(&mut aggregator, Some("a"), 5_000);
        process(&mut aggregator, Some("b"), 25_000);
        assert_eq!(
            process(&mut aggregator, Some("late"), 6_000),
            Outcome::Drop(DropReason::WindowClosed)
        );

        let closed = TumblingWindows::of_size(WINDOW_SIZE).window_for(5_000);
        assert_eq!(aggregator.event_count(&closed), None);
    }
}
