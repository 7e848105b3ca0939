use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::EncodeError;

/// Fixed-width, non-overlapping, epoch-aligned time buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TumblingWindows {
    size_ms: i64,
}

impl TumblingWindows {
    pub fn of_size(size: Duration) -> Self {
        let size_ms = i64::try_from(size.as_millis()).unwrap_or(i64::MAX).max(1);
        Self { size_ms }
    }

    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    /// The single window containing `timestamp_ms`. A timestamp on a boundary
    /// belongs to the window that starts there.
    pub fn window_for(&self, timestamp_ms: i64) -> Window {
        let start_ms = timestamp_ms.saturating_sub(timestamp_ms.rem_euclid(self.size_ms));
        Window {
            start_ms,
            end_ms: start_ms.saturating_add(self.size_ms),
        }
    }
}

/// Half-open interval `[start_ms, end_ms)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Window {
    start_ms: i64,
    end_ms: i64,
}

impl Window {
    pub fn start_ms(&self) -> i64 {
        self.start_ms
    }

    pub fn end_ms(&self) -> i64 {
        self.end_ms
    }

    pub fn start_time(&self) -> Result<String, EncodeError> {
        iso8601(self.start_ms)
    }

    pub fn end_time(&self) -> Result<String, EncodeError> {
        iso8601(self.end_ms)
    }
}

/// UTC, second precision unless the instant has a fractional part,
/// e.g. `2024-05-01T12:00:00Z`.
pub fn iso8601(timestamp_ms: i64) -> Result<String, EncodeError> {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|instant| instant.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .ok_or(EncodeError::TimestampOutOfRange(timestamp_ms))
}
