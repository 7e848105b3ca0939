//! Keyed aggregate state owned by a single pipeline worker.
//!
//! State is only reachable through `get` and `increment`. It lives in memory
//! for the lifetime of one worker; durability and restoration after a crash
//! belong to the transport, not to this module.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::window::{TumblingWindows, Window};

/// Unbounded counters, created on first increment and never reset.
#[derive(Debug, Default)]
pub struct RunningCounts {
    counts: HashMap<String, u64>,
}

impl RunningCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.counts.get(key).copied()
    }

    /// Returns the new count.
    pub fn increment(&mut self, key: &str) -> u64 {
        bump(&mut self.counts, key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowUpdate {
    Counted { window: Window, count: u64 },
    /// The event's window had already closed; nothing was counted
    Expired { window: Window },
}

/// Per-key counts over tumbling windows, without grace period.
///
/// Stream time is the largest event timestamp observed so far. A window is
/// closed once stream time reaches its end; late events for it are rejected
/// and closed windows are evicted, so they can never reopen.
#[derive(Debug)]
pub struct WindowedCounts {
    windows: TumblingWindows,
    open: BTreeMap<Window, HashMap<String, u64>>,
    stream_time_ms: Option<i64>,
}

impl WindowedCounts {
    pub fn new(windows: TumblingWindows) -> Self {
        Self {
            windows,
            open: BTreeMap::new(),
            stream_time_ms: None,
        }
    }

    pub fn windows(&self) -> TumblingWindows {
        self.windows
    }

    pub fn increment(&mut self, key: &str, timestamp_ms: i64) -> WindowUpdate {
        let window = self.windows.window_for(timestamp_ms);
        let stream_time_ms = self
            .stream_time_ms
            .map_or(timestamp_ms, |current| current.max(timestamp_ms));
        self.stream_time_ms = Some(stream_time_ms);

        if Self::is_closed(&window, stream_time_ms) {
            return WindowUpdate::Expired { window };
        }
        self.evict_closed(stream_time_ms);

        let count = bump(self.open.entry(window).or_default(), key);
        WindowUpdate::Counted { window, count }
    }

    pub fn get(&self, key: &str, window: &Window) -> Option<u64> {
        self.open.get(window)?.get(key).copied()
    }

    /// Number of windows currently holding at least one count.
    pub fn open_windows(&self) -> usize {
        self.open.len()
    }

    fn is_closed(window: &Window, stream_time_ms: i64) -> bool {
        window.end_ms() <= stream_time_ms
    }

    fn evict_closed(&mut self, stream_time_ms: i64) {
        let mut evicted = 0;
        while let Some(entry) = self.open.first_entry() {
            if !Self::is_closed(entry.key(), stream_time_ms) {
                break;
            }
            entry.remove();
            evicted += 1;
        }
        if evicted > 0 {
            debug!(
                "evicted {evicted} closed windows at stream time {stream_time_ms}ms, {} still open",
                self.open_windows()
            );
        }
    }
}

// Avoids allocating the key for counters that already exist
fn bump(counts: &mut HashMap<String, u64>, key: &str) -> u64 {
    if let Some(count) = counts.get_mut(key) {
        *count = count.saturating_add(1);
        return *count;
    }
    counts.insert(key.to_owned(), 1);
    1
}
