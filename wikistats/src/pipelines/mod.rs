//! The three stats pipelines.
//!
//! Each pipeline is an [`Aggregator`]: a sequential composition of
//! extraction, key derivation, a keyed counter increment and output encoding.
//! Aggregators own their state and do no I/O, so the worker that drives them
//! decides how records arrive and where emissions go.
//!
//! ```text
//! pipelines/
//! ├── bot_count.rs         # running bot / non-bot counts
//! ├── website_count.rs     # 60s windows per server_name
//! └── event_timeseries.rs  # 10s windows over all events
//! ```

use std::fmt;

use crate::output::OutputRecord;

pub mod bot_count;
pub mod event_timeseries;
pub mod website_count;

pub use bot_count::BotCountAggregator;
pub use event_timeseries::EventTimeseriesAggregator;
pub use website_count::WebsiteCountAggregator;

/// One input record as seen by every pipeline.
#[derive(Debug, Clone, Copy)]
pub struct SourceRecord<'a> {
    pub payload: Option<&'a str>,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Emit(OutputRecord),
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Null, empty or whitespace-only payload
    Blank,
    /// Payload is not JSON
    Unparseable,
    /// No usable server_name; the record cannot be attributed to a website
    UnknownWebsite,
    /// The record's window closed before it arrived
    WindowClosed,
    /// The aggregate update could not be encoded
    EncodeFailed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Blank => "blank",
            DropReason::Unparseable => "unparseable",
            DropReason::UnknownWebsite => "unknown_website",
            DropReason::WindowClosed => "window_closed",
            DropReason::EncodeFailed => "encode_failed",
        }
    }
}

/// Workers borrow their aggregator across produce awaits inside spawned tasks.
pub trait Aggregator: Send + Sync {
    fn kind(&self) -> PipelineKind;

    /// Handles one record completely: the state change and the encoded
    /// emission both happen before this returns.
    fn process(&mut self, record: &SourceRecord<'_>) -> Outcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    BotCount,
    WebsiteCount,
    EventTimeseries,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 3] = [
        PipelineKind::BotCount,
        PipelineKind::WebsiteCount,
        PipelineKind::EventTimeseries,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PipelineKind::BotCount => "bot_count",
            PipelineKind::WebsiteCount => "website_count",
            PipelineKind::EventTimeseries => "event_timeseries",
        }
    }

    /// A fresh aggregator with empty state.
    pub fn aggregator(&self) -> Box<dyn Aggregator> {
        match self {
            PipelineKind::BotCount => Box::new(BotCountAggregator::new()),
            PipelineKind::WebsiteCount => Box::new(WebsiteCountAggregator::new()),
            PipelineKind::EventTimeseries => Box::new(EventTimeseriesAggregator::new()),
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
