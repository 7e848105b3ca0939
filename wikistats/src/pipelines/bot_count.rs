use tracing::{debug, error};

use crate::extract::{extract, non_blank, ExtractedFields, Extraction};
use crate::output::{encode, BotCount};
use crate::pipelines::{Aggregator, DropReason, Outcome, PipelineKind, SourceRecord};
use crate::store::RunningCounts;

pub const BOT_LABEL: &str = "bot";
pub const NON_BOT_LABEL: &str = "non-bot";

pub fn classify(fields: &ExtractedFields) -> &'static str {
    if fields.bot {
        BOT_LABEL
    } else {
        NON_BOT_LABEL
    }
}

/// Live bot / non-bot edit counters. Every increment re-emits the new
/// cumulative count for its label.
#[derive(Debug, Default)]
pub struct BotCountAggregator {
    counts: RunningCounts,
}

impl BotCountAggregator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Aggregator for BotCountAggregator {
    fn kind(&self) -> PipelineKind {
        PipelineKind::BotCount
    }

    fn process(&mut self, record: &SourceRecord<'_>) -> Outcome {
        let Some(raw) = non_blank(record.payload) else {
            return Outcome::Drop(DropReason::Blank);
        };

        let fields = match extract(raw) {
            Extraction::Valid(fields) => fields,
            Extraction::Invalid => {
                debug!("dropping unparseable payload from bot counts");
                return Outcome::Drop(DropReason::Unparseable);
            }
        };

        let label = classify(&fields);
        let count = self.counts.increment(label);

        match encode(label.as_bytes().to_vec(), &BotCount { label, count }) {
            Ok(output) => Outcome::Emit(output),
            Err(e) => {
                error!("failed to encode bot count for '{label}': {e:#}");
                Outcome::Drop(DropReason::EncodeFailed)
            }
        }
    }
}
