// All counters carry a "pipeline" label
pub const RECORDS_CONSUMED: &str = "wikistats_records_consumed";
pub const RECORDS_EMITTED: &str = "wikistats_records_emitted";
/// Labelled with "reason", see `DropReason::as_str`
pub const RECORDS_DROPPED: &str = "wikistats_records_dropped";
pub const LATE_RECORDS: &str = "wikistats_late_records";
pub const UNDECODABLE_RECORDS: &str = "wikistats_undecodable_records";
pub const MISSING_TIMESTAMP: &str = "wikistats_missing_record_timestamp";
pub const OFFSET_STORE_FAILED: &str = "wikistats_offset_store_failed";

pub const KAFKA_CONSUMER_ERROR: &str = "wikistats_kafka_consumer_error";
pub const KAFKA_PRODUCER_ERROR: &str = "wikistats_kafka_producer_error";

pub const PIPELINE_RESTARTS: &str = "wikistats_pipeline_restarts";
pub const PIPELINE_FAILED: &str = "wikistats_pipeline_failed";
