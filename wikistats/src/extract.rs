//! Best-effort field extraction from recent-change payloads.
//!
//! Payloads are loosely structured: any text that parses as JSON is accepted,
//! and the two fields the pipelines care about are read leniently. Nothing
//! here returns an error; unparseable text becomes [`Extraction::Invalid`].

use serde_json::Value;

const BOT_FIELD: &str = "bot";
const SERVER_NAME_FIELD: &str = "server_name";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedFields {
    pub bot: bool,
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Valid(ExtractedFields),
    Invalid,
}

/// Returns the payload when it has any non-whitespace content.
pub fn non_blank(raw: Option<&str>) -> Option<&str> {
    raw.filter(|text| !text.trim().is_empty())
}

pub fn extract(raw: &str) -> Extraction {
    // Only the first JSON value is read; trailing bytes after it are ignored
    let first = serde_json::Deserializer::from_str(raw)
        .into_iter::<Value>()
        .next();

    match first {
        Some(Ok(value)) => Extraction::Valid(ExtractedFields {
            bot: read_bot(&value),
            server_name: read_server_name(&value),
        }),
        _ => Extraction::Invalid,
    }
}

fn read_bot(value: &Value) -> bool {
    match value.get(BOT_FIELD) {
        Some(Value::Bool(bot)) => *bot,
        Some(Value::String(text)) => text.trim() == "true",
        Some(Value::Number(number)) => number
            .as_i64()
            .map(|n| n != 0)
            .or_else(|| number.as_u64().map(|n| n != 0))
            .unwrap_or(false),
        _ => false,
    }
}

fn read_server_name(value: &Value) -> Option<String> {
    match value.get(SERVER_NAME_FIELD)? {
        Value::String(name) => Some(name.clone()),
        scalar @ (Value::Number(_) | Value::Bool(_)) => Some(scalar.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
