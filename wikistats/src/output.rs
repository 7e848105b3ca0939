use serde::Serialize;

use crate::error::EncodeError;
use crate::window::Window;

/// An encoded aggregate update, ready to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    pub key: Vec<u8>,
    pub payload: String,
}

#[derive(Debug, Serialize)]
pub struct BotCount<'a> {
    #[serde(rename = "type")]
    pub label: &'a str,
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct WebsiteCount<'a> {
    pub website: &'a str,
    pub count: u64,
    pub window_start: String,
    pub window_end: String,
}

impl<'a> WebsiteCount<'a> {
    pub fn new(website: &'a str, window: &Window, count: u64) -> Result<Self, EncodeError> {
        Ok(Self {
            website,
            count,
            window_start: window.start_time()?,
            window_end: window.end_time()?,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct EventTimeseries {
    pub start_time: String,
    pub end_time: String,
    pub window_size_ms: i64,
    pub event_count: u64,
}

impl EventTimeseries {
    pub fn new(window: &Window, window_size_ms: i64, event_count: u64) -> Result<Self, EncodeError> {
        Ok(Self {
            start_time: window.start_time()?,
            end_time: window.end_time()?,
            window_size_ms,
            event_count,
        })
    }
}

pub fn encode<T: Serialize>(key: Vec<u8>, value: &T) -> Result<OutputRecord, EncodeError> {
    Ok(OutputRecord {
        key,
        payload: serde_json::to_string(value)?,
    })
}

/// Record key for a windowed aggregate: the UTF-8 key followed by the window
/// start as big-endian epoch milliseconds, the layout time-windowed key
/// deserializers read. Successive windows of one key get distinct record keys.
pub fn windowed_key(key: &str, window: &Window) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(key.len() + 8);
    bytes.extend_from_slice(key.as_bytes());
    bytes.extend_from_slice(&window.start_ms().to_be_bytes());
    bytes
}

/// Splits a windowed record key back into key and window start.
pub fn parse_windowed_key(bytes: &[u8]) -> Option<(&str, i64)> {
    let split = bytes.len().checked_sub(8)?;
    let (key, start) = bytes.split_at(split);
    let start = i64::from_be_bytes(start.try_into().ok()?);
    Some((std::str::from_utf8(key).ok()?, start))
}
