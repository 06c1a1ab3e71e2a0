//! Wire form of queued requests.
//!
//! Each record is a JSON object with exactly the fields
//! `{id, method, url, headers, data, timestamp, attempts, service}`; the
//! persisted queue is a JSON array of such records. Decoding validates the
//! fields a replay cannot do without, so a record damaged by an interrupted
//! write or an app update is rejected rather than replayed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::OutboxError;
use crate::model::{QueueMethod, QueuedRequest, RequestId, ServiceToken, UnixTimeMs};

#[derive(Serialize)]
struct WireRecord<'a> {
    id: &'a str,
    method: &'static str,
    url: &'a str,
    headers: &'a BTreeMap<String, String>,
    data: &'a Value,
    timestamp: u64,
    attempts: u32,
    service: &'static str,
}

impl<'a> From<&'a QueuedRequest> for WireRecord<'a> {
    fn from(request: &'a QueuedRequest) -> Self {
        Self {
            id: request.id.as_str(),
            method: request.method.as_str(),
            url: &request.url,
            headers: &request.headers,
            data: &request.body,
            timestamp: request.enqueued_at.0,
            attempts: request.attempts,
            service: request.service.as_str(),
        }
    }
}

/// Lenient shape used for decoding so missing fields become a
/// `MalformedRequest` with a useful message rather than a serde error.
#[derive(Deserialize)]
struct RawRecord {
    id: Option<String>,
    method: Option<String>,
    url: Option<String>,
    #[serde(default)]
    headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    data: Value,
    /// A record without a timestamp is treated as infinitely old.
    #[serde(default)]
    timestamp: u64,
    #[serde(default)]
    attempts: u32,
    service: Option<String>,
}

fn required(field: &'static str, value: Option<String>) -> Result<String, OutboxError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        Some(_) => Err(OutboxError::MalformedRequest(format!("{field} is empty"))),
        None => Err(OutboxError::MalformedRequest(format!("{field} is missing"))),
    }
}

impl TryFrom<RawRecord> for QueuedRequest {
    type Error = OutboxError;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        let id = RequestId::new(required("id", raw.id)?)?;
        let method: QueueMethod = required("method", raw.method)?
            .parse()
            .map_err(|e: OutboxError| OutboxError::MalformedRequest(e.to_string()))?;
        let url = required("url", raw.url)?;
        let service: ServiceToken = required("service", raw.service)?
            .parse()
            .map_err(|e: OutboxError| OutboxError::MalformedRequest(e.to_string()))?;

        Ok(QueuedRequest {
            id,
            method,
            url,
            headers: raw.headers.unwrap_or_default(),
            body: raw.data,
            service,
            enqueued_at: UnixTimeMs(raw.timestamp),
            attempts: raw.attempts,
        })
    }
}

pub fn to_value(request: &QueuedRequest) -> Result<Value, OutboxError> {
    Ok(serde_json::to_value(WireRecord::from(request))?)
}

pub fn from_value(value: Value) -> Result<QueuedRequest, OutboxError> {
    if !value.is_object() {
        return Err(OutboxError::MalformedRequest(
            "record is not a JSON object".into(),
        ));
    }
    let raw: RawRecord = serde_json::from_value(value)
        .map_err(|e| OutboxError::MalformedRequest(e.to_string()))?;
    QueuedRequest::try_from(raw)
}

pub fn serialize(request: &QueuedRequest) -> Result<Vec<u8>, OutboxError> {
    Ok(serde_json::to_vec(&WireRecord::from(request))?)
}

pub fn deserialize(bytes: &[u8]) -> Result<QueuedRequest, OutboxError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| OutboxError::MalformedRequest(e.to_string()))?;
    from_value(value)
}

/// A decoded queue document. Records that failed validation are not kept,
/// only their position and reason, so the caller can log them. They are
/// gone from the document after the next save.
#[derive(Debug, Default)]
pub struct DecodedQueue {
    pub entries: Vec<QueuedRequest>,
    pub skipped: Vec<(usize, OutboxError)>,
}

pub fn encode_queue(queue: &[QueuedRequest]) -> Result<Vec<u8>, OutboxError> {
    let records: Vec<WireRecord<'_>> = queue.iter().map(WireRecord::from).collect();
    Ok(serde_json::to_vec(&records)?)
}

/// Fails only if the document as a whole is not a JSON array.
pub fn decode_queue(bytes: &[u8]) -> Result<DecodedQueue, OutboxError> {
    let records: Vec<Value> = serde_json::from_slice(bytes)
        .map_err(|e| OutboxError::MalformedRequest(format!("queue document: {e}")))?;

    let mut decoded = DecodedQueue::default();
    for (index, record) in records.into_iter().enumerate() {
        match from_value(record) {
            Ok(entry) => decoded.entries.push(entry),
            Err(e) => decoded.skipped.push((index, e)),
        }
    }
    Ok(decoded)
}

/// Byte size of the queue as it would be persisted.
pub fn document_size(queue: &[QueuedRequest]) -> Result<usize, OutboxError> {
    Ok(encode_queue(queue)?.len())
}
