//! Queue data model: the queued mutation record, its identifiers, and the
//! closed set of backend services a record can target.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::capabilities::http::{validate_relative_path, HttpHeaders};
use crate::error::OutboxError;

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_millis() as u64))
    }

    #[must_use]
    pub fn sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_millis() as u64))
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is in the future.
    pub fn since(self, earlier: UnixTimeMs) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Source of "now" for enqueue timestamps and expiry cutoffs.
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start: UnixTimeMs) -> Self {
        Self {
            now_ms: AtomicU64::new(start.0),
        }
    }

    pub fn set(&self, now: UnixTimeMs) {
        self.now_ms.store(now.0, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.now_ms.load(Ordering::SeqCst))
    }
}

/// Validated queue entry identifier - immutable after construction
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, OutboxError> {
        let id = id.into().trim().to_string();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), OutboxError> {
        if id.is_empty() {
            return Err(OutboxError::MalformedRequest("id cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(OutboxError::MalformedRequest(format!(
                "id exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(OutboxError::MalformedRequest(
                "id contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The mutation verbs that may sit in the outbox. Reads are never queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueMethod {
    Post,
    Patch,
    Delete,
}

impl QueueMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueMethod::Post => "POST",
            QueueMethod::Patch => "PATCH",
            QueueMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for QueueMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueMethod {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POST" => Ok(QueueMethod::Post),
            "PATCH" => Ok(QueueMethod::Patch),
            "DELETE" => Ok(QueueMethod::Delete),
            other => Err(OutboxError::NotQueueable(other.to_string())),
        }
    }
}

/// Backend microservice a request targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ServiceToken {
    /// Accounts, auth and profiles.
    #[serde(rename = "aas")]
    Account,
    /// Vitals, symptoms and other logged data.
    #[serde(rename = "dls")]
    DataLogging,
    /// Alerts and notifications.
    #[serde(rename = "ans")]
    Alerts,
    /// AI insights.
    #[serde(rename = "ais")]
    Insights,
    /// Health education content.
    #[serde(rename = "hes")]
    Education,
}

impl ServiceToken {
    pub const ALL: [ServiceToken; 5] = [
        ServiceToken::Account,
        ServiceToken::DataLogging,
        ServiceToken::Alerts,
        ServiceToken::Insights,
        ServiceToken::Education,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceToken::Account => "aas",
            ServiceToken::DataLogging => "dls",
            ServiceToken::Alerts => "ans",
            ServiceToken::Insights => "ais",
            ServiceToken::Education => "hes",
        }
    }
}

impl fmt::Display for ServiceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceToken {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(token))
            .ok_or_else(|| OutboxError::InvalidService(token.to_string()))
    }
}

/// One pending mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: RequestId,
    pub method: QueueMethod,
    /// Resource path relative to the service's base address.
    pub url: String,
    /// Static headers replayed as-is. Never contains `Authorization`.
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub service: ServiceToken,
    pub enqueued_at: UnixTimeMs,
    pub attempts: u32,
}

impl QueuedRequest {
    /// Strictly older than the window at `now`.
    pub fn is_expired(&self, now: UnixTimeMs, window: Duration) -> bool {
        now.since(self.enqueued_at) > window
    }

    /// Whether a new PATCH for `(url, service)` should fold into this entry.
    pub fn absorbs_patch(&self, url: &str, service: ServiceToken) -> bool {
        self.method == QueueMethod::Patch && self.url == url && self.service == service
    }
}

/// What a failed call site hands to the outbox.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub method: QueueMethod,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
    pub service: ServiceToken,
}

impl EnqueueRequest {
    const MAX_URL_LENGTH: usize = 2048;

    pub fn new(method: QueueMethod, service: ServiceToken, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: Value::Null,
            service,
        }
    }

    pub fn post(service: ServiceToken, url: impl Into<String>, body: Value) -> Self {
        Self::new(QueueMethod::Post, service, url).with_body(body)
    }

    pub fn patch(service: ServiceToken, url: impl Into<String>, body: Value) -> Self {
        Self::new(QueueMethod::Patch, service, url).with_body(body)
    }

    pub fn delete(service: ServiceToken, url: impl Into<String>) -> Self {
        Self::new(QueueMethod::Delete, service, url)
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn validate(&self) -> Result<(), OutboxError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(OutboxError::Validation("url cannot be empty".into()));
        }
        if url.len() > Self::MAX_URL_LENGTH {
            return Err(OutboxError::Validation(format!(
                "url exceeds {} characters",
                Self::MAX_URL_LENGTH
            )));
        }
        if url.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(OutboxError::Validation(
                "url contains whitespace or control characters".into(),
            ));
        }
        validate_relative_path(url).map_err(|e| OutboxError::Validation(e.to_string()))?;
        for (name, value) in &self.headers {
            HttpHeaders::validate(name, value)
                .map_err(|e| OutboxError::Validation(e.to_string()))?;
        }
        Ok(())
    }

    /// Assigns identity and bookkeeping. Credentials are dropped so the
    /// router injects a fresh token at replay time.
    pub fn into_queued(self, id: RequestId, now: UnixTimeMs) -> QueuedRequest {
        let headers = self
            .headers
            .into_iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("authorization"))
            .collect();

        QueuedRequest {
            id,
            method: self.method,
            url: self.url.trim().to_string(),
            headers,
            body: self.body,
            service: self.service,
            enqueued_at: now,
            attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_id_validation() {
        assert!(RequestId::new("valid-id_123").is_ok());
        assert!(RequestId::new("").is_err());
        assert!(RequestId::new("   ").is_err());
        assert!(RequestId::new("invalid id").is_err());
        assert!(RequestId::new("a".repeat(129)).is_err());
    }

    #[test]
    fn test_request_id_trims_whitespace() {
        let id = RequestId::new("  req-1  ").unwrap();
        assert_eq!(id.as_str(), "req-1");
    }

    #[test]
    fn test_generated_ids_are_unique_and_valid() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
        assert!(RequestId::new(a.as_str()).is_ok());
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("patch".parse::<QueueMethod>().unwrap(), QueueMethod::Patch);
        assert_eq!("POST".parse::<QueueMethod>().unwrap(), QueueMethod::Post);
        assert!(matches!(
            "GET".parse::<QueueMethod>(),
            Err(OutboxError::NotQueueable(_))
        ));
        assert!(matches!(
            "PUT".parse::<QueueMethod>(),
            Err(OutboxError::NotQueueable(_))
        ));
    }

    #[test]
    fn test_service_token_parsing() {
        for token in ServiceToken::ALL {
            assert_eq!(token.as_str().parse::<ServiceToken>().unwrap(), token);
        }
        assert!(matches!(
            "billing".parse::<ServiceToken>(),
            Err(OutboxError::InvalidService(_))
        ));
    }

    #[test]
    fn test_service_token_wire_names() {
        assert_eq!(
            serde_json::to_string(&ServiceToken::Account).unwrap(),
            "\"aas\""
        );
        let parsed: ServiceToken = serde_json::from_str("\"dls\"").unwrap();
        assert_eq!(parsed, ServiceToken::DataLogging);
    }

    #[test]
    fn test_expiry_is_strict() {
        let window = Duration::from_secs(60);
        let entry = EnqueueRequest::delete(ServiceToken::Alerts, "/alerts/1")
            .into_queued(RequestId::generate(), UnixTimeMs(1_000));

        assert!(!entry.is_expired(UnixTimeMs(61_000), window));
        assert!(entry.is_expired(UnixTimeMs(61_001), window));
        // clock skew backwards never expires
        assert!(!entry.is_expired(UnixTimeMs(0), window));
    }

    #[test]
    fn test_into_queued_strips_authorization() {
        let queued = EnqueueRequest::post(ServiceToken::DataLogging, " /vitals ", json!({"bpm": 80}))
            .with_header("Authorization", "Bearer stale")
            .with_header("Content-Type", "application/json")
            .into_queued(RequestId::generate(), UnixTimeMs(5));

        assert_eq!(queued.url, "/vitals");
        assert_eq!(queued.attempts, 0);
        assert_eq!(queued.enqueued_at, UnixTimeMs(5));
        assert!(!queued.headers.keys().any(|k| k.eq_ignore_ascii_case("authorization")));
        assert_eq!(
            queued.headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
    }

    #[test]
    fn test_enqueue_request_validation() {
        assert!(EnqueueRequest::delete(ServiceToken::Account, "").validate().is_err());
        assert!(EnqueueRequest::delete(ServiceToken::Account, "/a b").validate().is_err());
        assert!(EnqueueRequest::delete(ServiceToken::Account, "/profiles/1")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_unreplayable_headers_rejected() {
        for (name, value) in [
            ("Content-Length", "12"),
            ("Host", "evil.example.com"),
            ("X Client", "ios"),
            ("X-Trace", "a\r\nInjected: 1"),
        ] {
            let request = EnqueueRequest::delete(ServiceToken::Alerts, "/alerts/1")
                .with_header(name, value);
            assert!(
                matches!(request.validate(), Err(OutboxError::Validation(_))),
                "{name}"
            );
        }
        assert!(EnqueueRequest::delete(ServiceToken::Alerts, "/alerts/1")
            .with_header("X-Client", "ios")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_absolute_url_rejected() {
        let request = EnqueueRequest::post(
            ServiceToken::DataLogging,
            "https://evil.example.com/x",
            json!({}),
        );
        assert!(matches!(request.validate(), Err(OutboxError::Validation(_))));
    }

    #[test]
    fn test_patch_absorption_key() {
        let entry = EnqueueRequest::patch(ServiceToken::Account, "/profiles/1", json!({}))
            .into_queued(RequestId::generate(), UnixTimeMs(0));
        assert!(entry.absorbs_patch("/profiles/1", ServiceToken::Account));
        assert!(!entry.absorbs_patch("/profiles/2", ServiceToken::Account));
        assert!(!entry.absorbs_patch("/profiles/1", ServiceToken::DataLogging));
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(UnixTimeMs(10));
        clock.advance(Duration::from_millis(5));
        assert_eq!(clock.now(), UnixTimeMs(15));
        clock.set(UnixTimeMs(3));
        assert_eq!(clock.now(), UnixTimeMs(3));
    }
}
