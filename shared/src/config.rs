use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::capabilities::http::{parse_base_url, HttpError};
use crate::error::OutboxError;
use crate::model::ServiceToken;
use crate::{EXPIRY_WINDOW, MAX_ATTEMPTS, MAX_QUEUE_SIZE, MAX_STORAGE_BYTES, REQUEST_TIMEOUT};

/// Delay between automatic drain cycles while retryable entries remain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry only on the next connectivity-regained event.
    #[default]
    None,
    Exponential {
        base_ms: u64,
        max_ms: u64,
        jitter_ms: u64,
    },
}

impl Backoff {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Backoff::None)
    }

    /// Delay before the cycle following `cycle` (0-based).
    pub fn delay_for(&self, cycle: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Exponential {
                base_ms,
                max_ms,
                jitter_ms,
            } => {
                let exponent = cycle.min(16);
                let base_delay = base_ms.saturating_mul(1u64 << exponent);
                let capped_delay = base_delay.min(max_ms);
                let jitter = if jitter_ms == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=jitter_ms)
                };
                Duration::from_millis(capped_delay.saturating_add(jitter))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            backoff: Backoff::None,
        }
    }
}

impl RetryPolicy {
    /// Whether an entry that has failed `attempts` times must be dropped.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn validate(&self) -> Result<(), OutboxError> {
        if self.max_attempts == 0 {
            return Err(OutboxError::Validation("max_attempts must be > 0".into()));
        }
        if let Backoff::Exponential { base_ms, max_ms, .. } = self.backoff {
            if base_ms == 0 {
                return Err(OutboxError::Validation("base_ms must be > 0".into()));
            }
            if max_ms < base_ms {
                return Err(OutboxError::Validation("max_ms must be >= base_ms".into()));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub max_queue_size: usize,
    pub max_storage_bytes: usize,
    pub expiry_window_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_queue_size: MAX_QUEUE_SIZE,
            max_storage_bytes: MAX_STORAGE_BYTES,
            expiry_window_ms: EXPIRY_WINDOW.as_millis() as u64,
            retry: RetryPolicy::default(),
        }
    }
}

impl OutboxConfig {
    pub fn expiry_window(&self) -> Duration {
        Duration::from_millis(self.expiry_window_ms)
    }

    pub fn validate(&self) -> Result<(), OutboxError> {
        if self.max_queue_size == 0 {
            return Err(OutboxError::Validation("max_queue_size must be > 0".into()));
        }
        // an empty document is "[]"
        if self.max_storage_bytes < 2 {
            return Err(OutboxError::Validation(
                "max_storage_bytes must be at least 2".into(),
            ));
        }
        if self.expiry_window_ms == 0 {
            return Err(OutboxError::Validation(
                "expiry_window_ms must be > 0".into(),
            ));
        }
        self.retry.validate()
    }
}

/// Base address of each backend service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoints {
    pub account: String,
    pub data_logging: String,
    pub alerts: String,
    pub insights: String,
    pub education: String,
}

impl ServiceEndpoints {
    pub fn base_url(&self, service: ServiceToken) -> &str {
        match service {
            ServiceToken::Account => &self.account,
            ServiceToken::DataLogging => &self.data_logging,
            ServiceToken::Alerts => &self.alerts,
            ServiceToken::Insights => &self.insights,
            ServiceToken::Education => &self.education,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub endpoints: ServiceEndpoints,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_headers")]
    pub default_headers: BTreeMap<String, String>,
}

fn default_request_timeout_ms() -> u64 {
    REQUEST_TIMEOUT.as_millis() as u64
}

fn default_headers() -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert("Accept".to_string(), "application/json".to_string());
    headers
}

impl RouterConfig {
    pub fn new(endpoints: ServiceEndpoints) -> Self {
        Self {
            endpoints,
            request_timeout_ms: default_request_timeout_ms(),
            default_headers: default_headers(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), HttpError> {
        for service in ServiceToken::ALL {
            parse_base_url(self.endpoints.base_url(service))?;
        }
        if self.request_timeout_ms == 0 {
            return Err(HttpError::InvalidRequest {
                reason: "request timeout cannot be zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Everything the host configures, loadable from one JSON document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub outbox: OutboxConfig,
    pub router: RouterConfig,
}

impl SyncConfig {
    pub fn new(endpoints: ServiceEndpoints) -> Self {
        Self {
            outbox: OutboxConfig::default(),
            router: RouterConfig::new(endpoints),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, OutboxError> {
        let config: Self = serde_json::from_str(json)?;
        config.outbox.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> ServiceEndpoints {
        ServiceEndpoints {
            account: "https://aas.example.com/api/v1".into(),
            data_logging: "https://dls.example.com".into(),
            alerts: "https://ans.example.com".into(),
            insights: "https://ais.example.com".into(),
            education: "https://hes.example.com".into(),
        }
    }

    #[test]
    fn test_default_config_matches_reference_limits() {
        let config = OutboxConfig::default();
        assert_eq!(config.max_queue_size, 50);
        assert_eq!(config.max_storage_bytes, 5 * 1024 * 1024);
        assert_eq!(config.expiry_window(), Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff, Backoff::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = OutboxConfig {
            max_queue_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = OutboxConfig {
            retry: RetryPolicy {
                max_attempts: 0,
                backoff: Backoff::None,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = OutboxConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: Backoff::Exponential {
                    base_ms: 1_000,
                    max_ms: 10,
                    jitter_ms: 0,
                },
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_config_uses_defaults() {
        let config: OutboxConfig =
            serde_json::from_str(r#"{"max_queue_size": 10, "retry": {"max_attempts": 5}}"#).unwrap();
        assert_eq!(config.max_queue_size, 10);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.max_storage_bytes, MAX_STORAGE_BYTES);
    }

    #[test]
    fn test_exhaustion_threshold() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    #[test]
    fn test_backoff_none_is_zero() {
        assert_eq!(Backoff::None.delay_for(5), Duration::ZERO);
        assert!(!Backoff::None.is_enabled());
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            base_ms: 1_000,
            max_ms: 8_000,
            jitter_ms: 0,
        };
        assert_eq!(backoff.delay_for(0), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(4_000));
        assert_eq!(backoff.delay_for(10), Duration::from_millis(8_000));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_millis(8_000));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let backoff = Backoff::Exponential {
            base_ms: 100,
            max_ms: 100,
            jitter_ms: 50,
        };
        for _ in 0..20 {
            let delay = backoff.delay_for(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_backoff_json_shape() {
        let backoff: Backoff = serde_json::from_str(
            r#"{"kind": "exponential", "base_ms": 500, "max_ms": 5000, "jitter_ms": 100}"#,
        )
        .unwrap();
        assert!(backoff.is_enabled());
    }

    #[test]
    fn test_router_config_validation() {
        let config = RouterConfig::new(endpoints());
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout(), Duration::from_secs(10));

        let mut bad = endpoints();
        bad.alerts = "ftp://ans.example.com".into();
        assert!(RouterConfig::new(bad).validate().is_err());
    }

    #[test]
    fn test_endpoint_lookup_is_per_service() {
        let endpoints = endpoints();
        assert_eq!(
            endpoints.base_url(ServiceToken::Account),
            "https://aas.example.com/api/v1"
        );
        assert_eq!(
            endpoints.base_url(ServiceToken::Education),
            "https://hes.example.com"
        );
    }

    #[test]
    fn test_sync_config_from_json() {
        let config = SyncConfig::from_json(
            r#"{
                "router": {
                    "endpoints": {
                        "account": "https://aas.example.com/api/v1",
                        "data_logging": "https://dls.example.com",
                        "alerts": "https://ans.example.com",
                        "insights": "https://ais.example.com",
                        "education": "https://hes.example.com"
                    },
                    "request_timeout_ms": 5000
                },
                "outbox": {"retry": {"backoff": {"kind": "exponential", "base_ms": 1000, "max_ms": 60000, "jitter_ms": 500}}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.router.request_timeout(), Duration::from_secs(5));
        assert_eq!(
            config.router.default_headers.get("Accept").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(config.outbox.max_queue_size, MAX_QUEUE_SIZE);
        assert!(config.outbox.retry.backoff.is_enabled());
        assert_eq!(config.outbox.retry.max_attempts, 3);
    }

    #[test]
    fn test_sync_config_rejects_bad_input() {
        assert!(matches!(
            SyncConfig::from_json("{}"),
            Err(OutboxError::Serialization(_))
        ));
        let config = SyncConfig::new(endpoints());
        let mut json = serde_json::to_value(&config).unwrap();
        json["outbox"]["max_queue_size"] = serde_json::json!(0);
        assert!(SyncConfig::from_json(&json.to_string()).is_err());
    }
}
