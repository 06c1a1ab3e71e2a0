//! Maps each backend service to a configured client and applies the shared
//! response taxonomy (401 signs the user out, 403/404/500 raise alerts).

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::auth::CredentialStore;
use crate::capabilities::http::{
    join_path, parse_base_url, HttpError, HttpMethod, HttpRequest, HttpResponse,
    HttpTransport,
};
use crate::config::RouterConfig;
use crate::error::OutboxError;
use crate::model::{QueuedRequest, ServiceToken};
use crate::notice::{Notice, Notifier};
use crate::outbox::Replayer;

const MAX_ERROR_MESSAGE_LENGTH: usize = 200;

/// HTTP client bound to one backend service.
#[derive(Clone)]
pub struct ServiceClient {
    service: ServiceToken,
    base_url: Url,
    default_headers: BTreeMap<String, String>,
    timeout: Duration,
    transport: Arc<dyn HttpTransport>,
    credentials: Arc<dyn CredentialStore>,
}

impl ServiceClient {
    pub fn new(
        service: ServiceToken,
        base_url: Url,
        config: &RouterConfig,
        transport: Arc<dyn HttpTransport>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            service,
            base_url,
            default_headers: config.default_headers.clone(),
            timeout: config.request_timeout(),
            transport,
            credentials,
        }
    }

    pub fn service(&self) -> ServiceToken {
        self.service
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn resolve_url(&self, path: &str) -> Result<Url, HttpError> {
        join_path(&self.base_url, path)
    }

    async fn build_request(
        &self,
        method: HttpMethod,
        path: &str,
        headers: &BTreeMap<String, String>,
        body: Value,
    ) -> Result<HttpRequest, HttpError> {
        let url = self.resolve_url(path)?;
        let mut request = HttpRequest::new(method, url)
            .with_timeout_ms(self.timeout.as_millis() as u64)?;

        for (name, value) in self.default_headers.iter().chain(headers.iter()) {
            request = request.with_header(name.as_str(), value.as_str())?;
        }

        // fresh on every call, never taken from the caller
        if let Some(token) = self.credentials.bearer_token().await {
            request = request.with_header(
                "Authorization",
                format!("Bearer {}", token.expose_secret()),
            )?;
        }

        request.with_body(body)
    }

    /// Performs one call. Any non-2xx status comes back as
    /// [`HttpError::HttpStatus`].
    #[instrument(skip(self, method, headers, body), fields(service = %self.service, method = method.as_str()))]
    pub async fn execute(
        &self,
        method: HttpMethod,
        path: &str,
        headers: &BTreeMap<String, String>,
        body: Value,
    ) -> Result<HttpResponse, HttpError> {
        let request = self.build_request(method, path, headers, body).await?;
        let request_id = request.request_id().to_string();
        let timeout_ms = request.timeout_ms();

        let response = match tokio::time::timeout(self.timeout, self.transport.send(request)).await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout_ms, "Request timed out");
                return Err(HttpError::Timeout {
                    timeout_ms,
                    request_id,
                });
            }
        };

        if response.is_success() {
            debug!(status = response.status(), "Request succeeded");
            return Ok(response);
        }

        Err(HttpError::HttpStatus {
            status: response.status(),
            message: error_message(&response),
            request_id: response.request_id().to_string(),
        })
    }
}

fn error_message(response: &HttpResponse) -> String {
    if let Ok(Value::Object(body)) = response.json::<Value>() {
        for field in ["message", "error", "detail"] {
            if let Some(message) = body.get(field).and_then(Value::as_str) {
                return message.to_string();
            }
        }
    }
    response
        .body_string()
        .chars()
        .take(MAX_ERROR_MESSAGE_LENGTH)
        .collect()
}

/// One client per service token.
pub struct ServiceRouter {
    account: ServiceClient,
    data_logging: ServiceClient,
    alerts: ServiceClient,
    insights: ServiceClient,
    education: ServiceClient,
    credentials: Arc<dyn CredentialStore>,
    notifier: Arc<dyn Notifier>,
}

impl ServiceRouter {
    pub fn new(
        config: &RouterConfig,
        transport: Arc<dyn HttpTransport>,
        credentials: Arc<dyn CredentialStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, HttpError> {
        config.validate()?;

        let client = |service: ServiceToken| -> Result<ServiceClient, HttpError> {
            let base_url = parse_base_url(config.endpoints.base_url(service))?;
            Ok(ServiceClient::new(
                service,
                base_url,
                config,
                Arc::clone(&transport),
                Arc::clone(&credentials),
            ))
        };

        Ok(Self {
            account: client(ServiceToken::Account)?,
            data_logging: client(ServiceToken::DataLogging)?,
            alerts: client(ServiceToken::Alerts)?,
            insights: client(ServiceToken::Insights)?,
            education: client(ServiceToken::Education)?,
            credentials,
            notifier,
        })
    }

    pub fn resolve(&self, service: ServiceToken) -> &ServiceClient {
        match service {
            ServiceToken::Account => &self.account,
            ServiceToken::DataLogging => &self.data_logging,
            ServiceToken::Alerts => &self.alerts,
            ServiceToken::Insights => &self.insights,
            ServiceToken::Education => &self.education,
        }
    }

    pub fn resolve_token(&self, token: &str) -> Result<&ServiceClient, OutboxError> {
        Ok(self.resolve(token.parse()?))
    }

    /// Executes a user-initiated call and applies the response taxonomy to
    /// any failure before handing it back.
    pub async fn call(
        &self,
        service: ServiceToken,
        method: HttpMethod,
        path: &str,
        headers: &BTreeMap<String, String>,
        body: Value,
    ) -> Result<HttpResponse, HttpError> {
        let result = self
            .resolve(service)
            .execute(method, path, headers, body)
            .await;
        if let Err(e) = &result {
            self.intercept(service, e).await;
        }
        result
    }

    pub async fn intercept(&self, service: ServiceToken, error: &HttpError) {
        let HttpError::HttpStatus {
            status, message, ..
        } = error
        else {
            return;
        };

        match *status {
            401 => {
                warn!(%service, "Unauthorized, clearing stored credential");
                self.credentials.clear().await;
                self.notifier.notify(Notice::SessionExpired);
            }
            403 | 404 | 500 => {
                self.notifier.notify(Notice::Alert {
                    service,
                    status: *status,
                    message: message.clone(),
                });
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Replayer for ServiceRouter {
    async fn replay(&self, entry: &QueuedRequest) -> Result<HttpResponse, HttpError> {
        self.resolve(entry.service)
            .execute(
                entry.method.into(),
                &entry.url,
                &entry.headers,
                entry.body.clone(),
            )
            .await
    }
}
