use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::error::OutboxError;
use crate::model::QueueMethod;

pub const MAX_URL_LENGTH: usize = 2048;
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;
pub const MAX_HEADER_NAME_LENGTH: usize = 256;
pub const MAX_HEADER_VALUE_LENGTH: usize = 8192;
pub const MAX_HEADERS_COUNT: usize = 100;

fn truncate_url(url: &str) -> String {
    if url.len() <= 100 {
        url.to_string()
    } else {
        let mut end = 100;
        while !url.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &url[..end])
    }
}

/// Parses a service base address: absolute http(s), with a host, no credentials.
pub fn parse_base_url(raw: &str) -> Result<Url, HttpError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(HttpError::InvalidUrl {
            url: String::new(),
            reason: "URL cannot be empty".to_string(),
        });
    }
    if raw.len() > MAX_URL_LENGTH {
        return Err(HttpError::InvalidUrl {
            url: truncate_url(raw),
            reason: format!("URL exceeds maximum length of {} bytes", MAX_URL_LENGTH),
        });
    }

    let parsed = Url::parse(raw).map_err(|e| HttpError::InvalidUrl {
        url: truncate_url(raw),
        reason: e.to_string(),
    })?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(HttpError::InvalidUrl {
            url: truncate_url(raw),
            reason: format!(
                "invalid scheme '{}', only 'http' and 'https' are allowed",
                scheme
            ),
        });
    }
    if parsed.host_str().is_none() {
        return Err(HttpError::InvalidUrl {
            url: truncate_url(raw),
            reason: "URL must have a host".to_string(),
        });
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(HttpError::InvalidUrl {
            url: truncate_url(raw),
            reason: "credentials in URL are not allowed".to_string(),
        });
    }

    Ok(parsed)
}

/// Resource paths are relative to a service base address, never absolute URLs.
pub fn validate_relative_path(path: &str) -> Result<(), HttpError> {
    if path.contains("://") {
        return Err(HttpError::InvalidUrl {
            url: truncate_url(path),
            reason: "expected a path relative to the service base address".to_string(),
        });
    }
    Ok(())
}

/// Appends a resource path to a base address, keeping the base's own path
/// prefix (`https://h/api/v1` + `/profiles/1` -> `https://h/api/v1/profiles/1`).
pub fn join_path(base: &Url, path: &str) -> Result<Url, HttpError> {
    let path = path.trim();
    validate_relative_path(path)?;

    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    if joined.len() > MAX_URL_LENGTH {
        return Err(HttpError::InvalidUrl {
            url: truncate_url(&joined),
            reason: format!("URL exceeds maximum length of {} bytes", MAX_URL_LENGTH),
        });
    }

    Url::parse(&joined).map_err(|e| HttpError::InvalidUrl {
        url: truncate_url(&joined),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeaders {
    headers: Vec<(String, String)>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), HttpError> {
        let name = name.into();
        let value = value.into();

        Self::validate(&name, &value)?;

        let name_lower = name.to_lowercase();
        self.headers.retain(|(n, _)| n.to_lowercase() != name_lower);

        if self.headers.len() >= MAX_HEADERS_COUNT {
            return Err(HttpError::TooManyHeaders {
                count: self.headers.len() + 1,
                max: MAX_HEADERS_COUNT,
            });
        }

        self.headers.push((name, value));
        Ok(())
    }

    /// Checks a caller-supplied header without inserting it.
    pub fn validate(name: &str, value: &str) -> Result<(), HttpError> {
        Self::validate_header_name(name)?;
        Self::validate_header_value(name, value)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    fn validate_header_name(name: &str) -> Result<(), HttpError> {
        if name.is_empty() {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "header name cannot be empty".to_string(),
            });
        }

        if name.len() > MAX_HEADER_NAME_LENGTH {
            return Err(HttpError::InvalidHeader {
                name: name.chars().take(50).collect::<String>() + "...",
                reason: format!(
                    "header name exceeds maximum length of {} bytes",
                    MAX_HEADER_NAME_LENGTH
                ),
            });
        }

        for c in name.chars() {
            if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
                return Err(HttpError::InvalidHeader {
                    name: name.to_string(),
                    reason: format!("invalid character '{}' in header name", c),
                });
            }
        }

        let lower = name.to_lowercase();
        if lower == "host" || lower == "content-length" || lower == "transfer-encoding" {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "this header is managed automatically".to_string(),
            });
        }

        Ok(())
    }

    fn validate_header_value(name: &str, value: &str) -> Result<(), HttpError> {
        if value.len() > MAX_HEADER_VALUE_LENGTH {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: format!(
                    "header value exceeds maximum length of {} bytes",
                    MAX_HEADER_VALUE_LENGTH
                ),
            });
        }

        if value.chars().any(|c| c == '\r' || c == '\n' || c == '\0') {
            return Err(HttpError::InvalidHeader {
                name: name.to_string(),
                reason: "header value contains invalid characters (CR, LF, or NULL)".to_string(),
            });
        }

        Ok(())
    }
}

/// Headers received from the network are kept verbatim.
impl From<Vec<(String, String)>> for HttpHeaders {
    fn from(headers: Vec<(String, String)>) -> Self {
        Self { headers }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Writes are the only calls that may be offered to the outbox.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, HttpMethod::Get)
    }
}

impl From<QueueMethod> for HttpMethod {
    fn from(method: QueueMethod) -> Self {
        match method {
            QueueMethod::Post => HttpMethod::Post,
            QueueMethod::Patch => HttpMethod::Patch,
            QueueMethod::Delete => HttpMethod::Delete,
        }
    }
}

impl TryFrom<HttpMethod> for QueueMethod {
    type Error = OutboxError;

    fn try_from(method: HttpMethod) -> Result<Self, Self::Error> {
        match method {
            HttpMethod::Post => Ok(QueueMethod::Post),
            HttpMethod::Patch => Ok(QueueMethod::Patch),
            HttpMethod::Delete => Ok(QueueMethod::Delete),
            HttpMethod::Get | HttpMethod::Put => {
                Err(OutboxError::NotQueueable(method.as_str().to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    Json,
    FormUrlEncoded,
    Multipart,
    Custom(String),
}

impl ContentType {
    pub fn as_str(&self) -> &str {
        match self {
            ContentType::Json => "application/json",
            ContentType::FormUrlEncoded => "application/x-www-form-urlencoded",
            ContentType::Multipart => "multipart/form-data",
            ContentType::Custom(s) => s.as_str(),
        }
    }

    pub fn from_header(value: &str) -> Self {
        let lower = value.to_lowercase();
        if lower.starts_with("application/json") {
            ContentType::Json
        } else if lower.starts_with("application/x-www-form-urlencoded") {
            ContentType::FormUrlEncoded
        } else if lower.starts_with("multipart/form-data") {
            ContentType::Multipart
        } else {
            ContentType::Custom(value.to_string())
        }
    }
}

/// One field of a multipart-style form descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormPart {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// JSON-safe stand-in for a multipart body: `{"parts": [{name, value, ...}]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartForm {
    pub parts: Vec<FormPart>,
}

impl MultipartForm {
    pub fn from_value(value: &Value) -> Result<Self, HttpError> {
        serde_json::from_value(value.clone()).map_err(|e| HttpError::SerializationError {
            message: format!("invalid multipart descriptor: {e}"),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    method: HttpMethod,
    url: Url,
    headers: HttpHeaders,
    body: Option<Value>,
    timeout_ms: u64,
    request_id: String,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HttpHeaders::new(),
            body: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, HttpError> {
        self.headers.insert(name, value)?;
        Ok(self)
    }

    /// `null` bodies are treated as "no body".
    pub fn with_body(mut self, body: Value) -> Result<Self, HttpError> {
        if body.is_null() {
            self.body = None;
            return Ok(self);
        }
        if !self.method.is_mutation() {
            return Err(HttpError::InvalidRequest {
                reason: format!("{} requests cannot have a body", self.method.as_str()),
            });
        }
        if !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", ContentType::Json.as_str())?;
        }
        self.body = Some(body);
        Ok(self)
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Result<Self, HttpError> {
        if timeout_ms == 0 {
            return Err(HttpError::InvalidRequest {
                reason: "timeout cannot be zero".to_string(),
            });
        }
        if timeout_ms > MAX_TIMEOUT_MS {
            return Err(HttpError::InvalidRequest {
                reason: format!("timeout exceeds maximum of {}ms", MAX_TIMEOUT_MS),
            });
        }
        self.timeout_ms = timeout_ms;
        Ok(self)
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn content_type(&self) -> ContentType {
        self.headers
            .get("content-type")
            .map_or(ContentType::Json, ContentType::from_header)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    status: u16,
    headers: HttpHeaders,
    body: Vec<u8>,
    request_id: String,
}

impl HttpResponse {
    pub fn new(status: u16, headers: HttpHeaders, body: Vec<u8>, request_id: String) -> Self {
        Self {
            status,
            headers,
            body,
            request_id,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|e| HttpError::InvalidResponse {
            reason: format!("failed to parse JSON: {}", e),
            request_id: self.request_id.clone(),
        })
    }

    /// Body as JSON when it parses, as a string otherwise, `null` when empty.
    pub fn body_value(&self) -> Value {
        if self.body.is_empty() {
            return Value::Null;
        }
        serde_json::from_slice(&self.body).unwrap_or_else(|_| Value::String(self.body_string()))
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("too many headers: {count} exceeds maximum of {max}")]
    TooManyHeaders { count: usize, max: usize },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("serialization error: {message}")]
    SerializationError { message: String },

    #[error("connection failed to {host}: {message}")]
    ConnectionError { host: String, message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, request_id: String },

    #[error("HTTP error {status}: {message}")]
    HttpStatus {
        status: u16,
        message: String,
        request_id: String,
    },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String, request_id: String },
}

impl HttpError {
    /// No response was received at all.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            HttpError::ConnectionError { .. } | HttpError::Timeout { .. }
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Performs a fully built request. Any received response is `Ok`, whatever
/// its status; `Err` means nothing usable came back.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

#[cfg(feature = "native-http")]
pub use self::native::ReqwestTransport;

#[cfg(feature = "native-http")]
mod native {
    use super::*;
    use std::time::Duration;

    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new() -> Result<Self, HttpError> {
            let client = reqwest::Client::builder()
                .build()
                .map_err(|e| HttpError::InvalidRequest {
                    reason: e.to_string(),
                })?;
            Ok(Self { client })
        }

        pub fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }

        fn method(method: HttpMethod) -> reqwest::Method {
            match method {
                HttpMethod::Get => reqwest::Method::GET,
                HttpMethod::Post => reqwest::Method::POST,
                HttpMethod::Put => reqwest::Method::PUT,
                HttpMethod::Patch => reqwest::Method::PATCH,
                HttpMethod::Delete => reqwest::Method::DELETE,
            }
        }

        fn multipart(body: &Value) -> Result<reqwest::multipart::Form, HttpError> {
            let descriptor = MultipartForm::from_value(body)?;
            let mut form = reqwest::multipart::Form::new();
            for part in descriptor.parts {
                let mut field = reqwest::multipart::Part::text(part.value);
                if let Some(file_name) = part.file_name {
                    field = field.file_name(file_name);
                }
                if let Some(content_type) = part.content_type {
                    field = field.mime_str(&content_type).map_err(|e| {
                        HttpError::SerializationError {
                            message: e.to_string(),
                        }
                    })?;
                }
                form = form.part(part.name, field);
            }
            Ok(form)
        }

        fn classify(error: &reqwest::Error, request: &HttpRequest) -> HttpError {
            let host = request.url().host_str().unwrap_or_default().to_string();
            if error.is_timeout() {
                HttpError::Timeout {
                    timeout_ms: request.timeout_ms(),
                    request_id: request.request_id().to_string(),
                }
            } else if error.is_builder() {
                HttpError::InvalidRequest {
                    reason: error.to_string(),
                }
            } else if error.is_body() || error.is_decode() {
                HttpError::InvalidResponse {
                    reason: error.to_string(),
                    request_id: request.request_id().to_string(),
                }
            } else {
                HttpError::ConnectionError {
                    host,
                    message: error.to_string(),
                }
            }
        }
    }

    #[async_trait]
    impl HttpTransport for ReqwestTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
            let content_type = request.content_type();
            let mut builder = self
                .client
                .request(Self::method(request.method()), request.url().clone())
                .timeout(Duration::from_millis(request.timeout_ms()));

            for (name, value) in request.headers().iter() {
                // reqwest writes its own boundary-carrying content type
                if content_type == ContentType::Multipart && name.eq_ignore_ascii_case("content-type") {
                    continue;
                }
                builder = builder.header(name, value);
            }

            if let Some(body) = request.body() {
                builder = match content_type {
                    ContentType::FormUrlEncoded => builder.form(body),
                    ContentType::Multipart => builder.multipart(Self::multipart(body)?),
                    ContentType::Json | ContentType::Custom(_) => builder.json(body),
                };
            }

            let response = builder
                .send()
                .await
                .map_err(|e| Self::classify(&e, &request))?;

            let status = response.status().as_u16();
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(|e| Self::classify(&e, &request))?;

            Ok(HttpResponse::new(
                status,
                HttpHeaders::from(headers),
                body.to_vec(),
                request.request_id().to_string(),
            ))
        }
    }
}
