pub mod http;
pub mod kv;

use std::sync::Arc;

use crate::auth::CredentialStore;
use crate::connectivity::ConnectivityMonitor;
use crate::notice::Notifier;

pub use self::http::{HttpError, HttpMethod, HttpRequest, HttpResponse, HttpTransport};
pub use self::kv::{DurableStore, FileStore, KeyNamespace, MemoryStore, StorageKey};

#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteStore;

#[cfg(feature = "native-http")]
pub use self::http::ReqwestTransport;

/// Everything the sync core needs from the host platform.
#[derive(Clone)]
pub struct Capabilities {
    pub http: Arc<dyn HttpTransport>,
    pub kv: Arc<dyn DurableStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub notifier: Arc<dyn Notifier>,
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use super::*;
    use crate::auth::MemoryCredentialStore;
    use crate::capabilities::http::HttpHeaders;
    use crate::error::StoreError;
    use crate::notice::NullNotifier;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// How a [`ScriptedTransport`] answers a request.
    #[derive(Clone, Debug)]
    pub enum Reply {
        Status(u16, Value),
        /// No route to host.
        Offline,
        /// Never answers.
        Hang,
        /// Answers with the status once the gate is opened.
        Gated(Arc<Notify>, u16),
    }

    /// Transport that records every request and answers from a script of
    /// URL-substring rules, first match wins.
    pub struct ScriptedTransport {
        calls: Mutex<Vec<HttpRequest>>,
        rules: Mutex<Vec<(String, Reply)>>,
        default: Mutex<Reply>,
    }

    impl Default for ScriptedTransport {
        fn default() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                rules: Mutex::new(Vec::new()),
                default: Mutex::new(Reply::Status(200, json!({}))),
            }
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, url_contains: impl Into<String>, reply: Reply) {
            let pattern = url_contains.into();
            let mut rules = lock(&self.rules);
            rules.retain(|(p, _)| *p != pattern);
            rules.push((pattern, reply));
        }

        pub fn set_default(&self, reply: Reply) {
            *lock(&self.default) = reply;
        }

        pub fn calls(&self) -> Vec<HttpRequest> {
            lock(&self.calls).clone()
        }

        pub fn calls_to(&self, url_contains: &str) -> usize {
            lock(&self.calls)
                .iter()
                .filter(|r| r.url().as_str().contains(url_contains))
                .count()
        }

        fn reply_for(&self, request: &HttpRequest) -> Reply {
            let url = request.url().as_str();
            lock(&self.rules)
                .iter()
                .find(|(pattern, _)| url.contains(pattern.as_str()))
                .map(|(_, reply)| reply.clone())
                .unwrap_or_else(|| lock(&self.default).clone())
        }
    }

    fn response(status: u16, body: &Value, request: &HttpRequest) -> HttpResponse {
        let bytes = if body.is_null() {
            Vec::new()
        } else {
            serde_json::to_vec(body).unwrap_or_default()
        };
        HttpResponse::new(
            status,
            HttpHeaders::new(),
            bytes,
            request.request_id().to_string(),
        )
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
            let reply = self.reply_for(&request);
            lock(&self.calls).push(request.clone());

            match reply {
                Reply::Status(status, body) => Ok(response(status, &body, &request)),
                Reply::Offline => Err(HttpError::ConnectionError {
                    host: request.url().host_str().unwrap_or_default().to_string(),
                    message: "network is unreachable".to_string(),
                }),
                Reply::Hang => std::future::pending().await,
                Reply::Gated(gate, status) => {
                    gate.notified().await;
                    Ok(response(status, &json!({}), &request))
                }
            }
        }
    }

    /// In-memory store whose reads and writes can be made to fail.
    #[derive(Default)]
    pub struct FaultyStore {
        inner: MemoryStore,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    impl FaultyStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_reads(&self, fail: bool) {
            self.fail_reads.store(fail, Ordering::SeqCst);
        }

        pub fn fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }

        fn injected() -> StoreError {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected failure",
            ))
        }
    }

    #[async_trait]
    impl DurableStore for FaultyStore {
        async fn read(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StoreError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(Self::injected());
            }
            self.inner.read(key).await
        }

        async fn write(&self, key: &StorageKey, value: Vec<u8>) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Self::injected());
            }
            self.inner.write(key, value).await
        }

        async fn remove(&self, key: &StorageKey) -> Result<(), StoreError> {
            self.inner.remove(key).await
        }
    }

    pub fn mock_capabilities(online: bool) -> Capabilities {
        Capabilities {
            http: Arc::new(ScriptedTransport::new()),
            kv: Arc::new(MemoryStore::new()),
            credentials: Arc::new(MemoryCredentialStore::with_token("test-token")),
            connectivity: Arc::new(ConnectivityMonitor::new(online)),
            notifier: Arc::new(NullNotifier),
        }
    }
}
