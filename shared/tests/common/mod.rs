#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use vitals_sync::auth::MemoryCredentialStore;
use vitals_sync::capabilities::http::{
    HttpError, HttpHeaders, HttpRequest, HttpResponse, HttpTransport,
};
use vitals_sync::capabilities::kv::DurableStore;
use vitals_sync::capabilities::Capabilities;
use vitals_sync::connectivity::ConnectivityMonitor;
use vitals_sync::model::{ManualClock, UnixTimeMs};
use vitals_sync::notice::ChannelNotifier;
use vitals_sync::{Notice, ServiceEndpoints, SyncConfig, SyncCore};

pub const START: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

/// Stand-in for the five backend services.
#[derive(Default)]
pub struct FakeBackend {
    unreachable: AtomicBool,
    failing_paths: Mutex<Vec<String>>,
    calls: Mutex<Vec<HttpRequest>>,
}

impl FakeBackend {
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Requests whose URL contains `path` answer 500.
    pub fn fail_path(&self, path: &str) {
        self.failing_paths.lock().unwrap().push(path.to_string());
    }

    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url().path().ends_with(path))
            .count()
    }
}

#[async_trait]
impl HttpTransport for FakeBackend {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(HttpError::ConnectionError {
                host: request.url().host_str().unwrap_or_default().to_string(),
                message: "network is unreachable".into(),
            });
        }

        self.calls.lock().unwrap().push(request.clone());
        let url = request.url().as_str().to_string();
        let failing = self
            .failing_paths
            .lock()
            .unwrap()
            .iter()
            .any(|p| url.contains(p.as_str()));
        let (status, body) = if failing {
            (500, br#"{"message":"internal error"}"#.to_vec())
        } else {
            (200, br#"{"ok":true}"#.to_vec())
        };
        Ok(HttpResponse::new(
            status,
            HttpHeaders::new(),
            body,
            request.request_id().to_string(),
        ))
    }
}

pub struct Harness {
    pub core: SyncCore,
    pub backend: Arc<FakeBackend>,
    pub clock: Arc<ManualClock>,
    pub notices: mpsc::UnboundedReceiver<Notice>,
}

impl Harness {
    pub fn go_offline(&self) {
        self.core.set_online(false);
        self.backend.set_reachable(false);
    }

    pub fn go_online(&self) {
        self.backend.set_reachable(true);
        self.core.set_online(true);
    }

    pub fn notices(&mut self) -> Vec<Notice> {
        let mut out = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            out.push(notice);
        }
        out
    }
}

pub fn config() -> SyncConfig {
    SyncConfig::new(ServiceEndpoints {
        account: "https://aas.example.com/api".into(),
        data_logging: "https://dls.example.com/api".into(),
        alerts: "https://ans.example.com/api".into(),
        insights: "https://ais.example.com/api".into(),
        education: "https://hes.example.com/api".into(),
    })
}

pub fn harness(kv: Arc<dyn DurableStore>) -> Harness {
    let backend = Arc::new(FakeBackend::default());
    let clock = Arc::new(ManualClock::new(START));
    let (notifier, notices) = ChannelNotifier::new();

    let capabilities = Capabilities {
        http: backend.clone(),
        kv,
        credentials: Arc::new(MemoryCredentialStore::with_token("session-token")),
        connectivity: Arc::new(ConnectivityMonitor::new(true)),
        notifier: Arc::new(notifier),
    };
    let core = SyncCore::with_clock(capabilities, &config(), clock.clone()).unwrap();

    Harness {
        core,
        backend,
        clock,
        notices,
    }
}
