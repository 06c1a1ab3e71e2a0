//! Wires the host's capabilities into one router, one outbox and one
//! gateway, shared by every screen.

use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

use crate::auth::CredentialStore;
use crate::capabilities::http::HttpError;
use crate::capabilities::Capabilities;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::OutboxError;
use crate::gateway::MutationGateway;
use crate::model::{Clock, SystemClock};
use crate::outbox::Outbox;
use crate::router::ServiceRouter;
use crate::store::QueueStore;
use crate::sync::SyncWorker;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("router configuration: {0}")]
    Router(#[from] HttpError),

    #[error("outbox configuration: {0}")]
    Outbox(#[from] OutboxError),
}

pub struct SyncCore {
    router: Arc<ServiceRouter>,
    outbox: Arc<Outbox>,
    gateway: MutationGateway,
    connectivity: Arc<ConnectivityMonitor>,
    credentials: Arc<dyn CredentialStore>,
}

impl SyncCore {
    pub fn new(capabilities: Capabilities, config: &SyncConfig) -> Result<Self, SetupError> {
        Self::with_clock(capabilities, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        capabilities: Capabilities,
        config: &SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SetupError> {
        let Capabilities {
            http,
            kv,
            credentials,
            connectivity,
            notifier,
        } = capabilities;

        let router = Arc::new(ServiceRouter::new(
            &config.router,
            http,
            Arc::clone(&credentials),
            Arc::clone(&notifier),
        )?);

        let outbox = Arc::new(
            Outbox::builder(QueueStore::new(kv), router.clone(), connectivity.clone())
                .config(config.outbox.clone())
                .clock(clock)
                .notifier(Arc::clone(&notifier))
                .build()?,
        );

        let gateway = MutationGateway::new(
            Arc::clone(&router),
            Arc::clone(&outbox),
            connectivity.clone(),
            notifier,
        );

        info!("Sync core ready");
        Ok(Self {
            router,
            outbox,
            gateway,
            connectivity,
            credentials,
        })
    }

    pub fn gateway(&self) -> &MutationGateway {
        &self.gateway
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn router(&self) -> &Arc<ServiceRouter> {
        &self.router
    }

    /// Forwarded from the host's network observer.
    pub fn set_online(&self, online: bool) -> bool {
        self.connectivity.set_online(online)
    }

    /// Starts the background worker that drains on reconnect.
    pub fn start_sync(&self) -> JoinHandle<()> {
        SyncWorker::new(Arc::clone(&self.outbox), &self.connectivity).spawn()
    }

    /// Forgets the credential and any writes still waiting for the network.
    pub async fn sign_out(&self) -> Result<(), OutboxError> {
        self.credentials.clear().await;
        self.outbox.clear().await
    }
}
