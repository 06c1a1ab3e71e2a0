use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::connectivity::ConnectivityMonitor;
use crate::error::OutboxError;
use crate::outbox::{DrainReport, Outbox};

/// Drains the outbox whenever the device comes back online.
///
/// With an exponential backoff configured, a cycle that leaves retryable
/// entries behind is followed by another after the backoff delay, for at
/// most `max_attempts` cycles per reconnect. With no backoff the next
/// attempt waits for the next reconnect.
pub struct SyncWorker {
    outbox: Arc<Outbox>,
    connectivity: watch::Receiver<bool>,
}

impl SyncWorker {
    pub fn new(outbox: Arc<Outbox>, monitor: &ConnectivityMonitor) -> Self {
        Self {
            outbox,
            connectivity: monitor.subscribe(),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until the task is aborted.
    ///
    /// The monitor only publishes real transitions, so a change observed while
    /// online means the device came back at least once since the last look,
    /// even when an offline/online flap during a drain collapsed into one
    /// notification.
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        if *self.connectivity.borrow_and_update() {
            self.sync_until_settled().await;
        }

        while self.connectivity.changed().await.is_ok() {
            if *self.connectivity.borrow_and_update() {
                info!("Back online, draining outbox");
                self.sync_until_settled().await;
            }
        }
        debug!("Connectivity monitor gone, sync worker stopping");
    }

    /// Returns the report of the last drain that ran, if any.
    pub async fn sync_until_settled(&self) -> Option<DrainReport> {
        let retry = self.outbox.config().retry.clone();
        let mut last = None;

        for cycle in 0..retry.max_attempts {
            match self.outbox.drain().await {
                Ok(report) => {
                    let again = retry.backoff.is_enabled() && report.has_retryable();
                    last = Some(report);
                    if !again {
                        break;
                    }
                    let delay = retry.backoff.delay_for(cycle);
                    debug!(delay_ms = delay.as_millis() as u64, "Retryable entries left, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(OutboxError::NetworkUnavailable | OutboxError::DrainInProgress) => break,
                Err(e) => {
                    error!(error = %e, "Drain failed");
                    break;
                }
            }
        }
        last
    }
}
