//! User-facing signals raised by the sync core. The host renders them as
//! toasts or alerts; the core never blocks on delivery.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::model::{RequestId, ServiceToken};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// A write was saved for later; informational, neither success nor failure.
    Queued { id: RequestId },
    QueueFull { max: usize },
    StorageFull,
    /// Entries were dropped after exhausting their retries.
    ReplayExhausted { count: usize },
    /// Entries aged out before they could be replayed.
    RequestsExpired { count: usize },
    /// A 401 cleared the stored credential; the user must sign in again.
    SessionExpired,
    Alert {
        service: ServiceToken,
        status: u16,
        message: String,
    },
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Notice::Queued { .. } => {
                "You're offline. Your changes were saved and will sync when you reconnect.".into()
            }
            Notice::QueueFull { max } => format!(
                "Too many changes are waiting to sync ({max}). This change could not be saved."
            ),
            Notice::StorageFull => {
                "Offline storage is full. This change could not be saved.".into()
            }
            Notice::ReplayExhausted { count } => format!(
                "{count} action(s) failed after max retries and were removed."
            ),
            Notice::RequestsExpired { count } => format!(
                "{count} offline action(s) were too old to sync and were discarded."
            ),
            Notice::SessionExpired => "Your session has expired. Please sign in again.".into(),
            Notice::Alert { status, message, .. } => match status {
                403 => "You don't have permission to do that.".into(),
                404 => "The requested item was not found.".into(),
                _ if message.is_empty() => "Something went wrong. Please try again later.".into(),
                _ => message.clone(),
            },
        }
    }

    /// Whether the notice reports lost work rather than information.
    pub fn is_error(&self) -> bool {
        !matches!(self, Notice::Queued { .. })
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, notice: Notice) {
        debug!(?notice, "Notice dropped, no notifier installed");
    }
}

/// Forwards notices to a channel the host drains on its UI thread.
#[derive(Clone, Debug)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notice: Notice) {
        if self.tx.send(notice).is_err() {
            debug!("Notice receiver dropped");
        }
    }
}
