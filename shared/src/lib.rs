//! Offline-first sync core for the maternal-vitals mobile client.
//!
//! Writes that fail while the device is offline are persisted in an outbox
//! and replayed against the five backend services once connectivity
//! returns. See [`SyncCore`] for the wired-up entry point.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod app;
pub mod auth;
pub mod capabilities;
pub mod codec;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod gateway;
pub mod merge;
pub mod model;
pub mod notice;
pub mod outbox;
pub mod router;
pub mod store;
pub mod sync;

use std::time::Duration;

pub use app::{SetupError, SyncCore};
pub use capabilities::Capabilities;
pub use config::{Backoff, OutboxConfig, RetryPolicy, RouterConfig, ServiceEndpoints, SyncConfig};
pub use error::{OutboxError, StoreError};
pub use gateway::{GatewayError, MutationGateway, MutationOutcome};
pub use model::{EnqueueRequest, QueueMethod, QueuedRequest, RequestId, ServiceToken, UnixTimeMs};
pub use notice::{Notice, Notifier};
pub use outbox::{DrainReport, EnqueueReceipt, Outbox, ReplayOutcome, ReplayResult};

pub const MAX_QUEUE_SIZE: usize = 50;
pub const MAX_STORAGE_BYTES: usize = 5 * 1024 * 1024;
pub const MAX_ATTEMPTS: u32 = 3;
pub const EXPIRY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const QUEUE_STORAGE_KEY: &str = "outbox:pending_requests";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::kv::StorageKey;

    #[test]
    fn test_storage_key_constant_matches() {
        assert_eq!(StorageKey::pending_requests().raw(), QUEUE_STORAGE_KEY);
    }
}
