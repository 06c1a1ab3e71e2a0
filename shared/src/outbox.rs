//! The outbox engine: durable enqueue of failed mutations and sequential
//! replay once connectivity returns.
//!
//! Every read-modify-write of the persisted queue runs under a single async
//! mutex, so concurrent `enqueue` calls cannot overwrite one another. A drain
//! takes the lock only to snapshot the queue and, after replaying outside the
//! lock, to fold the results back in by id. Writes that arrive during a
//! replay therefore survive it.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::http::{HttpError, HttpResponse};
use crate::codec;
use crate::config::OutboxConfig;
use crate::connectivity::Connectivity;
use crate::error::OutboxError;
use crate::merge::deep_merge;
use crate::model::{Clock, EnqueueRequest, QueueMethod, QueuedRequest, RequestId, SystemClock};
use crate::notice::{Notice, Notifier, NullNotifier};
use crate::store::QueueStore;

/// Sends one queued entry to its backend.
#[async_trait]
pub trait Replayer: Send + Sync {
    async fn replay(&self, entry: &QueuedRequest) -> Result<HttpResponse, HttpError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueReceipt {
    pub id: RequestId,
    /// The request was folded into an existing PATCH for the same resource.
    pub merged: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    Delivered { status: u16, response: Value },
    /// Failed, kept for the next drain.
    Retrying { attempts: u32, error: HttpError },
    /// Failed for the last allowed time and removed.
    Dropped { attempts: u32, error: HttpError },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayResult {
    pub id: RequestId,
    pub outcome: ReplayOutcome,
}

impl ReplayResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ReplayOutcome::Delivered { .. })
    }
}

/// Outcome of one drain cycle, one result per replayed entry in queue order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub results: Vec<ReplayResult>,
    /// Entries discarded unattempted because they outlived the expiry window.
    pub expired: Vec<RequestId>,
}

impl DrainReport {
    pub fn delivered_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn has_retryable(&self) -> bool {
        self.results
            .iter()
            .any(|r| matches!(r.outcome, ReplayOutcome::Retrying { .. }))
    }

    pub fn dropped(&self) -> impl Iterator<Item = &ReplayResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ReplayOutcome::Dropped { .. }))
    }

    /// Writes this cycle lost for good.
    pub fn failures(&self) -> Vec<OutboxError> {
        let exhausted = self.results.iter().filter_map(|r| match r.outcome {
            ReplayOutcome::Dropped { attempts, .. } => Some(OutboxError::MaxAttemptsExceeded {
                id: r.id.to_string(),
                attempts,
            }),
            _ => None,
        });
        let expired = self.expired.iter().map(|id| OutboxError::RequestExpired {
            id: id.to_string(),
        });
        exhausted.chain(expired).collect()
    }
}

/// Held for the duration of a drain; releases the flag on drop.
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// The entry still holds what was replayed: no PATCH was folded into it.
fn unchanged_since(current: &QueuedRequest, replayed: &QueuedRequest) -> bool {
    current.enqueued_at == replayed.enqueued_at
        && current.body == replayed.body
        && current.headers == replayed.headers
}

pub struct OutboxBuilder {
    store: QueueStore,
    replayer: Arc<dyn Replayer>,
    connectivity: Arc<dyn Connectivity>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
}

impl OutboxBuilder {
    #[must_use]
    pub fn config(mut self, config: OutboxConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn build(self) -> Result<Outbox, OutboxError> {
        self.config.validate()?;
        Ok(Outbox {
            store: self.store,
            replayer: self.replayer,
            connectivity: self.connectivity,
            notifier: self.notifier,
            clock: self.clock,
            config: self.config,
            write_lock: Mutex::new(()),
            draining: AtomicBool::new(false),
        })
    }
}

pub struct Outbox {
    store: QueueStore,
    replayer: Arc<dyn Replayer>,
    connectivity: Arc<dyn Connectivity>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
    write_lock: Mutex<()>,
    draining: AtomicBool,
}

impl Outbox {
    pub fn builder(
        store: QueueStore,
        replayer: Arc<dyn Replayer>,
        connectivity: Arc<dyn Connectivity>,
    ) -> OutboxBuilder {
        OutboxBuilder {
            store,
            replayer,
            connectivity,
            notifier: Arc::new(NullNotifier),
            clock: Arc::new(SystemClock),
            config: OutboxConfig::default(),
        }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Persists a failed mutation for later replay. A PATCH for a resource
    /// that already has one pending is merged into it instead of appended.
    #[instrument(skip(self, request), fields(method = %request.method, service = %request.service))]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueReceipt, OutboxError> {
        request.validate()?;

        let _write = self.write_lock.lock().await;
        let mut queue = self.store.try_load().await?;

        if queue.len() >= self.config.max_queue_size {
            warn!(len = queue.len(), "Outbox full, rejecting request");
            return Err(OutboxError::QueueFull {
                max: self.config.max_queue_size,
            });
        }

        let now = self.clock.now();
        let candidate = request.into_queued(RequestId::generate(), now);

        let separator = usize::from(!queue.is_empty());
        let projected = codec::document_size(&queue)?
            + codec::serialize(&candidate)?.len()
            + separator;
        if projected > self.config.max_storage_bytes {
            warn!(projected, "Outbox storage limit reached, rejecting request");
            return Err(OutboxError::StorageLimitExceeded {
                size: projected,
                max: self.config.max_storage_bytes,
            });
        }

        if candidate.method == QueueMethod::Patch {
            if let Some(existing) = queue
                .iter_mut()
                .find(|e| e.absorbs_patch(&candidate.url, candidate.service))
            {
                deep_merge(&mut existing.body, candidate.body);
                for (name, value) in candidate.headers {
                    existing.headers.retain(|k, _| !k.eq_ignore_ascii_case(&name));
                    existing.headers.insert(name, value);
                }
                existing.enqueued_at = now;
                let id = existing.id.clone();

                self.store.save(&queue).await?;
                info!(id = %id, "Merged PATCH into pending request");
                return Ok(EnqueueReceipt { id, merged: true });
            }
        }

        let id = candidate.id.clone();
        queue.push(candidate);
        self.store.save(&queue).await?;

        info!(id = %id, len = queue.len(), "Request queued");
        Ok(EnqueueReceipt { id, merged: false })
    }

    /// Replays every pending request once, oldest first. Any failure, 4xx
    /// included, costs the entry one attempt.
    ///
    /// Returns [`OutboxError::NetworkUnavailable`] without touching the
    /// queue when offline, and [`OutboxError::DrainInProgress`] when another
    /// drain is still running.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<DrainReport, OutboxError> {
        if !self.connectivity.is_online() {
            debug!("Offline, skipping drain");
            return Err(OutboxError::NetworkUnavailable);
        }
        let Some(_drain) = DrainGuard::acquire(&self.draining) else {
            debug!("Drain already running");
            return Err(OutboxError::DrainInProgress);
        };

        let (snapshot, expired) = self.remove_expired().await?;
        let mut report = DrainReport {
            results: Vec::with_capacity(snapshot.len()),
            expired,
        };

        for entry in &snapshot {
            let outcome = match self.replayer.replay(entry).await {
                Ok(response) => {
                    debug!(id = %entry.id, status = response.status(), "Replay delivered");
                    ReplayOutcome::Delivered {
                        status: response.status(),
                        response: response.body_value(),
                    }
                }
                Err(error) => {
                    let attempts = entry.attempts.saturating_add(1);
                    if self.config.retry.is_exhausted(attempts) {
                        warn!(id = %entry.id, attempts, error = %error, "Replay failed, dropping request");
                        ReplayOutcome::Dropped { attempts, error }
                    } else {
                        info!(id = %entry.id, attempts, error = %error, "Replay failed, will retry");
                        ReplayOutcome::Retrying { attempts, error }
                    }
                }
            };
            report.results.push(ReplayResult {
                id: entry.id.clone(),
                outcome,
            });
        }

        if !snapshot.is_empty() {
            self.apply_results(&snapshot, &report.results).await?;
        }

        if !report.expired.is_empty() {
            self.notifier.notify(Notice::RequestsExpired {
                count: report.expired.len(),
            });
        }
        let dropped = report.dropped().count();
        if dropped > 0 {
            self.notifier.notify(Notice::ReplayExhausted { count: dropped });
        }

        info!(
            replayed = report.results.len(),
            delivered = report.delivered_count(),
            dropped,
            expired = report.expired.len(),
            "Drain finished"
        );
        Ok(report)
    }

    async fn remove_expired(&self) -> Result<(Vec<QueuedRequest>, Vec<RequestId>), OutboxError> {
        let _write = self.write_lock.lock().await;
        let queue = self.store.try_load().await?;

        let now = self.clock.now();
        let window = self.config.expiry_window();
        let (expired, live): (Vec<_>, Vec<_>) =
            queue.into_iter().partition(|e| e.is_expired(now, window));

        if !expired.is_empty() {
            for entry in &expired {
                warn!(
                    id = %entry.id,
                    age_ms = now.since(entry.enqueued_at).as_millis() as u64,
                    "Discarding expired request"
                );
            }
            self.store.save(&live).await?;
        }

        Ok((live, expired.into_iter().map(|e| e.id).collect()))
    }

    async fn apply_results(
        &self,
        snapshot: &[QueuedRequest],
        results: &[ReplayResult],
    ) -> Result<(), OutboxError> {
        let _write = self.write_lock.lock().await;
        let mut queue = self.store.try_load().await?;

        for (replayed, result) in snapshot.iter().zip(results) {
            let Some(pos) = queue.iter().position(|e| e.id == replayed.id) else {
                continue;
            };
            match &result.outcome {
                ReplayOutcome::Delivered { .. } => {
                    if unchanged_since(&queue[pos], replayed) {
                        queue.remove(pos);
                    } else {
                        debug!(id = %replayed.id, "Request changed during replay, keeping it");
                    }
                }
                ReplayOutcome::Retrying { attempts, .. } => queue[pos].attempts = *attempts,
                ReplayOutcome::Dropped { .. } => {
                    queue.remove(pos);
                }
            }
        }

        self.store.save(&queue).await
    }

    /// Snapshot of the pending queue in replay order.
    pub async fn pending(&self) -> Vec<QueuedRequest> {
        let _write = self.write_lock.lock().await;
        self.store.load().await
    }

    pub async fn len(&self) -> usize {
        self.pending().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending().await.is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Discards every pending request, e.g. when the user signs out.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<(), OutboxError> {
        let _write = self.write_lock.lock().await;
        self.store.clear().await?;
        info!("Outbox cleared");
        Ok(())
    }
}
