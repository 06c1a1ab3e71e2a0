//! The single entry point screens use for backend calls. Writes that fail
//! for lack of a network while offline are handed to the outbox and come
//! back as [`MutationOutcome::Queued`] instead of an error.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::capabilities::http::{HttpError, HttpMethod, HttpResponse};
use crate::connectivity::Connectivity;
use crate::error::OutboxError;
use crate::model::{EnqueueRequest, QueueMethod, RequestId, ServiceToken};
use crate::notice::{Notice, Notifier};
use crate::outbox::Outbox;
use crate::router::ServiceRouter;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

impl GatewayError {
    /// The write neither reached the server nor made it into the outbox.
    pub fn is_write_lost(&self) -> bool {
        match self {
            GatewayError::Outbox(e) => e.is_write_lost(),
            GatewayError::Http(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Completed(HttpResponse),
    /// Saved for replay; show an informational notice, not success or failure.
    Queued { id: RequestId, merged: bool },
}

impl MutationOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, MutationOutcome::Queued { .. })
    }

    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            MutationOutcome::Completed(response) => Some(response),
            MutationOutcome::Queued { .. } => None,
        }
    }
}

pub struct MutationGateway {
    router: Arc<ServiceRouter>,
    outbox: Arc<Outbox>,
    connectivity: Arc<dyn Connectivity>,
    notifier: Arc<dyn Notifier>,
}

impl MutationGateway {
    pub fn new(
        router: Arc<ServiceRouter>,
        outbox: Arc<Outbox>,
        connectivity: Arc<dyn Connectivity>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            router,
            outbox,
            connectivity,
            notifier,
        }
    }

    /// Performs a write, queueing it when the network is unreachable and the
    /// device is offline.
    #[instrument(skip(self, request), fields(method = %request.method, service = %request.service, url = %request.url))]
    pub async fn mutate(&self, request: EnqueueRequest) -> Result<MutationOutcome, GatewayError> {
        request.validate()?;

        let result = self
            .router
            .call(
                request.service,
                request.method.into(),
                &request.url,
                &request.headers,
                request.body.clone(),
            )
            .await;

        match result {
            Ok(response) => Ok(MutationOutcome::Completed(response)),
            Err(e) if e.is_network() && !self.connectivity.is_online() => {
                info!(error = %e, "Offline, queueing write");
                self.queue(request).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reads are never queued.
    pub async fn fetch(
        &self,
        service: ServiceToken,
        path: &str,
    ) -> Result<HttpResponse, GatewayError> {
        Ok(self
            .router
            .call(service, HttpMethod::Get, path, &BTreeMap::new(), Value::Null)
            .await?)
    }

    /// Dispatches any verb: reads go to `fetch`, queueable writes to
    /// `mutate`, anything else straight to the network.
    pub async fn request(
        &self,
        method: HttpMethod,
        service: ServiceToken,
        path: &str,
        body: Value,
    ) -> Result<MutationOutcome, GatewayError> {
        if method == HttpMethod::Get {
            return Ok(MutationOutcome::Completed(self.fetch(service, path).await?));
        }
        match QueueMethod::try_from(method) {
            Ok(queue_method) => {
                self.mutate(EnqueueRequest::new(queue_method, service, path).with_body(body))
                    .await
            }
            Err(_) => {
                let response = self
                    .router
                    .call(service, method, path, &BTreeMap::new(), body)
                    .await?;
                Ok(MutationOutcome::Completed(response))
            }
        }
    }

    async fn queue(&self, request: EnqueueRequest) -> Result<MutationOutcome, GatewayError> {
        match self.outbox.enqueue(request).await {
            Ok(receipt) => {
                self.notifier.notify(Notice::Queued {
                    id: receipt.id.clone(),
                });
                Ok(MutationOutcome::Queued {
                    id: receipt.id,
                    merged: receipt.merged,
                })
            }
            Err(e) => {
                warn!(error = %e, "Could not queue write, it is lost");
                match &e {
                    OutboxError::QueueFull { max } => {
                        self.notifier.notify(Notice::QueueFull { max: *max });
                    }
                    OutboxError::StorageLimitExceeded { .. } => {
                        self.notifier.notify(Notice::StorageFull);
                    }
                    _ => {}
                }
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialStore;
    use crate::capabilities::kv::MemoryStore;
    use crate::capabilities::testing::{Reply, ScriptedTransport};
    use crate::config::{OutboxConfig, RouterConfig, ServiceEndpoints};
    use crate::connectivity::ConnectivityMonitor;
    use crate::notice::ChannelNotifier;
    use crate::store::QueueStore;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        gateway: MutationGateway,
        outbox: Arc<Outbox>,
        transport: Arc<ScriptedTransport>,
        connectivity: Arc<ConnectivityMonitor>,
        notices: mpsc::UnboundedReceiver<Notice>,
    }

    fn fixture_with(config: OutboxConfig) -> Fixture {
        let transport = Arc::new(ScriptedTransport::new());
        let connectivity = Arc::new(ConnectivityMonitor::new(true));
        let (notifier, notices) = ChannelNotifier::new();
        let notifier: Arc<dyn Notifier> = Arc::new(notifier);

        let router = Arc::new(
            ServiceRouter::new(
                &RouterConfig::new(ServiceEndpoints {
                    account: "https://aas.example.com".into(),
                    data_logging: "https://dls.example.com".into(),
                    alerts: "https://ans.example.com".into(),
                    insights: "https://ais.example.com".into(),
                    education: "https://hes.example.com".into(),
                }),
                transport.clone(),
                Arc::new(MemoryCredentialStore::with_token("tok")),
                notifier.clone(),
            )
            .unwrap(),
        );
        let outbox = Arc::new(
            Outbox::builder(
                QueueStore::new(Arc::new(MemoryStore::new())),
                router.clone(),
                connectivity.clone(),
            )
            .config(config)
            .notifier(notifier.clone())
            .build()
            .unwrap(),
        );

        Fixture {
            gateway: MutationGateway::new(router, outbox.clone(), connectivity.clone(), notifier),
            outbox,
            transport,
            connectivity,
            notices,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(OutboxConfig::default())
    }

    fn go_offline(f: &Fixture) {
        f.connectivity.set_online(false);
        f.transport.set_default(Reply::Offline);
    }

    #[tokio::test]
    async fn test_online_write_completes() {
        let f = fixture();
        let outcome = f
            .gateway
            .mutate(EnqueueRequest::post(ServiceToken::DataLogging, "/vitals", json!({"bpm": 80})))
            .await
            .unwrap();
        assert!(!outcome.is_queued());
        assert_eq!(outcome.response().unwrap().status(), 200);
        assert!(f.outbox.is_empty().await);
    }

    #[tokio::test]
    async fn test_offline_write_is_queued() {
        let mut f = fixture();
        go_offline(&f);

        let outcome = f
            .gateway
            .mutate(EnqueueRequest::patch(ServiceToken::Account, "/profiles/1", json!({"name": "A"})))
            .await
            .unwrap();

        let MutationOutcome::Queued { id, merged } = outcome else {
            panic!("expected queued outcome");
        };
        assert!(!merged);
        assert_eq!(f.outbox.pending().await[0].id, id);
        assert_eq!(f.notices.recv().await, Some(Notice::Queued { id }));
    }

    #[tokio::test]
    async fn test_offline_patches_merge() {
        let f = fixture();
        go_offline(&f);

        f.gateway
            .mutate(EnqueueRequest::patch(ServiceToken::Account, "/profiles/1", json!({"name": "A"})))
            .await
            .unwrap();
        let outcome = f
            .gateway
            .mutate(EnqueueRequest::patch(ServiceToken::Account, "/profiles/1", json!({"age": 30})))
            .await
            .unwrap();

        assert!(matches!(outcome, MutationOutcome::Queued { merged: true, .. }));
        let queue = f.outbox.pending().await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].body, json!({"name": "A", "age": 30}));
    }

    #[tokio::test]
    async fn test_network_error_while_online_is_not_queued() {
        let f = fixture();
        f.transport.set_default(Reply::Offline);

        let result = f
            .gateway
            .mutate(EnqueueRequest::delete(ServiceToken::Alerts, "/alerts/1"))
            .await;
        assert!(matches!(result, Err(GatewayError::Http(ref e)) if e.is_network()));
        assert!(f.outbox.is_empty().await);
    }

    #[tokio::test]
    async fn test_server_error_is_not_queued() {
        let mut f = fixture();
        f.transport.set_default(Reply::Status(500, json!({"message": "boom"})));

        let result = f
            .gateway
            .mutate(EnqueueRequest::post(ServiceToken::Insights, "/insights", json!({})))
            .await;
        assert!(matches!(result, Err(GatewayError::Http(_))));
        assert!(f.outbox.is_empty().await);
        assert!(matches!(
            f.notices.recv().await,
            Some(Notice::Alert { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_full_outbox_loses_write_and_notifies() {
        let mut f = fixture_with(OutboxConfig {
            max_queue_size: 1,
            ..Default::default()
        });
        go_offline(&f);

        f.gateway
            .mutate(EnqueueRequest::post(ServiceToken::DataLogging, "/vitals", json!({"bpm": 1})))
            .await
            .unwrap();
        let err = f
            .gateway
            .mutate(EnqueueRequest::post(ServiceToken::DataLogging, "/vitals", json!({"bpm": 2})))
            .await
            .unwrap_err();

        assert!(err.is_write_lost());
        assert!(matches!(f.notices.recv().await, Some(Notice::Queued { .. })));
        assert_eq!(f.notices.recv().await, Some(Notice::QueueFull { max: 1 }));
    }

    #[tokio::test]
    async fn test_reads_are_never_queued() {
        let f = fixture();
        go_offline(&f);

        let result = f.gateway.fetch(ServiceToken::Education, "/articles").await;
        assert!(result.is_err());

        let result = f
            .gateway
            .request(HttpMethod::Get, ServiceToken::Education, "/articles", Value::Null)
            .await;
        assert!(result.is_err());
        assert!(f.outbox.is_empty().await);
    }

    #[tokio::test]
    async fn test_request_dispatches_by_verb() {
        let f = fixture();
        go_offline(&f);

        let outcome = f
            .gateway
            .request(HttpMethod::Delete, ServiceToken::DataLogging, "/vitals/4", Value::Null)
            .await
            .unwrap();
        assert!(outcome.is_queued());

        let result = f
            .gateway
            .request(HttpMethod::Put, ServiceToken::DataLogging, "/vitals/4", json!({}))
            .await;
        assert!(matches!(result, Err(GatewayError::Http(_))));
        assert_eq!(f.outbox.len().await, 1);
    }
}
