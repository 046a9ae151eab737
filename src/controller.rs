//! Controller: owns the registry of in-flight prompts.
//!
//! Each dispatched prompt gets a fresh request id and a pending entry holding
//! the caller's completion handle. Results come back asynchronously through a
//! [`ResultSink`] and are matched purely by request id, in whatever order they
//! arrive. A pending entry is removed exactly once: on its result, on a
//! delivery failure, on timeout, or on cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::RelaySection;
use crate::envelope::{PromptEnvelope, RequestId, ResultEnvelope};
use crate::error::RelayError;
use crate::page::{check_eligible, PageId, PageLocator};
use crate::response::ParsedResult;
use crate::transport::{BridgeTransport, TransportError};

type Outcome = Result<ParsedResult, RelayError>;

/// Where bridges send results bound for the Controller.
#[derive(Clone)]
pub struct ResultSink {
    tx: mpsc::UnboundedSender<ResultEnvelope>,
}

impl ResultSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ResultEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false if the receiving side is gone.
    pub fn deliver(&self, envelope: ResultEnvelope) -> bool {
        self.tx.send(envelope).is_ok()
    }
}

struct PendingRequest {
    page: PageId,
    resolver: oneshot::Sender<Outcome>,
}

/// Request id → pending caller.
#[derive(Clone, Default)]
pub struct PendingRegistry {
    inner: Arc<Mutex<HashMap<RequestId, PendingRequest>>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, id: RequestId, page: PageId) -> oneshot::Receiver<Outcome> {
        let (resolver, rx) = oneshot::channel();
        let previous = self
            .inner
            .lock()
            .insert(id.clone(), PendingRequest { page, resolver });
        debug_assert!(previous.is_none(), "request id {id} reused while pending");
        rx
    }

    /// Complete the caller waiting on `envelope.request_id`. Unknown ids are
    /// dropped. Returns whether a caller was found.
    pub fn resolve(&self, envelope: ResultEnvelope) -> bool {
        let Some(pending) = self.inner.lock().remove(&envelope.request_id) else {
            tracing::debug!(request_id = %envelope.request_id, "dropping result for unknown request");
            return false;
        };
        tracing::debug!(request_id = %envelope.request_id, page = %pending.page, success = envelope.success, "resolving request");
        let outcome = envelope.into_outcome().map_err(RelayError::PageFailure);
        // The caller may have gone away (dropped future); nothing to do then.
        let _ = pending.resolver.send(outcome);
        true
    }

    pub fn remove(&self, id: &RequestId) -> bool {
        self.inner.lock().remove(id).is_some()
    }

    /// Fail every pending request with [`RelayError::Cancelled`].
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingRequest> = self.inner.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.resolver.send(Err(RelayError::Cancelled));
        }
        count
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.inner.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAII guard that removes a pending entry when the dispatch ends, however it
/// ends. Removal after a result already resolved the entry is a no-op.
struct PendingGuard<'a> {
    registry: &'a PendingRegistry,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

struct ControllerInner {
    locator: Arc<dyn PageLocator>,
    transport: Arc<dyn BridgeTransport>,
    registry: PendingRegistry,
    next_seq: AtomicU64,
    request_timeout: Duration,
    allowed_schemes: Vec<String>,
    sink: ResultSink,
    shutdown: CancellationToken,
}

/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    /// Create a controller and spawn the task that applies incoming results.
    pub fn spawn(
        locator: Arc<dyn PageLocator>,
        transport: Arc<dyn BridgeTransport>,
        settings: &RelaySection,
    ) -> Self {
        let (sink, mut results) = ResultSink::channel();
        let registry = PendingRegistry::new();
        let shutdown = CancellationToken::new();

        let listener_registry = registry.clone();
        let listener_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = listener_shutdown.cancelled() => break,
                    next = results.recv() => match next {
                        Some(envelope) => {
                            listener_registry.resolve(envelope);
                        }
                        None => break,
                    },
                }
            }
            let cancelled = listener_registry.cancel_all();
            tracing::debug!(cancelled, "controller result listener stopped");
        });

        Self {
            inner: Arc::new(ControllerInner {
                locator,
                transport,
                registry,
                next_seq: AtomicU64::new(1),
                request_timeout: settings.request_timeout(),
                allowed_schemes: settings.allowed_schemes.clone(),
                sink,
                shutdown,
            }),
        }
    }

    /// Sink to hand to bridges so their results reach this controller.
    pub fn result_sink(&self) -> ResultSink {
        self.inner.sink.clone()
    }

    /// Apply one result directly. Unknown or repeated ids are ignored.
    pub fn on_result(&self, envelope: ResultEnvelope) {
        self.inner.registry.resolve(envelope);
    }

    /// Relay `prompt_text` to the current page and wait for its result.
    pub async fn dispatch_prompt(
        &self,
        prompt_text: &str,
        system_prompt_key: Option<&str>,
    ) -> Result<ParsedResult, RelayError> {
        self.dispatch_prompt_with_cancel(prompt_text, system_prompt_key, CancellationToken::new())
            .await
    }

    /// Like [`Controller::dispatch_prompt`], abandoning the request when
    /// `cancel` fires.
    pub async fn dispatch_prompt_with_cancel(
        &self,
        prompt_text: &str,
        system_prompt_key: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<ParsedResult, RelayError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        let page = check_eligible(self.inner.locator.current_page(), &self.inner.allowed_schemes)?;

        let request_id = self.next_request_id();
        let rx = self.inner.registry.register(request_id.clone(), page.id);
        let _guard = PendingGuard {
            registry: &self.inner.registry,
            id: request_id.clone(),
        };

        tracing::info!(request_id = %request_id, page = %page.id, "dispatching prompt");
        let envelope = PromptEnvelope::new(request_id.clone(), prompt_text, system_prompt_key);
        if let Err(e) = self.inner.transport.deliver(page.id, envelope).await {
            tracing::warn!(request_id = %request_id, page = %page.id, error = %e, "prompt delivery failed");
            return Err(match e {
                TransportError::Unreachable(detail) => RelayError::BridgeUnreachable(detail),
                TransportError::Rejected(detail) => RelayError::RelayRejected(detail),
            });
        }

        let timeout = self.inner.request_timeout;
        tokio::select! {
            outcome = tokio::time::timeout(timeout, rx) => match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(RelayError::Cancelled),
                Err(_) => {
                    tracing::warn!(request_id = %request_id, timeout_secs = timeout.as_secs(), "prompt timed out");
                    Err(RelayError::Timeout(timeout))
                }
            },
            _ = cancel.cancelled() => {
                tracing::info!(request_id = %request_id, "prompt cancelled by caller");
                Err(RelayError::Cancelled)
            }
            // Covers a shutdown that landed after the check above but before
            // the entry was registered, which `cancel_all` never saw.
            _ = self.inner.shutdown.cancelled() => Err(RelayError::Cancelled),
        }
    }

    /// Number of requests awaiting a result.
    pub fn pending(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.inner.registry.contains(id)
    }

    /// Stop applying results and fail every pending request.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Monotonic sequence plus a random suffix, e.g. `req-7-3fa85f64`.
    fn next_request_id(&self) -> RequestId {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let salt: u32 = rand::random();
        RequestId::new(format!("req-{seq}-{salt:08x}"))
    }
}
