//! Session Host: owns language-model sessions inside the page world.
//!
//! Sessions are cached per system prompt and reused across prompts. Each key
//! moves `Uninitialized → Ready → Destroyed`; a failed creation leaves the key
//! uninitialized so the next prompt retries. Concurrent first use of one key
//! shares a single in-flight creation.
//!
//! Unloading is final. A creation that completes after [`SessionHost::unload`]
//! destroys its session straight away instead of caching it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::envelope::{session_key, Envelope, PromptEnvelope, ResultEnvelope};
use crate::error::{CapabilityCause, RelayError};
use crate::model::{Availability, LanguageModel, SessionConfig, SessionHandle};
use crate::page::{classify_scheme, PageKind};
use crate::page_channel::{Namespace, PageChannel};
use crate::response::{parse_model_output, ParsedResult};

/// Message posted back when a request is missing its id or prompt.
const INVALID_PAYLOAD: &str = "Invalid prompt payload";

const UNLOADED: &str = "the page has been unloaded";

/// One cache entry. `released` makes destruction happen at most once, whether
/// `unload` or a late creator gets to it first.
#[derive(Default)]
struct SessionSlot {
    cell: OnceCell<SessionHandle>,
    released: AtomicBool,
}

impl SessionSlot {
    fn release(&self) {
        let Some(session) = self.cell.get() else {
            return;
        };
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = session.destroy() {
            tracing::debug!(error = %e, "ignoring session destroy failure");
        }
    }
}

struct HostInner {
    page_url: String,
    capability: Option<Arc<dyn LanguageModel>>,
    sessions: Mutex<HashMap<String, Arc<SessionSlot>>>,
    unloaded: AtomicBool,
}

/// Cheap to clone; clones share the session cache.
#[derive(Clone)]
pub struct SessionHost {
    inner: Arc<HostInner>,
}

impl std::fmt::Debug for SessionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHost")
            .field("page_url", &self.inner.page_url)
            .field("capability", &self.inner.capability.is_some())
            .field("sessions", &self.session_count())
            .finish()
    }
}

impl SessionHost {
    /// `capability` is `None` when the page world does not expose the
    /// language-model API at all.
    pub fn new(page_url: impl Into<String>, capability: Option<Arc<dyn LanguageModel>>) -> Self {
        Self {
            inner: Arc::new(HostInner {
                page_url: page_url.into(),
                capability,
                sessions: Mutex::new(HashMap::new()),
                unloaded: AtomicBool::new(false),
            }),
        }
    }

    pub fn page_url(&self) -> &str {
        &self.inner.page_url
    }

    pub fn is_unloaded(&self) -> bool {
        self.inner.unloaded.load(Ordering::SeqCst)
    }

    /// Return the cached session for `system_prompt`, creating it on first use.
    pub async fn resolve_session(
        &self,
        system_prompt: Option<&str>,
    ) -> Result<SessionHandle, RelayError> {
        if self.is_unloaded() {
            return Err(RelayError::SessionExecutionFailure(UNLOADED.into()));
        }

        let key = session_key(system_prompt).to_string();
        let slot = {
            let mut sessions = self.inner.sessions.lock();
            sessions.entry(key.clone()).or_default().clone()
        };

        let mut created_here = false;
        let created_flag = &mut created_here;
        let key_ref = key.as_str();
        let session = slot
            .cell
            .get_or_try_init(|| async move {
                let session = self.create_session(key_ref, system_prompt).await?;
                *created_flag = true;
                Ok::<_, RelayError>(session)
            })
            .await?
            .clone();

        // `unload` may have drained the cache while this creation was in
        // flight, in which case it never saw the session.
        if created_here && self.is_unloaded() {
            slot.release();
            return Err(RelayError::SessionExecutionFailure(UNLOADED.into()));
        }
        Ok(session)
    }

    async fn create_session(
        &self,
        key: &str,
        system_prompt: Option<&str>,
    ) -> Result<SessionHandle, RelayError> {
        let Some(model) = self.inner.capability.as_ref() else {
            let cause = missing_api_cause(&self.inner.page_url);
            tracing::warn!(page = %self.inner.page_url, ?cause, "language model API not exposed");
            return Err(RelayError::CapabilityUnavailable(cause));
        };

        if model.availability().await == Availability::Unavailable {
            return Err(RelayError::CapabilityUnavailable(
                CapabilityCause::ModelNotProvisioned,
            ));
        }

        let config = SessionConfig {
            system_prompt: system_prompt.filter(|p| !p.is_empty()).map(str::to_string),
        };
        let session = model
            .create(config)
            .await
            .map_err(|e| RelayError::SessionExecutionFailure(e.to_string()))?;
        tracing::debug!(key_len = key.len(), "created language model session");
        Ok(session)
    }

    /// Prompt `session` and normalize its reply. Only a failure of the
    /// session call itself is an error; unparseable output is not.
    pub async fn execute(
        &self,
        session: &SessionHandle,
        prompt_text: &str,
    ) -> Result<ParsedResult, RelayError> {
        let raw = session
            .prompt(prompt_text)
            .await
            .map_err(|e| RelayError::SessionExecutionFailure(e.to_string()))?;
        Ok(parse_model_output(&raw))
    }

    /// Serve one request end to end. Every failure becomes a failure envelope.
    pub async fn handle_request(&self, envelope: PromptEnvelope) -> ResultEnvelope {
        if let Err(reason) = envelope.validate() {
            tracing::debug!(request_id = %envelope.request_id, reason = %reason, "rejecting prompt payload");
            return ResultEnvelope::failure(envelope.request_id, INVALID_PAYLOAD);
        }

        let outcome = async {
            let session = self
                .resolve_session(envelope.system_prompt_key.as_deref())
                .await?;
            self.execute(&session, &envelope.prompt_text).await
        }
        .await;

        match outcome {
            Ok(parsed) => ResultEnvelope::success(envelope.request_id, parsed),
            Err(e) => {
                tracing::info!(request_id = %envelope.request_id, code = e.code(), error = %e, "prompt failed in page");
                ResultEnvelope::failure(envelope.request_id, e.to_string())
            }
        }
    }

    /// Number of sessions currently in the `Ready` state.
    pub fn session_count(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .values()
            .filter(|slot| slot.cell.initialized())
            .count()
    }

    /// Release every session and refuse new ones. Best-effort: destroy
    /// failures are discarded.
    pub fn unload(&self) {
        self.inner.unloaded.store(true, Ordering::SeqCst);
        let drained: Vec<Arc<SessionSlot>> =
            self.inner.sessions.lock().drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            slot.release();
        }
    }

    /// Start listening for prompt requests on `channel`.
    ///
    /// The subscription is registered before this returns, so a request posted
    /// right after spawning is not missed. Each request runs in its own task.
    /// When `cancel` fires the listener aborts the requests still running,
    /// then releases all sessions.
    pub fn spawn(&self, channel: PageChannel, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let mut requests = channel.subscribe(Namespace::Extension);
        let host = self.clone();

        tokio::spawn(async move {
            let mut in_flight = JoinSet::new();
            loop {
                let envelope = tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
                    next = requests.recv() => match next {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };

                let Envelope::PromptRequest(request) = envelope else {
                    continue;
                };

                let host = host.clone();
                let channel = channel.clone();
                in_flight.spawn(async move {
                    let result = host.handle_request(request).await;
                    channel.post_top_level(Namespace::Page, Envelope::PromptResult(result));
                });
            }
            in_flight.shutdown().await;
            host.unload();
            tracing::debug!(page = %host.inner.page_url, "session host stopped");
        })
    }
}

fn missing_api_cause(page_url: &str) -> CapabilityCause {
    match classify_scheme(page_url) {
        PageKind::Internal => CapabilityCause::InternalPage,
        PageKind::Other => CapabilityCause::UnsupportedScheme,
        PageKind::Web => CapabilityCause::FeatureDisabled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::RequestId;
    use crate::model::ScriptedModel;
    use std::time::Duration;

    const FENCED: &str = "```json\n{\"action\":\"summarize\",\"title\":\"T\",\"content\":\"C\",\"tags\":[],\"keyPoints\":[]}\n```";

    fn host_with(model: &ScriptedModel) -> SessionHost {
        SessionHost::new("https://example.com/article", Some(Arc::new(model.clone())))
    }

    fn request(id: &str, prompt: &str, system: Option<&str>) -> PromptEnvelope {
        PromptEnvelope::new(RequestId::new(id), prompt, system)
    }

    #[tokio::test]
    async fn sequential_resolves_reuse_one_session() {
        let model = ScriptedModel::echo();
        let host = host_with(&model);

        let a = host.resolve_session(Some("sys")).await.unwrap();
        let b = host.resolve_session(Some("sys")).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(model.created(), 1);
        assert_eq!(host.session_count(), 1);
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_sessions() {
        let model = ScriptedModel::echo();
        let host = host_with(&model);

        host.resolve_session(Some("one")).await.unwrap();
        host.resolve_session(Some("two")).await.unwrap();
        host.resolve_session(None).await.unwrap();

        assert_eq!(model.created(), 3);
        assert_eq!(
            model.system_prompts(),
            vec![Some("one".to_string()), Some("two".to_string()), None]
        );
    }

    #[tokio::test]
    async fn concurrent_first_use_creates_once() {
        let model = ScriptedModel::echo().with_create_delay(Duration::from_millis(50));
        let host = host_with(&model);

        let (a, b, c) = tokio::join!(
            host.resolve_session(Some("k")),
            host.resolve_session(Some("k")),
            host.resolve_session(Some("k")),
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(model.created(), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));
    }

    #[tokio::test]
    async fn failed_creation_is_not_cached() {
        let model = ScriptedModel::echo();
        model.fail_next_create("still loading");
        let host = host_with(&model);

        let err = host.resolve_session(None).await.err().unwrap();
        assert!(matches!(err, RelayError::SessionExecutionFailure(_)));
        assert_eq!(host.session_count(), 0);

        host.resolve_session(None).await.unwrap();
        assert_eq!(model.created(), 1);
    }

    #[tokio::test]
    async fn missing_api_cause_depends_on_page() {
        let cases = [
            ("chrome://settings", CapabilityCause::InternalPage),
            ("chrome-extension://abc/panel.html", CapabilityCause::InternalPage),
            ("file:///tmp/a.html", CapabilityCause::UnsupportedScheme),
            ("https://example.com", CapabilityCause::FeatureDisabled),
        ];
        for (url, cause) in cases {
            let host = SessionHost::new(url, None);
            let err = host.resolve_session(None).await.err().unwrap();
            assert_eq!(err, RelayError::CapabilityUnavailable(cause), "url: {url}");
        }
    }

    #[tokio::test]
    async fn unprovisioned_model_is_reported() {
        let model = ScriptedModel::echo().with_availability(Availability::Unavailable);
        let host = host_with(&model);

        let err = host.resolve_session(None).await.err().unwrap();
        assert_eq!(
            err,
            RelayError::CapabilityUnavailable(CapabilityCause::ModelNotProvisioned)
        );
        assert_eq!(model.created(), 0);

        model.set_availability(Availability::Available);
        host.resolve_session(None).await.unwrap();
        assert_eq!(model.created(), 1);
    }

    #[tokio::test]
    async fn handle_request_parses_fenced_output() {
        let model = ScriptedModel::replying(FENCED);
        let host = host_with(&model);

        let result = host.handle_request(request("r1", "Summarize this", None)).await;

        assert!(result.success);
        let payload = result.payload.unwrap();
        assert_eq!(payload.action.as_deref(), Some("summarize"));
        assert_eq!(payload.title.as_deref(), Some("T"));
        assert_eq!(payload.content.as_deref(), Some("C"));
    }

    #[tokio::test]
    async fn handle_request_rejects_invalid_payload() {
        let model = ScriptedModel::echo();
        let host = host_with(&model);

        let result = host.handle_request(request("r2", "", None)).await;

        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("Invalid prompt payload"));
        assert_eq!(model.created(), 0);
    }

    #[tokio::test]
    async fn prompt_failure_becomes_failure_envelope() {
        let model = ScriptedModel::echo();
        model.push_reply(Err(crate::model::ModelError::Prompt("quota exceeded".into())));
        let host = host_with(&model);

        let result = host.handle_request(request("r3", "hi", None)).await;

        assert!(!result.success);
        assert_eq!(result.request_id.as_str(), "r3");
        assert!(result.error_message.unwrap().contains("quota exceeded"));
        // The session itself stays cached.
        assert_eq!(host.session_count(), 1);
    }

    #[tokio::test]
    async fn unload_destroys_all_and_ignores_errors() {
        let model = ScriptedModel::echo().with_destroy_error("already gone");
        let host = host_with(&model);
        host.resolve_session(Some("a")).await.unwrap();
        host.resolve_session(Some("b")).await.unwrap();

        host.unload();

        assert_eq!(model.destroyed(), 2);
        assert_eq!(host.session_count(), 0);
        assert!(host.resolve_session(Some("a")).await.is_err());
        assert_eq!(model.created(), 2);
    }

    #[tokio::test]
    async fn creation_finishing_after_unload_is_destroyed() {
        let model = ScriptedModel::echo().with_create_delay(Duration::from_millis(100));
        let host = host_with(&model);

        let pending = tokio::spawn({
            let host = host.clone();
            async move { host.resolve_session(Some("late")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        host.unload();

        let err = pending.await.unwrap().err().unwrap();
        assert!(err.to_string().contains("unloaded"));
        assert_eq!(model.created(), 1);
        assert_eq!(model.destroyed(), 1);
    }

    #[tokio::test]
    async fn stopping_the_host_aborts_in_flight_requests() {
        let model = ScriptedModel::echo().with_create_delay(Duration::from_millis(200));
        let host = host_with(&model);
        let channel = PageChannel::new();
        let cancel = CancellationToken::new();
        let task = host.spawn(channel.clone(), cancel.clone());

        channel.post_top_level(
            Namespace::Extension,
            Envelope::PromptRequest(request("r5", "hi", None)),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(model.created(), model.destroyed());
        assert!(host.is_unloaded());
    }

    #[tokio::test]
    async fn spawned_host_answers_on_page_namespace() {
        let model = ScriptedModel::replying("plain words");
        let host = host_with(&model);
        let channel = PageChannel::new();
        let cancel = CancellationToken::new();
        let task = host.spawn(channel.clone(), cancel.clone());
        let mut results = channel.subscribe(Namespace::Page);

        channel.post_top_level(
            Namespace::Extension,
            Envelope::PromptRequest(request("r4", "hi", None)),
        );

        let Some(Envelope::PromptResult(result)) =
            tokio::time::timeout(Duration::from_secs(2), results.recv()).await.unwrap()
        else {
            panic!("expected a prompt result");
        };
        assert_eq!(result.request_id.as_str(), "r4");
        assert_eq!(result.payload.unwrap().content.as_deref(), Some("plain words"));

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(model.destroyed(), 1);
    }
}
