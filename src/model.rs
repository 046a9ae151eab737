//! The on-device language-model capability, as seen by this crate.
//!
//! The real capability lives in a browser world; [`LanguageModel`] and
//! [`ModelSession`] are the seams it is consumed through. [`ScriptedModel`]
//! is an in-process implementation that replays canned replies, used by the
//! CLI and the tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Availability {
    Unavailable,
    Downloadable,
    Downloading,
    Available,
}

/// Options passed when creating a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub system_prompt: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("failed to create session: {0}")]
    Create(String),

    #[error("{0}")]
    Prompt(String),

    #[error("failed to destroy session: {0}")]
    Destroy(String),
}

/// One live conversation with the model.
#[async_trait]
pub trait ModelSession: Send + Sync {
    async fn prompt(&self, text: &str) -> Result<String, ModelError>;

    fn destroy(&self) -> Result<(), ModelError>;
}

pub type SessionHandle = Arc<dyn ModelSession>;

/// Factory for sessions, plus an availability check.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn availability(&self) -> Availability;

    async fn create(&self, config: SessionConfig) -> Result<SessionHandle, ModelError>;
}

type ReplyFn = dyn Fn(&str) -> Result<String, ModelError> + Send + Sync;

struct ScriptState {
    availability: Mutex<Availability>,
    reply: Box<ReplyFn>,
    queued: Mutex<VecDeque<Result<String, ModelError>>>,
    create_failures: Mutex<VecDeque<ModelError>>,
    create_delay: Mutex<Option<Duration>>,
    prompt_delay: Mutex<Option<Duration>>,
    destroy_error: Mutex<Option<ModelError>>,
    created: AtomicUsize,
    prompted: AtomicUsize,
    destroyed: AtomicUsize,
    system_prompts: Mutex<Vec<Option<String>>>,
    prompts: Mutex<Vec<String>>,
}

/// A [`LanguageModel`] that answers from a script.
///
/// Queued replies (see [`ScriptedModel::push_reply`]) are consumed first;
/// after that every prompt is answered by the reply function.
#[derive(Clone)]
pub struct ScriptedModel {
    state: Arc<ScriptState>,
}

impl ScriptedModel {
    pub fn new(reply: impl Fn(&str) -> Result<String, ModelError> + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(ScriptState {
                availability: Mutex::new(Availability::Available),
                reply: Box::new(reply),
                queued: Mutex::new(VecDeque::new()),
                create_failures: Mutex::new(VecDeque::new()),
                create_delay: Mutex::new(None),
                prompt_delay: Mutex::new(None),
                destroy_error: Mutex::new(None),
                created: AtomicUsize::new(0),
                prompted: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                system_prompts: Mutex::new(Vec::new()),
                prompts: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Always answer with `text`.
    pub fn replying(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_| Ok(text.clone()))
    }

    /// Echo the prompt back as the reply.
    pub fn echo() -> Self {
        Self::new(|prompt| Ok(prompt.to_string()))
    }

    pub fn with_availability(self, availability: Availability) -> Self {
        *self.state.availability.lock() = availability;
        self
    }

    pub fn with_create_delay(self, delay: Duration) -> Self {
        *self.state.create_delay.lock() = Some(delay);
        self
    }

    pub fn with_prompt_delay(self, delay: Duration) -> Self {
        *self.state.prompt_delay.lock() = Some(delay);
        self
    }

    /// Make every `destroy()` call fail.
    pub fn with_destroy_error(self, message: impl Into<String>) -> Self {
        *self.state.destroy_error.lock() = Some(ModelError::Destroy(message.into()));
        self
    }

    pub fn set_availability(&self, availability: Availability) {
        *self.state.availability.lock() = availability;
    }

    pub fn push_reply(&self, reply: Result<String, ModelError>) {
        self.state.queued.lock().push_back(reply);
    }

    /// Fail the next session creation with `message`.
    pub fn fail_next_create(&self, message: impl Into<String>) {
        self.state
            .create_failures
            .lock()
            .push_back(ModelError::Create(message.into()));
    }

    /// Number of sessions successfully created.
    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn prompted(&self) -> usize {
        self.state.prompted.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.state.destroyed.load(Ordering::SeqCst)
    }

    /// System prompts of the created sessions, in creation order.
    pub fn system_prompts(&self) -> Vec<Option<String>> {
        self.state.system_prompts.lock().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.state.prompts.lock().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn availability(&self) -> Availability {
        *self.state.availability.lock()
    }

    async fn create(&self, config: SessionConfig) -> Result<SessionHandle, ModelError> {
        let delay = *self.state.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.state.create_failures.lock().pop_front() {
            return Err(err);
        }
        self.state.created.fetch_add(1, Ordering::SeqCst);
        self.state.system_prompts.lock().push(config.system_prompt.clone());
        Ok(Arc::new(ScriptedSession {
            state: self.state.clone(),
        }))
    }
}

struct ScriptedSession {
    state: Arc<ScriptState>,
}

#[async_trait]
impl ModelSession for ScriptedSession {
    async fn prompt(&self, text: &str) -> Result<String, ModelError> {
        let delay = *self.state.prompt_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.prompted.fetch_add(1, Ordering::SeqCst);
        self.state.prompts.lock().push(text.to_string());
        let queued = self.state.queued.lock().pop_front();
        match queued {
            Some(reply) => reply,
            None => (self.state.reply)(text),
        }
    }

    fn destroy(&self) -> Result<(), ModelError> {
        self.state.destroyed.fetch_add(1, Ordering::SeqCst);
        match self.state.destroy_error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_replies_come_before_the_script() {
        let model = ScriptedModel::replying("scripted");
        model.push_reply(Ok("first".into()));
        model.push_reply(Err(ModelError::Prompt("second fails".into())));

        let session = model.create(SessionConfig::default()).await.unwrap();
        assert_eq!(session.prompt("a").await.unwrap(), "first");
        assert!(session.prompt("b").await.is_err());
        assert_eq!(session.prompt("c").await.unwrap(), "scripted");
        assert_eq!(model.prompted(), 3);
        assert_eq!(model.prompts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn create_failure_is_consumed_once() {
        let model = ScriptedModel::echo();
        model.fail_next_create("not yet");
        assert!(model.create(SessionConfig::default()).await.is_err());
        assert!(model.create(SessionConfig::default()).await.is_ok());
        assert_eq!(model.created(), 1);
    }

    #[tokio::test]
    async fn records_system_prompts() {
        let model = ScriptedModel::echo();
        model
            .create(SessionConfig {
                system_prompt: Some("be brief".into()),
            })
            .await
            .unwrap();
        assert_eq!(model.system_prompts(), vec![Some("be brief".to_string())]);
    }

    #[test]
    fn availability_wire_names() {
        assert_eq!(
            serde_json::to_value(Availability::Unavailable).unwrap(),
            "unavailable"
        );
    }
}
