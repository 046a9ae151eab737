//! Caller-side strategies for getting a prompt answered.
//!
//! The caller first tries the capability in its own context, through either
//! of its two entry points, and only then relays to the page through the
//! [`Controller`]. A strategy never retries itself; any failure falls through
//! to the next one, and the last strategy's failure is what the caller sees.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::controller::Controller;
use crate::error::RelayError;
use crate::model::{Availability, LanguageModel, SessionConfig, SessionHandle};
use crate::response::{parse_model_output, ParsedResult};

pub const DIRECT_ENTRY: &str = "language-model";
pub const NAMESPACED_ENTRY: &str = "ai.language-model";
pub const RELAY: &str = "page-relay";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    /// The entry point does not exist in this context.
    #[error("{0} is not exposed in this context")]
    Absent(String),

    #[error("{0} is not available in this context")]
    Unavailable(String),

    #[error("{0}")]
    Runtime(String),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl StrategyError {
    pub fn code(&self) -> &'static str {
        match self {
            StrategyError::Absent(_) => "strategy_absent",
            StrategyError::Unavailable(_) => "strategy_unavailable",
            StrategyError::Runtime(_) => "strategy_failed",
            StrategyError::Relay(e) => e.code(),
        }
    }
}

/// One prompt as the caller sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub prompt_text: String,
    pub system_prompt: Option<String>,
}

impl PromptRequest {
    pub fn new(prompt_text: impl Into<String>, system_prompt: Option<&str>) -> Self {
        Self {
            prompt_text: prompt_text.into(),
            system_prompt: system_prompt.map(str::to_string),
        }
    }
}

#[async_trait]
pub trait PromptStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, request: &PromptRequest) -> Result<ParsedResult, StrategyError>;
}

/// Uses a capability reachable from the caller's own context.
///
/// The first successful session is kept and reused for later prompts, with
/// whatever system prompt it was created with.
pub struct InContextStrategy {
    label: String,
    capability: Option<Arc<dyn LanguageModel>>,
    session: OnceCell<SessionHandle>,
}

impl InContextStrategy {
    pub fn new(label: impl Into<String>, capability: Option<Arc<dyn LanguageModel>>) -> Self {
        Self {
            label: label.into(),
            capability,
            session: OnceCell::new(),
        }
    }

    pub fn has_session(&self) -> bool {
        self.session.initialized()
    }
}

#[async_trait]
impl PromptStrategy for InContextStrategy {
    fn name(&self) -> &str {
        &self.label
    }

    async fn run(&self, request: &PromptRequest) -> Result<ParsedResult, StrategyError> {
        let Some(model) = self.capability.as_ref() else {
            return Err(StrategyError::Absent(self.label.clone()));
        };
        if model.availability().await == Availability::Unavailable {
            return Err(StrategyError::Unavailable(self.label.clone()));
        }

        let session = self
            .session
            .get_or_try_init(|| async {
                model
                    .create(SessionConfig {
                        system_prompt: request.system_prompt.clone(),
                    })
                    .await
                    .map_err(|e| StrategyError::Runtime(e.to_string()))
            })
            .await?;

        let raw = session
            .prompt(&request.prompt_text)
            .await
            .map_err(|e| StrategyError::Runtime(e.to_string()))?;
        Ok(parse_model_output(&raw))
    }
}

/// Relays through the Controller to the current page.
pub struct RelayStrategy {
    controller: Controller,
}

impl RelayStrategy {
    pub fn new(controller: Controller) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl PromptStrategy for RelayStrategy {
    fn name(&self) -> &str {
        RELAY
    }

    async fn run(&self, request: &PromptRequest) -> Result<ParsedResult, StrategyError> {
        Ok(self
            .controller
            .dispatch_prompt(&request.prompt_text, request.system_prompt.as_deref())
            .await?)
    }
}

/// Ordered list of strategies; the first success wins.
#[derive(Default)]
pub struct FallbackChain {
    strategies: Vec<Box<dyn PromptStrategy>>,
}

impl FallbackChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The usual order: direct entry point, namespaced entry point, then the
    /// page relay.
    pub fn standard(
        direct: Option<Arc<dyn LanguageModel>>,
        namespaced: Option<Arc<dyn LanguageModel>>,
        controller: Controller,
    ) -> Self {
        Self::new()
            .with(InContextStrategy::new(DIRECT_ENTRY, direct))
            .with(InContextStrategy::new(NAMESPACED_ENTRY, namespaced))
            .with(RelayStrategy::new(controller))
    }

    pub fn with(mut self, strategy: impl PromptStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub async fn run(&self, request: &PromptRequest) -> Result<ParsedResult, StrategyError> {
        let mut last_error = StrategyError::Absent("prompt strategy".into());
        for strategy in &self.strategies {
            match strategy.run(request).await {
                Ok(result) => {
                    tracing::debug!(strategy = strategy.name(), "prompt answered");
                    return Ok(result);
                }
                Err(e) => {
                    tracing::info!(strategy = strategy.name(), code = e.code(), error = %e, "prompt strategy failed, falling through");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}
