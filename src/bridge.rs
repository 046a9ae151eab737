//! Bridge: relays envelopes between the Controller and one page's world.
//!
//! The bridge never interprets prompts. Outbound, it validates the envelope,
//! makes sure the Session Host is present, re-posts the envelope into the page
//! and acknowledges at once. Inbound, it forwards results posted by the page's
//! own top-level context to the Controller. There are no retries here.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::controller::ResultSink;
use crate::envelope::{Ack, Envelope, PromptEnvelope, ResultEnvelope};
use crate::page::PageId;
use crate::page_channel::{Namespace, PageChannel};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("failed to inject page helper: {0}")]
    InjectionFailed(String),
}

/// Puts the Session Host into the page world. Must be idempotent.
#[async_trait]
pub trait HostInjector: Send + Sync {
    async fn ensure_injected(&self) -> Result<(), BridgeError>;
}

#[derive(Clone)]
pub struct Bridge {
    page: PageId,
    channel: PageChannel,
    injector: Arc<dyn HostInjector>,
    sink: ResultSink,
}

impl Bridge {
    /// Create the bridge for `page` and start relaying page results to
    /// `sink` until `cancel` fires.
    pub fn attach(
        page: PageId,
        channel: PageChannel,
        injector: Arc<dyn HostInjector>,
        sink: ResultSink,
        cancel: CancellationToken,
    ) -> Self {
        let bridge = Self {
            page,
            channel,
            injector,
            sink,
        };
        bridge.spawn_listener(cancel);
        bridge
    }

    pub fn page(&self) -> PageId {
        self.page
    }

    /// Forward a prompt into the page. Returns as soon as it is posted.
    pub async fn relay_to_page(&self, envelope: PromptEnvelope) -> Result<Ack, BridgeError> {
        envelope.validate().map_err(BridgeError::InvalidEnvelope)?;
        self.injector.ensure_injected().await?;

        let ack = Ack {
            request_id: envelope.request_id.clone(),
        };
        tracing::debug!(page = %self.page, request_id = %ack.request_id, "relaying prompt into page");
        self.channel
            .post_top_level(Namespace::Extension, Envelope::PromptRequest(envelope));
        Ok(ack)
    }

    /// Forward one result from the page to the Controller.
    pub fn relay_from_page(&self, envelope: ResultEnvelope) {
        tracing::debug!(page = %self.page, request_id = %envelope.request_id, success = envelope.success, "relaying result from page");
        if !self.sink.deliver(envelope) {
            tracing::warn!(page = %self.page, "controller is gone, dropping page result");
        }
    }

    fn spawn_listener(&self, cancel: CancellationToken) {
        let results = self.channel.subscribe(Namespace::Page).into_stream();
        let bridge = self.clone();

        tokio::spawn(async move {
            tokio::pin!(results);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = results.next() => match next {
                        Some(Envelope::PromptResult(result)) => bridge.relay_from_page(result),
                        Some(Envelope::PromptRequest(_)) => {}
                        None => break,
                    },
                }
            }
            tracing::debug!(page = %bridge.page, "bridge listener stopped");
        });
    }
}
