//! Controller → Bridge delivery.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::bridge::{Bridge, BridgeError};
use crate::envelope::{Ack, PromptEnvelope};
use crate::page::PageId;

/// What the host runtime reports when nothing is listening in the page.
pub const NO_RECEIVER: &str = "Could not establish connection. Receiving end does not exist.";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No bridge answered for the page.
    #[error("{0}")]
    Unreachable(String),

    /// The bridge answered and refused the envelope.
    #[error("{0}")]
    Rejected(String),
}

impl From<BridgeError> for TransportError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::InvalidEnvelope(detail) => TransportError::Rejected(detail),
            BridgeError::InjectionFailed(detail) => TransportError::Unreachable(detail),
        }
    }
}

#[async_trait]
pub trait BridgeTransport: Send + Sync {
    /// Hand `envelope` to the bridge of `page`. Resolves on acknowledgement,
    /// not on the prompt's answer.
    async fn deliver(&self, page: PageId, envelope: PromptEnvelope) -> Result<Ack, TransportError>;
}

/// In-process transport: a table of bridges keyed by page.
#[derive(Clone, Default)]
pub struct LocalTransport {
    bridges: Arc<RwLock<HashMap<PageId, Bridge>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, bridge: Bridge) {
        self.bridges.write().insert(bridge.page(), bridge);
    }

    /// Forget the bridge for `page`. Returns whether one was registered.
    pub fn unregister(&self, page: PageId) -> bool {
        self.bridges.write().remove(&page).is_some()
    }

    pub fn len(&self) -> usize {
        self.bridges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BridgeTransport for LocalTransport {
    async fn deliver(&self, page: PageId, envelope: PromptEnvelope) -> Result<Ack, TransportError> {
        let bridge = self.bridges.read().get(&page).cloned();
        let Some(bridge) = bridge else {
            return Err(TransportError::Unreachable(NO_RECEIVER.into()));
        };
        Ok(bridge.relay_to_page(envelope).await?)
    }
}
