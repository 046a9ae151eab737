//! Typed message channel inside one page.
//!
//! Stands in for the page's window-level message bus. Any script in the page
//! (including embedded frames) can post to it, so receivers never see the raw
//! feed: [`PageChannel::subscribe`] returns a [`Subscription`] scoped to one
//! namespace marker that only delivers messages posted by the page's own
//! top-level context. Dropping the subscription unsubscribes.
//!
//! Delivery is lossless. Every subscription has its own unbounded queue, so a
//! burst of prompts posted before a listener gets scheduled is queued, never
//! dropped.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;

use crate::envelope::Envelope;

/// Marker tagging messages sent toward the page world.
pub const EXTENSION_MARKER: &str = "AI_NOTES_EXTENSION";

/// Marker tagging messages sent from the page world.
pub const PAGE_MARKER: &str = "AI_NOTES_PAGE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Bridge → Session Host.
    Extension,
    /// Session Host → Bridge.
    Page,
}

impl Namespace {
    pub fn marker(&self) -> &'static str {
        match self {
            Namespace::Extension => EXTENSION_MARKER,
            Namespace::Page => PAGE_MARKER,
        }
    }

    fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            EXTENSION_MARKER => Some(Namespace::Extension),
            PAGE_MARKER => Some(Namespace::Page),
            _ => None,
        }
    }
}

/// Which browsing context posted a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    TopLevel,
    /// An embedded frame, identified by its origin.
    Frame(String),
}

#[derive(Debug, Clone)]
pub struct PageMessage {
    /// Free-form marker string; anything in the page may claim any marker.
    pub source: String,
    pub origin: Origin,
    pub body: Envelope,
}

impl PageMessage {
    pub fn top_level(namespace: Namespace, body: Envelope) -> Self {
        Self {
            source: namespace.marker().to_string(),
            origin: Origin::TopLevel,
            body,
        }
    }

    /// The namespace this message may be delivered on, if any.
    fn namespace(&self) -> Option<Namespace> {
        if self.origin != Origin::TopLevel {
            return None;
        }
        Namespace::from_marker(&self.source)
    }
}

struct Subscriber {
    namespace: Namespace,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[derive(Clone, Default)]
pub struct PageChannel {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl PageChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, message: PageMessage) {
        let Some(namespace) = message.namespace() else {
            tracing::trace!(
                source = %message.source,
                origin = ?message.origin,
                "ignoring page message outside any subscription scope"
            );
            return;
        };

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in subscribers.iter().filter(|s| s.namespace == namespace) {
            // Ignore error - the subscription was dropped after the retain
            let _ = subscriber.tx.send(message.body.clone());
        }
    }

    /// Post from the page's own top-level context.
    pub fn post_top_level(&self, namespace: Namespace, body: Envelope) {
        self.post(PageMessage::top_level(namespace, body));
    }

    /// Subscribe to top-level messages tagged with `namespace`.
    ///
    /// Registration is immediate: anything posted after this call returns is
    /// observed by the subscription.
    pub fn subscribe(&self, namespace: Namespace) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber { namespace, tx });
        Subscription { rx }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }
}

pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    /// Next envelope for this namespace, or `None` once every handle to the
    /// channel is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = Envelope> {
        UnboundedReceiverStream::new(self.rx)
    }
}
