//! Pages: identity, eligibility, and the per-page wiring of channel, bridge
//! and Session Host.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bridge::{Bridge, BridgeError, HostInjector};
use crate::controller::ResultSink;
use crate::error::RelayError;
use crate::model::LanguageModel;
use crate::page_channel::PageChannel;
use crate::session_host::SessionHost;

/// Schemes that belong to the browser or an extension, never a web page.
const INTERNAL_SCHEMES: [&str; 7] = [
    "chrome",
    "chrome-extension",
    "chrome-untrusted",
    "devtools",
    "edge",
    "about",
    "view-source",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId(Uuid);

impl PageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The page a prompt would be relayed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPage {
    pub id: PageId,
    pub url: String,
}

/// Source of the current target page.
pub trait PageLocator: Send + Sync {
    /// The page prompts should go to, if a reachable one exists.
    fn current_page(&self) -> Option<TargetPage>;
}

/// A [`PageLocator`] whose page is set explicitly, like a browser's active tab.
#[derive(Clone, Default)]
pub struct ActivePage {
    page: Arc<RwLock<Option<TargetPage>>>,
}

impl ActivePage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, page: TargetPage) {
        *self.page.write() = Some(page);
    }

    pub fn clear(&self) {
        *self.page.write() = None;
    }
}

impl PageLocator for ActivePage {
    fn current_page(&self) -> Option<TargetPage> {
        self.page.read().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// http:// or https://
    Web,
    /// Browser-internal or extension page.
    Internal,
    /// Anything else (file://, data:, unparseable).
    Other,
}

pub fn classify_scheme(page_url: &str) -> PageKind {
    let Ok(parsed) = url::Url::parse(page_url) else {
        return PageKind::Other;
    };
    match parsed.scheme() {
        "http" | "https" => PageKind::Web,
        scheme if INTERNAL_SCHEMES.contains(&scheme) => PageKind::Internal,
        _ => PageKind::Other,
    }
}

/// Check that `page` exists and uses one of `allowed_schemes`.
pub fn check_eligible(
    page: Option<TargetPage>,
    allowed_schemes: &[String],
) -> Result<TargetPage, RelayError> {
    let Some(page) = page else {
        return Err(RelayError::IneligiblePage(
            "No active page found. Open a regular website and try again.".into(),
        ));
    };

    let scheme = url::Url::parse(&page.url)
        .map(|u| u.scheme().to_string())
        .map_err(|e| RelayError::IneligiblePage(format!("Cannot relay to page '{}': {}.", page.url, e)))?;

    if !allowed_schemes.iter().any(|s| s.eq_ignore_ascii_case(&scheme)) {
        let hint = match classify_scheme(&page.url) {
            PageKind::Internal => "Browser and extension pages cannot run AI prompts.",
            _ => "Only regular web pages can run AI prompts.",
        };
        return Err(RelayError::IneligiblePage(format!(
            "Cannot relay to {}: {} Navigate to an http:// or https:// page and try again.",
            page.url, hint
        )));
    }

    Ok(page)
}

struct InjectedHost {
    host: SessionHost,
    task: tokio::task::JoinHandle<()>,
}

/// Injects the Session Host into a page world on first use.
pub struct PageWorldInjector {
    page_url: String,
    channel: PageChannel,
    capability: Option<Arc<dyn LanguageModel>>,
    cancel: CancellationToken,
    injected: Mutex<Option<InjectedHost>>,
    injections: std::sync::atomic::AtomicUsize,
}

impl PageWorldInjector {
    pub fn new(
        page_url: impl Into<String>,
        channel: PageChannel,
        capability: Option<Arc<dyn LanguageModel>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            page_url: page_url.into(),
            channel,
            capability,
            cancel,
            injected: Mutex::new(None),
            injections: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Number of times the host was actually injected (not counting no-ops).
    pub fn injections(&self) -> usize {
        self.injections.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// The injected host, if injection has happened.
    pub fn host(&self) -> Option<SessionHost> {
        self.injected.lock().as_ref().map(|i| i.host.clone())
    }

    fn take_task(&self) -> Option<tokio::task::JoinHandle<()>> {
        self.injected.lock().take().map(|i| i.task)
    }
}

#[async_trait]
impl HostInjector for PageWorldInjector {
    async fn ensure_injected(&self) -> Result<(), BridgeError> {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::InjectionFailed("page has been unloaded".into()));
        }
        let mut injected = self.injected.lock();
        if injected.is_some() {
            return Ok(());
        }
        let host = SessionHost::new(self.page_url.clone(), self.capability.clone());
        let task = host.spawn(self.channel.clone(), self.cancel.child_token());
        *injected = Some(InjectedHost { host, task });
        self.injections.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        tracing::debug!(page = %self.page_url, "injected session host");
        Ok(())
    }
}

/// One open page: its message channel, its bridge, and the lazily injected
/// Session Host. Closing the page stops both and releases every session.
pub struct Page {
    target: TargetPage,
    channel: PageChannel,
    bridge: Bridge,
    injector: Arc<PageWorldInjector>,
    cancel: CancellationToken,
}

impl Page {
    /// Open a page at `url`. `capability` is what the page world exposes;
    /// results are forwarded to `sink`.
    pub fn open(
        url: impl Into<String>,
        capability: Option<Arc<dyn LanguageModel>>,
        sink: ResultSink,
    ) -> Self {
        let target = TargetPage {
            id: PageId::new(),
            url: url.into(),
        };
        let channel = PageChannel::new();
        let cancel = CancellationToken::new();
        let injector = Arc::new(PageWorldInjector::new(
            target.url.clone(),
            channel.clone(),
            capability,
            cancel.child_token(),
        ));
        let bridge = Bridge::attach(
            target.id,
            channel.clone(),
            injector.clone(),
            sink,
            cancel.child_token(),
        );
        tracing::info!(page = %target.id, url = %target.url, "page opened");
        Self {
            target,
            channel,
            bridge,
            injector,
            cancel,
        }
    }

    pub fn target(&self) -> TargetPage {
        self.target.clone()
    }

    pub fn id(&self) -> PageId {
        self.target.id
    }

    pub fn channel(&self) -> &PageChannel {
        &self.channel
    }

    pub fn bridge(&self) -> Bridge {
        self.bridge.clone()
    }

    pub fn injector(&self) -> &PageWorldInjector {
        &self.injector
    }

    /// Unload the page: stop the bridge listener and the Session Host, and
    /// wait for the host to release its sessions.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Some(task) = self.injector.take_task() {
            let _ = task.await;
        }
        tracing::info!(page = %self.target.id, "page closed");
    }
}
