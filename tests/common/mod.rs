#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use notes_relay::config::RelaySection;
use notes_relay::controller::Controller;
use notes_relay::model::{LanguageModel, ScriptedModel};
use notes_relay::page::{ActivePage, Page};
use notes_relay::transport::LocalTransport;

/// A controller wired to an in-process transport, with pages opened on demand.
pub struct TestRelay {
    pub controller: Controller,
    pub transport: LocalTransport,
    pub active: ActivePage,
}

impl TestRelay {
    pub fn new() -> Self {
        Self::with_settings(RelaySection::default())
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_settings(RelaySection {
            request_timeout_secs: timeout.as_secs(),
            ..Default::default()
        })
    }

    pub fn with_settings(settings: RelaySection) -> Self {
        let active = ActivePage::new();
        let transport = LocalTransport::new();
        let controller = Controller::spawn(
            Arc::new(active.clone()),
            Arc::new(transport.clone()),
            &settings,
        );
        Self {
            controller,
            transport,
            active,
        }
    }

    /// Open a page at `url`, register its bridge and make it the active page.
    pub fn open_page(&self, url: &str, capability: Option<Arc<dyn LanguageModel>>) -> Page {
        let page = Page::open(url, capability, self.controller.result_sink());
        self.transport.register(page.bridge());
        self.active.set(page.target());
        page
    }

    /// Open a page whose language model always replies with `reply`.
    pub fn open_scripted(&self, url: &str, reply: &str) -> (Page, ScriptedModel) {
        let model = ScriptedModel::replying(reply);
        let page = self.open_page(url, Some(Arc::new(model.clone())));
        (page, model)
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(timeout, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
