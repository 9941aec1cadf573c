use std::{fmt, sync::Arc};

use tracing::debug;

use crate::content::page::{OverlayKey, PageDom};

/// The one overlay a page may show.
///
/// `open` with the mounted id closes it, with another id swaps it. At no
/// point is more than one overlay node mounted.
pub struct ModalPresenter {
    dom: Arc<dyn PageDom>,
    current: Option<(String, OverlayKey)>,
}

impl ModalPresenter {
    pub fn new(dom: Arc<dyn PageDom>) -> Self {
        Self { dom, current: None }
    }

    /// Returns whether `plugin_id` is mounted afterwards.
    pub fn open(&mut self, plugin_id: &str) -> bool {
        if self.mounted() == Some(plugin_id) {
            self.close();
            return false;
        }
        self.close();
        let key = self.dom.mount_overlay(plugin_id);
        self.current = Some((plugin_id.to_string(), key));
        debug!("Modal showing `{plugin_id}`");
        true
    }

    pub fn close(&mut self) {
        if let Some((id, key)) = self.current.take() {
            self.dom.unmount_overlay(key);
            debug!("Modal for `{id}` closed");
        }
    }

    pub fn mounted(&self) -> Option<&str> {
        self.current.as_ref().map(|(id, _)| id.as_str())
    }
}

impl fmt::Debug for ModalPresenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModalPresenter").field("mounted", &self.mounted()).finish()
    }
}
