use std::{
    collections::BTreeMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use host_protocol::{
    plugin::{KeyToken, ShortcutConfig},
    AppState, PluginConfig, PluginDescriptor,
};
use tracing::{debug, info, warn};

use crate::{
    content::page::{PageDom, PageHandle},
    error::{HostError, HostResult},
};

/// Content-side half of a plugin.
pub trait ContentPlugin: Send + Sync {
    fn descriptor(&self) -> &PluginDescriptor;

    /// Start the plugin on the page. The returned handle is kept until the
    /// plugin is deactivated.
    fn activate(&self, page: &PageHandle, config: &PluginConfig) -> anyhow::Result<Box<dyn Activation>>;

    /// One-shot action triggered by a shortcut or `EXECUTE_PLUGIN`.
    fn execute(&self, _page: &PageHandle, _config: &PluginConfig) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A live plugin instance on one page.
pub trait Activation: Send {
    fn cleanup(self: Box<Self>) -> anyhow::Result<()>;
}

/// An activation with nothing to tear down beyond its listeners.
pub struct NoCleanup;

impl Activation for NoCleanup {
    fn cleanup(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}

struct ActivationRecord {
    instance: Box<dyn Activation>,
    page: PageHandle,
}

/// Per-page-load activation state.
///
/// Each plugin is either inactive or has exactly one record here. The
/// session is torn down wholesale by [`PageSession::invalidate`]; after that
/// every operation is a no-op.
pub struct PageSession {
    dom: Arc<dyn PageDom>,
    plugins: BTreeMap<String, Arc<dyn ContentPlugin>>,
    active: BTreeMap<String, ActivationRecord>,
    state: AppState,
    alive: bool,
}

impl PageSession {
    pub fn new(dom: Arc<dyn PageDom>, plugins: Vec<Arc<dyn ContentPlugin>>) -> Self {
        let plugins = plugins
            .into_iter()
            .map(|p| (p.descriptor().id.clone(), p))
            .collect();
        Self { dom, plugins, active: BTreeMap::new(), state: AppState::default(), alive: true }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn has_plugin(&self, plugin_id: &str) -> bool {
        self.plugins.contains_key(plugin_id)
    }

    pub fn is_active(&self, plugin_id: &str) -> bool {
        self.active.contains_key(plugin_id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    /// Reconcile activations with a state snapshot. A snapshot older than
    /// the last one applied is dropped.
    pub fn apply_state(&mut self, state: &AppState) {
        if !self.alive {
            return;
        }
        if state.revision < self.state.revision {
            debug!(
                "Dropping stale state r{} (applied r{})",
                state.revision, self.state.revision
            );
            return;
        }
        self.state = state.clone();
        let ids: Vec<String> = self.plugins.keys().cloned().collect();
        for id in ids {
            match (state.is_enabled(&id), self.is_active(&id)) {
                (true, false) => {
                    self.activate(&id);
                }
                (false, true) => {
                    self.deactivate(&id);
                }
                _ => {}
            }
        }
    }

    /// Returns whether the plugin is active afterwards.
    pub fn activate(&mut self, plugin_id: &str) -> bool {
        if !self.alive {
            return false;
        }
        if self.is_active(plugin_id) {
            return true;
        }
        let Some(plugin) = self.plugins.get(plugin_id).cloned() else {
            warn!("No content plugin `{plugin_id}` on this page");
            return false;
        };
        let config = self.config_for(plugin.descriptor());
        let page = PageHandle::new(self.dom.clone(), plugin_id);

        match catch_unwind(AssertUnwindSafe(|| plugin.activate(&page, &config))) {
            Ok(Ok(instance)) => {
                self.active
                    .insert(plugin_id.to_string(), ActivationRecord { instance, page });
                info!("Activated `{plugin_id}`");
                true
            }
            Ok(Err(e)) => {
                page.detach_all();
                warn!("Activation of `{plugin_id}` failed: {e:#}");
                false
            }
            Err(_) => {
                page.detach_all();
                warn!("Activation of `{plugin_id}` panicked");
                false
            }
        }
    }

    /// Returns whether there was anything to deactivate. Cleanup is only run
    /// for active plugins.
    pub fn deactivate(&mut self, plugin_id: &str) -> bool {
        let Some(record) = self.active.remove(plugin_id) else {
            return false;
        };
        let ActivationRecord { instance, page } = record;
        match catch_unwind(AssertUnwindSafe(|| instance.cleanup())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Cleanup of `{plugin_id}` failed: {e:#}"),
            Err(_) => warn!("Cleanup of `{plugin_id}` panicked"),
        }
        let leftover = page.detach_all();
        if leftover > 0 {
            debug!("Removed {leftover} listeners `{plugin_id}` left behind");
        }
        info!("Deactivated `{plugin_id}`");
        true
    }

    /// Deactivate everything and end the session.
    pub fn invalidate(&mut self) {
        if !self.alive {
            return;
        }
        for id in self.active_ids() {
            self.deactivate(&id);
        }
        self.alive = false;
        info!("Page session invalidated");
    }

    /// Run `execute` on every enabled plugin bound to the pressed keys.
    /// Returns the ids that ran.
    pub fn handle_keys(&mut self, pressed: &[KeyToken]) -> Vec<String> {
        if !self.alive || pressed.is_empty() {
            return Vec::new();
        }
        let matched: Vec<String> = self
            .plugins
            .values()
            .filter(|p| self.state.is_enabled(&p.descriptor().id))
            .filter(|p| self.shortcut_matches(p.descriptor(), pressed))
            .map(|p| p.descriptor().id.clone())
            .collect();

        matched
            .into_iter()
            .filter(|id| match self.execute(id) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Shortcut for `{id}` failed: {e}");
                    false
                }
            })
            .collect()
    }

    pub fn execute(&mut self, plugin_id: &str) -> HostResult<()> {
        if !self.alive {
            return Err(HostError::Delivery("page session is gone".into()));
        }
        let plugin = self
            .plugins
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| HostError::plugin_not_found(plugin_id))?;
        if !self.state.is_enabled(plugin_id) {
            return Err(HostError::Handler(format!("plugin `{plugin_id}` is disabled")));
        }
        let config = self.config_for(plugin.descriptor());
        let (page, transient) = match self.active.get(plugin_id) {
            Some(record) => (record.page.clone(), false),
            None => (PageHandle::new(self.dom.clone(), plugin_id), true),
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| plugin.execute(&page, &config)));
        if transient {
            page.detach_all();
        }
        match outcome {
            Ok(Ok(())) => {
                debug!("Executed `{plugin_id}`");
                Ok(())
            }
            Ok(Err(e)) => Err(HostError::Handler(format!("{plugin_id}: {e:#}"))),
            Err(_) => Err(HostError::Handler(format!("{plugin_id}: execute panicked"))),
        }
    }

    fn config_for(&self, descriptor: &PluginDescriptor) -> PluginConfig {
        let mut config = self
            .state
            .config(&descriptor.id)
            .cloned()
            .unwrap_or_else(|| descriptor.default_config());
        for field in &descriptor.settings {
            config
                .settings
                .entry(field.id.clone())
                .or_insert_with(|| field.default.clone());
        }
        config
    }

    fn shortcut_matches(&self, descriptor: &PluginDescriptor, pressed: &[KeyToken]) -> bool {
        let config = self.state.config(&descriptor.id);
        descriptor.shortcuts.iter().any(|decl| {
            let sc = config
                .and_then(|c| c.shortcuts.get(&decl.id))
                .cloned()
                .unwrap_or_else(ShortcutConfig::default);
            if !sc.enabled {
                return false;
            }
            let keys = sc.custom_keys.as_ref().unwrap_or(&decl.default_keys);
            keys_match(keys, pressed)
        })
    }
}

/// Same set of keys, ignoring order and case.
fn keys_match(bound: &[KeyToken], pressed: &[KeyToken]) -> bool {
    if bound.is_empty() || bound.len() != pressed.len() {
        return false;
    }
    let norm = |keys: &[KeyToken]| {
        let mut v: Vec<String> = keys.iter().map(|k| k.to_lowercase()).collect();
        v.sort();
        v
    };
    norm(bound) == norm(pressed)
}

impl fmt::Debug for PageSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageSession")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .field("active", &self.active_ids())
            .field("alive", &self.alive)
            .finish()
    }
}
