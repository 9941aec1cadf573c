use std::{
    collections::BTreeMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use host_protocol::{
    plugin::{KeyToken, ShortcutConfig},
    AppState, PluginConfig, PluginDescriptor, SettingValue,
};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    error::{HostError, HostResult},
    registry::DescriptorRegistry,
    storage::Storage,
};

/// Storage key of the whole `AppState` blob.
pub const STATE_KEY: &str = "plugin_host_state";

/// Storage key of a plugin's denormalised enabled flag.
pub fn enabled_flag_key(plugin_id: &str) -> String {
    format!("plugin_enabled:{plugin_id}")
}

pub type StateListener = Arc<dyn Fn(&AppState) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// The single authoritative record of every plugin's config.
///
/// All mutations go through this type. Each one is applied to a copy,
/// written to storage in one call, and only then committed and announced
/// to listeners. A failed write leaves the in-memory state untouched.
pub struct PluginManager {
    storage: Arc<dyn Storage>,
    registry: Arc<DescriptorRegistry>,
    state: RwLock<AppState>,
    write_lock: Mutex<()>,
    listeners: StdMutex<Vec<(ListenerId, StateListener)>>,
    next_listener: AtomicU64,
}

impl PluginManager {
    /// Build a manager and hydrate it from `storage`.
    pub async fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<DescriptorRegistry>,
    ) -> HostResult<Arc<Self>> {
        let state = match storage.get(STATE_KEY).await? {
            Some(v) => serde_json::from_value::<AppState>(v)
                .map_err(|e| HostError::Persistence(format!("stored state unreadable: {e}")))?,
            None => AppState::default(),
        };
        info!(
            "Loaded {} plugin configs from {}",
            state.plugins.len(),
            storage.name()
        );
        Ok(Arc::new(Self {
            storage,
            registry,
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
            listeners: StdMutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }))
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.registry
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Record a descriptor. A config is created from schema defaults the
    /// first time an id is seen; a stored config is never overwritten.
    pub async fn register(&self, descriptor: PluginDescriptor) -> HostResult<()> {
        let id = descriptor.id.clone();
        let defaults = descriptor.default_config();
        self.registry.insert(descriptor);

        let _guard = self.write_lock.lock().await;
        if self.state.read().await.plugins.contains_key(&id) {
            debug!("Plugin `{id}` already has a stored config, keeping it");
            return Ok(());
        }
        let mut next = self.state.read().await.clone();
        next.plugins.insert(id.clone(), defaults);
        self.commit(next, &id).await?;
        info!("Plugin `{id}` registered with default config");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    pub async fn set_enabled(&self, plugin_id: &str, enabled: bool) -> HostResult<()> {
        self.mutate(plugin_id, |_, config| {
            config.enabled = enabled;
            Ok(())
        })
        .await?;
        info!("Plugin `{plugin_id}` enabled={enabled}");
        Ok(())
    }

    /// Flip the enabled flag and return its new value.
    pub async fn toggle(&self, plugin_id: &str) -> HostResult<bool> {
        let mut now = false;
        self.mutate(plugin_id, |_, config| {
            config.enabled = !config.enabled;
            now = config.enabled;
            Ok(())
        })
        .await?;
        info!("Plugin `{plugin_id}` toggled to enabled={now}");
        Ok(now)
    }

    /// The value's type is not checked against the schema.
    pub async fn update_setting(
        &self,
        plugin_id: &str,
        setting_id: &str,
        value: SettingValue,
    ) -> HostResult<()> {
        self.mutate(plugin_id, |descriptor, config| {
            if descriptor.setting(setting_id).is_none() {
                return Err(HostError::setting_not_found(plugin_id, setting_id));
            }
            config.settings.insert(setting_id.to_string(), value);
            Ok(())
        })
        .await
    }

    pub async fn update_shortcut(
        &self,
        plugin_id: &str,
        shortcut_id: &str,
        custom_keys: Option<Vec<KeyToken>>,
        enabled: Option<bool>,
    ) -> HostResult<()> {
        self.mutate(plugin_id, |descriptor, config| {
            if descriptor.shortcut(shortcut_id).is_none() {
                return Err(HostError::shortcut_not_found(plugin_id, shortcut_id));
            }
            let entry = config
                .shortcuts
                .entry(shortcut_id.to_string())
                .or_insert_with(ShortcutConfig::default);
            if let Some(keys) = custom_keys {
                entry.custom_keys = Some(keys);
            }
            if let Some(enabled) = enabled {
                entry.enabled = enabled;
            }
            Ok(())
        })
        .await
    }

    /// Replace a plugin's config with its schema defaults.
    pub async fn reset(&self, plugin_id: &str) -> HostResult<()> {
        self.mutate(plugin_id, |descriptor, config| {
            *config = descriptor.default_config();
            Ok(())
        })
        .await?;
        info!("Plugin `{plugin_id}` reset to defaults");
        Ok(())
    }

    async fn mutate<F>(&self, plugin_id: &str, f: F) -> HostResult<()>
    where
        F: FnOnce(&PluginDescriptor, &mut PluginConfig) -> HostResult<()>,
    {
        let descriptor = self
            .registry
            .get(plugin_id)
            .ok_or_else(|| HostError::plugin_not_found(plugin_id))?;

        let _guard = self.write_lock.lock().await;
        let mut next = self.state.read().await.clone();
        let config = next
            .plugins
            .entry(plugin_id.to_string())
            .or_insert_with(|| descriptor.default_config());
        f(&descriptor, config)?;
        self.commit(next, plugin_id).await
    }

    /// Persist `next`, then make it current and notify. Caller holds `write_lock`.
    async fn commit(&self, mut next: AppState, plugin_id: &str) -> HostResult<()> {
        next.revision += 1;
        let blob = serde_json::to_value(&next).map_err(|e| HostError::Persistence(e.to_string()))?;
        let flag = Value::Bool(next.is_enabled(plugin_id));
        self.storage
            .set(vec![
                (STATE_KEY.to_string(), blob),
                (enabled_flag_key(plugin_id), flag),
            ])
            .await?;

        *self.state.write().await = next.clone();
        self.notify(&next);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Stored config with any missing schema setting filled from its default.
    pub async fn get_config(&self, plugin_id: &str) -> Option<PluginConfig> {
        let state = self.state.read().await;
        let stored = state.plugins.get(plugin_id)?;
        Some(self.with_defaults(plugin_id, stored))
    }

    pub async fn get_all_configs(&self) -> BTreeMap<String, PluginConfig> {
        self.snapshot().await.plugins
    }

    /// Every config with defaults filled, read together with its revision.
    pub async fn snapshot(&self) -> AppState {
        let state = self.state.read().await;
        AppState {
            revision: state.revision,
            plugins: state
                .plugins
                .iter()
                .map(|(id, c)| (id.clone(), self.with_defaults(id, c)))
                .collect(),
        }
    }

    pub async fn is_enabled(&self, plugin_id: &str) -> bool {
        self.state.read().await.is_enabled(plugin_id)
    }

    /// Resolve one setting. Never absent for a key in the plugin's schema.
    pub async fn setting(&self, plugin_id: &str, setting_id: &str) -> HostResult<SettingValue> {
        let descriptor = self
            .registry
            .get(plugin_id)
            .ok_or_else(|| HostError::plugin_not_found(plugin_id))?;
        let field = descriptor
            .setting(setting_id)
            .ok_or_else(|| HostError::setting_not_found(plugin_id, setting_id))?;
        let state = self.state.read().await;
        Ok(state
            .plugins
            .get(plugin_id)
            .and_then(|c| c.settings.get(setting_id))
            .cloned()
            .unwrap_or_else(|| field.default.clone()))
    }

    fn with_defaults(&self, plugin_id: &str, stored: &PluginConfig) -> PluginConfig {
        let mut config = stored.clone();
        if let Some(descriptor) = self.registry.get(plugin_id) {
            for field in &descriptor.settings {
                config
                    .settings
                    .entry(field.id.clone())
                    .or_insert_with(|| field.default.clone());
            }
        }
        config
    }

    // -------------------------------------------------------------------------
    // Listeners
    // -------------------------------------------------------------------------

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&AppState) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Call every listener in its own failure boundary. Returns the failures.
    fn notify(&self, state: &AppState) -> Vec<String> {
        let listeners: Vec<(ListenerId, StateListener)> = {
            let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        let mut failures = Vec::new();
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(state))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("State listener {:?} failed: {e:#}", id);
                    failures.push(e.to_string());
                }
                Err(_) => {
                    warn!("State listener {:?} panicked", id);
                    failures.push(format!("listener {:?} panicked", id));
                }
            }
        }
        failures
    }
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("storage", &self.storage)
            .field("plugins", &self.registry.ids())
            .field("listener_count", &self.listener_count())
            .finish()
    }
}
