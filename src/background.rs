use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use host_protocol::{ChannelName, PluginDescriptor, PortMessage, TabMessage};
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    oneshot,
};
use tracing::{debug, info};

use crate::{
    channel::PortHub,
    dispatcher::{CommandDispatcher, DispatcherHandle, HostContext, TabMessenger},
    error::{HostError, HostResult},
    net::{Downloader, HttpFetcher},
    registry::DescriptorRegistry,
    state::{ListenerId, PluginManager},
    storage::Storage,
};

/// A forwarded tab message and the slot for the page's answer.
pub type TabRequest = (TabMessage, oneshot::Sender<HostResult<()>>);

/// Knows the open pages and which one is in front.
#[derive(Default)]
pub struct TabRouter {
    tabs: DashMap<u64, UnboundedSender<TabRequest>>,
    active: Mutex<Option<u64>>,
    next_id: AtomicU64,
}

impl TabRouter {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), ..Default::default() }
    }

    /// Register a new page. The newest page becomes the active one.
    pub fn open_tab(&self) -> (u64, UnboundedReceiver<TabRequest>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded_channel();
        self.tabs.insert(id, tx);
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
        debug!("Tab {id} opened");
        (id, rx)
    }

    pub fn close_tab(&self, id: u64) {
        self.tabs.remove(&id);
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if *active == Some(id) {
            *active = None;
        }
        debug!("Tab {id} closed");
    }

    pub fn activate(&self, id: u64) -> bool {
        if !self.tabs.contains_key(&id) {
            return false;
        }
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
        true
    }

    pub fn active(&self) -> Option<u64> {
        *self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TabMessenger for TabRouter {
    async fn send_to_active_tab(&self, msg: TabMessage) -> HostResult<()> {
        let id = self
            .active()
            .ok_or_else(|| HostError::Delivery("no active tab".into()))?;
        let sender = self
            .tabs
            .get(&id)
            .map(|s| s.clone())
            .ok_or_else(|| HostError::Delivery(format!("tab {id} is gone")))?;
        let (tx, rx) = oneshot::channel();
        sender
            .send((msg, tx))
            .map_err(|_| HostError::Delivery(format!("tab {id} has no content script")))?;
        rx.await
            .map_err(|_| HostError::Delivery(format!("tab {id} did not answer")))?
    }
}

impl fmt::Debug for TabRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabRouter")
            .field("tabs", &self.tabs.len())
            .field("active", &self.active())
            .finish()
    }
}

/// The long-lived orchestrator context.
///
/// Built once at start-up and handed to whatever needs it: owns the state
/// store, the port hub every other context connects to, the tab router and
/// the running command dispatcher.
pub struct Background {
    store: Arc<PluginManager>,
    hub: PortHub,
    tabs: Arc<TabRouter>,
    handle: DispatcherHandle,
    broadcaster: ListenerId,
}

impl Background {
    pub async fn start(
        storage: Arc<dyn Storage>,
        descriptors: Vec<PluginDescriptor>,
        downloader: Arc<dyn Downloader>,
        fetcher: Arc<dyn HttpFetcher>,
    ) -> HostResult<Self> {
        let store = PluginManager::new(storage, DescriptorRegistry::new()).await?;
        for descriptor in descriptors {
            store.register(descriptor).await?;
        }

        let hub = PortHub::new();
        let broadcast_hub = hub.clone();
        let broadcaster = store.add_listener(move |state| {
            let msg = PortMessage::PluginStateChanged { state: state.clone() };
            broadcast_hub.broadcast(ChannelName::PluginEvents, &msg);
            Ok(())
        });

        let tabs = Arc::new(TabRouter::new());
        let dispatcher = CommandDispatcher::new(HostContext {
            store: store.clone(),
            tabs: tabs.clone(),
            downloader,
            fetcher,
        });
        let handle = dispatcher.spawn();
        info!("Background started with {} plugins", store.registry().len());

        Ok(Self { store, hub, tabs, handle, broadcaster })
    }

    pub fn store(&self) -> &Arc<PluginManager> {
        &self.store
    }

    pub fn hub(&self) -> &PortHub {
        &self.hub
    }

    pub fn tabs(&self) -> &Arc<TabRouter> {
        &self.tabs
    }

    /// Request channel for UI surfaces and content scripts.
    pub fn messenger(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// The platform suspended the orchestrator: every open port is severed.
    pub fn suspend(&self) {
        self.hub.suspend();
    }
}

impl Drop for Background {
    fn drop(&mut self) {
        self.store.remove_listener(self.broadcaster);
    }
}

impl fmt::Debug for Background {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Background")
            .field("store", &self.store)
            .field("hub", &self.hub)
            .field("tabs", &self.tabs)
            .finish()
    }
}
