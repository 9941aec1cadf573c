use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use host_protocol::{
    message::ConfigsResponse, plugin::KeyToken, AppState, ChannelName, Command, PortMessage,
    TabMessage,
};
use serde_json::Value;
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        mpsc::UnboundedReceiver,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    background::{Background, TabRequest},
    channel::{ConnectionManager, Connector},
    content::{
        modal::ModalPresenter,
        page::PageDom,
        session::{ContentPlugin, PageSession},
    },
    dispatcher::Messenger,
    error::{HostError, HostResult},
};

/// The content script of one page load.
///
/// Keeps the page's activations in line with the orchestrator's state:
/// fetches a snapshot on load, follows `PLUGIN_STATE_CHANGED` on
/// `plugin-events` and re-fetches after every reconnect.
pub struct ContentScript {
    id: Uuid,
    session: Mutex<PageSession>,
    modal: Mutex<ModalPresenter>,
    connections: ConnectionManager,
    messenger: Arc<dyn Messenger>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ContentScript {
    pub fn new(
        dom: Arc<dyn PageDom>,
        plugins: Vec<Arc<dyn ContentPlugin>>,
        connector: Arc<dyn Connector>,
        messenger: Arc<dyn Messenger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            session: Mutex::new(PageSession::new(dom.clone(), plugins)),
            modal: Mutex::new(ModalPresenter::new(dom)),
            connections: ConnectionManager::new(connector),
            messenger,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Boot a page against an in-process background: open a tab, load the
    /// script and serve the tab's forwarded messages.
    pub async fn launch(
        background: &Background,
        dom: Arc<dyn PageDom>,
        plugins: Vec<Arc<dyn ContentPlugin>>,
        max_attempts: u32,
    ) -> HostResult<(u64, Arc<Self>)> {
        let script = Self::new(
            dom,
            plugins,
            Arc::new(background.hub().clone()),
            Arc::new(background.messenger()),
        );
        let (tab_id, requests) = background.tabs().open_tab();
        script.serve_tab(requests);
        script.load(max_attempts).await?;
        Ok((tab_id, script))
    }

    fn session(&self) -> MutexGuard<'_, PageSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn modal(&self) -> MutexGuard<'_, ModalPresenter> {
        self.modal.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(task);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Page-load sequence. A failed first connect is logged; the page keeps
    /// the fetched snapshot.
    pub async fn load(self: &Arc<Self>, max_attempts: u32) -> HostResult<()> {
        info!("Content script {} loading", self.id);
        let events = self.connections.subscribe(ChannelName::PluginEvents);
        let weak = Arc::downgrade(self);
        self.track(tokio::spawn(follow_events(weak.clone(), events)));

        self.connections.enable_auto_reconnect(
            ChannelName::PluginEvents,
            max_attempts,
            Some(Arc::new(move |name| {
                info!("`{name}` is back, refreshing plugin state");
                let weak = weak.clone();
                tokio::spawn(async move {
                    if let Some(script) = weak.upgrade() {
                        if let Err(e) = script.refresh().await {
                            warn!("State refresh after reconnect failed: {e}");
                        }
                    }
                });
            })),
        );
        if let Err(e) = self.connections.connect(ChannelName::PluginEvents).await {
            warn!("Page loaded without live plugin events: {e}");
        }
        self.refresh().await
    }

    /// Fetch the full state and reconcile the page with it.
    pub async fn refresh(&self) -> HostResult<()> {
        let reply = self.messenger.send(Command::GetPluginStates.to_value()).await?;
        let configs: ConfigsResponse = serde_json::from_value(reply)
            .map_err(|e| HostError::Delivery(format!("unexpected GET_PLUGIN_STATES reply: {e}")))?;
        self.apply_state(&AppState { revision: configs.revision, plugins: configs.configs });
        Ok(())
    }

    pub fn apply_state(&self, state: &AppState) {
        self.session().apply_state(state);
    }

    fn apply_port_message(&self, payload: Value) {
        match serde_json::from_value::<PortMessage>(payload) {
            Ok(PortMessage::PluginStateChanged { state }) => self.apply_state(&state),
            Err(e) => debug!("Ignoring unknown port message: {e}"),
        }
    }

    pub fn handle_tab_message(&self, msg: TabMessage) -> HostResult<()> {
        match msg {
            TabMessage::OpenModal(r) => {
                if !self.session().has_plugin(&r.plugin_id) {
                    return Err(HostError::plugin_not_found(&r.plugin_id));
                }
                self.modal().open(&r.plugin_id);
                Ok(())
            }
            TabMessage::ExecutePlugin(r) => self.session().execute(&r.plugin_id),
        }
    }

    /// Feed a key chord from the page. Returns the plugins that ran.
    pub fn handle_keys(&self, pressed: &[KeyToken]) -> Vec<String> {
        self.session().handle_keys(pressed)
    }

    pub fn serve_tab(self: &Arc<Self>, mut requests: UnboundedReceiver<TabRequest>) {
        let weak = Arc::downgrade(self);
        self.track(tokio::spawn(async move {
            while let Some((msg, reply)) = requests.recv().await {
                let outcome = match weak.upgrade() {
                    Some(script) => script.handle_tab_message(msg),
                    None => Err(HostError::Delivery("content script is gone".into())),
                };
                let _ = reply.send(outcome);
            }
        }));
    }

    /// Extension context went away: deactivate everything, then drop the
    /// channels without letting them come back.
    pub fn invalidate(&self) {
        self.connections.disable_auto_reconnect(ChannelName::PluginEvents);
        self.session().invalidate();
        self.modal().close();
        self.connections.disconnect_all();
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        info!("Content script {} invalidated", self.id);
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.session().active_ids()
    }

    pub fn modal_mounted(&self) -> Option<String> {
        self.modal().mounted().map(str::to_string)
    }
}

async fn follow_events(script: Weak<ContentScript>, mut events: broadcast::Receiver<Value>) {
    loop {
        match events.recv().await {
            Ok(payload) => match script.upgrade() {
                Some(s) => s.apply_port_message(payload),
                None => break,
            },
            Err(RecvError::Lagged(n)) => {
                warn!("Missed {n} plugin events, refreshing");
                let Some(s) = script.upgrade() else { break };
                if let Err(e) = s.refresh().await {
                    warn!("State refresh failed: {e}");
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

impl fmt::Debug for ContentScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentScript")
            .field("id", &self.id)
            .field("session", &*self.session())
            .field("connections", &self.connections)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::PortHub,
        content::{page::MemoryPage, session::tests::{spy_descriptor, Recorder}},
    };
    use async_trait::async_trait;
    use host_protocol::PluginConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers GET_PLUGIN_STATES with a fixed snapshot.
    struct FixedStates {
        enabled: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Messenger for FixedStates {
        async fn send(&self, request: Value) -> HostResult<Value> {
            assert_eq!(request["type"], "GET_PLUGIN_STATES");
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"configs": {"css-spy": {"enabled": self.enabled, "settings": {}}}}))
        }
    }

    fn script(hub: &PortHub, enabled: bool) -> (Arc<ContentScript>, Arc<Recorder>, Arc<FixedStates>, Arc<MemoryPage>) {
        let page = MemoryPage::new(vec![]);
        let spy = Arc::new(Recorder::new(spy_descriptor()));
        let messenger = Arc::new(FixedStates { enabled, calls: AtomicUsize::new(0) });
        let script = ContentScript::new(
            page.clone(),
            vec![spy.clone()],
            Arc::new(hub.clone()),
            messenger.clone(),
        );
        (script, spy, messenger, page)
    }

    #[tokio::test]
    async fn load_activates_enabled_plugins() {
        let hub = PortHub::new();
        let (script, spy, messenger, _) = script(&hub, true);
        script.load(5).await.unwrap();
        assert_eq!(script.active_ids(), vec!["css-spy".to_string()]);
        assert_eq!(spy.activations.load(Ordering::SeqCst), 1);
        assert_eq!(messenger.calls.load(Ordering::SeqCst), 1);
        assert_eq!(hub.port_count(ChannelName::PluginEvents), 1);
    }

    #[tokio::test]
    async fn broadcast_deactivates() {
        let hub = PortHub::new();
        let (script, spy, _, _) = script(&hub, true);
        script.load(5).await.unwrap();

        let mut state = AppState::default();
        state.plugins.insert("css-spy".into(), PluginConfig::default());
        hub.broadcast(ChannelName::PluginEvents, &PortMessage::PluginStateChanged { state });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(script.active_ids().is_empty());
        assert_eq!(spy.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tab_messages_drive_modal_and_execute() {
        let hub = PortHub::new();
        let (script, spy, _, page) = script(&hub, true);
        script.load(5).await.unwrap();

        script.handle_tab_message(TabMessage::OpenModal(Command::plugin_ref("css-spy"))).unwrap();
        assert_eq!(page.overlays(), vec!["css-spy".to_string()]);
        script.handle_tab_message(TabMessage::ExecutePlugin(Command::plugin_ref("css-spy"))).unwrap();
        assert_eq!(spy.executions.load(Ordering::SeqCst), 1);
        assert!(script
            .handle_tab_message(TabMessage::OpenModal(Command::plugin_ref("ghost")))
            .is_err());
    }

    #[tokio::test]
    async fn invalidate_tears_down_without_reconnecting() {
        let hub = PortHub::new();
        let (script, spy, _, page) = script(&hub, true);
        script.load(5).await.unwrap();
        script.handle_tab_message(TabMessage::OpenModal(Command::plugin_ref("css-spy"))).unwrap();

        script.invalidate();
        assert!(script.active_ids().is_empty());
        assert_eq!(spy.cleanups.load(Ordering::SeqCst), 1);
        assert!(page.overlays().is_empty());
        assert!(!script.connections().is_connected(ChannelName::PluginEvents));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_refetches_state() {
        let hub = PortHub::new();
        let (script, _, messenger, _) = script(&hub, true);
        script.load(5).await.unwrap();

        hub.suspend();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(script.connections().is_connected(ChannelName::PluginEvents));
        assert_eq!(messenger.calls.load(Ordering::SeqCst), 2);
    }

    /// Takes its snapshot, then lets a newer broadcast overtake the reply.
    struct OvertakenStates {
        hub: PortHub,
    }

    #[async_trait]
    impl Messenger for OvertakenStates {
        async fn send(&self, _request: Value) -> HostResult<Value> {
            let snapshot = json!({
                "revision": 1,
                "configs": {"css-spy": {"enabled": true, "settings": {}}}
            });
            let mut newer = AppState { revision: 2, ..AppState::default() };
            newer.plugins.insert("css-spy".into(), PluginConfig::default());
            self.hub
                .broadcast(ChannelName::PluginEvents, &PortMessage::PluginStateChanged { state: newer });
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
            Ok(snapshot)
        }
    }

    #[tokio::test]
    async fn older_snapshot_never_rolls_back_newer_broadcast() {
        let hub = PortHub::new();
        let page = MemoryPage::new(vec![]);
        let spy = Arc::new(Recorder::new(spy_descriptor()));
        let script = ContentScript::new(
            page,
            vec![spy.clone()],
            Arc::new(hub.clone()),
            Arc::new(OvertakenStates { hub: hub.clone() }),
        );
        script.load(5).await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(script.active_ids().is_empty());
        assert_eq!(spy.activations.load(Ordering::SeqCst), 0);
    }
}
