// src/channel/manager.rs

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use host_protocol::ChannelName;
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc::UnboundedSender, oneshot, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    channel::{backoff_delay, Connector, PortLink},
    error::HostResult,
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

pub type ReconnectCallback = Arc<dyn Fn(ChannelName) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    RetryPending,
    Exhausted,
}

/// What `connect` hands back. The live port itself stays inside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub name: ChannelName,
    pub id: u64,
}

struct Slot {
    id: u64,
    sender: UnboundedSender<Value>,
    reader: JoinHandle<()>,
}

struct Reconnect {
    enabled: bool,
    max_attempts: u32,
    attempts: u32,
    on_reconnect: Option<ReconnectCallback>,
}

/// Owns at most one live persistent channel per [`ChannelName`] and brings
/// it back after the host platform severs it.
///
/// Retries back off as `min(1s * 2^attempts, 10s)`. Caller-initiated
/// disconnects never schedule a retry.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    slots: Arc<DashMap<ChannelName, Slot>>,
    reconnect: Arc<DashMap<ChannelName, Reconnect>>,
    states: Arc<DashMap<ChannelName, ConnectionState>>,
    subscribers: Arc<DashMap<ChannelName, broadcast::Sender<Value>>>,
    connect_lock: Arc<Mutex<()>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slots: Arc::new(DashMap::new()),
            reconnect: Arc::new(DashMap::new()),
            states: Arc::new(DashMap::new()),
            subscribers: Arc::new(DashMap::new()),
            connect_lock: Arc::new(Mutex::new(())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Return the live connection for `name`, opening one if needed.
    ///
    /// A failed open does not touch the attempt counter; only a success
    /// resets it.
    pub async fn connect(&self, name: ChannelName) -> HostResult<Connection> {
        let _guard = self.connect_lock.lock().await;
        if let Some(slot) = self.slots.get(&name) {
            return Ok(Connection { name, id: slot.id });
        }

        self.states.insert(name, ConnectionState::Connecting);
        let link = match self.connector.open(name).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Could not connect `{}`: {}", name, e);
                self.states.insert(name, ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let PortLink { sender, mut incoming } = link;
        let mgr = self.clone();
        // Held back until the slot exists, so a port the host closed
        // already still reaches `on_host_disconnect`.
        let (registered, ready) = oneshot::channel::<()>();
        let reader = tokio::spawn(async move {
            if ready.await.is_err() {
                return;
            }
            while let Some(msg) = incoming.recv().await {
                mgr.deliver(name, msg);
            }
            mgr.on_host_disconnect(name, id);
        });

        self.slots.insert(name, Slot { id, sender, reader });
        self.states.insert(name, ConnectionState::Connected);
        if let Some(mut rc) = self.reconnect.get_mut(&name) {
            rc.attempts = 0;
        }
        info!("Connected `{}` (connection {})", name, id);
        let _ = registered.send(());
        Ok(Connection { name, id })
    }

    /// Send `payload` over the live connection. Best effort: a missing or
    /// dead connection is logged and reported as `false`.
    pub fn post_message(&self, name: ChannelName, payload: Value) -> bool {
        match self.slots.get(&name) {
            Some(slot) => match slot.sender.send(payload) {
                Ok(()) => true,
                Err(_) => {
                    warn!("Delivery on `{}` failed: peer is gone", name);
                    false
                }
            },
            None => {
                warn!("Delivery on `{}` failed: no live connection", name);
                false
            }
        }
    }

    /// Incoming payloads for `name`. The receiver outlives reconnections.
    pub fn subscribe(&self, name: ChannelName) -> broadcast::Receiver<Value> {
        self.subscribers
            .entry(name)
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe()
    }

    pub fn enable_auto_reconnect(
        &self,
        name: ChannelName,
        max_attempts: u32,
        on_reconnect: Option<ReconnectCallback>,
    ) {
        self.reconnect.insert(
            name,
            Reconnect { enabled: true, max_attempts, attempts: 0, on_reconnect },
        );
        if self.state(name) == ConnectionState::Exhausted {
            self.states.insert(name, ConnectionState::Disconnected);
        }
        debug!("Auto-reconnect armed for `{}` (max {} attempts)", name, max_attempts);
    }

    pub fn disable_auto_reconnect(&self, name: ChannelName) {
        if let Some(mut rc) = self.reconnect.get_mut(&name) {
            rc.enabled = false;
        }
        debug!("Auto-reconnect disabled for `{}`", name);
    }

    /// Caller-initiated teardown. Never schedules a retry.
    pub fn disconnect(&self, name: ChannelName) {
        if let Some((_, slot)) = self.slots.remove(&name) {
            slot.reader.abort();
            info!("Disconnected `{}` (connection {})", name, slot.id);
        }
        self.states.insert(name, ConnectionState::Disconnected);
    }

    pub fn disconnect_all(&self) {
        let names: Vec<ChannelName> = self.slots.iter().map(|kv| *kv.key()).collect();
        for name in names {
            self.disconnect(name);
        }
    }

    pub fn is_connected(&self, name: ChannelName) -> bool {
        self.slots.contains_key(&name)
    }

    pub fn state(&self, name: ChannelName) -> ConnectionState {
        self.states
            .get(&name)
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn attempts(&self, name: ChannelName) -> u32 {
        self.reconnect.get(&name).map(|rc| rc.attempts).unwrap_or(0)
    }

    fn deliver(&self, name: ChannelName, msg: Value) {
        debug!("Message on `{}`", name);
        if let Some(tx) = self.subscribers.get(&name) {
            let _ = tx.send(msg);
        }
    }

    fn on_host_disconnect(&self, name: ChannelName, id: u64) {
        // A caller-initiated disconnect already removed the slot.
        if self.slots.remove_if(&name, |_, slot| slot.id == id).is_none() {
            return;
        }
        info!("`{}` was disconnected by the host (connection {})", name, id);
        self.states.insert(name, ConnectionState::Disconnected);
        self.schedule_reconnect(name);
    }

    fn schedule_reconnect(&self, name: ChannelName) {
        let delay = {
            let Some(mut rc) = self.reconnect.get_mut(&name) else {
                return;
            };
            if !rc.enabled {
                return;
            }
            if rc.attempts >= rc.max_attempts {
                rc.enabled = false;
                drop(rc);
                self.states.insert(name, ConnectionState::Exhausted);
                warn!("Giving up on `{}` after {} attempts", name, self.attempts(name));
                return;
            }
            let delay = backoff_delay(rc.attempts);
            rc.attempts += 1;
            delay
        };

        self.states.insert(name, ConnectionState::RetryPending);
        info!("Reconnecting `{}` in {:?}", name, delay);
        let mgr = self.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            mgr.retry(name).await;
        });
    }

    async fn retry(&self, name: ChannelName) {
        let callback = match self.reconnect.get(&name) {
            Some(rc) if rc.enabled => rc.on_reconnect.clone(),
            _ => {
                debug!("Retry for `{}` dropped, auto-reconnect disabled", name);
                if self.state(name) == ConnectionState::RetryPending {
                    self.states.insert(name, ConnectionState::Disconnected);
                }
                return;
            }
        };
        if self.is_connected(name) {
            return;
        }
        match self.connect(name).await {
            Ok(_) => {
                if let Some(cb) = callback {
                    cb(name);
                }
            }
            Err(_) => self.schedule_reconnect(name),
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live: Vec<ChannelName> = self.slots.iter().map(|kv| *kv.key()).collect();
        f.debug_struct("ConnectionManager")
            .field("live", &live)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::hub::PortHub;
    use async_trait::async_trait;
    use host_protocol::PortMessage;
    use std::{sync::Mutex as StdMutex, time::Duration};
    use tokio::time::Instant;

    /// Hub wrapper that records when each open was attempted.
    struct RecordingConnector {
        hub: PortHub,
        opens: StdMutex<Vec<Instant>>,
    }

    #[async_trait]
    impl Connector for RecordingConnector {
        async fn open(&self, name: ChannelName) -> HostResult<PortLink> {
            self.opens.lock().unwrap().push(Instant::now());
            self.hub.open(name).await
        }
    }

    fn setup() -> (PortHub, Arc<RecordingConnector>, ConnectionManager) {
        let hub = PortHub::new();
        let connector = Arc::new(RecordingConnector { hub: hub.clone(), opens: StdMutex::new(vec![]) });
        let mgr = ConnectionManager::new(connector.clone());
        (hub, connector, mgr)
    }

    #[test]
    fn delay_sequence_is_capped() {
        let ms: Vec<u128> = (0..6).map(|a| backoff_delay(a).as_millis()).collect();
        assert_eq!(ms, vec![1000, 2000, 4000, 8000, 10000, 10000]);
        assert_eq!(backoff_delay(60), Duration::from_millis(10_000));
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (hub, connector, mgr) = setup();
        let a = mgr.connect(ChannelName::PluginEvents).await.unwrap();
        let b = mgr.connect(ChannelName::PluginEvents).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(connector.opens.lock().unwrap().len(), 1);
        assert_eq!(hub.port_count(ChannelName::PluginEvents), 1);
    }

    #[tokio::test]
    async fn post_without_connection_is_silent() {
        let (_hub, _c, mgr) = setup();
        assert!(!mgr.post_message(ChannelName::Popup, serde_json::json!({"x": 1})));
    }

    #[tokio::test]
    async fn subscribers_receive_hub_broadcasts() {
        let (hub, _c, mgr) = setup();
        let mut rx = mgr.subscribe(ChannelName::PluginEvents);
        mgr.connect(ChannelName::PluginEvents).await.unwrap();
        let msg = PortMessage::PluginStateChanged { state: Default::default() };
        assert_eq!(hub.broadcast(ChannelName::PluginEvents, &msg), 1);
        let got = rx.recv().await.unwrap();
        assert_eq!(got["type"], "PLUGIN_STATE_CHANGED");
    }

    #[tokio::test(start_paused = true)]
    async fn host_disconnect_retries_with_backoff() {
        let (hub, connector, mgr) = setup();
        mgr.enable_auto_reconnect(ChannelName::PluginEvents, DEFAULT_MAX_ATTEMPTS, None);
        mgr.connect(ChannelName::PluginEvents).await.unwrap();

        hub.set_available(false);
        let suspended_at = Instant::now();
        hub.suspend();

        sleep(Duration::from_millis(3500)).await;
        let opens = connector.opens.lock().unwrap().clone();
        assert_eq!(opens.len(), 3, "initial connect plus two retries");
        let first = opens[1] - suspended_at;
        let second = opens[2] - opens[1];
        assert!(first >= Duration::from_millis(1000) && first < Duration::from_millis(1010));
        assert!(second >= Duration::from_millis(2000) && second < Duration::from_millis(2010));
        assert_eq!(mgr.state(ChannelName::PluginEvents), ConnectionState::RetryPending);

        hub.set_available(true);
        sleep(Duration::from_millis(4100)).await;
        assert!(mgr.is_connected(ChannelName::PluginEvents));
        assert_eq!(mgr.attempts(ChannelName::PluginEvents), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_stop_until_rearmed() {
        let (hub, connector, mgr) = setup();
        mgr.enable_auto_reconnect(ChannelName::PluginEvents, 2, None);
        mgr.connect(ChannelName::PluginEvents).await.unwrap();
        hub.set_available(false);
        hub.suspend();

        sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.opens.lock().unwrap().len(), 3);
        assert_eq!(mgr.state(ChannelName::PluginEvents), ConnectionState::Exhausted);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.opens.lock().unwrap().len(), 3);

        hub.set_available(true);
        mgr.enable_auto_reconnect(ChannelName::PluginEvents, 2, None);
        assert_eq!(mgr.state(ChannelName::PluginEvents), ConnectionState::Disconnected);
        mgr.connect(ChannelName::PluginEvents).await.unwrap();
        hub.suspend();
        sleep(Duration::from_millis(1100)).await;
        assert!(mgr.is_connected(ChannelName::PluginEvents));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_disconnect_never_reconnects() {
        let (_hub, connector, mgr) = setup();
        mgr.enable_auto_reconnect(ChannelName::PluginEvents, DEFAULT_MAX_ATTEMPTS, None);
        mgr.connect(ChannelName::PluginEvents).await.unwrap();
        mgr.disconnect_all();

        sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.opens.lock().unwrap().len(), 1);
        assert!(!mgr.is_connected(ChannelName::PluginEvents));
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_mid_backoff_drops_pending_retry() {
        let (hub, connector, mgr) = setup();
        mgr.enable_auto_reconnect(ChannelName::PluginEvents, DEFAULT_MAX_ATTEMPTS, None);
        mgr.connect(ChannelName::PluginEvents).await.unwrap();
        hub.suspend();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(mgr.state(ChannelName::PluginEvents), ConnectionState::RetryPending);

        mgr.disable_auto_reconnect(ChannelName::PluginEvents);
        sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.opens.lock().unwrap().len(), 1);
        assert_eq!(mgr.state(ChannelName::PluginEvents), ConnectionState::Disconnected);
    }

    /// Hands out ports whose host end is gone before `open` returns.
    struct SeveringConnector;

    #[async_trait]
    impl Connector for SeveringConnector {
        async fn open(&self, _name: ChannelName) -> HostResult<PortLink> {
            let (sender, _outgoing) = tokio::sync::mpsc::unbounded_channel();
            let (_host, incoming) = tokio::sync::mpsc::unbounded_channel();
            Ok(PortLink { sender, incoming })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn port_closed_during_connect_is_retried() {
        for _ in 0..50 {
            let mgr = ConnectionManager::new(Arc::new(SeveringConnector));
            mgr.enable_auto_reconnect(ChannelName::PluginEvents, DEFAULT_MAX_ATTEMPTS, None);
            mgr.connect(ChannelName::PluginEvents).await.unwrap();
            sleep(Duration::from_millis(20)).await;
            assert!(!mgr.is_connected(ChannelName::PluginEvents));
            assert_eq!(mgr.state(ChannelName::PluginEvents), ConnectionState::RetryPending);
            mgr.disable_auto_reconnect(ChannelName::PluginEvents);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_callback_fires() {
        let (hub, _c, mgr) = setup();
        let hits = Arc::new(AtomicU64::new(0));
        let hits_clone = hits.clone();
        mgr.enable_auto_reconnect(
            ChannelName::PluginEvents,
            DEFAULT_MAX_ATTEMPTS,
            Some(Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );
        mgr.connect(ChannelName::PluginEvents).await.unwrap();
        hub.suspend();
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(hub.port_count(ChannelName::PluginEvents), 1);
    }
}
