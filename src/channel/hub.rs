use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use host_protocol::{ChannelName, PortMessage};
use serde_json::Value;
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    channel::{Connector, PortLink},
    error::{HostError, HostResult},
};

struct HubPort {
    name: ChannelName,
    sender: UnboundedSender<Value>,
    reader: JoinHandle<()>,
}

/// Orchestrator side of the persistent channels.
///
/// Accepts connections from other contexts, forgets them when the peer
/// goes away and fans broadcasts out to every live port of a name.
#[derive(Clone)]
pub struct PortHub {
    ports: Arc<DashMap<u64, HubPort>>,
    available: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl PortHub {
    pub fn new() -> Self {
        Self {
            ports: Arc::new(DashMap::new()),
            available: Arc::new(AtomicBool::new(true)),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Send `msg` to every live port named `name`. Returns how many got it.
    pub fn broadcast(&self, name: ChannelName, msg: &PortMessage) -> usize {
        let payload = match serde_json::to_value(msg) {
            Ok(v) => v,
            Err(e) => {
                warn!("Could not serialise broadcast for `{}`: {}", name, e);
                return 0;
            }
        };
        let mut delivered = 0;
        let mut dead = Vec::new();
        for kv in self.ports.iter() {
            if kv.value().name != name {
                continue;
            }
            if kv.value().sender.send(payload.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(*kv.key());
            }
        }
        for id in dead {
            self.drop_port(id);
        }
        debug!("Broadcast on `{}` reached {} ports", name, delivered);
        delivered
    }

    /// Sever every live port, as the platform does when it suspends the
    /// background context.
    pub fn suspend(&self) {
        let ids: Vec<u64> = self.ports.iter().map(|kv| *kv.key()).collect();
        info!("Suspending hub, dropping {} ports", ids.len());
        for id in ids {
            self.drop_port(id);
        }
    }

    /// While unavailable, new connections are refused.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn port_count(&self, name: ChannelName) -> usize {
        self.ports.iter().filter(|kv| kv.value().name == name).count()
    }

    fn drop_port(&self, id: u64) {
        if let Some((_, port)) = self.ports.remove(&id) {
            port.reader.abort();
            debug!("Port {} on `{}` dropped", id, port.name);
        }
    }
}

impl Default for PortHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for PortHub {
    async fn open(&self, name: ChannelName) -> HostResult<PortLink> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(HostError::Delivery(format!(
                "background unavailable, cannot open `{name}`"
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (to_peer_tx, to_peer_rx) = unbounded_channel::<Value>();
        let (to_hub_tx, mut to_hub_rx) = unbounded_channel::<Value>();

        let ports = self.ports.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = to_hub_rx.recv().await {
                debug!("Port {} on `{}` sent {}", id, name, msg);
            }
            if ports.remove(&id).is_some() {
                debug!("Port {} on `{}` closed by peer", id, name);
            }
        });

        self.ports.insert(id, HubPort { name, sender: to_peer_tx, reader });
        info!("Accepted port {} on `{}`", id, name);
        Ok(PortLink { sender: to_hub_tx, incoming: to_peer_rx })
    }
}

impl fmt::Debug for PortHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortHub")
            .field("ports", &self.ports.len())
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish()
    }
}
