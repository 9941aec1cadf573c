/*
┌──────────────── background ────────────────┐
│  PluginManager ──listener──▶ PortHub       │
│                               │ broadcast  │
└───────────────────────────────┼────────────┘
                                │  plugin-events
          ┌─────────────────────┼──────────────────────┐
          ▼                     ▼                      ▼
┌ content script ─┐   ┌ content script ─┐    ┌ popup / options ┐
│ConnectionManager│   │ConnectionManager│    │ConnectionManager│
│  reconnect with │   │                 │    │                 │
│  backoff        │   │                 │    │                 │
└─────────────────┘   └─────────────────┘    └─────────────────┘
*/
pub mod hub;
pub mod manager;

use std::time::Duration;

use async_trait::async_trait;
use host_protocol::ChannelName;
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::error::HostResult;

pub use hub::PortHub;
pub use manager::{Connection, ConnectionManager, ConnectionState, DEFAULT_MAX_ATTEMPTS};

const BASE_DELAY_MS: u64 = 1_000;
const MAX_DELAY_MS: u64 = 10_000;

/// One end of a persistent channel as handed out by the host platform.
///
/// `incoming` yielding `None` means the platform severed the channel.
pub struct PortLink {
    pub sender: UnboundedSender<Value>,
    pub incoming: UnboundedReceiver<Value>,
}

/// The host platform's ability to open a named persistent channel.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, name: ChannelName) -> HostResult<PortLink>;
}

/// `min(1000ms * 2^attempts, 10000ms)`
pub fn backoff_delay(attempts: u32) -> Duration {
    let factor = 1u64 << attempts.min(16);
    Duration::from_millis(BASE_DELAY_MS.saturating_mul(factor).min(MAX_DELAY_MS))
}
