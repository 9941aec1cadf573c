use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use host_protocol::{
    message::UpdateSettingParams, plugin::SettingKind, ChannelName, Command, PluginConfig,
    PluginDescriptor, SettingValue,
};
use plugin_host::{
    channel::ConnectionState,
    content::{Activation, ContentPlugin, ContentScript, MemoryPage, NoCleanup, PageHandle},
    net::{FsDownloader, HttpFetcher},
    state::{enabled_flag_key, STATE_KEY},
    storage::{FileStorage, InMemoryStorage, Storage},
    Background,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::time::sleep;

struct NoNetwork;

#[async_trait]
impl HttpFetcher for NoNetwork {
    async fn head_content_length(&self, url: &str) -> Result<Option<u64>> {
        Err(anyhow!("offline: {url}"))
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        Err(anyhow!("offline: {url}"))
    }
}

struct Spy(PluginDescriptor);

impl ContentPlugin for Spy {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.0
    }

    fn activate(&self, page: &PageHandle, _config: &PluginConfig) -> Result<Box<dyn Activation>> {
        page.add_listener("mouseover", |_| {});
        Ok(Box::new(NoCleanup))
    }
}

fn css_spy() -> PluginDescriptor {
    PluginDescriptor::new("css-spy", "CSS Spy")
        .with_setting("opacity", "Overlay opacity", SettingKind::Number, 0.9)
}

async fn background(storage: Arc<dyn Storage>, dir: &TempDir) -> Background {
    let fetcher = Arc::new(NoNetwork);
    Background::start(
        storage,
        vec![css_spy()],
        Arc::new(FsDownloader::new(dir.path().join("downloads"), fetcher.clone())),
        fetcher,
    )
    .await
    .unwrap()
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn css_spy_setting_round_trip() {
    let dir = TempDir::new().unwrap();
    let bg = background(InMemoryStorage::new(), &dir).await;
    let messenger = bg.messenger();

    let r = messenger
        .call(&Command::UpdateSetting(UpdateSettingParams {
            plugin_id: "css-spy".into(),
            setting_id: "opacity".into(),
            value: SettingValue::Number(0.5),
        }))
        .await
        .unwrap();
    assert_eq!(r, json!({"success": true}));

    let r = messenger
        .call(&Command::GetPluginState(Command::plugin_ref("css-spy")))
        .await
        .unwrap();
    assert_eq!(r, json!({"config": {"enabled": true, "settings": {"opacity": 0.5}, "shortcuts": {}}}));
}

#[tokio::test]
async fn state_survives_restart_on_disk() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("state.json");
    {
        let bg = background(FileStorage::new(&file), &dir).await;
        bg.messenger()
            .call(&Command::DisablePlugin(Command::plugin_ref("css-spy")))
            .await
            .unwrap();
    }

    let storage = FileStorage::new(&file);
    assert_eq!(storage.get(&enabled_flag_key("css-spy")).await.unwrap(), Some(json!(false)));
    assert!(storage.get(STATE_KEY).await.unwrap().is_some());

    let bg = background(storage, &dir).await;
    assert!(!bg.store().is_enabled("css-spy").await);
}

#[tokio::test]
async fn page_follows_orchestrator_state() {
    let dir = TempDir::new().unwrap();
    let bg = background(InMemoryStorage::new(), &dir).await;
    let page = MemoryPage::new(vec![]);
    let (_tab, script) =
        ContentScript::launch(&bg, page.clone(), vec![Arc::new(Spy(css_spy()))], 5)
            .await
            .unwrap();
    assert_eq!(script.active_ids(), vec!["css-spy".to_string()]);
    assert_eq!(page.listener_count(), 1);

    bg.messenger()
        .call(&Command::TogglePlugin(Command::plugin_ref("css-spy")))
        .await
        .unwrap();
    settle().await;
    assert!(script.active_ids().is_empty());
    assert_eq!(page.listener_count(), 0);

    let r = bg
        .messenger()
        .call(&Command::OpenModal(Command::plugin_ref("css-spy")))
        .await
        .unwrap();
    assert_eq!(r, json!({"success": true}));
    assert_eq!(script.modal_mounted().as_deref(), Some("css-spy"));

    script.invalidate();
    let r = bg
        .messenger()
        .call(&Command::OpenModal(Command::plugin_ref("css-spy")))
        .await
        .unwrap();
    assert_eq!(r["success"], json!(false));
}

#[tokio::test(start_paused = true)]
async fn plugin_events_recover_after_suspension() {
    let dir = TempDir::new().unwrap();
    let bg = background(InMemoryStorage::new(), &dir).await;
    let (_tab, script) = ContentScript::launch(
        &bg,
        MemoryPage::new(vec![]),
        vec![Arc::new(Spy(css_spy()))],
        5,
    )
    .await
    .unwrap();
    let conns = script.connections();
    assert_eq!(conns.state(ChannelName::PluginEvents), ConnectionState::Connected);

    bg.hub().set_available(false);
    bg.suspend();
    sleep(Duration::from_millis(500)).await;
    assert_eq!(conns.state(ChannelName::PluginEvents), ConnectionState::RetryPending);
    assert_eq!(conns.attempts(ChannelName::PluginEvents), 1);

    // First retry at 1000ms fails, the next is due 2000ms later.
    sleep(Duration::from_millis(600)).await;
    assert_eq!(conns.attempts(ChannelName::PluginEvents), 2);
    sleep(Duration::from_millis(1800)).await;
    assert_eq!(conns.attempts(ChannelName::PluginEvents), 2);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(conns.attempts(ChannelName::PluginEvents), 3);

    // A change made while the page is cut off reaches it through the
    // re-fetch that follows the reconnect.
    bg.messenger()
        .call(&Command::DisablePlugin(Command::plugin_ref("css-spy")))
        .await
        .unwrap();
    assert_eq!(script.active_ids(), vec!["css-spy".to_string()]);

    bg.hub().set_available(true);
    sleep(Duration::from_millis(4100)).await;
    assert_eq!(conns.state(ChannelName::PluginEvents), ConnectionState::Connected);
    assert_eq!(conns.attempts(ChannelName::PluginEvents), 0);
    assert!(script.active_ids().is_empty());
}
