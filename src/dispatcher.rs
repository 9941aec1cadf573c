use std::{fmt, sync::Arc};

use async_trait::async_trait;
use host_protocol::{
    message::{
        ConfigResponse, ConfigsResponse, FileSizeResponse, PluginListResponse, PluginResponse,
        SettingsResponse, SuccessResponse,
    },
    AppState, Command, CommandKind, TabMessage,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    error::{HostError, HostResult},
    net::{file_size, Downloader, HttpFetcher},
    state::PluginManager,
};

/// Delivers a message to the content script of the currently active page.
#[async_trait]
pub trait TabMessenger: Send + Sync {
    async fn send_to_active_tab(&self, msg: TabMessage) -> HostResult<()>;
}

/// One-shot request/response channel from a UI surface or content script
/// to the orchestrator.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, request: Value) -> HostResult<Value>;
}

/// Everything a command handler may touch.
pub struct HostContext {
    pub store: Arc<PluginManager>,
    pub tabs: Arc<dyn TabMessenger>,
    pub downloader: Arc<dyn Downloader>,
    pub fetcher: Arc<dyn HttpFetcher>,
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext").field("store", &self.store).finish()
    }
}

/// Routes each request to the handler bound to its `type`.
///
/// Every recognised request gets exactly one reply, even when the handler
/// fails or panics. Unrecognised types reply `null`.
#[derive(Clone, Debug)]
pub struct CommandDispatcher {
    ctx: Arc<HostContext>,
}

impl CommandDispatcher {
    pub fn new(ctx: HostContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &HostContext {
        &self.ctx
    }

    pub async fn dispatch(&self, request: Value) -> Value {
        let Some(kind) = command_kind(&request) else {
            warn!("Ignoring request with unknown type {:?}", request.get("type"));
            return Value::Null;
        };
        debug!("Dispatching {kind}");

        let ctx = self.ctx.clone();
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let _ = tx.send(handle_request(&ctx, kind, request).await);
        });

        let outcome = match rx.await {
            Ok(result) => result,
            Err(_) => {
                let reason = match task.await {
                    Err(e) if e.is_panic() => "handler panicked".to_string(),
                    Err(e) => e.to_string(),
                    Ok(()) => "handler dropped its reply".to_string(),
                };
                error!("{kind} failed: {reason}");
                Err(HostError::Handler(reason))
            }
        };

        match outcome {
            Ok(reply) => reply,
            Err(e) => {
                warn!("{kind} failed: {e}");
                failure(kind, &e)
            }
        }
    }

    /// Serve requests from an mpsc queue. Network-bound commands run
    /// concurrently; state commands are handled in arrival order.
    pub fn spawn(self) -> DispatcherHandle {
        let (tx, mut rx) = mpsc::channel::<(Value, oneshot::Sender<Value>)>(32);
        tokio::spawn(async move {
            while let Some((request, reply)) = rx.recv().await {
                if matches!(
                    command_kind(&request),
                    Some(CommandKind::DownloadImage | CommandKind::GetFileSize)
                ) {
                    let me = self.clone();
                    tokio::spawn(async move {
                        let _ = reply.send(me.dispatch(request).await);
                    });
                } else {
                    let _ = reply.send(self.dispatch(request).await);
                }
            }
            debug!("Dispatcher queue closed");
        });
        DispatcherHandle { tx }
    }
}

/// Cloneable client side of [`CommandDispatcher::spawn`].
#[derive(Clone, Debug)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<(Value, oneshot::Sender<Value>)>,
}

impl DispatcherHandle {
    pub async fn call(&self, command: &Command) -> HostResult<Value> {
        self.send(command.to_value()).await
    }
}

#[async_trait]
impl Messenger for DispatcherHandle {
    async fn send(&self, request: Value) -> HostResult<Value> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send((request, tx))
            .await
            .map_err(|_| HostError::Delivery("dispatcher is gone".into()))?;
        rx.await
            .map_err(|_| HostError::Delivery("dispatcher dropped the reply".into()))
    }
}

fn command_kind(request: &Value) -> Option<CommandKind> {
    request.get("type")?.as_str()?.parse().ok()
}

fn reply<T: Serialize>(body: T) -> HostResult<Value> {
    serde_json::to_value(body).map_err(|e| HostError::Handler(e.to_string()))
}

fn failure(kind: CommandKind, err: &HostError) -> Value {
    let body = match kind {
        CommandKind::GetFileSize => serde_json::to_value(FileSizeResponse {
            success: false,
            size: None,
            error: Some(err.to_string()),
        }),
        _ => serde_json::to_value(SuccessResponse::fail(err.to_string())),
    };
    body.unwrap_or(Value::Null)
}

async fn handle_request(ctx: &HostContext, kind: CommandKind, request: Value) -> HostResult<Value> {
    let command: Command = serde_json::from_value(request)
        .map_err(|e| HostError::InvalidRequest(format!("{kind}: {e}")))?;
    let store = &ctx.store;

    match command {
        Command::TogglePlugin(r) => {
            store.toggle(&r.plugin_id).await?;
            reply(SuccessResponse::ok())
        }
        Command::EnablePlugin(r) => {
            store.set_enabled(&r.plugin_id, true).await?;
            reply(SuccessResponse::ok())
        }
        Command::DisablePlugin(r) => {
            store.set_enabled(&r.plugin_id, false).await?;
            reply(SuccessResponse::ok())
        }
        Command::UpdateSetting(p) => {
            store.update_setting(&p.plugin_id, &p.setting_id, p.value).await?;
            reply(SuccessResponse::ok())
        }
        Command::UpdateShortcut(p) => {
            store
                .update_shortcut(&p.plugin_id, &p.shortcut_id, p.custom_keys, p.enabled)
                .await?;
            reply(SuccessResponse::ok())
        }
        Command::ResetPlugin(r) => {
            store.reset(&r.plugin_id).await?;
            reply(SuccessResponse::ok())
        }
        Command::GetPluginList => reply(PluginListResponse { plugins: store.registry().list() }),
        Command::GetPlugin(r) => {
            let plugin = store
                .registry()
                .get(&r.plugin_id)
                .ok_or_else(|| HostError::plugin_not_found(&r.plugin_id))?;
            reply(PluginResponse { plugin: plugin.as_ref().clone() })
        }
        Command::GetPluginStates => {
            let AppState { revision, plugins } = store.snapshot().await;
            reply(ConfigsResponse { revision, configs: plugins })
        }
        Command::GetPluginState(r) => {
            let config = store
                .get_config(&r.plugin_id)
                .await
                .ok_or_else(|| HostError::plugin_not_found(&r.plugin_id))?;
            reply(ConfigResponse { config })
        }
        Command::GetPluginSettings(r) => {
            let config = store
                .get_config(&r.plugin_id)
                .await
                .ok_or_else(|| HostError::plugin_not_found(&r.plugin_id))?;
            reply(SettingsResponse { settings: config.settings })
        }
        Command::OpenModal(r) => forward(ctx, TabMessage::OpenModal(r)).await,
        Command::ExecutePlugin(r) => forward(ctx, TabMessage::ExecutePlugin(r)).await,
        Command::DownloadImage(p) => {
            let path = ctx.downloader.download(&p.url, &p.filename).await?;
            info!("Saved {} as {}", p.url, path.display());
            reply(SuccessResponse::ok())
        }
        Command::GetFileSize(p) => {
            let size = file_size(ctx.fetcher.as_ref(), &p.url).await?;
            reply(FileSizeResponse { success: true, size: Some(size), error: None })
        }
    }
}

async fn forward(ctx: &HostContext, msg: TabMessage) -> HostResult<Value> {
    if !ctx.store.registry().contains(msg.plugin_id()) {
        return Err(HostError::plugin_not_found(msg.plugin_id()));
    }
    ctx.tabs.send_to_active_tab(msg).await?;
    reply(SuccessResponse::ok())
}
