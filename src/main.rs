use std::{env, path::PathBuf, sync::Arc, time::Duration};

use anyhow::bail;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use host_protocol::{
    message::{DownloadParams, FileSizeParams, UpdateSettingParams},
    ChannelName, Command, SettingValue,
};
use plugin_host::{
    builtin,
    config::{ConfigManager, EnvConfigManager, HostSettings},
    content::{ContentScript, Element, MemoryPage},
    logger::{init_tracing, LogConfig},
    net::{FsDownloader, ReqwestFetcher},
    schema::write_schema,
    storage::{FileStorage, InMemoryStorage, Storage},
    Background,
};
use serde_json::Value;
use tokio::time::sleep;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "plugin-host",
    about = "Plugin state, commands and page lifecycle for extension plugin hosts",
    version
)]
struct Cli {
    /// Host root directory (state, downloads, schemas, .env)
    #[arg(long, short)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered plugins
    List,
    /// Show the config of one plugin, or of all
    State { plugin_id: Option<String> },
    Enable { plugin_id: String },
    Disable { plugin_id: String },
    Toggle { plugin_id: String },
    /// Change a setting; VALUE is JSON, bare words are taken as strings
    Set {
        plugin_id: String,
        setting_id: String,
        value: String,
    },
    /// Restore a plugin's defaults
    Reset { plugin_id: String },
    /// Report the size of one or more remote files
    Size {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Download a file into the download directory
    Download { url: String, filename: String },
    /// Emit JSON-Schema for the wire types into `<root>/schemas`
    Schema,
    /// Run a background and one in-memory page, and walk through a
    /// toggle, a suspension and the recovery
    Simulate,
}

/// Resolve the host root directory from the environment or use default.
fn resolve_root_dir() -> PathBuf {
    match env::var("PLUGIN_HOST_ROOT") {
        Ok(path) => PathBuf::from(path),
        Err(_) => PathBuf::from("./plugin-host"),
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = cli.root.unwrap_or_else(resolve_root_dir);

    let config = ConfigManager(EnvConfigManager::new(Some(root.join(".env"))));
    let settings = HostSettings::load(&config, &root).await?;
    let _guard = init_tracing(&LogConfig::new(settings.log_level.clone(), settings.log_dir.clone()))?;
    info!("plugin-host using {}", root.display());

    let storage: Arc<dyn Storage> = match cli.command {
        Commands::Schema => {
            for file in write_schema(&root.join("schemas"))? {
                println!("wrote {file}");
            }
            return Ok(());
        }
        Commands::Simulate => InMemoryStorage::new(),
        _ => FileStorage::new(settings.state_file.clone()),
    };
    let background = start_background(&settings, storage).await?;
    let messenger = background.messenger();

    let reply = match cli.command {
        Commands::List => messenger.call(&Command::GetPluginList).await?,
        Commands::State { plugin_id: None } => messenger.call(&Command::GetPluginStates).await?,
        Commands::State { plugin_id: Some(id) } => {
            messenger.call(&Command::GetPluginState(Command::plugin_ref(id))).await?
        }
        Commands::Enable { plugin_id } => {
            messenger.call(&Command::EnablePlugin(Command::plugin_ref(plugin_id))).await?
        }
        Commands::Disable { plugin_id } => {
            messenger.call(&Command::DisablePlugin(Command::plugin_ref(plugin_id))).await?
        }
        Commands::Toggle { plugin_id } => {
            messenger.call(&Command::TogglePlugin(Command::plugin_ref(plugin_id))).await?
        }
        Commands::Set { plugin_id, setting_id, value } => {
            let value = serde_json::from_str::<SettingValue>(&value)
                .unwrap_or(SettingValue::Text(value));
            messenger
                .call(&Command::UpdateSetting(UpdateSettingParams { plugin_id, setting_id, value }))
                .await?
        }
        Commands::Reset { plugin_id } => {
            messenger.call(&Command::ResetPlugin(Command::plugin_ref(plugin_id))).await?
        }
        Commands::Size { urls } => {
            let commands: Vec<Command> = urls
                .iter()
                .map(|url| Command::GetFileSize(FileSizeParams { url: url.clone() }))
                .collect();
            let replies = join_all(commands.iter().map(|c| messenger.call(c))).await;
            let mut sizes = serde_json::Map::new();
            for (url, reply) in urls.iter().zip(replies) {
                sizes.insert(url.clone(), reply?);
            }
            Value::Object(sizes)
        }
        Commands::Download { url, filename } => {
            messenger
                .call(&Command::DownloadImage(DownloadParams { url, filename }))
                .await?
        }
        Commands::Simulate => {
            simulate(&background, settings.reconnect_attempts).await?;
            return Ok(());
        }
        Commands::Schema => return Ok(()),
    };

    println!("{}", serde_json::to_string_pretty(&reply)?);
    if reply.get("success") == Some(&Value::Bool(false)) {
        bail!("command failed");
    }
    Ok(())
}

async fn start_background(settings: &HostSettings, storage: Arc<dyn Storage>) -> anyhow::Result<Background> {
    let fetcher = Arc::new(ReqwestFetcher::new());
    let downloader = Arc::new(FsDownloader::new(settings.download_dir.clone(), fetcher.clone()));
    Ok(Background::start(storage, builtin::descriptors(), downloader, fetcher).await?)
}

async fn simulate(background: &Background, attempts: u32) -> anyhow::Result<()> {
    let page = MemoryPage::new(vec![
        Element::new("img").attr("src", "hero.png").attr("width", "1280"),
        Element::new("img").attr("src", "favicon.png").attr("width", "16"),
    ]);
    let (tab, script) = ContentScript::launch(background, page.clone(), builtin::plugins(), attempts).await?;
    let messenger = background.messenger();
    let settle = || sleep(Duration::from_millis(50));
    println!("tab {tab} loaded, active: {:?}", script.active_ids());

    messenger.call(&Command::TogglePlugin(Command::plugin_ref("css-spy"))).await?;
    settle().await;
    println!("css-spy toggled, active: {:?}", script.active_ids());

    background.suspend();
    println!(
        "background suspended, plugin-events is {:?}",
        script.connections().state(ChannelName::PluginEvents)
    );
    sleep(Duration::from_millis(1_200)).await;
    println!(
        "after backoff, plugin-events is {:?}",
        script.connections().state(ChannelName::PluginEvents)
    );

    messenger.call(&Command::TogglePlugin(Command::plugin_ref("css-spy"))).await?;
    settle().await;
    println!("css-spy toggled back, active: {:?}", script.active_ids());

    messenger.call(&Command::OpenModal(Command::plugin_ref("css-spy"))).await?;
    println!("modal: {:?}, overlays: {:?}", script.modal_mounted(), page.overlays());

    script.invalidate();
    background.tabs().close_tab(tab);
    println!(
        "page invalidated, active: {:?}, listeners left: {}",
        script.active_ids(),
        page.listener_count()
    );
    Ok(())
}
