pub mod channel;
pub mod message;
pub mod plugin;

pub use channel::ChannelName;
pub use message::{Command, CommandKind, PortMessage, TabMessage};
pub use plugin::{AppState, PluginConfig, PluginDescriptor, SettingValue};
