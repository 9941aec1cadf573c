use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use crate::plugin::{AppState, KeyToken, PluginConfig, PluginDescriptor, SettingValue};

// -----------------------------------------------------------------------------
// Command kinds
// -----------------------------------------------------------------------------

/// Discriminator of every command the orchestrator understands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    TogglePlugin,
    EnablePlugin,
    DisablePlugin,
    UpdateSetting,
    UpdateShortcut,
    ResetPlugin,
    GetPluginList,
    GetPlugin,
    GetPluginStates,
    GetPluginState,
    GetPluginSettings,
    OpenModal,
    ExecutePlugin,
    DownloadImage,
    GetFileSize,
}

// -----------------------------------------------------------------------------
// Requests
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginRef {
    pub plugin_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettingParams {
    pub plugin_id: String,
    pub setting_id: String,
    pub value: SettingValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateShortcutParams {
    pub plugin_id: String,
    pub shortcut_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_keys: Option<Vec<KeyToken>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DownloadParams {
    pub url: String,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FileSizeParams {
    pub url: String,
}

/// A request sent from a UI surface or content script to the orchestrator.
///
/// On the wire: `{"type": "UPDATE_SETTING", "pluginId": "...", ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    TogglePlugin(PluginRef),
    EnablePlugin(PluginRef),
    DisablePlugin(PluginRef),
    UpdateSetting(UpdateSettingParams),
    UpdateShortcut(UpdateShortcutParams),
    ResetPlugin(PluginRef),
    GetPluginList,
    GetPlugin(PluginRef),
    GetPluginStates,
    GetPluginState(PluginRef),
    GetPluginSettings(PluginRef),
    OpenModal(PluginRef),
    ExecutePlugin(PluginRef),
    DownloadImage(DownloadParams),
    GetFileSize(FileSizeParams),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::TogglePlugin(_) => CommandKind::TogglePlugin,
            Command::EnablePlugin(_) => CommandKind::EnablePlugin,
            Command::DisablePlugin(_) => CommandKind::DisablePlugin,
            Command::UpdateSetting(_) => CommandKind::UpdateSetting,
            Command::UpdateShortcut(_) => CommandKind::UpdateShortcut,
            Command::ResetPlugin(_) => CommandKind::ResetPlugin,
            Command::GetPluginList => CommandKind::GetPluginList,
            Command::GetPlugin(_) => CommandKind::GetPlugin,
            Command::GetPluginStates => CommandKind::GetPluginStates,
            Command::GetPluginState(_) => CommandKind::GetPluginState,
            Command::GetPluginSettings(_) => CommandKind::GetPluginSettings,
            Command::OpenModal(_) => CommandKind::OpenModal,
            Command::ExecutePlugin(_) => CommandKind::ExecutePlugin,
            Command::DownloadImage(_) => CommandKind::DownloadImage,
            Command::GetFileSize(_) => CommandKind::GetFileSize,
        }
    }

    pub fn plugin_ref(plugin_id: impl Into<String>) -> PluginRef {
        PluginRef { plugin_id: plugin_id.into() }
    }

    pub fn to_value(&self) -> Value {
        // Every variant serialises to a JSON object; this cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// -----------------------------------------------------------------------------
// Responses
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SuccessResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self { success: true, error: None }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PluginListResponse {
    pub plugins: Vec<PluginDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PluginResponse {
    pub plugin: PluginDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ConfigsResponse {
    #[serde(default)]
    pub revision: u64,
    pub configs: BTreeMap<String, PluginConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ConfigResponse {
    pub config: PluginConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SettingsResponse {
    pub settings: BTreeMap<String, SettingValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FileSizeResponse {
    pub success: bool,
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// -----------------------------------------------------------------------------
// Persistent-channel and tab messages
// -----------------------------------------------------------------------------

/// Unsolicited messages pushed over a persistent channel.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortMessage {
    PluginStateChanged { state: AppState },
}

/// Messages the orchestrator forwards to the content script of the active page.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TabMessage {
    OpenModal(PluginRef),
    ExecutePlugin(PluginRef),
}

impl TabMessage {
    pub fn plugin_id(&self) -> &str {
        match self {
            TabMessage::OpenModal(r) | TabMessage::ExecutePlugin(r) => &r.plugin_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strum::IntoEnumIterator;

    #[test]
    fn command_wire_format() {
        let cmd = Command::UpdateSetting(UpdateSettingParams {
            plugin_id: "css-spy".into(),
            setting_id: "opacity".into(),
            value: SettingValue::Number(0.5),
        });
        assert_eq!(
            cmd.to_value(),
            json!({"type": "UPDATE_SETTING", "pluginId": "css-spy", "settingId": "opacity", "value": 0.5})
        );
        let de: Command = serde_json::from_value(json!({"type": "GET_PLUGIN_LIST"})).unwrap();
        assert_eq!(de, Command::GetPluginList);
    }

    #[test]
    fn kind_matches_type_tag() {
        let cmd = Command::TogglePlugin(Command::plugin_ref("a"));
        let v = cmd.to_value();
        let kind: CommandKind = v["type"].as_str().unwrap().parse().unwrap();
        assert_eq!(kind, cmd.kind());
    }

    #[test]
    fn every_kind_has_a_wire_name() {
        for kind in CommandKind::iter() {
            let name = kind.to_string();
            assert_eq!(name.to_uppercase(), name);
            assert_eq!(name.parse::<CommandKind>().unwrap(), kind);
        }
        assert!("NOT_A_COMMAND".parse::<CommandKind>().is_err());
    }

    #[test]
    fn port_message_wire_format() {
        let msg = PortMessage::PluginStateChanged { state: AppState::default() };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "PLUGIN_STATE_CHANGED", "state": {"revision": 0, "plugins": {}}})
        );
    }

    #[test]
    fn tab_message_exposes_target() {
        let msg: TabMessage =
            serde_json::from_value(json!({"type": "EXECUTE_PLUGIN", "pluginId": "img"})).unwrap();
        assert_eq!(msg.plugin_id(), "img");
    }
}
