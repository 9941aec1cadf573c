use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// Purposes a persistent channel can be opened for.
///
/// Channel names are a closed set: a connection manager keys its slots by
/// this enum, never by free-form strings.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    EnumString, AsRefStr, Display, EnumIter, Serialize, Deserialize, JsonSchema,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ChannelName {
    /// Unsolicited `PLUGIN_STATE_CHANGED` broadcasts from the orchestrator.
    PluginEvents,
    Popup,
    Content,
}
