use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A key token as produced by the page's keyboard events, e.g. `"Alt"` or `"C"`.
pub type KeyToken = String;

/// Value of a single plugin setting.
///
/// Serialised as the bare JSON scalar so the persisted blob stays readable
/// by every context.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum SettingValue {
    Boolean(bool),
    Number(f64),
    Text(String),
}

impl SettingValue {
    pub fn as_bool(&self) -> Option<bool> {
        if let SettingValue::Boolean(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        if let SettingValue::Number(n) = self {
            Some(*n)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        if let SettingValue::Text(s) = self {
            Some(s)
        } else {
            None
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Boolean(value)
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        SettingValue::Number(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::Text(value)
    }
}

/// Declared type of a setting, as rendered by the options surface.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SettingKind {
    Boolean,
    Number,
    String,
    Enum { options: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SettingField {
    pub id: String,
    pub label: String,
    pub kind: SettingKind,
    pub default: SettingValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShortcutDecl {
    pub id: String,
    pub description: String,
    pub default_keys: Vec<KeyToken>,
}

/// Static metadata of a plugin. Immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    /// Ordered: the options page renders settings in declaration order.
    #[serde(default)]
    pub settings: Vec<SettingField>,
    #[serde(default)]
    pub shortcuts: Vec<ShortcutDecl>,
    #[serde(default = "default_true")]
    pub enabled_by_default: bool,
}

fn default_true() -> bool {
    true
}

impl PluginDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            category: String::new(),
            settings: Vec::new(),
            shortcuts: Vec::new(),
            enabled_by_default: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_setting(
        mut self,
        id: impl Into<String>,
        label: impl Into<String>,
        kind: SettingKind,
        default: impl Into<SettingValue>,
    ) -> Self {
        self.settings.push(SettingField {
            id: id.into(),
            label: label.into(),
            kind,
            default: default.into(),
        });
        self
    }

    pub fn with_shortcut(
        mut self,
        id: impl Into<String>,
        description: impl Into<String>,
        default_keys: &[&str],
    ) -> Self {
        self.shortcuts.push(ShortcutDecl {
            id: id.into(),
            description: description.into(),
            default_keys: default_keys.iter().map(|k| k.to_string()).collect(),
        });
        self
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.enabled_by_default = false;
        self
    }

    pub fn setting(&self, setting_id: &str) -> Option<&SettingField> {
        self.settings.iter().find(|s| s.id == setting_id)
    }

    pub fn shortcut(&self, shortcut_id: &str) -> Option<&ShortcutDecl> {
        self.shortcuts.iter().find(|s| s.id == shortcut_id)
    }

    /// The config a plugin starts with the first time it is registered.
    pub fn default_config(&self) -> PluginConfig {
        PluginConfig {
            enabled: self.enabled_by_default,
            settings: self
                .settings
                .iter()
                .map(|s| (s.id.clone(), s.default.clone()))
                .collect(),
            shortcuts: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShortcutConfig {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_keys: Option<Vec<KeyToken>>,
}

impl Default for ShortcutConfig {
    fn default() -> Self {
        Self { enabled: true, custom_keys: None }
    }
}

/// Persisted, mutable per-plugin record.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct PluginConfig {
    pub enabled: bool,
    #[serde(default)]
    pub settings: BTreeMap<String, SettingValue>,
    #[serde(default)]
    pub shortcuts: BTreeMap<String, ShortcutConfig>,
}

/// Every plugin's config, keyed by plugin id. Persisted as one blob.
///
/// `revision` grows by one with every committed mutation, so a reader can
/// tell an old snapshot from a newer broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct AppState {
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginConfig>,
}

impl AppState {
    pub fn config(&self, plugin_id: &str) -> Option<&PluginConfig> {
        self.plugins.get(plugin_id)
    }

    pub fn is_enabled(&self, plugin_id: &str) -> bool {
        self.plugins.get(plugin_id).is_some_and(|c| c.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn css_spy() -> PluginDescriptor {
        PluginDescriptor::new("css-spy", "CSS Spy")
            .with_setting("opacity", "Overlay opacity", SettingKind::Number, 0.9)
            .with_setting("showGrid", "Show grid", SettingKind::Boolean, false)
            .with_shortcut("toggle", "Toggle inspector", &["Alt", "C"])
    }

    #[test]
    fn default_config_follows_schema() {
        let config = css_spy().default_config();
        assert!(config.enabled);
        assert_eq!(config.settings["opacity"], SettingValue::Number(0.9));
        assert_eq!(config.settings["showGrid"], SettingValue::Boolean(false));
        assert!(config.shortcuts.is_empty());
    }

    #[test]
    fn setting_values_are_plain_json() {
        let config = css_spy().default_config();
        let v = serde_json::to_value(&config).unwrap();
        assert_eq!(v, json!({
            "enabled": true,
            "settings": {"opacity": 0.9, "showGrid": false},
            "shortcuts": {}
        }));
    }

    #[test]
    fn shortcut_config_reads_camel_case() {
        let sc: ShortcutConfig =
            serde_json::from_value(json!({"enabled": false, "customKeys": ["Ctrl", "K"]})).unwrap();
        assert!(!sc.enabled);
        assert_eq!(sc.custom_keys.unwrap(), vec!["Ctrl".to_string(), "K".to_string()]);
    }

    #[test]
    fn descriptor_defaults_when_fields_missing() {
        let d: PluginDescriptor = serde_json::from_value(json!({"id": "x", "name": "X"})).unwrap();
        assert!(d.enabled_by_default);
        assert!(d.settings.is_empty());
    }
}
