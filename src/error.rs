use thiserror::Error;

/// Errors surfaced by the plugin host core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HostError {
    /// Unknown plugin, setting or shortcut id.
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },

    /// The storage collaborator failed; the mutation was not applied.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// No live connection or the target page is unreachable.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// A command handler or plugin hook failed.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The request payload did not match the command's shape.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl HostError {
    pub fn plugin_not_found(id: &str) -> Self {
        HostError::NotFound { kind: "plugin", id: id.to_string() }
    }

    pub fn setting_not_found(plugin_id: &str, setting_id: &str) -> Self {
        HostError::NotFound { kind: "setting", id: format!("{plugin_id}.{setting_id}") }
    }

    pub fn shortcut_not_found(plugin_id: &str, shortcut_id: &str) -> Self {
        HostError::NotFound { kind: "shortcut", id: format!("{plugin_id}.{shortcut_id}") }
    }
}

impl From<serde_json::Error> for HostError {
    fn from(err: serde_json::Error) -> HostError {
        HostError::InvalidRequest(err.to_string())
    }
}

impl From<std::io::Error> for HostError {
    fn from(err: std::io::Error) -> HostError {
        HostError::Persistence(err.to_string())
    }
}

impl From<anyhow::Error> for HostError {
    fn from(err: anyhow::Error) -> HostError {
        HostError::Handler(err.to_string())
    }
}

pub type HostResult<T> = Result<T, HostError>;
