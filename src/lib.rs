pub mod background;
pub mod builtin;
pub mod channel;
pub mod config;
pub mod content;
pub mod dispatcher;
pub mod error;
pub mod logger;
pub mod net;
pub mod registry;
pub mod schema;
pub mod state;
pub mod storage;

pub use background::{Background, TabRouter};
pub use dispatcher::{CommandDispatcher, DispatcherHandle, HostContext, Messenger, TabMessenger};
pub use error::{HostError, HostResult};
pub use state::PluginManager;
