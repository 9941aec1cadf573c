//! Per-page side of the host: the content script, its activation session
//! and the modal overlay.

pub mod modal;
pub mod page;
pub mod script;
pub mod session;

pub use modal::ModalPresenter;
pub use page::{Element, MemoryPage, PageDom, PageEvent, PageHandle};
pub use script::ContentScript;
pub use session::{Activation, ContentPlugin, NoCleanup, PageSession};
