//! Cross-process coordination for shell-extension instances.
//!
//! Every Explorer process hosts its own tab bars. One process, the owner of
//! the shell's singleton window, runs the coordination server; the rest
//! connect to it as clients. Together they keep one "current instance" and
//! route actions to whichever process owns it.

pub mod action;
pub mod cli;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod demo;
pub mod elector;
pub mod error;
pub mod instances;
pub mod logging;
#[cfg(windows)]
mod pipe;
pub mod platform;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod stack;
pub mod transport;
pub mod types;
pub mod util;

pub use action::{Action, ActionError, ActionHandler, Delivery, ExecMode};
pub use config::CoordConfig;
pub use coordinator::Coordinator;
pub use elector::{elect, RoleElector, StaticOwner, WindowOwnerQuery};
pub use error::{CoordError, Result};
pub use instances::{GuiInstance, InstanceManager, Job};
pub use types::{ConnectionId, InstanceKind, ProcessRole, WindowHandle};
