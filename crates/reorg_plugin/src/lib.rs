//! Shared plumbing for reorg plugins and the host that runs them.
//!
//! A plugin implements [`plugin::Plugin`] and hands itself to
//! [`runtime::serve`]. The host talks to it through [`client::PluginClient`],
//! which also serves the plugin's callbacks into [`plugin::HostClient`].

pub mod client;
pub mod error;
pub mod handshake;
pub mod host_rpc;
pub mod import;
pub mod jsonrpc;
pub mod message;
pub mod plugin;
pub mod rpc;
pub mod runtime;
pub mod testing;

pub use client::PluginClient;
pub use error::{PluginError, PluginResult};
pub use message::*;
pub use plugin::{HostClient, Plugin, StateJson};
