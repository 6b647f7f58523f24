//! Host side of reorg: configuration, logging, the data store, the
//! host-callback service, the plugin manager and the scheduling daemon.

pub mod ai;
pub mod config;
pub mod daemon;
pub mod host;
pub mod logger;
pub mod plugin;
pub mod store;
