pub mod launcher;
pub mod manager;

pub use launcher::{EXECUTABLE_PREFIX, InProcessLauncher, PluginLauncher, ProcessLauncher};
pub use manager::{ManagerConfig, ManagerError, PluginInfo, PluginManager};
