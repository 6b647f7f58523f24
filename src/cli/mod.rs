use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

pub mod daemon;
pub mod plugin;

use daemon::DaemonArgs;
use plugin::PluginArgs;

use reorg::ai::Unconfigured;
use reorg::config::Settings;
use reorg::daemon::Daemon;
use reorg::plugin::{ManagerConfig, PluginManager, ProcessLauncher};
use reorg::store::MemoryStore;

#[derive(Parser, Debug)]
#[command(name = "reorg", about = "Organise notes into areas, projects and tasks", version)]
pub struct Cli {
    /// Data directory (defaults to $REORG_DATA_DIR, then ~/.reorg)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Config file (defaults to $REORG_CONFIG, then <data-dir>/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage reorg plugins
    Plugin(PluginArgs),

    /// Run the daemon for scheduled plugin execution
    Daemon(DaemonArgs),
}

impl Commands {
    pub fn is_daemon(&self) -> bool {
        matches!(self, Commands::Daemon(_))
    }
}

pub struct CliContext {
    pub settings: Settings,
    pub log_level: String,
}

impl CliContext {
    pub fn new(settings: Settings, log_level: String) -> Self {
        Self { settings, log_level }
    }

    pub fn plugin_manager(&self) -> anyhow::Result<Arc<PluginManager>> {
        let store_file = self.settings.store_file();
        let store = MemoryStore::open(&store_file)
            .with_context(|| format!("failed to open store {}", store_file.display()))?;
        let launcher = ProcessLauncher::new(Some(self.settings.plugin_dir.clone()));
        Ok(Arc::new(PluginManager::new(
            Arc::new(launcher),
            Arc::new(store),
            Arc::new(Unconfigured),
            ManagerConfig {
                state_dir: self.settings.state_dir.clone(),
                log_dir: Some(self.settings.log_dir.clone()),
                log_level: self.log_level.clone(),
            },
        )))
    }

    pub fn daemon(&self) -> anyhow::Result<Daemon> {
        Ok(Daemon::new(self.plugin_manager()?))
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Plugin(args) => plugin::execute(args, context).await,
        Commands::Daemon(args) => daemon::execute(args, context).await,
    }
}
