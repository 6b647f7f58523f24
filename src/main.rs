use clap::Parser;

mod cli;

use cli::{Cli, CliContext};
use reorg::config::Settings;
use reorg::logger::init_tracing;
use tracing::info;

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.data_dir, cli.config)?;
    init_tracing(&settings.log_dir, &cli.log_level, cli.command.is_daemon())?;
    for path in &settings.env_files {
        info!(path = %path.display(), "loaded .env");
    }

    let context = CliContext::new(settings, cli.log_level);
    cli::execute(&context, cli.command).await
}
