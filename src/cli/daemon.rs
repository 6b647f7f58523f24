use anyhow::{Context, bail};
use chrono::Local;
use clap::Args;
use tracing::info;

use super::CliContext;
use super::plugin::{ensure_success, print_result};
use reorg::daemon::Daemon;

#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Run all plugins once and exit
    #[arg(long)]
    pub once: bool,

    /// Run only the specified plugin
    #[arg(long)]
    pub plugin: Option<String>,

    /// Perform a dry run without making changes
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn execute(args: DaemonArgs, context: &CliContext) -> anyhow::Result<()> {
    let daemon = context.daemon()?;

    if let Some(name) = args.plugin.as_deref() {
        return run_single(&daemon, context, name, args.dry_run).await;
    }
    if args.once {
        return run_once(&daemon, context, args.dry_run).await;
    }

    println!("\n  Reorg Daemon\n");
    println!("Plugin directory: {}", context.settings.plugin_dir.display());
    println!("State directory: {}", context.settings.state_dir.display());
    println!();

    daemon.start(&context.settings.plugins).await.context("failed to start daemon")?;

    let scheduled = daemon.list_scheduled().await;
    if !scheduled.is_empty() {
        println!("Scheduled plugins:");
        for plugin in scheduled {
            match plugin.next_run {
                Some(next) => println!(
                    "  {}: next run at {}",
                    plugin.name,
                    next.with_timezone(&Local).format("%H:%M:%S")
                ),
                None => println!("  {}: no upcoming run", plugin.name),
            }
        }
        println!();
    }

    println!("Daemon running. Press Ctrl+C to stop.");
    shutdown_signal().await?;

    println!("\nShutting down...");
    info!("shutdown requested");
    daemon.stop().await;
    Ok(())
}

async fn run_single(daemon: &Daemon, context: &CliContext, name: &str, dry_run: bool) -> anyhow::Result<()> {
    println!("\n  Running Plugin: {name}\n");
    if dry_run {
        println!("(Dry run mode - no changes will be made)");
        println!();
    }
    let result = daemon
        .run_plugin_once(name, &context.settings.plugin(name), dry_run)
        .await
        .context("plugin execution failed")?;
    print_result(&result, false);
    ensure_success(&result)
}

async fn run_once(daemon: &Daemon, context: &CliContext, dry_run: bool) -> anyhow::Result<()> {
    println!("\n  Reorg Daemon - One-time Run\n");
    if dry_run {
        println!("(Dry run mode - no changes will be made)");
        println!();
    }

    let reports = daemon.run_once(&context.settings.plugins, dry_run).await;
    let mut failed = 0;
    for report in &reports {
        println!("{}:", report.name);
        match &report.result {
            Ok(result) => {
                print_result(result, false);
                if let Err(e) = ensure_success(result) {
                    println!("{e}");
                    failed += 1;
                }
            }
            Err(e) => {
                println!("plugin execution failed: {e}");
                failed += 1;
            }
        }
        println!();
    }

    if failed > 0 {
        bail!("{failed} of {} plugins failed", reports.len());
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to listen for Ctrl+C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")
}
