use anyhow::{Context, bail};
use clap::{Args, Subcommand};
use reorg_plugin::{ExecuteResult, Manifest};

use super::CliContext;
use reorg::plugin::EXECUTABLE_PREFIX;

/// Per-item details are only listed for small runs.
const MAX_DETAIL_ITEMS: usize = 20;

#[derive(Args, Debug)]
pub struct PluginArgs {
    #[command(subcommand)]
    pub command: PluginCommands,
}

#[derive(Subcommand, Debug)]
pub enum PluginCommands {
    /// List available plugins
    List,
    /// Run a plugin manually
    Run {
        name: String,
        /// Perform a dry run without making changes
        #[arg(long)]
        dry_run: bool,
    },
    /// Show plugin information
    Info { name: String },
}

pub async fn execute(args: PluginArgs, context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        PluginCommands::List => list(context).await,
        PluginCommands::Run { name, dry_run } => run(context, &name, dry_run).await,
        PluginCommands::Info { name } => info(context, &name).await,
    }
}

async fn list(context: &CliContext) -> anyhow::Result<()> {
    let daemon = context.daemon()?;
    println!("\n  Available Plugins\n");

    let available = daemon.list_available().context("failed to list plugins")?;
    if available.is_empty() {
        println!("No plugins found in {}", context.settings.plugin_dir.display());
        println!();
        println!("To install plugins, place plugin executables in the plugin directory.");
        println!("Plugin executables should be named: {EXECUTABLE_PREFIX}<name>");
        return Ok(());
    }

    for name in available {
        let enabled = context.settings.plugin(&name).enabled;
        let manifest = match daemon.get_plugin_info(&name).await {
            Ok(manifest) => manifest,
            Err(e) => {
                println!("{name} - (error loading: {e})");
                continue;
            }
        };
        let status = if enabled { "enabled" } else { "disabled" };
        println!("{} v{} [{status}]", manifest.name, manifest.version);
        if !manifest.description.is_empty() {
            println!("  {}", manifest.description);
        }
        if !manifest.schedule.is_empty() {
            println!("  Schedule: {}", manifest.schedule);
        }
        if !manifest.capabilities.is_empty() {
            println!("  Capabilities: {}", manifest.capabilities.join(", "));
        }
        println!();
    }
    Ok(())
}

async fn run(context: &CliContext, name: &str, dry_run: bool) -> anyhow::Result<()> {
    let daemon = context.daemon()?;
    println!("\n  Running Plugin: {name}\n");
    if dry_run {
        println!("(Dry run mode - no changes will be made)");
        println!();
    }

    let result = daemon
        .run_plugin_once(name, &context.settings.plugin(name), dry_run)
        .await
        .context("plugin execution failed")?;

    println!();
    print_result(&result, true);
    ensure_success(&result)?;
    println!();
    println!("Done.");
    Ok(())
}

async fn info(context: &CliContext, name: &str) -> anyhow::Result<()> {
    let daemon = context.daemon()?;
    let manifest = daemon.get_plugin_info(name).await.context("failed to get plugin info")?;
    print_manifest(&manifest);

    if let Some(settings) = context.settings.plugins.get(name) {
        println!();
        println!("Configuration:");
        println!("  Enabled: {}", if settings.enabled { "yes" } else { "no" });
        if let Some(schedule) = settings.schedule_override() {
            println!("  Schedule override: {schedule}");
        }
        if !settings.config.is_empty() {
            println!("  Settings:");
            let mut entries: Vec<_> = settings.config.iter().collect();
            entries.sort();
            for (key, value) in entries {
                println!("    {key}: {value}");
            }
        }
    }
    println!();
    Ok(())
}

fn print_manifest(manifest: &Manifest) {
    println!("\n  Plugin: {}\n", manifest.name);
    println!("{:<14} {}", "Version:", manifest.version);
    let optional = [
        ("Description:", manifest.description.clone()),
        ("Author:", manifest.author.clone()),
        ("Schedule:", manifest.schedule.clone()),
        ("Capabilities:", manifest.capabilities.join(", ")),
    ];
    for (label, value) in optional {
        if !value.is_empty() {
            println!("{label:<14} {value}");
        }
    }
}

/// Prints the summary counters, and the per-item lines when `details` is set
/// and the run was small.
pub fn print_result(result: &ExecuteResult, details: bool) {
    let summary = &result.summary;
    println!("Processed: {}", summary.items_processed);
    println!("Imported:  {}", summary.items_imported);
    println!("Skipped:   {}", summary.items_skipped);
    println!("Failed:    {}", summary.items_failed);
    if !summary.message.is_empty() {
        println!("Message:   {}", summary.message);
    }

    if details && !result.results.is_empty() && result.results.len() <= MAX_DETAIL_ITEMS {
        println!();
        println!("Details:");
        for item in &result.results {
            match item.message.as_deref().filter(|m| !m.is_empty()) {
                Some(message) => println!("  [{}] {} - {message}", item.action, item.name),
                None => println!("  [{}] {}", item.action, item.name),
            }
        }
    }
}

pub fn ensure_success(result: &ExecuteResult) -> anyhow::Result<()> {
    if !result.success {
        bail!("plugin error: {}", result.error.as_deref().unwrap_or("unknown error"));
    }
    Ok(())
}
