use std::path::Path;

use anyhow::Context;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Target of the one-line summary emitted after every plugin execution.
pub const EXECUTION_TARGET: &str = "execution";

pub const LOG_FILE: &str = "reorg.log";
pub const EXECUTION_FILE: &str = "executions.json";

fn level_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the host's global subscriber.
///
/// - `log_level` is an `EnvFilter` directive (e.g. `"info"` or `"reorg=debug"`).
/// - plain-text logs roll daily in `<log_dir>/reorg.log`.
/// - execution summaries (target `execution`) go to `<log_dir>/executions.json`
///   as newline-delimited JSON.
/// - `console` adds a stderr layer for long-running foreground use.
pub fn init_tracing(log_dir: &Path, log_level: &str, console: bool) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let txt_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE);
    let txt_layer = fmt::layer()
        .with_writer(txt_appender)
        .with_ansi(false)
        .with_filter(level_filter(log_level));

    let json_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, EXECUTION_FILE);
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new(format!("{EXECUTION_TARGET}=info")));

    let console_layer = console.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(level_filter(log_level))
    });

    Registry::default()
        .with(txt_layer)
        .with(json_layer)
        .with(console_layer)
        .try_init()
        .context("a tracing subscriber is already installed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_directive_falls_back_to_info() {
        let filter = level_filter("reorg=verbose");
        assert_eq!(filter.to_string(), "info");
    }
}
