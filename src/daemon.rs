//! Recurring and on-demand plugin execution on top of the [`PluginManager`].

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::DashMap;
use reorg_plugin::{ExecuteParams, ExecuteResult, Manifest};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PluginSettings;
use crate::plugin::{ManagerError, PluginManager};

/// Ceiling for one scheduled execution.
pub const EXECUTION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledPlugin {
    pub name: String,
    /// The effective cron expression.
    pub schedule: String,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub enabled: bool,
}

/// Outcome of one plugin in a [`Daemon::run_once`] sweep.
#[derive(Debug)]
pub struct RunReport {
    pub name: String,
    pub result: Result<ExecuteResult, ManagerError>,
}

struct Job {
    name: String,
    expression: String,
    schedule: Schedule,
    config: HashMap<String, String>,
    last_run: Mutex<Option<DateTime<Utc>>>,
    /// Cancelled when the daemon stops.
    cancel: CancellationToken,
}

pub struct Daemon {
    manager: Arc<PluginManager>,
    state: Mutex<DaemonState>,
    jobs: DashMap<String, Arc<Job>>,
    cancel: Mutex<CancellationToken>,
    execution_timeout: Duration,
}

fn settings_for(plugins: &BTreeMap<String, PluginSettings>, name: &str) -> PluginSettings {
    plugins.get(name).cloned().unwrap_or_default()
}

impl Daemon {
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self {
            manager,
            state: Mutex::new(DaemonState::Stopped),
            jobs: DashMap::new(),
            cancel: Mutex::new(CancellationToken::new()),
            execution_timeout: EXECUTION_TIMEOUT,
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    pub async fn state(&self) -> DaemonState {
        *self.state.lock().await
    }

    /// Loads and schedules every enabled plugin that has a schedule. Plugins
    /// that fail to load or schedule are logged and left out.
    pub async fn start(&self, plugins: &BTreeMap<String, PluginSettings>) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state != DaemonState::Stopped {
                bail!("daemon is already {:?}", *state);
            }
            *state = DaemonState::Starting;
        }
        info!("starting daemon");

        let token = CancellationToken::new();
        *self.cancel.lock().await = token.clone();

        let available = self.manager.discover().unwrap_or_else(|e| {
            warn!(error = %e, "failed to discover plugins");
            Vec::new()
        });
        info!(count = available.len(), plugins = ?available, "discovered plugins");

        for name in &available {
            let settings = settings_for(plugins, name);
            if !settings.enabled {
                info!(plugin = %name, "plugin disabled");
                continue;
            }
            match self.schedule_plugin(name, settings, token.child_token()).await {
                Ok(Some(job)) => self.spawn_job(job),
                Ok(None) => {}
                Err(e) => error!(plugin = %name, error = format!("{e:#}"), "failed to schedule plugin"),
            }
        }

        *self.state.lock().await = DaemonState::Running;
        info!(scheduled_plugins = self.jobs.len(), "daemon started");
        Ok(())
    }

    async fn schedule_plugin(
        &self,
        name: &str,
        settings: PluginSettings,
        cancel: CancellationToken,
    ) -> anyhow::Result<Option<Arc<Job>>> {
        let expression = match settings.schedule_override() {
            Some(expression) => expression.to_string(),
            None => {
                let manifest = self.manager.get_manifest(name).await.context("failed to get manifest")?;
                manifest.schedule.trim().to_string()
            }
        };
        if expression.is_empty() {
            info!(plugin = name, "plugin has no schedule, skipping");
            return Ok(None);
        }
        let schedule =
            Schedule::from_str(&expression).with_context(|| format!("invalid cron expression {expression:?}"))?;

        match self.manager.load(name, settings.config.clone()).await {
            Ok(()) | Err(ManagerError::AlreadyLoaded(_)) => {}
            Err(e) => return Err(e).context("failed to load plugin"),
        }

        let job = Arc::new(Job {
            name: name.to_string(),
            expression,
            schedule,
            config: settings.config,
            last_run: Mutex::new(None),
            cancel,
        });
        self.jobs.insert(name.to_string(), job.clone());
        info!(plugin = name, schedule = %job.expression, "scheduled plugin");
        Ok(Some(job))
    }

    fn spawn_job(&self, job: Arc<Job>) {
        let manager = self.manager.clone();
        let timeout = self.execution_timeout;
        tokio::spawn(async move {
            loop {
                let Some(next) = job.schedule.upcoming(Utc).next() else {
                    debug!(plugin = %job.name, "schedule has no further fire times");
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = job.cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                // a fire already executing runs to completion after stop
                tokio::spawn(fire(manager.clone(), job.clone(), timeout));
            }
        });
    }

    /// Stops firing new executions and shuts down every loaded plugin.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().await;
            if *state == DaemonState::Stopped {
                return;
            }
            *state = DaemonState::Stopping;
        }
        info!("stopping daemon");
        self.cancel.lock().await.cancel();
        self.manager.shutdown().await;
        self.jobs.clear();
        *self.state.lock().await = DaemonState::Stopped;
        info!("daemon stopped");
    }

    /// Loads, executes and unloads every enabled plugin once, whatever its
    /// schedule.
    pub async fn run_once(&self, plugins: &BTreeMap<String, PluginSettings>, dry_run: bool) -> Vec<RunReport> {
        info!(dry_run, "running all plugins once");
        let available = self.manager.discover().unwrap_or_else(|e| {
            warn!(error = %e, "failed to discover plugins");
            Vec::new()
        });

        let mut reports = Vec::new();
        for name in available {
            let settings = settings_for(plugins, &name);
            if !settings.enabled {
                info!(plugin = %name, "plugin disabled, skipping");
                continue;
            }
            let result = self.run_plugin_once(&name, &settings, dry_run).await;
            if let Err(e) = &result {
                error!(plugin = %name, error = %e, "plugin run failed");
            }
            reports.push(RunReport { name, result });
        }
        reports
    }

    /// Executes `name` now, loading it first when needed. The plugin stays
    /// loaded afterwards.
    pub async fn trigger_plugin(&self, name: &str, dry_run: bool) -> Result<ExecuteResult, ManagerError> {
        info!(plugin = name, dry_run, "manually triggering plugin");
        if !self.manager.is_loaded(name).await {
            let config = self.jobs.get(name).map(|job| job.config.clone()).unwrap_or_default();
            match self.manager.load(name, config).await {
                Ok(()) | Err(ManagerError::AlreadyLoaded(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.manager.execute(name, &ExecuteParams::dry_run(dry_run)).await
    }

    /// Loads `name` with `settings`, executes it and unloads it again, also
    /// when the execution fails.
    pub async fn run_plugin_once(
        &self,
        name: &str,
        settings: &PluginSettings,
        dry_run: bool,
    ) -> Result<ExecuteResult, ManagerError> {
        info!(plugin = name, dry_run, "running plugin once");
        self.manager.load(name, settings.config.clone()).await?;
        let result = self.manager.execute(name, &ExecuteParams::dry_run(dry_run)).await;
        match self.manager.unload(name).await {
            Ok(()) => {}
            // a broken connection already evicted it
            Err(ManagerError::NotLoaded(_)) => {}
            Err(e) => warn!(plugin = name, error = %e, "failed to unload plugin"),
        }
        result
    }

    pub async fn list_scheduled(&self) -> Vec<ScheduledPlugin> {
        let jobs: Vec<Arc<Job>> = self.jobs.iter().map(|entry| entry.value().clone()).collect();
        let mut scheduled = Vec::with_capacity(jobs.len());
        for job in jobs {
            scheduled.push(ScheduledPlugin {
                name: job.name.clone(),
                schedule: job.expression.clone(),
                next_run: job.schedule.upcoming(Utc).next(),
                last_run: *job.last_run.lock().await,
                enabled: true,
            });
        }
        scheduled.sort_by(|a, b| a.name.cmp(&b.name));
        scheduled
    }

    pub fn list_available(&self) -> Result<Vec<String>, ManagerError> {
        self.manager.discover()
    }

    pub async fn get_plugin_info(&self, name: &str) -> Result<Manifest, ManagerError> {
        self.manager.get_manifest(name).await
    }
}

/// One scheduled execution. A plugin missing from the loaded set (evicted
/// after a timeout or a broken connection) is loaded again first. Nothing is
/// loaded or executed once the daemon has stopped.
async fn fire(manager: Arc<PluginManager>, job: Arc<Job>, timeout: Duration) {
    let name = job.name.as_str();
    if job.cancel.is_cancelled() {
        debug!(plugin = name, "daemon stopped, dropping scheduled run");
        return;
    }
    *job.last_run.lock().await = Some(Utc::now());

    if !manager.is_loaded(name).await {
        info!(plugin = name, "reloading plugin for scheduled run");
        match manager.load(name, job.config.clone()).await {
            Ok(()) | Err(ManagerError::AlreadyLoaded(_)) => {}
            Err(e) => {
                error!(plugin = name, error = %e, "failed to reload plugin");
                return;
            }
        }
        // stop may have drained the loaded set while this load was in flight
        if job.cancel.is_cancelled() {
            debug!(plugin = name, "daemon stopped during reload, unloading");
            if let Err(e) = manager.unload(name).await {
                debug!(plugin = name, error = %e, "plugin already gone");
            }
            return;
        }
    }

    if job.cancel.is_cancelled() {
        debug!(plugin = name, "daemon stopped, dropping scheduled run");
        return;
    }
    info!(plugin = name, "executing scheduled plugin");
    match manager.execute_within(name, &ExecuteParams::dry_run(false), timeout).await {
        Ok(result) if !result.success => {
            warn!(plugin = name, error = result.error.as_deref().unwrap_or(""), "scheduled run reported failure");
        }
        Ok(_) => {}
        // the manager already evicted the plugin
        Err(ManagerError::TimedOut { .. }) => {
            error!(plugin = name, timeout_secs = timeout.as_secs(), "plugin execution timed out, terminated it");
        }
        Err(e) => error!(plugin = name, error = %e, "plugin execution failed"),
    }
}
