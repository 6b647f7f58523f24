//! Lifecycle authority over plugin processes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reorg_plugin::{ConfigureParams, ExecuteParams, ExecuteResult, Manifest, PluginClient, PluginError};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use super::launcher::PluginLauncher;
use crate::ai::Categorizer;
use crate::host::HostService;
use crate::logger::EXECUTION_TARGET;
use crate::store::Store;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("plugin {0} is already loaded")]
    AlreadyLoaded(String),

    #[error("plugin {0} is not loaded")]
    NotLoaded(String),

    #[error("plugin {0} not found")]
    NotFound(String),

    #[error("plugin directory not configured")]
    DirNotConfigured,

    #[error("failed to read plugin directory {path:?}: {source}")]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start plugin {name}: {source}")]
    Launch {
        name: String,
        #[source]
        source: PluginError,
    },

    #[error("plugin {name} timed out after {secs}s")]
    TimedOut { name: String, secs: u64 },

    #[error("plugin {name}: {source}")]
    Plugin {
        name: String,
        #[source]
        source: PluginError,
    },
}

impl ManagerError {
    fn plugin(name: &str, source: PluginError) -> Self {
        ManagerError::Plugin { name: name.to_string(), source }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root of the per-plugin state directories (`<state_dir>/plugins/<name>`).
    pub state_dir: PathBuf,
    /// Handed to plugins so they can log to files of their own.
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
}

/// Snapshot of a loaded plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginInfo {
    pub name: String,
    pub path: PathBuf,
    pub manifest: Manifest,
    pub config: HashMap<String, String>,
}

struct LoadedPlugin {
    info: PluginInfo,
    client: PluginClient,
    /// Held for the whole of an execution; one plugin instance runs one
    /// execution at a time.
    exec: Mutex<()>,
}

pub struct PluginManager {
    launcher: Arc<dyn PluginLauncher>,
    store: Arc<dyn Store>,
    ai: Arc<dyn Categorizer>,
    config: ManagerConfig,
    plugins: RwLock<HashMap<String, Arc<LoadedPlugin>>>,
}

impl PluginManager {
    pub fn new(
        launcher: Arc<dyn PluginLauncher>,
        store: Arc<dyn Store>,
        ai: Arc<dyn Categorizer>,
        config: ManagerConfig,
    ) -> Self {
        Self { launcher, store, ai, config, plugins: RwLock::new(HashMap::new()) }
    }

    pub fn discover(&self) -> Result<Vec<String>, ManagerError> {
        self.launcher.discover()
    }

    pub fn state_dir_for(&self, name: &str) -> PathBuf {
        self.config.state_dir.join("plugins").join(name)
    }

    /// Starts `name`, fetches its manifest and configures it. Nothing is
    /// registered unless every step succeeds.
    pub async fn load(&self, name: &str, config: HashMap<String, String>) -> Result<(), ManagerError> {
        let mut plugins = self.plugins.write().await;
        if plugins.contains_key(name) {
            return Err(ManagerError::AlreadyLoaded(name.to_string()));
        }

        let path = self.launcher.locate(name)?;
        info!(plugin = name, path = %path.display(), "loading plugin");
        let client = self.launcher.launch(name, &path).await?;

        let manifest = match self.start(name, &client, config.clone()).await {
            Ok(manifest) => manifest,
            Err(e) => {
                client.kill().await;
                return Err(e);
            }
        };

        info!(plugin = name, version = %manifest.version, "plugin loaded");
        let info = PluginInfo { name: name.to_string(), path, manifest, config };
        plugins.insert(name.to_string(), Arc::new(LoadedPlugin { info, client, exec: Mutex::new(()) }));
        Ok(())
    }

    async fn start(
        &self,
        name: &str,
        client: &PluginClient,
        config: HashMap<String, String>,
    ) -> Result<Manifest, ManagerError> {
        let manifest = client.get_manifest().await.map_err(|e| ManagerError::plugin(name, e))?;

        let state_dir = self.state_dir_for(name);
        tokio::fs::create_dir_all(&state_dir)
            .await
            .map_err(|e| ManagerError::Launch { name: name.to_string(), source: e.into() })?;

        let host = Arc::new(HostService::new(self.store.clone(), self.ai.clone(), state_dir.clone()));
        let params = ConfigureParams {
            broker_id: 0,
            config,
            state_dir,
            log_level: self.config.log_level.clone(),
            log_dir: self.config.log_dir.clone(),
        };
        client.configure(host, params).await.map_err(|e| ManagerError::plugin(name, e))?;
        Ok(manifest)
    }

    /// Asks the plugin to shut down, then terminates it whatever the answer.
    pub async fn unload(&self, name: &str) -> Result<(), ManagerError> {
        let loaded = self
            .plugins
            .write()
            .await
            .remove(name)
            .ok_or_else(|| ManagerError::NotLoaded(name.to_string()))?;
        stop(&loaded).await;
        info!(plugin = name, "plugin unloaded");
        Ok(())
    }

    /// Runs one execution. Executions of the same plugin are serialized; a
    /// broken connection evicts the plugin.
    pub async fn execute(&self, name: &str, params: &ExecuteParams) -> Result<ExecuteResult, ManagerError> {
        self.run(name, params, None).await
    }

    /// Like [`PluginManager::execute`], but the plugin gets at most `limit`
    /// once its turn comes. Time spent queued behind another execution does
    /// not count. A plugin that overruns is evicted.
    pub async fn execute_within(
        &self,
        name: &str,
        params: &ExecuteParams,
        limit: Duration,
    ) -> Result<ExecuteResult, ManagerError> {
        self.run(name, params, Some(limit)).await
    }

    async fn run(
        &self,
        name: &str,
        params: &ExecuteParams,
        limit: Option<Duration>,
    ) -> Result<ExecuteResult, ManagerError> {
        let loaded = self
            .plugins
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::NotLoaded(name.to_string()))?;

        let _running = loaded.exec.lock().await;
        info!(plugin = name, dry_run = params.dry_run, "executing plugin");

        let call = loaded.client.execute(params);
        let outcome = match limit {
            None => call.await,
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(
                        target: EXECUTION_TARGET,
                        plugin = name,
                        dry_run = params.dry_run,
                        timeout_secs = limit.as_secs(),
                        "plugin execution timed out"
                    );
                    self.evict_instance(name, &loaded, "execution timed out").await;
                    return Err(ManagerError::TimedOut { name: name.to_string(), secs: limit.as_secs() });
                }
            },
        };

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                error!(target: EXECUTION_TARGET, plugin = name, dry_run = params.dry_run, error = %e, "plugin execution failed");
                if e.is_transport() {
                    self.evict_instance(name, &loaded, "plugin connection lost").await;
                }
                return Err(ManagerError::plugin(name, e));
            }
        };

        let s = &result.summary;
        info!(
            target: EXECUTION_TARGET,
            plugin = name,
            dry_run = params.dry_run,
            success = result.success,
            processed = s.items_processed,
            imported = s.items_imported,
            skipped = s.items_skipped,
            failed = s.items_failed,
            error = result.error.as_deref().unwrap_or(""),
            "plugin execution complete"
        );
        Ok(result)
    }

    async fn evict_instance(&self, name: &str, instance: &Arc<LoadedPlugin>, reason: &str) {
        let mut plugins = self.plugins.write().await;
        if plugins.get(name).is_some_and(|current| Arc::ptr_eq(current, instance)) {
            plugins.remove(name);
            drop(plugins);
            instance.client.kill().await;
            warn!(plugin = name, reason, "plugin removed from loaded plugins");
        }
    }

    /// The loaded plugin's manifest, or one fetched from a short-lived
    /// instance that is never configured.
    pub async fn get_manifest(&self, name: &str) -> Result<Manifest, ManagerError> {
        if let Some(loaded) = self.plugins.read().await.get(name) {
            return Ok(loaded.info.manifest.clone());
        }

        let path = self.launcher.locate(name)?;
        let client = self.launcher.launch(name, &path).await?;
        let manifest = client.get_manifest().await;
        client.kill().await;
        manifest.map_err(|e| ManagerError::plugin(name, e))
    }

    /// Unloads every plugin, carrying on past failures.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Arc<LoadedPlugin>)> = self.plugins.write().await.drain().collect();
        for (name, loaded) in drained {
            info!(plugin = %name, "shutting down plugin");
            stop(&loaded).await;
        }
    }

    pub async fn list_loaded(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn get_loaded(&self, name: &str) -> Option<PluginInfo> {
        self.plugins.read().await.get(name).map(|loaded| loaded.info.clone())
    }

    pub async fn is_loaded(&self, name: &str) -> bool {
        self.plugins.read().await.contains_key(name)
    }
}

async fn stop(loaded: &LoadedPlugin) {
    let name = &loaded.info.name;
    if let Err(e) = loaded.client.shutdown().await {
        warn!(plugin = %name, error = %e, "plugin shutdown returned error");
    }
    loaded.client.kill().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::Unconfigured;
    use crate::plugin::launcher::InProcessLauncher;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use reorg_plugin::{HostClient, Plugin, PluginResult, StateJson};
    use std::path::Path;
    use std::time::Duration;

    #[derive(Default)]
    struct Echo {
        host: Option<Arc<dyn HostClient>>,
        greeting: String,
    }

    #[async_trait]
    impl Plugin for Echo {
        async fn get_manifest(&self) -> PluginResult<Manifest> {
            Ok(Manifest { name: "echo".into(), version: "1.2.3".into(), schedule: "0 * * * * *".into(), ..Default::default() })
        }

        async fn configure(
            &mut self,
            host: Arc<dyn HostClient>,
            config: HashMap<String, String>,
            _state_dir: PathBuf,
        ) -> PluginResult<()> {
            if config.get("fail").is_some() {
                return Err(PluginError::other("refusing this config"));
            }
            self.greeting = config.get("greeting").cloned().unwrap_or_else(|| "hi".into());
            self.host = Some(host);
            Ok(())
        }

        async fn execute(&self, params: ExecuteParams) -> PluginResult<ExecuteResult> {
            let host = self.host.clone().ok_or_else(|| PluginError::other("not configured"))?;
            if params.params.contains_key("panic") {
                panic!("echo cannot cope");
            }
            if params.params.contains_key("slow") {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            let state = StateJson::new(host);
            let runs = state.get_or_default::<u32>("runs").await + 1;
            if !params.dry_run {
                state.set("runs", &runs).await?;
            }
            let mut result = ExecuteResult::ok();
            result.summary.message = format!("{} #{runs}", self.greeting);
            Ok(result)
        }
    }

    fn manager(state_dir: &Path) -> PluginManager {
        let launcher = InProcessLauncher::new().register("echo", Echo::default);
        PluginManager::new(
            Arc::new(launcher),
            Arc::new(MemoryStore::new()),
            Arc::new(Unconfigured),
            ManagerConfig { state_dir: state_dir.to_path_buf(), log_dir: None, log_level: "info".into() },
        )
    }

    #[tokio::test]
    async fn load_execute_unload() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        assert_eq!(m.discover().unwrap(), vec!["echo"]);

        let config = HashMap::from([("greeting".to_string(), "hello".to_string())]);
        m.load("echo", config.clone()).await.unwrap();
        let info = m.get_loaded("echo").await.unwrap();
        assert_eq!(info.manifest.version, "1.2.3");
        assert_eq!(info.config, config);
        assert!(dir.path().join("plugins/echo").is_dir());

        let res = m.execute("echo", &ExecuteParams::default()).await.unwrap();
        assert_eq!(res.summary.message, "hello #1");
        let res = m.execute("echo", &ExecuteParams::default()).await.unwrap();
        assert_eq!(res.summary.message, "hello #2");
        assert!(dir.path().join("plugins/echo/runs.json").exists());

        m.unload("echo").await.unwrap();
        assert!(m.list_loaded().await.is_empty());
        assert!(matches!(
            m.execute("echo", &ExecuteParams::default()).await,
            Err(ManagerError::NotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn second_load_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        m.load("echo", HashMap::new()).await.unwrap();
        let err = m.load("echo", HashMap::new()).await.unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyLoaded(_)));
        assert_eq!(err.to_string(), "plugin echo is already loaded");

        // the first instance is untouched
        let res = m.execute("echo", &ExecuteParams::default()).await.unwrap();
        assert_eq!(res.summary.message, "hi #1");
        m.shutdown().await;
        assert!(m.list_loaded().await.is_empty());
    }

    #[tokio::test]
    async fn configure_failure_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let err = m.load("echo", HashMap::from([("fail".to_string(), "1".to_string())])).await.unwrap_err();
        assert!(err.to_string().contains("refusing this config"));
        assert!(!m.is_loaded("echo").await);
        m.load("echo", HashMap::new()).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_plugins_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        assert!(matches!(m.load("nope", HashMap::new()).await, Err(ManagerError::NotFound(_))));
        assert!(matches!(m.get_manifest("nope").await, Err(ManagerError::NotFound(_))));
        assert!(matches!(m.unload("nope").await, Err(ManagerError::NotLoaded(_))));
    }

    #[tokio::test]
    async fn manifest_probe_does_not_register() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let manifest = m.get_manifest("echo").await.unwrap();
        assert_eq!(manifest.schedule, "0 * * * * *");
        assert!(m.list_loaded().await.is_empty());
    }

    #[tokio::test]
    async fn executions_of_one_plugin_do_not_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let m = Arc::new(manager(dir.path()));
        m.load("echo", HashMap::new()).await.unwrap();

        let slow = ExecuteParams { params: HashMap::from([("slow".to_string(), String::new())]), ..Default::default() };
        let a = tokio::spawn({
            let m = m.clone();
            let p = slow.clone();
            async move { m.execute("echo", &p).await.unwrap().summary.message }
        });
        let b = tokio::spawn({
            let m = m.clone();
            let p = slow.clone();
            async move { m.execute("echo", &p).await.unwrap().summary.message }
        });
        let mut messages = vec![a.await.unwrap(), b.await.unwrap()];
        messages.sort();
        assert_eq!(messages, vec!["hi #1", "hi #2"]);
    }

    #[tokio::test]
    async fn panicking_execution_fails_instead_of_hanging() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        m.load("echo", HashMap::new()).await.unwrap();

        let boom = ExecuteParams { params: HashMap::from([("panic".to_string(), String::new())]), ..Default::default() };
        let res = tokio::time::timeout(Duration::from_secs(5), m.execute("echo", &boom))
            .await
            .expect("a panicking plugin must still answer");
        let err = res.unwrap_err();
        assert!(matches!(err, ManagerError::Plugin { .. }));
        assert!(err.to_string().contains("plugin panicked"), "{err}");

        // the connection survives and the plugin keeps working
        assert!(m.is_loaded("echo").await);
        let res = m.execute("echo", &ExecuteParams::default()).await.unwrap();
        assert_eq!(res.summary.message, "hi #1");
    }

    #[tokio::test]
    async fn time_limit_starts_once_the_plugin_is_free() {
        let dir = tempfile::tempdir().unwrap();
        let m = Arc::new(manager(dir.path()));
        m.load("echo", HashMap::new()).await.unwrap();

        let slow = ExecuteParams { params: HashMap::from([("slow".to_string(), String::new())]), ..Default::default() };
        let busy = tokio::spawn({
            let m = m.clone();
            async move { m.execute("echo", &slow).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // queued longer than the limit, but the run itself is quick
        let res = m
            .execute_within("echo", &ExecuteParams::default(), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(res.success);
        assert!(busy.await.unwrap().is_ok());
        assert!(m.is_loaded("echo").await);
    }

    #[tokio::test]
    async fn overrunning_execution_is_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        m.load("echo", HashMap::new()).await.unwrap();

        let slow = ExecuteParams { params: HashMap::from([("slow".to_string(), String::new())]), ..Default::default() };
        let err = m.execute_within("echo", &slow, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ManagerError::TimedOut { .. }), "{err}");
        assert!(!m.is_loaded("echo").await);

        m.load("echo", HashMap::new()).await.unwrap();
        assert_eq!(m.list_loaded().await, vec!["echo"]);
    }
}
