use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reorg::ai::Unconfigured;
use reorg::config::{ConfigFile, PluginSettings, Settings};
use reorg::daemon::{Daemon, DaemonState};
use reorg::plugin::{InProcessLauncher, ManagerConfig, ManagerError, PluginLauncher, PluginManager, ProcessLauncher};
use reorg::store::MemoryStore;
use reorg_plugin::{ExecuteParams, ExecuteResult, HostClient, Manifest, Plugin, PluginResult};

struct Quiet;

#[async_trait]
impl Plugin for Quiet {
    async fn get_manifest(&self) -> PluginResult<Manifest> {
        Ok(Manifest { name: "quiet".into(), version: "1.0.0".into(), schedule: "0 */15 * * * *".into(), ..Default::default() })
    }

    async fn configure(
        &mut self,
        _host: Arc<dyn HostClient>,
        _config: HashMap<String, String>,
        _state_dir: PathBuf,
    ) -> PluginResult<()> {
        Ok(())
    }

    async fn execute(&self, _params: ExecuteParams) -> PluginResult<ExecuteResult> {
        Ok(ExecuteResult::ok())
    }
}

fn manager(state_dir: &Path, launcher: impl PluginLauncher + 'static) -> Arc<PluginManager> {
    Arc::new(PluginManager::new(
        Arc::new(launcher),
        Arc::new(MemoryStore::new()),
        Arc::new(Unconfigured),
        ManagerConfig { state_dir: state_dir.to_path_buf(), log_dir: None, log_level: "info".into() },
    ))
}

#[tokio::test]
async fn unloading_an_unknown_plugin_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), InProcessLauncher::new().register("quiet", || Quiet));
    manager.load("quiet", HashMap::new()).await.unwrap();

    assert!(matches!(manager.unload("never-loaded").await, Err(ManagerError::NotLoaded(_))));
    assert_eq!(manager.list_loaded().await, vec!["quiet"]);

    let info = manager.get_loaded("quiet").await.unwrap();
    assert_eq!(info.manifest.version, "1.0.0");
    assert_eq!(info.path, PathBuf::from("in-process:quiet"));
}

#[tokio::test]
async fn configured_schedule_round_trips_through_the_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let file = ConfigFile::parse(
        r#"
plugins:
  quiet:
    schedule: "0 */5 * * * *"
    config:
      since: 48h
"#,
    )
    .unwrap();
    let settings = Settings::from_file(dir.path().to_path_buf(), dir.path().join("config.yaml"), file);

    let manager = manager(&settings.state_dir, InProcessLauncher::new().register("quiet", || Quiet));
    let daemon = Daemon::new(manager.clone());
    daemon.start(&settings.plugins).await.unwrap();

    let scheduled = daemon.list_scheduled().await;
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].schedule, "0 */5 * * * *");
    let info = manager.get_loaded("quiet").await.unwrap();
    assert_eq!(info.config.get("since").map(String::as_str), Some("48h"));

    daemon.stop().await;
    assert_eq!(daemon.state().await, DaemonState::Stopped);

    // without an override the manifest schedule applies
    daemon.start(&BTreeMap::new()).await.unwrap();
    assert_eq!(daemon.list_scheduled().await[0].schedule, "0 */15 * * * *");
    daemon.stop().await;

    let disabled = BTreeMap::from([("quiet".to_string(), PluginSettings { enabled: false, ..Default::default() })]);
    daemon.start(&disabled).await.unwrap();
    assert!(daemon.list_scheduled().await.is_empty());
    assert!(manager.list_loaded().await.is_empty());
    daemon.stop().await;
}

#[cfg(unix)]
mod process {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(format!("reorg-plugin-{name}"));
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{body}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn broken_executables_never_get_registered() {
        let plugins = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        script(plugins.path(), "wrong-cookie", "echo 'other-plugin-v9|1|jsonrpc'; sleep 5");
        script(plugins.path(), "silent-exit", "exit 0");

        let manager = manager(state.path(), ProcessLauncher::new(Some(plugins.path().to_path_buf())));
        assert_eq!(manager.discover().unwrap(), vec!["silent-exit", "wrong-cookie"]);

        for name in ["wrong-cookie", "silent-exit"] {
            let err = manager.load(name, HashMap::new()).await.unwrap_err();
            assert!(matches!(err, ManagerError::Launch { .. }), "{name}: {err}");
        }
        assert!(manager.list_loaded().await.is_empty());
        assert!(matches!(manager.load("absent", HashMap::new()).await, Err(ManagerError::NotFound(_))));

        // the daemon skips them and still starts
        let daemon = Daemon::new(manager.clone());
        daemon.start(&BTreeMap::new()).await.unwrap();
        assert_eq!(daemon.state().await, DaemonState::Running);
        assert!(daemon.list_scheduled().await.is_empty());
        daemon.stop().await;
    }

    // answers getManifest and configure, then exits on the next request
    const DIES_ON_EXECUTE: &str = r#"echo 'reorg-plugin-v1|1|jsonrpc'
n=0
while read -r line; do
  id=$(printf '%s\n' "$line" | sed 's/.*"id":"\([^"]*\)".*/\1/')
  n=$((n+1))
  case $n in
    1) printf '{"jsonrpc":"2.0","id":"%s","result":{"name":"dies","version":"0.1.0"}}\n' "$id" ;;
    2) printf '{"jsonrpc":"2.0","id":"%s","result":{}}\n' "$id" ;;
    *) exit 1 ;;
  esac
done"#;

    #[tokio::test]
    async fn plugin_exiting_mid_execution_is_evicted() {
        let plugins = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        script(plugins.path(), "dies", DIES_ON_EXECUTE);

        let manager = manager(state.path(), ProcessLauncher::new(Some(plugins.path().to_path_buf())));
        manager.load("dies", HashMap::new()).await.unwrap();
        assert_eq!(manager.get_loaded("dies").await.unwrap().manifest.version, "0.1.0");

        let err = manager.execute("dies", &ExecuteParams::default()).await.unwrap_err();
        assert!(matches!(err, ManagerError::Plugin { .. }), "{err}");
        assert!(manager.list_loaded().await.is_empty());
        assert!(matches!(
            manager.execute("dies", &ExecuteParams::default()).await,
            Err(ManagerError::NotLoaded(_))
        ));

        // a fresh instance can take its place
        manager.load("dies", HashMap::new()).await.unwrap();
        assert_eq!(manager.list_loaded().await, vec!["dies"]);
        manager.shutdown().await;
    }
}
