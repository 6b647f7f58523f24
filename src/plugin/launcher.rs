//! How plugins are found and started.

use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use reorg_plugin::{Plugin, PluginClient, PluginResult};
use tracing::debug;

use super::manager::ManagerError;

/// Plugin executables are named `reorg-plugin-<name>`.
pub const EXECUTABLE_PREFIX: &str = "reorg-plugin-";

#[async_trait]
pub trait PluginLauncher: Send + Sync {
    /// Names of every plugin that could be started, sorted.
    fn discover(&self) -> Result<Vec<String>, ManagerError>;

    /// Where `name` would be started from.
    fn locate(&self, name: &str) -> Result<PathBuf, ManagerError>;

    /// Starts the plugin found at `path` and completes the handshake.
    async fn launch(&self, name: &str, path: &Path) -> Result<PluginClient, ManagerError>;
}

/// Runs plugins as child processes from a plugin directory, falling back to
/// `PATH` for plugins installed elsewhere.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    plugin_dir: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(plugin_dir: Option<PathBuf>) -> Self {
        Self { plugin_dir }
    }

    pub fn plugin_dir(&self) -> Option<&Path> {
        self.plugin_dir.as_deref()
    }
}

pub fn executable_file_name(name: &str) -> String {
    format!("{EXECUTABLE_PREFIX}{name}{}", env::consts::EXE_SUFFIX)
}

/// The plugin name encoded in an executable's file name, if it follows the
/// naming convention.
pub fn plugin_name(file_name: &str) -> Option<&str> {
    let rest = file_name.strip_prefix(EXECUTABLE_PREFIX)?;
    let name = if env::consts::EXE_SUFFIX.is_empty() {
        rest
    } else {
        rest.strip_suffix(env::consts::EXE_SUFFIX)?
    };
    (!name.is_empty()).then_some(name)
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}

fn search_path(file_name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(file_name))
        .find(|candidate| std::fs::metadata(candidate).is_ok_and(|m| m.is_file() && is_executable(&m)))
}

#[async_trait]
impl PluginLauncher for ProcessLauncher {
    fn discover(&self) -> Result<Vec<String>, ManagerError> {
        let dir = self.plugin_dir.as_deref().ok_or(ManagerError::DirNotConfigured)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(dir).map_err(|source| ManagerError::Discovery {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut names = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str().and_then(plugin_name) else {
                continue;
            };
            // follows symlinks, so a linked executable counts
            let Ok(meta) = std::fs::metadata(entry.path()) else {
                continue;
            };
            if meta.is_dir() || !is_executable(&meta) {
                continue;
            }
            names.push(name.to_string());
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn locate(&self, name: &str) -> Result<PathBuf, ManagerError> {
        let file_name = executable_file_name(name);
        if let Some(dir) = &self.plugin_dir {
            let path = dir.join(&file_name);
            if path.is_file() {
                return Ok(path);
            }
        }
        search_path(&file_name).ok_or_else(|| ManagerError::NotFound(name.to_string()))
    }

    async fn launch(&self, name: &str, path: &Path) -> Result<PluginClient, ManagerError> {
        debug!(plugin = name, path = %path.display(), "spawning plugin process");
        PluginClient::spawn(name, path)
            .await
            .map_err(|source| ManagerError::Launch { name: name.to_string(), source })
    }
}

type LaunchFuture = Pin<Box<dyn Future<Output = PluginResult<PluginClient>> + Send>>;
type Factory = Arc<dyn Fn(String) -> LaunchFuture + Send + Sync>;

/// Runs registered plugins on tasks of the current runtime, each connected
/// through an in-memory pipe that speaks the same protocol as a child
/// process, handshake included.
#[derive(Default, Clone)]
pub struct InProcessLauncher {
    factories: BTreeMap<String, Factory>,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `name` launchable; `factory` builds a fresh plugin per launch.
    pub fn register<P, F>(mut self, name: &str, factory: F) -> Self
    where
        P: Plugin,
        F: Fn() -> P + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |name: String| -> LaunchFuture {
            let plugin = factory();
            Box::pin(async move { PluginClient::in_process(&name, plugin).await })
        });
        self.factories.insert(name.to_string(), factory);
        self
    }
}

#[async_trait]
impl PluginLauncher for InProcessLauncher {
    fn discover(&self) -> Result<Vec<String>, ManagerError> {
        Ok(self.factories.keys().cloned().collect())
    }

    fn locate(&self, name: &str) -> Result<PathBuf, ManagerError> {
        if self.factories.contains_key(name) {
            Ok(PathBuf::from(format!("in-process:{name}")))
        } else {
            Err(ManagerError::NotFound(name.to_string()))
        }
    }

    async fn launch(&self, name: &str, _path: &Path) -> Result<PluginClient, ManagerError> {
        let factory = self.factories.get(name).ok_or_else(|| ManagerError::NotFound(name.to_string()))?;
        factory(name.to_string())
            .await
            .map_err(|source| ManagerError::Launch { name: name.to_string(), source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_the_prefix_convention() {
        let file = executable_file_name("obsidian");
        assert_eq!(plugin_name(&file), Some("obsidian"));
        assert_eq!(plugin_name("obsidian"), None);
        assert_eq!(plugin_name(EXECUTABLE_PREFIX), None);
    }

    #[test]
    fn discover_needs_a_directory() {
        let launcher = ProcessLauncher::new(None);
        assert!(matches!(launcher.discover(), Err(ManagerError::DirNotConfigured)));

        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(Some(dir.path().join("missing")));
        assert!(launcher.discover().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn discover_skips_what_cannot_be_a_plugin() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, mode: u32| {
            let path = dir.path().join(name);
            std::fs::write(&path, "#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        };
        write("reorg-plugin-obsidian", 0o755);
        write("reorg-plugin-apple-notes", 0o700);
        write("reorg-plugin-readme", 0o644);
        write("other-tool", 0o755);
        std::fs::create_dir(dir.path().join("reorg-plugin-dir")).unwrap();

        let launcher = ProcessLauncher::new(Some(dir.path().to_path_buf()));
        assert_eq!(launcher.discover().unwrap(), vec!["apple-notes", "obsidian"]);
        assert_eq!(launcher.locate("obsidian").unwrap(), dir.path().join("reorg-plugin-obsidian"));
        assert!(matches!(launcher.locate("definitely-absent-xyz"), Err(ManagerError::NotFound(_))));
    }
}
