//! Obsidian vault importer.
//!
//! Each markdown note in the vault becomes a project (or lands in a matching
//! existing one); the note's vault-relative path is its identity across runs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reorg_plugin::import::{SourceNote, parse_since, run_import, split_list};
use reorg_plugin::{ExecuteParams, ExecuteResult, HostClient, Manifest, Plugin, PluginError, PluginResult};
use schemars::JsonSchema;
use serde::Serialize;
use tracing::{info, warn};

pub mod vault;

use vault::{Scan, VaultNote, read_vault};

pub const NAME: &str = "obsidian-importer";
pub const DEFAULT_SCHEDULE: &str = "0 0 */6 * * *";

#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct ObsidianConfig {
    /// Vault root; `~/` is expanded.
    pub vault_path: Option<PathBuf>,
    /// Recency window such as `24h` or `7d`; empty imports regardless of age.
    pub since: String,
    /// Vault-relative folder prefixes to import from.
    pub folders: Vec<String>,
    /// Directory names never descended into.
    pub skip_dirs: Vec<String>,
}

impl Default for ObsidianConfig {
    fn default() -> Self {
        Self {
            vault_path: None,
            since: "24h".into(),
            folders: Vec::new(),
            skip_dirs: vec![".obsidian".into(), ".git".into(), ".trash".into()],
        }
    }
}

impl ObsidianConfig {
    pub fn from_map(config: &HashMap<String, String>) -> Self {
        let mut cfg = Self::default();
        if let Some(path) = config.get("vault_path").filter(|p| !p.trim().is_empty()) {
            cfg.vault_path = Some(expand_home(path.trim()));
        }
        if let Some(since) = config.get("since") {
            cfg.since = since.trim().to_string();
        }
        if let Some(folders) = config.get("folders") {
            cfg.folders = split_list(folders);
        }
        if let Some(skip) = config.get("skip_dirs").filter(|s| !s.trim().is_empty()) {
            cfg.skip_dirs = split_list(skip);
        }
        cfg
    }
}

pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[derive(Default)]
pub struct ObsidianPlugin {
    host: Option<Arc<dyn HostClient>>,
    config: ObsidianConfig,
}

impl ObsidianPlugin {
    pub fn config(&self) -> &ObsidianConfig {
        &self.config
    }
}

fn to_source(note: VaultNote) -> SourceNote {
    SourceNote {
        metadata: BTreeMap::from([("path".to_string(), note.relative_path.clone())]),
        id: note.relative_path,
        name: note.name,
        content: note.content,
        tags: note.tags,
    }
}

async fn scan_vault(vault: &Path, scan: Scan) -> anyhow::Result<Vec<VaultNote>> {
    let vault = vault.to_path_buf();
    tokio::task::spawn_blocking(move || read_vault(&vault, &scan)).await?
}

#[async_trait]
impl Plugin for ObsidianPlugin {
    async fn get_manifest(&self) -> PluginResult<Manifest> {
        let schema = schemars::schema_for!(ObsidianConfig);
        Ok(Manifest {
            name: NAME.into(),
            version: env!("CARGO_PKG_VERSION").into(),
            description: "Import notes from Obsidian vault into reorg".into(),
            author: "reorg".into(),
            schedule: DEFAULT_SCHEDULE.into(),
            capabilities: vec!["import".into()],
            config_schema: serde_json::to_string(&schema)?,
        })
    }

    async fn configure(
        &mut self,
        host: Arc<dyn HostClient>,
        config: HashMap<String, String>,
        _state_dir: PathBuf,
    ) -> PluginResult<()> {
        self.host = Some(host);
        self.config = ObsidianConfig::from_map(&config);
        info!(vault = ?self.config.vault_path, since = %self.config.since, "obsidian importer configured");
        Ok(())
    }

    async fn execute(&self, params: ExecuteParams) -> PluginResult<ExecuteResult> {
        let host = self.host.as_ref().ok_or_else(|| PluginError::other("plugin not configured"))?;

        let Some(vault) = self.config.vault_path.as_deref() else {
            return Ok(ExecuteResult::failed("vault_path not configured"));
        };
        if !vault.exists() {
            return Ok(ExecuteResult::failed(format!("vault not found: {}", vault.display())));
        }
        let since = if self.config.since.is_empty() {
            None
        } else {
            match parse_since(&self.config.since) {
                Ok(since) => Some(since),
                Err(e) => return Ok(ExecuteResult::failed(format!("invalid since duration: {e}"))),
            }
        };

        let scan = Scan {
            since,
            folders: self.config.folders.clone(),
            skip_dirs: self.config.skip_dirs.clone(),
        };
        let notes = match scan_vault(vault, scan).await {
            Ok(notes) => notes,
            Err(e) => {
                warn!(error = %e, "reading vault failed");
                return Ok(ExecuteResult::failed(format!("failed to read vault: {e:#}")));
            }
        };
        let notes: Vec<SourceNote> = notes.into_iter().map(to_source).collect();

        Ok(run_import(host, notes, &params, "Obsidian vault").await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reorg_plugin::ItemAction;
    use reorg_plugin::testing::MockHost;

    async fn configured(pairs: &[(&str, String)]) -> (ObsidianPlugin, Arc<MockHost>) {
        let host = Arc::new(MockHost::default());
        let mut plugin = ObsidianPlugin::default();
        let config = pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        plugin.configure(host.clone(), config, PathBuf::new()).await.unwrap();
        (plugin, host)
    }

    #[test]
    fn config_defaults() {
        let cfg = ObsidianConfig::from_map(&HashMap::new());
        assert_eq!(cfg.vault_path, None);
        assert_eq!(cfg.since, "24h");
        assert_eq!(cfg.skip_dirs, vec![".obsidian", ".git", ".trash"]);

        let cfg = ObsidianConfig::from_map(&HashMap::from([
            ("skip_dirs".to_string(), "archive, tmp".to_string()),
            ("since".to_string(), "".to_string()),
        ]));
        assert_eq!(cfg.skip_dirs, vec!["archive", "tmp"]);
        assert_eq!(cfg.since, "");
    }

    #[test]
    fn home_is_expanded() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/vault"), home.join("vault"));
        }
        assert_eq!(expand_home("/abs/vault"), PathBuf::from("/abs/vault"));
    }

    #[tokio::test]
    async fn missing_vault_settings_fail_cleanly() {
        let (plugin, _) = configured(&[]).await;
        let res = plugin.execute(ExecuteParams::default()).await.unwrap();
        assert_eq!(res.error.as_deref(), Some("vault_path not configured"));

        let (plugin, _) = configured(&[("vault_path", "/definitely/not/here".into())]).await;
        let res = plugin.execute(ExecuteParams::default()).await.unwrap();
        assert!(!res.success);
        assert!(res.error.unwrap().starts_with("vault not found"));
    }

    #[tokio::test]
    async fn imports_vault_notes_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Projects")).unwrap();
        std::fs::write(dir.path().join("Projects/garden.md"), "---\ntags: [home]\n---\nplant tomatoes #spring").unwrap();
        std::fs::write(dir.path().join("reading.md"), "books to read").unwrap();

        let vault = dir.path().to_string_lossy().to_string();
        let (plugin, host) = configured(&[("vault_path", vault), ("since", "".into())]).await;

        let first = plugin.execute(ExecuteParams::default()).await.unwrap();
        assert!(first.success);
        assert_eq!(first.summary.items_imported, 2);
        assert_eq!(first.summary.message, "Processed 2 notes from Obsidian vault");
        let garden = first.results.iter().find(|r| r.id == "Projects/garden.md").unwrap();
        assert_eq!(garden.metadata.get("path").map(String::as_str), Some("Projects/garden.md"));

        let project = host.projects().into_iter().find(|p| p.title == "garden").unwrap();
        assert_eq!(project.tags, vec!["home", "spring"]);

        let second = plugin.execute(ExecuteParams::default()).await.unwrap();
        assert_eq!(second.summary.items_skipped, 2);
        assert!(second.results.iter().all(|r| r.action == ItemAction::Skipped));
    }
}
