//! Apple Notes importer.
//!
//! Configuration keys (all optional):
//!
//! | key       | default | meaning                                       |
//! |-----------|---------|-----------------------------------------------|
//! | `since`   | `24h`   | only notes modified within this window        |
//! | `auto`    | `true`  | accept categorizations without review         |
//! | `folders` | (all)   | comma-separated folder names, case-insensitive |

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use reorg_plugin::import::{SourceNote, parse_since, run_import, split_list};
use reorg_plugin::{ExecuteParams, ExecuteResult, HostClient, Manifest, Plugin, PluginError, PluginResult};
use schemars::JsonSchema;
use serde::Serialize;
use tracing::{info, warn};

pub mod reader;

pub use reader::{AppleNote, NoteReader, OsaScriptReader};

pub const NAME: &str = "apple-notes-importer";
pub const DEFAULT_SCHEDULE: &str = "0 */15 * * * *";

/// Settings understood by the importer.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct AppleNotesConfig {
    /// Recency window such as `24h`, `90m` or `7d`.
    pub since: String,
    /// Accept AI categorizations without review.
    pub auto: bool,
    /// Folders to import from; empty imports every folder.
    pub folders: Vec<String>,
}

impl Default for AppleNotesConfig {
    fn default() -> Self {
        Self { since: "24h".into(), auto: true, folders: Vec::new() }
    }
}

impl AppleNotesConfig {
    pub fn from_map(config: &HashMap<String, String>) -> Self {
        let mut cfg = Self::default();
        if let Some(since) = config.get("since") {
            cfg.since = since.clone();
        }
        if let Some(auto) = config.get("auto") {
            cfg.auto = auto == "true";
        }
        if let Some(folders) = config.get("folders") {
            cfg.folders = split_list(folders);
        }
        cfg
    }
}

pub struct AppleNotesPlugin {
    host: Option<Arc<dyn HostClient>>,
    config: AppleNotesConfig,
    reader: Arc<dyn NoteReader>,
    state_dir: PathBuf,
}

impl Default for AppleNotesPlugin {
    fn default() -> Self {
        Self::with_reader(OsaScriptReader)
    }
}

impl AppleNotesPlugin {
    pub fn with_reader(reader: impl NoteReader + 'static) -> Self {
        Self {
            host: None,
            config: AppleNotesConfig::default(),
            reader: Arc::new(reader),
            state_dir: PathBuf::new(),
        }
    }

    pub fn config(&self) -> &AppleNotesConfig {
        &self.config
    }
}

/// Keeps notes whose folder matches one of `folders`, ignoring case.
pub fn filter_folders(notes: Vec<AppleNote>, folders: &[String]) -> Vec<AppleNote> {
    if folders.is_empty() {
        return notes;
    }
    notes
        .into_iter()
        .filter(|n| folders.iter().any(|f| f.eq_ignore_ascii_case(&n.folder)))
        .collect()
}

fn to_source(note: AppleNote) -> SourceNote {
    let mut metadata = BTreeMap::from([("folder".to_string(), note.folder.clone())]);
    if let Some(modified) = note.modified() {
        metadata.insert("modified".to_string(), modified.to_rfc3339());
    }
    SourceNote {
        content: note.plain_text(),
        metadata,
        id: note.id,
        name: note.name,
        tags: Vec::new(),
    }
}

#[async_trait]
impl Plugin for AppleNotesPlugin {
    async fn get_manifest(&self) -> PluginResult<Manifest> {
        let schema = schemars::schema_for!(AppleNotesConfig);
        Ok(Manifest {
            name: NAME.into(),
            version: env!("CARGO_PKG_VERSION").into(),
            description: "Import notes from Apple Notes into reorg".into(),
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
        state_dir: PathBuf,
    ) -> PluginResult<()> {
        self.host = Some(host);
        self.config = AppleNotesConfig::from_map(&config);
        self.state_dir = state_dir;
        info!(since = %self.config.since, folders = ?self.config.folders, state_dir = %self.state_dir.display(), "apple notes importer configured");
        Ok(())
    }

    async fn execute(&self, params: ExecuteParams) -> PluginResult<ExecuteResult> {
        let host = self.host.as_ref().ok_or_else(|| PluginError::other("plugin not configured"))?;

        let since = match parse_since(&self.config.since) {
            Ok(since) => since,
            Err(e) => return Ok(ExecuteResult::failed(format!("invalid since duration: {e}"))),
        };
        let notes = match self.reader.read_notes(since).await {
            Ok(notes) => notes,
            Err(e) => {
                warn!(error = %e, "reading Apple Notes failed");
                return Ok(ExecuteResult::failed(format!("failed to read Apple Notes: {e:#}")));
            }
        };
        let notes: Vec<SourceNote> = filter_folders(notes, &self.config.folders).into_iter().map(to_source).collect();

        Ok(run_import(host, notes, &params, "Apple Notes").await)
    }
}
