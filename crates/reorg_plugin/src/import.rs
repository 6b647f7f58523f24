//! Idempotent note import shared by the importer plugins.
//!
//! An import pass loads the `{id → content hash}` map persisted under
//! [`STATE_KEY`], skips every note whose hash is unchanged, and imports the rest
//! through the host: categorize (with a deterministic fallback), find or create
//! the area and project, and create extracted tasks for actionable notes. A
//! failing note is reported and the pass moves on. State is written back only
//! for real runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{PluginError, PluginResult};
use crate::message::*;
use crate::plugin::{HostClient, StateJson};

pub const STATE_KEY: &str = "state";
pub const FALLBACK_AREA: &str = "personal";
const SUMMARY_LEN: usize = 200;

/// A note as produced by an importer's source reader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceNote {
    /// Stable identifier: a source-native id or a vault-relative path.
    pub id: String,
    pub name: String,
    pub content: String,
    pub tags: Vec<String>,
    /// Reported on the item for imported notes.
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportState {
    pub last_run: Option<DateTime<Utc>>,
    pub processed_notes: HashMap<String, String>,
}

/// Lowercase hex of the first 8 bytes of SHA-256.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(&digest[..8])
}

/// Keeps the first `max` characters, appending `...` when something was cut.
pub fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &s[..cut]),
        None => s.to_string(),
    }
}

/// Categorization used whenever the host's AI categorizer fails.
pub fn fallback_categorization(note: &SourceNote) -> CategorizeResult {
    CategorizeResult {
        area: FALLBACK_AREA.to_string(),
        area_confidence: 0.5,
        project_id: None,
        project_suggestion: Some(note.name.clone()),
        tags: note.tags.clone(),
        summary: truncate(&note.content, SUMMARY_LEN),
        is_actionable: false,
    }
}

/// Parses recency windows such as `90s`, `30m`, `24h`, `1h30m`, `1.5h` or `7d`.
pub fn parse_since(s: &str) -> PluginResult<Duration> {
    let s = s.trim();
    let invalid = || PluginError::other(format!("invalid duration {s:?}"));
    if s.is_empty() {
        return Err(invalid());
    }
    if let Some(days) = s.strip_suffix('d') {
        let days: u64 = days.parse().map_err(|_| invalid())?;
        let secs = days.checked_mul(24 * 60 * 60).ok_or_else(invalid)?;
        return Ok(Duration::from_secs(secs));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).ok_or_else(invalid)?;
        if num_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| invalid())?;
        rest = &rest[num_len..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        total += value * seconds_per_unit;
        rest = &rest[unit_len..];
    }
    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}

/// Splits a comma-separated config value, dropping blanks.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Runs one import pass over `notes`. `source` names the origin in the summary.
pub async fn run_import(
    host: &Arc<dyn HostClient>,
    notes: Vec<SourceNote>,
    params: &ExecuteParams,
    source: &str,
) -> ExecuteResult {
    let store = StateJson::new(Arc::clone(host));
    let mut state: ImportState = store.get_or_default(STATE_KEY).await;
    let mut result = ExecuteResult::ok();
    result.summary.items_processed = notes.len();

    let context = if params.dry_run || notes.is_empty() {
        Vec::new()
    } else {
        host.build_project_context().await.unwrap_or_else(|err| {
            warn!(error = %err, "could not build project context");
            Vec::new()
        })
    };

    for note in notes {
        let hash = content_hash(&note.content);
        if state.processed_notes.get(&note.id) == Some(&hash) {
            result.summary.items_skipped += 1;
            result.results.push(item(&note, ItemAction::Skipped, Some("already imported (unchanged)".into())));
            continue;
        }

        if params.dry_run {
            result.summary.items_imported += 1;
            result.results.push(imported(&note));
            continue;
        }

        match import_note(host.as_ref(), &note, &context).await {
            Ok(()) => {
                state.processed_notes.insert(note.id.clone(), hash);
                result.summary.items_imported += 1;
                result.results.push(imported(&note));
            }
            Err(err) => {
                warn!(note = %note.id, error = %err, "note import failed");
                result.summary.items_failed += 1;
                result.results.push(item(&note, ItemAction::Failed, Some(err.to_string())));
            }
        }
    }

    if !params.dry_run {
        state.last_run = Some(Utc::now());
        if let Err(err) = store.set(STATE_KEY, &state).await {
            warn!(error = %err, "could not persist import state");
        }
    }

    result.summary.message = format!("Processed {} notes from {source}", result.summary.items_processed);
    info!(
        processed = result.summary.items_processed,
        imported = result.summary.items_imported,
        skipped = result.summary.items_skipped,
        failed = result.summary.items_failed,
        dry_run = params.dry_run,
        "import pass finished"
    );
    result
}

async fn import_note(host: &dyn HostClient, note: &SourceNote, context: &[ProjectContext]) -> PluginResult<()> {
    let cat = match host.categorize_with_context(&note.content, context).await {
        Ok(cat) => cat,
        Err(err) => {
            debug!(note = %note.id, error = %err, "categorization unavailable, using fallback");
            fallback_categorization(note)
        }
    };

    let area = host
        .find_or_create_area(&cat.area)
        .await
        .map_err(|e| PluginError::other(format!("failed to find/create area: {e}")))?;

    let existing = match cat.project_id.as_deref().filter(|id| !id.is_empty()) {
        Some(id) => host.get_project(id).await.ok(),
        None => None,
    };
    let project = match existing {
        Some(project) => project,
        None => {
            let title = cat
                .project_suggestion
                .as_deref()
                .filter(|s| !s.is_empty())
                .unwrap_or(&note.name);
            let mut tags = cat.tags.clone();
            for tag in &note.tags {
                if !tags.contains(tag) {
                    tags.push(tag.clone());
                }
            }
            host.find_or_create_project(title, &area.id, &cat.summary, &tags)
                .await
                .map_err(|e| PluginError::other(format!("failed to find/create project: {e}")))?
        }
    };

    if cat.is_actionable {
        match host.extract_tasks(&note.content).await {
            Ok(tasks) => {
                for t in tasks {
                    let new = NewTask {
                        title: t.title,
                        project_id: project.id.clone(),
                        area_id: area.id.clone(),
                        content: t.description,
                        priority: Priority::from_label(&t.priority),
                        tags: t.tags,
                    };
                    if let Err(err) = host.create_task(new).await {
                        warn!(note = %note.id, error = %err, "task creation failed");
                    }
                }
            }
            Err(err) => debug!(note = %note.id, error = %err, "task extraction unavailable"),
        }
    }
    Ok(())
}

fn imported(note: &SourceNote) -> ExecuteItem {
    let mut it = item(note, ItemAction::Imported, None);
    it.metadata = note.metadata.clone();
    it
}

fn item(note: &SourceNote, action: ItemAction, message: Option<String>) -> ExecuteItem {
    ExecuteItem {
        id: note.id.clone(),
        name: note.name.clone(),
        action,
        message,
        metadata: BTreeMap::new(),
    }
}
