use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Static plugin metadata returned by `getManifest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(default)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    /// Six-field cron expression; empty means unscheduled.
    pub schedule: String,
    pub capabilities: Vec<String>,
    /// Informational JSON Schema for the plugin configuration.
    pub config_schema: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(default)]
pub struct ExecuteParams {
    pub dry_run: bool,
    pub params: HashMap<String, String>,
}

impl ExecuteParams {
    pub fn dry_run(dry_run: bool) -> Self {
        Self { dry_run, params: HashMap::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(default)]
pub struct ExecuteResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub summary: ExecuteSummary,
    pub results: Vec<ExecuteItem>,
}

impl ExecuteResult {
    pub fn ok() -> Self {
        Self { success: true, ..Default::default() }
    }

    /// A result for an execution that could not get started.
    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(default)]
pub struct ExecuteSummary {
    pub items_processed: usize,
    pub items_imported: usize,
    pub items_skipped: usize,
    pub items_failed: usize,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ItemAction {
    Imported,
    Skipped,
    Failed,
}

impl fmt::Display for ItemAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ItemAction::Imported => "imported",
            ItemAction::Skipped => "skipped",
            ItemAction::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteItem {
    pub id: String,
    pub name: String,
    pub action: ItemAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Area {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Project {
    pub id: String,
    pub title: String,
    pub area_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Active,
    OnHold,
    Completed,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub project_id: String,
    pub area_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    /// Maps a free-form label (as produced by the AI extractor) onto a priority.
    /// Unknown labels become `Medium`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" => Priority::Low,
            "high" => Priority::High,
            "urgent" => Priority::Urgent,
            _ => Priority::Medium,
        }
    }
}

/// Input for `createTask`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct NewTask {
    pub title: String,
    pub project_id: String,
    pub area_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// An existing project as seen by the categorizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProjectContext {
    pub id: String,
    pub title: String,
    pub area: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(default)]
pub struct CategorizeResult {
    pub area: String,
    pub area_confidence: f64,
    /// Id of an existing project when the categorizer matched one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Suggested title when a new project should be created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_suggestion: Option<String>,
    pub tags: Vec<String>,
    pub summary: String,
    pub is_actionable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(default)]
pub struct ExtractedTask {
    pub title: String,
    pub description: String,
    pub priority: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    pub tags: Vec<String>,
}

/// Parameters of the `configure` lifecycle call.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigureParams {
    /// Broker stream the plugin dials back on for host callbacks.
    pub broker_id: u32,
    #[serde(default)]
    pub config: HashMap<String, String>,
    pub state_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priority_labels_are_lenient() {
        assert_eq!(Priority::from_label("HIGH"), Priority::High);
        assert_eq!(Priority::from_label(" urgent "), Priority::Urgent);
        assert_eq!(Priority::from_label("low"), Priority::Low);
        assert_eq!(Priority::from_label("whenever"), Priority::Medium);
        assert_eq!(Priority::from_label(""), Priority::Medium);
    }

    #[test]
    fn statuses_use_snake_case_on_the_wire() {
        assert_eq!(json!(ProjectStatus::OnHold), json!("on_hold"));
        assert_eq!(json!(TaskStatus::InProgress), json!("in_progress"));
        assert_eq!(json!(Priority::Urgent), json!("urgent"));
        assert_eq!(json!(ItemAction::Skipped), json!("skipped"));
    }

    #[test]
    fn execute_result_tolerates_missing_fields() {
        let res: ExecuteResult = serde_json::from_value(json!({"success": true})).unwrap();
        assert!(res.success);
        assert_eq!(res.summary, ExecuteSummary::default());
        assert!(res.results.is_empty());
    }

    #[test]
    fn manifest_defaults_missing_fields() {
        let m: Manifest = serde_json::from_value(json!({"name": "x", "version": "1"})).unwrap();
        assert_eq!(m.schedule, "");
        assert!(m.capabilities.is_empty());
    }
}
