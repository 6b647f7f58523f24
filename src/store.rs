//! Storage of areas, projects and tasks.
//!
//! [`Store`] is the contract the host-callback service works against.
//! [`MemoryStore`] keeps everything in insertion order and, when opened on a
//! file, rewrites that JSON document after every mutation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use reorg_plugin::{Area, NewTask, PluginError, Project, ProjectStatus, Task, TaskStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store document is invalid: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    fn not_found(kind: &'static str, id: &str) -> Self {
        StoreError::NotFound { kind, id: id.to_string() }
    }
}

impl From<StoreError> for PluginError {
    fn from(err: StoreError) -> Self {
        PluginError::Other(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn list_areas(&self) -> StoreResult<Vec<Area>>;
    async fn get_area(&self, id: &str) -> StoreResult<Area>;
    async fn get_area_by_slug(&self, slug: &str) -> StoreResult<Area>;
    async fn create_area(&self, title: &str, content: &str, tags: &[String]) -> StoreResult<Area>;

    async fn list_projects(&self, area_id: &str) -> StoreResult<Vec<Project>>;
    async fn list_all_projects(&self) -> StoreResult<Vec<Project>>;
    async fn get_project(&self, id: &str) -> StoreResult<Project>;
    async fn create_project(&self, title: &str, area_id: &str, content: &str, tags: &[String]) -> StoreResult<Project>;

    async fn list_tasks(&self, project_id: &str) -> StoreResult<Vec<Task>>;
    async fn create_task(&self, task: NewTask) -> StoreResult<Task>;
}

/// Lowercases, turns spaces into hyphens and drops everything outside
/// `[a-z0-9-]`.
pub fn slugify(s: &str) -> String {
    s.to_lowercase()
        .replace(' ', "-")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect()
}

/// Capitalizes the first letter of every word and lowercases the rest.
pub fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// `<prefix>-` followed by the first 8 hex characters of a UUID v4.
pub fn new_id(prefix: &str) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &uuid[..8])
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    areas: Vec<Area>,
    #[serde(default)]
    projects: Vec<Project>,
    #[serde(default)]
    tasks: Vec<Task>,
}

#[derive(Default)]
pub struct MemoryStore {
    doc: RwLock<Document>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `path` when it exists; later mutations are written back to it.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let doc = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice(&bytes)?
        } else {
            Document::default()
        };
        debug!(path = %path.display(), areas = doc.areas.len(), projects = doc.projects.len(), "store opened");
        Ok(Self { doc: RwLock::new(doc), path: Some(path) })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self, doc: &Document) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(doc)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_areas(&self) -> StoreResult<Vec<Area>> {
        Ok(self.doc.read().await.areas.clone())
    }

    async fn get_area(&self, id: &str) -> StoreResult<Area> {
        let doc = self.doc.read().await;
        doc.areas
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("area", id))
    }

    async fn get_area_by_slug(&self, slug: &str) -> StoreResult<Area> {
        let doc = self.doc.read().await;
        doc.areas
            .iter()
            .find(|a| slugify(&a.title) == slug)
            .cloned()
            .ok_or_else(|| StoreError::not_found("area", slug))
    }

    async fn create_area(&self, title: &str, content: &str, tags: &[String]) -> StoreResult<Area> {
        let now = Utc::now();
        let area = Area {
            id: new_id("area"),
            title: title.to_string(),
            content: content.to_string(),
            tags: tags.to_vec(),
            created_at: now,
            updated_at: now,
        };
        let mut doc = self.doc.write().await;
        doc.areas.push(area.clone());
        self.persist(&doc).await?;
        Ok(area)
    }

    async fn list_projects(&self, area_id: &str) -> StoreResult<Vec<Project>> {
        let doc = self.doc.read().await;
        Ok(doc.projects.iter().filter(|p| p.area_id == area_id).cloned().collect())
    }

    async fn list_all_projects(&self) -> StoreResult<Vec<Project>> {
        Ok(self.doc.read().await.projects.clone())
    }

    async fn get_project(&self, id: &str) -> StoreResult<Project> {
        let doc = self.doc.read().await;
        doc.projects
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("project", id))
    }

    async fn create_project(&self, title: &str, area_id: &str, content: &str, tags: &[String]) -> StoreResult<Project> {
        let mut doc = self.doc.write().await;
        if !doc.areas.iter().any(|a| a.id == area_id) {
            return Err(StoreError::not_found("area", area_id));
        }
        let now = Utc::now();
        let mut project_tags: Vec<String> = Vec::with_capacity(tags.len());
        for tag in tags {
            if !project_tags.contains(tag) {
                project_tags.push(tag.clone());
            }
        }
        let project = Project {
            id: new_id("project"),
            title: title.to_string(),
            area_id: area_id.to_string(),
            content: content.to_string(),
            status: ProjectStatus::Active,
            tags: project_tags,
            due_date: None,
            created_at: now,
            updated_at: now,
        };
        doc.projects.push(project.clone());
        self.persist(&doc).await?;
        Ok(project)
    }

    async fn list_tasks(&self, project_id: &str) -> StoreResult<Vec<Task>> {
        let doc = self.doc.read().await;
        Ok(doc.tasks.iter().filter(|t| t.project_id == project_id).cloned().collect())
    }

    async fn create_task(&self, new: NewTask) -> StoreResult<Task> {
        let mut doc = self.doc.write().await;
        if !doc.projects.iter().any(|p| p.id == new.project_id) {
            return Err(StoreError::not_found("project", &new.project_id));
        }
        let now = Utc::now();
        let task = Task {
            id: new_id("task"),
            title: new.title,
            project_id: new.project_id,
            area_id: new.area_id,
            content: new.content,
            status: TaskStatus::Pending,
            priority: new.priority,
            tags: new.tags,
            due_date: None,
            created_at: now,
            updated_at: now,
        };
        doc.tasks.push(task.clone());
        self.persist(&doc).await?;
        Ok(task)
    }
}
