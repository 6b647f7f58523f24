//! In-memory [`HostClient`] for exercising plugins without a host process.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{PluginError, PluginResult};
use crate::message::*;
use crate::plugin::HostClient;

/// Areas created on demand are title-cased, as the real host does.
fn title_case(s: &str) -> String {
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

#[derive(Default)]
struct Inner {
    areas: Vec<Area>,
    projects: Vec<Project>,
    tasks: Vec<Task>,
    state: HashMap<String, Vec<u8>>,
    categorize: Option<CategorizeResult>,
    extracted: Vec<ExtractedTask>,
    categorize_calls: usize,
}

#[derive(Default)]
pub struct MockHost {
    inner: Mutex<Inner>,
}

impl MockHost {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes `categorizeWithContext` succeed with `result`. Without it the
    /// call fails the way an unconfigured AI provider does.
    pub fn with_categorization(self, result: CategorizeResult) -> Self {
        self.lock().categorize = Some(result);
        self
    }

    pub fn with_extracted_tasks(self, tasks: Vec<ExtractedTask>) -> Self {
        self.lock().extracted = tasks;
        self
    }

    pub fn areas(&self) -> Vec<Area> {
        self.lock().areas.clone()
    }

    pub fn projects(&self) -> Vec<Project> {
        self.lock().projects.clone()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.lock().tasks.clone()
    }

    pub fn state(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().state.get(key).cloned()
    }

    pub fn categorize_calls(&self) -> usize {
        self.lock().categorize_calls
    }

    fn new_area(inner: &mut Inner, title: &str, content: &str, tags: &[String]) -> Area {
        let now = Utc::now();
        let area = Area {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            content: content.to_string(),
            tags: tags.to_vec(),
            created_at: now,
            updated_at: now,
        };
        inner.areas.push(area.clone());
        area
    }

    fn new_project(inner: &mut Inner, title: &str, area_id: &str, content: &str, tags: &[String]) -> Project {
        let now = Utc::now();
        let project = Project {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            area_id: area_id.to_string(),
            content: content.to_string(),
            status: ProjectStatus::Active,
            tags: tags.to_vec(),
            due_date: None,
            created_at: now,
            updated_at: now,
        };
        inner.projects.push(project.clone());
        project
    }
}

#[async_trait]
impl HostClient for MockHost {
    async fn list_areas(&self) -> PluginResult<Vec<Area>> {
        Ok(self.areas())
    }

    async fn get_area(&self, id: &str) -> PluginResult<Area> {
        self.lock()
            .areas
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| PluginError::other(format!("area not found: {id}")))
    }

    async fn create_area(&self, title: &str, content: &str, tags: &[String]) -> PluginResult<Area> {
        Ok(Self::new_area(&mut self.lock(), title, content, tags))
    }

    async fn find_or_create_area(&self, name: &str) -> PluginResult<Area> {
        let mut inner = self.lock();
        if let Some(area) = inner.areas.iter().find(|a| a.title.eq_ignore_ascii_case(name)) {
            return Ok(area.clone());
        }
        Ok(Self::new_area(&mut inner, &title_case(name), "", &[]))
    }

    async fn list_projects(&self, area_id: &str) -> PluginResult<Vec<Project>> {
        Ok(self.lock().projects.iter().filter(|p| p.area_id == area_id).cloned().collect())
    }

    async fn list_all_projects(&self) -> PluginResult<Vec<Project>> {
        Ok(self.projects())
    }

    async fn get_project(&self, id: &str) -> PluginResult<Project> {
        self.lock()
            .projects
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| PluginError::other(format!("project not found: {id}")))
    }

    async fn create_project(&self, title: &str, area_id: &str, content: &str, tags: &[String]) -> PluginResult<Project> {
        Ok(Self::new_project(&mut self.lock(), title, area_id, content, tags))
    }

    async fn find_or_create_project(
        &self,
        name: &str,
        area_id: &str,
        content: &str,
        tags: &[String],
    ) -> PluginResult<Project> {
        let mut inner = self.lock();
        if let Some(project) = inner
            .projects
            .iter()
            .find(|p| p.area_id == area_id && p.title.eq_ignore_ascii_case(name))
        {
            return Ok(project.clone());
        }
        Ok(Self::new_project(&mut inner, name, area_id, content, tags))
    }

    async fn list_tasks(&self, project_id: &str) -> PluginResult<Vec<Task>> {
        Ok(self.lock().tasks.iter().filter(|t| t.project_id == project_id).cloned().collect())
    }

    async fn create_task(&self, task: NewTask) -> PluginResult<Task> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            title: task.title,
            project_id: task.project_id,
            area_id: task.area_id,
            content: task.content,
            status: TaskStatus::Pending,
            priority: task.priority,
            tags: task.tags,
            due_date: None,
            created_at: now,
            updated_at: now,
        };
        self.lock().tasks.push(task.clone());
        Ok(task)
    }

    async fn build_project_context(&self) -> PluginResult<Vec<ProjectContext>> {
        let inner = self.lock();
        Ok(inner
            .projects
            .iter()
            .map(|p| ProjectContext {
                id: p.id.clone(),
                title: p.title.clone(),
                area: inner
                    .areas
                    .iter()
                    .find(|a| a.id == p.area_id)
                    .map(|a| a.title.clone())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn categorize_with_context(&self, _content: &str, _existing: &[ProjectContext]) -> PluginResult<CategorizeResult> {
        let mut inner = self.lock();
        inner.categorize_calls += 1;
        inner
            .categorize
            .clone()
            .ok_or_else(|| PluginError::other("no AI provider configured"))
    }

    async fn extract_tasks(&self, _content: &str) -> PluginResult<Vec<ExtractedTask>> {
        Ok(self.lock().extracted.clone())
    }

    async fn get_state(&self, key: &str) -> PluginResult<Option<Vec<u8>>> {
        Ok(self.state(key))
    }

    async fn set_state(&self, key: &str, value: &[u8]) -> PluginResult<()> {
        self.lock().state.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete_state(&self, key: &str) -> PluginResult<()> {
        self.lock().state.remove(key);
        Ok(())
    }
}
