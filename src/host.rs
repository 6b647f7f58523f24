//! The host-callback service: what a plugin can do to the host's data.
//!
//! One [`HostService`] exists per loaded plugin. It shares the store and the
//! AI collaborator with every other plugin but owns a private state
//! directory.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use reorg_plugin::{
    Area, CategorizeResult, ExtractedTask, HostClient, NewTask, PluginError, PluginResult, Project, ProjectContext,
    Task,
};
use tracing::{debug, warn};

use crate::ai::Categorizer;
use crate::store::{Store, StoreError, slugify, title_case};

/// Collapses path separators and `..` so a key can never leave the state
/// directory.
pub fn sanitize_key(key: &str) -> String {
    key.replace('/', "_").replace('\\', "_").replace("..", "_")
}

pub struct HostService {
    store: Arc<dyn Store>,
    ai: Arc<dyn Categorizer>,
    state_dir: PathBuf,
}

impl HostService {
    pub fn new(store: Arc<dyn Store>, ai: Arc<dyn Categorizer>, state_dir: impl Into<PathBuf>) -> Self {
        Self { store, ai, state_dir: state_dir.into() }
    }

    fn state_path(&self, key: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", sanitize_key(key)))
    }
}

fn matches_name(title: &str, name: &str, slug: &str) -> bool {
    slugify(title).eq_ignore_ascii_case(slug) || title.eq_ignore_ascii_case(name)
}

#[async_trait]
impl HostClient for HostService {
    async fn list_areas(&self) -> PluginResult<Vec<Area>> {
        Ok(self.store.list_areas().await?)
    }

    async fn get_area(&self, id: &str) -> PluginResult<Area> {
        match self.store.get_area(id).await {
            Ok(area) => Ok(area),
            Err(StoreError::NotFound { .. }) => Ok(self.store.get_area_by_slug(id).await?),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_area(&self, title: &str, content: &str, tags: &[String]) -> PluginResult<Area> {
        Ok(self.store.create_area(title, content, tags).await?)
    }

    async fn find_or_create_area(&self, name: &str) -> PluginResult<Area> {
        let slug = slugify(name);
        if let Some(area) = self
            .store
            .list_areas()
            .await?
            .into_iter()
            .find(|a| matches_name(&a.title, name, &slug))
        {
            return Ok(area);
        }
        let area = self.store.create_area(&title_case(name), "", &[]).await?;
        debug!(id = %area.id, title = %area.title, "area created");
        Ok(area)
    }

    async fn list_projects(&self, area_id: &str) -> PluginResult<Vec<Project>> {
        Ok(self.store.list_projects(area_id).await?)
    }

    async fn list_all_projects(&self) -> PluginResult<Vec<Project>> {
        Ok(self.store.list_all_projects().await?)
    }

    async fn get_project(&self, id: &str) -> PluginResult<Project> {
        Ok(self.store.get_project(id).await?)
    }

    async fn create_project(&self, title: &str, area_id: &str, content: &str, tags: &[String]) -> PluginResult<Project> {
        Ok(self.store.create_project(title, area_id, content, tags).await?)
    }

    async fn find_or_create_project(
        &self,
        name: &str,
        area_id: &str,
        content: &str,
        tags: &[String],
    ) -> PluginResult<Project> {
        let slug = slugify(name);
        if let Some(project) = self
            .store
            .list_projects(area_id)
            .await?
            .into_iter()
            .find(|p| matches_name(&p.title, name, &slug))
        {
            return Ok(project);
        }
        let project = self.store.create_project(name, area_id, content, tags).await?;
        debug!(id = %project.id, title = %project.title, "project created");
        Ok(project)
    }

    async fn list_tasks(&self, project_id: &str) -> PluginResult<Vec<Task>> {
        Ok(self.store.list_tasks(project_id).await?)
    }

    async fn create_task(&self, task: NewTask) -> PluginResult<Task> {
        Ok(self.store.create_task(task).await?)
    }

    async fn build_project_context(&self) -> PluginResult<Vec<ProjectContext>> {
        let mut context = Vec::new();
        for area in self.store.list_areas().await? {
            let projects = match self.store.list_projects(&area.id).await {
                Ok(projects) => projects,
                Err(e) => {
                    warn!(area = %area.id, error = %e, "skipping area in project context");
                    continue;
                }
            };
            context.extend(projects.into_iter().map(|p| ProjectContext {
                id: p.id,
                title: p.title,
                area: area.title.clone(),
            }));
        }
        Ok(context)
    }

    async fn categorize_with_context(
        &self,
        content: &str,
        existing_projects: &[ProjectContext],
    ) -> PluginResult<CategorizeResult> {
        self.ai
            .categorize_with_context(content, existing_projects)
            .await
            .map_err(|e| PluginError::other(e.to_string()))
    }

    async fn extract_tasks(&self, content: &str) -> PluginResult<Vec<ExtractedTask>> {
        self.ai.extract_tasks(content).await.map_err(|e| PluginError::other(e.to_string()))
    }

    async fn get_state(&self, key: &str) -> PluginResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.state_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_state(&self, key: &str, value: &[u8]) -> PluginResult<()> {
        tokio::fs::create_dir_all(&self.state_dir).await?;
        tokio::fs::write(self.state_path(key), value).await?;
        Ok(())
    }

    async fn delete_state(&self, key: &str) -> PluginResult<()> {
        match tokio::fs::remove_file(self.state_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
