//! The two service interfaces of a plugin connection.
//!
//! * [`Plugin`] is implemented by every plugin executable and called by the host.
//! * [`HostClient`] is implemented by the host and called by plugins through the
//!   broker stream handed over in `configure`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::{PluginError, PluginResult};
use crate::message::*;

#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Static metadata, including the default schedule.
    async fn get_manifest(&self) -> PluginResult<Manifest>;

    /// Receives the host callback handle, the flat configuration map and the
    /// per-plugin state directory. Missing keys must fall back to defaults.
    async fn configure(
        &mut self,
        host: Arc<dyn HostClient>,
        config: HashMap<String, String>,
        state_dir: PathBuf,
    ) -> PluginResult<()>;

    /// Runs one execution. Per-item failures belong in the result, an `Err`
    /// means the execution as a whole could not be carried out.
    async fn execute(&self, params: ExecuteParams) -> PluginResult<ExecuteResult>;

    async fn shutdown(&mut self) -> PluginResult<()> {
        Ok(())
    }
}

/// Operations a plugin may perform against the host.
#[async_trait]
pub trait HostClient: Send + Sync {
    async fn list_areas(&self) -> PluginResult<Vec<Area>>;
    async fn get_area(&self, id: &str) -> PluginResult<Area>;
    async fn create_area(&self, title: &str, content: &str, tags: &[String]) -> PluginResult<Area>;
    async fn find_or_create_area(&self, name: &str) -> PluginResult<Area>;

    async fn list_projects(&self, area_id: &str) -> PluginResult<Vec<Project>>;
    async fn list_all_projects(&self) -> PluginResult<Vec<Project>>;
    async fn get_project(&self, id: &str) -> PluginResult<Project>;
    async fn create_project(
        &self,
        title: &str,
        area_id: &str,
        content: &str,
        tags: &[String],
    ) -> PluginResult<Project>;
    async fn find_or_create_project(
        &self,
        name: &str,
        area_id: &str,
        content: &str,
        tags: &[String],
    ) -> PluginResult<Project>;

    async fn list_tasks(&self, project_id: &str) -> PluginResult<Vec<Task>>;
    async fn create_task(&self, task: NewTask) -> PluginResult<Task>;

    async fn build_project_context(&self) -> PluginResult<Vec<ProjectContext>>;

    async fn categorize_with_context(
        &self,
        content: &str,
        existing_projects: &[ProjectContext],
    ) -> PluginResult<CategorizeResult>;
    async fn extract_tasks(&self, content: &str) -> PluginResult<Vec<ExtractedTask>>;

    /// Returns `None` when nothing is stored under `key`.
    async fn get_state(&self, key: &str) -> PluginResult<Option<Vec<u8>>>;
    async fn set_state(&self, key: &str, value: &[u8]) -> PluginResult<()>;
    async fn delete_state(&self, key: &str) -> PluginResult<()>;
}

/// JSON view over the host's per-plugin state.
#[derive(Clone)]
pub struct StateJson {
    host: Arc<dyn HostClient>,
}

impl StateJson {
    pub fn new(host: Arc<dyn HostClient>) -> Self {
        Self { host }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> PluginResult<Option<T>> {
        match self.host.get_state(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Like [`StateJson::get`] but every failure reads as "nothing stored".
    pub async fn get_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        match self.get(key).await {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(err) => {
                warn!(key, error = %err, "could not load plugin state, starting fresh");
                T::default()
            }
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> PluginResult<()> {
        let bytes = serde_json::to_vec_pretty(value).map_err(PluginError::from)?;
        self.host.set_state(key, &bytes).await
    }

    pub async fn delete(&self, key: &str) -> PluginResult<()> {
        self.host.delete_state(key).await
    }
}
