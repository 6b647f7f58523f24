//! Host callbacks over the plugin connection.
//!
//! During `configure` the host registers its [`HostClient`] in a [`Broker`] and
//! passes the resulting stream id to the plugin. Every callback the plugin makes
//! is a request on the shared connection with params `{"broker": id, "args": ..}`;
//! the host resolves the id and dispatches to the registered service.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};
use crate::jsonrpc::{HostMethod, Id, Request, Response, UNKNOWN_BROKER};
use crate::message::*;
use crate::plugin::HostClient;
use crate::rpc::{Connection, DispatchError, params, to_result};

#[derive(Debug, Serialize, Deserialize)]
struct Brokered {
    broker: u32,
    #[serde(default)]
    args: Value,
}

#[derive(Serialize, Deserialize)]
struct IdArgs {
    id: String,
}

#[derive(Serialize, Deserialize)]
struct NameArgs {
    name: String,
}

#[derive(Serialize, Deserialize)]
struct AreaArgs {
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct AreaIdArgs {
    area_id: String,
}

#[derive(Serialize, Deserialize)]
struct ProjectIdArgs {
    project_id: String,
}

#[derive(Serialize, Deserialize)]
struct ProjectArgs {
    title: String,
    area_id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct FindProjectArgs {
    name: String,
    area_id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct CategorizeArgs {
    content: String,
    #[serde(default)]
    existing_projects: Vec<ProjectContext>,
}

#[derive(Serialize, Deserialize)]
struct ContentArgs {
    content: String,
}

#[derive(Serialize, Deserialize)]
struct KeyArgs {
    key: String,
}

#[derive(Serialize, Deserialize)]
struct SetStateArgs {
    key: String,
    /// base64
    value: String,
}

#[derive(Serialize, Deserialize)]
struct StateValue {
    found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

// ---------------------------------------------------------------------------
// plugin side
// ---------------------------------------------------------------------------

/// [`HostClient`] as seen from inside a plugin process.
pub struct RemoteHost {
    conn: Connection,
    broker: u32,
}

impl RemoteHost {
    pub fn new(conn: Connection, broker: u32) -> Self {
        Self { conn, broker }
    }

    async fn call<T: DeserializeOwned, A: Serialize>(&self, method: HostMethod, args: A) -> PluginResult<T> {
        let envelope = Brokered { broker: self.broker, args: serde_json::to_value(args)? };
        self.conn.call(method, Some(serde_json::to_value(envelope)?)).await
    }
}

#[async_trait]
impl HostClient for RemoteHost {
    async fn list_areas(&self) -> PluginResult<Vec<Area>> {
        self.call(HostMethod::ListAreas, json!({})).await
    }

    async fn get_area(&self, id: &str) -> PluginResult<Area> {
        self.call(HostMethod::GetArea, IdArgs { id: id.into() }).await
    }

    async fn create_area(&self, title: &str, content: &str, tags: &[String]) -> PluginResult<Area> {
        let args = AreaArgs { title: title.into(), content: content.into(), tags: tags.to_vec() };
        self.call(HostMethod::CreateArea, args).await
    }

    async fn find_or_create_area(&self, name: &str) -> PluginResult<Area> {
        self.call(HostMethod::FindOrCreateArea, NameArgs { name: name.into() }).await
    }

    async fn list_projects(&self, area_id: &str) -> PluginResult<Vec<Project>> {
        self.call(HostMethod::ListProjects, AreaIdArgs { area_id: area_id.into() }).await
    }

    async fn list_all_projects(&self) -> PluginResult<Vec<Project>> {
        self.call(HostMethod::ListAllProjects, json!({})).await
    }

    async fn get_project(&self, id: &str) -> PluginResult<Project> {
        self.call(HostMethod::GetProject, IdArgs { id: id.into() }).await
    }

    async fn create_project(&self, title: &str, area_id: &str, content: &str, tags: &[String]) -> PluginResult<Project> {
        let args = ProjectArgs {
            title: title.into(),
            area_id: area_id.into(),
            content: content.into(),
            tags: tags.to_vec(),
        };
        self.call(HostMethod::CreateProject, args).await
    }

    async fn find_or_create_project(
        &self,
        name: &str,
        area_id: &str,
        content: &str,
        tags: &[String],
    ) -> PluginResult<Project> {
        let args = FindProjectArgs {
            name: name.into(),
            area_id: area_id.into(),
            content: content.into(),
            tags: tags.to_vec(),
        };
        self.call(HostMethod::FindOrCreateProject, args).await
    }

    async fn list_tasks(&self, project_id: &str) -> PluginResult<Vec<Task>> {
        self.call(HostMethod::ListTasks, ProjectIdArgs { project_id: project_id.into() }).await
    }

    async fn create_task(&self, task: NewTask) -> PluginResult<Task> {
        self.call(HostMethod::CreateTask, task).await
    }

    async fn build_project_context(&self) -> PluginResult<Vec<ProjectContext>> {
        self.call(HostMethod::BuildProjectContext, json!({})).await
    }

    async fn categorize_with_context(
        &self,
        content: &str,
        existing_projects: &[ProjectContext],
    ) -> PluginResult<CategorizeResult> {
        let args = CategorizeArgs { content: content.into(), existing_projects: existing_projects.to_vec() };
        self.call(HostMethod::CategorizeWithContext, args).await
    }

    async fn extract_tasks(&self, content: &str) -> PluginResult<Vec<ExtractedTask>> {
        self.call(HostMethod::ExtractTasks, ContentArgs { content: content.into() }).await
    }

    async fn get_state(&self, key: &str) -> PluginResult<Option<Vec<u8>>> {
        let state: StateValue = self.call(HostMethod::GetState, KeyArgs { key: key.into() }).await?;
        match (state.found, state.value) {
            (true, Some(encoded)) => STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(|e| PluginError::Json(format!("state `{key}` is not valid base64: {e}"))),
            (true, None) => Ok(Some(Vec::new())),
            (false, _) => Ok(None),
        }
    }

    async fn set_state(&self, key: &str, value: &[u8]) -> PluginResult<()> {
        let args = SetStateArgs { key: key.into(), value: STANDARD.encode(value) };
        self.call(HostMethod::SetState, args).await
    }

    async fn delete_state(&self, key: &str) -> PluginResult<()> {
        self.call(HostMethod::DeleteState, KeyArgs { key: key.into() }).await
    }
}

// ---------------------------------------------------------------------------
// host side
// ---------------------------------------------------------------------------

/// Registry of host services reachable from one plugin connection.
#[derive(Default)]
pub struct Broker {
    next_id: AtomicU32,
    services: DashMap<u32, Arc<dyn HostClient>>,
}

impl Broker {
    /// Registers `service` and returns its stream id (never 0).
    pub fn register(&self, service: Arc<dyn HostClient>) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.services.insert(id, service);
        debug!(broker = id, "host service registered");
        id
    }

    pub fn remove(&self, id: u32) {
        self.services.remove(&id);
    }

    /// Serves one plugin→host request. Notifications get no response.
    pub async fn dispatch(&self, req: Request) -> Option<Response> {
        let id: Id = req.id.clone()?;
        let envelope: Brokered = match params(req.params) {
            Ok(envelope) => envelope,
            Err(err) => return Some(err.into_response(id)),
        };
        let Some(service) = self.services.get(&envelope.broker).map(|s| Arc::clone(s.value())) else {
            warn!(broker = envelope.broker, method = %req.method, "callback on unknown broker stream");
            return Some(Response::fail(
                id,
                UNKNOWN_BROKER,
                format!("unknown broker stream {}", envelope.broker),
                None,
            ));
        };
        let Ok(method) = req.method.parse::<HostMethod>() else {
            return Some(DispatchError::MethodNotFound(req.method).into_response(id));
        };

        Some(match dispatch_host_call(service.as_ref(), method, envelope.args).await {
            Ok(result) => Response::success(id, result),
            Err(err) => {
                debug!(%method, error = ?err, "host callback failed");
                err.into_response(id)
            }
        })
    }
}

/// Decodes `args` for `method`, invokes `service`, and encodes the reply.
pub async fn dispatch_host_call(
    service: &dyn HostClient,
    method: HostMethod,
    args: Value,
) -> Result<Value, DispatchError> {
    let args = Some(args);
    match method {
        HostMethod::ListAreas => to_result(service.list_areas().await?),
        HostMethod::GetArea => {
            let a: IdArgs = params(args)?;
            to_result(service.get_area(&a.id).await?)
        }
        HostMethod::CreateArea => {
            let a: AreaArgs = params(args)?;
            to_result(service.create_area(&a.title, &a.content, &a.tags).await?)
        }
        HostMethod::FindOrCreateArea => {
            let a: NameArgs = params(args)?;
            to_result(service.find_or_create_area(&a.name).await?)
        }
        HostMethod::ListProjects => {
            let a: AreaIdArgs = params(args)?;
            to_result(service.list_projects(&a.area_id).await?)
        }
        HostMethod::ListAllProjects => to_result(service.list_all_projects().await?),
        HostMethod::GetProject => {
            let a: IdArgs = params(args)?;
            to_result(service.get_project(&a.id).await?)
        }
        HostMethod::CreateProject => {
            let a: ProjectArgs = params(args)?;
            to_result(service.create_project(&a.title, &a.area_id, &a.content, &a.tags).await?)
        }
        HostMethod::FindOrCreateProject => {
            let a: FindProjectArgs = params(args)?;
            to_result(service.find_or_create_project(&a.name, &a.area_id, &a.content, &a.tags).await?)
        }
        HostMethod::ListTasks => {
            let a: ProjectIdArgs = params(args)?;
            to_result(service.list_tasks(&a.project_id).await?)
        }
        HostMethod::CreateTask => {
            let task: NewTask = params(args)?;
            to_result(service.create_task(task).await?)
        }
        HostMethod::BuildProjectContext => to_result(service.build_project_context().await?),
        HostMethod::CategorizeWithContext => {
            let a: CategorizeArgs = params(args)?;
            to_result(service.categorize_with_context(&a.content, &a.existing_projects).await?)
        }
        HostMethod::ExtractTasks => {
            let a: ContentArgs = params(args)?;
            to_result(service.extract_tasks(&a.content).await?)
        }
        HostMethod::GetState => {
            let a: KeyArgs = params(args)?;
            let state = match service.get_state(&a.key).await? {
                Some(bytes) => StateValue { found: true, value: Some(STANDARD.encode(bytes)) },
                None => StateValue { found: false, value: None },
            };
            to_result(state)
        }
        HostMethod::SetState => {
            let a: SetStateArgs = params(args)?;
            let bytes = STANDARD
                .decode(a.value)
                .map_err(|e| DispatchError::InvalidParams(format!("state value is not valid base64: {e}")))?;
            service.set_state(&a.key, &bytes).await?;
            Ok(Value::Null)
        }
        HostMethod::DeleteState => {
            let a: KeyArgs = params(args)?;
            service.delete_state(&a.key).await?;
            Ok(Value::Null)
        }
    }
}
