use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

/// JSON‑RPC 2.0 core types for reorg plugins communicated over stdin/stdout.
///
/// These structs mirror the [JSON‑RPC 2.0 spec](https://www.jsonrpc.org/specification).
/// Both peers of a plugin connection send requests *and* responses on the same
/// line-delimited stream, so every line decodes into a [`Message`].
///
/// Usage example (with `serde_json`):
/// ```ignore
/// use serde_json::json;
/// use reorg_plugin::jsonrpc::{Id, Method, Request};
///
/// let req = Request::call(Id::Number(1), Method::Execute, Some(json!({"dry_run": true})));
/// let s = serde_json::to_string(&req).unwrap();
/// ```
pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const OPERATION_FAILED: i64 = -32000;
pub const UNKNOWN_BROKER: i64 = -32001;

/// `id` MAY be a string, number or null. We support all forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

impl Id {
    /// Stable key used to match a response with its in-flight request.
    pub fn key(&self) -> String {
        match self {
            Id::Number(n) => format!("n:{n}"),
            Id::String(s) => format!("s:{s}"),
            Id::Null => "null".to_string(),
        }
    }
}

/// JSON‑RPC 2.0 Request object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Omitted for *notifications*.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

/// JSON‑RPC 2.0 Error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON‑RPC 2.0 Response object.
/// Exactly one of `result` or `error` **must** be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    pub id: Id,
}

/// Convenience enum so callers can `serde_json::from_str::<Message>()` without inspecting the type first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Request {
    /// Create a *notification* (no response expected).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// Create a *call* expecting a response.
    pub fn call(id: Id, method: impl AsRef<str>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.as_ref().to_owned(),
            params,
            id: Some(id),
        }
    }
}

impl Response {
    /// Convenience helper for a successful result.
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Convenience helper for an error result.
    pub fn fail(id: Id, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(Error {
                code,
                message: message.into(),
                data,
            }),
            id,
        }
    }
}

/// Lifecycle methods the host invokes on a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "camelCase")]
pub enum Method {
    GetManifest,
    Configure,
    Execute,
    Shutdown,
}

/// Callback methods a plugin invokes on the host through its broker stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "camelCase")]
pub enum HostMethod {
    ListAreas,
    GetArea,
    CreateArea,
    FindOrCreateArea,
    ListProjects,
    ListAllProjects,
    GetProject,
    CreateProject,
    FindOrCreateProject,
    ListTasks,
    CreateTask,
    BuildProjectContext,
    CategorizeWithContext,
    ExtractTasks,
    GetState,
    SetState,
    DeleteState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_uses_camel_case_method_names() {
        let req = Request::call(Id::Number(1), Method::GetManifest, None);
        let s = serde_json::to_string(&req).unwrap();
        assert!(s.contains("\"method\":\"getManifest\""));
        assert!(!s.contains("params"));
    }

    #[test]
    fn message_distinguishes_requests_from_responses() {
        let line = r#"{"jsonrpc":"2.0","method":"findOrCreateArea","params":{"broker":1},"id":"a"}"#;
        assert!(matches!(serde_json::from_str::<Message>(line).unwrap(), Message::Request(_)));

        let line = r#"{"jsonrpc":"2.0","result":{"ok":true},"id":"a"}"#;
        match serde_json::from_str::<Message>(line).unwrap() {
            Message::Response(rsp) => assert_eq!(rsp.result.unwrap()["ok"], json!(true)),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn error_response_keeps_code() {
        let rsp = Response::fail(Id::String("x".into()), METHOD_NOT_FOUND, "Method not found", None);
        let s = serde_json::to_string(&rsp).unwrap();
        let de: Response = serde_json::from_str(&s).unwrap();
        assert_eq!(de.error.unwrap().code, METHOD_NOT_FOUND);
        assert!(de.result.is_none());
    }

    #[test]
    fn method_names_parse() {
        assert_eq!("execute".parse::<Method>().unwrap(), Method::Execute);
        assert_eq!("extractTasks".parse::<HostMethod>().unwrap(), HostMethod::ExtractTasks);
        assert_eq!(HostMethod::ListAllProjects.as_ref(), "listAllProjects");
        assert!("messageIn".parse::<Method>().is_err());
    }

    #[test]
    fn id_keys_do_not_collide() {
        assert_ne!(Id::Number(1).key(), Id::String("1".into()).key());
    }
}
