use thiserror::Error;

use crate::jsonrpc;

pub type PluginResult<T> = Result<T, PluginError>;

/// Errors crossing the plugin boundary, on either side of the connection.
#[derive(Error, Debug)]
pub enum PluginError {
    /// Something went wrong sending or receiving JSON.
    #[error("JSON error: {0}")]
    Json(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection to the peer is gone or unusable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Cookie or protocol version did not match.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A timeout occurred.
    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    /// The peer answered with a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The plugin or host returned an unspecified failure.
    #[error("{0}")]
    Other(String),
}

impl PluginError {
    pub fn other(msg: impl Into<String>) -> Self {
        PluginError::Other(msg.into())
    }

    /// True when the failure means the connection itself can no longer be used.
    pub fn is_transport(&self) -> bool {
        matches!(self, PluginError::Transport(_) | PluginError::Io(_))
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> PluginError {
        PluginError::Json(err.to_string())
    }
}

impl From<anyhow::Error> for PluginError {
    fn from(err: anyhow::Error) -> PluginError {
        PluginError::Other(format!("{err:#}"))
    }
}

impl From<jsonrpc::Error> for PluginError {
    fn from(err: jsonrpc::Error) -> PluginError {
        PluginError::Rpc { code: err.code, message: err.message }
    }
}
