//! One bidirectional JSON-RPC connection over a line-delimited byte stream.
//!
//! Both the host (talking to a child's stdin/stdout) and the plugin (talking to
//! its own stdin/stdout) build on [`Connection`]: outgoing calls are tracked in
//! an in-flight table until the matching response arrives, incoming requests are
//! handed to the owner through a channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{PluginError, PluginResult};
use crate::jsonrpc::{
    Id, INVALID_PARAMS, METHOD_NOT_FOUND, Message, OPERATION_FAILED, PARSE_ERROR, Request, Response,
};

struct Inner {
    peer: String,
    tx: mpsc::UnboundedSender<String>,
    inflight: DashMap<String, oneshot::Sender<Response>>,
    closed: AtomicBool,
}

impl Inner {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(peer = %self.peer, "connection closed");
        }
        // dropping the senders fails every pending call
        self.inflight.clear();
    }
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("inflight", &self.inner.inflight.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Spawns the writer and reader tasks for a stream pair.
    ///
    /// Requests sent by the peer arrive on the returned receiver; the receiver
    /// closes once the peer's side of the stream reaches EOF.
    pub fn start<R, W>(
        peer: impl Into<String>,
        reader: R,
        writer: W,
    ) -> (Self, mpsc::UnboundedReceiver<Request>)
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let (req_tx, req_rx) = mpsc::unbounded_channel::<Request>();
        let inner = Arc::new(Inner {
            peer: peer.into(),
            tx,
            inflight: DashMap::new(),
            closed: AtomicBool::new(false),
        });

        // ── writer: queue → stream ─────────────────────────────────────
        {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let mut w = BufWriter::new(writer);
                while let Some(mut line) = rx.recv().await {
                    line.push('\n');
                    if let Err(e) = w.write_all(line.as_bytes()).await {
                        warn!(peer = %inner.peer, error = %e, "write failed");
                        break;
                    }
                    if w.flush().await.is_err() {
                        warn!(peer = %inner.peer, "flush failed");
                        break;
                    }
                }
                inner.close();
            });
        }

        // ── reader: stream → responses | requests ──────────────────────
        {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let mut lines = reader.lines();
                loop {
                    let line = match lines.next_line().await {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(peer = %inner.peer, error = %e, "read failed");
                            break;
                        }
                    };
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Message>(line) {
                        Ok(Message::Response(rsp)) => {
                            match inflight_take(&inner, &rsp.id) {
                                Some(tx_rsp) => {
                                    let _ = tx_rsp.send(rsp);
                                }
                                None => debug!(peer = %inner.peer, id = ?rsp.id, "response without caller"),
                            }
                        }
                        Ok(Message::Request(req)) => {
                            if req_tx.send(req).is_err() {
                                debug!(peer = %inner.peer, "request dropped, no consumer");
                            }
                        }
                        Err(e) => {
                            warn!(peer = %inner.peer, error = %e, "unparseable line");
                            let err = Response::fail(Id::Null, PARSE_ERROR, "Parse error", Some(json!(e.to_string())));
                            if let Ok(s) = serde_json::to_string(&err) {
                                let _ = inner.tx.send(s);
                            }
                        }
                    }
                }
                inner.close();
            });
        }

        (Self { inner }, req_rx)
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Marks the connection dead and fails all pending calls.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Queues a raw line (used for the handshake).
    pub fn send_line(&self, line: impl Into<String>) -> PluginResult<()> {
        self.inner
            .tx
            .send(line.into())
            .map_err(|_| PluginError::Transport(format!("connection to {} is closed", self.inner.peer)))
    }

    pub fn respond(&self, rsp: Response) -> PluginResult<()> {
        self.send_line(serde_json::to_string(&rsp)?)
    }

    pub async fn call<T: DeserializeOwned>(&self, method: impl AsRef<str>, params: Option<Value>) -> PluginResult<T> {
        let value = self.call_value(method.as_ref(), params, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn call_timeout<T: DeserializeOwned>(
        &self,
        method: impl AsRef<str>,
        params: Option<Value>,
        timeout: Duration,
    ) -> PluginResult<T> {
        let value = self.call_value(method.as_ref(), params, Some(timeout)).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn call_value(&self, method: &str, params: Option<Value>, timeout: Option<Duration>) -> PluginResult<Value> {
        if self.is_closed() {
            return Err(PluginError::Transport(format!("connection to {} is closed", self.inner.peer)));
        }
        let id = Id::String(Uuid::new_v4().to_string());
        let key = id.key();
        let (tx_rsp, rx_rsp) = oneshot::channel();
        self.inner.inflight.insert(key.clone(), tx_rsp);
        if self.is_closed() {
            self.inner.inflight.remove(&key);
            return Err(PluginError::Transport(format!("connection to {} is closed", self.inner.peer)));
        }

        let line = serde_json::to_string(&Request::call(id, method, params))?;
        if let Err(e) = self.send_line(line) {
            self.inner.inflight.remove(&key);
            return Err(e);
        }

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx_rsp).await {
                Ok(received) => received,
                Err(_) => {
                    self.inner.inflight.remove(&key);
                    return Err(PluginError::Timeout(limit.as_millis() as u64));
                }
            },
            None => rx_rsp.await,
        };
        let rsp = received.map_err(|_| {
            PluginError::Transport(format!("connection to {} closed during `{method}`", self.inner.peer))
        })?;

        match rsp.error {
            Some(err) => Err(err.into()),
            // a `null` result deserializes as `None`
            None => Ok(rsp.result.unwrap_or(Value::Null)),
        }
    }
}

fn inflight_take(inner: &Inner, id: &Id) -> Option<oneshot::Sender<Response>> {
    inner.inflight.remove(&id.key()).map(|(_, tx)| tx)
}

/// Why an incoming request could not be served.
#[derive(Debug)]
pub enum DispatchError {
    MethodNotFound(String),
    InvalidParams(String),
    Failed(PluginError),
}

impl DispatchError {
    pub fn into_response(self, id: Id) -> Response {
        match self {
            DispatchError::MethodNotFound(method) => {
                Response::fail(id, METHOD_NOT_FOUND, "Method not found", Some(json!(method)))
            }
            DispatchError::InvalidParams(msg) => Response::fail(id, INVALID_PARAMS, "Invalid params", Some(json!(msg))),
            DispatchError::Failed(PluginError::Rpc { code, message }) => Response::fail(id, code, message, None),
            DispatchError::Failed(err) => Response::fail(id, OPERATION_FAILED, err.to_string(), None),
        }
    }
}

impl From<PluginError> for DispatchError {
    fn from(err: PluginError) -> Self {
        DispatchError::Failed(err)
    }
}

/// Decodes request params, treating absent params as JSON `null`.
pub fn params<T: DeserializeOwned>(value: Option<Value>) -> Result<T, DispatchError> {
    serde_json::from_value(value.unwrap_or(Value::Null)).map_err(|e| DispatchError::InvalidParams(e.to_string()))
}

pub fn to_result<T: serde::Serialize>(value: T) -> Result<Value, DispatchError> {
    serde_json::to_value(value).map_err(|e| DispatchError::Failed(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{BufReader, duplex, split};

    fn pair() -> ((Connection, mpsc::UnboundedReceiver<Request>), (Connection, mpsc::UnboundedReceiver<Request>)) {
        let (a, b) = duplex(4096);
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        (
            Connection::start("b", BufReader::new(ar), aw),
            Connection::start("a", BufReader::new(br), bw),
        )
    }

    #[tokio::test]
    async fn call_is_answered_by_peer() {
        let ((a, _a_in), (b, mut b_in)) = pair();
        tokio::spawn(async move {
            while let Some(req) = b_in.recv().await {
                let id = req.id.clone().unwrap();
                let echoed = req.params.clone().unwrap_or(Value::Null);
                b.respond(Response::success(id, json!({"method": req.method, "echo": echoed}))).unwrap();
            }
        });

        let v: Value = a.call("ping", Some(json!({"n": 1}))).await.unwrap();
        assert_eq!(v["method"], json!("ping"));
        assert_eq!(v["echo"]["n"], json!(1));
    }

    #[tokio::test]
    async fn error_responses_become_rpc_errors() {
        let ((a, _a_in), (b, mut b_in)) = pair();
        tokio::spawn(async move {
            while let Some(req) = b_in.recv().await {
                b.respond(Response::fail(req.id.unwrap(), OPERATION_FAILED, "boom", None)).unwrap();
            }
        });

        let err = a.call::<Value>("anything", None).await.unwrap_err();
        match err {
            PluginError::Rpc { code, message } => {
                assert_eq!(code, OPERATION_FAILED);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn null_result_is_unit() {
        let ((a, _a_in), (b, mut b_in)) = pair();
        tokio::spawn(async move {
            while let Some(req) = b_in.recv().await {
                b.respond(Response::success(req.id.unwrap(), Value::Null)).unwrap();
            }
        });
        let () = a.call("shutdown", None).await.unwrap();
    }

    #[tokio::test]
    async fn peer_going_away_fails_pending_calls() {
        let (near, far) = duplex(4096);
        let (r, w) = split(near);
        let (a, _a_in) = Connection::start("far", BufReader::new(r), w);
        let pending = tokio::spawn({
            let a = a.clone();
            async move { a.call::<Value>("never", None).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(far);

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_transport(), "{err:?}");
        assert!(a.is_closed());
        assert!(a.call::<Value>("again", None).await.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let ((a, _a_in), (_b, _b_in)) = pair();
        let err = a.call_timeout::<Value>("slow", None, Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, PluginError::Timeout(30)));
    }
}
