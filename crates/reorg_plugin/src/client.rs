//! Host-side handle on one running plugin.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{PluginError, PluginResult};
use crate::handshake::{
    Handshake, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PROTOCOL_VERSION, PROTOCOL_VERSION_KEY,
};
use crate::host_rpc::Broker;
use crate::jsonrpc::Method;
use crate::message::*;
use crate::plugin::{HostClient, Plugin};
use crate::rpc::Connection;
use crate::runtime::serve_io;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Limit for `getManifest`, `configure` and `shutdown`.
pub const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(30);

enum Backend {
    Process(Child),
    InProcess(JoinHandle<()>),
    Gone,
}

/// A connected plugin: lifecycle calls go out, host callbacks come back in
/// through the connection's [`Broker`].
pub struct PluginClient {
    name: String,
    conn: Connection,
    broker: Arc<Broker>,
    backend: Mutex<Backend>,
}

impl std::fmt::Debug for PluginClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginClient").field("name", &self.name).field("conn", &self.conn).finish()
    }
}

impl PluginClient {
    /// Starts `exe` as a child process and completes the handshake.
    pub async fn spawn(name: &str, exe: &Path) -> PluginResult<Self> {
        let mut child = TokioCommand::new(exe)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .env(PROTOCOL_VERSION_KEY, PROTOCOL_VERSION.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PluginError::Transport(format!("cannot start {}: {e}", exe.display())))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(PluginError::Transport(format!("{name}: stdio unavailable")));
        };

        let mut reader = BufReader::new(stdout);
        if let Err(e) = read_handshake(name, &mut reader).await {
            let _ = child.kill().await;
            return Err(e);
        }
        info!(plugin = name, pid = child.id(), "plugin process started");
        Ok(Self::attach(name, reader, stdin, Backend::Process(child)))
    }

    /// Runs `plugin` on a task of this runtime, connected through an in-memory
    /// pipe that carries the same bytes a child process would.
    pub async fn in_process<P: Plugin>(name: &str, plugin: P) -> PluginResult<Self> {
        let (host_side, plugin_side) = tokio::io::duplex(64 * 1024);
        let (plugin_read, plugin_write) = tokio::io::split(plugin_side);
        let label = name.to_string();
        let task = tokio::spawn(async move {
            if let Err(e) = serve_io(plugin, BufReader::new(plugin_read), plugin_write).await {
                warn!(plugin = %label, error = %e, "in-process plugin stopped");
            }
        });

        let (host_read, host_write) = tokio::io::split(host_side);
        let mut reader = BufReader::new(host_read);
        if let Err(e) = read_handshake(name, &mut reader).await {
            task.abort();
            return Err(e);
        }
        Ok(Self::attach(name, reader, host_write, Backend::InProcess(task)))
    }

    fn attach<R, W>(name: &str, reader: R, writer: W, backend: Backend) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let broker = Arc::new(Broker::default());
        let (conn, mut incoming) = Connection::start(name, reader, writer);

        // plugin → host callbacks
        {
            let conn = conn.clone();
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                while let Some(req) = incoming.recv().await {
                    let conn = conn.clone();
                    let broker = Arc::clone(&broker);
                    tokio::spawn(async move {
                        if let Some(rsp) = broker.dispatch(req).await {
                            if let Err(e) = conn.respond(rsp) {
                                debug!(plugin = conn.peer(), error = %e, "callback response not delivered");
                            }
                        }
                    });
                }
            });
        }

        Self { name: name.to_string(), conn, broker, backend: Mutex::new(backend) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once the plugin's output stream has ended or the client was killed.
    pub fn is_alive(&self) -> bool {
        !self.conn.is_closed()
    }

    pub async fn get_manifest(&self) -> PluginResult<Manifest> {
        self.conn.call_timeout(Method::GetManifest, None, LIFECYCLE_TIMEOUT).await
    }

    /// Registers `host` as the plugin's callback service and configures it.
    /// `params.broker_id` is assigned here.
    pub async fn configure(&self, host: Arc<dyn HostClient>, mut params: ConfigureParams) -> PluginResult<()> {
        let broker_id = self.broker.register(host);
        params.broker_id = broker_id;
        let res: PluginResult<serde_json::Value> = self
            .conn
            .call_timeout(Method::Configure, Some(serde_json::to_value(&params)?), LIFECYCLE_TIMEOUT)
            .await;
        if res.is_err() {
            self.broker.remove(broker_id);
        }
        res.map(|_| ())
    }

    /// No timeout here: callers decide how long an execution may take.
    pub async fn execute(&self, params: &ExecuteParams) -> PluginResult<ExecuteResult> {
        self.conn.call(Method::Execute, Some(serde_json::to_value(params)?)).await
    }

    pub async fn shutdown(&self) -> PluginResult<()> {
        self.conn.call_timeout(Method::Shutdown, None, LIFECYCLE_TIMEOUT).await
    }

    /// Terminates the plugin. Safe to call more than once.
    pub async fn kill(&self) {
        let backend = std::mem::replace(&mut *self.backend.lock().await, Backend::Gone);
        match backend {
            Backend::Process(mut child) => {
                if let Err(e) = child.kill().await {
                    debug!(plugin = %self.name, error = %e, "kill failed, process probably exited");
                }
            }
            Backend::InProcess(task) => task.abort(),
            Backend::Gone => {}
        }
        self.conn.close();
    }
}

async fn read_handshake<R: AsyncBufRead + Unpin>(name: &str, reader: &mut R) -> PluginResult<()> {
    let mut line = String::new();
    let read = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| {
            PluginError::Handshake(format!("{name}: no handshake within {}s", HANDSHAKE_TIMEOUT.as_secs()))
        })??;
    if read == 0 {
        return Err(PluginError::Handshake(format!("{name}: exited before the handshake")));
    }
    Handshake::parse(&line)?.verify()
}
