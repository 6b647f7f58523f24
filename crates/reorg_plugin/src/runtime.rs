//! Plugin-side runtime: wires stdin/stdout JSON-RPC traffic to a [`Plugin`].
//!
//! A plugin binary's `main` is typically just:
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     reorg_plugin::runtime::serve(MyPlugin::default()).await
//! }
//! ```
//!
//! Every incoming request is handled on its own task so that an `execute` in
//! progress never blocks the responses to its own host callbacks. A handler
//! that panics still answers, with an operation-failed error.

use std::path::Path;
use std::sync::{Arc, Once};

use serde_json::Value;
use tokio::io::{self, AsyncBufRead, AsyncWrite, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use tracing_appender::rolling::daily;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::error::PluginResult;
use crate::handshake::{Handshake, MAGIC_COOKIE_KEY, PROTOCOL_VERSION_KEY, check_environment};
use crate::host_rpc::RemoteHost;
use crate::jsonrpc::{Method, OPERATION_FAILED, Request, Response};
use crate::message::{ConfigureParams, ExecuteParams};
use crate::plugin::Plugin;
use crate::rpc::{Connection, DispatchError, params, to_result};

/// Runs `plugin` on the process's stdin/stdout until the host closes stdin.
///
/// Exits with status 1 when the process was not started by a reorg host.
pub async fn serve<P: Plugin>(plugin: P) -> anyhow::Result<()> {
    if let Err(err) = check_environment(
        std::env::var(MAGIC_COOKIE_KEY).ok(),
        std::env::var(PROTOCOL_VERSION_KEY).ok(),
    ) {
        eprintln!("{err}");
        std::process::exit(1);
    }
    serve_io(plugin, BufReader::new(io::stdin()), io::stdout()).await?;
    Ok(())
}

/// Announces the handshake on `writer` and serves requests read from `reader`.
pub async fn serve_io<P, R, W>(plugin: P, reader: R, writer: W) -> PluginResult<()>
where
    P: Plugin,
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (conn, mut incoming) = Connection::start("host", reader, writer);
    conn.send_line(Handshake::current().line())?;

    let plugin = Arc::new(Mutex::new(plugin));
    while let Some(req) = incoming.recv().await {
        let plugin = Arc::clone(&plugin);
        let conn = conn.clone();
        tokio::spawn(async move {
            let id = req.id.clone();
            let method = req.method.clone();
            let handler = {
                let conn = conn.clone();
                tokio::spawn(async move { handle_request(&plugin, &conn, req).await })
            };
            let rsp = match (handler.await, id) {
                (Ok(rsp), _) => rsp,
                (Err(e), Some(id)) => {
                    error!(method = %method, error = %e, "request handler panicked");
                    Some(Response::fail(id, OPERATION_FAILED, format!("plugin panicked: {e}"), None))
                }
                (Err(e), None) => {
                    error!(method = %method, error = %e, "request handler panicked");
                    None
                }
            };
            if let Some(rsp) = rsp {
                if let Err(e) = conn.respond(rsp) {
                    debug!(error = %e, "response not delivered");
                }
            }
        });
    }
    debug!("host closed the connection");
    Ok(())
}

async fn handle_request<P: Plugin>(plugin: &Mutex<P>, conn: &Connection, req: Request) -> Option<Response> {
    // nothing is sent as a notification in this protocol
    let id = req.id.clone()?;
    let result = match req.method.parse::<Method>() {
        Ok(method) => call_plugin(plugin, conn, method, req.params).await,
        Err(_) => {
            warn!(method = %req.method, "host asked for an unknown method");
            Err(DispatchError::MethodNotFound(req.method))
        }
    };
    Some(match result {
        Ok(value) => Response::success(id, value),
        Err(err) => err.into_response(id),
    })
}

async fn call_plugin<P: Plugin>(
    plugin: &Mutex<P>,
    conn: &Connection,
    method: Method,
    raw: Option<Value>,
) -> Result<Value, DispatchError> {
    match method {
        Method::GetManifest => to_result(plugin.lock().await.get_manifest().await?),
        Method::Configure => {
            let p: ConfigureParams = params(raw)?;
            init_logging(&p);
            let host = Arc::new(RemoteHost::new(conn.clone(), p.broker_id));
            plugin.lock().await.configure(host, p.config, p.state_dir).await?;
            info!("plugin configured");
            Ok(Value::Null)
        }
        Method::Execute => {
            let p: ExecuteParams = params(raw)?;
            to_result(plugin.lock().await.execute(p).await?)
        }
        Method::Shutdown => {
            plugin.lock().await.shutdown().await?;
            Ok(Value::Null)
        }
    }
}

/// Installs a daily-rotated file subscriber the first time a plugin is
/// configured with a log directory. Stdout carries the protocol and is never
/// logged to.
fn init_logging(params: &ConfigureParams) {
    static LOG_INIT: Once = Once::new();
    let Some(dir) = params.log_dir.clone() else {
        return;
    };
    let level = params.log_level.clone();
    LOG_INIT.call_once(move || {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            eprintln!("cannot create plugin log dir {}: {e}", dir.display());
            return;
        }
        let file_name = format!("{}.log", log_file_stem());
        let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = Registry::default().with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(daily(&dir, file_name))
                .with_filter(filter),
        );
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            eprintln!("a tracing subscriber is already installed, plugin logs stay there");
        }
    });
}

fn log_file_stem() -> String {
    std::env::current_exe()
        .ok()
        .as_deref()
        .and_then(Path::file_stem)
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "plugin".to_string())
}
