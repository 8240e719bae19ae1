use anyhow::{anyhow, bail, Result};
use gateway_core::exposure::member_paths;
use gateway_core::{CallerContext, CallerId, ErrorView, ExposedApi};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::host::GatewayHost;

pub const PROTOCOL_VERSION: u32 = 1;

/// Grace period for outcomes still in flight when a caller disconnects.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
    pub caller_id: CallerId,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: u64,
    pub member: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OutcomeStatus {
    Ok { value: Value },
    Err { kind: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub id: u64,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

impl Outcome {
    pub fn ok(id: u64, value: Value) -> Self {
        Self {
            id,
            status: OutcomeStatus::Ok { value },
        }
    }

    pub fn failed(id: u64, view: ErrorView) -> Self {
        Self {
            id,
            status: OutcomeStatus::Err {
                kind: view.kind.to_string(),
                message: view.message,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WireEnvelope {
    Hello(Hello),
    Welcome(Welcome),
    Call(Call),
    Outcome(Outcome),
    Error { message: String },
}

impl WireEnvelope {
    pub fn error(message: impl Into<String>) -> Self {
        WireEnvelope::Error {
            message: message.into(),
        }
    }
}

pub struct IpcServer {
    host: Arc<GatewayHost>,
    socket_path: PathBuf,
}

impl IpcServer {
    pub fn new(host: Arc<GatewayHost>, socket_path: PathBuf) -> Self {
        Self { host, socket_path }
    }

    #[cfg(unix)]
    pub async fn start(self: Arc<Self>) -> Result<()> {
        use tokio::net::UnixListener;
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(socket = %self.socket_path.display(), "ipc listening");
        loop {
            let (stream, _addr) = listener.accept().await?;
            let host = self.host.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(host, stream).await {
                    warn!("ipc connection error: {e}");
                }
            });
        }
    }

    #[cfg(windows)]
    pub async fn start(self: Arc<Self>) -> Result<()> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let mut server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&self.socket_path)?;
        info!(pipe = %self.socket_path.display(), "ipc listening");
        loop {
            server.connect().await?;
            let connected = server;
            server = ServerOptions::new().create(&self.socket_path)?;
            let host = self.host.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(host, connected).await {
                    warn!("ipc connection error: {e}");
                }
            });
        }
    }
}

/// Signals teardown for the connection's caller however the connection ends.
struct TeardownOnExit {
    host: Arc<GatewayHost>,
    caller: CallerId,
}

impl Drop for TeardownOnExit {
    fn drop(&mut self) {
        self.host.signals().signal(self.caller);
    }
}

/// Runs one caller connection: hello, one gateway session, calls until EOF.
pub async fn serve_connection<S>(host: Arc<GatewayHost>, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_envelopes(write_half, rx));

    let result = run_session(host, &mut reader, &tx).await;

    drop(tx);
    match tokio::time::timeout(DRAIN_TIMEOUT, writer).await {
        Ok(Ok(Err(e))) => debug!("ipc writer stopped: {e}"),
        Ok(Err(e)) => warn!("ipc writer task failed: {e}"),
        Err(_) => warn!("outcomes still pending after disconnect; dropping them"),
        Ok(Ok(Ok(()))) => {}
    }
    result
}

async fn run_session<R>(
    host: Arc<GatewayHost>,
    reader: &mut R,
    tx: &mpsc::UnboundedSender<WireEnvelope>,
) -> Result<()>
where
    R: AsyncBufReadExt + Unpin,
{
    let hello = match read_envelope(reader).await? {
        Some(WireEnvelope::Hello(hello)) => hello,
        Some(_) => {
            let _ = tx.send(WireEnvelope::error("expected Hello"));
            bail!("expected Hello");
        }
        None => bail!("connection closed before hello"),
    };
    if hello.protocol_version != PROTOCOL_VERSION {
        let _ = tx.send(WireEnvelope::error("protocol version mismatch"));
        bail!("protocol version mismatch");
    }

    let caller = host.next_caller();
    let mut context = CallerContext::new(caller);
    if let Some(origin) = hello.origin {
        context = context.with_origin(origin);
    }
    let gateway = host.open_session(context)?;
    let _teardown = TeardownOnExit {
        host: host.clone(),
        caller,
    };
    let api = gateway
        .exposed()
        .ok_or_else(|| anyhow!("session closed during start-up"))?;

    let _ = tx.send(WireEnvelope::Welcome(Welcome {
        caller_id: caller,
        members: member_paths().into_iter().map(String::from).collect(),
    }));
    info!(%caller, "caller connected");

    loop {
        match read_envelope(reader).await {
            Ok(None) => break,
            Ok(Some(WireEnvelope::Call(call))) => dispatch_call(&api, call, tx),
            Ok(Some(_)) => {
                let _ = tx.send(WireEnvelope::error("expected Call"));
            }
            Err(e) if e.is::<serde_json::Error>() => {
                debug!(%caller, "malformed envelope: {e}");
                let _ = tx.send(WireEnvelope::error(format!("malformed envelope: {e}")));
            }
            Err(e) => return Err(e),
        }
    }
    info!(%caller, "caller disconnected");
    Ok(())
}

fn dispatch_call(api: &ExposedApi, call: Call, tx: &mpsc::UnboundedSender<WireEnvelope>) {
    let id = call.id;
    let handle = match api.invoke(&call.member, &call.args) {
        Ok(handle) => handle,
        Err(err) => {
            let _ = tx.send(WireEnvelope::Outcome(Outcome::failed(id, err.view())));
            return;
        }
    };
    let (ok_tx, err_tx) = (tx.clone(), tx.clone());
    handle
        .on_success(move |value| {
            let _ = ok_tx.send(WireEnvelope::Outcome(Outcome::ok(id, value.clone())));
        })
        .on_failure(move |err| {
            let _ = err_tx.send(WireEnvelope::Outcome(Outcome::failed(id, err.view())));
        });
}

/// `None` on EOF. Blank lines are skipped.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<WireEnvelope>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            break;
        }
    }
    Ok(Some(serde_json::from_str(line.trim_end())?))
}

pub async fn write_envelope<W>(writer: &mut W, envelope: &WireEnvelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(envelope)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn write_envelopes<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<WireEnvelope>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = rx.recv().await {
        write_envelope(&mut writer, &envelope).await?;
    }
    Ok(())
}
