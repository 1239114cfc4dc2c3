//! Stdio transport (subprocess)
//!
//! Line-delimited JSON-RPC over a child process's standard streams. One
//! reader task owns stdout; responses are routed to pending request slots by
//! id. A malformed frame poisons the transport: every pending slot fails
//! with `protocol_violation` and the connection must be reopened, which
//! resynchronizes request ids.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Transport;
use crate::config::expand_env_vars;
use crate::protocol::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::{Error, Result};

type PendingSlot = oneshot::Sender<Result<JsonRpcResponse>>;

/// Stdio transport for a subprocess provider
pub struct StdioTransport {
    /// Provider name, for error attribution
    provider: String,
    /// Child process handle
    child: Mutex<Option<Child>>,
    /// Pending requests awaiting a response, keyed by id
    pending: DashMap<String, PendingSlot>,
    /// Monotone request id counter
    request_id: AtomicI64,
    /// Connected flag, cleared on EOF or protocol violation
    connected: AtomicBool,
    /// Writer handle for the child's stdin
    writer: Mutex<Option<tokio::process::ChildStdin>>,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

impl StdioTransport {
    /// Spawn the provider process and wire up its streams.
    ///
    /// Environment values go through `${VAR}` expansion before reaching the
    /// child. Secrets stay in the child environment only; they are never
    /// logged or echoed into errors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SpawnFailed`] if the command cannot be launched.
    pub fn spawn(
        provider: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Arc<Self>> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in env {
            cmd.env(key, expand_env_vars(value));
        }

        let mut child = cmd.spawn().map_err(|e| Error::SpawnFailed {
            provider: provider.to_string(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| Error::SpawnFailed {
            provider: provider.to_string(),
            reason: "failed to open stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::SpawnFailed {
            provider: provider.to_string(),
            reason: "failed to open stdout".to_string(),
        })?;
        let stderr = child.stderr.take();

        let transport = Arc::new(Self {
            provider: provider.to_string(),
            child: Mutex::new(Some(child)),
            pending: DashMap::new(),
            request_id: AtomicI64::new(1),
            connected: AtomicBool::new(true),
            writer: Mutex::new(Some(stdin)),
        });

        // Reader task: owns stdout for the life of the connection
        let reader_transport = Arc::clone(&transport);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if let Err(e) = reader_transport.handle_line(&line) {
                            warn!(
                                provider = %reader_transport.provider,
                                error = %e,
                                "Malformed frame from provider, poisoning transport"
                            );
                            reader_transport.poison(&e.to_string());
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(provider = %reader_transport.provider, "Provider stdout EOF");
                        break;
                    }
                    Err(e) => {
                        warn!(provider = %reader_transport.provider, error = %e, "Read error");
                        break;
                    }
                }
            }
            reader_transport.connected.store(false, Ordering::Relaxed);
            reader_transport.fail_all_pending();
        });

        // Stderr drain: keeps the child from blocking on a full pipe and
        // surfaces its diagnostics at debug level.
        if let Some(stderr) = stderr {
            let name = provider.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(provider = %name, "stderr: {line}");
                }
            });
        }

        Ok(transport)
    }

    /// Route one stdout line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolViolation`] when the line is not a JSON-RPC
    /// message.
    fn handle_line(&self, line: &str) -> Result<()> {
        let message: JsonRpcMessage =
            serde_json::from_str(line).map_err(|e| Error::ProtocolViolation {
                provider: self.provider.clone(),
                detail: format!("unparseable frame: {e}"),
            })?;

        match message {
            JsonRpcMessage::Response(response) => {
                if let Some(ref id) = response.id {
                    let key = id.to_string();
                    if let Some((_, slot)) = self.pending.remove(&key) {
                        let _ = slot.send(Ok(response));
                    } else {
                        // Late response after timeout or cancellation
                        debug!(provider = %self.provider, id = %key, "Dropping late response");
                    }
                }
                Ok(())
            }
            JsonRpcMessage::Notification(note) => {
                debug!(provider = %self.provider, method = %note.method, "Provider notification");
                Ok(())
            }
            JsonRpcMessage::Request(req) => {
                // Providers may issue server-to-client requests (sampling,
                // roots). This gateway does not service them.
                debug!(provider = %self.provider, method = %req.method, "Ignoring provider-initiated request");
                Ok(())
            }
        }
    }

    /// Fail every pending slot with a protocol violation and disconnect
    fn poison(&self, detail: &str) {
        self.connected.store(false, Ordering::Relaxed);
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, slot)) = self.pending.remove(&key) {
                let _ = slot.send(Err(Error::ProtocolViolation {
                    provider: self.provider.clone(),
                    detail: detail.to_string(),
                }));
            }
        }
    }

    /// Fail every pending slot after EOF
    fn fail_all_pending(&self) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, slot)) = self.pending.remove(&key) {
                let _ = slot.send(Err(Error::ProviderUnavailable(self.provider.clone())));
            }
        }
    }

    /// Write one line to the child's stdin
    async fn write_message(&self, message: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(stdin) = writer.as_mut() else {
            return Err(Error::ProviderUnavailable(self.provider.clone()));
        };
        stdin.write_all(message.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse> {
        if !self.is_connected() {
            return Err(Error::ProviderUnavailable(self.provider.clone()));
        }

        let id = self.next_id();
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: id.clone(),
            method: method.to_string(),
            params,
        };

        let (tx, rx) = oneshot::channel();
        let key = id.to_string();
        self.pending.insert(key.clone(), tx);

        let message = serde_json::to_string(&request)?;
        if let Err(e) = self.write_message(&message).await {
            self.pending.remove(&key);
            return Err(e);
        }

        tokio::select! {
            outcome = rx => match outcome {
                Ok(result) => result,
                Err(_) => Err(Error::ProviderUnavailable(self.provider.clone())),
            },
            () = tokio::time::sleep(timeout) => {
                self.pending.remove(&key);
                Err(Error::CallTimeout(self.provider.clone()))
            }
            () = cancel.cancelled() => {
                self.pending.remove(&key);
                Err(Error::Cancelled)
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_message(&serde_json::to_string(&notification)?)
            .await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        *self.writer.lock().await = None;
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        self.fail_all_pending();
    }
}
