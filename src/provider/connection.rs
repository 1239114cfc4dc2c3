//! One connection to one provider process

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde_json::{Value, json};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ConnectionState;
use crate::profile::ProviderSpec;
use crate::protocol::{
    Info, InitializeResult, PROTOCOL_VERSION, Prompt, PromptsListResult, Resource,
    ResourcesListResult, ServerCapabilities, Tool, ToolsCallResult, ToolsListResult,
};
use crate::transport::{StdioTransport, Transport};
use crate::{Error, Result};

/// Cached listings from the provider
#[derive(Debug, Clone, Default)]
pub struct Listings {
    /// Tools, raw provider-side names
    pub tools: Vec<Tool>,
    /// Resources
    pub resources: Vec<Resource>,
    /// Prompts
    pub prompts: Vec<Prompt>,
}

/// A managed connection to one provider.
///
/// At most one process exists per provider name: every spawn goes through
/// `spawn_lock`, and a live transport short-circuits the second caller.
pub struct ProviderConnection {
    /// Provider name (profile key, FQTN prefix)
    pub name: String,
    spec: ProviderSpec,
    state: RwLock<ConnectionState>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Serializes spawn attempts
    spawn_lock: Mutex<()>,
    /// One permit: calls serialize unless the provider opts into parallelism
    serial: Semaphore,
    /// Provider advertised concurrent-call support
    concurrent: AtomicBool,
    server_info: RwLock<Option<Info>>,
    capabilities: RwLock<Option<ServerCapabilities>>,
    listings: RwLock<Listings>,
    /// Seconds since epoch of last use
    last_used: AtomicU64,
    /// In-flight call count (eviction guard)
    in_flight: AtomicU64,
    spawn_timeout: Duration,
    call_timeout: Duration,
}

impl std::fmt::Debug for ProviderConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConnection")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ProviderConnection {
    /// Create an entry in `NEW`; no process is launched until needed
    #[must_use]
    pub fn new(name: &str, spec: ProviderSpec, spawn_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            spec,
            state: RwLock::new(ConnectionState::New),
            transport: RwLock::new(None),
            spawn_lock: Mutex::new(()),
            serial: Semaphore::new(1),
            concurrent: AtomicBool::new(false),
            server_info: RwLock::new(None),
            capabilities: RwLock::new(None),
            listings: RwLock::new(Listings::default()),
            last_used: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            spawn_timeout,
            call_timeout,
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Server info from the handshake, once READY
    #[must_use]
    pub fn server_info(&self) -> Option<Info> {
        self.server_info.read().clone()
    }

    /// Cached listings
    #[must_use]
    pub fn listings(&self) -> Listings {
        self.listings.read().clone()
    }

    /// Seconds since the connection was last used, or `None` if never
    #[must_use]
    pub fn idle_for(&self) -> Option<Duration> {
        let last = self.last_used.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        let now = epoch_secs();
        Some(Duration::from_secs(now.saturating_sub(last)))
    }

    /// Whether a call is currently in flight
    #[must_use]
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Relaxed) > 0
    }

    fn touch(&self) {
        self.last_used.store(epoch_secs(), Ordering::Relaxed);
    }

    /// Ensure the connection is READY, spawning and initializing on demand.
    ///
    /// # Errors
    ///
    /// Returns `spawn_failed` or `initialization_failed`; either moves the
    /// connection to `FAILED`.
    pub async fn ensure_ready(&self, cancel: &CancellationToken) -> Result<()> {
        self.touch();

        if self.is_live() {
            return Ok(());
        }

        let _guard = self.spawn_lock.lock().await;
        // A concurrent caller may have finished the spawn while we waited
        if self.is_live() {
            return Ok(());
        }

        self.start(cancel).await.inspect_err(|_| {
            *self.state.write() = ConnectionState::Failed;
            *self.transport.write() = None;
        })
    }

    fn is_live(&self) -> bool {
        let state = self.state();
        matches!(state, ConnectionState::Ready | ConnectionState::Calling)
            && self
                .transport
                .read()
                .as_ref()
                .is_some_and(|t| t.is_connected())
    }

    /// Spawn the process, run the handshake, and probe listings
    async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        info!(provider = %self.name, command = %self.spec.command, "Starting provider");
        *self.state.write() = ConnectionState::Spawning;

        let transport =
            StdioTransport::spawn(&self.name, &self.spec.command, &self.spec.args, &self.spec.env)?;

        *self.state.write() = ConnectionState::Initializing;

        let init_result = transport
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "ncp-gateway",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                })),
                self.spawn_timeout,
                cancel,
            )
            .await;

        let response = match init_result {
            Ok(response) => response,
            Err(Error::CallTimeout(_)) => {
                transport.close().await;
                return Err(Error::InitializationFailed(self.name.clone()));
            }
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };

        if response.error.is_some() {
            transport.close().await;
            return Err(Error::InitializationFailed(self.name.clone()));
        }

        let initialize: InitializeResult = response
            .result
            .ok_or_else(|| Error::InitializationFailed(self.name.clone()))
            .and_then(|v| {
                serde_json::from_value(v)
                    .map_err(|_| Error::InitializationFailed(self.name.clone()))
            })?;

        self.concurrent.store(
            initialize.capabilities.supports_concurrent_requests(),
            Ordering::Relaxed,
        );
        *self.server_info.write() = Some(initialize.server_info);
        *self.capabilities.write() = Some(initialize.capabilities);

        if let Err(e) = transport.notify("notifications/initialized", None).await {
            transport.close().await;
            return Err(e);
        }

        // Probe listings; a provider without resources or prompts answers
        // with an error we tolerate as empty.
        let tools = self
            .fetch_tools(transport.as_ref(), cancel)
            .await
            .unwrap_or_default();
        let resources = self
            .fetch_resources(transport.as_ref(), cancel)
            .await
            .unwrap_or_default();
        let prompts = self
            .fetch_prompts(transport.as_ref(), cancel)
            .await
            .unwrap_or_default();

        debug!(
            provider = %self.name,
            tools = tools.len(),
            resources = resources.len(),
            prompts = prompts.len(),
            "Provider listings cached"
        );

        *self.listings.write() = Listings {
            tools,
            resources,
            prompts,
        };
        *self.transport.write() = Some(transport);
        *self.state.write() = ConnectionState::Ready;
        self.touch();

        Ok(())
    }

    async fn fetch_tools(
        &self,
        transport: &dyn Transport,
        cancel: &CancellationToken,
    ) -> Result<Vec<Tool>> {
        let response = transport
            .request("tools/list", None, self.spawn_timeout, cancel)
            .await?;
        let result: ToolsListResult = match response.result {
            Some(value) => serde_json::from_value(value)?,
            None => return Ok(vec![]),
        };
        Ok(result.tools)
    }

    async fn fetch_resources(
        &self,
        transport: &dyn Transport,
        cancel: &CancellationToken,
    ) -> Result<Vec<Resource>> {
        let response = transport
            .request("resources/list", None, self.spawn_timeout, cancel)
            .await?;
        let result: ResourcesListResult = match response.result {
            Some(value) => serde_json::from_value(value)?,
            None => return Ok(vec![]),
        };
        Ok(result.resources)
    }

    async fn fetch_prompts(
        &self,
        transport: &dyn Transport,
        cancel: &CancellationToken,
    ) -> Result<Vec<Prompt>> {
        let response = transport
            .request("prompts/list", None, self.spawn_timeout, cancel)
            .await?;
        let result: PromptsListResult = match response.result {
            Some(value) => serde_json::from_value(value)?,
            None => return Ok(vec![]),
        };
        Ok(result.prompts)
    }

    /// Call a tool on this provider.
    ///
    /// Calls serialize behind a single permit unless the provider advertised
    /// concurrent-call support. `meta` is forwarded verbatim under `_meta`.
    /// Timeouts and framing violations close the connection so the next use
    /// reopens it with fresh request ids.
    ///
    /// # Errors
    ///
    /// `call_timeout`, `protocol_violation`, `cancelled`, or any spawn
    /// error from reopening a closed connection.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        meta: Option<Value>,
        timeout_override: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ToolsCallResult> {
        self.ensure_ready(cancel).await?;

        // Serialize unless the provider opted into parallel calls; the
        // permit also guards id-collision-free dispatch on the transport.
        let _permit = if self.concurrent.load(Ordering::Relaxed) {
            None
        } else {
            Some(
                self.serial
                    .acquire()
                    .await
                    .map_err(|_| Error::ProviderUnavailable(self.name.clone()))?,
            )
        };

        let transport = self
            .transport
            .read()
            .clone()
            .ok_or_else(|| Error::ProviderUnavailable(self.name.clone()))?;

        let mut params = json!({
            "name": tool,
            "arguments": arguments,
        });
        if let (Some(meta), Some(obj)) = (meta, params.as_object_mut()) {
            obj.insert("_meta".to_string(), meta);
        }

        *self.state.write() = ConnectionState::Calling;
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let timeout = timeout_override.unwrap_or(self.call_timeout);

        let outcome = transport
            .request("tools/call", Some(params), timeout, cancel)
            .await;
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.touch();

        match outcome {
            Ok(response) => {
                *self.state.write() = ConnectionState::Ready;
                if let Some(error) = response.error {
                    // Provider-reported tool failure, not a transport fault
                    return Ok(ToolsCallResult::failure(error.message));
                }
                let result: ToolsCallResult = match response.result {
                    Some(value) => serde_json::from_value(value)?,
                    None => ToolsCallResult::text(""),
                };
                Ok(result)
            }
            Err(e @ (Error::CallTimeout(_) | Error::ProtocolViolation { .. } | Error::Cancelled)) => {
                // Close to force id resynchronization on next use
                warn!(provider = %self.name, error = %e, "Closing connection after call failure");
                self.close().await;
                Err(e)
            }
            Err(e) => {
                *self.state.write() = ConnectionState::Ready;
                Err(e)
            }
        }
    }

    /// Forward a raw request to the provider (resource reads,
    /// subscriptions). Shares the serial queue with tool calls.
    ///
    /// # Errors
    ///
    /// Transport taxonomy plus spawn errors from reopening.
    pub async fn proxy(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<crate::protocol::JsonRpcResponse> {
        self.ensure_ready(cancel).await?;

        let _permit = if self.concurrent.load(Ordering::Relaxed) {
            None
        } else {
            Some(
                self.serial
                    .acquire()
                    .await
                    .map_err(|_| Error::ProviderUnavailable(self.name.clone()))?,
            )
        };

        let transport = self
            .transport
            .read()
            .clone()
            .ok_or_else(|| Error::ProviderUnavailable(self.name.clone()))?;

        self.touch();
        transport
            .request(method, params, self.call_timeout, cancel)
            .await
    }

    /// Probe listings for cache reconciliation, spawning if necessary.
    ///
    /// # Errors
    ///
    /// Propagates spawn/initialize failures.
    pub async fn probe(&self, cancel: &CancellationToken) -> Result<(Listings, Option<Info>)> {
        self.ensure_ready(cancel).await?;
        Ok((self.listings(), self.server_info()))
    }

    /// Close the connection and reap the process
    pub async fn close(&self) {
        let transport = self.transport.write().take();
        if let Some(t) = transport {
            t.close().await;
        }
        *self.state.write() = ConnectionState::Closed;
        debug!(provider = %self.name, "Connection closed");
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
