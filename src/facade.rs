//! Protocol façade
//!
//! JSON-RPC 2.0 over line-delimited JSON on stdio. Exactly two virtual
//! tools are exposed - `find` and `run` - plus the standard handshake,
//! listing, resource, and prompt methods. Metadata requests answer inline
//! from static data; everything else runs on spawned tasks so indexing and
//! slow providers never block the loop. All logging goes to stderr; stdout
//! carries only protocol frames.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::FindOptions;
use crate::error::rpc_codes;
use crate::fqtn::Fqtn;
use crate::orchestrator::Orchestrator;
use crate::protocol::{
    CancelledParams, Content, Info, InitializeResult, JsonRpcMessage, JsonRpcRequest,
    JsonRpcResponse, PromptsGetParams, PromptsListResult, Resource, ResourcesCapability,
    ResourcesListResult, ResourcesReadParams, ResourcesReadResult, ResourcesSubscribeParams,
    ResourcesUnsubscribeParams, ResourceContents, ServerCapabilities, Tool, ToolsCallParams,
    ToolsCallResult, ToolsCapability, ToolsListResult, negotiate_version,
};
use crate::{Error, Result};

/// URI scheme of resources the façade itself owns
const BUILTIN_SCHEME: &str = "ncp://";

/// The stdio JSON-RPC server
pub struct Facade {
    orchestrator: Arc<Orchestrator>,
    /// Cancellation handles for in-flight requests, keyed by request id
    in_flight: Arc<DashMap<String, CancellationToken>>,
    /// Subscribed `ncp://` URIs (façade-owned bookkeeping)
    subscriptions: Arc<DashMap<String, ()>>,
}

impl Facade {
    /// Create a façade over an initialized orchestrator
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            in_flight: Arc::new(DashMap::new()),
            subscriptions: Arc::new(DashMap::new()),
        }
    }

    /// Serve requests from stdin until EOF (client disconnect).
    ///
    /// On disconnect every in-flight call is cancelled and the orchestrator
    /// cleaned up, so no provider process outlives the session.
    ///
    /// # Errors
    ///
    /// Returns an error only when stdio itself fails.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<String>();

        // Single writer: response lines never interleave
        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(line) = write_rx.recv().await {
                if stdout.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdout.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
        });

        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();

        info!("Gateway serving on stdio");
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            self.handle_line(&line, &write_tx);
        }

        info!("Client disconnected, cancelling in-flight requests");
        for entry in self.in_flight.iter() {
            entry.value().cancel();
        }
        self.orchestrator.cleanup().await;
        drop(write_tx);
        let _ = writer.await;
        Ok(())
    }

    /// Parse one frame and dispatch it; responses go to the writer channel
    fn handle_line(self: &Arc<Self>, line: &str, write_tx: &mpsc::UnboundedSender<String>) {
        let message: JsonRpcMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Malformed request frame");
                let response = JsonRpcResponse::error(
                    None,
                    rpc_codes::INVALID_REQUEST,
                    "Invalid request",
                );
                send_response(write_tx, &response);
                return;
            }
        };

        match message {
            JsonRpcMessage::Request(request) => {
                let facade = Arc::clone(self);
                let write_tx = write_tx.clone();
                let cancel = CancellationToken::new();
                let key = request.id.to_string();
                facade.in_flight.insert(key.clone(), cancel.clone());

                tokio::spawn(async move {
                    let response = facade.dispatch(request, &cancel).await;
                    facade.in_flight.remove(&key);
                    send_response(&write_tx, &response);
                });
            }
            JsonRpcMessage::Notification(note) => match note.method.as_str() {
                "notifications/cancelled" => {
                    if let Some(params) = note.params
                        && let Ok(cancelled) = serde_json::from_value::<CancelledParams>(params)
                    {
                        let key = cancelled.request_id.to_string();
                        if let Some(entry) = self.in_flight.get(&key) {
                            debug!(request_id = %key, "Cancelling in-flight request");
                            entry.value().cancel();
                        }
                    }
                }
                "notifications/initialized" => debug!("Client initialized"),
                other => debug!(method = other, "Ignoring notification"),
            },
            JsonRpcMessage::Response(_) => {
                // This gateway issues no client-bound requests
                debug!("Ignoring unexpected response frame");
            }
        }
    }

    /// Dispatch one request to its handler
    async fn dispatch(&self, request: JsonRpcRequest, cancel: &CancellationToken) -> JsonRpcResponse {
        let id = request.id.clone();
        let outcome: Result<Value> = match request.method.as_str() {
            "initialize" => Ok(self.handle_initialize(request.params.as_ref())),
            "tools/list" => Ok(Self::handle_tools_list()),
            "tools/call" => self.handle_tools_call(request.params, cancel).await,
            "resources/list" => Ok(self.handle_resources_list().await),
            "resources/read" => self.handle_resources_read(request.params, cancel).await,
            "resources/subscribe" => self.handle_subscribe(request.params, cancel, true).await,
            "resources/unsubscribe" => self.handle_subscribe(request.params, cancel, false).await,
            "prompts/list" => Ok(self.handle_prompts_list().await),
            "prompts/get" => self.handle_prompts_get(request.params, cancel).await,
            "ping" => Ok(json!({})),
            other => Err(Error::MethodNotFound(other.to_string())),
        };

        match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) if e.is_protocol_error() => {
                JsonRpcResponse::error(Some(id), e.to_rpc_code(), e.to_string())
            }
            Err(e) => {
                // Everything else becomes structured failure content inside
                // a successful response; the session never breaks.
                let result = ToolsCallResult {
                    content: vec![Content::text(e.to_failure_content().to_string())],
                    is_error: true,
                };
                JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or(Value::Null))
            }
        }
    }

    /// `initialize`: inline, never waits on providers
    fn handle_initialize(&self, params: Option<&Value>) -> Value {
        let client_version = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(|v| v.as_str())
            .unwrap_or("2024-11-05");
        let negotiated = negotiate_version(client_version);
        debug!(client = client_version, negotiated, "Protocol version negotiated");

        let result = InitializeResult {
            protocol_version: negotiated.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: true }),
                resources: Some(ResourcesCapability {
                    subscribe: true,
                    list_changed: false,
                }),
                prompts: Some(crate::protocol::PromptsCapability::default()),
                experimental: None,
            },
            server_info: Info {
                name: "ncp-gateway".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("NCP Gateway".to_string()),
            },
            instructions: Some(
                "Use find to discover tools by describing what you want to do, \
                 then run to execute the chosen tool by its qualified name."
                    .to_string(),
            ),
        };
        serde_json::to_value(result).unwrap_or(Value::Null)
    }

    /// `tools/list`: always exactly the two virtual tools, inline
    fn handle_tools_list() -> Value {
        let tools = vec![
            Tool {
                name: "find".to_string(),
                title: Some("Find Tools".to_string()),
                description: Some(
                    "Discover tools across all configured providers by describing the task \
                     in natural language."
                        .to_string(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "description": {
                            "type": "string",
                            "description": "What you want to do"
                        },
                        "limit": {
                            "type": "integer",
                            "minimum": 1,
                            "description": "Maximum results per page (default 5)"
                        },
                        "page": {
                            "type": "integer",
                            "minimum": 1,
                            "description": "1-based result page"
                        },
                        "detailed": {
                            "type": "boolean",
                            "description": "Include input schemas"
                        },
                        "confidence_threshold": {
                            "type": "number",
                            "minimum": 0,
                            "maximum": 1,
                            "description": "Override the minimum match confidence"
                        }
                    },
                    "required": ["description"]
                }),
            },
            Tool {
                name: "run".to_string(),
                title: Some("Run Tool".to_string()),
                description: Some(
                    "Execute a tool by its qualified provider:tool name.".to_string(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "tool": {
                            "type": "string",
                            "description": "Qualified tool name, provider:tool"
                        },
                        "parameters": {
                            "type": "object",
                            "description": "Arguments for the tool",
                            "default": {}
                        },
                        "timeout_ms": {
                            "type": "integer",
                            "minimum": 1,
                            "description": "Per-call timeout override in milliseconds"
                        }
                    },
                    "required": ["tool"]
                }),
            },
        ];

        let result = ToolsListResult {
            tools,
            next_cursor: None,
        };
        serde_json::to_value(result).unwrap_or(Value::Null)
    }

    /// `tools/call`: route to the virtual tool handlers
    async fn handle_tools_call(
        &self,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let params: ToolsCallParams = match params {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| Error::InvalidRequest(format!("bad tools/call params: {e}")))?,
            None => return Err(Error::InvalidRequest("missing tools/call params".to_string())),
        };

        let result = match params.name.as_str() {
            "find" => self.call_find(&params.arguments).await?,
            "run" => self.call_run(&params.arguments, params.meta, cancel).await?,
            other => {
                return Err(Error::MethodNotFound(format!("unknown tool: {other}")));
            }
        };
        Ok(serde_json::to_value(result)?)
    }

    /// The `find` virtual tool
    async fn call_find(&self, arguments: &Value) -> Result<ToolsCallResult> {
        let description = arguments
            .get("description")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidRequest("find requires 'description'".to_string()))?;

        let mut options = FindOptions::default();
        if let Some(limit) = arguments.get("limit").and_then(Value::as_u64) {
            options.limit = usize::try_from(limit.max(1)).unwrap_or(usize::MAX);
        }
        if let Some(page) = arguments.get("page").and_then(Value::as_u64) {
            options.page = usize::try_from(page.max(1)).unwrap_or(1);
        }
        if let Some(detailed) = arguments.get("detailed").and_then(Value::as_bool) {
            options.detailed = detailed;
        }
        if let Some(threshold) = arguments.get("confidence_threshold").and_then(Value::as_f64) {
            options.confidence_threshold = Some(threshold.clamp(0.0, 1.0));
        }

        let ranked = self.orchestrator.find(description, &options).await;
        let body = json!({
            "query": description,
            "page": options.page,
            "results": ranked,
        });
        Ok(ToolsCallResult::text(
            serde_json::to_string_pretty(&body).unwrap_or_default(),
        ))
    }

    /// The `run` virtual tool
    async fn call_run(
        &self,
        arguments: &Value,
        meta: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<ToolsCallResult> {
        let tool = arguments
            .get("tool")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidRequest("run requires 'tool'".to_string()))?;
        let parameters = arguments.get("parameters").cloned().unwrap_or(json!({}));
        if !parameters.is_object() {
            return Err(Error::InvalidRequest(
                "run 'parameters' must be an object".to_string(),
            ));
        }
        let timeout_override = arguments
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis);

        self.orchestrator
            .run(tool, parameters, meta, timeout_override, cancel)
            .await
    }

    /// `resources/list`: built-in status resource plus aggregated providers
    async fn handle_resources_list(&self) -> Value {
        let mut resources = vec![Resource {
            uri: "ncp://status".to_string(),
            name: "Gateway status".to_string(),
            description: Some("Indexing state and cache statistics".to_string()),
            mime_type: Some("application/json".to_string()),
        }];
        resources.extend(self.orchestrator.resources().await);
        serde_json::to_value(ResourcesListResult {
            resources,
            next_cursor: None,
        })
        .unwrap_or(Value::Null)
    }

    /// `resources/read`: built-ins served locally, the rest proxied
    async fn handle_resources_read(
        &self,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let params: ResourcesReadParams = parse_params(params)?;

        if params.uri.starts_with(BUILTIN_SCHEME) {
            let status = json!({
                "profile": self.orchestrator.profile_name(),
                "indexing": self.orchestrator.is_reconciling(),
            });
            let result = ResourcesReadResult {
                contents: vec![ResourceContents::Text {
                    uri: params.uri,
                    mime_type: Some("application/json".to_string()),
                    text: status.to_string(),
                }],
            };
            return Ok(serde_json::to_value(result)?);
        }

        let owner = self
            .orchestrator
            .resource_owner(&params.uri)
            .await
            .ok_or_else(|| Error::InvalidRequest(format!("unknown resource: {}", params.uri)))?;
        self.orchestrator
            .proxy_request(
                &owner,
                "resources/read",
                Some(json!({"uri": params.uri})),
                cancel,
            )
            .await
    }

    /// `resources/subscribe` and `resources/unsubscribe`
    async fn handle_subscribe(
        &self,
        params: Option<Value>,
        cancel: &CancellationToken,
        subscribe: bool,
    ) -> Result<Value> {
        let uri = if subscribe {
            parse_params::<ResourcesSubscribeParams>(params)?.uri
        } else {
            parse_params::<ResourcesUnsubscribeParams>(params)?.uri
        };

        if uri.starts_with(BUILTIN_SCHEME) {
            if subscribe {
                self.subscriptions.insert(uri, ());
            } else {
                self.subscriptions.remove(&uri);
            }
            return Ok(json!({}));
        }

        let owner = self
            .orchestrator
            .resource_owner(&uri)
            .await
            .ok_or_else(|| Error::InvalidRequest(format!("unknown resource: {uri}")))?;
        let method = if subscribe {
            "resources/subscribe"
        } else {
            "resources/unsubscribe"
        };
        self.orchestrator
            .proxy_request(&owner, method, Some(json!({"uri": uri})), cancel)
            .await
    }

    /// `prompts/list`: aggregated, names qualified
    async fn handle_prompts_list(&self) -> Value {
        let prompts = self.orchestrator.prompts().await;
        serde_json::to_value(PromptsListResult {
            prompts,
            next_cursor: None,
        })
        .unwrap_or(Value::Null)
    }

    /// `prompts/get`: resolve the qualified name and proxy
    async fn handle_prompts_get(
        &self,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let params: PromptsGetParams = parse_params(params)?;
        let fqtn = Fqtn::parse(&params.name)?;
        self.orchestrator
            .proxy_request(
                &fqtn.provider,
                "prompts/get",
                Some(json!({
                    "name": fqtn.tool,
                    "arguments": params.arguments,
                })),
                cancel,
            )
            .await
    }

    /// Currently subscribed façade-owned URIs
    #[must_use]
    pub fn subscribed_uris(&self) -> Vec<String> {
        self.subscriptions.iter().map(|e| e.key().clone()).collect()
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T> {
    match params {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| Error::InvalidRequest(format!("bad params: {e}"))),
        None => Err(Error::InvalidRequest("missing params".to_string())),
    }
}

fn send_response(write_tx: &mpsc::UnboundedSender<String>, response: &JsonRpcResponse) {
    match serde_json::to_string(response) {
        Ok(line) => {
            let _ = write_tx.send(line);
        }
        Err(e) => warn!(error = %e, "Failed to serialize response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::protocol::RequestId;

    async fn facade() -> (tempfile::TempDir, Arc<Facade>) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            spawn_timeout_secs: 1,
            call_timeout_secs: 1,
            ..Settings::default()
        };
        let orchestrator = Orchestrator::initialize(dir.path(), settings, "default")
            .await
            .unwrap();
        (dir, Arc::new(Facade::new(orchestrator)))
    }

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: RequestId::Number(1),
            method: method.to_string(),
            params: Some(params),
        }
    }

    #[tokio::test]
    async fn initialize_echoes_supported_version() {
        let (_dir, facade) = facade().await;
        let cancel = CancellationToken::new();
        let response = facade
            .dispatch(
                request("initialize", json!({"protocolVersion": "2024-11-05"})),
                &cancel,
            )
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], "ncp-gateway");
        assert!(result["capabilities"]["resources"]["subscribe"].as_bool().unwrap());
    }

    #[tokio::test]
    async fn tools_list_is_exactly_the_two_virtual_tools() {
        let (_dir, facade) = facade().await;
        let cancel = CancellationToken::new();
        let response = facade
            .dispatch(request("tools/list", json!({})), &cancel)
            .await;
        let result = response.result.unwrap();
        let tools = result["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "find");
        assert_eq!(tools[1]["name"], "run");
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let (_dir, facade) = facade().await;
        let cancel = CancellationToken::new();
        let response = facade
            .dispatch(request("tools/frobnicate", json!({})), &cancel)
            .await;
        assert_eq!(response.error.unwrap().code, rpc_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn find_without_description_is_invalid_request() {
        let (_dir, facade) = facade().await;
        let cancel = CancellationToken::new();
        let response = facade
            .dispatch(
                request("tools/call", json!({"name": "find", "arguments": {}})),
                &cancel,
            )
            .await;
        assert_eq!(response.error.unwrap().code, rpc_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn find_on_cold_gateway_reports_indexing() {
        let (_dir, facade) = facade().await;
        let cancel = CancellationToken::new();
        let response = facade
            .dispatch(
                request(
                    "tools/call",
                    json!({"name": "find", "arguments": {"description": "read a file"}}),
                ),
                &cancel,
            )
            .await;
        let result = response.result.unwrap();
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("indexing") || text.contains("ncp:discovery"));
        assert_eq!(result["isError"], false);
    }

    #[tokio::test]
    async fn run_failure_is_structured_content_not_protocol_error() {
        let (_dir, facade) = facade().await;
        let cancel = CancellationToken::new();
        let response = facade
            .dispatch(
                request(
                    "tools/call",
                    json!({"name": "run", "arguments": {"tool": "ghost:tool", "parameters": {}}}),
                ),
                &cancel,
            )
            .await;
        assert!(response.error.is_none(), "session must not break");
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        let text = result["content"][0]["text"].as_str().unwrap();
        let failure: Value = serde_json::from_str(text).unwrap();
        assert_eq!(failure["error"]["kind"], "not_configured");
        assert_eq!(failure["error"]["provider"], "ghost");
    }

    #[tokio::test]
    async fn unknown_virtual_tool_is_method_not_found() {
        let (_dir, facade) = facade().await;
        let cancel = CancellationToken::new();
        let response = facade
            .dispatch(
                request("tools/call", json!({"name": "gateway_magic", "arguments": {}})),
                &cancel,
            )
            .await;
        assert_eq!(response.error.unwrap().code, rpc_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn builtin_status_resource_reads_inline() {
        let (_dir, facade) = facade().await;
        let cancel = CancellationToken::new();

        let response = facade
            .dispatch(request("resources/list", json!({})), &cancel)
            .await;
        let result = response.result.unwrap();
        let uris: Vec<&str> = result["resources"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["uri"].as_str().unwrap())
            .collect();
        assert!(uris.contains(&"ncp://status"));

        let response = facade
            .dispatch(
                request("resources/read", json!({"uri": "ncp://status"})),
                &cancel,
            )
            .await;
        let result = response.result.unwrap();
        let text = result["contents"][0]["text"].as_str().unwrap();
        let status: Value = serde_json::from_str(text).unwrap();
        assert_eq!(status["profile"], "default");
    }

    #[tokio::test]
    async fn builtin_subscription_bookkeeping() {
        let (_dir, facade) = facade().await;
        let cancel = CancellationToken::new();

        let response = facade
            .dispatch(
                request("resources/subscribe", json!({"uri": "ncp://status"})),
                &cancel,
            )
            .await;
        assert!(response.error.is_none());
        assert_eq!(facade.subscribed_uris(), vec!["ncp://status".to_string()]);

        facade
            .dispatch(
                request("resources/unsubscribe", json!({"uri": "ncp://status"})),
                &cancel,
            )
            .await;
        assert!(facade.subscribed_uris().is_empty());
    }

    #[tokio::test]
    async fn ping_answers_inline() {
        let (_dir, facade) = facade().await;
        let cancel = CancellationToken::new();
        let response = facade.dispatch(request("ping", json!({})), &cancel).await;
        assert!(response.error.is_none());
    }
}
