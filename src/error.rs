//! Error types for the NCP gateway

use std::io;

use serde_json::{Value, json};
use thiserror::Error;

/// Result type alias for the NCP gateway
pub type Result<T> = std::result::Result<T, Error>;

/// NCP gateway errors
///
/// Only [`Error::InvalidRequest`] and [`Error::MethodNotFound`] surface as
/// JSON-RPC protocol errors. Every other kind is rendered as structured
/// failure content inside a successful `tools/call` response so a provider
/// failure never breaks the client session.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed client input at the protocol layer
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown JSON-RPC method
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// FQTN references a provider absent from the profile
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    /// Provider is in FAILED state or health cooldown
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Child process could not be launched
    #[error("Failed to spawn provider {provider}: {reason}")]
    SpawnFailed {
        /// Provider name
        provider: String,
        /// Launch failure detail
        reason: String,
    },

    /// Protocol handshake did not complete within budget
    #[error("Provider {0} failed to initialize")]
    InitializationFailed(String),

    /// Provider did not respond within the per-call budget
    #[error("Call to {0} timed out")]
    CallTimeout(String),

    /// Provider emitted malformed framing
    #[error("Protocol violation from {provider}: {detail}")]
    ProtocolViolation {
        /// Provider name
        provider: String,
        /// What was malformed
        detail: String,
    },

    /// Client withdrew the request
    #[error("Request cancelled")]
    Cancelled,

    /// Cache corruption detected; the affected provider is re-probed
    #[error("Cache corrupt: {0}")]
    CacheCorrupt(String),

    /// Provider declined to start without missing credentials
    #[error("Provider {provider} requires configuration: {missing:?}")]
    ConfigRequired {
        /// Provider name
        provider: String,
        /// Names of the missing variables
        missing: Vec<String>,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable wire label for the error kind, used in structured failure content
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::MethodNotFound(_) => "method_not_found",
            Self::NotConfigured(_) => "not_configured",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::InitializationFailed(_) => "initialization_failed",
            Self::CallTimeout(_) => "call_timeout",
            Self::ProtocolViolation { .. } => "protocol_violation",
            Self::Cancelled => "cancelled",
            Self::CacheCorrupt(_) => "cache_corrupt",
            Self::ConfigRequired { .. } => "config_required",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether this error is reported as a JSON-RPC protocol error.
    ///
    /// Everything else is recovered below the façade and returned as failure
    /// content so the client can reason about it without the session breaking.
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_) | Self::MethodNotFound(_))
    }

    /// Convert to a JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::MethodNotFound(_) => rpc_codes::METHOD_NOT_FOUND,
            Self::InvalidRequest(_) => rpc_codes::INVALID_REQUEST,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }

    /// Render the error as structured failure content.
    ///
    /// The shape is stable: `{"error": {"kind": ..., "message": ...}}` with
    /// an optional `provider` field. `config_required` additionally carries
    /// the exact profile patch the user would apply by hand, so the flow is
    /// never a dead end when no interactive prompt is available. Messages
    /// never contain secrets; provider env values are not interpolated into
    /// error text anywhere in the crate.
    #[must_use]
    pub fn to_failure_content(&self) -> Value {
        let mut error = json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let Some(obj) = error.as_object_mut() {
            if let Some(provider) = self.provider() {
                obj.insert("provider".to_string(), json!(provider));
            }
            if let Self::ConfigRequired { provider, missing } = self {
                let env: serde_json::Map<String, Value> = missing
                    .iter()
                    .map(|name| (name.clone(), json!(format!("<{name}>"))))
                    .collect();
                obj.insert(
                    "patch".to_string(),
                    json!({ "mcpServers": { provider: { "env": env } } }),
                );
            }
        }
        json!({ "error": error })
    }

    /// Provider associated with this error, if any
    #[must_use]
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::NotConfigured(p)
            | Self::ProviderUnavailable(p)
            | Self::InitializationFailed(p)
            | Self::CallTimeout(p) => Some(p),
            Self::SpawnFailed { provider, .. }
            | Self::ProtocolViolation { provider, .. }
            | Self::ConfigRequired { provider, .. } => Some(provider),
            _ => None,
        }
    }
}

/// Standard JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(Error::NotConfigured("x".into()).kind(), "not_configured");
        assert_eq!(Error::CallTimeout("x".into()).kind(), "call_timeout");
        assert_eq!(Error::Cancelled.kind(), "cancelled");
        assert_eq!(
            Error::SpawnFailed {
                provider: "fs".into(),
                reason: "no such file".into()
            }
            .kind(),
            "spawn_failed"
        );
    }

    #[test]
    fn only_protocol_kinds_map_to_rpc_errors() {
        assert!(Error::InvalidRequest("bad".into()).is_protocol_error());
        assert!(Error::MethodNotFound("tools/frobnicate".into()).is_protocol_error());
        assert!(!Error::ProviderUnavailable("fs".into()).is_protocol_error());
        assert!(!Error::Cancelled.is_protocol_error());
    }

    #[test]
    fn rpc_codes_match_spec() {
        assert_eq!(
            Error::MethodNotFound("x".into()).to_rpc_code(),
            rpc_codes::METHOD_NOT_FOUND
        );
        assert_eq!(
            Error::InvalidRequest("x".into()).to_rpc_code(),
            rpc_codes::INVALID_REQUEST
        );
        assert_eq!(
            Error::ProviderUnavailable("x".into()).to_rpc_code(),
            rpc_codes::INTERNAL_ERROR
        );
    }

    #[test]
    fn failure_content_carries_provider() {
        let err = Error::CallTimeout("shell".into());
        let content = err.to_failure_content();
        assert_eq!(content["error"]["kind"], "call_timeout");
        assert_eq!(content["error"]["provider"], "shell");
        assert!(content["error"]["message"].is_string());
    }

    #[test]
    fn failure_content_without_provider() {
        let content = Error::Cancelled.to_failure_content();
        assert_eq!(content["error"]["kind"], "cancelled");
        assert!(content["error"].get("provider").is_none());
    }

    #[test]
    fn config_required_lists_missing_variables() {
        let err = Error::ConfigRequired {
            provider: "github".into(),
            missing: vec!["GITHUB_TOKEN".into()],
        };
        assert_eq!(err.kind(), "config_required");
        assert_eq!(err.provider(), Some("github"));
        assert!(err.to_string().contains("GITHUB_TOKEN"));
    }

    #[test]
    fn config_required_content_carries_manual_patch() {
        let err = Error::ConfigRequired {
            provider: "github".into(),
            missing: vec!["GITHUB_TOKEN".into()],
        };
        let content = err.to_failure_content();
        assert_eq!(
            content["error"]["patch"]["mcpServers"]["github"]["env"]["GITHUB_TOKEN"],
            "<GITHUB_TOKEN>"
        );
    }
}
