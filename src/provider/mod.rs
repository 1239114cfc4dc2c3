//! Provider connections and the connection pool

pub mod connection;
pub mod pool;

use serde::Serialize;

use crate::protocol::{Content, ToolsCallResult};

pub use connection::{Listings, ProviderConnection};
pub use pool::ConnectionPool;

/// Provider connection lifecycle
///
/// ```text
/// NEW → SPAWNING → INITIALIZING → READY ⇄ CALLING
///                          │                 │
///                          └──── FAILED ←────┘
///                                  │
///                                CLOSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Entry exists, no process
    New,
    /// Child process launched, stdio pipes wired
    Spawning,
    /// Handshake issued, awaiting server capabilities
    Initializing,
    /// Listings cached, available for calls
    Ready,
    /// Request in flight
    Calling,
    /// Unrecoverable initialization or repeated call errors
    Failed,
    /// Process exited or idle-evicted
    Closed,
}

impl ConnectionState {
    /// Whether a process may exist in this state
    #[must_use]
    pub fn has_process(self) -> bool {
        matches!(
            self,
            Self::Spawning | Self::Initializing | Self::Ready | Self::Calling
        )
    }
}

/// Normalize a provider's `tools/call` response.
///
/// Text parts are concatenated with newlines into a single part; non-text
/// parts are preserved in their structured form; an empty part list yields
/// an empty string. The normalized value is what the client receives.
#[must_use]
pub fn normalize_call_result(raw: ToolsCallResult) -> ToolsCallResult {
    let mut texts: Vec<String> = Vec::new();
    let mut structured: Vec<Content> = Vec::new();

    for part in raw.content {
        match part {
            Content::Text { text } => texts.push(text),
            other => structured.push(other),
        }
    }

    let mut content = Vec::new();
    if !texts.is_empty() || structured.is_empty() {
        content.push(Content::text(texts.join("\n")));
    }
    content.extend(structured);

    ToolsCallResult {
        content,
        is_error: raw.is_error,
    }
}
