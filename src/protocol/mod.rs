//! MCP Protocol types (version 2024-11-05)

mod messages;
mod types;

pub use messages::*;
pub use types::*;

/// Protocol versions this gateway speaks, newest first
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05"];

/// Default protocol version
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Negotiate the protocol version with a client.
///
/// The client's version is echoed back unchanged when we support it;
/// otherwise the newest version we do support is offered.
#[must_use]
pub fn negotiate_version(client_version: &str) -> &str {
    SUPPORTED_VERSIONS
        .iter()
        .find(|v| **v == client_version)
        .copied()
        .unwrap_or(SUPPORTED_VERSIONS[0])
}
