//! NCP Gateway Library
//!
//! N-to-1 MCP gateway: presents one server to the client while multiplexing
//! requests across every configured provider.
//!
//! # Features
//!
//! - **Two virtual tools**: `find` discovers tools by natural-language
//!   intent, `run` executes any tool by its qualified name
//! - **Semantic discovery**: embedding-based ranking with a lexical
//!   fallback and a capability/intent enhancement layer
//! - **Incremental cache**: content-addressed metadata and embedding caches
//!   keep cold starts sub-second across restarts
//! - **Failure isolation**: health tracking with cooldowns; one provider's
//!   crash never breaks the session
//! - **Auto-sync**: additive import from detected upstream client configs
//!
//! # Protocol Version
//!
//! Implements MCP protocol versions 2024-11-05 and 2025-03-26.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod facade;
pub mod fqtn;
pub mod health;
pub mod orchestrator;
pub mod profile;
pub mod protocol;
pub mod provider;
pub mod sync;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging.
///
/// Output goes to stderr: stdout is reserved for protocol frames.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            subscriber
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}
