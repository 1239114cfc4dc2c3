//! Provider transports

mod stdio;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::protocol::JsonRpcResponse;

pub use stdio::StdioTransport;

/// A bidirectional JSON-RPC channel to one provider process.
///
/// Implementations correlate responses to requests strictly by id; FIFO
/// response order is not assumed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and await its response within `timeout`.
    ///
    /// Cancelling `cancel` completes the pending slot with
    /// [`crate::Error::Cancelled`]; the provider may still finish the work,
    /// and its late response is dropped.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse>;

    /// Send a notification (no response expected)
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Whether the underlying channel is still usable
    fn is_connected(&self) -> bool;

    /// Close the channel and reap the process
    async fn close(&self);
}
