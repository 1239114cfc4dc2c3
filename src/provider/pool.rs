//! Connection pool
//!
//! One entry per configured provider, spawned lazily. A global semaphore
//! bounds concurrent spawns so a large profile cannot launch every process
//! at once, and a background sweep evicts connections idle past the
//! threshold without ever interrupting an in-flight call.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::ConnectionState;
use super::connection::ProviderConnection;
use crate::profile::ProviderSpec;
use crate::{Error, Result};

/// How often the idle sweep runs
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Pool of provider connections
pub struct ConnectionPool {
    connections: DashMap<String, Arc<ProviderConnection>>,
    /// Bounds concurrent spawns across the whole pool
    spawn_fanout: Arc<tokio::sync::Semaphore>,
    spawn_timeout: Duration,
    call_timeout: Duration,
}

impl ConnectionPool {
    /// Create a pool with the given fan-out bound and timeouts
    #[must_use]
    pub fn new(spawn_fanout: usize, spawn_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            spawn_fanout: Arc::new(tokio::sync::Semaphore::new(spawn_fanout.max(1))),
            spawn_timeout,
            call_timeout,
        }
    }

    /// Get or create the entry for a provider; no process is spawned
    #[must_use]
    pub fn entry(&self, name: &str, spec: &ProviderSpec) -> Arc<ProviderConnection> {
        self.connections
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(ProviderConnection::new(
                    name,
                    spec.clone(),
                    self.spawn_timeout,
                    self.call_timeout,
                ))
            })
            .clone()
    }

    /// Existing entry, if any
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ProviderConnection>> {
        self.connections.get(name).map(|c| Arc::clone(&c))
    }

    /// Ensure the provider's connection is READY, spawning under the
    /// global fan-out bound.
    ///
    /// # Errors
    ///
    /// Propagates spawn and initialization failures.
    pub async fn ready(
        &self,
        name: &str,
        spec: &ProviderSpec,
        cancel: &CancellationToken,
    ) -> Result<Arc<ProviderConnection>> {
        let connection = self.entry(name, spec);
        if connection.state() == ConnectionState::Ready {
            return Ok(connection);
        }
        let _permit = self
            .spawn_fanout
            .acquire()
            .await
            .map_err(|_| Error::ProviderUnavailable(name.to_string()))?;
        connection.ensure_ready(cancel).await?;
        Ok(connection)
    }

    /// Drop a provider's entry, closing its connection
    pub async fn remove(&self, name: &str) {
        if let Some((_, connection)) = self.connections.remove(name) {
            connection.close().await;
        }
    }

    /// All current entries
    #[must_use]
    pub fn all(&self) -> Vec<Arc<ProviderConnection>> {
        self.connections.iter().map(|c| Arc::clone(&c)).collect()
    }

    /// Close every connection
    pub async fn close_all(&self) {
        for connection in self.all() {
            connection.close().await;
        }
        info!("All provider connections closed");
    }

    /// Start the background idle sweep. Connections READY and idle past the
    /// threshold are closed; anything with a call in flight is skipped.
    pub fn spawn_idle_sweeper(
        self: &Arc<Self>,
        idle_threshold: Duration,
        shutdown: CancellationToken,
    ) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(SWEEP_INTERVAL) => {}
                }
                for connection in pool.all() {
                    if connection.state() != ConnectionState::Ready
                        || connection.has_in_flight()
                    {
                        continue;
                    }
                    if connection.idle_for().is_some_and(|idle| idle >= idle_threshold) {
                        debug!(provider = %connection.name, "Evicting idle connection");
                        connection.close().await;
                    }
                }
            }
        });
    }
}
