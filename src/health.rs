//! Provider health tracking
//!
//! Tracks per-provider liveness: consecutive failure counts, a
//! healthy/unhealthy verdict, and a cooldown window with exponential
//! backoff. Routing and discovery consult this before touching a provider.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

/// Health verdict for one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// At least one success since the last failure streak
    Healthy,
    /// Consecutive failures crossed the threshold
    Unhealthy,
    /// No observations yet
    Unknown,
}

/// Per-provider health record
#[derive(Debug, Clone)]
struct HealthRecord {
    state: HealthState,
    consecutive_failures: u32,
    last_success_at: Option<Instant>,
    last_failure_reason: Option<String>,
    cooldown_until: Option<Instant>,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            state: HealthState::Unknown,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_reason: None,
            cooldown_until: None,
        }
    }
}

/// Snapshot of one provider's health, cheap to clone
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Provider name
    pub provider: String,
    /// Current verdict
    pub state: HealthState,
    /// Consecutive failures
    pub consecutive_failures: u32,
    /// Reason of the most recent failure
    pub last_failure_reason: Option<String>,
    /// Remaining cooldown in milliseconds (0 when none)
    pub cooldown_remaining_ms: u64,
}

/// Health monitor across all providers
pub struct HealthMonitor {
    records: RwLock<HashMap<String, HealthRecord>>,
    /// Consecutive failures before a provider flips unhealthy
    failure_threshold: u32,
    /// Backoff cap
    cooldown_cap: Duration,
}

/// Base cooldown for the first over-threshold failure
const COOLDOWN_BASE: Duration = Duration::from_secs(5);

impl HealthMonitor {
    /// Create a monitor with the given threshold and cooldown cap
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown_cap: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            failure_threshold,
            cooldown_cap,
        }
    }

    /// Record a successful call
    pub fn record_success(&self, provider: &str) {
        let mut records = self.records.write();
        let record = records
            .entry(provider.to_string())
            .or_insert_with(HealthRecord::new);
        if record.state == HealthState::Unhealthy {
            info!(provider = provider, "Provider recovered");
        }
        record.state = HealthState::Healthy;
        record.consecutive_failures = 0;
        record.last_success_at = Some(Instant::now());
        record.cooldown_until = None;
    }

    /// Record a failed call with its reason
    pub fn record_failure(&self, provider: &str, reason: &str) {
        let mut records = self.records.write();
        let record = records
            .entry(provider.to_string())
            .or_insert_with(HealthRecord::new);
        record.consecutive_failures += 1;
        record.last_failure_reason = Some(reason.to_string());

        if record.consecutive_failures >= self.failure_threshold {
            let cooldown = self.backoff(record.consecutive_failures);
            record.cooldown_until = Some(Instant::now() + cooldown);
            if record.state != HealthState::Unhealthy {
                warn!(
                    provider = provider,
                    consecutive_failures = record.consecutive_failures,
                    cooldown_secs = cooldown.as_secs(),
                    "Provider marked unhealthy"
                );
            }
            record.state = HealthState::Unhealthy;
        }
    }

    /// Exponential backoff: base doubles per failure past the threshold,
    /// capped at the configured maximum.
    fn backoff(&self, consecutive_failures: u32) -> Duration {
        let over = consecutive_failures.saturating_sub(self.failure_threshold);
        let exp = over.min(16);
        let cooldown = COOLDOWN_BASE.saturating_mul(1_u32 << exp);
        cooldown.min(self.cooldown_cap)
    }

    /// Whether routing may touch this provider right now.
    ///
    /// Unknown providers are routable; unhealthy providers become routable
    /// again once their cooldown elapses.
    #[must_use]
    pub fn is_routable(&self, provider: &str) -> bool {
        let records = self.records.read();
        match records.get(provider) {
            None => true,
            Some(record) => match record.state {
                HealthState::Healthy | HealthState::Unknown => true,
                HealthState::Unhealthy => record
                    .cooldown_until
                    .is_none_or(|until| Instant::now() >= until),
            },
        }
    }

    /// Providers currently eligible for routing and discovery, filtered
    /// from the given candidate set.
    #[must_use]
    pub fn healthy_providers<'a>(&self, candidates: &'a [String]) -> Vec<&'a String> {
        candidates.iter().filter(|p| self.is_routable(p)).collect()
    }

    /// Snapshot one provider's record
    #[must_use]
    pub fn snapshot(&self, provider: &str) -> HealthSnapshot {
        let records = self.records.read();
        let record = records.get(provider).cloned().unwrap_or_else(HealthRecord::new);
        let cooldown_remaining_ms = record
            .cooldown_until
            .and_then(|until| until.checked_duration_since(Instant::now()))
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        HealthSnapshot {
            provider: provider.to_string(),
            state: record.state,
            consecutive_failures: record.consecutive_failures,
            last_failure_reason: record.last_failure_reason,
            cooldown_remaining_ms,
        }
    }

    /// Drop a provider's record (profile removal)
    pub fn forget(&self, provider: &str) {
        self.records.write().remove(provider);
    }
}
