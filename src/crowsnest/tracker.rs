//! Discovery attempt bookkeeping
//!
//! Prevents probe thrashing: one record per `(interface, gateway)` pair, a
//! cooldown between failed attempts, and a terminal Success state that only an
//! explicit interface clear can reset.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryResult {
    /// Probe in flight; the slot is held against concurrent events.
    Pending,
    Success,
    /// Transport failure or non-200 response.
    Error,
    /// Advertisement fetched but failed validation.
    ValidationFailed,
}

#[derive(Debug, Clone)]
pub struct DiscoveryAttempt {
    pub interface: String,
    pub gateway: IpAddr,
    pub attempted_at: Instant,
    pub result: DiscoveryResult,
}

pub struct DiscoveryTracker {
    attempts: RwLock<HashMap<(String, IpAddr), DiscoveryAttempt>>,
    probe_timeout: Duration,
    discovery_timeout: Duration,
}

impl DiscoveryTracker {
    pub fn new(probe_timeout: Duration, discovery_timeout: Duration) -> Self {
        Self {
            attempts: RwLock::new(HashMap::new()),
            probe_timeout,
            discovery_timeout,
        }
    }

    /// Whether a new probe of `(interface, gateway)` is permitted right now.
    ///
    /// Success is terminal until the interface is cleared. A Pending record
    /// older than twice the probe timeout is treated as stuck and released.
    pub async fn should_attempt_discovery(&self, interface: &str, gateway: IpAddr) -> bool {
        let attempts = self.attempts.read().await;
        let Some(attempt) = attempts.get(&(interface.to_string(), gateway)) else {
            return true;
        };

        let elapsed = attempt.attempted_at.elapsed();
        match attempt.result {
            DiscoveryResult::Success => false,
            DiscoveryResult::Pending => elapsed > self.probe_timeout * 2,
            DiscoveryResult::Error | DiscoveryResult::ValidationFailed => {
                elapsed > self.discovery_timeout
            }
        }
    }

    pub async fn record_discovery(&self, interface: &str, gateway: IpAddr, result: DiscoveryResult) {
        let mut attempts = self.attempts.write().await;
        attempts.insert(
            (interface.to_string(), gateway),
            DiscoveryAttempt {
                interface: interface.to_string(),
                gateway,
                attempted_at: Instant::now(),
                result,
            },
        );
    }

    /// Drop every record for `interface`, including Success. Called when the
    /// interface goes down or loses its address.
    pub async fn clear_interface(&self, interface: &str) {
        let mut attempts = self.attempts.write().await;
        attempts.retain(|(iface, _), _| iface != interface);
    }

    pub async fn last_result(&self, interface: &str, gateway: IpAddr) -> Option<DiscoveryResult> {
        let attempts = self.attempts.read().await;
        attempts
            .get(&(interface.to_string(), gateway))
            .map(|a| a.result)
    }
}
