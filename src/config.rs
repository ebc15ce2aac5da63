//! Configuration for the discovery pipeline and session manager
//!
//! The surrounding application owns the file layout; this module only defines
//! the deserialized shape and its defaults. Every field has a serde default so
//! partial configs stay valid across versions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub crowsnest: CrowsnestConfig,
    #[serde(default)]
    pub chandler: ChandlerConfig,
}

/// Discovery pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrowsnestConfig {
    /// Interfaces that are never probed (loopback, container bridges, our own
    /// AP-mode radios).
    #[serde(default = "default_ignore_interfaces")]
    pub ignore_interfaces: Vec<String>,
    /// When non-empty, only these interfaces are considered.
    #[serde(default)]
    pub only_interfaces: Vec<String>,
    /// Timeout for a single advertisement HTTP request.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Attempts per probe before the discovery is recorded as failed.
    #[serde(default = "default_probe_retry_count")]
    pub probe_retry_count: u32,
    /// Delay between probe attempts.
    #[serde(default = "default_probe_retry_delay_secs")]
    pub probe_retry_delay_secs: u64,
    /// Overall discovery deadline, and the cooldown before a failed
    /// `(interface, gateway)` pair is retried.
    #[serde(default = "default_discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,
}

impl CrowsnestConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn probe_retry_delay(&self) -> Duration {
        Duration::from_secs(self.probe_retry_delay_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }
}

impl Default for CrowsnestConfig {
    fn default() -> Self {
        Self {
            ignore_interfaces: default_ignore_interfaces(),
            only_interfaces: Vec::new(),
            probe_timeout_secs: default_probe_timeout_secs(),
            probe_retry_count: default_probe_retry_count(),
            probe_retry_delay_secs: default_probe_retry_delay_secs(),
            discovery_timeout_secs: default_discovery_timeout_secs(),
        }
    }
}

/// Session manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChandlerConfig {
    /// Budget ceiling for time-metered upstreams, in price units per millisecond.
    #[serde(default = "default_max_price_per_millisecond")]
    pub max_price_per_millisecond: f64,
    /// Budget ceiling for data-metered upstreams, in price units per byte.
    #[serde(default = "default_max_price_per_byte")]
    pub max_price_per_byte: f64,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    /// Consecutive "token already spent" responses tolerated per payment.
    #[serde(default = "default_max_token_retries")]
    pub max_token_retries: u32,
    /// Linear backoff base for failed payment attempts.
    #[serde(default = "default_payment_backoff_secs")]
    pub payment_backoff_secs: u64,
    /// Linear backoff base for the session establishment loop.
    #[serde(default = "default_establishment_backoff_secs")]
    pub establishment_backoff_secs: u64,
    /// Overpayment tolerated when the merchant cannot split an exact token,
    /// in percent of the payment amount.
    #[serde(default = "default_token_overpayment_percent")]
    pub token_overpayment_percent: u64,
}

impl ChandlerConfig {
    pub fn payment_backoff(&self) -> Duration {
        Duration::from_secs(self.payment_backoff_secs)
    }

    pub fn establishment_backoff(&self) -> Duration {
        Duration::from_secs(self.establishment_backoff_secs)
    }
}

impl Default for ChandlerConfig {
    fn default() -> Self {
        Self {
            max_price_per_millisecond: default_max_price_per_millisecond(),
            max_price_per_byte: default_max_price_per_byte(),
            trust: TrustConfig::default(),
            sessions: SessionsConfig::default(),
            max_token_retries: default_max_token_retries(),
            payment_backoff_secs: default_payment_backoff_secs(),
            establishment_backoff_secs: default_establishment_backoff_secs(),
            token_overpayment_percent: default_token_overpayment_percent(),
        }
    }
}

/// Which upstream pubkeys we are willing to pay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    #[serde(default = "default_trust_policy")]
    pub default_policy: TrustPolicy,
    /// When non-empty, only these pubkeys are accepted.
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// Always rejected, even when allowlisted.
    #[serde(default)]
    pub blocklist: Vec<String>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            default_policy: default_trust_policy(),
            allowlist: Vec::new(),
            blocklist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustPolicy {
    TrustAll,
    TrustNone,
}

/// Purchase sizing and renewal timing, per metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Remaining milliseconds at which a time-metered session renews.
    #[serde(default = "default_renewal_offset_milliseconds")]
    pub renewal_offset_milliseconds: u64,
    /// Remaining bytes at which a data-metered session renews.
    #[serde(default = "default_renewal_offset_bytes")]
    pub renewal_offset_bytes: u64,
    /// Preferred purchase size for time-metered upstreams, in milliseconds.
    #[serde(default = "default_preferred_increment_milliseconds")]
    pub preferred_session_increments_milliseconds: u64,
    /// Preferred purchase size for data-metered upstreams, in bytes.
    #[serde(default = "default_preferred_increment_bytes")]
    pub preferred_session_increments_bytes: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            renewal_offset_milliseconds: default_renewal_offset_milliseconds(),
            renewal_offset_bytes: default_renewal_offset_bytes(),
            preferred_session_increments_milliseconds: default_preferred_increment_milliseconds(),
            preferred_session_increments_bytes: default_preferred_increment_bytes(),
        }
    }
}

fn default_ignore_interfaces() -> Vec<String> {
    ["lo", "docker0", "phy0-ap0", "phy1-ap0", "wlan0-ap"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_probe_retry_count() -> u32 {
    3
}

fn default_probe_retry_delay_secs() -> u64 {
    1
}

fn default_discovery_timeout_secs() -> u64 {
    300
}

fn default_max_price_per_millisecond() -> f64 {
    0.001
}

fn default_max_price_per_byte() -> f64 {
    0.000_01
}

fn default_max_token_retries() -> u32 {
    3
}

fn default_payment_backoff_secs() -> u64 {
    2
}

fn default_establishment_backoff_secs() -> u64 {
    2
}

fn default_token_overpayment_percent() -> u64 {
    2
}

fn default_trust_policy() -> TrustPolicy {
    TrustPolicy::TrustAll
}

fn default_renewal_offset_milliseconds() -> u64 {
    30_000
}

fn default_renewal_offset_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_preferred_increment_milliseconds() -> u64 {
    600_000
}

fn default_preferred_increment_bytes() -> u64 {
    10 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();

        assert!(config.crowsnest.ignore_interfaces.contains(&"lo".to_string()));
        assert!(config.crowsnest.only_interfaces.is_empty());
        assert_eq!(config.crowsnest.discovery_timeout_secs, 300);
        assert_eq!(config.chandler.max_token_retries, 3);
        assert_eq!(config.chandler.trust.default_policy, TrustPolicy::TrustAll);
        assert_eq!(
            config.chandler.sessions.preferred_session_increments_milliseconds,
            600_000
        );
    }

    #[test]
    fn test_partial_config_overrides() {
        let config: Config = serde_json::from_str(
            r#"{
                "crowsnest": {"only_interfaces": ["wan"], "probe_timeout_secs": 5},
                "chandler": {"trust": {"default_policy": "trust_none", "allowlist": ["abc"]}}
            }"#,
        )
        .unwrap();

        assert_eq!(config.crowsnest.only_interfaces, vec!["wan".to_string()]);
        assert_eq!(config.crowsnest.probe_timeout(), Duration::from_secs(5));
        // Untouched sections keep their defaults.
        assert_eq!(config.crowsnest.probe_retry_count, 3);
        assert_eq!(config.chandler.trust.default_policy, TrustPolicy::TrustNone);
        assert_eq!(config.chandler.trust.allowlist, vec!["abc".to_string()]);
    }
}
