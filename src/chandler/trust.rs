//! Upstream trust policy
//!
//! Decides whether we are willing to pay a given upstream pubkey. Lists are
//! static for the lifetime of a session; re-evaluation only happens at
//! establishment time.

use crate::config::{TrustConfig, TrustPolicy};
use crate::errors::{TollGateError, TollGateResult};

/// Blocklist first, then the allowlist (exclusive when non-empty), then the
/// default policy.
pub fn check_trust(config: &TrustConfig, pubkey: &str) -> TollGateResult<()> {
    if config.blocklist.iter().any(|k| k == pubkey) {
        return Err(TollGateError::Untrusted(pubkey.to_string()));
    }

    if !config.allowlist.is_empty() {
        if config.allowlist.iter().any(|k| k == pubkey) {
            return Ok(());
        }
        return Err(TollGateError::Untrusted(pubkey.to_string()));
    }

    match config.default_policy {
        TrustPolicy::TrustAll => Ok(()),
        TrustPolicy::TrustNone => Err(TollGateError::Untrusted(pubkey.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(policy: TrustPolicy, allow: &[&str], block: &[&str]) -> TrustConfig {
        TrustConfig {
            default_policy: policy,
            allowlist: allow.iter().map(|s| s.to_string()).collect(),
            blocklist: block.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_blocklist_wins_over_everything() {
        let c = config(TrustPolicy::TrustAll, &["key1"], &["key1"]);
        assert!(check_trust(&c, "key1").is_err());
    }

    #[test]
    fn test_allowlist_is_exclusive_when_present() {
        let c = config(TrustPolicy::TrustAll, &["key1"], &[]);
        assert!(check_trust(&c, "key1").is_ok());
        // trust_all does not rescue keys outside a non-empty allowlist
        assert!(check_trust(&c, "key2").is_err());
    }

    #[test]
    fn test_default_policy_applies_without_lists() {
        let open = config(TrustPolicy::TrustAll, &[], &[]);
        assert!(check_trust(&open, "anything").is_ok());

        let closed = config(TrustPolicy::TrustNone, &[], &[]);
        assert!(check_trust(&closed, "anything").is_err());
    }
}
