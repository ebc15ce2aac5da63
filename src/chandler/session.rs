//! Session state for one upstream TollGate
//!
//! A session is an authorized, metered allotment purchased from one upstream.
//! The manager owns the only copy; everything handed outward is a snapshot.

use crate::errors::{TollGateError, TollGateResult};
use crate::protocol::{Advertisement, Metric, PricingOption};
use chrono::{DateTime, Utc};
use nostr::{Event, Keys};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// A validated upstream discovered by the crowsnest pipeline.
#[derive(Debug, Clone)]
pub struct UpstreamTollgate {
    pub interface: String,
    pub mac_address: String,
    pub gateway_ip: IpAddr,
    pub advertisement: Advertisement,
    /// The verified advertisement event as received.
    pub event: Event,
    pub discovered_at: DateTime<Utc>,
}

/// Session status enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionStatus {
    /// Session is active and monitoring usage
    Active,
    /// Renewal was refused (budget); waiting for an explicit resume
    Paused,
    /// Interface carrying the session disappeared
    Expired,
    /// Explicitly ended
    Terminated,
}

impl SessionStatus {
    /// Terminal states never return to Active.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Expired | SessionStatus::Terminated)
    }
}

/// Why a payment is being made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentReason {
    Initial,
    Renewal,
}

impl PaymentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentReason::Initial => "initial",
            PaymentReason::Renewal => "renewal",
        }
    }
}

/// One planned payment attempt.
#[derive(Debug, Clone)]
pub struct PaymentProposal {
    pub tollgate_pubkey: String,
    pub steps: u64,
    pub pricing: PricingOption,
    pub reason: PaymentReason,
    /// Units we expect the payment to buy; the upstream's answer is
    /// authoritative.
    pub estimated_allotment: u64,
}

/// Individual TollGate session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier
    pub id: String,
    /// Upstream TollGate's public key
    pub tollgate_pubkey: String,
    /// Interface the session is bound to
    pub interface: String,
    /// Client MAC address used as the device identifier
    pub mac_address: String,
    /// Gateway IP address
    pub gateway_ip: IpAddr,
    /// Current session status
    pub status: SessionStatus,
    /// This session's ephemeral customer key, hex encoded. Generated fresh
    /// per session and never reused.
    customer_secret: String,
    /// Advertisement the session was established against
    pub advertisement: Advertisement,
    /// Selected pricing option
    pub pricing_option: PricingOption,
    /// Total allotment purchased (in metric units); server authoritative
    pub total_allotment: u64,
    /// Usage snapshot (in metric units), refreshed when the tracker stops
    pub current_usage: u64,
    /// Remaining units at which the tracker requests a renewal
    pub renewal_offset: u64,
    /// Total amount spent (in price units)
    pub total_spent: u64,
    /// Number of successful payments
    pub payment_count: u32,
    /// When session was created
    pub created_at: DateTime<Utc>,
    /// Last successful payment time
    pub last_payment_at: DateTime<Utc>,
    /// Last successful renewal time
    pub last_renewal_at: Option<DateTime<Utc>>,
}

/// Parameters for creating a new session
pub struct SessionParams {
    pub upstream: UpstreamTollgate,
    pub pricing_option: PricingOption,
    pub customer_keys: Keys,
    pub initial_allotment: u64,
    pub initial_cost: u64,
    pub renewal_offset: u64,
}

impl Session {
    /// Create a session after its first successful payment.
    pub fn new(params: SessionParams) -> Self {
        let now = Utc::now();

        Session {
            id: Uuid::new_v4().to_string(),
            tollgate_pubkey: params.upstream.advertisement.tollgate_pubkey.clone(),
            interface: params.upstream.interface,
            mac_address: params.upstream.mac_address,
            gateway_ip: params.upstream.gateway_ip,
            status: SessionStatus::Active,
            customer_secret: params.customer_keys.secret_key().to_secret_hex(),
            advertisement: params.upstream.advertisement,
            pricing_option: params.pricing_option,
            total_allotment: params.initial_allotment,
            current_usage: 0,
            renewal_offset: params.renewal_offset,
            total_spent: params.initial_cost,
            payment_count: 1,
            created_at: now,
            last_payment_at: now,
            last_renewal_at: None,
        }
    }

    pub fn metric(&self) -> Metric {
        self.advertisement.metric
    }

    /// Rebuild the signing keys from the stored secret.
    pub fn customer_keys(&self) -> TollGateResult<Keys> {
        Keys::parse(&self.customer_secret)
            .map_err(|e| TollGateError::session(format!("Invalid customer keys: {}", e)))
    }

    /// Apply a successful renewal. The granted allotment is absolute.
    pub fn apply_renewal(&mut self, new_allotment: u64, cost: u64) {
        let now = Utc::now();
        self.total_allotment = new_allotment;
        self.total_spent += cost;
        self.payment_count += 1;
        self.last_payment_at = now;
        self.last_renewal_at = Some(now);
    }

    /// Move to `next`, refusing to leave a terminal state.
    pub fn transition(&mut self, next: SessionStatus) -> TollGateResult<()> {
        if self.status.is_terminal() {
            return Err(TollGateError::session(format!(
                "Session {} is {:?} and cannot become {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn usage_percentage(&self) -> f64 {
        if self.total_allotment == 0 {
            return 1.0;
        }
        (self.current_usage as f64 / self.total_allotment as f64).min(1.0)
    }

    pub fn remaining_units(&self) -> u64 {
        self.total_allotment.saturating_sub(self.current_usage)
    }

    pub fn snapshot(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            tollgate_pubkey: self.tollgate_pubkey.clone(),
            interface: self.interface.clone(),
            gateway_ip: self.gateway_ip,
            status: self.status,
            metric: self.metric(),
            total_allotment: self.total_allotment,
            current_usage: self.current_usage,
            usage_percentage: self.usage_percentage(),
            remaining_units: self.remaining_units(),
            total_spent: self.total_spent,
            payment_count: self.payment_count,
        }
    }
}

/// Read-only session view for host applications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub tollgate_pubkey: String,
    pub interface: String,
    pub gateway_ip: IpAddr,
    pub status: SessionStatus,
    pub metric: Metric,
    pub total_allotment: u64,
    pub current_usage: u64,
    pub usage_percentage: f64,
    pub remaining_units: u64,
    pub total_spent: u64,
    pub payment_count: u32,
}


#[cfg(test)]
mod tests {
    use super::testing::test_session;
    use super::*;

    #[test]
    fn test_session_creation() {
        let session = test_session("upstream", Metric::Milliseconds);

        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.total_allotment, 600_000);
        assert_eq!(session.total_spent, 10);
        assert_eq!(session.payment_count, 1);
        assert!(session.customer_keys().is_ok());
    }

    #[test]
    fn test_apply_renewal_is_absolute() {
        let mut session = test_session("upstream", Metric::Milliseconds);

        session.apply_renewal(1_200_000, 10);

        assert_eq!(session.total_allotment, 1_200_000);
        assert_eq!(session.total_spent, 20);
        assert_eq!(session.payment_count, 2);
        assert!(session.last_renewal_at.is_some());
    }

    #[test]
    fn test_terminal_states_stay_terminal() {
        let mut session = test_session("upstream", Metric::Milliseconds);

        session.transition(SessionStatus::Paused).unwrap();
        session.transition(SessionStatus::Active).unwrap();
        session.transition(SessionStatus::Expired).unwrap();

        assert!(session.transition(SessionStatus::Active).is_err());
        assert_eq!(session.status, SessionStatus::Expired);
    }

    #[test]
    fn test_usage_percentage_caps_at_one() {
        let mut session = test_session("upstream", Metric::Milliseconds);

        session.current_usage = 300_000;
        assert_eq!(session.usage_percentage(), 0.5);

        session.current_usage = 900_000;
        assert_eq!(session.usage_percentage(), 1.0);
        assert_eq!(session.remaining_units(), 0);
    }

    #[test]
    fn test_each_session_gets_fresh_keys() {
        let a = test_session("upstream-a", Metric::Milliseconds);
        let b = test_session("upstream-b", Metric::Milliseconds);

        assert_ne!(
            a.customer_keys().unwrap().public_key(),
            b.customer_keys().unwrap().public_key()
        );
    }
}
