//! Error types for TollGate client operations

use thiserror::Error;

pub type TollGateResult<T> = Result<T, TollGateError>;

#[derive(Error, Debug)]
pub enum TollGateError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Nostr error: {0}")]
    Nostr(#[from] nostr::event::builder::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Invalid TollGate advertisement: {0}")]
    InvalidAdvertisement(String),

    #[error("Upstream {0} rejected by trust policy")]
    Untrusted(String),

    #[error("No pricing option matches an accepted mint")]
    NoCompatiblePricing,

    #[error("Insufficient funds: need {needed} {unit}, have {available} {unit}")]
    InsufficientFunds {
        needed: u64,
        available: u64,
        unit: String,
    },

    #[error("Affordable steps came out to zero")]
    ZeroAffordableSteps,

    #[error("Price {price_per_unit} per unit exceeds ceiling {ceiling}")]
    PriceCeilingExceeded { price_per_unit: f64, ceiling: f64 },

    #[error("Payment rejected by upstream: {0}")]
    PaymentRejected(String),

    #[error("Payment token spent {0} times in a row, giving up")]
    TokenRetriesExhausted(u32),

    #[error("Merchant wallet error: {0}")]
    Merchant(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Network monitor error: {0}")]
    Monitor(String),

    #[error("Component is already running")]
    AlreadyRunning,

    #[error("Unsupported metric: {0}")]
    UnsupportedMetric(String),
}

impl TollGateError {
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }

    pub fn merchant(msg: impl Into<String>) -> Self {
        Self::Merchant(msg.into())
    }

    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn monitor(msg: impl Into<String>) -> Self {
        Self::Monitor(msg.into())
    }

    /// Budget failures that may clear up on a later attempt (balance can be
    /// topped up, prices can change on a fresh advertisement).
    pub fn is_retryable_budget(&self) -> bool {
        matches!(
            self,
            Self::InsufficientFunds { .. }
                | Self::ZeroAffordableSteps
                | Self::PriceCeilingExceeded { .. }
        )
    }
}

/// Upstream signals a double-spent ecash token either with a human-readable
/// sentence or the machine tag, depending on firmware version.
pub fn is_token_spent_response(body: &str) -> bool {
    body.contains("Token already spent") || body.contains("payment-error-token-spent")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_spent_detection() {
        assert!(is_token_spent_response("Token already spent"));
        assert!(is_token_spent_response(
            "{\"error\":\"payment-error-token-spent\"}"
        ));
        assert!(!is_token_spent_response("payment required"));
    }

    #[test]
    fn test_budget_retryability() {
        assert!(TollGateError::ZeroAffordableSteps.is_retryable_budget());
        assert!(TollGateError::InsufficientFunds {
            needed: 10,
            available: 1,
            unit: "sat".to_string(),
        }
        .is_retryable_budget());
        assert!(!TollGateError::NoCompatiblePricing.is_retryable_budget());
        assert!(!TollGateError::Untrusted("abc".to_string()).is_retryable_budget());
    }
}
