//! TollGate client core
//!
//! The discovery-to-session pipeline for paid Wi-Fi transit: watch the
//! kernel for new interfaces, probe their gateways for signed advertisements,
//! and keep metered sessions alive by paying upstreams in ecash bearer
//! tokens before the purchased allotment runs out.
//!
//! Two subsystems cooperate:
//! - [`crowsnest`]: network monitor, gateway prober, discovery bookkeeping
//! - [`chandler`]: session establishment, payment/retry loop, usage tracking
//!
//! The ecash wallet itself stays outside the crate behind the
//! [`merchant::Merchant`] trait.

pub mod chandler;
pub mod config;
pub mod crowsnest;
pub mod errors;
pub mod merchant;
pub mod protocol;

#[cfg(test)]
pub(crate) mod test_http;

pub use chandler::session::{Session, SessionInfo, SessionStatus, UpstreamTollgate};
pub use chandler::Chandler;
pub use config::Config;
pub use crowsnest::monitor::{InterfaceInfo, NetworkEvent, NetworkEventType, NetworkMonitor};
pub use crowsnest::Crowsnest;
pub use errors::{TollGateError, TollGateResult};
pub use merchant::{AcceptedMint, Merchant, PaymentToken};
pub use protocol::{Advertisement, Metric, PricingOption};

use std::sync::Arc;

/// Wire the full pipeline together: one crowsnest feeding one chandler.
pub fn build(config: Config, merchant: Arc<dyn Merchant>) -> (Crowsnest, Chandler) {
    let chandler = Chandler::new(config.chandler, merchant);
    let crowsnest = Crowsnest::new(config.crowsnest, chandler.clone());
    (crowsnest, chandler)
}
