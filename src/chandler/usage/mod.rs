//! Per-session usage tracking
//!
//! One tracker per session measures consumption and asks the manager for a
//! renewal before the allotment runs out. Variant selection follows the
//! advertised metric; both variants expose the same capability set.

pub mod data;
pub mod time;

use crate::chandler::session::Session;
use crate::errors::TollGateResult;
use crate::protocol::Metric;
use async_trait::async_trait;
use std::sync::Weak;

pub use data::DataTracker;
pub use time::TimeTracker;

/// Callback surface trackers use to reach the session manager. Trackers hold
/// it weakly and look the session up by pubkey; they never own session state.
#[async_trait]
pub trait RenewalHandler: Send + Sync {
    async fn handle_upcoming_renewal(&self, tollgate_pubkey: &str, current_usage: u64);
}

#[async_trait]
pub trait UsageTracker: Send + Sync {
    /// Begin measuring against the given session snapshot.
    fn start(&mut self, session: &Session) -> TollGateResult<()>;

    /// Stop all tasks and wait for them to exit.
    async fn stop(&mut self);

    /// Current consumption in metric units.
    fn current_usage(&self) -> u64;

    /// The session's allotment changed (a renewal landed); recompute the
    /// trigger and release the in-progress latch.
    fn session_changed(&self, session: &Session);
}

/// Tagged construction by metric.
pub fn build_tracker(
    session: &Session,
    handler: Weak<dyn RenewalHandler>,
    tollgate_port: u16,
) -> Box<dyn UsageTracker> {
    match session.metric() {
        Metric::Milliseconds => Box::new(TimeTracker::new(session, handler)),
        Metric::Bytes => Box::new(DataTracker::new(session, handler, tollgate_port)),
    }
}
