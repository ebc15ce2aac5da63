//! Chandler: the session manager
//!
//! Owns every session keyed by upstream pubkey. Establishes sessions from
//! validated upstreams, pays for them, renews them when their tracker calls
//! back, and tears them down on interface loss or explicit request.

pub mod payment;
pub mod session;
pub mod trust;
pub mod usage;

use crate::config::ChandlerConfig;
use crate::crowsnest::prober::{cancelled_during, TOLLGATE_PORT};
use crate::errors::{TollGateError, TollGateResult};
use crate::merchant::{AcceptedMint, Merchant};
use crate::protocol::{calculate_allotment, calculate_cost, Metric, PricingOption};
use async_trait::async_trait;
use nostr::Keys;
use payment::PaymentClient;
use session::{
    PaymentProposal, PaymentReason, Session, SessionInfo, SessionParams, SessionStatus,
    UpstreamTollgate,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex, RwLock};
use usage::{build_tracker, RenewalHandler, UsageTracker};

/// Public handle. Cheap to clone; all state lives behind the inner Arc.
#[derive(Clone)]
pub struct Chandler {
    inner: Arc<ChandlerInner>,
}

struct ChandlerInner {
    config: ChandlerConfig,
    merchant: Arc<dyn Merchant>,
    payment: PaymentClient,
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    /// Establishments in flight, keyed by upstream pubkey. Holds the slot
    /// against duplicate discoveries and carries the cancel handle used on
    /// interface loss.
    establishing: Mutex<HashMap<String, Establishing>>,
    tollgate_port: u16,
}

struct Establishing {
    interface: String,
    cancel: watch::Sender<bool>,
}

struct SessionEntry {
    /// Interface the session is bound to; duplicated out of the session so
    /// disconnect sweeps need not take every session lock.
    interface: String,
    session: Mutex<Session>,
    tracker: Mutex<Option<Box<dyn UsageTracker>>>,
    /// Serializes the payment loop per session; renewals never overlap.
    payment_gate: Mutex<()>,
    /// Flipped when the session is torn down, aborting any renewal payment
    /// still in its retry loop.
    cancel: watch::Sender<bool>,
}

impl Chandler {
    pub fn new(config: ChandlerConfig, merchant: Arc<dyn Merchant>) -> Self {
        let payment = PaymentClient::new(&config);
        Self {
            inner: Arc::new(ChandlerInner {
                config,
                merchant,
                payment,
                sessions: RwLock::new(HashMap::new()),
                establishing: Mutex::new(HashMap::new()),
                tollgate_port: TOLLGATE_PORT,
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_port(config: ChandlerConfig, merchant: Arc<dyn Merchant>, port: u16) -> Self {
        let payment = PaymentClient::new(&config).with_port(port);
        Self {
            inner: Arc::new(ChandlerInner {
                config,
                merchant,
                payment,
                sessions: RwLock::new(HashMap::new()),
                establishing: Mutex::new(HashMap::new()),
                tollgate_port: port,
            }),
        }
    }

    /// Establish a session with a freshly validated upstream. A second call
    /// for an upstream we already hold a session with is a no-op.
    pub async fn handle_upstream_tollgate(&self, upstream: UpstreamTollgate) -> TollGateResult<()> {
        let pubkey = upstream.advertisement.tollgate_pubkey.clone();

        if self.inner.sessions.read().await.contains_key(&pubkey) {
            log::debug!("Session with {} already exists, ignoring discovery", pubkey);
            return Ok(());
        }

        trust::check_trust(&self.inner.config.trust, &pubkey)?;

        // Claim the establishment slot.
        let mut cancel_rx = {
            let mut establishing = self.inner.establishing.lock().await;
            if establishing.contains_key(&pubkey) {
                log::debug!("Establishment for {} already in flight", pubkey);
                return Ok(());
            }
            if self.inner.sessions.read().await.contains_key(&pubkey) {
                return Ok(());
            }
            let (cancel, cancel_rx) = watch::channel(false);
            establishing.insert(
                pubkey.clone(),
                Establishing {
                    interface: upstream.interface.clone(),
                    cancel,
                },
            );
            cancel_rx
        };

        let inner_dyn: Arc<dyn RenewalHandler> = self.inner.clone();
        let handler: Weak<dyn RenewalHandler> = Arc::downgrade(&inner_dyn);
        let result = self.inner.establish(upstream, &mut cancel_rx, handler).await;
        self.inner.establishing.lock().await.remove(&pubkey);
        result
    }

    /// Renew on behalf of a usage tracker or an operator.
    pub async fn force_renewal(&self, tollgate_pubkey: &str) -> TollGateResult<()> {
        let usage = match self.inner.lookup(tollgate_pubkey).await {
            Ok(entry) => {
                let tracker = entry.tracker.lock().await;
                tracker.as_ref().map(|t| t.current_usage()).unwrap_or(0)
            }
            Err(e) => return Err(e),
        };
        self.inner.renew(tollgate_pubkey, usage).await
    }

    /// Stop tracking; the session stays in the map awaiting a resume.
    pub async fn pause_session(&self, tollgate_pubkey: &str) -> TollGateResult<()> {
        let entry = self.inner.lookup(tollgate_pubkey).await?;
        self.inner.pause_entry(&entry).await
    }

    /// Recreate the tracker from the stored session and go Active again.
    pub async fn resume_session(&self, tollgate_pubkey: &str) -> TollGateResult<()> {
        let entry = self.inner.lookup(tollgate_pubkey).await?;

        let snapshot = {
            let mut session = entry.session.lock().await;
            if session.status != SessionStatus::Paused {
                return Err(TollGateError::session(format!(
                    "Session with {} is {:?}, not Paused",
                    tollgate_pubkey, session.status
                )));
            }
            session.transition(SessionStatus::Active)?;
            session.clone()
        };

        let inner_dyn: Arc<dyn RenewalHandler> = self.inner.clone();
        let handler: Weak<dyn RenewalHandler> = Arc::downgrade(&inner_dyn);
        let mut tracker = build_tracker(&snapshot, handler, self.inner.tollgate_port);
        tracker.start(&snapshot)?;
        entry.tracker.lock().await.replace(tracker);

        log::info!("Session with {} resumed", tollgate_pubkey);
        Ok(())
    }

    /// Stop the tracker and drop the session.
    pub async fn terminate_session(&self, tollgate_pubkey: &str) -> TollGateResult<()> {
        let entry = self
            .inner
            .sessions
            .write()
            .await
            .remove(tollgate_pubkey)
            .ok_or_else(|| {
                TollGateError::session(format!("No session with {}", tollgate_pubkey))
            })?;

        let _ = entry.cancel.send(true);
        self.inner.stop_entry_tracker(&entry).await;
        let mut session = entry.session.lock().await;
        let _ = session.transition(SessionStatus::Terminated);
        log::info!("Session with {} terminated", tollgate_pubkey);
        Ok(())
    }

    /// Interface loss is authoritative: every session bound to it expires
    /// immediately, and in-flight establishments on it are cancelled.
    pub async fn handle_disconnect(&self, interface: &str) {
        {
            let establishing = self.inner.establishing.lock().await;
            for (pubkey, pending) in establishing.iter() {
                if pending.interface == interface {
                    log::info!(
                        "Cancelling establishment with {} on lost interface {}",
                        pubkey,
                        interface
                    );
                    let _ = pending.cancel.send(true);
                }
            }
        }

        let doomed: Vec<String> = {
            let sessions = self.inner.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, entry)| entry.interface == interface)
                .map(|(pubkey, _)| pubkey.clone())
                .collect()
        };

        for pubkey in doomed {
            let Some(entry) = self.inner.sessions.write().await.remove(&pubkey) else {
                continue;
            };
            let _ = entry.cancel.send(true);
            self.inner.stop_entry_tracker(&entry).await;
            let mut session = entry.session.lock().await;
            let _ = session.transition(SessionStatus::Expired);
            log::info!(
                "Session with {} expired: interface {} disconnected",
                pubkey,
                interface
            );
        }
    }

    /// Snapshot of every Active session.
    pub async fn active_sessions(&self) -> Vec<SessionInfo> {
        let entries: Vec<Arc<SessionEntry>> =
            self.inner.sessions.read().await.values().cloned().collect();

        let mut infos = Vec::new();
        for entry in entries {
            let info = self.inner.snapshot_entry(&entry).await;
            if info.status == SessionStatus::Active {
                infos.push(info);
            }
        }
        infos
    }

    pub async fn session_by_pubkey(&self, tollgate_pubkey: &str) -> Option<SessionInfo> {
        let entry = self
            .inner
            .sessions
            .read()
            .await
            .get(tollgate_pubkey)
            .cloned()?;
        Some(self.inner.snapshot_entry(&entry).await)
    }
}

impl ChandlerInner {
    async fn lookup(&self, tollgate_pubkey: &str) -> TollGateResult<Arc<SessionEntry>> {
        self.sessions
            .read()
            .await
            .get(tollgate_pubkey)
            .cloned()
            .ok_or_else(|| TollGateError::session(format!("No session with {}", tollgate_pubkey)))
    }

    /// Establishment loop: retry with linear backoff until the session exists
    /// or a non-retryable error surfaces.
    async fn establish(
        &self,
        upstream: UpstreamTollgate,
        cancel_rx: &mut watch::Receiver<bool>,
        handler: Weak<dyn RenewalHandler>,
    ) -> TollGateResult<()> {
        let pubkey = upstream.advertisement.tollgate_pubkey.clone();
        let mut attempt: u32 = 0;

        loop {
            if *cancel_rx.borrow() {
                return Err(TollGateError::session(format!(
                    "Establishment with {} cancelled: interface {} lost",
                    pubkey, upstream.interface
                )));
            }

            attempt += 1;
            match self.establish_once(&upstream, &handler, cancel_rx).await {
                Ok(()) => return Ok(()),
                Err(e @ TollGateError::NoCompatiblePricing) => return Err(e),
                Err(e @ TollGateError::Untrusted(_)) => return Err(e),
                Err(e @ TollGateError::InvalidAdvertisement(_)) => return Err(e),
                Err(e) => {
                    let delay = self.config.establishment_backoff() * attempt;
                    log::warn!(
                        "Establishment with {} failed (attempt {}): {}; retrying in {:?}",
                        pubkey,
                        attempt,
                        e,
                        delay
                    );
                    if cancelled_during(cancel_rx, delay).await {
                        return Err(TollGateError::session(format!(
                            "Establishment with {} cancelled: interface {} lost",
                            pubkey, upstream.interface
                        )));
                    }
                }
            }
        }
    }

    async fn establish_once(
        &self,
        upstream: &UpstreamTollgate,
        handler: &Weak<dyn RenewalHandler>,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> TollGateResult<()> {
        let ad = &upstream.advertisement;
        if ad.step_size == 0 {
            return Err(TollGateError::InvalidAdvertisement(
                "Step size cannot be zero".to_string(),
            ));
        }

        let accepted = self.merchant.accepted_mints().await;
        let pricing = select_compatible_pricing(&ad.pricing_options, &accepted)?;

        let balance = self.merchant.balance_by_mint(&pricing.mint_url).await?;
        let min_cost = pricing.min_steps * pricing.price_per_step;
        if balance < min_cost {
            return Err(TollGateError::InsufficientFunds {
                needed: min_cost,
                available: balance,
                unit: pricing.price_unit.clone(),
            });
        }

        let preferred = self.preferred_increment(ad.metric);
        let steps = (preferred / ad.step_size)
            .max(pricing.min_steps)
            .min(balance / pricing.price_per_step);
        if steps == 0 {
            return Err(TollGateError::ZeroAffordableSteps);
        }

        self.check_price_ceiling(&pricing, ad.metric, ad.step_size)?;

        // Fresh identity for this session only.
        let customer_keys = Keys::generate();

        let proposal = PaymentProposal {
            tollgate_pubkey: ad.tollgate_pubkey.clone(),
            steps,
            pricing: pricing.clone(),
            reason: PaymentReason::Initial,
            estimated_allotment: calculate_allotment(steps, ad.step_size),
        };

        let grant = self
            .payment
            .pay(
                self.merchant.as_ref(),
                upstream.gateway_ip,
                &upstream.mac_address,
                &customer_keys,
                &proposal,
                cancel_rx,
            )
            .await?;

        let cost = calculate_cost(&pricing, steps);
        let session = Session::new(SessionParams {
            upstream: upstream.clone(),
            pricing_option: pricing,
            customer_keys,
            initial_allotment: grant.allotment,
            initial_cost: cost,
            renewal_offset: self.renewal_offset(ad.metric),
        });

        let mut tracker = build_tracker(&session, handler.clone(), self.tollgate_port);
        tracker.start(&session)?;

        let (cancel, _) = watch::channel(false);
        let entry = Arc::new(SessionEntry {
            interface: session.interface.clone(),
            session: Mutex::new(session.clone()),
            tracker: Mutex::new(Some(tracker)),
            payment_gate: Mutex::new(()),
            cancel,
        });

        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&ad.tollgate_pubkey) {
                // Lost an establishment race; ours is redundant.
                drop(sessions);
                self.stop_entry_tracker(&entry).await;
                return Ok(());
            }
            sessions.insert(ad.tollgate_pubkey.clone(), entry);
        }

        log::info!(
            "Session {} established: upstream={} interface={} gateway={} allotment={} {} spent={} {}",
            session.id,
            ad.tollgate_pubkey,
            upstream.interface,
            upstream.gateway_ip,
            grant.allotment,
            ad.metric,
            cost,
            session.pricing_option.price_unit
        );
        Ok(())
    }

    async fn renew(&self, tollgate_pubkey: &str, current_usage: u64) -> TollGateResult<()> {
        let entry = self.lookup(tollgate_pubkey).await?;

        // One payment loop per session at a time.
        let _payment_permit = entry.payment_gate.lock().await;

        let snapshot = {
            let session = entry.session.lock().await;
            if session.status != SessionStatus::Active {
                return Err(TollGateError::session(format!(
                    "Session with {} is {:?}, not renewing",
                    tollgate_pubkey, session.status
                )));
            }
            session.clone()
        };

        // TODO: fetch the current advertisement and compare before paying;
        // until then renewals reuse the one the session was established with.
        let ad = &snapshot.advertisement;
        let pricing = snapshot.pricing_option.clone();
        let steps = self.preferred_increment(ad.metric) / ad.step_size;

        if let Err(e) = self.validate_renewal_budget(&pricing, ad.metric, ad.step_size, steps).await
        {
            log::warn!(
                "Renewal budget check for {} failed: {}; pausing session",
                tollgate_pubkey,
                e
            );
            self.pause_entry(&entry).await?;
            return Err(e);
        }

        let customer_keys = snapshot.customer_keys()?;
        let proposal = PaymentProposal {
            tollgate_pubkey: tollgate_pubkey.to_string(),
            steps,
            pricing: pricing.clone(),
            reason: PaymentReason::Renewal,
            estimated_allotment: calculate_allotment(steps, ad.step_size),
        };

        let mut cancel_rx = entry.cancel.subscribe();
        let grant = self
            .payment
            .pay(
                self.merchant.as_ref(),
                snapshot.gateway_ip,
                &snapshot.mac_address,
                &customer_keys,
                &proposal,
                &mut cancel_rx,
            )
            .await?;

        let cost = calculate_cost(&pricing, steps);
        let updated = {
            let mut session = entry.session.lock().await;
            session.current_usage = current_usage;
            session.apply_renewal(grant.allotment, cost);
            session.clone()
        };

        if let Some(tracker) = entry.tracker.lock().await.as_ref() {
            tracker.session_changed(&updated);
        }

        log::info!(
            "Session {} renewed: upstream={} allotment={} spent_total={} payments={}",
            updated.id,
            tollgate_pubkey,
            updated.total_allotment,
            updated.total_spent,
            updated.payment_count
        );
        Ok(())
    }

    async fn validate_renewal_budget(
        &self,
        pricing: &PricingOption,
        metric: Metric,
        step_size: u64,
        steps: u64,
    ) -> TollGateResult<()> {
        if steps == 0 {
            return Err(TollGateError::ZeroAffordableSteps);
        }

        self.check_price_ceiling(pricing, metric, step_size)?;

        let needed = calculate_cost(pricing, steps);
        let balance = self.merchant.balance_by_mint(&pricing.mint_url).await?;
        if balance < needed {
            return Err(TollGateError::InsufficientFunds {
                needed,
                available: balance,
                unit: pricing.price_unit.clone(),
            });
        }

        Ok(())
    }

    fn check_price_ceiling(
        &self,
        pricing: &PricingOption,
        metric: Metric,
        step_size: u64,
    ) -> TollGateResult<()> {
        let price_per_unit = pricing.price_per_step as f64 / step_size as f64;
        let ceiling = match metric {
            Metric::Milliseconds => self.config.max_price_per_millisecond,
            Metric::Bytes => self.config.max_price_per_byte,
        };

        if price_per_unit > ceiling {
            return Err(TollGateError::PriceCeilingExceeded {
                price_per_unit,
                ceiling,
            });
        }
        Ok(())
    }

    fn preferred_increment(&self, metric: Metric) -> u64 {
        match metric {
            Metric::Milliseconds => {
                self.config
                    .sessions
                    .preferred_session_increments_milliseconds
            }
            Metric::Bytes => self.config.sessions.preferred_session_increments_bytes,
        }
    }

    fn renewal_offset(&self, metric: Metric) -> u64 {
        match metric {
            Metric::Milliseconds => self.config.sessions.renewal_offset_milliseconds,
            Metric::Bytes => self.config.sessions.renewal_offset_bytes,
        }
    }

    async fn pause_entry(&self, entry: &Arc<SessionEntry>) -> TollGateResult<()> {
        self.stop_entry_tracker(entry).await;
        let mut session = entry.session.lock().await;
        session.transition(SessionStatus::Paused)?;
        log::info!("Session {} paused", session.id);
        Ok(())
    }

    /// Stop and drop the entry's tracker, folding its final usage reading
    /// back into the session.
    async fn stop_entry_tracker(&self, entry: &Arc<SessionEntry>) {
        let mut slot = entry.tracker.lock().await;
        if let Some(mut tracker) = slot.take() {
            let usage = tracker.current_usage();
            tracker.stop().await;
            entry.session.lock().await.current_usage = usage;
        }
    }

    async fn snapshot_entry(&self, entry: &Arc<SessionEntry>) -> SessionInfo {
        let mut session = entry.session.lock().await.clone();
        if let Some(tracker) = entry.tracker.lock().await.as_ref() {
            session.current_usage = tracker.current_usage();
        }
        session.snapshot()
    }
}

#[async_trait]
impl RenewalHandler for ChandlerInner {
    async fn handle_upcoming_renewal(&self, tollgate_pubkey: &str, current_usage: u64) {
        log::debug!(
            "Renewal requested for {} at usage {}",
            tollgate_pubkey,
            current_usage
        );
        if let Err(e) = self.renew(tollgate_pubkey, current_usage).await {
            log::error!("Renewal for {} failed: {}", tollgate_pubkey, e);
        }
    }
}

/// Keep options whose `(mint, unit)` the merchant accepts; cheapest wins.
fn select_compatible_pricing(
    options: &[PricingOption],
    accepted: &[AcceptedMint],
) -> TollGateResult<PricingOption> {
    options
        .iter()
        .filter(|option| {
            accepted
                .iter()
                .any(|mint| mint.url == option.mint_url && mint.price_unit == option.price_unit)
        })
        .min_by_key(|option| option.price_per_step)
        .cloned()
        .ok_or(TollGateError::NoCompatiblePricing)
}
