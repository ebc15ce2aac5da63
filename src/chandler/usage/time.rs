//! Time-based usage tracking
//!
//! Usage is simply elapsed wall time since the tracker started, on top of
//! whatever the session had already consumed before a pause. A single timer
//! fires at `total_allotment - renewal_offset`; a renewal that lands re-arms
//! it through `session_changed`.

use crate::chandler::session::Session;
use crate::chandler::usage::{RenewalHandler, UsageTracker};
use crate::errors::TollGateResult;
use async_trait::async_trait;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub struct TimeTracker {
    handler: Weak<dyn RenewalHandler>,
    tollgate_pubkey: String,
    renewal_offset: u64,
    /// Usage carried over from before this tracker instance started.
    base_usage: u64,
    started_at: Option<Instant>,
    allotment_tx: watch::Sender<u64>,
    timer: Option<JoinHandle<()>>,
}

impl TimeTracker {
    pub fn new(session: &Session, handler: Weak<dyn RenewalHandler>) -> Self {
        let (allotment_tx, _) = watch::channel(session.total_allotment);

        Self {
            handler,
            tollgate_pubkey: session.tollgate_pubkey.clone(),
            renewal_offset: session.renewal_offset,
            base_usage: session.current_usage,
            started_at: None,
            allotment_tx,
            timer: None,
        }
    }
}

#[async_trait]
impl UsageTracker for TimeTracker {
    fn start(&mut self, session: &Session) -> TollGateResult<()> {
        let started_at = Instant::now();
        self.base_usage = session.current_usage;
        self.started_at = Some(started_at);
        let _ = self.allotment_tx.send(session.total_allotment);

        self.timer = Some(tokio::spawn(timer_loop(
            self.handler.clone(),
            self.tollgate_pubkey.clone(),
            self.renewal_offset,
            self.base_usage,
            started_at,
            self.allotment_tx.subscribe(),
        )));

        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
            let _ = timer.await;
        }
    }

    fn current_usage(&self) -> u64 {
        match self.started_at {
            Some(started_at) => self.base_usage + started_at.elapsed().as_millis() as u64,
            None => self.base_usage,
        }
    }

    fn session_changed(&self, session: &Session) {
        let _ = self.allotment_tx.send(session.total_allotment);
    }
}

async fn timer_loop(
    handler: Weak<dyn RenewalHandler>,
    tollgate_pubkey: String,
    renewal_offset: u64,
    base_usage: u64,
    started_at: Instant,
    mut allotment_rx: watch::Receiver<u64>,
) {
    loop {
        let allotment = *allotment_rx.borrow_and_update();
        // The renewal point in elapsed time: usage reaches
        // allotment - renewal_offset. Already-past deadlines fire at once.
        let target_usage = allotment.saturating_sub(renewal_offset);
        let deadline =
            started_at + Duration::from_millis(target_usage.saturating_sub(base_usage));

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                let usage = base_usage + started_at.elapsed().as_millis() as u64;
                let handler = handler.clone();
                let pubkey = tollgate_pubkey.clone();
                tokio::spawn(async move {
                    let Some(handler) = handler.upgrade() else { return };
                    handler.handle_upcoming_renewal(&pubkey, usage).await;
                });

                // Stay quiet until a renewal moves the allotment.
                if allotment_rx.changed().await.is_err() {
                    break;
                }
            }
            changed = allotment_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chandler::session::testing::test_session;
    use crate::protocol::Metric;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct RecordingHandler {
        tx: mpsc::UnboundedSender<(String, u64)>,
    }

    #[async_trait]
    impl RenewalHandler for RecordingHandler {
        async fn handle_upcoming_renewal(&self, tollgate_pubkey: &str, current_usage: u64) {
            let _ = self.tx.send((tollgate_pubkey.to_string(), current_usage));
        }
    }

    fn handler() -> (Arc<RecordingHandler>, mpsc::UnboundedReceiver<(String, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingHandler { tx }), rx)
    }

    #[tokio::test]
    async fn test_timer_fires_at_renewal_point() {
        let mut session = test_session("upstream", Metric::Milliseconds);
        session.total_allotment = 250;
        session.renewal_offset = 50;

        let (recording, mut rx) = handler();
        let recording_dyn: Arc<dyn RenewalHandler> = recording.clone();
        let weak: Weak<dyn RenewalHandler> = Arc::downgrade(&recording_dyn);
        let mut tracker = TimeTracker::new(&session, weak);
        tracker.start(&session).unwrap();

        let (pubkey, usage) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("renewal was never requested")
            .unwrap();
        assert_eq!(pubkey, "upstream");
        // Fired at or after the 200 ms renewal point.
        assert!(usage >= 200);

        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_past_due_session_change_fires_immediately() {
        let mut session = test_session("upstream", Metric::Milliseconds);
        // Plenty of allotment at start; the timer sits far in the future.
        session.total_allotment = 3_600_000;
        session.renewal_offset = 50;
        session.current_usage = 80;

        let (recording, mut rx) = handler();
        let recording_dyn: Arc<dyn RenewalHandler> = recording.clone();
        let weak: Weak<dyn RenewalHandler> = Arc::downgrade(&recording_dyn);
        let mut tracker = TimeTracker::new(&session, weak);
        tracker.start(&session).unwrap();

        assert!(rx.try_recv().is_err());

        // Renewal point of the updated allotment (120 - 50 = 70) is already
        // behind the 80 ms the session has consumed.
        session.total_allotment = 120;
        tracker.session_changed(&session);

        let (_, usage) = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("past-due renewal point did not fire")
            .unwrap();
        assert!(usage >= 80);

        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_usage_accumulates_on_top_of_base() {
        let mut session = test_session("upstream", Metric::Milliseconds);
        session.current_usage = 1_000;

        let (recording, _rx) = handler();
        let recording_dyn: Arc<dyn RenewalHandler> = recording.clone();
        let weak: Weak<dyn RenewalHandler> = Arc::downgrade(&recording_dyn);
        let mut tracker = TimeTracker::new(&session, weak);
        tracker.start(&session).unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let usage = tracker.current_usage();
        assert!(usage >= 1_040, "usage was {}", usage);

        tracker.stop().await;
    }
}
