//! Data-based usage tracking
//!
//! Byte counts are not push-delivered, so this tracker polls at 1 Hz: the
//! host's interface counters for local usage, and the upstream's own
//! accounting endpoint for the trigger decision. An upstream answering
//! `-1/-1` has forgotten the session; that is handed to the manager as a
//! request for a fresh purchase, not as an error.

use crate::chandler::session::Session;
use crate::chandler::usage::{RenewalHandler, UsageTracker};
use crate::errors::{TollGateError, TollGateResult};
use crate::protocol::{parse_usage_report, UsageReport};
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const USAGE_POLL_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_STATS_DIR: &str = "/sys/class/net";

pub struct DataTracker {
    handler: Weak<dyn RenewalHandler>,
    tollgate_pubkey: String,
    interface: String,
    gateway: IpAddr,
    port: u16,
    renewal_offset: u64,
    stats_dir: PathBuf,
    usage: Arc<AtomicU64>,
    allotment: Arc<AtomicU64>,
    renewal_in_progress: Arc<AtomicBool>,
    stop_tx: Option<watch::Sender<bool>>,
    monitor: Option<JoinHandle<()>>,
}

impl DataTracker {
    pub fn new(session: &Session, handler: Weak<dyn RenewalHandler>, port: u16) -> Self {
        Self {
            handler,
            tollgate_pubkey: session.tollgate_pubkey.clone(),
            interface: session.interface.clone(),
            gateway: session.gateway_ip,
            port,
            renewal_offset: session.renewal_offset,
            stats_dir: PathBuf::from(DEFAULT_STATS_DIR),
            usage: Arc::new(AtomicU64::new(session.current_usage)),
            allotment: Arc::new(AtomicU64::new(session.total_allotment)),
            renewal_in_progress: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            monitor: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_stats_dir(mut self, dir: PathBuf) -> Self {
        self.stats_dir = dir;
        self
    }
}

#[async_trait]
impl UsageTracker for DataTracker {
    fn start(&mut self, session: &Session) -> TollGateResult<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        self.usage.store(session.current_usage, Ordering::SeqCst);
        self.allotment
            .store(session.total_allotment, Ordering::SeqCst);

        self.monitor = Some(tokio::spawn(monitor_loop(MonitorState {
            handler: self.handler.clone(),
            tollgate_pubkey: self.tollgate_pubkey.clone(),
            interface: self.interface.clone(),
            gateway: self.gateway,
            port: self.port,
            renewal_offset: self.renewal_offset,
            stats_dir: self.stats_dir.clone(),
            base_usage: session.current_usage,
            usage: self.usage.clone(),
            allotment: self.allotment.clone(),
            renewal_in_progress: self.renewal_in_progress.clone(),
            stop_rx,
        })));
        self.stop_tx = Some(stop_tx);

        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.await;
        }
    }

    fn current_usage(&self) -> u64 {
        self.usage.load(Ordering::SeqCst)
    }

    fn session_changed(&self, session: &Session) {
        self.allotment
            .store(session.total_allotment, Ordering::SeqCst);
        self.renewal_in_progress.store(false, Ordering::SeqCst);
    }
}

struct MonitorState {
    handler: Weak<dyn RenewalHandler>,
    tollgate_pubkey: String,
    interface: String,
    gateway: IpAddr,
    port: u16,
    renewal_offset: u64,
    stats_dir: PathBuf,
    base_usage: u64,
    usage: Arc<AtomicU64>,
    allotment: Arc<AtomicU64>,
    renewal_in_progress: Arc<AtomicBool>,
    stop_rx: watch::Receiver<bool>,
}

async fn monitor_loop(mut state: MonitorState) {
    let client = reqwest::Client::new();
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Counter values at tracker start; usage is the delta from here.
    let mut start_counters: Option<u64> = None;

    loop {
        tokio::select! {
            _ = state.stop_rx.changed() => return,
            _ = interval.tick() => {}
        }

        match read_interface_counters(&state.stats_dir, &state.interface).await {
            Ok(current) => {
                let start = *start_counters.get_or_insert(current);
                let delta = if current < start {
                    // Counter reset (driver reload); restart the baseline.
                    start_counters = Some(current);
                    0
                } else {
                    current - start
                };
                state
                    .usage
                    .store(state.base_usage + delta, Ordering::SeqCst);
            }
            Err(e) => {
                log::debug!(
                    "Counter read for {} failed: {}; keeping last value",
                    state.interface,
                    e
                );
            }
        }

        match poll_upstream_usage(&client, state.gateway, state.port).await {
            Ok(UsageReport::Ended) => {
                log::info!(
                    "Upstream {} reports session ended, requesting a new one",
                    state.tollgate_pubkey
                );
                trigger_renewal(&state, 0);
            }
            Ok(UsageReport::Active { usage, allotment }) => {
                if allotment.saturating_sub(usage) <= state.renewal_offset {
                    trigger_renewal(&state, state.usage.load(Ordering::SeqCst));
                }
            }
            Err(e) => {
                log::debug!(
                    "Usage poll of {} failed: {}; falling back to local counters",
                    state.gateway,
                    e
                );
                let allotment = state.allotment.load(Ordering::SeqCst);
                let usage = state.usage.load(Ordering::SeqCst);
                if allotment.saturating_sub(usage) <= state.renewal_offset {
                    trigger_renewal(&state, usage);
                }
            }
        }
    }
}

/// Fire the renewal handler once per latch period.
fn trigger_renewal(state: &MonitorState, current_usage: u64) {
    if state.renewal_in_progress.swap(true, Ordering::SeqCst) {
        return;
    }

    let handler = state.handler.clone();
    let pubkey = state.tollgate_pubkey.clone();
    tokio::spawn(async move {
        let Some(handler) = handler.upgrade() else { return };
        handler.handle_upcoming_renewal(&pubkey, current_usage).await;
    });
}

/// RX plus TX bytes for the interface.
async fn read_interface_counters(stats_dir: &std::path::Path, interface: &str) -> TollGateResult<u64> {
    let statistics = stats_dir.join(interface).join("statistics");
    let rx = read_counter(&statistics.join("rx_bytes")).await?;
    let tx = read_counter(&statistics.join("tx_bytes")).await?;
    Ok(rx + tx)
}

async fn read_counter(path: &std::path::Path) -> TollGateResult<u64> {
    let raw = tokio::fs::read_to_string(path).await?;
    raw.trim()
        .parse::<u64>()
        .map_err(|e| TollGateError::session(format!("Bad counter value in {:?}: {}", path, e)))
}

async fn poll_upstream_usage(
    client: &reqwest::Client,
    gateway: IpAddr,
    port: u16,
) -> TollGateResult<UsageReport> {
    let url = format!("http://{}:{}/usage", gateway, port);
    let response = client
        .get(&url)
        .timeout(USAGE_POLL_TIMEOUT)
        .send()
        .await?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(TollGateError::protocol(format!(
            "Usage endpoint answered with HTTP {}",
            response.status()
        )));
    }

    parse_usage_report(&response.text().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chandler::session::testing::test_session;
    use crate::protocol::Metric;
    use crate::test_http::TestServer;
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

    fn fake_stats_dir(interface: &str, rx_bytes: u64, tx_bytes: u64) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("tollgate-core-tests")
            .join(uuid::Uuid::new_v4().to_string());
        let statistics = dir.join(interface).join("statistics");
        std::fs::create_dir_all(&statistics).unwrap();
        std::fs::write(statistics.join("rx_bytes"), rx_bytes.to_string()).unwrap();
        std::fs::write(statistics.join("tx_bytes"), tx_bytes.to_string()).unwrap();
        dir
    }

    fn write_counters(dir: &std::path::Path, interface: &str, rx_bytes: u64, tx_bytes: u64) {
        let statistics = dir.join(interface).join("statistics");
        std::fs::write(statistics.join("rx_bytes"), rx_bytes.to_string()).unwrap();
        std::fs::write(statistics.join("tx_bytes"), tx_bytes.to_string()).unwrap();
    }

    fn data_session(allotment: u64, offset: u64) -> Session {
        let mut session = test_session("upstream", Metric::Bytes);
        session.total_allotment = allotment;
        session.renewal_offset = offset;
        session
    }

    #[tokio::test]
    async fn test_counter_delta_and_reset() {
        let dir = fake_stats_dir("wlan0", 1_000, 500);
        // Generous allotment and a usage server far from the trigger so only
        // the counters matter here.
        let server = TestServer::start(vec![crate::test_http::http_response(
            200,
            "OK",
            "0/1000000000",
        )])
        .await;

        let session = data_session(1_000_000_000, 1);
        let (recording, _rx) = handler();
        let recording_dyn: Arc<dyn RenewalHandler> = recording.clone();
        let weak: Weak<dyn RenewalHandler> = Arc::downgrade(&recording_dyn);
        let mut tracker = DataTracker::new(&session, weak, server.addr.port())
            .with_stats_dir(dir.clone());
        // Point the tracker at the local usage server.
        tracker.gateway = server.addr.ip();
        tracker.start(&session).unwrap();

        // First tick establishes the baseline.
        tokio::time::sleep(Duration::from_millis(1_300)).await;
        assert_eq!(tracker.current_usage(), 0);

        write_counters(&dir, "wlan0", 2_000, 700);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(tracker.current_usage(), 1_200);

        // Counters went backwards: report zero, new baseline.
        write_counters(&dir, "wlan0", 100, 50);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(tracker.current_usage(), 0);

        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_session_ended_signal_requests_new_session() {
        let dir = fake_stats_dir("wlan0", 0, 0);
        let server =
            TestServer::start(vec![crate::test_http::http_response(200, "OK", "-1/-1")]).await;

        let session = data_session(1_000_000, 1_000);
        let (recording, mut rx) = handler();
        let recording_dyn: Arc<dyn RenewalHandler> = recording.clone();
        let weak: Weak<dyn RenewalHandler> = Arc::downgrade(&recording_dyn);
        let mut tracker =
            DataTracker::new(&session, weak, server.addr.port()).with_stats_dir(dir);
        tracker.gateway = server.addr.ip();
        tracker.start(&session).unwrap();

        let (pubkey, usage) = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("ended signal did not trigger a renewal")
            .unwrap();
        assert_eq!(pubkey, "upstream");
        assert_eq!(usage, 0);

        tracker.stop().await;
    }

    #[tokio::test]
    async fn test_upstream_accounting_triggers_renewal_once() {
        let dir = fake_stats_dir("wlan0", 0, 0);
        // 95 of 100 used with an offset of 10: inside the renewal window.
        let server =
            TestServer::start(vec![crate::test_http::http_response(200, "OK", "95/100")]).await;

        let session = data_session(100, 10);
        let (recording, mut rx) = handler();
        let recording_dyn: Arc<dyn RenewalHandler> = recording.clone();
        let weak: Weak<dyn RenewalHandler> = Arc::downgrade(&recording_dyn);
        let mut tracker =
            DataTracker::new(&session, weak, server.addr.port()).with_stats_dir(dir);
        tracker.gateway = server.addr.ip();
        tracker.start(&session).unwrap();

        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("renewal window did not trigger")
            .unwrap();

        // The latch holds further triggers until session_changed.
        tokio::time::sleep(Duration::from_millis(2_200)).await;
        assert!(rx.try_recv().is_err());

        let mut renewed = data_session(200, 10);
        renewed.current_usage = 95;
        tracker.session_changed(&renewed);
        // Latch released; the still-expired window may trigger again.

        tracker.stop().await;
    }
}
