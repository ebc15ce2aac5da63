//! Crowsnest: the discovery pipeline
//!
//! Watches the network monitor's event stream, probes candidate gateways for
//! signed advertisements, validates them, and hands validated upstreams to the
//! session manager. An initial sweep shortly after start picks up interfaces
//! that were already up before the subscriptions existed.

pub mod monitor;
pub mod prober;
pub mod tracker;

use crate::chandler::session::UpstreamTollgate;
use crate::chandler::Chandler;
use crate::config::CrowsnestConfig;
use crate::errors::{TollGateError, TollGateResult};
use crate::protocol;
use chrono::Utc;
use monitor::{NetworkEvent, NetworkEventType, NetworkMonitor};
use prober::TollGateProber;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracker::{DiscoveryResult, DiscoveryTracker};

/// Delay before the initial interface sweep, covering interfaces that came up
/// before the kernel subscriptions were in place.
const SWEEP_GRACE_PERIOD: Duration = Duration::from_secs(2);

struct CrowsnestShared {
    config: CrowsnestConfig,
    monitor: Arc<NetworkMonitor>,
    prober: Arc<TollGateProber>,
    tracker: Arc<DiscoveryTracker>,
    chandler: Chandler,
}

struct RunningTasks {
    event_loop: JoinHandle<()>,
    sweep: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

pub struct Crowsnest {
    shared: Arc<CrowsnestShared>,
    state: Mutex<Option<RunningTasks>>,
}

impl Crowsnest {
    pub fn new(config: CrowsnestConfig, chandler: Chandler) -> Self {
        let monitor = Arc::new(NetworkMonitor::new(config.clone()));
        let prober = Arc::new(TollGateProber::new(config.clone()));
        let tracker = Arc::new(DiscoveryTracker::new(
            config.probe_timeout(),
            config.discovery_timeout(),
        ));

        Self {
            shared: Arc::new(CrowsnestShared {
                config,
                monitor,
                prober,
                tracker,
                chandler,
            }),
            state: Mutex::new(None),
        }
    }

    /// Start the monitor, the event loop, and the delayed initial sweep.
    pub async fn start(&self) -> TollGateResult<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(TollGateError::AlreadyRunning);
        }

        self.shared.monitor.start().await?;
        let events = self
            .shared
            .monitor
            .events()
            .ok_or_else(|| TollGateError::monitor("Event stream already taken"))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let event_loop = tokio::spawn(event_loop(
            self.shared.clone(),
            events,
            stop_rx.clone(),
        ));
        let sweep = tokio::spawn(initial_sweep(self.shared.clone(), stop_rx));

        *state = Some(RunningTasks {
            event_loop,
            sweep,
            stop_tx,
        });

        log::info!("Crowsnest started");
        Ok(())
    }

    pub async fn stop(&self) {
        let Some(tasks) = self.state.lock().await.take() else {
            return;
        };

        let _ = tasks.stop_tx.send(true);
        let _ = tasks.sweep.await;
        let _ = tasks.event_loop.await;
        self.shared.monitor.stop().await;
        log::info!("Crowsnest stopped");
    }
}

async fn event_loop(
    shared: Arc<CrowsnestShared>,
    mut events: mpsc::Receiver<NetworkEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    // Last gateway seen per interface, to tell a changed gateway from noise.
    let mut last_gateways: HashMap<String, IpAddr> = HashMap::new();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            maybe = events.recv() => {
                let Some(event) = maybe else { break };
                handle_event(&shared, &mut last_gateways, event).await;
            }
        }
    }
}

async fn handle_event(
    shared: &Arc<CrowsnestShared>,
    last_gateways: &mut HashMap<String, IpAddr>,
    event: NetworkEvent,
) {
    match event.event_type {
        NetworkEventType::InterfaceUp => {
            let Some(gateway) = event.gateway else {
                log::debug!("Interface {} up without a gateway yet", event.interface);
                return;
            };
            last_gateways.insert(event.interface.clone(), gateway);
            schedule_discovery(shared, &event, gateway);
        }
        NetworkEventType::AddressAdded => {
            let Some(gateway) = event.gateway else {
                return;
            };
            if last_gateways.get(&event.interface) == Some(&gateway) {
                return;
            }
            last_gateways.insert(event.interface.clone(), gateway);
            schedule_discovery(shared, &event, gateway);
        }
        NetworkEventType::InterfaceDown | NetworkEventType::AddressDeleted => {
            log::info!("Interface {} lost, cleaning up", event.interface);
            last_gateways.remove(&event.interface);
            shared
                .prober
                .cancel_probes_for_interface(&event.interface)
                .await;
            shared.tracker.clear_interface(&event.interface).await;
            shared.chandler.handle_disconnect(&event.interface).await;
        }
    }
}

fn schedule_discovery(shared: &Arc<CrowsnestShared>, event: &NetworkEvent, gateway: IpAddr) {
    let Some(mac) = event
        .info
        .as_ref()
        .and_then(|info| info.mac_address.clone())
    else {
        log::debug!(
            "No MAC for {}, cannot identify ourselves to a gateway",
            event.interface
        );
        return;
    };

    let shared = shared.clone();
    let interface = event.interface.clone();
    tokio::spawn(async move {
        attempt_discovery(shared, interface, mac, gateway).await;
    });
}

/// Probe one `(interface, gateway)` candidate and hand a validated upstream to
/// the session manager.
async fn attempt_discovery(
    shared: Arc<CrowsnestShared>,
    interface: String,
    mac_address: String,
    gateway: IpAddr,
) {
    if !shared
        .tracker
        .should_attempt_discovery(&interface, gateway)
        .await
    {
        return;
    }

    // Hold the slot before any awaitable work.
    shared
        .tracker
        .record_discovery(&interface, gateway, DiscoveryResult::Pending)
        .await;

    let probe = tokio::time::timeout(
        shared.config.discovery_timeout(),
        shared.prober.probe(&interface, gateway),
    )
    .await;

    let bytes = match probe {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            log::debug!("Probe of {} on {} failed: {}", gateway, interface, e);
            shared
                .tracker
                .record_discovery(&interface, gateway, DiscoveryResult::Error)
                .await;
            return;
        }
        Err(_) => {
            log::debug!("Probe of {} on {} timed out", gateway, interface);
            shared
                .tracker
                .record_discovery(&interface, gateway, DiscoveryResult::Error)
                .await;
            return;
        }
    };

    let validated = protocol::validate_advertisement_bytes(&bytes)
        .and_then(|event| {
            protocol::extract_advertisement_info(&event).map(|ad| (event, ad))
        })
        .and_then(|(event, ad)| {
            protocol::validate_advertisement(&ad)?;
            Ok((event, ad))
        });

    let (event, advertisement) = match validated {
        Ok(parts) => parts,
        Err(e) => {
            log::warn!(
                "Gateway {} on {} served an invalid advertisement: {}",
                gateway,
                interface,
                e
            );
            shared
                .tracker
                .record_discovery(&interface, gateway, DiscoveryResult::ValidationFailed)
                .await;
            return;
        }
    };

    shared
        .tracker
        .record_discovery(&interface, gateway, DiscoveryResult::Success)
        .await;
    log::info!(
        "TollGate {} discovered at {} on {}",
        advertisement.tollgate_pubkey,
        gateway,
        interface
    );

    let upstream = UpstreamTollgate {
        interface: interface.clone(),
        mac_address,
        gateway_ip: gateway,
        advertisement,
        event,
        discovered_at: Utc::now(),
    };

    if let Err(e) = shared.chandler.handle_upstream_tollgate(upstream).await {
        log::warn!(
            "Session establishment with gateway {} on {} failed: {}",
            gateway,
            interface,
            e
        );
    }
}

/// One-shot startup sweep over interfaces that predate the subscriptions.
async fn initial_sweep(shared: Arc<CrowsnestShared>, mut stop_rx: watch::Receiver<bool>) {
    tokio::select! {
        _ = stop_rx.changed() => return,
        _ = tokio::time::sleep(SWEEP_GRACE_PERIOD) => {}
    }

    let interfaces = match shared.monitor.current_interfaces().await {
        Ok(interfaces) => interfaces,
        Err(e) => {
            log::warn!("Initial interface sweep failed: {}", e);
            return;
        }
    };

    for info in interfaces {
        if !info.is_up {
            continue;
        }
        let Some(mac) = info.mac_address.clone() else {
            continue;
        };
        let gateway = match shared.monitor.gateway_for_interface(&info.name).await {
            Ok(Some(gateway)) => gateway,
            _ => {
                log::debug!("No gateway for {} during sweep", info.name);
                continue;
            }
        };

        log::debug!(
            "Sweep: scheduling discovery of {} via {}",
            gateway,
            info.name
        );
        let shared = shared.clone();
        tokio::spawn(async move {
            attempt_discovery(shared, info.name, mac, gateway).await;
        });
    }
}
