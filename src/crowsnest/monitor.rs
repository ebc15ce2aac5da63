//! Kernel-driven network interface monitor
//!
//! Subscribes to rtnetlink link and address notifications and turns them into
//! a deduplicated stream of `NetworkEvent`s. Also answers point queries about
//! the current interface set and the default gateway of an interface, which is
//! resolved from the route table or, failing that, inferred from the IPv4
//! network.

use crate::config::CrowsnestConfig;
use crate::errors::{TollGateError, TollGateResult};
use chrono::{DateTime, Utc};
use futures_util::stream::{StreamExt, TryStreamExt};
use ipnetwork::Ipv4Network;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
use netlink_packet_route::route::{RouteAddress, RouteAttribute};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::AsyncSocket;
use rtnetlink::constants::{RTMGRP_IPV4_IFADDR, RTMGRP_IPV6_IFADDR, RTMGRP_LINK};
use rtnetlink::{Handle, RouteMessageBuilder};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Buffered event slots between the monitor and its consumer.
const EVENT_CHANNEL_CAPACITY: usize = 128;
/// Minimum spacing between identical events for one interface.
const THROTTLE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NetworkEventType {
    InterfaceUp,
    InterfaceDown,
    AddressAdded,
    AddressDeleted,
}

impl NetworkEventType {
    /// Down and delete events drive cleanup and must never be dropped by the
    /// throttle.
    fn throttle_exempt(&self) -> bool {
        matches!(
            self,
            NetworkEventType::InterfaceDown | NetworkEventType::AddressDeleted
        )
    }
}

/// One assigned address with its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InterfaceAddress {
    pub ip: IpAddr,
    pub prefix_len: u8,
}

/// Immutable snapshot of an interface at event time.
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub index: u32,
    pub mac_address: Option<String>,
    pub addresses: Vec<InterfaceAddress>,
    pub is_up: bool,
    pub is_loopback: bool,
    pub is_point_to_point: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkEvent {
    pub event_type: NetworkEventType,
    pub interface: String,
    pub info: Option<InterfaceInfo>,
    pub gateway: Option<IpAddr>,
    pub timestamp: DateTime<Utc>,
}

struct RunningState {
    shared: Arc<MonitorShared>,
    workers: Vec<JoinHandle<()>>,
    conn_tasks: Vec<JoinHandle<()>>,
    stop_tx: watch::Sender<bool>,
}

pub struct NetworkMonitor {
    config: CrowsnestConfig,
    state: Mutex<Option<RunningState>>,
    events_rx: std::sync::Mutex<Option<mpsc::Receiver<NetworkEvent>>>,
}

impl NetworkMonitor {
    pub fn new(config: CrowsnestConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
            events_rx: std::sync::Mutex::new(None),
        }
    }

    /// Take the consumer side of the event stream opened by the last
    /// `start()`. Yields once per start; the stream closes on `stop()`.
    pub fn events(&self) -> Option<mpsc::Receiver<NetworkEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Open the link and address subscriptions and spawn one consumer per
    /// subscription. Errors when already running.
    pub async fn start(&self) -> TollGateResult<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(TollGateError::AlreadyRunning);
        }

        let (mut link_conn, handle, link_messages) = rtnetlink::new_connection()
            .map_err(|e| TollGateError::monitor(format!("Link subscription failed: {}", e)))?;
        link_conn
            .socket_mut()
            .socket_mut()
            .bind(&netlink_sys::SocketAddr::new(0, RTMGRP_LINK))
            .map_err(|e| TollGateError::monitor(format!("Link group bind failed: {}", e)))?;

        let (mut addr_conn, _addr_handle, addr_messages) = rtnetlink::new_connection()
            .map_err(|e| TollGateError::monitor(format!("Address subscription failed: {}", e)))?;
        addr_conn
            .socket_mut()
            .socket_mut()
            .bind(&netlink_sys::SocketAddr::new(
                0,
                RTMGRP_IPV4_IFADDR | RTMGRP_IPV6_IFADDR,
            ))
            .map_err(|e| TollGateError::monitor(format!("Address group bind failed: {}", e)))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        *self.events_rx.lock().unwrap() = Some(events_rx);

        let shared = Arc::new(MonitorShared {
            config: self.config.clone(),
            events_tx,
            throttle: Mutex::new(HashMap::new()),
            handle,
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let conn_tasks = vec![tokio::spawn(link_conn), tokio::spawn(addr_conn)];
        let workers = vec![
            tokio::spawn(run_subscription(
                shared.clone(),
                link_messages,
                stop_rx.clone(),
            )),
            tokio::spawn(run_subscription(shared.clone(), addr_messages, stop_rx)),
        ];

        *state = Some(RunningState {
            shared,
            workers,
            conn_tasks,
            stop_tx,
        });

        log::info!("Network monitor started");
        Ok(())
    }

    /// Signal the consumers, join them, then tear down the netlink drivers.
    pub async fn stop(&self) {
        let Some(state) = self.state.lock().await.take() else {
            return;
        };

        let _ = state.stop_tx.send(true);
        for worker in state.workers {
            let _ = worker.await;
        }
        for conn in state.conn_tasks {
            conn.abort();
        }
        log::info!("Network monitor stopped");
    }

    /// Snapshot of every interface passing the configured filters.
    pub async fn current_interfaces(&self) -> TollGateResult<Vec<InterfaceInfo>> {
        let shared = self.shared().await?;
        shared.current_interfaces().await
    }

    /// Best-effort default gateway for `interface`.
    pub async fn gateway_for_interface(&self, interface: &str) -> TollGateResult<Option<IpAddr>> {
        let shared = self.shared().await?;
        Ok(shared.gateway_for_interface(interface).await)
    }

    async fn shared(&self) -> TollGateResult<Arc<MonitorShared>> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|s| s.shared.clone())
            .ok_or_else(|| TollGateError::monitor("Monitor is not running"))
    }
}

async fn run_subscription(
    shared: Arc<MonitorShared>,
    mut messages: futures_channel::mpsc::UnboundedReceiver<(
        NetlinkMessage<RouteNetlinkMessage>,
        netlink_sys::SocketAddr,
    )>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            maybe = messages.next() => {
                let Some((message, _source)) = maybe else { break };
                if let NetlinkPayload::InnerMessage(inner) = message.payload {
                    shared.dispatch(inner).await;
                }
            }
        }
    }
}

struct MonitorShared {
    config: CrowsnestConfig,
    events_tx: mpsc::Sender<NetworkEvent>,
    throttle: Mutex<HashMap<(String, NetworkEventType), Instant>>,
    handle: Handle,
}

impl MonitorShared {
    async fn dispatch(&self, message: RouteNetlinkMessage) {
        match message {
            RouteNetlinkMessage::NewLink(link) => self.handle_link(link, false).await,
            RouteNetlinkMessage::DelLink(link) => self.handle_link(link, true).await,
            RouteNetlinkMessage::NewAddress(addr) => self.handle_address(addr, false).await,
            RouteNetlinkMessage::DelAddress(addr) => self.handle_address(addr, true).await,
            _ => {}
        }
    }

    async fn handle_link(&self, link: LinkMessage, deleted: bool) {
        let Some(name) = link_name(&link) else {
            log::debug!("Link message without interface name, dropping");
            return;
        };
        if !interface_allowed(&self.config, &name) {
            return;
        }

        let up = !deleted && link.header.flags.contains(LinkFlags::Up);
        let event_type = if up {
            NetworkEventType::InterfaceUp
        } else {
            NetworkEventType::InterfaceDown
        };

        let (info, gateway) = if up {
            let addresses = self.addresses_for_index(link.header.index).await;
            let gateway = self.gateway_for_link(link.header.index, &addresses).await;
            (interface_info(&link, addresses), gateway)
        } else {
            (interface_info(&link, Vec::new()), None)
        };

        self.emit(NetworkEvent {
            event_type,
            interface: name,
            info,
            gateway,
            timestamp: Utc::now(),
        })
        .await;
    }

    async fn handle_address(&self, address: AddressMessage, deleted: bool) {
        let index = address.header.index;
        let Some(link) = self.link_by_index(index).await else {
            // The link can disappear between the address notification and our
            // lookup; a link-down event follows and carries the cleanup.
            log::debug!(
                "Address event for unknown link index {}, suppressing",
                index
            );
            return;
        };

        let Some(name) = link_name(&link) else {
            return;
        };
        if !interface_allowed(&self.config, &name) {
            return;
        }

        let event_type = if deleted {
            NetworkEventType::AddressDeleted
        } else {
            NetworkEventType::AddressAdded
        };

        let (info, gateway) = if deleted {
            (interface_info(&link, Vec::new()), None)
        } else {
            let addresses = self.addresses_for_index(index).await;
            let gateway = self.gateway_for_link(index, &addresses).await;
            (interface_info(&link, addresses), gateway)
        };

        self.emit(NetworkEvent {
            event_type,
            interface: name,
            info,
            gateway,
            timestamp: Utc::now(),
        })
        .await;
    }

    async fn emit(&self, event: NetworkEvent) {
        if !event.event_type.throttle_exempt() {
            let mut throttle = self.throttle.lock().await;
            if !throttle_permits(
                &mut throttle,
                &event.interface,
                event.event_type,
                Instant::now(),
            ) {
                log::debug!(
                    "Throttled {:?} for {} within {:?}",
                    event.event_type,
                    event.interface,
                    THROTTLE_INTERVAL
                );
                return;
            }
        }

        if self.events_tx.try_send(event).is_err() {
            log::warn!("Network event channel full, dropping newest event");
        }
    }

    async fn current_interfaces(&self) -> TollGateResult<Vec<InterfaceInfo>> {
        let mut links = self.handle.link().get().execute();
        let mut interfaces = Vec::new();

        loop {
            let link = match links.try_next().await {
                Ok(Some(link)) => link,
                Ok(None) => break,
                Err(e) => {
                    return Err(TollGateError::monitor(format!("Link dump failed: {}", e)))
                }
            };

            let Some(name) = link_name(&link) else {
                continue;
            };
            if !interface_allowed(&self.config, &name) {
                continue;
            }

            let addresses = self.addresses_for_index(link.header.index).await;
            if let Some(info) = interface_info(&link, addresses) {
                interfaces.push(info);
            }
        }

        Ok(interfaces)
    }

    async fn gateway_for_interface(&self, interface: &str) -> Option<IpAddr> {
        let link = self.link_by_name(interface).await?;
        let addresses = self.addresses_for_index(link.header.index).await;
        self.gateway_for_link(link.header.index, &addresses).await
    }

    /// Route-table lookup first, network inference second.
    async fn gateway_for_link(
        &self,
        index: u32,
        addresses: &[InterfaceAddress],
    ) -> Option<IpAddr> {
        if let Some(gateway) = self.default_route_gateway(index).await {
            return Some(IpAddr::V4(gateway));
        }

        for address in addresses {
            if let IpAddr::V4(ip) = address.ip {
                if let Some(gateway) = infer_gateway_from_network(ip, address.prefix_len) {
                    log::debug!(
                        "Inferred gateway {} for link {} from {}/{}",
                        gateway,
                        index,
                        ip,
                        address.prefix_len
                    );
                    return Some(IpAddr::V4(gateway));
                }
            }
        }

        None
    }

    /// First default route whose output interface matches `index`.
    async fn default_route_gateway(&self, index: u32) -> Option<Ipv4Addr> {
        let request = RouteMessageBuilder::<Ipv4Addr>::new().build();
        let mut routes = self.handle.route().get(request).execute();

        loop {
            let route = match routes.try_next().await {
                Ok(Some(route)) => route,
                _ => return None,
            };

            if route.header.destination_prefix_length != 0 {
                continue;
            }

            let mut oif = None;
            let mut gateway = None;
            for attr in &route.attributes {
                match attr {
                    RouteAttribute::Oif(i) => oif = Some(*i),
                    RouteAttribute::Gateway(RouteAddress::Inet(ip)) => gateway = Some(*ip),
                    _ => {}
                }
            }

            if oif == Some(index) {
                if let Some(gateway) = gateway {
                    return Some(gateway);
                }
            }
        }
    }

    async fn link_by_index(&self, index: u32) -> Option<LinkMessage> {
        let mut links = self.handle.link().get().match_index(index).execute();
        links.try_next().await.ok().flatten()
    }

    async fn link_by_name(&self, name: &str) -> Option<LinkMessage> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        links.try_next().await.ok().flatten()
    }

    async fn addresses_for_index(&self, index: u32) -> Vec<InterfaceAddress> {
        let mut dump = self.handle.address().get().execute();
        let mut addresses = Vec::new();

        loop {
            let message = match dump.try_next().await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    log::debug!("Address dump failed: {}", e);
                    break;
                }
            };

            if message.header.index != index {
                continue;
            }

            for attr in &message.attributes {
                if let AddressAttribute::Address(ip) = attr {
                    addresses.push(InterfaceAddress {
                        ip: *ip,
                        prefix_len: message.header.prefix_len,
                    });
                }
            }
        }

        addresses
    }
}

fn link_name(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.clone()),
        _ => None,
    })
}

fn interface_info(link: &LinkMessage, addresses: Vec<InterfaceAddress>) -> Option<InterfaceInfo> {
    let name = link_name(link)?;
    let mac_address = link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Address(bytes) => Some(format_mac(bytes)),
        _ => None,
    });

    Some(InterfaceInfo {
        name,
        index: link.header.index,
        mac_address,
        addresses,
        is_up: link.header.flags.contains(LinkFlags::Up),
        is_loopback: link.header.flags.contains(LinkFlags::Loopback),
        is_point_to_point: link.header.flags.contains(LinkFlags::Pointopoint),
    })
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Interface name filter: explicit ignores, LAN bridges, then the optional
/// allowlist.
fn interface_allowed(config: &CrowsnestConfig, name: &str) -> bool {
    if config.ignore_interfaces.iter().any(|i| i == name) {
        return false;
    }
    if name.starts_with("br-") {
        return false;
    }
    if !config.only_interfaces.is_empty() {
        return config.only_interfaces.iter().any(|i| i == name);
    }
    true
}

fn throttle_permits(
    throttle: &mut HashMap<(String, NetworkEventType), Instant>,
    interface: &str,
    event_type: NetworkEventType,
    now: Instant,
) -> bool {
    let key = (interface.to_string(), event_type);
    if let Some(last) = throttle.get(&key) {
        if now.duration_since(*last) < THROTTLE_INTERVAL {
            return false;
        }
    }
    throttle.insert(key, now);
    true
}

/// Guess the gateway of a network without a route entry: try the first and
/// last usable host addresses, skipping our own.
fn infer_gateway_from_network(ip: Ipv4Addr, prefix_len: u8) -> Option<Ipv4Addr> {
    let network = Ipv4Network::new(ip, prefix_len).ok()?;
    let base = u32::from(network.network());
    let broadcast = u32::from(network.broadcast());

    for raw in [base.wrapping_add(1), broadcast.wrapping_sub(1)] {
        let candidate = Ipv4Addr::from(raw);
        if candidate == ip || raw == base || raw == broadcast {
            continue;
        }
        if network.contains(candidate) {
            return Some(candidate);
        }
    }

    None
}
