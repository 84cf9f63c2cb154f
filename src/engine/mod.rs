//! The termination engine: a single mutex-protected core owning the TCP/IP
//! state machines, both flow tables, and the listening-socket pool. The
//! stack lock is held only for short mutations and never across a handler
//! callback; handler traffic moves through per-flow channels instead.

pub(crate) mod checksum;
pub(crate) mod packet_builder;
mod state;
mod tcp;
mod udp;
#[cfg(test)]
mod tests;

pub use state::{TcpState, UdpState};
pub use tcp::TcpFlow;
pub use udp::UdpFlow;

pub(crate) use state::FourTuple;
pub(crate) use tcp::{spawn_tcp_flow, TcpIngress};
pub(crate) use udp::{close_udp_for_error, spawn_udp_flow, UdpIngress};

use crate::device::TunDevice;
use crate::handler::UdpHandler;
use crate::Shared;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer as TcpSocketBuffer};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, Ipv4Address, Ipv6Address};
use state::{TcpEntry, UdpEntry, TCP_RX_BUFFER_SIZE, TCP_SOCKET_COUNT, TCP_TX_BUFFER_SIZE};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Point-in-time snapshot of the stack's event counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct StackCounters {
    pub tcp_flows_accepted: u64,
    pub udp_flows_accepted: u64,
    /// Gauge: TCP flows currently registered in the flow table.
    pub tcp_flows_active: u64,
    /// Gauge: UDP pseudo-flows currently registered.
    pub udp_flows_active: u64,
    /// SYNs dropped because the listening-socket pool was exhausted.
    pub tcp_admission_failures: u64,
    /// Datagrams dropped because a Connecting flow's single slot was taken.
    pub udp_pending_dropped: u64,
    /// Times a `TcpFlow::write` found no send-buffer space and stalled.
    pub writes_stalled: u64,
    pub malformed_packets: u64,
    /// Non-SYN segments that arrived for unknown 4-tuples (answered RST).
    pub stray_tcp_segments: u64,
    pub icmp_echoes: u64,
}

/// Point-in-time snapshot of the stack's volume statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct StackStats {
    pub poll_iterations: u64,
    pub frames_emitted: u64,
    pub bytes_emitted: u64,
    /// Bytes handed to TCP handlers via `did_receive`.
    pub bytes_delivered: u64,
    pub udp_datagrams_out: u64,
}

pub(crate) struct Engine {
    pub(super) shared: Arc<Shared>,
    pub(super) weak_self: Weak<Mutex<Engine>>,
    pub(super) interface: Interface,
    pub(super) sockets: SocketSet<'static>,
    pub(super) device: TunDevice,
    pub(super) tcp_pool: Vec<SocketHandle>,
    pub(super) tcp_flows: FxHashMap<u32, TcpEntry>,
    pub(super) tuple_index: FxHashMap<FourTuple, u32>,
    pub(super) udp_flows: FxHashMap<state::UdpKey, UdpEntry>,
    pub(super) counters: StackCounters,
    pub(super) stats: StackStats,
}

impl Engine {
    pub(crate) fn new(mut device: TunDevice, shared: Arc<Shared>) -> Self {
        let ipv4_addr = Ipv4Address::new(10, 0, 0, 1);
        let ipv6_addr = Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 1);

        let mut config = IfaceConfig::new(HardwareAddress::Ip);
        config.random_seed = rand::random();
        let mut interface = Interface::new(config, &mut device, SmolInstant::from_millis(0));
        interface.set_any_ip(true);
        interface.update_ip_addrs(|ip_addrs| {
            ip_addrs.clear();
            let _ = ip_addrs.push(IpCidr::new(IpAddress::Ipv4(ipv4_addr), 24));
            let _ = ip_addrs.push(IpCidr::new(IpAddress::Ipv6(ipv6_addr), 64));
        });
        {
            let routes = interface.routes_mut();
            routes.add_default_ipv4_route(ipv4_addr).ok();
            routes.add_default_ipv6_route(ipv6_addr).ok();
        }

        let mut sockets = SocketSet::new(Vec::new());
        let mut tcp_pool = Vec::with_capacity(TCP_SOCKET_COUNT);
        for _ in 0..TCP_SOCKET_COUNT {
            let socket = TcpSocket::new(
                TcpSocketBuffer::new(vec![0; TCP_RX_BUFFER_SIZE]),
                TcpSocketBuffer::new(vec![0; TCP_TX_BUFFER_SIZE]),
            );
            let handle = sockets.add(socket);
            tcp_pool.push(handle);
        }

        Self {
            shared,
            weak_self: Weak::new(),
            interface,
            sockets,
            device,
            tcp_pool,
            tcp_flows: FxHashMap::default(),
            tuple_index: FxHashMap::default(),
            udp_flows: FxHashMap::default(),
            counters: StackCounters::default(),
            stats: StackStats::default(),
        }
    }

    /// Flow handles keep a weak reference back to the engine; the engine
    /// learns its own address once the owning Arc exists.
    pub(crate) fn bind_self(&mut self, weak: Weak<Mutex<Engine>>) {
        self.weak_self = weak;
    }

    /// One engine pass: run the TCP/IP state machines, then move every
    /// observable consequence (received bytes, half-closes, teardowns)
    /// toward the flow threads.
    pub(crate) fn poll(&mut self, now: SmolInstant) {
        self.stats.poll_iterations = self.stats.poll_iterations.saturating_add(1);
        self.interface.poll(now, &mut self.device, &mut self.sockets);
        self.reconcile_sockets();
        self.drain_tcp_rx();
        self.notify_tcp_state();
        self.finalize_closed_flows();
    }

    /// Flow-level poll pass, run every `tcp_poll_interval_ticks` ticks.
    /// Returns the UDP flows whose idle timeout fired; their handlers are
    /// notified by the caller after the stack lock is released.
    pub(crate) fn poll_flows(&mut self, now: Instant) -> Vec<(UdpFlow, Arc<dyn UdpHandler>)> {
        self.reap_stale_accepts(now);
        self.finalize_closed_flows();
        self.prune_idle_udp(now)
    }

    pub(crate) fn note_emitted(&mut self, frames: u64, bytes: u64) {
        self.stats.frames_emitted = self.stats.frames_emitted.saturating_add(frames);
        self.stats.bytes_emitted = self.stats.bytes_emitted.saturating_add(bytes);
    }

    pub(crate) fn note_malformed(&mut self) {
        self.counters.malformed_packets += 1;
    }

    pub(crate) fn note_icmp_echo(&mut self) {
        self.counters.icmp_echoes += 1;
    }

    pub(crate) fn counters(&self) -> StackCounters {
        StackCounters {
            tcp_flows_active: self.tcp_flows.len() as u64,
            udp_flows_active: self.udp_flows.len() as u64,
            ..self.counters
        }
    }

    pub(crate) fn stats(&self) -> StackStats {
        self.stats
    }
}
