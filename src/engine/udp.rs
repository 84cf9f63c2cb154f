//! UDP pseudo-flows. Datagrams are forwarded statelessly: the first packet
//! for a new (src, dst) pair opens the flow and waits in a single slot while
//! the handler connects; return traffic is built as raw packets so the proxy
//! can forge any source the TUN impersonates.

use super::packet_builder;
use super::state::{UdpEntry, UdpKey, UdpShared, UdpState};
use super::Engine;
use crate::device::UdpDatagram;
use crate::error::StackError;
use crate::handler::UdpHandler;
use crate::Shared;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

/// What the demux should do with an inbound datagram after the table lookup.
pub(crate) enum UdpIngress {
    /// Connected flow; deliver the payload to the handler (outside the
    /// stack lock, without copying).
    Deliver(UdpFlow, Arc<dyn UdpHandler>),
    /// New flow admitted; run the handler's connect on its own thread.
    Spawn(UdpSpawn),
    /// Held in the pending slot until the flow connects.
    Buffered,
    Dropped,
}

pub(crate) struct UdpSpawn {
    pub handler: Arc<dyn UdpHandler>,
    pub flow: UdpFlow,
}

impl Engine {
    pub(crate) fn note_udp_datagram(&mut self, datagram: &UdpDatagram<'_>) -> UdpIngress {
        let key: UdpKey = (datagram.src.to_string(), datagram.dst.to_string());
        if self.udp_flows.contains_key(&key) {
            let state = {
                let entry = match self.udp_flows.get_mut(&key) {
                    Some(entry) => entry,
                    None => return UdpIngress::Dropped,
                };
                entry.last_activity = Instant::now();
                entry.shared.state()
            };
            return match state {
                UdpState::Connected => {
                    let flow = self.udp_flow_handle(&key);
                    match (flow, self.shared.udp_handler.get()) {
                        (Some(flow), Some(handler)) => {
                            UdpIngress::Deliver(flow, Arc::clone(handler))
                        }
                        _ => UdpIngress::Dropped,
                    }
                }
                UdpState::NewConn | UdpState::Connecting => {
                    let entry = match self.udp_flows.get_mut(&key) {
                        Some(entry) => entry,
                        None => return UdpIngress::Dropped,
                    };
                    if entry.pending.is_none() {
                        entry.pending = Some(datagram.payload.to_vec());
                        UdpIngress::Buffered
                    } else {
                        self.counters.udp_pending_dropped += 1;
                        UdpIngress::Dropped
                    }
                }
                UdpState::Closed => UdpIngress::Dropped,
            };
        }

        let Some(handler) = self.shared.udp_handler.get().cloned() else {
            log::warn!("udp datagram from {} dropped: no handler registered", datagram.src);
            return UdpIngress::Dropped;
        };
        let shared = Arc::new(UdpShared::new(key.clone(), datagram.src, datagram.dst));
        shared.set_state(UdpState::Connecting);
        self.udp_flows.insert(
            key,
            UdpEntry {
                shared: Arc::clone(&shared),
                pending: Some(datagram.payload.to_vec()),
                last_activity: Instant::now(),
            },
        );
        self.counters.udp_flows_accepted += 1;
        log::debug!("udp flow {} -> {} admitted", datagram.src, datagram.dst);
        let flow = UdpFlow {
            shared_flow: shared,
            engine: self.weak_self.clone(),
            stack: Arc::clone(&self.shared),
        };
        UdpIngress::Spawn(UdpSpawn { handler, flow })
    }

    /// Idle flows past the configured timeout are removed here; the caller
    /// notifies their handlers once the stack lock is released. Flows whose
    /// connect never finished are reaped too, silently.
    pub(super) fn prune_idle_udp(&mut self, now: Instant) -> Vec<(UdpFlow, Arc<dyn UdpHandler>)> {
        let timeout = self.shared.config.udp_timeout;
        let idle: SmallVec<[(UdpKey, bool); 8]> = self
            .udp_flows
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_activity) >= timeout)
            .map(|(key, entry)| (key.clone(), entry.shared.state() == UdpState::Connected))
            .collect();
        let mut closed = Vec::new();
        for (key, was_connected) in idle {
            let Some(flow) = self.udp_flow_handle(&key) else {
                continue;
            };
            if let Some(entry) = self.remove_udp_flow(&key) {
                log::debug!(
                    "udp flow {} -> {} idle timeout",
                    entry.shared.local,
                    entry.shared.remote
                );
                if was_connected {
                    if let Some(handler) = self.shared.udp_handler.get() {
                        closed.push((flow, Arc::clone(handler)));
                    }
                }
            }
        }
        closed
    }

    pub(super) fn remove_udp_flow(&mut self, key: &UdpKey) -> Option<UdpEntry> {
        let entry = self.udp_flows.remove(key)?;
        entry.shared.set_state(UdpState::Closed);
        Some(entry)
    }

    pub(super) fn touch_udp_flow(&mut self, key: &UdpKey) {
        if let Some(entry) = self.udp_flows.get_mut(key) {
            entry.last_activity = Instant::now();
        }
    }

    fn udp_flow_handle(&self, key: &UdpKey) -> Option<UdpFlow> {
        let entry = self.udp_flows.get(key)?;
        Some(UdpFlow {
            shared_flow: Arc::clone(&entry.shared),
            engine: self.weak_self.clone(),
            stack: Arc::clone(&self.shared),
        })
    }
}

/// Handle to a UDP pseudo-connection, held by the handler. Non-owning: the
/// stack owns the flow entry, and operations after removal fail cleanly.
#[derive(Clone)]
pub struct UdpFlow {
    shared_flow: Arc<UdpShared>,
    engine: Weak<Mutex<Engine>>,
    stack: Arc<Shared>,
}

impl UdpFlow {
    /// The TUN-side client endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared_flow.local
    }

    /// The destination the client addressed.
    pub fn remote_addr(&self) -> SocketAddr {
        self.shared_flow.remote
    }

    /// Current lifecycle tag of the flow.
    pub fn state(&self) -> UdpState {
        self.shared_flow.state()
    }

    /// Send a datagram back to the client, forged from `from`. The source
    /// may be any endpoint the TUN impersonates, not just the flow's
    /// destination.
    pub fn write_from(&self, data: &[u8], from: SocketAddr) -> Result<usize, StackError> {
        if self.shared_flow.state() != UdpState::Connected {
            return Err(StackError::FlowClosing);
        }
        let ipv6 = matches!(from.ip(), IpAddr::V6(_));
        if data.len() > self.stack.config.max_udp_payload(ipv6) {
            return Err(StackError::OversizedDatagram);
        }
        let packet = packet_builder::build_udp_datagram(from, self.shared_flow.local, data)?;
        self.stack.emit(&packet)?;
        if let Some(engine) = self.engine.upgrade() {
            let mut engine = engine.lock();
            engine.touch_udp_flow(&self.shared_flow.key);
            engine.stats.udp_datagrams_out += 1;
            engine.note_emitted(1, packet.len() as u64);
        }
        Ok(data.len())
    }

    /// Remove the flow from the table. Explicit close has no callback.
    pub fn close(&self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.lock().remove_udp_flow(&self.shared_flow.key);
        }
    }

    /// Flip to Connected and drain the pending slot. Returns `None` when
    /// the flow was removed while the handler connected.
    pub(crate) fn mark_connected(&self) -> Option<Option<Vec<u8>>> {
        let engine = self.engine.upgrade()?;
        let mut engine = engine.lock();
        let entry = engine.udp_flows.get_mut(&self.shared_flow.key)?;
        entry.shared.set_state(UdpState::Connected);
        entry.last_activity = Instant::now();
        Some(entry.pending.take())
    }
}

pub(crate) fn spawn_udp_flow(spawn: UdpSpawn) {
    let flow = spawn.flow.clone();
    if let Err(error) = thread::Builder::new()
        .name("udp-flow".to_string())
        .spawn(move || run_udp_connect(spawn))
    {
        log::error!("failed to spawn udp flow thread: {error}");
        flow.close();
    }
}

fn run_udp_connect(spawn: UdpSpawn) {
    let UdpSpawn { handler, flow } = spawn;
    let target = flow.remote_addr();
    match handler.connect(flow.clone(), target) {
        Ok(()) => {
            let Some(pending) = flow.mark_connected() else {
                return;
            };
            if let Some(payload) = pending {
                if let Err(error) = handler.did_receive_to(&flow, &payload, target) {
                    log::warn!("udp handler rejected first datagram ({error}), closing flow");
                    close_udp_for_error(&flow, handler.as_ref());
                }
            }
        }
        Err(error) => {
            log::debug!("udp connect to {target} failed: {error}");
            flow.close();
        }
    }
}

/// Handler-error teardown: remove the flow, then deliver the one close
/// callback it is owed.
pub(crate) fn close_udp_for_error(flow: &UdpFlow, handler: &dyn UdpHandler) {
    flow.close();
    handler.did_close(flow);
}
