//! TCP flow lifecycle: admission on SYN, receive delivery in sequence
//! order, the backpressured write path, and teardown. Handler callbacks run
//! on one dedicated thread per flow fed by a bounded event channel, so the
//! stack lock is never held across a callback.

use super::state::{
    FlowEvent, FlowSignal, FourTuple, TcpEntry, TcpState, EVENT_CHANNEL_DEPTH, TCP_ACCEPT_TIMEOUT,
    WOULD_BLOCK_RETRY, WRITE_STALL_RECHECK,
};
use super::Engine;
use crate::device::TcpSegment;
use crate::error::{CloseCause, StackError};
use crate::handler::TcpHandler;
use crate::pool;
use crate::Shared;
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use smallvec::SmallVec;
use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp::{
    SendError as TcpSendError, Socket as TcpSocket, State as TcpSockState,
};
use smoltcp::wire::{IpAddress, IpEndpoint, IpListenEndpoint, Ipv4Address, Ipv6Address};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

/// What the demux should do with an inbound TCP segment after the engine
/// looked at it.
pub(crate) enum TcpIngress {
    /// Feed the packet to the engine; an admitted or stray segment alike.
    Forward,
    /// A new flow was admitted; feed the packet and start its thread.
    ForwardAndSpawn(TcpSpawn),
    /// Admission failed; drop the packet so the client retries.
    Drop,
}

pub(crate) struct TcpSpawn {
    pub handler: Arc<dyn TcpHandler>,
    pub flow: TcpFlow,
    pub target: SocketAddr,
    pub events: Receiver<FlowEvent>,
}

impl Engine {
    /// Inspect an inbound segment before it reaches the engine. A SYN for an
    /// unknown 4-tuple admits a new flow; anything else just updates the
    /// entry's observed flags. Non-SYN strays still go to the engine, which
    /// answers them with RST.
    pub(crate) fn note_tcp_segment(&mut self, seg: &TcpSegment<'_>) -> TcpIngress {
        let tuple = FourTuple {
            src: seg.src,
            dst: seg.dst,
        };
        if let Some(&key) = self.tuple_index.get(&tuple) {
            if let Some(entry) = self.tcp_flows.get_mut(&key) {
                if seg.flags.fin {
                    entry.client_fin = true;
                }
                if seg.flags.rst {
                    entry.client_rst = true;
                }
            }
            return TcpIngress::Forward;
        }
        if !seg.flags.syn || seg.flags.ack {
            self.counters.stray_tcp_segments += 1;
            return TcpIngress::Forward;
        }
        let Some(handler) = self.shared.tcp_handler.get().cloned() else {
            log::warn!("tcp syn from {} dropped: no handler registered", seg.src);
            return TcpIngress::Drop;
        };
        let Some(socket_handle) = self.tcp_pool.pop() else {
            self.counters.tcp_admission_failures += 1;
            log::warn!("tcp admission failed: socket pool exhausted");
            return TcpIngress::Drop;
        };

        let endpoint = IpListenEndpoint {
            addr: Some(to_ip_address(seg.dst.ip())),
            port: seg.dst.port(),
        };
        let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);
        if socket.listen(endpoint).is_err() {
            socket.abort();
            self.tcp_pool.push(socket_handle);
            self.counters.tcp_admission_failures += 1;
            log::warn!("tcp admission failed: listen on {} refused", seg.dst);
            return TcpIngress::Drop;
        }

        let mut key = rand::random::<u32>();
        while self.tcp_flows.contains_key(&key) {
            key = rand::random();
        }

        let signal = Arc::new(FlowSignal::new(TcpState::NewConn));
        let (events_tx, events_rx) = bounded(EVENT_CHANNEL_DEPTH);
        self.tcp_flows.insert(
            key,
            TcpEntry {
                socket: socket_handle,
                tuple,
                signal: Arc::clone(&signal),
                events: events_tx,
                ready: false,
                bound: false,
                client_fin: seg.flags.fin,
                client_rst: seg.flags.rst,
                local_close_notified: false,
                close_cause: None,
                created_at: Instant::now(),
            },
        );
        self.tuple_index.insert(tuple, key);
        self.counters.tcp_flows_accepted += 1;
        signal.advance(TcpState::Connecting);

        let flow = TcpFlow {
            key,
            local: seg.src,
            remote: seg.dst,
            engine: self.weak_self.clone(),
            shared: Arc::clone(&self.shared),
            signal,
        };
        log::debug!("tcp flow {} -> {} admitted (key {:08x})", seg.src, seg.dst, key);
        TcpIngress::ForwardAndSpawn(TcpSpawn {
            handler,
            flow,
            target: seg.dst,
            events: events_rx,
        })
    }

    /// Match freshly established engine sockets back to their entries. Two
    /// listeners on the same destination endpoint can pick up each other's
    /// handshake; when that happens the socket handles are swapped so every
    /// entry ends up holding the socket that carries its own 4-tuple.
    pub(super) fn reconcile_sockets(&mut self) {
        let unbound: SmallVec<[(u32, SocketHandle); 8]> = self
            .tcp_flows
            .iter()
            .filter(|(_, entry)| !entry.bound && entry.close_cause.is_none())
            .map(|(&key, entry)| (key, entry.socket))
            .collect();
        for (key, socket_handle) in unbound {
            let remote = {
                let socket = self.sockets.get::<TcpSocket>(socket_handle);
                if socket.state() == TcpSockState::Listen {
                    continue;
                }
                match socket.remote_endpoint() {
                    Some(endpoint) => endpoint_to_std(endpoint),
                    None => continue,
                }
            };
            let Some(entry) = self.tcp_flows.get_mut(&key) else {
                continue;
            };
            if entry.tuple.src == remote {
                entry.bound = true;
                continue;
            }
            let other_key = self
                .tcp_flows
                .iter()
                .find(|(_, other)| !other.bound && other.tuple.src == remote)
                .map(|(&other_key, _)| other_key);
            if let Some(other_key) = other_key {
                let other_socket = match self.tcp_flows.get(&other_key) {
                    Some(other) => other.socket,
                    None => continue,
                };
                if let Some(entry) = self.tcp_flows.get_mut(&key) {
                    entry.socket = other_socket;
                }
                if let Some(other) = self.tcp_flows.get_mut(&other_key) {
                    other.socket = socket_handle;
                    other.bound = true;
                }
            }
        }
    }

    /// Move received bytes from engine sockets into the per-flow channels,
    /// in sequence order. A full channel pauses the drain for that flow,
    /// which keeps the advertised window from opening further.
    pub(super) fn drain_tcp_rx(&mut self) {
        let candidates: SmallVec<[(u32, SocketHandle); 32]> = self
            .tcp_flows
            .iter()
            .filter(|(_, entry)| entry.ready && entry.bound && entry.close_cause.is_none())
            .map(|(&key, entry)| (key, entry.socket))
            .collect();
        for (key, socket_handle) in candidates {
            let (events, budget) = match self.tcp_flows.get(&key) {
                Some(entry) => (
                    entry.events.clone(),
                    EVENT_CHANNEL_DEPTH.saturating_sub(entry.events.len()),
                ),
                None => continue,
            };
            if budget == 0 {
                continue;
            }
            let mut delivered = 0u64;
            {
                let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);
                for _ in 0..budget {
                    if !socket.can_recv() {
                        break;
                    }
                    let chunk = match socket.recv(|bytes| {
                        let mut buf = pool::take(bytes.len());
                        buf.copy_from_slice(bytes);
                        (bytes.len(), buf)
                    }) {
                        Ok(chunk) => chunk,
                        Err(_) => break,
                    };
                    if chunk.is_empty() {
                        break;
                    }
                    delivered += chunk.len() as u64;
                    if events.try_send(FlowEvent::Data(chunk)).is_err() {
                        break;
                    }
                }
            }
            self.stats.bytes_delivered = self.stats.bytes_delivered.saturating_add(delivered);
        }
    }

    /// Per-flow state notifications: half-close notices once the receive
    /// side drained, and write wakeups whenever send-buffer space opened.
    pub(super) fn notify_tcp_state(&mut self) {
        let snapshot: SmallVec<[(u32, SocketHandle); 32]> = self
            .tcp_flows
            .iter()
            .map(|(&key, entry)| (key, entry.socket))
            .collect();
        for (key, socket_handle) in snapshot {
            let (sock_state, can_recv, writable) = {
                let socket = self.sockets.get::<TcpSocket>(socket_handle);
                let free = socket.send_capacity().saturating_sub(socket.send_queue());
                (socket.state(), socket.can_recv(), socket.may_send() && free > 0)
            };
            let Some(entry) = self.tcp_flows.get_mut(&key) else {
                continue;
            };
            let remote_fin = matches!(
                sock_state,
                TcpSockState::CloseWait
                    | TcpSockState::Closing
                    | TcpSockState::LastAck
                    | TcpSockState::TimeWait
            );
            if entry.ready
                && !entry.local_close_notified
                && remote_fin
                && !can_recv
                && entry.events.try_send(FlowEvent::LocalClosed).is_ok()
            {
                entry.local_close_notified = true;
                entry.signal.advance(TcpState::LocalClosed);
            }
            if writable {
                entry.signal.notify_writers();
            }
        }
    }

    /// Tear down flows whose engine socket reached a terminal state. The
    /// entry leaves the flow table strictly before the Closed event is
    /// delivered, so `did_close` always observes an absent key.
    pub(super) fn finalize_closed_flows(&mut self) {
        let decided: SmallVec<[(u32, CloseCause); 8]> = self
            .tcp_flows
            .iter()
            .filter(|(_, entry)| entry.close_cause.is_none())
            .filter_map(|(&key, entry)| {
                let socket = self.sockets.get::<TcpSocket>(entry.socket);
                match socket.state() {
                    TcpSockState::Closed | TcpSockState::TimeWait => {
                        let cause = if entry.client_rst {
                            CloseCause::PeerReset
                        } else {
                            CloseCause::Finished
                        };
                        Some((key, cause))
                    }
                    _ => None,
                }
            })
            .collect();
        for (key, cause) in decided {
            if let Some(entry) = self.tcp_flows.get_mut(&key) {
                entry.close_cause = Some(cause);
            }
        }

        let pending: SmallVec<[(u32, CloseCause); 8]> = self
            .tcp_flows
            .iter()
            .filter_map(|(&key, entry)| entry.close_cause.map(|cause| (key, cause)))
            .collect();
        for (key, cause) in pending {
            let can_send = match self.tcp_flows.get(&key) {
                Some(entry) => entry.events.len() < EVENT_CHANNEL_DEPTH,
                None => false,
            };
            if !can_send {
                // Channel still full of data events; retried next poll.
                continue;
            }
            if let Some(entry) = self.remove_tcp_flow(key) {
                match cause {
                    CloseCause::PeerReset | CloseCause::HandlerError => {
                        entry.signal.advance(TcpState::Errored)
                    }
                    CloseCause::PeerAbort | CloseCause::IdleTimeout => {
                        entry.signal.advance(TcpState::Aborting)
                    }
                    CloseCause::Finished => entry.signal.advance(TcpState::Closing),
                }
                entry.signal.notify_writers();
                let _ = entry.events.try_send(FlowEvent::Closed(cause));
                log::debug!("tcp flow {:08x} finalized ({:?})", key, cause);
            }
        }
    }

    /// Reap admitted flows whose handshake never completed.
    pub(super) fn reap_stale_accepts(&mut self, now: Instant) {
        let stale: SmallVec<[u32; 4]> = self
            .tcp_flows
            .iter()
            .filter(|(_, entry)| {
                !entry.bound
                    && entry.close_cause.is_none()
                    && now.duration_since(entry.created_at) >= TCP_ACCEPT_TIMEOUT
            })
            .map(|(&key, _)| key)
            .collect();
        for key in stale {
            if let Some(entry) = self.tcp_flows.get_mut(&key) {
                entry.close_cause = Some(CloseCause::PeerAbort);
                log::debug!("tcp flow {:08x} reaped: handshake never completed", key);
            }
        }
    }

    /// Enqueue up to `snd_buf` bytes for transmission. Returns the number of
    /// bytes accepted; zero means the caller should wait on `can_write`.
    pub(super) fn tcp_enqueue(&mut self, key: u32, data: &[u8]) -> Result<usize, StackError> {
        let socket_handle = self
            .tcp_flows
            .get(&key)
            .ok_or(StackError::FlowUnknown)?
            .socket;
        let written = {
            let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);
            if socket.may_send() {
                let free = socket.send_capacity().saturating_sub(socket.send_queue());
                let to_write = data.len().min(free);
                if to_write == 0 {
                    0
                } else {
                    match socket.send_slice(&data[..to_write]) {
                        Ok(written) => written,
                        Err(TcpSendError::InvalidState) => {
                            return Err(StackError::Fatal("send in invalid socket state"))
                        }
                    }
                }
            } else {
                0
            }
        };
        if written == 0 {
            self.counters.writes_stalled += 1;
        }
        Ok(written)
    }

    /// Half-close the transmit side; queued bytes still flush before FIN.
    pub(super) fn tcp_shutdown_tx(&mut self, key: u32) -> Result<(), StackError> {
        let socket_handle = self
            .tcp_flows
            .get(&key)
            .ok_or(StackError::FlowUnknown)?
            .socket;
        self.sockets.get_mut::<TcpSocket>(socket_handle).close();
        Ok(())
    }

    /// Hard reset: RST toward the client, immediate removal.
    pub(super) fn abort_tcp_flow(&mut self, key: u32) {
        if let Some(entry) = self.remove_tcp_flow(key) {
            entry.signal.advance(TcpState::Aborting);
            entry.signal.notify_writers();
            log::debug!("tcp flow {:08x} aborted", key);
        }
    }

    /// Drop an entry from both maps and recycle its socket. Aborting the
    /// socket emits RST when the connection is still synchronized.
    fn remove_tcp_flow(&mut self, key: u32) -> Option<TcpEntry> {
        let entry = self.tcp_flows.remove(&key)?;
        self.tuple_index.remove(&entry.tuple);
        self.sockets.get_mut::<TcpSocket>(entry.socket).abort();
        self.tcp_pool.push(entry.socket);
        Some(entry)
    }
}

/// Handle to a terminated TCP connection, held by the handler. The handle
/// is non-owning: the stack keeps the flow alive and every operation is
/// exchanged for the flow through the table, so calls after removal fail
/// with `FlowUnknown` instead of touching freed state.
#[derive(Clone)]
pub struct TcpFlow {
    key: u32,
    local: SocketAddr,
    remote: SocketAddr,
    engine: Weak<Mutex<Engine>>,
    shared: Arc<Shared>,
    signal: Arc<FlowSignal>,
}

impl TcpFlow {
    /// The TUN-side client endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// The destination the stack is impersonating.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Current lifecycle tag of the flow. Handlers racing a teardown can
    /// check for Aborting and bail out quickly.
    pub fn state(&self) -> TcpState {
        self.signal.state()
    }

    pub(crate) fn wake(&self) {
        self.shared.wake.notify_one();
    }

    fn engine(&self) -> Result<Arc<Mutex<Engine>>, StackError> {
        self.engine.upgrade().ok_or(StackError::FlowUnknown)
    }

    /// Enqueue `data` for transmission toward the client. Blocks until all
    /// bytes are accepted or the flow leaves Connected; concurrent writers
    /// on the same flow are serialized.
    pub fn write(&self, data: &[u8]) -> Result<usize, StackError> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut total = 0usize;
        let mut guard = self.signal.write_lock.lock();
        loop {
            match self.signal.state() {
                TcpState::NewConn | TcpState::Connecting | TcpState::Connected => {}
                TcpState::Closing | TcpState::LocalClosed => return Err(StackError::FlowClosing),
                TcpState::Aborting => return Err(StackError::PeerAbort),
                TcpState::Errored => return Err(StackError::Fatal("flow has errored")),
            }
            let written = {
                let engine = self.engine()?;
                let mut engine = engine.lock();
                engine.tcp_enqueue(self.key, &data[total..])?
            };
            if written > 0 {
                total += written;
                self.wake();
            }
            if total == data.len() {
                return Ok(total);
            }
            let _ = self
                .signal
                .can_write
                .wait_for(&mut guard, WRITE_STALL_RECHECK);
        }
    }

    /// Half-close the transmit side. Never suspends; already-queued bytes
    /// flush before the FIN goes out. Calling it twice is an invariant
    /// violation that moves the flow to Errored.
    pub fn close(&self) -> Result<(), StackError> {
        match self.signal.state() {
            TcpState::Errored => return Err(StackError::Fatal("flow has errored")),
            TcpState::Aborting => return Err(StackError::PeerAbort),
            TcpState::Closing => {
                self.signal.advance(TcpState::Errored);
                self.signal.notify_writers();
                return Err(StackError::Fatal("close called twice"));
            }
            _ => {}
        }
        let engine = self.engine()?;
        engine.lock().tcp_shutdown_tx(self.key)?;
        self.signal.advance(TcpState::Closing);
        self.signal.notify_writers();
        self.wake();
        Ok(())
    }

    /// Hard reset: RST toward the client and immediate removal from the
    /// flow table. No callback fires afterwards.
    pub fn abort(&self) {
        self.signal.advance(TcpState::Aborting);
        self.signal.notify_writers();
        if let Some(engine) = self.engine.upgrade() {
            engine.lock().abort_tcp_flow(self.key);
        }
        self.wake();
    }

    /// The handler's connect callback succeeded; open the delivery gate.
    /// Returns false when the flow was torn down in the meantime.
    pub(crate) fn mark_connected(&self) -> bool {
        let Some(engine) = self.engine.upgrade() else {
            return false;
        };
        let connected = {
            let mut engine = engine.lock();
            match engine.tcp_flows.get_mut(&self.key) {
                Some(entry) => {
                    if self.signal.try_advance(TcpState::Connecting, TcpState::Connected) {
                        entry.ready = true;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if connected {
            self.signal.notify_writers();
            self.wake();
        }
        connected
    }
}

pub(crate) fn spawn_tcp_flow(spawn: TcpSpawn) {
    let flow = spawn.flow.clone();
    let name = format!("tcp-flow-{:08x}", flow.key);
    if let Err(error) = thread::Builder::new()
        .name(name)
        .spawn(move || run_tcp_flow(spawn))
    {
        log::error!("failed to spawn tcp flow thread: {error}");
        flow.abort();
    }
}

fn run_tcp_flow(spawn: TcpSpawn) {
    let TcpSpawn {
        handler,
        flow,
        target,
        events,
    } = spawn;
    match handler.connect(flow.clone(), target) {
        Ok(()) => {
            flow.mark_connected();
        }
        Err(error) => {
            log::debug!("tcp connect to {target} failed: {error}");
            flow.abort();
            return;
        }
    }
    while let Ok(event) = events.recv() {
        match event {
            FlowEvent::Data(chunk) => {
                // Data racing a teardown is dropped without a callback.
                if !matches!(flow.state(), TcpState::Connected | TcpState::LocalClosed) {
                    continue;
                }
                loop {
                    match handler.did_receive(&flow, &chunk) {
                        Ok(()) => {
                            flow.wake();
                            break;
                        }
                        Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                            if !matches!(
                                flow.state(),
                                TcpState::Connected | TcpState::LocalClosed
                            ) {
                                break;
                            }
                            thread::sleep(WOULD_BLOCK_RETRY);
                        }
                        Err(error) => {
                            log::warn!("tcp handler rejected payload ({error}), aborting flow");
                            flow.abort();
                            handler.did_close(&flow, CloseCause::HandlerError);
                            return;
                        }
                    }
                }
            }
            FlowEvent::LocalClosed => handler.local_did_close(&flow),
            FlowEvent::Closed(cause) => {
                handler.did_close(&flow, cause);
                return;
            }
        }
    }
}

fn to_ip_address(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from_bytes(&v4.octets())),
        IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from_bytes(&v6.octets())),
    }
}

fn endpoint_to_std(endpoint: IpEndpoint) -> SocketAddr {
    match endpoint.addr {
        IpAddress::Ipv4(v4) => SocketAddr::new(IpAddr::V4(Ipv4Addr::from(v4.0)), endpoint.port),
        IpAddress::Ipv6(v6) => SocketAddr::new(IpAddr::V6(Ipv6Addr::from(v6.0)), endpoint.port),
    }
}
