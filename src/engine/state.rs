//! Per-flow bookkeeping: state tags, keys, signals, and tuning constants.

use crate::error::CloseCause;
use crate::pool::PoolBuf;
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use smoltcp::iface::SocketHandle;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

pub(crate) const TCP_SOCKET_COUNT: usize = 512;
pub(crate) const TCP_RX_BUFFER_SIZE: usize = 16 * 1024;
pub(crate) const TCP_TX_BUFFER_SIZE: usize = 16 * 1024;

/// Depth of the per-flow event channel. A full channel pauses the receive
/// drain, which in turn stops the advertised window from opening.
pub(crate) const EVENT_CHANNEL_DEPTH: usize = 32;

/// How long an admitted flow may sit without completing the handshake
/// before it is reaped.
pub(crate) const TCP_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause before redelivering a payload the handler refused with WouldBlock.
pub(crate) const WOULD_BLOCK_RETRY: Duration = Duration::from_millis(10);

/// Upper bound on how long a stalled writer sleeps between re-checks.
pub(crate) const WRITE_STALL_RECHECK: Duration = Duration::from_millis(250);

/// Lifecycle tag of a TCP flow. Transitions only move forward, except that
/// Aborting and Errored are reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TcpState {
    NewConn = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
    LocalClosed = 4,
    Aborting = 5,
    Errored = 6,
}

impl TcpState {
    fn from_u8(value: u8) -> TcpState {
        match value {
            0 => TcpState::NewConn,
            1 => TcpState::Connecting,
            2 => TcpState::Connected,
            3 => TcpState::Closing,
            4 => TcpState::LocalClosed,
            5 => TcpState::Aborting,
            _ => TcpState::Errored,
        }
    }
}

/// Cross-thread signal block shared between a flow's engine entry and the
/// handles the handler holds. The condvar implements write backpressure.
pub(crate) struct FlowSignal {
    state: AtomicU8,
    pub(crate) write_lock: Mutex<()>,
    pub(crate) can_write: Condvar,
}

impl FlowSignal {
    pub(crate) fn new(initial: TcpState) -> Self {
        Self {
            state: AtomicU8::new(initial as u8),
            write_lock: Mutex::new(()),
            can_write: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> TcpState {
        TcpState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move forward to `next`. Backward transitions are ignored so a flow is
    /// always in exactly one state and never regresses.
    pub(crate) fn advance(&self, next: TcpState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if next as u8 > current {
                    Some(next as u8)
                } else {
                    None
                }
            });
    }

    /// Move from exactly `from` to `to`. Fails if something else advanced
    /// the flow in the meantime.
    pub(crate) fn try_advance(&self, from: TcpState, to: TcpState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn notify_writers(&self) {
        self.can_write.notify_all();
    }
}

/// Events the engine hands to a flow's dispatch thread, in order.
pub(crate) enum FlowEvent {
    Data(PoolBuf),
    LocalClosed,
    Closed(CloseCause),
}

/// The client-side 4-tuple a TCP flow is keyed under at the demux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FourTuple {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

pub(crate) struct TcpEntry {
    pub socket: SocketHandle,
    pub tuple: FourTuple,
    pub signal: std::sync::Arc<FlowSignal>,
    pub events: Sender<FlowEvent>,
    /// The handler's connect callback returned Ok.
    pub ready: bool,
    /// The engine socket left Listen and matches this entry's tuple.
    pub bound: bool,
    pub client_fin: bool,
    pub client_rst: bool,
    pub local_close_notified: bool,
    /// Teardown decided; the Closed event still has to fit into the channel.
    pub close_cause: Option<CloseCause>,
    pub created_at: Instant,
}

/// Lifecycle tag of a UDP pseudo-flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UdpState {
    NewConn = 0,
    Connecting = 1,
    Connected = 2,
    Closed = 3,
}

impl UdpState {
    fn from_u8(value: u8) -> UdpState {
        match value {
            0 => UdpState::NewConn,
            1 => UdpState::Connecting,
            2 => UdpState::Connected,
            _ => UdpState::Closed,
        }
    }
}

/// Canonical `"ip:port"` renderings of both endpoints.
pub(crate) type UdpKey = (String, String);

pub(crate) struct UdpShared {
    pub key: UdpKey,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    state: AtomicU8,
}

impl UdpShared {
    pub(crate) fn new(key: UdpKey, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            key,
            local,
            remote,
            state: AtomicU8::new(UdpState::NewConn as u8),
        }
    }

    pub(crate) fn state(&self) -> UdpState {
        UdpState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: UdpState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

pub(crate) struct UdpEntry {
    pub shared: std::sync::Arc<UdpShared>,
    /// Single-slot buffer holding the datagram that opened the flow until
    /// the handler reaches Connected. Overflow during Connecting is dropped.
    pub pending: Option<Vec<u8>>,
    pub last_activity: Instant,
}
