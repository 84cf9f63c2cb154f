//! Proxy handler contracts. One handler per protocol is registered on the
//! stack before any packet is input; the stack calls into it from dedicated
//! flow threads, never while holding the stack lock.

use crate::engine::{TcpFlow, UdpFlow};
use crate::error::CloseCause;
use std::io;
use std::net::SocketAddr;

/// Receives every TCP connection terminated by the stack.
pub trait TcpHandler: Send + Sync + 'static {
    /// Invoked exactly once per flow, on the flow's own thread, right after
    /// the handshake is admitted. `target` is the destination the stack is
    /// impersonating. The handler may block here (dialing a relay); an error
    /// aborts the flow before it reaches Connected.
    fn connect(&self, flow: TcpFlow, target: SocketAddr) -> io::Result<()>;

    /// Bytes received from the TUN-side client, delivered in strict TCP
    /// sequence order with no concurrent calls for the same flow. Returning
    /// `ErrorKind::WouldBlock` keeps the payload queued and stops the
    /// receive window from advancing; the stack retries later. Any other
    /// error aborts the flow.
    fn did_receive(&self, flow: &TcpFlow, data: &[u8]) -> io::Result<()>;

    /// The flow was torn down by the remote side or by the stack. Called at
    /// most once per flow, after the flow key left the flow table.
    fn did_close(&self, flow: &TcpFlow, cause: CloseCause);

    /// The TUN-side client half-closed its sending direction (FIN). The
    /// handler may keep writing until it calls `flow.close()`.
    fn local_did_close(&self, flow: &TcpFlow);
}

/// Receives every UDP pseudo-flow terminated by the stack.
pub trait UdpHandler: Send + Sync + 'static {
    /// Invoked once per new (src, dst) pair, on its own thread. The first
    /// datagram waits in a single-slot buffer until this returns.
    fn connect(&self, flow: UdpFlow, target: SocketAddr) -> io::Result<()>;

    /// A datagram from the TUN-side client. `target` is the destination the
    /// datagram was addressed to; replies are forged from it with
    /// `flow.write_from`. Must not block; an error closes the flow.
    fn did_receive_to(&self, flow: &UdpFlow, data: &[u8], target: SocketAddr) -> io::Result<()>;

    /// The flow was removed, either explicitly or by the idle timeout.
    fn did_close(&self, flow: &UdpFlow);
}
