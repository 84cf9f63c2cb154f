use thiserror::Error;

/// Errors surfaced on the public stack API.
#[derive(Debug, Error)]
pub enum StackError {
    /// The IP header was invalid or the declared length disagrees with the
    /// buffer length. The packet is dropped; the stack continues.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// A segment or operation referenced a flow that is no longer in the
    /// flow table. Late TCP segments are answered with RST, late UDP
    /// datagrams are dropped.
    #[error("no such flow")]
    FlowUnknown,

    /// The engine's buffer pool is exhausted; nothing was enqueued this
    /// iteration.
    #[error("buffer pool exhausted")]
    BufferExhausted,

    /// The flow has been half-closed or is tearing down; no further writes
    /// are accepted.
    #[error("flow is closing")]
    FlowClosing,

    /// The client reset the connection.
    #[error("connection reset by peer")]
    PeerReset,

    /// The connection was aborted.
    #[error("connection aborted")]
    PeerAbort,

    /// A UDP payload does not fit into a single IP packet at the configured
    /// MTU. Fragmentation of forwarded payloads is not implemented.
    #[error("datagram exceeds mtu")]
    OversizedDatagram,

    /// A set-once registration slot was written twice, or after the first
    /// packet was input.
    #[error("registration rejected: {0}")]
    Registration(&'static str),

    /// The output sink failed to write a packet.
    #[error("output sink error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal invariant was violated. The flow moves to Errored and all
    /// further operations on it return this error.
    #[error("fatal stack error: {0}")]
    Fatal(&'static str),
}

/// Why a flow was torn down, as reported to `did_close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Orderly teardown, both directions closed.
    Finished,
    /// The client sent RST.
    PeerReset,
    /// The stack aborted the flow (timer, admission, invariant).
    PeerAbort,
    /// A handler callback returned an error.
    HandlerError,
    /// The UDP flow sat idle past the configured timeout.
    IdleTimeout,
}
