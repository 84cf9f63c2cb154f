//! Composable packet filters. Each filter implements the same byte-stream
//! write contract as the stack's input, so they chain in front of it in any
//! order: `reader -> AppLogFilter -> RoutingFilter -> Stack`.

use crate::device::{self, ParsedPacket};
use crate::error::StackError;
use crate::Stack;
use crossbeam_channel::{unbounded, Sender};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Anything that accepts one IP packet per call. The stack itself is the
/// innermost sink; filters wrap any other sink.
pub trait PacketSink: Send + Sync {
    fn write(&self, packet: &[u8]) -> Result<usize, StackError>;
}

impl PacketSink for Stack {
    fn write(&self, packet: &[u8]) -> Result<usize, StackError> {
        self.input(packet)?;
        Ok(packet.len())
    }
}

impl<S: PacketSink + ?Sized> PacketSink for Arc<S> {
    fn write(&self, packet: &[u8]) -> Result<usize, StackError> {
        (**self).write(packet)
    }
}

/// Transport protocol of a routed flow, as seen by a `Router`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Routing verdict for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Let the packet continue into the stack.
    Proxy,
    /// Bypass the stack: a host route is installed and the packet dropped,
    /// so the client's retransmission takes the new route.
    Direct,
}

pub trait Router: Send + Sync {
    fn pick_route(&self, dst: SocketAddr, transport: Transport) -> RouteAction;
}

/// Logs the origin of every new TCP connection. An optional resolver maps
/// the client endpoint to a process name.
pub struct AppLogFilter<S> {
    inner: S,
    resolver: Option<Box<dyn Fn(SocketAddr) -> Option<String> + Send + Sync>>,
}

impl<S: PacketSink> AppLogFilter<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            resolver: None,
        }
    }

    pub fn with_resolver<F>(inner: S, resolver: F) -> Self
    where
        F: Fn(SocketAddr) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            inner,
            resolver: Some(Box::new(resolver)),
        }
    }
}

impl<S: PacketSink> PacketSink for AppLogFilter<S> {
    fn write(&self, packet: &[u8]) -> Result<usize, StackError> {
        if let Ok(ParsedPacket::Tcp(segment)) = device::parse_packet(packet) {
            if segment.flags.syn && !segment.flags.ack {
                let name = self
                    .resolver
                    .as_ref()
                    .and_then(|resolver| resolver(segment.src))
                    .unwrap_or_else(|| "unknown process".to_string());
                log::info!("[{name}] is connecting {} -> {}", segment.src, segment.dst);
            }
        }
        self.inner.write(packet)
    }
}

/// Diverts chosen destinations around the proxy. When the router says
/// Direct, `add_route` installs a host route and the packet is discarded so
/// the client's retransmission uses it.
pub struct RoutingFilter<S, R> {
    inner: S,
    router: R,
    add_route: Box<dyn Fn(IpAddr) -> io::Result<()> + Send + Sync>,
}

impl<S: PacketSink, R: Router> RoutingFilter<S, R> {
    pub fn new<F>(inner: S, router: R, add_route: F) -> Self
    where
        F: Fn(IpAddr) -> io::Result<()> + Send + Sync + 'static,
    {
        Self {
            inner,
            router,
            add_route: Box::new(add_route),
        }
    }
}

impl<S: PacketSink, R: Router> PacketSink for RoutingFilter<S, R> {
    fn write(&self, packet: &[u8]) -> Result<usize, StackError> {
        let decision = match device::parse_packet(packet) {
            // Only the first packet of a flow is worth a routing lookup.
            Ok(ParsedPacket::Tcp(segment)) if segment.flags.syn && !segment.flags.ack => {
                Some((segment.dst, Transport::Tcp))
            }
            Ok(ParsedPacket::Udp(datagram)) => Some((datagram.dst, Transport::Udp)),
            _ => None,
        };
        if let Some((dst, transport)) = decision {
            if self.router.pick_route(dst, transport) == RouteAction::Direct {
                match (self.add_route)(dst.ip()) {
                    Ok(()) => return Ok(packet.len()),
                    Err(error) => {
                        log::warn!("adding route for {dst} failed: {error}");
                    }
                }
            }
        }
        self.inner.write(packet)
    }
}

/// Holds ICMP packets for a fixed delay before passing them on; everything
/// else flows straight through. One worker thread serves the whole line.
pub struct IcmpDelayFilter<S> {
    inner: Arc<S>,
    queue: Sender<(Instant, Vec<u8>)>,
    delay: Duration,
}

impl<S: PacketSink + 'static> IcmpDelayFilter<S> {
    pub fn new(inner: S, delay: Duration) -> Self {
        let inner = Arc::new(inner);
        let (queue, rx) = unbounded::<(Instant, Vec<u8>)>();
        let worker_sink = Arc::clone(&inner);
        let spawned = thread::Builder::new()
            .name("icmp-delay-filter".to_string())
            .spawn(move || {
                while let Ok((deadline, packet)) = rx.recv() {
                    let now = Instant::now();
                    if deadline > now {
                        thread::sleep(deadline - now);
                    }
                    if let Err(error) = worker_sink.write(&packet) {
                        log::warn!("delayed icmp packet rejected: {error}");
                    }
                }
            });
        if let Err(error) = spawned {
            log::error!("failed to spawn icmp delay filter thread: {error}");
        }
        Self {
            inner,
            queue,
            delay,
        }
    }
}

impl<S: PacketSink + 'static> PacketSink for IcmpDelayFilter<S> {
    fn write(&self, packet: &[u8]) -> Result<usize, StackError> {
        if matches!(device::parse_packet(packet), Ok(ParsedPacket::Icmp)) {
            let deadline = Instant::now() + self.delay;
            let _ = self.queue.send((deadline, packet.to_vec()));
            return Ok(packet.len());
        }
        self.inner.write(packet)
    }
}
