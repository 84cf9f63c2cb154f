//! TUN-facing packet rings and IP header parsing. The device feeds the
//! TCP engine through the smoltcp `Device` trait; a lightweight handle lets
//! the demux push inbound packets and the poll task drain outbound frames
//! without borrowing the device mutably.

use crate::error::StackError;
use parking_lot::Mutex;
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Notify;

pub(crate) const RING_CAPACITY: usize = 1024;

#[derive(Debug)]
pub(crate) enum ParsedPacket<'a> {
    Tcp(TcpSegment<'a>),
    Udp(UdpDatagram<'a>),
    Icmp,
    Other,
}

#[derive(Debug)]
pub(crate) struct TcpSegment<'a> {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub flags: TcpFlags,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

#[derive(Debug)]
pub(crate) struct UdpDatagram<'a> {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: &'a [u8],
}

#[derive(Default)]
struct SharedRing {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
}

/// Device exposed to the TCP engine. All state lives inside the shared ring
/// so the device itself stays `Clone` + lightweight.
#[derive(Clone)]
pub(crate) struct TunDevice {
    inner: Arc<Mutex<SharedRing>>,
    wake: Arc<Notify>,
    mtu: usize,
}

/// Handle used outside the engine lock to push inbound packets or drain
/// outbound frames.
#[derive(Clone)]
pub(crate) struct TunHandle {
    inner: Arc<Mutex<SharedRing>>,
    wake: Arc<Notify>,
    mtu: usize,
}

impl TunDevice {
    pub(crate) fn new(mtu: usize, wake: Arc<Notify>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SharedRing::default())),
            wake,
            mtu,
        }
    }

    pub(crate) fn handle(&self) -> TunHandle {
        TunHandle {
            inner: Arc::clone(&self.inner),
            wake: Arc::clone(&self.wake),
            mtu: self.mtu,
        }
    }

    fn device_capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = self.mtu;
        caps.medium = Medium::Ip;
        caps
    }
}

impl TunHandle {
    /// Pushes a copy of `packet` into the inbound ring, evicting the oldest
    /// entry when the ring is full.
    pub(crate) fn push_inbound(&self, packet: &[u8]) {
        if packet.is_empty() {
            return;
        }
        let mut guard = self.inner.lock();
        if guard.inbound.len() >= RING_CAPACITY {
            guard.inbound.pop_front();
        }
        let capped = packet.len().min(self.mtu);
        guard.inbound.push_back(packet[..capped].to_vec());
        self.wake.notify_one();
    }

    /// Drains every pending outbound frame. Called by the poll task after
    /// the engine runs so the output sink is invoked without any lock held.
    pub(crate) fn drain_outbound(&self) -> Vec<Vec<u8>> {
        let mut guard = self.inner.lock();
        guard.outbound.drain(..).collect()
    }
}

impl Device for TunDevice {
    type RxToken<'a>
        = TunRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = TunTxToken
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let mut guard = self.inner.lock();
        guard.inbound.pop_front().map(|packet| {
            let rx = TunRxToken { buffer: packet };
            let tx = TunTxToken {
                inner: Arc::clone(&self.inner),
                wake: Arc::clone(&self.wake),
                mtu: self.mtu,
            };
            (rx, tx)
        })
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TunTxToken {
            inner: Arc::clone(&self.inner),
            wake: Arc::clone(&self.wake),
            mtu: self.mtu,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.device_capabilities()
    }
}

pub(crate) struct TunRxToken {
    buffer: Vec<u8>,
}

pub(crate) struct TunTxToken {
    inner: Arc<Mutex<SharedRing>>,
    wake: Arc<Notify>,
    mtu: usize,
}

impl RxToken for TunRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = self.buffer;
        f(&mut buffer)
    }
}

impl TxToken for TunTxToken {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len.min(self.mtu)];
        let result = f(&mut frame);
        let mut guard = self.inner.lock();
        if guard.outbound.len() >= RING_CAPACITY {
            guard.outbound.pop_front();
        }
        guard.outbound.push_back(frame);
        self.wake.notify_one();
        result
    }
}

/// Strips the 4-byte address-family tag that macOS utun prepends to every
/// packet. Linux and Windows TAP frames pass through untouched.
pub(crate) fn strip_link_framing(packet: &[u8]) -> &[u8] {
    if packet.len() > 4 && !matches!(packet[0] >> 4, 4 | 6) {
        let family = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
        if family == libc::AF_INET as u32 || family == libc::AF_INET6 as u32 {
            return &packet[4..];
        }
    }
    packet
}

pub(crate) fn parse_packet(packet: &[u8]) -> Result<ParsedPacket<'_>, StackError> {
    if packet.is_empty() {
        return Err(StackError::MalformedPacket("empty packet"));
    }
    match packet[0] >> 4 {
        4 => parse_ipv4(packet),
        6 => parse_ipv6(packet),
        _ => Err(StackError::MalformedPacket("bad version nibble")),
    }
}

fn parse_ipv4(packet: &[u8]) -> Result<ParsedPacket<'_>, StackError> {
    if packet.len() < 20 {
        return Err(StackError::MalformedPacket("short ipv4 header"));
    }
    let header_len = usize::from(packet[0] & 0x0F) * 4;
    if header_len < 20 || header_len > packet.len() {
        return Err(StackError::MalformedPacket("bad ipv4 header length"));
    }
    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if total_len != packet.len() {
        return Err(StackError::MalformedPacket("ipv4 length mismatch"));
    }
    let protocol = packet[9];
    let src = IpAddr::V4(Ipv4Addr::new(
        packet[12], packet[13], packet[14], packet[15],
    ));
    let dst = IpAddr::V4(Ipv4Addr::new(
        packet[16], packet[17], packet[18], packet[19],
    ));
    let payload = &packet[header_len..total_len];
    match protocol {
        6 => parse_tcp(src, dst, payload),
        17 => parse_udp(src, dst, payload),
        1 => Ok(ParsedPacket::Icmp),
        _ => Ok(ParsedPacket::Other),
    }
}

fn parse_ipv6(packet: &[u8]) -> Result<ParsedPacket<'_>, StackError> {
    if packet.len() < 40 {
        return Err(StackError::MalformedPacket("short ipv6 header"));
    }
    let payload_len = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    if 40 + payload_len != packet.len() {
        return Err(StackError::MalformedPacket("ipv6 length mismatch"));
    }
    let next_header = packet[6];
    let src = IpAddr::V6(ipv6_from_slice(&packet[8..24]));
    let dst = IpAddr::V6(ipv6_from_slice(&packet[24..40]));
    let payload = &packet[40..40 + payload_len];
    match next_header {
        6 => parse_tcp(src, dst, payload),
        17 => parse_udp(src, dst, payload),
        58 => Ok(ParsedPacket::Icmp),
        _ => Ok(ParsedPacket::Other),
    }
}

fn ipv6_from_slice(bytes: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(bytes);
    Ipv6Addr::from(octets)
}

fn parse_tcp(src: IpAddr, dst: IpAddr, payload: &[u8]) -> Result<ParsedPacket<'_>, StackError> {
    if payload.len() < 20 {
        return Err(StackError::MalformedPacket("short tcp header"));
    }
    let src_port = u16::from_be_bytes([payload[0], payload[1]]);
    let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
    let data_offset = usize::from(payload[12] >> 4) * 4;
    if data_offset < 20 || data_offset > payload.len() {
        return Err(StackError::MalformedPacket("bad tcp data offset"));
    }
    let flags_byte = payload[13];
    let flags = TcpFlags {
        syn: flags_byte & 0x02 != 0,
        ack: flags_byte & 0x10 != 0,
        fin: flags_byte & 0x01 != 0,
        rst: flags_byte & 0x04 != 0,
    };
    Ok(ParsedPacket::Tcp(TcpSegment {
        src: SocketAddr::new(src, src_port),
        dst: SocketAddr::new(dst, dst_port),
        flags,
        payload: &payload[data_offset..],
    }))
}

fn parse_udp(src: IpAddr, dst: IpAddr, payload: &[u8]) -> Result<ParsedPacket<'_>, StackError> {
    if payload.len() < 8 {
        return Err(StackError::MalformedPacket("short udp header"));
    }
    let src_port = u16::from_be_bytes([payload[0], payload[1]]);
    let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
    let length = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    if length < 8 || length > payload.len() {
        return Err(StackError::MalformedPacket("udp length mismatch"));
    }
    Ok(ParsedPacket::Udp(UdpDatagram {
        src: SocketAddr::new(src, src_port),
        dst: SocketAddr::new(dst, dst_port),
        payload: &payload[8..length],
    }))
}
