//! Loopback harness: a channel impersonates the TUN on the output side,
//! hand-crafted IP packets impersonate the client on the input side, and
//! mock handlers stand in for the proxy transports.

use super::checksum;
use crate::{
    CloseCause, Stack, StackConfig, StackError, TcpFlow, TcpHandler, UdpFlow, UdpHandler,
};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const FIN: u8 = 0x01;
const SYN: u8 = 0x02;
const RST: u8 = 0x04;
const PSH: u8 = 0x08;
const ACK: u8 = 0x10;

const MSS_OPTION: [u8; 4] = [2, 4, 0x05, 0xB4];

fn client_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), port)
}

fn server_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)), port)
}

struct TestNet {
    stack: Stack,
    frames: Receiver<Vec<u8>>,
}

fn build_stack(
    config: StackConfig,
    tcp: Option<Arc<dyn TcpHandler>>,
    udp: Option<Arc<dyn UdpHandler>>,
) -> TestNet {
    let stack = Stack::new(config).expect("stack construction failed");
    let (frames_tx, frames) = unbounded();
    stack
        .register_output_fn(move |packet| {
            let _ = frames_tx.send(packet.to_vec());
            Ok(packet.len())
        })
        .expect("output registration failed");
    if let Some(handler) = tcp {
        stack
            .register_tcp_handler(handler)
            .expect("tcp handler registration failed");
    }
    if let Some(handler) = udp {
        stack
            .register_udp_handler(handler)
            .expect("udp handler registration failed");
    }
    stack.start().expect("stack start failed");
    TestNet { stack, frames }
}

fn ipv4_of(addr: SocketAddr) -> Ipv4Addr {
    match addr.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => panic!("harness is IPv4-only"),
    }
}

fn build_tcp_packet(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: u8,
    options: &[u8],
    payload: &[u8],
) -> Vec<u8> {
    assert_eq!(options.len() % 4, 0);
    let tcp_len = 20 + options.len() + payload.len();
    let total_len = 20 + tcp_len;
    let mut packet = vec![0u8; total_len];

    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 6;
    packet[12..16].copy_from_slice(&ipv4_of(src).octets());
    packet[16..20].copy_from_slice(&ipv4_of(dst).octets());
    let ip_cksum = checksum::ipv4_header(&packet[..20]);
    packet[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    let tcp = &mut packet[20..];
    tcp[0..2].copy_from_slice(&src.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = (((20 + options.len()) / 4) as u8) << 4;
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&0xFFFFu16.to_be_bytes());
    tcp[20..20 + options.len()].copy_from_slice(options);
    tcp[20 + options.len()..].copy_from_slice(payload);

    let tcp_cksum = tcp_checksum(ipv4_of(src), ipv4_of(dst), &packet[20..]);
    packet[20 + 16..20 + 18].copy_from_slice(&tcp_cksum.to_be_bytes());
    packet
}

fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut pseudo = Vec::with_capacity(12 + segment.len());
    pseudo.extend_from_slice(&src.octets());
    pseudo.extend_from_slice(&dst.octets());
    pseudo.push(0);
    pseudo.push(6);
    pseudo.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(segment);
    checksum::ones_complement(0, &pseudo)
}

fn build_udp_packet(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let total_len = 20 + udp_len;
    let mut packet = vec![0u8; total_len];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&ipv4_of(src).octets());
    packet[16..20].copy_from_slice(&ipv4_of(dst).octets());
    let ip_cksum = checksum::ipv4_header(&packet[..20]);
    packet[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    packet[20..22].copy_from_slice(&src.port().to_be_bytes());
    packet[22..24].copy_from_slice(&dst.port().to_be_bytes());
    packet[24..26].copy_from_slice(&(udp_len as u16).to_be_bytes());
    packet[28..].copy_from_slice(payload);
    let udp_cksum = checksum::udp_ipv4(ipv4_of(src), ipv4_of(dst), &packet[20..]);
    packet[26..28].copy_from_slice(&udp_cksum.to_be_bytes());
    packet
}

fn build_icmp_echo_request(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total_len = 20 + 8 + payload.len();
    let mut packet = vec![0u8; total_len];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 1;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    let ip_cksum = checksum::ipv4_header(&packet[..20]);
    packet[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    packet[20] = 8;
    packet[24..26].copy_from_slice(&0x4242u16.to_be_bytes());
    packet[26..28].copy_from_slice(&1u16.to_be_bytes());
    packet[28..].copy_from_slice(payload);
    let icmp_cksum = checksum::ones_complement(0, &packet[20..]);
    packet[22..24].copy_from_slice(&icmp_cksum.to_be_bytes());
    packet
}

#[derive(Debug, Clone)]
struct TcpFrame {
    dst_port: u16,
    seq: u32,
    flags: u8,
    payload: Vec<u8>,
}

fn parse_tcp_frame(frame: &[u8]) -> Option<TcpFrame> {
    if frame.len() < 40 || frame[0] >> 4 != 4 || frame[9] != 6 {
        return None;
    }
    let header_len = usize::from(frame[0] & 0x0F) * 4;
    let tcp = &frame[header_len..];
    let data_offset = usize::from(tcp[12] >> 4) * 4;
    Some(TcpFrame {
        dst_port: u16::from_be_bytes([tcp[2], tcp[3]]),
        seq: u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
        flags: tcp[13],
        payload: tcp[data_offset..].to_vec(),
    })
}

fn parse_udp_frame(frame: &[u8]) -> Option<(SocketAddr, SocketAddr, Vec<u8>)> {
    if frame.len() < 28 || frame[0] >> 4 != 4 || frame[9] != 17 {
        return None;
    }
    let src = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15])),
        u16::from_be_bytes([frame[20], frame[21]]),
    );
    let dst = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19])),
        u16::from_be_bytes([frame[22], frame[23]]),
    );
    Some((src, dst, frame[28..].to_vec()))
}

/// Minimal TCP client state machine for the harness: tracks its own
/// sequence number and the next expected server sequence, acks cumulatively,
/// and ignores retransmitted duplicates.
struct TcpClient {
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    rcv_nxt: u32,
    fin_seen: bool,
}

impl TcpClient {
    fn new(src_port: u16, dst: SocketAddr) -> Self {
        Self {
            src: client_addr(src_port),
            dst,
            seq: 1000,
            rcv_nxt: 0,
            fin_seen: false,
        }
    }

    fn syn(&mut self) -> Vec<u8> {
        self.syn_with_options(&MSS_OPTION)
    }

    fn syn_with_options(&mut self, options: &[u8]) -> Vec<u8> {
        let packet = build_tcp_packet(self.src, self.dst, self.seq, 0, SYN, options, &[]);
        self.seq = self.seq.wrapping_add(1);
        packet
    }

    fn ack(&self) -> Vec<u8> {
        build_tcp_packet(self.src, self.dst, self.seq, self.rcv_nxt, ACK, &[], &[])
    }

    fn data(&mut self, payload: &[u8]) -> Vec<u8> {
        let packet = build_tcp_packet(
            self.src,
            self.dst,
            self.seq,
            self.rcv_nxt,
            PSH | ACK,
            &[],
            payload,
        );
        self.seq = self.seq.wrapping_add(payload.len() as u32);
        packet
    }

    fn fin(&mut self) -> Vec<u8> {
        let packet =
            build_tcp_packet(self.src, self.dst, self.seq, self.rcv_nxt, FIN | ACK, &[], &[]);
        self.seq = self.seq.wrapping_add(1);
        packet
    }

    /// Update receive state from a server frame; returns any new in-order
    /// payload bytes.
    fn absorb(&mut self, frame: &TcpFrame) -> Vec<u8> {
        if frame.flags & SYN != 0 {
            self.rcv_nxt = frame.seq.wrapping_add(1);
            return Vec::new();
        }
        let mut fresh = Vec::new();
        if !frame.payload.is_empty() && frame.seq == self.rcv_nxt {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(frame.payload.len() as u32);
            fresh = frame.payload.clone();
        }
        if frame.flags & FIN != 0 {
            let fin_seq = frame.seq.wrapping_add(frame.payload.len() as u32);
            if fin_seq == self.rcv_nxt {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                self.fin_seen = true;
            }
        }
        fresh
    }

    /// Next server frame addressed to this client.
    fn recv_frame(&self, net: &TestNet, timeout: Duration) -> TcpFrame {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_else(|| panic!("no frame for client {} in time", self.src));
            match net.frames.recv_timeout(remaining) {
                Ok(frame) => {
                    if let Some(parsed) = parse_tcp_frame(&frame) {
                        if parsed.dst_port == self.src.port() {
                            return parsed;
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    panic!("no frame for client {} in time", self.src)
                }
                Err(RecvTimeoutError::Disconnected) => panic!("output sink disconnected"),
            }
        }
    }

    fn handshake(&mut self, net: &TestNet) {
        net.stack.input(&self.syn()).expect("syn input failed");
        let synack = self.recv_frame(net, Duration::from_secs(2));
        assert_eq!(synack.flags & (SYN | ACK), SYN | ACK, "expected syn-ack");
        self.absorb(&synack);
        net.stack.input(&self.ack()).expect("handshake ack failed");
    }
}

fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut predicate: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

fn io_other(error: StackError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, error.to_string())
}

#[derive(Default)]
struct EchoHandler {
    received: Mutex<Vec<u8>>,
    closes: Mutex<Vec<CloseCause>>,
    local_closes: AtomicUsize,
}

impl TcpHandler for EchoHandler {
    fn connect(&self, _flow: TcpFlow, _target: SocketAddr) -> io::Result<()> {
        Ok(())
    }

    fn did_receive(&self, flow: &TcpFlow, data: &[u8]) -> io::Result<()> {
        self.received.lock().extend_from_slice(data);
        flow.write(data).map_err(io_other)?;
        Ok(())
    }

    fn did_close(&self, _flow: &TcpFlow, cause: CloseCause) {
        self.closes.lock().push(cause);
    }

    fn local_did_close(&self, flow: &TcpFlow) {
        self.local_closes.fetch_add(1, Ordering::SeqCst);
        let _ = flow.close();
    }
}

#[test]
fn tcp_echo_round_trip() {
    let handler = Arc::new(EchoHandler::default());
    let net = build_stack(StackConfig::default(), Some(handler.clone()), None);
    let mut client = TcpClient::new(4000, server_addr(443));
    client.handshake(&net);

    net.stack
        .input(&client.data(b"HELLO\n"))
        .expect("data input failed");

    let mut echoed = Vec::new();
    while echoed.len() < 6 {
        let frame = client.recv_frame(&net, Duration::from_secs(2));
        let fresh = client.absorb(&frame);
        if !fresh.is_empty() {
            echoed.extend_from_slice(&fresh);
            net.stack.input(&client.ack()).expect("ack input failed");
        }
    }
    assert_eq!(echoed, b"HELLO\n");

    // Half-close from the client; the handler answers with its own close.
    net.stack.input(&client.fin()).expect("fin input failed");
    assert!(wait_until(Duration::from_secs(2), || {
        while let Ok(frame) = net.frames.try_recv() {
            if let Some(parsed) = parse_tcp_frame(&frame) {
                client.absorb(&parsed);
                let _ = net.stack.input(&client.ack());
            }
        }
        client.fin_seen
    }));

    assert!(
        wait_until(Duration::from_secs(2), || {
            while let Ok(frame) = net.frames.try_recv() {
                if let Some(parsed) = parse_tcp_frame(&frame) {
                    client.absorb(&parsed);
                    let _ = net.stack.input(&client.ack());
                }
            }
            net.stack.counters().tcp_flows_active == 0
        }),
        "flow table should drain after both FINs"
    );

    assert_eq!(handler.local_closes.load(Ordering::SeqCst), 1);
    let closes = handler.closes.lock().clone();
    assert_eq!(closes, vec![CloseCause::Finished], "did_close fires exactly once");
}

#[test]
fn mtu_sized_segment_is_delivered_unfragmented() {
    let handler = Arc::new(EchoHandler::default());
    let net = build_stack(StackConfig::default(), Some(handler.clone()), None);
    let mut client = TcpClient::new(4005, server_addr(80));
    client.handshake(&net);

    // 1460 payload bytes + 40 header bytes = exactly one 1500-byte packet.
    let payload = vec![0x7Eu8; 1460];
    let packet = client.data(&payload);
    assert_eq!(packet.len(), 1500);
    net.stack.input(&packet).expect("mtu packet input failed");

    assert!(wait_until(Duration::from_secs(2), || {
        handler.received.lock().len() == payload.len()
    }));
    assert!(handler.received.lock().iter().all(|&byte| byte == 0x7E));
}

struct BulkWriter {
    total: usize,
    outcome: Arc<Mutex<Option<Result<usize, String>>>>,
}

impl TcpHandler for BulkWriter {
    fn connect(&self, flow: TcpFlow, _target: SocketAddr) -> io::Result<()> {
        let total = self.total;
        let outcome = Arc::clone(&self.outcome);
        thread::spawn(move || {
            let data = vec![0xA5u8; total];
            let result = flow.write(&data).map_err(|error| error.to_string());
            *outcome.lock() = Some(result);
            let _ = flow.close();
        });
        Ok(())
    }

    fn did_receive(&self, _flow: &TcpFlow, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn did_close(&self, _flow: &TcpFlow, _cause: CloseCause) {}

    fn local_did_close(&self, _flow: &TcpFlow) {}
}

#[test]
fn large_transfer_stalls_the_writer_at_least_once() {
    let total = 64 * 1024;
    let outcome = Arc::new(Mutex::new(None));
    let handler = Arc::new(BulkWriter {
        total,
        outcome: Arc::clone(&outcome),
    });
    let net = build_stack(StackConfig::default(), Some(handler), None);
    let mut client = TcpClient::new(4010, server_addr(8080));
    client.handshake(&net);

    let mut received = Vec::with_capacity(total);
    let deadline = Instant::now() + Duration::from_secs(20);
    while received.len() < total {
        assert!(Instant::now() < deadline, "transfer did not complete in time");
        let frame = client.recv_frame(&net, Duration::from_secs(5));
        let fresh = client.absorb(&frame);
        if !fresh.is_empty() {
            received.extend_from_slice(&fresh);
            net.stack.input(&client.ack()).expect("ack input failed");
        }
    }

    assert_eq!(received.len(), total);
    assert!(received.iter().all(|&byte| byte == 0xA5), "byte stream corrupted");
    // 64 KiB through a 16 KiB send buffer cannot avoid stalling the writer.
    assert!(net.stack.counters().writes_stalled > 0);
    assert!(wait_until(Duration::from_secs(2), || outcome.lock().is_some()));
    assert_eq!(*outcome.lock(), Some(Ok(total)));
}

struct RejectingHandler {
    closes: Mutex<Vec<CloseCause>>,
}

impl TcpHandler for RejectingHandler {
    fn connect(&self, _flow: TcpFlow, _target: SocketAddr) -> io::Result<()> {
        Ok(())
    }

    fn did_receive(&self, _flow: &TcpFlow, _data: &[u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "relay lost"))
    }

    fn did_close(&self, _flow: &TcpFlow, cause: CloseCause) {
        self.closes.lock().push(cause);
    }

    fn local_did_close(&self, _flow: &TcpFlow) {}
}

#[test]
fn handler_error_aborts_with_rst() {
    let handler = Arc::new(RejectingHandler {
        closes: Mutex::new(Vec::new()),
    });
    let net = build_stack(StackConfig::default(), Some(handler.clone()), None);
    let mut client = TcpClient::new(4020, server_addr(443));
    client.handshake(&net);

    net.stack
        .input(&client.data(&[0x55; 100]))
        .expect("data input failed");

    assert!(
        wait_until(Duration::from_secs(2), || {
            while let Ok(frame) = net.frames.try_recv() {
                if let Some(parsed) = parse_tcp_frame(&frame) {
                    if parsed.dst_port == 4020 && parsed.flags & RST != 0 {
                        return true;
                    }
                }
            }
            false
        }),
        "expected an RST toward the client"
    );
    assert!(wait_until(Duration::from_millis(500), || {
        net.stack.counters().tcp_flows_active == 0
    }));
    assert_eq!(*handler.closes.lock(), vec![CloseCause::HandlerError]);
}

struct WouldBlockTwice {
    rejections: AtomicUsize,
    received: Mutex<Vec<u8>>,
}

impl TcpHandler for WouldBlockTwice {
    fn connect(&self, _flow: TcpFlow, _target: SocketAddr) -> io::Result<()> {
        Ok(())
    }

    fn did_receive(&self, _flow: &TcpFlow, data: &[u8]) -> io::Result<()> {
        if self.rejections.load(Ordering::SeqCst) < 2 {
            self.rejections.fetch_add(1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "relay busy"));
        }
        self.received.lock().extend_from_slice(data);
        Ok(())
    }

    fn did_close(&self, _flow: &TcpFlow, _cause: CloseCause) {}

    fn local_did_close(&self, _flow: &TcpFlow) {}
}

#[test]
fn would_block_redelivers_the_same_payload() {
    let handler = Arc::new(WouldBlockTwice {
        rejections: AtomicUsize::new(0),
        received: Mutex::new(Vec::new()),
    });
    let net = build_stack(StackConfig::default(), Some(handler.clone()), None);
    let mut client = TcpClient::new(4025, server_addr(443));
    client.handshake(&net);

    net.stack
        .input(&client.data(b"RETRY"))
        .expect("data input failed");

    assert!(wait_until(Duration::from_secs(2), || {
        handler.received.lock().as_slice() == b"RETRY"
    }));
    assert_eq!(handler.rejections.load(Ordering::SeqCst), 2);
}

#[test]
fn syn_with_unknown_option_still_completes_handshake() {
    let handler = Arc::new(EchoHandler::default());
    let net = build_stack(StackConfig::default(), Some(handler), None);
    let mut client = TcpClient::new(4030, server_addr(443));

    let mut options = Vec::new();
    options.extend_from_slice(&[253, 4, 0, 0]); // experimental, ignored
    options.extend_from_slice(&MSS_OPTION);
    net.stack
        .input(&client.syn_with_options(&options))
        .expect("syn input failed");
    let synack = client.recv_frame(&net, Duration::from_secs(2));
    assert_eq!(synack.flags & (SYN | ACK), SYN | ACK);
}

#[test]
fn concurrent_flows_all_echo_their_bytes() {
    const FLOWS: usize = 32;
    const PER_FLOW: usize = 1024;
    let handler = Arc::new(EchoHandler::default());
    let net = build_stack(StackConfig::default(), Some(handler), None);

    let mut clients: HashMap<u16, TcpClient> = HashMap::new();
    let mut received: HashMap<u16, Vec<u8>> = HashMap::new();
    for index in 0..FLOWS {
        let port = 5000 + index as u16;
        let mut client = TcpClient::new(port, server_addr(443));
        client.handshake(&net);
        received.insert(port, Vec::new());
        clients.insert(port, client);
    }
    for (port, client) in clients.iter_mut() {
        let payload = vec![(*port % 251) as u8; PER_FLOW];
        net.stack
            .input(&client.data(&payload))
            .expect("data input failed");
    }

    let deadline = Instant::now() + Duration::from_secs(20);
    while received.values().any(|bytes| bytes.len() < PER_FLOW) {
        assert!(Instant::now() < deadline, "concurrent transfer timed out");
        let frame = match net.frames.recv_timeout(Duration::from_secs(5)) {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        let Some(parsed) = parse_tcp_frame(&frame) else {
            continue;
        };
        let Some(client) = clients.get_mut(&parsed.dst_port) else {
            continue;
        };
        let fresh = client.absorb(&parsed);
        if !fresh.is_empty() {
            received
                .get_mut(&parsed.dst_port)
                .expect("unknown client port")
                .extend_from_slice(&fresh);
            net.stack.input(&client.ack()).expect("ack input failed");
        }
    }

    for (port, bytes) in received {
        assert_eq!(bytes.len(), PER_FLOW);
        assert!(
            bytes.iter().all(|&byte| byte == (port % 251) as u8),
            "stream for port {port} corrupted"
        );
    }
}

struct SlowUdpHandler {
    connect_delay: Duration,
    deliveries: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    flow_slot: Mutex<Option<UdpFlow>>,
    closes: AtomicUsize,
    echo: bool,
}

impl SlowUdpHandler {
    fn new(connect_delay: Duration, echo: bool) -> Self {
        Self {
            connect_delay,
            deliveries: Mutex::new(Vec::new()),
            flow_slot: Mutex::new(None),
            closes: AtomicUsize::new(0),
            echo,
        }
    }
}

impl UdpHandler for SlowUdpHandler {
    fn connect(&self, flow: UdpFlow, _target: SocketAddr) -> io::Result<()> {
        if !self.connect_delay.is_zero() {
            thread::sleep(self.connect_delay);
        }
        *self.flow_slot.lock() = Some(flow);
        Ok(())
    }

    fn did_receive_to(&self, flow: &UdpFlow, data: &[u8], target: SocketAddr) -> io::Result<()> {
        self.deliveries.lock().push((data.to_vec(), target));
        if self.echo {
            flow.write_from(data, target).map_err(io_other)?;
        }
        Ok(())
    }

    fn did_close(&self, _flow: &UdpFlow) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn udp_one_shot_is_delivered_exactly_once_after_connect() {
    let handler = Arc::new(SlowUdpHandler::new(Duration::from_millis(100), true));
    let net = build_stack(StackConfig::default(), None, Some(handler.clone()));

    let src = client_addr(4100);
    let dst = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 53);
    let query = vec![0xDD; 42];
    net.stack
        .input(&build_udp_packet(src, dst, &query))
        .expect("datagram input failed");

    // Nothing is delivered while the handler is still connecting.
    assert!(handler.deliveries.lock().is_empty());
    assert!(wait_until(Duration::from_secs(2), || {
        handler.deliveries.lock().len() == 1
    }));
    {
        let deliveries = handler.deliveries.lock();
        assert_eq!(deliveries[0].0, query);
        assert_eq!(deliveries[0].1, dst);
    }

    // The echoed reply is forged from the impersonated destination.
    let frame = net
        .frames
        .recv_timeout(Duration::from_secs(2))
        .expect("no udp reply emitted");
    let (reply_src, reply_dst, payload) = parse_udp_frame(&frame).expect("reply not udp");
    assert_eq!(reply_src, dst);
    assert_eq!(reply_dst, src);
    assert_eq!(payload, query);

    // No duplicate delivery afterwards.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(handler.deliveries.lock().len(), 1);
}

#[test]
fn udp_pending_slot_drops_overflow_while_connecting() {
    let handler = Arc::new(SlowUdpHandler::new(Duration::from_millis(150), false));
    let net = build_stack(StackConfig::default(), None, Some(handler.clone()));

    let src = client_addr(4110);
    let dst = server_addr(5353);
    net.stack
        .input(&build_udp_packet(src, dst, b"first"))
        .expect("first datagram failed");
    net.stack
        .input(&build_udp_packet(src, dst, b"second"))
        .expect("second datagram failed");

    assert!(wait_until(Duration::from_secs(2), || {
        handler.deliveries.lock().len() == 1
    }));
    assert_eq!(handler.deliveries.lock()[0].0, b"first");
    assert_eq!(net.stack.counters().udp_pending_dropped, 1);
}

#[test]
fn oversized_udp_write_is_rejected() {
    let handler = Arc::new(SlowUdpHandler::new(Duration::ZERO, false));
    let net = build_stack(StackConfig::default(), None, Some(handler.clone()));

    let src = client_addr(4120);
    let dst = server_addr(9000);
    net.stack
        .input(&build_udp_packet(src, dst, b"hi"))
        .expect("datagram input failed");
    assert!(wait_until(Duration::from_secs(2), || {
        handler.flow_slot.lock().is_some()
    }));

    let flow = handler.flow_slot.lock().clone().expect("flow missing");
    let oversized = vec![0u8; 1500];
    assert!(matches!(
        flow.write_from(&oversized, dst),
        Err(StackError::OversizedDatagram)
    ));
}

#[test]
fn idle_udp_flow_is_pruned_and_handler_notified() {
    let config = StackConfig {
        udp_timeout: Duration::from_millis(100),
        tcp_poll_interval_ticks: 1,
        ..StackConfig::default()
    };
    let handler = Arc::new(SlowUdpHandler::new(Duration::ZERO, false));
    let net = build_stack(config, None, Some(handler.clone()));

    let src = client_addr(4130);
    let dst = server_addr(7000);
    net.stack
        .input(&build_udp_packet(src, dst, b"ping"))
        .expect("datagram input failed");
    assert!(wait_until(Duration::from_secs(1), || {
        net.stack.counters().udp_flows_active == 1
    }));

    assert!(wait_until(Duration::from_secs(3), || {
        handler.closes.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(net.stack.counters().udp_flows_active, 0);
}

#[test]
fn icmp_echo_reply_is_delayed_by_configuration() {
    let config = StackConfig {
        icmp_delay_ms: 50,
        ..StackConfig::default()
    };
    let net = build_stack(config, None, None);

    let request = build_icmp_echo_request(
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(8, 8, 8, 8),
        b"probe",
    );
    let started = Instant::now();
    net.stack.input(&request).expect("icmp input failed");

    let frame = net
        .frames
        .recv_timeout(Duration::from_secs(2))
        .expect("no echo reply emitted");
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(frame[9], 1);
    assert_eq!(frame[20], 0, "expected an echo reply");
    assert_eq!(&frame[12..16], &[8, 8, 8, 8]);
    assert_eq!(&frame[16..20], &[10, 0, 0, 2]);
    assert_eq!(&frame[28..], b"probe");
}

#[test]
fn icmp_echo_reply_is_immediate_without_delay() {
    let net = build_stack(StackConfig::default(), None, None);
    let request = build_icmp_echo_request(
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(1, 1, 1, 1),
        b"now",
    );
    net.stack.input(&request).expect("icmp input failed");
    let frame = net
        .frames
        .recv_timeout(Duration::from_secs(1))
        .expect("no echo reply emitted");
    assert_eq!(frame[20], 0);
    assert_eq!(net.stack.counters().icmp_echoes, 1);
}

#[test]
fn malformed_packets_are_counted_and_rejected() {
    let net = build_stack(StackConfig::default(), None, None);

    assert!(matches!(
        net.stack.input(&[0xF0; 32]),
        Err(StackError::MalformedPacket(_))
    ));

    // Declared IPv4 length disagreeing with the buffer is also malformed.
    let mut packet = vec![0u8; 60];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&40u16.to_be_bytes());
    packet[9] = 6;
    assert!(matches!(
        net.stack.input(&packet),
        Err(StackError::MalformedPacket(_))
    ));
    assert_eq!(net.stack.counters().malformed_packets, 2);
}

#[test]
fn registration_is_rejected_after_first_input() {
    let handler = Arc::new(EchoHandler::default());
    let net = build_stack(StackConfig::default(), Some(handler), None);

    let request = build_icmp_echo_request(
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(9, 9, 9, 9),
        b"seal",
    );
    net.stack.input(&request).expect("icmp input failed");

    let late = Arc::new(EchoHandler::default());
    assert!(matches!(
        net.stack.register_tcp_handler(late),
        Err(StackError::Registration(_))
    ));
    assert!(matches!(
        net.stack.register_output_fn(|packet| Ok(packet.len())),
        Err(StackError::Registration(_))
    ));
}

#[test]
fn stray_segment_for_unknown_flow_draws_rst() {
    let handler = Arc::new(EchoHandler::default());
    let net = build_stack(StackConfig::default(), Some(handler), None);

    let src = client_addr(4140);
    let dst = server_addr(443);
    // Pure ACK for a tuple the stack has never seen.
    let stray = build_tcp_packet(src, dst, 5000, 6000, ACK, &[], &[]);
    net.stack.input(&stray).expect("stray input failed");

    assert!(
        wait_until(Duration::from_secs(2), || {
            while let Ok(frame) = net.frames.try_recv() {
                if let Some(parsed) = parse_tcp_frame(&frame) {
                    if parsed.dst_port == 4140 && parsed.flags & RST != 0 {
                        return true;
                    }
                }
            }
            false
        }),
        "expected RST for a stray segment"
    );
    assert_eq!(net.stack.counters().stray_tcp_segments, 1);
}
