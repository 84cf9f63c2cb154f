//! Inbound dispatch: validate the IP header, then hand the packet to the
//! TCP engine, the UDP flow table, or the ICMP echo path.

use crate::device::{self, ParsedPacket};
use crate::engine::{
    close_udp_for_error, spawn_tcp_flow, spawn_udp_flow, Engine, TcpIngress, UdpIngress,
};
use crate::error::StackError;
use crate::Shared;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

pub(crate) fn input(stack: &crate::Stack, packet: &[u8]) -> Result<(), StackError> {
    let packet = device::strip_link_framing(packet);
    let parsed = match device::parse_packet(packet) {
        Ok(parsed) => parsed,
        Err(error) => {
            log::warn!("dropping inbound packet: {error}");
            stack.engine.lock().note_malformed();
            return Err(error);
        }
    };
    match parsed {
        ParsedPacket::Tcp(segment) => {
            let ingress = stack.engine.lock().note_tcp_segment(&segment);
            match ingress {
                TcpIngress::Forward => stack.tun.push_inbound(packet),
                TcpIngress::ForwardAndSpawn(spawn) => {
                    // Admission already installed the listener, so the SYN
                    // can go straight in.
                    stack.tun.push_inbound(packet);
                    spawn_tcp_flow(spawn);
                }
                TcpIngress::Drop => {}
            }
            Ok(())
        }
        ParsedPacket::Udp(datagram) => {
            let ingress = stack.engine.lock().note_udp_datagram(&datagram);
            match ingress {
                UdpIngress::Deliver(flow, handler) => {
                    if let Err(error) =
                        handler.did_receive_to(&flow, datagram.payload, datagram.dst)
                    {
                        log::warn!("udp handler rejected datagram ({error}), closing flow");
                        close_udp_for_error(&flow, handler.as_ref());
                    }
                }
                UdpIngress::Spawn(spawn) => spawn_udp_flow(spawn),
                UdpIngress::Buffered | UdpIngress::Dropped => {}
            }
            Ok(())
        }
        ParsedPacket::Icmp => {
            if let Some(delay) = stack.icmp_delay.get() {
                let deadline = Instant::now() + stack.shared.config.icmp_delay();
                let _ = delay.send((deadline, packet.to_vec()));
            } else {
                icmp_reply(&stack.shared, &stack.engine, packet);
            }
            Ok(())
        }
        ParsedPacket::Other => {
            log::trace!("dropping packet with unhandled transport protocol");
            Ok(())
        }
    }
}

pub(crate) fn icmp_reply(shared: &Shared, engine: &Mutex<Engine>, packet: &[u8]) {
    let Some(reply) = crate::engine::packet_builder::build_icmp_echo_reply(packet) else {
        log::trace!("ignoring non-echo icmp packet");
        return;
    };
    match shared.emit(&reply) {
        Ok(_) => {
            let mut engine = engine.lock();
            engine.note_icmp_echo();
            engine.note_emitted(1, reply.len() as u64);
        }
        Err(error) => log::warn!("failed to emit icmp echo reply: {error}"),
    }
}

/// Single-thread delay line for ICMP packets. Every packet carries the same
/// delay, so deadlines stamped at ingress arrive in FIFO order and one
/// worker suffices instead of a timer per packet.
pub(crate) fn start_icmp_delay_line(
    shared: Arc<Shared>,
    engine: Arc<Mutex<Engine>>,
) -> Sender<(Instant, Vec<u8>)> {
    let (tx, rx) = unbounded::<(Instant, Vec<u8>)>();
    let spawned = thread::Builder::new()
        .name("icmp-delay".to_string())
        .spawn(move || {
            while let Ok((deadline, packet)) = rx.recv() {
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                }
                icmp_reply(&shared, &engine, &packet);
            }
        });
    if let Err(error) = spawned {
        log::error!("failed to spawn icmp delay thread: {error}");
    }
    tx
}
