//! User-space termination of TUN-routed TCP/UDP traffic.
//!
//! A [`Stack`] sits between a TUN byte stream and a pair of proxy handlers.
//! IP packets fed through [`Stack::input`] are demultiplexed and terminated
//! locally: every TCP connection and UDP pseudo-flow surfaces to the
//! registered [`TcpHandler`] / [`UdpHandler`] as a flow handle, and whatever
//! the handlers write back is re-encapsulated into IP packets and emitted
//! through the registered output sink.

mod config;
mod demux;
mod device;
mod engine;
mod error;
mod filter;
mod handler;
mod pool;

pub use config::StackConfig;
pub use engine::{StackCounters, StackStats, TcpFlow, TcpState, UdpFlow, UdpState};
pub use error::{CloseCause, StackError};
pub use filter::{
    AppLogFilter, IcmpDelayFilter, PacketSink, RouteAction, Router, RoutingFilter, Transport,
};
pub use handler::{TcpHandler, UdpHandler};

use crate::device::{TunDevice, TunHandle};
use crate::engine::Engine;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use smoltcp::time::Instant as SmolInstant;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

pub(crate) type OutputFn = Box<dyn Fn(&[u8]) -> io::Result<usize> + Send + Sync>;

/// State shared between the stack, the engine, and every flow handle.
pub(crate) struct Shared {
    pub(crate) config: StackConfig,
    output: OnceCell<OutputFn>,
    pub(crate) tcp_handler: OnceCell<Arc<dyn TcpHandler>>,
    pub(crate) udp_handler: OnceCell<Arc<dyn UdpHandler>>,
    pub(crate) wake: Arc<Notify>,
    running: AtomicBool,
    sealed: AtomicBool,
}

impl Shared {
    /// Write one IP packet to the registered output sink. Thread-safe; the
    /// sink's own device handle serializes the actual TUN write.
    pub(crate) fn emit(&self, packet: &[u8]) -> Result<usize, StackError> {
        let Some(output) = self.output.get() else {
            return Err(StackError::Registration("output sink not set"));
        };
        output(packet).map_err(StackError::Io)
    }
}

/// The user-space TCP/IP stack. One value per TUN device; handlers and the
/// output sink are carried inside it rather than in process globals.
pub struct Stack {
    pub(crate) shared: Arc<Shared>,
    pub(crate) engine: Arc<Mutex<Engine>>,
    pub(crate) tun: TunHandle,
    pub(crate) icmp_delay: OnceCell<crossbeam_channel::Sender<(StdInstant, Vec<u8>)>>,
    runtime: Runtime,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl Stack {
    pub fn new(config: StackConfig) -> anyhow::Result<Self> {
        let config = config.normalized();
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()?;

        let wake = Arc::new(Notify::new());
        let shared = Arc::new(Shared {
            config: config.clone(),
            output: OnceCell::new(),
            tcp_handler: OnceCell::new(),
            udp_handler: OnceCell::new(),
            wake: Arc::clone(&wake),
            running: AtomicBool::new(false),
            sealed: AtomicBool::new(false),
        });

        let device = TunDevice::new(config.mtu, Arc::clone(&wake));
        let tun = device.handle();
        let engine = Arc::new(Mutex::new(Engine::new(device, Arc::clone(&shared))));
        engine.lock().bind_self(Arc::downgrade(&engine));

        log::debug!("stack initialized (mtu={})", config.mtu);
        Ok(Self {
            shared,
            engine,
            tun,
            icmp_delay: OnceCell::new(),
            runtime,
            poll_task: Mutex::new(None),
        })
    }

    /// Install the outbound sink. Must be called exactly once, before the
    /// first `input`.
    pub fn register_output_fn<F>(&self, output: F) -> Result<(), StackError>
    where
        F: Fn(&[u8]) -> io::Result<usize> + Send + Sync + 'static,
    {
        if self.shared.sealed.load(Ordering::Acquire) {
            return Err(StackError::Registration("output sink after first packet"));
        }
        self.shared
            .output
            .set(Box::new(output))
            .map_err(|_| StackError::Registration("output sink already set"))
    }

    /// Install the TCP proxy handler. One slot, set at most once, before the
    /// first `input`.
    pub fn register_tcp_handler(&self, handler: Arc<dyn TcpHandler>) -> Result<(), StackError> {
        if self.shared.sealed.load(Ordering::Acquire) {
            return Err(StackError::Registration("tcp handler after first packet"));
        }
        self.shared
            .tcp_handler
            .set(handler)
            .map_err(|_| StackError::Registration("tcp handler already set"))
    }

    /// Install the UDP proxy handler. One slot, set at most once, before the
    /// first `input`.
    pub fn register_udp_handler(&self, handler: Arc<dyn UdpHandler>) -> Result<(), StackError> {
        if self.shared.sealed.load(Ordering::Acquire) {
            return Err(StackError::Registration("udp handler after first packet"));
        }
        self.shared
            .udp_handler
            .set(handler)
            .map_err(|_| StackError::Registration("udp handler already set"))
    }

    /// Start the poll loop. Requires the output sink to be registered.
    pub fn start(&self) -> Result<(), StackError> {
        if self.shared.output.get().is_none() {
            return Err(StackError::Registration("output sink must be set before start"));
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.shared.config.icmp_delay_ms > 0 {
            let sender = demux::start_icmp_delay_line(
                Arc::clone(&self.shared),
                Arc::clone(&self.engine),
            );
            let _ = self.icmp_delay.set(sender);
        }
        self.spawn_poll_loop();
        log::debug!("stack poll loop running");
        Ok(())
    }

    /// Submit one inbound IP packet, in TUN read order. The packet buffer is
    /// not retained past the call.
    pub fn input(&self, packet: &[u8]) -> Result<(), StackError> {
        if self.shared.output.get().is_none() {
            return Err(StackError::Registration("output sink must be set before input"));
        }
        self.shared.sealed.store(true, Ordering::Release);
        demux::input(self, packet)
    }

    pub fn counters(&self) -> StackCounters {
        self.engine.lock().counters()
    }

    pub fn stats(&self) -> StackStats {
        self.engine.lock().stats()
    }

    /// Stop the poll loop. Flows already handed to handlers stay valid for
    /// teardown calls but no further events are routed.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.notify_waiters();
        if let Some(handle) = self.poll_task.lock().take() {
            handle.abort();
        }
        log::debug!("stack stopped");
    }

    fn spawn_poll_loop(&self) {
        let engine = Arc::clone(&self.engine);
        let shared = Arc::clone(&self.shared);
        let tun = self.tun.clone();
        let handle = self.runtime.spawn(async move {
            let epoch = StdInstant::now();
            let flow_interval = shared.config.flow_poll_interval();
            let mut next_flow_poll = StdInstant::now() + flow_interval;
            let mut ticker = time::interval(Duration::from_millis(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shared.wake.notified() => {}
                }
                if !shared.running.load(Ordering::Acquire) {
                    break;
                }
                let now_ms = epoch.elapsed().as_millis().min(i64::MAX as u128) as i64;
                let mut idle_closures = Vec::new();
                {
                    let mut engine = engine.lock();
                    engine.poll(SmolInstant::from_millis(now_ms));
                    if StdInstant::now() >= next_flow_poll {
                        idle_closures = engine.poll_flows(StdInstant::now());
                        next_flow_poll = StdInstant::now() + flow_interval;
                    }
                }
                let frames = tun.drain_outbound();
                if !frames.is_empty() {
                    let mut bytes = 0u64;
                    let mut emitted = 0u64;
                    for frame in &frames {
                        match shared.emit(frame) {
                            Ok(_) => {
                                emitted += 1;
                                bytes += frame.len() as u64;
                            }
                            Err(error) => log::warn!("output sink rejected frame: {error}"),
                        }
                    }
                    engine.lock().note_emitted(emitted, bytes);
                }
                for (flow, handler) in idle_closures {
                    handler.did_close(&flow);
                }
            }
        });
        *self.poll_task.lock() = Some(handle);
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.stop();
    }
}
