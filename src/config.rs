use std::time::Duration;

pub(crate) const MIN_MTU: usize = 576;
pub(crate) const MAX_MTU: usize = 9000;

/// Tick length of the flow poll timer. `tcp_poll_interval_ticks` counts in
/// units of this duration.
pub(crate) const POLL_TICK: Duration = Duration::from_millis(500);

/// Recognized stack options. Everything else about the stack's behavior is
/// fixed; see the per-module constants in `engine::state`.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Maximum IP packet size. Constrains the advertised MSS.
    pub mtu: usize,
    /// When non-zero, inbound ICMP packets are held this long before the
    /// echo path sees them.
    pub icmp_delay_ms: u64,
    /// Idle timeout after which a UDP pseudo-flow is removed and its
    /// handler notified.
    pub udp_timeout: Duration,
    /// Period between flow-level `poll` passes, in 500 ms ticks.
    pub tcp_poll_interval_ticks: u32,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            icmp_delay_ms: 0,
            udp_timeout: Duration::from_secs(60),
            tcp_poll_interval_ticks: 2,
        }
    }
}

impl StackConfig {
    pub(crate) fn normalized(mut self) -> Self {
        self.mtu = self.mtu.clamp(MIN_MTU, MAX_MTU);
        if self.tcp_poll_interval_ticks == 0 {
            self.tcp_poll_interval_ticks = 1;
        }
        self
    }

    pub(crate) fn flow_poll_interval(&self) -> Duration {
        POLL_TICK * self.tcp_poll_interval_ticks
    }

    pub(crate) fn icmp_delay(&self) -> Duration {
        Duration::from_millis(self.icmp_delay_ms)
    }

    /// Largest UDP payload that fits into one IP packet at this MTU.
    pub(crate) fn max_udp_payload(&self, ipv6: bool) -> usize {
        let header = if ipv6 { 40 + 8 } else { 20 + 8 };
        self.mtu.saturating_sub(header)
    }
}
