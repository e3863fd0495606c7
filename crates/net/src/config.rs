use std::time::Duration;

use crate::stats::PacketLossSimulation;

/// Identity presented in the circuit-establishment request.
#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitIdentity {
    pub circuit_code: u32,
    pub session_id: [u8; 16],
    pub agent_id: [u8; 16],
}

/// Tunables for one circuit. The defaults match the peer's expectations;
/// tests shrink the timing knobs.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Ack flush / resend sweep cadence.
    pub resend_interval: Duration,
    /// Age at which an unacked reliable packet is resent.
    pub resend_timeout: Duration,
    /// Resends per packet before it is dropped as undeliverable.
    pub max_resends: u32,
    /// Pending inbound acks that force an explicit ack packet.
    pub ack_flush_threshold: usize,
    /// Liveness probe cadence.
    pub ping_interval: Duration,
    /// One-second samples in the rate window.
    pub stats_window: usize,
    /// Duplicate archive capacity.
    pub archive_capacity: usize,
    /// Socket read timeout; bounds shutdown latency of the receive loop.
    pub read_timeout: Duration,
    /// Give up on the handshake after this long without the region's
    /// movement-complete signal.
    pub handshake_timeout: Duration,
    /// Drop a connected circuit after this long without any inbound
    /// traffic.
    pub traffic_timeout: Duration,
    pub loss_simulation: PacketLossSimulation,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            resend_interval: Duration::from_millis(500),
            resend_timeout: Duration::from_millis(4000),
            max_resends: 3,
            ack_flush_threshold: 10,
            ping_interval: Duration::from_secs(5),
            stats_window: 5,
            archive_capacity: 256,
            read_timeout: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(10),
            traffic_timeout: Duration::from_secs(30),
            loss_simulation: PacketLossSimulation::default(),
        }
    }
}
