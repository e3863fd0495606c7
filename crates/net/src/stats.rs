use std::collections::VecDeque;

/// Per-circuit traffic counters. Monotonic within a session; read by
/// collaborators, written continuously by the transport.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_resent: u64,
    pub packets_dropped: u64,
    pub duplicates_suppressed: u64,
    pub ping_rtt_ms: f32,
    pub time_dilation: f32,
    pub send_rate: f32,
    pub recv_rate: f32,
}

/// Rolling window of one-second byte counts; the mean is the instantaneous
/// rate in bytes per second.
#[derive(Debug)]
pub struct RateWindow {
    samples: VecDeque<u64>,
    capacity: usize,
    current: u64,
}

impl RateWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            current: 0,
        }
    }

    pub fn record(&mut self, bytes: usize) {
        self.current += bytes as u64;
    }

    /// Close the current one-second sample and roll the window.
    pub fn tick(&mut self) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(self.current);
        self.current = 0;
    }

    pub fn bytes_per_second(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f32 / self.samples.len() as f32
    }
}

/// Inbound packet-loss conditioner for soak testing; disabled by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    pub loss_percent: f32,
}

impl PacketLossSimulation {
    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rand_percent() * 100.0 < self.loss_percent
    }
}

pub fn rand_percent() -> f32 {
    rand_u64() as f32 / u64::MAX as f32
}

pub fn rand_u64() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::Instant;

    let mut hasher = DefaultHasher::new();
    Instant::now().hash(&mut hasher);
    hasher.finish()
}
