//! Socket ownership, the receive loop, and the per-circuit timers.
//!
//! One `PacketTransport` drives one circuit: a dedicated thread blocks on
//! the socket (with a short read timeout so shutdown is prompt) and three
//! timer threads handle ack flushing/resends, statistics sampling, and the
//! liveness ping. All four are keyed off a single run flag and joined as a
//! unit, so nothing can touch the socket after close.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::CircuitConfig;
use crate::event::{DisconnectReason, SimulatorEvent};
use crate::message::{self, PacketAck, Ping, PingReply};
use crate::object::{self, ObjectUpdate};
use crate::protocol::{
    acks_that_fit, float_to_u16, read_appended_acks, write_appended_acks, PacketFlags,
    PacketHeader, MAX_PACKET_SIZE, MIN_HEADER_SIZE,
};
use crate::reliability::{
    Delivery, DuplicateArchive, OutgoingPacket, PendingAckSet, SequenceCounter, UnackedMap,
};
use crate::stats::{ConnectionStats, RateWindow};
use crate::zerocode;

const STATS_TICK: Duration = Duration::from_secs(1);
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    #[error("circuit closed")]
    CircuitClosed,
    #[error("not connected to a region")]
    NotConnected,
    #[error("packet of {len} bytes exceeds the {max}-byte limit")]
    Oversized { len: usize, max: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug)]
struct QueuedSend {
    msg_id: u8,
    payload: Vec<u8>,
    reliable: bool,
    zerocode: bool,
}

#[derive(Debug, Default)]
struct PingState {
    next_id: u8,
    outstanding: Option<(u8, Instant)>,
}

/// State shared between the public API, the receive loop, and the timers.
pub(crate) struct CircuitShared {
    socket: UdpSocket,
    peer: SocketAddr,
    config: CircuitConfig,
    running: AtomicBool,
    paused: AtomicBool,
    state: AtomicU8,
    started_at: Instant,
    last_receive: Mutex<Instant>,
    sequence: SequenceCounter,
    pending_acks: Mutex<PendingAckSet>,
    unacked: Mutex<UnackedMap>,
    archive: Mutex<DuplicateArchive>,
    queued: Mutex<Vec<QueuedSend>>,
    ping: Mutex<PingState>,
    stats: Mutex<ConnectionStats>,
    send_window: Mutex<RateWindow>,
    recv_window: Mutex<RateWindow>,
    events: Sender<SimulatorEvent>,
}

impl CircuitShared {
    fn new(
        socket: UdpSocket,
        peer: SocketAddr,
        config: CircuitConfig,
        events: Sender<SimulatorEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            socket,
            peer,
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            started_at: Instant::now(),
            last_receive: Mutex::new(Instant::now()),
            sequence: SequenceCounter::new(),
            pending_acks: Mutex::new(PendingAckSet::new()),
            unacked: Mutex::new(UnackedMap::new(config.resend_timeout, config.max_resends)),
            archive: Mutex::new(DuplicateArchive::new(config.archive_capacity)),
            queued: Mutex::new(Vec::new()),
            ping: Mutex::new(PingState::default()),
            stats: Mutex::new(ConnectionStats::default()),
            send_window: Mutex::new(RateWindow::new(config.stats_window)),
            recv_window: Mutex::new(RateWindow::new(config.stats_window)),
            events,
            config,
        })
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn stats(&self) -> ConnectionStats {
        self.stats.lock().unwrap().clone()
    }

    fn emit(&self, event: SimulatorEvent) {
        let _ = self.events.send(event);
    }

    /// Serialize and send one packet: sequence assignment, optional
    /// zerocoding, ack piggybacking, reliable registration. Locks are held
    /// only for the individual map mutations, never across the socket call.
    pub(crate) fn send_with(
        &self,
        msg_id: u8,
        payload: &[u8],
        reliable: bool,
        zerocode: bool,
        piggyback: bool,
    ) -> Result<u32, CircuitError> {
        if !self.is_running() {
            return Err(CircuitError::CircuitClosed);
        }

        let mut flags = PacketFlags::empty();
        if reliable {
            flags |= PacketFlags::RELIABLE;
        }

        let mut body = Vec::with_capacity(payload.len() + 1);
        body.push(msg_id);
        body.extend_from_slice(payload);

        // Fall back to the plain body when compression does not pay.
        if zerocode {
            if let Some(encoded) = zerocode::encode_body(&body) {
                flags |= PacketFlags::ZEROCODED;
                body = encoded;
            }
        }

        let sequence = self.sequence.next();
        let mut out = Vec::with_capacity(MIN_HEADER_SIZE + body.len());
        PacketHeader::new(flags, sequence).write(&mut out);
        out.extend_from_slice(&body);

        if out.len() > MAX_PACKET_SIZE {
            return Err(CircuitError::Oversized {
                len: out.len(),
                max: MAX_PACKET_SIZE,
            });
        }

        if piggyback {
            let room = acks_that_fit(out.len()).min(u8::MAX as usize);
            if room > 0 {
                let acks = self.pending_acks.lock().unwrap().drain(room);
                if !acks.is_empty() {
                    out[0] =
                        (PacketFlags::from_byte(out[0]) | PacketFlags::APPENDED_ACKS).to_byte();
                    write_appended_acks(&mut out, &acks);
                }
            }
        }

        if reliable {
            self.unacked
                .lock()
                .unwrap()
                .register(OutgoingPacket::new(sequence, out.clone()));
        }

        self.socket.send_to(&out, self.peer)?;

        {
            let mut stats = self.stats.lock().unwrap();
            stats.packets_sent += 1;
            stats.bytes_sent += out.len() as u64;
        }
        self.send_window.lock().unwrap().record(out.len());

        Ok(sequence)
    }

    /// Application send path: queued while the handshake or a pause is in
    /// flight, rejected once the circuit is gone.
    pub(crate) fn submit(
        &self,
        msg_id: u8,
        payload: &[u8],
        reliable: bool,
        zerocode: bool,
    ) -> Result<Option<u32>, CircuitError> {
        if !self.is_running() {
            return Err(CircuitError::CircuitClosed);
        }
        match self.state() {
            ConnectionState::Disconnected => Err(CircuitError::NotConnected),
            ConnectionState::Connected if !self.paused.load(Ordering::SeqCst) => self
                .send_with(msg_id, payload, reliable, zerocode, true)
                .map(Some),
            _ => {
                self.queued.lock().unwrap().push(QueuedSend {
                    msg_id,
                    payload: payload.to_vec(),
                    reliable,
                    zerocode,
                });
                Ok(None)
            }
        }
    }

    pub(crate) fn pause(&self) -> Result<(), CircuitError> {
        self.paused.store(true, Ordering::SeqCst);
        self.send_with(message::AGENT_PAUSE, &[], true, false, true)?;
        Ok(())
    }

    pub(crate) fn resume(&self) -> Result<(), CircuitError> {
        self.send_with(message::AGENT_RESUME, &[], true, false, true)?;
        self.paused.store(false, Ordering::SeqCst);
        self.flush_queued();
        Ok(())
    }

    /// The region acknowledged us; the circuit is open for business.
    pub(crate) fn region_ready(&self) {
        let was = self.state.compare_exchange(
            ConnectionState::Connecting as u8,
            ConnectionState::Connected as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if was.is_ok() {
            log::info!("circuit to {} established", self.peer);
            self.emit(SimulatorEvent::Connected);
            self.flush_queued();
        }
    }

    fn flush_queued(&self) {
        let queued: Vec<QueuedSend> = std::mem::take(&mut *self.queued.lock().unwrap());
        for send in queued {
            if let Err(err) =
                self.send_with(send.msg_id, &send.payload, send.reliable, send.zerocode, true)
            {
                log::warn!("queued send of message {} failed: {err}", send.msg_id);
            }
        }
    }

    /// Stop the circuit: flip the run flag, optionally notify the peer,
    /// and report why. Idempotent; later calls are no-ops.
    pub(crate) fn shutdown(&self, reason: DisconnectReason, notify_peer: bool) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if notify_peer {
            let mut out = Vec::with_capacity(MIN_HEADER_SIZE + 1);
            PacketHeader::new(PacketFlags::empty(), self.sequence.next()).write(&mut out);
            out.push(message::CLOSE_CIRCUIT);
            let _ = self.socket.send_to(&out, self.peer);
        }

        self.state
            .store(ConnectionState::Disconnected as u8, Ordering::SeqCst);
        log::info!("circuit to {} closed: {reason:?}", self.peer);
        self.emit(SimulatorEvent::Disconnected { reason });
    }

    // Inbound pipeline

    fn handle_datagram(&self, data: &[u8]) {
        if self.config.loss_simulation.should_drop() {
            log::debug!("loss simulation dropped an inbound packet");
            return;
        }

        let header = match PacketHeader::parse(data) {
            Ok(header) => header,
            Err(err) => {
                log::warn!("dropping malformed datagram from {}: {err}", self.peer);
                return;
            }
        };

        {
            let mut stats = self.stats.lock().unwrap();
            stats.packets_received += 1;
            stats.bytes_received += data.len() as u64;
        }
        self.recv_window.lock().unwrap().record(data.len());

        // The ack trailer is never zerocoded; read it off the raw datagram.
        let mut trailer_len = 0;
        if header.flags.contains(PacketFlags::APPENDED_ACKS) {
            match read_appended_acks(data) {
                Ok((acks, len)) => {
                    trailer_len = len;
                    self.process_acks(&acks);
                }
                Err(err) => {
                    log::warn!("dropping datagram with bad ack trailer: {err}");
                    return;
                }
            }
        }

        if header.body_offset() + trailer_len > data.len() {
            log::warn!("dropping datagram whose ack trailer overlaps its header");
            return;
        }
        let raw_body = &data[header.body_offset()..data.len() - trailer_len];

        let decoded;
        let body: &[u8] = if header.flags.contains(PacketFlags::ZEROCODED) {
            match zerocode::decode_body(raw_body, MAX_PACKET_SIZE * zerocode::MAX_EXPANSION) {
                Ok(expanded) => {
                    decoded = expanded;
                    &decoded
                }
                Err(err) => {
                    log::warn!("dropping packet {}: {err}", header.sequence);
                    return;
                }
            }
        } else {
            raw_body
        };

        let Some((&msg_id, payload)) = body.split_first() else {
            log::warn!("dropping packet {} with an empty body", header.sequence);
            return;
        };

        if header.flags.contains(PacketFlags::RELIABLE)
            && !self.record_reliable(header.sequence, header.flags.contains(PacketFlags::RESENT))
        {
            return;
        }

        self.dispatch(msg_id, payload);
    }

    /// Queue the ack and decide whether the packet reaches collaborators.
    /// Duplicates are acked again but never redelivered.
    fn record_reliable(&self, sequence: u32, resent: bool) -> bool {
        let delivery = self.archive.lock().unwrap().witness(sequence, resent);

        let should_flush = {
            let mut acks = self.pending_acks.lock().unwrap();
            acks.insert(sequence);
            acks.len() >= self.config.ack_flush_threshold
        };
        if should_flush {
            self.flush_acks();
        }

        match delivery {
            Delivery::New => {}
            Delivery::ResentNew => {
                log::debug!("packet {sequence}: first delivery of a retransmit");
            }
            Delivery::Duplicate => {
                log::debug!("packet {sequence}: suppressing retransmitted duplicate");
            }
            Delivery::AnomalousDuplicate => {
                log::warn!("packet {sequence}: duplicate without the resent flag");
            }
        }

        if !delivery.should_deliver() {
            self.stats.lock().unwrap().duplicates_suppressed += 1;
        }
        delivery.should_deliver()
    }

    fn process_acks(&self, sequences: &[u32]) {
        for &sequence in sequences {
            if self.unacked.lock().unwrap().ack(sequence).is_none() {
                log::warn!("peer acked packet {sequence} we never sent");
            }
        }
    }

    fn dispatch(&self, msg_id: u8, payload: &[u8]) {
        match msg_id {
            message::PACKET_ACK => match PacketAck::decode(payload) {
                Ok(ack) => self.process_acks(&ack.sequences),
                Err(err) => log::warn!("bad explicit ack payload: {err}"),
            },
            message::START_PING_CHECK => match Ping::decode(payload) {
                Ok(ping) => self.answer_ping(ping),
                Err(err) => log::warn!("bad ping payload: {err}"),
            },
            message::COMPLETE_PING_CHECK => match PingReply::decode(payload) {
                Ok(reply) => self.complete_ping(reply),
                Err(err) => log::warn!("bad ping reply payload: {err}"),
            },
            message::MOVEMENT_COMPLETE => self.region_ready(),
            message::CLOSE_CIRCUIT => {
                self.shutdown(DisconnectReason::Closed, false);
            }
            id if message::is_object_update(id) => match object::decode_packet(id, payload) {
                Ok(packet) => {
                    self.stats.lock().unwrap().time_dilation = packet.dilation();
                    self.request_cache_misses(&packet.updates);
                    self.emit(SimulatorEvent::ObjectUpdate(packet));
                }
                Err(err) => log::warn!("dropping object update: {err}"),
            },
            _ => self.emit(SimulatorEvent::Packet {
                msg_id,
                payload: payload.to_vec(),
            }),
        }
    }

    /// Cached updates we hold no cache for turn into a fresh full request.
    fn request_cache_misses(&self, updates: &[ObjectUpdate]) {
        let local_ids: Vec<u32> = updates
            .iter()
            .filter_map(|update| match update {
                ObjectUpdate::CacheMiss { local_id, .. } => Some(*local_id),
                _ => None,
            })
            .collect();

        for chunk in local_ids.chunks(u8::MAX as usize) {
            let mut payload = Vec::with_capacity(1 + chunk.len() * 4);
            message::RequestObject {
                local_ids: chunk.to_vec(),
            }
            .encode(&mut payload);
            if let Err(err) = self.send_with(message::REQUEST_OBJECT, &payload, false, false, true)
            {
                log::debug!("object re-request failed: {err}");
            }
        }
    }

    fn answer_ping(&self, ping: Ping) {
        let dilation = self.stats.lock().unwrap().time_dilation;
        let mut payload = Vec::with_capacity(3);
        PingReply {
            id: ping.id,
            time_dilation: float_to_u16(dilation, 0.0, 1.0),
        }
        .encode(&mut payload);
        if let Err(err) = self.send_with(message::COMPLETE_PING_CHECK, &payload, false, false, true)
        {
            log::debug!("ping reply failed: {err}");
        }
    }

    fn complete_ping(&self, reply: PingReply) {
        let sample = {
            let mut ping = self.ping.lock().unwrap();
            match ping.outstanding {
                Some((id, sent_at)) if id == reply.id => {
                    ping.outstanding = None;
                    Some(sent_at.elapsed())
                }
                _ => None,
            }
        };

        let Some(rtt) = sample else {
            log::debug!("ignoring stale ping reply {}", reply.id);
            return;
        };

        let rtt_ms = rtt.as_secs_f32() * 1000.0;
        let time_dilation = reply.dilation();
        {
            let mut stats = self.stats.lock().unwrap();
            stats.ping_rtt_ms = rtt_ms;
            stats.time_dilation = time_dilation;
        }
        self.emit(SimulatorEvent::PingMeasured {
            rtt_ms,
            time_dilation,
        });
    }

    // Timer bodies

    fn flush_acks(&self) {
        loop {
            let batch = self.pending_acks.lock().unwrap().drain(u8::MAX as usize);
            if batch.is_empty() {
                return;
            }
            let mut payload = Vec::with_capacity(1 + batch.len() * 4);
            PacketAck { sequences: batch }.encode(&mut payload);
            if let Err(err) = self.send_with(message::PACKET_ACK, &payload, false, false, false) {
                log::debug!("ack flush failed: {err}");
                return;
            }
        }
    }

    fn ack_resend_tick(&self) {
        self.flush_acks();

        let sweep = self.unacked.lock().unwrap().sweep(Instant::now());
        for (sequence, data) in &sweep.resend {
            if !self.is_running() {
                return;
            }
            log::debug!("resending packet {sequence}");
            if self.socket.send_to(data, self.peer).is_ok() {
                let mut stats = self.stats.lock().unwrap();
                stats.packets_resent += 1;
                stats.bytes_sent += data.len() as u64;
            }
        }
        if !sweep.resend.is_empty() {
            let mut window = self.send_window.lock().unwrap();
            for (_, data) in &sweep.resend {
                window.record(data.len());
            }
        }
        for sequence in sweep.expired {
            log::warn!("packet {sequence} undeliverable after max resends, dropping");
            self.stats.lock().unwrap().packets_dropped += 1;
            self.emit(SimulatorEvent::DeliveryFailed { sequence });
        }

        match self.state() {
            ConnectionState::Connecting
                if self.started_at.elapsed() > self.config.handshake_timeout =>
            {
                self.shutdown(DisconnectReason::HandshakeTimeout, false);
            }
            ConnectionState::Connected
                if self.last_receive.lock().unwrap().elapsed() > self.config.traffic_timeout =>
            {
                self.shutdown(DisconnectReason::TimedOut, false);
            }
            _ => {}
        }
    }

    fn stats_tick(&self) {
        let send_rate = {
            let mut window = self.send_window.lock().unwrap();
            window.tick();
            window.bytes_per_second()
        };
        let recv_rate = {
            let mut window = self.recv_window.lock().unwrap();
            window.tick();
            window.bytes_per_second()
        };

        let mut stats = self.stats.lock().unwrap();
        stats.send_rate = send_rate;
        stats.recv_rate = recv_rate;
    }

    fn ping_tick(&self) {
        if self.state() != ConnectionState::Connected {
            return;
        }

        let oldest_unacked = self.unacked.lock().unwrap().oldest().unwrap_or(0);
        let id = {
            let mut ping = self.ping.lock().unwrap();
            if let Some((stale, _)) = ping.outstanding.take() {
                log::debug!("ping {stale} went unanswered");
            }
            let id = ping.next_id;
            ping.next_id = ping.next_id.wrapping_add(1);
            ping.outstanding = Some((id, Instant::now()));
            id
        };

        let mut payload = Vec::with_capacity(5);
        Ping { id, oldest_unacked }.encode(&mut payload);
        if let Err(err) = self.send_with(message::START_PING_CHECK, &payload, false, false, true) {
            log::debug!("ping send failed: {err}");
        }
    }
}

/// Sleep for `interval` in short slices, bailing out early on shutdown.
fn wait(shared: &CircuitShared, interval: Duration) -> bool {
    let deadline = Instant::now() + interval;
    loop {
        if !shared.is_running() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return shared.is_running();
        }
        thread::sleep(remaining.min(SHUTDOWN_POLL));
    }
}

fn receive_loop(shared: Arc<CircuitShared>) {
    let mut buf = [0u8; MAX_PACKET_SIZE];

    while shared.is_running() {
        match shared.socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                if from != shared.peer {
                    log::debug!("ignoring datagram from unexpected sender {from}");
                    continue;
                }
                *shared.last_receive.lock().unwrap() = Instant::now();
                shared.handle_datagram(&buf[..len]);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) => {
                if shared.is_running() {
                    log::warn!("socket error on circuit to {}: {err}", shared.peer);
                    shared.shutdown(DisconnectReason::SocketError(err.to_string()), false);
                }
                break;
            }
        }
    }
}

fn tick_loop(shared: Arc<CircuitShared>, interval: Duration, tick: impl Fn(&CircuitShared)) {
    while wait(&shared, interval) {
        tick(&shared);
    }
}

/// Owns the socket threads for one circuit.
pub struct PacketTransport {
    shared: Arc<CircuitShared>,
    threads: Vec<JoinHandle<()>>,
}

impl PacketTransport {
    /// Take ownership of a bound socket and start the receive loop plus the
    /// ack/resend, stats, and ping timers.
    pub fn spawn(
        socket: UdpSocket,
        peer: SocketAddr,
        config: CircuitConfig,
        events: Sender<SimulatorEvent>,
    ) -> io::Result<Self> {
        socket.set_read_timeout(Some(config.read_timeout))?;

        let resend_interval = config.resend_interval;
        let ping_interval = config.ping_interval;
        let shared = CircuitShared::new(socket, peer, config, events);

        let mut threads = Vec::with_capacity(4);
        {
            let shared = Arc::clone(&shared);
            threads.push(thread::spawn(move || receive_loop(shared)));
        }
        {
            let shared = Arc::clone(&shared);
            threads.push(thread::spawn(move || {
                tick_loop(shared, resend_interval, CircuitShared::ack_resend_tick)
            }));
        }
        {
            let shared = Arc::clone(&shared);
            threads.push(thread::spawn(move || {
                tick_loop(shared, STATS_TICK, CircuitShared::stats_tick)
            }));
        }
        {
            let shared = Arc::clone(&shared);
            threads.push(thread::spawn(move || {
                tick_loop(shared, ping_interval, CircuitShared::ping_tick)
            }));
        }

        Ok(Self { shared, threads })
    }

    pub(crate) fn shared(&self) -> &Arc<CircuitShared> {
        &self.shared
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.stats()
    }

    /// Stop the circuit and join every thread. Safe to call twice.
    pub fn disconnect(&mut self, reason: DisconnectReason, notify_peer: bool) {
        self.shared.shutdown(reason, notify_peer);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for PacketTransport {
    fn drop(&mut self) {
        self.disconnect(DisconnectReason::Closed, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{channel, Receiver};

    fn pair() -> (Arc<CircuitShared>, UdpSocket, Receiver<SimulatorEvent>) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        let peer_addr = peer.local_addr().unwrap();
        let (tx, rx) = channel();
        let shared = CircuitShared::new(socket, peer_addr, CircuitConfig::default(), tx);
        (shared, peer, rx)
    }

    fn recv(peer: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, _) = peer.recv_from(&mut buf).expect("peer received nothing");
        buf[..len].to_vec()
    }

    fn inbound(flags: PacketFlags, sequence: u32, msg_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        PacketHeader::new(flags, sequence).write(&mut out);
        out.push(msg_id);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_reliable_send_registers_and_piggybacks_acks() {
        let (shared, peer, _rx) = pair();

        {
            let mut acks = shared.pending_acks.lock().unwrap();
            acks.insert(3);
            acks.insert(8);
        }

        let sequence = shared.send_with(42, b"hello", true, false, true).unwrap();
        assert_eq!(sequence, 1);
        assert_eq!(shared.unacked.lock().unwrap().len(), 1);

        let wire = recv(&peer);
        let header = PacketHeader::parse(&wire).unwrap();
        assert!(header.flags.contains(PacketFlags::RELIABLE));
        assert!(header.flags.contains(PacketFlags::APPENDED_ACKS));

        let (acks, trailer_len) = read_appended_acks(&wire).unwrap();
        assert_eq!(acks, vec![3, 8]);
        assert_eq!(&wire[MIN_HEADER_SIZE..wire.len() - trailer_len], b"\x2ahello");
        assert!(shared.pending_acks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_delivered_once_but_acked_twice() {
        let (shared, peer, rx) = pair();

        let first = inbound(PacketFlags::RELIABLE, 9, 200, b"xyz");
        shared.handle_datagram(&first);
        match rx.try_recv().unwrap() {
            SimulatorEvent::Packet { msg_id, payload } => {
                assert_eq!(msg_id, 200);
                assert_eq!(payload, b"xyz");
            }
            other => panic!("expected opaque packet, got {other:?}"),
        }

        shared.flush_acks();
        let ack1 = recv(&peer);
        let body = &ack1[MIN_HEADER_SIZE..];
        assert_eq!(body[0], message::PACKET_ACK);
        assert_eq!(
            PacketAck::decode(&body[1..]).unwrap().sequences,
            vec![9]
        );

        // The retransmit: acked again, not redelivered.
        let resent = inbound(PacketFlags::RELIABLE | PacketFlags::RESENT, 9, 200, b"xyz");
        shared.handle_datagram(&resent);
        assert!(rx.try_recv().is_err());
        assert_eq!(shared.stats().duplicates_suppressed, 1);

        shared.flush_acks();
        let ack2 = recv(&peer);
        let body = &ack2[MIN_HEADER_SIZE..];
        assert_eq!(
            PacketAck::decode(&body[1..]).unwrap().sequences,
            vec![9]
        );
    }

    #[test]
    fn test_appended_acks_clear_unacked_entries() {
        let (shared, peer, _rx) = pair();

        let sequence = shared.send_with(50, b"payload", true, false, true).unwrap();
        let _ = recv(&peer);
        assert_eq!(shared.unacked.lock().unwrap().len(), 1);

        let mut datagram = inbound(
            PacketFlags::APPENDED_ACKS,
            1,
            199,
            b"",
        );
        write_appended_acks(&mut datagram, &[sequence]);
        shared.handle_datagram(&datagram);

        assert!(shared.unacked.lock().unwrap().is_empty());
    }

    #[test]
    fn test_zerocoded_send_decodes_on_receive() {
        let (shared, peer, _rx) = pair();
        let (peer_shared, _other, peer_rx) = pair();

        let payload = [0u8; 400];
        shared.send_with(77, &payload, false, true, false).unwrap();
        let wire = recv(&peer);

        let header = PacketHeader::parse(&wire).unwrap();
        assert!(header.flags.contains(PacketFlags::ZEROCODED));
        assert!(wire.len() < payload.len());

        peer_shared.handle_datagram(&wire);
        match peer_rx.try_recv().unwrap() {
            SimulatorEvent::Packet { msg_id, payload: got } => {
                assert_eq!(msg_id, 77);
                assert_eq!(got, payload);
            }
            other => panic!("expected opaque packet, got {other:?}"),
        }
    }

    #[test]
    fn test_send_after_shutdown_fails_cleanly() {
        let (shared, _peer, rx) = pair();

        shared.shutdown(DisconnectReason::Closed, false);
        assert_eq!(
            rx.try_recv().unwrap(),
            SimulatorEvent::Disconnected {
                reason: DisconnectReason::Closed
            }
        );

        assert!(matches!(
            shared.send_with(1, b"", false, false, true),
            Err(CircuitError::CircuitClosed)
        ));
        assert!(matches!(
            shared.submit(1, b"", false, false),
            Err(CircuitError::CircuitClosed)
        ));

        // A second shutdown is a no-op, not a second event.
        shared.shutdown(DisconnectReason::Closed, false);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_submit_queues_until_region_ready() {
        let (shared, peer, rx) = pair();

        assert_eq!(shared.state(), ConnectionState::Connecting);
        assert_eq!(shared.submit(90, b"early", false, false).unwrap(), None);
        assert!(peer
            .recv_from(&mut [0u8; 64])
            .is_err_and(|e| matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)));

        shared.region_ready();
        assert_eq!(shared.state(), ConnectionState::Connected);
        assert_eq!(rx.try_recv().unwrap(), SimulatorEvent::Connected);

        let wire = recv(&peer);
        assert_eq!(&wire[MIN_HEADER_SIZE..], b"\x5aearly");
    }

    #[test]
    fn test_pause_queues_and_resume_flushes() {
        let (shared, peer, _rx) = pair();
        shared.region_ready();

        shared.pause().unwrap();
        let notice = recv(&peer);
        assert_eq!(notice[MIN_HEADER_SIZE], message::AGENT_PAUSE);

        // Application traffic is held while paused.
        assert_eq!(shared.submit(91, b"held", false, false).unwrap(), None);

        shared.resume().unwrap();
        let notice = recv(&peer);
        assert_eq!(notice[MIN_HEADER_SIZE], message::AGENT_RESUME);

        let flushed = recv(&peer);
        assert_eq!(flushed[MIN_HEADER_SIZE], 91);
        assert_eq!(&flushed[MIN_HEADER_SIZE + 1..], b"held");
    }

    #[test]
    fn test_oversized_send_is_rejected() {
        let (shared, _peer, _rx) = pair();
        let payload = vec![1u8; MAX_PACKET_SIZE];
        assert!(matches!(
            shared.send_with(9, &payload, false, false, false),
            Err(CircuitError::Oversized { .. })
        ));
    }

    #[test]
    fn test_malformed_datagram_is_dropped_quietly() {
        let (shared, _peer, rx) = pair();
        shared.handle_datagram(&[0x40, 1]);
        shared.handle_datagram(&[]);
        assert!(rx.try_recv().is_err());
        assert_eq!(shared.stats().packets_received, 0);
    }

    #[test]
    fn test_unknown_explicit_ack_is_ignored() {
        let (shared, _peer, rx) = pair();

        let mut payload = Vec::new();
        PacketAck {
            sequences: vec![1234],
        }
        .encode(&mut payload);
        let datagram = inbound(PacketFlags::empty(), 1, message::PACKET_ACK, &payload);
        shared.handle_datagram(&datagram);

        assert!(rx.try_recv().is_err());
        assert!(shared.unacked.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cache_miss_triggers_object_request() {
        let (shared, peer, rx) = pair();

        let mut payload = Vec::new();
        payload.extend_from_slice(&1u64.to_le_bytes());
        payload.extend_from_slice(&u16::MAX.to_le_bytes());
        payload.push(1);
        payload.extend_from_slice(&77u32.to_le_bytes());
        payload.extend_from_slice(&0xFEEDu32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());

        let datagram = inbound(
            PacketFlags::empty(),
            1,
            message::OBJECT_UPDATE_CACHED,
            &payload,
        );
        shared.handle_datagram(&datagram);

        let wire = recv(&peer);
        let body = &wire[MIN_HEADER_SIZE..];
        assert_eq!(body[0], message::REQUEST_OBJECT);
        assert_eq!(
            message::RequestObject::decode(&body[1..]).unwrap().local_ids,
            vec![77]
        );

        match rx.try_recv().unwrap() {
            SimulatorEvent::ObjectUpdate(packet) => {
                assert_eq!(packet.updates.len(), 1);
            }
            other => panic!("expected object update, got {other:?}"),
        }
    }
}
