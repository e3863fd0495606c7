use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use veldt::protocol::{read_appended_acks, PacketFlags, PacketHeader, MIN_HEADER_SIZE};
use veldt::{
    message, CircuitConfig, CircuitIdentity, ConnectionState, ObjectUpdate, Simulator,
    SimulatorEvent,
};

fn fast_config() -> CircuitConfig {
    CircuitConfig {
        resend_interval: Duration::from_millis(20),
        resend_timeout: Duration::from_millis(40),
        read_timeout: Duration::from_millis(10),
        ping_interval: Duration::from_secs(60),
        handshake_timeout: Duration::from_secs(30),
        ..CircuitConfig::default()
    }
}

fn identity() -> CircuitIdentity {
    CircuitIdentity {
        circuit_code: 7777,
        session_id: [3; 16],
        agent_id: [4; 16],
    }
}

struct FakeRegion {
    socket: UdpSocket,
    client: Option<SocketAddr>,
    sequence: u32,
}

impl FakeRegion {
    fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(2000)))
            .unwrap();
        Self {
            socket,
            client: None,
            sequence: 0,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    /// Receive one datagram, remembering the client address.
    fn recv(&mut self) -> Vec<u8> {
        let mut buf = [0u8; 1500];
        let (len, from) = self.socket.recv_from(&mut buf).expect("region saw nothing");
        self.client = Some(from);
        buf[..len].to_vec()
    }

    fn try_recv(&mut self) -> Option<Vec<u8>> {
        let mut buf = [0u8; 1500];
        match self.socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                self.client = Some(from);
                Some(buf[..len].to_vec())
            }
            Err(_) => None,
        }
    }

    fn send(&mut self, flags: PacketFlags, msg_id: u8, payload: &[u8]) -> u32 {
        self.sequence += 1;
        let mut out = Vec::new();
        PacketHeader::new(flags, self.sequence).write(&mut out);
        out.push(msg_id);
        out.extend_from_slice(payload);
        self.socket
            .send_to(&out, self.client.expect("no client yet"))
            .unwrap();
        self.sequence
    }

    /// Resend a previously sent packet verbatim, with the resent flag.
    fn resend(&mut self, sequence: u32, msg_id: u8, payload: &[u8]) {
        let mut out = Vec::new();
        PacketHeader::new(PacketFlags::RELIABLE | PacketFlags::RESENT, sequence).write(&mut out);
        out.push(msg_id);
        out.extend_from_slice(payload);
        self.socket.send_to(&out, self.client.unwrap()).unwrap();
    }

    fn ack(&mut self, sequences: &[u32]) {
        let mut payload = Vec::new();
        payload.push(sequences.len() as u8);
        for seq in sequences {
            payload.extend_from_slice(&seq.to_be_bytes());
        }
        self.send(PacketFlags::empty(), message::PACKET_ACK, &payload);
    }
}

fn wait_for<F: Fn(&SimulatorEvent) -> bool>(
    events: &Receiver<SimulatorEvent>,
    timeout: Duration,
    predicate: F,
) -> Option<SimulatorEvent> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(event) = events.recv_timeout(Duration::from_millis(20)) {
            if predicate(&event) {
                return Some(event);
            }
        }
    }
    None
}

/// Acks collected from a client datagram, appended or explicit.
fn acks_in(datagram: &[u8]) -> Vec<u32> {
    let header = PacketHeader::parse(datagram).unwrap();
    let mut acks = Vec::new();
    let mut trailer_len = 0;

    if header.flags.contains(PacketFlags::APPENDED_ACKS) {
        let (appended, len) = read_appended_acks(datagram).unwrap();
        acks.extend(appended);
        trailer_len = len;
    }

    let body = &datagram[header.body_offset()..datagram.len() - trailer_len];
    if body.first() == Some(&message::PACKET_ACK) {
        let explicit = message::PacketAck::decode(&body[1..]).unwrap();
        acks.extend(explicit.sequences);
    }
    acks
}

#[test]
fn test_handshake_then_steady_state() {
    let mut region = FakeRegion::bind();
    let (simulator, events) = Simulator::connect(region.addr(), identity(), fast_config()).unwrap();

    // Circuit request arrives reliable; application traffic is queued
    // until the region acknowledges movement.
    let request = region.recv();
    let header = PacketHeader::parse(&request).unwrap();
    assert!(header.flags.contains(PacketFlags::RELIABLE));
    assert_eq!(request[MIN_HEADER_SIZE], message::USE_CIRCUIT);
    assert_eq!(simulator.send(100, b"queued-chat", false).unwrap(), None);

    region.ack(&[header.sequence]);
    region.send(PacketFlags::empty(), message::MOVEMENT_COMPLETE, &[]);

    let connected = wait_for(&events, Duration::from_secs(2), |e| {
        matches!(e, SimulatorEvent::Connected)
    });
    assert!(connected.is_some());
    assert!(simulator.is_connected());

    // The queued payload flushes on connect.
    let flushed = region.recv();
    let body_start = PacketHeader::parse(&flushed).unwrap().body_offset();
    assert_eq!(flushed[body_start], 100);
    assert_eq!(&flushed[body_start + 1..body_start + 12], b"queued-chat");

    // Steady state now: direct sends go out immediately with a sequence.
    let seq = simulator.send(101, b"live", false).unwrap();
    assert!(seq.is_some());
    let live = region.recv();
    assert_eq!(live[PacketHeader::parse(&live).unwrap().body_offset()], 101);
}

#[test]
fn test_reliable_inbound_acked_and_duplicate_suppressed() {
    let mut region = FakeRegion::bind();
    let (_simulator, events) = Simulator::connect(region.addr(), identity(), fast_config()).unwrap();
    let _request = region.recv();

    let sequence = region.send(PacketFlags::RELIABLE, 120, b"payload");

    // Delivered once...
    let delivered = wait_for(&events, Duration::from_secs(2), |e| {
        matches!(e, SimulatorEvent::Packet { msg_id: 120, .. })
    });
    assert!(delivered.is_some());

    // ...and acked by the periodic flush.
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut acked = false;
    while Instant::now() < deadline && !acked {
        if let Some(datagram) = region.try_recv() {
            acked = acks_in(&datagram).contains(&sequence);
        }
    }
    assert!(acked, "region never saw an ack for {sequence}");

    // The retransmit is acked again but not redelivered.
    region.resend(sequence, 120, b"payload");
    let redelivered = wait_for(&events, Duration::from_millis(300), |e| {
        matches!(e, SimulatorEvent::Packet { msg_id: 120, .. })
    });
    assert!(redelivered.is_none(), "duplicate reached collaborators");

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut acked_again = false;
    while Instant::now() < deadline && !acked_again {
        if let Some(datagram) = region.try_recv() {
            acked_again = acks_in(&datagram).contains(&sequence);
        }
    }
    assert!(acked_again, "retransmit was not acked a second time");
}

#[test]
fn test_unacked_circuit_request_resends_then_fails() {
    let mut region = FakeRegion::bind();
    let (_simulator, events) = Simulator::connect(region.addr(), identity(), fast_config()).unwrap();

    // Original plus exactly max_resends copies, same sequence throughout.
    let original = region.recv();
    let sequence = PacketHeader::parse(&original).unwrap().sequence;

    let mut resends = 0;
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline && resends < 3 {
        if let Some(datagram) = region.try_recv() {
            let header = PacketHeader::parse(&datagram).unwrap();
            if header.sequence == sequence {
                assert!(header.flags.contains(PacketFlags::RESENT));
                resends += 1;
            }
        }
    }
    assert_eq!(resends, 3);

    let failed = wait_for(&events, Duration::from_secs(2), |e| {
        matches!(e, SimulatorEvent::DeliveryFailed { sequence: s } if *s == sequence)
    });
    assert!(failed.is_some());

    // Never a fourth resend.
    let deadline = Instant::now() + Duration::from_millis(300);
    while Instant::now() < deadline {
        if let Some(datagram) = region.try_recv() {
            assert_ne!(PacketHeader::parse(&datagram).unwrap().sequence, sequence);
        }
    }
}

#[test]
fn test_object_update_decodes_through_the_stack() {
    let mut region = FakeRegion::bind();
    let (_simulator, events) = Simulator::connect(region.addr(), identity(), fast_config()).unwrap();
    let _request = region.recv();

    // One full-update block with a float-precision 60-byte movement blob.
    let mut payload = Vec::new();
    payload.extend_from_slice(&0x10_0002_0003u64.to_le_bytes()); // region handle
    payload.extend_from_slice(&u16::MAX.to_le_bytes()); // dilation 1.0
    payload.push(1);
    payload.extend_from_slice(&31u32.to_le_bytes()); // local id
    payload.push(0); // state
    payload.push(60);
    for v in [
        [10.5f32, 20.25, 30.0], // position
        [1.0, 0.0, -1.0],       // velocity
        [0.0, 0.0, 0.0],        // acceleration
        [0.0, 0.0, 0.0],        // rotation vector part
        [0.0, 0.0, 0.0],        // angular velocity
    ] {
        for component in v {
            payload.extend_from_slice(&component.to_le_bytes());
        }
    }
    region.send(PacketFlags::empty(), message::OBJECT_UPDATE, &payload);

    let event = wait_for(&events, Duration::from_secs(2), |e| {
        matches!(e, SimulatorEvent::ObjectUpdate(_))
    })
    .expect("object update never arrived");

    let SimulatorEvent::ObjectUpdate(packet) = event else {
        unreachable!();
    };
    assert!((packet.dilation() - 1.0).abs() < f32::EPSILON);
    assert_eq!(packet.updates.len(), 1);
    match &packet.updates[0] {
        ObjectUpdate::Full(update) => {
            assert_eq!(update.local_id, 31);
            assert_eq!(update.position.x, 10.5);
            assert_eq!(update.velocity.z, -1.0);
            assert!(!update.is_avatar);
        }
        other => panic!("expected a full update, got {other:?}"),
    }
}

#[test]
fn test_disconnect_rejects_sends_and_stops_traffic() {
    let mut region = FakeRegion::bind();
    let (mut simulator, events) =
        Simulator::connect(region.addr(), identity(), fast_config()).unwrap();
    let _request = region.recv();

    region.send(PacketFlags::empty(), message::MOVEMENT_COMPLETE, &[]);
    assert!(wait_for(&events, Duration::from_secs(2), |e| {
        matches!(e, SimulatorEvent::Connected)
    })
    .is_some());

    simulator.disconnect();
    assert_eq!(simulator.state(), ConnectionState::Disconnected);
    assert!(simulator.send(100, b"too late", false).is_err());

    // The region hears the close notice.
    let mut saw_close = false;
    while let Some(datagram) = region.try_recv() {
        let header = PacketHeader::parse(&datagram).unwrap();
        saw_close |= datagram[header.body_offset()] == message::CLOSE_CIRCUIT;
    }
    assert!(saw_close);
}
