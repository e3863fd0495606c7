//! One logical connection to one region simulator.
//!
//! A client holds one `Simulator` per region it can see. Construction sends
//! the circuit-establishment request; application traffic queues until the
//! region answers with its movement-complete signal (or the collaborator
//! injects it), and everything is torn down as a unit on disconnect.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::mpsc::{channel, Receiver};

use crate::config::{CircuitConfig, CircuitIdentity};
use crate::event::{DisconnectReason, SimulatorEvent};
use crate::message::{self, UseCircuit};
use crate::stats::ConnectionStats;
use crate::transport::{CircuitError, ConnectionState, PacketTransport};

pub struct Simulator {
    transport: PacketTransport,
    peer: SocketAddr,
    identity: CircuitIdentity,
}

impl Simulator {
    /// Open a circuit to a region. Returns the connection handle and the
    /// event stream collaborators consume; decoded packets, lifecycle
    /// changes, and delivery failures all arrive there.
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        identity: CircuitIdentity,
        config: CircuitConfig,
    ) -> Result<(Self, Receiver<SimulatorEvent>), CircuitError> {
        let peer = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address resolved"))?;

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        log::info!("opening circuit {} -> {peer}", socket.local_addr()?);

        let (events, receiver) = channel();
        let transport = PacketTransport::spawn(socket, peer, config, events)?;

        // The request is reliable; the resend sweep keeps it alive until
        // the region answers or the handshake times out.
        let mut payload = Vec::with_capacity(36);
        UseCircuit {
            code: identity.circuit_code,
            session_id: identity.session_id,
            agent_id: identity.agent_id,
        }
        .encode(&mut payload);
        transport
            .shared()
            .send_with(message::USE_CIRCUIT, &payload, true, false, false)?;

        Ok((
            Self {
                transport,
                peer,
                identity,
            },
            receiver,
        ))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn circuit_code(&self) -> u32 {
        self.identity.circuit_code
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn stats(&self) -> ConnectionStats {
        self.transport.stats()
    }

    /// Collaborator-driven region acknowledgement, for setups where the
    /// movement-complete signal arrives on another channel.
    pub fn mark_region_ready(&self) {
        self.transport.shared().region_ready();
    }

    /// Send a catalog payload. Queued while the handshake or a pause is in
    /// flight (`Ok(None)`); otherwise returns the assigned sequence.
    pub fn send(
        &self,
        msg_id: u8,
        payload: &[u8],
        reliable: bool,
    ) -> Result<Option<u32>, CircuitError> {
        self.transport
            .shared()
            .submit(msg_id, payload, reliable, false)
    }

    /// Like [`send`](Self::send), compressing zero runs in the body when
    /// that makes the packet smaller.
    pub fn send_zerocoded(
        &self,
        msg_id: u8,
        payload: &[u8],
        reliable: bool,
    ) -> Result<Option<u32>, CircuitError> {
        self.transport
            .shared()
            .submit(msg_id, payload, reliable, true)
    }

    /// Notify the region we are backgrounded and gate outbound application
    /// traffic until [`resume`](Self::resume).
    pub fn pause(&self) -> Result<(), CircuitError> {
        self.transport.shared().pause()
    }

    pub fn resume(&self) -> Result<(), CircuitError> {
        self.transport.shared().resume()
    }

    /// Close the circuit: notify the region, cancel the timers and the
    /// receive loop as a unit, release the socket. Idempotent.
    pub fn disconnect(&mut self) {
        self.transport
            .disconnect(DisconnectReason::Closed, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_identity() -> CircuitIdentity {
        CircuitIdentity {
            circuit_code: 0x0BAD_CAFE,
            session_id: [1; 16],
            agent_id: [2; 16],
        }
    }

    fn fast_config() -> CircuitConfig {
        CircuitConfig {
            resend_interval: Duration::from_millis(20),
            resend_timeout: Duration::from_millis(40),
            read_timeout: Duration::from_millis(20),
            ..CircuitConfig::default()
        }
    }

    #[test]
    fn test_connect_sends_circuit_request() {
        let region = UdpSocket::bind("127.0.0.1:0").unwrap();
        region
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();

        let (simulator, _events) =
            Simulator::connect(region.local_addr().unwrap(), test_identity(), fast_config())
                .unwrap();
        assert_eq!(simulator.state(), ConnectionState::Connecting);

        let mut buf = [0u8; 128];
        let (len, _) = region.recv_from(&mut buf).unwrap();
        let body = &buf[6..len];
        assert_eq!(body[0], message::USE_CIRCUIT);

        let request = UseCircuit::decode(&body[1..]).unwrap();
        assert_eq!(request.code, 0x0BAD_CAFE);
        assert_eq!(request.session_id, [1; 16]);
    }

    #[test]
    fn test_circuit_request_is_resent_until_acked() {
        let region = UdpSocket::bind("127.0.0.1:0").unwrap();
        region
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();

        let (_simulator, _events) =
            Simulator::connect(region.local_addr().unwrap(), test_identity(), fast_config())
                .unwrap();

        let mut buf = [0u8; 128];
        let (_, _) = region.recv_from(&mut buf).unwrap();
        let first = crate::protocol::PacketHeader::parse(&buf).unwrap();
        assert!(!first.flags.contains(crate::protocol::PacketFlags::RESENT));

        // No ack: the sweep retransmits with the resent flag and the same
        // sequence number.
        let (_, _) = region.recv_from(&mut buf).unwrap();
        let second = crate::protocol::PacketHeader::parse(&buf).unwrap();
        assert!(second.flags.contains(crate::protocol::PacketFlags::RESENT));
        assert_eq!(second.sequence, first.sequence);
    }

    #[test]
    fn test_disconnect_is_clean_and_idempotent() {
        let region = UdpSocket::bind("127.0.0.1:0").unwrap();

        let (mut simulator, events) =
            Simulator::connect(region.local_addr().unwrap(), test_identity(), fast_config())
                .unwrap();

        simulator.disconnect();
        assert_eq!(simulator.state(), ConnectionState::Disconnected);
        assert!(matches!(
            simulator.send(40, b"late", false),
            Err(CircuitError::CircuitClosed)
        ));
        simulator.disconnect();

        let disconnects = events
            .try_iter()
            .filter(|e| matches!(e, SimulatorEvent::Disconnected { .. }))
            .count();
        assert_eq!(disconnects, 1);
    }
}
