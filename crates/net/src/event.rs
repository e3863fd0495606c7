use crate::object::ObjectUpdatePacket;

/// Why a circuit left the connected state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local, deliberate close.
    Closed,
    /// Socket error while receiving or sending.
    SocketError(String),
    /// Handshake never completed.
    HandshakeTimeout,
    /// No inbound traffic for longer than the configured timeout.
    TimedOut,
}

/// Everything the transport reports to its collaborators. Handlers are
/// registered with the catalog dispatcher downstream; this layer only
/// emits, it never calls into domain logic.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulatorEvent {
    /// Circuit established and the region signalled movement complete.
    Connected,
    Disconnected {
        reason: DisconnectReason,
    },
    /// A decoded object-update datagram.
    ObjectUpdate(ObjectUpdatePacket),
    /// Any catalog-owned payload, passed through opaque.
    Packet {
        msg_id: u8,
        payload: Vec<u8>,
    },
    /// Ping round trip completed.
    PingMeasured {
        rtt_ms: f32,
        time_dilation: f32,
    },
    /// A reliable packet exhausted its resends.
    DeliveryFailed {
        sequence: u32,
    },
}
