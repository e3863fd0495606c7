//! Client-side reliable UDP transport for a virtual-world simulation.
//!
//! One [`Simulator`] per connected region: byte-exact packet framing with
//! optional zero-run-length compression, explicit acknowledgement and
//! retransmission, duplicate suppression, and decoding of the four
//! object-update wire encodings into typed movement records. Payload
//! meaning beyond the object-update family belongs to the packet catalog
//! upstream; this crate hands those through opaque.

pub mod config;
pub mod event;
pub mod message;
pub mod object;
pub mod protocol;
pub mod reliability;
pub mod simulator;
pub mod stats;
pub mod transport;
pub mod zerocode;

pub use config::{CircuitConfig, CircuitIdentity};
pub use event::{DisconnectReason, SimulatorEvent};
pub use object::{
    CompressedExtras, CompressedFlags, CompressedObject, ObjectDecodeError, ObjectMovementUpdate,
    ObjectUpdate, ObjectUpdatePacket,
};
pub use protocol::{PacketFlags, PacketHeader, WireError, MAX_PACKET_SIZE, SEQUENCE_CEILING};
pub use reliability::{Delivery, DuplicateArchive, PendingAckSet, SequenceCounter, UnackedMap};
pub use simulator::Simulator;
pub use stats::{ConnectionStats, PacketLossSimulation};
pub use transport::{CircuitError, ConnectionState, PacketTransport};
