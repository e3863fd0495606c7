use bitflags::bitflags;

pub const MAX_PACKET_SIZE: usize = 1200;
pub const DEFAULT_PORT: u16 = 13000;

/// Fixed header: flags byte, big-endian sequence, extra-byte count.
pub const MIN_HEADER_SIZE: usize = 6;

/// Sequence numbers wrap to 1 at this ceiling; 0 means "never sent".
pub const SEQUENCE_CEILING: u32 = 0x0100_0000;

/// Wire size of one appended acknowledgement.
pub const ACK_SIZE: usize = 4;

bitflags! {
    /// Header flags byte. Bit positions are shared with the simulator and
    /// must match the peer byte-for-byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u8 {
        const ZEROCODED = 0x80;
        const RELIABLE = 0x40;
        const RESENT = 0x20;
        const APPENDED_ACKS = 0x10;
    }
}

impl PacketFlags {
    pub const fn from_byte(byte: u8) -> Self {
        Self::from_bits_retain(byte)
    }

    pub const fn to_byte(self) -> u8 {
        self.bits()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram too short for header: {len} bytes")]
    MalformedHeader { len: usize },
    #[error("truncated packet: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("malformed appended-ack trailer")]
    MalformedAckTrailer,
    #[error("zero-decoded body would exceed the {cap}-byte output cap")]
    ZeroDecodeOverflow { cap: usize },
}

/// Parsed fixed header. Extra header bytes are opaque to the transport and
/// only tracked for their length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub sequence: u32,
    pub extra_len: u8,
}

impl PacketHeader {
    pub fn new(flags: PacketFlags, sequence: u32) -> Self {
        Self {
            flags,
            sequence,
            extra_len: 0,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < MIN_HEADER_SIZE {
            return Err(WireError::MalformedHeader { len: data.len() });
        }

        let header = Self {
            flags: PacketFlags::from_byte(data[0]),
            sequence: u32::from_be_bytes([data[1], data[2], data[3], data[4]]),
            extra_len: data[5],
        };

        if data.len() < header.body_offset() {
            return Err(WireError::Truncated {
                expected: header.body_offset(),
                got: data.len(),
            });
        }

        Ok(header)
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(self.flags.to_byte());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.push(self.extra_len);
    }

    /// Offset of the first body byte (the message-id region).
    pub fn body_offset(&self) -> usize {
        MIN_HEADER_SIZE + self.extra_len as usize
    }
}

/// Next outgoing sequence number. Wraps to 1, never reuses 0.
#[inline]
pub fn next_sequence(current: u32) -> u32 {
    if current >= SEQUENCE_CEILING - 1 {
        1
    } else {
        current + 1
    }
}

const SEQUENCE_WRAP_THRESHOLD: u32 = SEQUENCE_CEILING / 2;

/// Wraparound-aware sequence comparison.
#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

/// Appended-ack trailer: big-endian sequence numbers followed by a single
/// count byte as the final byte of the datagram.
pub fn read_appended_acks(data: &[u8]) -> Result<(Vec<u32>, usize), WireError> {
    let count = *data.last().ok_or(WireError::MalformedAckTrailer)? as usize;
    let trailer_len = 1 + count * ACK_SIZE;
    if data.len() < MIN_HEADER_SIZE + trailer_len {
        return Err(WireError::MalformedAckTrailer);
    }

    let start = data.len() - trailer_len;
    let mut acks = Vec::with_capacity(count);
    for i in 0..count {
        let at = start + i * ACK_SIZE;
        acks.push(u32::from_be_bytes([
            data[at],
            data[at + 1],
            data[at + 2],
            data[at + 3],
        ]));
    }

    Ok((acks, trailer_len))
}

pub fn write_appended_acks(out: &mut Vec<u8>, acks: &[u32]) {
    debug_assert!(acks.len() <= u8::MAX as usize);
    for ack in acks {
        out.extend_from_slice(&ack.to_be_bytes());
    }
    out.push(acks.len() as u8);
}

/// How many acks fit if `len` bytes of the MTU are already used.
pub fn acks_that_fit(len: usize) -> usize {
    if len + 1 >= MAX_PACKET_SIZE {
        return 0;
    }
    (MAX_PACKET_SIZE - len - 1) / ACK_SIZE
}

// Quantized floats: [min, max] mapped linearly onto the unsigned range.
// Out-of-range input clamps; it is never an error.

pub fn float_to_u8(value: f32, min: f32, max: f32) -> u8 {
    let clamped = value.clamp(min, max);
    (((clamped - min) / (max - min)) * u8::MAX as f32).round() as u8
}

pub fn u8_to_float(raw: u8, min: f32, max: f32) -> f32 {
    min + (raw as f32 / u8::MAX as f32) * (max - min)
}

pub fn float_to_u16(value: f32, min: f32, max: f32) -> u16 {
    let clamped = value.clamp(min, max);
    (((clamped - min) / (max - min)) * u16::MAX as f32).round() as u16
}

pub fn u16_to_float(raw: u16, min: f32, max: f32) -> f32 {
    min + (raw as f32 / u16::MAX as f32) * (max - min)
}
