//! The message ids and fixed payloads the transport itself understands.
//!
//! The id occupies the first body byte after the fixed header. Every id not
//! listed here is catalog-owned and passes through as an opaque payload.

use bytes::{Buf, BufMut};

use crate::protocol::{u16_to_float, WireError};

pub const START_PING_CHECK: u8 = 1;
pub const COMPLETE_PING_CHECK: u8 = 2;
pub const USE_CIRCUIT: u8 = 3;
pub const MOVEMENT_COMPLETE: u8 = 4;
pub const CLOSE_CIRCUIT: u8 = 5;
pub const REQUEST_OBJECT: u8 = 6;
pub const AGENT_PAUSE: u8 = 7;
pub const AGENT_RESUME: u8 = 8;
pub const OBJECT_UPDATE: u8 = 12;
pub const OBJECT_UPDATE_COMPRESSED: u8 = 13;
pub const OBJECT_UPDATE_CACHED: u8 = 14;
pub const OBJECT_UPDATE_TERSE: u8 = 15;
pub const PACKET_ACK: u8 = 251;

pub fn is_object_update(id: u8) -> bool {
    matches!(
        id,
        OBJECT_UPDATE | OBJECT_UPDATE_COMPRESSED | OBJECT_UPDATE_CACHED | OBJECT_UPDATE_TERSE
    )
}

fn need(buf: &impl Buf, len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        Err(WireError::Truncated {
            expected: len,
            got: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

/// Explicit acknowledgement payload: `[count:1][sequence u32 BE]*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketAck {
    pub sequences: Vec<u32>,
}

impl PacketAck {
    pub fn encode(&self, out: &mut Vec<u8>) {
        debug_assert!(self.sequences.len() <= u8::MAX as usize);
        out.put_u8(self.sequences.len() as u8);
        for seq in &self.sequences {
            out.put_u32(*seq);
        }
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        need(&buf, 1)?;
        let count = buf.get_u8() as usize;
        need(&buf, count * 4)?;

        let mut sequences = Vec::with_capacity(count);
        for _ in 0..count {
            sequences.push(buf.get_u32());
        }
        Ok(Self { sequences })
    }
}

/// Liveness probe: ping id plus the oldest sequence still awaiting an ack,
/// so the peer can stop resending anything older.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub id: u8,
    pub oldest_unacked: u32,
}

impl Ping {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u8(self.id);
        out.put_u32(self.oldest_unacked);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        need(&buf, 5)?;
        Ok(Self {
            id: buf.get_u8(),
            oldest_unacked: buf.get_u32(),
        })
    }
}

/// Ping response. Carries the server's time-dilation word, quantized over
/// 0..=1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReply {
    pub id: u8,
    pub time_dilation: u16,
}

impl PingReply {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u8(self.id);
        out.put_u16_le(self.time_dilation);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        need(&buf, 3)?;
        Ok(Self {
            id: buf.get_u8(),
            time_dilation: buf.get_u16_le(),
        })
    }

    pub fn dilation(&self) -> f32 {
        u16_to_float(self.time_dilation, 0.0, 1.0)
    }
}

/// Circuit-establishment request; the first packet on every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseCircuit {
    pub code: u32,
    pub session_id: [u8; 16],
    pub agent_id: [u8; 16],
}

impl UseCircuit {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u32_le(self.code);
        out.put_slice(&self.session_id);
        out.put_slice(&self.agent_id);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        need(&buf, 36)?;
        let code = buf.get_u32_le();
        let mut session_id = [0u8; 16];
        buf.copy_to_slice(&mut session_id);
        let mut agent_id = [0u8; 16];
        buf.copy_to_slice(&mut agent_id);
        Ok(Self {
            code,
            session_id,
            agent_id,
        })
    }
}

/// Re-request for objects whose cached update missed: `[count:1][local id
/// u32 LE]*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestObject {
    pub local_ids: Vec<u32>,
}

impl RequestObject {
    pub fn encode(&self, out: &mut Vec<u8>) {
        debug_assert!(self.local_ids.len() <= u8::MAX as usize);
        out.put_u8(self.local_ids.len() as u8);
        for id in &self.local_ids {
            out.put_u32_le(*id);
        }
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        need(&buf, 1)?;
        let count = buf.get_u8() as usize;
        need(&buf, count * 4)?;

        let mut local_ids = Vec::with_capacity(count);
        for _ in 0..count {
            local_ids.push(buf.get_u32_le());
        }
        Ok(Self { local_ids })
    }
}
