//! Zero-run-length compression for packet bodies.
//!
//! Applied only between the fixed header and the appended-ack trailer; both
//! of those regions always travel uncompressed. On the wire a `0x00` byte is
//! followed by a count byte meaning "that many zeros"; runs longer than 255
//! split across multiple pairs.

use crate::protocol::WireError;

/// Decoded bodies are capped at this multiple of the wire body length.
pub const MAX_EXPANSION: usize = 4;

/// Expand a zerocoded body. `cap` bounds the output; exceeding it is
/// fatal to the packet, not the connection.
pub fn decode_body(body: &[u8], cap: usize) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity((body.len() * MAX_EXPANSION).min(cap));
    let mut i = 0;

    while i < body.len() {
        let byte = body[i];
        if byte == 0x00 {
            let Some(&count) = body.get(i + 1) else {
                return Err(WireError::Truncated {
                    expected: i + 2,
                    got: body.len(),
                });
            };
            if out.len() + count as usize > cap {
                return Err(WireError::ZeroDecodeOverflow { cap });
            }
            out.resize(out.len() + count as usize, 0x00);
            i += 2;
        } else {
            if out.len() + 1 > cap {
                return Err(WireError::ZeroDecodeOverflow { cap });
            }
            out.push(byte);
            i += 1;
        }
    }

    Ok(out)
}

/// Compress a body. Returns `None` when the encoding would not shrink it,
/// in which case the caller sends uncompressed and clears the flag.
pub fn encode_body(body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;

    while i < body.len() {
        if body[i] == 0x00 {
            let mut run = 0usize;
            while i < body.len() && body[i] == 0x00 {
                run += 1;
                i += 1;
            }
            while run > u8::MAX as usize {
                out.push(0x00);
                out.push(u8::MAX);
                run -= u8::MAX as usize;
            }
            if run > 0 {
                out.push(0x00);
                out.push(run as u8);
            }
        } else {
            out.push(body[i]);
            i += 1;
        }
    }

    if out.len() < body.len() { Some(out) } else { None }
}
