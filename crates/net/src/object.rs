//! Decoders for the object-update packet family.
//!
//! Four wire encodings carry the same logical "object changed state" event:
//! full (five packed movement layouts selected by length), compressed (a
//! self-describing record with bit-gated optional blocks), terse (a compact
//! delta), and cached (an id/crc pair that only triggers a re-request). All
//! of them share a packet prologue of region handle, time dilation, and a
//! block count, and every block is length-delimited so one bad block never
//! takes down the rest of the datagram.

use bitflags::bitflags;
use bytes::Buf;
use glam::{Quat, Vec3, Vec4};

use crate::message;
use crate::protocol::{u8_to_float, u16_to_float};

/// Quantization ranges for the full-update movement layouts.
pub const FULL_RANGE: f32 = 256.0;
/// Terse updates use narrower velocity/acceleration ranges.
pub const TERSE_VELOCITY_RANGE: f32 = 128.0;
pub const TERSE_ACCEL_RANGE: f32 = 64.0;
pub const ROTATION_RANGE: f32 = 1.0;

/// The particle-system block is a fixed-size opaque blob.
pub const PARTICLE_BLOCK_SIZE: usize = 86;

/// Terse movement data is 44 bytes for a primitive, 60 with the avatar
/// collision plane.
pub const TERSE_PRIM_SIZE: usize = 44;
pub const TERSE_AVATAR_SIZE: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectDecodeError {
    #[error("object block truncated: expected {expected} more bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("unrecognized movement blob length {len}")]
    UnknownMovementLength { len: usize },
    #[error("unterminated string in compressed record")]
    UnterminatedString,
    #[error("message id {id} is not an object update")]
    NotAnObjectUpdate { id: u8 },
}

fn need(buf: &impl Buf, len: usize) -> Result<(), ObjectDecodeError> {
    if buf.remaining() < len {
        Err(ObjectDecodeError::Truncated {
            expected: len,
            got: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

/// Normalized decode target for every variant. Built fresh per block;
/// ownership passes straight to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMovementUpdate {
    pub local_id: u32,
    pub state: u8,
    pub is_avatar: bool,
    pub collision_plane: Option<Vec4>,
    pub position: Vec3,
    pub velocity: Vec3,
    pub acceleration: Vec3,
    pub rotation: Quat,
    pub angular_velocity: Vec3,
    pub texture_entry: Option<Vec<u8>>,
}

impl ObjectMovementUpdate {
    fn new(local_id: u32, state: u8) -> Self {
        Self {
            local_id,
            state,
            is_avatar: false,
            collision_plane: None,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            acceleration: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            angular_velocity: Vec3::ZERO,
            texture_entry: None,
        }
    }
}

bitflags! {
    /// Presence gates for the optional blocks of a compressed record. One
    /// bit per block; a clear bit consumes zero bytes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CompressedFlags: u32 {
        const SCRATCH_PAD = 0x0001;
        const TREE = 0x0002;
        const TEXT = 0x0004;
        const PARTICLES = 0x0008;
        const SOUND = 0x0010;
        const PARENT_ID = 0x0020;
        const ANGULAR_VELOCITY = 0x0080;
        const NAME_VALUES = 0x0100;
        const MEDIA_URL = 0x0200;
    }
}

/// Floating name-text above an object, with its RGBA color.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloatingText {
    pub text: String,
    pub color: [u8; 4],
}

/// Attached sound source.
#[derive(Debug, Clone, PartialEq)]
pub struct SoundData {
    pub sound_id: [u8; 16],
    pub gain: f32,
    pub flags: u8,
    pub radius: f32,
}

/// Shape path/profile parameters; mandatory in every compressed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PathParams {
    pub path_curve: u8,
    pub path_begin: u16,
    pub path_end: u16,
    pub path_scale_x: u8,
    pub path_scale_y: u8,
    pub path_shear_x: u8,
    pub path_shear_y: u8,
    pub path_twist: i8,
    pub path_twist_begin: i8,
    pub path_radius_offset: i8,
    pub path_taper_x: i8,
    pub path_taper_y: i8,
    pub path_revolutions: u8,
    pub path_skew: i8,
    pub profile_curve: u8,
    pub profile_begin: u16,
    pub profile_end: u16,
    pub profile_hollow: u16,
}

/// Everything a compressed record carries beyond plain movement.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedExtras {
    pub full_id: [u8; 16],
    pub pcode: u8,
    pub crc: u32,
    pub flags: CompressedFlags,
    pub parent_id: Option<u32>,
    pub tree_species: Option<u8>,
    pub scratch_pad: Option<Vec<u8>>,
    pub text: Option<FloatingText>,
    pub media_url: Option<String>,
    pub particles: Option<Vec<u8>>,
    pub sound: Option<SoundData>,
    pub name_values: Option<String>,
    pub scale: Vec3,
    pub path: PathParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompressedObject {
    pub movement: ObjectMovementUpdate,
    pub extras: CompressedExtras,
}

/// One decoded block of an object-update packet.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectUpdate {
    Full(ObjectMovementUpdate),
    Terse(ObjectMovementUpdate),
    Compressed(CompressedObject),
    /// Cached update for an object we hold no cache for; the connection
    /// answers with a fresh full-update request.
    CacheMiss { local_id: u32, crc: u32, flags: u32 },
}

/// A whole decoded object-update datagram payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectUpdatePacket {
    pub region_handle: u64,
    pub time_dilation: u16,
    pub updates: Vec<ObjectUpdate>,
}

impl ObjectUpdatePacket {
    /// Server-reported simulation slowdown, 0..=1.
    pub fn dilation(&self) -> f32 {
        u16_to_float(self.time_dilation, 0.0, 1.0)
    }
}

fn read_vec3_f32(buf: &mut &[u8]) -> Result<Vec3, ObjectDecodeError> {
    need(buf, 12)?;
    Ok(Vec3::new(
        buf.get_f32_le(),
        buf.get_f32_le(),
        buf.get_f32_le(),
    ))
}

fn read_vec4_f32(buf: &mut &[u8]) -> Result<Vec4, ObjectDecodeError> {
    need(buf, 16)?;
    Ok(Vec4::new(
        buf.get_f32_le(),
        buf.get_f32_le(),
        buf.get_f32_le(),
        buf.get_f32_le(),
    ))
}

/// Rotation shipped as the vector part of a normalized quaternion; w is
/// recomputed.
fn read_quat_normalized(buf: &mut &[u8]) -> Result<Quat, ObjectDecodeError> {
    need(buf, 12)?;
    let x = buf.get_f32_le();
    let y = buf.get_f32_le();
    let z = buf.get_f32_le();
    let w = (1.0 - x * x - y * y - z * z).max(0.0).sqrt();
    Ok(Quat::from_xyzw(x, y, z, w))
}

fn read_vec3_u16(buf: &mut &[u8], range: f32) -> Result<Vec3, ObjectDecodeError> {
    need(buf, 6)?;
    Ok(Vec3::new(
        u16_to_float(buf.get_u16_le(), -range, range),
        u16_to_float(buf.get_u16_le(), -range, range),
        u16_to_float(buf.get_u16_le(), -range, range),
    ))
}

fn read_quat_u16(buf: &mut &[u8]) -> Result<Quat, ObjectDecodeError> {
    need(buf, 8)?;
    Ok(Quat::from_xyzw(
        u16_to_float(buf.get_u16_le(), -ROTATION_RANGE, ROTATION_RANGE),
        u16_to_float(buf.get_u16_le(), -ROTATION_RANGE, ROTATION_RANGE),
        u16_to_float(buf.get_u16_le(), -ROTATION_RANGE, ROTATION_RANGE),
        u16_to_float(buf.get_u16_le(), -ROTATION_RANGE, ROTATION_RANGE),
    ))
}

fn read_vec3_u8(buf: &mut &[u8], range: f32) -> Result<Vec3, ObjectDecodeError> {
    need(buf, 3)?;
    Ok(Vec3::new(
        u8_to_float(buf.get_u8(), -range, range),
        u8_to_float(buf.get_u8(), -range, range),
        u8_to_float(buf.get_u8(), -range, range),
    ))
}

fn read_quat_u8(buf: &mut &[u8]) -> Result<Quat, ObjectDecodeError> {
    need(buf, 4)?;
    Ok(Quat::from_xyzw(
        u8_to_float(buf.get_u8(), -ROTATION_RANGE, ROTATION_RANGE),
        u8_to_float(buf.get_u8(), -ROTATION_RANGE, ROTATION_RANGE),
        u8_to_float(buf.get_u8(), -ROTATION_RANGE, ROTATION_RANGE),
        u8_to_float(buf.get_u8(), -ROTATION_RANGE, ROTATION_RANGE),
    ))
}

fn read_cstring(buf: &mut &[u8]) -> Result<String, ObjectDecodeError> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(ObjectDecodeError::UnterminatedString)?;
    let text = String::from_utf8_lossy(&buf[..nul]).into_owned();
    buf.advance(nul + 1);
    Ok(text)
}

/// Decode one full-update movement blob. The blob length selects the
/// layout: 60/76 are float-precision, 32/48 u16-quantized, 16 u8-quantized;
/// 76 and 48 lead with the avatar collision plane.
pub fn decode_movement_blob(
    local_id: u32,
    state: u8,
    data: &[u8],
) -> Result<ObjectMovementUpdate, ObjectDecodeError> {
    let mut update = ObjectMovementUpdate::new(local_id, state);
    let mut buf = data;

    match data.len() {
        76 | 60 => {
            if data.len() == 76 {
                update.is_avatar = true;
                update.collision_plane = Some(read_vec4_f32(&mut buf)?);
            }
            update.position = read_vec3_f32(&mut buf)?;
            update.velocity = read_vec3_f32(&mut buf)?;
            update.acceleration = read_vec3_f32(&mut buf)?;
            update.rotation = read_quat_normalized(&mut buf)?;
            update.angular_velocity = read_vec3_f32(&mut buf)?;
        }
        48 | 32 => {
            if data.len() == 48 {
                update.is_avatar = true;
                update.collision_plane = Some(read_vec4_f32(&mut buf)?);
            }
            update.position = read_vec3_u16(&mut buf, FULL_RANGE)?;
            update.velocity = read_vec3_u16(&mut buf, FULL_RANGE)?;
            update.acceleration = read_vec3_u16(&mut buf, FULL_RANGE)?;
            update.rotation = read_quat_u16(&mut buf)?;
            update.angular_velocity = read_vec3_u16(&mut buf, FULL_RANGE)?;
        }
        16 => {
            update.position = read_vec3_u8(&mut buf, FULL_RANGE)?;
            update.velocity = read_vec3_u8(&mut buf, FULL_RANGE)?;
            update.acceleration = read_vec3_u8(&mut buf, FULL_RANGE)?;
            update.rotation = read_quat_u8(&mut buf)?;
            update.angular_velocity = read_vec3_u8(&mut buf, FULL_RANGE)?;
        }
        len => return Err(ObjectDecodeError::UnknownMovementLength { len }),
    }

    Ok(update)
}

/// Decode one terse movement delta (the length-prefixed data part of a
/// terse block, without its texture entry).
pub fn decode_terse_data(data: &[u8]) -> Result<ObjectMovementUpdate, ObjectDecodeError> {
    let mut buf = data;
    need(&buf, 6)?;

    let local_id = buf.get_u32_le();
    let state = buf.get_u8();
    let mut update = ObjectMovementUpdate::new(local_id, state);

    update.is_avatar = buf.get_u8() != 0;
    if update.is_avatar {
        update.collision_plane = Some(read_vec4_f32(&mut buf)?);
    }

    update.position = read_vec3_f32(&mut buf)?;
    update.velocity = read_vec3_u16(&mut buf, TERSE_VELOCITY_RANGE)?;
    update.acceleration = read_vec3_u16(&mut buf, TERSE_ACCEL_RANGE)?;
    update.rotation = read_quat_u16(&mut buf)?;
    update.angular_velocity = read_vec3_u16(&mut buf, TERSE_ACCEL_RANGE)?;

    Ok(update)
}

/// Decode one compressed record (the length-prefixed record of a
/// compressed block).
pub fn decode_compressed_record(data: &[u8]) -> Result<CompressedObject, ObjectDecodeError> {
    let mut buf = data;
    need(&buf, 16 + 4 + 1 + 1 + 4 + 4)?;

    let mut full_id = [0u8; 16];
    buf.copy_to_slice(&mut full_id);
    let local_id = buf.get_u32_le();
    let pcode = buf.get_u8();
    let state = buf.get_u8();
    let crc = buf.get_u32_le();
    let flags = CompressedFlags::from_bits_retain(buf.get_u32_le());

    let mut movement = ObjectMovementUpdate::new(local_id, state);
    let mut extras = CompressedExtras {
        full_id,
        pcode,
        crc,
        flags,
        parent_id: None,
        tree_species: None,
        scratch_pad: None,
        text: None,
        media_url: None,
        particles: None,
        sound: None,
        name_values: None,
        scale: Vec3::ONE,
        path: PathParams::default(),
    };

    if flags.contains(CompressedFlags::ANGULAR_VELOCITY) {
        movement.angular_velocity = read_vec3_f32(&mut buf)?;
    }

    if flags.contains(CompressedFlags::PARENT_ID) {
        need(&buf, 4)?;
        extras.parent_id = Some(buf.get_u32_le());
    }

    // Tree species and scratch pad are alternatives; the tree bit is
    // checked first and wins when both are set (anomalous peer input).
    if flags.contains(CompressedFlags::TREE) {
        if flags.contains(CompressedFlags::SCRATCH_PAD) {
            log::warn!(
                "object {local_id}: tree and scratch-pad bits both set, taking tree"
            );
        }
        need(&buf, 1)?;
        extras.tree_species = Some(buf.get_u8());
    } else if flags.contains(CompressedFlags::SCRATCH_PAD) {
        need(&buf, 4)?;
        let len = buf.get_u32_le() as usize;
        need(&buf, len)?;
        extras.scratch_pad = Some(buf.copy_to_bytes(len).to_vec());
    }

    if flags.contains(CompressedFlags::TEXT) {
        let text = read_cstring(&mut buf)?;
        need(&buf, 4)?;
        let mut color = [0u8; 4];
        buf.copy_to_slice(&mut color);
        extras.text = Some(FloatingText { text, color });
    }

    if flags.contains(CompressedFlags::MEDIA_URL) {
        extras.media_url = Some(read_cstring(&mut buf)?);
    }

    if flags.contains(CompressedFlags::PARTICLES) {
        need(&buf, PARTICLE_BLOCK_SIZE)?;
        extras.particles = Some(buf.copy_to_bytes(PARTICLE_BLOCK_SIZE).to_vec());
    }

    if flags.contains(CompressedFlags::SOUND) {
        need(&buf, 25)?;
        let mut sound_id = [0u8; 16];
        buf.copy_to_slice(&mut sound_id);
        extras.sound = Some(SoundData {
            sound_id,
            gain: buf.get_f32_le(),
            flags: buf.get_u8(),
            radius: buf.get_f32_le(),
        });
    }

    if flags.contains(CompressedFlags::NAME_VALUES) {
        extras.name_values = Some(read_cstring(&mut buf)?);
    }

    extras.scale = read_vec3_f32(&mut buf)?;
    movement.position = read_vec3_f32(&mut buf)?;
    movement.rotation = read_quat_normalized(&mut buf)?;
    extras.path = read_path_params(&mut buf)?;

    need(&buf, 4)?;
    let te_len = buf.get_u32_le() as usize;
    if te_len > 0 {
        need(&buf, te_len)?;
        movement.texture_entry = Some(buf.copy_to_bytes(te_len).to_vec());
    }

    Ok(CompressedObject { movement, extras })
}

fn read_path_params(buf: &mut &[u8]) -> Result<PathParams, ObjectDecodeError> {
    need(buf, 23)?;
    Ok(PathParams {
        path_curve: buf.get_u8(),
        path_begin: buf.get_u16_le(),
        path_end: buf.get_u16_le(),
        path_scale_x: buf.get_u8(),
        path_scale_y: buf.get_u8(),
        path_shear_x: buf.get_u8(),
        path_shear_y: buf.get_u8(),
        path_twist: buf.get_i8(),
        path_twist_begin: buf.get_i8(),
        path_radius_offset: buf.get_i8(),
        path_taper_x: buf.get_i8(),
        path_taper_y: buf.get_i8(),
        path_revolutions: buf.get_u8(),
        path_skew: buf.get_i8(),
        profile_curve: buf.get_u8(),
        profile_begin: buf.get_u16_le(),
        profile_end: buf.get_u16_le(),
        profile_hollow: buf.get_u16_le(),
    })
}

/// Decode a whole object-update payload. A block that fails to decode is
/// logged and skipped; the rest of the packet still goes through.
pub fn decode_packet(msg_id: u8, payload: &[u8]) -> Result<ObjectUpdatePacket, ObjectDecodeError> {
    if !message::is_object_update(msg_id) {
        return Err(ObjectDecodeError::NotAnObjectUpdate { id: msg_id });
    }

    let mut buf = payload;
    need(&buf, 8 + 2 + 1)?;
    let region_handle = buf.get_u64_le();
    let time_dilation = buf.get_u16_le();
    let count = buf.get_u8() as usize;

    let mut updates = Vec::with_capacity(count);
    for index in 0..count {
        match decode_block(msg_id, &mut buf) {
            Ok(Some(update)) => updates.push(update),
            Ok(None) => {}
            // Block framing itself is gone; nothing further can be read.
            Err(err) => {
                log::warn!("object update block {index}/{count} unreadable: {err}");
                break;
            }
        }
    }

    Ok(ObjectUpdatePacket {
        region_handle,
        time_dilation,
        updates,
    })
}

fn decode_block(
    msg_id: u8,
    buf: &mut &[u8],
) -> Result<Option<ObjectUpdate>, ObjectDecodeError> {
    match msg_id {
        message::OBJECT_UPDATE => {
            need(buf, 6)?;
            let local_id = buf.get_u32_le();
            let state = buf.get_u8();
            let len = buf.get_u8() as usize;
            need(buf, len)?;
            let blob = &buf[..len];
            let update = decode_movement_blob(local_id, state, blob);
            buf.advance(len);

            match update {
                Ok(update) => Ok(Some(ObjectUpdate::Full(update))),
                Err(err) => {
                    log::warn!("object {local_id}: skipping full update: {err}");
                    Ok(None)
                }
            }
        }
        message::OBJECT_UPDATE_COMPRESSED => {
            need(buf, 2)?;
            let len = buf.get_u16_le() as usize;
            need(buf, len)?;
            let record = &buf[..len];
            let decoded = decode_compressed_record(record);
            buf.advance(len);

            match decoded {
                Ok(object) => Ok(Some(ObjectUpdate::Compressed(object))),
                Err(err) => {
                    log::warn!("skipping compressed update: {err}");
                    Ok(None)
                }
            }
        }
        message::OBJECT_UPDATE_TERSE => {
            need(buf, 1)?;
            let len = buf.get_u8() as usize;
            need(buf, len)?;
            let data = &buf[..len];
            let decoded = decode_terse_data(data);
            buf.advance(len);

            need(buf, 2)?;
            let te_len = buf.get_u16_le() as usize;
            need(buf, te_len)?;
            let texture = &buf[..te_len];

            let result = match decoded {
                Ok(mut update) => {
                    if te_len > 4 {
                        // The first four texture bytes are a legacy field.
                        update.texture_entry = Some(texture[4..].to_vec());
                    }
                    Ok(Some(ObjectUpdate::Terse(update)))
                }
                Err(err) => {
                    log::warn!("skipping terse update: {err}");
                    Ok(None)
                }
            };
            buf.advance(te_len);
            result
        }
        message::OBJECT_UPDATE_CACHED => {
            need(buf, 12)?;
            Ok(Some(ObjectUpdate::CacheMiss {
                local_id: buf.get_u32_le(),
                crc: buf.get_u32_le(),
                flags: buf.get_u32_le(),
            }))
        }
        _ => unreachable!("caller checks is_object_update"),
    }
}
