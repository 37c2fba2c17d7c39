//! Types and constants that precisely match the Ether Dream wire protocol.
//!
//! All communication happens over a single TCP connection. Every command
//! the host sends is answered by exactly one 22-byte ACK frame carrying a
//! 20-byte status block; the DAC also greets a fresh connection with one
//! unsolicited ACK. Multi-byte integers are little-endian on the wire,
//! regardless of host byte order.

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::fmt;
use std::io;

use crate::error::{Error, Result};
use crate::types::LaserPoint;

/// Communication with the DAC happens over TCP on this port.
pub const COMMUNICATION_PORT: u16 = 7765;

/// Depth of the on-device sample FIFO, in points.
pub const BUFFER_CAPACITY: u16 = 1799;

/// Minimum batch of points worth shipping in one data frame.
pub const MIN_PACKET_POINTS: usize = 150;

/// Point rate the client drives the DAC at.
pub const TARGET_POINT_RATE: u32 = 30_000;

/// Command opcodes, each echoed back in the matching ACK.
pub const COMMAND_PING: u8 = b'?';
pub const COMMAND_PREPARE: u8 = b'p';
pub const COMMAND_BEGIN: u8 = b'b';
pub const COMMAND_POINT_RATE: u8 = b'q';
pub const COMMAND_DATA: u8 = b'd';
pub const COMMAND_STOP: u8 = b's';
pub const COMMAND_CLEAR: u8 = b'c';

/// Response byte for an accepted command.
pub const RESPONSE_ACK: u8 = b'a';
/// The write could not be performed: not enough buffer space.
pub const RESPONSE_NAK_FULL: u8 = b'F';
/// The command carried an invalid opcode or parameters.
pub const RESPONSE_NAK_INVALID: u8 = b'I';
/// An emergency-stop condition still exists.
pub const RESPONSE_NAK_STOP_CONDITION: u8 = b'!';

/// Control-word bit that consumes a queued point-rate change.
pub const RATE_CHANGE_BIT: u16 = 0x8000;

/// Playback-flags bit reporting that the last stream ended in underflow.
pub const PLAYBACK_FLAG_UNDERFLOW: u16 = 0x04;

const COORD_SCALE: f32 = 32768.0;
const CHANNEL_SCALE: f32 = 65535.0;

/// Room for a full-FIFO data frame: opcode + count + points.
const DATA_FRAME_CAPACITY: usize = 3 + DacPoint::SIZE_BYTES * BUFFER_CAPACITY as usize;

/// Protocol types that may be written to little-endian bytes.
pub trait WriteToBytes {
    fn write_to_bytes<W: WriteBytesExt>(&self, writer: W) -> io::Result<()>;
}

/// Protocol types that may be read from little-endian bytes.
pub trait ReadFromBytes: Sized {
    fn read_from_bytes<R: ReadBytesExt>(reader: R) -> io::Result<Self>;
}

/// Types with a constant size on the wire.
pub trait SizeBytes {
    const SIZE_BYTES: usize;
}

/// A trait for writing any protocol type to bytes.
///
/// A blanket implementation is provided for all `byteorder::WriteBytesExt`.
pub trait WriteBytes {
    fn write_bytes<P: WriteToBytes>(&mut self, protocol: P) -> io::Result<()>;
}

/// A trait for reading any protocol type from bytes.
///
/// A blanket implementation is provided for all `byteorder::ReadBytesExt`.
pub trait ReadBytes {
    fn read_bytes<P: ReadFromBytes>(&mut self) -> io::Result<P>;
}

impl<P> WriteToBytes for &P
where
    P: WriteToBytes,
{
    fn write_to_bytes<W: WriteBytesExt>(&self, writer: W) -> io::Result<()> {
        (*self).write_to_bytes(writer)
    }
}

impl<W> WriteBytes for W
where
    W: WriteBytesExt,
{
    fn write_bytes<P: WriteToBytes>(&mut self, protocol: P) -> io::Result<()> {
        protocol.write_to_bytes(self)
    }
}

impl<R> ReadBytes for R
where
    R: ReadBytesExt,
{
    fn read_bytes<P: ReadFromBytes>(&mut self) -> io::Result<P> {
        P::read_from_bytes(self)
    }
}

// =============================================================================
// Status
// =============================================================================

/// State of the laser-safety "light engine" state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightEngineState {
    /// Lasers may fire.
    Ready,
    /// Thermal control warming up after power-on.
    Warmup,
    /// Lasers off, thermal control still active.
    Cooldown,
    /// An emergency stop is latched.
    Estop,
}

impl LightEngineState {
    fn from_wire(value: u8) -> Result<Self> {
        match value {
            0 => Ok(LightEngineState::Ready),
            1 => Ok(LightEngineState::Warmup),
            2 => Ok(LightEngineState::Cooldown),
            3 => Ok(LightEngineState::Estop),
            value => Err(Error::UnknownEnum {
                field: "light_engine_state",
                value,
            }),
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            LightEngineState::Ready => 0,
            LightEngineState::Warmup => 1,
            LightEngineState::Cooldown => 2,
            LightEngineState::Estop => 3,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            LightEngineState::Ready => "ready",
            LightEngineState::Warmup => "warmup",
            LightEngineState::Cooldown => "cooldown",
            LightEngineState::Estop => "estop",
        }
    }
}

/// State of the playback state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackState {
    /// No output; the buffer rejects points.
    Idle,
    /// The buffer accepts points but no output is produced yet.
    Prepared,
    /// Points are being emitted at the configured rate.
    Playing,
    /// Playback paused by a stop command.
    Paused,
}

impl PlaybackState {
    fn from_wire(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PlaybackState::Idle),
            1 => Ok(PlaybackState::Prepared),
            2 => Ok(PlaybackState::Playing),
            3 => Ok(PlaybackState::Paused),
            value => Err(Error::UnknownEnum {
                field: "playback_state",
                value,
            }),
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            PlaybackState::Idle => 0,
            PlaybackState::Prepared => 1,
            PlaybackState::Playing => 2,
            PlaybackState::Paused => 3,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Prepared => "prepared",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
        }
    }
}

/// The 20-byte status block the DAC attaches to every ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DacStatus {
    /// Undocumented; observed as a small version number.
    pub protocol: u8,
    pub light_engine_state: LightEngineState,
    pub playback_state: PlaybackState,
    /// Selected data source. 0 is network streaming.
    pub source: u8,
    pub light_engine_flags: u16,
    pub playback_flags: u16,
    pub source_flags: u16,
    /// Number of points currently buffered on the device.
    pub buffer_fullness: u16,
    /// Configured point rate, or 0 while idle.
    pub point_rate: u32,
    /// Points emitted since playback started, or 0 while not playing.
    pub point_count: u32,
}

impl DacStatus {
    /// Decode one status block from exactly [`DacStatus::SIZE_BYTES`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE_BYTES {
            return Err(Error::ShortFrame {
                expected: Self::SIZE_BYTES,
                actual: bytes.len(),
            });
        }

        // Length is validated above, so the reads below cannot fail.
        let mut reader = &bytes[..Self::SIZE_BYTES];
        let protocol = reader.read_u8().map_err(Error::from_io)?;
        let light_engine_state = LightEngineState::from_wire(reader.read_u8().map_err(Error::from_io)?)?;
        let playback_state = PlaybackState::from_wire(reader.read_u8().map_err(Error::from_io)?)?;
        let source = reader.read_u8().map_err(Error::from_io)?;
        let light_engine_flags = reader.read_u16::<LE>().map_err(Error::from_io)?;
        let playback_flags = reader.read_u16::<LE>().map_err(Error::from_io)?;
        let source_flags = reader.read_u16::<LE>().map_err(Error::from_io)?;
        let buffer_fullness = reader.read_u16::<LE>().map_err(Error::from_io)?;
        let point_rate = reader.read_u32::<LE>().map_err(Error::from_io)?;
        let point_count = reader.read_u32::<LE>().map_err(Error::from_io)?;

        Ok(DacStatus {
            protocol,
            light_engine_state,
            playback_state,
            source,
            light_engine_flags,
            playback_flags,
            source_flags,
            buffer_fullness,
            point_rate,
            point_count,
        })
    }
}

impl WriteToBytes for DacStatus {
    fn write_to_bytes<W: WriteBytesExt>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(self.protocol)?;
        writer.write_u8(self.light_engine_state.to_wire())?;
        writer.write_u8(self.playback_state.to_wire())?;
        writer.write_u8(self.source)?;
        writer.write_u16::<LE>(self.light_engine_flags)?;
        writer.write_u16::<LE>(self.playback_flags)?;
        writer.write_u16::<LE>(self.source_flags)?;
        writer.write_u16::<LE>(self.buffer_fullness)?;
        writer.write_u32::<LE>(self.point_rate)?;
        writer.write_u32::<LE>(self.point_count)?;
        Ok(())
    }
}

impl SizeBytes for DacStatus {
    const SIZE_BYTES: usize = 20;
}

impl fmt::Display for DacStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "light={} playback={} buffer={} rate={} count={} flags{{L={:#x} P={:#x} S={:#x}}}",
            self.light_engine_state.as_str(),
            self.playback_state.as_str(),
            self.buffer_fullness,
            self.point_rate,
            self.point_count,
            self.light_engine_flags,
            self.playback_flags,
            self.source_flags,
        )
    }
}

// =============================================================================
// ACK frame
// =============================================================================

/// One 22-byte reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DacResponse {
    /// [`RESPONSE_ACK`] on success, one of the NAK bytes otherwise.
    pub response: u8,
    /// Echo of the command this frame answers.
    pub command: u8,
    pub status: DacStatus,
}

impl DacResponse {
    /// Decode one reply from exactly [`DacResponse::SIZE_BYTES`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE_BYTES {
            return Err(Error::ShortFrame {
                expected: Self::SIZE_BYTES,
                actual: bytes.len(),
            });
        }

        let status = DacStatus::decode(&bytes[2..])?;
        Ok(DacResponse {
            response: bytes[0],
            command: bytes[1],
            status,
        })
    }
}

impl WriteToBytes for DacResponse {
    fn write_to_bytes<W: WriteBytesExt>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(self.response)?;
        writer.write_u8(self.command)?;
        writer.write_bytes(&self.status)?;
        Ok(())
    }
}

impl SizeBytes for DacResponse {
    const SIZE_BYTES: usize = DacStatus::SIZE_BYTES + 2;
}

// =============================================================================
// Points on the wire
// =============================================================================

/// A single sample as serialized into a data frame, 18 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DacPoint {
    /// Bit 15 consumes a queued rate change; all other bits are reserved.
    pub control: u16,
    pub x: i16,
    pub y: i16,
    pub r: u16,
    pub g: u16,
    pub b: u16,
    pub i: u16,
    pub u1: u16,
    pub u2: u16,
}

impl DacPoint {
    /// Encode a normalized [`LaserPoint`], clamping out-of-range values.
    pub fn from_laser(point: &LaserPoint, rate_change: bool) -> Self {
        DacPoint {
            control: if rate_change { RATE_CHANGE_BIT } else { 0 },
            x: encode_coordinate(point.x),
            y: encode_coordinate(point.y),
            r: encode_channel(point.r),
            g: encode_channel(point.g),
            b: encode_channel(point.b),
            i: encode_channel(point.i),
            u1: encode_channel(point.u1),
            u2: encode_channel(point.u2),
        }
    }
}

impl WriteToBytes for DacPoint {
    fn write_to_bytes<W: WriteBytesExt>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u16::<LE>(self.control)?;
        writer.write_i16::<LE>(self.x)?;
        writer.write_i16::<LE>(self.y)?;
        writer.write_u16::<LE>(self.r)?;
        writer.write_u16::<LE>(self.g)?;
        writer.write_u16::<LE>(self.b)?;
        writer.write_u16::<LE>(self.i)?;
        writer.write_u16::<LE>(self.u1)?;
        writer.write_u16::<LE>(self.u2)?;
        Ok(())
    }
}

impl ReadFromBytes for DacPoint {
    fn read_from_bytes<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
        let control = reader.read_u16::<LE>()?;
        let x = reader.read_i16::<LE>()?;
        let y = reader.read_i16::<LE>()?;
        let r = reader.read_u16::<LE>()?;
        let g = reader.read_u16::<LE>()?;
        let b = reader.read_u16::<LE>()?;
        let i = reader.read_u16::<LE>()?;
        let u1 = reader.read_u16::<LE>()?;
        let u2 = reader.read_u16::<LE>()?;
        Ok(DacPoint {
            control,
            x,
            y,
            r,
            g,
            b,
            i,
            u1,
            u2,
        })
    }
}

impl SizeBytes for DacPoint {
    const SIZE_BYTES: usize = 18;
}

/// Map a normalized coordinate onto the signed 16-bit axis.
///
/// Clamps to [-1, 1], scales across the full axis, rounds half away from
/// zero, and saturates at the i16 range.
fn encode_coordinate(value: f32) -> i16 {
    let scaled = value.clamp(-1.0, 1.0) * COORD_SCALE;
    let rounded = if scaled >= 0.0 {
        (scaled + 0.5) as i32
    } else {
        (scaled - 0.5) as i32
    };
    rounded.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Map a normalized channel onto the unsigned 16-bit range.
///
/// Clamps to [0, 1], scales, rounds half up.
fn encode_channel(value: f32) -> u16 {
    let scaled = value.clamp(0.0, 1.0) * CHANNEL_SCALE;
    ((scaled + 0.5) as i32).clamp(0, u16::MAX as i32) as u16
}

// =============================================================================
// Command builder
// =============================================================================

/// Staging buffer for one outgoing command frame.
///
/// The first byte of a built frame is always the opcode; an `opcode()` of 0
/// means no frame is pending. The buffer is cleared after every send so the
/// backing allocation is reused across frames.
#[derive(Debug)]
pub struct CommandPacket {
    bytes: Vec<u8>,
    opcode: u8,
}

impl CommandPacket {
    pub fn new() -> Self {
        CommandPacket {
            bytes: Vec::with_capacity(DATA_FRAME_CAPACITY),
            opcode: 0,
        }
    }

    /// Stage one of the single-byte commands (`?`, `p`, `c`, `s`).
    pub fn set_single(&mut self, opcode: u8) {
        self.bytes.clear();
        self.bytes.push(opcode);
        self.opcode = opcode;
    }

    /// Stage a `begin` command: opcode, reserved flags word, point rate.
    pub fn set_begin(&mut self, point_rate: u32) -> io::Result<()> {
        self.bytes.clear();
        self.bytes.write_u8(COMMAND_BEGIN)?;
        self.bytes.write_u16::<LE>(0)?;
        self.bytes.write_u32::<LE>(point_rate)?;
        self.opcode = COMMAND_BEGIN;
        Ok(())
    }

    /// Stage a `q` command queueing a new point rate.
    pub fn set_point_rate(&mut self, point_rate: u32) -> io::Result<()> {
        self.bytes.clear();
        self.bytes.write_u8(COMMAND_POINT_RATE)?;
        self.bytes.write_u32::<LE>(point_rate)?;
        self.opcode = COMMAND_POINT_RATE;
        Ok(())
    }

    /// Stage the header of a data frame; points follow via [`Self::push_point`].
    pub fn set_data(&mut self, point_count: u16) -> io::Result<()> {
        self.bytes.clear();
        self.bytes.write_u8(COMMAND_DATA)?;
        self.bytes.write_u16::<LE>(point_count)?;
        self.opcode = COMMAND_DATA;
        Ok(())
    }

    /// Append one encoded point to a staged data frame.
    pub fn push_point(&mut self, point: &LaserPoint, rate_change: bool) -> io::Result<()> {
        self.bytes.write_bytes(DacPoint::from_laser(point, rate_change))
    }

    /// Opcode of the pending frame, or 0 when none is staged.
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Reset the staging buffer, keeping its allocation.
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.opcode = 0;
    }
}

impl Default for CommandPacket {
    fn default() -> Self {
        Self::new()
    }
}
