//! Typed views of the data packets this crate sends and receives.
//!
//! Every packet starts with a little-endian channel identifier word which is always
//! [`CHANNEL_IDENT`]; the physical channel is taken from the header address instead.

use byteorder::{ReadBytesExt, LE};

use crate::error::PayloadError;
use crate::protocol::{Frame, MessageId, StatusBits, CHANNEL_IDENT};

/// Returns the data packet of `frame` if it has id `id` and at least `len` bytes.
fn packet(frame: &Frame, id: MessageId, len: usize) -> Result<&[u8], PayloadError> {
    if !frame.is(id) {
        return Err(PayloadError::UnexpectedMessage {
            expected: id.raw(),
            actual: frame.message_id,
        });
    }
    let data = frame
        .data
        .as_deref()
        .ok_or(PayloadError::Missing(frame.message_id))?;
    if data.len() < len {
        return Err(PayloadError::TooShort {
            message_id: frame.message_id,
            expected: len,
            actual: data.len(),
        });
    }
    Ok(data)
}

/// Length is checked up front by [`packet`], so reads can only fail on a logic error.
fn short(frame: &Frame, len: usize) -> impl Fn(std::io::Error) -> PayloadError + '_ {
    move |_| PayloadError::TooShort {
        message_id: frame.message_id,
        expected: len,
        actual: frame.data.as_ref().map_or(0, Vec::len),
    }
}

fn fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end().to_string()
}

/// Encodes the `(channel ident, i32)` packet used by moves and counter writes.
pub fn channel_value(value: i32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    buf.extend_from_slice(&u16::from(CHANNEL_IDENT).to_le_bytes());
    buf.extend_from_slice(&value.to_le_bytes());
    buf
}

/// Position or encoder counter reply (`GET_POSCOUNTER`, `GET_ENCCOUNTER`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// Counter value in device counts.
    pub value: i32,
}

impl Counter {
    /// Wire length of the packet.
    pub const LEN: usize = 6;

    /// Parses a counter reply with the given id.
    pub fn parse(frame: &Frame, id: MessageId) -> Result<Self, PayloadError> {
        let mut data = packet(frame, id, Self::LEN)?;
        let err = short(frame, Self::LEN);
        let _chan = data.read_u16::<LE>().map_err(&err)?;
        let value = data.read_i32::<LE>().map_err(&err)?;
        Ok(Counter { value })
    }
}

/// Snapshot carried by `GET_STATUSUPDATE`, and by `MOVE_COMPLETED`/`MOVE_STOPPED` on firmware that
/// attaches one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Position counter.
    pub position: i32,
    /// Encoder counter.
    pub encoder: i32,
    /// Status register.
    pub status: StatusBits,
}

impl StatusUpdate {
    /// Wire length of the packet.
    pub const LEN: usize = 14;

    /// Parses the status packet of any frame with the given id.
    pub fn parse(frame: &Frame, id: MessageId) -> Result<Self, PayloadError> {
        let mut data = packet(frame, id, Self::LEN)?;
        let err = short(frame, Self::LEN);
        let _chan = data.read_u16::<LE>().map_err(&err)?;
        Ok(StatusUpdate {
            position: data.read_i32::<LE>().map_err(&err)?,
            encoder: data.read_i32::<LE>().map_err(&err)?,
            status: StatusBits::from_bits_retain(data.read_u32::<LE>().map_err(&err)?),
        })
    }

    /// Encodes the packet, as a device would send it.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&u16::from(CHANNEL_IDENT).to_le_bytes());
        buf.extend_from_slice(&self.position.to_le_bytes());
        buf.extend_from_slice(&self.encoder.to_le_bytes());
        buf.extend_from_slice(&self.status.bits().to_le_bytes());
        buf
    }
}

/// `GET_DCSTATUSUPDATE`, sent by brushless/DC controllers instead of the plain status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcStatusUpdate {
    /// Position counter.
    pub position: i32,
    /// Velocity in device units.
    pub velocity: u16,
    /// Motor current in device units.
    pub motor_current: i16,
    /// Status register.
    pub status: StatusBits,
}

impl DcStatusUpdate {
    /// Wire length of the packet.
    pub const LEN: usize = 14;

    /// Parses a DC status update.
    pub fn parse(frame: &Frame) -> Result<Self, PayloadError> {
        let mut data = packet(frame, MessageId::MotGetDcStatusUpdate, Self::LEN)?;
        let err = short(frame, Self::LEN);
        let _chan = data.read_u16::<LE>().map_err(&err)?;
        Ok(DcStatusUpdate {
            position: data.read_i32::<LE>().map_err(&err)?,
            velocity: data.read_u16::<LE>().map_err(&err)?,
            motor_current: data.read_i16::<LE>().map_err(&err)?,
            status: StatusBits::from_bits_retain(data.read_u32::<LE>().map_err(&err)?),
        })
    }
}

/// Parses `GET_STATUSBITS`.
pub fn status_bits(frame: &Frame) -> Result<StatusBits, PayloadError> {
    let mut data = packet(frame, MessageId::MotGetStatusBits, 6)?;
    let err = short(frame, 6);
    let _chan = data.read_u16::<LE>().map_err(&err)?;
    Ok(StatusBits::from_bits_retain(
        data.read_u32::<LE>().map_err(&err)?,
    ))
}

/// Trapezoidal velocity profile in device counts (`SET_VELPARAMS`/`GET_VELPARAMS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VelocityParams {
    /// Minimum (start) velocity.
    pub min: i32,
    /// Acceleration.
    pub accel: i32,
    /// Maximum velocity.
    pub max: i32,
}

impl VelocityParams {
    /// Wire length of the packet.
    pub const LEN: usize = 14;

    /// Parses a `GET_VELPARAMS` reply.
    pub fn parse(frame: &Frame) -> Result<Self, PayloadError> {
        let mut data = packet(frame, MessageId::MotGetVelParams, Self::LEN)?;
        let err = short(frame, Self::LEN);
        let _chan = data.read_u16::<LE>().map_err(&err)?;
        Ok(VelocityParams {
            min: data.read_i32::<LE>().map_err(&err)?,
            accel: data.read_i32::<LE>().map_err(&err)?,
            max: data.read_i32::<LE>().map_err(&err)?,
        })
    }

    /// Encodes the packet in wire order: channel, min, accel, max.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&u16::from(CHANNEL_IDENT).to_le_bytes());
        buf.extend_from_slice(&self.min.to_le_bytes());
        buf.extend_from_slice(&self.accel.to_le_bytes());
        buf.extend_from_slice(&self.max.to_le_bytes());
        buf
    }
}

/// Controller identification returned by `HW_GET_INFO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareInfo {
    /// Unit serial number.
    pub serial_number: u32,
    /// Model string, e.g. `BBD203`.
    pub model: String,
    /// Hardware type code.
    pub hardware_type: u16,
    /// Firmware version as `(major, interim, minor)`.
    pub firmware_version: (u8, u8, u8),
    /// Free-form notes.
    pub notes: String,
    /// Hardware revision.
    pub hardware_version: u16,
    /// Modification state.
    pub modification_state: u16,
    /// Number of channels the controller reports.
    pub channel_count: u16,
}

impl HardwareInfo {
    /// Wire length of the packet.
    pub const LEN: usize = 84;

    /// Parses a `HW_GET_INFO` reply.
    pub fn parse(frame: &Frame) -> Result<Self, PayloadError> {
        let data = packet(frame, MessageId::HwGetInfo, Self::LEN)?;
        let err = short(frame, Self::LEN);
        let mut head = &data[..4];
        let serial_number = head.read_u32::<LE>().map_err(&err)?;
        let model = fixed_str(&data[4..12]);
        let mut rest = &data[12..14];
        let hardware_type = rest.read_u16::<LE>().map_err(&err)?;
        // minor, interim, major, unused
        let firmware_version = (data[16], data[15], data[14]);
        let notes = fixed_str(&data[18..66]);
        let mut tail = &data[78..84];
        Ok(HardwareInfo {
            serial_number,
            model,
            hardware_type,
            firmware_version,
            notes,
            hardware_version: tail.read_u16::<LE>().map_err(&err)?,
            modification_state: tail.read_u16::<LE>().map_err(&err)?,
            channel_count: tail.read_u16::<LE>().map_err(&err)?,
        })
    }
}

/// Error report sent by the controller in `HW_RICHRESPONSE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RichResponse {
    /// Message that caused the report, if any.
    pub message_id: u16,
    /// Controller specific error code.
    pub code: u16,
    /// Human readable description.
    pub notes: String,
}

impl RichResponse {
    /// Minimum wire length (the notes field may be truncated by some firmware).
    pub const MIN_LEN: usize = 4;

    /// Parses a `HW_RICHRESPONSE` frame.
    pub fn parse(frame: &Frame) -> Result<Self, PayloadError> {
        let mut data = packet(frame, MessageId::HwRichResponse, Self::MIN_LEN)?;
        let err = short(frame, Self::MIN_LEN);
        let message_id = data.read_u16::<LE>().map_err(&err)?;
        let code = data.read_u16::<LE>().map_err(&err)?;
        Ok(RichResponse {
            message_id,
            code,
            notes: fixed_str(data),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::protocol::HOST;

    fn device_frame(id: MessageId, data: Vec<u8>) -> Frame {
        Frame::with_data(id, HOST, data).from_source(0x21)
    }

    #[test]
    fn position_counter() {
        let frame = device_frame(
            MessageId::MotGetPosCounter,
            vec![0x01, 0x00, 0x40, 0x0D, 0x03, 0x00],
        );
        assert_eq!(
            Counter::parse(&frame, MessageId::MotGetPosCounter).unwrap(),
            Counter { value: 200_000 }
        );
        assert_eq!(channel_value(200_000), vec![0x01, 0x00, 0x40, 0x0D, 0x03, 0x00]);
        assert_eq!(channel_value(-1), vec![0x01, 0x00, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn status_update() {
        let update = StatusUpdate {
            position: -5000,
            encoder: 12,
            status: StatusBits::HOMED | StatusBits::MOTOR_ENABLED,
        };
        let frame = device_frame(MessageId::MotGetStatusUpdate, update.to_bytes());
        assert_eq!(
            StatusUpdate::parse(&frame, MessageId::MotGetStatusUpdate).unwrap(),
            update
        );
    }

    #[test]
    fn dc_status_update() {
        let mut data = vec![0x01, 0x00];
        data.extend(1000i32.to_le_bytes());
        data.extend(250u16.to_le_bytes());
        data.extend((-3i16).to_le_bytes());
        data.extend(0x8000_2400u32.to_le_bytes());
        let update = DcStatusUpdate::parse(&device_frame(MessageId::MotGetDcStatusUpdate, data)).unwrap();
        assert_eq!(update.position, 1000);
        assert_eq!(update.velocity, 250);
        assert_eq!(update.motor_current, -3);
        assert!(update.status.homed() && update.status.settled() && update.status.motor_enabled());
    }

    #[test]
    fn velocity_params_wire_order() {
        let params = VelocityParams {
            min: 0,
            accel: 69,
            max: 134_218,
        };
        let bytes = params.to_bytes();
        assert_eq!(&bytes[..2], &[0x01, 0x00]);
        assert_eq!(&bytes[6..10], &69i32.to_le_bytes());
        let frame = device_frame(MessageId::MotGetVelParams, bytes);
        assert_eq!(VelocityParams::parse(&frame).unwrap(), params);
    }

    #[test]
    fn short_and_wrong_packets() {
        let frame = device_frame(MessageId::MotGetStatusUpdate, vec![1, 0, 0, 0]);
        assert_eq!(
            StatusUpdate::parse(&frame, MessageId::MotGetStatusUpdate),
            Err(PayloadError::TooShort {
                message_id: 0x0481,
                expected: 14,
                actual: 4
            })
        );
        assert_eq!(
            VelocityParams::parse(&frame),
            Err(PayloadError::UnexpectedMessage {
                expected: 0x0415,
                actual: 0x0481
            })
        );
        let header_only = Frame::header_only(MessageId::MotMoveCompleted, 1, 0, HOST);
        assert_eq!(
            StatusUpdate::parse(&header_only, MessageId::MotMoveCompleted),
            Err(PayloadError::Missing(0x0464))
        );
    }

    #[test]
    fn hardware_info() {
        let mut data = vec![0u8; HardwareInfo::LEN];
        data[..4].copy_from_slice(&83_123_456u32.to_le_bytes());
        data[4..10].copy_from_slice(b"BBD203");
        data[12..14].copy_from_slice(&16u16.to_le_bytes());
        data[14..17].copy_from_slice(&[2, 1, 3]);
        data[18..30].copy_from_slice(b"MLS203 stage");
        data[78..80].copy_from_slice(&4u16.to_le_bytes());
        data[82..84].copy_from_slice(&3u16.to_le_bytes());
        let frame = Frame::with_data(MessageId::HwGetInfo, HOST, data).from_source(0x50);

        let info = HardwareInfo::parse(&frame).unwrap();
        assert_eq!(info.serial_number, 83_123_456);
        assert_eq!(info.model, "BBD203");
        assert_eq!(info.hardware_type, 16);
        assert_eq!(info.firmware_version, (3, 1, 2));
        assert_eq!(info.notes, "MLS203 stage");
        assert_eq!(info.hardware_version, 4);
        assert_eq!(info.channel_count, 3);
    }

    #[test]
    fn rich_response() {
        let mut data = vec![0x53, 0x04, 0x07, 0x00];
        data.extend_from_slice(b"position out of range\0\0\0");
        let frame = Frame::with_data(MessageId::HwRichResponse, HOST, data).from_source(0x21);
        let response = RichResponse::parse(&frame).unwrap();
        assert_eq!(response.message_id, 0x0453);
        assert_eq!(response.code, 7);
        assert_eq!(response.notes, "position out of range");
    }
}
