//! The APT wire protocol: message ids, addresses, the frame codec, typed data packets and the status register.

mod frame;
pub mod payload;
mod status;

pub use frame::{decode, Decoded, Frame, FrameDecoder, DEFAULT_MAX_PAYLOAD, HEADER_LEN};
pub use status::StatusBits;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Source byte used on every frame sent by the host.
pub const HOST: u8 = 0x01;
/// Destination meaning "all channels of the controller".
pub const BROADCAST: u8 = 0x11;
/// Destination of the controller itself (the USB/motherboard unit).
pub const CONTROLLER: u8 = 0x50;
/// Set on the destination byte when a data packet follows the header.
pub const PACKET_FLAG: u8 = 0x80;
/// Channel identifier written inside data packets and header params.
/// The physical channel is selected by the header address, never by this value.
pub const CHANNEL_IDENT: u8 = 0x01;
/// Highest channel that has an address (`0x21..=0x2A`).
pub const MAX_CHANNELS: u8 = 10;

const CHANNEL_BASE: u8 = 0x20;

/// Returns the header address of a 1-based channel, or `None` if the channel has no address.
pub fn channel_address(channel: u8) -> Option<u8> {
    (1..=MAX_CHANNELS)
        .contains(&channel)
        .then(|| CHANNEL_BASE + channel)
}

/// Returns the 1-based channel of a header address. The packet flag is ignored.
pub fn address_channel(address: u8) -> Option<u8> {
    let address = address & !PACKET_FLAG;
    let channel = address.checked_sub(CHANNEL_BASE)?;
    (1..=MAX_CHANNELS).contains(&channel).then_some(channel)
}

/// Whether `address` (with the packet flag masked) is one the protocol defines.
pub fn is_known_address(address: u8) -> bool {
    let address = address & !PACKET_FLAG;
    matches!(address, HOST | BROADCAST | CONTROLLER) || address_channel(address).is_some()
}

/// APT message identifiers used by this crate.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u16)]
pub enum MessageId {
    // Module control
    ModIdentify = 0x0223,
    ModSetChanEnableState = 0x0210,
    ModReqChanEnableState = 0x0211,
    ModGetChanEnableState = 0x0212,

    // Hardware control
    HwDisconnect = 0x0002,
    HwResponse = 0x0080,
    HwRichResponse = 0x0081,
    HwStartUpdateMsgs = 0x0011,
    HwStopUpdateMsgs = 0x0012,
    HwReqInfo = 0x0005,
    HwGetInfo = 0x0006,

    // Counters
    MotSetPosCounter = 0x0410,
    MotReqPosCounter = 0x0411,
    MotGetPosCounter = 0x0412,
    MotSetEncCounter = 0x0409,
    MotReqEncCounter = 0x040A,
    MotGetEncCounter = 0x040B,

    // Homing
    MotMoveHome = 0x0443,
    MotMoveHomed = 0x0444,

    // Motion
    MotMoveRelative = 0x0448,
    MotMoveAbsolute = 0x0453,
    MotMoveCompleted = 0x0464,
    MotMoveStop = 0x0465,
    MotMoveStopped = 0x0466,

    // Velocity profile
    MotSetVelParams = 0x0413,
    MotReqVelParams = 0x0414,
    MotGetVelParams = 0x0415,

    // Status
    MotReqStatusUpdate = 0x0480,
    MotGetStatusUpdate = 0x0481,
    MotReqDcStatusUpdate = 0x0490,
    MotGetDcStatusUpdate = 0x0491,
    MotReqStatusBits = 0x0429,
    MotGetStatusBits = 0x042A,
}

impl MessageId {
    /// Looks up a raw id. Unknown ids return `None`; the codec still decodes such frames.
    pub fn from_raw(id: u16) -> Option<Self> {
        MessageId::from_u16(id)
    }

    /// The raw 16 bit id.
    pub fn raw(self) -> u16 {
        self as u16
    }
}

impl From<MessageId> for u16 {
    fn from(id: MessageId) -> u16 {
        id as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_addresses() {
        assert_eq!(channel_address(1), Some(0x21));
        assert_eq!(channel_address(3), Some(0x23));
        assert_eq!(channel_address(0), None);
        assert_eq!(channel_address(11), None);
        assert_eq!(address_channel(0x22), Some(2));
        assert_eq!(address_channel(0xA2), Some(2));
        assert_eq!(address_channel(0x20), None);
        assert_eq!(address_channel(HOST), None);
    }

    #[test]
    fn known_addresses() {
        for addr in [HOST, BROADCAST, CONTROLLER, 0x21, 0x2A, 0x81, 0xD0] {
            assert!(is_known_address(addr), "{addr:#04x}");
        }
        for addr in [0x00, 0x02, 0x20, 0x2B, 0xFF, 0x7F] {
            assert!(!is_known_address(addr), "{addr:#04x}");
        }
    }

    #[test]
    fn message_ids() {
        assert_eq!(MessageId::from_raw(0x0210), Some(MessageId::ModSetChanEnableState));
        assert_eq!(MessageId::from_raw(0x0481), Some(MessageId::MotGetStatusUpdate));
        assert_eq!(MessageId::from_raw(0x1234), None);
        assert_eq!(MessageId::MotMoveHomed.raw(), 0x0444);
    }
}
