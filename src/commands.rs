//! Structs for the request frames the host sends, such as [`MoveAbsolute`] and [`Stop`].
//!
//! Each implements [`Command`] and is turned into a [`Frame`] for a given header destination.
//! Positions and velocities here are already in device counts; use [`crate::ScalingContext`]
//! to convert from physical units.

use crate::protocol::payload::{channel_value, VelocityParams};
use crate::protocol::{Frame, MessageId, BROADCAST, CHANNEL_IDENT, CONTROLLER};

/// A request that can be addressed to a destination and put on the wire.
pub trait Command {
    /// Builds the frame for `destination`, the channel (or controller) address.
    fn to_frame(&self, destination: u8) -> Frame;
}

/// Flash the front panel LEDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identify;

impl Command for Identify {
    fn to_frame(&self, destination: u8) -> Frame {
        Frame::header_only(MessageId::ModIdentify, 0x00, 0x00, destination)
    }
}

/// Enable or disable the motor output (`SET_CHANENABLESTATE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetEnableState {
    /// `true` to energize the channel.
    pub enable: bool,
}

impl SetEnableState {
    pub(crate) const ENABLED: u8 = 0x01;
    pub(crate) const DISABLED: u8 = 0x02;
}

impl Command for SetEnableState {
    fn to_frame(&self, destination: u8) -> Frame {
        let state = if self.enable {
            Self::ENABLED
        } else {
            Self::DISABLED
        };
        Frame::header_only(
            MessageId::ModSetChanEnableState,
            CHANNEL_IDENT,
            state,
            destination,
        )
    }
}

/// Start the homing sequence.
#[derive(Debug, Default, Clone, Copy)]
pub struct MoveHome;

impl Command for MoveHome {
    fn to_frame(&self, destination: u8) -> Frame {
        Frame::header_only(MessageId::MotMoveHome, CHANNEL_IDENT, 0x00, destination)
    }
}

/// Move to an absolute position in counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveAbsolute {
    /// Target position.
    pub position: i32,
}

impl Command for MoveAbsolute {
    fn to_frame(&self, destination: u8) -> Frame {
        Frame::with_data(
            MessageId::MotMoveAbsolute,
            destination,
            channel_value(self.position),
        )
    }
}

/// Move by a signed distance in counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRelative {
    /// Distance, negative for reverse.
    pub distance: i32,
}

impl Command for MoveRelative {
    fn to_frame(&self, destination: u8) -> Frame {
        Frame::with_data(
            MessageId::MotMoveRelative,
            destination,
            channel_value(self.distance),
        )
    }
}

/// How a [`Stop`] brings the stage to rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum StopMode {
    /// Abrupt stop.
    #[default]
    Immediate = 0x01,
    /// Decelerate along the current velocity profile.
    Profiled = 0x02,
}

/// Stop any motion (`MOVE_STOP`).
#[derive(Debug, Default, Clone, Copy)]
pub struct Stop {
    /// Stop behaviour.
    pub mode: StopMode,
}

impl Command for Stop {
    fn to_frame(&self, destination: u8) -> Frame {
        Frame::header_only(
            MessageId::MotMoveStop,
            CHANNEL_IDENT,
            self.mode as u8,
            destination,
        )
    }
}

/// Write the trapezoidal velocity profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetVelocityParams(pub VelocityParams);

impl Command for SetVelocityParams {
    fn to_frame(&self, destination: u8) -> Frame {
        Frame::with_data(MessageId::MotSetVelParams, destination, self.0.to_bytes())
    }
}

/// Overwrite the position counter without moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetPositionCounter {
    /// New counter value.
    pub value: i32,
}

impl Command for SetPositionCounter {
    fn to_frame(&self, destination: u8) -> Frame {
        Frame::with_data(
            MessageId::MotSetPosCounter,
            destination,
            channel_value(self.value),
        )
    }
}

/// Start or stop the controller's periodic status update messages.
///
/// Always sent to the broadcast address regardless of the destination passed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateMessages {
    /// `true` to start, `false` to stop.
    pub enable: bool,
}

impl Command for UpdateMessages {
    fn to_frame(&self, _destination: u8) -> Frame {
        let id = if self.enable {
            MessageId::HwStartUpdateMsgs
        } else {
            MessageId::HwStopUpdateMsgs
        };
        Frame::header_only(id, 0x00, 0x00, BROADCAST)
    }
}

/// Header-only requests that the device answers with a `GET_*` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Request {
    /// `REQ_CHANENABLESTATE`.
    EnableState,
    /// `REQ_POSCOUNTER`.
    PositionCounter,
    /// `REQ_ENCCOUNTER`.
    EncoderCounter,
    /// `REQ_VELPARAMS`.
    VelocityParams,
    /// `REQ_STATUSUPDATE`.
    StatusUpdate,
    /// `REQ_DCSTATUSUPDATE`.
    DcStatusUpdate,
    /// `REQ_STATUSBITS`.
    StatusBits,
    /// `HW_REQ_INFO`, always addressed to the controller.
    HardwareInfo,
}

impl Request {
    /// Id of the request frame.
    pub fn message_id(self) -> MessageId {
        match self {
            Request::EnableState => MessageId::ModReqChanEnableState,
            Request::PositionCounter => MessageId::MotReqPosCounter,
            Request::EncoderCounter => MessageId::MotReqEncCounter,
            Request::VelocityParams => MessageId::MotReqVelParams,
            Request::StatusUpdate => MessageId::MotReqStatusUpdate,
            Request::DcStatusUpdate => MessageId::MotReqDcStatusUpdate,
            Request::StatusBits => MessageId::MotReqStatusBits,
            Request::HardwareInfo => MessageId::HwReqInfo,
        }
    }

    /// Id of the frame the device answers with.
    pub fn response_id(self) -> MessageId {
        match self {
            Request::EnableState => MessageId::ModGetChanEnableState,
            Request::PositionCounter => MessageId::MotGetPosCounter,
            Request::EncoderCounter => MessageId::MotGetEncCounter,
            Request::VelocityParams => MessageId::MotGetVelParams,
            Request::StatusUpdate => MessageId::MotGetStatusUpdate,
            Request::DcStatusUpdate => MessageId::MotGetDcStatusUpdate,
            Request::StatusBits => MessageId::MotGetStatusBits,
            Request::HardwareInfo => MessageId::HwGetInfo,
        }
    }
}

impl Command for Request {
    fn to_frame(&self, destination: u8) -> Frame {
        match self {
            Request::HardwareInfo => {
                Frame::header_only(self.message_id(), 0x00, 0x00, CONTROLLER)
            }
            _ => Frame::header_only(self.message_id(), CHANNEL_IDENT, 0x00, destination),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn bytes(command: impl Command, destination: u8) -> Vec<u8> {
        command.to_frame(destination).encode().unwrap()
    }

    #[test]
    fn enable_and_disable() {
        assert_eq!(
            bytes(SetEnableState { enable: true }, 0x21),
            vec![0x10, 0x02, 0x01, 0x01, 0x21, 0x01]
        );
        assert_eq!(
            bytes(SetEnableState { enable: false }, 0x23),
            vec![0x10, 0x02, 0x01, 0x02, 0x23, 0x01]
        );
    }

    #[test]
    fn moves() {
        assert_eq!(
            bytes(MoveAbsolute { position: 200_000 }, 0x21),
            vec![0x53, 0x04, 0x06, 0x00, 0xA1, 0x01, 0x01, 0x00, 0x40, 0x0D, 0x03, 0x00]
        );
        assert_eq!(
            bytes(MoveRelative { distance: -20_000 }, 0x22),
            vec![0x48, 0x04, 0x06, 0x00, 0xA2, 0x01, 0x01, 0x00, 0xE0, 0xB1, 0xFF, 0xFF]
        );
        assert_eq!(
            bytes(MoveHome, 0x22),
            vec![0x43, 0x04, 0x01, 0x00, 0x22, 0x01]
        );
    }

    #[test]
    fn stop_modes() {
        assert_eq!(
            bytes(Stop::default(), 0x21),
            vec![0x65, 0x04, 0x01, 0x01, 0x21, 0x01]
        );
        assert_eq!(
            bytes(
                Stop {
                    mode: StopMode::Profiled
                },
                0x21
            ),
            vec![0x65, 0x04, 0x01, 0x02, 0x21, 0x01]
        );
    }

    #[test]
    fn requests() {
        assert_eq!(
            bytes(Request::StatusUpdate, 0x23),
            vec![0x80, 0x04, 0x01, 0x00, 0x23, 0x01]
        );
        assert_eq!(
            bytes(Request::HardwareInfo, 0x21),
            vec![0x05, 0x00, 0x00, 0x00, 0x50, 0x01]
        );
        assert_eq!(
            bytes(UpdateMessages { enable: true }, 0x21),
            vec![0x11, 0x00, 0x00, 0x00, 0x11, 0x01]
        );
        assert_eq!(Request::VelocityParams.response_id(), MessageId::MotGetVelParams);
    }

    #[test]
    fn velocity_params() {
        let frame = SetVelocityParams(VelocityParams {
            min: 0,
            accel: 69,
            max: 134_218,
        })
        .to_frame(0x21);
        assert_eq!(frame.destination, 0xA1);
        assert_eq!(frame.data.as_ref().map(Vec::len), Some(14));
    }
}
