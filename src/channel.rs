//! Per-channel state, updated only from decoded frames.
//!
//! The status register is stored verbatim from the device. The booleans callers see (`homed`,
//! `moving`, ...) are derived from it by masking so they cannot drift apart. The host only
//! touches the register to mark the start of a home or move it just sent, and to drop the
//! homing bit when a home fails.

use chrono::{DateTime, Utc};

use crate::callbacks::EventKind;
use crate::commands::SetEnableState;
use crate::error::PayloadError;
use crate::protocol::payload::{self, Counter, DcStatusUpdate, StatusUpdate, VelocityParams};
use crate::protocol::{Frame, MessageId, StatusBits};
use crate::scaling::ScalingContext;

/// Status register and fault flag at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mark {
    status: StatusBits,
    fault: bool,
}

/// Live state of one channel. Owned by the controller; callers get [`ChannelStatus`] snapshots.
#[derive(Debug, Clone)]
pub(crate) struct ChannelState {
    id: u8,
    address: u8,
    status: StatusBits,
    position: i32,
    encoder: i32,
    velocity: Option<VelocityParams>,
    fault: bool,
    last_update: Option<DateTime<Utc>>,
}

impl ChannelState {
    pub(crate) fn new(id: u8, address: u8) -> Self {
        ChannelState {
            id,
            address,
            status: StatusBits::empty(),
            position: 0,
            encoder: 0,
            velocity: None,
            fault: false,
            last_update: None,
        }
    }

    pub(crate) fn address(&self) -> u8 {
        self.address
    }

    pub(crate) fn status(&self) -> StatusBits {
        self.status
    }

    pub(crate) fn position(&self) -> i32 {
        self.position
    }

    pub(crate) fn velocity(&self) -> Option<VelocityParams> {
        self.velocity
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.status.motor_enabled() && self.status.homed() && !self.fault && !self.status.has_error()
    }

    /// Marks a home as started: `NotHomed -> Homing`.
    pub(crate) fn begin_home(&mut self) {
        self.status.remove(StatusBits::HOMED);
        self.status.insert(StatusBits::HOMING);
        self.fault = false;
    }

    /// Marks a move of `displacement` counts as started: `Idle -> Moving`.
    pub(crate) fn begin_move(&mut self, displacement: i64) {
        self.status
            .remove(StatusBits::MOVING_FORWARD | StatusBits::MOVING_REVERSE);
        if displacement < 0 {
            self.status.insert(StatusBits::MOVING_REVERSE);
        } else {
            self.status.insert(StatusBits::MOVING_FORWARD);
        }
    }

    /// A home timed out or was aborted: `Homing -> NotHomed` with the fault flag.
    pub(crate) fn home_failed(&mut self) {
        self.status.remove(StatusBits::HOMING | StatusBits::HOMED);
        self.fault = true;
    }

    /// The host-controlled part of the state, for undoing an optimistic transition.
    pub(crate) fn mark(&self) -> Mark {
        Mark {
            status: self.status,
            fault: self.fault,
        }
    }

    /// Undoes the transition from `before` to `after` for a command that was never sent.
    ///
    /// Does nothing if a frame changed the state since `after`, so a device-driven transition is
    /// never rolled back.
    pub(crate) fn undo(&mut self, before: Mark, after: Mark) {
        if self.mark() == after {
            self.status = before.status;
            self.fault = before.fault;
        }
    }

    fn store_status(&mut self, status: StatusBits) -> Option<EventKind> {
        let previous = self.status;
        self.status = status;
        if previous.homing() && status.following_error() {
            self.fault = true;
        }
        (status.following_error() && !previous.following_error()).then_some(EventKind::Error)
    }

    fn end_motion(&mut self, frame: &Frame, id: MessageId) -> Result<(), PayloadError> {
        if frame.data.is_some() {
            let update = StatusUpdate::parse(frame, id)?;
            self.position = update.position;
            self.encoder = update.encoder;
            self.status = update.status;
        }
        self.status.remove(StatusBits::MOTION);
        Ok(())
    }

    /// Applies a decoded frame addressed to or from this channel.
    ///
    /// Returns the terminal event the frame represents, if any.
    pub(crate) fn apply(&mut self, frame: &Frame) -> Result<Option<EventKind>, PayloadError> {
        let Some(id) = frame.id() else {
            return Ok(None);
        };
        let event = match id {
            MessageId::MotGetStatusUpdate => {
                let update = StatusUpdate::parse(frame, id)?;
                self.position = update.position;
                self.encoder = update.encoder;
                self.store_status(update.status)
            }
            MessageId::MotGetDcStatusUpdate => {
                let update = DcStatusUpdate::parse(frame)?;
                self.position = update.position;
                self.store_status(update.status)
            }
            MessageId::MotGetStatusBits => {
                let status = payload::status_bits(frame)?;
                self.store_status(status)
            }
            MessageId::MotGetPosCounter => {
                self.position = Counter::parse(frame, id)?.value;
                None
            }
            MessageId::MotGetEncCounter => {
                self.encoder = Counter::parse(frame, id)?.value;
                None
            }
            MessageId::MotGetVelParams => {
                self.velocity = Some(VelocityParams::parse(frame)?);
                None
            }
            MessageId::ModGetChanEnableState => {
                self.status.set(
                    StatusBits::MOTOR_ENABLED,
                    frame.param2 == SetEnableState::ENABLED,
                );
                None
            }
            MessageId::MotMoveCompleted => {
                self.end_motion(frame, id)?;
                Some(EventKind::MoveCompleted)
            }
            MessageId::MotMoveStopped => {
                let was_homing = self.status.homing();
                self.end_motion(frame, id)?;
                if was_homing {
                    self.home_failed();
                }
                Some(EventKind::MoveStopped)
            }
            MessageId::MotMoveHomed => {
                self.status.remove(StatusBits::MOTION);
                self.status.insert(StatusBits::HOMED);
                self.fault = false;
                Some(EventKind::Homed)
            }
            MessageId::HwResponse | MessageId::HwRichResponse => Some(EventKind::Error),
            _ => return Ok(None),
        };
        self.last_update = Some(Utc::now());
        Ok(event)
    }

    pub(crate) fn snapshot(&self, scaling: &ScalingContext) -> ChannelStatus {
        ChannelStatus {
            channel: self.id,
            enabled: self.status.motor_enabled(),
            homed: self.status.homed(),
            homing: self.status.homing(),
            moving: self.status.moving(),
            error: self.fault || self.status.has_error(),
            ready: self.is_ready(),
            position: scaling.counts_to_position(i64::from(self.position)),
            position_counts: self.position,
            encoder_counts: self.encoder,
            status: self.status,
            velocity_params: self.velocity,
            last_update: self.last_update,
        }
    }
}

/// Point-in-time copy of a channel's state.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatus {
    /// 1-based channel id.
    pub channel: u8,
    /// Motor output is enabled.
    pub enabled: bool,
    /// Channel is homed.
    pub homed: bool,
    /// Homing in progress.
    pub homing: bool,
    /// Any motion in progress, homing included.
    pub moving: bool,
    /// A following error is flagged, or the last home failed.
    pub error: bool,
    /// Enabled, homed and without error.
    pub ready: bool,
    /// Position in physical units.
    pub position: f64,
    /// Position in counts.
    pub position_counts: i32,
    /// Encoder counter.
    pub encoder_counts: i32,
    /// Raw status register.
    pub status: StatusBits,
    /// Last velocity profile read back from the device, in counts.
    pub velocity_params: Option<VelocityParams>,
    /// When the device last reported anything for this channel.
    pub last_update: Option<DateTime<Utc>>,
}
