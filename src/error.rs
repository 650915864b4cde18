use std::time::Duration;

use thiserror::Error;

use crate::dispatcher::CompletionKind;
use crate::protocol::StatusBits;

/// Errors that can occur when interacting with an APT controller.
#[derive(Error, Debug)]
pub enum Error {
    /// IO errors occur when writing frames to the transport or splitting it.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A frame or command argument could not be put on the wire.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
    /// Bytes from the wire could not be parsed into a frame.
    #[error("decoding error: {0}")]
    Decoding(#[from] DecodingError),
    /// A data packet was too short or malformed for its message id.
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),
    /// No matching response arrived before the deadline.
    #[error("{kind:?} request on channel {channel:?} timed out after {timeout:?}")]
    RequestTimeout {
        /// Channel the request was addressed to, `None` for controller level requests.
        channel: Option<u8>,
        /// What the request was waiting for.
        kind: CompletionKind,
        /// The timeout that elapsed.
        timeout: Duration,
    },
    /// A set-and-verify query returned a different value than the one written.
    #[error("channel {channel}: {what} verification failed, wrote {expected} but device reports {actual}")]
    VerificationMismatch {
        /// Channel the parameter was written to.
        channel: u8,
        /// Name of the parameter.
        what: &'static str,
        /// The value that was written, in device counts.
        expected: i64,
        /// The value read back, in device counts.
        actual: i64,
    },
    /// A confirmed request of the same kind is already outstanding on this channel.
    #[error("a {kind:?} request is already in progress on channel {channel:?}")]
    RequestInProgress {
        /// Channel of the colliding request.
        channel: Option<u8>,
        /// Kind of the colliding request.
        kind: CompletionKind,
    },
    /// The device reported an error condition in the status register while a motion was pending.
    #[error("channel {channel} reported a device error (status {status:?})")]
    Device {
        /// Channel that reported the error.
        channel: u8,
        /// Status register at the time of the error.
        status: StatusBits,
    },
    /// A pending move or home was ended by a stop notification.
    #[error("motion on channel {channel} was stopped before completion")]
    Stopped {
        /// Channel that stopped.
        channel: u8,
    },
    /// The channel id is outside `1..=channel_count`.
    #[error("invalid channel {0}")]
    InvalidChannel(u8),
    /// A move was requested on a channel that is not enabled and homed, or is faulted.
    #[error("channel {channel} is not ready for motion")]
    NotReady {
        /// The channel that was not ready.
        channel: u8,
    },
    /// The controller has been disconnected.
    #[error("not connected")]
    NotConnected,
    /// The controller was disconnected while the request was pending.
    #[error("disconnected while waiting for a response")]
    Disconnected,
}

/// Errors raised while turning a frame or a command argument into bytes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    /// The data packet does not fit in the 16 bit length field.
    #[error("data packet of {0} bytes exceeds the 16 bit length field")]
    PayloadTooLarge(usize),
    /// `param1`/`param2` do not hold the length of the attached data packet.
    #[error("header length {header} does not match data packet length {actual}")]
    LengthMismatch {
        /// Length encoded in the header.
        header: u16,
        /// Length of the data packet.
        actual: usize,
    },
    /// The packet-present bit of the destination byte does not agree with the presence of data.
    #[error("destination {destination:#04x} packet flag does not match data presence")]
    PacketFlagMismatch {
        /// The offending destination byte.
        destination: u8,
    },
    /// A physical value cannot be represented in the wire field it is sent in.
    #[error("{what} value {value} is out of range")]
    ValueOutOfRange {
        /// The quantity being encoded.
        what: &'static str,
        /// The rejected value.
        value: f64,
    },
}

/// Unrecoverable desynchronization of the incoming byte stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodingError {
    /// The header announces a data packet longer than any the device sends.
    #[error("implausible data packet length {length} (max {max})")]
    ImplausibleLength {
        /// Announced length.
        length: u16,
        /// Configured maximum.
        max: u16,
    },
    /// The header has the packet bit set but a zero length.
    #[error("data packet header with zero length")]
    EmptyPacket,
    /// The source or destination byte is not a known APT address.
    #[error("unknown address {0:#04x}")]
    UnknownAddress(u8),
}

/// Errors raised while parsing a data packet into a typed message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// The frame has no data packet but the message requires one.
    #[error("message {0:#06x} has no data packet")]
    Missing(u16),
    /// The data packet is shorter than the message layout.
    #[error("message {message_id:#06x} needs {expected} data bytes, got {actual}")]
    TooShort {
        /// Message id of the frame.
        message_id: u16,
        /// Minimum length of the layout.
        expected: usize,
        /// Length received.
        actual: usize,
    },
    /// The frame id is not the message being parsed.
    #[error("expected message {expected:#06x}, got {actual:#06x}")]
    UnexpectedMessage {
        /// Id the parser handles.
        expected: u16,
        /// Id of the frame.
        actual: u16,
    },
}
