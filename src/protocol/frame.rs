use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::error::{DecodingError, EncodingError};
use crate::protocol::{is_known_address, MessageId, HOST, PACKET_FLAG};

/// Length of the fixed frame header.
pub const HEADER_LEN: usize = 6;
/// Largest data packet the decoder accepts before declaring the stream desynchronized.
/// The longest packet a controller sends is the 84 byte hardware info block.
pub const DEFAULT_MAX_PAYLOAD: u16 = 255;

/// The six header bytes as they appear on the wire.
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Clone, Copy)]
#[repr(C)]
struct RawHeader {
    message_id: U16<LittleEndian>,
    param1: u8,
    param2: u8,
    destination: u8,
    source: u8,
}

impl RawHeader {
    fn has_data(&self) -> bool {
        self.destination & PACKET_FLAG != 0
    }

    fn data_len(&self) -> u16 {
        u16::from_le_bytes([self.param1, self.param2])
    }

    /// Structural checks only; the codec does not know what any message means.
    fn validate(&self, max_payload: u16) -> Result<(), DecodingError> {
        if !is_known_address(self.destination) {
            return Err(DecodingError::UnknownAddress(self.destination));
        }
        if !is_known_address(self.source) {
            return Err(DecodingError::UnknownAddress(self.source));
        }
        if self.has_data() {
            let length = self.data_len();
            if length == 0 {
                return Err(DecodingError::EmptyPacket);
            }
            if length > max_payload {
                return Err(DecodingError::ImplausibleLength {
                    length,
                    max: max_payload,
                });
            }
        }
        Ok(())
    }
}

/// One complete protocol message: a 6 byte header and an optional data packet.
///
/// When `data` is present, `param1`/`param2` hold its length as a little-endian word and
/// `destination` carries [`PACKET_FLAG`]. Use [`Frame::header_only`] and [`Frame::with_data`]
/// to build frames that keep this invariant; [`Frame::encode`] rejects frames that break it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message id.
    pub message_id: u16,
    /// First parameter byte, or the low byte of the data length.
    pub param1: u8,
    /// Second parameter byte, or the high byte of the data length.
    pub param2: u8,
    /// Destination address, with [`PACKET_FLAG`] when a data packet follows.
    pub destination: u8,
    /// Source address.
    pub source: u8,
    /// The data packet, if any.
    pub data: Option<Vec<u8>>,
}

impl Frame {
    /// A header-only frame from the host.
    pub fn header_only(message_id: impl Into<u16>, param1: u8, param2: u8, destination: u8) -> Self {
        Frame {
            message_id: message_id.into(),
            param1,
            param2,
            destination: destination & !PACKET_FLAG,
            source: HOST,
            data: None,
        }
    }

    /// A frame from the host with a data packet.
    ///
    /// Packets longer than `u16::MAX` are accepted here and rejected by [`Frame::encode`].
    pub fn with_data(message_id: impl Into<u16>, destination: u8, data: Vec<u8>) -> Self {
        let [param1, param2] = u16::try_from(data.len())
            .unwrap_or(u16::MAX)
            .to_le_bytes();
        Frame {
            message_id: message_id.into(),
            param1,
            param2,
            destination: destination | PACKET_FLAG,
            source: HOST,
            data: Some(data),
        }
    }

    /// Replaces the source byte. Useful for frames a device would send.
    pub fn from_source(mut self, source: u8) -> Self {
        self.source = source;
        self
    }

    /// The known message id, if this crate has a name for it.
    pub fn id(&self) -> Option<MessageId> {
        MessageId::from_raw(self.message_id)
    }

    /// Whether this frame has the given id.
    pub fn is(&self, id: MessageId) -> bool {
        self.message_id == id.raw()
    }

    /// Destination with the packet flag removed.
    pub fn destination_address(&self) -> u8 {
        self.destination & !PACKET_FLAG
    }

    /// Number of bytes [`Frame::encode`] produces.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.data.as_ref().map_or(0, Vec::len)
    }

    /// Encodes the frame into wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        let flagged = self.destination & PACKET_FLAG != 0;
        if flagged != self.data.is_some() {
            return Err(EncodingError::PacketFlagMismatch {
                destination: self.destination,
            });
        }
        if let Some(data) = &self.data {
            let header = u16::from_le_bytes([self.param1, self.param2]);
            let actual = u16::try_from(data.len())
                .map_err(|_| EncodingError::PayloadTooLarge(data.len()))?;
            if header != actual {
                return Err(EncodingError::LengthMismatch {
                    header,
                    actual: data.len(),
                });
            }
        }

        let header = RawHeader {
            message_id: U16::new(self.message_id),
            param1: self.param1,
            param2: self.param2,
            destination: self.destination,
            source: self.source,
        };
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(header.as_bytes());
        if let Some(data) = &self.data {
            buf.extend_from_slice(data);
        }
        Ok(buf)
    }
}

/// Result of a single [`decode`] attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame, and how many bytes of the input it used.
    Frame {
        /// The decoded frame.
        frame: Frame,
        /// Bytes consumed from the front of the input.
        consumed: usize,
    },
    /// The input holds the start of a frame; buffer more bytes and retry.
    NeedMoreData,
}

/// Decodes one frame from the front of `buf`.
///
/// Nothing is decided until the six header bytes are present. A header announcing a data packet
/// only yields a frame once the whole packet is in `buf`.
pub fn decode(buf: &[u8], max_payload: u16) -> Result<Decoded, DecodingError> {
    let Some(header) = buf.get(..HEADER_LEN).and_then(RawHeader::read_from) else {
        return Ok(Decoded::NeedMoreData);
    };
    header.validate(max_payload)?;

    let (data, consumed) = if header.has_data() {
        let end = HEADER_LEN + header.data_len() as usize;
        match buf.get(HEADER_LEN..end) {
            Some(data) => (Some(data.to_vec()), end),
            None => return Ok(Decoded::NeedMoreData),
        }
    } else {
        (None, HEADER_LEN)
    };

    Ok(Decoded::Frame {
        frame: Frame {
            message_id: header.message_id.get(),
            param1: header.param1,
            param2: header.param2,
            destination: header.destination,
            source: header.source,
            data,
        },
        consumed,
    })
}

/// Streaming decoder that buffers bytes from the transport and resynchronizes after garbage.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_payload: u16,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl FrameDecoder {
    /// Creates a decoder that treats packets longer than `max_payload` as desynchronization.
    pub fn new(max_payload: u16) -> Self {
        FrameDecoder {
            buf: Vec::with_capacity(512),
            max_payload,
        }
    }

    /// Appends bytes read from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drops everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Returns the next complete frame, `None` when more bytes are needed.
    ///
    /// A [`DecodingError`] is returned whenever the buffered header fails validation, after the
    /// decoder has skipped to the next plausible header, so calling again continues with the
    /// data that follows. A garbage run without anything header-like inside costs exactly one
    /// error. Garbage that happens to look like a header may still decode as a spurious frame
    /// or produce further errors, as may a partial header kept at the end of the buffer.
    pub fn next_frame(&mut self) -> Option<Result<Frame, DecodingError>> {
        match decode(&self.buf, self.max_payload) {
            Ok(Decoded::Frame { frame, consumed }) => {
                let _ = self.buf.drain(..consumed);
                Some(Ok(frame))
            }
            Ok(Decoded::NeedMoreData) => None,
            Err(e) => {
                let skipped = self.resync();
                log::debug!("resync discarded {skipped} bytes after {e}");
                Some(Err(e))
            }
        }
    }

    /// Drops the first byte and everything up to the next offset that could start a frame.
    /// A trailing partial header is kept, since it may become valid once more bytes arrive.
    fn resync(&mut self) -> usize {
        let mut skip = 1;
        while skip < self.buf.len() {
            let rest = &self.buf[skip..];
            match rest.get(..HEADER_LEN).and_then(RawHeader::read_from) {
                None => break,
                Some(header) if header.validate(self.max_payload).is_ok() => break,
                Some(_) => skip += 1,
            }
        }
        let skip = skip.min(self.buf.len());
        let _ = self.buf.drain(..skip);
        skip
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::protocol::{BROADCAST, CONTROLLER};

    fn decode_all(decoder: &mut FrameDecoder) -> (Vec<Frame>, usize) {
        let mut frames = Vec::new();
        let mut errors = 0;
        while let Some(result) = decoder.next_frame() {
            match result {
                Ok(f) => frames.push(f),
                Err(_) => errors += 1,
            }
        }
        (frames, errors)
    }

    #[test]
    fn encode_enable_channel_one() {
        let frame = Frame::header_only(MessageId::ModSetChanEnableState, 0x01, 0x01, 0x21);
        assert_eq!(frame.encode().unwrap(), vec![0x10, 0x02, 0x01, 0x01, 0x21, 0x01]);
    }

    #[test]
    fn encode_with_data() {
        let frame = Frame::with_data(
            MessageId::MotMoveAbsolute,
            0x22,
            vec![0x01, 0x00, 0x40, 0x0D, 0x03, 0x00],
        );
        assert_eq!(frame.param1, 6);
        assert_eq!(frame.param2, 0);
        assert_eq!(frame.destination, 0xA2);
        assert_eq!(
            frame.encode().unwrap(),
            vec![0x53, 0x04, 0x06, 0x00, 0xA2, 0x01, 0x01, 0x00, 0x40, 0x0D, 0x03, 0x00]
        );
    }

    #[test]
    fn round_trip() {
        let frames = [
            Frame::header_only(MessageId::MotMoveHome, 0x01, 0x00, 0x23),
            Frame::header_only(MessageId::HwStartUpdateMsgs, 0x00, 0x00, BROADCAST),
            Frame::with_data(MessageId::MotSetVelParams, 0x21, (0u8..14).collect()),
            Frame::with_data(0x7777u16, CONTROLLER, vec![0xAA; 200]).from_source(0x21),
        ];
        for frame in frames {
            let bytes = frame.encode().unwrap();
            assert_eq!(bytes.len(), frame.encoded_len());
            assert_eq!(
                decode(&bytes, DEFAULT_MAX_PAYLOAD).unwrap(),
                Decoded::Frame {
                    frame: frame.clone(),
                    consumed: bytes.len()
                }
            );
        }
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let frame = Frame::with_data(MessageId::MotSetVelParams, 0x21, vec![0; 70_000]);
        assert_eq!(frame.encode(), Err(EncodingError::PayloadTooLarge(70_000)));
    }

    #[test]
    fn inconsistent_header_is_rejected() {
        let mut frame = Frame::with_data(MessageId::MotMoveAbsolute, 0x21, vec![0; 6]);
        frame.param1 = 7;
        assert_eq!(
            frame.encode(),
            Err(EncodingError::LengthMismatch { header: 7, actual: 6 })
        );

        let mut frame = Frame::header_only(MessageId::MotMoveHome, 1, 0, 0x21);
        frame.destination |= PACKET_FLAG;
        assert!(matches!(
            frame.encode(),
            Err(EncodingError::PacketFlagMismatch { destination: 0xA1 })
        ));
    }

    #[test]
    fn needs_full_header_and_payload() {
        let bytes = Frame::with_data(MessageId::MotGetPosCounter, 0x01, vec![1, 0, 0x40, 0x0D, 0x03, 0x00])
            .from_source(0x21)
            .encode()
            .unwrap();
        for cut in 0..bytes.len() {
            assert_eq!(
                decode(&bytes[..cut], DEFAULT_MAX_PAYLOAD).unwrap(),
                Decoded::NeedMoreData,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn implausible_length_is_an_error() {
        let bytes = [0x81, 0x04, 0x00, 0x10, 0x81, 0x21];
        assert_eq!(
            decode(&bytes, DEFAULT_MAX_PAYLOAD),
            Err(DecodingError::ImplausibleLength {
                length: 0x1000,
                max: DEFAULT_MAX_PAYLOAD
            })
        );
    }

    #[test]
    fn streaming_split_across_pushes() {
        let a = Frame::header_only(MessageId::MotMoveHomed, 1, 0, HOST).from_source(0x21);
        let b = Frame::with_data(MessageId::MotGetStatusUpdate, HOST, vec![7; 14]).from_source(0x22);
        let mut bytes = a.encode().unwrap();
        bytes.extend(b.encode().unwrap());

        let mut decoder = FrameDecoder::default();
        let mut frames = Vec::new();
        for chunk in bytes.chunks(5) {
            decoder.push(chunk);
            while let Some(f) = decoder.next_frame() {
                frames.push(f.unwrap());
            }
        }
        assert_eq!(frames, vec![a, b]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn resync_after_corrupted_header() {
        let first = Frame::header_only(MessageId::MotMoveCompleted, 1, 0, HOST).from_source(0x21);
        let second = Frame::with_data(MessageId::MotGetPosCounter, HOST, vec![1, 0, 0x40, 0x0D, 0x03, 0x00])
            .from_source(0x22);
        let third = Frame::header_only(MessageId::MotMoveStopped, 1, 0, HOST).from_source(0x23);

        let mut decoder = FrameDecoder::default();
        decoder.push(&first.encode().unwrap());
        // garbage: a header claiming a 0xFFFF byte packet from an unknown address
        decoder.push(&[0x64, 0x04, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
        decoder.push(&second.encode().unwrap());
        decoder.push(&third.encode().unwrap());

        let (frames, errors) = decode_all(&mut decoder);
        assert_eq!(errors, 1);
        assert_eq!(frames, vec![first, second, third]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn resync_keeps_trailing_partial_header() {
        let frame = Frame::header_only(MessageId::MotMoveHomed, 1, 0, HOST).from_source(0x21);
        let bytes = frame.encode().unwrap();

        let mut decoder = FrameDecoder::default();
        decoder.push(&[0xEE, 0xEE, 0xEE, 0xEE, 0xEE, 0xEE]);
        decoder.push(&bytes[..3]);
        let (frames, errors) = decode_all(&mut decoder);
        assert!(frames.is_empty());
        assert_eq!(errors, 1);

        // the kept bytes only turn out to be garbage once the header is complete
        decoder.push(&bytes[3..]);
        let (frames, errors) = decode_all(&mut decoder);
        assert_eq!(frames, vec![frame]);
        assert_eq!(errors, 1);
    }
}
