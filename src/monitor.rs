//! The status monitor loop.
//!
//! Runs on its own thread and is the only reader of the transport. Every decoded frame is applied
//! to the channel table first, then used to resolve pending requests, then turned into an event
//! for the callback thread. The loop never ends on a read or decode error; only the stop flag set
//! by [`crate::Controller::disconnect`] ends it.

use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::Sender;
use log::{debug, info, trace, warn};

use crate::callbacks::{Event, Job};
use crate::controller::{lock, Shared};
use crate::protocol::payload::RichResponse;
use crate::protocol::{address_channel, Frame, FrameDecoder, MessageId, HEADER_LEN};

pub(crate) struct Monitor<R> {
    reader: R,
    decoder: FrameDecoder,
    shared: Arc<Shared>,
    events: Sender<Job>,
}

/// The channel a frame belongs to: its source for device frames, else its destination.
/// Frames from the controller address belong to none.
fn frame_channel(frame: &Frame) -> Option<u8> {
    address_channel(frame.source).or_else(|| address_channel(frame.destination))
}

fn log_device_report(frame: &Frame) {
    match frame.id() {
        Some(MessageId::HwResponse) => warn!(
            "{:#04x} reported an error (params {:#04x} {:#04x})",
            frame.source, frame.param1, frame.param2
        ),
        Some(MessageId::HwRichResponse) => match RichResponse::parse(frame) {
            Ok(report) => warn!(
                "{:#04x} reported error {} for message {:#06x}: {}",
                frame.source, report.code, report.message_id, report.notes
            ),
            Err(e) => warn!("{:#04x} sent an unreadable error report: {}", frame.source, e),
        },
        Some(MessageId::HwDisconnect) => warn!("{:#04x} is disconnecting", frame.source),
        _ => {}
    }
}

impl<R: Read> Monitor<R> {
    pub(crate) fn new(reader: R, shared: Arc<Shared>, events: Sender<Job>) -> Self {
        let decoder = FrameDecoder::new(shared.config.max_payload_len);
        Monitor {
            reader,
            decoder,
            shared,
            events,
        }
    }

    pub(crate) fn run(mut self) {
        let poll_interval = self.shared.config.poll_interval;
        let mut buf = vec![0; self.shared.config.read_buffer_size.max(HEADER_LEN)];
        info!("status monitor started");

        while !self.shared.is_stopping() {
            match self.reader.read(&mut buf) {
                Ok(0) => thread::sleep(poll_interval),
                Ok(n) => {
                    trace!("rx {}", hex::encode(&buf[..n]));
                    self.decoder.push(&buf[..n]);
                    self.drain();
                }
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(poll_interval),
                Err(e) => {
                    warn!("transport read failed: {}", e);
                    thread::sleep(poll_interval);
                }
            }
            self.shared.sweep(Instant::now());
        }
        debug!(
            "status monitor stopped with {} bytes undecoded",
            self.decoder.buffered()
        );
    }

    fn drain(&mut self) {
        while let Some(result) = self.decoder.next_frame() {
            match result {
                Ok(frame) => self.handle(&frame),
                Err(e) => warn!("resynchronizing input stream: {}", e),
            }
        }
    }

    fn handle(&self, frame: &Frame) {
        trace!(
            "frame {:#06x} {:#04x} -> {:#04x} ({:#04x}, {:#04x}) {}",
            frame.message_id,
            frame.source,
            frame.destination,
            frame.param1,
            frame.param2,
            frame.data.as_deref().map(hex::encode).unwrap_or_default()
        );
        log_device_report(frame);

        let channel = frame_channel(frame);
        let mut status = None;
        let mut event = None;
        if let Some(channel) = channel {
            let mut channels = lock(&self.shared.channels);
            let Some(state) = channels.get_mut(usize::from(channel - 1)) else {
                debug!("ignoring frame for unconfigured channel {}", channel);
                return;
            };
            match state.apply(frame) {
                Ok(kind) => {
                    status = Some(state.status());
                    event = kind.map(|kind| Event {
                        channel,
                        kind,
                        status: state.status(),
                        position_counts: state.position(),
                    });
                }
                Err(e) => warn!("channel {}: {}", channel, e),
            }
        }

        lock(&self.shared.pending).resolve(channel, frame, status);

        if let Some(event) = event {
            let callbacks = lock(&self.shared.callbacks).get(event.channel, event.kind);
            if callbacks.is_empty() {
                return;
            }
            if self.events.send(Job { event, callbacks }).is_err() {
                warn!("callback thread is gone, dropping event");
            }
        }
    }
}
