//! In-memory transport and a scripted device for driver tests.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::protocol::{Frame, FrameDecoder};

const READ_TIMEOUT: Duration = Duration::from_millis(5);

pub(crate) struct MockReader {
    bytes: Receiver<Vec<u8>>,
    buffered: Vec<u8>,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buffered.is_empty() {
            match self.bytes.recv_timeout(READ_TIMEOUT) {
                Ok(bytes) => self.buffered = bytes,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "mock read timeout"))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.buffered.len());
        buf[..n].copy_from_slice(&self.buffered[..n]);
        self.buffered.drain(..n);
        Ok(n)
    }
}

pub(crate) struct MockWriter {
    bytes: Sender<Vec<u8>>,
    broken: Arc<AtomicBool>,
}

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }
        self.bytes
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The device end of a mock transport.
pub(crate) struct MockDevice {
    to_host: Sender<Vec<u8>>,
    from_host: Receiver<Vec<u8>>,
    decoder: FrameDecoder,
    broken: Arc<AtomicBool>,
}

/// Returns a transport for the controller and the device on the other end.
pub(crate) fn pair() -> ((MockReader, MockWriter), MockDevice) {
    let (to_host, host_rx) = crossbeam_channel::unbounded();
    let (host_tx, from_host) = crossbeam_channel::unbounded();
    let broken = Arc::new(AtomicBool::new(false));
    let transport = (
        MockReader {
            bytes: host_rx,
            buffered: Vec::new(),
        },
        MockWriter {
            bytes: host_tx,
            broken: broken.clone(),
        },
    );
    let device = MockDevice {
        to_host,
        from_host,
        decoder: FrameDecoder::default(),
        broken,
    };
    (transport, device)
}

impl MockDevice {
    /// Makes every following host write fail, or succeed again.
    pub(crate) fn break_writes(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    pub(crate) fn send_bytes(&self, bytes: &[u8]) {
        let _ = self.to_host.send(bytes.to_vec());
    }

    pub(crate) fn send(&self, frame: &Frame) {
        if let Ok(bytes) = frame.encode() {
            self.send_bytes(&bytes);
        }
    }

    /// Next frame from the host, or `None` after `timeout`.
    pub(crate) fn recv(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(Ok(frame)) = self.decoder.next_frame() {
                return Some(frame);
            }
            let bytes = self.from_host.recv_deadline(deadline).ok()?;
            self.decoder.push(&bytes);
        }
    }

    /// Answers every host frame with the frames `respond` returns, until the host hangs up.
    pub(crate) fn respond<F>(mut self, mut respond: F) -> JoinHandle<()>
    where
        F: FnMut(&Frame) -> Vec<Frame> + Send + 'static,
    {
        thread::spawn(move || loop {
            while let Some(result) = self.decoder.next_frame() {
                if let Ok(frame) = result {
                    for reply in respond(&frame) {
                        self.send(&reply);
                    }
                }
            }
            match self.from_host.recv() {
                Ok(bytes) => self.decoder.push(&bytes),
                Err(_) => return,
            }
        })
    }
}
