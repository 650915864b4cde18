//! A trait for the duplex byte stream a [`crate::Controller`] talks over.
//!
//! The controller splits the transport once: the read half goes to the monitor thread, the
//! write half stays behind a mutex for callers. Reads must be timed. An idle read returns
//! `TimedOut`, `WouldBlock` or `Ok(0)` so the monitor can check for shutdown.

use std::io::{Read, Write};

use crate::Error;

#[cfg(test)]
pub(crate) mod mock;

/// A byte stream that can be split into independently owned read and write halves.
pub trait Transport: Send + 'static {
    /// The half the monitor thread reads from.
    type Reader: Read + Send + 'static;
    /// The half commands are written to.
    type Writer: Write + Send + 'static;

    /// Splits the transport.
    fn split(self) -> Result<(Self::Reader, Self::Writer), Error>;
}

/// Already split streams, e.g. two ends of a pipe.
impl<R, W> Transport for (R, W)
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    type Reader = R;
    type Writer = W;

    fn split(self) -> Result<(R, W), Error> {
        Ok(self)
    }
}

/// A serial port opened with [`serialport::new`]. Its read timeout is the monitor's poll interval.
///
/// APT controllers use 115200 baud, 8N1 and RTS/CTS flow control.
#[cfg(feature = "serialport")]
impl Transport for Box<dyn serialport::SerialPort> {
    type Reader = Box<dyn serialport::SerialPort>;
    type Writer = Box<dyn serialport::SerialPort>;

    fn split(self) -> Result<(Self::Reader, Self::Writer), Error> {
        let reader = self.try_clone().map_err(std::io::Error::from)?;
        Ok((reader, self))
    }
}
