//! Transport abstraction
//!
//! Everything above this layer (handshake, pipeline, correlation) talks to a
//! [`Transport`], so the serial port can be swapped for the offline
//! [`MockTransport`](super::MockTransport) or a future readiness-driven
//! implementation without touching framing or correlation.

use serialport::SerialPort;
use std::io::{self, Read, Write};

/// Duplex byte channel to a device
pub trait Transport: Read + Write + Send {
    /// Port name the transport was opened on
    fn name(&self) -> &str;

    /// Number of bytes that can be read without blocking
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Drop anything waiting in the input buffer
    fn clear_input_buffer(&mut self) -> io::Result<()>;

    /// Second handle on the same channel, used by the reader loop
    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;

    /// True until [`close`](Transport::close) is called
    fn is_open(&self) -> bool;

    /// Release the underlying device
    fn close(&mut self);

    /// Read everything currently available, or nothing
    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        let available = self.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; available];
        match self.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "serial port closed")
}

/// Serial port wrapper implementing [`Transport`]
pub struct SerialChannel {
    name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialChannel {
    /// Wrap an opened port
    pub fn new(name: impl Into<String>, port: Box<dyn SerialPort>) -> Self {
        Self {
            name: name.into(),
            port: Some(port),
        }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.as_mut().ok_or_else(closed_error)?.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.as_mut().ok_or_else(closed_error)?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.as_mut().ok_or_else(closed_error)?.flush()
    }
}

impl Transport for SerialChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port
            .as_ref()
            .ok_or_else(closed_error)?
            .bytes_to_read()
            .map_err(io::Error::other)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port
            .as_ref()
            .ok_or_else(closed_error)?
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::other)
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        let port_clone = self
            .port
            .as_ref()
            .ok_or_else(closed_error)?
            .try_clone()
            .map_err(io::Error::other)?;
        Ok(Box::new(SerialChannel::new(self.name.clone(), port_clone)))
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) {
        self.port = None;
    }
}
