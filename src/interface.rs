//! Console transports.
//!
//! [Connection](crate::connection::Connection) drives the procedure over the
//! [Transport] trait so the same code paths run against a live serial port
//! ([Interface]) and against a captured transcript ([ReplayPort]).

use std::{
    io::{self, Read, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

use serialport::SerialPort;

/// A bidirectional console transport with a read timeout.
pub trait Transport: Read + Write {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
    fn timeout(&self) -> Duration;
    fn name(&self) -> Option<String> {
        None
    }
}

/// Wrapper around SerialPort where platform-specific modifications can be
/// implemented.
pub struct Interface {
    serial_port: Box<dyn SerialPort>,
}

impl Interface {
    pub fn new(serial: Box<dyn SerialPort>) -> Self {
        Interface {
            serial_port: serial,
        }
    }

    pub fn serial_port(&self) -> &dyn SerialPort {
        self.serial_port.as_ref()
    }

    pub fn serial_port_mut(&mut self) -> &mut dyn SerialPort {
        self.serial_port.as_mut()
    }

    pub fn into_serial(self) -> Box<dyn SerialPort> {
        self.serial_port
    }
}

// Using `dyn SerialPort` as `dyn Read` would require trait upcasting, so the
// delegation is spelled out.
impl Read for Interface {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.serial_port.read(buf)
    }
}

impl Write for Interface {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.serial_port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.serial_port.flush()
    }
}

impl Transport for Interface {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.serial_port.set_timeout(timeout).map_err(io::Error::from)
    }

    fn timeout(&self) -> Duration {
        self.serial_port.timeout()
    }

    fn name(&self) -> Option<String> {
        self.serial_port.name()
    }
}

const REPLAY_CHUNK: usize = 256;

/// Feeds a captured transcript back as console output.
///
/// Reads return the capture in chunks; once the capture is exhausted every
/// read fails with [io::ErrorKind::TimedOut], the same shape a silent device
/// produces, so deadline handling is exercised end to end. Writes are
/// recorded and otherwise discarded.
pub struct ReplayPort {
    data: Vec<u8>,
    position: usize,
    chunk: usize,
    timeout: Duration,
    writes: Arc<Mutex<Vec<u8>>>,
}

impl ReplayPort {
    pub fn new(data: Vec<u8>) -> Self {
        ReplayPort {
            data,
            position: 0,
            chunk: REPLAY_CHUNK,
            timeout: Duration::from_millis(10),
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Deliver the capture in chunks of at most `chunk` bytes per read.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    /// Share a sink receiving everything written to the port.
    #[must_use]
    pub fn with_write_sink(mut self, sink: Arc<Mutex<Vec<u8>>>) -> Self {
        self.writes = sink;
        self
    }

    pub fn exhausted(&self) -> bool {
        self.position >= self.data.len()
    }
}

impl Read for ReplayPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.exhausted() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "replay transcript exhausted",
            ));
        }
        let len = buf.len().min(self.chunk).min(self.data.len() - self.position);
        buf[..len].copy_from_slice(&self.data[self.position..self.position + len]);
        self.position += len;
        Ok(len)
    }
}

impl Write for ReplayPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writes
            .lock()
            .expect("replay write sink poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for ReplayPort {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn name(&self) -> Option<String> {
        Some("replay".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_capture_in_chunks() {
        let mut port = ReplayPort::new(b"ap: hello".to_vec()).with_chunk_size(4);
        let mut buf = [0u8; 16];

        assert_eq!(port.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ap: ");
        assert_eq!(port.read(&mut buf).unwrap(), 4);
        assert_eq!(port.read(&mut buf).unwrap(), 1);
        assert!(port.exhausted());

        let err = port.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn records_writes_to_the_sink() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut port = ReplayPort::new(Vec::new()).with_write_sink(sink.clone());

        port.write_all(b"boot\r").unwrap();
        assert_eq!(sink.lock().unwrap().as_slice(), b"boot\r");
    }
}
