//! Transport abstraction over a byte-oriented duplex channel.
//!
//! The protocol layer depends on this surface only, so the same engine
//! drives a real serial adapter and the in-process simulated device:
//!
//! ```text
//! +------------------+     +------------------+
//! |  Protocol layer  |     |  Protocol layer  |
//! | (target/..)      |     | (target/..)      |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! | Transport trait  |     | Transport trait  |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! | SerialTransport  |     | SimulatedDevice  |
//! |   (serialport)   |     |  (fake device)   |
//! +------------------+     +------------------+
//!       hardware                  tests
//! ```
//!
//! A transport is exclusively owned by one flasher for the duration of a
//! session; releasing the flasher releases the channel.

#[cfg(feature = "native")]
pub mod serial;

pub mod sim;

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Unified transport trait for device communication.
///
/// `read` honours the configured timeout and surfaces expiry as
/// `io::ErrorKind::TimedOut`; the helpers below translate that into
/// [`Error::Timeout`] for the retry policy.
pub trait Transport: Read + Write + Send {
    /// Set the per-read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current per-read timeout.
    fn timeout(&self) -> Duration;

    /// Discard any buffered input.
    fn clear_input(&mut self) -> Result<()>;

    /// Endpoint name (port path or simulator label).
    fn name(&self) -> &str;
}

/// Read until `delim` is seen or `deadline` elapses.
///
/// Returns whatever arrived (possibly without the delimiter — callers
/// validate content); an empty read window is a timeout. At least one
/// read is attempted even with a zero deadline, so scripted transports
/// in tests behave deterministically.
pub fn read_until<T: Transport + ?Sized>(
    transport: &mut T,
    delim: u8,
    max_len: usize,
    deadline: Duration,
) -> Result<Vec<u8>> {
    let start = Instant::now();
    let mut out = Vec::new();
    let mut buf = [0u8; 1];

    // The deadline bounds waiting for silence, not an in-progress burst.
    loop {
        match transport.read(&mut buf) {
            Ok(1) => {
                out.push(buf[0]);
                if buf[0] == delim || out.len() >= max_len {
                    return Ok(out);
                }
            }
            Ok(_) if start.elapsed() >= deadline => break,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                if start.elapsed() >= deadline {
                    break;
                }
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }

    if out.is_empty() {
        Err(Error::Timeout(format!(
            "no response within {} ms",
            deadline.as_millis()
        )))
    } else {
        Ok(out)
    }
}

/// Read exactly `len` bytes or fail when `deadline` elapses.
///
/// A partial read at the deadline is a framing error (distinguishable
/// from silence, handled identically by the retry policy).
pub fn read_exact<T: Transport + ?Sized>(
    transport: &mut T,
    len: usize,
    deadline: Duration,
) -> Result<Vec<u8>> {
    let start = Instant::now();
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 256];

    loop {
        let want = (len - out.len()).min(buf.len());
        match transport.read(&mut buf[..want]) {
            Ok(0) if start.elapsed() >= deadline => break,
            Ok(0) => {}
            Ok(n) => {
                out.extend_from_slice(&buf[..n]);
                if out.len() >= len {
                    return Ok(out);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                if start.elapsed() >= deadline {
                    break;
                }
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }

    if out.is_empty() {
        Err(Error::Timeout(format!(
            "no response within {} ms",
            deadline.as_millis()
        )))
    } else {
        Err(Error::Framing(format!(
            "short read: {} of {len} bytes",
            out.len()
        )))
    }
}

/// Read a single acknowledgment byte.
pub fn read_ack_byte<T: Transport + ?Sized>(transport: &mut T, deadline: Duration) -> Result<u8> {
    let bytes = read_exact(transport, 1, deadline)?;
    Ok(bytes[0])
}

/// Read whatever arrives until `max_len` bytes, a quiet gap after a
/// burst, or silence past the deadline.
///
/// Used where the response shape itself discriminates the device family
/// (a framed ack vs. a text banner): one transport-timeout gap after
/// the first bytes marks the response as complete.
pub fn read_some<T: Transport + ?Sized>(
    transport: &mut T,
    max_len: usize,
    deadline: Duration,
) -> Result<Vec<u8>> {
    let start = Instant::now();
    let mut out = Vec::new();
    let mut buf = [0u8; 256];

    loop {
        let want = (max_len - out.len()).min(buf.len());
        match transport.read(&mut buf[..want]) {
            Ok(0) if !out.is_empty() || start.elapsed() >= deadline => break,
            Ok(0) => {}
            Ok(n) => {
                out.extend_from_slice(&buf[..n]);
                if out.len() >= max_len {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                if !out.is_empty() || start.elapsed() >= deadline {
                    break;
                }
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }

    if out.is_empty() {
        Err(Error::Timeout(format!(
            "no response within {} ms",
            deadline.as_millis()
        )))
    } else {
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted transport: reads pop from a queue, empty queue times out.
    struct Scripted {
        rx: VecDeque<u8>,
    }

    impl Scripted {
        fn new(data: &[u8]) -> Self {
            Self {
                rx: data.iter().copied().collect(),
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.rx.is_empty() {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.rx.len());
            for b in buf.iter_mut().take(n) {
                *b = self.rx.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Transport for Scripted {
        fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
        fn timeout(&self) -> Duration {
            Duration::ZERO
        }
        fn clear_input(&mut self) -> Result<()> {
            self.rx.clear();
            Ok(())
        }
        fn name(&self) -> &str {
            "scripted"
        }
    }

    #[test]
    fn test_read_until_delimiter() {
        let mut t = Scripted::new(b"ok\rjunk");
        let line = read_until(&mut t, b'\r', 64, Duration::ZERO).unwrap();
        assert_eq!(line, b"ok\r");
    }

    #[test]
    fn test_read_until_empty_is_timeout() {
        let mut t = Scripted::new(b"");
        assert!(matches!(
            read_until(&mut t, b'\r', 64, Duration::ZERO),
            Err(Error::Timeout(_))
        ));
    }

    #[test]
    fn test_read_until_partial_returned() {
        let mut t = Scripted::new(b"par");
        let got = read_until(&mut t, b'\r', 64, Duration::ZERO).unwrap();
        assert_eq!(got, b"par");
    }

    #[test]
    fn test_read_exact() {
        let mut t = Scripted::new(&[1, 2, 3, 4]);
        assert_eq!(read_exact(&mut t, 3, Duration::ZERO).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_read_exact_short_is_framing() {
        let mut t = Scripted::new(&[1, 2]);
        assert!(matches!(
            read_exact(&mut t, 5, Duration::ZERO),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn test_read_ack_byte() {
        let mut t = Scripted::new(&[0x06]);
        assert_eq!(read_ack_byte(&mut t, Duration::ZERO).unwrap(), 0x06);
    }
}
