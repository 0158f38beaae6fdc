//! Byte-oriented duplex stream abstraction.
//!
//! Every backend talks to hardware exclusively through [`IoStream`]. Serial,
//! IrDA, USB, HID and Bluetooth adapters live outside this crate and only need
//! to implement the trait; [`custom::CustomStream`] wraps user callbacks and
//! [`mock::MockStream`] scripts a device for tests.

pub mod custom;
pub mod mock;

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::error::{Error, Result};

/// Kind of physical transport behind a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Serial,
    Usb,
    UsbHid,
    Irda,
    Bluetooth,
    Ble,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Hardware,
    Software,
}

/// Line settings for serial-like transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baudrate: u32,
    pub databits: u8,
    pub parity: Parity,
    pub stopbits: StopBits,
    pub flowcontrol: FlowControl,
}

impl SerialSettings {
    pub const fn new(
        baudrate: u32,
        databits: u8,
        parity: Parity,
        stopbits: StopBits,
        flowcontrol: FlowControl,
    ) -> Self {
        SerialSettings {
            baudrate,
            databits,
            parity,
            stopbits,
            flowcontrol,
        }
    }

    /// 8 data bits, no parity, one stop bit, no flow control.
    pub const fn n81(baudrate: u32) -> Self {
        Self::new(baudrate, 8, Parity::None, StopBits::One, FlowControl::None)
    }
}

/// Buffer selector for [`IoStream::purge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
    All,
}

/// Modem status lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lines {
    pub dcd: bool,
    pub cts: bool,
    pub dsr: bool,
    pub rng: bool,
}

/// Sideband request: receive latency in milliseconds (USB-serial bridges).
pub const IOCTL_SET_LATENCY: u32 = 0x0001;
/// Sideband request: maximum BLE packet size.
pub const IOCTL_BLE_GET_MTU: u32 = 0x0101;

/// Uniform duplex stream.
///
/// `read` blocks until the buffer is full or the configured timeout expires,
/// and returns the number of bytes actually read; a count below the buffer
/// length means the timeout expired. `write` either completes or fails.
/// Every operation on a closed stream fails with [`Error::Io`].
pub trait IoStream {
    fn transport(&self) -> Transport;

    fn configure(&mut self, _settings: &SerialSettings) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// `-1` blocks indefinitely, `0` is non-blocking, positive is bounded.
    fn set_timeout(&mut self, timeout_ms: i32) -> Result<()>;

    fn set_break(&mut self, _level: bool) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn set_dtr(&mut self, _level: bool) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn set_rts(&mut self, _level: bool) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn get_lines(&mut self) -> Result<Lines> {
        Err(Error::Unsupported)
    }

    /// Bytes ready without blocking.
    fn get_available(&mut self) -> Result<usize> {
        Err(Error::Unsupported)
    }

    /// Wait until data is readable; `Ok(false)` when the wait timed out.
    fn poll(&mut self, _timeout_ms: i32) -> Result<bool> {
        Err(Error::Unsupported)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write(&mut self, data: &[u8]) -> Result<usize>;

    fn purge(&mut self, _direction: Direction) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn sleep(&mut self, ms: u32) -> Result<()> {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
        Ok(())
    }

    fn ioctl(&mut self, _request: u32, _data: &mut [u8]) -> Result<usize> {
        Err(Error::Unsupported)
    }

    fn close(&mut self) -> Result<()>;
}

/// Convenience wrappers shared by all backends.
pub trait IoStreamExt: IoStream {
    /// Read exactly `buf.len()` bytes or fail with [`Error::Timeout`].
    fn read_exact_or_timeout(&mut self, buf: &mut [u8]) -> Result<()> {
        let actual = self.read(buf)?;
        if actual != buf.len() {
            return Err(Error::Timeout {
                actual,
                expected: buf.len(),
            });
        }
        Ok(())
    }

    fn read_vec(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read_exact_or_timeout(&mut buf)?;
        Ok(buf)
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_exact_or_timeout(&mut byte)?;
        Ok(byte[0])
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let actual = self.write(data)?;
        if actual != data.len() {
            return Err(Error::io(format!(
                "short write: {actual} of {} bytes",
                data.len()
            )));
        }
        Ok(())
    }

    /// Purge, treating transports without buffers as already clean.
    fn purge_lenient(&mut self, direction: Direction) -> Result<()> {
        match self.purge(direction) {
            Err(Error::Unsupported) => Ok(()),
            other => other,
        }
    }
}

impl<T: IoStream + ?Sized> IoStreamExt for T {}

/// A stream bound to a device: owned streams are closed with the device,
/// borrowed ones are left open for the caller.
pub enum Port<'a> {
    Owned(Box<dyn IoStream + 'a>),
    Borrowed(&'a mut (dyn IoStream + 'a)),
}

impl<'a> Port<'a> {
    pub fn is_owned(&self) -> bool {
        matches!(self, Port::Owned(_))
    }

    /// Release the stream if this port owns it.
    pub fn close(&mut self) -> Result<()> {
        match self {
            Port::Owned(stream) => stream.close(),
            Port::Borrowed(_) => Ok(()),
        }
    }
}

impl<'a> Deref for Port<'a> {
    type Target = dyn IoStream + 'a;

    fn deref(&self) -> &Self::Target {
        match self {
            Port::Owned(stream) => stream.as_ref(),
            Port::Borrowed(stream) => &**stream,
        }
    }
}

impl<'a> DerefMut for Port<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Port::Owned(stream) => stream.as_mut(),
            Port::Borrowed(stream) => &mut **stream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iostream::mock::MockStream;

    #[test]
    fn test_short_read_is_timeout() {
        let mut stream = MockStream::new(Transport::Serial);
        stream.push_input(&[0x01, 0x02]);

        let mut buf = [0u8; 4];
        let err = stream.read_exact_or_timeout(&mut buf).unwrap_err();
        assert_eq!(
            err,
            Error::Timeout {
                actual: 2,
                expected: 4
            }
        );
    }

    #[test]
    fn test_borrowed_port_stays_open() {
        let mut stream = MockStream::new(Transport::Serial);
        {
            let mut port = Port::Borrowed(&mut stream);
            assert!(!port.is_owned());
            port.write_all(&[0xAA]).unwrap();
            port.close().unwrap();
        }
        assert!(!stream.is_closed());
        assert_eq!(stream.written(), &[0xAA]);
    }

    #[test]
    fn test_owned_port_closes() {
        let mut port = Port::Owned(Box::new(MockStream::new(Transport::Usb)));
        assert!(port.is_owned());
        port.close().unwrap();
        assert!(matches!(port.write_all(&[0x00]), Err(Error::Io(_))));
    }

    #[test]
    fn test_purge_lenient() {
        let mut stream = MockStream::new(Transport::Ble);
        stream.push_input(&[1, 2, 3]);
        stream.purge_lenient(Direction::Input).unwrap();
        assert_eq!(stream.get_available().unwrap(), 0);
    }
}
