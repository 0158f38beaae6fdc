//! Streams backed by user-supplied callbacks.
//!
//! Hosts that own the real transport (a mobile BLE stack, a USB library in
//! another language) provide read and write closures plus whichever optional
//! controls they support. Missing controls report [`Error::Unsupported`].

use crate::error::{Error, Result};
use crate::iostream::{Direction, IoStream, Lines, SerialSettings, Transport};

type ReadFn = Box<dyn FnMut(&mut [u8]) -> Result<usize>>;
type WriteFn = Box<dyn FnMut(&[u8]) -> Result<usize>>;
type TimeoutFn = Box<dyn FnMut(i32) -> Result<()>>;
type ConfigureFn = Box<dyn FnMut(&SerialSettings) -> Result<()>>;
type LineFn = Box<dyn FnMut(bool) -> Result<()>>;
type LinesFn = Box<dyn FnMut() -> Result<Lines>>;
type AvailableFn = Box<dyn FnMut() -> Result<usize>>;
type PurgeFn = Box<dyn FnMut(Direction) -> Result<()>>;
type IoctlFn = Box<dyn FnMut(u32, &mut [u8]) -> Result<usize>>;
type CloseFn = Box<dyn FnMut() -> Result<()>>;

pub struct CustomStream {
    transport: Transport,
    read: ReadFn,
    write: WriteFn,
    set_timeout: Option<TimeoutFn>,
    configure: Option<ConfigureFn>,
    set_dtr: Option<LineFn>,
    set_rts: Option<LineFn>,
    set_break: Option<LineFn>,
    get_lines: Option<LinesFn>,
    get_available: Option<AvailableFn>,
    purge: Option<PurgeFn>,
    ioctl: Option<IoctlFn>,
    close: Option<CloseFn>,
    closed: bool,
}

impl CustomStream {
    pub fn new<R, W>(transport: Transport, read: R, write: W) -> Self
    where
        R: FnMut(&mut [u8]) -> Result<usize> + 'static,
        W: FnMut(&[u8]) -> Result<usize> + 'static,
    {
        CustomStream {
            transport,
            read: Box::new(read),
            write: Box::new(write),
            set_timeout: None,
            configure: None,
            set_dtr: None,
            set_rts: None,
            set_break: None,
            get_lines: None,
            get_available: None,
            purge: None,
            ioctl: None,
            close: None,
            closed: false,
        }
    }

    pub fn on_set_timeout(mut self, f: impl FnMut(i32) -> Result<()> + 'static) -> Self {
        self.set_timeout = Some(Box::new(f));
        self
    }

    pub fn on_configure(mut self, f: impl FnMut(&SerialSettings) -> Result<()> + 'static) -> Self {
        self.configure = Some(Box::new(f));
        self
    }

    pub fn on_set_dtr(mut self, f: impl FnMut(bool) -> Result<()> + 'static) -> Self {
        self.set_dtr = Some(Box::new(f));
        self
    }

    pub fn on_set_rts(mut self, f: impl FnMut(bool) -> Result<()> + 'static) -> Self {
        self.set_rts = Some(Box::new(f));
        self
    }

    pub fn on_set_break(mut self, f: impl FnMut(bool) -> Result<()> + 'static) -> Self {
        self.set_break = Some(Box::new(f));
        self
    }

    pub fn on_get_lines(mut self, f: impl FnMut() -> Result<Lines> + 'static) -> Self {
        self.get_lines = Some(Box::new(f));
        self
    }

    pub fn on_get_available(mut self, f: impl FnMut() -> Result<usize> + 'static) -> Self {
        self.get_available = Some(Box::new(f));
        self
    }

    pub fn on_purge(mut self, f: impl FnMut(Direction) -> Result<()> + 'static) -> Self {
        self.purge = Some(Box::new(f));
        self
    }

    pub fn on_ioctl(mut self, f: impl FnMut(u32, &mut [u8]) -> Result<usize> + 'static) -> Self {
        self.ioctl = Some(Box::new(f));
        self
    }

    pub fn on_close(mut self, f: impl FnMut() -> Result<()> + 'static) -> Self {
        self.close = Some(Box::new(f));
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::io("stream is closed"))
        } else {
            Ok(())
        }
    }
}

fn optional<F, T>(callback: Option<&mut F>, call: impl FnOnce(&mut F) -> Result<T>) -> Result<T> {
    match callback {
        Some(f) => call(f),
        None => Err(Error::Unsupported),
    }
}

impl IoStream for CustomStream {
    fn transport(&self) -> Transport {
        self.transport
    }

    fn configure(&mut self, settings: &SerialSettings) -> Result<()> {
        self.ensure_open()?;
        optional(self.configure.as_mut(), |f| f(settings))
    }

    fn set_timeout(&mut self, timeout_ms: i32) -> Result<()> {
        self.ensure_open()?;
        optional(self.set_timeout.as_mut(), |f| f(timeout_ms))
    }

    fn set_break(&mut self, level: bool) -> Result<()> {
        self.ensure_open()?;
        optional(self.set_break.as_mut(), |f| f(level))
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.ensure_open()?;
        optional(self.set_dtr.as_mut(), |f| f(level))
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.ensure_open()?;
        optional(self.set_rts.as_mut(), |f| f(level))
    }

    fn get_lines(&mut self) -> Result<Lines> {
        self.ensure_open()?;
        optional(self.get_lines.as_mut(), |f| f())
    }

    fn get_available(&mut self) -> Result<usize> {
        self.ensure_open()?;
        optional(self.get_available.as_mut(), |f| f())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        (self.read)(buf)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        (self.write)(data)
    }

    fn purge(&mut self, direction: Direction) -> Result<()> {
        self.ensure_open()?;
        optional(self.purge.as_mut(), |f| f(direction))
    }

    fn ioctl(&mut self, request: u32, data: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        optional(self.ioctl.as_mut(), |f| f(request, data))
    }

    fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed = true;
        match self.close.as_mut() {
            Some(f) => f(),
            None => Ok(()),
        }
    }
}
