use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::iostream::{Direction, IoStream, Lines, SerialSettings, Transport};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8>>;

/// Scripted in-memory stream.
///
/// Each `write` is handed to the responder, whose reply is queued as input.
/// Reads drain the queue and come back short, like a timeout, once it is
/// empty. Sleeps are recorded instead of blocking.
pub struct MockStream {
    transport: Transport,
    input: VecDeque<u8>,
    written: Vec<u8>,
    writes: Vec<Vec<u8>>,
    responder: Option<Responder>,
    settings: Option<SerialSettings>,
    timeout_ms: i32,
    dtr: bool,
    rts: bool,
    lines: Lines,
    purges: usize,
    slept_ms: u64,
    closed: bool,
}

impl MockStream {
    pub fn new(transport: Transport) -> Self {
        MockStream {
            transport,
            input: VecDeque::new(),
            written: Vec::new(),
            writes: Vec::new(),
            responder: None,
            settings: None,
            timeout_ms: -1,
            dtr: false,
            rts: false,
            lines: Lines::default(),
            purges: 0,
            slept_ms: 0,
            closed: false,
        }
    }

    pub fn with_responder<F>(transport: Transport, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + 'static,
    {
        let mut stream = Self::new(transport);
        stream.responder = Some(Box::new(responder));
        stream
    }

    pub fn push_input(&mut self, data: &[u8]) {
        self.input.extend(data.iter().copied());
    }

    pub fn set_lines(&mut self, lines: Lines) {
        self.lines = lines;
    }

    /// Every byte written so far, concatenated.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// Every write call so far, one entry per call.
    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    pub fn settings(&self) -> Option<SerialSettings> {
        self.settings
    }

    pub fn timeout_ms(&self) -> i32 {
        self.timeout_ms
    }

    pub fn dtr(&self) -> bool {
        self.dtr
    }

    pub fn rts(&self) -> bool {
        self.rts
    }

    pub fn purge_count(&self) -> usize {
        self.purges
    }

    pub fn slept_ms(&self) -> u64 {
        self.slept_ms
    }

    pub fn pending_input(&self) -> usize {
        self.input.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::io("stream is closed"))
        } else {
            Ok(())
        }
    }
}

impl IoStream for MockStream {
    fn transport(&self) -> Transport {
        self.transport
    }

    fn configure(&mut self, settings: &SerialSettings) -> Result<()> {
        self.ensure_open()?;
        self.settings = Some(*settings);
        Ok(())
    }

    fn set_timeout(&mut self, timeout_ms: i32) -> Result<()> {
        self.ensure_open()?;
        if timeout_ms < -1 {
            return Err(Error::invalid_args(format!("timeout {timeout_ms}")));
        }
        self.timeout_ms = timeout_ms;
        Ok(())
    }

    fn set_break(&mut self, _level: bool) -> Result<()> {
        self.ensure_open()
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.ensure_open()?;
        self.dtr = level;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.ensure_open()?;
        self.rts = level;
        Ok(())
    }

    fn get_lines(&mut self) -> Result<Lines> {
        self.ensure_open()?;
        Ok(self.lines)
    }

    fn get_available(&mut self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.input.len())
    }

    fn poll(&mut self, _timeout_ms: i32) -> Result<bool> {
        self.ensure_open()?;
        Ok(!self.input.is_empty())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let count = buf.len().min(self.input.len());
        for (slot, byte) in buf.iter_mut().zip(self.input.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        self.written.extend_from_slice(data);
        self.writes.push(data.to_vec());
        if let Some(responder) = self.responder.as_mut() {
            let reply = responder(data);
            self.input.extend(reply);
        }
        Ok(data.len())
    }

    fn purge(&mut self, direction: Direction) -> Result<()> {
        self.ensure_open()?;
        if matches!(direction, Direction::Input | Direction::All) {
            self.input.clear();
        }
        self.purges += 1;
        Ok(())
    }

    fn sleep(&mut self, ms: u32) -> Result<()> {
        self.ensure_open()?;
        self.slept_ms += u64::from(ms);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iostream::IoStreamExt;

    #[test]
    fn test_responder_queues_reply() {
        let mut stream = MockStream::with_responder(Transport::Serial, |data| {
            data.iter().map(|b| b.wrapping_add(1)).collect()
        });
        stream.write_all(&[0x10, 0x20]).unwrap();
        assert_eq!(stream.read_vec(2).unwrap(), vec![0x11, 0x21]);
        assert_eq!(stream.writes(), &[vec![0x10, 0x20]]);
    }

    #[test]
    fn test_closed_stream_fails() {
        let mut stream = MockStream::new(Transport::Serial);
        stream.close().unwrap();
        assert!(matches!(stream.set_timeout(100), Err(Error::Io(_))));
        assert!(matches!(stream.read(&mut [0u8; 1]), Err(Error::Io(_))));
        assert!(matches!(stream.close(), Err(Error::Io(_))));
    }

    #[test]
    fn test_line_control() {
        let mut stream = MockStream::new(Transport::Serial);
        stream.set_dtr(true).unwrap();
        stream.set_rts(false).unwrap();
        stream.configure(&SerialSettings::n81(9600)).unwrap();
        assert!(stream.dtr());
        assert!(!stream.rts());
        assert_eq!(stream.settings().unwrap().baudrate, 9600);
    }
}
