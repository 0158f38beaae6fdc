//! State and behaviour shared by every backend: the bound stream, the
//! fingerprint, event delivery, cancellation and progress bookkeeping.

use std::ops::ControlFlow;
use std::sync::Arc;

use crate::context::Context;
use crate::device::cancel::CancelToken;
use crate::device::events::{ClockInfo, DevInfo, Event, EventMask, Progress};
use crate::device::retry::RetryPolicy;
use crate::device::DiveCallback;
use crate::error::{Error, Result};
use crate::extract;
use crate::iostream::{Direction, IoStreamExt, Port};

type EventCallback<'a> = Box<dyn FnMut(&Event) + 'a>;

pub struct DeviceBase<'a> {
    ctx: Arc<Context>,
    pub(crate) port: Port<'a>,
    fingerprint: Vec<u8>,
    fingerprint_size: usize,
    event_mask: EventMask,
    event_callback: Option<EventCallback<'a>>,
    cancel: Option<CancelToken>,
    progress: Progress,
    devinfo_sent: bool,
    vendor_sent: bool,
    clock_sent: bool,
    closed: bool,
}

impl<'a> DeviceBase<'a> {
    pub fn new(ctx: Arc<Context>, port: Port<'a>, fingerprint_size: usize) -> Self {
        DeviceBase {
            ctx,
            port,
            fingerprint: Vec::new(),
            fingerprint_size,
            event_mask: EventMask::NONE,
            event_callback: None,
            cancel: None,
            progress: Progress::default(),
            devinfo_sent: false,
            vendor_sent: false,
            clock_sent: false,
            closed: false,
        }
    }

    pub fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn fingerprint_size(&self) -> usize {
        self.fingerprint_size
    }

    /// Store the marker of the last downloaded dive. An empty slice clears it.
    pub fn set_fingerprint(&mut self, data: &[u8]) -> Result<()> {
        if !data.is_empty() && data.len() != self.fingerprint_size {
            return Err(Error::invalid_args(format!(
                "fingerprint must be {} bytes, got {}",
                self.fingerprint_size,
                data.len()
            )));
        }
        self.fingerprint.clear();
        self.fingerprint.extend_from_slice(data);
        Ok(())
    }

    pub fn fingerprint(&self) -> &[u8] {
        &self.fingerprint
    }

    pub fn matches_fingerprint(&self, window: &[u8]) -> bool {
        !self.fingerprint.is_empty() && self.fingerprint.as_slice() == window
    }

    pub fn set_events(&mut self, mask: EventMask, callback: Option<EventCallback<'a>>) {
        self.event_mask = mask;
        self.event_callback = callback;
    }

    pub fn set_cancel(&mut self, token: Option<CancelToken>) {
        self.cancel = token;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    /// Gate for every wire exchange.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn timeout_ms(&self, default_ms: i32) -> i32 {
        self.ctx.config().transfer.timeout_ms.unwrap_or(default_ms)
    }

    pub fn retry_policy(&self, default: RetryPolicy) -> RetryPolicy {
        default.with_overrides(&self.ctx.config().transfer)
    }

    /// Pause and drop stale input before another attempt.
    pub fn prepare_retry(&mut self, delay_ms: u32) -> Result<()> {
        if delay_ms > 0 {
            self.port.sleep(delay_ms)?;
        }
        self.port.purge_lenient(Direction::Input)
    }

    fn emit(&mut self, event: Event) {
        if !self.event_mask.contains(event.kind()) {
            return;
        }
        if let Some(callback) = self.event_callback.as_mut() {
            callback(&event);
        }
    }

    /// Emitted once per session.
    pub fn emit_devinfo(&mut self, info: DevInfo) {
        if self.devinfo_sent {
            return;
        }
        self.devinfo_sent = true;
        tracing::debug!(
            model = info.model,
            firmware = info.firmware,
            serial = info.serial,
            "device identified"
        );
        self.emit(Event::DevInfo(info));
    }

    /// Emitted once per session.
    pub fn emit_vendor(&mut self, data: &[u8]) {
        if self.vendor_sent {
            return;
        }
        self.vendor_sent = true;
        self.emit(Event::Vendor(data.to_vec()));
    }

    /// Emitted at most once per operation.
    pub fn emit_clock(&mut self, clock: ClockInfo) {
        if self.clock_sent {
            return;
        }
        self.clock_sent = true;
        self.emit(Event::Clock(clock));
    }

    /// Reset per-operation state and announce the initial progress.
    pub fn begin_operation(&mut self, maximum: u32) {
        self.clock_sent = false;
        self.progress = Progress {
            current: 0,
            maximum,
        };
        let progress = self.progress;
        self.emit(Event::Progress(progress));
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    /// Revise the expected total. It never drops below the work done.
    pub fn set_progress_maximum(&mut self, maximum: u32) {
        self.progress.maximum = maximum.max(self.progress.current);
        let progress = self.progress;
        self.emit(Event::Progress(progress));
    }

    pub fn advance_progress(&mut self, amount: u32) {
        let current = self.progress.current.saturating_add(amount);
        self.set_progress(current);
    }

    /// Move progress forward to `current`; backward moves are ignored.
    pub fn set_progress(&mut self, current: u32) {
        let current = current.max(self.progress.current);
        if current > self.progress.maximum {
            self.progress.maximum = current;
        }
        self.progress.current = current;
        let progress = self.progress;
        self.emit(Event::Progress(progress));
    }

    pub fn finish_progress(&mut self) {
        let maximum = self.progress.maximum;
        self.set_progress(maximum);
    }

    /// Fingerprint gate plus callback. `Break` ends iteration successfully.
    pub fn deliver(
        &self,
        callback: &mut DiveCallback<'_>,
        dive: &[u8],
        fingerprint: &[u8],
    ) -> ControlFlow<()> {
        extract::deliver(&self.fingerprint, callback, dive, fingerprint)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release the stream if the device owns it. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.port.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iostream::mock::MockStream;
    use crate::iostream::Transport;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn base(stream: &mut MockStream) -> DeviceBase<'_> {
        DeviceBase::new(Context::new().into_shared(), Port::Borrowed(stream), 4)
    }

    #[test]
    fn test_fingerprint_size_enforced() {
        let mut stream = MockStream::new(Transport::Serial);
        let mut base = base(&mut stream);
        assert!(matches!(
            base.set_fingerprint(&[1, 2, 3]),
            Err(Error::InvalidArgs(_))
        ));
        base.set_fingerprint(&[1, 2, 3, 4]).unwrap();
        assert!(base.matches_fingerprint(&[1, 2, 3, 4]));
        base.set_fingerprint(&[]).unwrap();
        assert!(!base.matches_fingerprint(&[]));
    }

    #[test]
    fn test_progress_is_monotonic() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);

        let mut stream = MockStream::new(Transport::Serial);
        let mut base = base(&mut stream);
        base.set_events(
            EventMask::PROGRESS,
            Some(Box::new(move |event: &Event| {
                if let Event::Progress(p) = event {
                    sink.borrow_mut().push(*p);
                }
            })),
        );

        base.begin_operation(100);
        base.advance_progress(40);
        base.set_progress(10);
        base.set_progress_maximum(20);
        base.advance_progress(80);
        base.finish_progress();
        drop(base);

        let seen = seen.borrow();
        for pair in seen.windows(2) {
            assert!(pair[1].current >= pair[0].current);
        }
        for p in seen.iter() {
            assert!(p.current <= p.maximum);
        }
        assert_eq!(seen[3], Progress { current: 40, maximum: 40 });
        assert_eq!(seen.last().unwrap().current, 120);
    }

    #[test]
    fn test_one_shot_events() {
        let count = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&count);

        let mut stream = MockStream::new(Transport::Serial);
        let mut base = base(&mut stream);
        base.set_events(
            EventMask::ALL,
            Some(Box::new(move |_event: &Event| *counter.borrow_mut() += 1)),
        );

        base.emit_devinfo(DevInfo::default());
        base.emit_devinfo(DevInfo::default());
        base.emit_vendor(&[1, 2]);
        base.emit_vendor(&[1, 2]);
        base.emit_clock(ClockInfo {
            devtime: 1,
            systime: 2,
        });
        base.emit_clock(ClockInfo {
            devtime: 1,
            systime: 2,
        });
        drop(base);
        assert_eq!(*count.borrow(), 3);
    }

    #[test]
    fn test_cancel_gate() {
        let mut stream = MockStream::new(Transport::Serial);
        let mut base = base(&mut stream);
        let token = CancelToken::new();
        base.set_cancel(Some(token.clone()));
        assert!(base.check_cancelled().is_ok());
        token.cancel();
        assert_eq!(base.check_cancelled(), Err(Error::Cancelled));
    }

    #[test]
    fn test_deliver_stops_on_fingerprint() {
        let mut stream = MockStream::new(Transport::Serial);
        let mut base = base(&mut stream);
        base.set_fingerprint(&[9, 9, 9, 9]).unwrap();

        let mut delivered = 0;
        let mut callback = |_dive: &[u8], _fp: &[u8]| {
            delivered += 1;
            true
        };
        assert!(base.deliver(&mut callback, &[0], &[1, 1, 1, 1]).is_continue());
        assert!(base.deliver(&mut callback, &[0], &[9, 9, 9, 9]).is_break());
        assert_eq!(delivered, 1);
    }
}
