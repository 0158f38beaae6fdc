//! Heinrichs Weikamp OSTC3 family (hwOS).
//!
//! Every command is echoed by the device before its parameters are sent and
//! is acknowledged with a ready byte afterwards. The device has a download
//! mode and a service mode; the latter also accepts every download command.

use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::array::{u16_be, u16_le, u24_le};
use crate::context::Context;
use crate::ctx_warning;
use crate::device::{DevInfo, DeviceBackend, DeviceBase, DiveCallback, Family, RetryPolicy};
use crate::error::{Error, Result};
use crate::extract::logbook::{self, LogbookFormat};
use crate::iostream::{Direction, IoStreamExt, Port, SerialSettings};

pub const FINGERPRINT_SIZE: usize = 5;

pub const INIT: u8 = 0xBB;
pub const EXIT: u8 = 0xFF;
pub const READY: u8 = 0x4D;
pub const S_READY: u8 = 0x4C;
pub const HEADER: u8 = 0x61;
pub const CLOCK: u8 = 0x62;
pub const CUSTOMTEXT: u8 = 0x63;
pub const DIVE: u8 = 0x66;
pub const IDENTITY: u8 = 0x69;
pub const HARDWARE: u8 = 0x6A;
pub const COMPACT: u8 = 0x6D;
pub const DISPLAY: u8 = 0x6E;
pub const S_INIT: u8 = 0xAA;
pub const S_BLOCK_READ: u8 = 0x20;
pub const S_UPGRADE: u8 = 0x50;

const SERVICE_KEY: [u8; 3] = [0xAB, 0xCD, 0xEF];
const SERVICE_ACK: u8 = 0x4B;

pub const SZ_IDENTITY: usize = 64;
pub const SZ_FULL: usize = 256;
pub const SZ_COMPACT: usize = 16;
pub const LOGBOOK_COUNT: usize = 256;
pub const SZ_MEMORY: u32 = 0x40_0000;
const SZ_BLOCK: u32 = 0x1000;
const SZ_DISPLAY: usize = 16;
const SZ_CUSTOMTEXT: usize = 60;
const CHUNK: usize = 1024;
const TIMEOUT_MS: i32 = 3000;

/// Firmware that can list the logbook in compact form.
const COMPACT_SINCE: u32 = 0x0200;
/// Firmware before this records profile lengths three bytes too long.
const LENGTH_FIX_BEFORE: u32 = 0x015D;
const LENGTH_ERROR: usize = 3;
/// Hardware descriptor of the OSTC4, which keeps its newest dive in slot 0.
pub const HW_OSTC4: u32 = 0x3B;

const END_OF_PROFILE: [u8; 2] = [0xFD, 0xFD];
/// Length, sampling rate and divisor count precede the samples.
const PROFILE_HEADER: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Open,
    Download,
    Service,
    Rebooting,
}

/// Logbook entry layouts.
#[derive(Debug, Clone, Copy)]
struct Logbook {
    compact: bool,
    length_error: usize,
    first_is_latest: bool,
}

impl Logbook {
    fn length_offset(&self) -> usize {
        if self.compact {
            0
        } else {
            9
        }
    }

    fn date_offset(&self) -> usize {
        if self.compact {
            3
        } else {
            12
        }
    }

    fn number_offset(&self) -> usize {
        if self.compact {
            13
        } else {
            0x50
        }
    }

    /// Does the header at the front of a downloaded profile describe the
    /// same dive as the logbook entry?
    fn matches(&self, entry: &[u8], header: &[u8]) -> bool {
        if !self.compact {
            return entry == header;
        }
        header[9..12] == entry[0..3]
            && header[12..12 + FINGERPRINT_SIZE] == entry[3..3 + FINGERPRINT_SIZE]
            && header[0x50..0x52] == entry[13..15]
    }
}

impl LogbookFormat for Logbook {
    fn entry_size(&self) -> usize {
        if self.compact {
            SZ_COMPACT
        } else {
            SZ_FULL
        }
    }

    fn dive_number(&self, entry: &[u8]) -> u32 {
        u32::from(u16_le(entry, self.number_offset()))
    }

    fn profile_length(&self, entry: &[u8]) -> usize {
        let recorded = u24_le(entry, self.length_offset()) as usize;
        SZ_FULL + recorded.saturating_sub(self.length_error)
    }

    fn fingerprint<'e>(&self, entry: &'e [u8]) -> &'e [u8] {
        let at = self.date_offset();
        &entry[at..at + FINGERPRINT_SIZE]
    }

    fn first_is_latest(&self) -> bool {
        self.first_is_latest
    }
}

#[derive(Debug, Clone)]
struct Identity {
    info: DevInfo,
    raw: Vec<u8>,
}

pub struct HwOstc3<'a> {
    pub(crate) base: DeviceBase<'a>,
    retry: RetryPolicy,
    state: State,
    model: u32,
    identity: Option<Identity>,
}

impl<'a> HwOstc3<'a> {
    pub fn open(ctx: Arc<Context>, port: Port<'a>, model: u32) -> Result<Self> {
        let mut base = DeviceBase::new(ctx, port, FINGERPRINT_SIZE);
        match base.port.configure(&SerialSettings::n81(115200)) {
            Err(Error::Unsupported) => {}
            other => other?,
        }
        let timeout = base.timeout_ms(TIMEOUT_MS);
        base.port.set_timeout(timeout)?;
        base.port.sleep(300)?;
        base.port.purge_lenient(Direction::All)?;
        let retry = base.retry_policy(RetryPolicy::none());

        Ok(HwOstc3 {
            base,
            retry,
            state: State::Open,
            model,
            identity: None,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn ready_byte(&self) -> u8 {
        if self.state == State::Service {
            S_READY
        } else {
            READY
        }
    }

    fn exchange(&mut self, cmd: u8, input: &[u8], output_len: usize, progress: bool) -> Result<Vec<u8>> {
        self.base.check_cancelled()?;
        let port = &mut self.base.port;

        port.write_all(&[cmd])?;
        let echo = port.read_byte()?;
        if echo != cmd {
            return Err(Error::protocol(format!(
                "command {cmd:#04x} echoed as {echo:#04x}"
            )));
        }
        if !input.is_empty() {
            port.write_all(input)?;
        }

        let mut output = Vec::with_capacity(output_len);
        while output.len() < output_len {
            let len = CHUNK.min(output_len - output.len());
            let chunk = self.base.port.read_vec(len)?;
            output.extend_from_slice(&chunk);
            if progress {
                self.base.advance_progress(len as u32);
            }
        }

        if cmd != EXIT && cmd != S_UPGRADE {
            let expected = self.ready_byte();
            let ready = self.base.port.read_byte()?;
            if ready != expected {
                return Err(Error::protocol(format!(
                    "expected ready byte {expected:#04x}, got {ready:#04x}"
                )));
            }
        }
        Ok(output)
    }

    fn transfer(&mut self, cmd: u8, input: &[u8], output_len: usize, progress: bool) -> Result<Vec<u8>> {
        let retry = self.retry;
        retry.run(|attempt| {
            if attempt > 0 {
                self.base.prepare_retry(retry.delay_ms)?;
            }
            self.exchange(cmd, input, output_len, progress)
        })
    }

    fn init_service(&mut self) -> Result<()> {
        self.base.check_cancelled()?;
        let mut command = vec![S_INIT];
        command.extend_from_slice(&SERVICE_KEY);
        self.base.port.write_all(&command)?;
        let answer = self.base.port.read_vec(5)?;
        if answer[0] != SERVICE_ACK || answer[1..4] != SERVICE_KEY || answer[4] != S_READY {
            return Err(Error::protocol("service mode refused"));
        }
        Ok(())
    }

    /// Move the state machine to `target`. Service mode stays in place when
    /// download mode is requested.
    fn enter(&mut self, target: State) -> Result<()> {
        match (self.state, target) {
            (current, target) if current == target => Ok(()),
            (State::Service, State::Download) => Ok(()),
            (State::Open, State::Download) => {
                self.transfer(INIT, &[], 0, false)?;
                self.state = State::Download;
                Ok(())
            }
            (State::Open, State::Service) => {
                self.init_service()?;
                self.state = State::Service;
                Ok(())
            }
            (State::Rebooting, _) => Err(Error::io("device is rebooting")),
            (current, target) => Err(Error::invalid_args(format!(
                "cannot switch from {current:?} to {target:?} mode"
            ))),
        }
    }

    fn identify(&mut self) -> Result<Identity> {
        if let Some(identity) = &self.identity {
            return Ok(identity.clone());
        }
        let raw = self.transfer(IDENTITY, &[], SZ_IDENTITY, false)?;
        let model = match self.transfer(HARDWARE, &[], 1, false) {
            Ok(hardware) => u32::from(hardware[0]),
            Err(Error::Protocol(_)) | Err(Error::Timeout { .. }) if self.model != 0 => {
                tracing::debug!("hardware descriptor unavailable, using configured model");
                self.base.port.purge_lenient(Direction::Input)?;
                self.model
            }
            Err(e) => return Err(e),
        };
        let identity = Identity {
            info: DevInfo {
                model,
                firmware: u32::from(u16_be(&raw, 2)),
                serial: u32::from(u16_le(&raw, 0)),
            },
            raw,
        };
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Show up to 16 characters on the device screen.
    pub fn set_display(&mut self, text: &str) -> Result<()> {
        self.enter(State::Download)?;
        let packet = pad_text(text, SZ_DISPLAY)?;
        self.transfer(DISPLAY, &packet, 0, false)?;
        Ok(())
    }

    /// Store up to 60 characters of owner text.
    pub fn set_custom_text(&mut self, text: &str) -> Result<()> {
        self.enter(State::Download)?;
        let packet = pad_text(text, SZ_CUSTOMTEXT)?;
        self.transfer(CUSTOMTEXT, &packet, 0, false)?;
        Ok(())
    }

    /// Start the firmware update that was previously written to flash. The
    /// device reboots and the handle can only be closed afterwards.
    pub fn start_upgrade(&mut self, checksum: u32) -> Result<()> {
        self.enter(State::Service)?;
        let mut packet = [0u8; 5];
        packet[..4].copy_from_slice(&checksum.to_le_bytes());
        packet[4] = packet[..4]
            .iter()
            .fold(0x55u8, |acc, &b| (acc ^ b).rotate_left(1));
        self.transfer(S_UPGRADE, &packet, 0, false)?;
        self.state = State::Rebooting;
        Ok(())
    }

    fn download_logbook(&mut self, format: &Logbook) -> Result<Vec<u8>> {
        let cmd = if format.compact { COMPACT } else { HEADER };
        self.transfer(cmd, &[], format.entry_size() * LOGBOOK_COUNT, true)
    }

    /// Valid length of a downloaded dive. Damaged profiles shrink to the
    /// header alone.
    fn valid_length(&self, dive: &[u8], length_error: usize) -> usize {
        let length = dive.len();
        if length < SZ_FULL + END_OF_PROFILE.len() || dive[length - 2..] != END_OF_PROFILE {
            ctx_warning!(self.base.ctx(), "invalid profile end marker, keeping header only");
            return SZ_FULL;
        }
        if length == SZ_FULL + END_OF_PROFILE.len() {
            return length;
        }
        let inner = u24_le(dive, SZ_FULL) as usize;
        let recorded = u24_le(dive, 9) as usize;
        if length < SZ_FULL + PROFILE_HEADER + END_OF_PROFILE.len() || inner + length_error != recorded {
            ctx_warning!(self.base.ctx(), "invalid profile header, keeping header only");
            return SZ_FULL;
        }
        length
    }
}

fn pad_text(text: &str, size: usize) -> Result<Vec<u8>> {
    if !text.is_ascii() || text.len() > size {
        return Err(Error::invalid_args(format!(
            "text must be at most {size} ASCII characters"
        )));
    }
    let mut packet = text.as_bytes().to_vec();
    packet.resize(size, b' ');
    Ok(packet)
}

impl<'a> DeviceBackend<'a> for HwOstc3<'a> {
    fn family(&self) -> Family {
        Family::HwOstc3
    }

    fn base(&self) -> &DeviceBase<'a> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase<'a> {
        &mut self.base
    }

    fn read(&mut self, address: u32, size: usize) -> Result<Vec<u8>> {
        self.enter(State::Service)?;
        let mut data = Vec::with_capacity(size);
        let mut address = address;
        while data.len() < size {
            let len = (size - data.len()).min(SZ_BLOCK as usize) as u32;
            let a = address.to_be_bytes();
            let n = len.to_be_bytes();
            let params = [a[1], a[2], a[3], n[1], n[2], n[3]];
            let block = self.transfer(S_BLOCK_READ, &params, len as usize, true)?;
            data.extend_from_slice(&block);
            address += len;
        }
        Ok(data)
    }

    fn dump(&mut self) -> Result<Vec<u8>> {
        self.base.begin_operation(SZ_MEMORY);
        self.enter(State::Service)?;
        let identity = self.identify()?;
        self.base.emit_devinfo(identity.info);
        self.base.emit_vendor(&identity.raw);
        let image = self.read(0, SZ_MEMORY as usize)?;
        self.base.finish_progress();
        Ok(image)
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.base
            .begin_operation((SZ_FULL * LOGBOOK_COUNT) as u32 + SZ_MEMORY);
        self.enter(State::Download)?;

        let identity = self.identify()?;
        self.base.emit_devinfo(identity.info);
        self.base.emit_vendor(&identity.raw);

        let firmware = identity.info.firmware;
        let format = Logbook {
            compact: firmware >= COMPACT_SINCE,
            length_error: if firmware < LENGTH_FIX_BEFORE { LENGTH_ERROR } else { 0 },
            first_is_latest: identity.info.model == HW_OSTC4,
        };

        let table = self.download_logbook(&format)?;
        let plan = logbook::plan(&format, &table, self.base.fingerprint())?;
        self.base
            .set_progress_maximum(plan.progress_maximum(table.len()));
        tracing::debug!(dives = plan.dives.len(), compact = format.compact, "logbook read");

        let size = format.entry_size();
        for planned in &plan.dives {
            let index = u8::try_from(planned.index)
                .map_err(|_| Error::data_format("logbook index out of range"))?;
            let dive = self.transfer(DIVE, &[index], planned.length, true)?;

            let entry = &table[planned.index * size..(planned.index + 1) * size];
            if dive.len() < SZ_FULL || !format.matches(entry, &dive[..SZ_FULL]) {
                return Err(Error::data_format(format!(
                    "profile {} does not match its logbook entry",
                    planned.index
                )));
            }
            let length = self.valid_length(&dive, format.length_error);
            self.base.advance_progress(1);

            let fingerprint = &dive[12..12 + FINGERPRINT_SIZE];
            if let ControlFlow::Break(()) = self.base.deliver(callback, &dive[..length], fingerprint) {
                break;
            }
        }
        self.base.finish_progress();
        Ok(())
    }

    fn timesync(&mut self, datetime: &NaiveDateTime) -> Result<()> {
        self.enter(State::Download)?;
        let year = datetime.year() - 2000;
        if !(0..=255).contains(&year) {
            return Err(Error::invalid_args(format!("year {} out of range", datetime.year())));
        }
        let packet = [
            datetime.hour() as u8,
            datetime.minute() as u8,
            datetime.second() as u8,
            datetime.month() as u8,
            datetime.day() as u8,
            year as u8,
        ];
        self.transfer(CLOCK, &packet, 0, false)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let farewell = match self.state {
            State::Download | State::Service => self.transfer(EXIT, &[], 0, false).map(|_| ()),
            State::Open | State::Rebooting => Ok(()),
        };
        self.state = State::Open;
        let closed = self.base.close();
        farewell.and(closed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::NaiveDate;

    use super::*;
    use crate::context::LogLevel;
    use crate::iostream::mock::MockStream;
    use crate::iostream::Transport;

    struct Sim {
        identity: Vec<u8>,
        hardware: u8,
        compact: Vec<u8>,
        full: Vec<u8>,
        dives: HashMap<u8, Vec<u8>>,
    }

    fn header(number: u16, profile_len: usize, recorded_extra: usize) -> Vec<u8> {
        let mut header = vec![0u8; SZ_FULL];
        header[..2].copy_from_slice(&[0xFA, 0xFA]);
        header[8] = 0x23;
        let recorded = (profile_len + recorded_extra) as u32;
        header[9..12].copy_from_slice(&recorded.to_le_bytes()[..3]);
        header[12..17].copy_from_slice(&[24, 3, 1, 10, number as u8]);
        header[0x50..0x52].copy_from_slice(&number.to_le_bytes());
        header
    }

    fn profile(samples: usize) -> Vec<u8> {
        let len = PROFILE_HEADER + samples + 2;
        let mut profile = (len as u32).to_le_bytes()[..3].to_vec();
        profile.extend_from_slice(&[2, 0]);
        profile.extend(std::iter::repeat(0x21).take(samples));
        profile.extend_from_slice(&END_OF_PROFILE);
        profile
    }

    fn compact_of(header: &[u8]) -> Vec<u8> {
        let mut entry = vec![0u8; SZ_COMPACT];
        entry[0..3].copy_from_slice(&header[9..12]);
        entry[3..8].copy_from_slice(&header[12..17]);
        entry[13..15].copy_from_slice(&header[0x50..0x52]);
        entry[15] = header[8];
        entry
    }

    impl Sim {
        /// Dive numbers placed at consecutive logbook slots starting at `first`.
        fn new(firmware: u16, first: usize, numbers: &[u16], recorded_extra: usize) -> Self {
            let mut identity = vec![0u8; SZ_IDENTITY];
            identity[0..2].copy_from_slice(&1234u16.to_le_bytes());
            identity[2..4].copy_from_slice(&firmware.to_be_bytes());
            let mut compact = vec![0xFFu8; SZ_COMPACT * LOGBOOK_COUNT];
            let mut full = vec![0xFFu8; SZ_FULL * LOGBOOK_COUNT];
            let mut dives = HashMap::new();
            for (i, &number) in numbers.iter().enumerate() {
                let slot = (first + i) % LOGBOOK_COUNT;
                let profile = profile(10 * usize::from(number));
                let header = header(number, profile.len(), recorded_extra);
                compact[slot * SZ_COMPACT..(slot + 1) * SZ_COMPACT].copy_from_slice(&compact_of(&header));
                full[slot * SZ_FULL..(slot + 1) * SZ_FULL].copy_from_slice(&header);
                dives.insert(slot as u8, [header, profile].concat());
            }
            Sim {
                identity,
                hardware: 0x0A,
                compact,
                full,
                dives,
            }
        }

        fn into_stream(self) -> MockStream {
            let mut awaiting: Option<(u8, usize)> = None;
            let mut params: Vec<u8> = Vec::new();
            let mut service = false;
            MockStream::with_responder(Transport::Serial, move |data| {
                let ready = if service { S_READY } else { READY };
                if let Some((cmd, needed)) = awaiting {
                    params.extend_from_slice(data);
                    if params.len() < needed {
                        return Vec::new();
                    }
                    awaiting = None;
                    let mut reply = match cmd {
                        DIVE => self.dives.get(&params[0]).cloned().unwrap_or_default(),
                        S_BLOCK_READ => {
                            let len = u32::from_be_bytes([0, params[3], params[4], params[5]]);
                            vec![0x5A; len as usize]
                        }
                        _ => Vec::new(),
                    };
                    params.clear();
                    if cmd != S_UPGRADE {
                        reply.push(ready);
                    }
                    return reply;
                }
                match data {
                    [S_INIT, 0xAB, 0xCD, 0xEF] => {
                        service = true;
                        vec![SERVICE_ACK, 0xAB, 0xCD, 0xEF, S_READY]
                    }
                    [INIT] => vec![INIT, READY],
                    [EXIT] => vec![EXIT],
                    [IDENTITY] => [vec![IDENTITY], self.identity.clone(), vec![ready]].concat(),
                    [HARDWARE] => vec![HARDWARE, self.hardware, ready],
                    [COMPACT] => [vec![COMPACT], self.compact.clone(), vec![ready]].concat(),
                    [HEADER] => [vec![HEADER], self.full.clone(), vec![ready]].concat(),
                    [cmd @ (DIVE | CLOCK | DISPLAY | CUSTOMTEXT | S_BLOCK_READ | S_UPGRADE)] => {
                        let needed = match *cmd {
                            DIVE => 1,
                            CLOCK => 6,
                            DISPLAY => SZ_DISPLAY,
                            CUSTOMTEXT => SZ_CUSTOMTEXT,
                            S_BLOCK_READ => 6,
                            _ => 5,
                        };
                        awaiting = Some((*cmd, needed));
                        vec![*cmd]
                    }
                    _ => Vec::new(),
                }
            })
        }
    }

    fn download(sim: Sim, fingerprint: &[u8]) -> (Result<()>, Vec<Vec<u8>>, MockStream) {
        let mut stream = sim.into_stream();
        let mut dives = Vec::new();
        let result = {
            let ctx = Context::new().into_shared();
            let mut device = HwOstc3::open(ctx, Port::Borrowed(&mut stream), 0).unwrap();
            device.base.set_fingerprint(fingerprint).unwrap();
            let result = device.foreach(&mut |dive: &[u8], _fp: &[u8]| {
                dives.push(dive.to_vec());
                true
            });
            device.close().unwrap();
            result
        };
        (result, dives, stream)
    }

    fn numbers(dives: &[Vec<u8>]) -> Vec<u16> {
        dives.iter().map(|d| u16_le(d, 0x50)).collect()
    }

    #[test]
    fn test_compact_logbook_newest_first() {
        let (result, dives, stream) = download(Sim::new(0x0305, 250, &[1, 2, 3, 4, 5, 6, 7, 8], 0), &[]);
        result.unwrap();
        assert_eq!(numbers(&dives), vec![8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(dives[0].len(), SZ_FULL + PROFILE_HEADER + 80 + 2);
        assert_eq!(stream.writes()[0], vec![INIT]);
        assert_eq!(stream.writes().last().unwrap(), &vec![EXIT]);
    }

    #[test]
    fn test_fingerprint_stops_before_known_dive() {
        let (result, dives, _) = download(Sim::new(0x0305, 0, &[1, 2, 3, 4], 0), &[24, 3, 1, 10, 2]);
        result.unwrap();
        assert_eq!(numbers(&dives), vec![4, 3]);
    }

    #[test]
    fn test_full_logbook_on_old_firmware() {
        let (result, dives, stream) = download(Sim::new(0x0150, 0, &[1, 2], LENGTH_ERROR), &[]);
        result.unwrap();
        assert_eq!(numbers(&dives), vec![2, 1]);
        assert_eq!(dives[1].len(), SZ_FULL + PROFILE_HEADER + 10 + 2);
        assert!(stream.writes().contains(&vec![HEADER]));
    }

    #[test]
    fn test_truncated_profile_keeps_header() {
        let mut sim = Sim::new(0x0305, 0, &[1], 0);
        let dive = sim.dives.get_mut(&0).unwrap();
        let len = dive.len();
        dive[len - 1] = 0x00;
        let mut stream = sim.into_stream();

        let warnings = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&warnings);
        let mut ctx = Context::new();
        ctx.set_log_level(LogLevel::Warning);
        ctx.set_log_sink(move |level, message| {
            if let Ok(mut log) = sink.lock() {
                log.push((level, message.to_string()));
            }
        });

        let mut dives = Vec::new();
        let mut device = HwOstc3::open(ctx.into_shared(), Port::Borrowed(&mut stream), 0).unwrap();
        device
            .foreach(&mut |dive: &[u8], _fp: &[u8]| {
                dives.push(dive.len());
                true
            })
            .unwrap();

        assert_eq!(dives, vec![SZ_FULL]);
        let warnings = warnings.lock().unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].0, LogLevel::Warning);
        assert!(warnings[0].1.contains("end marker"));
    }

    #[test]
    fn test_mismatched_profile_is_data_format() {
        let mut sim = Sim::new(0x0305, 0, &[1, 2], 0);
        sim.dives.get_mut(&1).unwrap()[12] = 99;
        let (result, dives, _) = download(sim, &[]);
        assert!(matches!(result, Err(Error::DataFormat(_))));
        assert!(dives.is_empty());
    }

    #[test]
    fn test_service_mode_read_and_state_rules() {
        let mut stream = Sim::new(0x0305, 0, &[], 0).into_stream();
        let ctx = Context::new().into_shared();
        let mut device = HwOstc3::open(ctx, Port::Borrowed(&mut stream), 0).unwrap();
        assert_eq!(device.state(), State::Open);

        let data = device.read(0x1000, 0x1800).unwrap();
        assert_eq!(data.len(), 0x1800);
        assert_eq!(device.state(), State::Service);

        // Download commands still work in service mode.
        let when = NaiveDate::from_ymd_opt(2023, 12, 31)
            .unwrap()
            .and_hms_opt(23, 59, 0)
            .unwrap();
        device.timesync(&when).unwrap();
        assert_eq!(device.state(), State::Service);

        device.start_upgrade(0x1234_5678).unwrap();
        assert_eq!(device.state(), State::Rebooting);
        assert!(matches!(device.read(0, 16), Err(Error::Io(_))));
        device.close().unwrap();
        drop(device);
        assert_ne!(stream.writes().last().unwrap(), &vec![EXIT]);
    }

    #[test]
    fn test_download_mode_cannot_enter_service() {
        let mut stream = Sim::new(0x0305, 0, &[], 0).into_stream();
        let ctx = Context::new().into_shared();
        let mut device = HwOstc3::open(ctx, Port::Borrowed(&mut stream), 0).unwrap();
        device.set_display("hello").unwrap();
        assert_eq!(device.state(), State::Download);
        assert!(matches!(device.read(0, 16), Err(Error::InvalidArgs(_))));
        assert!(matches!(
            device.set_custom_text(&"x".repeat(61)),
            Err(Error::InvalidArgs(_))
        ));
    }
}
