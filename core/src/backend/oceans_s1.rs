//! Oceans S1 over BLE. Commands are text lines; replies are either
//! `"<cmd>>ok <value>"` or `"<cmd>>xmr"`, the latter followed by an
//! XMODEM-CRC transfer. The dive list and each dive arrive as text.

use std::ops::ControlFlow;
use std::sync::Arc;

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{char, space1, u32 as decimal};
use nom::combinator::{opt, rest, value};
use nom::sequence::preceded;
use nom::{IResult, Parser};

use crate::context::Context;
use crate::device::{ClockInfo, DevInfo, DeviceBackend, DeviceBase, DiveCallback, Family};
use crate::error::{Error, Result};
use crate::iostream::{Direction, IoStreamExt, Port};
use crate::protocol::xmodem;

pub const FINGERPRINT_SIZE: usize = 4;

const MAX_LINE: usize = 128;
const TIMEOUT_MS: i32 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply<'i> {
    Ok(&'i str),
    Transfer,
}

fn reply<'i>(command: &str, line: &'i str) -> IResult<&'i str, Reply<'i>> {
    let (input, _) = (tag(command), char('>')).parse(line)?;
    alt((
        value(Reply::Transfer, tag("xmr")),
        preceded(tag("ok"), opt(preceded(space1, rest))).map(|v| Reply::Ok(v.unwrap_or(""))),
    ))
    .parse(input)
}

/// One `dive` line of the dive list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListedDive {
    pub number: u32,
    pub timestamp: u32,
}

impl ListedDive {
    pub fn fingerprint(&self) -> [u8; FINGERPRINT_SIZE] {
        self.timestamp.to_le_bytes()
    }
}

fn dive_line(input: &str) -> IResult<&str, ListedDive> {
    let (input, (_, number, _, _mode, _, _o2, _, timestamp)) = (
        tag("dive "),
        decimal,
        char(','),
        decimal,
        char(','),
        decimal,
        char(','),
        decimal,
    )
        .parse(input)?;
    Ok((input, ListedDive { number, timestamp }))
}

/// Dives in the order the device lists them, oldest first.
pub fn parse_dive_list(text: &str) -> Result<Vec<ListedDive>> {
    let mut lines = text.lines().map(str::trim);
    match lines.next() {
        Some(header) if header.starts_with("divelog") => {}
        _ => return Err(Error::data_format("dive list lacks its divelog header")),
    }
    let mut dives = Vec::new();
    for line in lines {
        if !line.starts_with("dive ") {
            continue;
        }
        let (_, dive) = dive_line(line)
            .map_err(|e| Error::data_format(format!("bad dive list line {line:?}: {e}")))?;
        dives.push(dive);
    }
    Ok(dives)
}

/// `"1.6.7"` packed one byte per component.
fn parse_version(text: &str) -> u32 {
    text.split('.')
        .take(3)
        .map(|part| part.trim().parse::<u8>().unwrap_or(0))
        .fold(0u32, |acc, part| (acc << 8) | u32::from(part))
}

pub struct OceansS1<'a> {
    pub(crate) base: DeviceBase<'a>,
}

impl<'a> OceansS1<'a> {
    pub fn open(ctx: Arc<Context>, port: Port<'a>) -> Result<Self> {
        let mut base = DeviceBase::new(ctx, port, FINGERPRINT_SIZE);
        let timeout = base.timeout_ms(TIMEOUT_MS);
        base.port.set_timeout(timeout)?;
        base.port.purge_lenient(Direction::All)?;
        Ok(OceansS1 { base })
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        loop {
            match self.base.port.read_byte()? {
                b'\n' => break,
                byte => line.push(byte),
            }
            if line.len() > MAX_LINE {
                return Err(Error::protocol("reply line too long"));
            }
        }
        let line = String::from_utf8(line).map_err(|_| Error::protocol("reply is not text"))?;
        Ok(line.trim_end_matches('\r').to_string())
    }

    fn send_line(&mut self, command: &str, args: &str) -> Result<String> {
        self.base.check_cancelled()?;
        let line = if args.is_empty() {
            format!("{command}\n")
        } else {
            format!("{command} {args}\n")
        };
        self.base.port.write_all(line.as_bytes())?;
        self.read_line()
    }

    fn command(&mut self, command: &str, args: &str) -> Result<String> {
        let answer = self.send_line(command, args)?;
        tracing::debug!(command, answer = %answer, "command reply");
        match reply(command, &answer) {
            Ok((_, Reply::Ok(value))) => Ok(value.to_string()),
            Ok((_, Reply::Transfer)) => Err(Error::protocol(format!("{command} started a transfer"))),
            Err(_) => Err(Error::protocol(format!("unexpected reply {answer:?} to {command}"))),
        }
    }

    fn transfer(&mut self, command: &str, args: &str) -> Result<Vec<u8>> {
        let answer = self.send_line(command, args)?;
        match reply(command, &answer) {
            Ok((_, Reply::Transfer)) => xmodem::receive(&mut self.base),
            _ => Err(Error::protocol(format!("{command} did not start a transfer: {answer:?}"))),
        }
    }

    fn numeric(&mut self, command: &str) -> Result<u32> {
        let value = self.command(command, "")?;
        value
            .trim()
            .parse()
            .map_err(|_| Error::protocol(format!("{command} returned {value:?}")))
    }
}

impl<'a> DeviceBackend<'a> for OceansS1<'a> {
    fn family(&self) -> Family {
        Family::OceansS1
    }

    fn base(&self) -> &DeviceBase<'a> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase<'a> {
        &mut self.base
    }

    fn foreach(&mut self, callback: &mut DiveCallback<'_>) -> Result<()> {
        self.base.begin_operation(xmodem::PAYLOAD_SIZE as u32);

        let serial = self.numeric("serialnumber")?;
        let version = self.command("version", "")?;
        self.base.emit_devinfo(DevInfo {
            model: 1,
            firmware: parse_version(&version),
            serial,
        });
        self.base.emit_vendor(version.as_bytes());

        let devtime = self.numeric("utc")?;
        self.base.emit_clock(ClockInfo {
            devtime,
            systime: chrono::Utc::now().timestamp(),
        });

        let list = self.transfer("dllist", "")?;
        let list = parse_dive_list(&String::from_utf8_lossy(&list))?;
        let pending: Vec<ListedDive> = list
            .iter()
            .rev()
            .take_while(|dive| !self.base.matches_fingerprint(&dive.fingerprint()))
            .copied()
            .collect();

        let done = self.base.progress().current;
        self.base
            .set_progress_maximum(done + (pending.len() * xmodem::PAYLOAD_SIZE) as u32);

        for listed in &pending {
            let args = format!("{} {}", listed.number, listed.number + 1);
            let dive = self.transfer("dlget", &args)?;
            if dive.is_empty() {
                tracing::debug!(number = listed.number, "device has no more dives");
                break;
            }
            if let ControlFlow::Break(()) = self.base.deliver(callback, &dive, &listed.fingerprint()) {
                break;
            }
        }
        self.base.finish_progress();
        Ok(())
    }
}
