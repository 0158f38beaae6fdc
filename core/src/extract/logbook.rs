//! Download planning for devices with a fixed logbook table and a separate
//! profile ring.

use crate::array::is_filled;
use crate::error::{Error, Result};

/// How to read one logbook entry.
pub trait LogbookFormat {
    fn entry_size(&self) -> usize;

    fn is_empty(&self, entry: &[u8]) -> bool {
        is_filled(entry, 0xFF)
    }

    fn dive_number(&self, entry: &[u8]) -> u32;

    /// Bytes to fetch for this dive's profile, after any firmware quirks
    /// have been accounted for.
    fn profile_length(&self, entry: &[u8]) -> usize;

    fn fingerprint<'e>(&self, entry: &'e [u8]) -> &'e [u8];

    /// Some firmware keeps the newest dive in slot zero regardless of its
    /// number.
    fn first_is_latest(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDive {
    pub index: usize,
    pub length: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadPlan {
    /// Newest first.
    pub dives: Vec<PlannedDive>,
    pub profile_bytes: usize,
}

impl DownloadPlan {
    /// Progress maximum once the logbook is in hand: the logbook itself,
    /// every profile and one step per dive.
    pub fn progress_maximum(&self, logbook_bytes: usize) -> u32 {
        let total = logbook_bytes + self.profile_bytes + self.dives.len();
        u32::try_from(total).unwrap_or(u32::MAX)
    }
}

/// Index of the newest entry, or `None` if the logbook is empty.
pub fn latest<F: LogbookFormat>(format: &F, logbook: &[u8]) -> Option<usize> {
    let mut best: Option<(usize, u32)> = None;
    for (index, entry) in logbook.chunks_exact(format.entry_size()).enumerate() {
        if format.is_empty(entry) {
            continue;
        }
        if format.first_is_latest() {
            return (index == 0).then_some(0);
        }
        let number = format.dive_number(entry);
        if best.is_none_or(|(_, max)| number > max) {
            best = Some((index, number));
        }
    }
    best.map(|(index, _)| index)
}

/// Walk the logbook from the newest entry backwards, stopping at the first
/// empty slot or at the entry matching `fingerprint`.
pub fn plan<F: LogbookFormat>(format: &F, logbook: &[u8], fingerprint: &[u8]) -> Result<DownloadPlan> {
    let size = format.entry_size();
    if size == 0 || logbook.len() % size != 0 {
        return Err(Error::data_format(format!(
            "logbook of {} bytes is not a whole number of {size} byte entries",
            logbook.len()
        )));
    }
    let count = logbook.len() / size;

    let mut plan = DownloadPlan::default();
    let Some(latest) = latest(format, logbook) else {
        return Ok(plan);
    };

    for i in 0..count {
        let index = (latest + count - i) % count;
        let entry = &logbook[index * size..(index + 1) * size];
        if format.is_empty(entry) {
            break;
        }
        if !fingerprint.is_empty() && format.fingerprint(entry) == fingerprint {
            tracing::debug!(index, "logbook entry matches fingerprint");
            break;
        }
        let length = format.profile_length(entry);
        plan.profile_bytes += length;
        plan.dives.push(PlannedDive { index, length });
    }
    Ok(plan)
}
