use std::ops::BitOr;

/// Identity reported by a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DevInfo {
    pub model: u32,
    pub firmware: u32,
    pub serial: u32,
}

/// Device clock paired with the host clock at the moment it was read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockInfo {
    /// Device ticks, in the model's native unit
    pub devtime: u32,
    /// Host time as Unix seconds
    pub systime: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub current: u32,
    pub maximum: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Progress(Progress),
    DevInfo(DevInfo),
    Clock(ClockInfo),
    Vendor(Vec<u8>),
}

impl Event {
    pub fn kind(&self) -> EventMask {
        match self {
            Event::Progress(_) => EventMask::PROGRESS,
            Event::DevInfo(_) => EventMask::DEVINFO,
            Event::Clock(_) => EventMask::CLOCK,
            Event::Vendor(_) => EventMask::VENDOR,
        }
    }
}

/// Subscription set for [`Event`] kinds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct EventMask(u32);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const PROGRESS: EventMask = EventMask(1 << 0);
    pub const DEVINFO: EventMask = EventMask(1 << 1);
    pub const CLOCK: EventMask = EventMask(1 << 2);
    pub const VENDOR: EventMask = EventMask(1 << 3);
    pub const ALL: EventMask = EventMask(0x0F);

    pub fn contains(&self, other: EventMask) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_membership() {
        let mask = EventMask::PROGRESS | EventMask::DEVINFO;
        assert!(mask.contains(EventMask::PROGRESS));
        assert!(mask.contains(EventMask::DEVINFO));
        assert!(!mask.contains(EventMask::CLOCK));
        assert!(!mask.contains(EventMask::NONE));
        assert!(EventMask::ALL.contains(mask));
    }

    #[test]
    fn test_event_kind() {
        assert_eq!(Event::Vendor(vec![1]).kind(), EventMask::VENDOR);
        assert_eq!(
            Event::Progress(Progress::default()).kind(),
            EventMask::PROGRESS
        );
    }
}
