pub mod array;
pub mod backend;
pub mod checksum;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod extract;
pub mod ffi;
pub mod iostream;
pub mod parser;
pub mod protocol;
pub mod ringbuffer;

uniffi::setup_scaffolding!();

pub use config::Config;
pub use context::{Context, LogLevel};
pub use device::{
    CancelToken, ClockInfo, DevInfo, Device, DeviceBackend, DiveCallback, Event, EventMask, Family,
    Progress, RetryPolicy,
};
pub use error::{ConfigError, Error, Result, Status};
pub use iostream::{IoStream, IoStreamExt, Port, SerialSettings, Transport};
pub use parser::{FieldType, FieldValue, Parser, Sample};
pub use ringbuffer::{Ring, RingMode};
