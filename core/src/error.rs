use std::fmt;

use thiserror::Error;

/// Outcome of a library operation.
///
/// `Done` marks the end of an iteration and never escapes a public
/// operation; it is normalized to `Success` at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    Done,
    Unsupported,
    InvalidArgs,
    NoMemory,
    NoDevice,
    NoAccess,
    Io,
    Timeout,
    Protocol,
    DataFormat,
    Cancelled,
}

impl Status {
    /// Status of a finished operation.
    pub fn of<T>(result: &Result<T>) -> Status {
        match result {
            Ok(_) => Status::Success,
            Err(e) => e.status(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Done => "done",
            Status::Unsupported => "unsupported",
            Status::InvalidArgs => "invalid arguments",
            Status::NoMemory => "out of memory",
            Status::NoDevice => "no device",
            Status::NoAccess => "access denied",
            Status::Io => "input/output error",
            Status::Timeout => "timeout",
            Status::Protocol => "protocol error",
            Status::DataFormat => "data format error",
            Status::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error type for every device, stream and parser operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("operation not supported")]
    Unsupported,

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("insufficient buffer space: need {needed} bytes, have {available}")]
    NoMemory { needed: usize, available: usize },

    #[error("no device found")]
    NoDevice,

    #[error("access denied")]
    NoAccess,

    #[error("i/o error: {0}")]
    Io(String),

    #[error("timeout: received {actual} of {expected} bytes")]
    Timeout { actual: usize, expected: usize },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("data format error: {0}")]
    DataFormat(String),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Error::Unsupported => Status::Unsupported,
            Error::InvalidArgs(_) => Status::InvalidArgs,
            Error::NoMemory { .. } => Status::NoMemory,
            Error::NoDevice => Status::NoDevice,
            Error::NoAccess => Status::NoAccess,
            Error::Io(_) => Status::Io,
            Error::Timeout { .. } => Status::Timeout,
            Error::Protocol(_) => Status::Protocol,
            Error::DataFormat(_) => Status::DataFormat,
            Error::Cancelled => Status::Cancelled,
        }
    }

    /// Only framing and timing failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Timeout { .. })
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    pub(crate) fn data_format(message: impl Into<String>) -> Self {
        Error::DataFormat(message.into())
    }

    pub(crate) fn invalid_args(message: impl Into<String>) -> Self {
        Error::InvalidArgs(message.into())
    }

    pub(crate) fn io(message: impl Into<String>) -> Self {
        Error::Io(message.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Error::Timeout {
                actual: 0,
                expected: 0,
            },
            std::io::ErrorKind::NotFound => Error::NoDevice,
            std::io::ErrorKind::PermissionDenied => Error::NoAccess,
            std::io::ErrorKind::Unsupported => Error::Unsupported,
            _ => Error::Io(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error type for loading and validating a [`crate::config::Config`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("invalid config syntax: {0}")]
    Syntax(#[from] toml::de::Error),

    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Timeout {
            actual: 3,
            expected: 8,
        };
        assert_eq!(err.to_string(), "timeout: received 3 of 8 bytes");

        let err = Error::protocol("unexpected echo");
        assert_eq!(err.to_string(), "protocol error: unexpected echo");

        let err = Error::NoMemory {
            needed: 16,
            available: 4,
        };
        assert_eq!(
            err.to_string(),
            "insufficient buffer space: need 16 bytes, have 4"
        );
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::protocol("crc").is_retryable());
        assert!(Error::Timeout {
            actual: 0,
            expected: 1
        }
        .is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::data_format("short dive").is_retryable());
        assert!(!Error::io("closed").is_retryable());
        assert!(!Error::Unsupported.is_retryable());
    }

    #[test]
    fn test_status_of_result() {
        let ok: Result<()> = Ok(());
        assert_eq!(Status::of(&ok), Status::Success);

        let err: Result<()> = Err(Error::Cancelled);
        assert_eq!(Status::of(&err), Status::Cancelled);
        assert_eq!(Status::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_io_error_conversion() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(err.status(), Status::Timeout);

        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert_eq!(err.status(), Status::Io);
    }
}
