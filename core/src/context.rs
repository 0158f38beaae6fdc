//! Library context: log routing, configuration and transport factories.
//!
//! A [`Context`] is built once, wrapped in an `Arc`, and handed to every
//! device and parser. Messages always reach the `tracing` subscriber; the
//! optional user sink only sees messages at or above the configured level.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::iostream::{IoStream, Transport};

/// Verbosity threshold, ordered from silent to everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    None,
    Error,
    Warning,
    Info,
    Debug,
    All,
}

impl LogLevel {
    pub fn label(&self) -> &'static str {
        match self {
            LogLevel::None => "NONE",
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARNING",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::All => "ALL",
        }
    }
}

/// User callback receiving formatted log lines.
pub type LogSink = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Opens a stream of one transport kind by name (port path, address, ...).
pub type TransportFactory = Box<dyn Fn(&str) -> Result<Box<dyn IoStream>> + Send + Sync>;

pub struct Context {
    level: LogLevel,
    sink: Option<LogSink>,
    config: Config,
    transports: HashMap<Transport, TransportFactory>,
}

impl Default for Context {
    fn default() -> Self {
        Self::with_config(Config::default())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("level", &self.level)
            .field("has_sink", &self.sink.is_some())
            .field("config", &self.config)
            .field("transports", &self.transports.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: Config) -> Self {
        Context {
            level: config.log.level,
            sink: None,
            config,
            transports: HashMap::new(),
        }
    }

    pub fn into_shared(self) -> Arc<Context> {
        Arc::new(self)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn log_level(&self) -> LogLevel {
        self.level
    }

    pub fn set_log_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    pub fn set_log_sink<F>(&mut self, sink: F)
    where
        F: Fn(LogLevel, &str) + Send + Sync + 'static,
    {
        self.sink = Some(Box::new(sink));
    }

    pub fn register_transport(&mut self, kind: Transport, factory: TransportFactory) {
        self.transports.insert(kind, factory);
    }

    pub fn supports_transport(&self, kind: Transport) -> bool {
        self.transports.contains_key(&kind)
    }

    /// Open a stream through the factory registered for `kind`.
    pub fn open_transport(&self, kind: Transport, name: &str) -> Result<Box<dyn IoStream>> {
        let factory = self.transports.get(&kind).ok_or(Error::Unsupported)?;
        factory(name)
    }

    pub fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        match level {
            LogLevel::None => return,
            LogLevel::Error => tracing::error!("{}", args),
            LogLevel::Warning => tracing::warn!("{}", args),
            LogLevel::Info => tracing::info!("{}", args),
            LogLevel::Debug | LogLevel::All => tracing::debug!("{}", args),
        }

        if level <= self.level {
            if let Some(sink) = &self.sink {
                sink(level, &args.to_string());
            }
        }
    }
}

#[macro_export]
macro_rules! ctx_error {
    ($ctx:expr, $($arg:tt)+) => {
        $ctx.log($crate::context::LogLevel::Error, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! ctx_warning {
    ($ctx:expr, $($arg:tt)+) => {
        $ctx.log($crate::context::LogLevel::Warning, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! ctx_info {
    ($ctx:expr, $($arg:tt)+) => {
        $ctx.log($crate::context::LogLevel::Info, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! ctx_debug {
    ($ctx:expr, $($arg:tt)+) => {
        $ctx.log($crate::context::LogLevel::Debug, format_args!($($arg)+))
    };
}
