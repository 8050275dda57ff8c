//! Server configuration.

use crate::error::ConfigError;
use crate::DEFAULT_PORT;
use std::net::{IpAddr, Ipv4Addr};

/// Server configuration, assembled from CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// Addresses to listen on; one listener each, all on `port`.
    pub ips: Vec<IpAddr>,
    /// Listening port.
    pub port: u16,
    /// Number of shard tasks; each owns a slice of the keyspace.
    pub shards: usize,
    /// Accepter tasks per listener.
    pub accepters: usize,
    /// Log level.
    pub loglevel: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ips: vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
            port: DEFAULT_PORT,
            shards: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
            accepters: 1,
            loglevel: LogLevel::Info,
        }
    }
}

impl Config {
    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::NotPositive("--port"));
        }
        if self.shards == 0 {
            return Err(ConfigError::NotPositive("--shards"));
        }
        if self.accepters == 0 {
            return Err(ConfigError::NotPositive("--accepters"));
        }
        Ok(())
    }
}

/// Log verbosity, mapped onto a tracing filter directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Everything, including per-connection traffic.
    Debug,
    /// Lifecycle events.
    Info,
    /// Suspicious but survivable conditions.
    Warn,
    /// Failures only.
    Error,
    /// Nothing at all.
    None,
}

impl LogLevel {
    /// Parse a `--log` value.
    pub fn parse(value: &str) -> Option<LogLevel> {
        match value {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            "none" => Some(LogLevel::None),
            _ => None,
        }
    }

    /// The tracing filter directive for this level.
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::None => "off",
        }
    }
}
