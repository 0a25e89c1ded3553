use std::path::PathBuf;

use derive_more::From;
use thiserror::Error;

/// Errors returned when parsing a Bluetooth address.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum BdAddrParseError {
    #[error("address `{value}` must have six colon separated octets")]
    WrongLength { value: String },
    #[error("address octet `{octet}` is not a hex byte")]
    InvalidOctet { octet: String },
}

/// Errors returned when building or driving a rule set.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum RuleEngineError {
    #[error("rule set `{set}` has no rules")]
    EmptyTable { set: &'static str },
    #[error("rule `{rule}` in set `{set}` has no events and is not always-evaluate")]
    EmptyEventMask {
        set: &'static str,
        rule: &'static str,
    },
    #[error("rule set `{set}` already has run params staged")]
    RunParamsPending { set: &'static str },
}

/// Errors returned when decoding peer signalling frames.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame is truncated: needed {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("unknown frame type {value:#04x}")]
    UnknownFrameType { value: u8 },
    #[error("declared payload length {declared} does not match the {actual} bytes present")]
    BadLength { declared: usize, actual: usize },
    #[error("unknown request command {value:#04x}")]
    UnknownCommand { value: u8 },
    #[error("unknown address type {value:#04x}")]
    InvalidAddrType { value: u8 },
    #[error("failed to encode or decode a marshalled message")]
    Marshal(#[from] serde_json::Error),
}

/// Errors returned when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{}`", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config file is not valid JSON")]
    Json(#[from] serde_json::Error),
    #[error("config value `{field}` is invalid: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Errors returned when loading a replay scenario.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read scenario file `{}`", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("scenario file is not valid JSON")]
    Json(#[from] serde_json::Error),
    #[error("scenario has no steps")]
    Empty,
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Top-level errors wrapping module-specific error types.
#[derive(Debug, Error, From)]
pub enum EarbudError {
    #[error(transparent)]
    #[from(RuleEngineError, Box<RuleEngineError>)]
    RuleEngine(Box<RuleEngineError>),
    #[error(transparent)]
    #[from(WireError, Box<WireError>)]
    Wire(Box<WireError>),
    #[error(transparent)]
    #[from(ConfigError, Box<ConfigError>)]
    Config(Box<ConfigError>),
    #[error(transparent)]
    #[from(ScenarioError, Box<ScenarioError>)]
    Scenario(Box<ScenarioError>),
}
