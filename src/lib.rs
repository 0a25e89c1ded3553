//! Role and connection coordination core for a pair of wireless earbuds.
//!
//! The component modules are public so their message and state types can be
//! named; [`Earbud`] wires them together over a [`collaborators::Platform`].

mod app;
mod cli;
mod error;
mod telemetry;
mod terminal;
mod utils;

pub mod app_sm;
pub mod bdaddr;
pub mod collaborators;
pub mod config;
pub mod earbud;
pub mod handset_service;
pub mod message;
pub mod peer_signalling;
pub mod profiles;
pub mod rules;
pub mod scenario;
pub mod shadow_profile;

pub use app::{run_with_clients_and_log_level, run_with_log_level};
pub use bdaddr::{BdAddr, Transport};
pub use cli::{Args, Command, LogLevel, OutputFormat, ReplayArgs, RuleTable, RulesArgs};
pub use config::{
    AppConfig, EarbudConfig, FeatureConfig, HandsetServiceConfig, PeerSignallingConfig,
    ShadowConfig,
};
pub use earbud::{Earbud, Indication, Input};
pub use error::{
    BdAddrParseError, ConfigError, EarbudError, RuleEngineError, ScenarioError, WireError,
};
pub use profiles::{Profile, ProfileMask};
pub use scenario::{ReplayReport, Scenario, Step, StepRecord, replay};
pub use terminal::{SystemTerminalClient, TerminalClient};
