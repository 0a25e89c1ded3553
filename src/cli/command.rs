use std::path::PathBuf;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};
use strum_macros::Display;
use tracing_subscriber::filter::LevelFilter;

/// Command-line options for the earbud coordination core.
#[derive(Debug, Parser)]
#[command(
    name = "earbud-core",
    about = "Replay earbud coordination scenarios and inspect the rule tables."
)]
pub struct Args {
    /// Overrides `RUST_LOG` for this run.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Defaults to pretty on a terminal and JSON otherwise.
    #[arg(long, global = true, value_enum)]
    output_format: Option<OutputFormat>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use earbud_core::{Args, Command, RulesArgs};
    ///
    /// let args = Args::new(Command::Rules(RulesArgs::default()));
    /// assert!(args.log_level().is_none());
    /// ```
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            log_level: None,
            output_format: None,
            command,
        }
    }

    #[must_use]
    pub fn with_log_level(mut self, log_level: LogLevel) -> Self {
        self.log_level = Some(log_level);
        self
    }

    #[must_use]
    pub fn with_output_format(mut self, output_format: OutputFormat) -> Self {
        self.output_format = Some(output_format);
        self
    }

    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output_format
    }

    #[must_use]
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    #[must_use]
    pub fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Json,
}

/// Supported CLI commands.
#[derive(Debug, Display, Subcommand)]
#[strum(serialize_all = "snake_case")]
pub enum Command {
    /// Feed a JSON scenario through the core over a fake platform and print what it did.
    Replay(ReplayArgs),
    /// Print the connection and upgrade rule tables in declaration order.
    Rules(RulesArgs),
}

/// Arguments for the `replay` command.
#[derive(Debug, Clone, clap::Args, Builder)]
pub struct ReplayArgs {
    /// Scenario file to replay.
    #[builder(into)]
    scenario: PathBuf,
    /// JSON config file. Missing fields take their defaults.
    #[arg(long)]
    #[builder(into)]
    config: Option<PathBuf>,
}

impl ReplayArgs {
    pub(crate) fn scenario(&self) -> &PathBuf {
        &self.scenario
    }

    pub(crate) fn config(&self) -> Option<&PathBuf> {
        self.config.as_ref()
    }
}

/// Arguments for the `rules` command.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct RulesArgs {
    /// Print one table only.
    #[arg(long, value_enum)]
    table: Option<RuleTable>,
}

impl RulesArgs {
    #[must_use]
    pub fn new(table: Option<RuleTable>) -> Self {
        Self { table }
    }

    pub(crate) fn table(&self) -> Option<RuleTable> {
        self.table
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, ValueEnum)]
#[strum(serialize_all = "snake_case")]
pub enum RuleTable {
    Primary,
    Secondary,
    Dfu,
}
