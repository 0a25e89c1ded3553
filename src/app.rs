use std::io;

use anyhow::Result;
use tracing::instrument;

use crate::cli::{Command, LogLevel, OutputFormat, replay, rules};
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};

const SERVICE_NAME: &str = "earbud-core";

/// Runs one subcommand against the real terminal, writing its report to `out`.
///
/// A JSON dump of the secondary earbud's rule table:
///
/// ```
/// # async fn dump() -> anyhow::Result<()> {
/// use earbud_core::{Command, OutputFormat, RuleTable, RulesArgs};
///
/// let mut out = Vec::new();
/// earbud_core::run_with_log_level(
///     Command::Rules(RulesArgs::new(Some(RuleTable::Secondary))),
///     &mut out,
///     None,
///     OutputFormat::Json,
/// )
/// .await?;
/// assert!(String::from_utf8(out)?.contains("\"secondary\""));
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Fails when the subscriber cannot be installed, the scenario or config cannot
/// be loaded, or the report cannot be written.
pub async fn run_with_log_level<W>(
    command: Command,
    out: &mut W,
    log_level: Option<LogLevel>,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    run_with_clients_and_log_level(command, out, &SystemTerminalClient, log_level, output_format)
        .await
}

/// Same as [`run_with_log_level`] with the terminal client supplied by the caller.
///
/// # Errors
///
/// See [`run_with_log_level`].
#[instrument(skip_all, fields(%command, ?log_level, ?output_format))]
pub async fn run_with_clients_and_log_level<W>(
    command: Command,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    log_level: Option<LogLevel>,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let level_override = log_level.map(LogLevel::as_level_filter);
    telemetry::initialise_tracing(
        SERVICE_NAME,
        terminal_client.stderr_is_terminal(),
        level_override,
    )?;

    match command {
        Command::Replay(args) => replay::run(&args, out, terminal_client, output_format).await,
        Command::Rules(args) => rules::run(&args, out, terminal_client, output_format),
    }
}
