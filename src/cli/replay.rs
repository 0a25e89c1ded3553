use std::io;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::config::EarbudConfig;
use crate::scenario::{ReplayReport, Scenario, replay};
use crate::terminal::TerminalClient;

use super::command::{OutputFormat, ReplayArgs};
use super::ui::{Painter, ReplayReportView};

/// Executes the `replay` command.
///
/// The scenario runs on its own paused current-thread runtime so clock
/// advances complete without waiting.
#[instrument(skip(args, out, terminal_client), level = "info", fields(scenario = %args.scenario().display()))]
pub(crate) async fn run<W>(
    args: &ReplayArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let config = match args.config() {
        Some(path) => EarbudConfig::from_json_file(path)?,
        None => EarbudConfig::default(),
    };
    let scenario = Scenario::from_json_file(args.scenario())?;
    debug!(steps = scenario.steps.len(), "scenario loaded");

    let report = tokio::task::spawn_blocking(move || replay_paused(scenario, config))
        .await
        .context("replay task panicked")??;

    write_report(&report, out, terminal_client, output_format)
}

fn replay_paused(scenario: Scenario, config: EarbudConfig) -> Result<ReplayReport> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .context("failed to build the replay runtime")?;
    Ok(runtime.block_on(replay(scenario, config))?)
}

pub(crate) fn write_report<W>(
    report: &ReplayReport,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    match output_format {
        OutputFormat::Pretty => {
            let painter = Painter::new(terminal_client.stdout_is_terminal());
            writeln!(out, "{}", ReplayReportView::new(report, &painter))?;
        }
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, report)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
