use std::io::{self, IsTerminal};
use std::process::ExitCode;

use clap::Parser;

use earbud_core::{Args, OutputFormat, run_with_log_level};

/// Reports read by people on a terminal, by scripts everywhere else.
fn default_format(stdout: &io::Stdout) -> OutputFormat {
    if stdout.is_terminal() {
        OutputFormat::Pretty
    } else {
        OutputFormat::Json
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mut stdout = io::stdout();
    let format = args
        .output_format()
        .unwrap_or_else(|| default_format(&stdout));
    let log_level = args.log_level();

    if let Err(error) = run_with_log_level(args.into_command(), &mut stdout, log_level, format).await
    {
        eprintln!("earbud-core: {error:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
