//! rmdb-autotest - side-by-side integration harness for the rmdb server and client
//!
//! Launches the server, then the client, feeds a command script into the
//! client and shows both processes' output in two columns:
//! - server output on the left, client output on the right
//! - client is stopped before the server
//! - everything the processes print is shown, whatever the outcome

mod cli;
mod config;
mod display;
mod host;
mod logging;
mod orchestrator;
mod script;

use anyhow::Context;
use clap::Parser;
use cli::{exit_codes, Cli};
use config::{HarnessConfig, RunPlan};
use display::Display;
use orchestrator::{HarnessError, Orchestrator, RunReport};

fn main() {
    let exit_code = run();
    std::process::exit(exit_code);
}

fn run() -> i32 {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.verbose, cli.json_output) {
        eprintln!("Failed to initialize logging: {}", e);
        return exit_codes::UNEXPECTED_FAILURE;
    }

    let (plan, width) = match prepare(&cli) {
        Ok(prepared) => prepared,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return exit_codes::CONFIG_ERROR;
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create runtime: {}", e);
            return exit_codes::UNEXPECTED_FAILURE;
        }
    };

    rt.block_on(execute(plan, width))
}

/// Load config, apply flags and resolve paths
fn prepare(cli: &Cli) -> anyhow::Result<(RunPlan, usize)> {
    let cwd = std::env::current_dir().context("Cannot determine current directory")?;

    let mut config = HarnessConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config, &cwd);

    let width = config.display_width.unwrap_or_else(display::terminal_width);
    let plan = config.resolve(&cwd)?;
    tracing::debug!(?plan, width, "Run plan resolved");
    Ok((plan, width))
}

async fn execute(plan: RunPlan, width: usize) -> i32 {
    let display = Display::stdout(width);
    let orchestrator = Orchestrator::new(plan, display.sender());

    let result = orchestrator.run().await;
    drop(orchestrator);

    // Flush everything the processes printed before reporting
    if let Err(e) = display.finish().await {
        tracing::warn!("Display output failed: {}", e);
    }

    match result {
        Ok(report) => report_exit_code(&report),
        Err(e) => {
            eprintln!("Error: {}", e);
            categorize_error(&e)
        }
    }
}

/// Map a finished run to an exit code
fn report_exit_code(report: &RunReport) -> i32 {
    if report.timed_out {
        exit_codes::TIMED_OUT
    } else if let Some(err) = &report.injection_error {
        eprintln!("Error: {}", err);
        exit_codes::INJECTION_FAILED
    } else {
        exit_codes::SUCCESS
    }
}

/// Categorize an error into the appropriate exit code
fn categorize_error(e: &HarnessError) -> i32 {
    match e {
        HarnessError::Launch(_) => exit_codes::LAUNCH_FAILED,
        HarnessError::Worker { .. } => exit_codes::UNEXPECTED_FAILURE,
    }
}
