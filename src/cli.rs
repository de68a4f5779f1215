//! Command-line interface

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use crate::config::{parse_duration, HarnessConfig};

/// Process exit codes
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const UNEXPECTED_FAILURE: i32 = 1;
    /// Server or client could not be started
    pub const LAUNCH_FAILED: i32 = 2;
    /// A command could not be written to the client
    pub const INJECTION_FAILED: i32 = 3;
    /// The run deadline expired
    pub const TIMED_OUT: i32 = 4;
    /// Config file or flags are invalid
    pub const CONFIG_ERROR: i32 = 5;
}

/// Drive the rmdb server and client side by side
#[derive(Parser, Debug)]
#[command(name = "rmdb-autotest", version, about)]
pub struct Cli {
    /// Config file (defaults to ./rmdb-autotest.toml when present)
    #[arg(short, long, env = "RMDB_AUTOTEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Project root that holds build/ and rmdb_client/
    #[arg(long, env = "RMDB_AUTOTEST_ROOT")]
    pub root: Option<PathBuf>,

    /// Database name passed to the server
    #[arg(short, long)]
    pub database: Option<String>,

    /// Script file with one command per line
    #[arg(short, long)]
    pub script: Option<PathBuf>,

    /// Deadline for the whole run, e.g. "30s"
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Delay between commands ("100ms") or "ack" to wait for the client prompt
    #[arg(long)]
    pub pacing: Option<String>,

    /// Delay after each launch, or the ready-marker timeout
    #[arg(long, value_parser = parse_duration)]
    pub settle: Option<Duration>,

    /// Terminal width used for the split display
    #[arg(long)]
    pub width: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_output: bool,
}

impl Cli {
    /// Override config values with flags that were given.
    ///
    /// Paths from the command line are relative to `cwd`, not the project root.
    pub fn apply(&self, config: &mut HarnessConfig, cwd: &Path) {
        if let Some(root) = &self.root {
            config.root = Some(cwd.join(root));
        }
        if let Some(database) = &self.database {
            config.database = database.clone();
        }
        if let Some(script) = &self.script {
            config.script_file = Some(cwd.join(script));
        }
        if let Some(timeout) = self.timeout {
            config.timeout = Some(timeout);
        }
        if let Some(pacing) = &self.pacing {
            config.pacing = pacing.clone();
        }
        if let Some(settle) = self.settle {
            config.settle = settle;
        }
        if let Some(width) = self.width {
            config.display_width = Some(width);
        }
    }
}
