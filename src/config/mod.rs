//! Harness configuration
//!
//! Loaded from `rmdb-autotest.toml` (or `--config`), then overridden by CLI
//! flags, then resolved against the project root into a [`RunPlan`]. All
//! paths in the plan are absolute or root-relative; nothing depends on the
//! harness's current directory after resolution.

mod duration;

pub use duration::parse_duration;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::display::DisplaySide;
use crate::host::{LaunchSpec, Pacing};
use crate::script::{CommandScript, ScriptError};
use duration::{deserialize_duration, deserialize_optional_duration};

/// Config file picked up from the current directory when `--config` is absent
pub const DEFAULT_CONFIG_FILE: &str = "rmdb-autotest.toml";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("Pacing 'ack' requires client.ready_marker")]
    AckWithoutMarker,

    #[error("Invalid script: {0}")]
    Script(#[from] ScriptError),
}

/// Per-process settings; unset fields fall back to the side's defaults
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessConfig {
    pub program: Option<PathBuf>,
    /// Extra arguments (the server always gets the database name first)
    pub args: Vec<String>,
    /// Relative to the project root
    pub working_dir: Option<PathBuf>,
    /// Output substring that signals the process is ready for input
    pub ready_marker: Option<String>,
}

/// Top-level harness configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Project root; defaults to the current directory
    pub root: Option<PathBuf>,
    /// Database name passed to the server
    pub database: String,
    pub server: ProcessConfig,
    pub client: ProcessConfig,
    /// Inline command script
    pub commands: Vec<String>,
    /// Script file, relative to the project root; replaces `commands`
    pub script_file: Option<PathBuf>,
    /// Cleanup commands sent after the script, before the shutdown command
    pub teardown: Vec<String>,
    pub shutdown_command: String,
    /// Fixed delay after launch, or the ready-marker timeout
    #[serde(deserialize_with = "deserialize_duration")]
    pub settle: Duration,
    /// A duration ("100ms") or "ack"
    pub pacing: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub ack_timeout: Duration,
    /// Time between a termination request and a forced kill
    #[serde(deserialize_with = "deserialize_duration")]
    pub stop_grace: Duration,
    /// Deadline for the whole run
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub timeout: Option<Duration>,
    /// Terminal width override
    pub display_width: Option<usize>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            root: None,
            database: "test_database".to_string(),
            server: ProcessConfig::default(),
            client: ProcessConfig::default(),
            commands: vec![
                "create table concurrency_test (id int, name char(8), score float);".to_string(),
                "insert into concurrency_test values (1, 'xiaohong', 90.0);".to_string(),
                "insert into concurrency_test values (2, 'xiaoming', 95.0);".to_string(),
                "insert into concurrency_test values (3, 'zhanghua', 88.5);".to_string(),
            ],
            script_file: None,
            teardown: Vec::new(),
            shutdown_command: "exit".to_string(),
            settle: Duration::from_secs(1),
            pacing: "100ms".to_string(),
            ack_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(5),
            timeout: None,
            display_width: None,
        }
    }
}

/// Fully resolved description of one run
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub server: LaunchSpec,
    pub client: LaunchSpec,
    pub script: CommandScript,
    pub teardown: CommandScript,
    pub shutdown_command: String,
    pub settle: Duration,
    pub pacing: Pacing,
    pub stop_grace: Duration,
    pub timeout: Option<Duration>,
}

/// Parse a pacing setting: "ack" or a duration
pub fn parse_pacing(value: &str, ack_timeout: Duration) -> Result<Pacing, ConfigError> {
    if value.trim().eq_ignore_ascii_case("ack") {
        return Ok(Pacing::Ack {
            timeout: ack_timeout,
        });
    }
    parse_duration(value)
        .map(Pacing::Fixed)
        .map_err(|reason| ConfigError::InvalidDuration {
            value: value.to_string(),
            reason,
        })
}

impl HarnessConfig {
    /// Load from an explicit file, or from `rmdb-autotest.toml` if present,
    /// or fall back to defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.is_file() {
                    Self::from_file(default_path)
                } else {
                    tracing::debug!("No config file, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve every path against the project root and build the run plan
    pub fn resolve(&self, cwd: &Path) -> Result<RunPlan, ConfigError> {
        let root = match &self.root {
            Some(root) => cwd.join(root),
            None => cwd.to_path_buf(),
        };

        let mut server_args = vec![self.database.clone()];
        server_args.extend(self.server.args.iter().cloned());
        let server = LaunchSpec {
            side: DisplaySide::Left,
            program: self
                .server
                .program
                .clone()
                .unwrap_or_else(|| PathBuf::from("./bin/rmdb")),
            args: server_args,
            working_dir: root.join(
                self.server
                    .working_dir
                    .as_deref()
                    .unwrap_or(Path::new("build")),
            ),
            marker: self.server.ready_marker.clone(),
        };

        let client = LaunchSpec {
            side: DisplaySide::Right,
            program: self
                .client
                .program
                .clone()
                .unwrap_or_else(|| PathBuf::from("./rmdb_client")),
            args: self.client.args.clone(),
            working_dir: root.join(
                self.client
                    .working_dir
                    .as_deref()
                    .unwrap_or(Path::new("rmdb_client/build")),
            ),
            marker: self.client.ready_marker.clone(),
        };

        let script = match &self.script_file {
            Some(file) => CommandScript::from_file(&root.join(file))?,
            None => CommandScript::new(self.commands.iter().cloned())?,
        };
        let teardown = CommandScript::new(self.teardown.iter().cloned())?;
        CommandScript::new([self.shutdown_command.as_str()])?;

        let pacing = parse_pacing(&self.pacing, self.ack_timeout)?;
        if matches!(pacing, Pacing::Ack { .. }) && client.marker.is_none() {
            return Err(ConfigError::AckWithoutMarker);
        }

        Ok(RunPlan {
            server,
            client,
            script,
            teardown,
            shutdown_command: self.shutdown_command.clone(),
            settle: self.settle,
            pacing,
            stop_grace: self.stop_grace,
            timeout: self.timeout,
        })
    }
}
