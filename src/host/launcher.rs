//! Process Launcher
//!
//! Starts the server and client executables with piped stdio in an explicit
//! working directory. Paths are resolved up front; the harness never changes
//! its own current directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::display::DisplaySide;

/// Process launch errors
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Working directory {0} does not exist")]
    WorkingDirMissing(PathBuf),

    #[error("Executable '{0}' not found")]
    ExecutableNotFound(PathBuf),

    #[error("'{0}' is not an executable file")]
    NotExecutable(PathBuf),

    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{side} exited with code {code:?} before it was ready")]
    ExitedBeforeReady {
        side: DisplaySide,
        code: Option<i32>,
    },

    #[error("{side} did not print its ready marker within {waited:?}")]
    NotReady {
        side: DisplaySide,
        waited: Duration,
    },
}

/// Everything needed to start one process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub side: DisplaySide,
    /// Program path; relative paths with a separator resolve against `working_dir`,
    /// bare names are looked up on PATH
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Output substring signalling readiness or acknowledgement
    pub marker: Option<String>,
}

/// Process liveness as observed by its monitor task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited { code: Option<i32> },
}

impl Liveness {
    pub fn is_exited(&self) -> bool {
        matches!(self, Liveness::Exited { .. })
    }
}

/// Requests handled by the monitor task that owns the child
#[derive(Debug, Clone, Copy)]
enum Control {
    /// Graceful termination request
    Terminate,
    /// Forced kill
    Kill,
}

/// Both output pipes of a launched process
pub struct ProcessOutput {
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// A launched process under the harness's control
pub struct ManagedProcess {
    side: DisplaySide,
    program: PathBuf,
    working_dir: PathBuf,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    output: Option<ProcessOutput>,
    liveness: watch::Receiver<Liveness>,
    /// Dropping the sender lets the monitor kill the child
    control: mpsc::UnboundedSender<Control>,
}

/// Resolve the program path for a launch without touching the current directory
pub fn resolve_program(program: &Path, working_dir: &Path) -> Result<PathBuf, LaunchError> {
    let candidate = if program.is_absolute() {
        program.to_path_buf()
    } else if program.components().count() > 1 {
        working_dir.join(program)
    } else {
        which::which(program).map_err(|_| LaunchError::ExecutableNotFound(program.to_path_buf()))?
    };

    if !candidate.exists() {
        return Err(LaunchError::ExecutableNotFound(candidate));
    }
    if !is_executable(&candidate) {
        return Err(LaunchError::NotExecutable(candidate));
    }
    Ok(candidate)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Launch a process with piped stdio.
///
/// Must be called from within a tokio runtime; a monitor task takes ownership
/// of the child and reports its exit.
pub fn launch(spec: &LaunchSpec) -> Result<ManagedProcess, LaunchError> {
    if !spec.working_dir.is_dir() {
        return Err(LaunchError::WorkingDirMissing(spec.working_dir.clone()));
    }
    let program = resolve_program(&spec.program, &spec.working_dir)?;

    let mut cmd = Command::new(&program);
    cmd.args(&spec.args)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        program: program.clone(),
        source,
    })?;

    let pid = child.id();
    debug!(side = %spec.side, pid = ?pid, "Process launched");

    let stdin = child.stdin.take();
    let output = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => Some(ProcessOutput { stdout, stderr }),
        _ => None,
    };

    let (liveness_tx, liveness) = watch::channel(Liveness::Running);
    let (control, control_rx) = mpsc::unbounded_channel();
    tokio::spawn(monitor_process(spec.side, child, control_rx, liveness_tx));

    Ok(ManagedProcess {
        side: spec.side,
        program,
        working_dir: spec.working_dir.clone(),
        pid,
        stdin,
        output,
        liveness,
        control,
    })
}

/// Own the child until it exits, serving termination requests meanwhile
async fn monitor_process(
    side: DisplaySide,
    mut child: Child,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    liveness_tx: watch::Sender<Liveness>,
) {
    let mut orphaned = false;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            control = control_rx.recv(), if !orphaned => match control {
                Some(Control::Terminate) => request_termination(side, &mut child),
                Some(Control::Kill) => {
                    debug!(side = %side, "Force killing process");
                    if let Err(e) = child.start_kill() {
                        debug!(side = %side, "Kill failed: {}", e);
                    }
                }
                None => {
                    // Handle dropped without shutdown
                    orphaned = true;
                    let _ = child.start_kill();
                }
            },
        }
    };

    let code = match status {
        Ok(status) => {
            info!(side = %side, code = ?status.code(), "Process exited");
            status.code()
        }
        Err(e) => {
            warn!(side = %side, "Failed to wait for process: {}", e);
            None
        }
    };
    liveness_tx.send_replace(Liveness::Exited { code });
}

#[cfg(unix)]
fn request_termination(side: DisplaySide, child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    debug!(side = %side, pid, "Sending SIGTERM");

    // SAFETY: plain kill(2) on a pid we spawned and have not yet reaped
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret != 0 {
        debug!(
            side = %side,
            "SIGTERM failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn request_termination(side: DisplaySide, child: &mut Child) {
    debug!(side = %side, "Requesting termination");
    if let Err(e) = child.start_kill() {
        debug!(side = %side, "Termination failed: {}", e);
    }
}

impl ManagedProcess {
    pub fn side(&self) -> DisplaySide {
        self.side
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the input stream; it can only be taken once
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Take the output streams; they can only be taken once
    pub fn take_output(&mut self) -> Option<ProcessOutput> {
        self.output.take()
    }

    pub fn liveness(&self) -> Liveness {
        *self.liveness.borrow()
    }

    pub fn is_alive(&self) -> bool {
        !self.liveness().is_exited()
    }

    /// A receiver that observes liveness changes
    pub fn watch_liveness(&self) -> watch::Receiver<Liveness> {
        self.liveness.clone()
    }

    /// Ask the process to terminate gracefully
    pub fn terminate(&self) {
        let _ = self.control.send(Control::Terminate);
    }

    /// Force kill the process
    pub fn kill(&self) {
        let _ = self.control.send(Control::Kill);
    }

    /// Wait until the process has exited
    pub async fn wait(&mut self) -> Liveness {
        match self.liveness.wait_for(Liveness::is_exited).await {
            Ok(liveness) => *liveness,
            Err(_) => Liveness::Exited { code: None },
        }
    }

    /// Terminate gracefully, force killing after `grace` if needed
    pub async fn shutdown(&mut self, grace: Duration) -> Liveness {
        if !self.is_alive() {
            return self.liveness();
        }

        self.terminate();
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(liveness) => liveness,
            Err(_) => {
                warn!(side = %self.side, "Process did not stop within {:?}, force killing", grace);
                self.kill();
                self.wait().await
            }
        }
    }
}
