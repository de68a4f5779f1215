//! Run orchestration
//!
//! Launches the server and then the client, drains both, injects the script
//! into the client, and shuts the client down before the server.

use std::future::Future;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::RunPlan;
use crate::display::{DisplaySender, DisplaySide};
use crate::host::{
    launch, CommandInjector, DrainSummary, DrainWorker, LaunchError, LaunchSpec,
    Liveness, ManagedProcess, MarkerTap, WriteError,
};

/// Run-level errors
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Drain worker for {side} failed: {reason}")]
    Worker { side: DisplaySide, reason: String },
}

/// Orchestration phases, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    ServerUp,
    ClientUp,
    /// Both drain workers running while the script is written
    Injecting,
    ShuttingDown,
    Done,
}

/// What happened during a run
#[derive(Debug)]
pub struct RunReport {
    /// Script commands delivered to the client
    pub delivered: usize,
    pub injection_error: Option<WriteError>,
    pub server: DrainSummary,
    pub client: DrainSummary,
    /// Sides in the order their termination was requested
    pub shutdown_order: Vec<DisplaySide>,
    pub timed_out: bool,
}

/// A launched process together with its drain worker
struct Running {
    process: ManagedProcess,
    drain: JoinHandle<DrainSummary>,
    marker_hits: Option<watch::Receiver<u64>>,
}

pub struct Orchestrator {
    plan: RunPlan,
    display: DisplaySender,
}

impl Orchestrator {
    pub fn new(plan: RunPlan, display: DisplaySender) -> Self {
        Self { plan, display }
    }

    pub async fn run(&self) -> Result<RunReport, HarnessError> {
        let deadline = self.plan.timeout.map(|t| Instant::now() + t);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        enter(Phase::Init);
        let mut server = self.start(&self.plan.server, &cancel_rx).await?;
        enter(Phase::ServerUp);

        let mut client = match self.start(&self.plan.client, &cancel_rx).await {
            Ok(client) => client,
            Err(e) => {
                self.stop(&mut server).await;
                return Err(e.into());
            }
        };
        enter(Phase::ClientUp);

        let mut injector = CommandInjector::new(self.plan.pacing);
        if let Some(hits) = &client.marker_hits {
            injector = injector.with_acks(hits.clone());
        }

        let mut shutdown_order = Vec::with_capacity(2);
        let driven = until(
            deadline,
            self.drive(&mut server, &mut client, &mut injector, &mut shutdown_order),
        )
        .await;

        let (injection_error, mut timed_out) = match driven {
            Some(injection_error) => (injection_error, false),
            None => {
                warn!("Run timed out before shutdown completed, killing processes");
                kill_all(&client.process, &server.process, &mut shutdown_order);
                (None, true)
            }
        };
        // Teardown commands are only sent after the full script, so the
        // injector's count covers the script first
        let delivered = injector.delivered().min(self.plan.script.len());

        let join_deadline = if timed_out {
            Some(Instant::now() + self.plan.stop_grace)
        } else {
            deadline
        };
        // Joined once; on expiry the workers are cancelled and the same join
        // keeps running
        let mut joined = std::pin::pin!(join_drains(&mut server.drain, &mut client.drain));
        let (server_result, client_result) = match join_deadline {
            None => joined.await,
            Some(join_deadline) => tokio::select! {
                results = &mut joined => results,
                _ = tokio::time::sleep_until(join_deadline) => {
                    if !timed_out {
                        warn!("Run timed out waiting for output to drain, killing processes");
                        kill_all(&client.process, &server.process, &mut shutdown_order);
                        timed_out = true;
                    }
                    cancel_tx.send_replace(true);
                    joined.await
                }
            },
        };

        let report = RunReport {
            delivered,
            injection_error,
            server: worker_result(DisplaySide::Left, server_result)?,
            client: worker_result(DisplaySide::Right, client_result)?,
            shutdown_order,
            timed_out,
        };
        enter(Phase::Done);
        info!(
            delivered = report.delivered,
            server_lines = report.server.lines,
            client_lines = report.client.lines,
            timed_out = report.timed_out,
            "Run finished"
        );
        Ok(report)
    }

    /// Inject the script and teardown, send the shutdown command, and stop
    /// the client and then the server. Returns the script's write error.
    async fn drive(
        &self,
        server: &mut Running,
        client: &mut Running,
        injector: &mut CommandInjector,
        shutdown_order: &mut Vec<DisplaySide>,
    ) -> Option<WriteError> {
        enter(Phase::Injecting);
        let mut injection_error = None;

        match client.process.take_stdin() {
            Some(mut stdin) => {
                let report = injector.inject(&mut stdin, &self.plan.script).await;
                let complete = report.is_complete();
                injection_error = report.error;

                if complete && !self.plan.teardown.is_empty() {
                    info!("Sending {} teardown command(s)", self.plan.teardown.len());
                    let teardown = injector.inject(&mut stdin, &self.plan.teardown).await;
                    info!(
                        delivered = teardown.delivered,
                        total = self.plan.teardown.len(),
                        "Teardown finished"
                    );
                }

                enter(Phase::ShuttingDown);
                if let Err(e) = injector.send(&mut stdin, &self.plan.shutdown_command).await {
                    warn!("Failed to send '{}' to client: {}", self.plan.shutdown_command, e);
                }
                // Closing stdin lets a client that reads to EOF exit on its own
                drop(stdin);
            }
            None => {
                warn!("Client input is unavailable, skipping injection");
                enter(Phase::ShuttingDown);
            }
        }

        shutdown_order.push(client.process.side());
        client.process.shutdown(self.plan.stop_grace).await;
        shutdown_order.push(server.process.side());
        server.process.shutdown(self.plan.stop_grace).await;

        injection_error
    }

    /// Launch one process, start its drain worker and wait until it is ready
    async fn start(
        &self,
        spec: &LaunchSpec,
        cancel: &watch::Receiver<bool>,
    ) -> Result<Running, LaunchError> {
        let mut process = launch(spec)?;

        let mut worker = DrainWorker::new(spec.side, self.display.clone(), process.watch_liveness())
            .with_cancel(cancel.clone());
        let mut marker_hits = None;
        if let Some(marker) = &spec.marker {
            let (tap, hits) = MarkerTap::new(marker.clone());
            worker = worker.with_marker(tap);
            marker_hits = Some(hits);
        }

        let drain = match process.take_output() {
            Some(output) => worker.spawn(output.stdout, output.stderr),
            None => worker.spawn(tokio::io::empty(), tokio::io::empty()),
        };

        let mut running = Running {
            process,
            drain,
            marker_hits,
        };

        if let Err(e) = self.await_ready(&mut running, spec.side).await {
            self.stop(&mut running).await;
            return Err(e);
        }
        info!(
            side = %spec.side,
            pid = ?running.process.pid(),
            program = %running.process.program().display(),
            cwd = %running.process.working_dir().display(),
            "Process ready"
        );
        Ok(running)
    }

    /// Wait for the ready marker, or the settle delay when there is none
    async fn await_ready(&self, running: &mut Running, side: DisplaySide) -> Result<(), LaunchError> {
        let settle = self.plan.settle;
        let mut liveness = running.process.watch_liveness();

        let Some(mut hits) = running.marker_hits.clone() else {
            tokio::time::sleep(settle).await;
            return match running.process.liveness() {
                Liveness::Running => Ok(()),
                Liveness::Exited { code } => Err(LaunchError::ExitedBeforeReady { side, code }),
            };
        };

        tokio::select! {
            seen = hits.wait_for(|&n| n > 0) => {
                if seen.is_ok() {
                    return Ok(());
                }
            }
            _ = liveness.wait_for(Liveness::is_exited) => {}
            _ = tokio::time::sleep(settle) => {
                return Err(LaunchError::NotReady { side, waited: settle });
            }
        }

        match running.process.wait().await {
            Liveness::Exited { code } => Err(LaunchError::ExitedBeforeReady { side, code }),
            Liveness::Running => Ok(()),
        }
    }

    /// Shut a process down and reap its drain worker, giving up on the
    /// worker after the stop grace period
    async fn stop(&self, running: &mut Running) {
        running.process.shutdown(self.plan.stop_grace).await;
        if tokio::time::timeout(self.plan.stop_grace, &mut running.drain)
            .await
            .is_err()
        {
            warn!(side = %running.process.side(), "Drain worker did not finish, aborting it");
            running.drain.abort();
        }
    }
}

fn enter(phase: Phase) {
    info!(phase = ?phase, "Entering phase");
}

/// Force kill both processes, client first
fn kill_all(
    client: &ManagedProcess,
    server: &ManagedProcess,
    shutdown_order: &mut Vec<DisplaySide>,
) {
    for process in [client, server] {
        let side = process.side();
        if !shutdown_order.contains(&side) {
            shutdown_order.push(side);
        }
        process.kill();
    }
}

async fn join_drains(
    server: &mut JoinHandle<DrainSummary>,
    client: &mut JoinHandle<DrainSummary>,
) -> (Result<DrainSummary, JoinError>, Result<DrainSummary, JoinError>) {
    tokio::join!(server, client)
}

fn worker_result(
    side: DisplaySide,
    result: Result<DrainSummary, JoinError>,
) -> Result<DrainSummary, HarnessError> {
    result.map_err(|e| HarnessError::Worker {
        side,
        reason: e.to_string(),
    })
}

/// Run a future against an optional deadline; `None` means it expired
async fn until<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}
