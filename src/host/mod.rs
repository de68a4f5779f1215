//! Host module for launching processes and moving text in and out of them

pub mod drainer;
pub mod injector;
pub mod launcher;

pub use drainer::{DrainSummary, DrainWorker, MarkerTap};
pub use injector::{CommandInjector, Pacing, WriteError};
pub use launcher::{launch, LaunchError, LaunchSpec, Liveness, ManagedProcess};
