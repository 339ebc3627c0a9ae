//! Worker process supervision.
//!
//! Spawns the `tgs` worker with a [`ServiceConfig`](tgs_core::config::ServiceConfig),
//! tracks its lifecycle and applies config changes by restarting it.

mod invocation;
mod supervisor;
mod tail;

pub use invocation::WorkerInvocation;
pub use supervisor::{
    ExitRecord, ProcessSupervisor, SetConfigOutcome, StartOutcome, StatusSnapshot, StopOutcome,
    SupervisorError, SupervisorInfo,
};
pub use tail::OutputTail;
