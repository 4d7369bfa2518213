//! Worker processes.
//!
//! Every worker is a separate OS process running the same binary as the
//! dispatcher. Requests and responses travel as JSON lines over the child's
//! stdin and stdout.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │   Dispatcher    │
//!                     │ (barrier, proxy)│
//!                     └────────┬────────┘
//!                              │ execute / release / abort / reply
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 0  │  │ Worker 1  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         └───────────┘  └───────────┘  └───────────┘
//!            result / progress / arrive / call
//! ```
//!
//! # Features
//!
//! - **Process isolation**: Each worker has its own memory space
//! - **Barrier sync**: Workers of one job meet at `sync()` checkpoints
//! - **Memory recycling**: Workers restart when memory exceeds threshold
//! - **Crash recovery**: Dead workers are respawned before the next job

mod context;
pub(crate) mod ipc;
pub(crate) mod proc;
pub(crate) mod protocol;
pub(crate) mod signals;
pub(crate) mod spawn;
mod worker_main;

pub use context::{Assignment, ProgressRange, Worker, WORKER_POLL_INTERVAL};
pub use protocol::{Outcome, WorkRequest, WorkResponse};
pub use spawn::{ENV_MAX_MEMORY_MIB, ENV_PARENT_PID, ENV_WORKER_INDEX, WorkerCommand};
pub use worker_main::{DEFAULT_MAX_MEMORY_MIB, run_if_worker, run_worker_main};
pub(crate) use worker_main::execute_routine;
