//! rangepool - multi-process range-partitioned task execution.
//!
//! A [`Pool`] owns a set of worker processes re-executed from the current
//! binary. A job names a registered routine and an integer range
//! `[0, range)`; the range is split into contiguous chunks, one per
//! participating worker, and the job resolves to a map from worker index to
//! that worker's outcome.
//!
//! Inside a routine the [`Worker`] handle gives access to the worker's
//! chunk, throttled progress reporting, a barrier across the job's
//! participants ([`Worker::sync`]), and a shared object exchange
//! ([`Worker::share_object`]).
//!
//! Every binary that creates a pool must call [`run_if_worker`] first thing
//! in `main`, with the same registry, so that re-executed copies turn into
//! workers instead of running the program again.

pub mod builtin;
pub mod concurrent;
pub mod error;
pub mod future;
pub mod logging;
pub mod partition;
pub mod pool;
pub mod progress;
pub mod proxy;
pub mod reduce;
pub mod routine;
pub mod sharer;
pub mod worker;

pub use concurrent::{Concurrent, choose_worker_count};
pub use error::{PoolError, Result, TaskError};
pub use future::Future;
pub use pool::{JobSpec, Pool, PoolConfig, PoolStats, ResultMap, resolve_workers};
pub use progress::{ProgressBarSink, ProgressSink, RecordingSink};
pub use routine::{Args, Registry, Routine};
pub use sharer::ObjectSharer;
pub use worker::{ProgressRange, Worker, WorkerCommand, run_if_worker};
