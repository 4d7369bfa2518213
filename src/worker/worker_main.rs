//! Worker subprocess main entry point.
//!
//! A worker process is the same binary as the dispatcher, started with
//! `RANGEPOOL_WORKER_INDEX` set. It reads requests from stdin, runs routines
//! from its own copy of the registry and writes responses to stdout. Logs go
//! to stderr, which is inherited from the dispatcher.

use super::context::{Assignment, Worker};
use super::ipc::{self, Inbound};
use super::protocol::{Outcome, WorkRequest, WorkResponse};
use super::spawn::{ENV_MAX_MEMORY_MIB, ENV_PARENT_PID, ENV_WORKER_INDEX};
use crate::error::TaskError;
use crate::logging::{self, LogConfig};
use crate::routine::{Args, Registry};
use nix::unistd::Pid;
use std::panic::{self, AssertUnwindSafe};

/// Default memory threshold before a worker asks to be recycled (6 GiB).
pub const DEFAULT_MAX_MEMORY_MIB: usize = 6 * 1024;

/// Run the worker loop and exit if this process was started as a worker.
///
/// Must be the first call in `main` of any binary that creates a pool,
/// with the same registry the pool is given. Returns immediately in the
/// dispatching process.
pub fn run_if_worker(registry: &Registry) {
    if let Ok(index) = std::env::var(ENV_WORKER_INDEX) {
        match index.parse() {
            Ok(index) => run_worker_main(index, registry),
            Err(_) => {
                eprintln!("Invalid {}: {:?}", ENV_WORKER_INDEX, index);
                std::process::exit(2);
            }
        }
    }
}

/// Peak resident memory of this process in MiB.
fn get_memory_usage_mib() -> usize {
    use nix::sys::resource::{UsageWho, getrusage};

    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let max_rss = usage.max_rss();

            #[cfg(target_os = "macos")]
            {
                // macOS: max_rss is in bytes
                (max_rss as usize) / (1024 * 1024)
            }

            #[cfg(not(target_os = "macos"))]
            {
                // Linux: max_rss is in kilobytes
                (max_rss as usize) / 1024
            }
        }
        Err(_) => 0,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Run one routine invocation, turning errors and panics into data.
pub(crate) fn execute_routine(worker: &Worker, registry: &Registry, routine: &str, args: Args) -> Outcome {
    let Some(routine) = registry.get(routine) else {
        return Err(TaskError::UnknownRoutine(routine.to_string()));
    };
    match panic::catch_unwind(AssertUnwindSafe(|| routine(worker, args))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TaskError::from_routine(e)),
        Err(payload) => Err(TaskError::from_panic(payload)),
    }
}

/// Reason the worker loop ended.
enum LoopExit {
    /// Exit request, stdin EOF or parent gone.
    Finished,
    /// Over the memory threshold; the dispatcher respawns us.
    Recycle,
}

/// Worker main loop.
fn worker_loop(worker: &Worker, registry: &Registry, max_memory_mib: usize) -> Result<LoopExit, TaskError> {
    worker.send(&WorkResponse::Ready {
        pid: std::process::id(),
    })?;

    while let Some(request) = worker.next_request() {
        match request {
            WorkRequest::Exit => return Ok(LoopExit::Finished),

            WorkRequest::Execute {
                job,
                routine,
                args,
                start,
                end,
                maxval,
                total,
            } => {
                worker.begin_job(Assignment {
                    job,
                    start,
                    end,
                    maxval,
                    total,
                });
                tracing::debug!(worker_id = worker.index(), job, routine = %routine, start, end, "Executing");

                let outcome = execute_routine(worker, registry, &routine, args);
                if let Err(e) = &outcome {
                    tracing::warn!(worker_id = worker.index(), job, error = %e, "Routine failed");
                }

                // Restart goes out before the result, so the dispatcher knows
                // about it by the time the job completes
                let memory_mib = get_memory_usage_mib();
                let recycle = memory_mib > max_memory_mib;
                if recycle {
                    tracing::info!(
                        worker_id = worker.index(),
                        memory_mib,
                        threshold_mib = max_memory_mib,
                        "Memory threshold exceeded, requesting restart"
                    );
                    worker.send(&WorkResponse::Restart {
                        memory_mib,
                        threshold_mib: max_memory_mib,
                    })?;
                }
                worker.send(&WorkResponse::result(job, outcome))?;
                if recycle {
                    return Ok(LoopExit::Recycle);
                }
            }

            other => {
                tracing::debug!(worker_id = worker.index(), request = ?other, "Ignoring request outside of a job");
            }
        }
    }
    Ok(LoopExit::Finished)
}

/// Run the worker subprocess main function. Never returns.
pub fn run_worker_main(index: usize, registry: &Registry) -> ! {
    // Ignore SIGPIPE - we handle pipe errors via io::Error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    logging::init(LogConfig::for_worker().with_env_overrides());

    let parent = env_parse::<i32>(ENV_PARENT_PID).map(Pid::from_raw);
    let max_memory_mib = env_parse(ENV_MAX_MEMORY_MIB).unwrap_or(DEFAULT_MAX_MEMORY_MIB);

    let (tx, rx) = crossbeam_channel::unbounded::<Inbound<WorkRequest>>();
    if let Err(e) = ipc::spawn_pump(format!("worker-{}-stdin", index), std::io::stdin(), tx) {
        eprintln!("Worker {} failed to start stdin reader: {}", index, e);
        std::process::exit(1);
    }

    let worker = Worker::remote(index, rx, Box::new(std::io::stdout()), parent);
    tracing::debug!(worker_id = index, pid = std::process::id(), "Worker started");

    match worker_loop(&worker, registry, max_memory_mib) {
        Ok(LoopExit::Finished) | Ok(LoopExit::Recycle) => std::process::exit(0),
        Err(TaskError::ParentExited) => {
            tracing::debug!(worker_id = index, "Parent gone, exiting");
            std::process::exit(0)
        }
        Err(e) => {
            eprintln!("Worker {} error: {}", index, e);
            std::process::exit(1);
        }
    }
}
