//! Per-worker pipe servers.
//!
//! Each worker process has one dispatcher thread reading its stdout. Most
//! messages are answered right there (barrier arrivals, sharer calls,
//! progress); results, recycling requests and process exit are forwarded to
//! the dispatch loop as [`WorkerEvent`]s.

use super::barrier::{Arrival, Barrier};
use crate::error::TaskError;
use crate::proxy::Proxy;
use crate::sharer::ObjectSharer;
use crate::worker::ipc::LineReader;
use crate::worker::proc::WorkerSender;
use crate::worker::{Outcome, WorkRequest, WorkResponse};
use crossbeam_channel::Sender;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

/// Event from a pipe server to the dispatch loop.
#[derive(Debug)]
pub enum WorkerEvent {
    /// The worker answered an `execute`.
    Finished {
        index: usize,
        generation: u64,
        job: u64,
        outcome: Outcome,
    },
    /// The worker is over its memory threshold and is exiting.
    Recycle {
        index: usize,
        generation: u64,
        memory_mib: usize,
        threshold_mib: usize,
    },
    /// The worker's stdout closed.
    Exited { index: usize, generation: u64 },
}

/// Write ends of every worker's request pipe, indexed by worker.
#[derive(Debug, Default)]
pub struct SenderTable {
    senders: RwLock<Vec<Option<WorkerSender>>>,
}

impl SenderTable {
    pub fn new(size: usize) -> Self {
        Self {
            senders: RwLock::new(vec![None; size]),
        }
    }

    /// Install the sender of a (re)spawned worker.
    pub fn set(&self, index: usize, sender: Option<WorkerSender>) {
        let mut senders = self.senders.write().unwrap_or_else(|p| p.into_inner());
        if index >= senders.len() {
            senders.resize(index + 1, None);
        }
        senders[index] = sender;
    }

    /// Send `request` to worker `index`. Failures are logged, not returned:
    /// a worker whose pipe is gone shows up as an `Exited` event.
    pub fn send(&self, index: usize, request: &WorkRequest) {
        let sender = {
            let senders = self.senders.read().unwrap_or_else(|p| p.into_inner());
            senders.get(index).cloned().flatten()
        };
        match sender {
            Some(sender) => {
                if let Err(e) = sender.send(request) {
                    tracing::debug!(worker_id = index, error = %e, "Failed to send request");
                }
            }
            None => tracing::debug!(worker_id = index, "No pipe to worker"),
        }
    }

    /// Send `request` to each worker in `indices`.
    pub fn broadcast(&self, indices: &[usize], request: &WorkRequest) {
        for &index in indices {
            self.send(index, request);
        }
    }
}

/// State shared by all pipe servers of a pool.
#[derive(Clone)]
pub struct ServeContext {
    pub barrier: Arc<Barrier>,
    pub senders: Arc<SenderTable>,
    pub progress: Arc<Vec<AtomicU64>>,
    pub current_job: Arc<AtomicU64>,
    pub sharer: Proxy<ObjectSharer>,
    pub events: Sender<WorkerEvent>,
}

impl ServeContext {
    /// Fail `job`'s barrier and abort every worker blocked in it.
    pub fn fail_barrier(&self, job: u64) {
        let waiting = self.barrier.fail(job);
        if !waiting.is_empty() {
            tracing::debug!(job, workers = ?waiting, "Aborting workers waiting at barrier");
        }
        self.senders.broadcast(&waiting, &WorkRequest::Abort { job });
    }

    fn arrive(&self, index: usize, job: u64, round: u64) {
        match self.barrier.arrive(job, index, round) {
            Arrival::Wait => {}
            Arrival::Release { round, workers } => {
                tracing::trace!(job, round, "Barrier round complete");
                self.senders.broadcast(&workers, &WorkRequest::Release { job, round });
            }
            Arrival::Abort { workers } => {
                self.senders.broadcast(&workers, &WorkRequest::Abort { job });
            }
            Arrival::Stale => {
                tracing::debug!(worker_id = index, job, round, "Ignoring arrival for finished job");
                // The worker is still blocked; it must not hang.
                self.senders.send(index, &WorkRequest::Abort { job });
            }
        }
    }
}

/// Start the pipe server for worker `index`.
///
/// The first message must be `ready`; its pid (or the reason the worker
/// never got there) is sent on `ready_tx`.
pub fn spawn_server<R>(
    ctx: ServeContext,
    index: usize,
    generation: u64,
    stdout: R,
    ready_tx: Sender<Result<u32, String>>,
) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("worker-{}-pipe", index))
        .spawn(move || serve(ctx, index, generation, stdout, ready_tx))
}

fn serve<R: Read>(
    ctx: ServeContext,
    index: usize,
    generation: u64,
    stdout: R,
    ready_tx: Sender<Result<u32, String>>,
) {
    let mut reader = LineReader::new(stdout);
    let mut ready = false;

    loop {
        let line = match reader.read_line() {
            Ok(Some(line)) => line.trim().to_string(),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(worker_id = index, error = %e, "Worker pipe read failed");
                break;
            }
        };
        if line.is_empty() {
            continue;
        }
        let response = match WorkResponse::from_line(&line) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(worker_id = index, error = %e, line = %line, "Invalid worker response");
                continue;
            }
        };

        match response {
            WorkResponse::Ready { pid } => {
                if !ready {
                    ready = true;
                    let _ = ready_tx.send(Ok(pid));
                }
            }
            WorkResponse::Progress { job, value } => {
                if job == ctx.current_job.load(Ordering::SeqCst)
                    && let Some(cell) = ctx.progress.get(index)
                {
                    cell.store(value, Ordering::Relaxed);
                }
            }
            WorkResponse::Arrive { job, round } => ctx.arrive(index, job, round),
            WorkResponse::Call { request } => {
                let response = ctx.sharer.call(request.pinned_to(index));
                ctx.senders.send(index, &WorkRequest::Reply { response });
            }
            WorkResponse::Result { job, outcome } => {
                if outcome.is_err() {
                    ctx.fail_barrier(job);
                }
                let _ = ctx.events.send(WorkerEvent::Finished {
                    index,
                    generation,
                    job,
                    outcome,
                });
            }
            WorkResponse::Restart {
                memory_mib,
                threshold_mib,
            } => {
                let _ = ctx.events.send(WorkerEvent::Recycle {
                    index,
                    generation,
                    memory_mib,
                    threshold_mib,
                });
            }
        }
    }

    if !ready {
        let _ = ready_tx.send(Err("worker closed its pipe before becoming ready".to_string()));
    }
    let _ = ctx.events.send(WorkerEvent::Exited { index, generation });
}

/// Error for a participant whose process went away mid-job.
pub fn worker_lost(index: usize, reason: impl Into<String>) -> TaskError {
    TaskError::WorkerLost {
        index,
        reason: reason.into(),
    }
}
