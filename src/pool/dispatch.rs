//! The dispatch loop.
//!
//! One thread takes jobs off the queue in order, splits each job's range
//! across the participating workers and collects their outcomes into the
//! job's [`Future`]. Jobs never overlap.

use super::barrier::Barrier;
use super::serve::{SenderTable, ServeContext, WorkerEvent, spawn_server, worker_lost};
use super::{Job, JobSpec, PoolConfig, PoolCounters, ResultMap, resolve_workers};
use crate::error::{PoolError, Result, TaskError};
use crate::partition::{partition, slice_args};
use crate::proxy::Proxy;
use crate::routine::{Args, Registry};
use crate::sharer::{ObjectSharer, SharerRequest};
use crate::worker::proc::Proc;
use crate::worker::signals::{TerminationReason, WorkerFailure};
use crate::worker::spawn::{WorkerConfig, spawn_worker};
use crate::worker::{WorkRequest, Worker, WorkerCommand, execute_routine};
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded, select, unbounded};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// How often the dispatcher polls worker events while a job runs.
pub const DISPATCH_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long a worker whose pipe closed gets to finish exiting.
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

/// One worker process as seen by the dispatcher.
struct WorkerSlot {
    index: usize,
    /// Bumped on every spawn so events from a previous process are ignored.
    generation: u64,
    proc: Option<Proc>,
    server: Option<JoinHandle<()>>,
    /// Set when the process died or asked to be recycled.
    needs_respawn: bool,
    recycling: bool,
    jobs_completed: usize,
    restarts: usize,
}

impl WorkerSlot {
    fn new(index: usize) -> Self {
        Self {
            index,
            generation: 0,
            proc: None,
            server: None,
            needs_respawn: true,
            recycling: false,
            jobs_completed: 0,
            restarts: 0,
        }
    }

    fn join_server(&mut self) {
        if let Some(handle) = self.server.take()
            && handle.join().is_err()
        {
            warn!(worker_id = self.index, "Pipe server thread panicked");
        }
    }

    /// Collect the process after its pipe closed.
    fn reap(&mut self) -> TerminationReason {
        self.needs_respawn = true;
        let reason = match self.proc.take() {
            Some(mut proc) => proc.reap(REAP_TIMEOUT),
            None => TerminationReason::Unknown,
        };
        self.join_server();
        reason
    }

    fn shutdown(&mut self, grace: Duration) {
        if let Some(mut proc) = self.proc.take()
            && let Err(e) = proc.stop(grace)
        {
            debug!(worker_id = self.index, error = %e, "Error stopping worker");
        }
        self.join_server();
    }
}

/// State owned by the dispatch thread.
pub(crate) struct Dispatcher {
    registry: Arc<Registry>,
    config: PoolConfig,
    command: Option<WorkerCommand>,
    ctx: ServeContext,
    events: Receiver<WorkerEvent>,
    slots: Vec<WorkerSlot>,
    stop: Arc<AtomicBool>,
    counters: Arc<PoolCounters>,
}

impl Dispatcher {
    /// Create the dispatcher and start `size` worker processes.
    ///
    /// With `command` of `None` no processes are started and every job runs
    /// inline.
    pub fn new(
        registry: Arc<Registry>,
        config: PoolConfig,
        command: Option<WorkerCommand>,
        size: usize,
        sharer: Proxy<ObjectSharer>,
        stop: Arc<AtomicBool>,
        counters: Arc<PoolCounters>,
    ) -> Result<Self> {
        let (events_tx, events) = unbounded();
        let ctx = ServeContext {
            barrier: Arc::new(Barrier::new()),
            senders: Arc::new(SenderTable::new(size)),
            progress: Arc::new((0..size.max(1)).map(|_| AtomicU64::new(0)).collect()),
            current_job: Arc::new(AtomicU64::new(0)),
            sharer,
            events: events_tx,
        };
        let slots = match command {
            Some(_) => (0..size).map(WorkerSlot::new).collect(),
            None => Vec::new(),
        };
        let mut dispatcher = Self {
            registry,
            config,
            command,
            ctx,
            events,
            slots,
            stop,
            counters,
        };

        for index in 0..dispatcher.slots.len() {
            dispatcher.spawn(index).map_err(|e| {
                PoolError::Worker(format!("Worker {} failed to initialize: {}", index, e))
            })?;
        }
        if !dispatcher.slots.is_empty() {
            info!(workers = dispatcher.slots.len(), "All workers ready");
        }
        Ok(dispatcher)
    }

    /// Spawn (or respawn) worker `index` and wait for it to report ready.
    fn spawn(&mut self, index: usize) -> Result<()> {
        let command = self
            .command
            .as_ref()
            .ok_or_else(|| PoolError::Worker("Pool has no worker processes".into()))?;

        let slot = &mut self.slots[index];
        slot.shutdown(Duration::from_millis(100));
        slot.generation += 1;
        let generation = slot.generation;

        let mut proc = spawn_worker(
            command,
            &WorkerConfig {
                index,
                max_memory_mib: self.config.max_memory_mib,
            },
        )?;
        let stdout = proc
            .take_stdout()
            .ok_or_else(|| PoolError::Worker("Child stdout not captured".into()))?;
        self.ctx.senders.set(index, Some(proc.sender()));

        let (ready_tx, ready_rx) = bounded(1);
        let server = spawn_server(self.ctx.clone(), index, generation, stdout, ready_tx)?;
        slot.server = Some(server);

        match ready_rx.recv_timeout(self.config.ready_timeout) {
            Ok(Ok(pid)) => {
                debug!(worker_id = index, pid, generation, "Worker ready");
                slot.proc = Some(proc);
                slot.needs_respawn = false;
                slot.recycling = false;
                Ok(())
            }
            Ok(Err(message)) => {
                let reason = proc.reap(REAP_TIMEOUT);
                self.ctx.senders.set(index, None);
                slot.join_server();
                let failure = WorkerFailure::new(reason).with_context("starting up");
                Err(PoolError::Worker(format!("{} ({})", message, failure)))
            }
            Err(_) => {
                let _ = proc.stop(Duration::from_millis(100));
                self.ctx.senders.set(index, None);
                slot.join_server();
                Err(PoolError::Timeout(self.config.ready_timeout))
            }
        }
    }

    /// Respawn worker `index` if it died or was recycled.
    fn ensure_worker(&mut self, index: usize) -> Result<()> {
        let slot = &self.slots[index];
        if !slot.needs_respawn && slot.proc.is_some() {
            return Ok(());
        }
        let recycled = slot.recycling;
        let slot = &mut self.slots[index];
        slot.restarts += 1;
        self.counters.restarts.fetch_add(1, Ordering::Relaxed);
        if recycled {
            debug!(worker_id = index, cycle = slot.restarts, jobs_completed = slot.jobs_completed, "Recycling worker");
        } else {
            info!(worker_id = index, restart_count = slot.restarts, "Respawning worker");
        }
        self.spawn(index)
    }

    /// Run the loop until the job queue closes, then stop the workers.
    pub fn run(mut self, jobs: Receiver<Job>) {
        let events = self.events.clone();
        loop {
            select! {
                recv(jobs) -> msg => match msg {
                    Ok(job) => self.run_job(job),
                    Err(_) => break,
                },
                recv(events) -> event => {
                    if let Ok(event) = event {
                        self.handle_idle_event(event);
                    }
                }
            }
        }
        self.shutdown_workers();
    }

    fn handle_idle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Finished { index, job, .. } => {
                trace!(worker_id = index, job, "Discarding stale result");
            }
            WorkerEvent::Recycle {
                index,
                generation,
                memory_mib,
                threshold_mib,
            } => self.mark_recycle(index, generation, memory_mib, threshold_mib),
            WorkerEvent::Exited { index, generation } => {
                self.mark_exited(index, generation);
            }
        }
    }

    fn is_current(&self, index: usize, generation: u64) -> bool {
        self.slots
            .get(index)
            .is_some_and(|slot| slot.generation == generation)
    }

    fn mark_recycle(&mut self, index: usize, generation: u64, memory_mib: usize, threshold_mib: usize) {
        if !self.is_current(index, generation) {
            return;
        }
        debug!(
            worker_id = index,
            memory_mib,
            threshold_mib,
            "Worker recycling ({}MiB / {}MiB threshold)",
            memory_mib,
            threshold_mib
        );
        let slot = &mut self.slots[index];
        slot.recycling = true;
        slot.needs_respawn = true;
    }

    /// Handle a closed worker pipe. Returns the termination reason if the
    /// event belongs to the current process.
    fn mark_exited(&mut self, index: usize, generation: u64) -> Option<TerminationReason> {
        if !self.is_current(index, generation) {
            return None;
        }
        self.ctx.senders.set(index, None);
        let slot = &mut self.slots[index];
        let recycling = slot.recycling;
        let reason = slot.reap();
        if !recycling && !self.stop.load(Ordering::SeqCst) {
            warn!(worker_id = index, reason = %reason, "Worker died unexpectedly");
        }
        Some(reason)
    }

    #[instrument(level = "debug", skip_all, fields(job = job.id, routine = %job.spec.routine))]
    fn run_job(&mut self, job: Job) {
        let Job { id, spec, future } = job;
        let size = self.slots.len().max(1);
        let count = resolve_workers(spec.workers, spec.range, size);

        if self.stop.load(Ordering::SeqCst) {
            future.set((0..count).map(|i| (i, Err(TaskError::Stopped))).collect());
            return;
        }

        let started = Instant::now();
        future.resolve_with(
            || {
                let results = self.execute(id, &spec, count);
                self.counters.jobs_completed.fetch_add(1, Ordering::Relaxed);
                results
            },
            |err| {
                let message = err.to_string();
                (0..count)
                    .map(|i| (i, Err(TaskError::Dispatch(message.clone()))))
                    .collect()
            },
        );
        debug!(workers = count, elapsed_ms = started.elapsed().as_millis(), "Job finished");
    }

    fn execute(&mut self, id: u64, spec: &JobSpec, count: usize) -> ResultMap {
        if let Err(e) = self.ctx.sharer.call(SharerRequest::Clear) {
            warn!(job = id, error = %e, "Failed to clear shared objects");
        }
        for cell in self.ctx.progress.iter() {
            cell.store(0, Ordering::Relaxed);
        }
        self.ctx.current_job.store(id, Ordering::SeqCst);

        if let Some(sink) = &spec.progress {
            sink.set_max(spec.range as u64);
        }

        if self.slots.is_empty() || count == 1 {
            self.run_local(spec)
        } else {
            self.run_remote(id, spec, count)
        }
    }

    /// Run the whole range inline in the dispatch thread.
    fn run_local(&self, spec: &JobSpec) -> ResultMap {
        let worker = Worker::local(spec.progress.clone(), spec.range);
        let args = Args {
            positional: slice_args(&spec.args.positional, &spec.partition, 0, 1),
            named: spec.args.named.clone(),
        };
        let outcome = execute_routine(&worker, &self.registry, &spec.routine, args);
        BTreeMap::from([(0, outcome)])
    }

    fn run_remote(&mut self, id: u64, spec: &JobSpec, count: usize) -> ResultMap {
        // Deaths reported since the last job decide who gets respawned
        while let Ok(event) = self.events.try_recv() {
            self.handle_idle_event(event);
        }
        self.ctx.barrier.reset(id, count);

        let mut pending = BTreeSet::new();
        if let Err(e) = self.send_all(id, spec, count, &mut pending) {
            warn!(job = id, error = %e, "Dispatch failed");
            self.ctx.fail_barrier(id);
            let message = e.to_string();
            return (0..count)
                .map(|i| (i, Err(TaskError::Dispatch(message.clone()))))
                .collect();
        }

        let mut results = ResultMap::new();
        let mut last_progress = None;
        let mut stop_deadline: Option<Instant> = None;

        while !pending.is_empty() {
            if stop_deadline.is_none() && self.stop.load(Ordering::SeqCst) {
                debug!(job = id, pending = pending.len(), "Stopping in-flight job");
                let workers: Vec<usize> = pending.iter().copied().collect();
                self.ctx.senders.broadcast(&workers, &WorkRequest::Exit);
                stop_deadline = Some(Instant::now() + self.config.shutdown_grace);
            }
            if let Some(deadline) = stop_deadline
                && Instant::now() >= deadline
            {
                for index in std::mem::take(&mut pending) {
                    results.insert(index, Err(TaskError::Stopped));
                }
                break;
            }

            match self.events.recv_timeout(DISPATCH_POLL_INTERVAL) {
                Ok(event) => self.handle_job_event(id, event, &mut pending, &mut results),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    for index in std::mem::take(&mut pending) {
                        results.insert(index, Err(worker_lost(index, "event channel closed")));
                    }
                }
            }
            self.forward_progress(spec, count, &mut last_progress, false);
        }

        self.forward_progress(spec, count, &mut last_progress, true);
        results
    }

    /// Send the `execute` request to every participant.
    fn send_all(
        &mut self,
        id: u64,
        spec: &JobSpec,
        count: usize,
        pending: &mut BTreeSet<usize>,
    ) -> Result<()> {
        for index in 0..count {
            self.ensure_worker(index)?;

            let range = partition(spec.range, index, count);
            let request = WorkRequest::Execute {
                job: id,
                routine: spec.routine.clone(),
                args: Args {
                    positional: slice_args(&spec.args.positional, &spec.partition, index, count),
                    named: spec.args.named.clone(),
                },
                start: range.start,
                end: range.end,
                maxval: spec.range,
                total: count,
            };
            trace!(job = id, worker_id = index, start = range.start, end = range.end, "Sending work");

            let proc = self.slots[index]
                .proc
                .as_ref()
                .ok_or_else(|| PoolError::Worker(format!("Worker {} not available", index)))?;
            proc.send(&request)?;
            pending.insert(index);
        }
        Ok(())
    }

    fn handle_job_event(
        &mut self,
        id: u64,
        event: WorkerEvent,
        pending: &mut BTreeSet<usize>,
        results: &mut ResultMap,
    ) {
        match event {
            WorkerEvent::Finished {
                index,
                generation,
                job,
                outcome,
            } => {
                if job != id || !self.is_current(index, generation) || !pending.remove(&index) {
                    trace!(worker_id = index, job, "Discarding stale result");
                    return;
                }
                self.slots[index].jobs_completed += 1;
                results.insert(index, outcome);
            }
            WorkerEvent::Recycle {
                index,
                generation,
                memory_mib,
                threshold_mib,
            } => self.mark_recycle(index, generation, memory_mib, threshold_mib),
            WorkerEvent::Exited { index, generation } => {
                let Some(reason) = self.mark_exited(index, generation) else {
                    return;
                };
                if pending.remove(&index) {
                    let failure = WorkerFailure::new(reason).with_context(format!("running job {}", id));
                    results.insert(index, Err(worker_lost(index, failure.to_string())));
                    self.ctx.fail_barrier(id);
                }
            }
        }
    }

    /// Push the summed worker progress to the job's sink if it changed.
    fn forward_progress(&self, spec: &JobSpec, count: usize, last: &mut Option<u64>, force: bool) {
        let Some(sink) = &spec.progress else {
            return;
        };
        let total: u64 = self.ctx.progress[..count.min(self.ctx.progress.len())]
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .sum();
        if force || *last != Some(total) {
            sink.set_progress(total);
            *last = Some(total);
        }
    }

    fn shutdown_workers(&mut self) {
        let grace = self.config.shutdown_grace;
        for slot in &mut self.slots {
            self.ctx.senders.set(slot.index, None);
            slot.shutdown(grace);
        }
        debug!(workers = self.slots.len(), "Workers stopped");
    }
}
