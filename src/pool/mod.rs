//! Process pool and job submission.
//!
//! A [`Pool`] owns a fixed set of worker processes and a dispatch thread.
//! Jobs are submitted as [`JobSpec`]s and run one at a time: each job's range
//! is split across the participating workers, which may synchronize with
//! each other and exchange objects while they run. The outcome of every
//! worker ends up in the job's [`ResultMap`], keyed by worker index.
//!
//! # Example
//!
//! ```no_run
//! use rangepool::{JobSpec, Pool, PoolConfig, builtin, reduce};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(builtin::registry());
//! rangepool::run_if_worker(&registry);
//!
//! let pool = Pool::new(PoolConfig::default(), registry)?;
//! let results = pool.run(JobSpec::new("sum_squares", 1000))?;
//! let per_worker = reduce::collect_ok(results)?;
//! # Ok::<(), rangepool::PoolError>(())
//! ```

mod barrier;
mod dispatch;
mod serve;

pub use barrier::{Arrival, Barrier};
pub use dispatch::DISPATCH_POLL_INTERVAL;

use crate::concurrent::Concurrent;
use crate::error::{PoolError, Result, TaskError};
use crate::future::Future;
use crate::partition::validate_flagged;
use crate::progress::ProgressSink;
use crate::proxy::{CALL_TIMEOUT, ObjectServer};
use crate::routine::{Args, Registry};
use crate::sharer::ObjectSharer;
use crate::worker::{DEFAULT_MAX_MEMORY_MIB, WorkerCommand};
use crossbeam_channel::{Sender, unbounded};
use dispatch::Dispatcher;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

/// Outcome of a job: one entry per participating worker.
pub type ResultMap = BTreeMap<usize, std::result::Result<Value, TaskError>>;

/// Configuration for the pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker processes to use.
    pub worker_count: usize,
    /// Clamp `worker_count` to the number of available cores.
    pub clamp_to_cores: bool,
    /// Per-worker memory threshold (MiB) before the worker is recycled.
    pub max_memory_mib: usize,
    /// How long a starting worker gets to report ready.
    pub ready_timeout: Duration,
    /// How long workers get to exit on shutdown before being signalled.
    pub shutdown_grace: Duration,
    /// Reply timeout for calls on the object sharer.
    pub call_timeout: Duration,
    /// Program used to start workers; the running executable if unset.
    pub worker_command: Option<WorkerCommand>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: available_cores(),
            clamp_to_cores: true,
            max_memory_mib: DEFAULT_MAX_MEMORY_MIB,
            ready_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            call_timeout: CALL_TIMEOUT,
            worker_command: None,
        }
    }
}

impl PoolConfig {
    /// Config with `worker_count` workers and defaults otherwise.
    pub fn with_workers(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Default::default()
        }
    }

    /// Allow more workers than cores.
    pub fn oversubscribe(mut self) -> Self {
        self.clamp_to_cores = false;
        self
    }

    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker_command = Some(command);
        self
    }

    pub fn with_max_memory_mib(mut self, mib: usize) -> Self {
        self.max_memory_mib = mib;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// - `RANGEPOOL_WORKERS` for the worker count
    /// - `RANGEPOOL_MAX_MEMORY_MIB` for the recycling threshold
    /// - `RANGEPOOL_READY_TIMEOUT_SECS` for the startup timeout
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(workers) = env_parse("RANGEPOOL_WORKERS") {
            self.worker_count = workers;
        }
        if let Some(mib) = env_parse(crate::worker::ENV_MAX_MEMORY_MIB) {
            self.max_memory_mib = mib;
        }
        if let Some(secs) = env_parse("RANGEPOOL_READY_TIMEOUT_SECS") {
            self.ready_timeout = Duration::from_secs(secs);
        }
        self
    }

    /// Number of workers the pool will actually run.
    pub fn resolved_size(&self) -> usize {
        if self.clamp_to_cores {
            self.worker_count.clamp(1, available_cores())
        } else {
            self.worker_count.max(1)
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn available_cores() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Number of workers a job runs on.
///
/// `0` or anything above the pool size means the whole pool; a job never
/// uses more workers than its range has values, but always at least one.
/// An empty range still runs the routine once, inline over `[0, 0)`, so its
/// result map has an entry for worker 0 instead of being empty.
pub fn resolve_workers(requested: usize, range: usize, pool_size: usize) -> usize {
    let workers = if requested == 0 || requested > pool_size {
        pool_size
    } else {
        requested
    };
    workers.min(range).max(1)
}

/// Description of a job to submit.
#[derive(Clone)]
pub struct JobSpec {
    pub routine: String,
    pub range: usize,
    /// Requested worker count, `0` for the whole pool.
    pub workers: usize,
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub args: Args,
    /// Positional arguments (JSON arrays) split across workers like the range.
    pub partition: Vec<usize>,
}

impl std::fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSpec")
            .field("routine", &self.routine)
            .field("range", &self.range)
            .field("workers", &self.workers)
            .field("progress", &self.progress.is_some())
            .field("args", &self.args)
            .field("partition", &self.partition)
            .finish()
    }
}

impl JobSpec {
    /// Run `routine` over `[0, range)` on the whole pool.
    pub fn new(routine: impl Into<String>, range: usize) -> Self {
        Self {
            routine: routine.into(),
            range,
            workers: 0,
            progress: None,
            args: Args::new(),
            partition: Vec::new(),
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn args(mut self, args: Args) -> Self {
        self.args = args;
        self
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Serialize) -> Result<Self> {
        self.args = self.args.arg(value)?;
        Ok(self)
    }

    /// Append a positional argument that is split across workers.
    pub fn partitioned_arg(mut self, value: impl Serialize) -> Result<Self> {
        self.partition.push(self.args.len());
        self.args = self.args.arg(value)?;
        Ok(self)
    }

    /// Set a named argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Serialize) -> Result<Self> {
        self.args = self.args.kwarg(name, value)?;
        Ok(self)
    }

    /// Flag positional argument `index` for partitioning.
    pub fn partition(mut self, index: usize) -> Self {
        if !self.partition.contains(&index) {
            self.partition.push(index);
        }
        self
    }
}

/// A queued job.
pub(crate) struct Job {
    pub id: u64,
    pub spec: JobSpec,
    pub future: Future<ResultMap>,
}

#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub jobs_completed: AtomicUsize,
    pub restarts: AtomicUsize,
}

/// Statistics about the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of workers in the pool.
    pub worker_count: usize,
    /// Jobs resolved so far.
    pub jobs_completed: usize,
    /// Number of worker restarts (crashes and memory recycling).
    pub restarts: usize,
}

/// A pool of worker processes and the thread dispatching jobs to them.
pub struct Pool {
    size: usize,
    local: bool,
    registry: Arc<Registry>,
    jobs: Mutex<Option<Sender<Job>>>,
    stop: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    server: Mutex<ObjectServer>,
    counters: Arc<PoolCounters>,
    next_job: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Pool {
    /// Start the pool.
    ///
    /// With a resolved size of one no processes are spawned and jobs run in
    /// the dispatch thread. Otherwise every worker is started and has
    /// reported ready before this returns.
    pub fn new(config: PoolConfig, registry: Arc<Registry>) -> Result<Self> {
        let size = config.resolved_size();
        let local = size == 1;
        let command = if local {
            None
        } else {
            match &config.worker_command {
                Some(command) => Some(command.clone()),
                None => Some(WorkerCommand::current_exe()?),
            }
        };

        info!(
            workers = size,
            local,
            memory_limit_mib = config.max_memory_mib,
            "Initializing pool"
        );

        let mut server = ObjectServer::new();
        let sharer = server
            .expose(ObjectSharer::new())?
            .with_timeout(config.call_timeout);

        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(PoolCounters::default());
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            config,
            command,
            size,
            sharer,
            Arc::clone(&stop),
            Arc::clone(&counters),
        )?;

        let (jobs_tx, jobs_rx) = unbounded();
        let handle = thread::Builder::new()
            .name("rangepool-dispatch".into())
            .spawn(move || dispatcher.run(jobs_rx))?;

        Ok(Self {
            size,
            local,
            registry,
            jobs: Mutex::new(Some(jobs_tx)),
            stop,
            dispatcher: Mutex::new(Some(handle)),
            server: Mutex::new(server),
            counters,
            next_job: AtomicU64::new(0),
        })
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether jobs run inline instead of in worker processes.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Queue a job and return a future for its result map.
    ///
    /// Configuration errors (unknown routine, bad partition flags) are
    /// returned here and the job is never dispatched.
    pub fn submit(&self, spec: JobSpec) -> Result<Future<ResultMap>> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(PoolError::Stopped);
        }
        self.registry.require(&spec.routine)?;
        validate_flagged(&spec.args.positional, &spec.partition)?;

        let future = Future::new();
        let job = Job {
            // Ids start at 1; 0 is never a running job.
            id: self.next_job.fetch_add(1, Ordering::SeqCst) + 1,
            spec,
            future: future.clone(),
        };
        let jobs = lock(&self.jobs);
        let sender = jobs.as_ref().ok_or(PoolError::Stopped)?;
        sender.send(job).map_err(|_| PoolError::Stopped)?;
        Ok(future)
    }

    /// Submit a job and block until its result map is ready.
    pub fn run(&self, spec: JobSpec) -> Result<ResultMap> {
        self.submit(spec)?.get(None)
    }

    /// Synchronous call wrapper for the routine `name`.
    pub fn concurrent(&self, name: impl Into<String>) -> Concurrent<'_> {
        Concurrent::new(self, name)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            worker_count: self.size,
            jobs_completed: self.counters.jobs_completed.load(Ordering::Relaxed),
            restarts: self.counters.restarts.load(Ordering::Relaxed),
        }
    }

    /// Stop the pool: finish the running job (in-flight barrier waits fail),
    /// resolve queued jobs with `Stopped`, stop the workers and the object
    /// server. Later submissions fail with [`PoolError::Stopped`].
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        lock(&self.jobs).take();

        if let Some(handle) = lock(&self.dispatcher).take() {
            if handle.join().is_err() {
                warn!("Dispatch thread panicked");
            }
            info!(jobs_completed = self.counters.jobs_completed.load(Ordering::Relaxed), "Pool shut down");
        }
        lock(&self.server).stop();
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RecordingSink;
    use serde_json::json;

    fn local_pool(registry: Registry) -> Pool {
        Pool::new(PoolConfig::with_workers(1), Arc::new(registry)).unwrap()
    }

    #[test]
    fn test_resolve_workers() {
        assert_eq!(resolve_workers(0, 50, 4), 4);
        assert_eq!(resolve_workers(9, 50, 4), 4);
        assert_eq!(resolve_workers(2, 50, 4), 2);
        assert_eq!(resolve_workers(0, 3, 4), 3);
        assert_eq!(resolve_workers(0, 0, 4), 1);
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert!(config.clamp_to_cores);
        assert_eq!(config.max_memory_mib, DEFAULT_MAX_MEMORY_MIB);
        assert_eq!(config.call_timeout, CALL_TIMEOUT);
        assert!(config.worker_command.is_none());
    }

    #[test]
    fn test_resolved_size() {
        let cores = available_cores();
        assert_eq!(PoolConfig::with_workers(0).resolved_size(), 1);
        assert_eq!(PoolConfig::with_workers(cores + 8).resolved_size(), cores);
        assert_eq!(
            PoolConfig::with_workers(cores + 8).oversubscribe().resolved_size(),
            cores + 8
        );
    }

    #[test]
    fn test_job_spec_builder() {
        let spec = JobSpec::new("process_values", 10)
            .workers(2)
            .partitioned_arg(vec![1, 2, 3])
            .unwrap()
            .arg("label")
            .unwrap()
            .kwarg("scale", 3)
            .unwrap();
        assert_eq!(spec.partition, vec![0]);
        assert_eq!(spec.args.len(), 2);
        assert_eq!(spec.args.named["scale"], json!(3));
        assert_eq!(spec.clone().partition(0).partition, vec![0]);
    }

    #[test]
    fn test_local_pool_runs_inline() {
        let registry = Registry::new().with("span", |w, _| {
            Ok(json!([w.index(), w.start(), w.end(), std::process::id()]))
        });
        let pool = local_pool(registry);
        assert!(pool.is_local());
        assert_eq!(pool.size(), 1);

        let results = pool.run(JobSpec::new("span", 50)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[&0], Ok(json!([0, 0, 50, std::process::id()])));
        assert_eq!(pool.stats().jobs_completed, 1);
    }

    #[test]
    fn test_local_pool_captures_errors_and_panics() {
        let registry = Registry::new()
            .with("fails", |_, _| anyhow::bail!("no good"))
            .with("panics", |_, _| panic!("kaboom"));
        let pool = local_pool(registry);

        let results = pool.run(JobSpec::new("fails", 4)).unwrap();
        assert_eq!(results[&0], Err(TaskError::Routine("no good".into())));

        let results = pool.run(JobSpec::new("panics", 4)).unwrap();
        assert_eq!(results[&0], Err(TaskError::Panicked("kaboom".into())));
    }

    #[test]
    fn test_local_pool_reports_progress() {
        let registry = Registry::new().with("count", |w, _| Ok(json!(w.progress_range().count())));
        let pool = local_pool(registry);
        let sink = Arc::new(RecordingSink::new());

        let results = pool
            .run(JobSpec::new("count", 25).progress(sink.clone()))
            .unwrap();
        assert_eq!(results[&0], Ok(json!(25)));
        assert_eq!(sink.max(), 25);
        assert_eq!(sink.last(), Some(25));
    }

    #[test]
    fn test_empty_range_runs_once() {
        let registry = Registry::new().with("span", |w, _| Ok(json!([w.start(), w.end()])));
        let pool = local_pool(registry);

        let results = pool.run(JobSpec::new("span", 0)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[&0], Ok(json!([0, 0])));
    }

    #[test]
    fn test_local_pool_passes_whole_partitioned_arg() {
        let registry = Registry::new().with("first", |_, args| Ok(args.positional[0].clone()));
        let pool = local_pool(registry);
        let spec = JobSpec::new("first", 3).partitioned_arg(vec![1, 2, 3]).unwrap();
        assert_eq!(pool.run(spec).unwrap()[&0], Ok(json!([1, 2, 3])));
    }

    #[test]
    fn test_submit_validation() {
        let registry = Registry::new().with("noop", |_, _| Ok(Value::Null));
        let pool = local_pool(registry);

        assert!(matches!(
            pool.submit(JobSpec::new("missing", 1)),
            Err(PoolError::UnknownRoutine(name)) if name == "missing"
        ));
        let spec = JobSpec::new("noop", 1).arg(5).unwrap().partition(0);
        assert!(matches!(pool.submit(spec), Err(PoolError::InvalidArgument(_))));
        let spec = JobSpec::new("noop", 1).partition(2);
        assert!(matches!(pool.submit(spec), Err(PoolError::InvalidArgument(_))));
    }

    #[test]
    fn test_submit_after_shutdown() {
        let registry = Registry::new().with("noop", |_, _| Ok(Value::Null));
        let pool = local_pool(registry);
        pool.shutdown();
        assert!(matches!(
            pool.submit(JobSpec::new("noop", 1)),
            Err(PoolError::Stopped)
        ));
        // Shutting down twice is harmless
        pool.shutdown();
    }

    #[test]
    fn test_jobs_run_in_order() {
        let registry = Registry::new().with("id", |_, args| Ok(args.positional[0].clone()));
        let pool = local_pool(registry);
        let futures: Vec<_> = (0..5)
            .map(|i| pool.submit(JobSpec::new("id", 1).arg(i).unwrap()).unwrap())
            .collect();
        for (i, future) in futures.into_iter().enumerate() {
            let results = future.get(Some(Duration::from_secs(10))).unwrap();
            assert_eq!(results[&0], Ok(json!(i)));
        }
        assert_eq!(pool.stats().jobs_completed, 5);
    }
}
