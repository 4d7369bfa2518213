//! The worker handed to every routine.
//!
//! A [`Worker`] knows which slice of the job's range it owns and how to talk
//! to its siblings. In a subprocess it is linked to the dispatcher through
//! its stdin/stdout pipes; in local mode (single worker, no subprocesses) it
//! only forwards progress to the job's sink.
//!
//! The methods take `&self` so that a routine can call [`Worker::sync`] or
//! [`Worker::set_progress`] while iterating [`Worker::progress_range`].

use super::ipc::{Inbound, LineWriter};
use super::protocol::{WorkRequest, WorkResponse};
use crate::error::TaskError;
use crate::progress::{PROGRESS_THROTTLE, ProgressSink, Throttle};
use crate::sharer::{SharerRequest, SharerResponse};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use serde::Serialize;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

/// How often a waiting worker wakes up to check on its parent.
pub const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Sub-range assignment of the job currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Assignment {
    pub job: u64,
    pub start: usize,
    pub end: usize,
    pub maxval: usize,
    pub total: usize,
}

/// Worker-side view of one process in the pool.
pub struct Worker {
    index: usize,
    assignment: Cell<Assignment>,
    throttle: RefCell<Throttle>,
    link: Link,
}

enum Link {
    Local { sink: Option<Arc<dyn ProgressSink>> },
    Remote(RefCell<RemoteLink>),
}

/// Pipe endpoints and barrier bookkeeping of a worker subprocess.
struct RemoteLink {
    inbox: Receiver<Inbound<WorkRequest>>,
    out: LineWriter<Box<dyn Write + Send>>,
    parent: Option<Pid>,
    round: u64,
    /// Requests that arrived while waiting for something else.
    pending: VecDeque<WorkRequest>,
    closed: bool,
}

impl Worker {
    /// Worker running inline in the dispatching process over `[0, range)`.
    pub fn local(sink: Option<Arc<dyn ProgressSink>>, range: usize) -> Self {
        let worker = Self {
            index: 0,
            assignment: Cell::new(Assignment::default()),
            throttle: RefCell::new(Throttle::new(PROGRESS_THROTTLE)),
            link: Link::Local { sink },
        };
        worker.begin_job(Assignment {
            job: 0,
            start: 0,
            end: range,
            maxval: range,
            total: 1,
        });
        worker
    }

    /// Worker linked to the dispatcher.
    ///
    /// `inbox` is fed by a thread reading the request pipe, `out` is the
    /// response pipe. `parent` is polled for liveness while waiting.
    pub fn remote(
        index: usize,
        inbox: Receiver<Inbound<WorkRequest>>,
        out: Box<dyn Write + Send>,
        parent: Option<Pid>,
    ) -> Self {
        Self {
            index,
            assignment: Cell::new(Assignment::default()),
            throttle: RefCell::new(Throttle::new(PROGRESS_THROTTLE)),
            link: Link::Remote(RefCell::new(RemoteLink {
                inbox,
                out: LineWriter::new(out),
                parent,
                round: 0,
                pending: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// Index of this worker in the pool, `0 <= index < total`.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of workers taking part in the current job.
    pub fn total(&self) -> usize {
        self.assignment.get().total
    }

    /// First value of this worker's sub-range.
    pub fn start(&self) -> usize {
        self.assignment.get().start
    }

    /// One past the last value of this worker's sub-range.
    pub fn end(&self) -> usize {
        self.assignment.get().end
    }

    /// Size of the job's whole range.
    pub fn max(&self) -> usize {
        self.assignment.get().maxval
    }

    /// Id of the job being run.
    pub fn job(&self) -> u64 {
        self.assignment.get().job
    }

    pub fn is_local(&self) -> bool {
        matches!(self.link, Link::Local { .. })
    }

    /// This worker's values, `start..end`.
    pub fn range(&self) -> Range<usize> {
        self.start()..self.end()
    }

    /// Same values as [`range`](Self::range), reporting progress as they are
    /// consumed and forcing a final update at the end.
    pub fn progress_range(&self) -> ProgressRange<'_> {
        ProgressRange {
            worker: self,
            inner: self.range(),
            done: 0,
            started: false,
            finished: false,
        }
    }

    /// Install the assignment of a new job and reset per-job state.
    pub(crate) fn begin_job(&self, assignment: Assignment) {
        self.assignment.set(assignment);
        *self.throttle.borrow_mut() = Throttle::new(PROGRESS_THROTTLE);
        if let Link::Remote(link) = &self.link {
            link.borrow_mut().round = 0;
        }
    }

    /// Report progress within this worker's sub-range.
    ///
    /// Updates closer than 200 ms to the previous one are dropped unless
    /// `force` is set.
    pub fn set_progress(&self, value: u64, force: bool) {
        if !self.throttle.borrow_mut().ready(force) {
            return;
        }
        match &self.link {
            Link::Local { sink: Some(sink) } => sink.set_progress(value),
            Link::Local { sink: None } => {}
            Link::Remote(link) => {
                let job = self.job();
                if let Err(e) = link.borrow_mut().send(&WorkResponse::Progress { job, value }) {
                    tracing::debug!(worker_id = self.index, job, error = %e, "Dropped progress update");
                }
            }
        }
    }

    /// Block until every worker of the job has called `sync`.
    ///
    /// Fails with [`TaskError::SiblingFailed`] if another worker's routine
    /// failed, [`TaskError::ParentExited`] if the dispatcher went away and
    /// [`TaskError::Stopped`] if the pool is shutting down. All workers of a
    /// job must call `sync` the same number of times.
    pub fn sync(&self) -> Result<(), TaskError> {
        let Link::Remote(link) = &self.link else {
            return Ok(());
        };
        let job = self.job();
        let mut link = link.borrow_mut();
        let round = link.round;
        link.round += 1;

        tracing::trace!(worker_id = self.index, job, round, "Arriving at barrier");
        link.send(&WorkResponse::Arrive { job, round })?;
        link.wait_release(job, round)?;
        tracing::trace!(worker_id = self.index, job, round, "Released from barrier");
        Ok(())
    }

    /// Publish `obj` under `name` for the other workers of this job.
    ///
    /// With `exchange` set, also waits for every worker to publish (through
    /// [`sync`](Self::sync)) and returns their objects keyed by index. This
    /// worker's own object is never included. Returns an empty map in local
    /// mode or when the job has a single worker.
    pub fn share_object(
        &self,
        name: &str,
        obj: impl Serialize,
        exchange: bool,
    ) -> Result<BTreeMap<usize, Value>, TaskError> {
        if self.total() <= 1 || self.is_local() {
            return Ok(BTreeMap::new());
        }

        let value = serde_json::to_value(obj)
            .map_err(|e| TaskError::Routine(format!("cannot share '{}': {}", name, e)))?;
        self.call(SharerRequest::Publish {
            index: self.index,
            name: name.to_string(),
            value,
        })?;

        if exchange {
            self.sync()?;
            self.get_objects(name)
        } else {
            Ok(BTreeMap::new())
        }
    }

    /// Objects other workers published under `name`. Does not synchronize.
    pub fn get_objects(&self, name: &str) -> Result<BTreeMap<usize, Value>, TaskError> {
        if self.is_local() {
            return Ok(BTreeMap::new());
        }
        let response = self.call(SharerRequest::Lookup {
            name: name.to_string(),
            exclude: Some(self.index),
        })?;
        Ok(response.into_objects())
    }

    fn call(&self, request: SharerRequest) -> Result<SharerResponse, TaskError> {
        match &self.link {
            Link::Local { .. } => Ok(SharerResponse::Done),
            Link::Remote(link) => link.borrow_mut().call(request),
        }
    }

    /// Send a response to the dispatcher. Local workers have nobody to send to.
    pub(crate) fn send(&self, response: &WorkResponse) -> Result<(), TaskError> {
        match &self.link {
            Link::Local { .. } => Ok(()),
            Link::Remote(link) => link.borrow_mut().send(response),
        }
    }

    /// Next request for the main loop, stashed ones first.
    ///
    /// Returns `None` once stdin is closed or the parent is gone.
    pub(crate) fn next_request(&self) -> Option<WorkRequest> {
        let Link::Remote(link) = &self.link else {
            return None;
        };
        let mut link = link.borrow_mut();
        if let Some(request) = link.pending.pop_front() {
            return Some(request);
        }
        link.recv().ok()
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("assignment", &self.assignment.get())
            .field("local", &self.is_local())
            .finish()
    }
}

impl RemoteLink {
    fn send(&mut self, response: &WorkResponse) -> Result<(), TaskError> {
        let line = response
            .to_line()
            .map_err(|e| TaskError::Routine(format!("cannot encode response: {}", e)))?;
        self.out.write_line(&line).map_err(|e| {
            tracing::debug!(error = %e, "Response pipe closed");
            TaskError::ParentExited
        })
    }

    fn parent_alive(&self) -> bool {
        match self.parent {
            Some(pid) => signal::kill(pid, None) != Err(Errno::ESRCH),
            None => true,
        }
    }

    /// Receive the next request off the pipe, polling parent liveness.
    fn recv(&mut self) -> Result<WorkRequest, TaskError> {
        loop {
            if self.closed {
                return Err(self.closed_error());
            }
            match self.inbox.recv_timeout(WORKER_POLL_INTERVAL) {
                Ok(Inbound::Message(request)) => return Ok(request),
                Ok(Inbound::Malformed(line)) => {
                    tracing::warn!(line = %line, "Ignoring malformed request");
                }
                Ok(Inbound::Closed) | Err(RecvTimeoutError::Disconnected) => {
                    self.closed = true;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !self.parent_alive() {
                        self.closed = true;
                    }
                }
            }
        }
    }

    fn closed_error(&self) -> TaskError {
        if self.parent_alive() {
            TaskError::Stopped
        } else {
            TaskError::ParentExited
        }
    }

    /// Wait for the release of `round` of `job`.
    fn wait_release(&mut self, job: u64, round: u64) -> Result<(), TaskError> {
        let stashed = self.pending.iter().position(|r| match r {
            WorkRequest::Release { job: j, round: r } => *j == job && *r == round,
            WorkRequest::Abort { job: j } => *j == job,
            _ => false,
        });
        if let Some(pos) = stashed
            && let Some(request) = self.pending.remove(pos)
        {
            return match request {
                WorkRequest::Abort { .. } => Err(TaskError::SiblingFailed),
                _ => Ok(()),
            };
        }

        loop {
            match self.recv()? {
                WorkRequest::Release { job: j, round: r } if j == job && r == round => return Ok(()),
                WorkRequest::Abort { job: j } if j == job => return Err(TaskError::SiblingFailed),
                WorkRequest::Exit => {
                    self.pending.push_back(WorkRequest::Exit);
                    return Err(TaskError::Stopped);
                }
                request @ WorkRequest::Execute { .. } => self.pending.push_back(request),
                other => {
                    tracing::debug!(job, round, request = ?other, "Discarding stale request at barrier");
                }
            }
        }
    }

    /// Proxied call on the dispatcher's object sharer.
    fn call(&mut self, request: SharerRequest) -> Result<SharerResponse, TaskError> {
        let op = request.op();
        self.send(&WorkResponse::Call { request })?;
        loop {
            match self.recv()? {
                WorkRequest::Reply { response } => return response,
                WorkRequest::Exit => {
                    self.pending.push_back(WorkRequest::Exit);
                    return Err(TaskError::Stopped);
                }
                other => {
                    tracing::trace!(op, request = ?other, "Stashing request while waiting for reply");
                    self.pending.push_back(other);
                }
            }
        }
    }
}

/// Iterator returned by [`Worker::progress_range`].
pub struct ProgressRange<'a> {
    worker: &'a Worker,
    inner: Range<usize>,
    done: u64,
    started: bool,
    finished: bool,
}

impl Iterator for ProgressRange<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.finished {
            return None;
        }
        if self.started {
            self.done += 1;
        }
        match self.inner.next() {
            Some(value) => {
                if self.started {
                    self.worker.set_progress(self.done, false);
                }
                self.started = true;
                Some(value)
            }
            None => {
                self.finished = true;
                self.worker.set_progress(self.done, true);
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
