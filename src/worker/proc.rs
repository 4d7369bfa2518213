//! Process handle for worker subprocesses.
//!
//! A [`Proc`] owns the worker's pid and its stdout until the dispatcher hands
//! the stdout to a pipe-serving thread. Writes to the worker go through a
//! [`WorkerSender`], which is shared between the dispatch loop and that thread.

use super::ipc::LineWriter;
use super::protocol::WorkRequest;
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{PoolError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::process::{ChildStdin, ChildStdout};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

type SharedWriter = Arc<Mutex<Option<LineWriter<ChildStdin>>>>;

/// Cloneable write end of a worker's request pipe.
#[derive(Clone)]
pub struct WorkerSender {
    index: usize,
    writer: SharedWriter,
}

impl WorkerSender {
    fn new(index: usize, stdin: ChildStdin) -> Self {
        Self {
            index,
            writer: Arc::new(Mutex::new(Some(LineWriter::new(stdin)))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<LineWriter<ChildStdin>>> {
        match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Send a request to the worker.
    pub fn send(&self, request: &WorkRequest) -> Result<()> {
        let line = request.to_line()?;
        let mut guard = self.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| PoolError::Worker(format!("Worker {} pipe is closed", self.index)))?;
        writer.write_line(&line).map_err(|e| {
            PoolError::Worker(format!("Failed to send to worker {}: {}", self.index, e))
        })
    }

    /// Close the pipe. The worker sees EOF on its stdin.
    pub fn close(&self) {
        self.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }
}

impl std::fmt::Debug for WorkerSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSender")
            .field("index", &self.index)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle to a worker subprocess.
pub struct Proc {
    index: usize,
    pid: Pid,
    sender: WorkerSender,
    stdout: Option<ChildStdout>,
    reaped: bool,
}

impl Proc {
    /// Create from a spawned `std::process::Child`.
    ///
    /// Takes ownership of the child's stdin and stdout. The child is reaped
    /// through `waitpid` from here on.
    pub fn from_child(index: usize, mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Worker("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Worker("Child stdout not captured".into()))?;

        Ok(Self {
            index,
            pid,
            sender: WorkerSender::new(index, stdin),
            stdout: Some(stdout),
            reaped: false,
        })
    }

    /// A sender for this worker's request pipe.
    pub fn sender(&self) -> WorkerSender {
        self.sender.clone()
    }

    /// Take the worker's stdout. Returns `None` after the first call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Send a request to the worker.
    pub fn send(&self, request: &WorkRequest) -> Result<()> {
        self.sender.send(request)
    }

    /// Try to reap the process (non-blocking).
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if self.reaped {
            return Err(PoolError::Worker("Process already reaped".into()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.reaped = true;
                Ok(Some(status))
            }
            Err(e) => {
                self.reaped = true;
                Err(PoolError::Worker(format!("waitpid failed: {}", e)))
            }
        }
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if self.reaped {
            return Err(PoolError::Worker("Process already reaped".into()));
        }
        let status = waitpid(self.pid, None)
            .map_err(|e| PoolError::Worker(format!("waitpid failed: {}", e)));
        self.reaped = true;
        status
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| PoolError::Worker(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub fn kill(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| PoolError::Worker(format!("Failed to send SIGKILL: {}", e)))?;
        self.wait()?;
        Ok(())
    }

    /// Poll for exit until `timeout` elapses.
    fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            match self.try_wait() {
                Ok(Some(_)) | Err(_) => return true,
                Ok(None) => {}
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Collect a process that is expected to be exiting (its stdout closed).
    ///
    /// Waits up to `timeout`, then kills it.
    pub fn reap(&mut self, timeout: Duration) -> TerminationReason {
        self.sender.close();
        let start = Instant::now();
        loop {
            match self.try_wait() {
                Ok(Some(status)) => return analyze_wait_status(status),
                Ok(None) => {}
                Err(_) => return TerminationReason::Unknown,
            }
            if start.elapsed() >= timeout {
                let _ = self.kill();
                return TerminationReason::Signaled(Signal::SIGKILL);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Stop the worker: send exit and close its stdin, wait up to `timeout`,
    /// then escalate to SIGTERM and finally SIGKILL.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        if self.reaped {
            return Ok(());
        }

        let _ = self.sender.send(&WorkRequest::Exit);
        self.sender.close();
        if self.wait_timeout(timeout) {
            return Ok(());
        }

        tracing::debug!(worker = self.index, pid = self.pid.as_raw(), "Worker ignored exit, sending SIGTERM");
        let _ = self.terminate();
        if self.wait_timeout(Duration::from_millis(100)) {
            return Ok(());
        }

        tracing::warn!(worker = self.index, pid = self.pid.as_raw(), "Worker ignored SIGTERM, killing");
        self.kill()
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if !self.reaped {
            self.sender.close();
            let _ = self.terminate();
            if self.wait_timeout(Duration::from_millis(10)) {
                return;
            }
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.reaped = true;
        }
    }
}
