//! Crash analysis for worker subprocesses.
//!
//! Turns a reaped worker's wait status into a reason that ends up in the
//! result map when a worker dies mid-job.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Likely out of memory (SIGKILL from OOM killer).
    OutOfMemory,
    /// Stack overflow or wild pointer (SIGSEGV/SIGBUS).
    Segfault,
    /// Process is still running.
    StillAlive,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::OutOfMemory => "out of memory (SIGKILL)".to_string(),
            Self::Segfault => "segmentation fault".to_string(),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => match signal {
            Signal::SIGKILL => TerminationReason::OutOfMemory,
            Signal::SIGSEGV | Signal::SIGBUS => TerminationReason::Segfault,
            _ => TerminationReason::Signaled(signal),
        },
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

/// Information about a worker failure.
#[derive(Debug)]
pub struct WorkerFailure {
    /// Why the worker terminated.
    pub reason: TerminationReason,
    /// What the worker was doing when it failed.
    pub context: Option<String>,
}

impl WorkerFailure {
    pub fn new(reason: TerminationReason) -> Self {
        Self {
            reason,
            context: None,
        }
    }

    /// Add context about what the worker was doing.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)?;
        if let Some(ctx) = &self.context {
            write!(f, " while {}", ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_termination_reason_description() {
        assert_eq!(TerminationReason::Exited(3).to_string(), "exited with code 3");
        assert_eq!(
            TerminationReason::Signaled(Signal::SIGTERM).to_string(),
            "killed by signal SIGTERM"
        );
        assert_eq!(TerminationReason::Segfault.to_string(), "segmentation fault");
    }

    #[test]
    fn test_analyze_wait_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            analyze_wait_status(WaitStatus::Exited(pid, 3)),
            TerminationReason::Exited(3)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            TerminationReason::OutOfMemory
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGSEGV, true)),
            TerminationReason::Segfault
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            TerminationReason::Signaled(Signal::SIGTERM)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::StillAlive),
            TerminationReason::StillAlive
        );
    }

    #[test]
    fn test_worker_failure_display() {
        let failure = WorkerFailure::new(TerminationReason::Segfault).with_context("running job 4");
        let display = failure.to_string();
        assert!(display.contains("segmentation fault"));
        assert!(display.contains("running job 4"));
    }
}
