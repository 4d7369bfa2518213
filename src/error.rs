//! Error types for rangepool.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Main error type for pool operations in the dispatching process.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Timed out after {0:?} waiting for result")]
    Timeout(Duration),

    #[error("Unknown routine '{0}'. Routines must be registered before the pool starts.")]
    UnknownRoutine(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Pool has been shut down")]
    Stopped,

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Error produced while running a routine on one worker.
///
/// These travel through the worker pipes as data and end up in the result
/// map under the worker's index, so they must stay serializable and cheap to
/// clone.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TaskError {
    /// The routine returned an error.
    #[error("{0}")]
    Routine(String),

    /// The routine panicked.
    #[error("Routine panicked: {0}")]
    Panicked(String),

    /// Another worker in the same job failed while this one was synchronizing.
    #[error("Sibling process encountered exception")]
    SiblingFailed,

    /// The dispatching process disappeared.
    #[error("Parent exited before child completed processing")]
    ParentExited,

    /// The pool is shutting down.
    #[error("Pool is shutting down")]
    Stopped,

    /// A proxied call got no reply in time.
    #[error("Did not get result back for method call {0}")]
    NoResponse(String),

    /// The worker does not know the requested routine.
    #[error("Unknown routine '{0}'")]
    UnknownRoutine(String),

    /// The worker process died or could not be started.
    #[error("Worker {index} lost: {reason}")]
    WorkerLost { index: usize, reason: String },

    /// Dispatching the job failed before the worker could answer.
    #[error("Dispatch failed: {0}")]
    Dispatch(String),
}

impl TaskError {
    /// Convert a routine's `anyhow` error, keeping typed errors raised by
    /// the worker API (e.g. a failed `sync()`) intact.
    pub fn from_routine(err: anyhow::Error) -> Self {
        match err.downcast::<TaskError>() {
            Ok(task) => task,
            Err(other) => Self::Routine(format!("{:#}", other)),
        }
    }

    /// Build a `Panicked` error from a panic payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_timeout_error_message() {
        let err = PoolError::Timeout(Duration::from_millis(1500));
        let msg = err.to_string();
        assert!(msg.contains("Timed out"));
        assert!(msg.contains("1.5s"));
    }

    #[test]
    fn test_unknown_routine_error_message() {
        let err = PoolError::UnknownRoutine("mesh_refine".to_string());
        let msg = err.to_string();
        assert!(msg.contains("mesh_refine"));
        assert!(msg.contains("registered"));
    }

    #[test]
    fn test_task_error_is_transparent() {
        let err: PoolError = TaskError::SiblingFailed.into();
        assert_eq!(err.to_string(), "Sibling process encountered exception");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: PoolError = io_err.into();
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_task_error_serialization() {
        let err = TaskError::WorkerLost {
            index: 3,
            reason: "killed by signal SIGKILL".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("worker_lost"));
        let parsed: TaskError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);

        let json = serde_json::to_string(&TaskError::SiblingFailed).unwrap();
        let parsed: TaskError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskError::SiblingFailed);
    }

    #[test]
    fn test_from_routine_preserves_task_errors() {
        let err = anyhow::Error::new(TaskError::ParentExited);
        assert_eq!(TaskError::from_routine(err), TaskError::ParentExited);

        let err = anyhow::anyhow!("bad mesh").context("refining elements");
        assert_eq!(
            TaskError::from_routine(err),
            TaskError::Routine("refining elements: bad mesh".to_string())
        );
    }

    #[test]
    fn test_from_panic_payloads() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(
            TaskError::from_panic(payload),
            TaskError::Panicked("boom".to_string())
        );
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(
            TaskError::from_panic(payload),
            TaskError::Panicked("owned boom".to_string())
        );
        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert!(matches!(TaskError::from_panic(payload), TaskError::Panicked(_)));
    }
}
