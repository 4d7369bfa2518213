//! IPC protocol for worker subprocess communication.
//!
//! Messages are JSON-serialized and newline-delimited. Requests travel down
//! the worker's stdin, responses come back on its stdout.

use crate::error::TaskError;
use crate::routine::Args;
use crate::sharer::{SharerRequest, SharerResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of one routine invocation.
pub type Outcome = Result<Value, TaskError>;

/// Request from dispatcher to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkRequest {
    /// Run a registered routine over `[start, end)`.
    #[serde(rename = "execute")]
    Execute {
        /// Job id, echoed back in the result and barrier messages
        job: u64,
        /// Registered routine name
        routine: String,
        /// Arguments, already sliced for this worker
        args: Args,
        /// First value of this worker's sub-range
        start: usize,
        /// One past the last value of this worker's sub-range
        end: usize,
        /// Size of the job's whole range
        maxval: usize,
        /// Number of workers taking part in the job
        total: usize,
    },

    /// Every participant reached barrier round `round`.
    #[serde(rename = "release")]
    Release { job: u64, round: u64 },

    /// A sibling failed; the pending barrier wait must raise.
    #[serde(rename = "abort")]
    Abort { job: u64 },

    /// Reply to a proxied sharer call.
    #[serde(rename = "reply")]
    Reply {
        response: Result<SharerResponse, TaskError>,
    },

    /// Graceful shutdown request.
    #[serde(rename = "exit")]
    Exit,
}

/// Response from worker to dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkResponse {
    /// Worker is ready for work.
    #[serde(rename = "ready")]
    Ready { pid: u32 },

    /// Routine finished.
    #[serde(rename = "result")]
    Result { job: u64, outcome: Outcome },

    /// Progress within the current job.
    #[serde(rename = "progress")]
    Progress { job: u64, value: u64 },

    /// Worker reached barrier round `round`.
    #[serde(rename = "arrive")]
    Arrive { job: u64, round: u64 },

    /// Proxied call on the object sharer.
    #[serde(rename = "call")]
    Call { request: SharerRequest },

    /// Worker requests restart (memory threshold exceeded) and is exiting.
    #[serde(rename = "restart")]
    Restart {
        /// Peak resident memory in MiB
        memory_mib: usize,
        /// Configured threshold in MiB
        threshold_mib: usize,
    },
}

impl WorkRequest {
    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl WorkResponse {
    /// Create a result response.
    pub fn result(job: u64, outcome: Outcome) -> Self {
        Self::Result { job, outcome }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
