//! Worker subprocess spawning.
//!
//! Workers are started with `posix_spawn` via `std::process::Command`, by
//! default re-executing the current binary. The worker side is selected by
//! environment variables rather than by forking, so the dispatcher's threads
//! and locks never leak into a child.

use super::proc::Proc;
use crate::error::{PoolError, Result};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Environment variable carrying the worker's pool index.
pub const ENV_WORKER_INDEX: &str = "RANGEPOOL_WORKER_INDEX";
/// Environment variable carrying the dispatcher's process id.
pub const ENV_PARENT_PID: &str = "RANGEPOOL_PARENT_PID";
/// Environment variable carrying the per-worker memory threshold in MiB.
pub const ENV_MAX_MEMORY_MIB: &str = "RANGEPOOL_MAX_MEMORY_MIB";

/// Program and arguments used to start a worker process.
///
/// The program must call [`run_if_worker`](super::run_if_worker) with the
/// same routine registry as the dispatcher before doing anything else.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// The running executable.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| {
            PoolError::Worker(format!("Failed to get current executable: {}", e))
        })?;
        Ok(Self::new(exe))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Settings handed to one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pool index of the worker.
    pub index: usize,
    /// Memory threshold (MiB) before the worker requests a restart.
    pub max_memory_mib: usize,
}

/// Spawn a worker subprocess.
///
/// Stdin and stdout become the request/response pipes; stderr is inherited
/// so worker logs reach the dispatcher's terminal.
pub fn spawn_worker(command: &WorkerCommand, config: &WorkerConfig) -> Result<Proc> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);
    cmd.envs(command.env.iter().map(|(k, v)| (k, v)));

    cmd.env(ENV_WORKER_INDEX, config.index.to_string());
    cmd.env(ENV_PARENT_PID, std::process::id().to_string());
    cmd.env(ENV_MAX_MEMORY_MIB, config.max_memory_mib.to_string());

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());

    // macOS-specific: disable fork safety check for Objective-C
    #[cfg(target_os = "macos")]
    cmd.env("OBJC_DISABLE_INITIALIZE_FORK_SAFETY", "YES");

    let child = cmd.spawn().map_err(|e| {
        PoolError::Worker(format!(
            "Failed to spawn worker {} from {}: {}",
            config.index,
            command.program.display(),
            e
        ))
    })?;

    Proc::from_child(config.index, child)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_command_builder() {
        let cmd = WorkerCommand::new("/bin/true")
            .arg("--quiet")
            .env("RANGEPOOL_LOG", "debug");
        assert_eq!(cmd.program, PathBuf::from("/bin/true"));
        assert_eq!(cmd.args, vec![OsString::from("--quiet")]);
        assert_eq!(cmd.env.len(), 1);
    }

    #[test]
    fn test_current_exe() {
        let cmd = WorkerCommand::current_exe().unwrap();
        assert!(cmd.program.exists());
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let cmd = WorkerCommand::new("/nonexistent/rangepool-worker");
        let config = WorkerConfig {
            index: 0,
            max_memory_mib: 1024,
        };
        let err = spawn_worker(&cmd, &config).err().expect("spawn should fail");
        assert!(err.to_string().contains("Failed to spawn worker 0"));
    }
}
