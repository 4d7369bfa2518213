//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

/// Run registered routines over an integer range on a pool of worker processes.
#[derive(Parser, Debug)]
#[command(name = "rangepool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress everything except the result and errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Log filter directive (e.g. `rangepool=debug`), overrides -v.
    #[arg(long, global = true)]
    pub log_filter: Option<String>,

    /// Also write logs to this file.
    #[arg(long, env = "RANGEPOOL_LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a routine over [0, RANGE) and print the result map as JSON.
    Run(RunArgs),

    /// List the built-in routines.
    Routines,
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Name of the registered routine.
    pub routine: String,

    /// Size of the range to split across workers.
    #[arg(short, long)]
    pub range: usize,

    /// Workers participating in the job (0 for the whole pool).
    #[arg(short, long, default_value_t = 0)]
    pub workers: usize,

    /// Worker processes to start (defaults to the number of cores).
    #[arg(long, env = "RANGEPOOL_WORKERS")]
    pub pool_size: Option<usize>,

    /// Allow more worker processes than cores.
    #[arg(long)]
    pub oversubscribe: bool,

    /// Recycle a worker once its peak memory exceeds this many MiB.
    #[arg(long, env = "RANGEPOOL_MAX_MEMORY_MIB")]
    pub max_memory_mib: Option<usize>,

    /// Positional argument as JSON, repeatable.
    #[arg(short, long = "arg", value_name = "JSON", value_parser = parse_json)]
    pub args: Vec<Value>,

    /// Named argument as NAME=JSON, repeatable.
    #[arg(short, long = "kwarg", value_name = "NAME=JSON", value_parser = parse_kwarg)]
    pub kwargs: Vec<(String, Value)>,

    /// Split positional argument I across workers, repeatable.
    #[arg(short, long = "partition", value_name = "I")]
    pub partition: Vec<usize>,

    /// Show a progress bar on stderr.
    #[arg(long)]
    pub progress: bool,

    /// Pretty-print the result map.
    #[arg(long)]
    pub pretty: bool,
}

fn parse_json(s: &str) -> Result<Value, String> {
    serde_json::from_str(s).map_err(|e| format!("invalid JSON '{}': {}", s, e))
}

fn parse_kwarg(s: &str) -> Result<(String, Value), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=JSON, got '{}'", s))?;
    if name.is_empty() {
        return Err(format!("empty argument name in '{}'", s));
    }
    Ok((name.to_string(), parse_json(value)?))
}

/// Verbosity level for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Nothing but the result and errors.
    Quiet,
    /// Warnings from the pool.
    Normal,
    /// -v: worker lifecycle and job dispatch.
    Info,
    /// -vv: barrier rounds and protocol traffic.
    Debug,
}

impl From<u8> for Verbosity {
    fn from(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Info,
            _ => Verbosity::Debug,
        }
    }
}

impl Cli {
    /// Get the verbosity level based on -v and -q flags.
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            Verbosity::from(self.verbose)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command() {
        let args = Cli::try_parse_from(["rangepool", "run", "echo_range", "--range", "50"]).unwrap();
        match args.command {
            Commands::Run(run) => {
                assert_eq!(run.routine, "echo_range");
                assert_eq!(run.range, 50);
                assert_eq!(run.workers, 0);
                assert!(run.args.is_empty());
                assert!(!run.progress);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_with_arguments() {
        let args = Cli::try_parse_from([
            "rangepool",
            "run",
            "process_values",
            "-r",
            "3",
            "-w",
            "2",
            "--arg",
            "[1, 2, 3]",
            "--kwarg",
            "rounds=4",
            "--partition",
            "0",
        ])
        .unwrap();
        match args.command {
            Commands::Run(run) => {
                assert_eq!(run.workers, 2);
                assert_eq!(run.args, vec![json!([1, 2, 3])]);
                assert_eq!(run.kwargs, vec![("rounds".to_string(), json!(4))]);
                assert_eq!(run.partition, vec![0]);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_invalid_json_argument() {
        let result = Cli::try_parse_from(["rangepool", "run", "return_arg", "-r", "1", "--arg", "{"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_kwarg() {
        assert_eq!(
            parse_kwarg("name=\"x\"").unwrap(),
            ("name".to_string(), json!("x"))
        );
        assert!(parse_kwarg("novalue").is_err());
        assert!(parse_kwarg("=1").is_err());
    }

    #[test]
    fn test_routines_command() {
        let args = Cli::try_parse_from(["rangepool", "routines"]).unwrap();
        assert!(matches!(args.command, Commands::Routines));
    }

    #[test]
    fn test_verbosity() {
        let args = Cli::try_parse_from(["rangepool", "-vv", "routines"]).unwrap();
        assert_eq!(args.verbosity(), Verbosity::Debug);
        let args = Cli::try_parse_from(["rangepool", "-q", "routines"]).unwrap();
        assert_eq!(args.verbosity(), Verbosity::Quiet);
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["rangepool", "-v", "-q", "routines"]);
        assert!(result.is_err());
    }
}
