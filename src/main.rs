//! rangepool - run registered routines over a range on worker processes

mod cli;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use rangepool::logging::{self, LogConfig};
use rangepool::{
    Args, JobSpec, Pool, PoolConfig, ProgressBarSink, Registry, ResultMap, WorkerCommand,
    builtin, reduce, run_if_worker,
};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::Level;

use cli::{Cli, Commands, RunArgs, Verbosity};

/// Program entry point.
///
/// Worker processes are this same binary re-executed by the pool; they are
/// diverted into the worker loop before any argument parsing. Otherwise the
/// selected command runs and errors are printed with their cause chain
/// before exiting with status 1.
fn main() {
    let registry = Arc::new(builtin::registry());
    run_if_worker(&registry);

    let cli = Cli::parse();
    let filter = init_logging(&cli);

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args, registry, filter),
        Commands::Routines => cmd_routines(&registry),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        for cause in e.chain().skip(1) {
            eprintln!("  caused by: {}", cause);
        }
        std::process::exit(1);
    }
}

/// Configure logging from the verbosity flags, returning the filter the
/// command line asked for (if any) so workers can use the same one.
fn init_logging(cli: &Cli) -> Option<String> {
    let level = match cli.verbosity() {
        Verbosity::Quiet => Level::ERROR,
        Verbosity::Normal => Level::WARN,
        Verbosity::Info => Level::INFO,
        Verbosity::Debug => Level::DEBUG,
    };

    // Explicit flags take precedence over RANGEPOOL_LOG / RUST_LOG
    let filter = match (&cli.log_filter, cli.verbosity()) {
        (Some(filter), _) => Some(filter.clone()),
        (None, Verbosity::Normal) => None,
        (None, _) => Some(level.as_str().to_lowercase()),
    };

    let mut config = LogConfig::for_cli().with_level(level);
    if let Some(filter) = &filter {
        config = config.with_filter(filter.clone());
    }
    let mut config = config.with_env_overrides();
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }
    logging::init_with_file(config);
    filter
}

fn cmd_run(
    cli: &Cli,
    args: &RunArgs,
    registry: Arc<Registry>,
    filter: Option<String>,
) -> Result<()> {
    let mut config = PoolConfig::default().with_env_overrides();
    if let Some(size) = args.pool_size {
        config.worker_count = size;
    }
    if args.oversubscribe {
        config = config.oversubscribe();
    }
    if let Some(mib) = args.max_memory_mib {
        config = config.with_max_memory_mib(mib);
    }
    if let Some(filter) = filter {
        let command = WorkerCommand::current_exe()?.env("RANGEPOOL_LOG", filter);
        config = config.with_worker_command(command);
    }

    let mut call_args = Args::new();
    for value in &args.args {
        call_args = call_args.arg(value)?;
    }
    for (name, value) in &args.kwargs {
        call_args = call_args.kwarg(name.as_str(), value)?;
    }

    let mut spec = JobSpec::new(args.routine.as_str(), args.range)
        .workers(args.workers)
        .args(call_args);
    for &index in &args.partition {
        spec = spec.partition(index);
    }

    let bar = (args.progress && cli.verbosity() != Verbosity::Quiet)
        .then(|| Arc::new(ProgressBarSink::new(args.routine.as_str())));
    if let Some(bar) = &bar {
        spec = spec.progress(bar.clone());
    }

    let pool = Pool::new(config, registry).context("Failed to start worker pool")?;
    let results = pool
        .run(spec)
        .with_context(|| format!("Failed to run '{}'", args.routine))?;
    if let Some(bar) = bar {
        bar.finish();
    }
    pool.shutdown();

    let rendered = render_results(&results);
    let text = if args.pretty {
        serde_json::to_string_pretty(&rendered)?
    } else {
        serde_json::to_string(&rendered)?
    };
    println!("{}", text);

    reduce::raise_first_error(&results).map_err(|e| anyhow!("routine '{}' failed: {}", args.routine, e))
}

fn cmd_routines(registry: &Registry) -> Result<()> {
    for name in registry.names() {
        println!("{}", name);
    }
    Ok(())
}

/// `{"<index>": {"ok": value} | {"error": message}}` in worker index order.
fn render_results(results: &ResultMap) -> Value {
    let mut out = Map::new();
    for (index, outcome) in results {
        let entry = match outcome {
            Ok(value) => json!({ "ok": value }),
            Err(err) => json!({ "error": err.to_string() }),
        };
        out.insert(index.to_string(), entry);
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangepool::TaskError;

    #[test]
    fn test_render_results() {
        let mut results = ResultMap::new();
        results.insert(1, Err(TaskError::SiblingFailed));
        results.insert(0, Ok(json!([1, 2])));

        let rendered = render_results(&results);
        assert_eq!(rendered["0"], json!({"ok": [1, 2]}));
        assert!(rendered["1"]["error"].is_string());
    }
}
