//! Built-in routines.
//!
//! Registered in every `rangepool` process, so the CLI and the test suite
//! can dispatch them without a custom binary.

use crate::routine::{Args, Registry};
use crate::worker::Worker;
use anyhow::{Context, bail};
use serde_json::{Value, json};
use std::time::Duration;

/// Registry holding every built-in routine.
pub fn registry() -> Registry {
    Registry::new()
        .with("echo_range", echo_range)
        .with("process_values", process_values)
        .with("return_arg", return_arg)
        .with("process_id", process_id)
        .with("share_index", share_index)
        .with("sync_rounds", sync_rounds)
        .with("fail_at", fail_at)
        .with("exit_at", exit_at)
        .with("stall_at", stall_at)
        .with("collect_range", collect_range)
        .with("sum_squares", sum_squares)
}

/// `[index, start, end]` of the worker.
fn echo_range(w: &Worker, _args: Args) -> anyhow::Result<Value> {
    Ok(json!([w.index(), w.start(), w.end()]))
}

/// `[index, values]` where `values` is the first positional argument as the
/// worker received it (its slice, when partitioned).
fn process_values(w: &Worker, args: Args) -> anyhow::Result<Value> {
    let values: Value = args.get(0)?;
    Ok(json!([w.index(), values]))
}

/// The first positional argument, unchanged.
fn return_arg(_w: &Worker, args: Args) -> anyhow::Result<Value> {
    args.get(0)
}

fn process_id(w: &Worker, _args: Args) -> anyhow::Result<Value> {
    Ok(json!({"index": w.index(), "pid": std::process::id()}))
}

/// Share the worker index under `"index"` and return what the others shared.
fn share_index(w: &Worker, _args: Args) -> anyhow::Result<Value> {
    let seen = w.share_object("index", w.index(), true)?;
    Ok(json!(seen))
}

/// Run `rounds` barrier rounds (named argument, default 3), exchanging a
/// per-round object each time. Fails if any round sees a stale or missing
/// object from a sibling.
fn sync_rounds(w: &Worker, args: Args) -> anyhow::Result<Value> {
    let rounds: u64 = args.named_or("rounds", 3)?;
    for round in 0..rounds {
        // Stagger the workers so that early arrivals really have to wait
        std::thread::sleep(Duration::from_millis(((w.index() as u64 + round) % 3) * 5));

        let name = format!("round-{}", round);
        let seen = w.share_object(&name, json!([w.index(), round]), true)?;
        if seen.len() + 1 != w.total() {
            bail!(
                "round {}: saw {} objects, expected {}",
                round,
                seen.len(),
                w.total() - 1
            );
        }
        for (index, value) in &seen {
            if *value != json!([index, round]) {
                bail!("round {}: worker {} shared {}", round, index, value);
            }
        }
    }
    Ok(json!(rounds))
}

/// Worker `index` (named, default 0) fails; every other worker waits at a
/// barrier and returns its index once released. With `panic` set the
/// failing worker panics instead of returning an error.
fn fail_at(w: &Worker, args: Args) -> anyhow::Result<Value> {
    let target: usize = args.named_or("index", 0)?;
    let panic: bool = args.named_or("panic", false)?;
    if w.index() == target {
        if panic {
            panic!("worker {} panicked on purpose", target);
        }
        bail!("worker {} failed on purpose", target);
    }
    w.sync().context("waiting for siblings")?;
    Ok(json!(w.index()))
}

/// Worker `index` (named, default 0) terminates its process with `code`
/// (named, default 3) without answering; the others wait at a barrier.
/// Refuses to run inline, where exiting would take the caller down.
fn exit_at(w: &Worker, args: Args) -> anyhow::Result<Value> {
    if w.is_local() {
        bail!("exit_at needs worker processes");
    }
    let target: usize = args.named_or("index", 0)?;
    let code: i32 = args.named_or("code", 3)?;
    if w.index() == target {
        std::process::exit(code);
    }
    w.sync()?;
    Ok(json!(w.index()))
}

/// Worker `index` (named, default 0) sleeps for `ms` milliseconds (named,
/// default 2000) before joining the barrier the others are already waiting at.
fn stall_at(w: &Worker, args: Args) -> anyhow::Result<Value> {
    let target: usize = args.named_or("index", 0)?;
    let ms: u64 = args.named_or("ms", 2000)?;
    if w.index() == target {
        std::thread::sleep(Duration::from_millis(ms));
    }
    w.sync()?;
    Ok(json!(w.index()))
}

/// Every value of the worker's range, with progress reporting.
fn collect_range(w: &Worker, _args: Args) -> anyhow::Result<Value> {
    Ok(json!(w.progress_range().collect::<Vec<_>>()))
}

/// Sum of `i * i` over the worker's range.
fn sum_squares(w: &Worker, _args: Args) -> anyhow::Result<Value> {
    let sum: u64 = w.progress_range().map(|i| (i as u64) * (i as u64)).sum();
    Ok(json!(sum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::worker::execute_routine;

    fn run_local(name: &str, range: usize, args: Args) -> Result<Value, TaskError> {
        let worker = Worker::local(None, range);
        execute_routine(&worker, &registry(), name, args)
    }

    #[test]
    fn test_registry_names() {
        let registry = registry();
        assert_eq!(registry.len(), 11);
        assert!(registry.contains("sync_rounds"));
    }

    #[test]
    fn test_local_routines() {
        assert_eq!(run_local("echo_range", 5, Args::new()), Ok(json!([0, 0, 5])));
        assert_eq!(
            run_local("process_values", 2, Args::new().arg(vec![1, 2]).unwrap()),
            Ok(json!([0, [1, 2]]))
        );
        assert_eq!(
            run_local("return_arg", 1, Args::new().arg("x").unwrap()),
            Ok(json!("x"))
        );
        assert_eq!(run_local("collect_range", 3, Args::new()), Ok(json!([0, 1, 2])));
        assert_eq!(run_local("sum_squares", 4, Args::new()), Ok(json!(14)));
        assert_eq!(run_local("share_index", 4, Args::new()), Ok(json!({})));
    }

    #[test]
    fn test_sync_rounds_single_worker() {
        // One worker sees nobody else in every round
        let args = Args::new().kwarg("rounds", 2).unwrap();
        assert_eq!(run_local("sync_rounds", 1, args), Ok(json!(2)));
    }

    #[test]
    fn test_fail_at_local() {
        assert_eq!(
            run_local("fail_at", 1, Args::new()),
            Err(TaskError::Routine("worker 0 failed on purpose".into()))
        );
        let args = Args::new().kwarg("panic", true).unwrap();
        assert_eq!(
            run_local("fail_at", 1, args),
            Err(TaskError::Panicked("worker 0 panicked on purpose".into()))
        );
    }

    #[test]
    fn test_exit_at_refuses_local() {
        assert_eq!(
            run_local("exit_at", 1, Args::new()),
            Err(TaskError::Routine("exit_at needs worker processes".into()))
        );
    }

    #[test]
    fn test_stall_at_local() {
        let args = Args::new().kwarg("ms", 1).unwrap();
        assert_eq!(run_local("stall_at", 1, args), Ok(json!(0)));
    }

    #[test]
    fn test_missing_argument() {
        assert!(matches!(
            run_local("return_arg", 1, Args::new()),
            Err(TaskError::Routine(msg)) if msg.contains("missing positional argument 0")
        ));
    }
}
