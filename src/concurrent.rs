//! Synchronous entry point for running a routine on the pool.
//!
//! ```no_run
//! # use rangepool::{Args, Pool, PoolConfig, builtin, reduce};
//! # use std::sync::Arc;
//! # let pool = Pool::new(PoolConfig::default(), Arc::new(builtin::registry()))?;
//! let values: Vec<u32> = (0..10).collect();
//! let results = pool
//!     .concurrent("process_values")
//!     .partition(0)
//!     .call(values.len(), 3, None, Args::new().arg(&values)?)?;
//! let flat = reduce::concat_in_order(results)?;
//! # Ok::<(), rangepool::PoolError>(())
//! ```

use crate::error::Result;
use crate::pool::{JobSpec, Pool, ResultMap};
use crate::progress::ProgressSink;
use crate::routine::Args;
use std::sync::Arc;

/// A registered routine bound to a pool, called like a function.
pub struct Concurrent<'a> {
    pool: &'a Pool,
    routine: String,
    partition: Vec<usize>,
}

impl<'a> Concurrent<'a> {
    pub(crate) fn new(pool: &'a Pool, routine: impl Into<String>) -> Self {
        Self {
            pool,
            routine: routine.into(),
            partition: Vec::new(),
        }
    }

    /// Split positional argument `index` across workers on every call.
    pub fn partition(mut self, index: usize) -> Self {
        if !self.partition.contains(&index) {
            self.partition.push(index);
        }
        self
    }

    pub fn routine(&self) -> &str {
        &self.routine
    }

    /// Run the routine over `[0, range)` on `workers` workers (`0` for the
    /// whole pool, `1` to run inline) and wait for the result map.
    pub fn call(
        &self,
        range: usize,
        workers: usize,
        progress: Option<Arc<dyn ProgressSink>>,
        args: Args,
    ) -> Result<ResultMap> {
        let mut spec = JobSpec::new(self.routine.clone(), range)
            .workers(workers)
            .args(args);
        spec.partition = self.partition.clone();
        if let Some(sink) = progress {
            spec = spec.progress(sink);
        }
        self.pool.run(spec)
    }
}

/// Pick a worker count for a job over `elems` elements.
///
/// Small jobs, where `elems * (refine + 1)` stays under `threshold`, run
/// sequentially (`1`). Jobs with no more elements than the pool has workers
/// get one worker per element; anything larger uses the whole pool (`0`).
pub fn choose_worker_count(elems: usize, refine: f64, threshold: usize, pool_size: usize) -> usize {
    let adjusted = elems as f64 * (refine + 1.0);
    if adjusted < threshold as f64 {
        1
    } else if elems <= pool_size {
        elems
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::routine::Registry;
    use serde_json::json;

    #[test]
    fn test_choose_worker_count() {
        assert_eq!(choose_worker_count(10, 0.0, 100, 4), 1);
        assert_eq!(choose_worker_count(10, 9.0, 100, 4), 0);
        assert_eq!(choose_worker_count(3, 50.0, 100, 4), 3);
        assert_eq!(choose_worker_count(4, 24.0, 100, 4), 4);
        assert_eq!(choose_worker_count(1000, 0.0, 100, 8), 0);
    }

    #[test]
    fn test_concurrent_call_local() {
        let registry = Registry::new().with("describe", |w, args| {
            Ok(json!({"range": [w.start(), w.end()], "values": args.positional[0]}))
        });
        let pool = Pool::new(PoolConfig::with_workers(1), Arc::new(registry)).unwrap();

        let wrapper = pool.concurrent("describe").partition(0);
        assert_eq!(wrapper.routine(), "describe");
        let results = wrapper
            .call(3, 0, None, Args::new().arg(vec![7, 8, 9]).unwrap())
            .unwrap();
        assert_eq!(
            results[&0],
            Ok(json!({"range": [0, 3], "values": [7, 8, 9]}))
        );
    }

    #[test]
    fn test_concurrent_unknown_routine() {
        let pool = Pool::new(PoolConfig::with_workers(1), Arc::new(Registry::new())).unwrap();
        assert!(pool.concurrent("nope").call(1, 0, None, Args::new()).is_err());
    }
}
