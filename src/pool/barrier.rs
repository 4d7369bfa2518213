//! Dispatcher-side barrier bookkeeping.
//!
//! Workers never share memory, so the barrier lives in the dispatcher. A
//! worker calling `sync()` sends `arrive { job, round }`; the pipe server for
//! that worker records it here and, when the last participant of the round
//! arrives, releases everybody that was waiting.
//!
//! Rounds are numbered per job. A worker only accepts the release of the
//! round it arrived at, so a late release can never let it through a later
//! round early.

use std::sync::{Mutex, MutexGuard};

/// What the caller of [`Barrier::arrive`] must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrival {
    /// Not everyone is here yet; the worker keeps waiting.
    Wait,
    /// Round `round` is complete; release these workers (arrival included).
    Release { round: u64, workers: Vec<usize> },
    /// The barrier has failed; abort these workers.
    Abort { workers: Vec<usize> },
    /// The arrival belongs to a job that is no longer running.
    Stale,
}

#[derive(Debug, Default)]
struct BarrierState {
    job: u64,
    /// Arrivals in the current round; negative once a sibling failed.
    counter: i64,
    participants: usize,
    waiting: Vec<usize>,
    round: u64,
}

/// Counting barrier shared by the pipe-serving threads of one pool.
#[derive(Debug, Default)]
pub struct Barrier {
    state: Mutex<BarrierState>,
}

impl Barrier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Prepare for `job` with `participants` workers.
    pub fn reset(&self, job: u64, participants: usize) {
        let mut state = self.lock();
        *state = BarrierState {
            job,
            counter: 0,
            participants,
            waiting: Vec::with_capacity(participants),
            round: 0,
        };
    }

    /// Record that worker `index` reached `round` of `job`.
    pub fn arrive(&self, job: u64, index: usize, round: u64) -> Arrival {
        let mut state = self.lock();
        if job != state.job {
            return Arrival::Stale;
        }
        if state.counter < 0 {
            return Arrival::Abort {
                workers: vec![index],
            };
        }
        if round != state.round {
            // Someone called sync() a different number of times. Nobody can
            // be released consistently any more.
            tracing::warn!(job, worker_id = index, round, expected = state.round, "Barrier round mismatch");
            let mut workers = fail_locked(&mut state);
            workers.push(index);
            return Arrival::Abort { workers };
        }

        state.counter += 1;
        if (state.counter as usize) < state.participants {
            state.waiting.push(index);
            return Arrival::Wait;
        }

        let mut workers = std::mem::take(&mut state.waiting);
        workers.push(index);
        state.counter = 0;
        state.round += 1;
        Arrival::Release { round, workers }
    }

    /// Mark `job`'s barrier as failed and return the workers currently
    /// waiting on it. Every later arrival is aborted as well.
    pub fn fail(&self, job: u64) -> Vec<usize> {
        let mut state = self.lock();
        if job != state.job {
            return Vec::new();
        }
        fail_locked(&mut state)
    }

    /// Whether `job`'s barrier has failed.
    pub fn is_failed(&self, job: u64) -> bool {
        let state = self.lock();
        state.job == job && state.counter < 0
    }

    /// Number of completed rounds of the current job.
    pub fn round(&self) -> u64 {
        self.lock().round
    }
}

fn fail_locked(state: &mut BarrierState) -> Vec<usize> {
    state.counter = -(state.participants as i64 + 1);
    std::mem::take(&mut state.waiting)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_arrival_releases_all() {
        let barrier = Barrier::new();
        barrier.reset(1, 3);
        assert_eq!(barrier.arrive(1, 2, 0), Arrival::Wait);
        assert_eq!(barrier.arrive(1, 0, 0), Arrival::Wait);
        assert_eq!(
            barrier.arrive(1, 1, 0),
            Arrival::Release {
                round: 0,
                workers: vec![2, 0, 1]
            }
        );
        assert_eq!(barrier.round(), 1);
    }

    #[test]
    fn test_rounds_do_not_overlap() {
        let barrier = Barrier::new();
        barrier.reset(1, 2);
        assert_eq!(barrier.arrive(1, 0, 0), Arrival::Wait);
        assert!(matches!(barrier.arrive(1, 1, 0), Arrival::Release { round: 0, .. }));

        // Worker 0 races ahead into round 1; it must wait for worker 1 again
        assert_eq!(barrier.arrive(1, 0, 1), Arrival::Wait);
        assert_eq!(
            barrier.arrive(1, 1, 1),
            Arrival::Release {
                round: 1,
                workers: vec![0, 1]
            }
        );
    }

    #[test]
    fn test_fail_aborts_waiting_and_later_arrivals() {
        let barrier = Barrier::new();
        barrier.reset(4, 3);
        assert_eq!(barrier.arrive(4, 0, 0), Arrival::Wait);
        assert_eq!(barrier.arrive(4, 1, 0), Arrival::Wait);

        assert_eq!(barrier.fail(4), vec![0, 1]);
        assert!(barrier.is_failed(4));
        assert_eq!(
            barrier.arrive(4, 2, 0),
            Arrival::Abort { workers: vec![2] }
        );
        // A second failure has nobody left to abort
        assert!(barrier.fail(4).is_empty());
    }

    #[test]
    fn test_stale_job_ignored() {
        let barrier = Barrier::new();
        barrier.reset(2, 2);
        assert_eq!(barrier.arrive(1, 0, 0), Arrival::Stale);
        assert!(barrier.fail(1).is_empty());
        assert!(!barrier.is_failed(2));
    }

    #[test]
    fn test_round_mismatch_fails_barrier() {
        let barrier = Barrier::new();
        barrier.reset(3, 3);
        assert_eq!(barrier.arrive(3, 0, 0), Arrival::Wait);
        assert_eq!(
            barrier.arrive(3, 1, 5),
            Arrival::Abort { workers: vec![0, 1] }
        );
        assert!(barrier.is_failed(3));
    }

    #[test]
    fn test_reset_clears_failure() {
        let barrier = Barrier::new();
        barrier.reset(1, 2);
        barrier.fail(1);
        barrier.reset(2, 2);
        assert!(!barrier.is_failed(2));
        assert_eq!(barrier.round(), 0);
        assert_eq!(barrier.arrive(2, 0, 0), Arrival::Wait);
    }
}
