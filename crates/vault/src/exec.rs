//! Worker pool and cooperative cancellation
//!
//! One task per item for both backup and restore, running on a bounded
//! rayon pool. Cancellation is cooperative: queued tasks that have not
//! started yet are discarded, in-flight tasks are never interrupted
//! mid-call.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Default worker pool width.
pub const DEFAULT_WORKERS: usize = 5;

/// Cancellation token shared between the engine, the worker pool and the
/// remote client. The process boundary (signal handler, test harness)
/// calls [`CancelToken::cancel`]; everything else only polls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared per-pass error counter. Incremented by failing tasks, read only
/// after the barrier.
#[derive(Debug, Default)]
pub struct ErrorCounter(AtomicUsize);

impl ErrorCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sleep for `duration`, polling the cancellation token on a short
/// interval. Returns `false` if cancellation fired before the sleep
/// completed.
pub fn sleep_cancellable(duration: Duration, cancel: &CancelToken) -> bool {
    let step = Duration::from_millis(100);
    let start = Instant::now();
    // re-check the remaining time instead of reusing the loop condition's
    // measurement; the thread may get descheduled in between
    while let Some(remaining) = duration.checked_sub(start.elapsed()) {
        if remaining.is_zero() {
            break;
        }
        if cancel.is_cancelled() {
            return false;
        }
        std::thread::sleep(step.min(remaining));
    }
    !cancel.is_cancelled()
}

/// Bounded worker pool for per-item reconciliation tasks.
pub struct TaskPool {
    pool: rayon::ThreadPool,
}

impl TaskPool {
    pub fn new(workers: usize) -> Result<Self> {
        let workers = if workers == 0 { DEFAULT_WORKERS } else { workers };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .context("Failed to build worker pool")?;
        Ok(Self { pool })
    }

    /// Run `task` once per item and wait for all of them (the barrier).
    ///
    /// Tasks that have not started when cancellation fires return without
    /// running. Returns `false` when the pass was cancelled; completed
    /// item writes remain, they are individually safe versions.
    pub fn run_all<T, F>(&self, items: Vec<T>, cancel: &CancelToken, task: F) -> bool
    where
        T: Send,
        F: Fn(T) + Send + Sync,
    {
        self.pool.scope(|scope| {
            for item in items {
                let task = &task;
                scope.spawn(move |_| {
                    if cancel.is_cancelled() {
                        return;
                    }
                    task(item);
                });
            }
        });
        !cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_run_all_runs_every_task() {
        let pool = TaskPool::new(3).unwrap();
        let seen = Mutex::new(Vec::new());
        let cancel = CancelToken::new();

        let done = pool.run_all((0..20).collect(), &cancel, |i| {
            seen.lock().unwrap().push(i);
        });

        assert!(done);
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_cancellation_discards_queued_tasks() {
        let pool = TaskPool::new(1).unwrap();
        let cancel = CancelToken::new();
        let ran = AtomicUsize::new(0);

        let done = pool.run_all((0..50).collect::<Vec<i32>>(), &cancel, |_| {
            if ran.fetch_add(1, Ordering::SeqCst) == 0 {
                cancel.cancel();
            }
        });

        assert!(!done);
        assert!(ran.load(Ordering::SeqCst) < 50);
    }

    #[test]
    fn test_sleep_cancellable_interrupts() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let start = Instant::now();
        assert!(!sleep_cancellable(Duration::from_secs(5), &cancel));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_sleep_cancellable_completes() {
        let cancel = CancelToken::new();
        assert!(sleep_cancellable(Duration::from_millis(10), &cancel));
    }

    #[test]
    fn test_sleep_cancellable_handles_elapsed_overshoot() {
        let cancel = CancelToken::new();
        // zero and sub-step durations end up with elapsed >= remaining
        // almost immediately; neither may underflow
        assert!(sleep_cancellable(Duration::ZERO, &cancel));
        assert!(sleep_cancellable(Duration::from_nanos(1), &cancel));
        assert!(sleep_cancellable(Duration::from_millis(1), &cancel));
    }

    #[test]
    fn test_error_counter() {
        let errors = ErrorCounter::new();
        assert_eq!(errors.get(), 0);
        errors.increment();
        errors.increment();
        assert_eq!(errors.get(), 2);
    }
}
