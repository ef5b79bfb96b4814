//! Executors: run a batch of independent tasks and report how each of them went.
//!
//! The scheduler is written once against the [`Executor`] trait. An executor only sees task
//! indices; what a task does is decided by the runner function of the batch.
mod executor;
mod meter;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

pub use self::executor::{BackupPolicy, SequentialExecutor, ThreadPoolExecutor};
pub use self::meter::{Footprint, MemoryMeter, Tracked};
use crate::prelude::*;

/// Runs attempt `attempt` (starting at 1) of task `index`.
pub type TaskFn<'a> = dyn Fn(usize, u32) -> Result + Sync + 'a;

/// Tasks submitted to an executor as a unit. Tasks are independent and may run in any
/// order or concurrently.
pub struct TaskBatch<'a> {
    pub num_tasks: usize,
    pub retries: u32,
    pub cancel: &'a CancelToken,
    runner: &'a TaskFn<'a>,
}

impl<'a> TaskBatch<'a> {
    pub fn new(num_tasks: usize, retries: u32, cancel: &'a CancelToken, runner: &'a TaskFn<'a>) -> Self {
        Self {
            num_tasks,
            retries,
            cancel,
            runner,
        }
    }

    pub fn run(&self, index: usize, attempt: u32) -> Result {
        (self.runner)(index, attempt)
    }
}

#[derive(Debug)]
pub enum TaskStatus {
    Completed,
    /// Last error after all attempts were used up.
    Failed(Error),
    /// Never (re)started because the batch was cancelled.
    Cancelled,
}

#[derive(Debug)]
pub struct TaskOutcome {
    pub index: usize,
    pub attempts: u32,
    pub status: TaskStatus,
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self.status, TaskStatus::Completed)
    }
}

pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    /// Memory every task occupies before its body does anything, e.g. the runtime of a
    /// worker process.
    fn reserved_mem(&self) -> u64 {
        0
    }

    /// Runs every task of `batch` and returns one outcome per task, ordered by index.
    fn submit_batch(&self, batch: &TaskBatch<'_>) -> Vec<TaskOutcome>;
}

/// Stops tasks from starting once cancelled or once the deadline has passed.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn deadline_passed(&self) -> bool {
        matches!(self.deadline, Some(deadline) if Instant::now() >= deadline)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.deadline_passed()
    }
}

/// Runs task `index` of `batch` until it succeeds, the attempts are used up or the batch
/// is cancelled.
pub fn run_with_retries(batch: &TaskBatch<'_>, index: usize) -> TaskOutcome {
    let mut attempts = 0;

    loop {
        if batch.cancel.is_cancelled() {
            return TaskOutcome {
                index,
                attempts,
                status: TaskStatus::Cancelled,
            };
        }

        attempts += 1;
        let status = match batch.run(index, attempts) {
            Ok(()) => TaskStatus::Completed,
            Err(e) if attempts <= batch.retries => {
                warn!("task {} failed on attempt {}, retrying: {:#}", index, attempts, e);
                continue;
            }
            Err(e) => TaskStatus::Failed(e),
        };

        return TaskOutcome {
            index,
            attempts,
            status,
        };
    }
}

/// Peak memory of a task that does nothing, as seen by the tasks of `executor`.
pub fn measure_reserved_memory(executor: &dyn Executor) -> u64 {
    let peak = AtomicU64::new(0);
    let cancel = CancelToken::new();
    let runner = |_index: usize, _attempt: u32| -> Result {
        let meter = MemoryMeter::new(executor.reserved_mem());
        peak.fetch_max(meter.peak(), Ordering::SeqCst);
        Ok(())
    };

    executor.submit_batch(&TaskBatch::new(1, 0, &cancel, &runner));
    peak.load(Ordering::SeqCst)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_retries() {
        let calls = AtomicUsize::new(0);
        let cancel = CancelToken::new();
        let runner = |_: usize, attempt: u32| -> Result {
            calls.fetch_add(1, Ordering::SeqCst);
            if attempt < 3 {
                bail!("attempt {} failed", attempt);
            }
            Ok(())
        };

        let outcome = run_with_retries(&TaskBatch::new(1, 2, &cancel, &runner), 0);
        assert!(outcome.is_completed());
        assert_eq!(outcome.attempts, 3);

        let outcome = run_with_retries(&TaskBatch::new(1, 1, &cancel, &runner), 0);
        assert!(matches!(outcome.status, TaskStatus::Failed(_)));
        assert_eq!(outcome.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_cancel() {
        let cancel = CancelToken::with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(cancel.is_cancelled());

        let runner = |_: usize, _: u32| -> Result { panic!("must not run") };
        let outcome = run_with_retries(&TaskBatch::new(1, 2, &cancel, &runner), 0);
        assert!(matches!(outcome.status, TaskStatus::Cancelled));
        assert_eq!(outcome.attempts, 0);

        let cancel = CancelToken::new();
        assert!(!cancel.is_cancelled());
        cancel.cancel();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_reserved_memory() {
        assert_eq!(measure_reserved_memory(&SequentialExecutor::new()), 0);
        assert_eq!(
            measure_reserved_memory(&SequentialExecutor::new().with_reserved_mem(1000)),
            1000
        );
    }
}
