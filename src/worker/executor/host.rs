use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::prelude::*;
use crate::worker::{run_with_retries, Executor, TaskBatch, TaskOutcome, TaskStatus};

/// When [`ThreadPoolExecutor`] starts a second copy of a task that is still running.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackupPolicy {
    /// Fraction of the batch that must have completed before any backup is started.
    pub min_completed: f64,
    /// A task straggles once it has been running this many times as long as the median
    /// completed task.
    pub slowdown: f64,
    pub poll_interval: Duration,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            min_completed: 0.5,
            slowdown: 3.0,
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl BackupPolicy {
    /// `completed` holds the durations of the completed tasks in ascending order.
    pub fn should_launch(&self, elapsed: Duration, completed: &[Duration], num_tasks: usize) -> bool {
        if completed.is_empty() || (completed.len() as f64) < self.min_completed * num_tasks as f64 {
            return false;
        }

        let median = completed[completed.len() / 2];
        elapsed.as_secs_f64() > self.slowdown * median.as_secs_f64()
    }
}

#[derive(Default)]
struct Slot {
    started: Option<Instant>,
    has_backup: bool,
    outcome: Option<TaskOutcome>,
}

/// Runs the tasks of a batch on a rayon thread pool.
///
/// When a task fails for good, the batch is cancelled: tasks that have not started yet are
/// skipped, running tasks finish their current attempt.
///
/// With a [`BackupPolicy`], a monitor thread watches the running tasks and starts a single
/// backup attempt of every straggler on a thread of its own. The first copy to complete
/// determines the outcome; a failed backup is ignored. Both copies always run to the end
/// before the batch returns.
#[derive(Debug)]
pub struct ThreadPoolExecutor {
    pool: ThreadPool,
    reserved_mem: u64,
    backups: Option<BackupPolicy>,
}

impl ThreadPoolExecutor {
    /// Pool of `num_threads` threads, or one per core if zero.
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .thread_name(|i| format!("stratus-executor-{}", i))
            .num_threads(num_threads)
            .build()
            .context("failed to start executor threads")?;

        debug!("started executor with {} threads", pool.current_num_threads());

        Ok(Self {
            pool,
            reserved_mem: 0,
            backups: None,
        })
    }

    pub fn with_reserved_mem(mut self, reserved_mem: u64) -> Self {
        self.reserved_mem = reserved_mem;
        self
    }

    pub fn with_backups(mut self, policy: BackupPolicy) -> Self {
        self.backups = Some(policy);
        self
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn submit_with_backups(&self, batch: &TaskBatch<'_>, policy: &BackupPolicy) -> Vec<TaskOutcome> {
        let slots = (0..batch.num_tasks)
            .map(|_| Mutex::new(Slot::default()))
            .collect_vec();
        let durations = Mutex::new(vec![]);
        let finished = AtomicBool::new(false);

        let result = crossbeam::scope(|scope| {
            scope.spawn(|scope| {
                while !finished.load(Ordering::SeqCst) {
                    thread::sleep(policy.poll_interval);

                    let mut completed: Vec<Duration> = durations.lock().clone();
                    completed.sort();

                    for (index, slot) in enumerate(&slots) {
                        let mut slot = slot.lock();
                        let elapsed = match slot.started {
                            Some(start) if !slot.has_backup && slot.outcome.is_none() => start.elapsed(),
                            _ => continue,
                        };

                        if !policy.should_launch(elapsed, &completed, batch.num_tasks) {
                            continue;
                        }

                        debug!("task {} has been running for {:?}, starting a backup", index, elapsed);
                        slot.has_backup = true;
                        drop(slot);

                        let slots = &slots;
                        scope.spawn(move |_| run_backup(batch, index, &slots[index]));
                    }
                }
            });

            self.pool.install(|| {
                (0..batch.num_tasks).into_par_iter().for_each(|index| {
                    let start = Instant::now();
                    slots[index].lock().started = Some(start);

                    let outcome = run_with_retries(batch, index);
                    if outcome.is_completed() {
                        durations.lock().push(start.elapsed());
                    }

                    let mut slot = slots[index].lock();
                    if slot.outcome.is_some() {
                        trace!("task {} finished after its backup", index);
                        return;
                    }

                    if let TaskStatus::Failed(_) = outcome.status {
                        batch.cancel.cancel();
                    }
                    slot.outcome = Some(outcome);
                })
            });

            finished.store(true, Ordering::SeqCst);
        });

        if let Err(e) = result {
            panic::resume_unwind(e);
        }

        enumerate(slots)
            .map(|(index, slot)| {
                slot.into_inner().outcome.unwrap_or(TaskOutcome {
                    index,
                    attempts: 0,
                    status: TaskStatus::Cancelled,
                })
            })
            .collect()
    }
}

/// A backup makes a single attempt, numbered after the last attempt of its primary.
fn run_backup(batch: &TaskBatch<'_>, index: usize, slot: &Mutex<Slot>) {
    let attempt = batch.retries + 2;
    let result = batch.run(index, attempt);
    let mut slot = slot.lock();

    match result {
        Ok(()) if slot.outcome.is_none() => {
            debug!("backup of task {} completed first", index);
            slot.outcome = Some(TaskOutcome {
                index,
                attempts: attempt,
                status: TaskStatus::Completed,
            });
        }
        Ok(()) => {}
        Err(e) => warn!("backup of task {} failed: {:#}", index, e),
    }
}

impl Executor for ThreadPoolExecutor {
    fn name(&self) -> &str {
        "threads"
    }

    fn reserved_mem(&self) -> u64 {
        self.reserved_mem
    }

    fn submit_batch(&self, batch: &TaskBatch<'_>) -> Vec<TaskOutcome> {
        if let Some(policy) = &self.backups {
            return self.submit_with_backups(batch, policy);
        }

        self.pool.install(|| {
            (0..batch.num_tasks)
                .into_par_iter()
                .map(|index| {
                    let outcome = run_with_retries(batch, index);
                    if let TaskStatus::Failed(_) = outcome.status {
                        batch.cancel.cancel();
                    }
                    outcome
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::worker::CancelToken;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_thread_pool() {
        let executor = ThreadPoolExecutor::new(4).unwrap();
        assert_eq!(executor.num_threads(), 4);

        let sum = AtomicUsize::new(0);
        let cancel = CancelToken::new();
        let runner = |index: usize, _: u32| -> Result {
            sum.fetch_add(index, Ordering::SeqCst);
            Ok(())
        };

        let outcomes = executor.submit_batch(&TaskBatch::new(100, 0, &cancel, &runner));
        assert_eq!(outcomes.len(), 100);
        assert!(outcomes.iter().all(|o| o.is_completed() && o.attempts == 1));
        assert!(enumerate(&outcomes).all(|(i, o)| o.index == i));
        assert_eq!(sum.load(Ordering::SeqCst), 4950);
    }

    #[test]
    fn test_failure_cancels() {
        let executor = ThreadPoolExecutor::new(1).unwrap();
        let cancel = CancelToken::new();
        let runner = |index: usize, _: u32| -> Result {
            if index == 0 {
                bail!("broken");
            }
            Ok(())
        };

        let outcomes = executor.submit_batch(&TaskBatch::new(10, 1, &cancel, &runner));
        assert!(matches!(outcomes[0].status, TaskStatus::Failed(_)));
        assert_eq!(outcomes[0].attempts, 2);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_backup_policy() {
        let policy = BackupPolicy::default();
        let ms = Duration::from_millis;
        let completed = [ms(10), ms(10), ms(20), ms(30), ms(40)];

        assert!(policy.should_launch(ms(61), &completed, 10));
        assert!(!policy.should_launch(ms(60), &completed, 10));
        assert!(!policy.should_launch(ms(1000), &completed[..4], 10));
        assert!(!policy.should_launch(ms(1000), &[], 0));
    }

    #[test]
    fn test_backups() {
        let policy = BackupPolicy {
            poll_interval: Duration::from_millis(1),
            ..default()
        };
        let executor = ThreadPoolExecutor::new(2).unwrap().with_backups(policy);
        let cancel = CancelToken::new();
        let calls = AtomicUsize::new(0);
        let backup_done = AtomicBool::new(false);

        let runner = |index: usize, attempt: u32| -> Result {
            if index != 0 {
                return Ok(());
            }

            calls.fetch_add(1, Ordering::SeqCst);
            if attempt > 1 {
                backup_done.store(true, Ordering::SeqCst);
                return Ok(());
            }

            // The first copy hangs until the backup has finished, then fails.
            let start = Instant::now();
            while !backup_done.load(Ordering::SeqCst) {
                if start.elapsed() > Duration::from_secs(10) {
                    return Ok(());
                }
                thread::sleep(Duration::from_millis(1));
            }
            bail!("stalled")
        };

        let outcomes = executor.submit_batch(&TaskBatch::new(8, 0, &cancel, &runner));
        assert_eq!(outcomes.len(), 8);
        assert!(outcomes.iter().all(|o| o.is_completed()));
        assert!(enumerate(&outcomes).all(|(i, o)| o.index == i));
        assert_eq!(outcomes[0].attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!cancel.is_cancelled());
    }
}
