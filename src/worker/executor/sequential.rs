use crate::worker::{run_with_retries, Executor, TaskBatch, TaskOutcome, TaskStatus};

/// Runs the tasks of a batch one after another on the calling thread. Stops at the first
/// task that fails; the remaining tasks are reported as cancelled.
#[derive(Debug, Default)]
pub struct SequentialExecutor {
    reserved_mem: u64,
}

impl SequentialExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reserved_mem(mut self, reserved_mem: u64) -> Self {
        self.reserved_mem = reserved_mem;
        self
    }
}

impl Executor for SequentialExecutor {
    fn name(&self) -> &str {
        "sequential"
    }

    fn reserved_mem(&self) -> u64 {
        self.reserved_mem
    }

    fn submit_batch(&self, batch: &TaskBatch<'_>) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::with_capacity(batch.num_tasks);
        let mut failed = false;

        for index in 0..batch.num_tasks {
            if failed {
                outcomes.push(TaskOutcome {
                    index,
                    attempts: 0,
                    status: TaskStatus::Cancelled,
                });
                continue;
            }

            let outcome = run_with_retries(batch, index);
            failed = matches!(outcome.status, TaskStatus::Failed(_));
            outcomes.push(outcome);
        }

        outcomes
    }
}
