//! Run statistics and callbacks.
//!
//! Every task attempt reports a [`TaskRecord`] through the run's [`StatsChannel`]. The
//! scheduler drains the channel after each batch and hands the records to the registered
//! [`Callback`]s.
mod history;

use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub use self::history::{HistoryCallback, NodeUtilization, PlanRow};
use crate::driver::{ExecutionPlan, PlannedNode};
use crate::types::{ChunkCoords, NodeId};

/// One attempt of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub node: NodeId,
    pub array: String,
    pub chunk: ChunkCoords,
    pub attempt: u32,
    /// Offsets from the start of the run.
    pub start: Duration,
    pub end: Duration,
    /// Peak memory of the task attempt before and after its body ran.
    pub peak_mem_start: u64,
    pub peak_mem_end: u64,
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeSummary {
    pub num_nodes: usize,
    pub num_tasks: u64,
    pub num_attempts: usize,
    pub elapsed: Duration,
    pub error: Option<String>,
}

/// Observes a run. All methods have empty default implementations.
pub trait Callback: Send + Sync {
    fn on_compute_start(&self, _plan: &ExecutionPlan) {}

    fn on_node_start(&self, _node: &PlannedNode) {}

    fn on_task_end(&self, _record: &TaskRecord) {}

    fn on_node_end(&self, _node: &PlannedNode) {}

    fn on_compute_end(&self, _summary: &ComputeSummary) {}
}

/// Collects task records of a single run.
#[derive(Debug)]
pub struct StatsChannel {
    sender: StatsSender,
    receiver: Receiver<TaskRecord>,
}

impl StatsChannel {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();

        Self {
            sender: StatsSender {
                sender,
                start: Instant::now(),
            },
            receiver,
        }
    }

    pub fn sender(&self) -> &StatsSender {
        &self.sender
    }

    /// Records that arrived since the last call.
    pub fn drain(&self) -> Vec<TaskRecord> {
        self.receiver.try_iter().collect()
    }
}

impl Default for StatsChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StatsSender {
    sender: Sender<TaskRecord>,
    start: Instant,
}

impl StatsSender {
    /// Time since the channel was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn send(&self, record: TaskRecord) {
        // The receiver lives as long as the channel, so this cannot fail.
        let _ = self.sender.send(record);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    fn record(attempt: u32) -> TaskRecord {
        TaskRecord {
            node: NodeId(1),
            array: "array-001".into(),
            chunk: ChunkCoords::from_slice(&[attempt as u64]),
            attempt,
            start: Duration::from_millis(1),
            end: Duration::from_millis(2),
            peak_mem_start: 10,
            peak_mem_end: 20,
            error: None,
        }
    }

    #[test]
    fn test_channel() {
        let channel = StatsChannel::new();
        assert!(channel.drain().is_empty());

        let handles = (0..4)
            .map(|i| {
                let sender = channel.sender().clone();
                thread::spawn(move || sender.send(record(i)))
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        let records = channel.drain();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.succeeded()));
        assert!(channel.drain().is_empty());
    }
}
