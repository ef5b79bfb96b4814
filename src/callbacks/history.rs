use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{Callback, ComputeSummary, TaskRecord};
use crate::driver::ExecutionPlan;
use crate::prelude::*;
use crate::types::NodeId;

/// Static description of one planned node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanRow {
    pub node: NodeId,
    pub array: String,
    pub op: String,
    pub projected_mem: u64,
    pub num_tasks: u64,
}

/// Observed memory of the tasks of one planned node compared to its projection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeUtilization {
    pub node: NodeId,
    pub array: String,
    pub projected_mem: u64,
    pub reserved_mem: u64,
    pub peak_mem_start_max: u64,
    pub peak_mem_end_max: u64,
    pub num_attempts: usize,
    pub utilization: f64,
}

#[derive(Debug, Default)]
struct History {
    plan: Vec<PlanRow>,
    records: Vec<TaskRecord>,
    summary: Option<ComputeSummary>,
}

/// Keeps the plan and every task record of the runs it observes.
#[derive(Debug, Default)]
pub struct HistoryCallback {
    inner: Mutex<History>,
}

impl HistoryCallback {
    pub fn new() -> Self {
        default()
    }

    pub fn plan(&self) -> Vec<PlanRow> {
        self.inner.lock().plan.clone()
    }

    pub fn records(&self) -> Vec<TaskRecord> {
        self.inner.lock().records.clone()
    }

    pub fn summary(&self) -> Option<ComputeSummary> {
        self.inner.lock().summary.clone()
    }

    /// Per planned node with tasks: the highest peak memory of its tasks and the resulting
    /// utilization `peak / (projected + reserved)`.
    pub fn analyze(&self, reserved_mem: u64) -> Vec<NodeUtilization> {
        let history = self.inner.lock();
        let mut result = vec![];

        for row in &history.plan {
            let records = history
                .records
                .iter()
                .filter(|r| r.array == row.array)
                .collect_vec();

            if records.is_empty() {
                continue;
            }

            let peak_mem_start_max = records.iter().map(|r| r.peak_mem_start).max().unwrap_or(0);
            let peak_mem_end_max = records.iter().map(|r| r.peak_mem_end).max().unwrap_or(0);
            let budget = row.projected_mem + reserved_mem;

            result.push(NodeUtilization {
                node: row.node,
                array: row.array.clone(),
                projected_mem: row.projected_mem,
                reserved_mem,
                peak_mem_start_max,
                peak_mem_end_max,
                num_attempts: records.len(),
                utilization: if budget > 0 {
                    peak_mem_end_max as f64 / budget as f64
                } else {
                    0.0
                },
            });
        }

        result
    }

    /// Writes `plan.json` and `stats.json` into `dir` and returns their paths.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<(PathBuf, PathBuf)> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {:?}", dir))?;

        let history = self.inner.lock();
        let plan_path = dir.join("plan.json");
        let stats_path = dir.join("stats.json");

        let file = File::create(&plan_path)
            .with_context(|| format!("failed to create {:?}", plan_path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &history.plan)?;
        writer.flush()?;

        let file = File::create(&stats_path)
            .with_context(|| format!("failed to create {:?}", stats_path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &history.records)?;
        writer.flush()?;

        Ok((plan_path, stats_path))
    }
}

impl Callback for HistoryCallback {
    fn on_compute_start(&self, plan: &ExecutionPlan) {
        let mut history = self.inner.lock();

        history.plan = plan
            .nodes()
            .iter()
            .map(|node| PlanRow {
                node: node.id(),
                array: node.name().to_string(),
                op: node.label(),
                projected_mem: node.projected_mem(),
                num_tasks: node.num_tasks(),
            })
            .collect();
        history.records.clear();
        history.summary = None;
    }

    fn on_task_end(&self, record: &TaskRecord) {
        self.inner.lock().records.push(record.clone());
    }

    fn on_compute_end(&self, summary: &ComputeSummary) {
        self.inner.lock().summary = Some(summary.clone());
    }
}
