use serde_json::{json, Value as Json};
use std::fs::File;
use std::io::Write;
use std::path::Path;

use super::plan::{ArrayRef, ExecutionPlan, PlannedNode};
use crate::prelude::*;

/// Writes execution plans as JSON, one plan per line.
#[derive(Debug)]
pub(super) struct PlanTrace {
    file: File,
}

impl PlanTrace {
    pub(super) fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("writing trace to: {:?}", path);

        Ok(Self {
            file: File::create(path).with_context(|| format!("failed to create {:?}", path))?,
        })
    }

    pub(super) fn add(&mut self, plan: &ExecutionPlan) {
        let result = self.convert_plan(plan);

        if let Err(e) = serde_json::to_writer(&self.file, &result) {
            warn!("writing trace failed: {}", e);
        }

        let _ = self.file.write(&[b'\n']);
    }

    fn convert_plan(&self, plan: &ExecutionPlan) -> Json {
        json!({
            "nodes": plan.nodes().iter().map(|n| self.process_node(n)).collect_vec(),
            "outputs": plan
                .outputs()
                .iter()
                .map(|(id, array)| json!({ "node": id.get(), "array": self.process_array(array) }))
                .collect_vec(),
            "num_tasks": plan.num_tasks(),
        })
    }

    fn process_node(&self, node: &PlannedNode) -> Json {
        json!({
            "node": node.id().get(),
            "array": node.name(),
            "kind": node.op().kind().name(),
            "op": node.label(),
            "inputs": node.inputs().iter().map(|a| self.process_array(a)).collect_vec(),
            "shape": &node.shape()[..],
            "dtype": node.dtype().name(),
            "chunks": node.chunking().to_string(),
            "projected_mem": node.projected_mem(),
            "num_tasks": node.num_tasks(),
        })
    }

    fn process_array(&self, array: &ArrayRef) -> Json {
        json!({
            "name": array.name,
            "dtype": array.dtype.name(),
            "chunks": array.chunking.to_string(),
        })
    }
}
