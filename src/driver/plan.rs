use serde::Serialize;
use std::fmt;

use crate::error::{Error, Result};
use crate::graph::{Graph, OpKind, Operation};
use crate::planner::RechunkPlanner;
use crate::prelude::*;
use crate::types::{ChunkCoords, Chunking, DataType, NodeId, RunConfig, Shape};

/// Location of a materialized array in the store.
#[derive(Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ArrayRef {
    pub name: String,
    pub chunking: Chunking,
    pub dtype: DataType,
}

impl fmt::Debug for ArrayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {}", self.name, self.dtype, self.chunking)
    }
}

/// A node of the execution plan: one batch of tasks that writes one array.
///
/// Graph nodes map to planned nodes one to one, except rechunks which become one planned
/// node per non-trivial stage. All planned nodes derived from a graph node share its id.
#[derive(Debug, Clone)]
pub struct PlannedNode {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) op: Operation,
    pub(crate) inputs: Vec<ArrayRef>,
    pub(crate) shape: Shape,
    pub(crate) dtype: DataType,
    pub(crate) chunking: Chunking,
    pub(crate) projected_mem: u64,
}

impl PlannedNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> &Operation {
        &self.op
    }

    pub fn label(&self) -> String {
        self.op.label()
    }

    /// Arrays read by the tasks, each at the chunking it is read with.
    pub fn inputs(&self) -> &[ArrayRef] {
        &self.inputs
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn chunking(&self) -> &Chunking {
        &self.chunking
    }

    pub fn projected_mem(&self) -> u64 {
        self.projected_mem
    }

    pub fn num_tasks(&self) -> u64 {
        self.chunking.num_chunks()
    }

    pub fn output(&self) -> ArrayRef {
        ArrayRef {
            name: self.name.clone(),
            chunking: self.chunking.clone(),
            dtype: self.dtype,
        }
    }

    /// Chunks of every input read by the task that writes output chunk `coords`.
    pub fn input_chunks(&self, coords: &[u64]) -> Vec<Vec<ChunkCoords>> {
        let required = self.inputs.iter().map(|a| a.chunking.clone()).collect_vec();
        self.op.input_chunks(&required, &self.chunking, coords)
    }
}

/// The planned nodes of a graph in execution order.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    nodes: Vec<PlannedNode>,
    outputs: IndexMap<NodeId, ArrayRef>,
}

impl ExecutionPlan {
    /// Orders the nodes of `graph` and replaces every chunking change by rechunk stages.
    ///
    /// Fails if a rechunk cannot be planned within `config.max_mem`.
    pub fn build(graph: &Graph, config: &RunConfig) -> Result<Self> {
        let mut builder = Builder {
            config,
            nodes: vec![],
            locations: default(),
        };

        for id in graph.topological_order() {
            builder.add(graph, id)?;
        }

        let targets = if graph.outputs().is_empty() {
            let consumers = graph.consumer_counts();
            graph
                .topological_order()
                .into_iter()
                .filter(|id| consumers.get(id).copied().unwrap_or(0) == 0)
                .collect_vec()
        } else {
            graph.outputs().iter().copied().collect_vec()
        };

        let outputs = targets
            .into_iter()
            .map(|id| Ok((id, builder.location(id)?)))
            .collect::<Result<_>>()?;

        Ok(Self {
            nodes: builder.nodes,
            outputs,
        })
    }

    pub fn nodes(&self) -> &[PlannedNode] {
        &self.nodes
    }

    /// Where each requested graph node ends up in the store.
    pub fn outputs(&self) -> &IndexMap<NodeId, ArrayRef> {
        &self.outputs
    }

    pub fn num_tasks(&self) -> u64 {
        self.nodes.iter().map(|n| n.num_tasks()).sum()
    }

    /// Fails with [`Error::MemoryBudgetExceeded`] for the first node whose tasks are
    /// projected to need more than `max_mem` bytes.
    pub fn check_memory(&self, max_mem: u64) -> Result {
        for node in &self.nodes {
            if node.projected_mem > max_mem {
                return Err(Error::MemoryBudgetExceeded {
                    node: node.id,
                    name: node.name.clone(),
                    projected: node.projected_mem,
                    max_mem,
                });
            }
        }

        Ok(())
    }
}

struct Builder<'a> {
    config: &'a RunConfig,
    nodes: Vec<PlannedNode>,
    locations: HashMap<NodeId, ArrayRef>,
}

impl<'a> Builder<'a> {
    fn location(&self, id: NodeId) -> Result<ArrayRef> {
        self.locations
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownNode(id))
    }

    fn add(&mut self, graph: &Graph, id: NodeId) -> Result {
        let node = graph.get(id)?;

        let location = match node.kind() {
            OpKind::Source => ArrayRef {
                name: node.name().to_string(),
                chunking: node.chunking().clone(),
                dtype: node.dtype(),
            },
            OpKind::Rechunk => {
                let input = self.location(node.inputs()[0])?;
                self.rechunk(id, node.name(), input, node.chunking())?
            }
            _ => {
                let mut inputs = vec![];

                for (index, (&input, required)) in
                    enumerate(zip(node.inputs(), node.required_chunking()))
                {
                    let location = self.location(input)?;
                    let name = format!("{}-in{}", node.name(), index);
                    inputs.push(self.rechunk(id, &name, location, required)?);
                }

                let planned = PlannedNode {
                    id,
                    name: node.name().to_string(),
                    op: node.op().clone(),
                    inputs,
                    shape: node.shape().clone(),
                    dtype: node.dtype(),
                    chunking: node.chunking().clone(),
                    projected_mem: node.projected_mem(),
                };

                let location = planned.output();
                self.nodes.push(planned);
                location
            }
        };

        self.locations.insert(id, location);
        Ok(())
    }

    /// Plans the stages that bring `input` to `target` and returns where the result is
    /// stored. The last stage writes the array `name`, earlier stages `<name>-stage<k>`.
    fn rechunk(&mut self, id: NodeId, name: &str, input: ArrayRef, target: &Chunking) -> Result<ArrayRef> {
        if input.chunking == *target {
            return Ok(input);
        }

        // An empty array has no chunks to move.
        if target.num_chunks() == 0 {
            return Ok(ArrayRef {
                name: name.to_string(),
                chunking: target.clone(),
                dtype: input.dtype,
            });
        }

        let item_size = input.dtype.size_in_bytes() as u64;
        let shape = target.shape();
        let planner = RechunkPlanner::from_config(self.config, item_size);
        let stages = planner
            .plan(&shape, &input.chunking, target)?
            .into_iter()
            .filter(|s| !s.is_noop())
            .collect_vec();

        let num_stages = stages.len();
        let mut current = input;

        for (k, stage) in enumerate(stages) {
            let name = if k + 1 == num_stages {
                name.to_string()
            } else {
                format!("{}-stage{}", name, k + 1)
            };

            let planned = PlannedNode {
                id,
                name,
                op: Operation::Rechunk,
                projected_mem: stage.projected_mem(item_size, self.config.task_overhead),
                dtype: current.dtype,
                inputs: vec![current],
                shape: shape.clone(),
                chunking: stage.write,
            };

            current = planned.output();
            self.nodes.push(planned);
        }

        Ok(current)
    }
}
