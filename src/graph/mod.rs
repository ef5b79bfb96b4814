//! Lazy operation graph.
//!
//! Nodes are stored in an arena indexed by [`NodeId`] and refer to their inputs by id.
//! Since a node can only be added after its inputs, insertion order is a topological order.
mod function;
mod fuse;
mod op;

use crate::error::{Error, Result};
use crate::prelude::*;
use crate::types::{ChunkCoords, Chunking, DataType, NodeId, Shape};
use smallvec::SmallVec;
use stratus_core::util::Counter;

pub use self::function::*;
pub use self::fuse::{optimize, FusedExpr};
pub use self::op::{OpKind, Operation};
pub(crate) use self::op::chunk_bytes;

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) op: Operation,
    pub(crate) inputs: SmallVec<[NodeId; 2]>,
    pub(crate) required: Vec<Chunking>,
    pub(crate) shape: Shape,
    pub(crate) dtype: DataType,
    pub(crate) chunking: Chunking,
    pub(crate) projected_mem: u64,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Name of the store array this node materializes to.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> &Operation {
        &self.op
    }

    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Chunking at which each input is read. Differs from the input's own chunking only
    /// when chunks were unified.
    pub fn required_chunking(&self) -> &[Chunking] {
        &self.required
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

    /// Bytes a single task of this node is projected to need.
    pub fn projected_mem(&self) -> u64 {
        self.projected_mem
    }

    pub fn num_tasks(&self) -> u64 {
        match self.kind() {
            OpKind::Source => 0,
            OpKind::Rechunk if self.required[0] == self.chunking => 0,
            _ => self.chunking.num_chunks(),
        }
    }

    /// Number of times input `index` is read by one task. Above one only for fused nodes
    /// whose expression refers to the same input more than once.
    pub fn input_uses(&self, index: usize) -> usize {
        match &self.op {
            Operation::Fused { expr } => expr.count_input(index),
            _ => 1,
        }
    }

    /// Input chunks read by the task that produces output chunk `coords`, per input.
    pub fn input_chunks(&self, coords: &[u64]) -> Vec<Vec<ChunkCoords>> {
        self.op.input_chunks(&self.required, &self.chunking, coords)
    }
}

/// Parameters of [`Graph::add_node`] that are not derived from the inputs.
#[derive(Clone, Debug, Default)]
pub struct NodeParams {
    pub chunking: Option<Chunking>,
    pub dtype: Option<DataType>,
    pub name: Option<String>,
    pub unify_chunks: bool,
}

impl NodeParams {
    pub fn new() -> Self {
        default()
    }

    pub fn with_chunking(mut self, chunking: Chunking) -> Self {
        self.chunking = Some(chunking);
        self
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Read every input at the chunking of the first input, rechunking where needed.
    pub fn unify_chunks(mut self) -> Self {
        self.unify_chunks = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Graph {
    pub(crate) nodes: IndexMap<NodeId, Node>,
    outputs: IndexSet<NodeId>,
    next_id: u64,
    task_overhead: u64,
}

impl Graph {
    /// Empty graph. `task_overhead` bytes are added to the projected memory of every task.
    /// The executor recomputes projections with the overhead of its run configuration, see
    /// [`Graph::with_task_overhead`].
    pub fn new(task_overhead: u64) -> Self {
        Self {
            nodes: default(),
            outputs: default(),
            next_id: 1,
            task_overhead,
        }
    }

    pub fn task_overhead(&self) -> u64 {
        self.task_overhead
    }

    /// The same graph with every projection recomputed for `task_overhead` bytes per task.
    pub fn with_task_overhead(&self, task_overhead: u64) -> Graph {
        let mut result = self.clone();
        result.task_overhead = task_overhead;

        for node in result.nodes.values_mut() {
            let input_dtypes = node
                .inputs
                .iter()
                .map(|id| self.nodes[id].dtype)
                .collect_vec();
            let layout = op::Layout {
                shape: node.shape.clone(),
                dtype: node.dtype,
                chunking: node.chunking.clone(),
                required: node.required.clone(),
            };

            node.projected_mem = op::projected_mem(&node.op, &layout, &input_dtypes, task_overhead);
        }

        result
    }

    /// Adds a node applying `op` to `inputs` and returns its id.
    ///
    /// Fails with [`Error::IncompatibleShapes`] when blockwise inputs differ in shape, or in
    /// chunking without `params.unify_chunks`.
    pub fn add_node(&mut self, op: Operation, inputs: &[NodeId], params: NodeParams) -> Result<NodeId> {
        let input_nodes = inputs.iter().map(|&id| self.get(id)).collect::<Result<Vec<_>>>()?;
        let layout = op::derive_layout(&op, &input_nodes, &params)?;
        let input_dtypes = input_nodes.iter().map(|n| n.dtype).collect_vec();
        let projected_mem = op::projected_mem(&op, &layout, &input_dtypes, self.task_overhead);

        let id = NodeId((&mut self.next_id).get_and_increment());
        let name = match (&op, params.name) {
            (Operation::Source { array }, _) => array.clone(),
            (_, Some(name)) => name,
            (_, None) => id.array_name(),
        };

        trace!(
            "adding {} = {} of {:?} (chunks {}, {} bytes per task)",
            id,
            op.label(),
            inputs,
            layout.chunking,
            projected_mem
        );

        self.nodes.insert(
            id,
            Node {
                id,
                name,
                op,
                inputs: inputs.into(),
                required: layout.required,
                shape: layout.shape,
                dtype: layout.dtype,
                chunking: layout.chunking,
                projected_mem,
            },
        );

        Ok(id)
    }

    /// Adds an array that already exists in the store under `array`.
    pub fn add_source(&mut self, array: &str, chunking: Chunking, dtype: DataType) -> Result<NodeId> {
        self.add_node(
            Operation::source(array),
            &[],
            NodeParams::new().with_chunking(chunking).with_dtype(dtype),
        )
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(&id).ok_or(Error::UnknownNode(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes.values()
    }

    pub fn topological_order(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// How often the output of every node is read, counting every reference inside a
    /// fused expression separately.
    pub fn consumer_counts(&self) -> HashMap<NodeId, usize> {
        let mut counts = HashMap::default();
        for node in self.nodes.values() {
            counts.entry(node.id).or_insert(0);

            for (index, &input) in enumerate(&node.inputs) {
                *counts.entry(input).or_insert(0) += node.input_uses(index);
            }
        }
        counts
    }

    /// Marks `id` as requested output: the optimizer never fuses it away.
    pub fn mark_output(&mut self, id: NodeId) -> Result {
        self.get(id)?;
        self.outputs.insert(id);
        Ok(())
    }

    pub fn outputs(&self) -> &IndexSet<NodeId> {
        &self.outputs
    }

    /// The nodes `targets` depend on, with `targets` as the outputs.
    pub fn subgraph(&self, targets: &[NodeId]) -> Result<Graph> {
        let mut needed = HashSet::default();
        let mut stack = vec![];

        for &id in targets {
            self.get(id)?;
            stack.push(id);
        }

        while let Some(id) = stack.pop() {
            if needed.insert(id) {
                stack.extend(self.nodes[&id].inputs.iter().copied());
            }
        }

        let nodes = self
            .nodes
            .iter()
            .filter(|(id, _)| needed.contains(*id))
            .map(|(&id, node)| (id, node.clone()))
            .collect();

        Ok(Graph {
            nodes,
            outputs: targets.iter().copied().collect(),
            next_id: self.next_id,
            task_overhead: self.task_overhead,
        })
    }
}
