//! Fusion of blockwise chains.
//!
//! A blockwise node whose input is produced by another blockwise node (and by nothing
//! else) can compute that input on the fly instead of reading it from the store. The
//! fused task evaluates an expression tree of block functions.
use crate::graph::function::BlockFunction;
use crate::graph::op::{chunk_bytes, same_object, Operation};
use crate::graph::{Graph, Node};
use crate::prelude::*;
use crate::types::{Chunking, DataType, NodeId};
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub enum FusedExpr {
    /// Chunk of the `n`-th input of the fused node.
    Input(usize),
    Apply {
        function: Arc<dyn BlockFunction>,
        dtype: DataType,
        args: Vec<FusedExpr>,
    },
}

impl PartialEq for FusedExpr {
    fn eq(&self, other: &Self) -> bool {
        use FusedExpr::*;
        match (self, other) {
            (Input(a), Input(b)) => a == b,
            (
                Apply {
                    function: f,
                    dtype: d,
                    args: a,
                },
                Apply {
                    function: g,
                    dtype: e,
                    args: b,
                },
            ) => same_object(f, g) && d == e && a == b,
            _ => false,
        }
    }
}

impl FusedExpr {
    /// Expression equivalent to a blockwise or fused node.
    pub(crate) fn from_node(node: &Node) -> Option<FusedExpr> {
        match &node.op {
            Operation::Blockwise { function } => Some(FusedExpr::Apply {
                function: Arc::clone(function),
                dtype: node.dtype,
                args: (0..function.arity()).map(FusedExpr::Input).collect(),
            }),
            Operation::Fused { expr } => Some(FusedExpr::clone(expr)),
            _ => None,
        }
    }

    /// Number of block functions in the expression.
    pub fn num_functions(&self) -> usize {
        match self {
            FusedExpr::Input(_) => 0,
            FusedExpr::Apply { args, .. } => 1 + args.iter().map(|a| a.num_functions()).sum::<usize>(),
        }
    }

    /// Number of times input `index` is read while evaluating the expression.
    pub fn count_input(&self, index: usize) -> usize {
        match self {
            FusedExpr::Input(i) => (*i == index) as usize,
            FusedExpr::Apply { args, .. } => args.iter().map(|a| a.count_input(index)).sum(),
        }
    }

    fn map_inputs(&self, fun: &mut dyn FnMut(usize) -> FusedExpr) -> FusedExpr {
        match self {
            FusedExpr::Input(i) => fun(*i),
            FusedExpr::Apply {
                function,
                dtype,
                args,
            } => FusedExpr::Apply {
                function: Arc::clone(function),
                dtype: *dtype,
                args: args.iter().map(|a| a.map_inputs(fun)).collect(),
            },
        }
    }

    /// Peak bytes held while evaluating the expression for one chunk of `chunk_elements`
    /// elements. Arguments are evaluated left to right and stay alive until the function
    /// consuming them has produced its output.
    pub fn peak_bytes(&self, input_dtypes: &[DataType], chunk_elements: u64) -> u64 {
        self.evaluate_peak(0, input_dtypes, chunk_elements).0
    }

    fn evaluate_peak(&self, held: u64, input_dtypes: &[DataType], elements: u64) -> (u64, u64) {
        match self {
            FusedExpr::Input(i) => {
                let bytes = elements.saturating_mul(input_dtypes[*i].size_in_bytes() as u64);
                (held.saturating_add(bytes), bytes)
            }
            FusedExpr::Apply { dtype, args, .. } => {
                let mut running = held;
                let mut peak = held;

                for arg in args {
                    let (arg_peak, arg_bytes) = arg.evaluate_peak(running, input_dtypes, elements);
                    peak = max(peak, arg_peak);
                    running = running.saturating_add(arg_bytes);
                }

                let output = elements.saturating_mul(dtype.size_in_bytes() as u64);
                (max(peak, running.saturating_add(output)), output)
            }
        }
    }
}

impl fmt::Display for FusedExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FusedExpr::Input(i) => write!(f, "${}", i),
            FusedExpr::Apply { function, args, .. } => {
                write!(f, "{}({})", function.name(), args.iter().join(", "))
            }
        }
    }
}

/// Fuses chains of blockwise nodes as long as a fused task needs at most `max_mem` bytes.
///
/// A producer is absorbed into its consumer when both are blockwise, the producer is read
/// exactly once (counting every reference inside fused expressions, see
/// [`Graph::consumer_counts`]), is not a requested output, and is read at its own chunking.
/// The fused node keeps the consumer's id and name. Applying this function to its own
/// result returns an identical graph.
pub fn optimize(graph: &Graph, max_mem: u64) -> Graph {
    let mut result = graph.clone();
    let mut consumers = result.consumer_counts();

    for id in graph.topological_order() {
        let mut rejected = HashSet::default();

        loop {
            let node = match result.node(id) {
                Some(node) if node.kind().is_blockwise() => node,
                _ => break,
            };

            let candidate = enumerate(&node.inputs).find(|&(index, producer)| {
                !rejected.contains(producer)
                    && is_fusable(&result, node, index, *producer, &consumers)
            });

            let (index, producer) = match candidate {
                Some((index, &producer)) => (index, producer),
                None => break,
            };

            let fused = fuse(&result, &result.nodes[&producer], node, index);
            if fused.projected_mem > max_mem {
                debug!(
                    "not fusing {} into {}: needs {} bytes, limit is {}",
                    producer, id, fused.projected_mem, max_mem
                );
                rejected.insert(producer);
                continue;
            }

            trace!("fusing {} into {}: {}", producer, id, fused.op.label());
            result.nodes.shift_remove(&producer);
            result.nodes.insert(id, fused);
            consumers = result.consumer_counts();

            // A larger node changes the memory estimate of every earlier rejection.
            rejected.clear();
        }
    }

    result
}

fn is_fusable(
    graph: &Graph,
    consumer: &Node,
    index: usize,
    producer: NodeId,
    consumers: &HashMap<NodeId, usize>,
) -> bool {
    let node = match graph.node(producer) {
        Some(node) => node,
        None => return false,
    };

    node.kind().is_blockwise()
        && consumers.get(&producer).copied().unwrap_or(0) == 1
        && !graph.outputs().contains(&producer)
        && consumer.required[index] == node.chunking
}

/// Replaces input `index` of `consumer` by the computation of `producer`.
fn fuse(graph: &Graph, producer: &Node, consumer: &Node, index: usize) -> Node {
    let producer_expr = FusedExpr::from_node(producer).expect("producer is blockwise");
    let consumer_expr = FusedExpr::from_node(consumer).expect("consumer is blockwise");

    let mut inputs: Vec<NodeId> = vec![];
    let mut required: Vec<Chunking> = vec![];
    let mut position = |id: NodeId, chunking: &Chunking| -> usize {
        match (0..inputs.len()).find(|&i| inputs[i] == id && required[i] == *chunking) {
            Some(i) => i,
            None => {
                inputs.push(id);
                required.push(chunking.clone());
                inputs.len() - 1
            }
        }
    };

    let mut mapping = vec![];
    for (i, (&input, chunking)) in enumerate(zip(&consumer.inputs, &consumer.required)) {
        mapping.push(if i == index {
            None
        } else {
            Some(position(input, chunking))
        });
    }

    let producer_mapping = zip(&producer.inputs, &producer.required)
        .map(|(&input, chunking)| position(input, chunking))
        .collect_vec();

    let inlined = producer_expr.map_inputs(&mut |k| FusedExpr::Input(producer_mapping[k]));
    let expr = consumer_expr.map_inputs(&mut |j| match mapping[j] {
        Some(i) => FusedExpr::Input(i),
        None => inlined.clone(),
    });

    let input_dtypes = inputs
        .iter()
        .map(|id| graph.nodes[id].dtype)
        .collect_vec();
    let projected_mem = expr
        .peak_bytes(&input_dtypes, consumer.chunking.max_chunk_elements())
        .saturating_add(graph.task_overhead());

    debug_assert!(projected_mem >= chunk_bytes(&consumer.chunking, consumer.dtype));

    Node {
        id: consumer.id,
        name: consumer.name.clone(),
        op: Operation::Fused {
            expr: Arc::new(expr),
        },
        inputs: inputs.into_iter().collect(),
        required,
        shape: consumer.shape.clone(),
        dtype: consumer.dtype,
        chunking: consumer.chunking.clone(),
        projected_mem,
    }
}
