//! Catalog of primitive operations.
//!
//! For every operation kind this module defines how the output layout follows from the
//! inputs, how much memory a single task needs, and which input chunks a task reads.
use crate::error::{Error, Result};
use crate::graph::function::BlockFunction;
use crate::graph::fuse::FusedExpr;
use crate::graph::{Node, NodeParams};
use crate::prelude::*;
use crate::types::{ChunkCoords, Chunking, DataType, Reduction, Shape};
use stratus_core::util::div_ceil;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Source,
    Map,
    Elementwise,
    Fused,
    Rechunk,
    Reduce,
}

impl OpKind {
    /// Blockwise kinds map output chunk `c` to chunk `c` of every input and can be fused.
    pub fn is_blockwise(self) -> bool {
        matches!(self, OpKind::Map | OpKind::Elementwise | OpKind::Fused)
    }

    pub fn name(self) -> &'static str {
        match self {
            OpKind::Source => "source",
            OpKind::Map => "map",
            OpKind::Elementwise => "elementwise",
            OpKind::Fused => "fused",
            OpKind::Rechunk => "rechunk",
            OpKind::Reduce => "reduce",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug)]
pub enum Operation {
    /// Array that already exists in the store.
    Source { array: String },
    Blockwise { function: Arc<dyn BlockFunction> },
    Fused { expr: Arc<FusedExpr> },
    Rechunk,
    /// Combines groups of `split_every` chunks along `axis` into one output chunk of
    /// length one along that axis.
    Reduce {
        axis: usize,
        reduction: Reduction,
        split_every: usize,
    },
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        use Operation::*;
        match (self, other) {
            (Source { array: a }, Source { array: b }) => a == b,
            (Blockwise { function: a }, Blockwise { function: b }) => same_object(a, b),
            (Fused { expr: a }, Fused { expr: b }) => Arc::ptr_eq(a, b) || a == b,
            (Rechunk, Rechunk) => true,
            (
                Reduce {
                    axis: a0,
                    reduction: a1,
                    split_every: a2,
                },
                Reduce {
                    axis: b0,
                    reduction: b1,
                    split_every: b2,
                },
            ) => (a0, a1, a2) == (b0, b1, b2),
            _ => false,
        }
    }
}

pub(crate) fn same_object(a: &Arc<dyn BlockFunction>, b: &Arc<dyn BlockFunction>) -> bool {
    Arc::as_ptr(a) as *const u8 == Arc::as_ptr(b) as *const u8
}

impl Operation {
    pub fn source(array: &str) -> Self {
        Operation::Source {
            array: array.to_string(),
        }
    }

    pub fn blockwise(function: Arc<dyn BlockFunction>) -> Self {
        Operation::Blockwise { function }
    }

    pub fn reduce(axis: usize, reduction: Reduction, split_every: usize) -> Self {
        Operation::Reduce {
            axis,
            reduction,
            split_every,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Source { .. } => OpKind::Source,
            Operation::Blockwise { function } if function.arity() >= 2 => OpKind::Elementwise,
            Operation::Blockwise { .. } => OpKind::Map,
            Operation::Fused { .. } => OpKind::Fused,
            Operation::Rechunk => OpKind::Rechunk,
            Operation::Reduce { .. } => OpKind::Reduce,
        }
    }

    /// Short human readable description, for logs and traces.
    pub fn label(&self) -> String {
        match self {
            Operation::Source { array } => format!("source({})", array),
            Operation::Blockwise { function } => function.name().to_string(),
            Operation::Fused { expr } => format!("fused[{}]", expr),
            Operation::Rechunk => "rechunk".to_string(),
            Operation::Reduce {
                axis, reduction, ..
            } => format!("{}(axis={})", reduction, axis),
        }
    }

    fn expected_arity(&self) -> Option<usize> {
        match self {
            Operation::Source { .. } => Some(0),
            Operation::Blockwise { function } => Some(function.arity()),
            Operation::Fused { .. } => None,
            Operation::Rechunk | Operation::Reduce { .. } => Some(1),
        }
    }

    /// Input chunks the task for output chunk `coords` reads, per input. `required` holds
    /// the chunking every input is read at.
    pub fn input_chunks(
        &self,
        required: &[Chunking],
        output: &Chunking,
        coords: &[u64],
    ) -> Vec<Vec<ChunkCoords>> {
        match self {
            Operation::Source { .. } => vec![],
            Operation::Blockwise { .. } | Operation::Fused { .. } => {
                required.iter().map(|_| vec![coords.into()]).collect()
            }
            Operation::Rechunk => {
                let region = output.chunk_region(coords);
                vec![required[0].overlapping_chunks(&region).collect()]
            }
            Operation::Reduce {
                axis, split_every, ..
            } => {
                let input = &required[0];
                let n = input.num_chunks_along(*axis);
                let start = coords[*axis] * *split_every as u64;
                let end = min(start + *split_every as u64, n);

                let chunks = (start..end)
                    .map(|i| {
                        let mut c: ChunkCoords = coords.into();
                        c[*axis] = i;
                        c
                    })
                    .collect();
                vec![chunks]
            }
        }
    }
}

/// Output layout of a node plus the chunking each input must be read at.
#[derive(Debug, Clone)]
pub(crate) struct Layout {
    pub shape: Shape,
    pub dtype: DataType,
    pub chunking: Chunking,
    pub required: Vec<Chunking>,
}

pub(crate) fn chunk_bytes(chunking: &Chunking, dtype: DataType) -> u64 {
    chunking
        .max_chunk_elements()
        .saturating_mul(dtype.size_in_bytes() as u64)
}

fn describe_shape(shape: &[u64]) -> String {
    format!("({})", shape.iter().join(", "))
}

/// Derives the output layout of `op` applied to `inputs`.
pub(crate) fn derive_layout(op: &Operation, inputs: &[&Node], params: &NodeParams) -> Result<Layout> {
    if let Some(arity) = op.expected_arity() {
        if arity != inputs.len() {
            return Err(Error::InvalidOperation(format!(
                "{} expects {} input(s), found {}",
                op.label(),
                arity,
                inputs.len()
            )));
        }
    }

    match op {
        Operation::Source { .. } => {
            let (chunking, dtype) = match (&params.chunking, params.dtype) {
                (Some(c), Some(d)) => (c.clone(), d),
                _ => {
                    return Err(Error::InvalidOperation(
                        "a source requires both a chunking and a data type".into(),
                    ))
                }
            };

            Ok(Layout {
                shape: chunking.shape(),
                dtype,
                chunking,
                required: vec![],
            })
        }
        Operation::Blockwise { function } => {
            let dtypes = inputs.iter().map(|n| n.dtype).collect_vec();
            let dtype = function
                .output_dtype(&dtypes)
                .map_err(|e| Error::InvalidOperation(format!("{:#}", e)))?;

            if inputs.is_empty() {
                let chunking = params.chunking.clone().ok_or_else(|| {
                    Error::InvalidOperation(format!("{} requires an output chunking", op.label()))
                })?;

                return Ok(Layout {
                    shape: chunking.shape(),
                    dtype,
                    chunking,
                    required: vec![],
                });
            }

            let first = inputs[0];
            for other in &inputs[1..] {
                if other.shape != first.shape {
                    return Err(Error::IncompatibleShapes(format!(
                        "{} of arrays with shapes {} and {}",
                        op.label(),
                        describe_shape(&first.shape),
                        describe_shape(&other.shape),
                    )));
                }

                if other.chunking != first.chunking && !params.unify_chunks {
                    return Err(Error::IncompatibleShapes(format!(
                        "{} of arrays with chunks {} and {} (unify_chunks was not requested)",
                        op.label(),
                        first.chunking,
                        other.chunking,
                    )));
                }
            }

            if let Some(chunking) = &params.chunking {
                if *chunking != first.chunking {
                    return Err(Error::IncompatibleShapes(format!(
                        "{} cannot change chunks from {} to {}; add a rechunk",
                        op.label(),
                        first.chunking,
                        chunking,
                    )));
                }
            }

            Ok(Layout {
                shape: first.shape.clone(),
                dtype,
                chunking: first.chunking.clone(),
                required: vec![first.chunking.clone(); inputs.len()],
            })
        }
        Operation::Fused { .. } => Err(Error::InvalidOperation(
            "fused nodes are only created by the optimizer".into(),
        )),
        Operation::Rechunk => {
            let input = inputs[0];
            let chunking = params.chunking.clone().ok_or_else(|| {
                Error::InvalidOperation("rechunk requires a target chunking".into())
            })?;

            if chunking.shape() != input.shape {
                return Err(Error::IncompatibleShapes(format!(
                    "cannot rechunk array of shape {} to chunks {}",
                    describe_shape(&input.shape),
                    chunking,
                )));
            }

            Ok(Layout {
                shape: input.shape.clone(),
                dtype: input.dtype,
                chunking,
                required: vec![input.chunking.clone()],
            })
        }
        Operation::Reduce {
            axis, split_every, ..
        } => {
            let input = inputs[0];
            if *axis >= input.shape.len() {
                return Err(Error::InvalidOperation(format!(
                    "axis {} out of range for array of shape {}",
                    axis,
                    describe_shape(&input.shape)
                )));
            }
            if *split_every < 2 {
                return Err(Error::InvalidOperation(
                    "a reduction must combine at least two chunks per round".into(),
                ));
            }
            if input.shape[*axis] == 0 {
                return Err(Error::InvalidOperation(format!(
                    "cannot reduce axis {} of length zero",
                    axis
                )));
            }

            let groups = div_ceil(input.chunking.num_chunks_along(*axis), *split_every as u64);
            let chunking = input
                .chunking
                .with_axis(*axis, groups, vec![1; groups as usize])?;

            Ok(Layout {
                shape: chunking.shape(),
                dtype: input.dtype,
                chunking,
                required: vec![input.chunking.clone()],
            })
        }
    }
}

/// Bytes a single task of `op` needs, including `overhead`.
pub(crate) fn projected_mem(
    op: &Operation,
    layout: &Layout,
    input_dtypes: &[DataType],
    overhead: u64,
) -> u64 {
    let output = chunk_bytes(&layout.chunking, layout.dtype);
    let inputs: SmallVec<[u64; 4]> = zip(&layout.required, input_dtypes)
        .map(|(c, &d)| chunk_bytes(c, d))
        .collect();

    let bytes = match op {
        Operation::Source { .. } => return 0,
        Operation::Blockwise { .. } => inputs.iter().sum::<u64>() + output,
        Operation::Fused { expr } => {
            expr.peak_bytes(input_dtypes, layout.chunking.max_chunk_elements())
        }
        Operation::Rechunk => {
            if layout.required[0] == layout.chunking {
                return 0;
            }
            inputs[0] + output
        }
        Operation::Reduce { .. } => inputs[0] + 2 * output,
    };

    bytes.saturating_add(overhead)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::function::{Binary, Unary};
    use crate::graph::Graph;
    use crate::types::{BinaryOp, UnaryOp, DTYPE_F64, DTYPE_U8};

    fn graph_with_source(shape: &[u64], chunks: &[u64]) -> (Graph, crate::types::NodeId) {
        let mut graph = Graph::new(100);
        let chunking = Chunking::regular(shape, chunks).unwrap();
        let id = graph.add_source("a", chunking, DTYPE_F64).unwrap();
        (graph, id)
    }

    #[test]
    fn test_arity() {
        let (mut graph, a) = graph_with_source(&[100], &[10]);
        let add = Operation::blockwise(Arc::new(Binary(BinaryOp::Add)));

        let err = graph.add_node(add, &[a], default()).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));

        let err = graph
            .add_node(Operation::Rechunk, &[a, a], NodeParams::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_projection() {
        let (mut graph, a) = graph_with_source(&[100], &[10]);
        let neg = Operation::blockwise(Arc::new(Unary(UnaryOp::Negative)));
        let b = graph.add_node(neg, &[a], default()).unwrap();

        // input chunk + output chunk + overhead
        assert_eq!(graph.get(b).unwrap().projected_mem(), 80 + 80 + 100);
        assert_eq!(graph.get(b).unwrap().kind(), OpKind::Map);

        let add = Operation::blockwise(Arc::new(Binary(BinaryOp::Add)));
        let c = graph.add_node(add, &[a, b], default()).unwrap();
        assert_eq!(graph.get(c).unwrap().projected_mem(), 3 * 80 + 100);
        assert_eq!(graph.get(c).unwrap().kind(), OpKind::Elementwise);

        assert_eq!(graph.get(a).unwrap().projected_mem(), 0);
    }

    #[test]
    fn test_reduce_layout() {
        let (mut graph, a) = graph_with_source(&[100, 6], &[10, 3]);
        let sum = graph
            .add_node(Operation::reduce(0, Reduction::Sum, 4), &[a], default())
            .unwrap();

        let node = graph.get(sum).unwrap();
        assert_eq!(&node.shape()[..], &[3, 6]);
        assert_eq!(node.chunking().chunk_sizes(0), vec![1, 1, 1]);
        assert_eq!(node.chunking().chunk_sizes(1), vec![3, 3]);
        assert_eq!(node.projected_mem(), 240 + 2 * 24 + 100);

        let reads = node.input_chunks(&[2, 1]);
        assert_eq!(reads[0].len(), 2);
        assert_eq!(&reads[0][0][..], &[8, 1]);
        assert_eq!(&reads[0][1][..], &[9, 1]);

        let err = graph
            .add_node(Operation::reduce(2, Reduction::Sum, 4), &[a], default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));

        let (mut graph, empty) = graph_with_source(&[0, 6], &[1, 3]);
        let err = graph
            .add_node(Operation::reduce(0, Reduction::Sum, 4), &[empty], default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));

        let rows = graph
            .add_node(Operation::reduce(1, Reduction::Sum, 4), &[empty], default())
            .unwrap();
        assert_eq!(&graph.get(rows).unwrap().shape()[..], &[0, 1]);
        assert_eq!(graph.get(rows).unwrap().num_tasks(), 0);
    }

    #[test]
    fn test_rechunk_layout() {
        let (mut graph, a) = graph_with_source(&[40000], &[1000]);
        let target = Chunking::regular(&[40000], &[999]).unwrap();
        let b = graph
            .add_node(
                Operation::Rechunk,
                &[a],
                NodeParams::new().with_chunking(target.clone()),
            )
            .unwrap();

        let node = graph.get(b).unwrap();
        assert_eq!(node.chunking(), &target);
        assert_eq!(node.projected_mem(), 8000 + 7992 + 100);

        let reads = node.input_chunks(&[1]);
        assert_eq!(reads[0].len(), 2);

        let wrong = Chunking::regular(&[40001], &[999]).unwrap();
        let err = graph
            .add_node(Operation::Rechunk, &[a], NodeParams::new().with_chunking(wrong))
            .unwrap_err();
        assert!(matches!(err, Error::IncompatibleShapes(_)));
    }

    #[test]
    fn test_mixed_dtypes() {
        let mut graph = Graph::new(0);
        let chunking = Chunking::regular(&[10], &[5]).unwrap();
        let a = graph.add_source("a", chunking.clone(), DTYPE_F64).unwrap();
        let b = graph.add_source("b", chunking, DTYPE_U8).unwrap();

        let add = Operation::blockwise(Arc::new(Binary(BinaryOp::Add)));
        let err = graph.add_node(add, &[a, b], default()).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }
}
