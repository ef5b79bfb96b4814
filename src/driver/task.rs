//! Task bodies: what the task writing one output chunk of a planned node does.
use super::plan::PlannedNode;
use crate::graph::{BlockContext, BlockFunction, FusedExpr, Operation};
use crate::prelude::*;
use crate::store::Store;
use crate::types::{Block, ChunkCoords, DataType, NodeId, Reduction, Shape};
use crate::worker::{MemoryMeter, Tracked};

/// One output chunk of one planned node, plus the input chunks it reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub node: NodeId,
    pub chunk: ChunkCoords,
    pub inputs: Vec<Vec<ChunkCoords>>,
}

impl PlannedNode {
    /// One task per output chunk, in row-major order.
    pub fn tasks(&self) -> Vec<Task> {
        self.chunking
            .chunk_coords()
            .map(|chunk| Task {
                node: self.id,
                inputs: self.input_chunks(&chunk),
                chunk,
            })
            .collect()
    }
}

struct Env<'a> {
    node: &'a PlannedNode,
    task: &'a Task,
    store: &'a dyn Store,
    meter: &'a MemoryMeter,
    offset: Shape,
    shape: Shape,
}

impl<'a> Env<'a> {
    fn context(&self, dtype: DataType) -> BlockContext<'_> {
        BlockContext {
            coords: &self.task.chunk,
            offset: &self.offset,
            shape: &self.shape,
            array_shape: &self.node.shape,
            dtype,
        }
    }

    fn read(&self, input: usize, chunk: &[u64]) -> Result<Tracked<'a, Block>> {
        let array = &self.node.inputs[input];
        let block = self
            .store
            .read(&array.name, chunk)
            .with_context(|| format!("failed to read chunk {:?} of {}", chunk, array.name))?;

        Ok(self.meter.track(block))
    }

    fn apply(
        &self,
        function: &dyn BlockFunction,
        dtype: DataType,
        args: &[Tracked<'a, Block>],
    ) -> Result<Tracked<'a, Block>> {
        let blocks = args.iter().map(|b| &**b).collect_vec();
        let output = function.apply(&self.context(dtype), &blocks)?;

        if output.shape() != &*self.shape || output.dtype() != dtype {
            bail!(
                "{} returned a {} block of shape {:?}, expected {} of shape {:?}",
                function.name(),
                output.dtype(),
                output.shape(),
                dtype,
                &*self.shape
            );
        }

        Ok(self.meter.track(output))
    }

    /// Evaluates arguments left to right and keeps them until `function` has run, the
    /// order assumed by `FusedExpr::peak_bytes`.
    fn evaluate(&self, expr: &FusedExpr) -> Result<Tracked<'a, Block>> {
        match expr {
            FusedExpr::Input(i) => self.read(*i, &self.task.inputs[*i][0]),
            FusedExpr::Apply {
                function,
                dtype,
                args,
            } => {
                let args = args
                    .iter()
                    .map(|arg| self.evaluate(arg))
                    .collect::<Result<Vec<_>>>()?;

                self.apply(&**function, *dtype, &args)
            }
        }
    }

    fn write(&self, block: &Block) -> Result {
        self.store
            .write(&self.node.name, &self.task.chunk, block)
            .with_context(|| format!("failed to write chunk {:?} of {}", self.task.chunk, self.node.name))?;

        Ok(())
    }
}

/// Computes and stores the output chunk of `task`. Every block the task holds is charged
/// to `meter`.
pub(crate) fn run_task(
    node: &PlannedNode,
    task: &Task,
    store: &dyn Store,
    meter: &MemoryMeter,
) -> Result {
    let env = Env {
        node,
        task,
        store,
        meter,
        offset: node.chunking.chunk_offset(&task.chunk),
        shape: node.chunking.chunk_shape(&task.chunk),
    };

    match &node.op {
        Operation::Blockwise { function } => {
            let args = (0..node.inputs.len())
                .map(|i| env.read(i, &task.inputs[i][0]))
                .collect::<Result<Vec<_>>>()?;

            let output = env.apply(&**function, node.dtype, &args)?;
            env.write(&output)
        }
        Operation::Fused { expr } => {
            let output = env.evaluate(expr)?;
            env.write(&output)
        }
        Operation::Rechunk => regrid(&env),
        Operation::Reduce {
            axis, reduction, ..
        } => reduce(&env, *axis, *reduction),
        Operation::Source { array } => {
            bail!("source array {} does not have any tasks", array)
        }
    }
}

/// Assembles the output chunk from the overlapping input chunks, holding at most one of
/// them at a time.
fn regrid(env: &Env<'_>) -> Result {
    let input = &env.node.inputs[0];
    let mut output = env.meter.track(Block::zeros(env.node.dtype, &env.shape));
    let region = env.node.chunking.chunk_region(&env.task.chunk);

    for chunk in &env.task.inputs[0] {
        let block = env.read(0, chunk)?;
        let piece = match input.chunking.chunk_region(chunk).intersection(&region) {
            Some(piece) => piece,
            None => continue,
        };

        let src_offset = zip(&piece.offset, &input.chunking.chunk_offset(chunk))
            .map(|(&p, &o)| p - o)
            .collect::<Shape>();
        let dst_offset = zip(&piece.offset, &region.offset)
            .map(|(&p, &o)| p - o)
            .collect::<Shape>();

        output.copy_region(&dst_offset, &block, &src_offset, &piece.extents)?;
    }

    env.write(&output)
}

/// Folds the input chunks of one group along `axis`. Holds the accumulator, one input
/// chunk and its partial result.
fn reduce(env: &Env<'_>, axis: usize, reduction: Reduction) -> Result {
    let mut acc: Option<Tracked<'_, Block>> = None;

    for chunk in &env.task.inputs[0] {
        let block = env.read(0, chunk)?;
        let partial = env.meter.track(block.reduce_axis(axis, reduction)?);
        drop(block);

        acc = Some(match acc.take() {
            Some(mut acc) => {
                acc.combine(&partial, reduction)?;
                acc
            }
            None => partial,
        });
    }

    match acc {
        Some(acc) => env.write(&acc),
        None => bail!("reduction task {:?} has no input chunks", env.task.chunk),
    }
}
