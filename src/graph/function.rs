//! Per-chunk functions that blockwise nodes apply.
use crate::prelude::*;
use crate::types::{BinaryOp, Block, DataType, HasDataType, UnaryOp};
use std::fmt::{self, Debug};
use std::sync::Arc;
use stratus_core::with_data_type;

/// Describes the output chunk a [`BlockFunction`] is asked to produce.
#[derive(Debug, Clone, Copy)]
pub struct BlockContext<'a> {
    pub coords: &'a [u64],
    pub offset: &'a [u64],
    pub shape: &'a [u64],
    pub array_shape: &'a [u64],
    pub dtype: DataType,
}

/// Function that computes one output chunk from the corresponding chunks of its inputs.
///
/// Implementations must be deterministic: a task may run more than once and every
/// attempt must write the same block.
pub trait BlockFunction: Debug + Send + Sync {
    fn name(&self) -> &str;

    fn arity(&self) -> usize;

    /// Data type of the output given the data types of the inputs.
    fn output_dtype(&self, inputs: &[DataType]) -> Result<DataType> {
        match inputs.first() {
            Some(&dtype) => Ok(dtype),
            None => bail!("{} has no inputs to derive a data type from", self.name()),
        }
    }

    fn apply(&self, ctx: &BlockContext<'_>, inputs: &[&Block]) -> Result<Block>;
}

#[derive(Debug)]
pub struct Unary(pub UnaryOp);

impl BlockFunction for Unary {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn arity(&self) -> usize {
        1
    }

    fn apply(&self, _ctx: &BlockContext<'_>, inputs: &[&Block]) -> Result<Block> {
        Ok(inputs[0].map_unary(self.0))
    }
}

#[derive(Debug)]
pub struct Binary(pub BinaryOp);

impl BlockFunction for Binary {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn arity(&self) -> usize {
        2
    }

    fn output_dtype(&self, inputs: &[DataType]) -> Result<DataType> {
        match inputs {
            [a, b] if a == b => Ok(*a),
            [a, b] => bail!("{} of {} and {} requires an explicit cast", self.name(), a, b),
            _ => bail!("{} expects two inputs", self.name()),
        }
    }

    fn apply(&self, _ctx: &BlockContext<'_>, inputs: &[&Block]) -> Result<Block> {
        Ok(inputs[0].zip_binary(inputs[1], self.0)?)
    }
}

#[derive(Debug)]
pub struct AsType(pub DataType);

impl BlockFunction for AsType {
    fn name(&self) -> &str {
        "astype"
    }

    fn arity(&self) -> usize {
        1
    }

    fn output_dtype(&self, _inputs: &[DataType]) -> Result<DataType> {
        Ok(self.0)
    }

    fn apply(&self, _ctx: &BlockContext<'_>, inputs: &[&Block]) -> Result<Block> {
        Ok(inputs[0].cast(self.0))
    }
}

/// Multiplies every element by a constant.
#[derive(Debug)]
pub struct Scale(pub f64);

impl BlockFunction for Scale {
    fn name(&self) -> &str {
        "scale"
    }

    fn arity(&self) -> usize {
        1
    }

    fn apply(&self, _ctx: &BlockContext<'_>, inputs: &[&Block]) -> Result<Block> {
        let input = inputs[0];
        let factor = Block::full(input.dtype(), input.shape(), self.0);
        Ok(input.zip_binary(&factor, BinaryOp::Multiply)?)
    }
}

/// Generator: every element equals `value`.
#[derive(Debug)]
pub struct Full {
    pub dtype: DataType,
    pub value: f64,
}

impl BlockFunction for Full {
    fn name(&self) -> &str {
        "full"
    }

    fn arity(&self) -> usize {
        0
    }

    fn output_dtype(&self, _inputs: &[DataType]) -> Result<DataType> {
        Ok(self.dtype)
    }

    fn apply(&self, ctx: &BlockContext<'_>, _inputs: &[&Block]) -> Result<Block> {
        Ok(Block::full(self.dtype, ctx.shape, self.value))
    }
}

/// Generator: every element equals its row-major position in the whole array.
#[derive(Debug)]
pub struct Arange {
    pub dtype: DataType,
}

impl BlockFunction for Arange {
    fn name(&self) -> &str {
        "arange"
    }

    fn arity(&self) -> usize {
        0
    }

    fn output_dtype(&self, _inputs: &[DataType]) -> Result<DataType> {
        Ok(self.dtype)
    }

    fn apply(&self, ctx: &BlockContext<'_>, _inputs: &[&Block]) -> Result<Block> {
        let array_shape = ctx.array_shape;
        let offset = ctx.offset;
        let linear = |index: &[u64]| {
            let mut result = 0u64;
            for axis in 0..index.len() {
                result = result * array_shape[axis] + offset[axis] + index[axis];
            }
            result as f64
        };

        Ok(with_data_type!(self.dtype, T => {
            Block::from_fn::<T, _>(ctx.shape, |index| T::from_f64(linear(index)))
        }))
    }
}

type BlockFn = dyn Fn(&BlockContext<'_>, &[&Block]) -> Result<Block> + Send + Sync;

/// User supplied block function backed by a closure.
pub struct FnBlock {
    name: String,
    arity: usize,
    dtype: Option<DataType>,
    fun: Box<BlockFn>,
}

impl FnBlock {
    pub fn new<F>(name: &str, arity: usize, fun: F) -> Self
    where
        F: Fn(&BlockContext<'_>, &[&Block]) -> Result<Block> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            arity,
            dtype: None,
            fun: Box::new(fun),
        }
    }

    /// Fixes the output data type instead of inheriting it from the first input.
    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn into_arc(self) -> Arc<dyn BlockFunction> {
        Arc::new(self)
    }
}

impl Debug for FnBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnBlock")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

impl BlockFunction for FnBlock {
    fn name(&self) -> &str {
        &self.name
    }

    fn arity(&self) -> usize {
        self.arity
    }

    fn output_dtype(&self, inputs: &[DataType]) -> Result<DataType> {
        match (self.dtype, inputs.first()) {
            (Some(dtype), _) | (None, Some(&dtype)) => Ok(dtype),
            (None, None) => bail!("{} must declare its output data type", self.name),
        }
    }

    fn apply(&self, ctx: &BlockContext<'_>, inputs: &[&Block]) -> Result<Block> {
        (self.fun)(ctx, inputs)
    }
}
