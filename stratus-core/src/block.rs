//! In-memory chunk payloads and the per-element kernels that operate on them.

use crate::chunking::{GridIter, Shape};
use crate::data_type::{DataType, HasDataType};
use crate::prelude::*;
use crate::reduction::Reduction;
use crate::util::product;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("shape {shape:?} requires {expected} elements, found {found}")]
    LengthMismatch {
        shape: Shape,
        expected: u64,
        found: u64,
    },

    #[error("data type mismatch: expected {expected}, found {found}")]
    DataTypeMismatch { expected: DataType, found: DataType },

    #[error("shape mismatch: {left:?} and {right:?}")]
    ShapeMismatch { left: Shape, right: Shape },

    #[error("region at {offset:?} with extents {extents:?} exceeds block of shape {shape:?}")]
    OutOfBounds {
        offset: Shape,
        extents: Shape,
        shape: Shape,
    },

    #[error("axis {axis} out of range for {ndim}-dimensional block")]
    InvalidAxis { axis: usize, ndim: usize },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Negative,
    Absolute,
    Square,
}

impl UnaryOp {
    pub fn name(&self) -> &'static str {
        match self {
            UnaryOp::Negative => "negative",
            UnaryOp::Absolute => "abs",
            UnaryOp::Square => "square",
        }
    }

    #[inline]
    fn apply<T: HasDataType>(&self, x: T) -> T {
        match self {
            UnaryOp::Negative => x.neg_elem(),
            UnaryOp::Absolute => x.abs_elem(),
            UnaryOp::Square => x.mul_elem(x),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Maximum,
    Minimum,
}

impl BinaryOp {
    pub fn name(&self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Subtract => "subtract",
            BinaryOp::Multiply => "multiply",
            BinaryOp::Maximum => "maximum",
            BinaryOp::Minimum => "minimum",
        }
    }

    #[inline]
    fn apply<T: HasDataType>(&self, x: T, y: T) -> T {
        match self {
            BinaryOp::Add => x.add_elem(y),
            BinaryOp::Subtract => x.sub_elem(y),
            BinaryOp::Multiply => x.mul_elem(y),
            BinaryOp::Maximum => x.max_elem(y),
            BinaryOp::Minimum => x.min_elem(y),
        }
    }
}

/// Dense row-major chunk of elements stored in little-endian byte order.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    dtype: DataType,
    shape: Shape,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

impl Block {
    pub fn zeros(dtype: DataType, shape: &[u64]) -> Self {
        let len = product(shape) as usize * dtype.size_in_bytes();

        Self {
            dtype,
            shape: shape.into(),
            data: vec![0; len],
        }
    }

    /// Block where every element equals `value` converted to `dtype`.
    pub fn full(dtype: DataType, shape: &[u64], value: f64) -> Self {
        crate::with_data_type!(dtype, T => {
            let value = T::from_f64(value);
            Self::from_fn::<T, _>(shape, |_| value)
        })
    }

    /// Block where each element is computed from its index within the block.
    pub fn from_fn<T, F>(shape: &[u64], mut fun: F) -> Self
    where
        T: HasDataType,
        F: FnMut(&[u64]) -> T,
    {
        let mut block = Self::zeros(T::data_type(), shape);
        let size = block.dtype.size_in_bytes();
        let ranges = shape.iter().map(|&n| 0..n).collect();

        for (i, index) in enumerate(GridIter::new(ranges)) {
            fun(&index).write_le_slice(&mut block.data[i * size..]);
        }

        block
    }

    pub fn from_values<T: HasDataType>(shape: &[u64], values: &[T]) -> Result<Self, BlockError> {
        let expected = product(shape);
        if expected != values.len() as u64 {
            return Err(BlockError::LengthMismatch {
                shape: shape.into(),
                expected,
                found: values.len() as u64,
            });
        }

        let size = T::data_type().size_in_bytes();
        let mut data = vec![0; values.len() * size];
        for (i, &v) in enumerate(values) {
            v.write_le_slice(&mut data[i * size..]);
        }

        Ok(Self {
            dtype: T::data_type(),
            shape: shape.into(),
            data,
        })
    }

    pub fn to_values<T: HasDataType>(&self) -> Result<Vec<T>, BlockError> {
        self.expect_dtype(T::data_type())?;
        Ok((0..self.num_elements() as usize).map(|i| self.get(i)).collect())
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> u64 {
        product(&self.shape)
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    fn get<T: HasDataType>(&self, index: usize) -> T {
        let size = self.dtype.size_in_bytes();
        T::from_le_slice(&self.data[index * size..])
    }

    #[inline]
    fn set<T: HasDataType>(&mut self, index: usize, value: T) {
        let size = self.dtype.size_in_bytes();
        value.write_le_slice(&mut self.data[index * size..]);
    }

    fn expect_dtype(&self, expected: DataType) -> Result<(), BlockError> {
        if self.dtype != expected {
            return Err(BlockError::DataTypeMismatch {
                expected,
                found: self.dtype,
            });
        }
        Ok(())
    }

    fn expect_shape(&self, other: &Block) -> Result<(), BlockError> {
        if self.shape != other.shape {
            return Err(BlockError::ShapeMismatch {
                left: self.shape.clone(),
                right: other.shape.clone(),
            });
        }
        Ok(())
    }

    fn check_region(&self, offset: &[u64], extents: &[u64]) -> Result<(), BlockError> {
        let fits = offset.len() == self.ndim()
            && extents.len() == self.ndim()
            && (0..self.ndim()).all(|i| offset[i] + extents[i] <= self.shape[i]);

        if !fits {
            return Err(BlockError::OutOfBounds {
                offset: offset.into(),
                extents: extents.into(),
                shape: self.shape.clone(),
            });
        }
        Ok(())
    }

    /// Copies the box of `extents` at `src_offset` in `src` to `dst_offset` in `self`.
    pub fn copy_region(
        &mut self,
        dst_offset: &[u64],
        src: &Block,
        src_offset: &[u64],
        extents: &[u64],
    ) -> Result<(), BlockError> {
        self.expect_dtype(src.dtype)?;
        self.check_region(dst_offset, extents)?;
        src.check_region(src_offset, extents)?;

        let ndim = self.ndim();
        let size = self.dtype.size_in_bytes();
        if ndim == 0 {
            self.data[..size].copy_from_slice(&src.data[..size]);
            return Ok(());
        }
        if extents.contains(&0) {
            return Ok(());
        }

        let dst_strides = strides(&self.shape);
        let src_strides = strides(&src.shape);
        let row = extents[ndim - 1] as usize * size;
        let outer = extents[..ndim - 1].iter().map(|&n| 0..n).collect();

        for index in GridIter::new(outer) {
            let mut dst = dst_offset[ndim - 1];
            let mut src_pos = src_offset[ndim - 1];
            for axis in 0..ndim - 1 {
                dst += (dst_offset[axis] + index[axis]) * dst_strides[axis];
                src_pos += (src_offset[axis] + index[axis]) * src_strides[axis];
            }

            let (dst, src_pos) = (dst as usize * size, src_pos as usize * size);
            self.data[dst..dst + row].copy_from_slice(&src.data[src_pos..src_pos + row]);
        }

        Ok(())
    }

    pub fn map_unary(&self, op: UnaryOp) -> Block {
        let mut output = Block::zeros(self.dtype, &self.shape);

        crate::with_data_type!(self.dtype, T => {
            for i in 0..self.num_elements() as usize {
                output.set::<T>(i, op.apply(self.get::<T>(i)));
            }
        });

        output
    }

    pub fn zip_binary(&self, other: &Block, op: BinaryOp) -> Result<Block, BlockError> {
        self.expect_dtype(other.dtype)?;
        self.expect_shape(other)?;
        let mut output = Block::zeros(self.dtype, &self.shape);

        crate::with_data_type!(self.dtype, T => {
            for i in 0..self.num_elements() as usize {
                output.set::<T>(i, op.apply(self.get::<T>(i), other.get::<T>(i)));
            }
        });

        Ok(output)
    }

    /// Converts every element to `dtype`. Values pass through `f64`.
    pub fn cast(&self, dtype: DataType) -> Block {
        if dtype == self.dtype {
            return self.clone();
        }

        let mut output = Block::zeros(dtype, &self.shape);
        crate::with_data_type!(self.dtype, S => {
            crate::with_data_type!(dtype, D => {
                for i in 0..self.num_elements() as usize {
                    output.set::<D>(i, D::from_f64(self.get::<S>(i).to_f64()));
                }
            })
        });

        output
    }

    /// Reduces along `axis`, keeping it as an axis of length one.
    pub fn reduce_axis(&self, axis: usize, reduction: Reduction) -> Result<Block, BlockError> {
        if axis >= self.ndim() {
            return Err(BlockError::InvalidAxis {
                axis,
                ndim: self.ndim(),
            });
        }

        let mut shape = self.shape.clone();
        shape[axis] = 1;
        let mut output = Block::zeros(self.dtype, &shape);

        let outer = product(&self.shape[..axis]) as usize;
        let n = self.shape[axis] as usize;
        let inner = product(&self.shape[axis + 1..]) as usize;

        crate::with_data_type!(self.dtype, T => {
            for o in 0..outer {
                for k in 0..inner {
                    let mut acc: T = reduction.identity();
                    for j in 0..n {
                        acc = reduction.combine(acc, self.get::<T>((o * n + j) * inner + k));
                    }
                    output.set::<T>(o * inner + k, acc);
                }
            }
        });

        Ok(output)
    }

    /// Folds `other` into `self` element by element.
    pub fn combine(&mut self, other: &Block, reduction: Reduction) -> Result<(), BlockError> {
        self.expect_dtype(other.dtype)?;
        self.expect_shape(other)?;

        crate::with_data_type!(self.dtype, T => {
            for i in 0..self.num_elements() as usize {
                let value = reduction.combine(self.get::<T>(i), other.get::<T>(i));
                self.set::<T>(i, value);
            }
        });

        Ok(())
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("dtype", &self.dtype)
            .field("shape", &&self.shape[..])
            .field("bytes", &self.data.len())
            .finish()
    }
}

fn strides(shape: &[u64]) -> SmallVec<[u64; 4]> {
    let mut strides: SmallVec<[u64; 4]> = SmallVec::from_elem(1, shape.len());
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::data_type::*;

    fn arange(shape: &[u64]) -> Block {
        let n = product(shape);
        Block::from_values(shape, &(0..n as i32).collect_vec()).unwrap()
    }

    #[test]
    fn test_from_values() {
        let b = Block::from_values(&[2, 3], &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(b.dtype(), DTYPE_F32);
        assert_eq!(b.size_in_bytes(), 24);
        assert_eq!(b.to_values::<f32>().unwrap()[4], 5.0);
        assert!(b.to_values::<f64>().is_err());

        let err = Block::from_values(&[2, 2], &[1u8]).unwrap_err();
        assert!(matches!(err, BlockError::LengthMismatch { expected: 4, .. }));
    }

    #[test]
    fn test_copy_region() {
        let src = arange(&[4, 5]);
        let mut dst = Block::zeros(DTYPE_I32, &[3, 3]);
        dst.copy_region(&[1, 0], &src, &[2, 3], &[2, 2]).unwrap();

        assert_eq!(
            dst.to_values::<i32>().unwrap(),
            vec![0, 0, 0, 13, 14, 0, 18, 19, 0]
        );

        let err = dst.copy_region(&[2, 2], &src, &[0, 0], &[2, 2]).unwrap_err();
        assert!(matches!(err, BlockError::OutOfBounds { .. }));
    }

    #[test]
    fn test_copy_region_random() {
        use rand::prelude::*;
        let mut rng = SmallRng::seed_from_u64(0);

        for _ in 0..100 {
            let shape = [rng.gen_range(1..6), rng.gen_range(1..6), rng.gen_range(1..6)];
            let src = arange(&shape);
            let extents = [
                rng.gen_range(1..=shape[0]),
                rng.gen_range(1..=shape[1]),
                rng.gen_range(1..=shape[2]),
            ];
            let offset = [
                rng.gen_range(0..=shape[0] - extents[0]),
                rng.gen_range(0..=shape[1] - extents[1]),
                rng.gen_range(0..=shape[2] - extents[2]),
            ];

            let mut dst = Block::zeros(DTYPE_I32, &extents);
            dst.copy_region(&[0, 0, 0], &src, &offset, &extents).unwrap();

            let expected = Block::from_fn::<i32, _>(&extents, |index| {
                let i = (0..3).map(|a| index[a] + offset[a]).collect_vec();
                (i[0] * shape[1] * shape[2] + i[1] * shape[2] + i[2]) as i32
            });
            assert_eq!(dst, expected);
        }
    }

    #[test]
    fn test_kernels() {
        let a = Block::from_values(&[4], &[1i16, -2, 3, -4]).unwrap();
        let b = Block::full(DTYPE_I16, &[4], 2.0);

        let neg = a.map_unary(UnaryOp::Negative);
        assert_eq!(neg.to_values::<i16>().unwrap(), vec![-1, 2, -3, 4]);

        let sum = a.zip_binary(&b, BinaryOp::Add).unwrap();
        assert_eq!(sum.to_values::<i16>().unwrap(), vec![3, 0, 5, -2]);

        let max = a.zip_binary(&b, BinaryOp::Maximum).unwrap();
        assert_eq!(max.to_values::<i16>().unwrap(), vec![2, 2, 3, 2]);

        let c = Block::zeros(DTYPE_I16, &[5]);
        assert!(a.zip_binary(&c, BinaryOp::Add).is_err());

        let f = a.cast(DTYPE_F64);
        assert_eq!(f.to_values::<f64>().unwrap(), vec![1.0, -2.0, 3.0, -4.0]);
    }

    #[test]
    fn test_reduce_axis() {
        let a = arange(&[2, 3]);

        let rows = a.reduce_axis(1, Reduction::Sum).unwrap();
        assert_eq!(rows.shape(), &[2, 1]);
        assert_eq!(rows.to_values::<i32>().unwrap(), vec![3, 12]);

        let cols = a.reduce_axis(0, Reduction::Max).unwrap();
        assert_eq!(cols.shape(), &[1, 3]);
        assert_eq!(cols.to_values::<i32>().unwrap(), vec![3, 4, 5]);

        assert!(a.reduce_axis(2, Reduction::Sum).is_err());

        let mut acc = cols.clone();
        acc.combine(&cols, Reduction::Sum).unwrap();
        assert_eq!(acc.to_values::<i32>().unwrap(), vec![6, 8, 10]);
    }
}
