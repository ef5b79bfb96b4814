//! Chunk layouts: how an n-dimensional array is cut into rectangular chunks.

use crate::prelude::*;
use crate::util::product;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::ops::Range;

pub type Shape = SmallVec<[u64; 4]>;
pub type ChunkCoords = SmallVec<[u64; 4]>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkingError {
    #[error("expected {expected} dimensions, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("axis {axis} has zero extent")]
    ZeroExtent { axis: usize },

    #[error("axis {axis} contains a zero-sized chunk")]
    ZeroChunk { axis: usize },

    #[error("chunks along axis {axis} sum to {sum}, expected {extent}")]
    NotAPartition { axis: usize, extent: u64, sum: u64 },
}

/// Per-axis chunk boundaries of an array.
///
/// Chunks along an axis may have different sizes, but they always partition the extent of
/// that axis exactly. The chunk grid is the cartesian product of the per-axis partitions.
/// An axis of zero extent has no chunks, so neither does the grid.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunking {
    // For every axis: `0 = b[0] < b[1] < ... < b[n] = extent`, or just `[0]` if the extent
    // is zero.
    bounds: Vec<Vec<u64>>,
}

impl Chunking {
    /// Regular chunking where every chunk has `chunk_shape`, except possibly the last chunk
    /// along each axis. Chunk sizes larger than the extent are clamped. A chunk size of zero
    /// is only accepted along an axis of zero extent.
    pub fn regular(shape: &[u64], chunk_shape: &[u64]) -> Result<Self, ChunkingError> {
        if shape.len() != chunk_shape.len() {
            return Err(ChunkingError::DimensionMismatch {
                expected: shape.len(),
                found: chunk_shape.len(),
            });
        }

        let mut bounds = Vec::with_capacity(shape.len());
        for (axis, (&extent, &size)) in enumerate(zip(shape, chunk_shape)) {
            if extent == 0 {
                bounds.push(vec![0]);
                continue;
            }
            if size == 0 {
                return Err(ChunkingError::ZeroChunk { axis });
            }

            let mut axis_bounds = (0..extent).step_by(size as usize).collect_vec();
            axis_bounds.push(extent);
            bounds.push(axis_bounds);
        }

        Ok(Self { bounds })
    }

    /// Chunking from explicit per-axis chunk sizes.
    pub fn from_sizes(shape: &[u64], sizes: Vec<Vec<u64>>) -> Result<Self, ChunkingError> {
        if shape.len() != sizes.len() {
            return Err(ChunkingError::DimensionMismatch {
                expected: shape.len(),
                found: sizes.len(),
            });
        }

        let mut bounds = Vec::with_capacity(shape.len());
        for (axis, (&extent, axis_sizes)) in enumerate(zip(shape, sizes)) {
            let mut axis_bounds = Vec::with_capacity(axis_sizes.len() + 1);
            let mut offset = 0u64;
            axis_bounds.push(0);

            for size in axis_sizes {
                if size == 0 {
                    return Err(ChunkingError::ZeroChunk { axis });
                }
                offset = offset.saturating_add(size);
                axis_bounds.push(offset);
            }

            if offset != extent {
                return Err(ChunkingError::NotAPartition {
                    axis,
                    extent,
                    sum: offset,
                });
            }

            bounds.push(axis_bounds);
        }

        Ok(Self { bounds })
    }

    /// Chunking that consists of exactly one chunk covering the whole array.
    pub fn single(shape: &[u64]) -> Result<Self, ChunkingError> {
        Self::regular(shape, shape)
    }

    pub fn ndim(&self) -> usize {
        self.bounds.len()
    }

    pub fn shape(&self) -> Shape {
        self.bounds.iter().map(|b| b[b.len() - 1]).collect()
    }

    pub fn extent(&self, axis: usize) -> u64 {
        let b = &self.bounds[axis];
        b[b.len() - 1]
    }

    /// Chunk boundaries along `axis`, including `0` and the extent.
    pub fn boundaries(&self, axis: usize) -> &[u64] {
        &self.bounds[axis]
    }

    pub fn chunk_sizes(&self, axis: usize) -> Vec<u64> {
        self.bounds[axis].windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn num_chunks_along(&self, axis: usize) -> u64 {
        (self.bounds[axis].len() - 1) as u64
    }

    /// Number of chunks along each axis.
    pub fn grid_shape(&self) -> Shape {
        (0..self.ndim()).map(|i| self.num_chunks_along(i)).collect()
    }

    pub fn num_chunks(&self) -> u64 {
        product(&self.grid_shape())
    }

    /// Per-axis maximum chunk size. Since the grid is a cartesian product, a chunk of this
    /// shape exists.
    pub fn max_chunk_shape(&self) -> Shape {
        (0..self.ndim())
            .map(|axis| {
                self.bounds[axis]
                    .windows(2)
                    .map(|w| w[1] - w[0])
                    .max()
                    .unwrap_or(0)
            })
            .collect()
    }

    pub fn max_chunk_elements(&self) -> u64 {
        product(&self.max_chunk_shape())
    }

    pub fn chunk_offset(&self, coords: &[u64]) -> Shape {
        zip(&self.bounds, coords)
            .map(|(b, &c)| b[c as usize])
            .collect()
    }

    pub fn chunk_shape(&self, coords: &[u64]) -> Shape {
        zip(&self.bounds, coords)
            .map(|(b, &c)| b[c as usize + 1] - b[c as usize])
            .collect()
    }

    pub fn chunk_region(&self, coords: &[u64]) -> Region {
        Region {
            offset: self.chunk_offset(coords),
            extents: self.chunk_shape(coords),
        }
    }

    /// Indices of the chunks along `axis` that intersect the half-open interval `[lo, hi)`.
    pub fn overlapping(&self, axis: usize, lo: u64, hi: u64) -> Range<u64> {
        let b = &self.bounds[axis];
        let n = b.len() - 1;
        if lo >= hi {
            return 0..0;
        }

        let start = b[1..].partition_point(|&x| x <= lo);
        let end = min(b.partition_point(|&x| x < hi), n);
        (start as u64)..(max(start, end) as u64)
    }

    /// Coordinates of all chunks that intersect `region`, in row-major order.
    pub fn overlapping_chunks(&self, region: &Region) -> GridIter {
        let ranges = (0..self.ndim())
            .map(|axis| self.overlapping(axis, region.offset[axis], region.end(axis)))
            .collect();
        GridIter::new(ranges)
    }

    /// Coordinates of all chunks in row-major order.
    pub fn chunk_coords(&self) -> GridIter {
        GridIter::new(self.grid_shape().iter().map(|&n| 0..n).collect())
    }

    /// The coarsest chunking whose boundaries include those of both `self` and `other`.
    pub fn refine(&self, other: &Chunking) -> Result<Chunking, ChunkingError> {
        if self.ndim() != other.ndim() {
            return Err(ChunkingError::DimensionMismatch {
                expected: self.ndim(),
                found: other.ndim(),
            });
        }

        let mut bounds = Vec::with_capacity(self.ndim());
        for (axis, (a, b)) in enumerate(zip(&self.bounds, &other.bounds)) {
            let (ea, eb) = (a[a.len() - 1], b[b.len() - 1]);
            if ea != eb {
                return Err(ChunkingError::NotAPartition {
                    axis,
                    extent: ea,
                    sum: eb,
                });
            }

            bounds.push(a.iter().merge(b.iter()).dedup().copied().collect_vec());
        }

        Ok(Self { bounds })
    }

    /// Returns a copy of this chunking where the chunks of `axis` are replaced.
    pub fn with_axis(&self, axis: usize, extent: u64, sizes: Vec<u64>) -> Result<Self, ChunkingError> {
        let mut shape = self.shape();
        shape[axis] = extent;

        let mut all_sizes = (0..self.ndim()).map(|i| self.chunk_sizes(i)).collect_vec();
        all_sizes[axis] = sizes;
        Self::from_sizes(&shape, all_sizes)
    }
}

impl fmt::Display for Chunking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for axis in 0..self.ndim() {
            if axis > 0 {
                write!(f, ", ")?;
            }

            let mut runs: Vec<(u64, usize)> = vec![];
            for size in self.chunk_sizes(axis) {
                match runs.last_mut() {
                    Some((last, count)) if *last == size => *count += 1,
                    _ => runs.push((size, 1)),
                }
            }

            let runs = runs
                .into_iter()
                .map(|(size, count)| match count {
                    1 => format!("{}", size),
                    _ => format!("{}*{}", size, count),
                })
                .join(", ");
            write!(f, "({})", runs)?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for Chunking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunking{}", self)
    }
}

/// Axis-aligned box of elements.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub offset: Shape,
    pub extents: Shape,
}

impl Region {
    pub fn ndim(&self) -> usize {
        self.offset.len()
    }

    pub fn end(&self, axis: usize) -> u64 {
        self.offset[axis] + self.extents[axis]
    }

    pub fn num_elements(&self) -> u64 {
        product(&self.extents)
    }

    pub fn intersection(&self, other: &Region) -> Option<Region> {
        let mut offset = Shape::new();
        let mut extents = Shape::new();

        for axis in 0..self.ndim() {
            let lo = max(self.offset[axis], other.offset[axis]);
            let hi = min(self.end(axis), other.end(axis));
            if lo >= hi {
                return None;
            }

            offset.push(lo);
            extents.push(hi - lo);
        }

        Some(Region { offset, extents })
    }
}

/// Iterates over all points of a rectangular grid in row-major order (last axis fastest).
#[derive(Clone, Debug)]
pub struct GridIter {
    ranges: SmallVec<[Range<u64>; 4]>,
    next: Option<ChunkCoords>,
}

impl GridIter {
    pub fn new(ranges: SmallVec<[Range<u64>; 4]>) -> Self {
        let next = if ranges.iter().any(|r| r.start >= r.end) {
            None
        } else {
            Some(ranges.iter().map(|r| r.start).collect())
        };

        Self { ranges, next }
    }
}

impl Iterator for GridIter {
    type Item = ChunkCoords;

    fn next(&mut self) -> Option<ChunkCoords> {
        let current = self.next.take()?;
        let mut candidate = current.clone();

        for axis in (0..self.ranges.len()).rev() {
            candidate[axis] += 1;
            if candidate[axis] < self.ranges[axis].end {
                self.next = Some(candidate);
                break;
            }

            candidate[axis] = self.ranges[axis].start;
        }

        Some(current)
    }
}
