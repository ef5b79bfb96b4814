use std::fmt::{self, Debug};
use std::sync::Arc;

use super::Context;
use crate::driver::ExecutionReport;
use crate::error::{Error, Result};
use crate::graph::{AsType, Binary, BlockFunction, Node, NodeParams, Operation, Scale, Unary};
use crate::types::{
    BinaryOp, Block, Chunking, DataType, HasDataType, NodeId, Reduction, Shape, UnaryOp,
    DTYPE_F64,
};

/// Number of chunks a reduction combines per round unless specified otherwise.
pub const DEFAULT_SPLIT_EVERY: usize = 4;

/// Handle to the (lazy) result of a graph node.
///
/// Operations on arrays only add nodes to the graph of the context; nothing is computed
/// until [`Array::compute`] or [`Array::to_vec`] is called.
#[derive(Clone)]
pub struct Array {
    context: Context,
    id: NodeId,
    shape: Shape,
    dtype: DataType,
    chunking: Chunking,
}

impl Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Array")
            .field("id", &self.id)
            .field("shape", &&self.shape[..])
            .field("dtype", &self.dtype)
            .field("chunks", &self.chunking)
            .finish()
    }
}

impl Array {
    pub(crate) fn new(context: Context, node: &Node) -> Self {
        Self {
            context,
            id: node.id(),
            shape: node.shape().clone(),
            dtype: node.dtype(),
            chunking: node.chunking().clone(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn chunking(&self) -> &Chunking {
        &self.chunking
    }

    fn unary(&self, op: UnaryOp) -> Result<Array> {
        self.map_blocks(Arc::new(Unary(op)))
    }

    /// Inputs with a different chunking are rechunked to the chunking of `self`.
    fn binary(&self, other: &Array, op: BinaryOp) -> Result<Array> {
        self.context.add_node(
            Operation::blockwise(Arc::new(Binary(op))),
            &[self, other],
            NodeParams::new().unify_chunks(),
        )
    }

    pub fn negative(&self) -> Result<Array> {
        self.unary(UnaryOp::Negative)
    }

    pub fn abs(&self) -> Result<Array> {
        self.unary(UnaryOp::Absolute)
    }

    pub fn square(&self) -> Result<Array> {
        self.unary(UnaryOp::Square)
    }

    pub fn add(&self, other: &Array) -> Result<Array> {
        self.binary(other, BinaryOp::Add)
    }

    pub fn subtract(&self, other: &Array) -> Result<Array> {
        self.binary(other, BinaryOp::Subtract)
    }

    pub fn multiply(&self, other: &Array) -> Result<Array> {
        self.binary(other, BinaryOp::Multiply)
    }

    pub fn maximum(&self, other: &Array) -> Result<Array> {
        self.binary(other, BinaryOp::Maximum)
    }

    pub fn minimum(&self, other: &Array) -> Result<Array> {
        self.binary(other, BinaryOp::Minimum)
    }

    pub fn astype(&self, dtype: DataType) -> Result<Array> {
        if dtype == self.dtype {
            return Ok(self.clone());
        }

        self.map_blocks(Arc::new(AsType(dtype)))
    }

    /// Applies a single-input `function` to every chunk.
    pub fn map_blocks(&self, function: Arc<dyn BlockFunction>) -> Result<Array> {
        self.context
            .add_node(Operation::blockwise(function), &[self], NodeParams::new())
    }

    /// Same array with regular chunks of `chunks`.
    pub fn rechunk(&self, chunks: &[u64]) -> Result<Array> {
        self.rechunk_to(Chunking::regular(&self.shape, chunks)?)
    }

    pub fn rechunk_to(&self, chunking: Chunking) -> Result<Array> {
        self.context.add_node(
            Operation::Rechunk,
            &[self],
            NodeParams::new().with_chunking(chunking),
        )
    }

    /// Reduces `axis` to length one, combining `split_every` chunks per round until a
    /// single chunk is left.
    pub fn reduce(&self, axis: usize, reduction: Reduction, split_every: usize) -> Result<Array> {
        if axis >= self.ndim() {
            return Err(Error::InvalidOperation(format!(
                "axis {} out of range for an array with {} dimensions",
                axis,
                self.ndim()
            )));
        }

        let mut current = self.clone();
        loop {
            current = self.context.add_node(
                Operation::reduce(axis, reduction, split_every),
                &[&current],
                NodeParams::new(),
            )?;

            if current.chunking.num_chunks_along(axis) == 1 {
                break Ok(current);
            }
        }
    }

    pub fn sum(&self, axis: usize) -> Result<Array> {
        self.reduce(axis, Reduction::Sum, DEFAULT_SPLIT_EVERY)
    }

    pub fn prod(&self, axis: usize) -> Result<Array> {
        self.reduce(axis, Reduction::Product, DEFAULT_SPLIT_EVERY)
    }

    pub fn min(&self, axis: usize) -> Result<Array> {
        self.reduce(axis, Reduction::Min, DEFAULT_SPLIT_EVERY)
    }

    pub fn max(&self, axis: usize) -> Result<Array> {
        self.reduce(axis, Reduction::Max, DEFAULT_SPLIT_EVERY)
    }

    /// Arithmetic mean along `axis`. Integer arrays are averaged as `f64`.
    pub fn mean(&self, axis: usize) -> Result<Array> {
        let input = if self.dtype.is_float() {
            self.clone()
        } else {
            self.astype(DTYPE_F64)?
        };

        let sums = input.reduce(axis, Reduction::Mean, DEFAULT_SPLIT_EVERY)?;
        sums.map_blocks(Arc::new(Scale(1.0 / self.shape[axis] as f64)))
    }

    pub fn compute(&self) -> Result<ExecutionReport> {
        self.context.compute(&[self])
    }

    /// Reads the whole array into a single block, computing it first if needed.
    pub fn to_block(&self) -> Result<Block> {
        let location = match self.context.location(self.id) {
            Ok(location) => location,
            Err(Error::NotMaterialized(_)) => {
                self.compute()?;
                self.context.location(self.id)?
            }
            Err(e) => return Err(e),
        };

        let store = self.context.store();
        let mut output = Block::zeros(self.dtype, &self.shape);
        let zero = vec![0; self.ndim()];

        for coords in location.chunking.chunk_coords() {
            let block = store.read(&location.name, &coords)?;
            let offset = location.chunking.chunk_offset(&coords);

            output
                .copy_region(&offset, &block, &zero, block.shape())
                .map_err(|e| Error::InvalidOperation(e.to_string()))?;
        }

        Ok(output)
    }

    /// Contents of the array in row-major order.
    pub fn to_vec<T: HasDataType>(&self) -> Result<Vec<T>> {
        self.to_block()?
            .to_values()
            .map_err(|e| Error::InvalidOperation(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;
    use crate::graph::{FnBlock, OpKind};
    use crate::prelude::*;
    use crate::types::{RunConfig, DTYPE_F64, DTYPE_I32, DTYPE_U8};

    fn context(max_mem: u64) -> Context {
        Context::in_memory(RunConfig::new(max_mem).with_task_overhead(0)).unwrap()
    }

    /// Every task attempt stays within the projection of the node it ran for.
    fn check_peaks(report: &ExecutionReport) {
        let nodes = report.plan.nodes();
        assert!(!report.records.is_empty());

        for record in &report.records {
            let node = nodes.iter().find(|n| n.name() == record.array).unwrap();
            assert!(record.peak_mem_end > 0);
            assert!(
                record.peak_mem_end <= node.projected_mem(),
                "{} used {} bytes, projected {}",
                node.label(),
                record.peak_mem_end,
                node.projected_mem()
            );
        }
    }

    #[test]
    fn test_rechunk() {
        let ctx = context(20_000 * 4);
        let a = ctx.arange(&[40000], &[1000], DTYPE_I32).unwrap();
        let b = a.rechunk(&[999]).unwrap();

        let report = b.compute().unwrap();
        assert_eq!(report.num_tasks(), 40 + 41);

        let expected = (0..40000).collect_vec();
        assert_eq!(b.to_vec::<i32>().unwrap(), expected);
        assert_eq!(b.chunking().chunk_sizes(0)[..2], [999, 999]);
    }

    #[test]
    fn test_multistage_rechunk() {
        let ctx = context(150);
        let values = (0..10000).map(|i| (i % 251) as u8).collect_vec();
        let a = ctx.from_values(&values, &[100, 100], &[1, 100]).unwrap();
        let b = a.rechunk(&[100, 1]).unwrap();

        let report = b.compute().unwrap();
        let nodes = report.plan.nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name(), format!("{}-stage1", b.id().array_name()));
        assert_eq!(nodes[1].name(), b.id().array_name());
        assert!(nodes.iter().all(|n| n.projected_mem() <= 150));

        for record in &report.records {
            let node = nodes.iter().find(|n| n.name() == record.array).unwrap();
            assert!(record.peak_mem_end <= node.projected_mem());
        }

        assert_eq!(b.to_vec::<u8>().unwrap(), values);
        assert_eq!(b.dtype(), DTYPE_U8);
    }

    #[test]
    fn test_fusion() {
        let ctx = context(1_000_000);
        let values = (0..100).map(|i| i as f64).collect_vec();
        let a = ctx.from_values(&values, &[100], &[10]).unwrap();
        let b = a.negative().unwrap();
        let c = b.negative().unwrap();

        let report = c.compute().unwrap();
        let nodes = report.plan.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].op().kind(), OpKind::Fused);
        assert_eq!(nodes[0].id(), c.id());
        assert_eq!(report.num_tasks(), a.chunking().num_chunks());
        assert_eq!(c.to_vec::<f64>().unwrap(), values);

        let config = RunConfig::new(1_000_000).with_optimize(false);
        let ctx = Context::in_memory(config).unwrap();
        let a = ctx.from_values(&values, &[100], &[10]).unwrap();
        let c = a.negative().unwrap().negative().unwrap();
        assert_eq!(c.compute().unwrap().num_tasks(), 20);
    }

    #[test]
    fn test_fusion_matches_unfused() {
        let x = (0..600).map(|i| (i % 23) as f64 - 11.0).collect_vec();
        let y = (0..600).map(|i| (i % 7) as f64).collect_vec();

        let build = |optimize: bool| {
            let config = RunConfig::new(1_000_000)
                .with_task_overhead(0)
                .with_optimize(optimize);
            let ctx = Context::in_memory(config).unwrap();
            let a = ctx.from_values(&x, &[20, 30], &[5, 10]).unwrap();
            let b = ctx.from_values(&y, &[20, 30], &[5, 10]).unwrap();

            // (|a| - b)^2 + max(a, -b) * a
            let left = a.abs().unwrap().subtract(&b).unwrap().square().unwrap();
            let right = a.maximum(&b.negative().unwrap()).unwrap().multiply(&a).unwrap();
            let result = left.add(&right).unwrap();

            let report = result.compute().unwrap();
            (result.to_vec::<f64>().unwrap(), report)
        };

        let (fused, fused_report) = build(true);
        let (unfused, unfused_report) = build(false);
        assert_eq!(fused, unfused);

        let expected = zip(&x, &y)
            .map(|(&a, &b)| (a.abs() - b).powi(2) + a.max(-b) * a)
            .collect_vec();
        assert_eq!(fused, expected);

        assert_eq!(fused_report.plan.nodes().len(), 1);
        assert_eq!(unfused_report.plan.nodes().len(), 7);
        assert_eq!(fused_report.num_tasks(), 12);
        check_peaks(&fused_report);
        check_peaks(&unfused_report);
    }

    #[test]
    fn test_shared_producer() {
        let mut results = vec![];

        for &optimize in &[true, false] {
            let config = RunConfig::new(1_000_000)
                .with_task_overhead(0)
                .with_optimize(optimize);
            let ctx = Context::in_memory(config).unwrap();
            let a = ctx.arange(&[100], &[10], DTYPE_F64).unwrap();
            let b = a.negative().unwrap();
            let c = b.negative().unwrap();
            let d = b.multiply(&c).unwrap();

            let report = d.compute().unwrap();
            if optimize {
                // `b` is read twice by `d`, so it is computed once and stored.
                let labels = report.plan.nodes().iter().map(|n| n.label()).collect_vec();
                assert_eq!(
                    labels,
                    vec![
                        "fused[negative(arange())]".to_string(),
                        "fused[multiply($0, negative($0))]".to_string(),
                    ]
                );
                assert_eq!(report.num_tasks(), 20);
            }

            results.push(d.to_vec::<f64>().unwrap());
        }

        let expected = (0..100).map(|i| -((i * i) as f64)).collect_vec();
        assert_eq!(results[0], expected);
        assert_eq!(results[1], expected);
    }

    #[test]
    fn test_projected_memory() {
        let values = (0..1200).map(|i| (i % 17) as f64).collect_vec();
        let threads = RunConfig::new(1_000_000)
            .with_task_overhead(0)
            .with_num_threads(3);
        let contexts = vec![
            context(1_000_000),
            Context::in_memory(RunConfig::new(1_000_000).with_task_overhead(0).with_optimize(false)).unwrap(),
            Context::from_config(threads).unwrap(),
        ];

        for ctx in contexts {
            let a = ctx.from_values(&values, &[40, 30], &[8, 10]).unwrap();
            let b = ctx.from_values(&values, &[40, 30], &[20, 15]).unwrap();

            let c = a.add(&b).unwrap().multiply(&a).unwrap();
            let sums = c.sum(0).unwrap();
            let means = a.mean(1).unwrap();

            let report = ctx.compute(&[&c, &sums, &means]).unwrap();
            let kinds = report.plan.nodes().iter().map(|n| n.op().kind()).collect_vec();
            assert!(kinds.contains(&OpKind::Reduce));
            assert!(kinds.contains(&OpKind::Rechunk));
            if ctx.config().optimize {
                assert!(kinds.contains(&OpKind::Fused));
            } else {
                assert!(kinds.contains(&OpKind::Elementwise));
            }
            check_peaks(&report);

            let squares = values.iter().map(|v| 2.0 * v * v).collect_vec();
            assert_eq!(c.to_vec::<f64>().unwrap(), squares);

            let expected = (0..30)
                .map(|j| (0..40).map(|i| squares[i * 30 + j]).sum::<f64>())
                .collect_vec();
            assert_eq!(sums.to_vec::<f64>().unwrap(), expected);

            let expected = (0..40)
                .map(|i| values[i * 30..(i + 1) * 30].iter().sum::<f64>() / 30.0)
                .collect_vec();
            let found = means.to_vec::<f64>().unwrap();
            assert!(zip(&found, &expected).all(|(f, e)| (f - e).abs() < 1e-9));
        }
    }

    #[test]
    fn test_elementwise() {
        let ctx = context(1_000_000);
        let x = (0..100).map(|i| i as f64).collect_vec();
        let y = (0..100).map(|i| (i * i) as f64).collect_vec();
        let a = ctx.from_values(&x, &[100], &[10]).unwrap();
        let b = ctx.from_values(&y, &[100], &[25]).unwrap();

        let c = a.add(&b).unwrap();
        assert_eq!(c.chunking(), a.chunking());

        let d = c.subtract(&a).unwrap().maximum(&a).unwrap();
        let expected = zip(&x, &y).map(|(&x, &y)| y.max(x)).collect_vec();
        assert_eq!(d.to_vec::<f64>().unwrap(), expected);

        let e = a.multiply(&a).unwrap().abs().unwrap();
        let squares = x.iter().map(|v| v * v).collect_vec();
        assert_eq!(e.to_vec::<f64>().unwrap(), squares);

        let other = ctx.from_values(&x[..50], &[50], &[10]).unwrap();
        assert!(matches!(a.add(&other), Err(Error::IncompatibleShapes(_))));
    }

    #[test]
    fn test_reduce() {
        let ctx = context(1_000_000);
        let values = (1..=24).map(|i| i as f64).collect_vec();
        let a = ctx.from_values(&values, &[4, 6], &[2, 2]).unwrap();

        let rows = a.reduce(1, Reduction::Sum, 2).unwrap();
        assert_eq!(rows.shape(), &[4, 1]);
        assert_eq!(rows.to_vec::<f64>().unwrap(), vec![21.0, 57.0, 93.0, 129.0]);

        let cols = a.sum(0).unwrap();
        assert_eq!(cols.shape(), &[1, 6]);
        assert_eq!(
            cols.to_vec::<f64>().unwrap(),
            vec![40.0, 44.0, 48.0, 52.0, 56.0, 60.0]
        );

        assert_eq!(a.max(1).unwrap().to_vec::<f64>().unwrap(), vec![6.0, 12.0, 18.0, 24.0]);
        assert_eq!(
            a.min(0).unwrap().to_vec::<f64>().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );
        assert_eq!(a.prod(0).unwrap().to_vec::<f64>().unwrap()[0], 1729.0);

        assert!(matches!(a.sum(2), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_mean() {
        let ctx = context(1_000_000);
        let a = ctx.arange(&[4, 6], &[2, 2], DTYPE_I32).unwrap();

        let rows = a.mean(1).unwrap();
        assert_eq!(rows.dtype(), DTYPE_F64);
        assert_eq!(rows.shape(), &[4, 1]);
        let found = rows.to_vec::<f64>().unwrap();
        let expected = [2.5, 8.5, 14.5, 20.5];
        assert!(zip(&found, &expected).all(|(f, e)| (f - e).abs() < 1e-9));

        let cols = a.astype(DTYPE_F64).unwrap().mean(0).unwrap();
        assert_eq!(cols.to_vec::<f64>().unwrap(), vec![9.0, 10.0, 11.0, 12.0, 13.0, 14.0]);

        assert!(matches!(a.mean(2), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_zero_extent() {
        let ctx = context(1_000_000);
        let a = ctx.zeros(&[0], &[1], DTYPE_F64).unwrap();
        assert_eq!(a.chunking().num_chunks(), 0);

        let report = a.compute().unwrap();
        assert_eq!(report.num_tasks(), 0);
        assert!(report.records.is_empty());
        assert_eq!(a.to_vec::<f64>().unwrap(), Vec::<f64>::new());

        let b = ctx.ones(&[0, 4], &[1, 2], DTYPE_F64).unwrap();
        let c = b.negative().unwrap().rechunk(&[3, 4]).unwrap();
        assert_eq!(c.shape(), &[0, 4]);
        assert!(c.to_vec::<f64>().unwrap().is_empty());

        let rows = b.sum(1).unwrap();
        assert_eq!(rows.shape(), &[0, 1]);
        assert!(rows.to_vec::<f64>().unwrap().is_empty());
        assert!(matches!(b.sum(0), Err(Error::InvalidOperation(_))));

        let empty = ctx.from_values::<f64>(&[], &[0, 3], &[2, 3]).unwrap();
        assert_eq!(empty.to_vec::<f64>().unwrap(), Vec::<f64>::new());
    }

    #[test]
    fn test_astype_and_map_blocks() {
        let ctx = context(1_000_000);
        let a = ctx.arange(&[6, 5], &[4, 2], DTYPE_I32).unwrap();
        let b = a.astype(DTYPE_F64).unwrap();
        assert_eq!(b.dtype(), DTYPE_F64);

        let double = FnBlock::new("double", 1, |_, inputs| {
            Ok(inputs[0].zip_binary(inputs[0], BinaryOp::Add)?)
        })
        .into_arc();
        let c = b.map_blocks(double).unwrap();

        let expected = (0..30).map(|i| 2.0 * i as f64).collect_vec();
        assert_eq!(c.to_vec::<f64>().unwrap(), expected);

        let ones = ctx.ones(&[3, 3], &[2, 2], DTYPE_I32).unwrap();
        assert_eq!(ones.to_vec::<i32>().unwrap(), vec![1; 9]);
    }

    #[test]
    fn test_directory_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig::new(1_000_000)
            .with_work_dir(dir.path())
            .with_num_threads(2);
        let ctx = Context::from_config(config).unwrap();

        let a = ctx.arange(&[20, 20], &[5, 20], DTYPE_F64).unwrap();
        let b = a.rechunk(&[20, 5]).unwrap().negative().unwrap();

        let expected = (0..400).map(|i| -(i as f64)).collect_vec();
        assert_eq!(b.to_vec::<f64>().unwrap(), expected);
        assert!(dir.path().join(b.id().array_name()).join("0.3").exists());
    }

    #[test]
    fn test_from_values_length() {
        let ctx = context(1_000);
        let err = ctx.from_values(&[1.0f64, 2.0], &[3], &[1]).unwrap_err();
        assert!(matches!(err, Error::IncompatibleShapes(_)));
    }
}
