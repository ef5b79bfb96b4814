use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use super::Array;
use crate::callbacks::Callback;
use crate::driver::{execute, ArrayRef, ExecutionReport};
use crate::error::{Error, Result};
use crate::graph::{Arange, BlockFunction, Full, Graph, NodeParams, Operation};
use crate::prelude::*;
use crate::store::{DirectoryStore, MemoryStore, Store};
use crate::types::{Block, Chunking, DataType, HasDataType, NodeId, RunConfig};
use crate::worker::{BackupPolicy, Executor, SequentialExecutor, ThreadPoolExecutor};
use stratus_core::util::{product, Counter};

struct Inner {
    config: RunConfig,
    store: Arc<dyn Store>,
    executor: Arc<dyn Executor>,
    graph: Mutex<Graph>,
    callbacks: Mutex<Vec<Arc<dyn Callback>>>,
    materialized: Mutex<HashMap<NodeId, ArrayRef>>,
    next_input: AtomicU64,
}

/// Owns the operation graph that arrays are built in, and the store and executor used to
/// compute them.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.inner.config)
            .field("store", &self.inner.store)
            .field("executor", &self.inner.executor.name())
            .field("nodes", &self.inner.graph.lock().len())
            .finish()
    }
}

impl Context {
    pub fn new(config: RunConfig, store: Arc<dyn Store>, executor: Arc<dyn Executor>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                graph: Mutex::new(Graph::new(config.task_overhead)),
                config,
                store,
                executor,
                callbacks: default(),
                materialized: default(),
                next_input: AtomicU64::new(1),
            }),
        })
    }

    /// Context that keeps all chunks in memory and runs tasks on the calling thread.
    pub fn in_memory(config: RunConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(SequentialExecutor::new()),
        )
    }

    /// Stores chunks below `config.work_dir` (in memory if unset) and runs tasks on a
    /// thread pool of `config.num_threads` threads, with backup tasks if
    /// `config.use_backups` is set.
    pub fn from_config(config: RunConfig) -> Result<Self> {
        let store: Arc<dyn Store> = match &config.work_dir {
            Some(dir) => Arc::new(DirectoryStore::new(dir)?),
            None => Arc::new(MemoryStore::new()),
        };

        let mut executor = ThreadPoolExecutor::new(config.num_threads)
            .map_err(|e| Error::InvalidConfig(format!("{:#}", e)))?;
        if config.use_backups {
            executor = executor.with_backups(BackupPolicy::default());
        }

        Self::new(config, store, Arc::new(executor))
    }

    pub fn from_env() -> Result<Self> {
        Self::from_config(RunConfig::from_env())
    }

    pub fn config(&self) -> &RunConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.inner.executor
    }

    pub fn add_callback(&self, callback: Arc<dyn Callback>) {
        self.inner.callbacks.lock().push(callback);
    }

    /// Snapshot of the operation graph.
    pub fn graph(&self) -> Graph {
        self.inner.graph.lock().clone()
    }

    pub(crate) fn add_node(&self, op: Operation, inputs: &[&Array], params: NodeParams) -> Result<Array> {
        let ids = inputs.iter().map(|a| a.id()).collect_vec();
        let mut graph = self.inner.graph.lock();
        let id = graph.add_node(op, &ids, params)?;
        let node = graph.get(id)?;

        Ok(Array::new(self.clone(), node))
    }

    /// Array that already exists in the store under `name`.
    pub fn from_store(&self, name: &str, chunking: Chunking, dtype: DataType) -> Result<Array> {
        let mut graph = self.inner.graph.lock();
        let id = graph.add_source(name, chunking, dtype)?;
        let node = graph.get(id)?;

        Ok(Array::new(self.clone(), node))
    }

    /// Writes `values` (row-major) to the store as a new array with chunks of `chunks`.
    pub fn from_values<T: HasDataType>(&self, values: &[T], shape: &[u64], chunks: &[u64]) -> Result<Array> {
        if values.len() as u64 != product(shape) {
            return Err(Error::IncompatibleShapes(format!(
                "{} values do not fill an array of shape {:?}",
                values.len(),
                shape
            )));
        }

        let chunking = Chunking::regular(shape, chunks)?;
        let dtype = T::data_type();
        let whole = Block::from_values(shape, values).map_err(|e| Error::InvalidOperation(e.to_string()))?;
        let name = format!("input-{:03}", (&self.inner.next_input).get_and_increment());

        for coords in chunking.chunk_coords() {
            let region = chunking.chunk_region(&coords);
            let mut block = Block::zeros(dtype, &region.extents);
            let zero = vec![0; region.ndim()];

            block
                .copy_region(&zero, &whole, &region.offset, &region.extents)
                .map_err(|e| Error::InvalidOperation(e.to_string()))?;
            self.inner.store.write(&name, &coords, &block)?;
        }

        self.from_store(&name, chunking, dtype)
    }

    fn generate(&self, function: Arc<dyn BlockFunction>, shape: &[u64], chunks: &[u64]) -> Result<Array> {
        let chunking = Chunking::regular(shape, chunks)?;
        self.add_node(
            Operation::blockwise(function),
            &[],
            NodeParams::new().with_chunking(chunking),
        )
    }

    pub fn full(&self, shape: &[u64], chunks: &[u64], dtype: DataType, value: f64) -> Result<Array> {
        self.generate(Arc::new(Full { dtype, value }), shape, chunks)
    }

    pub fn zeros(&self, shape: &[u64], chunks: &[u64], dtype: DataType) -> Result<Array> {
        self.full(shape, chunks, dtype, 0.0)
    }

    pub fn ones(&self, shape: &[u64], chunks: &[u64], dtype: DataType) -> Result<Array> {
        self.full(shape, chunks, dtype, 1.0)
    }

    /// Array of `shape` where every element is its row-major index.
    pub fn arange(&self, shape: &[u64], chunks: &[u64], dtype: DataType) -> Result<Array> {
        self.generate(Arc::new(Arange { dtype }), shape, chunks)
    }

    /// Applies `function` to corresponding chunks of `inputs`.
    pub fn map_blocks(&self, function: Arc<dyn BlockFunction>, inputs: &[&Array], params: NodeParams) -> Result<Array> {
        self.add_node(Operation::blockwise(function), inputs, params)
    }

    /// Materializes `arrays` and everything they depend on.
    pub fn compute(&self, arrays: &[&Array]) -> Result<ExecutionReport> {
        let ids = arrays.iter().map(|a| a.id()).collect_vec();
        let graph = self.inner.graph.lock().subgraph(&ids)?;
        let callbacks = self.inner.callbacks.lock().clone();

        let report = execute(
            &graph,
            &self.inner.config,
            &*self.inner.store,
            &*self.inner.executor,
            &callbacks,
        )?;

        let mut materialized = self.inner.materialized.lock();
        for (&id, array) in report.plan.outputs() {
            materialized.insert(id, array.clone());
        }

        Ok(report)
    }

    /// Where array `id` was stored by the last run that computed it.
    pub fn location(&self, id: NodeId) -> Result<ArrayRef> {
        self.inner
            .materialized
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::NotMaterialized(id))
    }
}
