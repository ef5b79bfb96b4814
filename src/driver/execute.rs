use std::sync::Arc;
use std::time::{Duration, Instant};

use super::plan::{ArrayRef, ExecutionPlan, PlannedNode};
use super::task::run_task;
use super::trace::PlanTrace;
use crate::callbacks::{Callback, ComputeSummary, StatsChannel, TaskRecord};
use crate::error::{Error, Result};
use crate::graph::{optimize, Graph};
use crate::prelude::*;
use crate::store::Store;
use crate::types::{NodeId, RunConfig};
use crate::worker::{CancelToken, Executor, MemoryMeter, TaskBatch, TaskStatus};

/// Result of a successful run.
#[derive(Debug)]
pub struct ExecutionReport {
    pub plan: ExecutionPlan,
    pub records: Vec<TaskRecord>,
    pub elapsed: Duration,
}

impl ExecutionReport {
    pub fn output(&self, id: NodeId) -> Option<&ArrayRef> {
        self.plan.outputs().get(&id)
    }

    pub fn num_tasks(&self) -> u64 {
        self.plan.num_tasks()
    }
}

/// Materializes the outputs of `graph` in `store`.
///
/// All planning happens before the first task is dispatched: node projections are
/// recomputed with `config.task_overhead`, rechunk stages are planned and every node is
/// checked against `config.max_mem`. Nodes then run one batch at a time;
/// the tasks of a node only start once all tasks of the previous node succeeded.
pub fn execute(
    graph: &Graph,
    config: &RunConfig,
    store: &dyn Store,
    executor: &dyn Executor,
    callbacks: &[Arc<dyn Callback>],
) -> Result<ExecutionReport> {
    config.validate()?;
    let start = Instant::now();

    let graph = graph.with_task_overhead(config.task_overhead);
    let graph = if config.optimize {
        optimize(&graph, config.max_mem)
    } else {
        graph
    };

    let plan = ExecutionPlan::build(&graph, config)?;
    plan.check_memory(config.max_mem)?;

    info!(
        "executing {} nodes ({} tasks) on {} executor",
        plan.nodes().len(),
        plan.num_tasks(),
        executor.name()
    );

    if let Some(path) = &config.trace_file {
        match PlanTrace::new(path) {
            Ok(mut trace) => trace.add(&plan),
            Err(e) => warn!("{:#}", e),
        }
    }

    for callback in callbacks {
        callback.on_compute_start(&plan);
    }

    let mut run = Run {
        config,
        store,
        executor,
        callbacks,
        stats: StatsChannel::new(),
        cancel: match config.deadline {
            Some(deadline) => CancelToken::with_deadline(start + deadline),
            None => CancelToken::new(),
        },
        start,
        records: vec![],
    };

    let result = plan.nodes().iter().try_for_each(|node| run.execute_node(node));
    let elapsed = start.elapsed();

    let summary = ComputeSummary {
        num_nodes: plan.nodes().len(),
        num_tasks: plan.num_tasks(),
        num_attempts: run.records.len(),
        elapsed,
        error: result.as_ref().err().map(|e| e.to_string()),
    };

    for callback in callbacks {
        callback.on_compute_end(&summary);
    }

    match result {
        Ok(()) => {
            info!("finished {} tasks in {:?}", summary.num_tasks, elapsed);

            Ok(ExecutionReport {
                plan,
                records: run.records,
                elapsed,
            })
        }
        Err(e) => {
            error!("run failed after {:?}: {}", elapsed, e);
            Err(e)
        }
    }
}

struct Run<'a> {
    config: &'a RunConfig,
    store: &'a dyn Store,
    executor: &'a dyn Executor,
    callbacks: &'a [Arc<dyn Callback>],
    stats: StatsChannel,
    cancel: CancelToken,
    start: Instant,
    records: Vec<TaskRecord>,
}

impl<'a> Run<'a> {
    fn execute_node(&mut self, node: &PlannedNode) -> Result {
        if self.cancel.deadline_passed() {
            return Err(Error::DeadlineExceeded(self.start.elapsed()));
        }

        let tasks = node.tasks();
        if self.config.resume
            && !tasks.is_empty()
            && all(&tasks, |task| self.store.contains(node.name(), &task.chunk))
        {
            info!(
                "skipping {} = {}: all {} chunks are stored already",
                node.name(),
                node.label(),
                tasks.len()
            );
            return Ok(());
        }

        debug!(
            "dispatching {} tasks of {} = {} ({} bytes per task)",
            tasks.len(),
            node.name(),
            node.label(),
            node.projected_mem()
        );

        for callback in self.callbacks {
            callback.on_node_start(node);
        }

        let store = self.store;
        let sender = self.stats.sender();
        let reserved_mem = self.executor.reserved_mem();

        let runner = |index: usize, attempt: u32| -> anyhow::Result<()> {
            let task = &tasks[index];
            let meter = MemoryMeter::new(reserved_mem);
            let start = sender.elapsed();
            let peak_mem_start = meter.peak();

            let result = run_task(node, task, store, &meter);

            sender.send(TaskRecord {
                node: node.id(),
                array: node.name().to_string(),
                chunk: task.chunk.clone(),
                attempt,
                start,
                end: sender.elapsed(),
                peak_mem_start,
                peak_mem_end: meter.peak(),
                error: result.as_ref().err().map(|e| format!("{:#}", e)),
            });

            result
        };

        let batch = TaskBatch::new(tasks.len(), self.config.retries, &self.cancel, &runner);
        let outcomes = self.executor.submit_batch(&batch);

        for record in self.stats.drain() {
            for callback in self.callbacks {
                callback.on_task_end(&record);
            }

            self.records.push(record);
        }

        for callback in self.callbacks {
            callback.on_node_end(node);
        }

        let mut cancelled = false;
        for outcome in outcomes {
            match outcome.status {
                TaskStatus::Completed => {}
                TaskStatus::Cancelled => cancelled = true,
                TaskStatus::Failed(cause) => {
                    return Err(Error::TaskFailed {
                        node: node.id(),
                        array: node.name().to_string(),
                        chunk: tasks[outcome.index].chunk.clone(),
                        attempts: outcome.attempts,
                        cause,
                    });
                }
            }
        }

        if cancelled {
            return Err(Error::DeadlineExceeded(self.start.elapsed()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::callbacks::HistoryCallback;
    use crate::graph::{NodeParams, Operation, Unary};
    use crate::store::{MemoryStore, StoreError};
    use crate::types::{Block, Chunking, UnaryOp, DTYPE_F64};
    use crate::worker::{SequentialExecutor, TaskOutcome};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingExecutor {
        inner: SequentialExecutor,
        batches: AtomicUsize,
    }

    impl Executor for CountingExecutor {
        fn name(&self) -> &str {
            "counting"
        }

        fn submit_batch(&self, batch: &TaskBatch<'_>) -> Vec<TaskOutcome> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.inner.submit_batch(batch)
        }
    }

    /// Fails the first `failures` reads of chunk `[0]` of array "a".
    #[derive(Debug)]
    struct FlakyStore {
        inner: MemoryStore,
        failures: usize,
        reads: AtomicUsize,
    }

    impl Store for FlakyStore {
        fn read(&self, array: &str, chunk: &[u64]) -> Result<Block, StoreError> {
            if array == "a" && chunk == [0] {
                let n = self.reads.fetch_add(1, Ordering::SeqCst);

                if n < self.failures {
                    return Err(StoreError::Io {
                        path: format!("{}/{:?}", array, chunk),
                        source: io::Error::new(io::ErrorKind::Other, "injected failure"),
                    });
                }
            }

            self.inner.read(array, chunk)
        }

        fn write(&self, array: &str, chunk: &[u64], block: &Block) -> Result<(), StoreError> {
            self.inner.write(array, chunk, block)
        }
    }

    fn negate() -> Operation {
        Operation::blockwise(Arc::new(Unary(UnaryOp::Negative)))
    }

    /// Source "a" of 100 doubles in chunks of 10 with values `0..100`, followed by a negation.
    fn setup(store: &dyn Store) -> (Graph, NodeId) {
        let chunking = Chunking::regular(&[100], &[10]).unwrap();
        for coords in chunking.chunk_coords() {
            let offset = chunking.chunk_offset(&coords)[0];
            let block = Block::from_fn::<f64, _>(&[10], |i| (offset + i[0]) as f64);
            store.write("a", &coords, &block).unwrap();
        }

        let mut graph = Graph::new(0);
        let a = graph.add_source("a", chunking, DTYPE_F64).unwrap();
        let b = graph.add_node(negate(), &[a], NodeParams::new()).unwrap();
        (graph, b)
    }

    fn read_all(store: &dyn Store, array: &ArrayRef) -> Vec<f64> {
        array
            .chunking
            .chunk_coords()
            .flat_map(|c| store.read(&array.name, &c).unwrap().to_values::<f64>().unwrap())
            .collect()
    }

    #[test]
    fn test_execute() {
        let store = MemoryStore::new();
        let (graph, b) = setup(&store);
        let config = RunConfig::new(10_000).with_task_overhead(0);
        let history = Arc::new(HistoryCallback::new());
        let callbacks: Vec<Arc<dyn Callback>> = vec![history.clone()];

        let report = execute(&graph, &config, &store, &SequentialExecutor::new(), &callbacks).unwrap();

        assert_eq!(report.num_tasks(), 10);
        assert_eq!(report.records.len(), 10);
        assert!(report.records.iter().all(|r| r.succeeded() && r.attempt == 1));

        let output = report.output(b).unwrap();
        let expected = (0..100).map(|i| -(i as f64)).collect_vec();
        assert_eq!(read_all(&store, output), expected);

        let summary = history.summary().unwrap();
        assert_eq!(summary.num_tasks, 10);
        assert_eq!(summary.error, None);

        let plan = history.plan();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].projected_mem, 160);

        for node in history.analyze(0) {
            assert_eq!(node.peak_mem_end_max, 160);
            assert!(node.utilization > 0.0 && node.utilization <= 1.0);
        }

        let dir = tempfile::tempdir().unwrap();
        let (plan_path, stats_path) = history.save(dir.path()).unwrap();
        let stats: Vec<TaskRecord> =
            serde_json::from_reader(std::fs::File::open(stats_path).unwrap()).unwrap();
        assert_eq!(stats, history.records());
        assert!(plan_path.exists());
    }

    #[test]
    fn test_memory_budget_exceeded() {
        let store = MemoryStore::new();
        let (graph, b) = setup(&store);
        let config = RunConfig::new(100).with_task_overhead(0);
        let executor = CountingExecutor::default();

        let err = execute(&graph, &config, &store, &executor, &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::MemoryBudgetExceeded { node, projected: 160, max_mem: 100, .. } if node == b
        ));
        assert_eq!(executor.batches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_retry_success() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            failures: 1,
            reads: AtomicUsize::new(0),
        };
        let (graph, b) = setup(&store);
        let config = RunConfig::new(10_000).with_task_overhead(0).with_retries(2);

        let report = execute(&graph, &config, &store, &SequentialExecutor::new(), &[]).unwrap();
        let attempts = report
            .records
            .iter()
            .filter(|r| &r.chunk[..] == [0])
            .map(|r| (r.attempt, r.succeeded()))
            .collect_vec();

        assert_eq!(attempts, vec![(1, false), (2, true)]);
        assert_eq!(report.records.len(), 11);
        assert_eq!(read_all(&store, report.output(b).unwrap())[5], -5.0);
    }

    #[test]
    fn test_retry_exhausted() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            failures: usize::MAX,
            reads: AtomicUsize::new(0),
        };
        let (graph, b) = setup(&store);
        let config = RunConfig::new(10_000).with_task_overhead(0).with_retries(2);

        let err = execute(&graph, &config, &store, &SequentialExecutor::new(), &[]).unwrap_err();
        match err {
            Error::TaskFailed {
                node,
                chunk,
                attempts,
                ..
            } => {
                assert_eq!(node, b);
                assert_eq!(&chunk[..], [0]);
                assert_eq!(attempts, 3);
            }
            e => panic!("unexpected error: {}", e),
        }

        assert_eq!(store.reads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_deadline() {
        let store = MemoryStore::new();
        let (graph, _) = setup(&store);
        let config = RunConfig::new(10_000)
            .with_task_overhead(0)
            .with_deadline(Duration::from_nanos(1));
        let executor = CountingExecutor::default();

        let err = execute(&graph, &config, &store, &executor, &[]).unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded(_)));
        assert_eq!(executor.batches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_trace() {
        let store = MemoryStore::new();
        let (graph, _) = setup(&store);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.json");
        let config = RunConfig::new(10_000).with_trace_file(&path);

        execute(&graph, &config, &store, &SequentialExecutor::new(), &[]).unwrap();

        let line = std::fs::read_to_string(&path).unwrap();
        let trace: serde_json::Value = serde_json::from_str(line.lines().next().unwrap()).unwrap();
        assert_eq!(trace["num_tasks"], 10);
    }

    #[test]
    fn test_task_overhead_from_config() {
        let store = MemoryStore::new();
        let (graph, _) = setup(&store);
        assert_eq!(graph.task_overhead(), 0);

        let config = RunConfig::new(10_000).with_task_overhead(512);
        let report = execute(&graph, &config, &store, &SequentialExecutor::new(), &[]).unwrap();
        assert_eq!(report.plan.nodes()[0].projected_mem(), 160 + 512);

        let config = RunConfig::new(600).with_task_overhead(512);
        let err = execute(&graph, &config, &store, &SequentialExecutor::new(), &[]).unwrap_err();
        assert!(matches!(err, Error::MemoryBudgetExceeded { projected: 672, .. }));
    }

    #[test]
    fn test_resume() {
        let store = MemoryStore::new();
        let (graph, b) = setup(&store);
        let name = graph.get(b).unwrap().name().to_string();
        let config = RunConfig::new(10_000).with_task_overhead(0).with_resume(true);
        let executor = CountingExecutor::default();

        // A partially written output is recomputed.
        store.write(&name, &[0], &Block::from_fn::<f64, _>(&[10], |_| 42.0)).unwrap();
        let report = execute(&graph, &config, &store, &executor, &[]).unwrap();
        assert_eq!(executor.batches.load(Ordering::SeqCst), 1);
        assert_eq!(report.records.len(), 10);

        let report = execute(&graph, &config, &store, &executor, &[]).unwrap();
        assert_eq!(executor.batches.load(Ordering::SeqCst), 1);
        assert!(report.records.is_empty());

        let expected = (0..100).map(|i| -(i as f64)).collect_vec();
        assert_eq!(read_all(&store, report.output(b).unwrap()), expected);

        let config = config.with_resume(false);
        execute(&graph, &config, &store, &executor, &[]).unwrap();
        assert_eq!(executor.batches.load(Ordering::SeqCst), 2);
    }
}
