//! Executor: physical plan → running actor pipeline
//!
//! Every transformation runs as its own task consuming one bounded mailbox,
//! so its state is single-threaded; sources run on dedicated tasks and push
//! into their subscribers' mailboxes. A watch channel carries cancellation
//! to every suspension point. The first terminal error cancels the rest of
//! the pipeline and becomes the query's single terminal error.

use crate::allocator::Allocator;
use crate::block::Block;
use crate::dataset::{AccumulationMode, Message, Subscriber};
use crate::registry::{Administration, ExecRegistry};
use crate::source::StorageReader;
use crate::transform::Transformation;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};
use virga_core::{Error, Result};
use virga_query::{DatasetID, PhysicalPlan};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Capacity of each transformation's mailbox; the pipeline's
    /// backpressure unit.
    pub mailbox_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            mailbox_capacity: 64,
        }
    }
}

/// The blocks a finished query produced, keyed by terminal dataset.
#[derive(Debug, Default)]
pub struct QueryResults {
    pub blocks: Vec<(DatasetID, Block)>,
}

impl QueryResults {
    /// Blocks of one dataset, in arrival order.
    pub fn dataset(&self, id: DatasetID) -> Vec<&Block> {
        self.blocks
            .iter()
            .filter(|(d, _)| *d == id)
            .map(|(_, b)| b)
            .collect()
    }
}

pub struct Executor {
    registry: ExecRegistry,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new() -> Self {
        Executor {
            registry: ExecRegistry::with_builtins(),
            config: ExecutorConfig::default(),
        }
    }

    pub fn with(registry: ExecRegistry, config: ExecutorConfig) -> Self {
        Executor { registry, config }
    }

    /// Run the plan to completion against the given storage.
    pub async fn execute(
        &self,
        plan: &PhysicalPlan,
        reader: Arc<dyn StorageReader>,
    ) -> Result<QueryResults> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.execute_with_cancel(plan, reader, cancel_rx).await
    }

    /// Run the plan; flipping `cancel` to `true` aborts the query with
    /// `Cancelled`.
    pub async fn execute_with_cancel(
        &self,
        plan: &PhysicalPlan,
        reader: Arc<dyn StorageReader>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<QueryResults> {
        let allocator = Arc::new(Allocator::new(plan.resources.memory_bytes_quota));
        let shutdown_tx = Arc::new(watch::channel(false).0);
        let shutdown_rx = shutdown_tx.subscribe();

        // Bridge external cancellation into the pipeline's shutdown signal.
        {
            let shutdown_tx = Arc::clone(&shutdown_tx);
            tokio::spawn(async move {
                loop {
                    if *cancel.borrow() {
                        let _ = shutdown_tx.send(true);
                        return;
                    }
                    if cancel.changed().await.is_err() {
                        return;
                    }
                }
            });
        }

        // Terminal datasets feed the collector's mailbox.
        let terminals: FxHashSet<DatasetID> = plan.terminals().into_iter().collect();
        let (collector_tx, collector_rx) = mpsc::channel(self.config.mailbox_capacity);
        let collector = tokio::spawn(collect_results(
            collector_rx,
            terminals.clone(),
            Arc::clone(&shutdown_tx),
        ));

        // Build children before parents so every node's subscribers exist.
        let mut mailboxes: FxHashMap<DatasetID, mpsc::Sender<Message>> = FxHashMap::default();
        let mut sources = Vec::new();
        for node in plan.nodes.iter().rev() {
            let mut subscribers: Vec<Subscriber> = plan
                .nodes
                .iter()
                .filter(|n| n.parents.contains(&node.id))
                .map(|n| Subscriber::new(mailboxes[&n.id].clone()))
                .collect();
            if terminals.contains(&node.id) {
                subscribers.push(Subscriber::new(collector_tx.clone()));
            }
            let admin = Administration {
                allocator: Arc::clone(&allocator),
                bounds: plan.bounds,
                node_bounds: node.bounds,
                now: plan.now,
                subscribers,
                parents: node
                    .parents
                    .iter()
                    .map(|p| {
                        let op_id = plan
                            .node(*p)
                            .map(|n| n.op_id.clone())
                            .unwrap_or_default();
                        (*p, op_id)
                    })
                    .collect(),
            };

            if plan.sources.contains(&node.id) {
                let source =
                    self.registry
                        .create_source(node.spec.kind(), node.id, &node.spec, Arc::clone(&reader), admin)?;
                sources.push(source);
            } else {
                let (tx, rx) = mpsc::channel(self.config.mailbox_capacity);
                let transformation = self.registry.create_transformation(
                    node.spec.kind(),
                    node.id,
                    AccumulationMode::Discarding,
                    &node.spec,
                    admin,
                )?;
                mailboxes.insert(node.id, tx);
                debug!(dataset = %node.id, kind = node.spec.kind(), "spawning transformation");
                tokio::spawn(run_transformation(
                    transformation,
                    rx,
                    shutdown_tx.subscribe(),
                    node.parents.len(),
                ));
            }
        }
        // The collector's own sender must drop with the wiring phase so its
        // channel closes once every terminal dataset finishes.
        drop(collector_tx);
        drop(mailboxes);

        for mut source in sources {
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { source.run(shutdown).await });
        }

        let (blocks, first_error) = collector
            .await
            .map_err(|e| Error::internal(format!("collector task failed: {}", e)))?;

        // Stop anything still running before reporting.
        let _ = shutdown_tx.send(true);

        match first_error {
            Some(err) => Err(err),
            None => Ok(QueryResults { blocks }),
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Executor::new()
    }
}

/// Gather terminal output until every terminal dataset reports finished;
/// the first error flips the shutdown signal so the rest of the pipeline
/// cancels.
async fn collect_results(
    mut rx: mpsc::Receiver<Message>,
    terminals: FxHashSet<DatasetID>,
    shutdown_tx: Arc<watch::Sender<bool>>,
) -> (Vec<(DatasetID, Block)>, Option<Error>) {
    let mut blocks = Vec::new();
    let mut first_error: Option<Error> = None;
    let mut finished: FxHashSet<DatasetID> = FxHashSet::default();

    while let Some(msg) = rx.recv().await {
        match msg {
            Message::Process(dataset, block) => {
                blocks.push((dataset, block.as_ref().clone()));
            }
            Message::Finish(dataset, err) => {
                if let Some(e) = err {
                    if first_error.is_none() {
                        error!(dataset = %dataset, error = %e, "terminal dataset failed");
                        first_error = Some(e);
                        let _ = shutdown_tx.send(true);
                    }
                }
                finished.insert(dataset);
                if finished.len() >= terminals.len() {
                    break;
                }
            }
            Message::RetractBlock(dataset, key) => {
                // A result already handed out is dropped from the set.
                warn!(dataset = %dataset, key = %key, "retracting result partition");
                blocks.retain(|(d, b)| *d != dataset || b.key() != &key);
            }
            Message::UpdateWatermark(..) | Message::UpdateProcessingTime(..) => {}
        }
    }
    (blocks, first_error)
}

/// One transformation's event loop: drain the mailbox in order, observe
/// shutdown between messages, stop after the last parent finishes.
async fn run_transformation(
    mut t: Box<dyn Transformation>,
    mut rx: mpsc::Receiver<Message>,
    mut shutdown: watch::Receiver<bool>,
    parents: usize,
) {
    let mut remaining = parents.max(1);
    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                match changed {
                    Ok(()) if *shutdown.borrow() => {
                        t.abort(Error::Cancelled).await;
                        return;
                    }
                    Ok(()) => {}
                    // Controller gone: no cancellation can arrive anymore.
                    Err(_) => break,
                }
            }

            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        if dispatch(&mut t, msg, &mut remaining).await {
                            return;
                        }
                    }
                    None => return,
                }
            }
        }
    }
    while let Some(msg) = rx.recv().await {
        if dispatch(&mut t, msg, &mut remaining).await {
            return;
        }
    }
}

/// Returns `true` when the actor is done.
async fn dispatch(
    t: &mut Box<dyn Transformation>,
    msg: Message,
    remaining: &mut usize,
) -> bool {
    let result = match msg {
        Message::Process(parent, block) => t.process(parent, block).await,
        Message::RetractBlock(parent, key) => t.retract_block(parent, &key).await,
        Message::UpdateWatermark(parent, time) => t.update_watermark(parent, time).await,
        Message::UpdateProcessingTime(parent, time) => {
            t.update_processing_time(parent, time).await
        }
        Message::Finish(parent, err) => {
            let result = t.finish(parent, err).await;
            *remaining = remaining.saturating_sub(1);
            match result {
                Ok(()) => return *remaining == 0,
                Err(e) => Err(e),
            }
        }
    };
    if let Err(e) = result {
        t.abort(e).await;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Column, ColumnData, PartitionKey, TIME_COL, VALUE_COL};
    use crate::dataset::Dataset;
    use crate::source::{BlockIter, ReadContext, ReadSpec};
    use async_trait::async_trait;
    use virga_core::{Bounds, DataType, Time};

    struct SlowReader;

    #[async_trait]
    impl StorageReader for SlowReader {
        async fn read(
            &self,
            _ctx: &ReadContext,
            _spec: &ReadSpec,
            start: Time,
            stop: Time,
        ) -> Result<BlockIter> {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let block = Block::new(
                PartitionKey::empty(),
                Bounds::new(start, stop),
                vec![
                    Column::new(TIME_COL, DataType::Time),
                    Column::new(VALUE_COL, DataType::Int),
                ],
                vec![ColumnData::Time(vec![start]), ColumnData::Int(vec![1])],
            )?;
            Ok(Box::new(std::iter::once(block)))
        }
    }

    #[tokio::test]
    async fn test_cancellation_surfaces_as_cancelled() {
        use virga_query::ops::{OpSpec, RangeSpec, SelectSpec};
        use virga_query::{Planner, QuerySpec};

        let mut spec = QuerySpec::new(Time(1_000_000));
        spec.add_operation(
            "select0",
            OpSpec::Select(SelectSpec {
                database: "db".into(),
            }),
        );
        spec.add_operation(
            "range1",
            OpSpec::Range(RangeSpec {
                start: virga_core::TimeSpec::absolute(Time(0)),
                stop: virga_core::TimeSpec::absolute(Time(1_000_000)),
            }),
        );
        spec.add_edge("select0", "range1");
        let plan = Planner::with_builtins().plan(&spec).unwrap();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let executor = Executor::new();
        let run = executor.execute_with_cancel(&plan, Arc::new(SlowReader), cancel_rx);
        tokio::pin!(run);

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {
                cancel_tx.send(true).unwrap();
            }
            _ = &mut run => panic!("query finished before cancellation"),
        }
        let err = run.await.unwrap_err();
        assert_eq!(err, Error::Cancelled);
    }

    #[tokio::test]
    async fn test_actor_stops_after_last_parent_finish() {
        // A bare dataset transformation with two parents only exits after
        // both report finished.
        struct Probe {
            dataset: Dataset,
        }

        #[async_trait]
        impl Transformation for Probe {
            async fn process(&mut self, _p: DatasetID, _b: Arc<Block>) -> Result<()> {
                Ok(())
            }
            async fn retract_block(
                &mut self,
                _p: DatasetID,
                _k: &PartitionKey,
            ) -> Result<()> {
                Ok(())
            }
            async fn update_watermark(&mut self, _p: DatasetID, _t: Time) -> Result<()> {
                Ok(())
            }
            async fn update_processing_time(&mut self, _p: DatasetID, _t: Time) -> Result<()> {
                Ok(())
            }
            async fn finish(&mut self, _p: DatasetID, err: Option<Error>) -> Result<()> {
                self.dataset.finish(err).await
            }
            async fn abort(&mut self, err: Error) {
                let _ = self.dataset.finish(Some(err)).await;
            }
        }

        let (out_tx, mut out_rx) = mpsc::channel(8);
        let probe = Probe {
            dataset: Dataset::new(
                DatasetID(3),
                AccumulationMode::Discarding,
                vec![Subscriber::new(out_tx)],
            ),
        };
        let (in_tx, in_rx) = mpsc::channel(8);
        let (_sd_tx, sd_rx) = watch::channel(false);
        let handle = tokio::spawn(run_transformation(Box::new(probe), in_rx, sd_rx, 2));

        in_tx
            .send(Message::Finish(DatasetID(1), None))
            .await
            .unwrap();
        in_tx
            .send(Message::Finish(DatasetID(2), None))
            .await
            .unwrap();
        handle.await.unwrap();

        // The probe's dataset finished exactly once.
        let mut finishes = 0;
        while let Ok(msg) = out_rx.try_recv() {
            if matches!(msg, Message::Finish(..)) {
                finishes += 1;
            }
        }
        assert_eq!(finishes, 1);
    }
}
