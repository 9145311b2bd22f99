//! Storage interface and the storage-driven source
//!
//! A source owns no mailbox: it drives itself, paging reads out of the
//! storage backend window by window, forwarding every block to its
//! subscribers and advancing their watermark after each batch.

use crate::block::Block;
use crate::dataset::{Dataset, Subscriber};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};
use virga_core::{Bounds, Duration, Error, Expr, Result, Time};
use virga_query::DatasetID;

/// Description of a storage read, handed to the backend.
#[derive(Debug, Clone, Default)]
pub struct ReadSpec {
    pub database: String,
    pub measurement: Option<String>,
    /// Tag predicate the backend may push into its index scan.
    pub predicate: Option<Expr>,
    pub fields: Vec<String>,
    pub aggregates: Vec<ReadAggregate>,
    pub descending: bool,
    /// Zero means unlimited.
    pub limit: u64,
}

/// A storage-side aggregate hint.
#[derive(Debug, Clone)]
pub struct ReadAggregate {
    pub kind: String,
    pub columns: Vec<String>,
}

/// Per-read context; carries the trace baggage across the storage boundary.
#[derive(Debug, Clone, Default)]
pub struct ReadContext {
    pub trace: HashMap<String, String>,
}

pub type BlockIter = Box<dyn Iterator<Item = Block> + Send>;

/// The pluggable storage backend.
#[async_trait]
pub trait StorageReader: Send + Sync {
    /// Read all series blocks of `spec` with row times in `[start, stop)`.
    async fn read(
        &self,
        ctx: &ReadContext,
        spec: &ReadSpec,
        start: Time,
        stop: Time,
    ) -> Result<BlockIter>;
}

/// A root pipeline node that produces blocks on its own.
#[async_trait]
pub trait Source: Send {
    async fn run(&mut self, shutdown: watch::Receiver<bool>);
}

/// Storage-backed source: pages `[current - period, current)` reads,
/// stepping by `every`, until the read window leaves the bounds.
pub struct StorageSource {
    dataset: Dataset,
    reader: Arc<dyn StorageReader>,
    read_spec: ReadSpec,
    bounds: Bounds,
    every: Duration,
    period: Duration,
    current: Time,
}

impl StorageSource {
    pub fn new(
        dataset: Dataset,
        reader: Arc<dyn StorageReader>,
        read_spec: ReadSpec,
        bounds: Bounds,
        every: Duration,
        period: Duration,
    ) -> Self {
        let current = bounds.start + every;
        StorageSource {
            dataset,
            reader,
            read_spec,
            bounds,
            every,
            period,
            current,
        }
    }

    /// The next read window, stepping `current` forward.
    fn next_bounds(&mut self) -> Option<(Time, Time)> {
        let start = self.current - self.period;
        let stop = self.current;
        self.current = self.current + self.every;
        if stop > self.bounds.stop {
            return None;
        }
        Some((start, stop))
    }
}

#[async_trait]
impl Source for StorageSource {
    async fn run(&mut self, shutdown: watch::Receiver<bool>) {
        let ctx = ReadContext::default();
        loop {
            if *shutdown.borrow() {
                let _ = self.dataset.finish(Some(Error::Cancelled)).await;
                return;
            }
            let Some((start, stop)) = self.next_bounds() else {
                break;
            };
            debug!(dataset = %self.dataset.id(), %start, %stop, "storage read");
            match self.reader.read(&ctx, &self.read_spec, start, stop).await {
                Ok(blocks) => {
                    for block in blocks {
                        if *shutdown.borrow() {
                            let _ = self.dataset.finish(Some(Error::Cancelled)).await;
                            return;
                        }
                        if self.dataset.emit(Arc::new(block)).await.is_err() {
                            return;
                        }
                        let _ = self.dataset.update_processing_time(Time::now()).await;
                    }
                    if self.dataset.update_watermark(stop).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    error!(dataset = %self.dataset.id(), error = %e, "storage read failed");
                    let _ = self.dataset.finish(Some(e)).await;
                    return;
                }
            }
        }
        let _ = self.dataset.finish(None).await;
    }
}

/// Build the dataset for a source node; shared by source factories.
pub fn source_dataset(id: DatasetID, subs: Vec<Subscriber>) -> Dataset {
    Dataset::new(id, Default::default(), subs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Column, ColumnData, PartitionKey, TIME_COL, VALUE_COL};
    use crate::dataset::Message;
    use tokio::sync::mpsc;
    use virga_core::DataType;

    struct OneBatchReader;

    #[async_trait]
    impl StorageReader for OneBatchReader {
        async fn read(
            &self,
            _ctx: &ReadContext,
            _spec: &ReadSpec,
            start: Time,
            stop: Time,
        ) -> Result<BlockIter> {
            let block = Block::new(
                PartitionKey::empty(),
                Bounds::new(start, stop),
                vec![
                    Column::new(TIME_COL, DataType::Time),
                    Column::new(VALUE_COL, DataType::Int),
                ],
                vec![
                    ColumnData::Time(vec![start]),
                    ColumnData::Int(vec![1]),
                ],
            )?;
            Ok(Box::new(std::iter::once(block)))
        }
    }

    #[tokio::test]
    async fn test_source_emits_blocks_then_watermark_then_finish() {
        let (tx, mut rx) = mpsc::channel(32);
        let dataset = source_dataset(DatasetID(0), vec![Subscriber::new(tx)]);
        let bounds = Bounds::new(Time(0), Time(100));
        let mut source = StorageSource::new(
            dataset,
            Arc::new(OneBatchReader),
            ReadSpec::default(),
            bounds,
            Duration(50),
            Duration(50),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        source.run(shutdown_rx).await;

        // Processing-time updates are wall-clock driven; check the ordering
        // of the logical messages only.
        let mut kinds = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                Message::Process(..) => kinds.push("process"),
                Message::UpdateWatermark(_, t) => {
                    assert!(t == Time(50) || t == Time(100));
                    kinds.push("watermark");
                }
                Message::UpdateProcessingTime(..) => {}
                Message::Finish(_, err) => {
                    assert!(err.is_none());
                    kinds.push("finish");
                }
                Message::RetractBlock(..) => kinds.push("retract"),
            }
        }
        assert_eq!(
            kinds,
            vec!["process", "watermark", "process", "watermark", "finish"]
        );
    }

    struct FailingReader;

    #[async_trait]
    impl StorageReader for FailingReader {
        async fn read(
            &self,
            _ctx: &ReadContext,
            _spec: &ReadSpec,
            _start: Time,
            _stop: Time,
        ) -> Result<BlockIter> {
            Err(Error::Io("storage unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_reader_error_finishes_with_error() {
        let (tx, mut rx) = mpsc::channel(8);
        let dataset = source_dataset(DatasetID(0), vec![Subscriber::new(tx)]);
        let mut source = StorageSource::new(
            dataset,
            Arc::new(FailingReader),
            ReadSpec::default(),
            Bounds::new(Time(0), Time(100)),
            Duration(100),
            Duration(100),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        source.run(shutdown_rx).await;

        let msg = rx.recv().await.unwrap();
        let Message::Finish(_, Some(Error::Io(_))) = msg else {
            panic!("expected Finish with Io error, got {:?}", msg);
        };
    }
}
