//! Range: stateless time-bounds filter

use crate::block::{Block, PartitionKey};
use crate::dataset::Dataset;
use crate::transform::Transformation;
use async_trait::async_trait;
use std::sync::Arc;
use virga_core::{Bounds, Error, Result, Time};
use virga_query::DatasetID;

/// Passes rows whose time lies in `[start, stop)`; blocks entirely outside
/// the bounds are dropped whole, blocks entirely inside pass through
/// without copying.
pub struct RangeTransformation {
    dataset: Dataset,
    bounds: Bounds,
}

impl RangeTransformation {
    pub fn new(dataset: Dataset, bounds: Bounds) -> Self {
        RangeTransformation { dataset, bounds }
    }
}

#[async_trait]
impl Transformation for RangeTransformation {
    async fn process(&mut self, _parent: DatasetID, block: Arc<Block>) -> Result<()> {
        if !self.bounds.overlaps(&block.bounds()) {
            return Ok(());
        }
        let clipped = self.bounds.intersect(&block.bounds());
        let Some(times) = block.times() else {
            // No time column: the block's bounds are all we can filter on.
            return self.dataset.emit(block).await;
        };
        if times.iter().all(|t| self.bounds.contains(*t)) {
            return self.dataset.emit(block).await;
        }
        let keep: Vec<bool> = times.iter().map(|t| self.bounds.contains(*t)).collect();
        if keep.iter().any(|k| *k) {
            let filtered = block.retain_rows(&keep, clipped);
            self.dataset.emit(Arc::new(filtered)).await?;
        }
        Ok(())
    }

    async fn retract_block(&mut self, _parent: DatasetID, key: &PartitionKey) -> Result<()> {
        self.dataset.retract(key).await
    }

    async fn update_watermark(&mut self, _parent: DatasetID, t: Time) -> Result<()> {
        self.dataset.update_watermark(t).await
    }

    async fn update_processing_time(&mut self, _parent: DatasetID, t: Time) -> Result<()> {
        self.dataset.update_processing_time(t).await
    }

    async fn finish(&mut self, _parent: DatasetID, err: Option<Error>) -> Result<()> {
        self.dataset.finish(err).await
    }

    async fn abort(&mut self, err: Error) {
        let _ = self.dataset.finish(Some(err)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Column, ColumnData, TIME_COL, VALUE_COL};
    use crate::dataset::{AccumulationMode, Message, Subscriber};
    use tokio::sync::mpsc;
    use virga_core::DataType;

    fn block(times: Vec<i64>, bounds: Bounds) -> Arc<Block> {
        let values = vec![1.0; times.len()];
        Arc::new(
            Block::new(
                PartitionKey::empty(),
                bounds,
                vec![
                    Column::new(TIME_COL, DataType::Time),
                    Column::new(VALUE_COL, DataType::Float),
                ],
                vec![
                    ColumnData::Time(times.into_iter().map(Time).collect()),
                    ColumnData::Float(values),
                ],
            )
            .unwrap(),
        )
    }

    fn harness(bounds: Bounds) -> (RangeTransformation, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        let dataset = Dataset::new(
            DatasetID(1),
            AccumulationMode::Discarding,
            vec![Subscriber::new(tx)],
        );
        (RangeTransformation::new(dataset, bounds), rx)
    }

    #[tokio::test]
    async fn test_drops_blocks_outside_bounds() {
        let (mut t, mut rx) = harness(Bounds::new(Time(100), Time(200)));
        t.process(DatasetID(0), block(vec![10, 20], Bounds::new(Time(0), Time(50))))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_filters_partial_blocks() {
        let (mut t, mut rx) = harness(Bounds::new(Time(15), Time(100)));
        t.process(
            DatasetID(0),
            block(vec![10, 20, 30], Bounds::new(Time(0), Time(50))),
        )
        .await
        .unwrap();
        let Ok(Message::Process(_, out)) = rx.try_recv() else {
            panic!("expected an emitted block");
        };
        assert_eq!(out.nrows(), 2);
        assert_eq!(out.times(), Some(&[Time(20), Time(30)][..]));
        assert_eq!(out.bounds(), Bounds::new(Time(15), Time(50)));
    }

    #[tokio::test]
    async fn test_applying_twice_is_idempotent() {
        let bounds = Bounds::new(Time(15), Time(100));
        let (mut first, mut rx1) = harness(bounds);
        first
            .process(
                DatasetID(0),
                block(vec![10, 20, 30], Bounds::new(Time(0), Time(50))),
            )
            .await
            .unwrap();
        let Ok(Message::Process(_, once)) = rx1.try_recv() else {
            panic!("expected an emitted block");
        };

        let (mut second, mut rx2) = harness(bounds);
        second.process(DatasetID(0), Arc::clone(&once)).await.unwrap();
        let Ok(Message::Process(_, twice)) = rx2.try_recv() else {
            panic!("expected an emitted block");
        };
        assert_eq!(&*once, &*twice);
    }
}
