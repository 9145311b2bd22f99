//! Window: re-key rows into aligned time buckets

use crate::block::{Block, Column, PartitionKey, START_COL, STOP_COL};
use crate::builder::BlockBuilderCache;
use crate::dataset::Dataset;
use crate::transform::Transformation;
use async_trait::async_trait;
use std::sync::Arc;
use virga_core::{Bounds, DataType, Error, Result, Time, Value};
use virga_query::ops::WindowSpec;
use virga_query::DatasetID;

/// Assigns each row to every window `[w, w + period)` with
/// `w = floor((t - offset) / every) * every + offset`; rows belong to
/// several windows when `period > every` (sliding). The output partition
/// key extends the input key with `(_start, _stop)`.
pub struct WindowTransformation {
    dataset: Dataset,
    cache: BlockBuilderCache,
    every: i64,
    period: i64,
    offset: i64,
    round: i64,
}

impl WindowTransformation {
    pub fn new(dataset: Dataset, cache: BlockBuilderCache, spec: &WindowSpec) -> Self {
        WindowTransformation {
            dataset,
            cache,
            every: spec.every.nanos(),
            period: spec.period.nanos(),
            offset: spec.offset.nanos(),
            round: spec.round.nanos(),
        }
    }

    /// All windows containing `t`, newest start first.
    fn windows_for(&self, t: Time) -> Vec<Bounds> {
        let t = t.nanos();
        let base = (t - self.offset).div_euclid(self.every) * self.every + self.offset;
        let mut out = Vec::new();
        let mut w = base;
        while w + self.period > t {
            let start = if self.round > 0 {
                w.div_euclid(self.round) * self.round
            } else {
                w
            };
            let bounds = Bounds::new(Time(start), Time(start + self.period));
            if bounds.contains(Time(t)) {
                out.push(bounds);
            }
            w -= self.every;
        }
        out
    }
}

#[async_trait]
impl Transformation for WindowTransformation {
    async fn process(&mut self, _parent: DatasetID, block: Arc<Block>) -> Result<()> {
        let times = block
            .times()
            .ok_or_else(|| Error::Type("window requires a _time column".into()))?;

        // Re-windowing replaces any previous bucket columns.
        let base_key = block.key().without(&[START_COL, STOP_COL]);
        let cols: Vec<Column> = block
            .cols()
            .iter()
            .filter(|c| c.label != START_COL && c.label != STOP_COL)
            .cloned()
            .chain([
                Column::new(START_COL, DataType::Time),
                Column::new(STOP_COL, DataType::Time),
            ])
            .collect();
        let col_indexes: Vec<usize> = block
            .cols()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.label != START_COL && c.label != STOP_COL)
            .map(|(i, _)| i)
            .collect();

        for (row, t) in times.iter().enumerate() {
            for bounds in self.windows_for(*t) {
                let key = base_key
                    .clone()
                    .with(START_COL, bounds.start)
                    .with(STOP_COL, bounds.stop);
                let mut values: Vec<Value> = col_indexes
                    .iter()
                    .map(|&i| block.value(i, row))
                    .collect();
                values.push(Value::Time(bounds.start));
                values.push(Value::Time(bounds.stop));
                self.cache
                    .get_or_create(&key, bounds, &cols)
                    .append_row(&values)?;
            }
        }
        Ok(())
    }

    async fn retract_block(&mut self, _parent: DatasetID, key: &PartitionKey) -> Result<()> {
        self.cache.discard(key);
        self.dataset.retract(key).await
    }

    async fn update_watermark(&mut self, _parent: DatasetID, t: Time) -> Result<()> {
        for block in self.cache.flush_due(t)? {
            self.dataset.emit(Arc::new(block)).await?;
        }
        self.dataset.update_watermark(t).await
    }

    async fn update_processing_time(&mut self, _parent: DatasetID, t: Time) -> Result<()> {
        self.dataset.update_processing_time(t).await
    }

    async fn finish(&mut self, _parent: DatasetID, err: Option<Error>) -> Result<()> {
        if err.is_none() {
            for block in self.cache.flush_all()? {
                self.dataset.emit(Arc::new(block)).await?;
            }
        }
        self.dataset.finish(err).await
    }

    async fn abort(&mut self, err: Error) {
        let _ = self.dataset.finish(Some(err)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocator;
    use crate::block::{ColumnData, TIME_COL, VALUE_COL};
    use crate::dataset::{AccumulationMode, Message, Subscriber};
    use tokio::sync::mpsc;
    use virga_core::{Duration, TimeSpec};

    const HOUR: i64 = 3_600_000_000_000;

    fn spec(every: i64, period: i64) -> WindowSpec {
        WindowSpec {
            start: TimeSpec::absolute(Time(0)),
            every: Duration(every),
            period: Duration(period),
            round: Duration::ZERO,
            offset: Duration::ZERO,
        }
    }

    fn harness(spec: &WindowSpec) -> (WindowTransformation, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(32);
        let dataset = Dataset::new(
            DatasetID(1),
            AccumulationMode::Discarding,
            vec![Subscriber::new(tx)],
        );
        let cache = BlockBuilderCache::new(Arc::new(Allocator::unlimited()));
        (WindowTransformation::new(dataset, cache, spec), rx)
    }

    fn block(times: Vec<i64>, values: Vec<f64>) -> Arc<Block> {
        let stop = times.iter().max().copied().unwrap_or(0) + 1;
        Arc::new(
            Block::new(
                PartitionKey::empty(),
                Bounds::new(Time(0), Time(stop)),
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

    #[test]
    fn test_window_assignment_tumbling() {
        let (t, _rx) = harness(&spec(HOUR, HOUR));
        assert_eq!(t.windows_for(Time(0)), vec![Bounds::new(Time(0), Time(HOUR))]);
        assert_eq!(
            t.windows_for(Time(HOUR)),
            vec![Bounds::new(Time(HOUR), Time(2 * HOUR))]
        );
        // Negative times floor toward the earlier window.
        assert_eq!(
            t.windows_for(Time(-1)),
            vec![Bounds::new(Time(-HOUR), Time(0))]
        );
    }

    #[test]
    fn test_window_assignment_sliding() {
        // period 2h, every 1h: each row lands in two windows.
        let (t, _rx) = harness(&spec(HOUR, 2 * HOUR));
        let windows = t.windows_for(Time(HOUR + 1));
        assert_eq!(
            windows,
            vec![
                Bounds::new(Time(HOUR), Time(3 * HOUR)),
                Bounds::new(Time(0), Time(2 * HOUR)),
            ]
        );
    }

    #[tokio::test]
    async fn test_rows_bucketed_and_flushed_by_watermark() {
        let (mut t, mut rx) = harness(&spec(HOUR, HOUR));
        t.process(DatasetID(0), block(vec![0, HOUR / 2, HOUR], vec![2.0, 4.0, 6.0]))
            .await
            .unwrap();

        // Watermark past the first window flushes only that bucket.
        t.update_watermark(DatasetID(0), Time(HOUR)).await.unwrap();
        let Ok(Message::Process(_, first)) = rx.try_recv() else {
            panic!("expected the first window");
        };
        assert_eq!(first.nrows(), 2);
        assert_eq!(
            first.key().get(START_COL),
            Some(&Value::Time(Time(0)))
        );
        assert_eq!(
            first.key().get(STOP_COL),
            Some(&Value::Time(Time(HOUR)))
        );
        let Ok(Message::UpdateWatermark(_, Time(w))) = rx.try_recv() else {
            panic!("expected the watermark to follow");
        };
        assert_eq!(w, HOUR);

        // Completion flushes the second bucket.
        t.finish(DatasetID(0), None).await.unwrap();
        let Ok(Message::Process(_, second)) = rx.try_recv() else {
            panic!("expected the second window");
        };
        assert_eq!(second.nrows(), 1);
        assert_eq!(
            second.key().get(START_COL),
            Some(&Value::Time(Time(HOUR)))
        );
    }
}
