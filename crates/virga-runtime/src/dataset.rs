//! Datasets: the output streams of sources and transformations
//!
//! A dataset owns the downstream subscriptions of one pipeline node and the
//! node's watermark/processing-time bookkeeping. Watermarks never recede;
//! multi-parent nodes reduce their parents' marks with a min tracker, so no
//! parent's rows are prematurely considered final.

use crate::block::{Block, PartitionKey};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;
use virga_core::{Error, Result, Time};
use virga_query::DatasetID;

/// Whether aggregate state is dropped or retained after a window emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccumulationMode {
    #[default]
    Discarding,
    Accumulating,
}

/// The message protocol between pipeline nodes. Per `(parent, partition)`
/// order is the channel order; everything a node hears is serialized
/// through its one mailbox.
#[derive(Debug, Clone)]
pub enum Message {
    Process(DatasetID, Arc<Block>),
    UpdateWatermark(DatasetID, Time),
    UpdateProcessingTime(DatasetID, Time),
    RetractBlock(DatasetID, PartitionKey),
    Finish(DatasetID, Option<Error>),
}

/// A downstream mailbox attached to a dataset.
#[derive(Debug, Clone)]
pub struct Subscriber {
    tx: mpsc::Sender<Message>,
}

impl Subscriber {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Subscriber { tx }
    }

    pub async fn send(&self, msg: Message) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| Error::Cancelled)
    }
}

/// Output stream of one source or transformation.
pub struct Dataset {
    id: DatasetID,
    mode: AccumulationMode,
    subs: Vec<Subscriber>,
    watermark: Option<Time>,
    processing_time: Option<Time>,
    finished: bool,
}

impl Dataset {
    pub fn new(id: DatasetID, mode: AccumulationMode, subs: Vec<Subscriber>) -> Self {
        Dataset {
            id,
            mode,
            subs,
            watermark: None,
            processing_time: None,
            finished: false,
        }
    }

    pub fn id(&self) -> DatasetID {
        self.id
    }

    pub fn mode(&self) -> AccumulationMode {
        self.mode
    }

    pub fn watermark(&self) -> Option<Time> {
        self.watermark
    }

    /// Forward one block to every subscriber.
    pub async fn emit(&mut self, block: Arc<Block>) -> Result<()> {
        trace!(dataset = %self.id, rows = block.nrows(), key = %block.key(), "emit block");
        for sub in &self.subs {
            sub.send(Message::Process(self.id, Arc::clone(&block))).await?;
        }
        Ok(())
    }

    /// Advance the watermark; regressions are dropped, never forwarded.
    pub async fn update_watermark(&mut self, t: Time) -> Result<()> {
        if self.watermark.is_some_and(|w| t <= w) {
            return Ok(());
        }
        self.watermark = Some(t);
        for sub in &self.subs {
            sub.send(Message::UpdateWatermark(self.id, t)).await?;
        }
        Ok(())
    }

    pub async fn update_processing_time(&mut self, t: Time) -> Result<()> {
        if self.processing_time.is_some_and(|p| t <= p) {
            return Ok(());
        }
        self.processing_time = Some(t);
        for sub in &self.subs {
            sub.send(Message::UpdateProcessingTime(self.id, t)).await?;
        }
        Ok(())
    }

    /// Tell downstream a previously emitted partition is no longer valid.
    pub async fn retract(&mut self, key: &PartitionKey) -> Result<()> {
        for sub in &self.subs {
            sub.send(Message::RetractBlock(self.id, key.clone())).await?;
        }
        Ok(())
    }

    /// Propagate completion once; later calls are no-ops.
    pub async fn finish(&mut self, err: Option<Error>) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        for sub in &self.subs {
            sub.send(Message::Finish(self.id, err.clone())).await?;
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Min-reduce over per-parent times; the effective value exists only once
/// every parent has reported.
pub struct MinTracker {
    parents: Vec<DatasetID>,
    values: FxHashMap<DatasetID, Time>,
}

impl MinTracker {
    pub fn new(parents: Vec<DatasetID>) -> Self {
        MinTracker {
            parents,
            values: FxHashMap::default(),
        }
    }

    /// Record a parent's time; per-parent values never recede. Returns the
    /// new effective minimum when all parents have reported.
    pub fn update(&mut self, parent: DatasetID, t: Time) -> Option<Time> {
        let entry = self.values.entry(parent).or_insert(t);
        if t > *entry {
            *entry = t;
        }
        self.effective()
    }

    pub fn effective(&self) -> Option<Time> {
        if self.values.len() < self.parents.len() {
            return None;
        }
        self.parents
            .iter()
            .map(|p| self.values.get(p).copied())
            .min()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watermark_monotonic() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut d = Dataset::new(
            DatasetID(1),
            AccumulationMode::Discarding,
            vec![Subscriber::new(tx)],
        );
        d.update_watermark(Time(10)).await.unwrap();
        d.update_watermark(Time(5)).await.unwrap();
        d.update_watermark(Time(20)).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::UpdateWatermark(_, t) = msg {
                seen.push(t);
            }
        }
        assert_eq!(seen, vec![Time(10), Time(20)]);
    }

    #[tokio::test]
    async fn test_finish_is_idempotent() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut d = Dataset::new(
            DatasetID(1),
            AccumulationMode::Discarding,
            vec![Subscriber::new(tx)],
        );
        d.finish(None).await.unwrap();
        d.finish(Some(Error::Cancelled)).await.unwrap();

        let mut finishes = 0;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, Message::Finish(..)) {
                finishes += 1;
            }
        }
        assert_eq!(finishes, 1);
    }

    #[test]
    fn test_min_tracker_waits_for_all_parents() {
        let a = DatasetID(1);
        let b = DatasetID(2);
        let mut tracker = MinTracker::new(vec![a, b]);
        assert_eq!(tracker.update(a, Time(20)), None);
        assert_eq!(tracker.update(b, Time(15)), Some(Time(15)));
        // A slower report from `a` cannot pull the minimum backwards.
        assert_eq!(tracker.update(a, Time(10)), Some(Time(15)));
        assert_eq!(tracker.update(b, Time(30)), Some(Time(20)));
    }
}
