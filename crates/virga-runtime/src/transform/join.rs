//! Join: watermark-gated co-grouping across parents
//!
//! Rows from every parent are buffered per `(on-values, time)` group. A
//! group finalizes once the minimum watermark across parents passes its
//! time: complete groups evaluate the join expression and emit one row,
//! incomplete groups drop (inner join).

use crate::block::{Block, Column, ColumnData, PartitionKey, TIME_COL, VALUE_COL};
use crate::dataset::{Dataset, MinTracker};
use crate::transform::Transformation;
use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tracing::trace;
use virga_core::{expr, Bounds, Error, Record, ReferenceKind, Result, Time, Value};
use virga_query::ops::JoinSpec;
use virga_query::DatasetID;

struct JoinGroup {
    on_values: Vec<(String, Value)>,
    time: Time,
    bounds: Bounds,
    /// Latest `_value` seen per parent; the newest row wins within a group.
    rows: FxHashMap<DatasetID, Value>,
}

/// Inner join over two or more parents on an ordered set of column labels.
pub struct JoinTransformation {
    dataset: Dataset,
    on: Vec<String>,
    eval: virga_core::Expr,
    parents: Vec<DatasetID>,
    /// Identifier name each parent's rows answer to; `$` marks the
    /// anonymous pipeline position.
    names: FxHashMap<DatasetID, String>,
    groups: FxHashMap<String, JoinGroup>,
    watermarks: MinTracker,
    processing: MinTracker,
    finished: FxHashSet<DatasetID>,
    failed: Option<Error>,
}

impl JoinTransformation {
    pub fn new(
        dataset: Dataset,
        spec: &JoinSpec,
        parents: Vec<DatasetID>,
        names: FxHashMap<DatasetID, String>,
    ) -> Self {
        JoinTransformation {
            dataset,
            on: spec.on.clone(),
            eval: spec.eval.clone(),
            watermarks: MinTracker::new(parents.clone()),
            processing: MinTracker::new(parents.clone()),
            parents,
            names,
            groups: FxHashMap::default(),
            finished: FxHashSet::default(),
            failed: None,
        }
    }

    /// Finalize groups older than the effective watermark, in time order.
    async fn finalize_up_to(&mut self, horizon: Time) -> Result<()> {
        let mut due: Vec<String> = self
            .groups
            .iter()
            .filter(|(_, g)| g.time < horizon)
            .map(|(k, _)| k.clone())
            .collect();
        due.sort_by_key(|k| self.groups[k].time);

        for key in due {
            let group = self.groups.remove(&key).expect("due group exists");
            if group.rows.len() < self.parents.len() {
                // A partner never arrived; inner join drops the group.
                trace!(dataset = %self.dataset.id(), group = %key, "dropping partial join group");
                continue;
            }
            let record = GroupRecord {
                group: &group,
                names: &self.names,
                anonymous: self.parents.first().copied(),
            };
            let Some(value) = expr::eval(&self.eval, &record)? else {
                continue;
            };
            let block = group_block(&group, value)?;
            self.dataset.emit(Arc::new(block)).await?;
        }
        Ok(())
    }
}

/// Resolves join-expression references against one group: identifiers by
/// parent name, `$` to the anonymous parent, tags to the on columns.
struct GroupRecord<'a> {
    group: &'a JoinGroup,
    names: &'a FxHashMap<DatasetID, String>,
    anonymous: Option<DatasetID>,
}

impl Record for GroupRecord<'_> {
    fn lookup(&self, kind: ReferenceKind, name: &str) -> Option<Value> {
        match kind {
            ReferenceKind::Tag => self
                .group
                .on_values
                .iter()
                .find(|(l, _)| l == name)
                .map(|(_, v)| v.clone()),
            ReferenceKind::Field if name == "$" || name == VALUE_COL => {
                // The anonymous pipeline position: the parent named `$`,
                // or the first parent when none is.
                let id = self
                    .names
                    .iter()
                    .find(|(_, n)| n.as_str() == "$")
                    .map(|(id, _)| *id)
                    .or(self.anonymous)?;
                self.group.rows.get(&id).cloned()
            }
            ReferenceKind::Field | ReferenceKind::Identifier => {
                let id = self
                    .names
                    .iter()
                    .find(|(_, n)| n.as_str() == name)
                    .map(|(id, _)| *id)?;
                self.group.rows.get(&id).cloned()
            }
        }
    }
}

/// One emitted row: the on columns, the group time and the joined value.
fn group_block(group: &JoinGroup, value: Value) -> Result<Block> {
    let mut cols = Vec::with_capacity(group.on_values.len() + 2);
    let mut data = Vec::with_capacity(group.on_values.len() + 2);
    for (label, v) in &group.on_values {
        let typ = v
            .data_type()
            .ok_or_else(|| Error::Type(format!("join column {:?} has no column type", label)))?;
        cols.push(Column::new(label.clone(), typ));
        let mut col = ColumnData::new(typ);
        col.push(v)?;
        data.push(col);
    }
    cols.push(Column::new(TIME_COL, virga_core::DataType::Time));
    data.push(ColumnData::Time(vec![group.time]));

    let out_type = value
        .data_type()
        .ok_or_else(|| Error::Type("join expression yielded an untyped value".into()))?;
    cols.push(Column::new(VALUE_COL, out_type));
    let mut col = ColumnData::new(out_type);
    col.push(&value)?;
    data.push(col);

    Block::new(
        PartitionKey::new(group.on_values.clone()),
        group.bounds,
        cols,
        data,
    )
}

#[async_trait]
impl Transformation for JoinTransformation {
    async fn process(&mut self, parent: DatasetID, block: Arc<Block>) -> Result<()> {
        let times = block
            .times()
            .ok_or_else(|| Error::Type("join requires a _time column".into()))?;
        let value_data = block
            .col_data(VALUE_COL)
            .ok_or_else(|| Error::Type("join requires a _value column".into()))?;

        for (row, t) in times.iter().enumerate() {
            // The on values come from row columns, falling back to the key.
            let mut on_values = Vec::with_capacity(self.on.len());
            let mut complete = true;
            for label in &self.on {
                let value = block
                    .col_data(label)
                    .map(|d| d.value(row))
                    .or_else(|| block.key().get(label).cloned());
                match value {
                    Some(v) => on_values.push((label.clone(), v)),
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                continue;
            }

            let mut group_key = String::new();
            for (label, v) in &on_values {
                group_key.push_str(label);
                group_key.push('=');
                group_key.push_str(&v.to_string());
                group_key.push(',');
            }
            group_key.push_str(&t.nanos().to_string());

            let group = self
                .groups
                .entry(group_key)
                .or_insert_with(|| JoinGroup {
                    on_values,
                    time: *t,
                    bounds: block.bounds(),
                    rows: FxHashMap::default(),
                });
            group.bounds = group.bounds.union(&block.bounds());
            group.rows.insert(parent, value_data.value(row));
        }
        Ok(())
    }

    async fn retract_block(&mut self, _parent: DatasetID, key: &PartitionKey) -> Result<()> {
        let canonical = key.canonical();
        self.groups.retain(|k, _| !k.starts_with(&canonical));
        self.dataset.retract(key).await
    }

    async fn update_watermark(&mut self, parent: DatasetID, t: Time) -> Result<()> {
        if let Some(effective) = self.watermarks.update(parent, t) {
            self.finalize_up_to(effective).await?;
            self.dataset.update_watermark(effective).await?;
        }
        Ok(())
    }

    async fn update_processing_time(&mut self, parent: DatasetID, t: Time) -> Result<()> {
        if let Some(effective) = self.processing.update(parent, t) {
            self.dataset.update_processing_time(effective).await?;
        }
        Ok(())
    }

    async fn finish(&mut self, parent: DatasetID, err: Option<Error>) -> Result<()> {
        if let Some(e) = err {
            // First failing parent decides the terminal error.
            if self.failed.is_none() {
                self.failed = Some(e.clone());
            }
        }
        self.finished.insert(parent);
        if self.finished.len() < self.parents.len() {
            return Ok(());
        }
        match self.failed.take() {
            Some(e) => self.dataset.finish(Some(e)).await,
            None => {
                self.finalize_up_to(Time::MAX).await?;
                self.dataset.finish(None).await
            }
        }
    }

    async fn abort(&mut self, err: Error) {
        let _ = self.dataset.finish(Some(err)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{AccumulationMode, Message, Subscriber};
    use tokio::sync::mpsc;
    use virga_core::{BinaryOp, DataType, Expr};

    fn host_block(host: &str, value: i64, t: i64) -> Arc<Block> {
        Arc::new(
            Block::new(
                PartitionKey::empty().with("host", host),
                Bounds::new(Time(0), Time(1000)),
                vec![
                    Column::new(TIME_COL, DataType::Time),
                    Column::new("host", DataType::String),
                    Column::new(VALUE_COL, DataType::Int),
                ],
                vec![
                    ColumnData::Time(vec![Time(t)]),
                    ColumnData::String(vec![host.into()]),
                    ColumnData::Int(vec![value]),
                ],
            )
            .unwrap(),
        )
    }

    fn harness(eval: Expr, names: &[(u64, &str)]) -> (JoinTransformation, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(32);
        let dataset = Dataset::new(
            DatasetID(9),
            AccumulationMode::Discarding,
            vec![Subscriber::new(tx)],
        );
        let spec = JoinSpec {
            on: vec!["host".into()],
            eval,
            tables: Default::default(),
        };
        let parents: Vec<DatasetID> = names.iter().map(|(id, _)| DatasetID(*id)).collect();
        let name_map: FxHashMap<DatasetID, String> = names
            .iter()
            .map(|(id, n)| (DatasetID(*id), n.to_string()))
            .collect();
        (
            JoinTransformation::new(dataset, &spec, parents, name_map),
            rx,
        )
    }

    #[tokio::test]
    async fn test_inner_join_emits_matching_groups_only() {
        // join(on:["host"], exp:{a + b})
        let eval = Expr::binary(
            BinaryOp::Add,
            Expr::identifier("a"),
            Expr::identifier("b"),
        );
        let (mut t, mut rx) = harness(eval, &[(1, "a"), (2, "b")]);

        t.process(DatasetID(1), host_block("x", 1, 10)).await.unwrap();
        t.process(DatasetID(1), host_block("y", 2, 10)).await.unwrap();
        t.process(DatasetID(2), host_block("x", 10, 10)).await.unwrap();
        t.process(DatasetID(2), host_block("z", 20, 10)).await.unwrap();

        // Only one parent has reported: nothing finalizes yet.
        t.update_watermark(DatasetID(1), Time(100)).await.unwrap();
        assert!(rx.try_recv().is_err());

        t.update_watermark(DatasetID(2), Time(100)).await.unwrap();
        let Ok(Message::Process(_, block)) = rx.try_recv() else {
            panic!("expected the joined block");
        };
        assert_eq!(block.nrows(), 1);
        assert_eq!(
            block.key().get("host"),
            Some(&Value::Str("x".into()))
        );
        let idx = block.col_index(VALUE_COL).unwrap();
        assert_eq!(block.value(idx, 0), Value::Int(11));

        // The joined watermark is the min across parents.
        let Ok(Message::UpdateWatermark(_, wm)) = rx.try_recv() else {
            panic!("expected a watermark");
        };
        assert_eq!(wm, Time(100));

        // No other groups survived.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_anonymous_position() {
        // a.join(...) chained anonymously: exp:{a / $}
        let eval = Expr::binary(
            BinaryOp::Div,
            Expr::identifier("a"),
            Expr::field("$"),
        );
        let (mut t, mut rx) = harness(eval, &[(1, "$"), (2, "a")]);

        t.process(DatasetID(1), host_block("x", 4, 10)).await.unwrap();
        t.process(DatasetID(2), host_block("x", 12, 10)).await.unwrap();
        t.finish(DatasetID(1), None).await.unwrap();
        t.finish(DatasetID(2), None).await.unwrap();

        let Ok(Message::Process(_, block)) = rx.try_recv() else {
            panic!("expected the joined block");
        };
        let idx = block.col_index(VALUE_COL).unwrap();
        assert_eq!(block.value(idx, 0), Value::Int(3));
    }

    #[tokio::test]
    async fn test_parent_error_propagates_once_all_finish() {
        let eval = Expr::identifier("a");
        let (mut t, mut rx) = harness(eval, &[(1, "a"), (2, "b")]);
        t.finish(DatasetID(1), Some(Error::Io("boom".into())))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        t.finish(DatasetID(2), None).await.unwrap();
        let Ok(Message::Finish(_, Some(Error::Io(_)))) = rx.try_recv() else {
            panic!("expected the propagated error");
        };
    }
}
