//! Filter: per-row expression predicate

use crate::block::{Block, PartitionKey};
use crate::dataset::Dataset;
use crate::transform::Transformation;
use async_trait::async_trait;
use std::sync::Arc;
use virga_core::{expr, Error, Expr, Result, Time, Value};
use virga_query::DatasetID;

/// Evaluates the filter expression against each row record; rows yielding
/// `true` pass. Missing references exclude the row; type mismatches fail
/// the query. Per-row evaluation is the only place the engine swallows
/// an error, and only by excluding that row.
pub struct FilterTransformation {
    dataset: Dataset,
    expression: Expr,
}

impl FilterTransformation {
    pub fn new(dataset: Dataset, expression: Expr) -> Self {
        FilterTransformation {
            dataset,
            expression,
        }
    }
}

#[async_trait]
impl Transformation for FilterTransformation {
    async fn process(&mut self, _parent: DatasetID, block: Arc<Block>) -> Result<()> {
        let mut keep = Vec::with_capacity(block.nrows());
        for row in 0..block.nrows() {
            let record = block.row(row);
            match expr::eval(&self.expression, &record)? {
                Some(Value::Bool(b)) => keep.push(b),
                Some(other) => {
                    return Err(Error::Type(format!(
                        "filter expression must yield bool, got {}",
                        other.type_name()
                    )))
                }
                // A row its references cannot resolve against is excluded.
                None => keep.push(false),
            }
        }
        if keep.iter().all(|k| *k) {
            return self.dataset.emit(block).await;
        }
        if keep.iter().any(|k| *k) {
            let filtered = block.retain_rows(&keep, block.bounds());
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
    use virga_core::{BinaryOp, Bounds, DataType};

    fn tagged_block() -> Arc<Block> {
        Arc::new(
            Block::new(
                PartitionKey::empty(),
                Bounds::new(Time(0), Time(100)),
                vec![
                    Column::new(TIME_COL, DataType::Time),
                    Column::new("t1", DataType::String),
                    Column::new(VALUE_COL, DataType::Int),
                ],
                vec![
                    ColumnData::Time(vec![Time(1), Time(2), Time(3)]),
                    ColumnData::String(vec!["v1".into(), "v2".into(), "v1".into()]),
                    ColumnData::Int(vec![10, 10, 7]),
                ],
            )
            .unwrap(),
        )
    }

    fn harness(expression: Expr) -> (FilterTransformation, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        let dataset = Dataset::new(
            DatasetID(1),
            AccumulationMode::Discarding,
            vec![Subscriber::new(tx)],
        );
        (FilterTransformation::new(dataset, expression), rx)
    }

    #[tokio::test]
    async fn test_tag_and_field_predicate() {
        // "t1" == "v1" and $ == 10
        let expression = Expr::binary(
            BinaryOp::And,
            Expr::binary(BinaryOp::Eq, Expr::tag("t1"), Expr::string("v1")),
            Expr::binary(BinaryOp::Eq, Expr::field("$"), Expr::int(10)),
        );
        let (mut t, mut rx) = harness(expression);
        t.process(DatasetID(0), tagged_block()).await.unwrap();
        let Ok(Message::Process(_, out)) = rx.try_recv() else {
            panic!("expected an emitted block");
        };
        assert_eq!(out.nrows(), 1);
        assert_eq!(out.times(), Some(&[Time(1)][..]));
    }

    #[tokio::test]
    async fn test_missing_reference_excludes_rows() {
        let expression = Expr::binary(BinaryOp::Eq, Expr::tag("ghost"), Expr::string("v1"));
        let (mut t, mut rx) = harness(expression);
        t.process(DatasetID(0), tagged_block()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_type_mismatch_fails_query() {
        // Regex applied to an int-typed field.
        let expression = Expr::binary(
            BinaryOp::RegexMatch,
            Expr::field("$"),
            Expr::RegexLiteral {
                value: virga_core::value::Pattern::new("v.*").unwrap(),
            },
        );
        let (mut t, _rx) = harness(expression);
        let err = t.process(DatasetID(0), tagged_block()).await.unwrap_err();
        assert!(matches!(err, Error::Type(_)));
    }
}
