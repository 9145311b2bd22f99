//! Aggregates: sum, count, mean, min, max, stddev
//!
//! An aggregate offers a fresh accumulator per input type (or `None` when
//! it does not accept that type); the engine folds column slices into the
//! accumulator and emits one output row per partition when the watermark
//! passes the partition's window, carrying the window's `_stop` as the
//! output time.

use crate::block::{Block, Column, ColumnData, PartitionKey, TIME_COL, VALUE_COL};
use crate::dataset::{AccumulationMode, Dataset};
use crate::transform::Transformation;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use virga_core::{Bounds, DataType, Error, Result, Time, Value};
use virga_query::plan::AggregateKind;
use virga_query::DatasetID;

/// One aggregate function; yields typed accumulators.
pub trait Aggregate: Send + Sync {
    fn kind(&self) -> &'static str;

    /// A fresh accumulator for the input type, or `None` when the
    /// aggregate does not accept it.
    fn new_state(&self, input: DataType) -> Option<Box<dyn AggregateState>>;
}

/// A mutable accumulator being fed column slices of its accepted type.
pub trait AggregateState: Send {
    fn do_bools(&mut self, _vs: &[bool]) {}
    fn do_ints(&mut self, _vs: &[i64]) {}
    fn do_uints(&mut self, _vs: &[u64]) {}
    fn do_floats(&mut self, _vs: &[f64]) {}
    fn do_strings(&mut self, _vs: &[String]) {}
    fn do_times(&mut self, _vs: &[Time]) {}

    fn output_type(&self) -> DataType;
    fn value(&self) -> Value;
}

pub fn aggregate_for(kind: AggregateKind) -> Box<dyn Aggregate> {
    match kind {
        AggregateKind::Sum => Box::new(SumAgg),
        AggregateKind::Count => Box::new(CountAgg),
        AggregateKind::Mean => Box::new(MeanAgg),
        AggregateKind::Min => Box::new(ExtremeAgg { take_min: true }),
        AggregateKind::Max => Box::new(ExtremeAgg { take_min: false }),
        AggregateKind::Stddev => Box::new(StddevAgg),
    }
}

// ---------------------------------------------------------------------------
// sum: numeric only, output type equals input type

struct SumAgg;

impl Aggregate for SumAgg {
    fn kind(&self) -> &'static str {
        "sum"
    }

    fn new_state(&self, input: DataType) -> Option<Box<dyn AggregateState>> {
        match input {
            DataType::Int => Some(Box::new(SumInt { sum: 0 })),
            DataType::UInt => Some(Box::new(SumUInt { sum: 0 })),
            DataType::Float => Some(Box::new(SumFloat { sum: 0.0 })),
            _ => None,
        }
    }
}

struct SumInt {
    sum: i64,
}

impl AggregateState for SumInt {
    fn do_ints(&mut self, vs: &[i64]) {
        self.sum += vs.iter().sum::<i64>();
    }
    fn output_type(&self) -> DataType {
        DataType::Int
    }
    fn value(&self) -> Value {
        Value::Int(self.sum)
    }
}

struct SumUInt {
    sum: u64,
}

impl AggregateState for SumUInt {
    fn do_uints(&mut self, vs: &[u64]) {
        self.sum += vs.iter().sum::<u64>();
    }
    fn output_type(&self) -> DataType {
        DataType::UInt
    }
    fn value(&self) -> Value {
        Value::UInt(self.sum)
    }
}

struct SumFloat {
    sum: f64,
}

impl AggregateState for SumFloat {
    fn do_floats(&mut self, vs: &[f64]) {
        self.sum += vs.iter().sum::<f64>();
    }
    fn output_type(&self) -> DataType {
        DataType::Float
    }
    fn value(&self) -> Value {
        Value::Float(self.sum)
    }
}

// ---------------------------------------------------------------------------
// count: accepts every input type, output int

struct CountAgg;

impl Aggregate for CountAgg {
    fn kind(&self) -> &'static str {
        "count"
    }

    fn new_state(&self, _input: DataType) -> Option<Box<dyn AggregateState>> {
        Some(Box::new(CountState { n: 0 }))
    }
}

struct CountState {
    n: i64,
}

impl AggregateState for CountState {
    fn do_bools(&mut self, vs: &[bool]) {
        self.n += vs.len() as i64;
    }
    fn do_ints(&mut self, vs: &[i64]) {
        self.n += vs.len() as i64;
    }
    fn do_uints(&mut self, vs: &[u64]) {
        self.n += vs.len() as i64;
    }
    fn do_floats(&mut self, vs: &[f64]) {
        self.n += vs.len() as i64;
    }
    fn do_strings(&mut self, vs: &[String]) {
        self.n += vs.len() as i64;
    }
    fn do_times(&mut self, vs: &[Time]) {
        self.n += vs.len() as i64;
    }
    fn output_type(&self) -> DataType {
        DataType::Int
    }
    fn value(&self) -> Value {
        Value::Int(self.n)
    }
}

// ---------------------------------------------------------------------------
// mean: numeric, output float

struct MeanAgg;

impl Aggregate for MeanAgg {
    fn kind(&self) -> &'static str {
        "mean"
    }

    fn new_state(&self, input: DataType) -> Option<Box<dyn AggregateState>> {
        input
            .is_numeric()
            .then(|| Box::new(MeanState { sum: 0.0, n: 0 }) as Box<dyn AggregateState>)
    }
}

struct MeanState {
    sum: f64,
    n: u64,
}

impl AggregateState for MeanState {
    fn do_ints(&mut self, vs: &[i64]) {
        self.sum += vs.iter().map(|v| *v as f64).sum::<f64>();
        self.n += vs.len() as u64;
    }
    fn do_uints(&mut self, vs: &[u64]) {
        self.sum += vs.iter().map(|v| *v as f64).sum::<f64>();
        self.n += vs.len() as u64;
    }
    fn do_floats(&mut self, vs: &[f64]) {
        self.sum += vs.iter().sum::<f64>();
        self.n += vs.len() as u64;
    }
    fn output_type(&self) -> DataType {
        DataType::Float
    }
    fn value(&self) -> Value {
        if self.n == 0 {
            Value::Float(f64::NAN)
        } else {
            Value::Float(self.sum / self.n as f64)
        }
    }
}

// ---------------------------------------------------------------------------
// min / max: every ordered type, output type equals input type

struct ExtremeAgg {
    take_min: bool,
}

impl Aggregate for ExtremeAgg {
    fn kind(&self) -> &'static str {
        if self.take_min {
            "min"
        } else {
            "max"
        }
    }

    fn new_state(&self, input: DataType) -> Option<Box<dyn AggregateState>> {
        input.is_ordered().then(|| {
            Box::new(ExtremeState {
                take_min: self.take_min,
                typ: input,
                best: None,
            }) as Box<dyn AggregateState>
        })
    }
}

struct ExtremeState {
    take_min: bool,
    typ: DataType,
    best: Option<Value>,
}

impl ExtremeState {
    fn consider(&mut self, candidate: Value) {
        let better = match &self.best {
            None => true,
            Some(best) => {
                let ord = match (best, &candidate) {
                    (Value::Int(a), Value::Int(b)) => a.cmp(b),
                    (Value::UInt(a), Value::UInt(b)) => a.cmp(b),
                    (Value::Float(a), Value::Float(b)) => {
                        a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
                    }
                    (Value::Str(a), Value::Str(b)) => a.cmp(b),
                    (Value::Time(a), Value::Time(b)) => a.cmp(b),
                    _ => std::cmp::Ordering::Equal,
                };
                if self.take_min {
                    ord == std::cmp::Ordering::Greater
                } else {
                    ord == std::cmp::Ordering::Less
                }
            }
        };
        if better {
            self.best = Some(candidate);
        }
    }
}

impl AggregateState for ExtremeState {
    fn do_ints(&mut self, vs: &[i64]) {
        for v in vs {
            self.consider(Value::Int(*v));
        }
    }
    fn do_uints(&mut self, vs: &[u64]) {
        for v in vs {
            self.consider(Value::UInt(*v));
        }
    }
    fn do_floats(&mut self, vs: &[f64]) {
        for v in vs.iter().filter(|v| !v.is_nan()) {
            self.consider(Value::Float(*v));
        }
    }
    fn do_strings(&mut self, vs: &[String]) {
        for v in vs {
            self.consider(Value::Str(v.clone()));
        }
    }
    fn do_times(&mut self, vs: &[Time]) {
        for v in vs {
            self.consider(Value::Time(*v));
        }
    }
    fn output_type(&self) -> DataType {
        self.typ
    }
    fn value(&self) -> Value {
        self.best.clone().unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// stddev: numeric, output float, Welford's online algorithm

struct StddevAgg;

impl Aggregate for StddevAgg {
    fn kind(&self) -> &'static str {
        "stddev"
    }

    fn new_state(&self, input: DataType) -> Option<Box<dyn AggregateState>> {
        input.is_numeric().then(|| {
            Box::new(StddevState {
                n: 0.0,
                mean: 0.0,
                m2: 0.0,
            }) as Box<dyn AggregateState>
        })
    }
}

struct StddevState {
    n: f64,
    mean: f64,
    m2: f64,
}

impl StddevState {
    fn observe(&mut self, x: f64) {
        self.n += 1.0;
        let delta = x - self.mean;
        self.mean += delta / self.n;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }
}

impl AggregateState for StddevState {
    fn do_ints(&mut self, vs: &[i64]) {
        for v in vs {
            self.observe(*v as f64);
        }
    }
    fn do_uints(&mut self, vs: &[u64]) {
        for v in vs {
            self.observe(*v as f64);
        }
    }
    fn do_floats(&mut self, vs: &[f64]) {
        for v in vs {
            self.observe(*v);
        }
    }
    fn output_type(&self) -> DataType {
        DataType::Float
    }
    fn value(&self) -> Value {
        if self.n < 2.0 {
            return Value::Float(f64::NAN);
        }
        Value::Float((self.m2 / (self.n - 1.0)).sqrt())
    }
}

// ---------------------------------------------------------------------------
// The transformation driving an aggregate per partition

struct PartitionState {
    key: PartitionKey,
    bounds: Bounds,
    state: Box<dyn AggregateState>,
    dirty: bool,
}

/// Folds the `_value` column of each partition and emits a single-row block
/// per window once the watermark passes the window's stop.
pub struct AggregateTransformation {
    dataset: Dataset,
    agg: Box<dyn Aggregate>,
    states: FxHashMap<String, PartitionState>,
}

impl AggregateTransformation {
    pub fn new(dataset: Dataset, agg: Box<dyn Aggregate>) -> Self {
        AggregateTransformation {
            dataset,
            agg,
            states: FxHashMap::default(),
        }
    }

    fn feed(state: &mut Box<dyn AggregateState>, data: &ColumnData) {
        match data {
            ColumnData::Bool(vs) => state.do_bools(vs),
            ColumnData::Int(vs) => state.do_ints(vs),
            ColumnData::UInt(vs) => state.do_uints(vs),
            ColumnData::Float(vs) => state.do_floats(vs),
            ColumnData::String(vs) => state.do_strings(vs),
            ColumnData::Time(vs) => state.do_times(vs),
        }
    }

    async fn emit_due(&mut self, watermark: Time) -> Result<()> {
        let due: Vec<String> = self
            .states
            .iter()
            .filter(|(_, p)| p.dirty && watermark >= p.bounds.stop)
            .map(|(k, _)| k.clone())
            .collect();
        let discarding = self.dataset.mode() == AccumulationMode::Discarding;
        for key in due {
            let block = {
                let part = self.states.get_mut(&key).expect("due key exists");
                let block = result_block(part)?;
                part.dirty = false;
                block
            };
            self.dataset.emit(Arc::new(block)).await?;
            if discarding {
                self.states.remove(&key);
            }
        }
        Ok(())
    }
}

/// The single-row output block for one finalized partition.
fn result_block(part: &PartitionState) -> Result<Block> {
    let mut cols = Vec::with_capacity(part.key.entries().len() + 2);
    let mut data = Vec::with_capacity(part.key.entries().len() + 2);
    for (label, value) in part.key.entries() {
        let typ = value
            .data_type()
            .ok_or_else(|| Error::Type(format!("partition key {:?} has no column type", label)))?;
        cols.push(Column::new(label.clone(), typ));
        let mut col = ColumnData::new(typ);
        col.push(value)?;
        data.push(col);
    }
    // The window collapses to one row stamped with its stop time.
    cols.push(Column::new(TIME_COL, DataType::Time));
    let stop = part.bounds.stop;
    data.push(ColumnData::Time(vec![stop]));

    cols.push(Column::new(VALUE_COL, part.state.output_type()));
    let mut value_col = ColumnData::new(part.state.output_type());
    value_col.push(&part.state.value())?;
    data.push(value_col);

    Block::new(
        part.key.clone(),
        Bounds::new(part.bounds.start, Time(stop.nanos() + 1)),
        cols,
        data,
    )
}

#[async_trait]
impl Transformation for AggregateTransformation {
    async fn process(&mut self, _parent: DatasetID, block: Arc<Block>) -> Result<()> {
        let data = block.col_data(VALUE_COL).ok_or_else(|| {
            Error::Type(format!("{} requires a _value column", self.agg.kind()))
        })?;
        let part = match self.states.entry(block.key().canonical()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let state = self.agg.new_state(data.data_type()).ok_or_else(|| {
                    Error::Type(format!(
                        "{} does not accept {} input",
                        self.agg.kind(),
                        data.data_type()
                    ))
                })?;
                e.insert(PartitionState {
                    key: block.key().clone(),
                    bounds: block.bounds(),
                    state,
                    dirty: false,
                })
            }
        };
        part.bounds = part.bounds.union(&block.bounds());
        Self::feed(&mut part.state, data);
        part.dirty = true;
        Ok(())
    }

    async fn retract_block(&mut self, _parent: DatasetID, key: &PartitionKey) -> Result<()> {
        self.states.remove(&key.canonical());
        self.dataset.retract(key).await
    }

    async fn update_watermark(&mut self, _parent: DatasetID, t: Time) -> Result<()> {
        self.emit_due(t).await?;
        self.dataset.update_watermark(t).await
    }

    async fn update_processing_time(&mut self, _parent: DatasetID, t: Time) -> Result<()> {
        self.dataset.update_processing_time(t).await
    }

    async fn finish(&mut self, _parent: DatasetID, err: Option<Error>) -> Result<()> {
        if err.is_none() {
            self.emit_due(Time::MAX).await?;
        }
        self.dataset.finish(err).await
    }

    async fn abort(&mut self, err: Error) {
        let _ = self.dataset.finish(Some(err)).await;
    }
}
