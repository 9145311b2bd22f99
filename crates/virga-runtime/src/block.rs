//! Columnar blocks and partition keys
//!
//! A block is an immutable columnar slab of rows sharing one partition key
//! and one time bounds. Key columns are constant within the block and the
//! key's labels are kept sorted, so two blocks of the same partition compare
//! equal on their keys. Downstream consumers view columns as typed slices
//! without copying.

use serde::{Deserialize, Serialize};
use std::fmt;
use virga_core::{Bounds, DataType, Error, Record, ReferenceKind, Result, Time, Value};

/// Label of the column carrying row timestamps.
pub const TIME_COL: &str = "_time";
/// Label of the default value column.
pub const VALUE_COL: &str = "_value";
/// Label of the window-start key column added by `window`.
pub const START_COL: &str = "_start";
/// Label of the window-stop key column added by `window`.
pub const STOP_COL: &str = "_stop";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub label: String,
    pub typ: DataType,
}

impl Column {
    pub fn new(label: impl Into<String>, typ: DataType) -> Self {
        Column {
            label: label.into(),
            typ,
        }
    }
}

/// Typed backing storage for one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnData {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    UInt(Vec<u64>),
    Float(Vec<f64>),
    String(Vec<String>),
    Time(Vec<Time>),
}

impl ColumnData {
    pub fn new(typ: DataType) -> Self {
        match typ {
            DataType::Bool => ColumnData::Bool(Vec::new()),
            DataType::Int => ColumnData::Int(Vec::new()),
            DataType::UInt => ColumnData::UInt(Vec::new()),
            DataType::Float => ColumnData::Float(Vec::new()),
            DataType::String => ColumnData::String(Vec::new()),
            DataType::Time => ColumnData::Time(Vec::new()),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            ColumnData::Bool(_) => DataType::Bool,
            ColumnData::Int(_) => DataType::Int,
            ColumnData::UInt(_) => DataType::UInt,
            ColumnData::Float(_) => DataType::Float,
            ColumnData::String(_) => DataType::String,
            ColumnData::Time(_) => DataType::Time,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Bool(v) => v.len(),
            ColumnData::Int(v) => v.len(),
            ColumnData::UInt(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::String(v) => v.len(),
            ColumnData::Time(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value(&self, row: usize) -> Value {
        match self {
            ColumnData::Bool(v) => Value::Bool(v[row]),
            ColumnData::Int(v) => Value::Int(v[row]),
            ColumnData::UInt(v) => Value::UInt(v[row]),
            ColumnData::Float(v) => Value::Float(v[row]),
            ColumnData::String(v) => Value::Str(v[row].clone()),
            ColumnData::Time(v) => Value::Time(v[row]),
        }
    }

    /// Append a value of the column's own type.
    pub fn push(&mut self, value: &Value) -> Result<()> {
        match (self, value) {
            (ColumnData::Bool(v), Value::Bool(b)) => v.push(*b),
            (ColumnData::Int(v), Value::Int(n)) => v.push(*n),
            (ColumnData::UInt(v), Value::UInt(n)) => v.push(*n),
            (ColumnData::Float(v), Value::Float(n)) => v.push(*n),
            (ColumnData::String(v), Value::Str(s)) => v.push(s.clone()),
            (ColumnData::Time(v), Value::Time(t)) => v.push(*t),
            (col, value) => {
                return Err(Error::Type(format!(
                    "cannot append {} to a {} column",
                    value.type_name(),
                    col.data_type()
                )))
            }
        }
        Ok(())
    }

    pub(crate) fn retain(&mut self, keep: &[bool]) {
        fn apply<T>(v: &mut Vec<T>, keep: &[bool]) {
            let mut i = 0;
            v.retain(|_| {
                let k = keep[i];
                i += 1;
                k
            });
        }
        match self {
            ColumnData::Bool(v) => apply(v, keep),
            ColumnData::Int(v) => apply(v, keep),
            ColumnData::UInt(v) => apply(v, keep),
            ColumnData::Float(v) => apply(v, keep),
            ColumnData::String(v) => apply(v, keep),
            ColumnData::Time(v) => apply(v, keep),
        }
    }
}

/// Ordered `(label, value)` pairs identifying a partition.
///
/// Labels are kept sorted, so element-wise equality is partition equality.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PartitionKey {
    entries: Vec<(String, Value)>,
}

impl PartitionKey {
    pub fn new(mut entries: Vec<(String, Value)>) -> Self {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        PartitionKey { entries }
    }

    pub fn empty() -> Self {
        PartitionKey::default()
    }

    pub fn with(mut self, label: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.push((label.into(), value.into()));
        self.entries.sort_by(|a, b| a.0.cmp(&b.0));
        self
    }

    pub fn entries(&self) -> &[(String, Value)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, label: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(l, _)| l.as_str())
    }

    /// Canonical text form; partition maps hash on it, the way the join
    /// buffers key correlated rows.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        for (label, value) in &self.entries {
            out.push_str(label);
            out.push('=');
            out.push_str(&value.to_string());
            out.push(',');
        }
        out
    }

    /// This key without the named labels.
    pub fn without(&self, labels: &[&str]) -> PartitionKey {
        PartitionKey {
            entries: self
                .entries
                .iter()
                .filter(|(l, _)| !labels.contains(&l.as_str()))
                .cloned()
                .collect(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (label, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", label, value)?;
        }
        write!(f, "}}")
    }
}

/// An immutable columnar slab of rows sharing a partition key and bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    key: PartitionKey,
    bounds: Bounds,
    cols: Vec<Column>,
    data: Vec<ColumnData>,
}

impl Block {
    /// Assemble and validate a block.
    pub fn new(
        key: PartitionKey,
        bounds: Bounds,
        cols: Vec<Column>,
        data: Vec<ColumnData>,
    ) -> Result<Self> {
        let block = Block {
            key,
            bounds,
            cols,
            data,
        };
        block.validate()?;
        Ok(block)
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn cols(&self) -> &[Column] {
        &self.cols
    }

    pub fn data(&self) -> &[ColumnData] {
        &self.data
    }

    pub fn nrows(&self) -> usize {
        self.data.first().map_or(0, ColumnData::len)
    }

    pub fn col_index(&self, label: &str) -> Option<usize> {
        self.cols.iter().position(|c| c.label == label)
    }

    pub fn col_data(&self, label: &str) -> Option<&ColumnData> {
        self.col_index(label).map(|i| &self.data[i])
    }

    /// The `_time` column as a typed slice.
    pub fn times(&self) -> Option<&[Time]> {
        match self.col_data(TIME_COL) {
            Some(ColumnData::Time(v)) => Some(v),
            _ => None,
        }
    }

    pub fn value(&self, col: usize, row: usize) -> Value {
        self.data[col].value(row)
    }

    /// A row view usable as an expression evaluation record.
    pub fn row(&self, row: usize) -> RowView<'_> {
        RowView { block: self, row }
    }

    /// Keep only rows flagged in `keep`; key, bounds and schema carry over.
    pub fn retain_rows(&self, keep: &[bool], bounds: Bounds) -> Block {
        let mut data = self.data.clone();
        for col in &mut data {
            col.retain(keep);
        }
        Block {
            key: self.key.clone(),
            bounds,
            cols: self.cols.clone(),
            data,
        }
    }

    /// Check the block invariants: column lengths agree, key columns are
    /// present and constant, row times lie inside the bounds.
    pub fn validate(&self) -> Result<()> {
        if self.cols.len() != self.data.len() {
            return Err(Error::internal("column metadata and data disagree"));
        }
        let nrows = self.nrows();
        for (col, data) in self.cols.iter().zip(&self.data) {
            if data.len() != nrows {
                return Err(Error::internal(format!(
                    "column {:?} has {} rows, expected {}",
                    col.label,
                    data.len(),
                    nrows
                )));
            }
            if data.data_type() != col.typ {
                return Err(Error::internal(format!(
                    "column {:?} declared {} but stores {}",
                    col.label,
                    col.typ,
                    data.data_type()
                )));
            }
        }
        for (label, value) in self.key.entries() {
            if let Some(data) = self.col_data(label) {
                for row in 0..nrows {
                    if &data.value(row) != value {
                        return Err(Error::internal(format!(
                            "key column {:?} is not constant within the block",
                            label
                        )));
                    }
                }
            }
        }
        if let Some(times) = self.times() {
            for t in times {
                if !self.bounds.contains(*t) {
                    return Err(Error::internal(format!(
                        "row time {} outside block bounds {}",
                        t, self.bounds
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One row of a block, resolving expression references.
///
/// Tags resolve to string columns (falling back to the partition key),
/// fields resolve to columns by name with `$` meaning the default value
/// column. Identifiers resolve like fields.
pub struct RowView<'a> {
    block: &'a Block,
    row: usize,
}

impl RowView<'_> {
    pub fn time(&self) -> Option<Time> {
        self.block.times().map(|ts| ts[self.row])
    }
}

impl Record for RowView<'_> {
    fn lookup(&self, kind: ReferenceKind, name: &str) -> Option<Value> {
        match kind {
            ReferenceKind::Tag => match self.block.col_data(name) {
                Some(ColumnData::String(v)) => Some(Value::Str(v[self.row].clone())),
                Some(_) => None,
                None => match self.block.key().get(name) {
                    Some(v @ Value::Str(_)) => Some(v.clone()),
                    _ => None,
                },
            },
            ReferenceKind::Field | ReferenceKind::Identifier => {
                let label = if name == "$" { VALUE_COL } else { name };
                self.block
                    .col_data(label)
                    .map(|data| data.value(self.row))
            }
        }
    }
}
