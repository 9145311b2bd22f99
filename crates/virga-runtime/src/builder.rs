//! Block builders and the per-transformation builder cache
//!
//! A builder is a mutable, append-only columnar accumulator for one
//! partition. The cache maps partition keys to builders; `get_or_create` is
//! idempotent on key equality. Builders charge the query allocator as they
//! grow and release their charge when they flush into an immutable block.

use crate::allocator::Allocator;
use crate::block::{Block, Column, ColumnData, PartitionKey, TIME_COL};
use rustc_hash::FxHashMap;
use std::mem::size_of;
use std::sync::Arc;
use virga_core::{Bounds, Result, Time, Value};

/// Mutable columnar accumulator for one partition.
pub struct BlockBuilder {
    key: PartitionKey,
    bounds: Bounds,
    cols: Vec<Column>,
    data: Vec<ColumnData>,
    max_time: Time,
    charged: u64,
    alloc: Arc<Allocator>,
}

impl BlockBuilder {
    pub fn new(
        key: PartitionKey,
        bounds: Bounds,
        cols: Vec<Column>,
        alloc: Arc<Allocator>,
    ) -> Self {
        let data = cols.iter().map(|c| ColumnData::new(c.typ)).collect();
        BlockBuilder {
            key,
            bounds,
            cols,
            data,
            max_time: Time::MIN,
            charged: 0,
            alloc,
        }
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn nrows(&self) -> usize {
        self.data.first().map_or(0, ColumnData::len)
    }

    /// Append one row; `values` must match the builder's columns in order
    /// and type.
    pub fn append_row(&mut self, values: &[Value]) -> Result<()> {
        if values.len() != self.cols.len() {
            return Err(virga_core::Error::internal(format!(
                "appending {} values to a {}-column builder",
                values.len(),
                self.cols.len()
            )));
        }
        let bytes = row_footprint(values);
        self.alloc.account(bytes)?;
        self.charged += bytes;
        for (i, value) in values.iter().enumerate() {
            self.data[i].push(value)?;
            if self.cols[i].label == TIME_COL {
                if let Value::Time(t) = value {
                    self.max_time = self.max_time.max(*t);
                }
            }
        }
        Ok(())
    }

    /// The watermark at or past which this builder is ready to flush:
    /// its bounds' stop when finite, otherwise the greatest appended time.
    pub fn flush_horizon(&self) -> Time {
        if self.bounds.stop < Time::MAX {
            self.bounds.stop
        } else {
            self.max_time
        }
    }

    /// Materialize the immutable block and release the memory charge.
    pub fn build(mut self) -> Result<Block> {
        self.alloc.release(self.charged);
        self.charged = 0;
        let key = std::mem::take(&mut self.key);
        let cols = std::mem::take(&mut self.cols);
        let data = std::mem::take(&mut self.data);
        Block::new(key, self.bounds, cols, data)
    }
}

impl Drop for BlockBuilder {
    fn drop(&mut self) {
        // A discarded builder still owes its charge; build() zeroes it.
        if self.charged > 0 {
            self.alloc.release(self.charged);
            self.charged = 0;
        }
    }
}

fn row_footprint(values: &[Value]) -> u64 {
    values
        .iter()
        .map(|v| match v {
            Value::Str(s) => (size_of::<String>() + s.len()) as u64,
            _ => size_of::<Value>() as u64,
        })
        .sum()
}

/// Partition-keyed builder cache for one transformation.
pub struct BlockBuilderCache {
    builders: FxHashMap<String, BlockBuilder>,
    alloc: Arc<Allocator>,
}

impl BlockBuilderCache {
    pub fn new(alloc: Arc<Allocator>) -> Self {
        BlockBuilderCache {
            builders: FxHashMap::default(),
            alloc,
        }
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    /// The builder for `key`, created on first use. Idempotent on key
    /// equality: the `cols` of later calls for the same key are ignored.
    pub fn get_or_create(
        &mut self,
        key: &PartitionKey,
        bounds: Bounds,
        cols: &[Column],
    ) -> &mut BlockBuilder {
        self.builders
            .entry(key.canonical())
            .or_insert_with(|| {
                BlockBuilder::new(key.clone(), bounds, cols.to_vec(), Arc::clone(&self.alloc))
            })
    }

    /// Drop the builder for a retracted partition, releasing its memory.
    pub fn discard(&mut self, key: &PartitionKey) {
        self.builders.remove(&key.canonical());
    }

    /// Flush every builder whose horizon the watermark has crossed.
    pub fn flush_due(&mut self, watermark: Time) -> Result<Vec<Block>> {
        let due: Vec<String> = self
            .builders
            .iter()
            .filter(|(_, b)| watermark >= b.flush_horizon())
            .map(|(k, _)| k.clone())
            .collect();
        let mut out = Vec::with_capacity(due.len());
        for key in due {
            if let Some(builder) = self.builders.remove(&key) {
                out.push(builder.build()?);
            }
        }
        Ok(out)
    }

    /// Flush everything; used when the last parent finishes.
    pub fn flush_all(&mut self) -> Result<Vec<Block>> {
        let mut out = Vec::with_capacity(self.builders.len());
        for (_, builder) in self.builders.drain() {
            out.push(builder.build()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virga_core::DataType;

    fn cols() -> Vec<Column> {
        vec![
            Column::new(TIME_COL, DataType::Time),
            Column::new("_value", DataType::Float),
        ]
    }

    #[test]
    fn test_append_and_build() {
        let alloc = Arc::new(Allocator::unlimited());
        let mut b = BlockBuilder::new(
            PartitionKey::empty(),
            Bounds::new(Time(0), Time(100)),
            cols(),
            alloc.clone(),
        );
        b.append_row(&[Value::Time(Time(10)), Value::Float(1.0)])
            .unwrap();
        b.append_row(&[Value::Time(Time(20)), Value::Float(2.0)])
            .unwrap();
        assert!(alloc.used() > 0);
        let block = b.build().unwrap();
        assert_eq!(block.nrows(), 2);
        assert_eq!(alloc.used(), 0);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let alloc = Arc::new(Allocator::unlimited());
        let mut b = BlockBuilder::new(
            PartitionKey::empty(),
            Bounds::new(Time(0), Time(100)),
            cols(),
            alloc,
        );
        assert!(b
            .append_row(&[Value::Time(Time(10)), Value::Str("nope".into())])
            .is_err());
    }

    #[test]
    fn test_quota_exceeded_surfaces() {
        let alloc = Arc::new(Allocator::new(16));
        let mut b = BlockBuilder::new(
            PartitionKey::empty(),
            Bounds::new(Time(0), Time(100)),
            cols(),
            alloc,
        );
        let row = [Value::Time(Time(10)), Value::Float(1.0)];
        let mut failed = false;
        for _ in 0..64 {
            if b.append_row(&row).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed, "quota never tripped");
    }

    #[test]
    fn test_discarded_builder_releases_charge() {
        let alloc = Arc::new(Allocator::unlimited());
        let mut cache = BlockBuilderCache::new(alloc.clone());
        let key = PartitionKey::empty().with("host", "x");
        cache
            .get_or_create(&key, Bounds::new(Time(0), Time(100)), &cols())
            .append_row(&[Value::Time(Time(1)), Value::Float(1.0)])
            .unwrap();
        assert!(alloc.used() > 0);
        cache.discard(&key);
        assert_eq!(alloc.used(), 0);
    }

    #[test]
    fn test_get_or_create_idempotent() {
        let alloc = Arc::new(Allocator::unlimited());
        let mut cache = BlockBuilderCache::new(alloc);
        let key = PartitionKey::empty().with("host", "x");
        let bounds = Bounds::new(Time(0), Time(100));
        cache
            .get_or_create(&key, bounds, &cols())
            .append_row(&[Value::Time(Time(1)), Value::Float(1.0)])
            .unwrap();
        // Same key: the existing builder comes back, rows intact.
        assert_eq!(cache.get_or_create(&key, bounds, &cols()).nrows(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_flush_due_by_watermark() {
        let alloc = Arc::new(Allocator::unlimited());
        let mut cache = BlockBuilderCache::new(alloc);
        let early = PartitionKey::empty().with("w", "a");
        let late = PartitionKey::empty().with("w", "b");
        cache
            .get_or_create(&early, Bounds::new(Time(0), Time(50)), &cols())
            .append_row(&[Value::Time(Time(10)), Value::Float(1.0)])
            .unwrap();
        cache
            .get_or_create(&late, Bounds::new(Time(50), Time(100)), &cols())
            .append_row(&[Value::Time(Time(60)), Value::Float(2.0)])
            .unwrap();

        let flushed = cache.flush_due(Time(50)).unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].bounds().stop, Time(50));
        assert_eq!(cache.len(), 1);

        let rest = cache.flush_all().unwrap();
        assert_eq!(rest.len(), 1);
        assert!(cache.is_empty());
    }
}
