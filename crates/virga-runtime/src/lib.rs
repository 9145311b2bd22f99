//! Virga Runtime - streaming execution engine for VirgaQL
//!
//! Takes a physical plan from `virga-query`, wires sources and
//! transformations into an actor pipeline over columnar blocks, and drives
//! it to completion with watermark-triggered flushing.

pub mod allocator;
pub mod block;
pub mod builder;
pub mod dataset;
pub mod executor;
pub mod line_protocol;
pub mod registry;
pub mod source;
pub mod transform;

pub use allocator::Allocator;
pub use block::{Block, Column, ColumnData, PartitionKey};
pub use builder::{BlockBuilder, BlockBuilderCache};
pub use dataset::{AccumulationMode, Dataset, Subscriber};
pub use executor::{Executor, ExecutorConfig, QueryResults};
pub use registry::{Administration, ExecRegistry};
pub use source::{BlockIter, ReadContext, ReadSpec, StorageReader};
pub use transform::Transformation;
