//! Standard transformations
//!
//! Every operator implements [`Transformation`]; the executor serializes all
//! calls through the node's mailbox, so implementations own their state
//! without locks. Single-parent operators forward watermarks and completion
//! straight through their dataset; multi-parent operators min-reduce first.

pub mod aggregate;
pub mod filter;
pub mod join;
pub mod range;
pub mod to_http;
pub mod window;

use crate::block::{Block, PartitionKey};
use async_trait::async_trait;
use std::sync::Arc;
use virga_core::{Error, Result, Time};
use virga_query::DatasetID;

/// A streaming operator: consumes parent blocks, emits derived blocks into
/// its own dataset.
#[async_trait]
pub trait Transformation: Send {
    /// Consume one block from a parent. Per-parent, per-partition order is
    /// arrival order.
    async fn process(&mut self, parent: DatasetID, block: Arc<Block>) -> Result<()>;

    /// A previously emitted partition of `parent` is no longer valid; drop
    /// or recompute derived state.
    async fn retract_block(&mut self, parent: DatasetID, key: &PartitionKey) -> Result<()>;

    /// Advance logical time for one parent.
    async fn update_watermark(&mut self, parent: DatasetID, t: Time) -> Result<()>;

    /// Advance wall-clock time for one parent.
    async fn update_processing_time(&mut self, parent: DatasetID, t: Time) -> Result<()>;

    /// One parent is done. When the last parent finishes, flush remaining
    /// builders and propagate completion downstream.
    async fn finish(&mut self, parent: DatasetID, err: Option<Error>) -> Result<()>;

    /// Terminate this node with an error, propagating it downstream. Used
    /// by the executor when a method above fails.
    async fn abort(&mut self, err: Error);
}

impl std::fmt::Debug for dyn Transformation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn Transformation>")
    }
}
