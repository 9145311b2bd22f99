//! Virga Query - operation catalog, op-graph and planner for VirgaQL
//!
//! The external parser turns query text into a [`spec::QuerySpec`] through
//! the [`registry::Registry`] function surface. The [`plan::Planner`] then
//! rewrites the op-graph into a [`plan::PhysicalPlan`] the runtime executes.

pub mod arguments;
pub mod ops;
pub mod plan;
pub mod registry;
pub mod spec;

pub use arguments::{Arg, Arguments};
pub use ops::OpSpec;
pub use plan::{DatasetID, PhysicalNode, PhysicalPlan, Planner, ProcedureSpec};
pub use registry::Registry;
pub use spec::{Edge, Operation, QuerySpec, Resources};
