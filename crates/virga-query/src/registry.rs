//! Operation catalog: kind-keyed registration surfaces
//!
//! Built-in functions register at construction; user-defined functions go
//! through the same surface. Registering a kind twice on the same surface is
//! a programming error and panics at startup, mirroring the invariant that a
//! process with a conflicting catalog must not serve queries.

use crate::arguments::Arguments;
use crate::ops::{self, OpSpec};
use rustc_hash::FxHashMap;
use virga_core::{Error, Result};

/// Factory building an [`OpSpec`] from parsed call arguments.
pub type CreateOpSpec = Box<dyn Fn(&Arguments) -> Result<OpSpec> + Send + Sync>;

/// Factory producing the zero value for a kind; serialization uses it to
/// materialize the right variant.
pub type NewOpSpec = Box<dyn Fn() -> OpSpec + Send + Sync>;

/// The function catalog the parser consumes.
pub struct Registry {
    functions: FxHashMap<String, CreateOpSpec>,
    op_specs: FxHashMap<String, NewOpSpec>,
}

impl Registry {
    /// An empty catalog, for tests and fully custom deployments.
    pub fn new() -> Self {
        Registry {
            functions: FxHashMap::default(),
            op_specs: FxHashMap::default(),
        }
    }

    /// The canonical catalog with every built-in function registered.
    pub fn with_builtins() -> Self {
        let mut r = Registry::new();

        r.register_function(ops::SELECT_KIND, ops::SelectSpec::from_args);
        r.register_function(ops::RANGE_KIND, ops::RangeSpec::from_args);
        r.register_function(ops::FILTER_KIND, ops::FilterSpec::from_args);
        r.register_function(ops::WINDOW_KIND, ops::WindowSpec::from_args);
        r.register_function(ops::SUM_KIND, |args| {
            ops::aggregate_from_args(args, ops::SUM_KIND, OpSpec::Sum)
        });
        r.register_function(ops::COUNT_KIND, |args| {
            ops::aggregate_from_args(args, ops::COUNT_KIND, OpSpec::Count)
        });
        r.register_function(ops::MEAN_KIND, |args| {
            ops::aggregate_from_args(args, ops::MEAN_KIND, OpSpec::Mean)
        });
        r.register_function(ops::MIN_KIND, |args| {
            ops::aggregate_from_args(args, ops::MIN_KIND, OpSpec::Min)
        });
        r.register_function(ops::MAX_KIND, |args| {
            ops::aggregate_from_args(args, ops::MAX_KIND, OpSpec::Max)
        });
        r.register_function(ops::STDDEV_KIND, |args| {
            ops::aggregate_from_args(args, ops::STDDEV_KIND, OpSpec::Stddev)
        });
        r.register_function(ops::JOIN_KIND, ops::JoinSpec::from_args);
        r.register_function(ops::TO_HTTP_KIND, ops::ToHttpSpec::from_args);

        r.register_op_spec(ops::SUM_KIND, || OpSpec::Sum);
        r.register_op_spec(ops::COUNT_KIND, || OpSpec::Count);
        r.register_op_spec(ops::MEAN_KIND, || OpSpec::Mean);
        r.register_op_spec(ops::MIN_KIND, || OpSpec::Min);
        r.register_op_spec(ops::MAX_KIND, || OpSpec::Max);
        r.register_op_spec(ops::STDDEV_KIND, || OpSpec::Stddev);

        r
    }

    /// Bind a VirgaQL function name to its op-spec factory.
    ///
    /// Panics when the kind is already bound.
    pub fn register_function(
        &mut self,
        kind: impl Into<String>,
        create: impl Fn(&Arguments) -> Result<OpSpec> + Send + Sync + 'static,
    ) {
        let kind = kind.into();
        if self
            .functions
            .insert(kind.clone(), Box::new(create))
            .is_some()
        {
            panic!("duplicate registration for function {:?}", kind);
        }
    }

    /// Bind a kind to its zero-value constructor.
    ///
    /// Panics when the kind is already bound.
    pub fn register_op_spec(
        &mut self,
        kind: impl Into<String>,
        new: impl Fn() -> OpSpec + Send + Sync + 'static,
    ) {
        let kind = kind.into();
        if self.op_specs.insert(kind.clone(), Box::new(new)).is_some() {
            panic!("duplicate registration for op spec {:?}", kind);
        }
    }

    pub fn has_function(&self, kind: &str) -> bool {
        self.functions.contains_key(kind)
    }

    /// Build an op spec for a function call.
    pub fn create_op_spec(&self, kind: &str, args: &Arguments) -> Result<OpSpec> {
        let create = self
            .functions
            .get(kind)
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))?;
        create(args)
    }

    /// The zero value for a kind, for deserialization paths.
    pub fn new_op_spec(&self, kind: &str) -> Result<OpSpec> {
        let new = self
            .op_specs
            .get(kind)
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))?;
        Ok(new())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::with_builtins()
    }
}
