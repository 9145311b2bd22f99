//! Execution-side registry: procedure kind → transformation/source factory
//!
//! The planning surfaces live in `virga-query`; this registry covers the
//! runtime half. Factories receive the dataset identity, the accumulation
//! mode, the procedure spec and an [`Administration`] with everything the
//! node needs to wire itself into the pipeline.

use crate::allocator::Allocator;
use crate::builder::BlockBuilderCache;
use crate::dataset::{AccumulationMode, Dataset, Subscriber};
use crate::source::{ReadSpec, Source, StorageReader, StorageSource};
use crate::transform::aggregate::{aggregate_for, AggregateTransformation};
use crate::transform::filter::FilterTransformation;
use crate::transform::join::JoinTransformation;
use crate::transform::range::RangeTransformation;
use crate::transform::to_http::ToHttpTransformation;
use crate::transform::window::WindowTransformation;
use crate::transform::Transformation;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use virga_core::{Bounds, Duration, Error, Result, Time};
use virga_query::ops;
use virga_query::plan::ProcedureSpec;
use virga_query::DatasetID;

/// Context handed to node factories at wiring time.
pub struct Administration {
    pub allocator: Arc<Allocator>,
    /// The query's overall bounds (union of all source bounds).
    pub bounds: Bounds,
    /// The bounds of the node being built.
    pub node_bounds: Bounds,
    pub now: Time,
    /// Downstream mailboxes the node's dataset forwards into.
    pub subscribers: Vec<Subscriber>,
    /// Parent datasets with their originating op IDs, in edge order.
    pub parents: Vec<(DatasetID, String)>,
}

impl Administration {
    /// A builder cache charging this query's allocator.
    pub fn builder_cache(&self) -> BlockBuilderCache {
        BlockBuilderCache::new(Arc::clone(&self.allocator))
    }

    fn dataset(&mut self, id: DatasetID, mode: AccumulationMode) -> Dataset {
        Dataset::new(id, mode, std::mem::take(&mut self.subscribers))
    }
}

pub type CreateTransformation = Box<
    dyn Fn(
            DatasetID,
            AccumulationMode,
            &ProcedureSpec,
            Administration,
        ) -> Result<Box<dyn Transformation>>
        + Send
        + Sync,
>;

pub type CreateSource = Box<
    dyn Fn(
            DatasetID,
            &ProcedureSpec,
            Arc<dyn StorageReader>,
            Administration,
        ) -> Result<Box<dyn Source>>
        + Send
        + Sync,
>;

/// Kind-keyed factories for the execution runtime.
pub struct ExecRegistry {
    transformations: FxHashMap<String, CreateTransformation>,
    sources: FxHashMap<String, CreateSource>,
}

impl ExecRegistry {
    pub fn new() -> Self {
        ExecRegistry {
            transformations: FxHashMap::default(),
            sources: FxHashMap::default(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut r = ExecRegistry::new();

        r.register_source(ops::SELECT_KIND, |id, spec, reader, mut admin| {
            let ProcedureSpec::Select(select) = spec else {
                return Err(invalid_spec(ops::SELECT_KIND, spec));
            };
            let bounds = admin.node_bounds;
            let (every, period) = match &select.window {
                Some(w) => (w.every, w.period),
                None => (bounds.duration(), bounds.duration()),
            };
            // A degenerate window would stall the read loop.
            let (every, period) = if every.nanos() <= 0 {
                let step = Duration(bounds.duration().nanos().max(1));
                (step, step)
            } else {
                (every, period)
            };
            let read_spec = ReadSpec {
                database: select.database.clone(),
                ..ReadSpec::default()
            };
            let dataset = admin.dataset(id, AccumulationMode::Discarding);
            Ok(Box::new(StorageSource::new(
                dataset, reader, read_spec, bounds, every, period,
            )) as Box<dyn Source>)
        });

        r.register_transformation(ops::RANGE_KIND, |id, mode, spec, mut admin| {
            let ProcedureSpec::Range(range) = spec else {
                return Err(invalid_spec(ops::RANGE_KIND, spec));
            };
            let bounds = range.resolve(admin.now);
            let dataset = admin.dataset(id, mode);
            Ok(Box::new(RangeTransformation::new(dataset, bounds)) as Box<dyn Transformation>)
        });

        r.register_transformation(ops::FILTER_KIND, |id, mode, spec, mut admin| {
            let ProcedureSpec::Filter(filter) = spec else {
                return Err(invalid_spec(ops::FILTER_KIND, spec));
            };
            let dataset = admin.dataset(id, mode);
            Ok(
                Box::new(FilterTransformation::new(dataset, filter.expression.clone()))
                    as Box<dyn Transformation>,
            )
        });

        r.register_transformation(ops::WINDOW_KIND, |id, mode, spec, mut admin| {
            let ProcedureSpec::Window(window) = spec else {
                return Err(invalid_spec(ops::WINDOW_KIND, spec));
            };
            let cache = admin.builder_cache();
            let dataset = admin.dataset(id, mode);
            Ok(Box::new(WindowTransformation::new(dataset, cache, window))
                as Box<dyn Transformation>)
        });

        for kind in [
            ops::SUM_KIND,
            ops::COUNT_KIND,
            ops::MEAN_KIND,
            ops::MIN_KIND,
            ops::MAX_KIND,
            ops::STDDEV_KIND,
        ] {
            r.register_transformation(kind, |id, mode, spec, mut admin| {
                let ProcedureSpec::Aggregate(agg) = spec else {
                    return Err(invalid_spec("aggregate", spec));
                };
                let dataset = admin.dataset(id, mode);
                Ok(
                    Box::new(AggregateTransformation::new(dataset, aggregate_for(*agg)))
                        as Box<dyn Transformation>,
                )
            });
        }

        r.register_transformation(ops::JOIN_KIND, |id, mode, spec, mut admin| {
            let ProcedureSpec::Join(join) = spec else {
                return Err(invalid_spec(ops::JOIN_KIND, spec));
            };
            let parents: Vec<DatasetID> = admin.parents.iter().map(|(d, _)| *d).collect();
            // Identifier names come from the spec's table bindings; parents
            // the parser left unnamed answer to their op ID, and the first
            // parent doubles as the anonymous position.
            let names: FxHashMap<DatasetID, String> = admin
                .parents
                .iter()
                .map(|(d, op_id)| {
                    let name = join
                        .table_name(op_id)
                        .map(String::from)
                        .unwrap_or_else(|| op_id.clone());
                    (*d, name)
                })
                .collect();
            let dataset = admin.dataset(id, mode);
            Ok(Box::new(JoinTransformation::new(dataset, join, parents, names))
                as Box<dyn Transformation>)
        });

        r.register_transformation(ops::TO_HTTP_KIND, |id, mode, spec, mut admin| {
            let ProcedureSpec::ToHttp(to_http) = spec else {
                return Err(invalid_spec(ops::TO_HTTP_KIND, spec));
            };
            let dataset = admin.dataset(id, mode);
            Ok(Box::new(ToHttpTransformation::new(dataset, to_http.clone()))
                as Box<dyn Transformation>)
        });

        r
    }

    /// Bind a procedure kind to its transformation factory.
    ///
    /// Panics when the kind is already bound.
    pub fn register_transformation(
        &mut self,
        kind: impl Into<String>,
        create: impl Fn(
                DatasetID,
                AccumulationMode,
                &ProcedureSpec,
                Administration,
            ) -> Result<Box<dyn Transformation>>
            + Send
            + Sync
            + 'static,
    ) {
        let kind = kind.into();
        if self
            .transformations
            .insert(kind.clone(), Box::new(create))
            .is_some()
        {
            panic!("duplicate registration for transformation {:?}", kind);
        }
    }

    /// Bind a procedure kind to its source factory.
    ///
    /// Panics when the kind is already bound.
    pub fn register_source(
        &mut self,
        kind: impl Into<String>,
        create: impl Fn(
                DatasetID,
                &ProcedureSpec,
                Arc<dyn StorageReader>,
                Administration,
            ) -> Result<Box<dyn Source>>
            + Send
            + Sync
            + 'static,
    ) {
        let kind = kind.into();
        if self.sources.insert(kind.clone(), Box::new(create)).is_some() {
            panic!("duplicate registration for source {:?}", kind);
        }
    }

    pub fn create_transformation(
        &self,
        kind: &str,
        id: DatasetID,
        mode: AccumulationMode,
        spec: &ProcedureSpec,
        admin: Administration,
    ) -> Result<Box<dyn Transformation>> {
        let create = self
            .transformations
            .get(kind)
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))?;
        create(id, mode, spec, admin)
    }

    pub fn create_source(
        &self,
        kind: &str,
        id: DatasetID,
        spec: &ProcedureSpec,
        reader: Arc<dyn StorageReader>,
        admin: Administration,
    ) -> Result<Box<dyn Source>> {
        let create = self
            .sources
            .get(kind)
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))?;
        create(id, spec, reader, admin)
    }
}

impl Default for ExecRegistry {
    fn default() -> Self {
        ExecRegistry::with_builtins()
    }
}

fn invalid_spec(kind: &str, got: &ProcedureSpec) -> Error {
    Error::internal(format!(
        "{} factory invoked with a {} procedure",
        kind,
        got.kind()
    ))
}
