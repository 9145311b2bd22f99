//! Planner: op-graph → logical procedures → physical dataflow
//!
//! The logical pass rewrites each operation into a `ProcedureSpec` through
//! the registered factories, then fires upstream rewrites (range bounds and
//! window specs push into the selects that feed them). The physical pass
//! lays the procedures out in a stable topological order, assigns dataset
//! IDs, resolves relative times against the query's "now" and identifies
//! the source nodes.

use crate::ops::{
    self, FilterSpec, JoinSpec, OpSpec, RangeSpec, SelectSpec, ToHttpSpec, WindowSpec,
};
use crate::spec::{QuerySpec, Resources};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use virga_core::{Bounds, Error, Result, Time, TimeSpec};

/// Identity of one dataset in the physical plan.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct DatasetID(pub u64);

impl fmt::Display for DatasetID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// When a dataset forwards builder contents downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSpec {
    #[default]
    ByWatermark,
}

/// The aggregate family shares one procedure shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    Sum,
    Count,
    Mean,
    Min,
    Max,
    Stddev,
}

impl AggregateKind {
    pub fn kind(self) -> &'static str {
        match self {
            AggregateKind::Sum => ops::SUM_KIND,
            AggregateKind::Count => ops::COUNT_KIND,
            AggregateKind::Mean => ops::MEAN_KIND,
            AggregateKind::Min => ops::MIN_KIND,
            AggregateKind::Max => ops::MAX_KIND,
            AggregateKind::Stddev => ops::STDDEV_KIND,
        }
    }
}

/// Physical description of a storage read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectProcedure {
    pub database: String,
    /// Bounds pushed down from ranges; intersected at resolution.
    pub bounds: Vec<RangeSpec>,
    /// Window pushed down for read batching, when one exists downstream.
    pub window: Option<WindowSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec")]
pub enum ProcedureSpec {
    #[serde(rename = "select")]
    Select(SelectProcedure),
    #[serde(rename = "range")]
    Range(RangeSpec),
    #[serde(rename = "filter")]
    Filter(FilterSpec),
    #[serde(rename = "window")]
    Window(WindowSpec),
    #[serde(rename = "aggregate")]
    Aggregate(AggregateKind),
    #[serde(rename = "join")]
    Join(JoinSpec),
    #[serde(rename = "toHTTP")]
    ToHttp(ToHttpSpec),
}

impl ProcedureSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcedureSpec::Select(_) => ops::SELECT_KIND,
            ProcedureSpec::Range(_) => ops::RANGE_KIND,
            ProcedureSpec::Filter(_) => ops::FILTER_KIND,
            ProcedureSpec::Window(_) => ops::WINDOW_KIND,
            ProcedureSpec::Aggregate(agg) => agg.kind(),
            ProcedureSpec::Join(_) => ops::JOIN_KIND,
            ProcedureSpec::ToHttp(_) => ops::TO_HTTP_KIND,
        }
    }
}

/// One node of the physical plan, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalNode {
    pub id: DatasetID,
    /// The originating operation, for error reporting and join tables.
    pub op_id: String,
    pub spec: ProcedureSpec,
    /// Parent datasets, in edge order.
    pub parents: Vec<DatasetID>,
    pub bounds: Bounds,
    pub trigger: TriggerSpec,
}

/// The executable plan: nodes in topological order plus source datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalPlan {
    pub nodes: Vec<PhysicalNode>,
    pub sources: Vec<DatasetID>,
    pub resources: Resources,
    pub now: Time,
    /// Union of all source bounds; the query's overall time coverage.
    pub bounds: Bounds,
}

impl PhysicalPlan {
    pub fn node(&self, id: DatasetID) -> Option<&PhysicalNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Datasets nothing subscribes to; their output is the query result.
    pub fn terminals(&self) -> Vec<DatasetID> {
        let parents: FxHashSet<DatasetID> = self
            .nodes
            .iter()
            .flat_map(|n| n.parents.iter().copied())
            .collect();
        self.nodes
            .iter()
            .map(|n| n.id)
            .filter(|id| !parents.contains(id))
            .collect()
    }
}

/// Factory from an op spec to its procedure spec.
pub type CreateProcedure = Box<dyn Fn(&OpSpec) -> Result<ProcedureSpec> + Send + Sync>;

/// Two-stage planner with a kind-keyed procedure surface.
pub struct Planner {
    procedures: FxHashMap<String, CreateProcedure>,
    source_kinds: FxHashSet<String>,
}

impl Planner {
    pub fn new() -> Self {
        Planner {
            procedures: FxHashMap::default(),
            source_kinds: FxHashSet::default(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut p = Planner::new();

        p.register_procedure(ops::SELECT_KIND, |spec| match spec {
            OpSpec::Select(SelectSpec { database }) => Ok(ProcedureSpec::Select(SelectProcedure {
                database: database.clone(),
                bounds: Vec::new(),
                window: None,
            })),
            other => Err(invalid_spec(ops::SELECT_KIND, other)),
        });
        p.register_procedure(ops::RANGE_KIND, |spec| match spec {
            OpSpec::Range(range) => Ok(ProcedureSpec::Range(*range)),
            other => Err(invalid_spec(ops::RANGE_KIND, other)),
        });
        p.register_procedure(ops::FILTER_KIND, |spec| match spec {
            OpSpec::Filter(filter) => Ok(ProcedureSpec::Filter(filter.clone())),
            other => Err(invalid_spec(ops::FILTER_KIND, other)),
        });
        p.register_procedure(ops::WINDOW_KIND, |spec| match spec {
            OpSpec::Window(window) => Ok(ProcedureSpec::Window(*window)),
            other => Err(invalid_spec(ops::WINDOW_KIND, other)),
        });
        for (kind, agg) in [
            (ops::SUM_KIND, AggregateKind::Sum),
            (ops::COUNT_KIND, AggregateKind::Count),
            (ops::MEAN_KIND, AggregateKind::Mean),
            (ops::MIN_KIND, AggregateKind::Min),
            (ops::MAX_KIND, AggregateKind::Max),
            (ops::STDDEV_KIND, AggregateKind::Stddev),
        ] {
            p.register_procedure(kind, move |_spec| Ok(ProcedureSpec::Aggregate(agg)));
        }
        p.register_procedure(ops::JOIN_KIND, |spec| match spec {
            OpSpec::Join(join) => Ok(ProcedureSpec::Join(join.clone())),
            other => Err(invalid_spec(ops::JOIN_KIND, other)),
        });
        p.register_procedure(ops::TO_HTTP_KIND, |spec| match spec {
            OpSpec::ToHttp(to_http) => Ok(ProcedureSpec::ToHttp(to_http.clone())),
            other => Err(invalid_spec(ops::TO_HTTP_KIND, other)),
        });

        p.register_source_kind(ops::SELECT_KIND);
        p
    }

    /// Bind an op kind to its procedure factory.
    ///
    /// Panics when the kind is already bound.
    pub fn register_procedure(
        &mut self,
        kind: impl Into<String>,
        create: impl Fn(&OpSpec) -> Result<ProcedureSpec> + Send + Sync + 'static,
    ) {
        let kind = kind.into();
        if self
            .procedures
            .insert(kind.clone(), Box::new(create))
            .is_some()
        {
            panic!("duplicate registration for procedure {:?}", kind);
        }
    }

    /// Mark a kind as source-producing; its physical nodes become plan
    /// sources instead of transformations.
    pub fn register_source_kind(&mut self, kind: impl Into<String>) {
        self.source_kinds.insert(kind.into());
    }

    /// Run both planning passes over a validated query spec.
    pub fn plan(&self, spec: &QuerySpec) -> Result<PhysicalPlan> {
        spec.validate()?;
        let order: Vec<String> = spec.sorted()?.into_iter().map(String::from).collect();

        // Logical pass: one procedure per operation, via the catalog.
        let mut procedures: FxHashMap<String, ProcedureSpec> = FxHashMap::default();
        for op in &spec.operations {
            let kind = op.spec.kind();
            let create = self
                .procedures
                .get(kind)
                .ok_or_else(|| Error::UnknownKind(kind.to_string()))?;
            procedures.insert(op.id.clone(), create(&op.spec)?);
        }

        // Upstream rewrites: ranges and windows feed the selects above them.
        for op_id in &order {
            let pushed = match &procedures[op_id.as_str()] {
                ProcedureSpec::Range(range) => Pushdown::Bounds(*range),
                ProcedureSpec::Window(window) => Pushdown::Window(*window),
                _ => continue,
            };
            for select_id in upstream_selects(spec, op_id, &procedures) {
                let Some(ProcedureSpec::Select(select)) = procedures.get_mut(&select_id) else {
                    continue;
                };
                match pushed {
                    Pushdown::Bounds(range) => select.bounds.push(range),
                    Pushdown::Window(window) => {
                        // The nearest window in topological order wins. A
                        // window also bounds the read when no range does.
                        if select.window.is_none() {
                            select.window = Some(window);
                            select.bounds.push(RangeSpec {
                                start: window.start,
                                stop: TimeSpec::NOW,
                            });
                        }
                    }
                }
            }
        }

        // Physical pass: dataset IDs, resolved bounds, source detection.
        let mut nodes: Vec<PhysicalNode> = Vec::with_capacity(order.len());
        let mut datasets: FxHashMap<&str, DatasetID> = FxHashMap::default();
        let mut sources = Vec::new();
        let mut query_bounds: Option<Bounds> = None;

        for (seq, op_id) in order.iter().enumerate() {
            let id = DatasetID(seq as u64);
            let proc_spec = procedures[op_id.as_str()].clone();
            let parent_ids = spec.parents(op_id);
            let parents: Vec<DatasetID> = parent_ids
                .iter()
                .map(|p| datasets[p])
                .collect();

            let parent_bounds = parents
                .iter()
                .map(|pid| nodes[pid.0 as usize].bounds)
                .reduce(|a, b| a.union(&b));

            let bounds = match &proc_spec {
                ProcedureSpec::Select(select) => {
                    let bounds = select
                        .bounds
                        .iter()
                        .map(|r| r.resolve(spec.now))
                        .reduce(|a, b| a.intersect(&b))
                        .ok_or_else(|| {
                            Error::Plan(format!(
                                "select {:?} has no bounds; add a range()",
                                op_id
                            ))
                        })?;
                    query_bounds = Some(match query_bounds {
                        Some(b) => b.union(&bounds),
                        None => bounds,
                    });
                    bounds
                }
                ProcedureSpec::Range(range) => {
                    let own = range.resolve(spec.now);
                    match parent_bounds {
                        Some(pb) => own.intersect(&pb),
                        None => own,
                    }
                }
                ProcedureSpec::Join(_) => {
                    if parents.len() < 2 {
                        return Err(Error::Plan(format!(
                            "join {:?} requires at least two parents, got {}",
                            op_id,
                            parents.len()
                        )));
                    }
                    parent_bounds.expect("join parents checked above")
                }
                _ => parent_bounds.ok_or_else(|| {
                    Error::Plan(format!(
                        "operation {:?} has no parents and is not a source",
                        op_id
                    ))
                })?,
            };

            if self.source_kinds.contains(proc_spec.kind()) {
                sources.push(id);
            }
            datasets.insert(op_id.as_str(), id);
            nodes.push(PhysicalNode {
                id,
                op_id: op_id.clone(),
                spec: proc_spec,
                parents,
                bounds,
                trigger: TriggerSpec::ByWatermark,
            });
        }

        if sources.is_empty() {
            return Err(Error::Plan("plan has no sources".into()));
        }

        Ok(PhysicalPlan {
            nodes,
            sources,
            resources: spec.resources,
            now: spec.now,
            bounds: query_bounds
                .ok_or_else(|| Error::Plan("plan has no bounded sources".into()))?,
        })
    }
}

impl Default for Planner {
    fn default() -> Self {
        Planner::with_builtins()
    }
}

enum Pushdown {
    Bounds(RangeSpec),
    Window(WindowSpec),
}

impl RangeSpec {
    pub fn resolve(&self, now: Time) -> Bounds {
        Bounds::new(self.start.resolve(now), self.stop.resolve(now))
    }
}

fn invalid_spec(kind: &str, got: &OpSpec) -> Error {
    Error::internal(format!(
        "procedure {:?} built from op spec of kind {:?}",
        kind,
        got.kind()
    ))
}

/// All select procedures reachable upstream of `op_id`.
fn upstream_selects(
    spec: &QuerySpec,
    op_id: &str,
    procedures: &FxHashMap<String, ProcedureSpec>,
) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack: Vec<&str> = spec.parents(op_id);
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    while let Some(next) = stack.pop() {
        if !seen.insert(next) {
            continue;
        }
        if matches!(procedures.get(next), Some(ProcedureSpec::Select(_))) {
            out.push(next.to_string());
        }
        stack.extend(spec.parents(next));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{RangeSpec, SelectSpec};
    use virga_core::{Duration, TimeSpec};

    fn sum_query() -> QuerySpec {
        let mut spec = QuerySpec::new(Time(Duration::from_secs(36000).nanos()));
        spec.add_operation(
            "select0",
            OpSpec::Select(SelectSpec {
                database: "mydb".into(),
            }),
        );
        spec.add_operation(
            "range1",
            OpSpec::Range(RangeSpec {
                start: TimeSpec::relative(Duration::from_secs(-14400)),
                stop: TimeSpec::relative(Duration::from_secs(-7200)),
            }),
        );
        spec.add_operation("sum2", OpSpec::Sum);
        spec.add_edge("select0", "range1");
        spec.add_edge("range1", "sum2");
        spec
    }

    #[test]
    fn test_plan_chain() {
        let plan = Planner::with_builtins().plan(&sum_query()).unwrap();
        assert_eq!(plan.nodes.len(), 3);
        assert_eq!(plan.sources, vec![DatasetID(0)]);
        assert_eq!(plan.terminals(), vec![DatasetID(2)]);

        // Range bounds resolved against now and pushed into the select.
        let select = &plan.nodes[0];
        assert_eq!(
            select.bounds,
            Bounds::new(
                Time(Duration::from_secs(36000 - 14400).nanos()),
                Time(Duration::from_secs(36000 - 7200).nanos()),
            )
        );
        let ProcedureSpec::Select(sp) = &select.spec else {
            panic!("expected select procedure");
        };
        assert_eq!(sp.bounds.len(), 1);
    }

    #[test]
    fn test_parents_precede_children() {
        let plan = Planner::with_builtins().plan(&sum_query()).unwrap();
        let position: FxHashMap<DatasetID, usize> = plan
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id, i))
            .collect();
        for node in &plan.nodes {
            for parent in &node.parents {
                assert!(position[parent] < position[&node.id]);
            }
        }
    }

    #[test]
    fn test_unbounded_select_is_plan_error() {
        let mut spec = QuerySpec::new(Time(0));
        spec.add_operation(
            "select0",
            OpSpec::Select(SelectSpec {
                database: "mydb".into(),
            }),
        );
        let err = Planner::with_builtins().plan(&spec).unwrap_err();
        assert!(matches!(err, Error::Plan(_)));
    }

    #[test]
    fn test_join_requires_two_parents() {
        let mut spec = sum_query();
        spec.add_operation(
            "join3",
            OpSpec::Join(JoinSpec {
                on: vec!["host".into()],
                eval: virga_core::Expr::identifier("a"),
                tables: Default::default(),
            }),
        );
        spec.add_edge("sum2", "join3");
        let err = Planner::with_builtins().plan(&spec).unwrap_err();
        assert!(matches!(err, Error::Plan(_)));
    }

    #[test]
    fn test_window_pushdown_into_select() {
        let mut spec = QuerySpec::new(Time(Duration::from_secs(36000).nanos()));
        spec.add_operation(
            "select0",
            OpSpec::Select(SelectSpec {
                database: "mydb".into(),
            }),
        );
        spec.add_operation(
            "range1",
            OpSpec::Range(RangeSpec {
                start: TimeSpec::relative(Duration::from_secs(-14400)),
                stop: TimeSpec::NOW,
            }),
        );
        spec.add_operation(
            "window2",
            OpSpec::Window(WindowSpec {
                start: TimeSpec::relative(Duration::from_secs(-14400)),
                every: Duration::from_secs(3600),
                period: Duration::from_secs(3600),
                round: Duration::ZERO,
                offset: Duration::ZERO,
            }),
        );
        spec.add_edge("select0", "range1");
        spec.add_edge("range1", "window2");

        let plan = Planner::with_builtins().plan(&spec).unwrap();
        let ProcedureSpec::Select(sp) = &plan.nodes[0].spec else {
            panic!("expected select procedure");
        };
        assert_eq!(
            sp.window.map(|w| w.every),
            Some(Duration::from_secs(3600))
        );
    }
}
