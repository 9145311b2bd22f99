//! Query spec: the operation graph produced by the parser
//!
//! A `QuerySpec` owns its operations (unique string IDs) and directed edges.
//! Edge insertion order is meaningful: it defines the parent ordinal a join
//! sees. The spec serializes deterministically, so equivalent queries yield
//! equal serialized specs.

use crate::ops::OpSpec;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use virga_core::{Error, Result, Time};

/// One node of the op-graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    #[serde(flatten)]
    pub spec: OpSpec,
}

/// A directed parent → child edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub parent: String,
    pub child: String,
}

/// Per-query resource requests, consumed by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub priority: u32,
    /// Zero means unlimited.
    pub concurrency_quota: usize,
    /// Zero means unlimited.
    pub memory_bytes_quota: u64,
}

impl Default for Resources {
    fn default() -> Self {
        Resources {
            priority: 0,
            concurrency_quota: 0,
            memory_bytes_quota: 0,
        }
    }
}

/// The operation graph for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub operations: Vec<Operation>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub resources: Resources,
    /// Plan-time "now" that relative times resolve against.
    pub now: Time,
}

impl QuerySpec {
    pub fn new(now: Time) -> Self {
        QuerySpec {
            operations: Vec::new(),
            edges: Vec::new(),
            resources: Resources::default(),
            now,
        }
    }

    pub fn add_operation(&mut self, id: impl Into<String>, spec: OpSpec) -> &mut Self {
        self.operations.push(Operation {
            id: id.into(),
            spec,
        });
        self
    }

    pub fn add_edge(&mut self, parent: impl Into<String>, child: impl Into<String>) -> &mut Self {
        self.edges.push(Edge {
            parent: parent.into(),
            child: child.into(),
        });
        self
    }

    pub fn operation(&self, id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }

    /// Children of `id`, in edge insertion order.
    pub fn children(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.parent == id)
            .map(|e| e.child.as_str())
            .collect()
    }

    /// Parents of `id`, in edge insertion order. The order defines the
    /// parent ordinal joins see.
    pub fn parents(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.child == id)
            .map(|e| e.parent.as_str())
            .collect()
    }

    /// Operations with no parents.
    pub fn roots(&self) -> Vec<&str> {
        let children: FxHashSet<&str> = self.edges.iter().map(|e| e.child.as_str()).collect();
        self.operations
            .iter()
            .map(|op| op.id.as_str())
            .filter(|id| !children.contains(id))
            .collect()
    }

    /// Check structural invariants: unique IDs, edges touch existing
    /// operations, the graph is acyclic.
    pub fn validate(&self) -> Result<()> {
        let mut seen = FxHashSet::default();
        for op in &self.operations {
            if !seen.insert(op.id.as_str()) {
                return Err(Error::Plan(format!("duplicate operation id {:?}", op.id)));
            }
        }
        for edge in &self.edges {
            for end in [&edge.parent, &edge.child] {
                if !seen.contains(end.as_str()) {
                    return Err(Error::Plan(format!(
                        "edge references unknown operation {:?}",
                        end
                    )));
                }
            }
        }
        self.sorted().map(|_| ())
    }

    /// Topological order: every parent precedes its children; equal-depth
    /// ties resolve to original operation order (stable).
    pub fn sorted(&self) -> Result<Vec<&str>> {
        let index: FxHashMap<&str, usize> = self
            .operations
            .iter()
            .enumerate()
            .map(|(i, op)| (op.id.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.operations.len()];
        for edge in &self.edges {
            if let Some(&child) = index.get(edge.child.as_str()) {
                in_degree[child] += 1;
            }
        }

        // Kahn's walk; the ready list stays sorted by operation index so
        // the order is deterministic for equal specs.
        let mut ready: Vec<usize> = (0..self.operations.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.operations.len());
        while let Some(&next) = ready.iter().min() {
            ready.retain(|&i| i != next);
            let id = self.operations[next].id.as_str();
            order.push(id);
            for edge in self.edges.iter().filter(|e| e.parent == id) {
                let child = index[edge.child.as_str()];
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    ready.push(child);
                }
            }
        }

        if order.len() != self.operations.len() {
            return Err(Error::Plan("operation graph contains a cycle".into()));
        }
        Ok(order)
    }
}
