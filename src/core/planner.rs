//! Execution planning: topological batches and hook binding.
//!
//! Batches come from Kahn's algorithm run level by level with alphabetical
//! tie-breaking, so the same graph always yields the same plan. Every node
//! in batch `k` depends only on nodes in batches `< k`.

use super::graph::{Graph, Node};
use super::types::{DatacenterConfig, HookConfig, Inputs};
use crate::plugins::{ModuleSource, PluginRegistry};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Planning failures. Any of these stops a run before a plugin is called.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("{node} depends on unknown node {target}")]
    DanglingEdge { node: String, target: String },

    #[error("no hook binds: {}", .nodes.join(", "))]
    Unbound { nodes: Vec<String> },

    #[error("unknown plugin '{plugin}' (used by {})", .nodes.join(", "))]
    UnknownPlugin { plugin: String, nodes: Vec<String> },
}

/// Plugin and module one node runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub plugin: String,
    pub module: ModuleSource,
    /// Hook default inputs, laid beneath the node's own inputs
    pub defaults: Inputs,
}

impl Binding {
    pub fn from_hook(hook: &HookConfig) -> Self {
        Self {
            plugin: hook.plugin.clone(),
            module: ModuleSource::parse(&hook.module),
            defaults: hook.inputs.clone(),
        }
    }
}

/// Ordered batches plus the binding of every node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPlan {
    pub batches: Vec<Vec<String>>,
    pub bindings: BTreeMap<String, Binding>,
}

impl ExecutionPlan {
    /// Flattened apply order.
    pub fn order(&self) -> Vec<&str> {
        self.batches.iter().flatten().map(String::as_str).collect()
    }

    /// Batches in destroy order: dependents before their dependencies.
    pub fn reversed(&self) -> Vec<Vec<String>> {
        self.batches.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Topological batches with sorted tie-breaking.
pub fn batches(graph: &Graph) -> Result<Vec<Vec<String>>, PlanError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

    for node in graph.nodes() {
        in_degree.insert(node.id.as_str(), 0);
        adjacency.entry(node.id.as_str()).or_default();
    }
    for node in graph.nodes() {
        for dep in &node.depends_on {
            if !graph.contains(dep) {
                return Err(PlanError::DanglingEdge {
                    node: node.id.clone(),
                    target: dep.clone(),
                });
            }
            adjacency.entry(dep.as_str()).or_default().push(node.id.as_str());
            *in_degree.entry(node.id.as_str()).or_default() += 1;
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut levels = Vec::new();
    let mut placed = 0;

    while !ready.is_empty() {
        ready.sort_unstable();
        let mut next = Vec::new();
        for id in &ready {
            for dependent in adjacency.get(id).map(Vec::as_slice).unwrap_or_default() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }
        placed += ready.len();
        levels.push(ready.iter().map(|s| s.to_string()).collect());
        ready = next;
    }

    if placed != graph.len() {
        // Nodes left with unresolved dependencies sit on or behind a cycle
        let path = graph.find_cycle().unwrap_or_else(|| {
            let mut residual: Vec<String> = in_degree
                .iter()
                .filter(|(_, &d)| d > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            residual.sort();
            residual
        });
        return Err(PlanError::Cycle { path });
    }
    Ok(levels)
}

/// First matching hook, component-scoped hooks before type-only hooks.
pub fn find_hook<'a>(hooks: &'a [HookConfig], node: &Node) -> Option<&'a HookConfig> {
    let matching = || {
        hooks
            .iter()
            .filter(|h| h.matches(node.resource_type, &node.component))
    };
    matching()
        .find(|h| h.component.is_some())
        .or_else(|| matching().next())
}

/// Bind every node to a hook and order the graph.
pub fn plan(
    graph: &Graph,
    datacenter: &DatacenterConfig,
    registry: &PluginRegistry,
) -> Result<ExecutionPlan, PlanError> {
    let batches = batches(graph)?;

    let mut bindings = BTreeMap::new();
    let mut unbound = Vec::new();
    let mut unknown: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for node in graph.nodes() {
        match find_hook(&datacenter.hooks, node) {
            None => unbound.push(node.id.clone()),
            Some(hook) if !registry.contains(&hook.plugin) => unknown
                .entry(hook.plugin.clone())
                .or_default()
                .push(node.id.clone()),
            Some(hook) => {
                bindings.insert(node.id.clone(), Binding::from_hook(hook));
            }
        }
    }
    if !unbound.is_empty() {
        unbound.sort();
        return Err(PlanError::Unbound { nodes: unbound });
    }
    if let Some((plugin, nodes)) = unknown.into_iter().next() {
        return Err(PlanError::UnknownPlugin { plugin, nodes });
    }

    Ok(ExecutionPlan { batches, bindings })
}
