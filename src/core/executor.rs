//! Module execution engine: drives plugins over a planned graph.
//!
//! Apply → plan (batches + hook bindings) → for each batch, nodes run
//! concurrently up to the policy's parallelism: resolve inputs → hash →
//! plugin call → state write → events. Destroy walks the batches backwards.
//!
//! Every plugin call is followed by a state write for that node, success or
//! failure. All writes for one environment go through its
//! [`EnvironmentHandle`], so concurrent nodes never race on the shared
//! environment record.

use super::expr;
use super::graph::{Graph, GraphError, Node, Reference};
use super::planner::{self, Binding, ExecutionPlan, PlanError};
use super::state::{
    EnvironmentHandle, EnvironmentLocks, EnvironmentState, ResourceState, ResourceStatus,
    StateError, StateStore,
};
use super::types::{DatacenterConfig, FailurePolicy, Inputs};
use crate::plugins::{
    Action, ChangeSummary, ModuleSource, OutputSink, Outputs, PluginError, PluginRegistry,
    PreviewResult, ResourceChange, RunOptions, Stream,
};
use crate::tripwire::drift::{self, DriftFinding};
use crate::tripwire::eventlog::{self, EventLog, ProvenanceEvent};
use crate::tripwire::hasher;
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Run-level failures. Node failures are not errors; they are recorded in
/// state and reported as [`Outcome::Failed`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("{node}: {source}")]
    Node {
        node: String,
        #[source]
        source: PluginError,
    },
}

/// Receives tool output tagged with the node that produced it.
pub type NodeSink = Arc<dyn Fn(&str, Stream, &str) + Send + Sync>;

/// Per-run settings.
#[derive(Clone)]
pub struct RunConfig {
    pub environment: String,
    /// Component variable overrides, keyed `name` or `component.name`
    pub variables: Inputs,
    /// Re-apply nodes whose inputs are unchanged
    pub force: bool,
    /// Overrides `policy.parallelism`
    pub parallelism: Option<usize>,
    /// Extra environment variables for every tool invocation
    pub env_vars: IndexMap<String, String>,
    /// Destroy drops records that never produced module state instead of
    /// calling the plugin
    pub forget_unapplied: bool,
    pub sink: Option<NodeSink>,
}

impl RunConfig {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            variables: Inputs::new(),
            force: false,
            parallelism: None,
            env_vars: IndexMap::new(),
            forget_unapplied: false,
            sink: None,
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// What happened to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ready,
    /// Ready with unchanged inputs; no plugin call
    Unchanged,
    Destroyed,
    /// Nothing stored, nothing to destroy
    Absent,
    /// Record without module state dropped; no plugin call
    Forgotten,
    Failed(String),
    /// A node this one is ordered against did not succeed
    Blocked { by: String },
    /// Not started: the run halted or was cancelled first
    Skipped,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Blocked { .. } | Self::Skipped)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Absent => write!(f, "absent"),
            Self::Forgotten => write!(f, "forgotten"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
            Self::Blocked { by } => write!(f, "blocked by {}", by),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeResult {
    pub id: String,
    pub outcome: Outcome,
    pub outputs: Outputs,
    pub duration: Duration,
}

impl NodeResult {
    fn new(id: &str, outcome: Outcome, started: Instant) -> Self {
        Self {
            id: id.to_string(),
            outcome,
            outputs: Outputs::new(),
            duration: started.elapsed(),
        }
    }
}

/// Per-node results of one apply or destroy.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub run_id: String,
    pub results: Vec<NodeResult>,
    /// Resources destroyed because they left their component
    pub pruned: Vec<NodeResult>,
}

impl RunReport {
    pub fn result(&self, id: &str) -> Option<&NodeResult> {
        self.results
            .iter()
            .chain(&self.pruned)
            .find(|r| r.id == id)
    }

    pub fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.results
            .iter()
            .chain(&self.pruned)
            .filter(|r| pred(&r.outcome))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.count(Outcome::is_failure)
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

#[derive(Debug, Clone)]
pub struct NodePreview {
    pub id: String,
    pub plugin: String,
    pub preview: PreviewResult,
}

#[derive(Debug, Clone, Default)]
pub struct EnvironmentPreview {
    pub nodes: Vec<NodePreview>,
    pub summary: ChangeSummary,
}

#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub findings: Vec<DriftFinding>,
    /// Nodes whose Refresh call failed, with the reason
    pub errors: Vec<(String, String)>,
}

// ============================================================================
// Engine
// ============================================================================

/// Plugin registry, state store and datacenter for one engine instance.
pub struct Engine {
    registry: PluginRegistry,
    store: Arc<dyn StateStore>,
    datacenter: DatacenterConfig,
    locks: Arc<EnvironmentLocks>,
    event_dir: Option<PathBuf>,
}

impl Engine {
    pub fn new(
        registry: PluginRegistry,
        store: Arc<dyn StateStore>,
        datacenter: DatacenterConfig,
    ) -> Self {
        Self {
            registry,
            store,
            datacenter,
            locks: Arc::default(),
            event_dir: None,
        }
    }

    /// Share environment locks with other engines over the same store.
    pub fn with_locks(mut self, locks: Arc<EnvironmentLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Write provenance events under `dir` when `policy.tripwire` is set.
    pub fn with_event_log(mut self, dir: impl Into<PathBuf>) -> Self {
        self.event_dir = Some(dir.into());
        self
    }

    pub fn datacenter(&self) -> &DatacenterConfig {
        &self.datacenter
    }

    pub fn plan(&self, graph: &Graph) -> Result<ExecutionPlan, EngineError> {
        Ok(planner::plan(graph, &self.datacenter, &self.registry)?)
    }

    /// Stored state of one environment.
    pub async fn status(&self, environment: &str) -> Result<EnvironmentState, EngineError> {
        Ok(self.handle(environment).snapshot().await?)
    }

    fn handle(&self, environment: &str) -> EnvironmentHandle {
        EnvironmentHandle::new(
            self.store.clone(),
            &self.locks,
            &self.datacenter.name,
            environment,
        )
    }

    fn start<'a>(&'a self, config: &'a RunConfig, cancel: &'a CancellationToken) -> Run<'a> {
        let events = match (&self.event_dir, self.datacenter.policy.tripwire) {
            (Some(dir), true) => Some(EventLog::new(dir, &self.datacenter.name, &config.environment)),
            _ => None,
        };
        Run {
            engine: self,
            handle: self.handle(&config.environment),
            events,
            config,
            cancel,
        }
    }

    /// Compute changes for every node without touching infrastructure.
    #[instrument(skip_all, fields(environment = %config.environment))]
    pub async fn preview(
        &self,
        graph: &Graph,
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> Result<EnvironmentPreview, EngineError> {
        let plan = self.plan(graph)?;
        let run = self.start(config, cancel);
        let env = run.handle.snapshot().await?;

        let jobs: Vec<(&Node, &Binding)> = plan
            .order()
            .into_iter()
            .filter_map(|id| Some((graph.get(id)?, plan.bindings.get(id)?)))
            .collect();
        let previews: Vec<Result<NodePreview, EngineError>> = stream::iter(jobs)
            .map(|(node, binding)| run.preview_node(node, binding, &env))
            .buffered(run.parallelism())
            .collect()
            .await;

        let mut result = EnvironmentPreview::default();
        for preview in previews {
            let preview = preview?;
            result.summary.merge(&preview.preview.summary);
            result.nodes.push(preview);
        }
        if self.datacenter.policy.prune {
            for stale in stale_resources(&env, graph) {
                let change = ResourceChange {
                    address: stale.id.clone(),
                    action: Action::Delete,
                    before: serde_json::to_value(&stale.inputs).ok(),
                    after: None,
                    diffs: Vec::new(),
                };
                let preview = PreviewResult::new(vec![change]);
                result.summary.merge(&preview.summary);
                result.nodes.push(NodePreview {
                    id: stale.id.clone(),
                    plugin: stale.plugin.clone().unwrap_or_default(),
                    preview,
                });
            }
        }
        info!(summary = %result.summary, "preview complete");
        Ok(result)
    }

    /// Converge every node, batch by batch.
    #[instrument(skip_all, fields(environment = %config.environment))]
    pub async fn apply(
        &self,
        graph: &Graph,
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> Result<RunReport, EngineError> {
        // A cycle or an unbound node stops here, before any plugin runs
        let plan = self.plan(graph)?;
        let run = self.start(config, cancel);
        let run_id = eventlog::generate_run_id();
        let started = Instant::now();
        run.event(ProvenanceEvent::ApplyStarted {
            environment: config.environment.clone(),
            run_id: run_id.clone(),
            operation: "apply".to_string(),
            nodes: plan.len(),
        });
        info!(run_id = %run_id, nodes = plan.len(), batches = plan.batches.len(), "apply started");

        let mut outcomes: HashMap<String, Outcome> = HashMap::new();
        let mut results = Vec::new();
        let mut halted = false;

        for batch in &plan.batches {
            let mut jobs = Vec::new();
            for id in batch {
                let (Some(node), Some(binding)) = (graph.get(id), plan.bindings.get(id)) else {
                    continue;
                };
                let now = Instant::now();
                let outcome = if halted || cancel.is_cancelled() {
                    Some(Outcome::Skipped)
                } else {
                    node.depends_on
                        .iter()
                        .find(|dep| outcomes.get(*dep).is_some_and(Outcome::is_failure))
                        .map(|dep| Outcome::Blocked { by: dep.clone() })
                };
                match outcome {
                    Some(outcome) => {
                        debug!(node = %id, outcome = %outcome, "not started");
                        outcomes.insert(id.clone(), outcome.clone());
                        results.push(NodeResult::new(id, outcome, now));
                    }
                    None => jobs.push((node, binding)),
                }
            }

            let finished: Vec<Result<NodeResult, EngineError>> = stream::iter(jobs)
                .map(|(node, binding)| run.apply_node(node, binding))
                .buffer_unordered(run.parallelism())
                .collect()
                .await;
            let mut finished = finished.into_iter().collect::<Result<Vec<_>, _>>()?;
            finished.sort_by(|a, b| a.id.cmp(&b.id));

            for result in finished {
                if result.outcome.is_failure()
                    && self.datacenter.policy.failure == FailurePolicy::StopOnFirst
                {
                    warn!(node = %result.id, "stopping after failure");
                    halted = true;
                }
                outcomes.insert(result.id.clone(), result.outcome.clone());
                results.push(result);
            }
        }

        let mut report = RunReport {
            run_id: run_id.clone(),
            results,
            pruned: Vec::new(),
        };
        if self.datacenter.policy.prune && report.is_success() && !cancel.is_cancelled() {
            let env = run.handle.snapshot().await?;
            let stale: Vec<&ResourceState> = stale_resources(&env, graph).collect();
            if !stale.is_empty() {
                info!(count = stale.len(), "pruning resources removed from components");
                let stale_graph = graph_from_state(stale)?;
                let batches = planner::batches(&stale_graph)?;
                report.pruned = run.destroy_batches(&stale_graph, &batches).await?;
            }
        }

        let ready = report.count(|o| *o == Outcome::Ready) as u32;
        let unchanged = report.count(|o| *o == Outcome::Unchanged) as u32;
        let failed = report.failed() as u32;
        run.event(ProvenanceEvent::ApplyCompleted {
            environment: config.environment.clone(),
            run_id,
            ready,
            unchanged,
            failed,
            total_seconds: started.elapsed().as_secs_f64(),
        });
        info!(ready, unchanged, failed, "apply complete");
        Ok(report)
    }

    /// Destroy every node of `graph`, dependents first.
    #[instrument(skip_all, fields(environment = %config.environment))]
    pub async fn destroy(
        &self,
        graph: &Graph,
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> Result<RunReport, EngineError> {
        let batches = planner::batches(graph)?;
        let run = self.start(config, cancel);
        let run_id = eventlog::generate_run_id();
        run.event(ProvenanceEvent::ApplyStarted {
            environment: config.environment.clone(),
            run_id: run_id.clone(),
            operation: "destroy".to_string(),
            nodes: graph.len(),
        });
        let results = run.destroy_batches(graph, &batches).await?;
        run.handle.remove_if_empty().await?;
        Ok(RunReport {
            run_id,
            results,
            pruned: Vec::new(),
        })
    }

    /// Destroy everything stored for an environment. The graph is rebuilt
    /// from the dependencies recorded in state, so no component files are
    /// needed.
    #[instrument(skip_all, fields(environment = %config.environment))]
    pub async fn destroy_environment(
        &self,
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> Result<RunReport, EngineError> {
        let env = self.handle(&config.environment).snapshot().await?;
        let graph = graph_from_state(env.resources().collect())?;
        self.destroy(&graph, config, cancel).await
    }

    /// Re-read every Ready node and report drift. Nothing is persisted.
    #[instrument(skip_all, fields(environment = %config.environment))]
    pub async fn refresh(
        &self,
        graph: &Graph,
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> Result<RefreshReport, EngineError> {
        let batches = planner::batches(graph)?;
        let run = self.start(config, cancel);
        let run = &run;
        let env = run.handle.snapshot().await?;

        let jobs: Vec<(&Node, &ResourceState)> = batches
            .iter()
            .flatten()
            .filter_map(|id| {
                let node = graph.get(id)?;
                let state = env.resource(&node.component, id)?;
                state.is_ready().then_some((node, state))
            })
            .collect();
        let refreshed: Vec<(String, Result<Option<DriftFinding>, String>)> = stream::iter(jobs)
            .map(|(node, state)| async move { (node.id.clone(), run.refresh_node(node, state).await) })
            .buffered(run.parallelism())
            .collect()
            .await;

        let mut report = RefreshReport::default();
        for (id, result) in refreshed {
            match result {
                Ok(finding) => {
                    report.refreshed += 1;
                    if let Some(finding) = finding {
                        warn!(node = %id, detail = %finding.detail, "drift detected");
                        run.event(ProvenanceEvent::DriftDetected {
                            resource: id,
                            expected_hash: finding.expected_hash.clone(),
                            actual_hash: finding.actual_hash.clone(),
                        });
                        report.findings.push(finding);
                    }
                }
                Err(reason) => report.errors.push((id, reason)),
            }
        }
        Ok(report)
    }

    /// Node inputs with every expression substituted, layered over hook
    /// defaults and datacenter variables. Unresolvable expressions stay
    /// verbatim and are returned alongside.
    fn resolve_inputs(
        &self,
        node: &Node,
        binding: &Binding,
        env: &EnvironmentState,
        config: &RunConfig,
    ) -> (Inputs, Vec<String>) {
        let mut unresolved = Vec::new();
        let mut inputs = self.datacenter.variables.clone();

        let mut hook_value = |expression: &str| -> Option<Value> {
            let segs = expr::segments(expression);
            match segs.as_slice() {
                ["variables", name] => self.datacenter.variables.get(*name).cloned(),
                ["node", "id"] => Some(Value::String(node.id.clone())),
                ["node", "name"] => Some(Value::String(node.name.clone())),
                ["node", "type"] => Some(Value::String(node.resource_type.to_string())),
                ["node", "component"] => Some(Value::String(node.component.clone())),
                _ => self.context_value(expression, node, config),
            }
        };
        for (key, value) in &binding.defaults {
            inputs.insert(
                key.clone(),
                expr::interpolate(value, &mut hook_value, &mut unresolved),
            );
        }

        let mut node_value = |expression: &str| -> Option<Value> {
            match node.references.get(expression)? {
                Reference::Output { node: dep, path } => output_value(&env.find(dep)?.outputs, path),
                Reference::Variable { name, default } => config
                    .variables
                    .get(&format!("{}.{}", node.component, name))
                    .or_else(|| config.variables.get(name))
                    .cloned()
                    .or_else(|| default.clone()),
                Reference::Context { key } => self.context_value(key, node, config),
            }
        };
        for (key, value) in &node.inputs {
            inputs.insert(
                key.clone(),
                expr::interpolate(value, &mut node_value, &mut unresolved),
            );
        }
        (inputs, unresolved)
    }

    fn context_value(&self, key: &str, node: &Node, config: &RunConfig) -> Option<Value> {
        let value = match key {
            "environment.name" => config.environment.clone(),
            "environment.datacenter" | "datacenter.name" => self.datacenter.name.clone(),
            "component.name" => node.component.clone(),
            _ => return None,
        };
        Some(Value::String(value))
    }

    /// Binding recorded in state, else the current hook.
    fn stored_binding(&self, state: &ResourceState, node: &Node) -> Option<Binding> {
        match (&state.plugin, &state.module) {
            (Some(plugin), Some(module)) => Some(Binding {
                plugin: plugin.clone(),
                module: ModuleSource::parse(module),
                defaults: Inputs::new(),
            }),
            _ => planner::find_hook(&self.datacenter.hooks, node).map(Binding::from_hook),
        }
    }
}

/// Output `path[0]`, walked into by the rest of the path. An empty path
/// yields every output as one object.
fn output_value(outputs: &Outputs, path: &[String]) -> Option<Value> {
    match path.split_first() {
        None => Some(Value::Object(
            outputs
                .iter()
                .map(|(k, v)| (k.clone(), v.value.clone()))
                .collect(),
        )),
        Some((name, rest)) => expr::lookup(&outputs.get(name)?.value, rest).cloned(),
    }
}

/// BLAKE3 over plugin, module content and resolved inputs.
pub fn inputs_hash(binding: &Binding, inputs: &Inputs) -> String {
    hasher::composite_hash(&[
        &binding.plugin,
        &binding.module.fingerprint(),
        &hasher::hash_json(inputs),
    ])
}

/// Stored resources of the graph's components that the graph no longer has.
fn stale_resources<'a>(
    env: &'a EnvironmentState,
    graph: &'a Graph,
) -> impl Iterator<Item = &'a ResourceState> + 'a {
    let components: BTreeSet<&str> = graph.components().into_iter().collect();
    env.resources()
        .filter(move |r| components.contains(r.component.as_str()) && !graph.contains(&r.id))
}

/// Rebuild a graph from stored resources, keeping only edges between them.
fn graph_from_state(states: Vec<&ResourceState>) -> Result<Graph, GraphError> {
    let ids: BTreeSet<&str> = states.iter().map(|s| s.id.as_str()).collect();
    Graph::from_nodes(states.iter().map(|s| Node {
        id: s.id.clone(),
        resource_type: s.resource_type,
        component: s.component.clone(),
        name: s.name.clone(),
        inputs: s.inputs.clone(),
        depends_on: s
            .depends_on
            .iter()
            .filter(|d| ids.contains(d.as_str()))
            .cloned()
            .collect(),
        references: Default::default(),
    }))
}

fn failure_reason(err: &PluginError) -> String {
    match err {
        PluginError::Cancelled => "cancelled".to_string(),
        other => other.to_string(),
    }
}

// ============================================================================
// One run
// ============================================================================

struct Run<'a> {
    engine: &'a Engine,
    handle: EnvironmentHandle,
    events: Option<EventLog>,
    config: &'a RunConfig,
    cancel: &'a CancellationToken,
}

impl Run<'_> {
    fn parallelism(&self) -> usize {
        self.config
            .parallelism
            .unwrap_or(self.engine.datacenter.policy.parallelism)
            .max(1)
    }

    fn event(&self, event: ProvenanceEvent) {
        if let Some(log) = &self.events {
            if let Err(e) = log.append(event) {
                warn!(path = %log.path().display(), error = %e, "cannot write event log");
            }
        }
    }

    /// Tool output goes to debug logs and the caller's sink.
    fn sink_for(&self, id: &str) -> OutputSink {
        let id = id.to_string();
        let forward = self.config.sink.clone();
        Arc::new(move |stream: Stream, line: &str| {
            debug!(node = %id, ?stream, "{}", line);
            if let Some(sink) = &forward {
                sink(&id, stream, line);
            }
        })
    }

    fn options(&self, id: &str, module: ModuleSource, inputs: Inputs, state: Option<Vec<u8>>) -> RunOptions {
        let mut opts = RunOptions::new(module, inputs).with_state(state);
        opts.environment = self.config.env_vars.clone();
        opts.sink = Some(self.sink_for(id));
        opts
    }

    async fn preview_node(
        &self,
        node: &Node,
        binding: &Binding,
        env: &EnvironmentState,
    ) -> Result<NodePreview, EngineError> {
        let prior = env.resource(&node.component, &node.id);
        let (inputs, _) = self.engine.resolve_inputs(node, binding, env, self.config);
        let hash = inputs_hash(binding, &inputs);

        let unchanged = !self.config.force
            && prior.is_some_and(|p| p.is_ready() && p.inputs_hash.as_deref() == Some(hash.as_str()));
        let preview = if unchanged {
            PreviewResult::new(vec![ResourceChange {
                address: node.id.clone(),
                action: Action::Noop,
                before: None,
                after: None,
                diffs: Vec::new(),
            }])
        } else {
            let plugin = self.plugin(&node.id, &binding.plugin)?;
            let opts = self.options(
                &node.id,
                binding.module.clone(),
                inputs,
                prior.and_then(|p| p.module_state.clone()),
            );
            plugin
                .preview(&opts, self.cancel)
                .await
                .map_err(|source| EngineError::Node {
                    node: node.id.clone(),
                    source,
                })?
        };
        Ok(NodePreview {
            id: node.id.clone(),
            plugin: binding.plugin.clone(),
            preview,
        })
    }

    fn plugin(
        &self,
        id: &str,
        name: &str,
    ) -> Result<Arc<dyn crate::plugins::ModulePlugin>, EngineError> {
        self.engine
            .registry
            .get(name)
            .ok_or_else(|| EngineError::Plan(PlanError::UnknownPlugin {
                plugin: name.to_string(),
                nodes: vec![id.to_string()],
            }))
    }

    async fn fail(&self, state: &mut ResourceState, reason: String, started: Instant) -> Result<NodeResult, EngineError> {
        warn!(node = %state.id, reason = %reason, "resource failed");
        state.transition(ResourceStatus::Failed, Some(reason.clone()));
        self.handle.put(state).await?;
        self.event(ProvenanceEvent::ResourceFailed {
            resource: state.id.clone(),
            error: reason.clone(),
        });
        Ok(NodeResult::new(&state.id, Outcome::Failed(reason), started))
    }

    async fn apply_node(&self, node: &Node, binding: &Binding) -> Result<NodeResult, EngineError> {
        let started = Instant::now();
        if self.cancel.is_cancelled() {
            return Ok(NodeResult::new(&node.id, Outcome::Skipped, started));
        }
        let env = self.handle.snapshot().await?;
        let prior = env.resource(&node.component, &node.id).cloned();
        let (inputs, unresolved) = self.engine.resolve_inputs(node, binding, &env, self.config);
        drop(env);

        let prior_blob = prior.as_ref().and_then(|p| p.module_state.clone());
        let action = if prior_blob.is_some() { "update" } else { "create" };
        let hash = inputs_hash(binding, &inputs);
        if let Some(p) = &prior {
            if !self.config.force && p.is_ready() && p.inputs_hash.as_deref() == Some(hash.as_str()) {
                debug!(node = %node.id, "unchanged");
                let mut result = NodeResult::new(&node.id, Outcome::Unchanged, started);
                result.outputs = p.outputs.clone();
                return Ok(result);
            }
        }

        let mut state = prior.unwrap_or_else(|| ResourceState::pending(node));
        state.inputs = inputs.clone();
        state.depends_on = node.depends_on.iter().cloned().collect();
        state.plugin = Some(binding.plugin.clone());
        state.module = Some(binding.module.to_string());
        state.inputs_hash = None;

        if !unresolved.is_empty() {
            let reason = format!("unresolved expressions: {}", unresolved.join(", "));
            return self.fail(&mut state, reason, started).await;
        }
        let plugin = self.plugin(&node.id, &binding.plugin)?;

        state.transition(ResourceStatus::Provisioning, None);
        self.handle.put(&state).await?;
        self.event(ProvenanceEvent::ResourceStarted {
            resource: node.id.clone(),
            plugin: binding.plugin.clone(),
            action: action.to_string(),
        });
        info!(node = %node.id, plugin = %binding.plugin, action, "provisioning");

        let opts = self.options(&node.id, binding.module.clone(), inputs, prior_blob.clone());
        match plugin.apply(&opts, self.cancel).await {
            Ok(applied) => {
                state.outputs = applied.outputs;
                state.module_state = Some(applied.state);
                state.inputs_hash = Some(hash.clone());
                state.transition(ResourceStatus::Ready, None);
                self.handle.put(&state).await?;
                let elapsed = started.elapsed();
                self.event(ProvenanceEvent::ResourceReady {
                    resource: node.id.clone(),
                    duration_seconds: elapsed.as_secs_f64(),
                    inputs_hash: hash,
                });
                info!(node = %node.id, seconds = elapsed.as_secs_f64(), "ready");
                let mut result = NodeResult::new(&node.id, Outcome::Ready, started);
                result.outputs = state.outputs.clone();
                Ok(result)
            }
            Err(err) => {
                // Keep whatever the tool left behind; else the last good blob
                state.module_state = opts.state_writer.take().or(prior_blob);
                self.fail(&mut state, failure_reason(&err), started).await
            }
        }
    }

    /// Run `batches` backwards. A node whose dependent did not go away is
    /// blocked, so nothing is destroyed while something still uses it.
    async fn destroy_batches(
        &self,
        graph: &Graph,
        batches: &[Vec<String>],
    ) -> Result<Vec<NodeResult>, EngineError> {
        let mut outcomes: HashMap<String, Outcome> = HashMap::new();
        let mut results = Vec::new();
        let mut halted = false;

        for batch in batches.iter().rev() {
            let mut jobs = Vec::new();
            for id in batch {
                let Some(node) = graph.get(id) else { continue };
                let now = Instant::now();
                let outcome = if halted || self.cancel.is_cancelled() {
                    Some(Outcome::Skipped)
                } else {
                    graph
                        .dependents_of(id)
                        .into_iter()
                        .find(|d| outcomes.get(*d).is_some_and(Outcome::is_failure))
                        .map(|d| Outcome::Blocked { by: d.to_string() })
                };
                match outcome {
                    Some(outcome) => {
                        outcomes.insert(id.clone(), outcome.clone());
                        results.push(NodeResult::new(id, outcome, now));
                    }
                    None => jobs.push(node),
                }
            }

            let finished: Vec<Result<NodeResult, EngineError>> = stream::iter(jobs)
                .map(|node| self.destroy_node(node))
                .buffer_unordered(self.parallelism())
                .collect()
                .await;
            let mut finished = finished.into_iter().collect::<Result<Vec<_>, _>>()?;
            finished.sort_by(|a, b| a.id.cmp(&b.id));
            for result in finished {
                if result.outcome.is_failure()
                    && self.engine.datacenter.policy.failure == FailurePolicy::StopOnFirst
                {
                    halted = true;
                }
                outcomes.insert(result.id.clone(), result.outcome.clone());
                results.push(result);
            }
        }
        Ok(results)
    }

    async fn destroy_node(&self, node: &Node) -> Result<NodeResult, EngineError> {
        let started = Instant::now();
        if self.cancel.is_cancelled() {
            return Ok(NodeResult::new(&node.id, Outcome::Skipped, started));
        }
        let Some(prior) = self.handle.get(&node.component, &node.id).await? else {
            return Ok(NodeResult::new(&node.id, Outcome::Absent, started));
        };
        if self.config.forget_unapplied && prior.module_state.is_none() {
            self.handle.remove(&node.component, &node.id).await?;
            info!(node = %node.id, status = %prior.status, "forgot record without module state");
            return Ok(NodeResult::new(&node.id, Outcome::Forgotten, started));
        }
        let mut state = prior.clone();
        let Some(binding) = self.engine.stored_binding(&prior, node) else {
            return self
                .fail(&mut state, "no hook binds this resource".to_string(), started)
                .await;
        };
        let Some(plugin) = self.engine.registry.get(&binding.plugin) else {
            let reason = format!("unknown plugin '{}'", binding.plugin);
            return self.fail(&mut state, reason, started).await;
        };

        state.transition(ResourceStatus::Destroying, None);
        self.handle.put(&state).await?;
        info!(node = %node.id, plugin = %binding.plugin, "destroying");

        let opts = self.options(
            &node.id,
            binding.module,
            prior.inputs.clone(),
            prior.module_state.clone(),
        );
        match plugin.destroy(&opts, self.cancel).await {
            Ok(()) => {
                self.handle.remove(&node.component, &node.id).await?;
                let elapsed = started.elapsed();
                self.event(ProvenanceEvent::ResourceDestroyed {
                    resource: node.id.clone(),
                    duration_seconds: elapsed.as_secs_f64(),
                });
                info!(node = %node.id, seconds = elapsed.as_secs_f64(), "destroyed");
                Ok(NodeResult::new(&node.id, Outcome::Destroyed, started))
            }
            Err(err) => {
                state.module_state = opts.state_writer.take().or(prior.module_state);
                self.fail(&mut state, failure_reason(&err), started).await
            }
        }
    }

    async fn refresh_node(&self, node: &Node, stored: &ResourceState) -> Result<Option<DriftFinding>, String> {
        let binding = self
            .engine
            .stored_binding(stored, node)
            .ok_or_else(|| "no hook binds this resource".to_string())?;
        let plugin = self
            .engine
            .registry
            .get(&binding.plugin)
            .ok_or_else(|| format!("unknown plugin '{}'", binding.plugin))?;
        let opts = self.options(
            &node.id,
            binding.module,
            stored.inputs.clone(),
            stored.module_state.clone(),
        );
        let live = plugin
            .refresh(&opts, self.cancel)
            .await
            .map_err(|e| failure_reason(&e))?;
        Ok(drift::check_resource(stored, &live))
    }
}
