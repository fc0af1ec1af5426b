//! CLI subcommands: validate, graph, plan, apply, destroy, refresh, status.

use crate::core::executor::{
    Engine, EnvironmentPreview, NodeSink, Outcome, RefreshReport, RunConfig, RunReport,
};
use crate::core::graph::Graph;
use crate::core::resolver::{DependencyResolver, FsComponentLoader, ResolvedComponentGraph};
use crate::core::state::{EnvironmentState, FileStateStore, StateStore};
use crate::core::types::{DatacenterConfig, Inputs};
use crate::core::{parser, planner};
use crate::plugins::{Action, CachedModuleFetcher, Outputs, PluginRegistry, Stream};
use clap::{Args, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a component tree and a datacenter file
    Validate {
        #[command(flatten)]
        target: Target,
    },

    /// Print the resource graph in execution order
    Graph {
        /// Root component (directory, file or registry reference)
        #[arg(short, long, default_value = ".")]
        component: String,

        /// Component and module cache
        #[arg(long, default_value = ".strata/cache")]
        cache: PathBuf,
    },

    /// Show what apply would change
    Plan {
        #[command(flatten)]
        target: Target,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Converge an environment to the component definitions
    Apply {
        #[command(flatten)]
        target: Target,

        #[command(flatten)]
        run: RunArgs,

        /// Re-apply resources whose inputs are unchanged
        #[arg(long)]
        force: bool,
    },

    /// Destroy an environment's resources, dependents first
    Destroy {
        #[command(flatten)]
        target: Target,

        #[command(flatten)]
        run: RunArgs,

        /// Destroy everything recorded in state; component files are not read
        #[arg(long)]
        from_state: bool,

        /// Drop records that never produced module state without running
        /// the plugin, e.g. resources whose first apply failed
        #[arg(long)]
        forget_unapplied: bool,
    },

    /// Compare live infrastructure with recorded state
    Refresh {
        #[command(flatten)]
        target: Target,

        #[command(flatten)]
        run: RunArgs,

        /// Exit non-zero on any drift (for CI/cron)
        #[arg(long)]
        tripwire: bool,
    },

    /// Show recorded state for an environment
    Status {
        /// Path to datacenter.yml
        #[arg(short, long, default_value = "datacenter.yml")]
        datacenter: PathBuf,

        /// Environment name
        #[arg(short, long, default_value = "default")]
        environment: String,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },
}

/// Component tree, datacenter and state location.
#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Root component (directory, file or registry reference)
    #[arg(short, long, default_value = ".")]
    pub component: String,

    /// Path to datacenter.yml
    #[arg(short, long, default_value = "datacenter.yml")]
    pub datacenter: PathBuf,

    /// Environment name
    #[arg(short, long, default_value = "default")]
    pub environment: String,

    /// State directory
    #[arg(long, default_value = "state")]
    pub state_dir: PathBuf,

    /// Component and module cache
    #[arg(long, default_value = ".strata/cache")]
    pub cache: PathBuf,
}

/// Settings for commands that invoke plugins.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Variable override, `name=value` or `component.name=value` (repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE")]
    pub vars: Vec<String>,

    /// Maximum concurrent module invocations (overrides policy)
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Cancel in-flight work after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Print tool output as it arrives
    #[arg(long)]
    pub stream: bool,
}

/// Dispatch a CLI command.
pub async fn dispatch(cmd: Commands, cancel: CancellationToken) -> Result<(), String> {
    match cmd {
        Commands::Validate { target } => cmd_validate(&target, &cancel).await,
        Commands::Graph { component, cache } => cmd_graph(&component, &cache, &cancel).await,
        Commands::Plan { target, run } => cmd_plan(&target, &run, &cancel).await,
        Commands::Apply { target, run, force } => cmd_apply(&target, &run, force, &cancel).await,
        Commands::Destroy {
            target,
            run,
            from_state,
            forget_unapplied,
        } => cmd_destroy(&target, &run, from_state, forget_unapplied, &cancel).await,
        Commands::Refresh {
            target,
            run,
            tripwire,
        } => cmd_refresh(&target, &run, tripwire, &cancel).await,
        Commands::Status {
            datacenter,
            environment,
            state_dir,
        } => cmd_status(&datacenter, &environment, &state_dir),
    }
}

// ============================================================================
// Loading
// ============================================================================

async fn resolve(
    component: &str,
    cache: &Path,
    cancel: &CancellationToken,
) -> Result<ResolvedComponentGraph, String> {
    let loader = Arc::new(FsComponentLoader::with_cache(cache.join("components")));
    DependencyResolver::new(loader)
        .resolve(component, cancel)
        .await
        .map_err(|e| e.to_string())
}

async fn load_graph(target: &Target, cancel: &CancellationToken) -> Result<Graph, String> {
    let resolved = resolve(&target.component, &target.cache, cancel).await?;
    resolved.graph().map_err(|e| e.to_string())
}

fn load_datacenter(path: &Path) -> Result<DatacenterConfig, String> {
    parser::load_datacenter(path).map_err(|e| e.to_string())
}

fn engine(target: &Target, datacenter: DatacenterConfig) -> Engine {
    let fetcher = Arc::new(CachedModuleFetcher::new(target.cache.join("modules")));
    let registry = PluginRegistry::with_defaults(&datacenter.plugins, fetcher);
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(&target.state_dir));
    Engine::new(registry, store, datacenter).with_event_log(&target.state_dir)
}

/// Parse `key=value`. The value is read as a YAML scalar so numbers and
/// booleans keep their type.
fn parse_var(arg: &str) -> Result<(String, Value), String> {
    let (key, raw) = arg
        .split_once('=')
        .ok_or_else(|| format!("invalid --var '{}': expected KEY=VALUE", arg))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid --var '{}': empty key", arg));
    }
    let value = match serde_yaml_ng::from_str::<Value>(raw) {
        Ok(v @ (Value::Bool(_) | Value::Number(_) | Value::String(_))) => v,
        _ => Value::String(raw.to_string()),
    };
    Ok((key.to_string(), value))
}

fn run_config(
    target: &Target,
    run: &RunArgs,
    cancel: &CancellationToken,
) -> Result<RunConfig, String> {
    let mut config = RunConfig::new(&target.environment);
    let mut variables = Inputs::new();
    for arg in &run.vars {
        let (key, value) = parse_var(arg)?;
        variables.insert(key, value);
    }
    config.variables = variables;
    config.parallelism = run.parallelism;
    if run.stream {
        let sink: NodeSink = Arc::new(|id: &str, stream: Stream, line: &str| match stream {
            Stream::Stdout => println!("  [{}] {}", id, line),
            Stream::Stderr => eprintln!("  [{}] {}", id, line),
        });
        config.sink = Some(sink);
    }
    if let Some(secs) = run.timeout {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            if !cancel.is_cancelled() {
                tracing::warn!(seconds = secs, "timeout reached, cancelling");
                cancel.cancel();
            }
        });
    }
    Ok(config)
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_validate(target: &Target, cancel: &CancellationToken) -> Result<(), String> {
    let resolved = resolve(&target.component, &target.cache, cancel).await?;
    let graph = resolved.graph().map_err(|e| e.to_string())?;
    let dc = load_datacenter(&target.datacenter)?;
    println!(
        "OK: {} component(s), {} resource(s)",
        resolved.order.len(),
        graph.len()
    );
    println!("OK: datacenter {} ({} hooks)", dc.name, dc.hooks.len());
    Ok(())
}

async fn cmd_graph(component: &str, cache: &Path, cancel: &CancellationToken) -> Result<(), String> {
    let resolved = resolve(component, cache, cancel).await?;
    let graph = resolved.graph().map_err(|e| e.to_string())?;
    print!("{}", format_graph(&graph)?);
    Ok(())
}

/// Nodes grouped by batch, each with its dependencies.
fn format_graph(graph: &Graph) -> Result<String, String> {
    let batches = planner::batches(graph).map_err(|e| e.to_string())?;
    let mut out = format!(
        "Graph: {} resources, {} edges, {} batches\n",
        graph.len(),
        graph.edges().len(),
        batches.len()
    );
    for (i, batch) in batches.iter().enumerate() {
        out.push_str(&format!("batch {}:\n", i + 1));
        for id in batch {
            let deps = graph
                .get(id)
                .map(|n| n.depends_on.iter().cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            if deps.is_empty() {
                out.push_str(&format!("  {}\n", id));
            } else {
                out.push_str(&format!("  {} <- {}\n", id, deps.join(", ")));
            }
        }
    }
    Ok(out)
}

async fn cmd_plan(target: &Target, run: &RunArgs, cancel: &CancellationToken) -> Result<(), String> {
    let graph = load_graph(target, cancel).await?;
    let engine = engine(target, load_datacenter(&target.datacenter)?);
    let config = run_config(target, run, cancel)?;
    let preview = engine
        .preview(&graph, &config, cancel)
        .await
        .map_err(|e| e.to_string())?;
    print!("{}", format_preview(&target.environment, &preview));
    Ok(())
}

fn symbol(action: Action) -> &'static str {
    match action {
        Action::Create => "+",
        Action::Update => "~",
        Action::Delete => "-",
        Action::Replace => "-/+",
        Action::Noop => " ",
    }
}

fn format_preview(environment: &str, preview: &EnvironmentPreview) -> String {
    let mut out = format!(
        "Planning: {} ({} resources)\n\n",
        environment,
        preview.nodes.len()
    );
    for node in &preview.nodes {
        out.push_str(&format!("{} [{}]:\n", node.id, node.plugin));
        for change in &node.preview.changes {
            out.push_str(&format!("  {} {}\n", symbol(change.action), change.address));
            for diff in &change.diffs {
                out.push_str(&format!(
                    "      {}: {} -> {}\n",
                    diff.path,
                    render(diff.before.as_ref()),
                    render(diff.after.as_ref())
                ));
            }
        }
    }
    let s = &preview.summary;
    out.push_str(&format!(
        "\nPlan: {} to add, {} to change, {} to replace, {} to destroy.\n",
        s.create, s.update, s.replace, s.delete
    ));
    out
}

fn render(value: Option<&Value>) -> String {
    match value {
        None => "(none)".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

async fn cmd_apply(
    target: &Target,
    run: &RunArgs,
    force: bool,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let graph = load_graph(target, cancel).await?;
    let engine = engine(target, load_datacenter(&target.datacenter)?);
    let mut config = run_config(target, run, cancel)?;
    config.force = force;
    let report = engine
        .apply(&graph, &config, cancel)
        .await
        .map_err(|e| e.to_string())?;
    print!("{}", format_report("Apply", &report));
    finish(&report)
}

async fn cmd_destroy(
    target: &Target,
    run: &RunArgs,
    from_state: bool,
    forget_unapplied: bool,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let engine = engine(target, load_datacenter(&target.datacenter)?);
    let mut config = run_config(target, run, cancel)?;
    config.forget_unapplied = forget_unapplied;
    let report = if from_state {
        engine.destroy_environment(&config, cancel).await
    } else {
        let graph = load_graph(target, cancel).await?;
        engine.destroy(&graph, &config, cancel).await
    }
    .map_err(|e| e.to_string())?;
    print!("{}", format_report("Destroy", &report));
    finish(&report)
}

fn finish(report: &RunReport) -> Result<(), String> {
    match report.failed() {
        0 => Ok(()),
        n => Err(format!("{} resource(s) failed", n)),
    }
}

fn format_report(verb: &str, report: &RunReport) -> String {
    let mut out = String::new();
    for result in report.results.iter().chain(&report.pruned) {
        out.push_str(&format!(
            "  {}: {} ({:.1}s)\n",
            result.id,
            result.outcome,
            result.duration.as_secs_f64()
        ));
    }
    if !report.pruned.is_empty() {
        out.push_str(&format!("  pruned {} resource(s)\n", report.pruned.len()));
    }
    let count = |o: Outcome| report.count(|x| *x == o);
    out.push_str(&format!(
        "\n{} {}: {} ready, {} unchanged, {} destroyed, {} failed.\n",
        verb,
        if report.is_success() { "complete" } else { "completed with errors" },
        count(Outcome::Ready),
        count(Outcome::Unchanged),
        count(Outcome::Destroyed),
        report.failed()
    ));
    out
}

async fn cmd_refresh(
    target: &Target,
    run: &RunArgs,
    tripwire: bool,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let graph = load_graph(target, cancel).await?;
    let engine = engine(target, load_datacenter(&target.datacenter)?);
    let config = run_config(target, run, cancel)?;
    let report = engine
        .refresh(&graph, &config, cancel)
        .await
        .map_err(|e| e.to_string())?;
    print!("{}", format_refresh(&report));

    if !report.errors.is_empty() {
        return Err(format!("{} refresh error(s)", report.errors.len()));
    }
    if tripwire && !report.findings.is_empty() {
        return Err(format!("{} drift finding(s)", report.findings.len()));
    }
    Ok(())
}

fn format_refresh(report: &RefreshReport) -> String {
    let mut out = format!("Refreshed {} resource(s)\n", report.refreshed);
    for f in &report.findings {
        out.push_str(&format!("  DRIFTED: {} ({})\n", f.resource_id, f.detail));
        out.push_str(&format!("    Expected: {}\n", f.expected_hash));
        out.push_str(&format!("    Actual:   {}\n", f.actual_hash));
    }
    for (id, reason) in &report.errors {
        out.push_str(&format!("  ERROR: {}: {}\n", id, reason));
    }
    if report.findings.is_empty() {
        out.push_str("No drift detected.\n");
    } else {
        out.push_str(&format!("Drift detected: {} resource(s)\n", report.findings.len()));
    }
    out
}

fn cmd_status(datacenter: &Path, environment: &str, state_dir: &Path) -> Result<(), String> {
    let dc = load_datacenter(datacenter)?;
    let store = FileStateStore::new(state_dir);
    match store
        .get_environment(&dc.name, environment)
        .map_err(|e| e.to_string())?
    {
        Some(env) => print!("{}", format_status(&env)),
        None => println!("No state for {}/{}.", dc.name, environment),
    }
    Ok(())
}

fn format_status(env: &EnvironmentState) -> String {
    let mut out = format!(
        "Environment: {} (datacenter {})\n  Updated: {}\n  Resources: {}\n",
        env.name,
        env.datacenter,
        env.updated_at,
        env.resource_count()
    );
    for resource in env.resources() {
        let reason = resource
            .status_reason
            .as_ref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default();
        out.push_str(&format!(
            "    {}: {}{} [{}]\n",
            resource.id,
            resource.status,
            reason,
            resource.plugin.as_deref().unwrap_or("-")
        ));
        out.push_str(&format_outputs(&resource.outputs));
    }
    out
}

/// Sensitive values are never printed.
fn format_outputs(outputs: &Outputs) -> String {
    outputs
        .iter()
        .map(|(name, output)| {
            let value = if output.sensitive {
                "(sensitive)".to_string()
            } else {
                render(Some(&output.value))
            };
            format!("      {} = {}\n", name, value)
        })
        .collect()
}
