//! Module plugins: the Preview/Apply/Destroy/Refresh capability set.
//!
//! Every IaC backend implements [`ModulePlugin`] once and is registered in
//! a [`PluginRegistry`] under a name. Hooks select a plugin by that name.
//! [`RunOptions`] is the only channel from the engine to a plugin.

pub mod exec;
pub mod native;
pub mod pulumi;
pub mod sandbox;
pub mod terraform;

use crate::core::types::{Inputs, PluginSettings};
use crate::tripwire::hasher;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use sandbox::{CachedModuleFetcher, ModuleFetcher};

// ============================================================================
// Errors
// ============================================================================

/// Which tool step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Init,
    Plan,
    Apply,
    Destroy,
    Refresh,
    Output,
    Export,
    Import,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Refresh => "refresh",
            Self::Output => "output",
            Self::Export => "export",
            Self::Import => "import",
        };
        write!(f, "{}", s)
    }
}

/// A tool invocation that exited non-zero.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{phase} failed (exit code {exit_code}): {}", last_lines(.stderr, .stdout))]
pub struct ExecError {
    pub phase: Phase,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

fn last_lines(stderr: &str, stdout: &str) -> String {
    let text = if stderr.trim().is_empty() { stdout } else { stderr };
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join(" | ")
}

/// Plugin call failures.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Execution(#[from] ExecError),

    #[error("{operation} requires prior module state")]
    StateRequired { operation: &'static str },

    #[error("cancelled")]
    Cancelled,

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sandbox: {0}")]
    Sandbox(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot decode {what}: {message}")]
    Decode { what: String, message: String },

    #[error("module {module}: {message}")]
    Module { module: String, message: String },
}

impl PluginError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }

    pub(crate) fn decode(what: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Decode {
            what: what.into(),
            message: message.to_string(),
        }
    }
}

// ============================================================================
// Options
// ============================================================================

/// Where a module's code lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "location", rename_all = "lowercase")]
pub enum ModuleSource {
    /// Used in place, never cleaned up
    Local(PathBuf),
    /// Fetched into a temporary workspace per call
    Remote(String),
}

impl ModuleSource {
    /// Paths (absolute, `./`, `../`, `~/`) are local; anything else is a
    /// remote reference.
    pub fn parse(s: &str) -> Self {
        if s.starts_with('/') || s.starts_with("./") || s.starts_with("../") || s == "." {
            Self::Local(PathBuf::from(s))
        } else if let Some(rest) = s.strip_prefix("~/") {
            let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
            Self::Local(home.join(rest))
        } else {
            Self::Remote(s.to_string())
        }
    }

    /// Content fingerprint used in change detection. Local directories are
    /// hashed; remote references hash their text.
    pub fn fingerprint(&self) -> String {
        match self {
            Self::Local(path) => hasher::hash_directory(path)
                .unwrap_or_else(|_| hasher::hash_string(&path.display().to_string())),
            Self::Remote(reference) => hasher::hash_string(reference),
        }
    }
}

impl fmt::Display for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote(reference) => write!(f, "{}", reference),
        }
    }
}

/// Receives state a plugin leaves behind, including after a failed apply.
#[derive(Debug, Clone, Default)]
pub struct StateWriter {
    inner: Arc<Mutex<Option<Vec<u8>>>>,
}

impl StateWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, state: Vec<u8>) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = Some(state);
    }

    pub fn get(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn take(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// A bind mount handed to containerised tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub host: PathBuf,
    pub container: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Output stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Receives tool output line by line while it runs.
pub type OutputSink = Arc<dyn Fn(Stream, &str) + Send + Sync>;

/// Everything a plugin call may use.
#[derive(Clone)]
pub struct RunOptions {
    pub module: ModuleSource,
    pub inputs: Inputs,
    /// Prior opaque state; `None` on a first apply
    pub state_reader: Option<Vec<u8>>,
    pub state_writer: StateWriter,
    /// Directory the tool runs in when the module does not dictate one
    pub working_dir: Option<PathBuf>,
    pub environment: IndexMap<String, String>,
    pub volumes: Vec<Volume>,
    pub sink: Option<OutputSink>,
}

impl RunOptions {
    pub fn new(module: ModuleSource, inputs: Inputs) -> Self {
        Self {
            module,
            inputs,
            state_reader: None,
            state_writer: StateWriter::new(),
            working_dir: None,
            environment: IndexMap::new(),
            volumes: Vec::new(),
            sink: None,
        }
    }

    pub fn with_state(mut self, state: Option<Vec<u8>>) -> Self {
        self.state_reader = state;
        self
    }

    pub(crate) fn emit(&self, stream: Stream, line: &str) {
        if let Some(sink) = &self.sink {
            sink(stream, line);
        }
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("module", &self.module)
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .field("has_state", &self.state_reader.is_some())
            .field("working_dir", &self.working_dir)
            .field("environment", &self.environment.keys().collect::<Vec<_>>())
            .field("volumes", &self.volumes)
            .finish()
    }
}

// ============================================================================
// Results
// ============================================================================

/// Planned action for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
    Replace,
    Noop,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Noop => "noop",
        };
        write!(f, "{}", s)
    }
}

/// One changed property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDiff {
    pub path: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Preview entry for one resource inside a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub address: String,
    pub action: Action,
    pub before: Option<Value>,
    pub after: Option<Value>,
    #[serde(default)]
    pub diffs: Vec<PropertyDiff>,
}

/// Counts of real changes. `Noop` entries are not counted, so an
/// unchanged environment previews as all zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub replace: usize,
}

impl ChangeSummary {
    pub fn record(&mut self, action: Action) {
        match action {
            Action::Create => self.create += 1,
            Action::Update => self.update += 1,
            Action::Delete => self.delete += 1,
            Action::Replace => self.replace += 1,
            Action::Noop => {}
        }
    }

    pub fn merge(&mut self, other: &ChangeSummary) {
        self.create += other.create;
        self.update += other.update;
        self.delete += other.delete;
        self.replace += other.replace;
    }

    pub fn total(&self) -> usize {
        self.create + self.update + self.delete + self.replace
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }

    pub fn from_changes(changes: &[ResourceChange]) -> Self {
        let mut summary = Self::default();
        changes.iter().for_each(|c| summary.record(c.action));
        summary
    }
}

impl fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete",
            self.create, self.update, self.replace, self.delete
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviewResult {
    pub changes: Vec<ResourceChange>,
    pub summary: ChangeSummary,
}

impl PreviewResult {
    pub fn new(changes: Vec<ResourceChange>) -> Self {
        let summary = ChangeSummary::from_changes(&changes);
        Self { changes, summary }
    }
}

/// A module output and whether it must be masked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    pub value: Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sensitive: bool,
}

pub type Outputs = IndexMap<String, OutputValue>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyResult {
    pub outputs: Outputs,
    pub state: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshResult {
    pub outputs: Outputs,
    pub state: Vec<u8>,
}

/// Top-level key diff of two JSON objects.
pub fn diff_properties(before: Option<&Value>, after: Option<&Value>) -> Vec<PropertyDiff> {
    let empty = serde_json::Map::new();
    let b = before.and_then(Value::as_object).unwrap_or(&empty);
    let a = after.and_then(Value::as_object).unwrap_or(&empty);
    let keys: std::collections::BTreeSet<&String> = b.keys().chain(a.keys()).collect();
    keys.into_iter()
        .filter(|k| b.get(*k) != a.get(*k))
        .map(|k| PropertyDiff {
            path: k.clone(),
            before: b.get(k).cloned(),
            after: a.get(k).cloned(),
        })
        .collect()
}

// ============================================================================
// Capability set
// ============================================================================

/// One IaC backend.
///
/// Implementations hold only process-lifetime configuration; every call
/// works in its own sandbox, so concurrent calls for different modules are
/// safe.
#[async_trait]
pub trait ModulePlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Compute changes without touching infrastructure.
    async fn preview(
        &self,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<PreviewResult, PluginError>;

    /// Converge infrastructure to the inputs. Publishes whatever state the
    /// tool left behind into `opts.state_writer`, success or not.
    async fn apply(
        &self,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<ApplyResult, PluginError>;

    /// Remove what `opts.state_reader` describes. Fails with
    /// [`PluginError::StateRequired`] before running anything when absent.
    async fn destroy(&self, opts: &RunOptions, cancel: &CancellationToken) -> Result<(), PluginError>;

    /// Re-read real infrastructure without changing it.
    async fn refresh(
        &self,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RefreshResult, PluginError>;
}

/// Named plugin implementations, handed to the engine at construction.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn ModulePlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in backends: `terraform`, `pulumi`, `native`.
    pub fn with_defaults(settings: &PluginSettings, fetcher: Arc<dyn ModuleFetcher>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(terraform::TerraformPlugin::new(
            settings.terraform.clone(),
            fetcher.clone(),
        )));
        registry.register(Arc::new(pulumi::PulumiPlugin::new(
            settings.pulumi.clone(),
            fetcher.clone(),
        )));
        registry.register(Arc::new(native::NativePlugin::new(
            settings.native.clone(),
            fetcher,
        )));
        registry
    }

    /// Register under the plugin's own name, replacing any previous entry.
    pub fn register(&mut self, plugin: Arc<dyn ModulePlugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ModulePlugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plugins_module_source_parse() {
        assert_eq!(
            ModuleSource::parse("./modules/pg"),
            ModuleSource::Local(PathBuf::from("./modules/pg"))
        );
        assert_eq!(
            ModuleSource::parse("/abs/pg"),
            ModuleSource::Local(PathBuf::from("/abs/pg"))
        );
        assert_eq!(
            ModuleSource::parse("registry.io/modules/pg:1.2"),
            ModuleSource::Remote("registry.io/modules/pg:1.2".to_string())
        );
    }

    #[test]
    fn test_plugins_fingerprint_tracks_module_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("apply"), "echo 1").unwrap();
        let src = ModuleSource::Local(dir.path().to_path_buf());
        let before = src.fingerprint();
        std::fs::write(dir.path().join("apply"), "echo 2").unwrap();
        assert_ne!(before, src.fingerprint());
        assert_eq!(
            ModuleSource::Remote("a:1".into()).fingerprint(),
            ModuleSource::Remote("a:1".into()).fingerprint()
        );
    }

    #[test]
    fn test_plugins_change_summary_ignores_noop() {
        let change = |action| ResourceChange {
            address: "x".to_string(),
            action,
            before: None,
            after: None,
            diffs: Vec::new(),
        };
        let preview = PreviewResult::new(vec![
            change(Action::Create),
            change(Action::Noop),
            change(Action::Replace),
        ]);
        assert_eq!(preview.summary.create, 1);
        assert_eq!(preview.summary.replace, 1);
        assert_eq!(preview.summary.total(), 2);
        assert!(PreviewResult::new(vec![change(Action::Noop)]).summary.is_zero());
    }

    #[test]
    fn test_plugins_diff_properties() {
        let before = json!({"size": 1, "name": "a"});
        let after = json!({"size": 2, "name": "a", "tier": "gold"});
        let diffs = diff_properties(Some(&before), Some(&after));
        let paths: Vec<_> = diffs.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["size", "tier"]);
        assert_eq!(diffs[1].before, None);
    }

    #[test]
    fn test_plugins_state_writer_shared_between_clones() {
        let writer = StateWriter::new();
        let clone = writer.clone();
        clone.write(b"partial".to_vec());
        assert_eq!(writer.get().as_deref(), Some(&b"partial"[..]));
        assert_eq!(writer.take().as_deref(), Some(&b"partial"[..]));
        assert!(clone.get().is_none());
    }

    #[test]
    fn test_plugins_exec_error_message_uses_stderr_tail() {
        let err = ExecError {
            phase: Phase::Apply,
            exit_code: 1,
            stdout: "noise".to_string(),
            stderr: "line1\nline2\n\nError: quota exceeded\n".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "apply failed (exit code 1): line1 | line2 | Error: quota exceeded"
        );
    }

    #[test]
    fn test_plugins_registry_defaults() {
        let fetcher: Arc<dyn ModuleFetcher> = Arc::new(CachedModuleFetcher::new("/nonexistent"));
        let registry = PluginRegistry::with_defaults(&PluginSettings::default(), fetcher);
        assert_eq!(registry.names(), vec!["native", "pulumi", "terraform"]);
        assert!(registry.get("terraform").is_some());
        assert!(registry.get("ansible").is_none());
    }
}
