//! Pulumi backend.
//!
//! Every call gets a throwaway file backend in its scratch directory and a
//! single stack named [`STACK`]. Prior module state is imported into that
//! stack before the command runs and exported back afterwards, so the
//! engine's state store stays the only durable copy.

use super::exec::{self, ContainerSpec, ExecOutput, Invocation};
use super::sandbox::{ModuleFetcher, Sandbox};
use super::{
    diff_properties, Action, ApplyResult, ModulePlugin, OutputValue, Outputs, Phase, PluginError,
    PreviewResult, RefreshResult, ResourceChange, RunOptions, Stream, Volume,
};
use crate::core::types::{Inputs, ToolSettings};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

pub const STACK: &str = "strata";
const STATE_FILE: &str = "stack.json";
const CONFIG_FILE: &str = "config.yaml";
const STACK_TYPE: &str = "pulumi:pulumi:Stack";

pub struct PulumiPlugin {
    settings: ToolSettings,
    fetcher: Arc<dyn ModuleFetcher>,
    /// Stack init/import touch the shared Pulumi home; one at a time.
    setup: Mutex<()>,
}

struct Workspace {
    sandbox: Sandbox,
    config: PathBuf,
}

#[derive(Deserialize)]
struct Project {
    name: String,
}

/// Read the project name from `Pulumi.yaml` (or `.yml`).
pub fn project_name(module_dir: &Path) -> Result<String, PluginError> {
    let path = ["Pulumi.yaml", "Pulumi.yml"]
        .into_iter()
        .map(|f| module_dir.join(f))
        .find(|p| p.is_file())
        .ok_or_else(|| PluginError::Module {
            module: module_dir.display().to_string(),
            message: "no Pulumi.yaml project file".to_string(),
        })?;
    let text = std::fs::read_to_string(&path)
        .map_err(PluginError::io(format!("reading {}", path.display())))?;
    let project: Project = serde_yaml_ng::from_str(&text)
        .map_err(|e| PluginError::decode(path.display().to_string(), e))?;
    Ok(project.name)
}

/// Stack config document with every input namespaced by the project.
pub fn render_config(project: &str, inputs: &Inputs) -> Result<String, PluginError> {
    let config: serde_yaml_ng::Mapping = inputs
        .iter()
        .map(|(k, v)| {
            let value = serde_yaml_ng::to_value(v).map_err(|e| PluginError::decode("inputs", e))?;
            Ok((
                serde_yaml_ng::Value::String(format!("{}:{}", project, k)),
                value,
            ))
        })
        .collect::<Result<_, PluginError>>()?;
    let mut doc = serde_yaml_ng::Mapping::new();
    doc.insert("config".into(), serde_yaml_ng::Value::Mapping(config));
    serde_yaml_ng::to_string(&doc).map_err(|e| PluginError::decode("stack config", e))
}

#[derive(Deserialize)]
struct Preview {
    #[serde(default)]
    steps: Vec<Step>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Step {
    op: String,
    urn: String,
    #[serde(default)]
    old_state: Option<StepState>,
    #[serde(default)]
    new_state: Option<StepState>,
}

#[derive(Deserialize)]
struct StepState {
    #[serde(default, rename = "type")]
    resource_type: Option<String>,
    #[serde(default)]
    inputs: Option<Value>,
}

fn map_op(op: &str) -> Action {
    match op {
        "create" => Action::Create,
        "update" => Action::Update,
        "delete" => Action::Delete,
        "replace" => Action::Replace,
        // same, read, refresh, and the create-replacement/delete-replaced
        // halves of a replace that is already counted once
        _ => Action::Noop,
    }
}

/// Parse `pulumi preview --json`.
pub fn parse_preview(json: &str) -> Result<PreviewResult, PluginError> {
    let preview: Preview =
        serde_json::from_str(json).map_err(|e| PluginError::decode("pulumi preview", e))?;
    let changes = preview
        .steps
        .into_iter()
        .filter(|s| {
            let ty = s
                .new_state
                .as_ref()
                .or(s.old_state.as_ref())
                .and_then(|st| st.resource_type.as_deref());
            ty != Some(STACK_TYPE) && !s.urn.ends_with(STACK_TYPE)
        })
        .map(|s| {
            let before = s.old_state.and_then(|st| st.inputs);
            let after = s.new_state.and_then(|st| st.inputs);
            let action = map_op(&s.op);
            let diffs = match action {
                Action::Noop => Vec::new(),
                _ => diff_properties(before.as_ref(), after.as_ref()),
            };
            ResourceChange {
                address: s.urn,
                action,
                before,
                after,
                diffs,
            }
        })
        .collect();
    Ok(PreviewResult::new(changes))
}

/// Combine `stack output --json` with and without `--show-secrets`.
/// Values that differ between the two were masked, so they are secret.
pub fn parse_outputs(masked: &str, revealed: &str) -> Result<Outputs, PluginError> {
    let decode = |s: &str| -> Result<serde_json::Map<String, Value>, PluginError> {
        if s.trim().is_empty() {
            return Ok(serde_json::Map::new());
        }
        serde_json::from_str(s).map_err(|e| PluginError::decode("pulumi outputs", e))
    };
    let masked = decode(masked)?;
    Ok(decode(revealed)?
        .into_iter()
        .map(|(k, value)| {
            let sensitive = masked.get(&k) != Some(&value);
            (k, OutputValue { value, sensitive })
        })
        .collect())
}

impl PulumiPlugin {
    pub fn new(settings: ToolSettings, fetcher: Arc<dyn ModuleFetcher>) -> Self {
        Self {
            settings,
            fetcher,
            setup: Mutex::new(()),
        }
    }

    fn invocation(&self, ws: &Workspace, opts: &RunOptions) -> Invocation {
        let scratch = ws.sandbox.scratch();
        let container = self.settings.image.as_ref().map(|image| {
            let mut volumes = opts.volumes.clone();
            volumes.push(Volume {
                host: scratch.to_path_buf(),
                container: scratch.display().to_string(),
                read_only: false,
            });
            ContainerSpec {
                image: image.clone(),
                volumes,
            }
        });
        Invocation::new(&self.settings.binary, ws.sandbox.module_dir())
            .envs(&opts.environment)
            .env(
                "PULUMI_BACKEND_URL",
                format!("file://{}", scratch.join("backend").display()),
            )
            .env("PULUMI_SKIP_UPDATE_CHECK", "true")
            .env("PULUMI_CONFIG_PASSPHRASE", "")
            .in_container(container)
    }

    fn stack_args(ws: &Workspace) -> Vec<String> {
        vec![
            "--stack".to_string(),
            STACK.to_string(),
            "--non-interactive".to_string(),
            "--config-file".to_string(),
            ws.config.display().to_string(),
        ]
    }

    async fn run(
        &self,
        inv: Invocation,
        opts: &RunOptions,
        cancel: &CancellationToken,
        phase: Phase,
    ) -> Result<ExecOutput, PluginError> {
        exec::run(&inv, opts.sink.clone(), cancel).await?.check(phase)
    }

    /// Sandbox, stack config, stack creation and state import.
    async fn prepare(
        &self,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<Workspace, PluginError> {
        let sandbox = Sandbox::prepare(&opts.module, self.fetcher.as_ref()).await?;
        std::fs::create_dir_all(sandbox.scratch().join("backend"))
            .map_err(PluginError::io("creating pulumi backend"))?;
        let project = project_name(sandbox.module_dir())?;
        let config = sandbox.write(CONFIG_FILE, render_config(&project, &opts.inputs)?.as_bytes())?;
        let ws = Workspace { sandbox, config };

        let _guard = self.setup.lock().await;
        let init = self
            .invocation(&ws, opts)
            .args(["stack", "init", STACK, "--non-interactive"]);
        self.run(init, opts, cancel, Phase::Init).await?;
        if let Some(prior) = &opts.state_reader {
            let file = ws.sandbox.write(STATE_FILE, prior)?;
            let import = self
                .invocation(&ws, opts)
                .args(["stack", "import", "--stack", STACK, "--file"])
                .arg(file.display().to_string());
            self.run(import, opts, cancel, Phase::Import).await?;
        }
        Ok(ws)
    }

    /// Export the stack into the state writer.
    async fn export(
        &self,
        ws: &Workspace,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, PluginError> {
        let file = ws.sandbox.scratch().join(STATE_FILE);
        let export = self
            .invocation(ws, opts)
            .args(["stack", "export", "--stack", STACK, "--file"])
            .arg(file.display().to_string());
        self.run(export, opts, cancel, Phase::Export).await?;
        let state = ws.sandbox.read(STATE_FILE)?.unwrap_or_default();
        opts.state_writer.write(state.clone());
        Ok(state)
    }

    async fn outputs(
        &self,
        ws: &Workspace,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<Outputs, PluginError> {
        let base = self
            .invocation(ws, opts)
            .args(["stack", "output", "--json", "--stack", STACK]);
        let masked = exec::run(&base, None, cancel).await?.check(Phase::Output)?;
        let revealed = exec::run(&base.clone().arg("--show-secrets"), None, cancel)
            .await?
            .check(Phase::Output)?;
        parse_outputs(&masked.stdout, &revealed.stdout)
    }
}

#[async_trait]
impl ModulePlugin for PulumiPlugin {
    fn name(&self) -> &str {
        "pulumi"
    }

    #[instrument(skip_all, fields(module = %opts.module))]
    async fn preview(
        &self,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<PreviewResult, PluginError> {
        let ws = self.prepare(opts, cancel).await?;
        let preview = self
            .invocation(&ws, opts)
            .args(["preview", "--json"])
            .args(Self::stack_args(&ws));
        // JSON goes to stdout, so only stderr is streamed
        let out = exec::run(&preview, None, cancel).await?;
        out.stderr
            .lines()
            .for_each(|line| opts.emit(Stream::Stderr, line));
        let out = out.check(Phase::Plan)?;
        let result = parse_preview(&out.stdout)?;
        debug!(summary = %result.summary, "pulumi preview");
        Ok(result)
    }

    #[instrument(skip_all, fields(module = %opts.module))]
    async fn apply(
        &self,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<ApplyResult, PluginError> {
        let ws = self.prepare(opts, cancel).await?;
        let up = self
            .invocation(&ws, opts)
            .args(["up", "--yes", "--skip-preview"])
            .args(Self::stack_args(&ws));
        let result = self.run(up, opts, cancel, Phase::Apply).await;
        // A failed update still leaves the stack with whatever it created
        let exported = self.export(&ws, opts, &CancellationToken::new()).await;
        result?;
        let state = exported?;
        let outputs = self.outputs(&ws, opts, cancel).await?;
        Ok(ApplyResult { outputs, state })
    }

    #[instrument(skip_all, fields(module = %opts.module))]
    async fn destroy(&self, opts: &RunOptions, cancel: &CancellationToken) -> Result<(), PluginError> {
        if opts.state_reader.is_none() {
            return Err(PluginError::StateRequired {
                operation: "destroy",
            });
        }
        let ws = self.prepare(opts, cancel).await?;
        let destroy = self
            .invocation(&ws, opts)
            .args(["destroy", "--yes", "--skip-preview"])
            .args(Self::stack_args(&ws));
        let result = self.run(destroy, opts, cancel, Phase::Destroy).await;
        let exported = self.export(&ws, opts, &CancellationToken::new()).await;
        result?;
        exported?;
        Ok(())
    }

    #[instrument(skip_all, fields(module = %opts.module))]
    async fn refresh(
        &self,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RefreshResult, PluginError> {
        if opts.state_reader.is_none() {
            return Err(PluginError::StateRequired {
                operation: "refresh",
            });
        }
        let ws = self.prepare(opts, cancel).await?;
        let refresh = self
            .invocation(&ws, opts)
            .args(["refresh", "--yes", "--skip-preview"])
            .args(Self::stack_args(&ws));
        self.run(refresh, opts, cancel, Phase::Refresh).await?;
        let state = self.export(&ws, opts, cancel).await?;
        let outputs = self.outputs(&ws, opts, cancel).await?;
        Ok(RefreshResult { outputs, state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{CachedModuleFetcher, ModuleSource};
    use serde_json::json;

    #[test]
    fn test_pulumi_project_name() {
        let dir = tempfile::tempdir().unwrap();
        assert!(project_name(dir.path()).is_err());
        std::fs::write(
            dir.path().join("Pulumi.yaml"),
            "name: orders-db\nruntime: nodejs\n",
        )
        .unwrap();
        assert_eq!(project_name(dir.path()).unwrap(), "orders-db");
    }

    #[test]
    fn test_pulumi_render_config_namespaces_inputs() {
        let inputs: Inputs = [
            ("size".to_string(), json!(2)),
            ("tags".to_string(), json!({"team": "core"})),
        ]
        .into_iter()
        .collect();
        let text = render_config("orders-db", &inputs).unwrap();
        let doc: serde_yaml_ng::Value = serde_yaml_ng::from_str(&text).unwrap();
        let config = &doc["config"];
        assert_eq!(config["orders-db:size"].as_u64(), Some(2));
        assert_eq!(config["orders-db:tags"]["team"].as_str(), Some("core"));
    }

    #[test]
    fn test_pulumi_parse_preview() {
        let json = r#"{
          "steps": [
            {"op": "create", "urn": "urn:pulumi:strata::p::pulumi:pulumi:Stack::p-strata",
             "newState": {"type": "pulumi:pulumi:Stack"}},
            {"op": "create", "urn": "urn:pulumi:strata::p::aws:s3/bucket:Bucket::logs",
             "newState": {"type": "aws:s3/bucket:Bucket", "inputs": {"acl": "private"}}},
            {"op": "update", "urn": "urn:pulumi:strata::p::aws:sqs/queue:Queue::q",
             "oldState": {"type": "aws:sqs/queue:Queue", "inputs": {"delay": 0}},
             "newState": {"type": "aws:sqs/queue:Queue", "inputs": {"delay": 5}}},
            {"op": "same", "urn": "urn:pulumi:strata::p::aws:kms/key:Key::k"},
            {"op": "create-replacement", "urn": "urn:pulumi:strata::p::aws:iam/role:Role::r"},
            {"op": "replace", "urn": "urn:pulumi:strata::p::aws:iam/role:Role::r"},
            {"op": "delete-replaced", "urn": "urn:pulumi:strata::p::aws:iam/role:Role::r"}
          ],
          "changeSummary": {"create": 2, "update": 1, "same": 1, "replace": 1}
        }"#;
        let preview = parse_preview(json).unwrap();
        assert_eq!(preview.changes.len(), 6);
        assert_eq!(preview.summary.create, 1);
        assert_eq!(preview.summary.update, 1);
        assert_eq!(preview.summary.replace, 1);
        assert_eq!(preview.summary.delete, 0);
        let update = &preview.changes[1];
        assert_eq!(update.diffs.len(), 1);
        assert_eq!(update.diffs[0].after, Some(json!(5)));
    }

    #[test]
    fn test_pulumi_parse_outputs_detects_secrets() {
        let masked = r#"{"url": "https://x", "password": "[secret]"}"#;
        let revealed = r#"{"url": "https://x", "password": "hunter2"}"#;
        let outputs = parse_outputs(masked, revealed).unwrap();
        assert!(!outputs["url"].sensitive);
        assert!(outputs["password"].sensitive);
        assert_eq!(outputs["password"].value, json!("hunter2"));
        assert!(parse_outputs("", "").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pulumi_refresh_without_state_runs_nothing() {
        let plugin = PulumiPlugin::new(
            ToolSettings {
                binary: "/nonexistent/pulumi".to_string(),
                image: None,
            },
            Arc::new(CachedModuleFetcher::new("/nonexistent")),
        );
        let opts = RunOptions::new(ModuleSource::Local("/nonexistent".into()), Inputs::new());
        let err = plugin
            .refresh(&opts, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::StateRequired { operation: "refresh" }));
        let err = plugin
            .destroy(&opts, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::StateRequired { operation: "destroy" }));
    }
}
