//! Terraform-compatible backend (`terraform` or `tofu`).
//!
//! Inputs become a `-var-file` JSON document, module state is the plain
//! `terraform.tfstate` file, and the tool's data directory lives in the
//! per-call scratch directory so concurrent calls never share it.

use super::exec::{self, ContainerSpec, Invocation};
use super::sandbox::{ModuleFetcher, Sandbox};
use super::{
    diff_properties, Action, ApplyResult, ModulePlugin, OutputValue, Outputs, Phase, PluginError,
    PreviewResult, RefreshResult, ResourceChange, RunOptions, Volume,
};
use crate::core::types::ToolSettings;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

const STATE_FILE: &str = "terraform.tfstate";
const VARS_FILE: &str = "inputs.tfvars.json";
const PLAN_FILE: &str = "plan.tfplan";

pub struct TerraformPlugin {
    settings: ToolSettings,
    fetcher: Arc<dyn ModuleFetcher>,
}

/// A prepared, initialised working directory for one call.
struct Workspace {
    sandbox: Sandbox,
    state: PathBuf,
    vars: PathBuf,
}

impl TerraformPlugin {
    pub fn new(settings: ToolSettings, fetcher: Arc<dyn ModuleFetcher>) -> Self {
        Self { settings, fetcher }
    }

    fn invocation(&self, ws: &Workspace, opts: &RunOptions) -> Invocation {
        let container = self.settings.image.as_ref().map(|image| {
            let mut volumes = opts.volumes.clone();
            let scratch = ws.sandbox.scratch().to_path_buf();
            volumes.push(Volume {
                container: scratch.display().to_string(),
                host: scratch,
                read_only: false,
            });
            ContainerSpec {
                image: image.clone(),
                volumes,
            }
        });
        Invocation::new(&self.settings.binary, ws.sandbox.module_dir())
            .envs(&opts.environment)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .env(
                "TF_DATA_DIR",
                ws.sandbox.scratch().join(".terraform").display().to_string(),
            )
            .in_container(container)
    }

    /// Sandbox, inputs, prior state and `terraform init`.
    async fn prepare(
        &self,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<Workspace, PluginError> {
        let sandbox = Sandbox::prepare(&opts.module, self.fetcher.as_ref()).await?;
        let vars_json = serde_json::to_vec_pretty(&opts.inputs)
            .map_err(|e| PluginError::decode("inputs", e))?;
        let vars = sandbox.write(VARS_FILE, &vars_json)?;
        let state = sandbox.scratch().join(STATE_FILE);
        if let Some(prior) = &opts.state_reader {
            sandbox.write(STATE_FILE, prior)?;
        }
        let ws = Workspace {
            sandbox,
            state,
            vars,
        };

        let init = self
            .invocation(&ws, opts)
            .args(["init", "-input=false", "-no-color"]);
        exec::run(&init, opts.sink.clone(), cancel)
            .await?
            .check(Phase::Init)?;
        Ok(ws)
    }

    fn state_args(ws: &Workspace) -> Vec<String> {
        vec![
            format!("-state={}", ws.state.display()),
            format!("-var-file={}", ws.vars.display()),
        ]
    }

    /// Hand the state file to the writer if the tool left one.
    fn capture_state(ws: &Workspace, opts: &RunOptions) -> Result<Option<Vec<u8>>, PluginError> {
        let state = ws.sandbox.read(STATE_FILE)?;
        if let Some(bytes) = &state {
            opts.state_writer.write(bytes.clone());
        }
        Ok(state)
    }

    async fn outputs(
        &self,
        ws: &Workspace,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<Outputs, PluginError> {
        let inv = self.invocation(ws, opts).args([
            "output".to_string(),
            "-json".to_string(),
            "-no-color".to_string(),
            format!("-state={}", ws.state.display()),
        ]);
        let out = exec::run(&inv, None, cancel).await?.check(Phase::Output)?;
        parse_outputs(&out.stdout)
    }
}

#[derive(Deserialize)]
struct RawOutput {
    value: Value,
    #[serde(default)]
    sensitive: bool,
}

/// Parse `terraform output -json`.
pub fn parse_outputs(json: &str) -> Result<Outputs, PluginError> {
    if json.trim().is_empty() {
        return Ok(Outputs::new());
    }
    let raw: indexmap::IndexMap<String, RawOutput> =
        serde_json::from_str(json).map_err(|e| PluginError::decode("terraform outputs", e))?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| {
            (
                k,
                OutputValue {
                    value: v.value,
                    sensitive: v.sensitive,
                },
            )
        })
        .collect())
}

#[derive(Deserialize)]
struct Plan {
    #[serde(default)]
    resource_changes: Vec<PlannedChange>,
}

#[derive(Deserialize)]
struct PlannedChange {
    address: String,
    change: ChangeDetail,
}

#[derive(Deserialize)]
struct ChangeDetail {
    actions: Vec<String>,
    #[serde(default)]
    before: Option<Value>,
    #[serde(default)]
    after: Option<Value>,
}

fn map_actions(actions: &[String]) -> Action {
    let has = |a: &str| actions.iter().any(|x| x == a);
    match (has("create"), has("delete"), has("update")) {
        (true, true, _) => Action::Replace,
        (true, false, _) => Action::Create,
        (false, true, _) => Action::Delete,
        (false, false, true) => Action::Update,
        // no-op, read
        _ => Action::Noop,
    }
}

/// Parse `terraform show -json <planfile>`.
pub fn parse_plan(json: &str) -> Result<PreviewResult, PluginError> {
    let plan: Plan =
        serde_json::from_str(json).map_err(|e| PluginError::decode("terraform plan", e))?;
    let changes = plan
        .resource_changes
        .into_iter()
        .map(|rc| {
            let action = map_actions(&rc.change.actions);
            let diffs = match action {
                Action::Noop => Vec::new(),
                _ => diff_properties(rc.change.before.as_ref(), rc.change.after.as_ref()),
            };
            ResourceChange {
                address: rc.address,
                action,
                before: rc.change.before,
                after: rc.change.after,
                diffs,
            }
        })
        .collect();
    Ok(PreviewResult::new(changes))
}

#[async_trait]
impl ModulePlugin for TerraformPlugin {
    fn name(&self) -> &str {
        "terraform"
    }

    #[instrument(skip_all, fields(module = %opts.module))]
    async fn preview(
        &self,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<PreviewResult, PluginError> {
        let ws = self.prepare(opts, cancel).await?;
        let plan_path = ws.sandbox.scratch().join(PLAN_FILE);
        let plan = self
            .invocation(&ws, opts)
            .args(["plan", "-input=false", "-no-color", "-lock=false"])
            .args(Self::state_args(&ws))
            .arg(format!("-out={}", plan_path.display()));
        exec::run(&plan, opts.sink.clone(), cancel)
            .await?
            .check(Phase::Plan)?;

        let show = self
            .invocation(&ws, opts)
            .args(["show", "-json", "-no-color"])
            .arg(plan_path.display().to_string());
        let out = exec::run(&show, None, cancel).await?.check(Phase::Plan)?;
        let preview = parse_plan(&out.stdout)?;
        debug!(summary = %preview.summary, "terraform plan");
        Ok(preview)
    }

    #[instrument(skip_all, fields(module = %opts.module))]
    async fn apply(
        &self,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<ApplyResult, PluginError> {
        let ws = self.prepare(opts, cancel).await?;
        let apply = self
            .invocation(&ws, opts)
            .args(["apply", "-input=false", "-no-color", "-auto-approve"])
            .args(Self::state_args(&ws));
        let result = exec::run(&apply, opts.sink.clone(), cancel).await;
        // Partial state is published even when apply fails or is cancelled
        let state = Self::capture_state(&ws, opts)?;
        result?.check(Phase::Apply)?;

        let outputs = self.outputs(&ws, opts, cancel).await?;
        Ok(ApplyResult {
            outputs,
            state: state.unwrap_or_default(),
        })
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
            .args(["destroy", "-input=false", "-no-color", "-auto-approve"])
            .args(Self::state_args(&ws));
        let result = exec::run(&destroy, opts.sink.clone(), cancel).await;
        Self::capture_state(&ws, opts)?;
        result?.check(Phase::Destroy)?;
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
            .args([
                "apply",
                "-refresh-only",
                "-input=false",
                "-no-color",
                "-auto-approve",
            ])
            .args(Self::state_args(&ws));
        exec::run(&refresh, opts.sink.clone(), cancel)
            .await?
            .check(Phase::Refresh)?;
        let state = ws.sandbox.read(STATE_FILE)?.unwrap_or_default();
        let outputs = self.outputs(&ws, opts, cancel).await?;
        Ok(RefreshResult { outputs, state })
    }
}
