//! Script backend for modules that are plain shell programs.
//!
//! A module directory holds one script per operation (`apply`, `destroy`,
//! `preview`, `refresh`, each optionally suffixed `.sh`). Scripts see:
//!
//! | variable           | contents                                   |
//! |--------------------|--------------------------------------------|
//! | `STRATA_OPERATION` | operation name                             |
//! | `STRATA_INPUTS`    | path to the inputs as a JSON object        |
//! | `STRATA_STATE`     | path to the prior state (only when present)|
//! | `STRATA_STATE_OUT` | path the script writes its new state to    |
//!
//! The last stdout line that parses as a JSON object is the report:
//! `{"outputs": {..}, "sensitive": ["name"], "changes": [..]}`. Every
//! field is optional.

use super::exec::{self, ContainerSpec, Invocation};
use super::sandbox::{ModuleFetcher, Sandbox};
use super::{
    diff_properties, Action, ApplyResult, ModulePlugin, OutputValue, Outputs, Phase, PluginError,
    PreviewResult, RefreshResult, ResourceChange, RunOptions, Volume,
};
use crate::core::types::ToolSettings;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

const INPUTS_FILE: &str = "inputs.json";
const STATE_IN: &str = "state.in";
const STATE_OUT: &str = "state.out";

pub struct NativePlugin {
    settings: ToolSettings,
    fetcher: Arc<dyn ModuleFetcher>,
}

#[derive(Debug, Default, Deserialize)]
struct Report {
    #[serde(default)]
    outputs: Map<String, Value>,
    #[serde(default)]
    sensitive: Vec<String>,
    #[serde(default)]
    changes: Vec<ReportedChange>,
}

#[derive(Debug, Deserialize)]
struct ReportedChange {
    #[serde(default)]
    address: Option<String>,
    action: Action,
    #[serde(default)]
    before: Option<Value>,
    #[serde(default)]
    after: Option<Value>,
}

impl Report {
    fn outputs(&self) -> Outputs {
        self.outputs
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    OutputValue {
                        value: v.clone(),
                        sensitive: self.sensitive.iter().any(|s| s == k),
                    },
                )
            })
            .collect()
    }
}

/// Find the last stdout line that is a JSON object.
fn parse_report(stdout: &str) -> Result<Report, PluginError> {
    let Some(line) = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with('{') && serde_json::from_str::<Value>(l).is_ok())
    else {
        return Ok(Report::default());
    };
    serde_json::from_str(line).map_err(|e| PluginError::decode("script report", e))
}

/// `<dir>/<op>` or `<dir>/<op>.sh`.
fn find_script(dir: &Path, operation: &str) -> Option<PathBuf> {
    [operation.to_string(), format!("{}.sh", operation)]
        .into_iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

impl NativePlugin {
    pub fn new(settings: ToolSettings, fetcher: Arc<dyn ModuleFetcher>) -> Self {
        Self { settings, fetcher }
    }

    async fn sandbox(&self, opts: &RunOptions) -> Result<Sandbox, PluginError> {
        let sandbox = Sandbox::prepare(&opts.module, self.fetcher.as_ref()).await?;
        let inputs = serde_json::to_vec_pretty(&opts.inputs)
            .map_err(|e| PluginError::decode("inputs", e))?;
        sandbox.write(INPUTS_FILE, &inputs)?;
        if let Some(prior) = &opts.state_reader {
            sandbox.write(STATE_IN, prior)?;
        }
        Ok(sandbox)
    }

    /// Run `script` for `operation`; the caller decides how to treat the exit.
    async fn run_script(
        &self,
        sandbox: &Sandbox,
        script: &Path,
        operation: &str,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<exec::ExecOutput, PluginError> {
        let scratch = sandbox.scratch();
        let cwd = opts
            .working_dir
            .clone()
            .unwrap_or_else(|| sandbox.module_dir().to_path_buf());
        let mut inv = Invocation::new(&self.settings.binary, cwd)
            .arg(script.display().to_string())
            .envs(&opts.environment)
            .env("STRATA_OPERATION", operation)
            .env("STRATA_INPUTS", scratch.join(INPUTS_FILE).display().to_string())
            .env("STRATA_STATE_OUT", scratch.join(STATE_OUT).display().to_string());
        if opts.state_reader.is_some() {
            inv = inv.env("STRATA_STATE", scratch.join(STATE_IN).display().to_string());
        }
        if let Some(image) = &self.settings.image {
            let mut volumes = opts.volumes.clone();
            for dir in [scratch, sandbox.module_dir()] {
                volumes.push(Volume {
                    host: dir.to_path_buf(),
                    container: dir.display().to_string(),
                    read_only: false,
                });
            }
            inv = inv.in_container(Some(ContainerSpec {
                image: image.clone(),
                volumes,
            }));
        }
        debug!(operation, script = %script.display(), "running module script");
        exec::run(&inv, opts.sink.clone(), cancel).await
    }

    fn required_script(sandbox: &Sandbox, operation: &str) -> Result<PathBuf, PluginError> {
        find_script(sandbox.module_dir(), operation).ok_or_else(|| PluginError::Module {
            module: sandbox.module_dir().display().to_string(),
            message: format!("no '{}' script", operation),
        })
    }
}

#[async_trait]
impl ModulePlugin for NativePlugin {
    fn name(&self) -> &str {
        "native"
    }

    #[instrument(skip_all, fields(module = %opts.module))]
    async fn preview(
        &self,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<PreviewResult, PluginError> {
        let sandbox = self.sandbox(opts).await?;
        let Some(script) = find_script(sandbox.module_dir(), "preview") else {
            // Without a preview script the module is assumed to change whenever asked
            let action = if opts.state_reader.is_some() {
                Action::Update
            } else {
                Action::Create
            };
            let after = serde_json::to_value(&opts.inputs).ok();
            return Ok(PreviewResult::new(vec![ResourceChange {
                address: opts.module.to_string(),
                action,
                before: None,
                diffs: diff_properties(None, after.as_ref()),
                after,
            }]));
        };
        let out = self
            .run_script(&sandbox, &script, "preview", opts, cancel)
            .await?
            .check(Phase::Plan)?;
        let report = parse_report(&out.stdout)?;
        let changes = report
            .changes
            .into_iter()
            .map(|c| ResourceChange {
                address: c.address.unwrap_or_else(|| opts.module.to_string()),
                action: c.action,
                diffs: diff_properties(c.before.as_ref(), c.after.as_ref()),
                before: c.before,
                after: c.after,
            })
            .collect();
        Ok(PreviewResult::new(changes))
    }

    #[instrument(skip_all, fields(module = %opts.module))]
    async fn apply(
        &self,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<ApplyResult, PluginError> {
        let sandbox = self.sandbox(opts).await?;
        let script = Self::required_script(&sandbox, "apply")?;
        let result = self.run_script(&sandbox, &script, "apply", opts, cancel).await;
        let written = sandbox.read(STATE_OUT)?;
        if let Some(state) = &written {
            opts.state_writer.write(state.clone());
        }
        let out = result?.check(Phase::Apply)?;

        let report = parse_report(&out.stdout)?;
        let outputs = report.outputs();
        // A script that keeps no state of its own is tracked by its outputs
        let state = match written {
            Some(state) => state,
            None => serde_json::to_vec(&report.outputs)
                .map_err(|e| PluginError::decode("script outputs", e))?,
        };
        Ok(ApplyResult { outputs, state })
    }

    #[instrument(skip_all, fields(module = %opts.module))]
    async fn destroy(&self, opts: &RunOptions, cancel: &CancellationToken) -> Result<(), PluginError> {
        if opts.state_reader.is_none() {
            return Err(PluginError::StateRequired {
                operation: "destroy",
            });
        }
        let sandbox = self.sandbox(opts).await?;
        let script = Self::required_script(&sandbox, "destroy")?;
        let result = self
            .run_script(&sandbox, &script, "destroy", opts, cancel)
            .await;
        if let Some(state) = sandbox.read(STATE_OUT)? {
            opts.state_writer.write(state);
        }
        result?.check(Phase::Destroy)?;
        Ok(())
    }

    #[instrument(skip_all, fields(module = %opts.module))]
    async fn refresh(
        &self,
        opts: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RefreshResult, PluginError> {
        let Some(prior) = &opts.state_reader else {
            return Err(PluginError::StateRequired {
                operation: "refresh",
            });
        };
        let sandbox = self.sandbox(opts).await?;
        let Some(script) = find_script(sandbox.module_dir(), "refresh") else {
            // Nothing to re-read: report the state as last recorded
            let outputs = serde_json::from_slice::<Map<String, Value>>(prior)
                .map(|outputs| {
                    Report {
                        outputs,
                        ..Report::default()
                    }
                    .outputs()
                })
                .unwrap_or_default();
            return Ok(RefreshResult {
                outputs,
                state: prior.clone(),
            });
        };
        let out = self
            .run_script(&sandbox, &script, "refresh", opts, cancel)
            .await?
            .check(Phase::Refresh)?;
        let report = parse_report(&out.stdout)?;
        let state = sandbox.read(STATE_OUT)?.unwrap_or_else(|| prior.clone());
        Ok(RefreshResult {
            outputs: report.outputs(),
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{CachedModuleFetcher, ModuleSource};
    use serde_json::json;

    fn plugin() -> NativePlugin {
        NativePlugin::new(
            ToolSettings {
                binary: "bash".to_string(),
                image: None,
            },
            Arc::new(CachedModuleFetcher::new("/nonexistent")),
        )
    }

    fn module(scripts: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in scripts {
            std::fs::write(dir.path().join(name), body).unwrap();
        }
        dir
    }

    fn opts(dir: &Path, inputs: Value) -> RunOptions {
        let inputs = inputs
            .as_object()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .collect();
        RunOptions::new(ModuleSource::Local(dir.to_path_buf()), inputs)
    }

    #[test]
    fn test_native_parse_report_takes_last_json_line() {
        let stdout = "creating...\n{\"not\": \"this\"}\nmore noise\n{\"outputs\": {\"url\": \"x\"}, \"sensitive\": [\"url\"]}\n";
        let report = parse_report(stdout).unwrap();
        let outputs = report.outputs();
        assert_eq!(outputs["url"].value, json!("x"));
        assert!(outputs["url"].sensitive);
        assert!(parse_report("no json here").unwrap().outputs.is_empty());
    }

    #[tokio::test]
    async fn test_native_apply_reads_inputs_and_writes_state() {
        let dir = module(&[(
            "apply",
            r#"name=$(sed -n 's/.*"name": "\(.*\)".*/\1/p' "$STRATA_INPUTS")
echo "state-for-$name" > "$STRATA_STATE_OUT"
echo "applying $STRATA_OPERATION"
echo "{\"outputs\": {\"url\": \"db://$name\", \"password\": \"pw\"}, \"sensitive\": [\"password\"]}"
"#,
        )]);
        let opts = opts(dir.path(), json!({"name": "orders"}));
        let result = plugin().apply(&opts, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.outputs["url"].value, json!("db://orders"));
        assert!(!result.outputs["url"].sensitive);
        assert!(result.outputs["password"].sensitive);
        assert_eq!(result.state, b"state-for-orders\n");
        assert_eq!(opts.state_writer.get().as_deref(), Some(&b"state-for-orders\n"[..]));
    }

    #[tokio::test]
    async fn test_native_apply_without_state_file_tracks_outputs() {
        let dir = module(&[("apply.sh", r#"echo '{"outputs": {"id": 7}}'"#)]);
        let result = plugin()
            .apply(&opts(dir.path(), json!({})), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.state, br#"{"id":7}"#);
    }

    #[tokio::test]
    async fn test_native_failed_apply_keeps_partial_state() {
        let dir = module(&[(
            "apply",
            "echo partial > \"$STRATA_STATE_OUT\"\necho 'Error: quota' >&2\nexit 3\n",
        )]);
        let opts = opts(dir.path(), json!({}));
        let err = plugin().apply(&opts, &CancellationToken::new()).await.unwrap_err();
        match err {
            PluginError::Execution(e) => {
                assert_eq!(e.phase, Phase::Apply);
                assert_eq!(e.exit_code, 3);
            }
            other => panic!("unexpected: {other}"),
        }
        assert_eq!(opts.state_writer.get().as_deref(), Some(&b"partial\n"[..]));
    }

    #[tokio::test]
    async fn test_native_destroy_requires_state() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let script = format!("touch {}\n", marker.display());
        std::fs::write(dir.path().join("destroy"), script).unwrap();
        let err = plugin()
            .destroy(&opts(dir.path(), json!({})), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::StateRequired { operation: "destroy" }));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_native_destroy_sees_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let seen = dir.path().join("seen");
        let script = format!("cp \"$STRATA_STATE\" {}\n", seen.display());
        std::fs::write(dir.path().join("destroy"), script).unwrap();
        let opts = opts(dir.path(), json!({})).with_state(Some(b"prior".to_vec()));
        plugin().destroy(&opts, &CancellationToken::new()).await.unwrap();
        assert_eq!(std::fs::read(&seen).unwrap(), b"prior");
    }

    #[tokio::test]
    async fn test_native_preview_synthesised_without_script() {
        let dir = module(&[("apply", "true\n")]);
        let fresh = plugin()
            .preview(&opts(dir.path(), json!({"size": 1})), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fresh.summary.create, 1);
        let existing = plugin()
            .preview(
                &opts(dir.path(), json!({"size": 1})).with_state(Some(b"{}".to_vec())),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(existing.summary.update, 1);
    }

    #[tokio::test]
    async fn test_native_preview_script_reports_changes() {
        let dir = module(&[(
            "preview",
            r#"echo '{"changes": [{"address": "bucket.logs", "action": "replace", "before": {"region": "a"}, "after": {"region": "b"}}, {"action": "noop"}]}'"#,
        )]);
        let preview = plugin()
            .preview(&opts(dir.path(), json!({})), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(preview.changes.len(), 2);
        assert_eq!(preview.changes[0].address, "bucket.logs");
        assert_eq!(preview.changes[0].diffs[0].path, "region");
        assert_eq!(preview.summary.replace, 1);
        assert_eq!(preview.summary.total(), 1);
    }

    #[tokio::test]
    async fn test_native_refresh_without_script_returns_recorded_outputs() {
        let dir = module(&[("apply", "true\n")]);
        let opts = opts(dir.path(), json!({})).with_state(Some(br#"{"id": 7}"#.to_vec()));
        let result = plugin().refresh(&opts, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.outputs["id"].value, json!(7));
        assert_eq!(result.state, br#"{"id": 7}"#);
    }

    #[tokio::test]
    async fn test_native_missing_apply_script() {
        let dir = module(&[]);
        let err = plugin()
            .apply(&opts(dir.path(), json!({})), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no 'apply' script"));
    }
}
