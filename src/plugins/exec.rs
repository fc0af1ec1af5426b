//! Subprocess execution for plugin tools.
//!
//! Runs a tool on the host or inside a container, streams its output to
//! the caller's sink line by line and captures it. Each child gets its own
//! process group so cancellation can kill everything it spawned.

use super::{ExecError, OutputSink, Phase, PluginError, Stream, Volume};
use indexmap::IndexMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Captured output from a finished tool.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into an [`ExecError`] for `phase`.
    pub fn check(self, phase: Phase) -> Result<Self, PluginError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExecError {
                phase,
                exit_code: self.exit_code,
                stdout: self.stdout,
                stderr: self.stderr,
            }
            .into())
        }
    }
}

/// Container to run the tool in instead of the host.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub volumes: Vec<Volume>,
}

/// One tool command line.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: IndexMap<String, String>,
    pub container: Option<ContainerSpec>,
}

impl Invocation {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: IndexMap::new(),
            container: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &IndexMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn in_container(mut self, container: Option<ContainerSpec>) -> Self {
        self.container = container;
        self
    }

    /// Program and arguments actually spawned on the host.
    fn command_line(&self, container_name: &str) -> (String, Vec<String>) {
        let Some(spec) = &self.container else {
            return (self.program.clone(), self.args.clone());
        };
        let cwd = self.cwd.display().to_string();
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
            "-w".to_string(),
            cwd.clone(),
            "-v".to_string(),
            format!("{}:{}", cwd, cwd),
        ];
        for v in &spec.volumes {
            args.push("-v".to_string());
            let mode = if v.read_only { ":ro" } else { "" };
            args.push(format!("{}:{}{}", v.host.display(), v.container, mode));
        }
        for (k, v) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }
        args.push(spec.image.clone());
        args.push(self.program.clone());
        args.extend(self.args.iter().cloned());
        ("docker".to_string(), args)
    }
}

const MAX_READ_ERRORS: u32 = 16;

/// Read lines until EOF. Bytes that are not UTF-8 are replaced; the pipe
/// stays open while the child is still writing.
async fn collect<R: AsyncRead + Unpin>(reader: Option<R>, stream: Stream, sink: Option<OutputSink>) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut captured = String::new();
    let mut errors = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => errors = 0,
            Err(e) if errors < MAX_READ_ERRORS => {
                errors += 1;
                debug!(?stream, error = %e, "read error, draining");
                if buf.is_empty() {
                    continue;
                }
            }
            Err(e) => {
                warn!(?stream, error = %e, "giving up reading output");
                break;
            }
        }
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\n', '\r']);
        if let Some(sink) = &sink {
            sink(stream, line);
        }
        captured.push_str(line);
        captured.push('\n');
    }
    captured
}

/// Run an invocation to completion or until `cancel` fires.
///
/// On cancellation the whole process group is killed (and the container,
/// when there is one) and [`PluginError::Cancelled`] is returned.
pub async fn run(
    inv: &Invocation,
    sink: Option<OutputSink>,
    cancel: &CancellationToken,
) -> Result<ExecOutput, PluginError> {
    if cancel.is_cancelled() {
        return Err(PluginError::Cancelled);
    }
    let container_name = format!("strata-{}", crate::tripwire::eventlog::generate_run_id());
    let (program, args) = inv.command_line(&container_name);
    debug!(program = %program, args = ?args, cwd = %inv.cwd.display(), "spawning");

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .current_dir(&inv.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if inv.container.is_none() {
        cmd.envs(&inv.env);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| PluginError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let finished = async {
        let (status, out, err) = tokio::join!(
            child.wait(),
            collect(stdout, Stream::Stdout, sink.clone()),
            collect(stderr, Stream::Stderr, sink.clone()),
        );
        (status, out, err)
    };

    tokio::select! {
        (status, stdout, stderr) = finished => {
            let status = status.map_err(PluginError::io(format!("waiting for {}", program)))?;
            Ok(ExecOutput {
                // Killed by a signal: no exit code
                exit_code: status.code().unwrap_or(-1),
                stdout,
                stderr,
            })
        }
        _ = cancel.cancelled() => {
            warn!(program = %program, pid = ?pid, "cancelled, killing process group");
            if let Some(pid) = pid {
                kill_group(pid);
            }
            if inv.container.is_some() {
                kill_container("docker", &container_name).await;
            }
            Err(PluginError::Cancelled)
        }
    }
}

/// `<program> kill <container>`. Returns whether the kill succeeded; a
/// failure is only logged, the container may already be gone.
async fn kill_container(program: &str, container: &str) -> bool {
    match Command::new(program)
        .args(["kill", container])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) if status.success() => true,
        Ok(status) => {
            debug!(container, ?status, "docker kill failed");
            false
        }
        Err(e) => {
            debug!(container, error = %e, "docker kill failed");
            false
        }
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal. The group id is the pid of a child
    // spawned with process_group(0), so it names that child's own group.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    fn bash(script: &str) -> Invocation {
        Invocation::new("bash", std::env::temp_dir()).args(["-c", script])
    }

    #[tokio::test]
    async fn test_exec_echo() {
        let out = run(&bash("echo hello"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_exec_failure_carries_phase() {
        let out = run(&bash("echo boom >&2; exit 42"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 42);
        match out.check(Phase::Apply).unwrap_err() {
            PluginError::Execution(e) => {
                assert_eq!(e.phase, Phase::Apply);
                assert_eq!(e.exit_code, 42);
                assert!(e.stderr.contains("boom"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn test_exec_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let inv = Invocation::new("bash", dir.path())
            .args(["-c", "echo \"$GREETING\"; pwd"])
            .env("GREETING", "hi");
        let out = run(&inv, None, &CancellationToken::new()).await.unwrap();
        let lines: Vec<_> = out.stdout.lines().collect();
        assert_eq!(lines[0], "hi");
        assert!(lines[1].ends_with(&*dir.path().file_name().unwrap().to_string_lossy()));
    }

    #[tokio::test]
    async fn test_exec_streams_to_sink() {
        let seen: Arc<Mutex<Vec<(Stream, String)>>> = Arc::default();
        let captured = seen.clone();
        let sink: OutputSink = Arc::new(move |stream, line| {
            captured.lock().unwrap().push((stream, line.to_string()));
        });
        run(&bash("echo out; echo err >&2"), Some(sink), &CancellationToken::new())
            .await
            .unwrap();
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&(Stream::Stdout, "out".to_string())));
        assert!(seen.contains(&(Stream::Stderr, "err".to_string())));
    }

    #[tokio::test]
    async fn test_exec_cancel_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");
        // The grandchild would write the marker if it outlived the cancel
        let script = format!("(sleep 2; touch {}) & sleep 30", marker.display());
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = run(&bash(&script), None, &token).await.unwrap_err();
        assert!(matches!(err, PluginError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_exec_invalid_utf8_keeps_draining() {
        let script = "printf 'caf\\xe9\\n'; for i in $(seq 1 20000); do echo line-$i-padding-padding-padding; done; echo DONE";
        let out = run(&bash(script), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        let lines: Vec<&str> = out.stdout.lines().collect();
        assert_eq!(lines[0], "caf\u{FFFD}");
        assert_eq!(lines.len(), 20002);
        assert_eq!(lines.last(), Some(&"DONE"));
    }

    #[tokio::test]
    async fn test_exec_kill_container_failure_is_not_an_error() {
        assert!(kill_container("true", "strata-test").await);
        assert!(!kill_container("false", "strata-test").await);
        assert!(!kill_container("definitely-not-a-real-tool-xyz", "strata-test").await);
    }

    #[tokio::test]
    async fn test_exec_pre_cancelled_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let token = CancellationToken::new();
        token.cancel();
        let err = run(&bash(&format!("touch {}", marker.display())), None, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Cancelled));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_exec_missing_program() {
        let inv = Invocation::new("definitely-not-a-real-tool-xyz", std::env::temp_dir());
        let err = run(&inv, None, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::Spawn { .. }));
    }

    #[test]
    fn test_exec_container_command_line() {
        let inv = Invocation::new("terraform", "/work/mod")
            .args(["apply", "-auto-approve"])
            .env("TF_IN_AUTOMATION", "1")
            .in_container(Some(ContainerSpec {
                image: "hashicorp/terraform:1.7".to_string(),
                volumes: vec![Volume {
                    host: PathBuf::from("/tmp/scratch"),
                    container: "/tmp/scratch".to_string(),
                    read_only: false,
                }],
            }));
        let (program, args) = inv.command_line("strata-test");
        assert_eq!(program, "docker");
        let joined = args.join(" ");
        assert!(joined.starts_with("run --rm --name strata-test -w /work/mod -v /work/mod:/work/mod"));
        assert!(joined.contains("-v /tmp/scratch:/tmp/scratch"));
        assert!(joined.contains("-e TF_IN_AUTOMATION=1"));
        assert!(joined.ends_with("hashicorp/terraform:1.7 terraform apply -auto-approve"));
    }
}
