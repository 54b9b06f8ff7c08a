use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{io::AsyncReadExt, process::Command, task::JoinHandle};

use crate::{
    models::InputResults,
    sandbox::{RunSpec, SandboxBackend, SandboxError, Workspace, parse_driver_output},
};

/// Runs the driver with interpreters installed on the host. No isolation;
/// meant for local development only.
#[derive(Default)]
pub struct ProcessSandbox;

impl ProcessSandbox {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SandboxBackend for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn execute(&self, spec: RunSpec) -> Result<InputResults, SandboxError> {
        let (program, args) = spec
            .runtime
            .command
            .split_first()
            .ok_or_else(|| SandboxError::Transport("runtime command is empty".to_string()))?;

        let workspace = Workspace::materialize(&spec).await?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(workspace.path());

        let result = run_command(cmd, spec.timeout, spec.max_output_bytes).await;
        workspace.cleanup().await;

        let output = result?;
        tracing::debug!(
            exec_id = %spec.exec_id,
            exit_code = output.exit_code,
            timed_out = output.timed_out,
            "driver process exited"
        );
        if output.timed_out {
            return Err(SandboxError::Transport(format!(
                "execution timed out after {} ms",
                spec.timeout.as_millis()
            )));
        }
        parse_driver_output(&output.stdout, &output.stderr)
    }
}

/// Grace period for the output readers once the child is gone. Stray
/// descendants can hold the pipes open past that point.
const READER_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct CommandOutput {
    stdout: String,
    stderr: String,
    exit_code: i32,
    timed_out: bool,
}

/// Spawns `cmd` in its own process group, capturing at most `limit` bytes of
/// each stream. The whole group is killed once the child exits or `timeout`
/// elapses, whichever comes first.
async fn run_command(
    mut cmd: Command,
    timeout: Duration,
    limit: usize,
) -> Result<CommandOutput, SandboxError> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|err| SandboxError::Transport(format!("failed to spawn sandbox: {err}")))?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Transport("missing stdout pipe".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SandboxError::Transport("missing stderr pipe".to_string()))?;
    let stdout_task = tokio::spawn(async move { read_limited(stdout, limit).await });
    let stderr_task = tokio::spawn(async move { read_limited(stderr, limit).await });

    let waited = tokio::time::timeout(timeout, child.wait()).await;
    kill_process_group(pid);
    let (exit_code, timed_out) = match waited {
        Ok(Ok(status)) => (status.code().unwrap_or(-1), false),
        Ok(Err(err)) => {
            return Err(SandboxError::Transport(format!(
                "sandbox wait failed: {err}"
            )));
        }
        Err(_) => {
            let _ = child.kill().await;
            (-1, true)
        }
    };

    let stdout = join_reader(stdout_task).await;
    let stderr = join_reader(stderr_task).await;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
        exit_code,
        timed_out,
    })
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };

    let Some(pgid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => tracing::debug!(pgid, error = %err, "failed to kill sandbox process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

async fn join_reader(mut task: JoinHandle<Vec<u8>>) -> Vec<u8> {
    match tokio::time::timeout(READER_GRACE, &mut task).await {
        Ok(bytes) => bytes.unwrap_or_default(),
        Err(_) => {
            task.abort();
            Vec::new()
        }
    }
}

async fn read_limited<R>(mut reader: R, limit: usize) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut out = Vec::with_capacity(limit.min(8192));
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if out.len() < limit {
                    let remaining = limit - out.len();
                    out.extend_from_slice(&chunk[..remaining.min(n)]);
                }
            }
            Err(_) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tokio::process::Command;
    use uuid::Uuid;

    use super::{ProcessSandbox, run_command};
    use crate::{
        models::InputResult,
        sandbox::{Runtime, RunSpec, RuntimeSpec, SandboxBackend, SandboxError},
    };

    fn shell_spec(script: &str, timeout: Duration) -> RunSpec {
        let runtime = RuntimeSpec {
            runtime: Runtime::Python,
            image: "unused".to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        };
        RunSpec {
            exec_id: Uuid::new_v4(),
            files: runtime.source_files("return input_str"),
            runtime,
            inputs: vec!["a".to_string()],
            timeout,
            max_output_bytes: 64 * 1024,
        }
    }

    #[tokio::test]
    async fn process_backend_materializes_bundle_and_parses_mapping() {
        let script = r#"test -f main.py && test -f runner.py && grep -q '"a"' inputs.json && printf '{"a": "A"}'"#;
        let results = ProcessSandbox::new()
            .execute(shell_spec(script, Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(results["a"], InputResult::ok("A"));
    }

    #[tokio::test]
    async fn process_backend_reports_timeout_as_transport_error() {
        let err = ProcessSandbox::new()
            .execute(shell_spec("sleep 5", Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Transport(msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello; echo oops >&2; exit 3"]);
        let out = run_command(cmd, Duration::from_secs(5), 1024).await.unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.exit_code, 3);
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn output_is_capped() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'abcdefghij'"]);
        let out = run_command(cmd, Duration::from_secs(5), 4).await.unwrap();
        assert_eq!(out.stdout, "abcd");
    }

    #[tokio::test]
    async fn slow_commands_are_killed() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let out = run_command(cmd, Duration::from_millis(100), 1024)
            .await
            .unwrap();
        assert!(out.timed_out);
    }

    #[tokio::test]
    async fn timeout_is_not_extended_by_background_children() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30 & sleep 30"]);
        let started = Instant::now();
        let out = run_command(cmd, Duration::from_millis(200), 1024)
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn background_children_do_not_outlive_a_finished_command() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30 & echo done"]);
        let started = Instant::now();
        let out = run_command(cmd, Duration::from_secs(20), 1024)
            .await
            .unwrap();
        assert!(!out.timed_out);
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "done\n");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_binary_is_a_transport_error() {
        let cmd = Command::new("/nonexistent/coderun-missing-binary");
        let err = run_command(cmd, Duration::from_secs(1), 1024)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("sandbox unavailable"));
    }
}
