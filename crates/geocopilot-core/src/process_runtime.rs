use std::collections::VecDeque;
use std::process::Stdio;

use async_trait::async_trait;
use geocopilot_types::{ErrorKind, LogEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::runtime::{RunOutput, ScriptContext, ScriptFault, ScriptRuntime};

const STDERR_TAIL_LINES: usize = 20;

/// Runs the saved script file with an external interpreter inside the run
/// directory.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    interpreter: String,
    args: Vec<String>,
}

impl ProcessRuntime {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new("python3")
    }
}

/// Maps the final exception line of a traceback onto the taxonomy.
fn classify(line: &str) -> ErrorKind {
    let lower = line.to_ascii_lowercase();
    if lower.contains("algorithm") && lower.contains("not found") {
        ErrorKind::AlgorithmNotFound
    } else if lower.contains("name 'iface' is not defined") {
        ErrorKind::MissingInteractiveContext
    } else if lower.contains("invalid geometry") {
        ErrorKind::InvalidGeometry
    } else if lower.contains("crs") && lower.contains("invalid") {
        ErrorKind::InvalidReferenceSystem
    } else {
        ErrorKind::UncaughtRuntimeError
    }
}

#[async_trait]
impl ScriptRuntime for ProcessRuntime {
    fn name(&self) -> &str {
        "process"
    }

    async fn run(&self, _script: &str, ctx: ScriptContext) -> Result<(), ScriptFault> {
        let mut command = Command::new(&self.interpreter);
        command
            .args(&self.args)
            .arg(ctx.script_path())
            .current_dir(ctx.run_dir())
            .env("GEOCOPILOT_RUN_DIR", ctx.run_dir())
            .env("GEOCOPILOT_RUN_ID", ctx.run_id())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|err| {
            ScriptFault::runtime(format!("failed to start `{}`: {err}", self.interpreter))
        })?;

        let stdout = child.stdout.take();
        let out = ctx.output.clone();
        let stdout_task = tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = out.send(RunOutput::Stdout(line));
            }
        });

        let stderr = child.stderr.take();
        let out = ctx.output.clone();
        let stderr_task = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let Some(stderr) = stderr else { return tail };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = out.send(RunOutput::Event(LogEvent::warning(line.clone())));
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        });

        let cancel = ctx.cancellation();
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(ScriptFault::new(ErrorKind::Cancelled, "script process killed"));
            }
            status = child.wait() => status.map_err(|err| ScriptFault::runtime(err.to_string()))?,
        };
        let _ = stdout_task.await;
        let tail = stderr_task.await.unwrap_or_default();

        if status.success() {
            return Ok(());
        }
        let last = tail
            .iter()
            .rev()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("interpreter exited with {status}"));
        let traceback = Vec::from(tail).join("\n");
        Err(ScriptFault::new(classify(&last), last).with_traceback(traceback))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::runtime::test_support;
    use geocopilot_types::Severity;

    async fn drain(
        mut rx: tokio::sync::mpsc::UnboundedReceiver<RunOutput>,
    ) -> (Vec<String>, Vec<LogEvent>) {
        let mut stdout = Vec::new();
        let mut events = Vec::new();
        while let Ok(item) = rx.try_recv() {
            match item {
                RunOutput::Stdout(line) => stdout.push(line),
                RunOutput::Event(event) => events.push(event),
            }
        }
        (stdout, events)
    }

    #[tokio::test]
    async fn stdout_and_stderr_stream_separately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (ctx, rx) =
            test_support::context(dir.path(), "echo one\necho two\necho careful >&2\n").await;
        ProcessRuntime::new("sh")
            .run("", ctx)
            .await
            .expect("clean exit");
        let (stdout, events) = drain(rx).await;
        assert_eq!(stdout, vec!["one", "two"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Warning);
        assert_eq!(events[0].text, "careful");
    }

    #[tokio::test]
    async fn non_zero_exit_becomes_fault_with_last_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = "echo 'Traceback (most recent call last):' >&2\necho \"NameError: name 'iface' is not defined\" >&2\nexit 1\n";
        let (ctx, _rx) = test_support::context(dir.path(), script).await;
        let fault = ProcessRuntime::new("sh")
            .run("", ctx)
            .await
            .expect_err("exit 1");
        assert_eq!(fault.kind, ErrorKind::MissingInteractiveContext);
        assert_eq!(fault.message, "NameError: name 'iface' is not defined");
        assert!(fault
            .traceback
            .as_deref()
            .is_some_and(|tb| tb.starts_with("Traceback")));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (ctx, _rx) = test_support::context(dir.path(), "sleep 30\n").await;
        let cancel = ctx.cancellation();
        let run = tokio::spawn(async move { ProcessRuntime::new("sh").run("", ctx).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        let fault = tokio::time::timeout(std::time::Duration::from_secs(5), run)
            .await
            .expect("killed promptly")
            .expect("join")
            .expect_err("cancelled");
        assert_eq!(fault.kind, ErrorKind::Cancelled);
    }

    #[test]
    fn exception_lines_classify() {
        assert_eq!(
            classify("QgsProcessingException: Algorithm native:bufer not found"),
            ErrorKind::AlgorithmNotFound
        );
        assert_eq!(classify("ZeroDivisionError: division by zero"), ErrorKind::UncaughtRuntimeError);
    }
}
