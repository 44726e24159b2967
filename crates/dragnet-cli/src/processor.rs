use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use dragnet_core::error::AppError;
use dragnet_core::task::Task;
use dragnet_core::traits::{ProcessOutcome, Processor};

/// Exit code a command uses to say "this task can never succeed".
pub const PERMANENT_FAILURE_EXIT: i32 = 2;

const STDERR_TAIL: usize = 500;

/// Runs an external program once per task.
///
/// The task is written to stdin as JSON and the extracted fields are read
/// from stdout as JSON. Exit 0 is success, exit 2 a permanent failure,
/// anything else (or running past `timeout`) a retryable one.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProcessor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map_or(0, |(i, _)| i);
    text[start..].to_string()
}

impl Processor for CommandProcessor {
    async fn process(&self, task: &Task) -> Result<ProcessOutcome, AppError> {
        let input = serde_json::to_vec(task)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("DRAGNET_TASK_ID", task.id.as_str())
            .env("DRAGNET_ATTEMPT", task.attempts.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::transient(format!("Failed to spawn '{}': {e}", self.program)))?;

        // Feed stdin while draining stdout and stderr, so neither side can
        // block the other, and keep both under the deadline.
        let stdin = child.stdin.take();
        let task_id = &task.id;
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A command may exit without reading its input.
                if let Err(e) = stdin.write_all(&input).await {
                    tracing::debug!(%task_id, error = %e, "Command closed stdin early");
                }
            }
        };
        let run = async move {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        // Dropping `run` on timeout drops the child, which kills it.
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| AppError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| AppError::transient(format!("Failed to wait for command: {e}")))?;

        match output.status.code() {
            Some(0) => {
                let fields = serde_json::from_slice(&output.stdout).map_err(|e| {
                    AppError::transient(format!("Command printed invalid JSON: {e}"))
                })?;
                Ok(ProcessOutcome::new(fields))
            }
            Some(PERMANENT_FAILURE_EXIT) => Err(AppError::permanent(stderr_tail(&output.stderr))),
            code => Err(AppError::transient(format!(
                "Command exited with {}: {}",
                code.map_or_else(|| "signal".to_string(), |c| format!("code {c}")),
                stderr_tail(&output.stderr)
            ))),
        }
    }
}
