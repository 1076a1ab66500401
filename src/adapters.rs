//! Process-backed workers and plan generators
//!
//! Both adapters run an external command per call: the input goes to the
//! child's stdin, stdout is the answer, and a non-zero exit is a failure.
//! Children are killed when the call is cancelled or times out.

use async_trait::async_trait;
use helmsman_core::{PlanGenerator, PlanRequest, StepOutput, Worker, WorkerFailure};
use serde_json::json;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Output of one finished child process
struct ProcessOutput {
    stdout: String,
}

async fn run_process(
    program: &str,
    args: &[String],
    input: &str,
    cancel: Option<CancellationToken>,
) -> Result<ProcessOutput, WorkerFailure> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| WorkerFailure::new(format!("failed to start '{program}': {e}")))?;

    // Feed stdin while draining the output pipes; a child that fills its
    // stdout before reading all input would otherwise never finish
    let stdin = child.stdin.take();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            match stdin.write_all(input.as_bytes()).await {
                // A child that never reads its input may already be gone
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                _ => {}
            }
        }
        Ok(())
    };
    let finish = async move {
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        fed.map_err(|e| WorkerFailure::new(format!("failed to write to '{program}': {e}")))?;
        output.map_err(|e| WorkerFailure::new(format!("'{program}' did not finish: {e}")))
    };

    let output = match cancel {
        Some(cancel) => tokio::select! {
            _ = cancel.cancelled() => {
                return Err(WorkerFailure::new(format!("'{program}' cancelled")));
            }
            output = finish => output,
        },
        None => finish.await,
    }?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(WorkerFailure::new(format!(
            "'{program}' exited with {}",
            output.status
        ))
        .with_payload(json!({
            "status": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
        })));
    }
    debug!(program, bytes = stdout.len(), "Process finished");
    Ok(ProcessOutput { stdout })
}

/// Worker that pipes each instruction through a command
pub struct CommandWorker {
    program: String,
    args: Vec<String>,
}

impl CommandWorker {
    /// Run `program args..` per instruction
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn invoke(
        &self,
        instruction: &str,
        cancel: CancellationToken,
    ) -> Result<StepOutput, WorkerFailure> {
        let output = run_process(&self.program, &self.args, instruction, Some(cancel)).await?;
        Ok(StepOutput::text(output.stdout))
    }
}

/// Plan generator that sends the request as JSON to a command
pub struct CommandPlanGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandPlanGenerator {
    /// Run `program args..` per plan request
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl PlanGenerator for CommandPlanGenerator {
    async fn generate_plan(&self, request: &PlanRequest) -> Result<String, WorkerFailure> {
        let input = serde_json::to_string(request)
            .map_err(|e| WorkerFailure::new(format!("could not encode plan request: {e}")))?;
        let output = run_process(&self.program, &self.args, &input, None).await?;
        Ok(output.stdout)
    }
}

/// Plan generator for hosts without a planner command
pub struct UnconfiguredPlanner;

#[async_trait]
impl PlanGenerator for UnconfiguredPlanner {
    async fn generate_plan(&self, _request: &PlanRequest) -> Result<String, WorkerFailure> {
        Err(WorkerFailure::new(
            "no planner configured: set [planner] command or pass --plan FILE",
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_command_worker_reads_stdin() {
        let worker = CommandWorker::new("sh", sh("tr a-z A-Z"));
        let output = worker
            .invoke("list files", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.text, "LIST FILES");
    }

    #[tokio::test]
    async fn test_command_worker_large_input() {
        // Larger than any pipe buffer in both directions
        let input = "x".repeat(1 << 20);
        let worker = CommandWorker::new("cat", Vec::new());
        let output = worker
            .invoke(&input, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.text.len(), input.len());
    }

    #[tokio::test]
    async fn test_command_worker_nonzero_exit() {
        let worker = CommandWorker::new("sh", sh("echo boom >&2; exit 3"));
        let failure = worker
            .invoke("anything", CancellationToken::new())
            .await
            .unwrap_err();
        let payload = failure.payload.unwrap();
        assert_eq!(payload["status"], 3);
        assert_eq!(payload["stderr"], "boom");
    }

    #[tokio::test]
    async fn test_command_worker_cancelled() {
        let worker = CommandWorker::new("sh", sh("sleep 30"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let failure = worker.invoke("wait", cancel).await.unwrap_err();
        assert!(failure.message.contains("cancelled"));
    }

    #[tokio::test]
    async fn test_command_planner_receives_request() {
        let planner = CommandPlanGenerator::new("sh", sh("grep -q '\"goal\":\"ship it\"' && echo 'browse: done'"));
        let request = PlanRequest {
            goal: "ship it".to_string(),
            ..PlanRequest::default()
        };
        let text = planner.generate_plan(&request).await.unwrap();
        assert_eq!(text, "browse: done");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let worker = CommandWorker::new("definitely-not-a-real-binary-xyz", Vec::new());
        let failure = worker
            .invoke("x", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(failure.message.contains("failed to start"));
    }
}
