//! Execution engine: dispatches harness-wrapped user code into a sandbox,
//! enforces the timeout, and parses structured results.

pub mod harness;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

use crate::error::{PycellError, Result};
use crate::registry::SandboxRegistry;
use crate::runtime::ContainerRuntime;

/// Age past which leftover transient files from earlier (timed-out)
/// executions are collected.
const STALE_EXEC_FILE_AGE: Duration = Duration::from_secs(600);

/// Interpreter invoked inside the sandbox
const PYTHON_BIN: &str = "python3";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Text,
    Table,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Value>,
}

/// One structured unit of program output produced by the harness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RichOutput {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<TableData>,
}

impl RichOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Text,
            content: content.into(),
            data: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Error,
            content: content.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
    pub outputs: Vec<RichOutput>,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Override of the configured timeout
    pub timeout: Option<Duration>,
    /// Correlation id namespacing the transient files, so concurrent
    /// executions in one sandbox don't collide
    pub correlation_id: Option<String>,
}

pub struct ExecutionEngine {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<SandboxRegistry>,
    default_timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<SandboxRegistry>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            registry,
            default_timeout,
        }
    }

    /// Execute user code in a sandbox.
    ///
    /// Timeout and user-code failures are recovered into the returned
    /// [`ExecutionResult`]; only missing sandboxes and host-side IO
    /// problems surface as errors.
    pub async fn execute(
        &self,
        sandbox_id: &str,
        code: &str,
        opts: ExecOptions,
    ) -> Result<ExecutionResult> {
        let sandbox =
            self.registry
                .get(sandbox_id)
                .await
                .ok_or_else(|| PycellError::SandboxNotFound {
                    id: sandbox_id.to_string(),
                })?;
        let workspace = sandbox.workspace();
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let correlation = opts.correlation_id.as_deref();

        workspace.sweep_stale_exec_files(STALE_EXEC_FILE_AGE).await;

        let code_file = workspace.code_file(correlation);
        let outputs_file = workspace.outputs_file(correlation);
        let guest_code = workspace.guest_code_file(correlation);
        let guest_outputs = workspace.guest_outputs_file(correlation);

        let started = Instant::now();
        let wrapped = harness::render(code, &guest_outputs);
        tokio::fs::write(&code_file, wrapped).await?;

        let timeout_ms = timeout.as_millis() as u64;
        debug!(sandbox = %sandbox.id, file = %guest_code, timeout_ms, "Dispatching execution");

        let argv = vec![PYTHON_BIN.to_string(), guest_code];
        let mut child = self.runtime.exec_spawn(&sandbox.external_id, &argv)?;

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let stdout_task = child.stdout.take().map(|s| drain(s, stdout_buf.clone()));
        let stderr_task = child.stderr.take().map(|s| drain(s, stderr_buf.clone()));

        let waited = tokio::time::timeout(timeout, child.wait()).await;

        let result = match waited {
            Err(_) => {
                // Timed out: kill the process, keep whatever was captured.
                // The transient files stay behind for the stale sweep.
                if let Err(e) = child.start_kill() {
                    warn!(sandbox = %sandbox.id, error = %e, "Failed to kill timed-out execution");
                }
                let _ = child.wait().await;
                join_drains(stdout_task, stderr_task).await;

                let message = format!("Execution timed out after {} ms", timeout.as_millis());
                warn!(sandbox = %sandbox.id, "{message}");
                ExecutionResult {
                    status: ExecStatus::Timeout,
                    stdout: take_buf(&stdout_buf),
                    stderr: take_buf(&stderr_buf),
                    outputs: vec![RichOutput::error(&message)],
                    elapsed_ms: timeout.as_millis() as u64,
                    error: Some(message),
                }
            }
            Ok(status) => {
                let status = status.map_err(|e| {
                    PycellError::SandboxExecution(format!("Failed to await execution: {e}"))
                })?;
                join_drains(stdout_task, stderr_task).await;

                let stdout = take_buf(&stdout_buf);
                let stderr = take_buf(&stderr_buf);
                let exit_code = status.code().unwrap_or(1);

                let mut outputs = match tokio::fs::read_to_string(&outputs_file).await {
                    Ok(raw) => serde_json::from_str::<Vec<RichOutput>>(&raw).ok(),
                    Err(_) => None,
                }
                .unwrap_or_else(|| {
                    // Harness contract broken; fall back to raw stdout.
                    if stdout.is_empty() {
                        Vec::new()
                    } else {
                        vec![RichOutput::text(stdout.clone())]
                    }
                });

                let _ = tokio::fs::remove_file(&code_file).await;
                let _ = tokio::fs::remove_file(&outputs_file).await;

                let mut has_error_output = outputs.iter().any(|o| o.kind == OutputKind::Error);
                if exit_code != 0 && !has_error_output && !stderr.trim().is_empty() {
                    // Never leave the error channel empty on failure.
                    outputs.push(RichOutput::error(stderr.clone()));
                    has_error_output = true;
                }

                let status = if exit_code != 0 || has_error_output {
                    ExecStatus::Error
                } else {
                    ExecStatus::Success
                };
                let error = outputs
                    .iter()
                    .find(|o| o.kind == OutputKind::Error)
                    .map(|o| o.content.clone());

                ExecutionResult {
                    status,
                    stdout,
                    stderr,
                    outputs,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    error,
                }
            }
        };

        self.registry.touch(sandbox_id).await;
        debug!(sandbox = %sandbox.id, status = ?result.status, elapsed_ms = result.elapsed_ms, "Execution finished");
        Ok(result)
    }
}

fn drain(
    stream: impl AsyncRead + Unpin + Send + 'static,
    buf: Arc<Mutex<String>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut buf = buf.lock().unwrap();
            buf.push_str(&line);
            buf.push('\n');
        }
    })
}

async fn join_drains(
    stdout: Option<tokio::task::JoinHandle<()>>,
    stderr: Option<tokio::task::JoinHandle<()>>,
) {
    if let Some(task) = stdout {
        let _ = task.await;
    }
    if let Some(task) = stderr {
        let _ = task.await;
    }
}

fn take_buf(buf: &Arc<Mutex<String>>) -> String {
    buf.lock().unwrap().clone()
}
