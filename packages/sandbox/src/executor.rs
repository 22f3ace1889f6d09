// ABOUTME: Command executor running scanner tools inside a scan's sandbox with per-tool timeouts
// ABOUTME: Races output collection against the deadline, demultiplexes output, and applies parsers

use crate::demux::demultiplex;
use crate::providers::{ContainerRuntime, ExecAttachment, RuntimeError};
use crate::session::{ContainerSession, SessionManager};
use crate::sinks::{write_log, LogLevel, RunStatus, RunStatusSource, ScanLogSink};
use async_trait::async_trait;
use futures::StreamExt;
use recon_config::constants::DEFAULT_STDOUT_LOG_CAP_BYTES;
use serde::Serialize;
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Scan {0} was cancelled")]
    Cancelled(String),

    #[error("Sandbox session lost for scan {scan_run_id}: {source}")]
    SessionLost {
        scan_run_id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Sandbox for scan {0} could not be recovered")]
    RecoveryFailed(String),
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// Turns a tool's stdout into structured data. Errors are reported, never fatal.
pub type OutputParser = Arc<dyn Fn(&str) -> std::result::Result<Value, String> + Send + Sync>;

/// Wrap a parser producing any serializable type.
pub fn typed_parser<T, F>(parse: F) -> OutputParser
where
    T: Serialize,
    F: Fn(&str) -> std::result::Result<T, String> + Send + Sync + 'static,
{
    Arc::new(move |stdout: &str| {
        parse(stdout).and_then(|value| serde_json::to_value(value).map_err(|e| e.to_string()))
    })
}

/// One tool run requested by a stage.
#[derive(Clone)]
pub struct ToolInvocation {
    pub command: String,
    pub scan_run_id: String,
    pub stage: String,
    pub tool: String,
    pub timeout: Duration,
    pub parser: Option<OutputParser>,
}

impl ToolInvocation {
    pub fn new(
        scan_run_id: &str,
        stage: &str,
        tool: &str,
        command: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            scan_run_id: scan_run_id.to_string(),
            stage: stage.to_string(),
            tool: tool.to_string(),
            timeout,
            parser: None,
        }
    }

    pub fn with_parser(mut self, parser: OutputParser) -> Self {
        self.parser = Some(parser);
        self
    }
}

impl fmt::Debug for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolInvocation")
            .field("command", &self.command)
            .field("scan_run_id", &self.scan_run_id)
            .field("stage", &self.stage)
            .field("tool", &self.tool)
            .field("timeout", &self.timeout)
            .field("parser", &self.parser.is_some())
            .finish()
    }
}

/// Outcome of one tool run. A non-zero exit or a timeout is data, not an error.
///
/// `stdout` and `stderr` hold the demultiplexed bytes exactly as the tool wrote them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolExecutionResult {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Process exit code, or -1 when it could not be determined.
    pub exit_code: i64,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub parsed: Option<Value>,
}

impl ToolExecutionResult {
    /// Stdout decoded for display, with invalid UTF-8 replaced.
    pub fn stdout_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

struct RawRun {
    buffer: Vec<u8>,
    exit_code: Option<i64>,
    timed_out: bool,
}

/// Cut `text` to at most `cap` bytes on a char boundary, appending a marker
/// with the number of bytes dropped.
pub fn truncate_for_log(text: &str, cap: usize) -> Cow<'_, str> {
    if text.len() <= cap {
        return Cow::Borrowed(text);
    }
    let mut boundary = cap;
    while !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    Cow::Owned(format!(
        "{}\n...[truncated {} bytes]",
        &text[..boundary],
        text.len() - boundary
    ))
}

/// Anything that can run a tool invocation for a stage.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolExecutionResult>;

    /// Session manager backing this runner.
    fn sessions(&self) -> &Arc<SessionManager>;
}

/// Runs tools in the scan's session container, or in a throwaway container
/// when no session exists.
pub struct CommandExecutor {
    sessions: Arc<SessionManager>,
    sink: Arc<dyn ScanLogSink>,
    status: Option<Arc<dyn RunStatusSource>>,
    log_cap: usize,
}

impl CommandExecutor {
    pub fn new(sessions: Arc<SessionManager>, sink: Arc<dyn ScanLogSink>) -> Self {
        Self {
            sessions,
            sink,
            status: None,
            log_cap: DEFAULT_STDOUT_LOG_CAP_BYTES,
        }
    }

    pub fn with_status_source(mut self, status: Arc<dyn RunStatusSource>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_log_cap(mut self, log_cap: usize) -> Self {
        self.log_cap = log_cap;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn sink(&self) -> &Arc<dyn ScanLogSink> {
        &self.sink
    }

    fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        self.sessions.runtime()
    }

    /// Run one tool invocation to completion or timeout.
    pub async fn execute(&self, invocation: &ToolInvocation) -> Result<ToolExecutionResult> {
        self.check_cancelled(invocation).await?;

        write_log(
            self.sink.as_ref(),
            &invocation.scan_run_id,
            LogLevel::Info,
            &invocation.stage,
            format!("Running {}: {}", invocation.tool, invocation.command),
        )
        .await;

        let started = Instant::now();
        let raw = match self.sessions.handle(&invocation.scan_run_id).await {
            Some(session) => self.run_in_session(&session, invocation).await?,
            None => self.run_ephemeral(invocation).await?,
        };
        let duration = started.elapsed();

        let demuxed = demultiplex(&raw.buffer);
        let text = String::from_utf8_lossy(&demuxed.stdout);
        let exit_code = raw.exit_code.unwrap_or(-1);

        self.log_outcome(invocation, &raw, exit_code, duration, &text)
            .await;

        let parsed = match &invocation.parser {
            Some(parser) if !text.trim().is_empty() => match parser(&text) {
                Ok(value) => Some(value),
                Err(e) => {
                    write_log(
                        self.sink.as_ref(),
                        &invocation.scan_run_id,
                        LogLevel::Warn,
                        &invocation.stage,
                        format!("Failed to parse {} output: {}", invocation.tool, e),
                    )
                    .await;
                    None
                }
            },
            _ => None,
        };
        drop(text);

        Ok(ToolExecutionResult {
            success: exit_code == 0 && !raw.timed_out,
            stdout: demuxed.stdout,
            stderr: demuxed.stderr,
            exit_code,
            duration_ms: duration.as_millis() as u64,
            timed_out: raw.timed_out,
            parsed,
        })
    }

    /// Fail with `Cancelled` and tear the sandbox down if the scan was cancelled.
    pub(crate) async fn check_cancelled(&self, invocation: &ToolInvocation) -> Result<()> {
        let Some(status) = &self.status else {
            return Ok(());
        };
        match status.run_status(&invocation.scan_run_id).await {
            Ok(Some(RunStatus::Cancelled)) => {
                write_log(
                    self.sink.as_ref(),
                    &invocation.scan_run_id,
                    LogLevel::Warn,
                    &invocation.stage,
                    format!("Scan cancelled, skipping {}", invocation.tool),
                )
                .await;
                self.sessions.kill_container(&invocation.scan_run_id).await;
                Err(ExecError::Cancelled(invocation.scan_run_id.clone()))
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(
                    "Status lookup for scan {} failed, continuing: {}",
                    invocation.scan_run_id, e
                );
                Ok(())
            }
        }
    }

    fn classify(&self, invocation: &ToolInvocation, error: RuntimeError) -> ExecError {
        if error.is_container_gone() {
            ExecError::SessionLost {
                scan_run_id: invocation.scan_run_id.clone(),
                source: error,
            }
        } else {
            ExecError::Runtime(error)
        }
    }

    async fn run_in_session(
        &self,
        session: &ContainerSession,
        invocation: &ToolInvocation,
    ) -> Result<RawRun> {
        let runtime = self.runtime();
        let container = session.container_name.as_str();

        let ExecAttachment { exec, mut output } = runtime
            .exec(container, &invocation.command)
            .await
            .map_err(|e| self.classify(invocation, e))?;

        let mut buffer = Vec::new();
        let collected = tokio::time::timeout(invocation.timeout, async {
            while let Some(chunk) = output.next().await {
                buffer.extend_from_slice(&chunk?);
            }
            Ok::<(), RuntimeError>(())
        })
        .await;

        match collected {
            Ok(Ok(())) => {
                let exit_code = runtime
                    .exec_exit_code(&exec)
                    .await
                    .map_err(|e| self.classify(invocation, e))?;
                Ok(RawRun {
                    buffer,
                    exit_code,
                    timed_out: false,
                })
            }
            Ok(Err(e)) => Err(self.classify(invocation, e)),
            Err(_) => {
                if let Err(e) = runtime.kill_exec(container, &exec).await {
                    warn!("Failed to kill timed out {} exec: {}", invocation.tool, e);
                }
                Ok(RawRun {
                    buffer,
                    exit_code: None,
                    timed_out: true,
                })
            }
        }
    }

    async fn run_ephemeral(&self, invocation: &ToolInvocation) -> Result<RawRun> {
        let runtime = self.runtime();
        let spec = self
            .sessions
            .config()
            .ephemeral_spec(&invocation.scan_run_id, &invocation.command);
        let name = spec.name.clone();

        debug!("Running {} in ephemeral container {}", invocation.tool, name);
        runtime.create_and_start(&spec).await?;

        let (exit_code, timed_out) =
            match tokio::time::timeout(invocation.timeout, runtime.wait(&name)).await {
                Ok(Ok(code)) => (Some(code), false),
                Ok(Err(e)) => {
                    if let Err(cleanup) = runtime.remove(&name, true).await {
                        warn!("Failed to remove ephemeral container {}: {}", name, cleanup);
                    }
                    return Err(ExecError::Runtime(e));
                }
                Err(_) => {
                    if let Err(e) = runtime.kill(&name).await {
                        warn!("Failed to kill timed out container {}: {}", name, e);
                    }
                    (None, true)
                }
            };

        let buffer = runtime.logs(&name).await.unwrap_or_else(|e| {
            warn!("Failed to read logs from {}: {}", name, e);
            Vec::new()
        });

        if let Err(e) = runtime.remove(&name, true).await {
            warn!("Failed to remove ephemeral container {}: {}", name, e);
        }

        Ok(RawRun {
            buffer,
            exit_code,
            timed_out,
        })
    }

    async fn log_outcome(
        &self,
        invocation: &ToolInvocation,
        raw: &RawRun,
        exit_code: i64,
        duration: Duration,
        stdout: &str,
    ) {
        let sink = self.sink.as_ref();
        let id = &invocation.scan_run_id;
        let stage = &invocation.stage;

        if raw.timed_out {
            write_log(
                sink,
                id,
                LogLevel::Warn,
                stage,
                format!(
                    "{} timed out after {}s",
                    invocation.tool,
                    invocation.timeout.as_secs()
                ),
            )
            .await;
        } else {
            let level = if exit_code == 0 {
                LogLevel::Info
            } else {
                LogLevel::Warn
            };
            write_log(
                sink,
                id,
                level,
                stage,
                format!(
                    "{} exited with code {} in {}ms",
                    invocation.tool,
                    exit_code,
                    duration.as_millis()
                ),
            )
            .await;
        }

        if !stdout.is_empty() {
            write_log(
                sink,
                id,
                LogLevel::Debug,
                stage,
                truncate_for_log(stdout, self.log_cap),
            )
            .await;
        }
    }
}

#[async_trait]
impl ToolRunner for CommandExecutor {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolExecutionResult> {
        self.execute(invocation).await
    }

    fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}
