// ABOUTME: Stage runner executing one stage's tool invocations and tracking its status transitions
// ABOUTME: Defines the Stage trait and the context stages use to invoke tools with per-tool timeouts

use crate::error::Result;
use crate::model::{PipelineRun, ScanFacts, StageKind};
use async_trait::async_trait;
use recon_sandbox::{
    write_log, ExecError, LogLevel, OutputParser, ScanLogSink, ToolExecutionResult,
    ToolInvocation, ToolRunner, ToolTimeouts,
};
use std::sync::Arc;
use tracing::{error, info};

/// Everything a stage needs to run tools for one scan.
pub struct StageContext<'a> {
    pub scan_run_id: &'a str,
    pub target: &'a str,
    pub stage: StageKind,
    tools: &'a dyn ToolRunner,
    timeouts: &'a ToolTimeouts,
    sink: &'a dyn ScanLogSink,
}

impl<'a> StageContext<'a> {
    /// Run `command` for `tool` with that tool's configured timeout.
    pub async fn invoke(
        &self,
        tool: &str,
        command: String,
        parser: Option<OutputParser>,
    ) -> std::result::Result<ToolExecutionResult, ExecError> {
        let mut invocation = ToolInvocation::new(
            self.scan_run_id,
            self.stage.label(),
            tool,
            command,
            self.timeouts.lookup(tool),
        );
        invocation.parser = parser;
        self.tools.run(&invocation).await
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        write_log(self.sink, self.scan_run_id, level, self.stage.label(), message).await;
    }

    /// Record a tool that failed without failing the stage.
    pub async fn degrade(&self, facts: &mut ScanFacts, tool: &str, result: &ToolExecutionResult) {
        facts.degrade(tool);
        let detail = if result.timed_out {
            "timed out".to_string()
        } else {
            format!("exited with code {}", result.exit_code)
        };
        self.log(
            LogLevel::Warn,
            format!("{} {}, continuing without its output", tool, detail),
        )
        .await;
    }
}

/// One named phase of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn run(&self, ctx: &StageContext<'_>, facts: &mut ScanFacts) -> Result<()>;
}

/// Runs stages against a shared tool runner, moving each through
/// pending, running, and done or failed.
pub struct StageRunner {
    tools: Arc<dyn ToolRunner>,
    timeouts: ToolTimeouts,
    sink: Arc<dyn ScanLogSink>,
}

impl StageRunner {
    pub fn new(tools: Arc<dyn ToolRunner>, timeouts: ToolTimeouts, sink: Arc<dyn ScanLogSink>) -> Self {
        Self {
            tools,
            timeouts,
            sink,
        }
    }

    pub fn tools(&self) -> &Arc<dyn ToolRunner> {
        &self.tools
    }

    pub fn sink(&self) -> &Arc<dyn ScanLogSink> {
        &self.sink
    }

    pub async fn run_stage(&self, stage: &dyn Stage, run: &mut PipelineRun) -> Result<()> {
        let kind = stage.kind();
        run.begin(kind);
        info!("Scan {} entering stage {}", run.scan_run_id, kind);
        write_log(
            self.sink.as_ref(),
            &run.scan_run_id,
            LogLevel::Info,
            kind.label(),
            "Stage started",
        )
        .await;

        let ctx = StageContext {
            scan_run_id: &run.scan_run_id,
            target: &run.target,
            stage: kind,
            tools: self.tools.as_ref(),
            timeouts: &self.timeouts,
            sink: self.sink.as_ref(),
        };
        let result = stage.run(&ctx, &mut run.facts).await;

        match &result {
            Ok(()) => {
                run.complete(kind);
                write_log(
                    self.sink.as_ref(),
                    &run.scan_run_id,
                    LogLevel::Info,
                    kind.label(),
                    "Stage done",
                )
                .await;
            }
            Err(e) => {
                error!("Scan {} stage {} failed: {}", run.scan_run_id, kind, e);
                run.fail(kind, e.to_string());
                write_log(
                    self.sink.as_ref(),
                    &run.scan_run_id,
                    LogLevel::Error,
                    kind.label(),
                    format!("Stage failed: {}", e),
                )
                .await;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::model::StageState;
    use recon_sandbox::{MemoryLogSink, SessionManager};
    use std::time::Duration;

    mockall::mock! {
        Tools {}

        #[async_trait]
        impl ToolRunner for Tools {
            async fn run(&self, invocation: &ToolInvocation) -> std::result::Result<ToolExecutionResult, ExecError>;
            fn sessions(&self) -> &Arc<SessionManager>;
        }
    }

    struct EchoStage;

    #[async_trait]
    impl Stage for EchoStage {
        fn kind(&self) -> StageKind {
            StageKind::InfoGather
        }

        async fn run(&self, ctx: &StageContext<'_>, facts: &mut ScanFacts) -> Result<()> {
            let result = ctx.invoke("whois", format!("whois {}", ctx.target), None).await?;
            if !result.success {
                ctx.degrade(facts, "whois", &result).await;
            }
            Ok(())
        }
    }

    fn ok_result(exit_code: i64) -> ToolExecutionResult {
        ToolExecutionResult {
            success: exit_code == 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code,
            duration_ms: 5,
            timed_out: false,
            parsed: None,
        }
    }

    fn runner(tools: MockTools, sink: Arc<MemoryLogSink>) -> StageRunner {
        StageRunner::new(Arc::new(tools), ToolTimeouts::default(), sink)
    }

    #[tokio::test]
    async fn test_stage_uses_tool_timeout_and_completes() {
        let mut tools = MockTools::new();
        tools
            .expect_run()
            .withf(|inv| {
                inv.tool == "whois"
                    && inv.command == "whois example.com"
                    && inv.stage == "info-gather"
                    && inv.timeout == Duration::from_secs(60)
            })
            .times(1)
            .returning(|_| Ok(ok_result(0)));
        let sink = Arc::new(MemoryLogSink::new());
        let mut run = PipelineRun::new("run-1", "example.com");

        runner(tools, sink.clone())
            .run_stage(&EchoStage, &mut run)
            .await
            .unwrap();

        assert_eq!(run.status(StageKind::InfoGather).state, StageState::Done);
        assert_eq!(run.progress, 25);
        assert_eq!(sink.matching("Stage done").len(), 1);
    }

    #[tokio::test]
    async fn test_tool_failure_degrades_without_failing_stage() {
        let mut tools = MockTools::new();
        tools.expect_run().returning(|_| Ok(ok_result(1)));
        let sink = Arc::new(MemoryLogSink::new());
        let mut run = PipelineRun::new("run-1", "example.com");

        runner(tools, sink.clone())
            .run_stage(&EchoStage, &mut run)
            .await
            .unwrap();

        assert_eq!(run.status(StageKind::InfoGather).state, StageState::Done);
        assert_eq!(run.facts.degraded_tools, vec!["whois".to_string()]);
        assert_eq!(sink.matching("exited with code 1").len(), 1);
    }

    #[tokio::test]
    async fn test_exec_error_fails_stage() {
        let mut tools = MockTools::new();
        tools.expect_run().returning(|_| {
            Err(ExecError::RecoveryFailed("run-1".into()))
        });
        let sink = Arc::new(MemoryLogSink::new());
        let mut run = PipelineRun::new("run-1", "example.com");

        let err = runner(tools, sink)
            .run_stage(&EchoStage, &mut run)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Exec(ExecError::RecoveryFailed(_))));
        let status = run.status(StageKind::InfoGather);
        assert_eq!(status.state, StageState::Failed);
        assert!(status.error.as_deref().unwrap_or("").contains("could not be recovered"));
        assert_eq!(run.progress, 0);
    }
}
