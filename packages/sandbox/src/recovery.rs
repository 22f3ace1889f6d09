// ABOUTME: Executor wrapper that respawns a lost sandbox and retries the invocation once
// ABOUTME: Only session loss triggers recovery; every other failure propagates untouched

use crate::executor::{CommandExecutor, ExecError, Result, ToolExecutionResult, ToolInvocation, ToolRunner};
use crate::session::SessionManager;
use crate::sinks::{write_log, LogLevel};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

pub struct RecoveringExecutor {
    inner: CommandExecutor,
}

impl RecoveringExecutor {
    pub fn new(inner: CommandExecutor) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &CommandExecutor {
        &self.inner
    }

    /// Run the invocation, recovering the session at most once if the
    /// sandbox disappears underneath it.
    pub async fn execute(&self, invocation: &ToolInvocation) -> Result<ToolExecutionResult> {
        let source = match self.inner.execute(invocation).await {
            Err(ExecError::SessionLost { source, .. }) => source,
            other => return other,
        };

        let scan_run_id = &invocation.scan_run_id;
        self.inner.check_cancelled(invocation).await?;

        write_log(
            self.inner.sink().as_ref(),
            scan_run_id,
            LogLevel::Warn,
            &invocation.stage,
            format!(
                "Sandbox lost while running {} ({}), recovering session",
                invocation.tool, source
            ),
        )
        .await;

        if !self.inner.sessions().ensure_session_alive(scan_run_id).await {
            error!("Could not recover sandbox for scan {}", scan_run_id);
            return Err(ExecError::RecoveryFailed(scan_run_id.clone()));
        }

        info!("Sandbox recovered for scan {}, retrying {}", scan_run_id, invocation.tool);
        self.inner.execute(invocation).await
    }
}

#[async_trait]
impl ToolRunner for RecoveringExecutor {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolExecutionResult> {
        self.execute(invocation).await
    }

    fn sessions(&self) -> &Arc<SessionManager> {
        self.inner.sessions()
    }
}
