// ABOUTME: Error types for pipeline stages and the scheduler
// ABOUTME: Separates initialization failure, cancellation, tool execution faults, and report synthesis

use crate::model::StageKind;
use recon_sandbox::{ExecError, SessionError, SinkError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to initialize scan sandbox: {0}")]
    Initialization(#[from] SessionError),

    #[error("Invalid scan target: {0:?}")]
    InvalidTarget(String),

    #[error("Scan {0} was cancelled")]
    Cancelled(String),

    #[error("Tool execution failed: {0}")]
    Exec(ExecError),

    #[error("Stage {stage} failed: {reason}")]
    StageFailed { stage: StageKind, reason: String },

    #[error("Report synthesis failed: {0}")]
    Report(String),

    #[error("Run status store error: {0}")]
    Status(#[from] SinkError),
}

impl From<ExecError> for PipelineError {
    fn from(error: ExecError) -> Self {
        match error {
            ExecError::Cancelled(scan_run_id) => Self::Cancelled(scan_run_id),
            other => Self::Exec(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
