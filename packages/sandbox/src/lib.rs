// ABOUTME: Container execution layer for the recon engine
// ABOUTME: Per-scan sandbox sessions, tool execution with timeouts, output demux, and session recovery

pub mod demux;
pub mod executor;
pub mod providers;
pub mod recovery;
pub mod session;
pub mod sinks;
pub mod timeouts;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use demux::{demultiplex, encode_frame, Channel, Demuxed};
pub use executor::{
    truncate_for_log, typed_parser, CommandExecutor, ExecError, OutputParser,
    ToolExecutionResult, ToolInvocation, ToolRunner,
};
pub use providers::{
    ContainerRuntime, ContainerSnapshot, ContainerSpec, DockerProvider, ExecAttachment, ExecRef,
    RuntimeError,
};
pub use recovery::RecoveringExecutor;
pub use session::{ContainerSession, SessionConfig, SessionError, SessionManager, SessionState};
pub use sinks::{
    write_log, JsonlLogSink, LogLevel, LogRecord, MemoryLogSink, RunStatus, RunStatusSource,
    ScanLogSink, SinkError, TracingLogSink,
};
pub use timeouts::ToolTimeouts;
