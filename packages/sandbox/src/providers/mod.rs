// ABOUTME: Container runtime trait and shared types for sandbox execution backends
// ABOUTME: Defines the abstract lifecycle, exec, and log interface the session manager drives

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use thiserror::Error;

pub mod docker;

pub use docker::DockerProvider;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Container not running: {0}")]
    NotRunning(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Container API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Output stream error: {0}")]
    Stream(String),

    #[error("Exec was detached unexpectedly")]
    Detached,
}

impl RuntimeError {
    /// True when the target sandbox no longer exists or has stopped underneath us.
    pub fn is_container_gone(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::NotRunning(_))
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Container entry command. Sessions use a keep-alive no-op.
    pub command: Vec<String>,
    pub memory_mb: u64,
    pub cpu_shares: i64,
    /// Linux capabilities to add (raw-socket scanners need NET_RAW/NET_ADMIN).
    pub cap_add: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Point-in-time view of a named container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// Reference to an exec instance inside a container.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecRef {
    pub exec_id: String,
    /// Token naming the pid file the exec wrapper writes, used to kill it.
    pub token: String,
}

/// A started exec: its reference plus the combined, framed output stream.
pub struct ExecAttachment {
    pub exec: ExecRef,
    pub output: BoxStream<'static, Result<Vec<u8>>>,
}

/// Container backend driven by the session manager and command executor.
///
/// Output returned by `exec` and `logs` uses the Docker attach wire format:
/// 8-byte headers (channel id in byte 0, big-endian length in bytes 4-7)
/// followed by payload. Backends that receive pre-split output re-frame it.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the backend daemon answers.
    async fn ping(&self) -> Result<()>;

    /// Look up a container by name. `Ok(None)` when it does not exist.
    async fn inspect(&self, name: &str) -> Result<Option<ContainerSnapshot>>;

    /// Create and start a container, returning its id.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String>;

    /// Send SIGKILL. A container that is already stopped counts as success.
    async fn kill(&self, name: &str) -> Result<()>;

    /// Remove a container. A container that is already gone counts as success.
    async fn remove(&self, name: &str, force: bool) -> Result<()>;

    /// Run `command` through `sh -c` inside a running container.
    async fn exec(&self, container: &str, command: &str) -> Result<ExecAttachment>;

    /// Exit code of a finished exec; `None` while still running or unknown.
    async fn exec_exit_code(&self, exec: &ExecRef) -> Result<Option<i64>>;

    /// Kill the process tree started by `exec`.
    async fn kill_exec(&self, container: &str, exec: &ExecRef) -> Result<()>;

    /// Block until the container stops and return its exit code.
    async fn wait(&self, name: &str) -> Result<i64>;

    /// Full framed stdout/stderr log of a container.
    async fn logs(&self, name: &str) -> Result<Vec<u8>>;
}
