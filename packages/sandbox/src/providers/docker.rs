// ABOUTME: Docker runtime implementation for privileged scanner sandboxes
// ABOUTME: Uses bollard to manage session containers, framed exec streams, and exec kills

use super::{
    ContainerRuntime, ContainerSnapshot, ContainerSpec, ExecAttachment, ExecRef, Result,
    RuntimeError,
};
use crate::demux::{encode_frame, Channel};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
    },
    errors::Error as DockerError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::HostConfig,
    Docker,
};
use futures::StreamExt;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Directory inside the sandbox where exec wrappers record their pid.
const EXEC_PID_DIR: &str = "/tmp/.recon-exec";

/// Inspects of a finished exec before its exit code is reported unknown.
const EXIT_CODE_ATTEMPTS: u32 = 5;
const EXIT_CODE_BACKOFF: Duration = Duration::from_millis(50);

pub struct DockerProvider {
    client: Docker,
    /// Images already verified or pulled during this process lifetime
    pulled: RwLock<HashSet<String>>,
    pull_timeout: Duration,
}

impl DockerProvider {
    /// Connect to the local daemon with a 10 minute image pull timeout
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::Connection(e.to_string()))?;
        Ok(Self::with_client(client, Duration::from_secs(600)))
    }

    pub fn with_client(client: Docker, pull_timeout: Duration) -> Self {
        Self {
            client,
            pulled: RwLock::new(HashSet::new()),
            pull_timeout,
        }
    }

    fn to_bollard_config(spec: &ContainerSpec) -> Config<String> {
        let host_config = HostConfig {
            memory: Some((spec.memory_mb * 1024 * 1024) as i64),
            cpu_shares: Some(spec.cpu_shares),
            cap_add: Some(spec.cap_add.clone()),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.pulled.read().await.contains(image) {
            return Ok(());
        }

        match self.client.inspect_image(image).await {
            Ok(_) => {}
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => self.pull_image(image).await?,
            Err(e) => return Err(RuntimeError::Image(e.to_string())),
        }

        self.pulled.write().await.insert(image.to_string());
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let pulled = tokio::time::timeout(self.pull_timeout, async {
            while let Some(progress) = stream.next().await {
                let info = progress
                    .map_err(|e| RuntimeError::Image(format!("Failed to pull {}: {}", image, e)))?;
                if let Some(error) = info.error {
                    return Err(RuntimeError::Image(format!(
                        "Failed to pull {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = info.status {
                    debug!("Pull status: {}", status);
                }
            }
            Ok(())
        })
        .await;

        match pulled {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Image(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn run_control_exec(&self, container: &str, script: String) -> Result<()> {
        let options = CreateExecOptions {
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), script]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .client
            .create_exec(container, options)
            .await
            .map_err(|e| map_error(container, e))?;

        if let StartExecResults::Attached { mut output, .. } = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| map_error(container, e))?
        {
            while output.next().await.is_some() {}
        }
        Ok(())
    }
}

/// Translate daemon errors into the runtime's vocabulary.
fn map_error(container: &str, error: DockerError) -> RuntimeError {
    match error {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(container.to_string()),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => {
            let lower = message.to_lowercase();
            if lower.contains("no such container") {
                RuntimeError::NotFound(container.to_string())
            } else if lower.contains("is not running") {
                RuntimeError::NotRunning(container.to_string())
            } else {
                RuntimeError::Api {
                    status: status_code,
                    message,
                }
            }
        }
        other => RuntimeError::Connection(other.to_string()),
    }
}

/// Start a freshly created container. When start fails the container is
/// force-removed so no half-built sandbox is left behind.
async fn start_or_discard<S, D>(name: &str, start: S, discard: D) -> Result<()>
where
    S: Future<Output = Result<()>>,
    D: Future<Output = Result<()>>,
{
    let Err(error) = start.await else {
        return Ok(());
    };
    warn!("Failed to start container {}: {}, removing it", name, error);
    if let Err(e) = discard.await {
        warn!("Failed to remove unstarted container {}: {}", name, e);
    }
    Err(error)
}

/// Read an exec's exit code, re-inspecting with a growing back-off while the
/// daemon still reports it running after its output stream closed.
async fn settle_exit_code<F, Fut>(mut inspect: F) -> Result<Option<i64>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(bool, Option<i64>)>>,
{
    for attempt in 1..=EXIT_CODE_ATTEMPTS {
        let (running, exit_code) = inspect().await?;
        if !running {
            return Ok(exit_code);
        }
        if attempt < EXIT_CODE_ATTEMPTS {
            tokio::time::sleep(EXIT_CODE_BACKOFF * attempt).await;
        }
    }
    debug!("Exec still running after {} inspects", EXIT_CODE_ATTEMPTS);
    Ok(None)
}

/// Re-encode a demultiplexed chunk in the attach wire format.
fn reframe(output: LogOutput) -> Vec<u8> {
    match output {
        LogOutput::StdOut { message } => encode_frame(Channel::Stdout, &message),
        LogOutput::StdErr { message } => encode_frame(Channel::Stderr, &message),
        LogOutput::StdIn { message } => encode_frame(Channel::Stdin, &message),
        LogOutput::Console { message } => message.to_vec(),
    }
}

fn pid_file(token: &str) -> String {
    format!("{}/{}.pid", EXEC_PID_DIR, token)
}

/// Wrap `command` so its shell records a pid the exec can later be killed by.
fn wrap_command(token: &str, command: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "mkdir -p {dir} && echo $$ > {pid} && exec sh -c \"$0\"",
            dir = EXEC_PID_DIR,
            pid = pid_file(token)
        ),
        command.to_string(),
    ]
}

fn kill_script(token: &str) -> String {
    let pid = pid_file(token);
    format!(
        "p=$(cat {pid} 2>/dev/null) && {{ pkill -9 -P \"$p\"; kill -9 -- -\"$p\" 2>/dev/null || kill -9 \"$p\"; }}; rm -f {pid}",
        pid = pid
    )
}

#[async_trait]
impl ContainerRuntime for DockerProvider {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Connection(e.to_string()))
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerSnapshot>> {
        match self.client.inspect_container(name, None).await {
            Ok(inspect) => {
                let state = inspect.state.unwrap_or_default();
                Ok(Some(ContainerSnapshot {
                    id: inspect.id.unwrap_or_else(|| name.to_string()),
                    name: name.to_string(),
                    running: state.running.unwrap_or(false),
                    exit_code: state.exit_code,
                }))
            }
            Err(e) => match map_error(name, e) {
                RuntimeError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
        self.ensure_image(&spec.image).await?;

        info!("Creating container: {}", spec.name);
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), Self::to_bollard_config(spec))
            .await
            .map_err(|e| map_error(&spec.name, e))?;

        let start = async {
            self.client
                .start_container(&container.id, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| map_error(&spec.name, e))
        };
        start_or_discard(&spec.name, start, self.remove(&container.id, true)).await?;

        debug!("Started container {} ({})", spec.name, container.id);
        Ok(container.id)
    }

    async fn kill(&self, name: &str) -> Result<()> {
        let options = KillContainerOptions { signal: "SIGKILL" };
        match self.client.kill_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => match map_error(name, e) {
                RuntimeError::NotRunning(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        match self.client.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) => match map_error(name, e) {
                RuntimeError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn exec(&self, container: &str, command: &str) -> Result<ExecAttachment> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let options = CreateExecOptions {
            cmd: Some(wrap_command(&token, command)),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container, options)
            .await
            .map_err(|e| map_error(container, e))?;

        let started = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| map_error(container, e))?;

        let StartExecResults::Attached { output, .. } = started else {
            return Err(RuntimeError::Detached);
        };

        let container = container.to_string();
        let output = output
            .map(move |item| {
                item.map(reframe)
                    .map_err(|e| match map_error(&container, e) {
                        RuntimeError::Connection(msg) => RuntimeError::Stream(msg),
                        other => other,
                    })
            })
            .boxed();

        Ok(ExecAttachment {
            exec: ExecRef {
                exec_id: exec.id,
                token,
            },
            output,
        })
    }

    async fn exec_exit_code(&self, exec: &ExecRef) -> Result<Option<i64>> {
        let client = &self.client;
        settle_exit_code(|| async move {
            let inspect = client
                .inspect_exec(&exec.exec_id)
                .await
                .map_err(|e| map_error(&exec.exec_id, e))?;
            Ok((inspect.running.unwrap_or(false), inspect.exit_code))
        })
        .await
    }

    async fn kill_exec(&self, container: &str, exec: &ExecRef) -> Result<()> {
        warn!("Killing exec {} in {}", exec.exec_id, container);
        self.run_control_exec(container, kill_script(&exec.token))
            .await
    }

    async fn wait(&self, name: &str) -> Result<i64> {
        let mut stream = self
            .client
            .wait_container(name, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(map_error(name, e)),
            None => Err(RuntimeError::Stream(format!(
                "Wait stream for {} ended without a status",
                name
            ))),
        }
    }

    async fn logs(&self, name: &str) -> Result<Vec<u8>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.client.logs(name, Some(options));
        let mut buffer = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_error(name, e))?;
            buffer.extend(reframe(chunk));
        }
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::demultiplex;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn server_error(status_code: u16, message: &str) -> DockerError {
        DockerError::DockerResponseServerError {
            status_code,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_map_error_classifies_container_loss() {
        assert_eq!(
            map_error("c", server_error(404, "No such container: c")),
            RuntimeError::NotFound("c".into())
        );
        assert_eq!(
            map_error("c", server_error(409, "Container abc is not running")),
            RuntimeError::NotRunning("c".into())
        );
        assert_eq!(
            map_error("c", server_error(500, "driver failed")),
            RuntimeError::Api {
                status: 500,
                message: "driver failed".into()
            }
        );
    }

    #[test]
    fn test_reframed_output_demultiplexes() {
        let mut buf = reframe(LogOutput::StdOut {
            message: Bytes::from_static(b"open\n"),
        });
        buf.extend(reframe(LogOutput::StdErr {
            message: Bytes::from_static(b"warn\n"),
        }));

        let out = demultiplex(&buf);

        assert_eq!(out.stdout, b"open\n".to_vec());
        assert_eq!(out.stderr, b"warn\n".to_vec());
    }

    #[tokio::test]
    async fn test_failed_start_removes_created_container() {
        let removed = AtomicBool::new(false);

        let result = start_or_discard(
            "recon-scan-1",
            async {
                Err(RuntimeError::Api {
                    status: 500,
                    message: "cannot start".into(),
                })
            },
            async {
                removed.store(true, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert!(matches!(result, Err(RuntimeError::Api { status: 500, .. })));
        assert!(removed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_successful_start_keeps_container() {
        let removed = AtomicBool::new(false);

        start_or_discard("recon-scan-1", async { Ok(()) }, async {
            removed.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

        assert!(!removed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_code_waits_for_exec_to_settle() {
        let inspects = AtomicU32::new(0);

        let code = settle_exit_code(|| {
            let seen = inspects.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok((seen < 3, Some(0))) }
        })
        .await
        .unwrap();

        assert_eq!(code, Some(0));
        assert_eq!(inspects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_code_unknown_when_exec_never_settles() {
        let inspects = AtomicU32::new(0);

        let code = settle_exit_code(|| {
            inspects.fetch_add(1, Ordering::SeqCst);
            async { Ok((true, None)) }
        })
        .await
        .unwrap();

        assert_eq!(code, None);
        assert_eq!(inspects.load(Ordering::SeqCst), EXIT_CODE_ATTEMPTS);
    }

    #[test]
    fn test_wrap_command_records_pid_and_passes_command_as_arg() {
        let argv = wrap_command("tok1", "nmap -p 80 'example.com'");

        assert_eq!(argv.len(), 4);
        assert!(argv[2].contains("/tmp/.recon-exec/tok1.pid"));
        assert_eq!(argv[3], "nmap -p 80 'example.com'");
        assert!(kill_script("tok1").contains("kill -9"));
    }

    #[test]
    fn test_bollard_config_carries_limits_and_capabilities() {
        let spec = ContainerSpec {
            name: "recon-scan-1".into(),
            image: "recon-tools:latest".into(),
            command: vec!["tail".into(), "-f".into(), "/dev/null".into()],
            memory_mb: 512,
            cpu_shares: 256,
            cap_add: vec!["NET_ADMIN".into(), "NET_RAW".into()],
            labels: HashMap::from([("recon.managed".into(), "true".into())]),
        };

        let config = DockerProvider::to_bollard_config(&spec);
        let host = config.host_config.unwrap();

        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.cpu_shares, Some(256));
        assert_eq!(host.cap_add, Some(vec!["NET_ADMIN".into(), "NET_RAW".into()]));
        assert_eq!(config.cmd.unwrap()[0], "tail");
    }

    #[tokio::test]
    #[ignore = "requires a running Docker daemon"]
    async fn test_exec_round_trip_against_docker() {
        let provider = DockerProvider::new().unwrap();
        let spec = ContainerSpec {
            name: format!("recon-test-{}", uuid::Uuid::new_v4().simple()),
            image: "alpine:latest".into(),
            command: vec!["tail".into(), "-f".into(), "/dev/null".into()],
            memory_mb: 128,
            cpu_shares: 256,
            cap_add: vec![],
            labels: HashMap::new(),
        };
        provider.create_and_start(&spec).await.unwrap();

        let attachment = provider
            .exec(&spec.name, "echo out; echo err >&2; exit 3")
            .await
            .unwrap();
        let chunks: Vec<_> = attachment.output.collect().await;
        let buf: Vec<u8> = chunks.into_iter().flat_map(|c| c.unwrap()).collect();
        let code = provider.exec_exit_code(&attachment.exec).await.unwrap();

        provider.kill(&spec.name).await.unwrap();
        provider.remove(&spec.name, true).await.unwrap();

        let out = demultiplex(&buf);
        assert_eq!(out.stdout, b"out\n".to_vec());
        assert_eq!(out.stderr, b"err\n".to_vec());
        assert_eq!(code, Some(3));
        assert!(provider.inspect(&spec.name).await.unwrap().is_none());
    }
}
