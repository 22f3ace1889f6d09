// ABOUTME: In-memory container runtime and status source for exercising sandbox logic in tests
// ABOUTME: Scripted exec responses, injectable failures, and call counters without a Docker daemon

use crate::demux::{encode_frame, Channel};
use crate::providers::{
    ContainerRuntime, ContainerSnapshot, ContainerSpec, ExecAttachment, ExecRef, Result,
    RuntimeError,
};
use crate::sinks::{RunStatus, RunStatusSource, SinkError};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Canned response for commands containing a given substring.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExec {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
    pub delay: Option<Duration>,
    /// Never finish producing output.
    pub hang: bool,
    /// Emit stdout without frame headers.
    pub raw: bool,
}

impl ScriptedExec {
    pub fn stdout(text: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: text.into(),
            ..Default::default()
        }
    }

    pub fn failing(exit_code: i64, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code,
            ..Default::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn framed(&self) -> Vec<u8> {
        if self.raw {
            return self.stdout.clone();
        }
        let mut buf = Vec::new();
        if !self.stdout.is_empty() {
            buf.extend(encode_frame(Channel::Stdout, &self.stdout));
        }
        if !self.stderr.is_empty() {
            buf.extend(encode_frame(Channel::Stderr, &self.stderr));
        }
        buf
    }
}

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    running: bool,
    command: Vec<String>,
    exit_code: Option<i64>,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    scripts: Vec<(String, ScriptedExec)>,
    exec_failures: VecDeque<RuntimeError>,
    persistent_exec_failures: Vec<(String, RuntimeError)>,
    create_failure: Option<RuntimeError>,
    start_failure: Option<RuntimeError>,
    remove_failure: Option<RuntimeError>,
    exec_codes: HashMap<String, i64>,
    execs: Vec<String>,
    created: Vec<ContainerSpec>,
    removed: Vec<String>,
    kill_execs: usize,
    next_id: usize,
}

/// Container runtime that keeps everything in memory.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Respond to any command containing `needle` with `response`.
    /// Earlier registrations win.
    pub fn script(&self, needle: &str, response: ScriptedExec) {
        self.with_state(|s| s.scripts.push((needle.to_string(), response)));
    }

    pub fn seed_container(&self, name: &str, running: bool) {
        self.with_state(|s| {
            s.next_id += 1;
            let id = format!("seeded-{}", s.next_id);
            s.containers.insert(
                name.to_string(),
                FakeContainer {
                    id,
                    running,
                    command: Vec::new(),
                    exit_code: None,
                },
            );
        });
    }

    /// Make the container vanish as if removed out of band.
    pub fn drop_container(&self, name: &str) {
        self.with_state(|s| {
            s.containers.remove(name);
        });
    }

    /// Fail the next exec call with `error`. Queued failures are consumed in order.
    pub fn fail_next_exec(&self, error: RuntimeError) {
        self.with_state(|s| s.exec_failures.push_back(error));
    }

    /// Fail every exec whose command contains `needle`.
    pub fn fail_execs_containing(&self, needle: &str, error: RuntimeError) {
        self.with_state(|s| s.persistent_exec_failures.push((needle.to_string(), error)));
    }

    pub fn fail_creates(&self, error: RuntimeError) {
        self.with_state(|s| s.create_failure = Some(error));
    }

    /// Create containers but fail to start them, leaving them stopped.
    pub fn fail_starts(&self, error: RuntimeError) {
        self.with_state(|s| s.start_failure = Some(error));
    }

    pub fn fail_removes(&self, error: RuntimeError) {
        self.with_state(|s| s.remove_failure = Some(error));
    }

    pub fn create_count(&self) -> usize {
        self.with_state(|s| s.created.len())
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.with_state(|s| s.created.clone())
    }

    pub fn removed(&self) -> Vec<String> {
        self.with_state(|s| s.removed.clone())
    }

    /// Commands passed to exec, in call order.
    pub fn execs(&self) -> Vec<String> {
        self.with_state(|s| s.execs.clone())
    }

    pub fn kill_exec_count(&self) -> usize {
        self.with_state(|s| s.kill_execs)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.with_state(|s| s.containers.contains_key(name))
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.with_state(|s| s.containers.get(name).is_some_and(|c| c.running))
    }

    fn lookup_script(state: &FakeState, command: &str) -> ScriptedExec {
        state
            .scripts
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_default()
    }

    fn ephemeral_command(container: &FakeContainer) -> String {
        container.command.last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerSnapshot>> {
        Ok(self.with_state(|s| {
            s.containers.get(name).map(|c| ContainerSnapshot {
                id: c.id.clone(),
                name: name.to_string(),
                running: c.running,
                exit_code: c.exit_code,
            })
        }))
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
        self.with_state(|s| {
            if let Some(err) = s.create_failure.clone() {
                return Err(err);
            }
            if s.containers.contains_key(&spec.name) {
                return Err(RuntimeError::Api {
                    status: 409,
                    message: format!("name {} already in use", spec.name),
                });
            }
            s.next_id += 1;
            let id = format!("fake-{}", s.next_id);
            s.containers.insert(
                spec.name.clone(),
                FakeContainer {
                    id: id.clone(),
                    running: s.start_failure.is_none(),
                    command: spec.command.clone(),
                    exit_code: None,
                },
            );
            s.created.push(spec.clone());
            match s.start_failure.clone() {
                Some(err) => Err(err),
                None => Ok(id),
            }
        })
    }

    async fn kill(&self, name: &str) -> Result<()> {
        self.with_state(|s| match s.containers.get_mut(name) {
            Some(c) => {
                c.running = false;
                c.exit_code.get_or_insert(137);
                Ok(())
            }
            None => Err(RuntimeError::NotFound(name.to_string())),
        })
    }

    async fn remove(&self, name: &str, _force: bool) -> Result<()> {
        self.with_state(|s| {
            if let Some(err) = s.remove_failure.clone() {
                return Err(err);
            }
            if s.containers.remove(name).is_some() {
                s.removed.push(name.to_string());
            }
            Ok(())
        })
    }

    async fn exec(&self, container: &str, command: &str) -> Result<ExecAttachment> {
        let response = self.with_state(|s| {
            s.execs.push(command.to_string());
            if let Some(err) = s.exec_failures.pop_front() {
                return Err(err);
            }
            if let Some((_, err)) = s
                .persistent_exec_failures
                .iter()
                .find(|(needle, _)| command.contains(needle.as_str()))
            {
                return Err(err.clone());
            }
            match s.containers.get(container) {
                None => return Err(RuntimeError::NotFound(container.to_string())),
                Some(c) if !c.running => {
                    return Err(RuntimeError::NotRunning(container.to_string()))
                }
                Some(_) => {}
            }
            let response = Self::lookup_script(s, command);
            s.next_id += 1;
            let exec_id = format!("exec-{}", s.next_id);
            if !response.hang {
                s.exec_codes.insert(exec_id.clone(), response.exit_code);
            }
            Ok((exec_id, response))
        })?;

        let (exec_id, response) = response;
        let framed = response.framed();
        let delay = response.delay;
        let first = stream::once(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(framed)
        });
        let output = if response.hang {
            first.chain(stream::pending()).boxed()
        } else {
            first.boxed()
        };

        Ok(ExecAttachment {
            exec: ExecRef {
                token: format!("tok-{}", exec_id),
                exec_id,
            },
            output,
        })
    }

    async fn exec_exit_code(&self, exec: &ExecRef) -> Result<Option<i64>> {
        Ok(self.with_state(|s| s.exec_codes.get(&exec.exec_id).copied()))
    }

    async fn kill_exec(&self, _container: &str, _exec: &ExecRef) -> Result<()> {
        self.with_state(|s| s.kill_execs += 1);
        Ok(())
    }

    async fn wait(&self, name: &str) -> Result<i64> {
        let response = self.with_state(|s| {
            s.containers
                .get(name)
                .map(|c| Self::lookup_script(s, &Self::ephemeral_command(c)))
                .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
        })?;

        if response.hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }

        self.with_state(|s| match s.containers.get_mut(name) {
            Some(c) => {
                c.running = false;
                Ok(*c.exit_code.get_or_insert(response.exit_code))
            }
            None => Err(RuntimeError::NotFound(name.to_string())),
        })
    }

    async fn logs(&self, name: &str) -> Result<Vec<u8>> {
        self.with_state(|s| {
            s.containers
                .get(name)
                .map(|c| Self::lookup_script(s, &Self::ephemeral_command(c)).framed())
                .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
        })
    }
}

/// Run status source backed by a map the test controls.
#[derive(Default)]
pub struct StaticStatusSource {
    statuses: Mutex<HashMap<String, RunStatus>>,
    pending: Mutex<HashMap<String, VecDeque<RunStatus>>>,
    fail: Mutex<bool>,
}

impl StaticStatusSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, scan_run_id: &str, status: RunStatus) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.insert(scan_run_id.to_string(), status);
        }
    }

    /// Answer the next lookups for `scan_run_id` with `statuses` in order,
    /// then keep reporting the last one.
    pub fn sequence(&self, scan_run_id: &str, statuses: impl IntoIterator<Item = RunStatus>) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(scan_run_id.to_string(), statuses.into_iter().collect());
        }
    }

    /// Make every lookup fail.
    pub fn fail_lookups(&self) {
        if let Ok(mut fail) = self.fail.lock() {
            *fail = true;
        }
    }
}

#[async_trait]
impl RunStatusSource for StaticStatusSource {
    async fn run_status(
        &self,
        scan_run_id: &str,
    ) -> std::result::Result<Option<RunStatus>, SinkError> {
        if self.fail.lock().map(|f| *f).unwrap_or(false) {
            return Err(SinkError::Lookup("status store unavailable".into()));
        }
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(queue) = pending.get_mut(scan_run_id) {
                if let Some(next) = queue.pop_front() {
                    if queue.is_empty() {
                        self.set(scan_run_id, next);
                    }
                    return Ok(Some(next));
                }
            }
        }
        Ok(self
            .statuses
            .lock()
            .ok()
            .and_then(|s| s.get(scan_run_id).copied()))
    }
}
