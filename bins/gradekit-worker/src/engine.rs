//! Execution Engine - Sandboxed Runners
//!
//! **Core Responsibility:**
//! Execute a [`Job`] and capture its combined stdout/stderr as one text blob.
//!
//! **Critical Architectural Boundary:**
//! - Engine knows HOW to execute (local process, Docker container)
//! - Engine does NOT know about score records or secrets
//! - Engine returns raw output for the score extractor
//!
//! **Failure shape:**
//! A failed run still hands back whatever output it produced. Callers decide
//! whether partial output is worth extracting; see [`RunError::output`].

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use gradekit_common::config::{Config as AppConfig, RunnerKind};
use gradekit_common::types::Job;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Where the run directory is mounted inside containers
pub const CONTAINER_MOUNT: &str = "/gradekit";

/// Grace period for output readers after the process has been killed
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Why a run stopped before the executed code exited on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Deadline,
    Cancelled,
}

impl Interrupt {
    fn into_error(self, deadline: Duration, output: String) -> RunError {
        match self {
            Interrupt::Deadline => RunError::Timeout { deadline, output },
            Interrupt::Cancelled => RunError::Cancelled { output },
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("execution exceeded deadline of {deadline:?}")]
    Timeout { deadline: Duration, output: String },
    #[error("execution exited with status {code}")]
    ExitStatus { code: i64, output: String },
    #[error("execution cancelled")]
    Cancelled { output: String },
    #[error("failed to start execution: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),
}

impl RunError {
    /// Output produced before the failure, if any
    pub fn output(&self) -> Option<&str> {
        match self {
            RunError::Timeout { output, .. }
            | RunError::ExitStatus { output, .. }
            | RunError::Cancelled { output } => Some(output),
            RunError::Spawn(_) | RunError::Docker(_) => None,
        }
    }

    /// True when the failure left nothing worth extracting
    pub fn is_without_output(&self) -> bool {
        self.output().map_or(true, |out| out.trim().is_empty())
    }
}

/// Execution capability
///
/// Any implementation must guarantee:
/// 1. Only `job.work_dir` is shared with the executed code
/// 2. `job.deadline` and the cancellation token are honored
/// 3. Output captured up to a failure is returned inside the error
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, job: &Job, cancel: &CancellationToken) -> Result<String, RunError>;

    /// Path at which `work_dir` is visible to the executed code
    fn sandbox_root(&self, work_dir: &Path) -> PathBuf;
}

/// Select the runner backend from configuration
pub fn from_config(config: &AppConfig) -> anyhow::Result<Arc<dyn Runner>> {
    Ok(match config.runner {
        RunnerKind::Local => Arc::new(LocalRunner::new(config.max_output_bytes)),
        RunnerKind::Docker => Arc::new(DockerRunner::new(config)?),
    })
}

/// Direct child-process runner
///
/// Runs `sh -c` on the host with a cleared environment and the run directory
/// as working directory. The script leads its own process group, and the
/// whole group is killed once the run is over. No isolation beyond that;
/// meant for development and tests.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    max_output: usize,
}

impl LocalRunner {
    pub fn new(max_output: usize) -> Self {
        Self { max_output }
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new(AppConfig::default().max_output_bytes)
    }
}

#[async_trait]
impl Runner for LocalRunner {
    async fn run(&self, job: &Job, cancel: &CancellationToken) -> Result<String, RunError> {
        let mut cmd = Command::new("sh");
        // fold stderr into stdout for the whole script
        cmd.arg("-c")
            .arg(format!("exec 2>&1\n{}", job.exec.to_shell()))
            .current_dir(&job.work_dir)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .envs(job.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        // the group id equals the leader's pid; read it before wait() reaps the child
        let group = child.id();
        let buffer = Arc::new(Mutex::new(OutputBuffer::new(self.max_output)));
        let readers = [
            tokio::spawn(read_into(child.stdout.take(), buffer.clone())),
            tokio::spawn(read_into(child.stderr.take(), buffer.clone())),
        ];

        let deadline = Instant::now() + job.deadline;
        let outcome = tokio::select! {
            status = child.wait() => Ok(status),
            _ = tokio::time::sleep_until(deadline) => Err(Interrupt::Deadline),
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        };

        // background processes must not outlive the run, whatever the outcome
        kill_process_group(group);
        if outcome.is_err() {
            // kill errors only mean the child already exited
            let _ = child.kill().await;
        }
        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(DRAIN_GRACE, reader).await.is_err() {
                abort.abort();
            }
        }
        let output = take_output(&buffer);

        match outcome {
            Ok(Ok(status)) if status.success() => Ok(output),
            Ok(Ok(status)) => Err(RunError::ExitStatus {
                code: status.code().map_or(-1, i64::from),
                output,
            }),
            Ok(Err(err)) => Err(RunError::Spawn(err)),
            Err(interrupt) => Err(interrupt.into_error(job.deadline, output)),
        }
    }

    fn sandbox_root(&self, work_dir: &Path) -> PathBuf {
        work_dir.to_path_buf()
    }
}

/// SIGKILL every process in the group led by `group`
fn kill_process_group(group: Option<u32>) {
    let Some(pgid) = group.and_then(|id| libc::pid_t::try_from(id).ok()) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers; ESRCH only means the group is already gone
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

/// Captured output with an upper bound. Bytes past the limit are counted
/// and reported, not kept.
#[derive(Debug)]
struct OutputBuffer {
    bytes: Vec<u8>,
    limit: usize,
    discarded: usize,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            discarded: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let keep = self.limit.saturating_sub(self.bytes.len()).min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..keep]);
        self.discarded += chunk.len() - keep;
    }

    fn into_string(self) -> String {
        let mut out = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.discarded > 0 {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&format!(
                "[output truncated: {} bytes discarded]\n",
                self.discarded
            ));
        }
        out
    }
}

async fn read_into<R: AsyncRead + Unpin>(handle: Option<R>, buffer: Arc<Mutex<OutputBuffer>>) {
    let Some(mut handle) = handle else { return };
    let mut chunk = [0u8; 8192];
    loop {
        match handle.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buf) = buffer.lock() {
                    buf.push(&chunk[..n]);
                }
            }
        }
    }
}

fn take_output(buffer: &Mutex<OutputBuffer>) -> String {
    buffer
        .lock()
        .map(|mut buf| std::mem::replace(&mut *buf, OutputBuffer::new(0)).into_string())
        .unwrap_or_default()
}

/// Docker-based runner for production
///
/// **Docker Execution Rules:**
/// 1. Pulls the job image if not present; pull and creation count against
///    the job deadline and stop on cancellation
/// 2. Bind-mounts the run directory at [`CONTAINER_MOUNT`] and nothing else
/// 3. Network disabled unless configured, CPU/memory limits enforced
/// 4. Streams combined stdout/stderr until exit, deadline or cancellation
/// 5. Removes the container on every path
pub struct DockerRunner {
    docker: Docker,
    memory_limit: i64,
    nano_cpus: i64,
    network: bool,
    max_output: usize,
}

impl DockerRunner {
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            memory_limit: (config.memory_limit_mb as i64) * 1024 * 1024,
            nano_cpus: (config.cpu_limit * 1_000_000_000.0) as i64,
            network: config.sandbox_network,
            max_output: config.max_output_bytes,
        })
    }

    /// Ensure the image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<(), RunError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        tracing::info!(image, "Pulling image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    fn container_config(&self, job: &Job) -> Config<String> {
        let env = job.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let bind = format!("{}:{}", job.work_dir.display(), CONTAINER_MOUNT);
        Config {
            image: Some(job.image.clone()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                job.exec.to_shell(),
            ]),
            env: Some(env),
            working_dir: Some(CONTAINER_MOUNT.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(!self.network),
            host_config: Some(HostConfig {
                binds: Some(vec![bind]),
                memory: Some(self.memory_limit),
                nano_cpus: Some(self.nano_cpus),
                network_mode: (!self.network).then(|| "none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn run_container(
        &self,
        id: &str,
        job: &Job,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<String, RunError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;

        let mut output = OutputBuffer::new(self.max_output);
        let collect = async {
            let options = Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            });
            let mut logs = Box::pin(self.docker.logs(id, options));
            while let Some(chunk) = logs.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => {
                        output.push(&message);
                    }
                    Ok(LogOutput::StdIn { .. }) => {}
                    Err(_) => break,
                }
            }
        };

        let interrupted = tokio::select! {
            _ = collect => None,
            _ = tokio::time::sleep_until(deadline) => Some(Interrupt::Deadline),
            _ = cancel.cancelled() => Some(Interrupt::Cancelled),
        };
        let output = output.into_string();

        if let Some(interrupt) = interrupted {
            let _ = self
                .docker
                .kill_container(id, None::<KillContainerOptions<String>>)
                .await;
            return Err(interrupt.into_error(job.deadline, output));
        }

        let options = Some(WaitContainerOptions {
            condition: "not-running",
        });
        let mut wait = Box::pin(self.docker.wait_container(id, options));
        let code = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(err)) => return Err(err.into()),
            None => 0,
        };
        if code != 0 {
            return Err(RunError::ExitStatus { code, output });
        }
        Ok(output)
    }
}

#[async_trait]
impl Runner for DockerRunner {
    async fn run(&self, job: &Job, cancel: &CancellationToken) -> Result<String, RunError> {
        let deadline = Instant::now() + job.deadline;
        let name = format!("gradekit-{}", uuid::Uuid::new_v4());

        let result: Result<String, RunError> = async {
            until_interrupted(self.ensure_image(&job.image), job.deadline, deadline, cancel)
                .await?;

            let options = CreateContainerOptions {
                name: name.as_str(),
                platform: None,
            };
            let create = async {
                self.docker
                    .create_container(Some(options), self.container_config(job))
                    .await
                    .map_err(RunError::from)
            };
            let container = until_interrupted(create, job.deadline, deadline, cancel).await?;

            tracing::debug!(container = %name, image = %job.image, "Container created");
            self.run_container(&container.id, job, deadline, cancel).await
        }
        .await;

        // by name: an interrupted create may still have produced a container
        let remove = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(&name, Some(remove)).await {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(err) => {
                tracing::warn!(container = %name, error = %err, "Failed to remove container");
            }
        }
        result
    }

    fn sandbox_root(&self, _work_dir: &Path) -> PathBuf {
        PathBuf::from(CONTAINER_MOUNT)
    }
}

/// Race a setup step against the run deadline and the cancellation token
async fn until_interrupted<T, F>(
    step: F,
    budget: Duration,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<T, RunError>
where
    F: Future<Output = Result<T, RunError>>,
{
    let interrupt = tokio::select! {
        result = step => return result,
        _ = tokio::time::sleep_until(deadline) => Interrupt::Deadline,
        _ = cancel.cancelled() => Interrupt::Cancelled,
    };
    Err(interrupt.into_error(budget, String::new()))
}
