//! Shell and file execution, on the host or inside a named container.
//!
//! All byte-level I/O performed by tools goes through an [`Executor`]. The
//! container variant execs into an already-running container that mounts the
//! workspace at `/workspace`, translating paths between the two namespaces.

use crate::error::{Error, Result};
use anyhow::Context as _;
use base64::Engine as _;
use bollard::Docker;
use bollard::exec::{CreateExecOptions, StartExecResults};
use futures::StreamExt as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default cap on captured shell output, tail-first.
pub const TRUNCATE_MAX_LINES: usize = 2000;
pub const TRUNCATE_MAX_BYTES: usize = 50 * 1024;

/// Hard ceiling on any single shell invocation, host or container.
pub const HARD_TIMEOUT: Duration = Duration::from_secs(1800);

/// Workspace mount point inside the sandbox container.
const CONTAINER_WORKSPACE: &str = "/workspace";

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ShellResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub truncated: bool,
}

impl ShellResult {
    /// Format as a readable string for model consumption.
    pub fn format(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!("Exit code: {}\n", self.exit_code));
        if !self.stdout.is_empty() {
            output.push_str("\nSTDOUT:\n");
            output.push_str(&self.stdout);
        }
        if !self.stderr.is_empty() {
            output.push_str("\nSTDERR:\n");
            output.push_str(&self.stderr);
        }
        output
    }
}

/// Truncate output tail-first: the *last* `max_lines` lines and `max_bytes`
/// bytes are preserved. A marker line at the head reports what was dropped.
pub fn truncate_tail(text: &str, max_lines: usize, max_bytes: usize) -> (String, bool) {
    let total_bytes = text.len();
    let total_lines = text.lines().count();

    let mut kept: &str = text;

    if kept.len() > max_bytes {
        let mut start = kept.len() - max_bytes;
        while !kept.is_char_boundary(start) {
            start += 1;
        }
        kept = &kept[start..];
        // drop the partial first line left by the byte cut
        if let Some(newline) = kept.find('\n') {
            kept = &kept[newline + 1..];
        }
    }

    let kept_lines = kept.lines().count();
    if kept_lines > max_lines {
        let skip = kept_lines - max_lines;
        let mut offset = 0;
        for (i, line) in kept.split_inclusive('\n').enumerate() {
            if i == skip {
                break;
            }
            offset += line.len();
        }
        kept = &kept[offset..];
    }

    if kept.len() == total_bytes {
        return (kept.to_string(), false);
    }

    let dropped_lines = total_lines.saturating_sub(kept.lines().count());
    let dropped_bytes = total_bytes - kept.len();
    let marker = format!("[... output truncated: {dropped_lines} lines ({dropped_bytes} bytes) dropped ...]\n");
    (format!("{marker}{kept}"), true)
}

/// Executes shell commands and file I/O either directly on the host or
/// inside a named, already-running container.
pub enum Executor {
    Host(HostExecutor),
    Container(ContainerExecutor),
}

pub struct HostExecutor {
    workspace: PathBuf,
}

pub struct ContainerExecutor {
    name: String,
    docker: Docker,
    host_workspace: PathBuf,
}

impl Executor {
    pub fn host(workspace: PathBuf) -> Self {
        Self::Host(HostExecutor { workspace })
    }

    /// Connect to the Docker daemon and validate that `name` exists and is
    /// running. The workspace must already be mounted at `/workspace`.
    pub async fn container(name: &str, host_workspace: PathBuf) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|error| Error::Sandbox(format!("docker connection failed: {error}")))?;

        let info = docker
            .inspect_container(name, None)
            .await
            .map_err(|error| Error::Sandbox(format!("container '{name}' not found: {error}")))?;
        let running = info
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);
        if !running {
            return Err(Error::Sandbox(format!("container '{name}' is not running")));
        }

        Ok(Self::Container(ContainerExecutor {
            name: name.to_string(),
            docker,
            host_workspace,
        }))
    }

    /// The workspace path as seen by tools (and by the model).
    pub fn workspace_path(&self) -> &Path {
        match self {
            Self::Host(host) => &host.workspace,
            Self::Container(_) => Path::new(CONTAINER_WORKSPACE),
        }
    }

    /// The workspace path on the host filesystem.
    pub fn host_workspace(&self) -> &Path {
        match self {
            Self::Host(host) => &host.workspace,
            Self::Container(container) => &container.host_workspace,
        }
    }

    /// Translate a tool-visible path to its host equivalent, when the path
    /// lives under the workspace mount.
    pub fn to_host_path(&self, path: &Path) -> Option<PathBuf> {
        match self {
            Self::Host(_) => Some(path.to_path_buf()),
            Self::Container(container) => path
                .strip_prefix(CONTAINER_WORKSPACE)
                .ok()
                .map(|rest| container.host_workspace.join(rest)),
        }
    }

    /// Translate a host path to the tool-visible namespace.
    pub fn to_sandbox_path(&self, host_path: &Path) -> PathBuf {
        match self {
            Self::Host(_) => host_path.to_path_buf(),
            Self::Container(container) => match host_path.strip_prefix(&container.host_workspace) {
                Ok(rest) => Path::new(CONTAINER_WORKSPACE).join(rest),
                Err(_) => host_path.to_path_buf(),
            },
        }
    }

    /// Run a shell command, capped by `timeout` (and [`HARD_TIMEOUT`]).
    /// Output is tail-truncated. Cancellation kills the process.
    pub async fn run_shell(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ShellResult> {
        let timeout = timeout.min(HARD_TIMEOUT);
        match self {
            Self::Host(host) => host.run_shell(command, timeout, cancel).await,
            Self::Container(container) => container.run_shell(command, timeout, cancel).await,
        }
    }

    /// Read a file in the tool-visible namespace.
    pub async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        if let Some(host_path) = self.to_host_path(path) {
            return Ok(tokio::fs::read(&host_path)
                .await
                .with_context(|| format!("failed to read file: {}", host_path.display()))?);
        }
        // Container path outside the workspace mount (e.g. /tmp): go through
        // an exec, base64 so binary content survives the stream.
        let Self::Container(container) = self else {
            unreachable!("host paths always translate");
        };
        let result = container
            .run_shell(
                &format!("base64 < {}", shell_quote(path)),
                HARD_TIMEOUT,
                &CancellationToken::new(),
            )
            .await?;
        if result.exit_code != 0 {
            return Err(Error::Tool(format!(
                "failed to read {}: {}",
                path.display(),
                result.stderr.trim()
            )));
        }
        let cleaned: String = result.stdout.split_whitespace().collect();
        base64::engine::general_purpose::STANDARD
            .decode(cleaned)
            .map_err(|error| Error::Tool(format!("invalid file stream: {error}")))
    }

    /// Write a file in the tool-visible namespace, creating parents.
    pub async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(host_path) = self.to_host_path(path) {
            if let Some(parent) = host_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create directory: {}", parent.display()))?;
            }
            tokio::fs::write(&host_path, bytes)
                .await
                .with_context(|| format!("failed to write file: {}", host_path.display()))?;
            return Ok(());
        }
        let Self::Container(container) = self else {
            unreachable!("host paths always translate");
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        let parent = path.parent().map(shell_quote).unwrap_or_default();
        let command = format!(
            "mkdir -p {parent} && printf '%s' '{encoded}' | base64 -d > {}",
            shell_quote(path)
        );
        let result = container
            .run_shell(&command, HARD_TIMEOUT, &CancellationToken::new())
            .await?;
        if result.exit_code != 0 {
            return Err(Error::Tool(format!(
                "failed to write {}: {}",
                path.display(),
                result.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Whether a tool-visible path exists.
    pub async fn exists(&self, path: &Path) -> bool {
        if let Some(host_path) = self.to_host_path(path) {
            return tokio::fs::try_exists(&host_path).await.unwrap_or(false);
        }
        let Self::Container(container) = self else {
            return false;
        };
        container
            .run_shell(
                &format!("test -e {}", shell_quote(path)),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .map(|result| result.exit_code == 0)
            .unwrap_or(false)
    }
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

impl HostExecutor {
    async fn run_shell(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ShellResult> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn shell for: {command}"))?;

        // kill_on_drop reaps the process when either branch drops the future
        let output = tokio::select! {
            result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(error)) => return Err(Error::Tool(format!("shell failed: {error}"))),
                Err(_) => {
                    return Err(Error::Tool(format!(
                        "command timed out after {}s",
                        timeout.as_secs()
                    )));
                }
            },
            _ = cancel.cancelled() => return Err(Error::Aborted),
        };

        let (stdout, out_truncated) = truncate_tail(
            &String::from_utf8_lossy(&output.stdout),
            TRUNCATE_MAX_LINES,
            TRUNCATE_MAX_BYTES,
        );
        let (stderr, err_truncated) = truncate_tail(
            &String::from_utf8_lossy(&output.stderr),
            TRUNCATE_MAX_LINES,
            TRUNCATE_MAX_BYTES,
        );

        Ok(ShellResult {
            stdout,
            stderr,
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            truncated: out_truncated || err_truncated,
        })
    }
}

impl ContainerExecutor {
    async fn run_shell(
        &self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ShellResult> {
        let exec = self
            .docker
            .create_exec(
                &self.name,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(CONTAINER_WORKSPACE.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|error| Error::Tool(format!("container exec creation failed: {error}")))?;

        let collect = async {
            let start = self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|error| Error::Tool(format!("container exec start failed: {error}")))?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let StartExecResults::Attached { mut output, .. } = start {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.extend_from_slice(&message);
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stderr.extend_from_slice(&message);
                        }
                        Ok(_) => {}
                        Err(error) => {
                            tracing::warn!(%error, container = %self.name, "exec stream error");
                            break;
                        }
                    }
                }
            }
            Ok::<(Vec<u8>, Vec<u8>), Error>((stdout, stderr))
        };

        let (stdout, stderr) = tokio::select! {
            result = tokio::time::timeout(timeout, collect) => match result {
                Ok(Ok(streams)) => streams,
                Ok(Err(error)) => return Err(error),
                Err(_) => {
                    return Err(Error::Tool(format!(
                        "command timed out after {}s in container '{}'",
                        timeout.as_secs(),
                        self.name
                    )));
                }
            },
            _ = cancel.cancelled() => return Err(Error::Aborted),
        };

        let exit_code = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .ok()
            .and_then(|inspect| inspect.exit_code)
            .unwrap_or(-1);

        let (stdout, out_truncated) = truncate_tail(
            &String::from_utf8_lossy(&stdout),
            TRUNCATE_MAX_LINES,
            TRUNCATE_MAX_BYTES,
        );
        let (stderr, err_truncated) = truncate_tail(
            &String::from_utf8_lossy(&stderr),
            TRUNCATE_MAX_LINES,
            TRUNCATE_MAX_BYTES,
        );

        Ok(ShellResult {
            stdout,
            stderr,
            exit_code,
            truncated: out_truncated || err_truncated,
        })
    }
}
