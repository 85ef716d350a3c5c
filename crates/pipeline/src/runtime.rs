//! The container runtime contract and the local process implementation.

use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// A bind mount handed to the runtime.
#[derive(Clone, Debug)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub container_path: String,
    pub readonly: bool,
}

/// One transform invocation.
#[derive(Clone, Debug)]
pub struct RunSpec {
    pub image: String,
    /// Argv; `cmd[0]` is the executable.
    pub cmd: Vec<String>,
    /// Lines fed to stdin.
    pub stdin: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<MountSpec>,
    /// Wall-clock budget; `None` is unlimited.
    pub timeout: Option<Duration>,
}

/// Outcome of a completed (possibly failed) transform run.
///
/// `Err` from `run` means the runtime itself could not execute the
/// transform: an infrastructure failure, not a user failure.
#[derive(Clone, Debug)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Launches user transforms against a mounted input tree.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn run(&self, spec: RunSpec) -> PipelineResult<RunResult>;
}

/// Runs transforms as local child processes.
///
/// Bind mounts are approximated by rewriting every occurrence of a mount's
/// container path in argv, stdin, and env values to the host path; the
/// `image` is ignored. Suitable for single-node deployments and tests; a
/// real cluster swaps in a runtime that talks to its container engine.
#[derive(Default)]
pub struct LocalRunner;

impl LocalRunner {
    pub fn new() -> Self {
        Self
    }

    fn rewrite(mounts: &[MountSpec], text: &str) -> String {
        let mut out = text.to_string();
        for mount in mounts {
            out = out.replace(
                &mount.container_path,
                &mount.host_path.to_string_lossy(),
            );
        }
        out
    }
}

#[async_trait]
impl ContainerRuntime for LocalRunner {
    async fn run(&self, spec: RunSpec) -> PipelineResult<RunResult> {
        if spec.cmd.is_empty() {
            return Err(PipelineError::Precondition(
                "transform cmd is empty".to_string(),
            ));
        }
        let argv: Vec<String> = spec
            .cmd
            .iter()
            .map(|arg| Self::rewrite(&spec.mounts, arg))
            .collect();

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, Self::rewrite(&spec.mounts, value));
        }

        let mut child = command.spawn().map_err(|e| {
            PipelineError::Transform(format!("failed to spawn {:?}: {e}", argv[0]))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let lines = spec
                .stdin
                .iter()
                .map(|line| Self::rewrite(&spec.mounts, line))
                .collect::<Vec<_>>()
                .join("\n");
            if !lines.is_empty() {
                stdin.write_all(lines.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
            }
            drop(stdin);
        }

        let wait = child.wait_with_output();
        let output = match spec.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(output) => output?,
                Err(_) => {
                    return Ok(RunResult {
                        exit_code: -1,
                        stdout: String::new(),
                        stderr: format!("timed out after {timeout:?}"),
                        timed_out: true,
                    });
                }
            },
            None => wait.await?,
        };

        Ok(RunResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
        })
    }
}
