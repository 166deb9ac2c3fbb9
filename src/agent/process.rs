//! Shell command execution for the `sh` operator

use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or 128 + signal for a signal-terminated process
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("failed reading {stream}: {source}")]
    Read {
        stream: &'static str,
        source: std::io::Error,
    },

    #[error("failed waiting for process: {0}")]
    Wait(#[source] std::io::Error),
}

fn code_from_parts(code: Option<i32>, signal: Option<i32>) -> Option<i32> {
    code.or_else(|| signal.map(|s| 128 + s))
}

fn exit_code(status: &std::process::ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    let signal = status.signal();
    #[cfg(not(unix))]
    let signal = None;
    code_from_parts(status.code(), signal)
}

/// Run `command` with `sh -c`, capturing both streams
pub async fn run_shell(command: &str, cwd: Option<&Path>) -> Result<ProcessOutput, ProcessError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        command: command.to_string(),
        source,
    })?;
    collect_output(&mut child).await
}

/// Read stdout and stderr concurrently so neither pipe fills up, then reap
async fn collect_output(child: &mut Child) -> Result<ProcessOutput, ProcessError> {
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let read_stdout = async move {
        let mut buf = String::new();
        if let Some(mut pipe) = stdout_pipe {
            pipe.read_to_string(&mut buf)
                .await
                .map_err(|source| ProcessError::Read {
                    stream: "stdout",
                    source,
                })?;
        }
        Ok::<_, ProcessError>(buf)
    };
    let read_stderr = async move {
        let mut buf = String::new();
        if let Some(mut pipe) = stderr_pipe {
            pipe.read_to_string(&mut buf)
                .await
                .map_err(|source| ProcessError::Read {
                    stream: "stderr",
                    source,
                })?;
        }
        Ok::<_, ProcessError>(buf)
    };

    let (stdout, stderr) = match tokio::try_join!(read_stdout, read_stderr) {
        Ok(streams) => streams,
        Err(e) => {
            let _ = child.kill().await;
            return Err(e);
        }
    };
    let status = child.wait().await.map_err(ProcessError::Wait)?;

    Ok(ProcessOutput {
        stdout,
        stderr,
        exit_code: exit_code(&status),
    })
}
