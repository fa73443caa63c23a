use std::process::Stdio;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// A privileged command that did not run to successful completion. `Failed`
/// keeps the full argv plus both captured streams so the operator can replay
/// the command by hand.
#[derive(Debug, Error)]
pub enum CmdError {
    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{cmd}` exited with status {status}: {stderr}")]
    Failed {
        cmd: String,
        status: i32,
        stdout: String,
        stderr: String,
    },
}

impl CmdError {
    /// Captured stderr of a failed command, empty for spawn errors.
    pub fn stderr(&self) -> &str {
        match self {
            Self::Spawn { .. } => "",
            Self::Failed { stderr, .. } => stderr,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
}

pub async fn run(argv: &[&str]) -> Result<CmdOutput, CmdError> {
    run_with_stdin(argv, None).await
}

/// Run `argv`, optionally feeding `input` to stdin, and capture both output
/// streams. Non-zero exit is an error; the child always runs to completion.
pub async fn run_with_stdin(argv: &[&str], input: Option<&str>) -> Result<CmdOutput, CmdError> {
    let cmd = argv.join(" ");
    debug!(cmd = %cmd, "exec");

    let mut command = Command::new(argv[0]);
    command
        .args(&argv[1..])
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|source| CmdError::Spawn {
        cmd: cmd.clone(),
        source,
    })?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|source| CmdError::Spawn {
                cmd: cmd.clone(),
                source,
            })?;
        // Close stdin so the child sees EOF.
        drop(stdin);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| CmdError::Spawn {
            cmd: cmd.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(CmdError::Failed {
            cmd,
            status: output.status.code().unwrap_or(-1),
            stdout,
            stderr,
        });
    }

    Ok(CmdOutput { stdout, stderr })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = run(&["echo", "hello"]).await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn pipes_stdin() {
        let out = run_with_stdin(&["cat"], Some("piped")).await.unwrap();
        assert_eq!(out.stdout, "piped");
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let err = run(&["false"]).await.unwrap_err();
        match err {
            CmdError::Failed { cmd, status, .. } => {
                assert_eq!(cmd, "false");
                assert_ne!(status, 0);
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_spawn() {
        let err = run(&["definitely-not-a-real-binary-4242"]).await.unwrap_err();
        assert!(matches!(err, CmdError::Spawn { .. }));
    }
}
