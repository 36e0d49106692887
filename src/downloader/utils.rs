// Helper functions for backend implementations

use std::path::Path;
use std::process::{Command as StdCommand, Stdio};

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;
use tokio::time::{timeout, Duration as TokioDuration};
use tracing::debug;

/// Failure to run an external tool to completion
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read output of {program}: {reason}")]
    Output { program: String, reason: String },

    #[error("{program} timed out after {secs}s")]
    TimedOut { program: String, secs: u64 },
}

/// Run command with timeout (shared utility).
///
/// The child is killed when the timeout expires; stdout and stderr are
/// drained concurrently so a chatty process never blocks on a full pipe.
pub async fn run_output_with_timeout(
    program: &str,
    args: &[String],
    timeout_secs: u64,
) -> Result<std::process::Output, CommandError> {
    debug!(program, args = ?args, "spawning");

    let output_err = |reason: String| CommandError::Output {
        program: program.to_string(),
        reason,
    };

    let mut child = TokioCommand::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| output_err("stdout not captured".to_string()))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| output_err("stderr not captured".to_string()))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr_pipe.read_to_end(&mut buf).await.map(|_| buf)
    });

    let waited = timeout(TokioDuration::from_secs(timeout_secs), child.wait()).await;
    match waited {
        Ok(status_res) => {
            let status = status_res.map_err(|e| output_err(e.to_string()))?;
            let stdout = stdout_task
                .await
                .map_err(|e| output_err(e.to_string()))?
                .map_err(|e| output_err(e.to_string()))?;
            let stderr = stderr_task
                .await
                .map_err(|e| output_err(e.to_string()))?
                .map_err(|e| output_err(e.to_string()))?;
            Ok(std::process::Output { status, stdout, stderr })
        }
        Err(_) => {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            Err(CommandError::TimedOut {
                program: program.to_string(),
                secs: timeout_secs,
            })
        }
    }
}

/// Find an executable in common install paths, then via `which`.
pub fn find_executable(name: &str) -> Option<String> {
    let common_dirs = ["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin"];

    for dir in common_dirs {
        let candidate = Path::new(dir).join(name);
        if candidate.is_file() {
            return Some(candidate.to_string_lossy().into_owned());
        }
    }

    let output = StdCommand::new("which").arg(name).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8(output.stdout).ok()?;
    let trimmed = path.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
