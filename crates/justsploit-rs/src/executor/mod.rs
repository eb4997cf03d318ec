use std::{process::Stdio, time::Duration};

use tokio::{process::Command, time::timeout};
use tracing::{info, warn};

use crate::{adapters::Invocation, error::ScanError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// How a single tool invocation ended. The caller decides what counts as failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Finished(ProcessOutput),
    NonZeroExit {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    TimedOut(Duration),
    SpawnFailed(String),
}

impl ExecOutcome {
    pub fn into_result(self) -> Result<ProcessOutput, ScanError> {
        match self {
            Self::Finished(output) => Ok(output),
            Self::NonZeroExit { code, stderr, .. } => Err(ScanError::NonZeroExit { code, stderr }),
            Self::TimedOut(limit) => Err(ScanError::Execution(format!(
                "tool timed out after {}s",
                limit.as_secs_f64()
            ))),
            Self::SpawnFailed(reason) => Err(ScanError::Execution(reason)),
        }
    }
}

/// Run one process straight from its argv, no shell in between.
///
/// The child is killed when the deadline passes or when the returned future
/// is dropped before completion.
pub async fn execute(invocation: &Invocation, limit: Duration) -> ExecOutcome {
    info!(
        command = %invocation.program,
        args = ?invocation.args,
        "audit: launching external tool"
    );

    let child = match Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return ExecOutcome::SpawnFailed(format!(
                "failed to spawn {}: {e}",
                invocation.program
            ))
        }
    };

    let out = match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            return ExecOutcome::SpawnFailed(format!(
                "failed to collect output of {}: {e}",
                invocation.program
            ))
        }
        Err(_) => {
            warn!(command = %invocation.program, ?limit, "tool exceeded its timeout, killed");
            return ExecOutcome::TimedOut(limit);
        }
    };

    let stdout = String::from_utf8_lossy(&out.stdout).to_string();
    let stderr = String::from_utf8_lossy(&out.stderr).to_string();

    match out.status.code() {
        Some(0) => ExecOutcome::Finished(ProcessOutput {
            exit_code: 0,
            stdout,
            stderr,
        }),
        code => ExecOutcome::NonZeroExit {
            code,
            stdout,
            stderr,
        },
    }
}
