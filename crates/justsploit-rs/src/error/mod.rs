use thiserror::Error;

use crate::models::TaskId;

/// Failure taxonomy shared by the builder, executor, normalizers and dispatcher.
///
/// Only `InvalidInput` and `NotFound` ever reach a caller synchronously; the
/// worker turns the rest into a FAILED record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("tool exited with {}: {stderr}", exit_label(.code))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("task not found: {0}")]
    NotFound(TaskId),
}

impl ScanError {
    /// Message stored on a FAILED record.
    ///
    /// A tool that failed with something on stderr reports stderr verbatim.
    pub fn record_message(&self) -> String {
        match self {
            Self::NonZeroExit { stderr, .. } if !stderr.trim().is_empty() => stderr.clone(),
            other => other.to_string(),
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (killed by signal)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::ScanError;

    #[test]
    fn non_zero_exit_prefers_stderr_for_records() {
        let err = ScanError::NonZeroExit {
            code: Some(1),
            stderr: "Failed to resolve \"nowhere\".\n".to_string(),
        };
        assert_eq!(err.record_message(), "Failed to resolve \"nowhere\".\n");
    }

    #[test]
    fn non_zero_exit_without_stderr_names_the_code() {
        let err = ScanError::NonZeroExit {
            code: Some(2),
            stderr: "  ".to_string(),
        };
        assert_eq!(err.record_message(), "tool exited with exit code 2:   ");

        let killed = ScanError::NonZeroExit {
            code: None,
            stderr: String::new(),
        };
        assert!(killed.record_message().contains("killed by signal"));
    }
}
