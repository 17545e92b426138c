//! Typed failures raised by the orchestration engine.
//!
//! Workflows propagate `anyhow::Error` and attach context as they go. The variants below are
//! raised where the caller needs to tell failure classes apart (exit code, rollback policy,
//! remediation hint), and are recovered with [`DeployError::find`].

use thiserror::Error;

use crate::validation::ValidationCategory;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Ambiguous {kind}: {candidates} candidates found and no selection was made")]
    AmbiguousResource { kind: String, candidates: usize },

    #[error("Validation failed in {category} phase: {}", .errors.join("; "))]
    ValidationPhase {
        category: ValidationCategory,
        errors: Vec<String>,
    },

    #[error("Remote {kind} '{name}' already exists and no disposition was chosen")]
    ResourceConflict { kind: String, name: String },

    #[error("Command `{command}` {}", describe_exit(.exit_code, .timed_out))]
    CommandExecution {
        command: String,
        exit_code: Option<i32>,
        timed_out: bool,
        output: String,
    },

    #[error("Binding '{binding}' does not match remote state: {reason}")]
    BindingMismatch { binding: String, reason: String },

    #[error("Cancelled by operator: {0}")]
    UserCancelled(String),
}

fn describe_exit(exit_code: &Option<i32>, timed_out: &bool) -> String {
    match (*timed_out, *exit_code) {
        (true, _) => "timed out".to_string(),
        (false, Some(code)) => format!("exited with status {code}"),
        (false, None) => "was terminated by a signal".to_string(),
    }
}

impl DeployError {
    /// Find a typed failure anywhere in an `anyhow` error chain.
    pub fn find(err: &anyhow::Error) -> Option<&DeployError> {
        err.chain().find_map(|cause| cause.downcast_ref::<DeployError>())
    }

    /// Whether this failure is an operator decline rather than a system failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DeployError::UserCancelled(_))
    }

    /// A short hint telling the operator how to get unstuck.
    pub fn remediation(&self) -> Option<String> {
        match self {
            DeployError::InvalidCredential(_) => Some(
                "create a token with Workers and D1 permissions and pass it with --token or CLOUDFLARE_API_TOKEN"
                    .to_string(),
            ),
            DeployError::AmbiguousResource { kind, .. } => Some(format!(
                "pass the {kind} identifier explicitly or run without --non-interactive to choose one"
            )),
            DeployError::ValidationPhase { category, .. } => {
                Some(format!("fix the {category} issues above and run `edgeship validate` again"))
            }
            DeployError::ResourceConflict { .. } => Some(
                "run `wrangler d1 list` to see available names, then reuse or pick a new name"
                    .to_string(),
            ),
            DeployError::CommandExecution { timed_out: true, .. } => {
                Some("increase `timeouts.deploy_secs` or check network connectivity".to_string())
            }
            DeployError::CommandExecution { .. } => {
                Some("inspect the command output above and the session audit log".to_string())
            }
            DeployError::BindingMismatch { .. } => Some(
                "run `wrangler d1 list` to see available names and update the manifest binding"
                    .to_string(),
            ),
            DeployError::UserCancelled(_) => None,
        }
    }
}

/// Process exit status reported by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ExitStatus {
    Success,
    Failure,
    Cancelled,
    VerificationFailed,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
            ExitStatus::Cancelled => 3,
            ExitStatus::VerificationFailed => 4,
        }
    }

    /// Classify a fatal error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        match DeployError::find(err) {
            Some(e) if e.is_cancellation() => ExitStatus::Cancelled,
            _ => ExitStatus::Failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn test_find_through_context() {
        let err = anyhow::Error::from(DeployError::UserCancelled("deploy".to_string()))
            .context("Confirmation phase failed");
        let found = DeployError::find(&err).expect("typed error should be found");
        assert!(found.is_cancellation());
        assert_eq!(ExitStatus::from_error(&err), ExitStatus::Cancelled);
    }

    #[test]
    fn test_plain_error_is_failure() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("boom")).context("outer");
        let err = err.unwrap_err();
        assert!(DeployError::find(&err).is_none());
        assert_eq!(ExitStatus::from_error(&err), ExitStatus::Failure);
    }

    #[test]
    fn test_command_execution_message() {
        let err = DeployError::CommandExecution {
            command: "wrangler deploy".to_string(),
            exit_code: None,
            timed_out: true,
            output: String::new(),
        };
        assert_eq!(err.to_string(), "Command `wrangler deploy` timed out");
        assert!(err.remediation().is_some());
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes = [
            ExitStatus::Success.code(),
            ExitStatus::Failure.code(),
            ExitStatus::Cancelled.code(),
            ExitStatus::VerificationFailed.code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
