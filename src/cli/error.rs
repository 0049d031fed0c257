//! CLI-level errors (wraps infrastructure errors)

use thiserror::Error;

use crate::application::ApplicationError;
use crate::domain::DomainError;
use crate::exitcode;
use crate::infrastructure::InfraError;

/// CLI errors are the top-level error type.
/// These are what get displayed to the user.
#[derive(Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    Infra(#[from] InfraError),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("{0}")]
    Usage(String),
}

impl From<ApplicationError> for CliError {
    fn from(e: ApplicationError) -> Self {
        CliError::Infra(InfraError::Application(e))
    }
}

impl From<DomainError> for CliError {
    fn from(e: DomainError) -> Self {
        ApplicationError::from(e).into()
    }
}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

impl CliError {
    /// Get the appropriate exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::InvalidArgs(_) | CliError::Usage(_) => exitcode::USAGE,
            CliError::Infra(e) => match e {
                InfraError::Io { .. } => exitcode::IOERR,
                InfraError::Application(app) => match app {
                    ApplicationError::FileNotFound(_) => exitcode::NOINPUT,
                    ApplicationError::ReadOnlyMap(_) => exitcode::NOPERM,
                    ApplicationError::Cancelled(_) => exitcode::CANCELLED,
                    ApplicationError::LockNotHeld(_) => exitcode::UNAVAILABLE,
                    ApplicationError::Config { .. } => exitcode::CONFIG,
                    ApplicationError::Domain(DomainError::InvalidDocument { .. })
                    | ApplicationError::Domain(DomainError::InvalidRules { .. }) => exitcode::DATAERR,
                    ApplicationError::Domain(DomainError::NodeLocked(_)) => exitcode::NOPERM,
                    _ => exitcode::SOFTWARE,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn given_missing_file_when_mapping_exit_code_then_noinput() {
        let err: CliError = ApplicationError::FileNotFound(PathBuf::from("a.mm")).into();
        assert_eq!(err.exit_code(), exitcode::NOINPUT);
    }

    #[test]
    fn given_locked_node_when_mapping_exit_code_then_noperm() {
        let err: CliError = DomainError::NodeLocked("secret".into()).into();
        assert_eq!(err.exit_code(), exitcode::NOPERM);
    }
}
