//! Error types for a verification run

use thiserror::Error;

/// Exit code used when a failure carries no code of its own
pub const EXIT_FAILURE: i32 = 1;

/// Exit code for missing images, sources or invalid configuration
pub const EXIT_PRECONDITION: i32 = 2;

/// Exit code after Ctrl-C
pub const EXIT_INTERRUPTED: i32 = 130;

/// Verification error types
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("{tool} failed during {phase} with exit code {code}")]
    ToolFailed {
        tool: String,
        phase: String,
        code: i32,
    },

    #[error("Timed out waiting for {what} after {attempts} attempts")]
    ReadinessTimeout { what: String, attempts: u32 },

    #[error("Check '{check}' failed: {reason}")]
    CheckFailed {
        check: String,
        reason: String,
        code: Option<i32>,
    },

    #[error("Interrupted")]
    Interrupted,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl VerifyError {
    /// Process exit code this error maps to
    pub fn exit_code(&self) -> i32 {
        match self {
            VerifyError::Precondition(_) => EXIT_PRECONDITION,
            VerifyError::ToolFailed { code, .. } => nonzero(*code),
            VerifyError::ReadinessTimeout { .. } => EXIT_FAILURE,
            VerifyError::CheckFailed { code, .. } => code.map(nonzero).unwrap_or(EXIT_FAILURE),
            VerifyError::Interrupted => EXIT_INTERRUPTED,
            VerifyError::Internal(_) => EXIT_FAILURE,
        }
    }

    /// Whether resources may already exist and need cleanup
    pub fn needs_cleanup(&self) -> bool {
        !matches!(self, VerifyError::Precondition(_))
    }

    /// Configuration that failed to load or validate
    pub fn invalid_config(err: anyhow::Error) -> Self {
        VerifyError::Precondition(format!("Invalid configuration: {:#}", err))
    }

    pub(crate) fn check(check: &str, reason: impl Into<String>) -> Self {
        VerifyError::CheckFailed {
            check: check.to_string(),
            reason: reason.into(),
            code: None,
        }
    }
}

// A failure must never map to exit code 0.
fn nonzero(code: i32) -> i32 {
    if code == 0 {
        EXIT_FAILURE
    } else {
        code
    }
}

pub type Result<T> = std::result::Result<T, VerifyError>;
