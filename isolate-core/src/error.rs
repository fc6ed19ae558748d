//! Hierarchical error types for the isolation orchestrator.
//!
//! Errors are categorized by recovery path:
//! - [`PolicyError`]: capability-document issues (user-fixable)
//! - [`HostError`]: a single host primitive call that failed
//! - [`OrchestratorError`]: the top-level error surfaced to the CLI

use std::io;
use thiserror::Error;

/// Errors from the policy parser (C1) that abort parsing outright.
///
/// Per-line problems (unknown keys, malformed values) are warnings, not
/// errors — they never reach this type. This type is only for the cases
/// spec.md classifies as `PolicyParse`: an explicitly-named `-c FILE` that
/// cannot be read at all.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy file {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("policy file {path} is not valid UTF-8")]
    NotUtf8 { path: String },
}

/// A single host primitive (C3) call that failed.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("{primitive}: {source}")]
    Failed {
        primitive: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{primitive}: {reason}")]
    Rejected {
        primitive: &'static str,
        reason: String,
    },
}

impl HostError {
    pub fn failed(primitive: &'static str, source: io::Error) -> Self {
        Self::Failed { primitive, source }
    }

    pub fn rejected(primitive: &'static str, reason: impl Into<String>) -> Self {
        Self::Rejected {
            primitive,
            reason: reason.into(),
        }
    }

    /// The primitive name, for logging and downgrade-to-warning decisions.
    pub fn primitive(&self) -> &'static str {
        match self {
            HostError::Failed { primitive, .. } => primitive,
            HostError::Rejected { primitive, .. } => primitive,
        }
    }
}

/// Top-level error returned by the orchestrator to its caller.
///
/// Matches the machine-distinguishable kinds of spec.md §7 one-to-one so a
/// caller can branch on `kind()` without string matching.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Unrecoverable policy-level issue.
    #[error("policy parse error: {0}")]
    PolicyParse(#[from] PolicyError),

    /// Named principal missing, invalid limit, or other policy-semantic
    /// violation discovered during provisioning (not during parsing).
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// Caller lacks privilege to invoke host primitives.
    #[error("unprivileged: {0}")]
    Unprivileged(String),

    /// A host primitive defined as fatal by spec.md §4.5 failed.
    #[error("provisioning step failed: {0}")]
    PrimitiveFailed(#[from] HostError),

    /// Process image replacement failed after credential drop / attach.
    #[error("launch failed: {0}")]
    LaunchFailed(#[source] io::Error),

    /// External cancellation (signal) during provisioning.
    #[error("aborted by signal")]
    Aborted,
}

impl OrchestratorError {
    /// Machine-distinguishable kind name, matching spec.md §7.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::PolicyParse(_) => "PolicyParse",
            OrchestratorError::PolicyViolation(_) => "PolicyViolation",
            OrchestratorError::Unprivileged(_) => "Unprivileged",
            OrchestratorError::PrimitiveFailed(_) => "PrimitiveFailed",
            OrchestratorError::LaunchFailed(_) => "LaunchFailed",
            OrchestratorError::Aborted => "Aborted",
        }
    }

    /// A human-actionable suggestion, when one applies (spec.md §7).
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            OrchestratorError::Unprivileged(_) => {
                Some("re-run under a privilege-raising wrapper (e.g. sudo)")
            }
            OrchestratorError::PolicyViolation(_) => {
                Some("check that the named user/limits in the capability document are valid")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(OrchestratorError::Aborted.kind(), "Aborted");
        assert_eq!(
            OrchestratorError::Unprivileged("need root".into()).kind(),
            "Unprivileged"
        );
    }

    #[test]
    fn test_host_error_conversion() {
        let host_err = HostError::rejected("bind_mount", "not a directory");
        let err: OrchestratorError = host_err.into();
        assert!(matches!(err, OrchestratorError::PrimitiveFailed(_)));
        assert_eq!(err.kind(), "PrimitiveFailed");
    }

    #[test]
    fn test_unprivileged_has_suggestion() {
        let err = OrchestratorError::Unprivileged("need CAP_SYS_ADMIN".into());
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn test_error_display() {
        let err = HostError::failed(
            "principal_create_ephemeral",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("principal_create_ephemeral"));
    }
}
