//! Typed error kinds carried inside `anyhow::Error`.
//!
//! Callers that need to distinguish outcomes downcast with
//! `err.downcast_ref::<ContractViolation>()` and friends; everything else
//! treats these as ordinary fatal errors. Timeouts are not errors anywhere
//! in this crate — polling operations degrade to partial results instead.

use thiserror::Error;

/// The environment is unusable as configured: a repository without any
/// commit, or a terminal layout whose shape does not match the requested
/// topology. Fatal; surfaced before any cycle state is mutated.
#[derive(Debug, Clone, Error)]
#[error("configuration error: {message}")]
pub struct ConfigurationError {
    pub message: String,
}

impl ConfigurationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A collaborator returned a value outside its contract, e.g. a selector
/// choosing a key that is not in the candidate set. Fatal; aborts the
/// current cycle before promotion or merge.
#[derive(Debug, Clone, Error)]
#[error("contract violation: {message}")]
pub struct ContractViolation {
    pub message: String,
}

impl ContractViolation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Merging a winning branch into the main line hit conflicts. Reported
/// distinctly from configuration errors and never auto-resolved; the merge
/// is aborted so the main working tree stays clean.
#[derive(Debug, Clone, Error)]
#[error("merge conflict merging '{branch}': {detail}")]
pub struct MergeConflict {
    pub branch: String,
    pub detail: String,
}
