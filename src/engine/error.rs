//! Failure taxonomy surfaced by the workflow engine.
//!
//! A reboot suspend is an outcome, not an error, so it lives in
//! `PhaseOutcome` instead.
use super::Phase;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A step's collaborator call failed; progress stays at the prior step.
    #[error(
        "step `{step}` of {phase} failed: {error}\n\
         progress up to the previous step is preserved; {hint}",
        hint = retry_hint(.retriable)
    )]
    StepFailed {
        phase: Phase,
        step: String,
        error: String,
        retriable: bool,
    },

    #[error(
        "{active} is in progress (last completed step: {last_completed}); \
         resume it or abandon it before starting {requested}"
    )]
    PhaseConflict {
        requested: Phase,
        active: Phase,
        last_completed: String,
    },

    #[error("progress record at {} is unreadable: {reason}", path.display())]
    StoreCorrupt { path: PathBuf, reason: String },

    #[error("another workflow run is in flight ({holder})")]
    WorkflowBusy { holder: String },

    #[error(
        "recorded step `{step}` is not part of {phase} in this version; \
         the progress was written by a different release (abandon it to start over)"
    )]
    RegistryMismatch { phase: Phase, step: String },

    #[error("progress store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

fn retry_hint(retriable: &bool) -> &'static str {
    if *retriable {
        "fix the cause and re-run to resume at this step"
    } else {
        "this step is not safely retriable, clean up its partial effects before re-running"
    }
}

impl WorkflowError {
    /// Process exit code for the CLI shell.
    pub fn exit_code(&self) -> u8 {
        match self {
            WorkflowError::StepFailed { .. } => 1,
            WorkflowError::StoreCorrupt { .. } | WorkflowError::Store(_) => 1,
            WorkflowError::PhaseConflict { .. }
            | WorkflowError::WorkflowBusy { .. }
            | WorkflowError::RegistryMismatch { .. } => 3,
        }
    }
}
