//! # Pipeline Errors
//!
//! Structural failures surfaced to callers of the coordinator. Step-level
//! failures are not errors; they are reported as data on `StepResultItem`.

use thiserror::Error;

use crate::swarm::pipeline::PipelinePhase;

/// Errors raised by the coordinator and pipeline engine
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed request, rejected before any session is opened
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Coordinator configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A phase's strategy or plumbing raised, aborting the session
    #[error("{phase} phase failed: {message}")]
    PhaseFailed {
        phase: PipelinePhase,
        message: String,
    },

    /// A requirements gate inside a phase was not satisfied
    #[error("{phase} phase requirement '{requirement}' not met: {actual:.3} < {required:.3}")]
    RequirementNotMet {
        phase: PipelinePhase,
        requirement: &'static str,
        actual: f64,
        required: f64,
    },

    /// The session was cancelled before it completed
    #[error("session {session_id} was cancelled")]
    Cancelled { session_id: String },
}

impl PipelineError {
    /// Wrap a collaborator error as a phase failure
    pub fn phase(phase: PipelinePhase, err: impl std::fmt::Display) -> Self {
        Self::PhaseFailed {
            phase,
            message: err.to_string(),
        }
    }

    /// Phase the error was raised in, if any
    pub fn failed_phase(&self) -> Option<PipelinePhase> {
        match self {
            Self::PhaseFailed { phase, .. } | Self::RequirementNotMet { phase, .. } => {
                Some(*phase)
            }
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
