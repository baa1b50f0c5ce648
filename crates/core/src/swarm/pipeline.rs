//! # Pipeline Phases
//!
//! Defines the phases of the coordination pipeline and the per-session
//! state machine that walks them.
//!
//! ```text
//! Pending → Running(phase i) → Running(phase i+1) → … → Validating → Complete
//!                  └──────────────── Failed / Cancelled ───────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of the pipeline, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    /// Scoring the raw request
    Assessment,
    /// First fan-out over the participants
    Processing,
    /// Aligning the processed participants
    Coordination,
    /// Merging coordination output
    Synthesis,
    /// Final fan-out before validation
    Orchestration,
    /// Comparing transformed participants against the originals
    Validation,
}

impl PipelinePhase {
    /// Every phase in execution order
    pub fn all() -> [PipelinePhase; 6] {
        [
            PipelinePhase::Assessment,
            PipelinePhase::Processing,
            PipelinePhase::Coordination,
            PipelinePhase::Synthesis,
            PipelinePhase::Orchestration,
            PipelinePhase::Validation,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assessment => "assessment",
            Self::Processing => "processing",
            Self::Coordination => "coordination",
            Self::Synthesis => "synthesis",
            Self::Orchestration => "orchestration",
            Self::Validation => "validation",
        }
    }

    /// Whether the phase runs as a pluggable stage (validation is built in)
    pub fn is_stage(&self) -> bool {
        !matches!(self, Self::Validation)
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of one session's pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "phase", rename_all = "snake_case")]
pub enum PipelineState {
    Pending,
    Running(PipelinePhase),
    Validating,
    Complete,
    Failed(Option<PipelinePhase>),
    Cancelled,
}

/// The pipeline state machine
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Current state
    pub state: PipelineState,
    /// Stage order this session runs
    phases: Vec<PipelinePhase>,
    /// Index of the next stage to start
    cursor: usize,
}

impl Pipeline {
    /// Create a pipeline over the given stage order
    pub fn new(phases: Vec<PipelinePhase>) -> Self {
        Self {
            state: PipelineState::Pending,
            phases,
            cursor: 0,
        }
    }

    /// Advance to the next state, returning the stage now running (if any)
    pub fn advance(&mut self) -> Option<PipelinePhase> {
        self.state = match self.state {
            PipelineState::Pending | PipelineState::Running(_) => {
                match self.phases.get(self.cursor) {
                    Some(phase) => {
                        self.cursor += 1;
                        PipelineState::Running(*phase)
                    }
                    None => PipelineState::Validating,
                }
            }
            PipelineState::Validating => PipelineState::Complete,
            terminal => terminal,
        };
        match self.state {
            PipelineState::Running(phase) => Some(phase),
            _ => None,
        }
    }

    /// Fail the pipeline at its current phase
    pub fn fail(&mut self) {
        if self.is_complete() {
            return;
        }
        let phase = match self.state {
            PipelineState::Running(phase) => Some(phase),
            PipelineState::Validating => Some(PipelinePhase::Validation),
            _ => None,
        };
        self.state = PipelineState::Failed(phase);
    }

    /// Cancel the pipeline unless it already finished
    pub fn cancel(&mut self) {
        if !self.is_complete() {
            self.state = PipelineState::Cancelled;
        }
    }

    /// Current phase, if the pipeline is mid-flight
    pub fn current_phase(&self) -> Option<PipelinePhase> {
        match self.state {
            PipelineState::Running(phase) => Some(phase),
            PipelineState::Validating => Some(PipelinePhase::Validation),
            _ => None,
        }
    }

    /// Check if pipeline is complete
    pub fn is_complete(&self) -> bool {
        matches!(
            self.state,
            PipelineState::Complete | PipelineState::Failed(_) | PipelineState::Cancelled
        )
    }

    /// Check if pipeline succeeded
    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Complete
    }
}
