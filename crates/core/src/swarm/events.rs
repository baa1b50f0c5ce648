//! # Pipeline Events
//!
//! Append-only audit trail for a session. Every session records at least a
//! start event and a terminal (completed, failed or cancelled) event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pipeline::PipelinePhase;

/// Kind of pipeline event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventKind {
    /// Session registered and pipeline started
    SessionStarted,
    /// A phase began executing
    PhaseStarted,
    /// A phase produced its result
    PhaseCompleted,
    /// Validation finished and a result was built
    SessionCompleted,
    /// A phase raised and the session was aborted
    SessionFailed,
    /// The session was cancelled before completing
    SessionCancelled,
}

impl PipelineEventKind {
    /// Whether the event closes a session's trail
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SessionCompleted | Self::SessionFailed | Self::SessionCancelled
        )
    }
}

/// An event in a session's trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Unique event ID
    pub id: String,
    /// Session the event belongs to
    pub session_id: String,
    /// Kind of event
    pub kind: PipelineEventKind,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Phase the event relates to, if any
    #[serde(default)]
    pub phase: Option<PipelinePhase>,
    /// Free-form payload
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl PipelineEvent {
    /// Create a new event
    pub fn new(kind: PipelineEventKind, session_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            kind,
            timestamp: Utc::now(),
            phase: None,
            data: serde_json::Map::new(),
        }
    }

    /// Tag the event with a phase
    pub fn with_phase(mut self, phase: PipelinePhase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Add a payload entry
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}
