//! # Conductor Models
//!
//! Request-side data types for the coordination pipeline: participants,
//! capabilities, requirements and processing constraints.
//!
//! A `Request` is immutable once submitted. The coordinator validates it
//! before a session is opened, so everything downstream can rely on the
//! ranges checked in [`Request::validate`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::PipelineError;

/// Target coordination level, ordered from least to most intensive
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationLevel {
    #[default]
    Basic,
    Advanced,
    Maximum,
}

impl CoordinationLevel {
    /// Get all levels in ascending order
    pub fn all() -> Vec<CoordinationLevel> {
        vec![
            CoordinationLevel::Basic,
            CoordinationLevel::Advanced,
            CoordinationLevel::Maximum,
        ]
    }

    /// Display name for reports
    pub fn display_name(&self) -> &'static str {
        match self {
            CoordinationLevel::Basic => "Basic",
            CoordinationLevel::Advanced => "Advanced",
            CoordinationLevel::Maximum => "Maximum",
        }
    }

    /// Scale applied to potential and step magnitudes by the baseline strategy
    pub fn intensity(&self) -> f64 {
        match self {
            CoordinationLevel::Basic => 1.0,
            CoordinationLevel::Advanced => 1.15,
            CoordinationLevel::Maximum => 1.3,
        }
    }
}

impl std::str::FromStr for CoordinationLevel {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "advanced" => Ok(Self::Advanced),
            "maximum" | "max" => Ok(Self::Maximum),
            other => Err(PipelineError::InvalidRequest(format!(
                "unknown coordination level '{}'",
                other
            ))),
        }
    }
}

/// Per-domain capability tables
pub mod capability {
    const HARMONY: &[&str] = &["resonance", "alignment", "balance", "synchronization"];
    const MULTIVERSE: &[&str] = &["branching", "bridging", "navigation", "convergence"];
    const REALITY: &[&str] = &["modelling", "stabilization", "projection", "calibration"];
    const COORDINATION: &[&str] = &["scheduling", "negotiation", "delegation", "consensus"];

    /// Names known for a domain; unknown domains have an empty table
    pub fn known(domain: &str) -> &'static [&'static str] {
        match domain {
            "harmony" => HARMONY,
            "multiverse" => MULTIVERSE,
            "reality" => REALITY,
            "coordination" => COORDINATION,
            _ => &[],
        }
    }

    /// All domains that carry a table
    pub fn domains() -> &'static [&'static str] {
        &["harmony", "multiverse", "reality", "coordination"]
    }
}

/// A named capability within a domain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Capability {
    pub domain: String,
    pub name: String,
}

impl Capability {
    pub fn new(domain: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            name: name.into(),
        }
    }

    /// Whether the capability appears in its domain's table
    pub fn is_known(&self) -> bool {
        capability::known(&self.domain).contains(&self.name.as_str())
    }
}

/// A participant taking part in a coordination request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub id: String,
    /// Capability level; in [0, 1] on the way in, relative afterwards
    pub capability: f64,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub attributes: BTreeMap<String, f64>,
}

impl Participant {
    pub fn new(id: impl Into<String>, capability: f64) -> Self {
        Self {
            id: id.into(),
            capability,
            capabilities: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: f64) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Nested thresholds a session must satisfy phase by phase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Requirements {
    /// Minimum assessment readiness for every phase
    #[serde(default)]
    pub minimum_readiness: f64,
    /// Minimum step success rate for every fanned-out phase
    #[serde(default)]
    pub minimum_efficiency: f64,
}

/// Priority of a processing constraint; higher wins on duplicate keys
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Typed value of a processing constraint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConstraintValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl ConstraintValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ConstraintValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// A key/value/priority processing constraint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingConstraint {
    pub key: String,
    pub value: ConstraintValue,
    #[serde(default)]
    pub priority: ConstraintPriority,
}

impl ProcessingConstraint {
    pub fn new(key: impl Into<String>, value: ConstraintValue, priority: ConstraintPriority) -> Self {
        Self {
            key: key.into(),
            value,
            priority,
        }
    }
}

/// Narrows fan-out concurrency within a phase
pub const MAX_PARALLEL_STEPS: &str = "max_parallel_steps";
/// Caps the number of steps a phase may plan
pub const STEP_BUDGET: &str = "step_budget";

/// Constraints after duplicate keys are resolved by priority
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedConstraints {
    pub max_parallel_steps: Option<usize>,
    pub step_budget: Option<usize>,
}

/// A unit of coordination work submitted by a caller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub level: CoordinationLevel,
    /// Final depth the pipeline must reach, in [0, 1]
    pub target_threshold: f64,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub constraints: Vec<ProcessingConstraint>,
}

impl Request {
    pub fn new(participants: Vec<Participant>, level: CoordinationLevel, target_threshold: f64) -> Self {
        Self {
            participants,
            level,
            target_threshold,
            requirements: Requirements::default(),
            constraints: Vec::new(),
        }
    }

    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_constraint(mut self, constraint: ProcessingConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Check ranges and structure; fails fast before any session exists
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.participants.is_empty() {
            return Err(PipelineError::InvalidRequest(
                "participant set is empty".to_string(),
            ));
        }
        check_unit("target_threshold", self.target_threshold)?;
        check_unit(
            "requirements.minimum_readiness",
            self.requirements.minimum_readiness,
        )?;
        check_unit(
            "requirements.minimum_efficiency",
            self.requirements.minimum_efficiency,
        )?;

        let mut seen = HashSet::new();
        for participant in &self.participants {
            if participant.id.trim().is_empty() {
                return Err(PipelineError::InvalidRequest(
                    "participant id is empty".to_string(),
                ));
            }
            if !seen.insert(participant.id.as_str()) {
                return Err(PipelineError::InvalidRequest(format!(
                    "duplicate participant id '{}'",
                    participant.id
                )));
            }
            check_unit(
                &format!("participant '{}' capability", participant.id),
                participant.capability,
            )?;
        }

        self.resolved_constraints().map(|_| ())
    }

    /// Resolve recognised constraints, highest priority first (ties: last wins)
    pub fn resolved_constraints(&self) -> Result<ResolvedConstraints, PipelineError> {
        let mut winners: BTreeMap<&str, &ProcessingConstraint> = BTreeMap::new();
        for constraint in &self.constraints {
            match winners.get(constraint.key.as_str()) {
                Some(current) if current.priority > constraint.priority => {}
                _ => {
                    winners.insert(constraint.key.as_str(), constraint);
                }
            }
        }

        let mut resolved = ResolvedConstraints::default();
        for (key, constraint) in winners {
            match key {
                MAX_PARALLEL_STEPS => {
                    let n = whole_number(constraint)?;
                    if n == 0 {
                        return Err(PipelineError::InvalidRequest(format!(
                            "constraint '{}' must be at least 1",
                            key
                        )));
                    }
                    resolved.max_parallel_steps = Some(n);
                }
                STEP_BUDGET => {
                    resolved.step_budget = Some(whole_number(constraint)?);
                }
                other => {
                    tracing::debug!(key = %other, "Ignoring unrecognised processing constraint");
                }
            }
        }
        Ok(resolved)
    }

    /// Mean input capability across participants
    pub fn mean_capability(&self) -> f64 {
        mean_capability(&self.participants)
    }
}

/// Mean capability of a participant slice (0 when empty)
pub fn mean_capability(participants: &[Participant]) -> f64 {
    if participants.is_empty() {
        return 0.0;
    }
    participants.iter().map(|p| p.capability).sum::<f64>() / participants.len() as f64
}

fn check_unit(name: &str, value: f64) -> Result<(), PipelineError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(PipelineError::InvalidRequest(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )))
    }
}

fn whole_number(constraint: &ProcessingConstraint) -> Result<usize, PipelineError> {
    match constraint.value.as_number() {
        Some(n) if n.is_finite() && n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
        _ => Err(PipelineError::InvalidRequest(format!(
            "constraint '{}' must be a non-negative whole number",
            constraint.key
        ))),
    }
}
