//! # Coordinator Configuration
//!
//! Per-phase success ratios and gain ranges, the advantage gate, and the
//! coordinator's concurrency and bookkeeping limits.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::PipelineError;
use crate::swarm::pipeline::PipelinePhase;

/// Advantage a session must reach (alongside its target threshold) to succeed
pub const DEFAULT_MINIMUM_ADVANTAGE: f64 = 0.4;

/// Settings for one pipeline phase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseConfig {
    pub phase: PipelinePhase,
    /// Whether the phase fans out into steps
    pub fan_out: bool,
    /// A step succeeds when `actual_gain >= magnitude * success_ratio`
    pub success_ratio: f64,
    /// Range the simulated gain factor is drawn from
    pub gain_range: (f64, f64),
    /// Simulated work time per unit of step magnitude, in microseconds
    #[serde(default = "default_step_delay_us")]
    pub step_delay_per_unit_us: u64,
}

fn default_step_delay_us() -> u64 {
    10_000
}

impl PhaseConfig {
    pub fn new(phase: PipelinePhase, success_ratio: f64, gain_range: (f64, f64)) -> Self {
        Self {
            phase,
            fan_out: true,
            success_ratio,
            gain_range,
            step_delay_per_unit_us: default_step_delay_us(),
        }
    }

    /// A phase that only assesses and never fans out
    pub fn assess_only(phase: PipelinePhase) -> Self {
        Self {
            phase,
            fan_out: false,
            success_ratio: 1.0,
            gain_range: (1.0, 1.0),
            step_delay_per_unit_us: 0,
        }
    }

    pub fn with_delay(mut self, per_unit: Duration) -> Self {
        self.step_delay_per_unit_us = u64::try_from(per_unit.as_micros()).unwrap_or(u64::MAX);
        self
    }

    /// Simulated work duration for a step of the given magnitude
    pub fn delay_for(&self, magnitude: f64) -> Duration {
        let micros = self.step_delay_per_unit_us as f64 * magnitude.max(0.0);
        Duration::from_nanos((micros * 1_000.0) as u64)
    }

    fn validate(&self) -> Result<(), PipelineError> {
        let (lo, hi) = self.gain_range;
        if !(self.success_ratio > 0.0 && self.success_ratio <= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "{} success_ratio must be in (0, 1], got {}",
                self.phase, self.success_ratio
            )));
        }
        if !(lo.is_finite() && hi.is_finite() && lo >= 0.0 && lo <= hi) {
            return Err(PipelineError::InvalidConfig(format!(
                "{} gain_range must satisfy 0 <= lo <= hi, got ({}, {})",
                self.phase, lo, hi
            )));
        }
        Ok(())
    }
}

/// Configuration for the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Ordered stage settings; the pipeline runs them in this order
    pub phases: Vec<PhaseConfig>,
    /// Advantage gate for overall success
    pub minimum_advantage: f64,
    /// Fan-out width unless a request constraint narrows it
    pub default_max_parallel_steps: usize,
    /// Failure records retained for status reporting
    pub max_failure_records: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            phases: vec![
                PhaseConfig::assess_only(PipelinePhase::Assessment),
                PhaseConfig::new(PipelinePhase::Processing, 0.80, (0.75, 1.25)),
                PhaseConfig::new(PipelinePhase::Coordination, 0.85, (0.80, 1.20)),
                PhaseConfig::new(PipelinePhase::Synthesis, 0.90, (0.85, 1.15)),
                PhaseConfig::new(PipelinePhase::Orchestration, 0.95, (0.85, 1.15)),
            ],
            minimum_advantage: DEFAULT_MINIMUM_ADVANTAGE,
            default_max_parallel_steps: 8,
            max_failure_records: 100,
        }
    }
}

impl CoordinatorConfig {
    /// Settings for a phase, if it is part of the pipeline
    pub fn phase(&self, phase: PipelinePhase) -> Option<&PhaseConfig> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    /// Replace (or append) a phase's settings
    pub fn with_phase(mut self, config: PhaseConfig) -> Self {
        match self.phases.iter_mut().find(|p| p.phase == config.phase) {
            Some(existing) => *existing = config,
            None => self.phases.push(config),
        }
        self
    }

    pub fn with_minimum_advantage(mut self, minimum_advantage: f64) -> Self {
        self.minimum_advantage = minimum_advantage;
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        check_stage_order(self.phases.iter().map(|p| p.phase))?;
        for phase in &self.phases {
            phase.validate()?;
        }
        if !self.minimum_advantage.is_finite() {
            return Err(PipelineError::InvalidConfig(
                "minimum_advantage must be finite".to_string(),
            ));
        }
        if self.default_max_parallel_steps == 0 {
            return Err(PipelineError::InvalidConfig(
                "default_max_parallel_steps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stages must be non-empty, unique, in pipeline order and never Validation
pub fn check_stage_order(
    phases: impl IntoIterator<Item = PipelinePhase>,
) -> Result<(), PipelineError> {
    let mut previous: Option<PipelinePhase> = None;
    for phase in phases {
        if !phase.is_stage() {
            return Err(PipelineError::InvalidConfig(format!(
                "{} cannot be configured as a pipeline stage",
                phase
            )));
        }
        if let Some(prev) = previous {
            if phase <= prev {
                return Err(PipelineError::InvalidConfig(format!(
                    "phases must be unique and in pipeline order ({} after {})",
                    phase, prev
                )));
            }
        }
        previous = Some(phase);
    }
    if previous.is_none() {
        return Err(PipelineError::InvalidConfig(
            "at least one phase is required".to_string(),
        ));
    }
    Ok(())
}
