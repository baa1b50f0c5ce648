//! # Scoring Strategies
//!
//! The pluggable assessment logic behind every phase stage.
//!
//! ## Contract
//!
//! `assess` receives the phase context (request, prior phase result and the
//! participants as transformed so far) and returns an [`Assessment`] whose
//! three components must be finite and within `[0, 1]`; anything else fails
//! the phase. Implementations should be monotone in participant capability:
//! raising capability must never lower the returned `capability` component.
//!
//! `plan_steps` turns an assessment into the declarative steps a fanned-out
//! phase executes. It is only called for phases configured with `fan_out`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::mean_capability;
use crate::swarm::stage::PhaseContext;
use crate::swarm::steps::{Step, StepKind};

/// Potential, readiness and capability for one phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub potential: f64,
    pub readiness: f64,
    pub capability: f64,
}

impl Assessment {
    pub fn new(potential: f64, readiness: f64, capability: f64) -> Self {
        Self {
            potential,
            readiness,
            capability,
        }
    }

    /// Phase score: mean of the three components
    pub fn score(&self) -> f64 {
        (self.potential + self.readiness + self.capability) / 3.0
    }

    /// Check every component is finite and within [0, 1]
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("potential", self.potential),
            ("readiness", self.readiness),
            ("capability", self.capability),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                anyhow::bail!("assessment {} out of range: {}", name, value);
            }
        }
        Ok(())
    }
}

/// Injected domain scoring for phase stages
#[async_trait]
pub trait ScoringStrategy: Send + Sync {
    /// Score the phase's current context
    async fn assess(&self, ctx: &PhaseContext<'_>) -> anyhow::Result<Assessment>;

    /// Steps to fan out for this phase; defaults to one step per kind
    fn plan_steps(&self, ctx: &PhaseContext<'_>, assessment: &Assessment) -> Vec<Step> {
        let headroom = (assessment.potential - assessment.capability).max(0.02);
        let magnitude = headroom * 0.5 * ctx.request.level.intensity();
        StepKind::all()
            .into_iter()
            .map(|kind| Step::new(kind, magnitude))
            .collect()
    }
}

/// Deterministic default strategy derived from participant capability
#[derive(Debug, Clone, Default)]
pub struct BaselineScoring;

#[async_trait]
impl ScoringStrategy for BaselineScoring {
    async fn assess(&self, ctx: &PhaseContext<'_>) -> anyhow::Result<Assessment> {
        let capability = mean_capability(ctx.participants).clamp(0.0, 1.0);

        // First phase: readiness from how many declared capabilities are recognised
        let readiness = match ctx.previous {
            Some(previous) => previous.efficiency,
            None => {
                let declared: Vec<_> = ctx
                    .participants
                    .iter()
                    .flat_map(|p| p.capabilities.iter())
                    .collect();
                let known = declared.iter().filter(|c| c.is_known()).count();
                let share = if declared.is_empty() {
                    0.0
                } else {
                    known as f64 / declared.len() as f64
                };
                0.5 + 0.5 * share
            }
        };

        let potential =
            ((capability + (1.0 - capability) * 0.5) * ctx.request.level.intensity()).min(1.0);

        Ok(Assessment::new(potential, readiness.clamp(0.0, 1.0), capability))
    }
}

/// Strategy returning a constant assessment and fixed-size steps
#[derive(Debug, Clone)]
pub struct FixedScoring {
    pub assessment: Assessment,
    pub step_magnitude: f64,
    pub steps_per_phase: usize,
}

impl FixedScoring {
    pub fn new(assessment: Assessment, step_magnitude: f64, steps_per_phase: usize) -> Self {
        Self {
            assessment,
            step_magnitude,
            steps_per_phase,
        }
    }

    /// Same value for all three components
    pub fn uniform(score: f64, step_magnitude: f64, steps_per_phase: usize) -> Self {
        Self::new(
            Assessment::new(score, score, score),
            step_magnitude,
            steps_per_phase,
        )
    }
}

#[async_trait]
impl ScoringStrategy for FixedScoring {
    async fn assess(&self, _ctx: &PhaseContext<'_>) -> anyhow::Result<Assessment> {
        Ok(self.assessment)
    }

    fn plan_steps(&self, _ctx: &PhaseContext<'_>, _assessment: &Assessment) -> Vec<Step> {
        let kinds = StepKind::all();
        (0..self.steps_per_phase)
            .map(|i| Step::new(kinds[i % kinds.len()], self.step_magnitude))
            .collect()
    }
}
