//! # Phase Stages
//!
//! One stage per pipeline phase. A stage receives the prior phase's result
//! (or the raw request for the first phase), scores it through the injected
//! [`ScoringStrategy`], optionally fans out into the step executor, and
//! packages an immutable [`PhaseResult`] for the next stage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::PhaseConfig;
use crate::error::PipelineError;
use crate::models::{Participant, Request, ResolvedConstraints};
use crate::scoring::{Assessment, ScoringStrategy};

use super::pipeline::PipelinePhase;
use super::steps::{StepContext, StepExecutor, StepResultItem};

/// What a stage (and its strategy) sees of the session
#[derive(Debug, Clone, Copy)]
pub struct PhaseContext<'a> {
    pub session_id: &'a str,
    pub phase: PipelinePhase,
    pub request: &'a Request,
    /// Output of the previous phase; None for the first phase
    pub previous: Option<&'a PhaseResult>,
    /// Participants as transformed by the phases so far
    pub participants: &'a [Participant],
}

/// Session-scoped resources handed to every stage
pub struct StageEnv<'a> {
    pub executor: &'a StepExecutor,
    pub constraints: &'a ResolvedConstraints,
    /// Fan-out width after request constraints are applied
    pub max_parallel_steps: usize,
    pub cancel: &'a CancellationToken,
}

/// Output of one phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: PipelinePhase,
    pub assessment: Assessment,
    /// Mean of the assessment components
    pub score: f64,
    /// Step success rate; 1.0 when the phase did not fan out
    pub efficiency: f64,
    /// Sum of successful step gains
    pub gain: f64,
    pub steps: Vec<StepResultItem>,
    /// Participants after this phase's gain was applied
    pub participants: Vec<Participant>,
    pub generated_at: DateTime<Utc>,
}

/// A single pipeline phase
#[async_trait]
pub trait PhaseStage: Send + Sync {
    fn phase(&self) -> PipelinePhase;

    async fn run(
        &self,
        ctx: &PhaseContext<'_>,
        env: &StageEnv<'_>,
    ) -> Result<PhaseResult, PipelineError>;
}

/// Assess, optionally fan out, then apply gains to participants
pub struct StandardStage {
    config: PhaseConfig,
    strategy: Arc<dyn ScoringStrategy>,
}

impl StandardStage {
    pub fn new(config: PhaseConfig, strategy: Arc<dyn ScoringStrategy>) -> Self {
        Self { config, strategy }
    }

    pub fn config(&self) -> &PhaseConfig {
        &self.config
    }
}

#[async_trait]
impl PhaseStage for StandardStage {
    fn phase(&self) -> PipelinePhase {
        self.config.phase
    }

    async fn run(
        &self,
        ctx: &PhaseContext<'_>,
        env: &StageEnv<'_>,
    ) -> Result<PhaseResult, PipelineError> {
        let phase = self.config.phase;

        let assessment = self
            .strategy
            .assess(ctx)
            .await
            .map_err(|e| PipelineError::phase(phase, e))?;
        assessment
            .validate()
            .map_err(|e| PipelineError::phase(phase, e))?;

        let requirements = &ctx.request.requirements;
        if assessment.readiness < requirements.minimum_readiness {
            return Err(PipelineError::RequirementNotMet {
                phase,
                requirement: "minimum_readiness",
                actual: assessment.readiness,
                required: requirements.minimum_readiness,
            });
        }

        let steps = if self.config.fan_out {
            let mut planned = self.strategy.plan_steps(ctx, &assessment);
            if let Some(budget) = env.constraints.step_budget {
                planned.truncate(budget);
            }
            if let Some(bad) = planned
                .iter()
                .find(|s| !s.magnitude.is_finite() || s.magnitude < 0.0)
            {
                return Err(PipelineError::phase(
                    phase,
                    format!("planned step has invalid magnitude {}", bad.magnitude),
                ));
            }
            let step_ctx = StepContext {
                session_id: ctx.session_id,
                phase: &self.config,
                max_parallel: env.max_parallel_steps,
                cancel: env.cancel,
            };
            env.executor.run_all(planned, &step_ctx).await?
        } else {
            Vec::new()
        };

        let efficiency = if steps.is_empty() {
            1.0
        } else {
            steps.iter().filter(|s| s.success).count() as f64 / steps.len() as f64
        };
        if !steps.is_empty() && efficiency < requirements.minimum_efficiency {
            return Err(PipelineError::RequirementNotMet {
                phase,
                requirement: "minimum_efficiency",
                actual: efficiency,
                required: requirements.minimum_efficiency,
            });
        }

        let gain: f64 = steps
            .iter()
            .filter(|s| s.success)
            .map(|s| s.actual_gain)
            .sum();
        let participants = ctx
            .participants
            .iter()
            .cloned()
            .map(|mut p| {
                p.capability *= 1.0 + gain;
                p
            })
            .collect();

        Ok(PhaseResult {
            phase,
            score: assessment.score(),
            assessment,
            efficiency,
            gain,
            steps,
            participants,
            generated_at: Utc::now(),
        })
    }
}
