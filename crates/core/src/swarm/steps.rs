//! # Step Executor
//!
//! Scatter-gather execution of a phase's steps.
//!
//! Every step runs as its own task under a semaphore sized by the phase's
//! parallelism. Completion order is arbitrary; results are slotted back by
//! input index so aggregation is deterministic. A step that errors or panics
//! yields a `success: false` item instead of failing the batch, and the
//! executor only returns once every step has reported.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::PhaseConfig;
use crate::error::PipelineError;

/// Kind of fanned-out work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Amplification,
    Integration,
    Synchronization,
    Stabilization,
}

impl StepKind {
    pub fn all() -> Vec<StepKind> {
        vec![
            StepKind::Amplification,
            StepKind::Integration,
            StepKind::Synchronization,
            StepKind::Stabilization,
        ]
    }
}

/// A declarative unit of work within a phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub kind: StepKind,
    /// Magnitude the step attempts to apply
    pub magnitude: f64,
}

impl Step {
    pub fn new(kind: StepKind, magnitude: f64) -> Self {
        Self { kind, magnitude }
    }
}

/// Outcome of exactly one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResultItem {
    pub step_id: String,
    pub kind: StepKind,
    pub magnitude: f64,
    pub actual_gain: f64,
    pub success: bool,
    pub completed_at: DateTime<Utc>,
    /// Why the step produced no gain, if it errored or panicked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The work performed for one step; returns the actual gain achieved
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn perform(&self, step: &Step, phase: &PhaseConfig) -> anyhow::Result<f64>;
}

/// Sleeps in proportion to magnitude, then draws a gain from the phase's range
#[derive(Debug, Clone, Default)]
pub struct SimulatedWork;

#[async_trait]
impl UnitOfWork for SimulatedWork {
    async fn perform(&self, step: &Step, phase: &PhaseConfig) -> anyhow::Result<f64> {
        let delay = phase.delay_for(step.magnitude);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let (lo, hi) = phase.gain_range;
        let factor = if lo < hi {
            rand::rng().random_range(lo..=hi)
        } else {
            lo
        };
        Ok(step.magnitude * factor)
    }
}

/// Running counters for the executor
#[derive(Debug, Default)]
pub struct ExecutorStats {
    steps_executed: AtomicU64,
    steps_succeeded: AtomicU64,
    steps_failed: AtomicU64,
    steps_panicked: AtomicU64,
}

/// Serializable copy of [`ExecutorStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStatsSnapshot {
    pub steps_executed: u64,
    pub steps_succeeded: u64,
    pub steps_failed: u64,
    pub steps_panicked: u64,
}

impl ExecutorStats {
    pub fn snapshot(&self) -> ExecutorStatsSnapshot {
        ExecutorStatsSnapshot {
            steps_executed: self.steps_executed.load(Ordering::Relaxed),
            steps_succeeded: self.steps_succeeded.load(Ordering::Relaxed),
            steps_failed: self.steps_failed.load(Ordering::Relaxed),
            steps_panicked: self.steps_panicked.load(Ordering::Relaxed),
        }
    }

    fn observe(&self, item: &StepResultItem, panicked: bool) {
        self.steps_executed.fetch_add(1, Ordering::Relaxed);
        if item.success {
            self.steps_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.steps_failed.fetch_add(1, Ordering::Relaxed);
        }
        if panicked {
            self.steps_panicked.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Per-batch inputs to [`StepExecutor::run_all`]
#[derive(Debug)]
pub struct StepContext<'a> {
    pub session_id: &'a str,
    pub phase: &'a PhaseConfig,
    pub max_parallel: usize,
    pub cancel: &'a CancellationToken,
}

/// Runs a phase's steps concurrently and gathers one result per step
#[derive(Clone)]
pub struct StepExecutor {
    work: Arc<dyn UnitOfWork>,
    stats: Arc<ExecutorStats>,
}

impl StepExecutor {
    pub fn new(work: Arc<dyn UnitOfWork>) -> Self {
        Self {
            work,
            stats: Arc::new(ExecutorStats::default()),
        }
    }

    pub fn stats(&self) -> ExecutorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Execute every step; results come back in input order
    pub async fn run_all(
        &self,
        steps: Vec<Step>,
        ctx: &StepContext<'_>,
    ) -> Result<Vec<StepResultItem>, PipelineError> {
        let total = steps.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let semaphore = Arc::new(Semaphore::new(ctx.max_parallel.max(1)));
        let mut join_set = JoinSet::new();

        // SCATTER
        for (index, step) in steps.iter().copied().enumerate() {
            let work = Arc::clone(&self.work);
            let stats = Arc::clone(&self.stats);
            let semaphore = Arc::clone(&semaphore);
            let phase = ctx.phase.clone();
            let step_id = format!("{}-{}-{}", ctx.session_id, phase.phase, index);

            join_set.spawn(async move {
                // Held until the step settles
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = AssertUnwindSafe(work.perform(&step, &phase))
                    .catch_unwind()
                    .await;
                let panicked = outcome.is_err();
                let item = settle(step_id, &step, &phase, outcome);
                stats.observe(&item, panicked);
                (index, item)
            });
        }

        // GATHER
        let mut slots: Vec<Option<StepResultItem>> = vec![None; total];
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    join_set.abort_all();
                    tracing::warn!(
                        session_id = %ctx.session_id,
                        phase = %ctx.phase.phase,
                        "Step batch cancelled"
                    );
                    return Err(PipelineError::Cancelled {
                        session_id: ctx.session_id.to_string(),
                    });
                }
                next = join_set.join_next() => match next {
                    Some(Ok((index, item))) => slots[index] = Some(item),
                    Some(Err(e)) => {
                        tracing::warn!(phase = %ctx.phase.phase, "Step task ended abnormally: {}", e);
                    }
                    None => break,
                },
            }
        }

        let items: Vec<StepResultItem> = slots
            .into_iter()
            .zip(steps.iter())
            .enumerate()
            .map(|(index, (slot, step))| {
                slot.unwrap_or_else(|| StepResultItem {
                    step_id: format!("{}-{}-{}", ctx.session_id, ctx.phase.phase, index),
                    kind: step.kind,
                    magnitude: step.magnitude,
                    actual_gain: 0.0,
                    success: false,
                    completed_at: Utc::now(),
                    error: Some("step task ended without a result".to_string()),
                })
            })
            .collect();

        let succeeded = items.iter().filter(|i| i.success).count();
        tracing::debug!(
            phase = %ctx.phase.phase,
            total,
            succeeded,
            "Step batch gathered"
        );
        Ok(items)
    }
}

fn settle(
    step_id: String,
    step: &Step,
    phase: &PhaseConfig,
    outcome: Result<anyhow::Result<f64>, Box<dyn Any + Send>>,
) -> StepResultItem {
    let (actual_gain, error) = match outcome {
        Ok(Ok(gain)) if gain.is_finite() => (gain, None),
        Ok(Ok(gain)) => (0.0, Some(format!("non-finite gain {}", gain))),
        Ok(Err(e)) => (0.0, Some(e.to_string())),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::warn!(step_id = %step_id, "Step panicked: {}", message);
            (0.0, Some(format!("step panicked: {}", message)))
        }
    };
    let success = error.is_none() && actual_gain >= step.magnitude * phase.success_ratio;
    StepResultItem {
        step_id,
        kind: step.kind,
        magnitude: step.magnitude,
        actual_gain,
        success,
        completed_at: Utc::now(),
        error,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
