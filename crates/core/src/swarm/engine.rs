//! # Pipeline Engine
//!
//! Chains the configured stages for one session. Stages run strictly in
//! order, each consuming the previous stage's result; concurrency only
//! exists inside a stage's step fan-out. After the last stage the engine
//! validates the transformed participants against the originals, builds the
//! [`PipelineResult`] and folds it into the metrics aggregator.
//!
//! A stage error aborts the remaining stages, is logged to the failure path
//! and the session's events, and propagates to the caller. Cancellation
//! records nothing in the metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::config::CoordinatorConfig;
use crate::error::PipelineError;
use crate::models::{mean_capability, CoordinationLevel, Participant};
use crate::scoring::ScoringStrategy;
use crate::state::metrics::MetricsAggregator;
use crate::state::registry::Session;

use super::events::{PipelineEvent, PipelineEventKind};
use super::pipeline::{Pipeline, PipelinePhase, PipelineState};
use super::stage::{PhaseContext, PhaseResult, PhaseStage, StageEnv, StandardStage};
use super::steps::{ExecutorStatsSnapshot, StepExecutor, UnitOfWork};

/// Final, immutable outcome of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub session_id: String,
    pub level: CoordinationLevel,
    pub original_participants: Vec<Participant>,
    pub transformed_participants: Vec<Participant>,
    /// Score of the last stage
    pub final_depth: f64,
    /// Mean transformed capability over mean original capability, minus one
    pub advantage: f64,
    /// Mean phase efficiency
    pub efficiency: f64,
    /// `final_depth >= target_threshold && advantage >= minimum_advantage`
    pub success: bool,
    /// Terminal pipeline state
    pub state: PipelineState,
    pub execution_time: Duration,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub phases: Vec<PhaseResult>,
    pub events: Vec<PipelineEvent>,
}

/// Advantage of transformed participants over the originals
pub fn advantage(original: &[Participant], transformed: &[Participant]) -> f64 {
    let before = mean_capability(original);
    if before <= 0.0 {
        return 0.0;
    }
    mean_capability(transformed) / before - 1.0
}

/// Per-session event trail with optional streaming
struct EventLog<'a> {
    session_id: &'a str,
    events: Vec<PipelineEvent>,
    tx: Option<&'a mpsc::Sender<PipelineEvent>>,
}

impl<'a> EventLog<'a> {
    fn new(session_id: &'a str, tx: Option<&'a mpsc::Sender<PipelineEvent>>) -> Self {
        Self {
            session_id,
            events: Vec::new(),
            tx,
        }
    }

    fn event(&self, kind: PipelineEventKind) -> PipelineEvent {
        PipelineEvent::new(kind, self.session_id)
    }

    fn emit(&mut self, event: PipelineEvent) {
        if let Some(tx) = self.tx {
            // Best effort; a slow or closed listener never stalls the session
            if tx.try_send(event.clone()).is_err() {
                tracing::trace!(session_id = %self.session_id, "Event listener unavailable");
            }
        }
        self.events.push(event);
    }
}

/// Runs sessions through the ordered stages
pub struct PipelineEngine {
    stages: Vec<Arc<dyn PhaseStage>>,
    executor: StepExecutor,
    metrics: Arc<MetricsAggregator>,
    minimum_advantage: f64,
    default_max_parallel_steps: usize,
}

impl PipelineEngine {
    pub fn new(
        stages: Vec<Arc<dyn PhaseStage>>,
        executor: StepExecutor,
        metrics: Arc<MetricsAggregator>,
        minimum_advantage: f64,
        default_max_parallel_steps: usize,
    ) -> Self {
        Self {
            stages,
            executor,
            metrics,
            minimum_advantage,
            default_max_parallel_steps,
        }
    }

    /// Standard stages for every configured phase, sharing one strategy
    pub fn from_config(
        config: &CoordinatorConfig,
        strategy: Arc<dyn ScoringStrategy>,
        work: Arc<dyn UnitOfWork>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self::new(
            standard_stages(config, strategy),
            StepExecutor::new(work),
            metrics,
            config.minimum_advantage,
            config.default_max_parallel_steps,
        )
    }

    pub fn set_stages(&mut self, stages: Vec<Arc<dyn PhaseStage>>) {
        self.stages = stages;
    }

    pub fn set_executor(&mut self, executor: StepExecutor) {
        self.executor = executor;
    }

    /// Stage order, followed by validation
    pub fn phases(&self) -> Vec<PipelinePhase> {
        let mut phases: Vec<PipelinePhase> = self.stages.iter().map(|s| s.phase()).collect();
        phases.push(PipelinePhase::Validation);
        phases
    }

    pub fn executor_stats(&self) -> ExecutorStatsSnapshot {
        self.executor.stats()
    }

    /// Run one session to completion, failure or cancellation
    pub async fn run(
        &self,
        session: &Session,
        events_tx: Option<&mpsc::Sender<PipelineEvent>>,
    ) -> Result<PipelineResult, PipelineError> {
        let mut log = EventLog::new(&session.id, events_tx);
        log.emit(
            log.event(PipelineEventKind::SessionStarted)
                .with("participants", session.request.participants.len())
                .with("level", session.request.level.display_name()),
        );

        let mut pipeline = Pipeline::new(self.stages.iter().map(|s| s.phase()).collect());
        match self.run_phases(session, &mut pipeline, &mut log).await {
            Ok(result) => {
                self.metrics.record_success(&result);
                Ok(result)
            }
            Err(err) if err.is_cancelled() => {
                pipeline.cancel();
                tracing::warn!(session_id = %session.id, "Session cancelled");
                log.emit(
                    log.event(PipelineEventKind::SessionCancelled)
                        .with("state", state_value(pipeline.state)),
                );
                Err(err)
            }
            Err(err) => {
                pipeline.fail();
                tracing::warn!(session_id = %session.id, "Session failed: {}", err);
                let mut event = log
                    .event(PipelineEventKind::SessionFailed)
                    .with("error", err.to_string())
                    .with("state", state_value(pipeline.state));
                if let Some(phase) = err.failed_phase() {
                    event = event.with_phase(phase);
                }
                log.emit(event);
                self.metrics.record_failure(
                    session,
                    &err,
                    pipeline.state,
                    std::mem::take(&mut log.events),
                );
                Err(err)
            }
        }
    }

    async fn run_phases(
        &self,
        session: &Session,
        pipeline: &mut Pipeline,
        log: &mut EventLog<'_>,
    ) -> Result<PipelineResult, PipelineError> {
        let clock = Instant::now();
        let request = session.request.as_ref();
        let cancelled = || PipelineError::Cancelled {
            session_id: session.id.clone(),
        };

        let constraints = request.resolved_constraints()?;
        let max_parallel_steps = constraints
            .max_parallel_steps
            .map_or(self.default_max_parallel_steps, |n| {
                n.min(self.default_max_parallel_steps)
            });
        let env = StageEnv {
            executor: &self.executor,
            constraints: &constraints,
            max_parallel_steps,
            cancel: &session.cancel,
        };

        let mut results: Vec<PhaseResult> = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let phase = pipeline.advance().unwrap_or_else(|| stage.phase());
            log.emit(log.event(PipelineEventKind::PhaseStarted).with_phase(phase));
            tracing::debug!(session_id = %session.id, %phase, "Phase started");

            let (participants, previous) = match results.last() {
                Some(prev) => (prev.participants.as_slice(), Some(prev)),
                None => (request.participants.as_slice(), None),
            };
            let ctx = PhaseContext {
                session_id: &session.id,
                phase,
                request,
                previous,
                participants,
            };

            let outcome = tokio::select! {
                biased;
                _ = session.cancel.cancelled() => Err(cancelled()),
                result = stage.run(&ctx, &env) => result,
            };

            let result = outcome?;

            tracing::debug!(
                session_id = %session.id,
                %phase,
                score = result.score,
                efficiency = result.efficiency,
                "Phase completed"
            );
            log.emit(
                log.event(PipelineEventKind::PhaseCompleted)
                    .with_phase(phase)
                    .with("score", result.score)
                    .with("efficiency", result.efficiency)
                    .with("steps", result.steps.len()),
            );
            results.push(result);
        }

        if session.cancel.is_cancelled() {
            return Err(cancelled());
        }

        // Validation
        pipeline.advance();
        let transformed = results
            .last()
            .map(|r| r.participants.clone())
            .unwrap_or_else(|| request.participants.clone());
        let final_depth = results.last().map_or(0.0, |r| r.score);
        let advantage = advantage(&request.participants, &transformed);
        let efficiency = if results.is_empty() {
            0.0
        } else {
            results.iter().map(|r| r.efficiency).sum::<f64>() / results.len() as f64
        };
        let success =
            final_depth >= request.target_threshold && advantage >= self.minimum_advantage;
        pipeline.advance();

        log.emit(
            log.event(PipelineEventKind::SessionCompleted)
                .with("final_depth", final_depth)
                .with("advantage", advantage)
                .with("success", success)
                .with("state", state_value(pipeline.state)),
        );

        Ok(PipelineResult {
            session_id: session.id.clone(),
            level: request.level,
            original_participants: request.participants.clone(),
            transformed_participants: transformed,
            final_depth,
            advantage,
            efficiency,
            success,
            state: pipeline.state,
            execution_time: clock.elapsed(),
            started_at: session.started_at,
            completed_at: Utc::now(),
            phases: results,
            events: std::mem::take(&mut log.events),
        })
    }
}

fn state_value(state: PipelineState) -> serde_json::Value {
    serde_json::to_value(state).unwrap_or_default()
}

/// Build a standard stage for each configured phase
pub fn standard_stages(
    config: &CoordinatorConfig,
    strategy: Arc<dyn ScoringStrategy>,
) -> Vec<Arc<dyn PhaseStage>> {
    config
        .phases
        .iter()
        .map(|phase| {
            Arc::new(StandardStage::new(phase.clone(), Arc::clone(&strategy))) as Arc<dyn PhaseStage>
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhaseConfig;
    use crate::models::Request;
    use crate::scoring::FixedScoring;
    use crate::swarm::steps::Step;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct ExactWork;

    #[async_trait]
    impl UnitOfWork for ExactWork {
        async fn perform(&self, step: &Step, _phase: &PhaseConfig) -> anyhow::Result<f64> {
            Ok(step.magnitude)
        }
    }

    /// Stage that always raises
    struct Broken(PipelinePhase);

    #[async_trait]
    impl PhaseStage for Broken {
        fn phase(&self) -> PipelinePhase {
            self.0
        }

        async fn run(
            &self,
            _ctx: &PhaseContext<'_>,
            _env: &StageEnv<'_>,
        ) -> Result<PhaseResult, PipelineError> {
            Err(PipelineError::phase(self.0, "strategy unavailable"))
        }
    }

    fn engine(strategy: FixedScoring) -> (PipelineEngine, Arc<MetricsAggregator>) {
        let metrics = Arc::new(MetricsAggregator::default());
        let engine = PipelineEngine::from_config(
            &CoordinatorConfig::default(),
            Arc::new(strategy),
            Arc::new(ExactWork),
            Arc::clone(&metrics),
        );
        (engine, metrics)
    }

    fn session(threshold: f64) -> Session {
        let request = Request::new(
            vec![Participant::new("a", 0.5), Participant::new("b", 0.5)],
            CoordinationLevel::Advanced,
            threshold,
        );
        Session::open(Arc::new(request), CancellationToken::new())
    }

    #[test]
    fn test_advantage_ratio() {
        let original = vec![Participant::new("a", 0.5)];
        let transformed = vec![Participant::new("a", 0.75)];
        assert!((advantage(&original, &transformed) - 0.5).abs() < 1e-12);
        let zero = vec![Participant::new("a", 0.0)];
        assert_eq!(advantage(&zero, &transformed), 0.0);
    }

    #[tokio::test]
    async fn test_phases_run_in_order_and_chain() {
        // 4 fan-out phases × one 0.1 step: capability × 1.1^4
        let (engine, metrics) = engine(FixedScoring::uniform(0.96, 0.1, 1));
        let session = session(0.95);
        let result = engine.run(&session, None).await.unwrap();

        let order: Vec<PipelinePhase> = result.phases.iter().map(|p| p.phase).collect();
        assert_eq!(order, engine.phases()[..5].to_vec());
        assert!((result.final_depth - 0.96).abs() < 1e-12);
        assert!((result.advantage - (1.1f64.powi(4) - 1.0)).abs() < 1e-9);
        assert!(result.success);
        assert_eq!(result.state, PipelineState::Complete);

        // Every phase consumed the participants the previous one produced
        for pair in result.phases.windows(2) {
            let expected = pair[0].participants[0].capability * (1.0 + pair[1].gain);
            assert!((pair[1].participants[0].capability - expected).abs() < 1e-12);
        }

        let kinds: Vec<PipelineEventKind> = result.events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds.first(), Some(&PipelineEventKind::SessionStarted));
        assert_eq!(kinds.last(), Some(&PipelineEventKind::SessionCompleted));
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == PipelineEventKind::PhaseCompleted)
                .count(),
            5
        );
        assert_eq!(metrics.snapshot().total_sessions, 1);
    }

    #[tokio::test]
    async fn test_failure_aborts_and_records() {
        let (mut engine, metrics) = engine(FixedScoring::uniform(0.9, 0.1, 1));
        let mut stages = standard_stages(
            &CoordinatorConfig::default(),
            Arc::new(FixedScoring::uniform(0.9, 0.1, 1)),
        );
        stages[2] = Arc::new(Broken(PipelinePhase::Coordination));
        engine.set_stages(stages);

        let (tx, mut rx) = mpsc::channel(64);
        let session = session(0.5);
        let err = engine.run(&session, Some(&tx)).await.unwrap_err();
        assert_eq!(err.failed_phase(), Some(PipelinePhase::Coordination));

        let snap = metrics.snapshot();
        assert_eq!(snap.total_sessions, 0);
        assert_eq!(snap.total_failures, 1);

        let failures = metrics.recent_failures();
        assert_eq!(
            failures[0].state,
            PipelineState::Failed(Some(PipelinePhase::Coordination))
        );
        let trail = &failures[0].events;
        assert_eq!(trail.first().map(|e| e.kind), Some(PipelineEventKind::SessionStarted));
        assert_eq!(trail.last().map(|e| e.kind), Some(PipelineEventKind::SessionFailed));

        drop(tx);
        let mut streamed = Vec::new();
        while let Some(event) = rx.recv().await {
            streamed.push(event);
        }
        // Synthesis never started
        assert!(!streamed
            .iter()
            .any(|e| e.phase == Some(PipelinePhase::Synthesis)));
        let last = streamed.last().unwrap();
        assert_eq!(last.kind, PipelineEventKind::SessionFailed);
        assert_eq!(last.phase, Some(PipelinePhase::Coordination));
    }

    #[tokio::test]
    async fn test_failed_trail_kept_without_listener() {
        let (engine, metrics) = engine(FixedScoring::uniform(0.6, 0.1, 1));
        let request = Request::new(
            vec![Participant::new("a", 0.5)],
            CoordinationLevel::Basic,
            0.5,
        )
        .with_requirements(crate::models::Requirements {
            minimum_readiness: 0.9,
            minimum_efficiency: 0.0,
        });
        let session = Session::open(Arc::new(request), CancellationToken::new());

        let err = engine.run(&session, None).await.unwrap_err();
        assert_eq!(err.failed_phase(), Some(PipelinePhase::Assessment));

        let failures = metrics.recent_failures();
        assert_eq!(failures.len(), 1);
        let kinds: Vec<PipelineEventKind> = failures[0].events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                PipelineEventKind::SessionStarted,
                PipelineEventKind::PhaseStarted,
                PipelineEventKind::SessionFailed,
            ]
        );
        assert_eq!(
            failures[0].state,
            PipelineState::Failed(Some(PipelinePhase::Assessment))
        );
    }

    #[tokio::test]
    async fn test_cancelled_session_records_nothing() {
        let (engine, metrics) = engine(FixedScoring::uniform(0.9, 0.1, 1));
        let session = session(0.5);
        session.cancel.cancel();

        let (tx, mut rx) = mpsc::channel(64);
        let err = engine.run(&session, Some(&tx)).await.unwrap_err();
        assert!(err.is_cancelled());

        drop(tx);
        let mut last = None;
        while let Some(event) = rx.recv().await {
            last = Some(event);
        }
        let last = last.unwrap();
        assert_eq!(last.kind, PipelineEventKind::SessionCancelled);
        assert_eq!(
            last.data.get("state"),
            Some(&serde_json::json!({ "state": "cancelled" }))
        );

        let snap = metrics.snapshot();
        assert_eq!(snap.total_sessions, 0);
        assert_eq!(snap.total_failures, 0);
    }
}
