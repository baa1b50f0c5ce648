//! # Coordinator
//!
//! Public entry point. Validates a request, opens a tracked session, hands
//! it to the pipeline engine and guarantees the session is retired on every
//! exit path. Also exposes batch execution, status snapshots, cancellation
//! and the optimize hook.
//!
//! Construct one coordinator per process (or per test) and share it behind
//! an `Arc`; there is no global instance.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{check_stage_order, CoordinatorConfig};
use crate::error::PipelineError;
use crate::models::Request;
use crate::scoring::{BaselineScoring, ScoringStrategy};
use crate::state::metrics::{FailureRecord, FrameworkMetrics, MetricsAggregator};
use crate::state::registry::{Session, SessionRegistry};

use super::engine::{standard_stages, PipelineEngine, PipelineResult};
use super::events::PipelineEvent;
use super::pipeline::PipelinePhase;
use super::stage::PhaseStage;
use super::steps::{ExecutorStatsSnapshot, SimulatedWork, StepExecutor, UnitOfWork};

/// Point-in-time view of the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkStatus {
    pub active_sessions: usize,
    pub metrics: FrameworkMetrics,
    pub executor: ExecutorStatsSnapshot,
    pub recent_failures: Vec<FailureRecord>,
    pub phases: Vec<PipelinePhase>,
}

/// Outcome of one request within a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PipelineResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate outcome of a sequential batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub outcomes: Vec<BatchOutcome>,
    pub total: usize,
    /// Requests that executed without error
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    /// Mean final depth over the executed requests; None when none executed
    pub average_depth: Option<f64>,
    /// Mean advantage over the executed requests; None when none executed
    pub average_advantage: Option<f64>,
}

impl BatchResult {
    fn from_outcomes(outcomes: Vec<BatchOutcome>) -> Self {
        let total = outcomes.len();
        let executed: Vec<&PipelineResult> =
            outcomes.iter().filter_map(|o| o.result.as_ref()).collect();
        let succeeded = executed.len();
        let mean = |f: fn(&PipelineResult) -> f64| {
            if executed.is_empty() {
                None
            } else {
                Some(executed.iter().map(|r| f(r)).sum::<f64>() / succeeded as f64)
            }
        };
        let average_depth = mean(|r| r.final_depth);
        let average_advantage = mean(|r| r.advantage);
        Self {
            total,
            succeeded,
            failed: total - succeeded,
            success_rate: if total == 0 {
                0.0
            } else {
                succeeded as f64 / total as f64
            },
            average_depth,
            average_advantage,
            outcomes,
        }
    }
}

/// Extension point invoked with the current status
#[async_trait]
pub trait Optimizer: Send + Sync {
    async fn optimize(&self, status: &FrameworkStatus) -> anyhow::Result<()>;
}

/// Optimizer that does nothing
#[derive(Debug, Clone, Default)]
pub struct NoopOptimizer;

#[async_trait]
impl Optimizer for NoopOptimizer {
    async fn optimize(&self, _status: &FrameworkStatus) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The pipeline coordinator
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<SessionRegistry>,
    metrics: Arc<MetricsAggregator>,
    engine: PipelineEngine,
    optimizer: Arc<dyn Optimizer>,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl Coordinator {
    /// Create a coordinator with the baseline strategy and simulated work
    pub fn new(config: CoordinatorConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let metrics = Arc::new(MetricsAggregator::new(config.max_failure_records));
        let engine = PipelineEngine::from_config(
            &config,
            Arc::new(BaselineScoring),
            Arc::new(SimulatedWork),
            Arc::clone(&metrics),
        );
        Ok(Self {
            config,
            registry: SessionRegistry::new(),
            metrics,
            engine,
            optimizer: Arc::new(NoopOptimizer),
            event_tx: None,
        })
    }

    /// Use a scoring strategy for every configured phase.
    ///
    /// Rebuilds the standard stages from the config, replacing any stages
    /// installed through [`Coordinator::with_stages`]; call that one last.
    pub fn with_strategy(mut self, strategy: Arc<dyn ScoringStrategy>) -> Self {
        self.engine.set_stages(standard_stages(&self.config, strategy));
        self
    }

    /// Replace the unit of work behind the step executor
    pub fn with_unit_of_work(mut self, work: Arc<dyn UnitOfWork>) -> Self {
        self.engine.set_executor(StepExecutor::new(work));
        self
    }

    /// Replace the stage list outright; stages must be unique, in pipeline
    /// order and exclude Validation, which always runs last
    pub fn with_stages(mut self, stages: Vec<Arc<dyn PhaseStage>>) -> Result<Self, PipelineError> {
        check_stage_order(stages.iter().map(|s| s.phase()))?;
        self.engine.set_stages(stages);
        Ok(self)
    }

    pub fn with_optimizer(mut self, optimizer: Arc<dyn Optimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Set event channel for streaming events
    pub fn with_event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Number of sessions in flight
    pub fn active_sessions(&self) -> usize {
        self.registry.count()
    }

    /// Execute one request
    pub async fn execute(&self, request: Request) -> Result<PipelineResult, PipelineError> {
        self.execute_with_cancellation(request, &CancellationToken::new())
            .await
    }

    /// Execute one request under a child of the caller's cancellation token
    #[tracing::instrument(
        skip(self, request, cancel),
        fields(participants = request.participants.len(), level = ?request.level)
    )]
    pub async fn execute_with_cancellation(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult, PipelineError> {
        request.validate()?;

        let session = Arc::new(Session::open(Arc::new(request), cancel.child_token()));
        let guard = self.registry.track(Arc::clone(&session)).ok_or_else(|| {
            PipelineError::InvalidRequest(format!("session id {} already in use", session.id))
        })?;
        tracing::info!(session_id = %session.id, "Session started");

        let outcome = self.engine.run(&session, self.event_tx.as_ref()).await;

        // Retire before reporting back, on success and failure alike
        drop(guard);

        match &outcome {
            Ok(result) => tracing::info!(
                session_id = %session.id,
                success = result.success,
                final_depth = result.final_depth,
                advantage = result.advantage,
                elapsed_ms = (result.execution_time.as_millis() as u64),
                "Session completed"
            ),
            Err(err) => tracing::warn!(session_id = %session.id, "Session ended with error: {}", err),
        }
        outcome
    }

    /// Cancel an in-flight session; false if no such session is running
    pub fn cancel(&self, session_id: &str) -> bool {
        self.registry.cancel(session_id)
    }

    /// Run requests one after another, collecting per-request outcomes
    pub async fn execute_batch(&self, requests: Vec<Request>) -> BatchResult {
        let mut outcomes = Vec::with_capacity(requests.len());
        for (index, request) in requests.into_iter().enumerate() {
            let outcome = match self.execute(request).await {
                Ok(result) => BatchOutcome {
                    index,
                    result: Some(result),
                    error: None,
                },
                Err(err) => BatchOutcome {
                    index,
                    result: None,
                    error: Some(err.to_string()),
                },
            };
            outcomes.push(outcome);
        }
        let batch = BatchResult::from_outcomes(outcomes);
        tracing::info!(
            total = batch.total,
            succeeded = batch.succeeded,
            "Batch completed"
        );
        batch
    }

    pub fn get_status(&self) -> FrameworkStatus {
        FrameworkStatus {
            active_sessions: self.registry.count(),
            metrics: self.metrics.snapshot(),
            executor: self.engine.executor_stats(),
            recent_failures: self.metrics.recent_failures(),
            phases: self.engine.phases(),
        }
    }

    /// Invoke the optimizer once with the current status
    pub async fn optimize(&self) -> anyhow::Result<()> {
        let status = self.get_status();
        self.optimizer.optimize(&status).await
    }

    /// Run the optimizer every `interval` until `cancel` fires
    pub fn spawn_optimizer(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.optimize().await {
                            tracing::warn!("Optimizer failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("Optimizer loop stopped");
        })
    }
}
