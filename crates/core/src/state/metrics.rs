//! # Metrics Aggregator
//!
//! Process-lifetime rolling metrics. Averages use the decayed update
//! `avg' = (avg + new) / 2` starting from zero, not an arithmetic mean.
//!
//! All updates go through one mutex so each result is folded in exactly
//! once, in the order it crossed the lock. Failures are kept in a bounded
//! log and never touch the averages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::error::PipelineError;
use crate::state::registry::Session;
use crate::swarm::engine::PipelineResult;
use crate::swarm::events::PipelineEvent;
use crate::swarm::pipeline::{PipelinePhase, PipelineState};

/// Decayed rolling-average update
pub fn decay(average: f64, observation: f64) -> f64 {
    (average + observation) / 2.0
}

/// Point-in-time aggregate metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameworkMetrics {
    /// Completed executions folded into the averages
    pub total_sessions: u64,
    /// Completed executions whose result reported success
    pub successful_outcomes: u64,
    /// Executions that ended in a phase error
    pub total_failures: u64,
    pub average_depth: f64,
    pub average_advantage: f64,
    pub average_efficiency: f64,
    pub average_execution_secs: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// A session that failed with an error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub session_id: String,
    pub phase: Option<PipelinePhase>,
    /// Terminal pipeline state, e.g. `Failed(Some(Coordination))`
    pub state: PipelineState,
    pub error: String,
    pub started_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    /// The session's event trail, ending with `SessionFailed`
    pub events: Vec<PipelineEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    metrics: FrameworkMetrics,
    failures: VecDeque<FailureRecord>,
}

/// Thread-safe accumulator for framework metrics and the failure log
#[derive(Debug)]
pub struct MetricsAggregator {
    inner: Mutex<Inner>,
    max_failure_records: usize,
}

impl MetricsAggregator {
    pub fn new(max_failure_records: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_failure_records,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fold a completed result into the rolling averages
    pub fn record_success(&self, result: &PipelineResult) {
        let mut inner = self.lock();
        let m = &mut inner.metrics;
        m.total_sessions += 1;
        if result.success {
            m.successful_outcomes += 1;
        }
        m.average_depth = decay(m.average_depth, result.final_depth);
        m.average_advantage = decay(m.average_advantage, result.advantage);
        m.average_efficiency = decay(m.average_efficiency, result.efficiency);
        m.average_execution_secs = decay(
            m.average_execution_secs,
            result.execution_time.as_secs_f64(),
        );
        m.last_updated = Some(Utc::now());
    }

    /// Log a failed session and its event trail without perturbing the averages
    pub fn record_failure(
        &self,
        session: &Session,
        error: &PipelineError,
        state: PipelineState,
        events: Vec<PipelineEvent>,
    ) {
        let record = FailureRecord {
            session_id: session.id.clone(),
            phase: error.failed_phase(),
            state,
            error: error.to_string(),
            started_at: session.started_at,
            failed_at: Utc::now(),
            events,
        };
        let mut inner = self.lock();
        inner.metrics.total_failures += 1;
        if self.max_failure_records > 0 {
            if inner.failures.len() == self.max_failure_records {
                inner.failures.pop_front();
            }
            inner.failures.push_back(record);
        }
    }

    /// Consistent copy of the current metrics
    pub fn snapshot(&self) -> FrameworkMetrics {
        self.lock().metrics.clone()
    }

    /// Most recent failures, oldest first
    pub fn recent_failures(&self) -> Vec<FailureRecord> {
        self.lock().failures.iter().cloned().collect()
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(100)
    }
}
