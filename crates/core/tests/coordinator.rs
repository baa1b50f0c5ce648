//! End-to-end coordinator behaviour: session lifecycle, validation outcome,
//! rolling metrics, batches and cancellation.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use conductor_core::config::{CoordinatorConfig, PhaseConfig};
use conductor_core::models::{
    ConstraintPriority, ConstraintValue, CoordinationLevel, Participant, ProcessingConstraint,
    Request, Requirements, STEP_BUDGET,
};
use conductor_core::scoring::{Assessment, FixedScoring, ScoringStrategy};
use conductor_core::swarm::{
    Coordinator, PhaseContext, PipelineEventKind, PipelinePhase, PipelineState, Step, UnitOfWork,
};
use conductor_core::PipelineError;

/// Returns exactly the planned magnitude
struct ExactWork;

#[async_trait]
impl UnitOfWork for ExactWork {
    async fn perform(&self, step: &Step, _phase: &PhaseConfig) -> anyhow::Result<f64> {
        Ok(step.magnitude)
    }
}

/// Never completes
struct PendingWork;

#[async_trait]
impl UnitOfWork for PendingWork {
    async fn perform(&self, _step: &Step, _phase: &PhaseConfig) -> anyhow::Result<f64> {
        std::future::pending::<()>().await;
        Ok(0.0)
    }
}

/// Scores every phase with the first participant's `depth` attribute
struct AttributeDepth;

#[async_trait]
impl ScoringStrategy for AttributeDepth {
    async fn assess(&self, ctx: &PhaseContext<'_>) -> anyhow::Result<Assessment> {
        let depth = ctx
            .participants
            .first()
            .and_then(|p| p.attributes.get("depth").copied())
            .ok_or_else(|| anyhow::anyhow!("participant has no depth attribute"))?;
        Ok(Assessment::new(depth, depth, depth))
    }

    fn plan_steps(&self, _ctx: &PhaseContext<'_>, _assessment: &Assessment) -> Vec<Step> {
        vec![Step::new(conductor_core::swarm::StepKind::Amplification, 0.1)]
    }
}

fn coordinator(strategy: Arc<dyn ScoringStrategy>) -> Coordinator {
    Coordinator::new(CoordinatorConfig::default())
        .unwrap()
        .with_strategy(strategy)
        .with_unit_of_work(Arc::new(ExactWork))
}

fn request(threshold: f64) -> Request {
    Request::new(
        vec![Participant::new("a", 0.5), Participant::new("b", 0.7)],
        CoordinationLevel::Advanced,
        threshold,
    )
}

async fn wait_for_sessions(coordinator: &Coordinator, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while coordinator.active_sessions() != expected {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_registry_returns_to_baseline() {
    let coordinator = coordinator(Arc::new(FixedScoring::uniform(0.9, 0.1, 2)));
    assert_eq!(coordinator.active_sessions(), 0);

    assert_ok!(coordinator.execute(request(0.5)).await);
    assert_eq!(coordinator.active_sessions(), 0);

    let failing = request(0.5).with_requirements(Requirements {
        minimum_readiness: 0.95,
        minimum_efficiency: 0.0,
    });
    assert_err!(coordinator.execute(failing).await);
    assert_eq!(coordinator.active_sessions(), 0);
}

#[tokio::test]
async fn test_one_item_per_step() {
    let coordinator = coordinator(Arc::new(FixedScoring::uniform(0.9, 0.05, 5)));
    let result = assert_ok!(coordinator.execute(request(0.5)).await);

    for phase in &result.phases {
        match phase.phase {
            PipelinePhase::Assessment => assert!(phase.steps.is_empty()),
            _ => {
                assert_eq!(phase.steps.len(), 5);
                let mut ids: Vec<&str> = phase.steps.iter().map(|s| s.step_id.as_str()).collect();
                ids.dedup();
                assert_eq!(ids.len(), 5);
            }
        }
    }
    assert_eq!(coordinator.get_status().executor.steps_executed, 20);
}

#[tokio::test]
async fn test_success_needs_threshold_and_advantage() {
    // Four fanned-out phases, one step each: advantage = 1.1^4 - 1 ≈ 0.464
    let coordinator = coordinator(Arc::new(FixedScoring::uniform(0.96, 0.1, 1)));
    let result = assert_ok!(coordinator.execute(request(0.95)).await);
    assert!((result.final_depth - 0.96).abs() < 1e-12);
    assert!(result.advantage >= 0.4);
    assert!(result.success);
    assert_eq!(result.state, PipelineState::Complete);

    // Depth short of the threshold
    let result = assert_ok!(coordinator.execute(request(0.97)).await);
    assert!(!result.success);

    // Depth reached but advantage ≈ 0.2155
    let weak = self::coordinator(Arc::new(FixedScoring::uniform(0.96, 0.05, 1)));
    let result = assert_ok!(weak.execute(request(0.95)).await);
    assert!(result.advantage < 0.4);
    assert!(!result.success);
}

#[tokio::test]
async fn test_metrics_follow_decayed_average() {
    let coordinator = coordinator(Arc::new(AttributeDepth));
    for depth in [0.2, 0.8, 0.6] {
        let req = Request::new(
            vec![Participant::new("a", 0.5).with_attribute("depth", depth)],
            CoordinationLevel::Basic,
            0.1,
        );
        assert_ok!(coordinator.execute(req).await);
    }

    let metrics = coordinator.get_status().metrics;
    assert_eq!(metrics.total_sessions, 3);
    assert!((metrics.average_depth - 0.525).abs() < 1e-12);
    assert_eq!(metrics.successful_outcomes, 3);
}

#[tokio::test]
async fn test_failures_recorded_without_touching_averages() {
    let coordinator = coordinator(Arc::new(FixedScoring::uniform(0.6, 0.1, 1)));
    let failing = request(0.5).with_requirements(Requirements {
        minimum_readiness: 0.9,
        minimum_efficiency: 0.0,
    });
    let err = assert_err!(coordinator.execute(failing).await);
    assert!(matches!(
        err,
        PipelineError::RequirementNotMet {
            phase: PipelinePhase::Assessment,
            ..
        }
    ));

    let status = coordinator.get_status();
    assert_eq!(status.metrics.total_sessions, 0);
    assert_eq!(status.metrics.total_failures, 1);
    assert_eq!(status.metrics.average_depth, 0.0);
    assert_eq!(status.recent_failures.len(), 1);
    assert_eq!(
        status.recent_failures[0].phase,
        Some(PipelinePhase::Assessment)
    );
    assert_eq!(
        status.recent_failures[0].state,
        PipelineState::Failed(Some(PipelinePhase::Assessment))
    );
}

#[tokio::test]
async fn test_failed_trail_survives_full_listener() {
    let (tx, mut rx) = mpsc::channel(1);
    let coordinator =
        coordinator(Arc::new(FixedScoring::uniform(0.6, 0.1, 1))).with_event_channel(tx);
    let failing = request(0.5).with_requirements(Requirements {
        minimum_readiness: 0.9,
        minimum_efficiency: 0.0,
    });
    assert_err!(coordinator.execute(failing).await);

    // The listener only had room for the first event
    let streamed = rx.try_recv().unwrap();
    assert_eq!(streamed.kind, PipelineEventKind::SessionStarted);
    assert!(rx.try_recv().is_err());

    let failures = coordinator.get_status().recent_failures;
    assert_eq!(failures.len(), 1);
    let kinds: Vec<PipelineEventKind> = failures[0].events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds.first(), Some(&PipelineEventKind::SessionStarted));
    assert_eq!(kinds.last(), Some(&PipelineEventKind::SessionFailed));
    assert!(failures[0].events.iter().all(|e| e.session_id == streamed.session_id));
}

#[tokio::test]
async fn test_batch_counts_failures() {
    let coordinator = coordinator(Arc::new(FixedScoring::uniform(0.96, 0.1, 1)));
    let batch = coordinator
        .execute_batch(vec![request(0.95), request(1.5), request(0.5)])
        .await;

    assert_eq!(batch.total, 3);
    assert_eq!(batch.succeeded, 2);
    assert_eq!(batch.failed, 1);
    assert!((batch.success_rate - 2.0 / 3.0).abs() < 1e-12);
    assert!((batch.average_depth.unwrap() - 0.96).abs() < 1e-12);
    assert!(batch.outcomes[1].error.is_some());
    assert!(batch.outcomes[1].result.is_none());
}

#[tokio::test]
async fn test_step_budget_constraint() {
    let coordinator = coordinator(Arc::new(FixedScoring::uniform(0.9, 0.05, 6)));
    let req = request(0.5)
        .with_constraint(ProcessingConstraint::new(
            STEP_BUDGET,
            ConstraintValue::Number(4.0),
            ConstraintPriority::Low,
        ))
        .with_constraint(ProcessingConstraint::new(
            STEP_BUDGET,
            ConstraintValue::Number(2.0),
            ConstraintPriority::High,
        ));
    let result = assert_ok!(coordinator.execute(req).await);
    assert!(result
        .phases
        .iter()
        .filter(|p| p.phase != PipelinePhase::Assessment)
        .all(|p| p.steps.len() == 2));
}

#[tokio::test]
async fn test_concurrent_sessions_share_metrics() {
    let coordinator = Arc::new(coordinator(Arc::new(FixedScoring::uniform(0.9, 0.05, 3))));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let c = Arc::clone(&coordinator);
        handles.push(tokio::spawn(async move { c.execute(request(0.5)).await }));
    }
    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }

    let status = coordinator.get_status();
    assert_eq!(status.active_sessions, 0);
    assert_eq!(status.metrics.total_sessions, 8);
    assert_eq!(status.executor.steps_executed, 8 * 4 * 3);
}

#[tokio::test]
async fn test_caller_token_cancels_session() {
    let coordinator = Arc::new(
        Coordinator::new(CoordinatorConfig::default())
            .unwrap()
            .with_strategy(Arc::new(FixedScoring::uniform(0.9, 0.1, 2)))
            .with_unit_of_work(Arc::new(PendingWork)),
    );
    let token = CancellationToken::new();

    let c = Arc::clone(&coordinator);
    let t = token.clone();
    let handle = tokio::spawn(async move { c.execute_with_cancellation(request(0.5), &t).await });

    wait_for_sessions(&coordinator, 1).await;
    token.cancel();

    let err = assert_err!(handle.await.unwrap());
    assert!(err.is_cancelled());
    assert_eq!(coordinator.active_sessions(), 0);

    let metrics = coordinator.get_status().metrics;
    assert_eq!(metrics.total_sessions, 0);
    assert_eq!(metrics.total_failures, 0);
}

#[tokio::test]
async fn test_cancel_by_session_id() {
    let (tx, mut rx) = mpsc::channel(64);
    let coordinator = Arc::new(
        Coordinator::new(CoordinatorConfig::default())
            .unwrap()
            .with_strategy(Arc::new(FixedScoring::uniform(0.9, 0.1, 2)))
            .with_unit_of_work(Arc::new(PendingWork))
            .with_event_channel(tx),
    );

    let c = Arc::clone(&coordinator);
    let handle = tokio::spawn(async move { c.execute(request(0.5)).await });

    let started = rx.recv().await.unwrap();
    assert_eq!(started.kind, PipelineEventKind::SessionStarted);
    wait_for_sessions(&coordinator, 1).await;

    assert!(coordinator.cancel(&started.session_id));
    let err = assert_err!(handle.await.unwrap());
    assert!(err.is_cancelled());
    assert!(!coordinator.cancel(&started.session_id));
    assert_eq!(coordinator.active_sessions(), 0);

    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        last = Some(event);
    }
    let last = last.unwrap();
    assert_eq!(last.kind, PipelineEventKind::SessionCancelled);
    assert_eq!(
        last.data.get("state"),
        Some(&serde_json::json!({ "state": "cancelled" }))
    );
    assert!(coordinator.get_status().recent_failures.is_empty());
}

#[tokio::test]
async fn test_dropped_execution_retires_session() {
    let coordinator = Coordinator::new(CoordinatorConfig::default())
        .unwrap()
        .with_strategy(Arc::new(FixedScoring::uniform(0.9, 0.1, 2)))
        .with_unit_of_work(Arc::new(PendingWork));

    let outcome =
        tokio::time::timeout(Duration::from_millis(20), coordinator.execute(request(0.5))).await;
    assert!(outcome.is_err());
    assert_eq!(coordinator.active_sessions(), 0);
}
