//! # Pipeline Orchestration
//!
//! Coordinates sessions through the phased pipeline.
//!
//! ## Pipeline Flow
//!
//! ```text
//! Coordinator.execute → Registry.insert → Assessment → Processing → Coordination
//!     → Synthesis → Orchestration → Validation → Metrics.record → Registry.remove
//! ```
//!
//! Each fan-out phase scatters its steps through the `StepExecutor` and
//! gathers every result before the next phase starts.

pub mod coordinator;
pub mod engine;
pub mod events;
pub mod pipeline;
pub mod stage;
pub mod steps;

pub use coordinator::{
    BatchOutcome, BatchResult, Coordinator, FrameworkStatus, NoopOptimizer, Optimizer,
};
pub use engine::{advantage, standard_stages, PipelineEngine, PipelineResult};
pub use events::{PipelineEvent, PipelineEventKind};
pub use pipeline::{Pipeline, PipelinePhase, PipelineState};
pub use stage::{PhaseContext, PhaseResult, PhaseStage, StageEnv, StandardStage};
pub use steps::{
    ExecutorStatsSnapshot, SimulatedWork, Step, StepContext, StepExecutor, StepKind,
    StepResultItem, UnitOfWork,
};
