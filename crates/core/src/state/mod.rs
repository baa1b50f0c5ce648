//! # Shared State
//!
//! The only mutable state shared between sessions: the session registry and
//! the metrics aggregator. Pipelines touch it exclusively through these APIs.

pub mod metrics;
pub mod registry;

pub use metrics::{decay, FailureRecord, FrameworkMetrics, MetricsAggregator};
pub use registry::{Session, SessionGuard, SessionRegistry};
