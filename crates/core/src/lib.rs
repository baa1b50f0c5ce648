//! # Conductor Core
//!
//! The engine behind Conductor: session lifecycle, phased pipeline execution,
//! parallel step fan-out and rolling metrics under concurrent access.
//!
//! ## Architecture
//!
//! - `models` - Requests, participants, capabilities and constraints
//! - `config` - Per-phase thresholds, gain ranges and coordinator limits
//! - `scoring` - Pluggable `ScoringStrategy` behind every phase
//! - `state/` - Session registry and metrics aggregator
//! - `swarm/` - Stages, step executor, pipeline engine and coordinator
//!
//! ## Usage
//!
//! ```rust,ignore
//! use conductor_core::config::CoordinatorConfig;
//! use conductor_core::models::{CoordinationLevel, Participant, Request};
//! use conductor_core::swarm::Coordinator;
//!
//! let coordinator = Coordinator::new(CoordinatorConfig::default())?;
//! let request = Request::new(vec![Participant::new("a", 0.6)], CoordinationLevel::Advanced, 0.8);
//! let result = coordinator.execute(request).await?;
//! ```

pub mod config;
pub mod error;
pub mod models;
pub mod scoring;
pub mod state;
pub mod swarm;

pub use config::{CoordinatorConfig, PhaseConfig, DEFAULT_MINIMUM_ADVANTAGE};
pub use error::PipelineError;
pub use models::Request;
pub use swarm::{Coordinator, PipelineResult};
