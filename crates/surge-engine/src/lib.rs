//! # Surge Engine
//!
//! Turns a [`Workflow`] into load:
//!
//! ```text
//!   Workflow ──► Registry::persona ──► Persona ──► Engine coordinator
//!                                                     │ tokens
//!                                    ┌────────────────┼────────────────┐
//!                                 worker 0         worker 1   ...   worker N-1
//!                                    │  ClientSet per worker (surge-protocols)
//!                                    └──────── Event::Result ──────────┘
//!                                                     ▼
//!                                 Aggregator ──► RunReport ──► SinkDispatcher
//! ```
//!
//! - [`workflow`] - typed step builders, validated immutable workflows
//! - [`persona`] - the nine load-shaping strategies
//! - [`engine`] - coordinator, drain and cancellation
//! - [`worker`] - per-thread reactors executing the step DAG
//! - [`aggregator`] - order-independent metrics folding
//! - [`sink`] - console, JSON lines, Prometheus and in-memory sinks
//! - [`distribution`] - load-curve samplers
//! - [`rate_limit`] - per-step token buckets
//! - [`registry`] - name-keyed constructors

pub mod aggregator;
pub mod distribution;
pub mod engine;
pub mod persona;
pub mod rate_limit;
pub mod registry;
pub mod sink;
pub mod worker;
pub mod workflow;

pub use aggregator::{Aggregator, MetricsSet, PhaseMeans, StepAggregate, QUANTILES};
pub use distribution::{Distribution, DistributionSpec};
pub use engine::{Engine, EngineConfig, RunReport};
pub use persona::{build_persona, Batch, Feedback, Pace, Persona, PersonaPlan};
pub use rate_limit::{LimitStrategy, RateLimit, StepLimiter};
pub use registry::{Registry, SinkFactory, WorkflowFactory};
pub use sink::{
    ConsoleSink, JsonFileSink, MemorySink, PrometheusSink, Sink, SinkBatch, SinkConfig,
    SinkDispatcher, SinkError,
};
pub use worker::{Event, Scope, Token};
pub use workflow::{Hook, Step, StepContext, StepOutput, StepSettings, Workflow, WorkflowBuilder};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::engine::{Engine, EngineConfig, RunReport};
    pub use crate::rate_limit::{LimitStrategy, RateLimit};
    pub use crate::registry::Registry;
    pub use crate::sink::{Sink, SinkConfig, SinkDispatcher};
    pub use crate::workflow::{Step, StepContext, StepOutput, Workflow};
    pub use surge_core::prelude::*;
}
