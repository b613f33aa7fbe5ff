//! # Surge Core
//!
//! Data model shared by every Surge crate:
//! - [`StepGraph`] - layered DAG of workflow steps, validated at load time
//! - [`Request`] / [`Url`] - protocol-neutral operation description
//! - [`OpResult`] - immutable per-operation record with phase timings
//! - [`ErrorKind`] / [`SurgeError`] - the closed error set
//! - [`SnowflakeGenerator`] - ordered entry ids for the replication log
//! - [`WorkflowOptions`] - global run knobs and their string forms
//!
//! ```text
//!   workflow ──► StepGraph ──► engine ──► Request ──► client ──► OpResult
//!                                                                    │
//!                                                        aggregator ◄┘
//! ```

pub mod address;
pub mod clock;
pub mod error;
pub mod graph;
pub mod options;
pub mod request;
pub mod result;
pub mod types;

pub use address::*;
pub use clock::*;
pub use error::*;
pub use graph::*;
pub use options::*;
pub use request::*;
pub use result::*;
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::address::{Origin, ResolvedUrl, Url};
    pub use crate::clock::{EntryId, SnowflakeGenerator};
    pub use crate::error::{ErrorKind, Result, SurgeError};
    pub use crate::graph::{StepGraph, StepNode};
    pub use crate::options::{PersonaKind, Rate, WorkflowOptions};
    pub use crate::request::{Body, Headers, Request};
    pub use crate::result::{OpContext, OpError, OpRecorder, OpResult, Phase, Phases};
    pub use crate::types::*;
}
