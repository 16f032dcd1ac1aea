//! # Pipeflow
//!
//! A flow-based parallel pipeline framework.
//!
//! Pipeflow lets you describe a computation as a directed acyclic graph
//! of stages, each wrapping a small composed function, and run it with:
//!
//! - **Reusable worker pools**: Stride-batched dispatch across thread,
//!   process and remote workers, with ordering, timeout and skip control
//! - **In-band failure flow**: Per-item errors travel as data and never
//!   abort a run
//! - **Cardinality reshaping**: Group, replicate and realign item streams
//!   between stages
//! - **Lifecycle discipline**: Connect, start, pause, resume and stop are
//!   explicit and strictly checked
//! - **Persistence**: Save a topology as JSON and rebuild it against a
//!   step registry
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pipeflow::prelude::*;
//!
//! let registry = StepRegistry::with_builtins();
//! registry.register("double", |input: &StepInput<'_>| {
//!     Ok(serde_json::json!(input.first()?.as_i64().unwrap_or(0) * 2))
//! })?;
//!
//! let mut pipeline = Pipeline::new("doubler");
//! pipeline.add_stage(Stage::new(
//!     Unit::new(registry.get("double")?),
//!     Executor::Inline,
//!     StageConfig::new("double"),
//! ))?;
//!
//! pipeline.start(vec![vec![serde_json::json!(21)]])?;
//! pipeline.run()?;
//! pipeline.wait().await?;
//! pipeline.stop()?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod dag;
pub mod engine;
pub mod errors;
pub mod graph;
pub mod item;
pub mod pipeline;
pub mod stage;
pub mod unit;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::dag::{StageDag, StageId};
    pub use crate::engine::{
        Engine, EngineConfig, RemotePeer, TaskHandle, TaskOptions, WorkerKind,
    };
    pub use crate::errors::{CycleError, PipeflowError, UsageError};
    pub use crate::graph::Graph;
    pub use crate::item::{CapturedError, Item};
    pub use crate::pipeline::description::PipelineDescription;
    pub use crate::pipeline::{Pipeline, PipelineState, PipelineStats};
    pub use crate::stage::{Executor, Stage, StageConfig, StageState, UpstreamSource};
    pub use crate::unit::{BoundStep, Step, StepInput, StepRegistry, Unit};
}
