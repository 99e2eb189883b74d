//! Runtime for functional stream processing stages.
//!
//! A stage applies one user [`logic::Function`] to the tuples arriving
//! on its input ports and submits what the function emits downstream.
//! Around the function, a stage can hold:
//!
//! - A [`window::Window`] of recent elements, optionally partitioned
//!   by key, evicted by count or age, and handed to the function when
//!   a trigger fires.
//!
//! - A [`join::JoinEngine`] that matches tuples arriving on a probe
//!   port against a window of the other port.
//!
//! - A [`queue::DecouplingQueue`] that hands tuples to the stage on a
//!   dedicated thread.
//!
//! - A [`metrics::MetricsReporter`] polling gauges the function
//!   registers.
//!
//! Stateful stages are checkpointed and restored at recovery
//! boundaries through a [`recovery::CheckpointCoordinator`].
//!
//! The host runtime drives a [`stage::Stage`] through the
//! [`stage::Operator`] calls it forwards.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod errors;
pub mod join;
pub mod logic;
pub mod mapping;
pub mod queue;
pub mod recovery;
pub mod stage;
pub mod testing;
pub mod timer;
pub mod tracing;
pub mod webserver;
pub mod window;

mod common;

pub use config::StageParams;
pub use errors::StageError;
pub use errors::StageResult;
pub use logic::Function;
pub use logic::LogicSpec;
pub use recovery::CheckpointCoordinator;
pub use stage::FunctionStage;
pub use stage::Stage;
