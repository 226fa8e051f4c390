//! Grid runtime wiring: environment configuration, tracing setup, the
//! shared [`GridRuntime`] and the [`GridRunner`] orchestrator.

pub mod config;
pub mod runner;
pub mod runtime;
pub mod telemetry;

pub use config::{ConfigError, RuntimeConfig};
pub use runner::{CellRenderer, GridOutcome, GridRunner, RenderError, RenderedCell, RunnerError};
pub use runtime::GridRuntime;
