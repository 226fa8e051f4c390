//! Pure domain logic for XYZ grid generation.
//!
//! Everything in this crate is free of I/O and locking so it can be tested
//! in isolation:
//!
//! - [`progress`] -- the per-batch progress record and its derived metrics.
//! - [`load_order`] -- resource load-order planning and caching strategy.
//! - [`grid`] -- axis definitions and cell enumeration for a grid plan.

pub mod error;
pub mod grid;
pub mod load_order;
pub mod progress;
pub mod types;

pub use error::CoreError;
