//! Per-class release strategies.
//!
//! When an entry leaves the cache, its class's [`ReleaseStrategy`] gets a
//! chance to move the resource off the compute device (e.g. offload model
//! weights to host memory) before the cache drops its reference. Strategies
//! are best effort: any error, or panic, is logged and cleanup continues.

use std::panic::{catch_unwind, AssertUnwindSafe};

/// Errors a release strategy may report. The cache never propagates them.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("Failed to offload '{name}': {reason}")]
    Offload { name: String, reason: String },

    #[error("Release failed: {0}")]
    Other(String),
}

/// Relocates a resource off the active device when it is released.
pub trait ReleaseStrategy<H>: Send + Sync {
    fn release(&self, name: &str, handle: &H) -> Result<(), ReleaseError>;
}

impl<H, F> ReleaseStrategy<H> for F
where
    F: Fn(&str, &H) -> Result<(), ReleaseError> + Send + Sync,
{
    fn release(&self, name: &str, handle: &H) -> Result<(), ReleaseError> {
        self(name, handle)
    }
}

/// Leaves the resource where it is; dropping the handle is the only release.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepInPlace;

impl<H> ReleaseStrategy<H> for KeepInPlace {
    fn release(&self, _name: &str, _handle: &H) -> Result<(), ReleaseError> {
        Ok(())
    }
}

/// Run `strategy` for one resource, containing errors and panics.
pub(crate) fn release_best_effort<H>(
    strategy: &dyn ReleaseStrategy<H>,
    class: &str,
    name: &str,
    handle: &H,
) {
    match catch_unwind(AssertUnwindSafe(|| strategy.release(name, handle))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(
                class,
                name,
                error = %e,
                "Resource release failed, dropping handle anyway",
            );
        }
        Err(_) => {
            tracing::warn!(class, name, "Resource release panicked, dropping handle anyway");
        }
    }
}
