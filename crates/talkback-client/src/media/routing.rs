//! Platform audio-routing hints
//!
//! Some devices route call-style audio to the earpiece or duck it behind the
//! proximity sensor. Hosts can install workarounds here; the session only
//! calls them and never depends on the outcome.

/// Best-effort routing adjustment applied when remote audio starts
pub trait AudioRoutingHint: Send + Sync {
    fn apply_best_effort(&self);
}

/// Default hint: nothing to adjust on desktop hosts
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRoutingHint;

impl AudioRoutingHint for NoRoutingHint {
    fn apply_best_effort(&self) {
        tracing::trace!("No audio routing adjustments for this platform");
    }
}
