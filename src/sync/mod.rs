//! Phase protocol and named barriers
//!
//! Kernels declare their phases and in-phase sync points in a [`PhasePlan`];
//! the [`BarrierCoordinator`] implements the rendezvous that separates them.

pub mod barrier;
pub mod phase;

pub use barrier::{BarrierCoordinator, BarrierKey, BarrierState, PoisonOnPanic};
pub use phase::{
    PhaseId, PhasePlan, PhasePlanBuilder, PhaseSpec, SyncId, SyncPoint, SyncScope, PUBLISH_TAG,
};
