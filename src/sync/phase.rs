//! Named phases and sync points of a kernel
//!
//! Every phase ends at a grid-wide barrier carrying the phase's tag. Sync
//! points are additional rendezvous inside a phase, either grid-wide or among
//! the threads of one core. Phase tags and sync point tags share a single
//! namespace, checked once when the plan is built.

use std::collections::HashMap;
use std::fmt;

use crate::error::{ForgeResult, NpuForgeError};
use crate::grid::Grid;

/// Tag of the barrier every unit meets after publication
pub const PUBLISH_TAG: u32 = u32::MAX;

/// Index of a phase inside its plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhaseId(pub u16);

impl PhaseId {
    pub const FIRST: PhaseId = PhaseId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase#{}", self.0)
    }
}

/// Index of an in-phase sync point inside its plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncId(pub u16);

/// Which units take part in a rendezvous
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncScope {
    /// Every unit of the grid
    Grid,
    /// The threads of the caller's core
    Core,
}

impl SyncScope {
    /// Number of arrivals that release the barrier
    pub fn expected_arrivals(&self, grid: &Grid) -> usize {
        match self {
            SyncScope::Grid => grid.unit_count(),
            SyncScope::Core => grid.thread_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSpec {
    pub name: &'static str,
    pub tag: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPoint {
    pub name: &'static str,
    pub tag: u32,
    pub scope: SyncScope,
}

/// Validated set of phases and sync points
#[derive(Debug, Clone)]
pub struct PhasePlan {
    phases: Vec<PhaseSpec>,
    sync_points: Vec<SyncPoint>,
}

impl PhasePlan {
    pub fn builder() -> PhasePlanBuilder {
        PhasePlanBuilder::default()
    }

    pub fn phase(&self, id: PhaseId) -> ForgeResult<&PhaseSpec> {
        self.phases
            .get(id.index())
            .ok_or(NpuForgeError::UnknownPhase(id.0))
    }

    pub fn sync_point(&self, id: SyncId) -> ForgeResult<&SyncPoint> {
        self.sync_points
            .get(id.0 as usize)
            .ok_or(NpuForgeError::UnknownPhase(id.0))
    }

    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    pub fn sync_points(&self) -> &[SyncPoint] {
        &self.sync_points
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    /// Look a phase up by name
    pub fn find(&self, name: &str) -> Option<PhaseId> {
        self.phases
            .iter()
            .position(|p| p.name == name)
            .map(|i| PhaseId(i as u16))
    }
}

/// Builder for [`PhasePlan`]; ids are assigned in declaration order
#[derive(Debug, Default)]
pub struct PhasePlanBuilder {
    phases: Vec<PhaseSpec>,
    sync_points: Vec<SyncPoint>,
}

impl PhasePlanBuilder {
    pub fn phase(mut self, name: &'static str, tag: u32) -> Self {
        self.phases.push(PhaseSpec { name, tag });
        self
    }

    pub fn sync_point(mut self, name: &'static str, tag: u32, scope: SyncScope) -> Self {
        self.sync_points.push(SyncPoint { name, tag, scope });
        self
    }

    pub fn build(self) -> ForgeResult<PhasePlan> {
        if self.phases.is_empty() {
            return Err(NpuForgeError::InvalidConfiguration(
                "phase plan declares no phases".to_string(),
            ));
        }
        if self.phases.len() > u16::MAX as usize || self.sync_points.len() > u16::MAX as usize {
            return Err(NpuForgeError::InvalidConfiguration(
                "phase plan is too large".to_string(),
            ));
        }

        let mut seen: HashMap<u32, &'static str> = HashMap::new();
        let named_tags = self
            .phases
            .iter()
            .map(|p| (p.name, p.tag))
            .chain(self.sync_points.iter().map(|s| (s.name, s.tag)));
        for (name, tag) in named_tags {
            if tag == PUBLISH_TAG {
                return Err(NpuForgeError::ReservedSyncTag(tag));
            }
            if let Some(first) = seen.insert(tag, name) {
                return Err(NpuForgeError::DuplicateSyncTag {
                    tag,
                    first,
                    second: name,
                });
            }
        }

        Ok(PhasePlan {
            phases: self.phases,
            sync_points: self.sync_points,
        })
    }
}
