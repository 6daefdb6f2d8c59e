//! Execution grid: the fixed pool of cores × threads a kernel runs on
//!
//! A [`Grid`] is validated once when it is built and shared read-only by every
//! unit afterwards, so partitioning code never has to re-check for zero
//! dimensions.

pub mod partition;

pub use partition::{partition, PartitionStrategy, TiledSchedule, WorkRange};

use std::fmt;

use serde::Serialize;

use crate::error::{ForgeResult, NpuForgeError};

/// One (core, thread) execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ExecutionUnit {
    pub core_id: usize,
    pub thread_id: usize,
}

impl ExecutionUnit {
    /// The unit that publishes results
    pub const DESIGNATED: ExecutionUnit = ExecutionUnit {
        core_id: 0,
        thread_id: 0,
    };

    pub fn new(core_id: usize, thread_id: usize) -> Self {
        ExecutionUnit { core_id, thread_id }
    }

    pub fn is_designated(&self) -> bool {
        *self == Self::DESIGNATED
    }

    /// Thread 0 of its core
    pub fn is_core_leader(&self) -> bool {
        self.thread_id == 0
    }
}

impl fmt::Display for ExecutionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}t{}", self.core_id, self.thread_id)
    }
}

/// Shape of the unit pool, fixed at configuration time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Grid {
    core_count: usize,
    thread_count: usize,
}

impl Grid {
    /// Build a grid, rejecting zero dimensions and unit counts past `usize`
    pub fn new(core_count: usize, thread_count: usize) -> ForgeResult<Self> {
        if core_count == 0 || thread_count == 0 {
            return Err(NpuForgeError::InvalidGrid(format!(
                "cores={}, threads={} (both must be positive)",
                core_count, thread_count
            )));
        }
        if core_count.checked_mul(thread_count).is_none() {
            return Err(NpuForgeError::InvalidGrid(format!(
                "cores={}, threads={} (unit count overflows)",
                core_count, thread_count
            )));
        }
        Ok(Grid {
            core_count,
            thread_count,
        })
    }

    /// The single-unit grid used by golden reference runs
    pub fn single() -> Self {
        Grid {
            core_count: 1,
            thread_count: 1,
        }
    }

    pub fn core_count(&self) -> usize {
        self.core_count
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Total number of live units
    pub fn unit_count(&self) -> usize {
        self.core_count * self.thread_count
    }

    pub fn contains(&self, unit: ExecutionUnit) -> bool {
        unit.core_id < self.core_count && unit.thread_id < self.thread_count
    }

    /// Flattened core-major index: `core * threads + thread`
    pub fn linear_index(&self, unit: ExecutionUnit) -> usize {
        unit.core_id * self.thread_count + unit.thread_id
    }

    pub fn unit_at(&self, index: usize) -> Option<ExecutionUnit> {
        if index >= self.unit_count() {
            return None;
        }
        Some(ExecutionUnit::new(
            index / self.thread_count,
            index % self.thread_count,
        ))
    }

    /// All units in core-major order, the order of the reference loop
    pub fn units(&self) -> impl Iterator<Item = ExecutionUnit> + '_ {
        (0..self.core_count).flat_map(move |core| {
            (0..self.thread_count).map(move |thread| ExecutionUnit::new(core, thread))
        })
    }
}

impl fmt::Display for Grid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.core_count, self.thread_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_rejects_zero_dimensions() {
        assert!(matches!(Grid::new(0, 4), Err(NpuForgeError::InvalidGrid(_))));
        assert!(matches!(Grid::new(2, 0), Err(NpuForgeError::InvalidGrid(_))));
        assert!(Grid::new(1, 1).is_ok());
    }

    #[test]
    fn test_grid_rejects_unit_count_overflow() {
        assert!(matches!(
            Grid::new(usize::MAX, 2),
            Err(NpuForgeError::InvalidGrid(msg)) if msg.contains("overflows")
        ));
        assert!(matches!(
            Grid::new(1 << (usize::BITS / 2), 1 << (usize::BITS / 2)),
            Err(NpuForgeError::InvalidGrid(_))
        ));
        assert_eq!(Grid::new(usize::MAX, 1).unwrap().unit_count(), usize::MAX);
    }

    #[test]
    fn test_units_are_core_major() {
        let grid = Grid::new(2, 3).unwrap();
        let units: Vec<_> = grid.units().collect();
        assert_eq!(units.len(), 6);
        assert_eq!(units[0], ExecutionUnit::new(0, 0));
        assert_eq!(units[2], ExecutionUnit::new(0, 2));
        assert_eq!(units[3], ExecutionUnit::new(1, 0));

        for (index, unit) in units.iter().enumerate() {
            assert_eq!(grid.linear_index(*unit), index);
            assert_eq!(grid.unit_at(index), Some(*unit));
        }
        assert_eq!(grid.unit_at(6), None);
    }

    #[test]
    fn test_designated_unit() {
        assert!(ExecutionUnit::new(0, 0).is_designated());
        assert!(!ExecutionUnit::new(0, 1).is_designated());
        assert!(ExecutionUnit::new(3, 0).is_core_leader());
        assert_eq!(ExecutionUnit::new(1, 2).to_string(), "c1t2");
    }

    #[test]
    fn test_grid_contains() {
        let grid = Grid::new(2, 2).unwrap();
        assert!(grid.contains(ExecutionUnit::new(1, 1)));
        assert!(!grid.contains(ExecutionUnit::new(2, 0)));
        assert_eq!(grid.to_string(), "2x2");
        assert_eq!(Grid::single().unit_count(), 1);
    }
}
