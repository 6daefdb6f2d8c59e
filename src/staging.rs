//! Unit-local scratchpad staging
//!
//! Every execution unit owns one [`Scratchpad`] of fixed byte capacity. Tiles
//! are copied in from shared memory, computed on privately and copied back
//! after a barrier. Tiles are named so a kernel can keep several operands
//! staged across phases of one invocation.

use std::any::Any;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut, Index, IndexMut};

use thiserror::Error;

use crate::memory::{Element, SharedBuffer};

/// Default scratchpad size per unit
pub const DEFAULT_SCRATCHPAD_BYTES: usize = 64 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScratchError {
    #[error("Scratchpad capacity exceeded: requested {requested} bytes, {available} available")]
    CapacityExceeded { requested: usize, available: usize },
    #[error("No staged tile named '{0}'")]
    MissingTile(&'static str),
    #[error("Tile '{name}' is not a tile of {requested}")]
    TypeMismatch {
        name: &'static str,
        requested: &'static str,
    },
    #[error("Tile '{0}' is already staged")]
    AlreadyStaged(&'static str),
    #[error("Range {start}..{end} outside buffer of {len} elements")]
    RangeOutOfBounds { start: usize, end: usize, len: usize },
}

pub type ScratchResult<T> = Result<T, ScratchError>;

/// End of `[start, start + len)` if the range fits a buffer of `buffer_len`
fn checked_end(start: usize, len: usize, buffer_len: usize) -> ScratchResult<usize> {
    match start.checked_add(len) {
        Some(end) if end <= buffer_len => Ok(end),
        end => Err(ScratchError::RangeOutOfBounds {
            start,
            end: end.unwrap_or(usize::MAX),
            len: buffer_len,
        }),
    }
}

/// Private copy of a region of shared memory
#[derive(Debug, Clone, PartialEq)]
pub struct StagingTile<T: Element> {
    data: Vec<T>,
    origin: usize,
}

impl<T: Element> StagingTile<T> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Source index of element 0
    pub fn origin(&self) -> usize {
        self.origin
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn fill(&mut self, value: T) {
        self.data.iter_mut().for_each(|v| *v = value);
    }
}

impl<T: Element> Index<usize> for StagingTile<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.data[index]
    }
}

impl<T: Element> IndexMut<usize> for StagingTile<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.data[index]
    }
}

struct Entry {
    bytes: usize,
    tile: Box<dyn Any + Send>,
}

/// Fixed-capacity local memory of one execution unit
pub struct Scratchpad {
    capacity_bytes: usize,
    used_bytes: usize,
    tiles: HashMap<&'static str, Entry>,
}

impl Scratchpad {
    pub fn new(capacity_bytes: usize) -> Self {
        Scratchpad {
            capacity_bytes,
            used_bytes: 0,
            tiles: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity_bytes
    }

    pub fn used(&self) -> usize {
        self.used_bytes
    }

    pub fn available(&self) -> usize {
        self.capacity_bytes - self.used_bytes
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tiles.contains_key(name)
    }

    /// Copy `len` elements starting at `start` into a new tile
    pub fn stage_in<T: Element>(
        &mut self,
        name: &'static str,
        source: &SharedBuffer<T>,
        start: usize,
        len: usize,
    ) -> ScratchResult<&mut StagingTile<T>> {
        checked_end(start, len, source.len())?;
        let data = source.read_range(start, len);
        self.insert(name, StagingTile { data, origin: start })
    }

    /// Gather `source[indices]` into a new tile, e.g. a matrix column
    pub fn stage_in_gather<T: Element>(
        &mut self,
        name: &'static str,
        source: &SharedBuffer<T>,
        indices: impl Iterator<Item = usize>,
    ) -> ScratchResult<&mut StagingTile<T>> {
        let mut data = Vec::new();
        for index in indices {
            if index >= source.len() {
                return Err(ScratchError::RangeOutOfBounds {
                    start: index,
                    end: index.saturating_add(1),
                    len: source.len(),
                });
            }
            data.push(source.get(index));
        }
        self.insert(name, StagingTile { data, origin: 0 })
    }

    /// Zero-initialised tile of `len` elements
    pub fn alloc<T: Element>(
        &mut self,
        name: &'static str,
        len: usize,
    ) -> ScratchResult<&mut StagingTile<T>> {
        self.insert(
            name,
            StagingTile {
                data: vec![T::default(); len],
                origin: 0,
            },
        )
    }

    pub fn tile<T: Element>(&self, name: &'static str) -> ScratchResult<&StagingTile<T>> {
        self.tiles
            .get(name)
            .ok_or(ScratchError::MissingTile(name))?
            .tile
            .downcast_ref::<StagingTile<T>>()
            .ok_or(ScratchError::TypeMismatch {
                name,
                requested: T::NAME,
            })
    }

    pub fn tile_mut<T: Element>(
        &mut self,
        name: &'static str,
    ) -> ScratchResult<&mut StagingTile<T>> {
        self.tiles
            .get_mut(name)
            .ok_or(ScratchError::MissingTile(name))?
            .tile
            .downcast_mut::<StagingTile<T>>()
            .ok_or(ScratchError::TypeMismatch {
                name,
                requested: T::NAME,
            })
    }

    /// Copy the tile back to `dest[start..]` and release it
    pub fn stage_out<T: Element>(
        &mut self,
        name: &'static str,
        dest: &SharedBuffer<T>,
        start: usize,
    ) -> ScratchResult<()> {
        let tile = self.tile::<T>(name)?;
        checked_end(start, tile.len(), dest.len())?;
        dest.write_range(start, tile.as_slice());
        self.release(name);
        Ok(())
    }

    /// Drop a tile, returning whether it existed
    pub fn release(&mut self, name: &str) -> bool {
        match self.tiles.remove(name) {
            Some(entry) => {
                self.used_bytes -= entry.bytes;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.tiles.clear();
        self.used_bytes = 0;
    }

    /// Release `name` when the returned guard goes out of scope
    pub fn scoped(&mut self, name: &'static str) -> ScopedTile<'_> {
        ScopedTile { pad: self, name }
    }

    fn insert<T: Element>(
        &mut self,
        name: &'static str,
        tile: StagingTile<T>,
    ) -> ScratchResult<&mut StagingTile<T>> {
        if self.tiles.contains_key(name) {
            return Err(ScratchError::AlreadyStaged(name));
        }
        let bytes = tile.len() * std::mem::size_of::<T>();
        if bytes > self.available() {
            return Err(ScratchError::CapacityExceeded {
                requested: bytes,
                available: self.available(),
            });
        }
        self.used_bytes += bytes;
        let entry = self.tiles.entry(name).or_insert(Entry {
            bytes,
            tile: Box::new(tile),
        });
        entry
            .tile
            .downcast_mut::<StagingTile<T>>()
            .ok_or(ScratchError::TypeMismatch {
                name,
                requested: T::NAME,
            })
    }
}

impl std::fmt::Debug for Scratchpad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scratchpad")
            .field("capacity_bytes", &self.capacity_bytes)
            .field("used_bytes", &self.used_bytes)
            .field("tiles", &self.tiles.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Releases one named tile on drop, on every exit path
pub struct ScopedTile<'a> {
    pad: &'a mut Scratchpad,
    name: &'static str,
}

impl ScopedTile<'_> {
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Deref for ScopedTile<'_> {
    type Target = Scratchpad;

    fn deref(&self) -> &Scratchpad {
        self.pad
    }
}

impl DerefMut for ScopedTile<'_> {
    fn deref_mut(&mut self) -> &mut Scratchpad {
        self.pad
    }
}

impl Drop for ScopedTile<'_> {
    fn drop(&mut self) {
        self.pad.release(self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_in_copies_without_aliasing() {
        let source = SharedBuffer::from_slice(&[1, 2, 3, 4, 5]);
        let mut pad = Scratchpad::new(DEFAULT_SCRATCHPAD_BYTES);

        let tile = pad.stage_in("row", &source, 1, 3).unwrap();
        assert_eq!(tile.as_slice(), &[2, 3, 4]);
        assert_eq!(tile.origin(), 1);
        tile[0] = 99;

        assert_eq!(source.get(1), 2);
        assert_eq!(pad.used(), 12);
    }

    #[test]
    fn test_stage_out_writes_back_and_releases() {
        let dest = SharedBuffer::<i32>::zeroed(6);
        let mut pad = Scratchpad::new(64);

        pad.alloc::<i32>("acc", 2).unwrap().as_mut_slice().copy_from_slice(&[7, 8]);
        pad.stage_out::<i32>("acc", &dest, 4).unwrap();

        assert_eq!(dest.snapshot(), vec![0, 0, 0, 0, 7, 8]);
        assert_eq!(pad.used(), 0);
        assert!(!pad.contains("acc"));
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut pad = Scratchpad::new(16);
        pad.alloc::<f32>("a", 3).unwrap();
        let err = pad.alloc::<f32>("b", 2).unwrap_err();
        assert_eq!(
            err,
            ScratchError::CapacityExceeded {
                requested: 8,
                available: 4
            }
        );
    }

    #[test]
    fn test_type_and_name_checks() {
        let mut pad = Scratchpad::new(64);
        pad.alloc::<i32>("t", 1).unwrap();
        assert_eq!(
            pad.tile::<f32>("t").unwrap_err(),
            ScratchError::TypeMismatch {
                name: "t",
                requested: "f32"
            }
        );
        assert_eq!(
            pad.tile::<i32>("missing").unwrap_err(),
            ScratchError::MissingTile("missing")
        );
        assert_eq!(
            pad.alloc::<i32>("t", 1).unwrap_err(),
            ScratchError::AlreadyStaged("t")
        );
    }

    #[test]
    fn test_scoped_tile_released_on_early_exit() {
        let mut pad = Scratchpad::new(64);

        for turn in 0..3 {
            pad.alloc::<u32>("turn", 4).unwrap();
            let mut guard = pad.scoped("turn");
            guard.tile_mut::<u32>("turn").unwrap()[0] = turn;
            if turn == 1 {
                break;
            }
        }

        assert_eq!(pad.used(), 0);
        assert_eq!(pad.tile_count(), 0);
    }

    #[test]
    fn test_range_end_overflow_is_out_of_bounds() {
        let source = SharedBuffer::from_slice(&[0, 1, 2, 3]);
        let mut pad = Scratchpad::new(64);
        assert!(matches!(
            pad.stage_in("wide", &source, usize::MAX, 2),
            Err(ScratchError::RangeOutOfBounds { start: usize::MAX, end: usize::MAX, len: 4 })
        ));
        assert_eq!(pad.tile_count(), 0);

        pad.alloc::<i32>("out", 2).unwrap();
        assert!(matches!(
            pad.stage_out::<i32>("out", &source, usize::MAX - 1),
            Err(ScratchError::RangeOutOfBounds { len: 4, .. })
        ));
        assert!(pad.contains("out"));

        assert!(matches!(
            pad.stage_in_gather("far", &source, std::iter::once(usize::MAX)),
            Err(ScratchError::RangeOutOfBounds { end: usize::MAX, .. })
        ));
    }

    #[test]
    fn test_gather_and_bounds() {
        let source = SharedBuffer::from_slice(&[0, 1, 2, 3, 4, 5]);
        let mut pad = Scratchpad::new(64);
        let column = pad
            .stage_in_gather("col", &source, (1..6).step_by(2))
            .unwrap();
        assert_eq!(column.as_slice(), &[1, 3, 5]);

        assert!(matches!(
            pad.stage_in("late", &source, 4, 3),
            Err(ScratchError::RangeOutOfBounds { start: 4, end: 7, len: 6 })
        ));
    }
}
