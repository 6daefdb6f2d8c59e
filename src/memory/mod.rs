//! Shared memory visible to every execution unit
//!
//! A [`SharedBuffer`] models one array in external memory. Units write the
//! working copy; [`SharedBuffer::flush_line`] commits a 64-byte line to the
//! committed copy, which is what an outside observer (the cosimulation
//! harness) sees.
//!
//! Elements are stored as `AtomicU32` bit patterns and accessed with relaxed
//! ordering. Cross-unit visibility is established only by the barrier
//! coordinator's lock, so a value written before a barrier is visible to every
//! unit after it, and nothing is promised in between.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{ForgeResult, NpuForgeError};

/// Bytes per cache line
pub const LINE_BYTES: usize = 64;

/// 32-bit elements per cache line
pub const ELEMENTS_PER_LINE: usize = LINE_BYTES / 4;

/// 32-bit scalar that can live in a [`SharedBuffer`]
pub trait Element: Copy + Send + Sync + PartialEq + Debug + Default + 'static {
    const NAME: &'static str;

    fn to_bits(self) -> u32;
    fn from_bits(bits: u32) -> Self;
}

impl Element for i32 {
    const NAME: &'static str = "i32";

    fn to_bits(self) -> u32 {
        self as u32
    }

    fn from_bits(bits: u32) -> Self {
        bits as i32
    }
}

impl Element for u32 {
    const NAME: &'static str = "u32";

    fn to_bits(self) -> u32 {
        self
    }

    fn from_bits(bits: u32) -> Self {
        bits
    }
}

impl Element for f32 {
    const NAME: &'static str = "f32";

    fn to_bits(self) -> u32 {
        f32::to_bits(self)
    }

    fn from_bits(bits: u32) -> Self {
        f32::from_bits(bits)
    }
}

/// Something a unit can flush line by line
pub trait Flushable: Sync {
    fn line_count(&self) -> usize;
    fn flush_line(&self, line: usize) -> ForgeResult<()>;
}

/// Array in external memory with a working and a committed copy
pub struct SharedBuffer<T: Element> {
    working: Box<[AtomicU32]>,
    committed: Box<[AtomicU32]>,
    _marker: PhantomData<T>,
}

impl<T: Element> SharedBuffer<T> {
    /// Buffer of `len` default elements, committed as such
    pub fn zeroed(len: usize) -> Self {
        Self::filled(len, T::default())
    }

    pub fn filled(len: usize, value: T) -> Self {
        let bits = value.to_bits();
        SharedBuffer {
            working: (0..len).map(|_| AtomicU32::new(bits)).collect(),
            committed: (0..len).map(|_| AtomicU32::new(bits)).collect(),
            _marker: PhantomData,
        }
    }

    /// Buffer initialised from host data; inputs start out committed
    pub fn from_slice(data: &[T]) -> Self {
        SharedBuffer {
            working: data.iter().map(|v| AtomicU32::new(v.to_bits())).collect(),
            committed: data.iter().map(|v| AtomicU32::new(v.to_bits())).collect(),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.working.len()
    }

    pub fn is_empty(&self) -> bool {
        self.working.is_empty()
    }

    /// Read one element of the working copy
    ///
    /// # Panics
    /// Panics if `index` is out of bounds, like slice indexing.
    #[inline]
    pub fn get(&self, index: usize) -> T {
        T::from_bits(self.working[index].load(Ordering::Relaxed))
    }

    /// Write one element of the working copy
    ///
    /// # Panics
    /// Panics if `index` is out of bounds, like slice indexing.
    #[inline]
    pub fn set(&self, index: usize, value: T) {
        self.working[index].store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn try_get(&self, index: usize) -> ForgeResult<T> {
        self.check(index)?;
        Ok(self.get(index))
    }

    pub fn try_set(&self, index: usize, value: T) -> ForgeResult<()> {
        self.check(index)?;
        self.set(index, value);
        Ok(())
    }

    /// Read-modify-write by the unit that owns `index`
    #[inline]
    pub fn update(&self, index: usize, f: impl FnOnce(T) -> T) {
        self.set(index, f(self.get(index)));
    }

    pub fn read_range(&self, start: usize, len: usize) -> Vec<T> {
        self.working[start..start + len]
            .iter()
            .map(|a| T::from_bits(a.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn write_range(&self, start: usize, values: &[T]) {
        for (slot, value) in self.working[start..start + values.len()]
            .iter()
            .zip(values)
        {
            slot.store(value.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn fill(&self, value: T) {
        let bits = value.to_bits();
        for slot in self.working.iter() {
            slot.store(bits, Ordering::Relaxed);
        }
    }

    /// Store `value` into both copies, as if freshly allocated
    pub fn reset_to(&self, value: T) {
        let bits = value.to_bits();
        for (working, committed) in self.working.iter().zip(self.committed.iter()) {
            working.store(bits, Ordering::Relaxed);
            committed.store(bits, Ordering::Relaxed);
        }
    }

    pub fn reset(&self) {
        self.reset_to(T::default());
    }

    /// Reload both copies from host data of the same length
    ///
    /// # Panics
    /// Panics if `data` is shorter than the buffer.
    pub fn reset_from(&self, data: &[T]) {
        let slots = self.working.iter().zip(self.committed.iter());
        for ((working, committed), value) in slots.zip(&data[..self.len()]) {
            working.store(value.to_bits(), Ordering::Relaxed);
            committed.store(value.to_bits(), Ordering::Relaxed);
        }
    }

    /// Copy of the working memory
    pub fn snapshot(&self) -> Vec<T> {
        self.read_range(0, self.len())
    }

    /// Copy of the committed memory
    pub fn committed(&self) -> Vec<T> {
        self.committed_prefix(self.len())
    }

    /// First `count` committed elements, clamped to the buffer length
    pub fn committed_prefix(&self, count: usize) -> Vec<T> {
        self.committed[..count.min(self.len())]
            .iter()
            .map(|a| T::from_bits(a.load(Ordering::Relaxed)))
            .collect()
    }

    /// Line holding `index`
    pub fn line_of(index: usize) -> usize {
        index / ELEMENTS_PER_LINE
    }

    /// Commit every line, returning how many were flushed
    pub fn flush_all(&self) -> usize {
        let lines = self.line_count();
        for line in 0..lines {
            self.commit(line);
        }
        lines
    }

    fn commit(&self, line: usize) {
        let start = line * ELEMENTS_PER_LINE;
        let end = (start + ELEMENTS_PER_LINE).min(self.len());
        for index in start..end {
            let bits = self.working[index].load(Ordering::Relaxed);
            self.committed[index].store(bits, Ordering::Relaxed);
        }
    }

    fn check(&self, index: usize) -> ForgeResult<()> {
        if index >= self.len() {
            return Err(NpuForgeError::OutOfBounds {
                index,
                len: self.len(),
            });
        }
        Ok(())
    }
}

impl<T: Element> Flushable for SharedBuffer<T> {
    fn line_count(&self) -> usize {
        (self.len() + ELEMENTS_PER_LINE - 1) / ELEMENTS_PER_LINE
    }

    fn flush_line(&self, line: usize) -> ForgeResult<()> {
        if line >= self.line_count() {
            return Err(NpuForgeError::OutOfBounds {
                index: line * ELEMENTS_PER_LINE,
                len: self.len(),
            });
        }
        self.commit(line);
        Ok(())
    }
}

impl<T: Element> Debug for SharedBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("element", &T::NAME)
            .field("len", &self.len())
            .finish()
    }
}

/// 64-bit value stored in a [`PartialSlots`] slot
pub trait Partial: Copy + Send + Sync + Default + 'static {
    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
}

impl Partial for u64 {
    fn to_bits(self) -> u64 {
        self
    }

    fn from_bits(bits: u64) -> Self {
        bits
    }
}

/// One accumulator per execution unit, combined by a single reducer
///
/// Each unit writes only its own slot; the reducer folds the slots in index
/// order after a barrier.
pub struct PartialSlots<T: Partial> {
    slots: Box<[AtomicU64]>,
    _marker: PhantomData<T>,
}

impl<T: Partial> PartialSlots<T> {
    pub fn new(count: usize) -> Self {
        let bits = T::default().to_bits();
        PartialSlots {
            slots: (0..count).map(|_| AtomicU64::new(bits)).collect(),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn set(&self, slot: usize, value: T) {
        self.slots[slot].store(value.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, slot: usize) -> T {
        T::from_bits(self.slots[slot].load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        let bits = T::default().to_bits();
        for slot in self.slots.iter() {
            slot.store(bits, Ordering::Relaxed);
        }
    }

    /// Fold the slots in index order
    pub fn fold<A>(&self, init: A, mut f: impl FnMut(A, T) -> A) -> A {
        (0..self.len()).fold(init, |acc, i| f(acc, self.get(i)))
    }
}

impl PartialSlots<u64> {
    pub fn sum(&self) -> u64 {
        self.fold(0, |acc, v| acc + v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_bit_patterns() {
        assert_eq!(<i32 as Element>::from_bits(Element::to_bits(-5i32)), -5);
        assert_eq!(<f32 as Element>::from_bits(Element::to_bits(1.5f32)), 1.5);
        assert_eq!(<u32 as Element>::from_bits(7), 7);
    }

    #[test]
    fn test_working_copy_is_not_committed_until_flushed() {
        let buffer = SharedBuffer::<i32>::zeroed(20);
        buffer.set(3, 11);
        buffer.set(17, 22);
        assert_eq!(buffer.get(3), 11);
        assert_eq!(buffer.committed()[3], 0);

        buffer.flush_line(0).unwrap();
        assert_eq!(buffer.committed()[3], 11);
        assert_eq!(buffer.committed()[17], 0);

        assert_eq!(buffer.line_count(), 2);
        assert_eq!(buffer.flush_all(), 2);
        assert_eq!(buffer.committed()[17], 22);
    }

    #[test]
    fn test_flush_out_of_range_line() {
        let buffer = SharedBuffer::<f32>::zeroed(16);
        assert!(matches!(
            buffer.flush_line(1),
            Err(NpuForgeError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_from_slice_starts_committed() {
        let buffer = SharedBuffer::from_slice(&[1u32, 2, 3]);
        assert_eq!(buffer.committed(), vec![1, 2, 3]);
        assert_eq!(buffer.committed_prefix(10), vec![1, 2, 3]);
        assert_eq!(buffer.committed_prefix(2), vec![1, 2]);
    }

    #[test]
    fn test_ranges_and_update() {
        let buffer = SharedBuffer::<i32>::zeroed(8);
        buffer.write_range(2, &[4, 5, 6]);
        buffer.update(3, |v| v * 10);
        assert_eq!(buffer.read_range(1, 4), vec![0, 4, 50, 6]);
        assert!(buffer.try_get(8).is_err());
        assert!(buffer.try_set(7, 1).is_ok());
        buffer.fill(9);
        assert_eq!(buffer.snapshot(), vec![9; 8]);
    }

    #[test]
    fn test_reset_clears_both_copies() {
        let buffer = SharedBuffer::<i32>::zeroed(4);
        buffer.write_range(0, &[1, 2, 3, 4]);
        buffer.flush_all();
        buffer.reset();
        assert_eq!(buffer.snapshot(), vec![0; 4]);
        assert_eq!(buffer.committed(), vec![0; 4]);

        buffer.reset_from(&[7, 8, 9, 10, 11]);
        assert_eq!(buffer.snapshot(), vec![7, 8, 9, 10]);
        assert_eq!(buffer.committed(), vec![7, 8, 9, 10]);
    }

    #[test]
    fn test_partial_slots_fold_in_order() {
        let partials = PartialSlots::<u64>::new(4);
        for slot in 0..4 {
            partials.set(slot, 1 << slot);
        }
        let digits = partials.fold(String::new(), |acc, v| format!("{}{}", acc, v));
        assert_eq!(digits, "1248");

        let counts = PartialSlots::<u64>::new(3);
        counts.set(1, 5);
        counts.set(2, 2);
        assert_eq!(counts.sum(), 7);
        counts.reset();
        assert_eq!(counts.sum(), 0);
    }
}
