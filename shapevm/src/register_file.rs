//! Segmented value stack backing every call frame.
//!
//! Storage is committed one segment at a time and segments never move, so
//! a slot's address stays valid for as long as the slot is in use.

use crate::{StackOverflow, Value};

#[derive(Debug)]
pub struct RegisterFile {
    segments: Vec<Box<[Value]>>,
    segment_size: usize,
    capacity: usize,
    /// One past the highest slot owned by a live frame.
    end: usize,
    high_water: usize,
    /// Frames that needed missing parameters padded in a fresh window.
    pub(crate) arity_fixups: u64,
}

impl RegisterFile {
    pub fn new(capacity: usize, segment_size: usize) -> Self {
        debug_assert!(segment_size > 0);
        Self {
            segments: Vec::new(),
            segment_size,
            capacity,
            end: 0,
            high_water: 0,
            arity_fixups: 0,
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline(always)]
    pub fn committed(&self) -> usize {
        self.segments.len() * self.segment_size
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.end
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn arity_fixups(&self) -> u64 {
        self.arity_fixups
    }

    /// Commit storage so that slots `[0, to)` are addressable. Idempotent
    /// when enough storage is already committed.
    pub fn grow(&mut self, to: usize) -> Result<(), StackOverflow> {
        if to > self.capacity {
            return Err(StackOverflow {
                requested: to,
                capacity: self.capacity,
            });
        }
        while self.committed() < to {
            self.segments
                .push(vec![Value::EMPTY; self.segment_size].into_boxed_slice());
            log::trace!(
                "register file: committed segment {} ({} slots)",
                self.segments.len(),
                self.committed()
            );
        }
        Ok(())
    }

    /// Claim `[0, end)` for live frames. The range must be committed.
    pub fn set_end(&mut self, end: usize) {
        debug_assert!(end <= self.committed());
        self.end = end;
        self.high_water = self.high_water.max(end);
    }

    /// Release everything above `to`. Slots are not cleared.
    pub fn shrink(&mut self, to: usize) {
        debug_assert!(to <= self.end);
        self.end = to;
    }

    #[inline]
    pub fn get(&self, index: usize) -> Value {
        self.segments[index / self.segment_size][index % self.segment_size]
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: Value) {
        self.segments[index / self.segment_size][index % self.segment_size] = value;
    }

    pub fn fill(&mut self, range: core::ops::Range<usize>, value: Value) {
        for index in range {
            self.set(index, value);
        }
    }

    /// Copy `len` slots from `from` to `to`. The ranges may not overlap.
    pub fn copy(&mut self, from: usize, to: usize, len: usize) {
        debug_assert!(from + len <= to || to + len <= from);
        for i in 0..len {
            let value = self.get(from + i);
            self.set(to + i, value);
        }
    }

    pub fn address_of(&self, index: usize) -> *const Value {
        &self.segments[index / self.segment_size][index % self.segment_size]
    }

    /// Every slot owned by a live frame.
    pub fn visit_live(&self, visitor: &mut dyn FnMut(Value)) {
        for index in 0..self.end {
            visitor(self.get(index));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_is_idempotent_and_bounded() {
        let mut registers = RegisterFile::new(64, 16);
        assert!(registers.grow(20).is_ok());
        assert_eq!(registers.committed(), 32);
        assert!(registers.grow(10).is_ok());
        assert_eq!(registers.committed(), 32);

        let overflow = registers.grow(65).unwrap_err();
        assert_eq!(overflow.requested, 65);
        assert_eq!(overflow.capacity, 64);
    }

    #[test]
    fn addresses_survive_growth() {
        let mut registers = RegisterFile::new(1024, 16);
        registers.grow(8).unwrap();
        registers.set(3, Value::from_i64(9));
        let before = registers.address_of(3);
        registers.grow(1000).unwrap();
        assert_eq!(before, registers.address_of(3));
        assert_eq!(registers.get(3), Value::from_i64(9));
    }

    #[test]
    fn shrink_keeps_contents() {
        let mut registers = RegisterFile::new(64, 16);
        registers.grow(10).unwrap();
        registers.set_end(10);
        registers.set(9, Value::TRUE);
        registers.shrink(4);
        assert_eq!(registers.end(), 4);
        assert_eq!(registers.get(9), Value::TRUE);
        assert_eq!(registers.high_water(), 10);
    }
}
