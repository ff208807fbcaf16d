use ahash::AHashMap;
use bitflags::bitflags;

use crate::{CellId, Identifier};

bitflags! {
    /// Property attributes stored per entry of a [`PropertyTable`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PropertyAttributes: u8 {
        const READ_ONLY = 1 << 0;
        const DONT_ENUM = 1 << 1;
        const DONT_DELETE = 1 << 2;
        /// The stored value is a getter/setter pair.
        const ACCESSOR = 1 << 3;
    }
}

/// Index into an object's property storage.
///
/// Offsets below the structure's inline capacity address inline storage,
/// the rest address out-of-line storage.
pub type PropertyOffset = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyEntry {
    pub key: Identifier,
    pub offset: PropertyOffset,
    pub attributes: PropertyAttributes,
    /// Function cell this property was observed to always hold, if the
    /// structure is still specialised on it.
    pub specific_value: Option<CellId>,
}

/// Ordered map from identifier to [`PropertyEntry`].
///
/// Entries keep insertion order; removal leaves a tombstone so iteration
/// order of the survivors never changes. Offsets freed by removal are
/// recycled by later additions in dictionary mode.
#[derive(Debug, Clone, Default)]
pub struct PropertyTable {
    entries: Vec<Option<PropertyEntry>>,
    index: AHashMap<Identifier, usize>,
    deleted_offsets: Vec<PropertyOffset>,
}

impl PropertyTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, key: Identifier) -> Option<&PropertyEntry> {
        self.index
            .get(&key)
            .and_then(|&i| self.entries[i].as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, key: Identifier) -> Option<&mut PropertyEntry> {
        match self.index.get(&key) {
            Some(&i) => self.entries[i].as_mut(),
            None => None,
        }
    }

    /// Insert a new entry. The key must not already be present.
    pub fn add(&mut self, entry: PropertyEntry) {
        debug_assert!(!self.index.contains_key(&entry.key));
        self.index.insert(entry.key, self.entries.len());
        self.entries.push(Some(entry));
    }

    pub fn remove(&mut self, key: Identifier) -> Option<PropertyEntry> {
        let i = self.index.remove(&key)?;
        let entry = self.entries[i].take()?;
        self.deleted_offsets.push(entry.offset);
        Some(entry)
    }

    /// Reuse an offset freed by [`remove`](Self::remove), if any.
    pub fn take_deleted_offset(&mut self) -> Option<PropertyOffset> {
        self.deleted_offsets.pop()
    }

    pub fn has_deleted_offsets(&self) -> bool {
        !self.deleted_offsets.is_empty()
    }

    /// Live entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &PropertyEntry> {
        self.entries.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PropertyEntry> {
        self.entries.iter_mut().flatten()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// One past the largest offset in use.
    pub fn storage_size(&self) -> u32 {
        self.iter().map(|e| e.offset + 1).max().unwrap_or(0)
    }

    /// Renumber offsets densely in insertion order, dropping tombstones.
    ///
    /// Returns `(old, new)` offset pairs for every live entry so the owning
    /// object can move its storage accordingly.
    pub fn compact(&mut self) -> Vec<(PropertyOffset, PropertyOffset)> {
        let mut moves = Vec::with_capacity(self.len());
        let mut entries = Vec::with_capacity(self.len());
        let mut index = AHashMap::with_capacity(self.len());
        for (new_offset, mut entry) in self.entries.drain(..).flatten().enumerate() {
            moves.push((entry.offset, new_offset as PropertyOffset));
            entry.offset = new_offset as PropertyOffset;
            index.insert(entry.key, entries.len());
            entries.push(Some(entry));
        }
        self.entries = entries;
        self.index = index;
        self.deleted_offsets.clear();
        moves
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdentifierTable;

    fn entry(key: Identifier, offset: u32) -> PropertyEntry {
        PropertyEntry {
            key,
            offset,
            attributes: PropertyAttributes::empty(),
            specific_value: None,
        }
    }

    #[test]
    fn removal_preserves_order_of_survivors() {
        let names = IdentifierTable::new();
        let (a, b, c) = (names.add("a"), names.add("b"), names.add("c"));
        let mut table = PropertyTable::new();
        table.add(entry(a, 0));
        table.add(entry(b, 1));
        table.add(entry(c, 2));

        assert_eq!(table.remove(b).map(|e| e.offset), Some(1));
        let keys: Vec<_> = table.iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![a, c]);
        assert_eq!(table.take_deleted_offset(), Some(1));
    }

    #[test]
    fn compaction_renumbers_in_insertion_order() {
        let names = IdentifierTable::new();
        let (a, b, c) = (names.add("a"), names.add("b"), names.add("c"));
        let mut table = PropertyTable::new();
        table.add(entry(a, 0));
        table.add(entry(b, 1));
        table.add(entry(c, 2));
        table.remove(a);

        let moves = table.compact();
        assert_eq!(moves, vec![(1, 0), (2, 1)]);
        assert_eq!(table.get(c).map(|e| e.offset), Some(1));
        assert!(!table.has_deleted_offsets());
        assert_eq!(table.storage_size(), 2);
    }
}
