//! Structures (hidden classes) and the transition DAG between them.
//!
//! Every object points at exactly one [`Structure`]. Objects built by the
//! same sequence of property additions from the same empty structure end up
//! sharing one structure, which is what lets inline caches guard on a plain
//! `StructureId` comparison.
//!
//! Property tables are materialised on demand: a structure created by an
//! add-property transition only records the entry it added and rebuilds its
//! full table from its ancestors the first time somebody asks.
//!
//! The table only grows. Structures are never collected, and each one keeps
//! its prototype and recorded specific values alive for the life of the
//! VM, including structures left behind by dictionary conversion and
//! despecify transitions. Programs that keep minting prototypes grow the
//! table without bound.

use std::rc::Rc;

use ahash::AHashMap;
use bitflags::bitflags;

use crate::{
    CellId, Identifier, PropertyAttributes, PropertyEntry, PropertyOffset,
    PropertyTable, Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructureId(u32);

impl StructureId {
    #[inline(always)]
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Which kind of object a structure describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    Object,
    Function,
    Global,
    Arguments,
    Error,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StructureFlags: u16 {
        /// The property table is owned by this structure alone and may be
        /// mutated in place. A pinned structure never serves as a shared
        /// ancestor for lazy materialisation.
        const PINNED = 1 << 0;
        const HAS_GETTER_SETTER = 1 << 1;
        const HAS_READ_ONLY = 1 << 2;
        const HAS_NON_ENUMERABLE = 1 << 3;
        const NOT_EXTENSIBLE = 1 << 4;
        /// Objects of this structure answer some property reads without
        /// consulting the property table (impure lookups).
        const INTERCEPTS_PROPERTY_ACCESS = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictionaryKind {
    None,
    /// Still eligible for caching after flattening.
    Cached,
    /// Never cached (deletes happened).
    Uncached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TransitionKey {
    AddProperty {
        name: Identifier,
        attributes: PropertyAttributes,
        specific: Option<CellId>,
    },
    PreventExtensions,
    Seal,
    Freeze,
}

/// Outgoing transitions of a structure. Most structures have at most one,
/// so the single case avoids a hash map allocation.
#[derive(Debug, Default)]
enum TransitionTable {
    #[default]
    Empty,
    Single(TransitionKey, StructureId),
    Map(AHashMap<TransitionKey, StructureId>),
}

impl TransitionTable {
    fn get(&self, key: &TransitionKey) -> Option<StructureId> {
        match self {
            TransitionTable::Empty => None,
            TransitionTable::Single(k, id) => (k == key).then_some(*id),
            TransitionTable::Map(map) => map.get(key).copied(),
        }
    }

    fn insert(&mut self, key: TransitionKey, id: StructureId) {
        match std::mem::take(self) {
            TransitionTable::Empty => *self = TransitionTable::Single(key, id),
            TransitionTable::Single(k, existing) => {
                let mut map = AHashMap::with_capacity(2);
                map.insert(k, existing);
                map.insert(key, id);
                *self = TransitionTable::Map(map);
            }
            TransitionTable::Map(mut map) => {
                map.insert(key, id);
                *self = TransitionTable::Map(map);
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            TransitionTable::Empty => 0,
            TransitionTable::Single(..) => 1,
            TransitionTable::Map(map) => map.len(),
        }
    }

    fn is_hashed(&self) -> bool {
        matches!(self, TransitionTable::Map(_))
    }
}

/// Snapshot of the structures along an object's prototype chain, nearest
/// prototype first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureChain(Rc<[StructureId]>);

impl StructureChain {
    pub fn new(structures: Vec<StructureId>) -> Self {
        Self(structures.into())
    }

    #[inline]
    pub fn structures(&self) -> &[StructureId] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Layout description shared by all objects with the same shape.
#[derive(Debug)]
pub struct Structure {
    id: StructureId,
    prototype: Value,
    class: ObjectClass,
    inline_capacity: u32,
    previous: Option<StructureId>,
    /// Entry added by the transition that created this structure.
    added_property: Option<PropertyEntry>,
    property_table: Option<PropertyTable>,
    transitions: TransitionTable,
    flags: StructureFlags,
    dictionary_kind: DictionaryKind,
    storage_size: u32,
    property_count: u32,
    transition_count: u32,
    specific_function_thrash_count: u32,
    cached_prototype_chain: Option<StructureChain>,
}

impl Structure {
    #[inline(always)]
    pub fn id(&self) -> StructureId {
        self.id
    }

    #[inline(always)]
    pub fn prototype(&self) -> Value {
        self.prototype
    }

    #[inline(always)]
    pub fn class(&self) -> ObjectClass {
        self.class
    }

    #[inline(always)]
    pub fn inline_capacity(&self) -> u32 {
        self.inline_capacity
    }

    #[inline(always)]
    pub fn previous_id(&self) -> Option<StructureId> {
        self.previous
    }

    #[inline(always)]
    pub fn flags(&self) -> StructureFlags {
        self.flags
    }

    #[inline(always)]
    pub fn is_pinned(&self) -> bool {
        self.flags.contains(StructureFlags::PINNED)
    }

    #[inline(always)]
    pub fn dictionary_kind(&self) -> DictionaryKind {
        self.dictionary_kind
    }

    #[inline(always)]
    pub fn is_dictionary(&self) -> bool {
        self.dictionary_kind != DictionaryKind::None
    }

    #[inline(always)]
    pub fn is_uncacheable_dictionary(&self) -> bool {
        self.dictionary_kind == DictionaryKind::Uncached
    }

    #[inline(always)]
    pub fn is_extensible(&self) -> bool {
        !self.flags.contains(StructureFlags::NOT_EXTENSIBLE)
    }

    #[inline(always)]
    pub fn intercepts_property_access(&self) -> bool {
        self.flags
            .contains(StructureFlags::INTERCEPTS_PROPERTY_ACCESS)
    }

    #[inline(always)]
    pub fn has_getter_setter(&self) -> bool {
        self.flags.contains(StructureFlags::HAS_GETTER_SETTER)
    }

    #[inline(always)]
    pub fn has_read_only(&self) -> bool {
        self.flags.contains(StructureFlags::HAS_READ_ONLY)
    }

    /// Number of storage slots objects of this structure need.
    #[inline(always)]
    pub fn storage_size(&self) -> u32 {
        self.storage_size
    }

    #[inline(always)]
    pub fn property_count(&self) -> u32 {
        self.property_count
    }

    /// Length of the add-property transition chain leading here.
    #[inline(always)]
    pub fn transition_count(&self) -> u32 {
        self.transition_count
    }

    #[inline(always)]
    pub fn outgoing_transition_count(&self) -> usize {
        self.transitions.len()
    }

    #[inline(always)]
    pub fn has_hashed_transition_table(&self) -> bool {
        self.transitions.is_hashed()
    }

    #[inline(always)]
    pub fn has_materialized_property_table(&self) -> bool {
        self.property_table.is_some()
    }

    #[inline(always)]
    pub fn specific_function_thrash_count(&self) -> u32 {
        self.specific_function_thrash_count
    }

    #[inline(always)]
    pub fn cached_prototype_chain(&self) -> Option<&StructureChain> {
        self.cached_prototype_chain.as_ref()
    }

    fn flags_for(attributes: PropertyAttributes) -> StructureFlags {
        let mut flags = StructureFlags::empty();
        if attributes.contains(PropertyAttributes::ACCESSOR) {
            flags |= StructureFlags::HAS_GETTER_SETTER;
        }
        if attributes.contains(PropertyAttributes::READ_ONLY) {
            flags |= StructureFlags::HAS_READ_ONLY;
        }
        if attributes.contains(PropertyAttributes::DONT_ENUM) {
            flags |= StructureFlags::HAS_NON_ENUMERABLE;
        }
        flags
    }
}

/// Tunables for transition bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct StructurePolicy {
    /// Longest add-property chain before an object goes dictionary.
    pub max_transition_length: u32,
    /// How often a structure may lose a specific function value before it
    /// stops recording them at all.
    pub specific_function_thrash_threshold: u32,
}

impl Default for StructurePolicy {
    fn default() -> Self {
        Self {
            max_transition_length: 64,
            specific_function_thrash_threshold: 3,
        }
    }
}

/// Owner of all structures of one [`VM`](crate::VM).
#[derive(Debug)]
pub struct StructureTable {
    structures: Vec<Structure>,
    empty_structures: AHashMap<(Value, ObjectClass, u32), StructureId>,
    policy: StructurePolicy,
}

impl core::ops::Index<StructureId> for StructureTable {
    type Output = Structure;

    #[inline(always)]
    fn index(&self, id: StructureId) -> &Structure {
        &self.structures[id.0 as usize]
    }
}

impl core::ops::IndexMut<StructureId> for StructureTable {
    #[inline(always)]
    fn index_mut(&mut self, id: StructureId) -> &mut Structure {
        &mut self.structures[id.0 as usize]
    }
}

impl StructureTable {
    pub fn new(policy: StructurePolicy) -> Self {
        Self {
            structures: Vec::new(),
            empty_structures: AHashMap::new(),
            policy,
        }
    }

    #[inline]
    pub fn get(&self, id: StructureId) -> &Structure {
        &self[id]
    }

    pub fn len(&self) -> usize {
        self.structures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.structures.is_empty()
    }

    pub fn policy(&self) -> StructurePolicy {
        self.policy
    }

    fn push(&mut self, mut structure: Structure) -> StructureId {
        let id = StructureId(self.structures.len() as u32);
        structure.id = id;
        self.structures.push(structure);
        id
    }

    fn root(
        prototype: Value,
        class: ObjectClass,
        inline_capacity: u32,
    ) -> Structure {
        let flags = if class == ObjectClass::Arguments {
            StructureFlags::INTERCEPTS_PROPERTY_ACCESS
        } else {
            StructureFlags::empty()
        };
        Structure {
            id: StructureId(u32::MAX),
            prototype,
            class,
            inline_capacity,
            previous: None,
            added_property: None,
            property_table: None,
            transitions: TransitionTable::Empty,
            flags,
            dictionary_kind: DictionaryKind::None,
            storage_size: 0,
            property_count: 0,
            transition_count: 0,
            specific_function_thrash_count: 0,
            cached_prototype_chain: None,
        }
    }

    /// The shared empty structure for objects with this prototype and
    /// class. Repeated calls return the same structure, which roots the
    /// transition DAG for that prototype.
    pub fn empty_structure(
        &mut self,
        prototype: Value,
        class: ObjectClass,
        inline_capacity: u32,
    ) -> StructureId {
        let key = (prototype, class, inline_capacity);
        if let Some(&id) = self.empty_structures.get(&key) {
            return id;
        }
        let id = self.push(Self::root(prototype, class, inline_capacity));
        self.empty_structures.insert(key, id);
        id
    }

    /// An empty structure that is not shared with anybody.
    pub fn unique_structure(
        &mut self,
        prototype: Value,
        class: ObjectClass,
        inline_capacity: u32,
    ) -> StructureId {
        self.push(Self::root(prototype, class, inline_capacity))
    }

    fn materialize(&mut self, id: StructureId) {
        if self[id].property_table.is_some() {
            return;
        }
        let mut path = Vec::new();
        let mut base_table = None;
        let mut current = id;
        loop {
            let structure = &self[current];
            if let Some(table) = &structure.property_table {
                base_table = Some(table.clone());
                break;
            }
            path.push(current);
            match structure.previous {
                Some(previous) => current = previous,
                None => break,
            }
        }
        let mut table = base_table.unwrap_or_default();
        for sid in path.iter().rev() {
            if let Some(entry) = self[*sid].added_property {
                table.add(entry);
            }
        }
        self[id].property_table = Some(table);
    }

    fn table_mut(&mut self, id: StructureId) -> &mut PropertyTable {
        self.materialize(id);
        self[id].property_table.get_or_insert_with(PropertyTable::new)
    }

    /// Look up `name` in the own property table of `id`.
    pub fn get_property(
        &mut self,
        id: StructureId,
        name: Identifier,
    ) -> Option<PropertyEntry> {
        if self[id].property_count == 0 {
            return None;
        }
        self.materialize(id);
        self[id]
            .property_table
            .as_ref()
            .and_then(|t| t.get(name).copied())
    }

    /// Like [`get_property`](Self::get_property) but walks the ancestor
    /// entries instead of materialising a table.
    pub fn find_property(&self, id: StructureId, name: Identifier) -> Option<PropertyEntry> {
        let mut current = id;
        loop {
            let structure = &self[current];
            if let Some(table) = &structure.property_table {
                return table.get(name).copied();
            }
            if let Some(entry) = structure.added_property
                && entry.key == name
            {
                return Some(entry);
            }
            current = structure.previous?;
        }
    }

    /// Own properties in insertion order.
    pub fn property_entries(&mut self, id: StructureId) -> Vec<PropertyEntry> {
        self.materialize(id);
        self[id]
            .property_table
            .as_ref()
            .map(|t| t.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Make `id`'s property table uniquely owned and drop its ancestor link.
    pub fn pin(&mut self, id: StructureId) {
        self.materialize(id);
        let structure = &mut self[id];
        structure.flags |= StructureFlags::PINNED;
        structure.previous = None;
    }

    fn effective_specific(
        &self,
        id: StructureId,
        specific: Option<CellId>,
    ) -> Option<CellId> {
        if self[id].specific_function_thrash_count
            >= self.policy.specific_function_thrash_threshold
        {
            None
        } else {
            specific
        }
    }

    /// Follow an already existing add-property transition, if any.
    pub fn add_property_transition_to_existing(
        &self,
        id: StructureId,
        name: Identifier,
        attributes: PropertyAttributes,
        specific: Option<CellId>,
    ) -> Option<(StructureId, PropertyOffset)> {
        let structure = &self[id];
        if structure.is_dictionary() {
            return None;
        }
        let specific = self.effective_specific(id, specific);
        let mut key = TransitionKey::AddProperty {
            name,
            attributes,
            specific,
        };
        let found = structure.transitions.get(&key).or_else(|| {
            // A despecified transition is compatible with any value.
            specific?;
            key = TransitionKey::AddProperty {
                name,
                attributes,
                specific: None,
            };
            structure.transitions.get(&key)
        })?;
        let offset = self[found].added_property.map(|e| e.offset)?;
        Some((found, offset))
    }

    /// Transition `id` by adding `name`. Reuses an existing transition when
    /// possible and goes dictionary once the chain grows past the policy
    /// bound.
    pub fn add_property_transition(
        &mut self,
        id: StructureId,
        name: Identifier,
        attributes: PropertyAttributes,
        specific: Option<CellId>,
    ) -> (StructureId, PropertyOffset) {
        debug_assert!(!self[id].is_dictionary());
        if let Some(existing) =
            self.add_property_transition_to_existing(id, name, attributes, specific)
        {
            return existing;
        }

        if self[id].transition_count >= self.policy.max_transition_length {
            log::debug!(
                "structure {id:?}: transition chain exceeds {}, going dictionary",
                self.policy.max_transition_length
            );
            let dictionary = self.to_dictionary(id, DictionaryKind::Cached);
            let offset = self.add_property_without_transition(
                dictionary, name, attributes, specific,
            );
            return (dictionary, offset);
        }

        let specific = self.effective_specific(id, specific);
        let parent = &self[id];
        let offset = parent.storage_size;
        let entry = PropertyEntry {
            key: name,
            offset,
            attributes,
            specific_value: specific,
        };

        let mut child = Self::root(parent.prototype, parent.class, parent.inline_capacity);
        child.previous = Some(id);
        child.added_property = Some(entry);
        child.flags = (parent.flags - StructureFlags::PINNED) | Structure::flags_for(attributes);
        child.storage_size = offset + 1;
        child.property_count = parent.property_count + 1;
        child.transition_count = parent.transition_count + 1;
        child.specific_function_thrash_count = parent.specific_function_thrash_count;
        if parent.is_pinned() {
            if let Some(table) = &parent.property_table {
                let mut table = table.clone();
                table.add(entry);
                child.property_table = Some(table);
            }
        }

        let child = self.push(child);
        self[id].transitions.insert(
            TransitionKey::AddProperty {
                name,
                attributes,
                specific,
            },
            child,
        );
        log::trace!("structure {id:?} -> {child:?}: add property at offset {offset}");
        (child, offset)
    }

    /// Add `name` to a dictionary structure in place.
    pub fn add_property_without_transition(
        &mut self,
        id: StructureId,
        name: Identifier,
        attributes: PropertyAttributes,
        specific: Option<CellId>,
    ) -> PropertyOffset {
        debug_assert!(self[id].is_pinned());
        let specific = self.effective_specific(id, specific);
        let next = self[id].storage_size;
        let table = self.table_mut(id);
        let offset = table.take_deleted_offset().unwrap_or(next);
        table.add(PropertyEntry {
            key: name,
            offset,
            attributes,
            specific_value: specific,
        });
        let structure = &mut self[id];
        structure.storage_size = structure.storage_size.max(offset + 1);
        structure.property_count += 1;
        structure.flags |= Structure::flags_for(attributes);
        structure.cached_prototype_chain = None;
        offset
    }

    /// Add a property, transitioning unless `id` is a dictionary.
    pub fn add_property(
        &mut self,
        id: StructureId,
        name: Identifier,
        attributes: PropertyAttributes,
        specific: Option<CellId>,
    ) -> (StructureId, PropertyOffset) {
        if self[id].is_dictionary() {
            let offset =
                self.add_property_without_transition(id, name, attributes, specific);
            (id, offset)
        } else {
            self.add_property_transition(id, name, attributes, specific)
        }
    }

    /// Copy `id` into a fresh, pinned dictionary structure.
    pub fn to_dictionary(
        &mut self,
        id: StructureId,
        kind: DictionaryKind,
    ) -> StructureId {
        debug_assert!(kind != DictionaryKind::None);
        self.materialize(id);
        let source = &self[id];
        let mut dictionary =
            Self::root(source.prototype, source.class, source.inline_capacity);
        dictionary.property_table = source.property_table.clone();
        dictionary.flags = source.flags | StructureFlags::PINNED;
        dictionary.dictionary_kind = kind;
        dictionary.storage_size = source.storage_size;
        dictionary.property_count = source.property_count;
        dictionary.specific_function_thrash_count = source.specific_function_thrash_count;
        let dictionary = self.push(dictionary);
        log::debug!("structure {id:?} -> {dictionary:?}: {kind:?} dictionary");
        dictionary
    }

    /// Remove `name`. The result is always an uncacheable dictionary.
    pub fn remove_property_transition(
        &mut self,
        id: StructureId,
        name: Identifier,
    ) -> (StructureId, Option<PropertyOffset>) {
        let target = if self[id].is_uncacheable_dictionary() {
            id
        } else {
            self.to_dictionary(id, DictionaryKind::Uncached)
        };
        let removed = self.table_mut(target).remove(name);
        if removed.is_some() {
            self[target].property_count -= 1;
        }
        (target, removed.map(|e| e.offset))
    }

    /// Change the attributes of an existing property.
    pub fn attribute_change_transition(
        &mut self,
        id: StructureId,
        name: Identifier,
        attributes: PropertyAttributes,
    ) -> StructureId {
        let target = if self[id].is_uncacheable_dictionary() {
            id
        } else {
            let kind = match self[id].dictionary_kind {
                DictionaryKind::None => DictionaryKind::Cached,
                kind => kind,
            };
            self.to_dictionary(id, kind)
        };
        if let Some(entry) = self.table_mut(target).get_mut(name) {
            entry.attributes = attributes;
            entry.specific_value = None;
        }
        self[target].flags |= Structure::flags_for(attributes);
        target
    }

    /// Forget the specific function value recorded for `name`. After
    /// too many of these the structure stops specialising altogether.
    pub fn despecify_function_transition(
        &mut self,
        id: StructureId,
        name: Identifier,
    ) -> StructureId {
        let target = if self[id].is_dictionary() {
            id
        } else {
            self.materialize(id);
            let source = &self[id];
            let mut copy = Self::root(source.prototype, source.class, source.inline_capacity);
            copy.property_table = source.property_table.clone();
            copy.flags = source.flags | StructureFlags::PINNED;
            copy.storage_size = source.storage_size;
            copy.property_count = source.property_count;
            copy.transition_count = source.transition_count;
            copy.specific_function_thrash_count = source.specific_function_thrash_count;
            self.push(copy)
        };

        self[target].specific_function_thrash_count += 1;
        let despecify_all = self[target].specific_function_thrash_count
            >= self.policy.specific_function_thrash_threshold;
        let table = self.table_mut(target);
        if despecify_all {
            for entry in table.iter_mut() {
                entry.specific_value = None;
            }
        } else if let Some(entry) = table.get_mut(name) {
            entry.specific_value = None;
        }
        log::trace!(
            "structure {id:?} -> {target:?}: despecified (thrash {})",
            self[target].specific_function_thrash_count
        );
        target
    }

    fn integrity_transition(
        &mut self,
        id: StructureId,
        key: TransitionKey,
    ) -> StructureId {
        if let Some(existing) = self[id].transitions.get(&key) {
            return existing;
        }
        let in_place = self[id].is_dictionary();
        let target = if in_place {
            id
        } else {
            self.materialize(id);
            let source = &self[id];
            let mut child = Self::root(source.prototype, source.class, source.inline_capacity);
            child.previous = Some(id);
            child.property_table = source.property_table.clone();
            child.flags = source.flags - StructureFlags::PINNED;
            child.storage_size = source.storage_size;
            child.property_count = source.property_count;
            child.transition_count = source.transition_count + 1;
            child.specific_function_thrash_count = source.specific_function_thrash_count;
            self.push(child)
        };

        let extra = match key {
            TransitionKey::Seal => PropertyAttributes::DONT_DELETE,
            TransitionKey::Freeze => {
                PropertyAttributes::DONT_DELETE | PropertyAttributes::READ_ONLY
            }
            _ => PropertyAttributes::empty(),
        };
        let mut any_read_only = false;
        for entry in self.table_mut(target).iter_mut() {
            let mut add = extra;
            if entry.attributes.contains(PropertyAttributes::ACCESSOR) {
                add.remove(PropertyAttributes::READ_ONLY);
            }
            entry.attributes |= add;
            any_read_only |= entry.attributes.contains(PropertyAttributes::READ_ONLY);
        }
        let structure = &mut self[target];
        structure.flags |= StructureFlags::NOT_EXTENSIBLE;
        if any_read_only {
            structure.flags |= StructureFlags::HAS_READ_ONLY;
        }
        if !in_place {
            self[id].transitions.insert(key, target);
        }
        target
    }

    pub fn prevent_extensions_transition(&mut self, id: StructureId) -> StructureId {
        self.integrity_transition(id, TransitionKey::PreventExtensions)
    }

    pub fn seal_transition(&mut self, id: StructureId) -> StructureId {
        self.integrity_transition(id, TransitionKey::Seal)
    }

    pub fn freeze_transition(&mut self, id: StructureId) -> StructureId {
        self.integrity_transition(id, TransitionKey::Freeze)
    }

    /// Turn a dictionary structure back into a cacheable one by renumbering
    /// its offsets densely in insertion order. Returns the `(old, new)`
    /// offset moves the owning object must apply to its storage.
    pub fn flatten_dictionary(
        &mut self,
        id: StructureId,
    ) -> Vec<(PropertyOffset, PropertyOffset)> {
        debug_assert!(self[id].is_pinned());
        let moves = self.table_mut(id).compact();
        let structure = &mut self[id];
        structure.storage_size = moves.len() as u32;
        structure.dictionary_kind = DictionaryKind::None;
        structure.cached_prototype_chain = None;
        log::debug!("structure {id:?}: flattened dictionary, {} properties", moves.len());
        moves
    }

    /// Values kept alive by structures: prototypes and recorded specific
    /// function values. Structures themselves are never collected.
    pub fn visit_roots(&self, visitor: &mut dyn FnMut(Value)) {
        for structure in &self.structures {
            visitor(structure.prototype);
            if let Some(cell) = structure.added_property.and_then(|e| e.specific_value) {
                visitor(Value::from_cell(cell));
            }
            if let Some(table) = &structure.property_table {
                for cell in table.iter().filter_map(|e| e.specific_value) {
                    visitor(Value::from_cell(cell));
                }
            }
        }
    }

    pub fn set_cached_prototype_chain(
        &mut self,
        id: StructureId,
        chain: StructureChain,
    ) {
        self[id].cached_prototype_chain = Some(chain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdentifierTable;

    fn table() -> StructureTable {
        StructureTable::new(StructurePolicy::default())
    }

    fn proto() -> Value {
        Value::from_cell(CellId::from_index(1))
    }

    #[test]
    fn identical_additions_converge_on_one_structure() {
        let names = IdentifierTable::new();
        let (x, y) = (names.add("x"), names.add("y"));
        let mut structures = table();

        let build = |structures: &mut StructureTable| {
            let empty = structures.empty_structure(proto(), ObjectClass::Object, 4);
            let (s, _) = structures.add_property(empty, x, PropertyAttributes::empty(), None);
            let (s, _) = structures.add_property(s, y, PropertyAttributes::empty(), None);
            s
        };
        let first = build(&mut structures);
        let count = structures.len();
        let second = build(&mut structures);
        assert_eq!(first, second);
        assert_eq!(structures.len(), count, "second build allocated structures");
    }

    #[test]
    fn offsets_are_stable_across_unrelated_transitions() {
        let names = IdentifierTable::new();
        let (a, b, c) = (names.add("a"), names.add("b"), names.add("c"));
        let mut structures = table();
        let empty = structures.empty_structure(proto(), ObjectClass::Object, 2);
        let (s1, a_offset) =
            structures.add_property(empty, a, PropertyAttributes::empty(), None);
        let (_s2, _) = structures.add_property(s1, b, PropertyAttributes::empty(), None);
        let (_s3, _) = structures.add_property(s1, c, PropertyAttributes::READ_ONLY, None);
        let _ = structures.freeze_transition(s1);

        assert_eq!(structures.get_property(s1, a).map(|e| e.offset), Some(a_offset));
    }

    #[test]
    fn transition_table_upgrades_on_second_edge() {
        let names = IdentifierTable::new();
        let (a, b) = (names.add("a"), names.add("b"));
        let mut structures = table();
        let empty = structures.empty_structure(proto(), ObjectClass::Object, 2);
        structures.add_property(empty, a, PropertyAttributes::empty(), None);
        assert_eq!(structures[empty].outgoing_transition_count(), 1);
        assert!(!structures[empty].has_hashed_transition_table());

        structures.add_property(empty, b, PropertyAttributes::empty(), None);
        assert_eq!(structures[empty].outgoing_transition_count(), 2);
        assert!(structures[empty].has_hashed_transition_table());
    }

    #[test]
    fn property_tables_materialize_lazily() {
        let names = IdentifierTable::new();
        let (a, b) = (names.add("a"), names.add("b"));
        let mut structures = table();
        let empty = structures.empty_structure(proto(), ObjectClass::Object, 2);
        let (s1, _) = structures.add_property(empty, a, PropertyAttributes::empty(), None);
        let (s2, _) = structures.add_property(s1, b, PropertyAttributes::DONT_ENUM, None);
        assert!(!structures[s2].has_materialized_property_table());

        let entry = structures.get_property(s2, a).expect("a visible through ancestors");
        assert_eq!(entry.offset, 0);
        assert!(structures[s2].has_materialized_property_table());
        assert!(!structures[s1].has_materialized_property_table());
        assert!(structures[s2].flags().contains(StructureFlags::HAS_NON_ENUMERABLE));
    }

    #[test]
    fn long_chains_become_dictionaries() {
        let names = IdentifierTable::new();
        let mut structures = StructureTable::new(StructurePolicy {
            max_transition_length: 4,
            ..StructurePolicy::default()
        });
        let mut s = structures.empty_structure(proto(), ObjectClass::Object, 2);
        for i in 0..6 {
            let name = names.add(&format!("p{i}"));
            s = structures.add_property(s, name, PropertyAttributes::empty(), None).0;
        }
        assert_eq!(structures[s].dictionary_kind(), DictionaryKind::Cached);
        assert!(structures[s].is_pinned());
        assert!(structures[s].previous_id().is_none());
        assert_eq!(structures[s].property_count(), 6);

        // Further additions mutate in place.
        let extra = names.add("extra");
        let (same, offset) = structures.add_property(s, extra, PropertyAttributes::empty(), None);
        assert_eq!(same, s);
        assert_eq!(offset, 6);
    }

    #[test]
    fn delete_yields_uncacheable_dictionary_and_reuses_offset() {
        let names = IdentifierTable::new();
        let (a, b, c) = (names.add("a"), names.add("b"), names.add("c"));
        let mut structures = table();
        let empty = structures.empty_structure(proto(), ObjectClass::Object, 2);
        let (s, _) = structures.add_property(empty, a, PropertyAttributes::empty(), None);
        let (s, _) = structures.add_property(s, b, PropertyAttributes::empty(), None);

        let (dict, removed) = structures.remove_property_transition(s, a);
        assert_ne!(dict, s);
        assert_eq!(removed, Some(0));
        assert!(structures[dict].is_uncacheable_dictionary());
        assert!(structures.get_property(s, a).is_some(), "original untouched");

        let (same, offset) = structures.add_property(dict, c, PropertyAttributes::empty(), None);
        assert_eq!(same, dict);
        assert_eq!(offset, 0);
    }

    #[test]
    fn flattening_preserves_insertion_order() {
        let names = IdentifierTable::new();
        let (a, b, c) = (names.add("a"), names.add("b"), names.add("c"));
        let mut structures = table();
        let empty = structures.empty_structure(proto(), ObjectClass::Object, 2);
        let (s, _) = structures.add_property(empty, a, PropertyAttributes::empty(), None);
        let (s, _) = structures.add_property(s, b, PropertyAttributes::empty(), None);
        let (s, _) = structures.add_property(s, c, PropertyAttributes::empty(), None);
        let (dict, _) = structures.remove_property_transition(s, a);

        let moves = structures.flatten_dictionary(dict);
        assert_eq!(moves, vec![(1, 0), (2, 1)]);
        let keys: Vec<_> = structures.property_entries(dict).iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![b, c]);
        assert!(!structures[dict].is_dictionary());
    }

    #[test]
    fn children_of_pinned_structures_copy_tables() {
        let names = IdentifierTable::new();
        let (a, b) = (names.add("a"), names.add("b"));
        let mut structures = table();
        let empty = structures.empty_structure(proto(), ObjectClass::Object, 2);
        let (s, _) = structures.add_property(empty, a, PropertyAttributes::empty(), None);
        let despecified = structures.despecify_function_transition(s, a);
        assert!(structures[despecified].is_pinned());

        let (child, _) =
            structures.add_property(despecified, b, PropertyAttributes::empty(), None);
        assert!(structures[child].has_materialized_property_table());
        assert!(!structures[child].is_pinned());
    }

    #[test]
    fn freeze_marks_everything_read_only() {
        let names = IdentifierTable::new();
        let a = names.add("a");
        let mut structures = table();
        let empty = structures.empty_structure(proto(), ObjectClass::Object, 2);
        let (s, _) = structures.add_property(empty, a, PropertyAttributes::empty(), None);
        let frozen = structures.freeze_transition(s);
        assert!(!structures[frozen].is_extensible());
        let entry = structures.get_property(frozen, a).unwrap();
        assert!(entry.attributes.contains(PropertyAttributes::READ_ONLY));
        assert!(entry.attributes.contains(PropertyAttributes::DONT_DELETE));
        assert_eq!(structures.freeze_transition(s), frozen);
    }

    #[test]
    fn specific_values_stop_after_thrashing() {
        let names = IdentifierTable::new();
        let f = names.add("f");
        let mut structures = StructureTable::new(StructurePolicy {
            specific_function_thrash_threshold: 2,
            ..StructurePolicy::default()
        });
        let fun = CellId::from_index(9);
        let empty = structures.empty_structure(proto(), ObjectClass::Object, 2);
        let (s, _) = structures.add_property(empty, f, PropertyAttributes::empty(), Some(fun));
        assert_eq!(structures.get_property(s, f).unwrap().specific_value, Some(fun));

        let d1 = structures.despecify_function_transition(s, f);
        assert_eq!(structures[d1].specific_function_thrash_count(), 1);
        let d2 = structures.despecify_function_transition(d1, f);
        assert_eq!(structures[d2].specific_function_thrash_count(), 2);

        let g = names.add("g");
        let (s3, _) = structures.add_property(d2, g, PropertyAttributes::empty(), Some(fun));
        assert_eq!(structures.get_property(s3, g).unwrap().specific_value, None);
    }

    #[test]
    fn despecified_transition_is_reused_for_other_values() {
        let names = IdentifierTable::new();
        let f = names.add("f");
        let mut structures = table();
        let empty = structures.empty_structure(proto(), ObjectClass::Object, 2);
        let (plain, _) = structures.add_property(empty, f, PropertyAttributes::empty(), None);
        let found = structures.add_property_transition_to_existing(
            empty,
            f,
            PropertyAttributes::empty(),
            Some(CellId::from_index(5)),
        );
        assert_eq!(found.map(|(s, _)| s), Some(plain));
    }
}
