//! Per-site property access caches.
//!
//! Each site moves through `Uninitialized → Monomorphic → Polymorphic →
//! Generic` and never back. A cached entry is only used after its
//! structure guard (and prototype chain guard, where present) matched the
//! live object, so a stale offset is never read.

use crate::{
    CellId, Heap, Identifier, JsObject, PropertyOffset, StructureChain, StructureId,
    StructureTable, Value,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    /// Executions served by a cached entry.
    pub hits: u64,
    /// Executions where no entry matched.
    pub misses: u64,
    /// Executions that ran the generic lookup.
    pub slow_path: u64,
}

/// Walk the prototypes of `structure` and check each against `chain`.
/// Returns the last prototype visited.
pub fn validate_chain(
    heap: &Heap,
    structures: &StructureTable,
    structure: StructureId,
    chain: &StructureChain,
) -> Option<CellId> {
    let mut prototype = structures[structure].prototype();
    let mut last = None;
    for &expected in chain.structures() {
        let cell = prototype.as_cell()?;
        let object = heap.object(cell)?;
        if object.structure() != expected {
            return None;
        }
        last = Some(cell);
        prototype = structures[expected].prototype();
    }
    last
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetByIdAccess {
    /// Property lives on the receiver.
    Own {
        structure: StructureId,
        offset: PropertyOffset,
    },
    /// Property lives on the receiver's direct prototype.
    Proto {
        structure: StructureId,
        prototype: CellId,
        prototype_structure: StructureId,
        offset: PropertyOffset,
    },
    /// Property lives further up; `chain` ends at the holder.
    Chain {
        structure: StructureId,
        chain: StructureChain,
        offset: PropertyOffset,
    },
}

impl GetByIdAccess {
    #[inline]
    pub fn structure(&self) -> StructureId {
        match *self {
            GetByIdAccess::Own { structure, .. }
            | GetByIdAccess::Proto { structure, .. }
            | GetByIdAccess::Chain { structure, .. } => structure,
        }
    }

    fn probe(
        &self,
        heap: &Heap,
        structures: &StructureTable,
        object: &JsObject,
    ) -> Option<Value> {
        if object.structure() != self.structure() {
            return None;
        }
        match self {
            GetByIdAccess::Own { offset, .. } => Some(object.get_direct(*offset)),
            GetByIdAccess::Proto {
                prototype,
                prototype_structure,
                offset,
                ..
            } => {
                let holder = heap.object(*prototype)?;
                (holder.structure() == *prototype_structure)
                    .then(|| holder.get_direct(*offset))
            }
            GetByIdAccess::Chain {
                structure,
                chain,
                offset,
            } => {
                let holder = validate_chain(heap, structures, *structure, chain)?;
                Some(heap.object(holder)?.get_direct(*offset))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetByIdState {
    Uninitialized,
    Monomorphic(GetByIdAccess),
    Polymorphic(Vec<GetByIdAccess>),
    Generic,
}

impl GetByIdState {
    /// Position along the state order. Never decreases for a site.
    pub fn rank(&self) -> u8 {
        match self {
            GetByIdState::Uninitialized => 0,
            GetByIdState::Monomorphic(_) => 1,
            GetByIdState::Polymorphic(_) => 2,
            GetByIdState::Generic => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GetByIdCache {
    state: GetByIdState,
    capacity: usize,
    pub counters: CacheCounters,
}

impl GetByIdCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: GetByIdState::Uninitialized,
            capacity,
            counters: CacheCounters::default(),
        }
    }

    #[inline]
    pub fn state(&self) -> &GetByIdState {
        &self.state
    }

    #[inline]
    pub fn is_generic(&self) -> bool {
        self.state == GetByIdState::Generic
    }

    /// Structure-guarded fast path.
    pub fn lookup(
        &self,
        heap: &Heap,
        structures: &StructureTable,
        object: &JsObject,
    ) -> Option<Value> {
        match &self.state {
            GetByIdState::Monomorphic(access) => access.probe(heap, structures, object),
            GetByIdState::Polymorphic(list) => list
                .iter()
                .find_map(|access| access.probe(heap, structures, object)),
            GetByIdState::Uninitialized | GetByIdState::Generic => None,
        }
    }

    /// Cache `access` after a slow-path lookup.
    pub fn record(&mut self, access: GetByIdAccess) {
        let state = std::mem::replace(&mut self.state, GetByIdState::Generic);
        self.state = match state {
            GetByIdState::Uninitialized => GetByIdState::Monomorphic(access),
            GetByIdState::Monomorphic(existing) => {
                if existing.structure() == access.structure() {
                    GetByIdState::Monomorphic(access)
                } else {
                    log::trace!("get_by_id: monomorphic -> polymorphic");
                    GetByIdState::Polymorphic(vec![existing, access])
                }
            }
            GetByIdState::Polymorphic(mut list) => {
                if let Some(slot) = list
                    .iter_mut()
                    .find(|entry| entry.structure() == access.structure())
                {
                    *slot = access;
                    GetByIdState::Polymorphic(list)
                } else if list.len() < self.capacity {
                    list.push(access);
                    GetByIdState::Polymorphic(list)
                } else {
                    log::warn!("get_by_id: {} structures seen, going generic", list.len() + 1);
                    GetByIdState::Generic
                }
            }
            GetByIdState::Generic => GetByIdState::Generic,
        };
    }

    pub fn make_generic(&mut self) {
        if !self.is_generic() {
            log::warn!("get_by_id: uncacheable access, going generic");
            self.state = GetByIdState::Generic;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutByIdAccess {
    /// Overwrite an existing own property.
    Replace {
        structure: StructureId,
        offset: PropertyOffset,
    },
    /// Add a property. `chain` guards the prototypes against gaining a
    /// setter or read-only property of the same name.
    Transition {
        old_structure: StructureId,
        new_structure: StructureId,
        offset: PropertyOffset,
        chain: StructureChain,
    },
}

impl PutByIdAccess {
    #[inline]
    pub fn structure(&self) -> StructureId {
        match *self {
            PutByIdAccess::Replace { structure, .. } => structure,
            PutByIdAccess::Transition { old_structure, .. } => old_structure,
        }
    }

    fn probe(
        &self,
        heap: &Heap,
        structures: &StructureTable,
        object: &JsObject,
    ) -> Option<PutHit> {
        if object.structure() != self.structure() {
            return None;
        }
        match self {
            PutByIdAccess::Replace { offset, .. } => Some(PutHit {
                offset: *offset,
                new_structure: None,
            }),
            PutByIdAccess::Transition {
                old_structure,
                new_structure,
                offset,
                chain,
            } => {
                if !chain.is_empty()
                    && validate_chain(heap, structures, *old_structure, chain).is_none()
                {
                    return None;
                }
                Some(PutHit {
                    offset: *offset,
                    new_structure: Some(*new_structure),
                })
            }
        }
    }
}

/// What a matching put entry asks the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutHit {
    pub offset: PropertyOffset,
    pub new_structure: Option<StructureId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutByIdState {
    Uninitialized,
    Monomorphic(PutByIdAccess),
    Polymorphic(Vec<PutByIdAccess>),
    Generic,
}

impl PutByIdState {
    pub fn rank(&self) -> u8 {
        match self {
            PutByIdState::Uninitialized => 0,
            PutByIdState::Monomorphic(_) => 1,
            PutByIdState::Polymorphic(_) => 2,
            PutByIdState::Generic => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PutByIdCache {
    state: PutByIdState,
    capacity: usize,
    pub counters: CacheCounters,
}

impl PutByIdCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: PutByIdState::Uninitialized,
            capacity,
            counters: CacheCounters::default(),
        }
    }

    #[inline]
    pub fn state(&self) -> &PutByIdState {
        &self.state
    }

    #[inline]
    pub fn is_generic(&self) -> bool {
        self.state == PutByIdState::Generic
    }

    pub fn lookup(
        &self,
        heap: &Heap,
        structures: &StructureTable,
        object: &JsObject,
    ) -> Option<PutHit> {
        match &self.state {
            PutByIdState::Monomorphic(access) => access.probe(heap, structures, object),
            PutByIdState::Polymorphic(list) => list
                .iter()
                .find_map(|access| access.probe(heap, structures, object)),
            PutByIdState::Uninitialized | PutByIdState::Generic => None,
        }
    }

    pub fn record(&mut self, access: PutByIdAccess) {
        let state = std::mem::replace(&mut self.state, PutByIdState::Generic);
        self.state = match state {
            PutByIdState::Uninitialized => PutByIdState::Monomorphic(access),
            PutByIdState::Monomorphic(existing) => {
                if existing.structure() == access.structure() {
                    PutByIdState::Monomorphic(access)
                } else {
                    log::trace!("put_by_id: monomorphic -> polymorphic");
                    PutByIdState::Polymorphic(vec![existing, access])
                }
            }
            PutByIdState::Polymorphic(mut list) => {
                if let Some(slot) = list
                    .iter_mut()
                    .find(|entry| entry.structure() == access.structure())
                {
                    *slot = access;
                    PutByIdState::Polymorphic(list)
                } else if list.len() < self.capacity {
                    list.push(access);
                    PutByIdState::Polymorphic(list)
                } else {
                    log::warn!("put_by_id: {} structures seen, going generic", list.len() + 1);
                    PutByIdState::Generic
                }
            }
            PutByIdState::Generic => PutByIdState::Generic,
        };
    }

    pub fn make_generic(&mut self) {
        if !self.is_generic() {
            log::warn!("put_by_id: uncacheable access, going generic");
            self.state = PutByIdState::Generic;
        }
    }
}

/// Key shape observed by a by-val site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByValKey {
    Identifier(Identifier),
    /// Integer index into an arguments object.
    ArgumentsIndex,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByValState {
    Uninitialized,
    /// Always the same property name; the embedded by-id cache applies.
    Identifier(Identifier),
    ArgumentsIndexed,
    Generic,
}

impl ByValState {
    pub fn rank(&self) -> u8 {
        match self {
            ByValState::Uninitialized => 0,
            ByValState::Identifier(_) | ByValState::ArgumentsIndexed => 1,
            ByValState::Generic => 2,
        }
    }

    /// Feed one observed key; returns whether the site is still cacheable
    /// for it.
    fn observe(&mut self, key: ByValKey) -> bool {
        let next = match (*self, key) {
            (ByValState::Generic, _) | (_, ByValKey::Other) => ByValState::Generic,
            (ByValState::Uninitialized, ByValKey::Identifier(name)) => ByValState::Identifier(name),
            (ByValState::Uninitialized, ByValKey::ArgumentsIndex) => ByValState::ArgumentsIndexed,
            (ByValState::Identifier(cached), ByValKey::Identifier(name)) if cached == name => {
                ByValState::Identifier(name)
            }
            (ByValState::ArgumentsIndexed, ByValKey::ArgumentsIndex) => {
                ByValState::ArgumentsIndexed
            }
            _ => ByValState::Generic,
        };
        if next == ByValState::Generic && *self != ByValState::Generic {
            log::trace!("by_val: {self:?} -> generic");
        }
        *self = next;
        next != ByValState::Generic
    }
}

#[derive(Debug, Clone)]
pub struct GetByValCache {
    state: ByValState,
    pub by_id: GetByIdCache,
    pub counters: CacheCounters,
}

impl GetByValCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: ByValState::Uninitialized,
            by_id: GetByIdCache::new(capacity),
            counters: CacheCounters::default(),
        }
    }

    pub fn state(&self) -> ByValState {
        self.state
    }

    pub fn observe(&mut self, key: ByValKey) -> bool {
        self.state.observe(key)
    }
}

#[derive(Debug, Clone)]
pub struct PutByValCache {
    state: ByValState,
    pub by_id: PutByIdCache,
    pub counters: CacheCounters,
}

impl PutByValCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: ByValState::Uninitialized,
            by_id: PutByIdCache::new(capacity),
            counters: CacheCounters::default(),
        }
    }

    pub fn state(&self) -> ByValState {
        self.state
    }

    pub fn observe(&mut self, key: ByValKey) -> bool {
        self.state.observe(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IdentifierTable, ObjectClass, ObjectKind, PropertyAttributes, StructurePolicy};

    fn own(structure: u32, offset: u32) -> GetByIdAccess {
        let mut structures = StructureTable::new(StructurePolicy::default());
        let mut id = structures.empty_structure(Value::NULL, ObjectClass::Object, 0);
        let names = IdentifierTable::new();
        for i in 0..structure {
            id = structures
                .add_property(id, names.add(&format!("p{i}")), PropertyAttributes::empty(), None)
                .0;
        }
        GetByIdAccess::Own { structure: id, offset }
    }

    #[test]
    fn states_only_move_forward() {
        let mut cache = GetByIdCache::new(2);
        let mut last = cache.state().rank();
        for access in [own(0, 0), own(0, 0), own(1, 0), own(2, 1), own(3, 0), own(1, 0)] {
            cache.record(access);
            let rank = cache.state().rank();
            assert!(rank >= last);
            last = rank;
        }
        assert!(cache.is_generic());
    }

    #[test]
    fn same_structure_replaces_entry_in_place() {
        let mut cache = GetByIdCache::new(4);
        cache.record(own(1, 0));
        cache.record(own(1, 0));
        assert!(matches!(cache.state(), GetByIdState::Monomorphic(_)));
    }

    #[test]
    fn own_probe_requires_matching_structure() {
        let heap = Heap::new(16);
        let mut structures = StructureTable::new(StructurePolicy::default());
        let names = IdentifierTable::new();
        let empty = structures.empty_structure(Value::NULL, ObjectClass::Object, 2);
        let (s1, offset) =
            structures.add_property(empty, names.add("x"), PropertyAttributes::empty(), None);
        let mut object = JsObject::new(s1, 2, ObjectKind::Plain);
        object.put_direct(offset, Value::from_i64(3));

        let mut cache = GetByIdCache::new(4);
        cache.record(GetByIdAccess::Own { structure: s1, offset });
        assert_eq!(cache.lookup(&heap, &structures, &object), Some(Value::from_i64(3)));

        let other = JsObject::new(empty, 2, ObjectKind::Plain);
        assert_eq!(cache.lookup(&heap, &structures, &other), None);
    }

    #[test]
    fn by_val_sites_go_generic_on_second_key() {
        let names = IdentifierTable::new();
        let (a, b) = (names.add("a"), names.add("b"));
        let mut cache = GetByValCache::new(4);
        assert!(cache.observe(ByValKey::Identifier(a)));
        assert!(cache.observe(ByValKey::Identifier(a)));
        assert!(!cache.observe(ByValKey::Identifier(b)));
        assert_eq!(cache.state(), ByValState::Generic);
        assert!(!cache.observe(ByValKey::Identifier(a)));
    }
}
