//! Property access.
//!
//! The generic lookup walks an object's structure and prototype chain. The
//! cached entry points used by the interpreter consult a site's inline cache
//! first and only fall back to the generic path on a miss, feeding what the
//! slow path learned back into the cache.

use crate::{
    ArgumentsOverrides, ByValKey, Cell, CellId, CodeBlock, CodeBlockId, ErrorType, Exception,
    GetByIdAccess, GetByIdCache, GetterSetter, Identifier, JsObject, ObjectClass, PropertyAttributes,
    PropertyOffset, PutByIdAccess, PutByIdCache, PutHit, StructureChain, StructureId, Value,
    VM, validate_chain,
};

/// Where a lookup found a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertySlot {
    pub holder: CellId,
    /// Structure of `holder` at lookup time.
    pub structure: StructureId,
    pub offset: PropertyOffset,
    pub attributes: PropertyAttributes,
    pub specific_value: Option<CellId>,
    /// Prototype hops from the receiver to `holder`.
    pub depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    NotFound,
    Found(PropertySlot),
    /// Answered by the object itself instead of its property table.
    Intercepted(Value),
}

/// What a generic put did, as far as a put cache is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Replaced {
        structure: StructureId,
        offset: PropertyOffset,
    },
    Transitioned {
        old: StructureId,
        new: StructureId,
        offset: PropertyOffset,
    },
    /// The store went through a property specialised on a function value.
    /// Caching it would skip the despecification.
    Specialized,
    Uncacheable,
    Ignored,
}

enum CacheDecision<T> {
    Cache(T),
    Uncacheable,
    Ignore,
}

#[derive(Debug, Clone, Copy)]
struct CacheSite {
    code_block: CodeBlockId,
    index: usize,
    by_val: bool,
}

fn get_cache(code_blocks: &mut [CodeBlock], site: CacheSite) -> &mut GetByIdCache {
    let code_block = &mut code_blocks[site.code_block.index() as usize];
    if site.by_val {
        &mut code_block.get_by_val[site.index].by_id
    } else {
        &mut code_block.get_by_id[site.index]
    }
}

fn put_cache(code_blocks: &mut [CodeBlock], site: CacheSite) -> &mut PutByIdCache {
    let code_block = &mut code_blocks[site.code_block.index() as usize];
    if site.by_val {
        &mut code_block.put_by_val[site.index].by_id
    } else {
        &mut code_block.put_by_id[site.index]
    }
}

impl VM {
    // ── Generic lookup ─────────────────────────────────────────────

    fn intercepted_property(&self, cell: CellId, object: &JsObject, name: Identifier) -> Option<Value> {
        if let Some(global) = object.as_global() {
            let entry = global.symbol_table.get(name)?;
            return global.variables.get(entry.index as usize).copied();
        }
        let arguments = object.as_arguments()?;
        if name == self.names.length && !arguments.overrides.contains(ArgumentsOverrides::LENGTH) {
            return Some(Value::from_i64(arguments.num_arguments as i64));
        }
        if name == self.names.callee && !arguments.overrides.contains(ArgumentsOverrides::CALLEE) {
            return Some(arguments.callee);
        }
        let index = self.identifiers.as_index(name)?;
        self.arguments_get_index(cell, index as usize)
    }

    /// Find `name` on `object` or its prototypes.
    pub fn lookup_property(&self, object: CellId, name: Identifier) -> LookupResult {
        let mut current = object;
        let mut depth = 0;
        loop {
            let Some(holder) = self.heap.object(current) else {
                return LookupResult::NotFound;
            };
            if let Some(value) = self.intercepted_property(current, holder, name) {
                return LookupResult::Intercepted(value);
            }
            let structure = holder.structure();
            if let Some(entry) = self.structures.find_property(structure, name) {
                return LookupResult::Found(PropertySlot {
                    holder: current,
                    structure,
                    offset: entry.offset,
                    attributes: entry.attributes,
                    specific_value: entry.specific_value,
                    depth,
                });
            }
            match self.structures[structure].prototype().as_cell() {
                Some(prototype) => {
                    current = prototype;
                    depth += 1;
                }
                None => return LookupResult::NotFound,
            }
        }
    }

    pub fn has_property(&self, object: CellId, name: Identifier) -> bool {
        self.lookup_property(object, name) != LookupResult::NotFound
    }

    fn type_error_for(&mut self, base: Value, name: Identifier, action: &str) -> Exception {
        let message = format!(
            "cannot {action} property '{}' of {}",
            self.identifiers.name(name),
            self.display_value(base)
        );
        self.throw_error(ErrorType::TypeError, &message)
    }

    /// `base[name]` with full semantics: primitives read through
    /// `Object.prototype`, accessors run their getter.
    pub fn get(&mut self, base: Value, name: Identifier) -> Result<Value, Exception> {
        if base.is_undefined_or_null() {
            return Err(self.type_error_for(base, name, "read"));
        }
        let start = match base.as_cell() {
            Some(cell) if self.heap.object(cell).is_some() => cell,
            Some(cell) => {
                if name == self.names.length
                    && let Some(s) = self.heap.string(cell)
                {
                    return Ok(Value::from_i64(s.chars().count() as i64));
                }
                self.object_prototype
            }
            None => self.object_prototype,
        };
        match self.lookup_property(start, name) {
            LookupResult::NotFound => Ok(Value::UNDEFINED),
            LookupResult::Intercepted(value) => Ok(value),
            LookupResult::Found(slot) => self.slot_value(base, slot),
        }
    }

    pub(crate) fn slot_value(&mut self, receiver: Value, slot: PropertySlot) -> Result<Value, Exception> {
        let value = self
            .heap
            .object(slot.holder)
            .map_or(Value::UNDEFINED, |holder| holder.get_direct(slot.offset));
        if !slot.attributes.contains(PropertyAttributes::ACCESSOR) {
            return Ok(value);
        }
        let getter = value
            .as_cell()
            .and_then(|cell| self.heap.getter_setter(cell))
            .map_or(Value::UNDEFINED, |pair| pair.getter);
        if getter.is_undefined() {
            return Ok(Value::UNDEFINED);
        }
        self.call_function(getter, receiver, &[])
    }

    fn reject_put(&mut self, strict: bool, name: Identifier, why: &str) -> Result<PutOutcome, Exception> {
        if strict {
            let message = format!("cannot assign to {why} property '{}'", self.identifiers.name(name));
            Err(self.throw_error(ErrorType::TypeError, &message))
        } else {
            log::trace!("ignored sloppy write to {why} property");
            Ok(PutOutcome::Ignored)
        }
    }

    fn call_setter(&mut self, accessor: Value, receiver: Value, value: Value, strict: bool, name: Identifier) -> Result<PutOutcome, Exception> {
        let setter = accessor
            .as_cell()
            .and_then(|cell| self.heap.getter_setter(cell))
            .map_or(Value::UNDEFINED, |pair| pair.setter);
        if setter.is_undefined() {
            return self.reject_put(strict, name, "getter-only");
        }
        self.call_function(setter, receiver, &[value])?;
        Ok(PutOutcome::Uncacheable)
    }

    /// `base[name] = value`. Read-only targets and non-extensible objects
    /// throw a TypeError in strict code and are ignored otherwise.
    pub fn put(
        &mut self,
        base: Value,
        name: Identifier,
        value: Value,
        strict: bool,
    ) -> Result<PutOutcome, Exception> {
        if base.is_undefined_or_null() {
            return Err(self.type_error_for(base, name, "set"));
        }
        let Some(cell) = base.as_cell().filter(|&cell| self.heap.object(cell).is_some()) else {
            return self.reject_put(strict, name, "primitive's");
        };

        if let Some(outcome) = self.put_intercepted(cell, name, value, strict)? {
            return Ok(outcome);
        }

        let structure = match self.heap.object(cell) {
            Some(object) => object.structure(),
            None => return Ok(PutOutcome::Ignored),
        };
        if let Some(entry) = self.structures.find_property(structure, name) {
            if entry.attributes.contains(PropertyAttributes::ACCESSOR) {
                let accessor = self.heap.object(cell).map_or(Value::UNDEFINED, |o| o.get_direct(entry.offset));
                return self.call_setter(accessor, base, value, strict, name);
            }
            if entry.attributes.contains(PropertyAttributes::READ_ONLY) {
                return self.reject_put(strict, name, "read-only");
            }
            let mut outcome = if self.structures[structure].is_dictionary() {
                PutOutcome::Uncacheable
            } else {
                PutOutcome::Replaced {
                    structure,
                    offset: entry.offset,
                }
            };
            if let Some(specific) = entry.specific_value {
                if value.as_cell() != Some(specific) {
                    let despecified = self.structures.despecify_function_transition(structure, name);
                    if let Some(object) = self.heap.object_mut(cell) {
                        object.set_structure(despecified);
                    }
                }
                outcome = PutOutcome::Specialized;
            }
            if let Some(object) = self.heap.object_mut(cell) {
                object.put_direct(entry.offset, value);
            }
            self.heap.write_barrier(cell, value);
            return Ok(outcome);
        }

        if let Some(prototype) = self.structures[structure].prototype().as_cell()
            && let LookupResult::Found(slot) = self.lookup_property(prototype, name)
        {
            if slot.attributes.contains(PropertyAttributes::ACCESSOR) {
                let accessor = self
                    .heap
                    .object(slot.holder)
                    .map_or(Value::UNDEFINED, |o| o.get_direct(slot.offset));
                return self.call_setter(accessor, base, value, strict, name);
            }
            if slot.attributes.contains(PropertyAttributes::READ_ONLY) {
                return self.reject_put(strict, name, "read-only");
            }
        }

        if !self.structures[structure].is_extensible() {
            return self.reject_put(strict, name, "non-extensible object's");
        }
        let specific = value.as_cell().filter(|_| self.is_callable(value));
        let (new_structure, offset) =
            self.structures
                .add_property(structure, name, PropertyAttributes::empty(), specific);
        let storage_size = self.structures[new_structure].storage_size();
        if let Some(object) = self.heap.object_mut(cell) {
            object.ensure_storage(storage_size);
            object.put_direct(offset, value);
            object.set_structure(new_structure);
        }
        self.heap.write_barrier(cell, value);

        let recorded = self.structures.find_property(new_structure, name);
        Ok(if recorded.is_some_and(|e| e.specific_value.is_some()) {
            PutOutcome::Specialized
        } else if self.structures[structure].is_dictionary() || self.structures[new_structure].is_dictionary() {
            PutOutcome::Uncacheable
        } else {
            PutOutcome::Transitioned {
                old: structure,
                new: new_structure,
                offset,
            }
        })
    }

    /// Stores the object answers itself: declared global variables and
    /// arguments elements.
    fn put_intercepted(
        &mut self,
        cell: CellId,
        name: Identifier,
        value: Value,
        strict: bool,
    ) -> Result<Option<PutOutcome>, Exception> {
        let Some(object) = self.heap.object(cell) else {
            return Ok(None);
        };
        if let Some(global) = object.as_global() {
            let Some(entry) = global.symbol_table.get(name) else {
                return Ok(None);
            };
            if entry.is_read_only() {
                return self.reject_put(strict, name, "read-only").map(Some);
            }
            let index = entry.index as usize;
            self.set_global_variable(name, index, value);
            return Ok(Some(PutOutcome::Uncacheable));
        }
        if object.as_arguments().is_none() {
            return Ok(None);
        }
        if let Some(index) = self.identifiers.as_index(name)
            && self.arguments_put_index(cell, index as usize, value)
        {
            return Ok(Some(PutOutcome::Uncacheable));
        }
        let override_flag = if name == self.names.length {
            ArgumentsOverrides::LENGTH
        } else if name == self.names.callee {
            ArgumentsOverrides::CALLEE
        } else if name == self.names.caller {
            ArgumentsOverrides::CALLER
        } else {
            ArgumentsOverrides::empty()
        };
        if let Some(arguments) = self.heap.object_mut(cell).and_then(JsObject::as_arguments_mut) {
            arguments.overrides |= override_flag;
        }
        Ok(None)
    }

    // ── Definitions and integrity ──────────────────────────────────

    /// Create or redefine an own data property. Returns `false` when the
    /// object is not extensible.
    pub fn define_own_property(
        &mut self,
        object: CellId,
        name: Identifier,
        value: Value,
        attributes: PropertyAttributes,
    ) -> bool {
        let Some(structure) = self.heap.object(object).map(JsObject::structure) else {
            return false;
        };
        let (structure, offset) = match self.structures.find_property(structure, name) {
            Some(entry) if entry.attributes == attributes && entry.specific_value.is_none() => {
                (structure, entry.offset)
            }
            Some(entry) => (
                self.structures
                    .attribute_change_transition(structure, name, attributes),
                entry.offset,
            ),
            None => {
                if !self.structures[structure].is_extensible() {
                    return false;
                }
                self.structures.add_property(structure, name, attributes, None)
            }
        };
        let storage_size = self.structures[structure].storage_size();
        if let Some(cell) = self.heap.object_mut(object) {
            cell.ensure_storage(storage_size);
            cell.put_direct(offset, value);
            cell.set_structure(structure);
        }
        self.heap.write_barrier(object, value);
        true
    }

    /// Define an accessor property backed by a getter/setter cell.
    pub fn define_accessor(&mut self, object: CellId, name: Identifier, getter: Value, setter: Value) -> bool {
        let pair = self
            .heap
            .allocate(Cell::GetterSetter(GetterSetter { getter, setter }));
        self.define_own_property(object, name, Value::from_cell(pair), PropertyAttributes::ACCESSOR)
    }

    /// `delete object[name]`. Returns whether the property is gone; a
    /// non-configurable property throws in strict code.
    pub fn delete_property(&mut self, object: CellId, name: Identifier, strict: bool) -> Result<bool, Exception> {
        let Some(target) = self.heap.object(object) else {
            return Ok(true);
        };
        let mut undeletable = false;
        if let Some(global) = target.as_global() {
            undeletable = global.symbol_table.get(name).is_some();
        } else if let Some(arguments) = target.as_arguments() {
            let num_arguments = arguments.num_arguments;
            if let Some(index) = self.identifiers.as_index(name)
                && (index as usize) < num_arguments
            {
                self.arguments_delete_index(object, index as usize);
                return Ok(true);
            }
            let flag = if name == self.names.length {
                ArgumentsOverrides::LENGTH
            } else if name == self.names.callee {
                ArgumentsOverrides::CALLEE
            } else {
                ArgumentsOverrides::empty()
            };
            if let Some(arguments) = self.heap.object_mut(object).and_then(JsObject::as_arguments_mut)
                && !flag.is_empty()
                && !arguments.overrides.contains(flag)
            {
                arguments.overrides |= flag;
                return Ok(true);
            }
        }

        let structure = match self.heap.object(object) {
            Some(target) => target.structure(),
            None => return Ok(true),
        };
        if !undeletable {
            match self.structures.find_property(structure, name) {
                None => return Ok(true),
                Some(entry) if entry.attributes.contains(PropertyAttributes::DONT_DELETE) => {
                    undeletable = true;
                }
                Some(_) => {
                    let (dictionary, removed) = self.structures.remove_property_transition(structure, name);
                    if let Some(target) = self.heap.object_mut(object) {
                        if let Some(offset) = removed {
                            target.put_direct(offset, Value::UNDEFINED);
                        }
                        target.set_structure(dictionary);
                    }
                    return Ok(true);
                }
            }
        }
        debug_assert!(undeletable);
        if strict {
            let message = format!("cannot delete property '{}'", self.identifiers.name(name));
            return Err(self.throw_error(ErrorType::TypeError, &message));
        }
        Ok(false)
    }

    fn integrity_change(&mut self, object: CellId, change: fn(&mut crate::StructureTable, StructureId) -> StructureId) {
        let Some(structure) = self.heap.object(object).map(JsObject::structure) else {
            return;
        };
        let next = change(&mut self.structures, structure);
        if let Some(target) = self.heap.object_mut(object) {
            target.set_structure(next);
        }
    }

    pub fn prevent_extensions(&mut self, object: CellId) {
        self.integrity_change(object, crate::StructureTable::prevent_extensions_transition);
    }

    pub fn seal(&mut self, object: CellId) {
        self.integrity_change(object, crate::StructureTable::seal_transition);
    }

    pub fn freeze(&mut self, object: CellId) {
        self.integrity_change(object, crate::StructureTable::freeze_transition);
    }

    /// Enumerable own property names in insertion order.
    pub fn own_property_names(&mut self, object: CellId) -> Vec<Identifier> {
        let Some(target) = self.heap.object(object) else {
            return Vec::new();
        };
        let structure = target.structure();
        let mut names = Vec::new();
        if let Some(global) = target.as_global() {
            names.extend(
                global
                    .symbol_table
                    .iter()
                    .filter(|(_, e)| !e.attributes.contains(PropertyAttributes::DONT_ENUM))
                    .map(|(name, _)| name),
            );
        } else if let Some(arguments) = target.as_arguments() {
            let count = arguments.num_arguments;
            names.extend(
                (0..count)
                    .filter(|&i| self.arguments_get_index(object, i).is_some())
                    .map(|i| self.identifiers.from_index(i as u32)),
            );
        }
        names.extend(
            self.structures
                .property_entries(structure)
                .into_iter()
                .filter(|e| !e.attributes.contains(PropertyAttributes::DONT_ENUM))
                .map(|e| e.key),
        );
        names
    }

    // ── Prototype chain normalisation ──────────────────────────────

    fn flatten_object(&mut self, cell: CellId) {
        let Some(structure) = self.heap.object(cell).map(JsObject::structure) else {
            return;
        };
        let moves = self.structures.flatten_dictionary(structure);
        if let Some(object) = self.heap.object_mut(cell) {
            object.apply_offset_moves(&moves);
        }
    }

    /// Snapshot the prototype chain of `structure` for a cache guard,
    /// flattening cacheable dictionary prototypes on the way. `None` when
    /// some prototype can never be cached.
    pub fn normalize_prototype_chain(&mut self, structure: StructureId) -> Option<StructureChain> {
        if let Some(chain) = self.structures[structure].cached_prototype_chain()
            && (chain.is_empty() || validate_chain(&self.heap, &self.structures, structure, chain).is_some())
        {
            return Some(chain.clone());
        }
        let mut chain = Vec::new();
        let mut prototype = self.structures[structure].prototype();
        while let Some(cell) = prototype.as_cell() {
            let current = self.heap.object(cell)?.structure();
            let shape = &self.structures[current];
            if shape.intercepts_property_access()
                || shape.is_uncacheable_dictionary()
                || matches!(shape.class(), ObjectClass::Global | ObjectClass::Arguments)
            {
                log::trace!("prototype chain of {structure:?} is uncacheable at {cell:?}");
                return None;
            }
            if shape.is_dictionary() {
                self.flatten_object(cell);
            }
            chain.push(current);
            prototype = self.structures[current].prototype();
        }
        let chain = StructureChain::new(chain);
        self.structures.set_cached_prototype_chain(structure, chain.clone());
        Some(chain)
    }

    // ── Cached get ─────────────────────────────────────────────────

    fn plan_get_by_id(&mut self, base: Value, name: Identifier) -> CacheDecision<GetByIdAccess> {
        let Some(cell) = base.as_cell() else {
            return CacheDecision::Ignore;
        };
        let Some(structure) = self.heap.object(cell).map(JsObject::structure) else {
            return CacheDecision::Ignore;
        };
        let shape = &self.structures[structure];
        if shape.intercepts_property_access() || shape.is_uncacheable_dictionary() {
            return CacheDecision::Uncacheable;
        }
        if shape.is_dictionary() {
            self.flatten_object(cell);
        }

        let slot = match self.lookup_property(cell, name) {
            LookupResult::NotFound => return CacheDecision::Ignore,
            LookupResult::Intercepted(_) => return CacheDecision::Uncacheable,
            LookupResult::Found(slot) => slot,
        };
        if slot.attributes.contains(PropertyAttributes::ACCESSOR) {
            return CacheDecision::Uncacheable;
        }
        if slot.depth == 0 {
            return CacheDecision::Cache(GetByIdAccess::Own {
                structure,
                offset: slot.offset,
            });
        }

        let Some(chain) = self.normalize_prototype_chain(structure) else {
            return CacheDecision::Uncacheable;
        };
        // Flattening may have moved the holder's slot.
        let LookupResult::Found(slot) = self.lookup_property(cell, name) else {
            return CacheDecision::Uncacheable;
        };
        if slot.depth == 1 {
            CacheDecision::Cache(GetByIdAccess::Proto {
                structure,
                prototype: slot.holder,
                prototype_structure: slot.structure,
                offset: slot.offset,
            })
        } else {
            let to_holder = chain.structures()[..slot.depth as usize].to_vec();
            CacheDecision::Cache(GetByIdAccess::Chain {
                structure,
                chain: StructureChain::new(to_holder),
                offset: slot.offset,
            })
        }
    }

    fn get_with_cache(&mut self, site: CacheSite, base: Value, name: Identifier) -> Result<Value, Exception> {
        if let Some(object) = base.as_cell().and_then(|cell| self.heap.object(cell)) {
            let cache = get_cache(&mut self.code_blocks, site);
            if let Some(value) = cache.lookup(&self.heap, &self.structures, object) {
                cache.counters.hits += 1;
                return Ok(value);
            }
            cache.counters.misses += 1;
        }

        let cache = get_cache(&mut self.code_blocks, site);
        cache.counters.slow_path += 1;
        if !cache.is_generic() {
            match self.plan_get_by_id(base, name) {
                CacheDecision::Cache(access) => get_cache(&mut self.code_blocks, site).record(access),
                CacheDecision::Uncacheable => get_cache(&mut self.code_blocks, site).make_generic(),
                CacheDecision::Ignore => {}
            }
        }
        self.get(base, name)
    }

    /// `base.name` through get-by-id site `site` of `code_block`.
    pub fn get_by_id_cached(
        &mut self,
        code_block: CodeBlockId,
        site: usize,
        base: Value,
        name: Identifier,
    ) -> Result<Value, Exception> {
        let site = CacheSite {
            code_block,
            index: site,
            by_val: false,
        };
        self.get_with_cache(site, base, name)
    }

    // ── Cached put ─────────────────────────────────────────────────

    fn apply_put_hit(&mut self, cell: CellId, hit: PutHit, value: Value) {
        let storage_size = hit.new_structure.map(|s| self.structures[s].storage_size());
        if let Some(object) = self.heap.object_mut(cell) {
            if let (Some(structure), Some(size)) = (hit.new_structure, storage_size) {
                object.ensure_storage(size);
                object.set_structure(structure);
            }
            object.put_direct(hit.offset, value);
        }
        self.heap.write_barrier(cell, value);
    }

    fn put_with_cache(
        &mut self,
        site: CacheSite,
        base: Value,
        name: Identifier,
        value: Value,
    ) -> Result<(), Exception> {
        let strict = self.code_blocks[site.code_block.index() as usize].strict;
        if let Some(cell) = base.as_cell()
            && let Some(object) = self.heap.object(cell)
        {
            let cache = put_cache(&mut self.code_blocks, site);
            if let Some(hit) = cache.lookup(&self.heap, &self.structures, object) {
                cache.counters.hits += 1;
                self.apply_put_hit(cell, hit, value);
                return Ok(());
            }
            cache.counters.misses += 1;

            let structure = object.structure();
            if self.structures[structure].dictionary_kind() == crate::DictionaryKind::Cached
                && !put_cache(&mut self.code_blocks, site).is_generic()
            {
                self.flatten_object(cell);
            }
        }

        put_cache(&mut self.code_blocks, site).counters.slow_path += 1;
        let outcome = self.put(base, name, value, strict)?;
        if put_cache(&mut self.code_blocks, site).is_generic() {
            return Ok(());
        }
        match outcome {
            PutOutcome::Replaced { structure, offset } => {
                put_cache(&mut self.code_blocks, site).record(PutByIdAccess::Replace { structure, offset });
            }
            PutOutcome::Transitioned { old, new, offset } => match self.normalize_prototype_chain(old) {
                Some(chain) => put_cache(&mut self.code_blocks, site).record(PutByIdAccess::Transition {
                    old_structure: old,
                    new_structure: new,
                    offset,
                    chain,
                }),
                None => put_cache(&mut self.code_blocks, site).make_generic(),
            },
            PutOutcome::Uncacheable => put_cache(&mut self.code_blocks, site).make_generic(),
            PutOutcome::Specialized | PutOutcome::Ignored => {}
        }
        Ok(())
    }

    /// `base.name = value` through put-by-id site `site` of `code_block`.
    pub fn put_by_id_cached(
        &mut self,
        code_block: CodeBlockId,
        site: usize,
        base: Value,
        name: Identifier,
        value: Value,
    ) -> Result<(), Exception> {
        let site = CacheSite {
            code_block,
            index: site,
            by_val: false,
        };
        self.put_with_cache(site, base, name, value)
    }

    // ── By value ───────────────────────────────────────────────────

    /// Property name for a computed key.
    pub fn key_to_identifier(&self, key: Value) -> Identifier {
        if let Some(n) = key.as_i64() {
            if (0..=u32::MAX as i64).contains(&n) {
                return self.identifiers.from_index(n as u32);
            }
            return self.identifiers.add(&n.to_string());
        }
        match self.string_value(key) {
            Some(s) => self.identifiers.add(s),
            None => self.identifiers.add(&self.display_value(key)),
        }
    }

    fn arguments_index(&self, base: Value, key: Value) -> Option<(CellId, usize)> {
        let cell = base.as_cell()?;
        self.heap.object(cell)?.as_arguments()?;
        let index = key.as_i64().filter(|&n| n >= 0)?;
        Some((cell, index as usize))
    }

    fn by_val_key(&self, base: Value, key: Value, name: Identifier) -> ByValKey {
        if self.arguments_index(base, key).is_some() {
            ByValKey::ArgumentsIndex
        } else if key.as_i64().is_some() {
            ByValKey::Other
        } else if self.string_value(key).is_some() {
            ByValKey::Identifier(name)
        } else {
            ByValKey::Other
        }
    }

    /// `base[key]` through get-by-val site `site` of `code_block`.
    pub fn get_by_val_cached(
        &mut self,
        code_block: CodeBlockId,
        site: usize,
        base: Value,
        key: Value,
    ) -> Result<Value, Exception> {
        let name = self.key_to_identifier(key);
        let kind = self.by_val_key(base, key, name);
        let cache = &mut self.code_blocks[code_block.index() as usize].get_by_val[site];
        if !cache.observe(kind) {
            cache.counters.slow_path += 1;
            return self.get(base, name);
        }
        match kind {
            ByValKey::ArgumentsIndex => {
                if let Some((cell, index)) = self.arguments_index(base, key)
                    && let Some(value) = self.arguments_get_index(cell, index)
                {
                    self.code_blocks[code_block.index() as usize].get_by_val[site]
                        .counters
                        .hits += 1;
                    return Ok(value);
                }
                self.code_blocks[code_block.index() as usize].get_by_val[site]
                    .counters
                    .misses += 1;
                self.get(base, name)
            }
            _ => {
                let site = CacheSite {
                    code_block,
                    index: site,
                    by_val: true,
                };
                self.get_with_cache(site, base, name)
            }
        }
    }

    /// `base[key] = value` through put-by-val site `site` of `code_block`.
    pub fn put_by_val_cached(
        &mut self,
        code_block: CodeBlockId,
        site: usize,
        base: Value,
        key: Value,
        value: Value,
    ) -> Result<(), Exception> {
        let name = self.key_to_identifier(key);
        let kind = self.by_val_key(base, key, name);
        let strict = self.code_blocks[code_block.index() as usize].strict;
        let cache = &mut self.code_blocks[code_block.index() as usize].put_by_val[site];
        if !cache.observe(kind) {
            cache.counters.slow_path += 1;
            return self.put(base, name, value, strict).map(|_| ());
        }
        match kind {
            ByValKey::ArgumentsIndex => {
                if let Some((cell, index)) = self.arguments_index(base, key)
                    && self.arguments_put_index(cell, index, value)
                {
                    self.code_blocks[code_block.index() as usize].put_by_val[site]
                        .counters
                        .hits += 1;
                    return Ok(());
                }
                self.code_blocks[code_block.index() as usize].put_by_val[site]
                    .counters
                    .misses += 1;
                self.put(base, name, value, strict).map(|_| ())
            }
            _ => {
                let site = CacheSite {
                    code_block,
                    index: site,
                    by_val: true,
                };
                self.put_with_cache(site, base, name, value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CodeBlockBuilder, GetByIdState, PutByIdState, VMSettings};

    fn vm() -> VM {
        VM::new(VMSettings::default()).unwrap()
    }

    /// A code block with one site of every property kind.
    fn sites(vm: &mut VM) -> CodeBlockId {
        let mut builder = CodeBlockBuilder::function("sites", 0);
        let r = builder.local();
        builder.get_by_id(r, r, "x");
        builder.put_by_id(r, "x", r);
        builder.get_by_val(r, r, r);
        builder.put_by_val(r, r, r);
        builder.ret(r);
        vm.link_code_block(&builder.finish()).unwrap()
    }

    fn object_with(vm: &mut VM, props: &[(&str, i64)]) -> CellId {
        let object = vm.new_plain_object();
        for &(name, value) in props {
            let name = vm.identifiers.add(name);
            vm.put(Value::from_cell(object), name, Value::from_i64(value), true)
                .unwrap();
        }
        object
    }

    #[test]
    fn same_shape_objects_share_a_monomorphic_entry() {
        let mut vm = vm();
        let cb = sites(&mut vm);
        let x = vm.identifiers.add("x");
        let a = object_with(&mut vm, &[("x", 1)]);
        let b = object_with(&mut vm, &[("x", 2)]);

        assert_eq!(vm.get_by_id_cached(cb, 0, a.into(), x).unwrap(), Value::from_i64(1));
        assert_eq!(vm.get_by_id_cached(cb, 0, b.into(), x).unwrap(), Value::from_i64(2));
        let cache = &vm.code_block(cb).get_by_id[0];
        assert!(matches!(cache.state(), GetByIdState::Monomorphic(GetByIdAccess::Own { .. })));
        assert_eq!(cache.counters.hits, 1);
        assert_eq!(cache.counters.slow_path, 1);
    }

    #[test]
    fn proto_hits_observe_prototype_writes() {
        let mut vm = vm();
        let cb = sites(&mut vm);
        let x = vm.identifiers.add("x");
        let proto = object_with(&mut vm, &[("x", 1)]);
        let child = vm.new_object(proto.into());

        assert_eq!(vm.get_by_id_cached(cb, 0, child.into(), x).unwrap(), Value::from_i64(1));
        vm.put(proto.into(), x, Value::from_i64(7), true).unwrap();
        assert_eq!(vm.get_by_id_cached(cb, 0, child.into(), x).unwrap(), Value::from_i64(7));
        assert_eq!(vm.code_block(cb).get_by_id[0].counters.hits, 1);

        // Shadowing changes the receiver's structure, so the proto entry
        // no longer applies.
        vm.put(child.into(), x, Value::from_i64(3), true).unwrap();
        assert_eq!(vm.get_by_id_cached(cb, 0, child.into(), x).unwrap(), Value::from_i64(3));
    }

    #[test]
    fn dictionary_prototypes_are_flattened_in_insertion_order() {
        let mut vm = vm();
        let cb = sites(&mut vm);
        let (a, x) = (vm.identifiers.add("a"), vm.identifiers.add("x"));
        let proto = object_with(&mut vm, &[("a", 1), ("b", 2), ("x", 3)]);
        vm.delete_property(proto, a, true).unwrap();
        let structure = vm.heap.object(proto).unwrap().structure();
        assert!(vm.structures[structure].is_uncacheable_dictionary());

        // Uncacheable dictionaries in the chain make the site generic.
        let child = vm.new_object(proto.into());
        assert_eq!(vm.get_by_id_cached(cb, 0, child.into(), x).unwrap(), Value::from_i64(3));
        assert!(vm.code_block(cb).get_by_id[0].is_generic());

        // A cached dictionary is flattened instead.
        let proto2 = object_with(&mut vm, &[("b", 2), ("x", 3)]);
        let s = vm.heap.object(proto2).unwrap().structure();
        let dict = vm.structures.to_dictionary(s, crate::DictionaryKind::Cached);
        vm.heap.object_mut(proto2).unwrap().set_structure(dict);
        let child2 = vm.new_object(proto2.into());
        let chain = vm.normalize_prototype_chain(vm.heap.object(child2).unwrap().structure());
        assert!(chain.is_some());
        assert!(!vm.structures[dict].is_dictionary());
        let names: Vec<_> = vm
            .own_property_names(proto2)
            .into_iter()
            .map(|n| vm.identifiers.name(n).to_string())
            .collect();
        assert_eq!(names, ["b", "x"]);
        assert_eq!(vm.get(child2.into(), x).unwrap(), Value::from_i64(3));
    }

    #[test]
    fn put_caches_transitions_and_replacements() {
        let mut vm = vm();
        let cb = sites(&mut vm);
        let x = vm.identifiers.add("x");
        let first = vm.new_plain_object();
        let second = vm.new_plain_object();

        vm.put_by_id_cached(cb, 0, first.into(), x, Value::from_i64(1)).unwrap();
        assert!(matches!(
            vm.code_block(cb).put_by_id[0].state(),
            PutByIdState::Monomorphic(PutByIdAccess::Transition { .. })
        ));
        vm.put_by_id_cached(cb, 0, second.into(), x, Value::from_i64(2)).unwrap();
        assert_eq!(vm.code_block(cb).put_by_id[0].counters.hits, 1);
        assert_eq!(vm.get(second.into(), x).unwrap(), Value::from_i64(2));
        assert_eq!(
            vm.heap.object(first).unwrap().structure(),
            vm.heap.object(second).unwrap().structure()
        );
    }

    #[test]
    fn read_only_writes_throw_only_in_strict_code() {
        let mut vm = vm();
        let x = vm.identifiers.add("x");
        let object = object_with(&mut vm, &[("x", 1)]);
        vm.freeze(object);
        assert_eq!(
            vm.put(object.into(), x, Value::from_i64(2), false).unwrap(),
            PutOutcome::Ignored
        );
        let err = vm.put(object.into(), x, Value::from_i64(2), true).unwrap_err();
        assert_eq!(vm.error_type(err.value), Some(ErrorType::TypeError));
        let y = vm.identifiers.add("y");
        assert!(vm.put(object.into(), y, Value::from_i64(2), true).is_err());
        assert_eq!(vm.get(object.into(), x).unwrap(), Value::from_i64(1));
    }

    #[test]
    fn reading_from_undefined_is_a_type_error() {
        let mut vm = vm();
        let x = vm.identifiers.add("x");
        let err = vm.get(Value::UNDEFINED, x).unwrap_err();
        assert_eq!(vm.error_type(err.value), Some(ErrorType::TypeError));
    }

    #[test]
    fn arguments_objects_are_never_cached_by_id() {
        let mut vm = vm();
        let cb = sites(&mut vm);
        let frame = {
            let start = vm.register_file.end();
            vm.register_file.grow(start + 3).unwrap();
            vm.register_file.set(start + 1, Value::from_i64(10));
            vm.register_file.set(start + 2, Value::from_i64(20));
            let scope = vm.global_scope;
            vm.register_file
                .push_frame(&crate::FrameRequest {
                    caller: None,
                    entered_from_host: true,
                    arguments_start: start,
                    argument_count: 2,
                    parameter_count: 2,
                    num_registers: 1,
                    code_block: None,
                    scope: Some(scope),
                    callee: Value::UNDEFINED,
                    return_pc: 0,
                })
                .unwrap()
        };
        let arguments = vm.create_arguments(frame);
        let length = vm.names.length;
        assert_eq!(vm.get_by_id_cached(cb, 0, arguments.into(), length).unwrap(), Value::from_i64(2));
        assert!(vm.code_block(cb).get_by_id[0].is_generic());

        let got = vm.get_by_val_cached(cb, 0, arguments.into(), Value::from_i64(1)).unwrap();
        assert_eq!(got, Value::from_i64(20));
        assert_eq!(vm.code_block(cb).get_by_val[0].counters.hits, 1);
        vm.put_by_val_cached(cb, 0, arguments.into(), Value::from_i64(0), Value::TRUE).unwrap();
        assert_eq!(frame.argument(&vm.register_file, 0), Value::TRUE);
    }

    #[test]
    fn delete_then_lookup_misses() {
        let mut vm = vm();
        let (x, y) = (vm.identifiers.add("x"), vm.identifiers.add("y"));
        let object = object_with(&mut vm, &[("x", 1), ("y", 2)]);
        assert!(vm.delete_property(object, x, true).unwrap());
        assert_eq!(vm.get(object.into(), x).unwrap(), Value::UNDEFINED);
        assert_eq!(vm.get(object.into(), y).unwrap(), Value::from_i64(2));
        assert_eq!(vm.own_property_names(object), vec![y]);
    }
}
