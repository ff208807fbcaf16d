//! Free-variable resolution.
//!
//! The first execution of a resolve site walks the scope chain and records
//! the path it took as a list of [`ResolveOperation`]s. Later executions
//! replay the list; every step re-checks what it assumed, and a failed check
//! throws the list away and walks the chain once more.

use std::rc::Rc;

use crate::{
    Activation, CallFrame, Cell, CellId, CodeBlockId, ErrorType, Exception, Identifier,
    LookupResult, PropertyAttributes, PropertyOffset, Register, Scope, ScopeKind, StructureId,
    SymbolTable, Value, VM, WatchpointState,
};

/// One step of a cached resolution.
#[derive(Debug, Clone)]
pub enum ResolveOperation {
    /// Never cache; always walk the chain.
    Fail,
    SetBaseToUndefined,
    ReturnGlobalObjectAsBase,
    SetBaseToGlobal,
    SetBaseToScope,
    ReturnScopeAsBase,
    /// Skip the function's own activation if it has been created.
    SkipTopScopeNode { activation_register: Register },
    SkipScopes(u32),
    GetAndReturnScopedVar {
        index: i32,
        symbol_table: Rc<SymbolTable>,
    },
    GetAndReturnGlobalVar { index: usize },
    /// Global variable written exactly once; the value is folded in for as
    /// long as its watchpoint holds.
    GetAndReturnGlobalVarWatchable {
        index: usize,
        name: Identifier,
        value: Value,
    },
    GetAndReturnGlobalProperty {
        structure: StructureId,
        offset: PropertyOffset,
    },
    /// Some skipped activation may gain bindings through `eval`.
    CheckForDynamicEntriesBeforeGlobalScope,
}

/// Cached recipe of one resolve site. An empty list means "not computed".
#[derive(Debug, Default)]
pub struct ResolveCache {
    pub operations: Vec<ResolveOperation>,
    pub recomputations: u32,
    pub hits: u64,
    pub slow_path: u64,
}

impl ResolveCache {
    #[inline]
    pub fn is_computed(&self) -> bool {
        !self.operations.is_empty()
    }

    pub fn is_generic(&self) -> bool {
        matches!(self.operations.first(), Some(ResolveOperation::Fail))
    }

    pub fn trace(&self, visitor: &mut dyn FnMut(Value)) {
        for operation in &self.operations {
            if let ResolveOperation::GetAndReturnGlobalVarWatchable { value, .. } = operation {
                visitor(*value);
            }
        }
    }
}

/// Cached store strategy of a put-to-base site.
#[derive(Debug, Clone, Default)]
pub enum PutToBaseOperation {
    #[default]
    Uninitialised,
    Generic,
    /// The binding rejects writes.
    Readonly,
    GlobalVariablePut { index: usize },
    /// Store that must also fire the variable's watchpoint.
    GlobalVariablePutChecked { index: usize, name: Identifier },
    GlobalPropertyPut {
        structure: StructureId,
        offset: PropertyOffset,
    },
    VariablePut {
        index: i32,
        symbol_table: Rc<SymbolTable>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// The value of the binding.
    Get,
    /// The object or scope a store to the binding goes to.
    Base,
    /// Value plus the binding's container.
    WithBase,
    /// Value plus the `this` a call through the binding receives.
    WithThis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub base: Value,
    pub value: Value,
}

enum Replay {
    Hit(Resolved),
    Miss,
    Generic,
}

fn path_operations(skipped: u32, check_dynamic: bool) -> Vec<ResolveOperation> {
    let mut operations = Vec::new();
    if skipped > 0 {
        operations.push(ResolveOperation::SkipScopes(skipped));
    }
    if check_dynamic {
        operations.push(ResolveOperation::CheckForDynamicEntriesBeforeGlobalScope);
    }
    operations
}

impl VM {
    // ── Scope chain ────────────────────────────────────────────────

    /// Innermost scope of `frame`.
    pub fn frame_scope(&self, frame: CallFrame) -> CellId {
        frame.scope(&self.register_file).unwrap_or(self.global_scope)
    }

    fn push_scope(&mut self, frame: CallFrame, kind: ScopeKind) -> CellId {
        let next = self.frame_scope(frame);
        let scope = self.heap.allocate(Cell::Scope(Scope::new(Some(next), kind)));
        frame.set_scope(&mut self.register_file, scope);
        scope
    }

    /// Materialise the activation of `frame` and make it the innermost
    /// scope.
    pub fn create_activation(&mut self, frame: CallFrame) -> Option<CellId> {
        let code_block = frame.code_block(&self.register_file)?;
        let code_block = &self.code_blocks[code_block.index() as usize];
        let register = code_block.activation_register?;
        if let Some(existing) = frame.r(&self.register_file, register).as_cell() {
            return Some(existing);
        }
        let activation = Activation::new(
            code_block.symbol_table.clone(),
            frame.base(),
            frame.arguments_start(&self.register_file),
        );
        let scope = self.push_scope(frame, ScopeKind::Activation(activation));
        frame.set_r(&mut self.register_file, register, Value::from_cell(scope));
        log::trace!("created activation {scope:?} for frame {}", frame.base());
        Some(scope)
    }

    /// Copy an activation's bindings out of its frame. Idempotent.
    pub fn tear_off_activation(&mut self, scope: CellId) -> bool {
        let torn = self
            .heap
            .scope_mut(scope)
            .and_then(Scope::as_activation_mut)
            .is_some_and(|activation| activation.tear_off(&self.register_file));
        if torn {
            self.stats.activation_tear_offs += 1;
            log::trace!("tore off activation {scope:?}");
        }
        torn
    }

    pub fn push_with_scope(&mut self, frame: CallFrame, object: Value) -> Result<CellId, Exception> {
        let Some(object) = object.as_cell().filter(|&cell| self.heap.object(cell).is_some()) else {
            let message = format!("{} is not an object", self.display_value(object));
            return Err(self.throw_error(ErrorType::TypeError, &message));
        };
        Ok(self.push_scope(frame, ScopeKind::With { object }))
    }

    pub fn push_name_scope(
        &mut self,
        frame: CallFrame,
        name: Identifier,
        value: Value,
        attributes: PropertyAttributes,
    ) -> CellId {
        self.push_scope(frame, ScopeKind::Name { name, value, attributes })
    }

    pub fn pop_scope(&mut self, frame: CallFrame) {
        let scope = self.frame_scope(frame);
        if let Some(next) = self.heap.scope(scope).and_then(|s| s.next) {
            frame.set_scope(&mut self.register_file, next);
        }
    }

    /// Whether skipping `scope` while looking for `name` would be wrong.
    fn scope_binds(&self, scope: &Scope, name: Identifier) -> bool {
        match &scope.kind {
            ScopeKind::Global { .. } | ScopeKind::With { .. } => true,
            ScopeKind::Name { name: bound, .. } => *bound == name,
            ScopeKind::Activation(activation) => {
                activation.symbol_table.contains(name) || activation.get_dynamic(name).is_some()
            }
        }
    }

    fn scope_is_global(&self, scope: CellId) -> bool {
        self.heap.scope(scope).is_some_and(Scope::is_global)
    }

    // ── Replay ─────────────────────────────────────────────────────

    fn replay_resolve(&self, frame: CallFrame, operations: &[ResolveOperation], name: Identifier) -> Replay {
        let top = self.frame_scope(frame);
        let mut scope = top;
        let mut base = Value::UNDEFINED;
        for operation in operations {
            match operation {
                ResolveOperation::Fail => return Replay::Generic,
                ResolveOperation::SkipTopScopeNode { activation_register } => {
                    if let Some(activation) = frame.r(&self.register_file, *activation_register).as_cell() {
                        if scope != activation {
                            return Replay::Miss;
                        }
                        match self.heap.scope(scope).and_then(|s| s.next) {
                            Some(next) => scope = next,
                            None => return Replay::Miss,
                        }
                    }
                }
                ResolveOperation::SkipScopes(count) => {
                    for _ in 0..*count {
                        let Some(node) = self.heap.scope(scope) else {
                            return Replay::Miss;
                        };
                        if self.scope_binds(node, name) {
                            return Replay::Miss;
                        }
                        match node.next {
                            Some(next) => scope = next,
                            None => return Replay::Miss,
                        }
                    }
                }
                ResolveOperation::CheckForDynamicEntriesBeforeGlobalScope => {
                    let mut cursor = top;
                    while cursor != scope {
                        let Some(node) = self.heap.scope(cursor) else {
                            return Replay::Miss;
                        };
                        if node.as_activation().is_some_and(|a| a.get_dynamic(name).is_some()) {
                            return Replay::Miss;
                        }
                        match node.next {
                            Some(next) => cursor = next,
                            None => return Replay::Miss,
                        }
                    }
                }
                ResolveOperation::SetBaseToUndefined => base = Value::UNDEFINED,
                ResolveOperation::SetBaseToGlobal => base = Value::from_cell(self.global_object),
                ResolveOperation::SetBaseToScope => base = Value::from_cell(scope),
                ResolveOperation::ReturnGlobalObjectAsBase => {
                    if !self.scope_is_global(scope) {
                        return Replay::Miss;
                    }
                    return Replay::Hit(Resolved {
                        base: Value::from_cell(self.global_object),
                        value: Value::UNDEFINED,
                    });
                }
                ResolveOperation::ReturnScopeAsBase => {
                    let binds = self
                        .heap
                        .scope(scope)
                        .and_then(Scope::as_activation)
                        .is_some_and(|a| a.symbol_table.contains(name));
                    if !binds {
                        return Replay::Miss;
                    }
                    return Replay::Hit(Resolved {
                        base: Value::from_cell(scope),
                        value: Value::UNDEFINED,
                    });
                }
                ResolveOperation::GetAndReturnScopedVar { index, symbol_table } => {
                    let Some(activation) = self.heap.scope(scope).and_then(Scope::as_activation) else {
                        return Replay::Miss;
                    };
                    if !Rc::ptr_eq(&activation.symbol_table, symbol_table) {
                        return Replay::Miss;
                    }
                    let value = activation.register(*index, &self.register_file);
                    return Replay::Hit(Resolved { base, value });
                }
                ResolveOperation::GetAndReturnGlobalVar { index } => {
                    if !self.scope_is_global(scope) {
                        return Replay::Miss;
                    }
                    let Some(&value) = self.global_data().variables.get(*index) else {
                        return Replay::Miss;
                    };
                    return Replay::Hit(Resolved { base, value });
                }
                ResolveOperation::GetAndReturnGlobalVarWatchable { index, name, value } => {
                    let valid = self.scope_is_global(scope)
                        && self
                            .global_data()
                            .symbol_table
                            .get(*name)
                            .is_some_and(|e| e.index as usize == *index && e.watchpoint.is_still_valid());
                    if !valid {
                        return Replay::Miss;
                    }
                    return Replay::Hit(Resolved { base, value: *value });
                }
                ResolveOperation::GetAndReturnGlobalProperty { structure, offset } => {
                    if !self.scope_is_global(scope) {
                        return Replay::Miss;
                    }
                    let Some(global) = self.heap.object(self.global_object) else {
                        return Replay::Miss;
                    };
                    if global.structure() != *structure {
                        return Replay::Miss;
                    }
                    return Replay::Hit(Resolved {
                        base,
                        value: global.get_direct(*offset),
                    });
                }
            }
        }
        Replay::Miss
    }

    // ── Full walk ──────────────────────────────────────────────────

    /// Walk the scope chain of `frame` for `name`. Returns the result and
    /// the recipe to cache, which is empty when nothing should be cached.
    fn resolve_uncached(
        &mut self,
        frame: CallFrame,
        code_block: CodeBlockId,
        name: Identifier,
        mode: ResolveMode,
    ) -> Result<(Resolved, Vec<ResolveOperation>), Exception> {
        let (strict, activation_register) = {
            let code_block = &self.code_blocks[code_block.index() as usize];
            (code_block.strict, code_block.activation_register)
        };
        let mut scope = self.frame_scope(frame);
        let mut leading = Vec::new();
        let mut top_activation = None;
        if let Some(register) = activation_register {
            let activation = frame.r(&self.register_file, register).as_cell();
            if activation.is_none() || activation == Some(scope) {
                leading.push(ResolveOperation::SkipTopScopeNode {
                    activation_register: register,
                });
                top_activation = activation;
            }
        }

        let mut cacheable = true;
        let mut check_dynamic = false;
        let mut skipped = 0;
        loop {
            let Some(node) = self.heap.scope(scope) else {
                break;
            };
            match &node.kind {
                ScopeKind::Global { .. } => {
                    let mut operations = leading;
                    operations.extend(path_operations(skipped, check_dynamic));
                    return self.resolve_in_global(name, mode, strict, operations, cacheable);
                }
                ScopeKind::Activation(activation) => {
                    if let Some(entry) = activation.symbol_table.get(name) {
                        let index = entry.index;
                        let symbol_table = activation.symbol_table.clone();
                        let value = activation.register(index, &self.register_file);
                        let mut operations = if top_activation == Some(scope) {
                            Vec::new()
                        } else {
                            leading
                        };
                        operations.extend(path_operations(skipped, check_dynamic));
                        let scope_value = Value::from_cell(scope);
                        let (resolved, tail) = match mode {
                            ResolveMode::Get => (
                                Resolved { base: Value::UNDEFINED, value },
                                vec![ResolveOperation::GetAndReturnScopedVar { index, symbol_table }],
                            ),
                            ResolveMode::Base => (
                                Resolved { base: scope_value, value: Value::UNDEFINED },
                                vec![ResolveOperation::ReturnScopeAsBase],
                            ),
                            ResolveMode::WithBase => (
                                Resolved { base: scope_value, value },
                                vec![
                                    ResolveOperation::SetBaseToScope,
                                    ResolveOperation::GetAndReturnScopedVar { index, symbol_table },
                                ],
                            ),
                            ResolveMode::WithThis => (
                                Resolved { base: Value::UNDEFINED, value },
                                vec![
                                    ResolveOperation::SetBaseToUndefined,
                                    ResolveOperation::GetAndReturnScopedVar { index, symbol_table },
                                ],
                            ),
                        };
                        operations.extend(tail);
                        if !cacheable {
                            operations = vec![ResolveOperation::Fail];
                        }
                        return Ok((resolved, operations));
                    }
                    if let Some(value) = activation.get_dynamic(name) {
                        let base = match mode {
                            ResolveMode::Base | ResolveMode::WithBase => Value::from_cell(scope),
                            _ => Value::UNDEFINED,
                        };
                        return Ok((Resolved { base, value }, vec![ResolveOperation::Fail]));
                    }
                    check_dynamic |= activation.symbol_table.uses_non_strict_eval;
                }
                ScopeKind::With { object } => {
                    let object = *object;
                    if self.has_property(object, name) {
                        let value = match mode {
                            ResolveMode::Base => Value::UNDEFINED,
                            _ => self.get(Value::from_cell(object), name)?,
                        };
                        let resolved = Resolved {
                            base: Value::from_cell(object),
                            value,
                        };
                        return Ok((resolved, vec![ResolveOperation::Fail]));
                    }
                    cacheable = false;
                }
                ScopeKind::Name { name: bound, value, .. } => {
                    if *bound == name {
                        let base = match mode {
                            ResolveMode::Base | ResolveMode::WithBase => Value::from_cell(scope),
                            _ => Value::UNDEFINED,
                        };
                        return Ok((Resolved { base, value: *value }, vec![ResolveOperation::Fail]));
                    }
                }
            }
            if top_activation != Some(scope) {
                skipped += 1;
            }
            match node.next {
                Some(next) => scope = next,
                None => break,
            }
        }
        self.unresolvable(name, mode, strict)
    }

    fn resolve_in_global(
        &mut self,
        name: Identifier,
        mode: ResolveMode,
        strict: bool,
        mut operations: Vec<ResolveOperation>,
        cacheable: bool,
    ) -> Result<(Resolved, Vec<ResolveOperation>), Exception> {
        let global = self.global_object;
        let global_value = Value::from_cell(global);
        let lookup = self.lookup_property(global, name);
        if lookup == LookupResult::NotFound {
            return self.unresolvable(name, mode, strict);
        }
        let (base, base_operation) = match mode {
            ResolveMode::Get => (Value::UNDEFINED, None),
            ResolveMode::Base => {
                operations.push(ResolveOperation::ReturnGlobalObjectAsBase);
                if !cacheable {
                    operations = vec![ResolveOperation::Fail];
                }
                let resolved = Resolved {
                    base: global_value,
                    value: Value::UNDEFINED,
                };
                return Ok((resolved, operations));
            }
            ResolveMode::WithBase => (global_value, Some(ResolveOperation::SetBaseToGlobal)),
            ResolveMode::WithThis => (Value::UNDEFINED, Some(ResolveOperation::SetBaseToUndefined)),
        };

        let (value, read) = match lookup {
            LookupResult::Intercepted(value) => {
                let read = self.global_data().symbol_table.get(name).map(|entry| {
                    let index = entry.index as usize;
                    if entry.watchpoint.state() == WatchpointState::IsWatched {
                        ResolveOperation::GetAndReturnGlobalVarWatchable { index, name, value }
                    } else {
                        ResolveOperation::GetAndReturnGlobalVar { index }
                    }
                });
                (value, read)
            }
            LookupResult::Found(slot) => {
                let direct = slot.depth == 0
                    && !slot.attributes.contains(PropertyAttributes::ACCESSOR)
                    && !self.structures[slot.structure].is_dictionary();
                let value = self.slot_value(global_value, slot)?;
                let read = direct.then_some(ResolveOperation::GetAndReturnGlobalProperty {
                    structure: slot.structure,
                    offset: slot.offset,
                });
                (value, read)
            }
            LookupResult::NotFound => (Value::UNDEFINED, None),
        };

        let operations = match read {
            Some(read) if cacheable => {
                operations.extend(base_operation);
                operations.push(read);
                operations
            }
            _ => vec![ResolveOperation::Fail],
        };
        Ok((Resolved { base, value }, operations))
    }

    fn unresolvable(
        &mut self,
        name: Identifier,
        mode: ResolveMode,
        strict: bool,
    ) -> Result<(Resolved, Vec<ResolveOperation>), Exception> {
        if mode == ResolveMode::Base {
            let base = if strict {
                Value::UNDEFINED
            } else {
                Value::from_cell(self.global_object)
            };
            return Ok((Resolved { base, value: Value::UNDEFINED }, Vec::new()));
        }
        let message = format!("{} is not defined", self.identifiers.name(name));
        Err(self.throw_error(ErrorType::ReferenceError, &message))
    }

    /// Resolve `name` from `frame` through resolve site `site`.
    pub fn resolve_cached(
        &mut self,
        frame: CallFrame,
        code_block: CodeBlockId,
        site: usize,
        name: Identifier,
        mode: ResolveMode,
    ) -> Result<Resolved, Exception> {
        let index = code_block.index() as usize;
        let operations = std::mem::take(&mut self.code_blocks[index].resolve[site].operations);
        let replay = (!operations.is_empty()).then(|| self.replay_resolve(frame, &operations, name));
        self.code_blocks[index].resolve[site].operations = operations;

        match replay {
            Some(Replay::Hit(resolved)) => {
                self.code_blocks[index].resolve[site].hits += 1;
                return Ok(resolved);
            }
            Some(Replay::Generic) => {
                self.code_blocks[index].resolve[site].slow_path += 1;
                return self
                    .resolve_uncached(frame, code_block, name, mode)
                    .map(|(resolved, _)| resolved);
            }
            Some(Replay::Miss) => {
                self.code_blocks[index].resolve[site].recomputations += 1;
                self.stats.resolve_recomputations += 1;
                log::debug!(
                    "resolve site {site} of code block {index}: `{}` recomputed",
                    self.identifiers.name(name)
                );
            }
            None => {}
        }

        self.code_blocks[index].resolve[site].slow_path += 1;
        let (resolved, operations) = self.resolve_uncached(frame, code_block, name, mode)?;
        self.code_blocks[index].resolve[site].operations = operations;
        Ok(resolved)
    }

    // ── Put to base ────────────────────────────────────────────────

    fn reject_binding_write(&mut self, name: Identifier, strict: bool) -> Result<(), Exception> {
        if strict {
            let message = format!("cannot assign to read-only binding '{}'", self.identifiers.name(name));
            return Err(self.throw_error(ErrorType::TypeError, &message));
        }
        Ok(())
    }

    /// Store `value` to `name` on a base produced by a `Base` resolve.
    pub fn put_to_base(&mut self, base: Value, name: Identifier, value: Value, strict: bool) -> Result<(), Exception> {
        if base.is_undefined() {
            if strict {
                let message = format!("{} is not defined", self.identifiers.name(name));
                return Err(self.throw_error(ErrorType::ReferenceError, &message));
            }
            let global = Value::from_cell(self.global_object);
            return self.put(global, name, value, strict).map(drop);
        }
        let Some(cell) = base.as_cell() else {
            return self.put(base, name, value, strict).map(drop);
        };
        let Some(scope) = self.heap.scope(cell) else {
            return self.put(base, name, value, strict).map(drop);
        };
        match &scope.kind {
            ScopeKind::Activation(activation) => {
                let binding = activation.symbol_table.get(name).map(|e| (e.index, e.is_read_only()));
                match binding {
                    Some((_, true)) => return self.reject_binding_write(name, strict),
                    Some((index, false)) => {
                        if let Some(activation) = self.heap.scope_mut(cell).and_then(Scope::as_activation_mut) {
                            activation.set_register(index, value, &mut self.register_file);
                        }
                    }
                    None => {
                        if let Some(activation) = self.heap.scope_mut(cell).and_then(Scope::as_activation_mut) {
                            activation.put_dynamic(name, value);
                        }
                    }
                }
                self.heap.write_barrier(cell, value);
                Ok(())
            }
            ScopeKind::Name { attributes, .. } => {
                if attributes.contains(PropertyAttributes::READ_ONLY) {
                    return self.reject_binding_write(name, strict);
                }
                if let Some(Scope {
                    kind: ScopeKind::Name { value: slot, .. },
                    ..
                }) = self.heap.scope_mut(cell)
                {
                    *slot = value;
                }
                self.heap.write_barrier(cell, value);
                Ok(())
            }
            ScopeKind::Global { object } | ScopeKind::With { object } => {
                let object = Value::from_cell(*object);
                self.put(object, name, value, strict).map(drop)
            }
        }
    }

    fn plan_put_to_base(&self, base: Value, name: Identifier) -> PutToBaseOperation {
        let Some(cell) = base.as_cell() else {
            return PutToBaseOperation::Generic;
        };
        if cell == self.global_object {
            if let Some(entry) = self.global_data().symbol_table.get(name) {
                let index = entry.index as usize;
                return if entry.is_read_only() {
                    PutToBaseOperation::Readonly
                } else if entry.watchpoint.state() == WatchpointState::IsInvalidated {
                    PutToBaseOperation::GlobalVariablePut { index }
                } else {
                    PutToBaseOperation::GlobalVariablePutChecked { index, name }
                };
            }
            let Some(structure) = self.heap.object(cell).map(|o| o.structure()) else {
                return PutToBaseOperation::Generic;
            };
            return match self.structures.find_property(structure, name) {
                Some(entry) if entry.attributes.contains(PropertyAttributes::READ_ONLY) => {
                    PutToBaseOperation::Readonly
                }
                Some(entry)
                    if !entry.attributes.contains(PropertyAttributes::ACCESSOR)
                        && entry.specific_value.is_none()
                        && !self.structures[structure].is_dictionary() =>
                {
                    PutToBaseOperation::GlobalPropertyPut {
                        structure,
                        offset: entry.offset,
                    }
                }
                _ => PutToBaseOperation::Generic,
            };
        }
        let activation = self.heap.scope(cell).and_then(Scope::as_activation);
        match activation.and_then(|a| a.symbol_table.get(name).map(|e| (a, *e))) {
            Some((_, entry)) if entry.is_read_only() => PutToBaseOperation::Readonly,
            Some((activation, entry)) => PutToBaseOperation::VariablePut {
                index: entry.index,
                symbol_table: activation.symbol_table.clone(),
            },
            None => PutToBaseOperation::Generic,
        }
    }

    /// [`put_to_base`](Self::put_to_base) through put-to-base site `site`.
    pub fn put_to_base_cached(
        &mut self,
        code_block: CodeBlockId,
        site: usize,
        base: Value,
        name: Identifier,
        value: Value,
    ) -> Result<(), Exception> {
        let index = code_block.index() as usize;
        let strict = self.code_blocks[index].strict;
        let global = self.global_object;
        let on_global = base.as_cell() == Some(global);
        match self.code_blocks[index].put_to_base[site].clone() {
            PutToBaseOperation::Uninitialised => {}
            PutToBaseOperation::Generic | PutToBaseOperation::Readonly => {
                return self.put_to_base(base, name, value, strict);
            }
            PutToBaseOperation::GlobalVariablePut { index: slot } if on_global => {
                if let Some(variable) = self.global_data_mut().variables.get_mut(slot) {
                    *variable = value;
                }
                self.heap.write_barrier(global, value);
                return Ok(());
            }
            PutToBaseOperation::GlobalVariablePutChecked { index: slot, name: watched } if on_global => {
                self.set_global_variable(watched, slot, value);
                return Ok(());
            }
            PutToBaseOperation::GlobalPropertyPut { structure, offset } if on_global => {
                if let Some(object) = self.heap.object_mut(global)
                    && object.structure() == structure
                {
                    object.put_direct(offset, value);
                    self.heap.write_barrier(global, value);
                    return Ok(());
                }
            }
            PutToBaseOperation::VariablePut { index: binding, symbol_table } => {
                if let Some(cell) = base.as_cell()
                    && let Some(activation) = self.heap.scope_mut(cell).and_then(Scope::as_activation_mut)
                    && Rc::ptr_eq(&activation.symbol_table, &symbol_table)
                {
                    activation.set_register(binding, value, &mut self.register_file);
                    self.heap.write_barrier(cell, value);
                    return Ok(());
                }
            }
            _ => {}
        }

        self.put_to_base(base, name, value, strict)?;
        let operation = self.plan_put_to_base(base, name);
        log::trace!("put_to_base site {site} of code block {index}: {operation:?}");
        self.code_blocks[index].put_to_base[site] = operation;
        Ok(())
    }
}
