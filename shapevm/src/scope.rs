//! Scope chain nodes.
//!
//! A scope is a heap cell with a `next` link towards the global scope. The
//! link is a plain traversal edge; lifetime is decided by reachability.

use std::rc::Rc;

use ahash::AHashMap;

use crate::{
    CellId, Identifier, PropertyAttributes, RegisterFile, Value, WatchpointSet,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTableEntry {
    /// Register of the binding: `>= 0` is a local, `-(p + 1)` is parameter
    /// slot `p` where slot 0 is `this`. Global variables index the global
    /// object's variable vector.
    pub index: i32,
    pub attributes: PropertyAttributes,
    pub watchpoint: WatchpointSet,
}

impl SymbolTableEntry {
    pub fn new(index: i32, attributes: PropertyAttributes) -> Self {
        Self {
            index,
            attributes,
            watchpoint: WatchpointSet::new(),
        }
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.attributes.contains(PropertyAttributes::READ_ONLY)
    }
}

/// Compile-time bindings of a function or of the global object.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    entries: AHashMap<Identifier, SymbolTableEntry>,
    order: Vec<Identifier>,
    /// Sloppy `eval` may add bindings at run time.
    pub uses_non_strict_eval: bool,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, name: Identifier) -> Option<&SymbolTableEntry> {
        self.entries.get(&name)
    }

    #[inline]
    pub fn get_mut(&mut self, name: Identifier) -> Option<&mut SymbolTableEntry> {
        self.entries.get_mut(&name)
    }

    pub fn add(&mut self, name: Identifier, entry: SymbolTableEntry) {
        if self.entries.insert(name, entry).is_none() {
            self.order.push(name);
        }
    }

    pub fn contains(&self, name: Identifier) -> bool {
        self.entries.contains_key(&name)
    }

    pub fn names(&self) -> &[Identifier] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = (Identifier, &SymbolTableEntry)> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name).map(|e| (*name, e)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest local register referenced, plus one.
    pub fn local_extent(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.index >= 0)
            .map(|e| e.index as usize + 1)
            .max()
            .unwrap_or(0)
    }

    /// Highest parameter slot referenced, plus one.
    pub fn parameter_extent(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.index < 0)
            .map(|e| (-(e.index + 1)) as usize + 1)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug)]
pub enum ActivationStorage {
    /// Bindings live in the frame's registers.
    Inline {
        frame_base: usize,
        arguments_start: usize,
    },
    /// Bindings were copied out when the frame died.
    TornOff {
        locals: Box<[Value]>,
        parameters: Box<[Value]>,
    },
}

/// Heap-observable variable object of a function call.
#[derive(Debug)]
pub struct Activation {
    pub symbol_table: Rc<SymbolTable>,
    storage: ActivationStorage,
    /// Bindings introduced by sloppy `eval`.
    dynamic: Vec<(Identifier, Value)>,
}

impl Activation {
    pub fn new(
        symbol_table: Rc<SymbolTable>,
        frame_base: usize,
        arguments_start: usize,
    ) -> Self {
        Self {
            symbol_table,
            storage: ActivationStorage::Inline {
                frame_base,
                arguments_start,
            },
            dynamic: Vec::new(),
        }
    }

    #[inline]
    pub fn is_torn_off(&self) -> bool {
        matches!(self.storage, ActivationStorage::TornOff { .. })
    }

    pub fn storage(&self) -> &ActivationStorage {
        &self.storage
    }

    /// Register-file slot backing `index` while still inline.
    pub fn inline_slot(&self, index: i32) -> Option<usize> {
        match self.storage {
            ActivationStorage::Inline {
                frame_base,
                arguments_start,
            } => Some(if index >= 0 {
                frame_base + index as usize
            } else {
                arguments_start + (-(index + 1)) as usize
            }),
            ActivationStorage::TornOff { .. } => None,
        }
    }

    pub fn register(&self, index: i32, registers: &RegisterFile) -> Value {
        match &self.storage {
            ActivationStorage::Inline { .. } => match self.inline_slot(index) {
                Some(slot) => registers.get(slot),
                None => Value::UNDEFINED,
            },
            ActivationStorage::TornOff { locals, parameters } => {
                let value = if index >= 0 {
                    locals.get(index as usize)
                } else {
                    parameters.get((-(index + 1)) as usize)
                };
                value.copied().unwrap_or(Value::UNDEFINED)
            }
        }
    }

    pub fn set_register(
        &mut self,
        index: i32,
        value: Value,
        registers: &mut RegisterFile,
    ) {
        if let Some(slot) = self.inline_slot(index) {
            registers.set(slot, value);
            return;
        }
        if let ActivationStorage::TornOff { locals, parameters } = &mut self.storage {
            let target = if index >= 0 {
                locals.get_mut(index as usize)
            } else {
                parameters.get_mut((-(index + 1)) as usize)
            };
            if let Some(target) = target {
                *target = value;
            }
        }
    }

    /// Copy the bindings out of the frame. Happens at most once.
    pub fn tear_off(&mut self, registers: &RegisterFile) -> bool {
        let ActivationStorage::Inline {
            frame_base,
            arguments_start,
        } = self.storage
        else {
            return false;
        };
        let locals: Box<[Value]> = (0..self.symbol_table.local_extent())
            .map(|i| registers.get(frame_base + i))
            .collect();
        let parameters: Box<[Value]> = (0..self.symbol_table.parameter_extent())
            .map(|p| registers.get(arguments_start + p))
            .collect();
        self.storage = ActivationStorage::TornOff { locals, parameters };
        true
    }

    pub fn dynamic_entries(&self) -> &[(Identifier, Value)] {
        &self.dynamic
    }

    pub fn has_dynamic_entries(&self) -> bool {
        !self.dynamic.is_empty()
    }

    pub fn get_dynamic(&self, name: Identifier) -> Option<Value> {
        self.dynamic
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }

    /// Declare or overwrite an eval-introduced binding.
    pub fn put_dynamic(&mut self, name: Identifier, value: Value) {
        match self.dynamic.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.dynamic.push((name, value)),
        }
    }

    fn trace(&self, visitor: &mut dyn FnMut(Value)) {
        if let ActivationStorage::TornOff { locals, parameters } = &self.storage {
            for &value in locals.iter().chain(parameters.iter()) {
                visitor(value);
            }
        }
        for &(_, value) in &self.dynamic {
            visitor(value);
        }
    }
}

#[derive(Debug)]
pub enum ScopeKind {
    Global { object: CellId },
    Activation(Activation),
    /// `with (object)`: every property of `object` is a binding.
    With { object: CellId },
    /// A single binding, used for `catch` parameters and named function
    /// expressions.
    Name {
        name: Identifier,
        value: Value,
        attributes: PropertyAttributes,
    },
}

#[derive(Debug)]
pub struct Scope {
    pub next: Option<CellId>,
    pub kind: ScopeKind,
}

impl Scope {
    pub fn new(next: Option<CellId>, kind: ScopeKind) -> Self {
        Self { next, kind }
    }

    #[inline]
    pub fn is_global(&self) -> bool {
        matches!(self.kind, ScopeKind::Global { .. })
    }

    /// Scopes whose bindings cannot be known ahead of time.
    #[inline]
    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, ScopeKind::With { .. })
    }

    /// The object answering property lookups for object-backed scopes.
    pub fn binding_object(&self) -> Option<CellId> {
        match self.kind {
            ScopeKind::Global { object } | ScopeKind::With { object } => Some(object),
            _ => None,
        }
    }

    pub fn as_activation(&self) -> Option<&Activation> {
        match &self.kind {
            ScopeKind::Activation(activation) => Some(activation),
            _ => None,
        }
    }

    pub fn as_activation_mut(&mut self) -> Option<&mut Activation> {
        match &mut self.kind {
            ScopeKind::Activation(activation) => Some(activation),
            _ => None,
        }
    }

    pub fn trace(&self, visitor: &mut dyn FnMut(Value)) {
        if let Some(next) = self.next {
            visitor(Value::from_cell(next));
        }
        match &self.kind {
            ScopeKind::Global { object } | ScopeKind::With { object } => {
                visitor(Value::from_cell(*object));
            }
            ScopeKind::Activation(activation) => activation.trace(visitor),
            ScopeKind::Name { value, .. } => visitor(*value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdentifierTable;

    fn table_with(names: &IdentifierTable) -> Rc<SymbolTable> {
        let mut table = SymbolTable::new();
        table.add(names.add("a"), SymbolTableEntry::new(-2, PropertyAttributes::DONT_DELETE));
        table.add(names.add("x"), SymbolTableEntry::new(1, PropertyAttributes::DONT_DELETE));
        Rc::new(table)
    }

    #[test]
    fn activation_reads_through_frame_until_torn_off() {
        let names = IdentifierTable::new();
        let mut registers = RegisterFile::new(64, 16);
        registers.grow(32).unwrap();
        // this at 0, a at 1, header 2..8, locals from 8.
        registers.set(1, Value::from_i64(7));
        registers.set(9, Value::from_i64(42));

        let mut activation = Activation::new(table_with(&names), 8, 0);
        assert_eq!(activation.register(-2, &registers), Value::from_i64(7));
        assert_eq!(activation.register(1, &registers), Value::from_i64(42));

        assert!(activation.tear_off(&registers));
        assert!(!activation.tear_off(&registers));
        registers.set(9, Value::from_i64(0));
        assert_eq!(activation.register(1, &registers), Value::from_i64(42));

        activation.set_register(1, Value::from_i64(5), &mut registers);
        assert_eq!(activation.register(1, &registers), Value::from_i64(5));
        assert_eq!(registers.get(9), Value::from_i64(0));
    }

    #[test]
    fn dynamic_entries_shadow_in_declaration_order() {
        let names = IdentifierTable::new();
        let mut activation = Activation::new(table_with(&names), 8, 0);
        let y = names.add("y");
        assert!(!activation.has_dynamic_entries());
        activation.put_dynamic(y, Value::from_i64(1));
        activation.put_dynamic(y, Value::from_i64(2));
        assert_eq!(activation.get_dynamic(y), Some(Value::from_i64(2)));
        assert_eq!(activation.dynamic_entries().len(), 1);
    }
}
