use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

/// An interned property or variable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(u32);

impl Identifier {
    #[inline(always)]
    pub const fn index(self) -> u32 {
        self.0
    }
}

struct IdentifierTableImpl {
    names: Vec<Arc<str>>,
    mappings: AHashMap<Arc<str>, Identifier>,
}

impl IdentifierTableImpl {
    fn new() -> Self {
        Self {
            names: Vec::new(),
            mappings: AHashMap::new(),
        }
    }

    fn get_or_add(&mut self, name: &str) -> Identifier {
        if let Some(&id) = self.mappings.get(name) {
            return id;
        }
        let id = Identifier(self.names.len() as u32);
        let interned: Arc<str> = Arc::from(name);
        self.names.push(interned.clone());
        self.mappings.insert(interned, id);
        id
    }
}

/// Interning table for identifiers.
///
/// One table belongs to each [`VM`](crate::VM); the handle is cheap to clone
/// so several contexts can deliberately share one.
#[derive(Clone)]
pub struct IdentifierTable(Arc<RwLock<IdentifierTableImpl>>);

impl IdentifierTable {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(IdentifierTableImpl::new())))
    }

    pub fn add(&self, name: &str) -> Identifier {
        if let Some(&id) = self.0.read().mappings.get(name) {
            return id;
        }
        self.0.write().get_or_add(name)
    }

    pub fn lookup(&self, name: &str) -> Option<Identifier> {
        self.0.read().mappings.get(name).copied()
    }

    pub fn name(&self, id: Identifier) -> Arc<str> {
        match self.0.read().names.get(id.0 as usize) {
            Some(name) => name.clone(),
            None => Arc::from("<unknown>"),
        }
    }

    /// Identifier for the canonical decimal spelling of `index`.
    pub fn from_index(&self, index: u32) -> Identifier {
        self.add(&index.to_string())
    }

    /// Parse an identifier that spells an array index.
    pub fn as_index(&self, id: Identifier) -> Option<u32> {
        let name = self.name(id);
        if name.len() > 1 && name.starts_with('0') {
            return None;
        }
        name.parse().ok()
    }

    pub fn len(&self) -> usize {
        self.0.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdentifierTable {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for IdentifierTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdentifierTable")
            .field("len", &self.len())
            .finish()
    }
}

/// Names the engine core needs without a table lookup.
#[derive(Debug, Clone, Copy)]
pub struct CommonIdentifiers {
    pub length: Identifier,
    pub callee: Identifier,
    pub caller: Identifier,
    pub message: Identifier,
    pub prototype: Identifier,
    pub constructor: Identifier,
    pub name: Identifier,
    pub arguments: Identifier,
}

impl CommonIdentifiers {
    pub fn new(table: &IdentifierTable) -> Self {
        Self {
            length: table.add("length"),
            callee: table.add("callee"),
            caller: table.add("caller"),
            message: table.add("message"),
            prototype: table.add("prototype"),
            constructor: table.add("constructor"),
            name: table.add("name"),
            arguments: table.add("arguments"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let table = IdentifierTable::new();
        let a = table.add("x");
        let b = table.add("y");
        assert_ne!(a, b);
        assert_eq!(table.add("x"), a);
        assert_eq!(&*table.name(b), "y");
        assert_eq!(table.lookup("z"), None);
    }

    #[test]
    fn shared_handles_see_the_same_names() {
        let table = IdentifierTable::new();
        let other = table.clone();
        let id = table.add("shared");
        assert_eq!(other.lookup("shared"), Some(id));
    }

    #[test]
    fn index_identifiers() {
        let table = IdentifierTable::new();
        let three = table.from_index(3);
        assert_eq!(table.as_index(three), Some(3));
        let padded = table.add("03");
        assert_eq!(table.as_index(padded), None);
        let word = table.add("length");
        assert_eq!(table.as_index(word), None);
    }
}
