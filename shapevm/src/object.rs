//! Object cells and their storage.

use crate::{
    ArgumentsData, CellId, ErrorType, ExecutableId, Exception, PropertyOffset,
    StructureId, SymbolTable, Value, VM,
};

/// Native function callable from scripts.
pub type HostFn = fn(&mut VM, Value, &[Value]) -> Result<Value, Exception>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetterSetter {
    pub getter: Value,
    pub setter: Value,
}

#[derive(Debug, Clone, Copy)]
pub enum FunctionData {
    Script {
        executable: ExecutableId,
        scope: CellId,
    },
    Host {
        name: crate::Identifier,
        arity: u32,
        function: HostFn,
        constructor: Option<HostFn>,
    },
}

/// Backing store of the global object's declared variables.
#[derive(Debug, Default)]
pub struct GlobalData {
    pub symbol_table: SymbolTable,
    pub variables: Vec<Value>,
}

#[derive(Debug)]
pub enum ObjectKind {
    Plain,
    Function(FunctionData),
    Global(Box<GlobalData>),
    Arguments(Box<ArgumentsData>),
    Error(ErrorType),
}

#[derive(Debug)]
pub struct JsObject {
    structure: StructureId,
    inline: Box<[Value]>,
    out_of_line: Vec<Value>,
    pub kind: ObjectKind,
}

impl JsObject {
    pub fn new(structure: StructureId, inline_capacity: u32, kind: ObjectKind) -> Self {
        Self {
            structure,
            inline: vec![Value::UNDEFINED; inline_capacity as usize].into_boxed_slice(),
            out_of_line: Vec::new(),
            kind,
        }
    }

    #[inline(always)]
    pub fn structure(&self) -> StructureId {
        self.structure
    }

    /// Callers must have applied the write barrier for anything the new
    /// structure makes reachable.
    #[inline(always)]
    pub fn set_structure(&mut self, structure: StructureId) {
        self.structure = structure;
    }

    #[inline(always)]
    pub fn inline_capacity(&self) -> u32 {
        self.inline.len() as u32
    }

    #[inline]
    pub fn get_direct(&self, offset: PropertyOffset) -> Value {
        let offset = offset as usize;
        if offset < self.inline.len() {
            self.inline[offset]
        } else {
            self.out_of_line
                .get(offset - self.inline.len())
                .copied()
                .unwrap_or(Value::UNDEFINED)
        }
    }

    #[inline]
    pub fn put_direct(&mut self, offset: PropertyOffset, value: Value) {
        let offset = offset as usize;
        if offset < self.inline.len() {
            self.inline[offset] = value;
            return;
        }
        let index = offset - self.inline.len();
        if index >= self.out_of_line.len() {
            self.out_of_line.resize(index + 1, Value::UNDEFINED);
        }
        self.out_of_line[index] = value;
    }

    /// Make room for `storage_size` slots.
    pub fn ensure_storage(&mut self, storage_size: u32) {
        let needed = (storage_size as usize).saturating_sub(self.inline.len());
        if needed > self.out_of_line.len() {
            self.out_of_line.resize(needed, Value::UNDEFINED);
        }
    }

    pub fn out_of_line_len(&self) -> usize {
        self.out_of_line.len()
    }

    /// Move slot contents after a dictionary flatten.
    pub fn apply_offset_moves(
        &mut self,
        moves: &[(PropertyOffset, PropertyOffset)],
    ) {
        let values: Vec<Value> =
            moves.iter().map(|&(from, _)| self.get_direct(from)).collect();
        for (&(_, to), value) in moves.iter().zip(values) {
            self.put_direct(to, value);
        }
        let live = moves.len().saturating_sub(self.inline.len());
        self.out_of_line.truncate(live);
        for slot in self.inline.iter_mut().skip(moves.len()) {
            *slot = Value::UNDEFINED;
        }
    }

    pub fn as_function(&self) -> Option<&FunctionData> {
        match &self.kind {
            ObjectKind::Function(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_arguments(&self) -> Option<&ArgumentsData> {
        match &self.kind {
            ObjectKind::Arguments(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_arguments_mut(&mut self) -> Option<&mut ArgumentsData> {
        match &mut self.kind {
            ObjectKind::Arguments(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_global(&self) -> Option<&GlobalData> {
        match &self.kind {
            ObjectKind::Global(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_global_mut(&mut self) -> Option<&mut GlobalData> {
        match &mut self.kind {
            ObjectKind::Global(data) => Some(data),
            _ => None,
        }
    }

    pub fn error_type(&self) -> Option<ErrorType> {
        match self.kind {
            ObjectKind::Error(ty) => Some(ty),
            _ => None,
        }
    }

    pub fn trace(&self, visitor: &mut dyn FnMut(Value)) {
        for &value in self.inline.iter().chain(self.out_of_line.iter()) {
            visitor(value);
        }
        match &self.kind {
            ObjectKind::Plain | ObjectKind::Error(_) => {}
            ObjectKind::Function(FunctionData::Script { scope, .. }) => {
                visitor(Value::from_cell(*scope));
            }
            ObjectKind::Function(FunctionData::Host { .. }) => {}
            ObjectKind::Global(global) => {
                for &value in &global.variables {
                    visitor(value);
                }
            }
            ObjectKind::Arguments(arguments) => arguments.trace(visitor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectClass, StructurePolicy, StructureTable};

    fn plain(inline_capacity: u32) -> JsObject {
        let mut structures = StructureTable::new(StructurePolicy::default());
        let s = structures.empty_structure(Value::NULL, ObjectClass::Object, inline_capacity);
        JsObject::new(s, inline_capacity, ObjectKind::Plain)
    }

    #[test]
    fn storage_spills_out_of_line() {
        let mut object = plain(2);
        object.put_direct(0, Value::from_i64(1));
        object.put_direct(4, Value::from_i64(5));
        assert_eq!(object.get_direct(0), Value::from_i64(1));
        assert_eq!(object.get_direct(4), Value::from_i64(5));
        assert_eq!(object.get_direct(3), Value::UNDEFINED);
        assert_eq!(object.out_of_line_len(), 3);
    }

    #[test]
    fn offset_moves_compact_storage() {
        let mut object = plain(1);
        object.put_direct(0, Value::from_i64(10));
        object.put_direct(1, Value::from_i64(11));
        object.put_direct(2, Value::from_i64(12));
        object.apply_offset_moves(&[(1, 0), (2, 1)]);
        assert_eq!(object.get_direct(0), Value::from_i64(11));
        assert_eq!(object.get_direct(1), Value::from_i64(12));
        assert_eq!(object.out_of_line_len(), 1);
    }
}
