//! The execution context.
//!
//! A [`VM`] owns everything one independent script context needs: heap,
//! structures, identifier table, register file, special objects and linked
//! code. Nothing lives in process-wide globals, so several VMs can coexist.

use crate::{
    CallFrame, CallLinkInfo, Cell, CellId, CodeBlock, CommonIdentifiers, Debugger,
    ErrorType, Exception, ExecutableId, FunctionData, FunctionExecutable, GlobalData, Heap,
    HostFn, Identifier, IdentifierTable, JitBackend, JsObject, ObjectClass, ObjectKind,
    PropertyAttributes, RegisterFile, RootProvider, Scope, ScopeKind, SettingsError,
    StackFrame, StructureId, StructureTable, SymbolTableEntry, VMSettings, Value, Watchdog,
};

/// Counters the engine keeps for tests and the CLI report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VMStats {
    pub resolve_recomputations: u64,
    pub frames_unwound: u64,
    pub activation_tear_offs: u64,
    pub arguments_tear_offs: u64,
    pub stack_overflows: u64,
    pub host_calls: u64,
    pub lazy_compilations: u64,
}

pub struct VM {
    pub settings: VMSettings,
    pub heap: Heap,
    pub structures: StructureTable,
    pub identifiers: IdentifierTable,
    pub names: CommonIdentifiers,
    pub(crate) executables: Vec<FunctionExecutable>,
    pub(crate) code_blocks: Vec<CodeBlock>,
    pub register_file: RegisterFile,

    pub global_object: CellId,
    pub global_scope: CellId,
    pub object_prototype: CellId,
    pub function_prototype: CellId,
    pub(crate) error_prototypes: [CellId; ErrorType::ALL.len()],
    pub arguments_structure: StructureId,

    /// Innermost live frame, `None` outside any evaluation.
    pub top_call_frame: Option<CallFrame>,
    /// Bytecode offset of the instruction running in `top_call_frame`.
    pub(crate) current_pc: usize,
    pub(crate) reentry_depth: usize,
    /// Host functions currently on the native stack. Collections wait
    /// until this drops back to zero.
    pub(crate) host_call_depth: usize,
    /// Exception delivered to the next `Catch`.
    pub(crate) pending_exception: Option<Value>,
    /// Stack captured when the last exception was thrown.
    pub last_exception_stack: Vec<StackFrame>,

    pub watchdog: Watchdog,
    pub debugger: Option<Box<dyn Debugger>>,
    pub jit: Option<Box<dyn JitBackend>>,
    pub stats: VMStats,
}

impl core::fmt::Debug for VM {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VM")
            .field("code_blocks", &self.code_blocks.len())
            .field("structures", &self.structures.len())
            .field("live_cells", &self.heap.live_cells())
            .field("stats", &self.stats)
            .finish()
    }
}

fn plain_object(
    heap: &mut Heap,
    structures: &mut StructureTable,
    prototype: Value,
    inline_capacity: u32,
) -> CellId {
    let structure = structures.empty_structure(prototype, ObjectClass::Object, inline_capacity);
    heap.allocate(Cell::Object(JsObject::new(structure, inline_capacity, ObjectKind::Plain)))
}

impl VM {
    pub fn new(settings: VMSettings) -> Result<Self, SettingsError> {
        settings.validate()?;
        let capacity = settings.inline_capacity;
        let mut heap = Heap::new(settings.gc_threshold);
        let mut structures = StructureTable::new(settings.structure_policy());
        let identifiers = IdentifierTable::new();
        let names = CommonIdentifiers::new(&identifiers);

        let object_prototype = plain_object(&mut heap, &mut structures, Value::NULL, capacity);
        let function_prototype = plain_object(
            &mut heap,
            &mut structures,
            Value::from_cell(object_prototype),
            capacity,
        );

        let global_structure = structures.unique_structure(
            Value::from_cell(object_prototype),
            ObjectClass::Global,
            capacity,
        );
        let global_object = heap.allocate(Cell::Object(JsObject::new(
            global_structure,
            capacity,
            ObjectKind::Global(Box::default()),
        )));
        let global_scope = heap.allocate(Cell::Scope(Scope::new(
            None,
            ScopeKind::Global {
                object: global_object,
            },
        )));

        let base_error =
            plain_object(&mut heap, &mut structures, Value::from_cell(object_prototype), capacity);
        let error_prototypes = ErrorType::ALL.map(|ty| match ty {
            ErrorType::Error => base_error,
            _ => plain_object(&mut heap, &mut structures, Value::from_cell(base_error), capacity),
        });
        let arguments_structure = structures.empty_structure(
            Value::from_cell(object_prototype),
            ObjectClass::Arguments,
            capacity,
        );

        let mut vm = Self {
            register_file: RegisterFile::new(
                settings.register_file_capacity,
                settings.register_segment_size,
            ),
            watchdog: Watchdog::new(settings.watchdog_tick_limit, settings.watchdog_time_limit),
            settings,
            heap,
            structures,
            identifiers,
            names,
            executables: Vec::new(),
            code_blocks: Vec::new(),
            global_object,
            global_scope,
            object_prototype,
            function_prototype,
            error_prototypes,
            arguments_structure,
            top_call_frame: None,
            current_pc: 0,
            reentry_depth: 0,
            host_call_depth: 0,
            pending_exception: None,
            last_exception_stack: Vec::new(),
            debugger: None,
            jit: None,
            stats: VMStats::default(),
        };

        let names = vm.names;
        for ty in ErrorType::ALL {
            let prototype = vm.error_prototypes[ty as usize];
            let name = vm.heap.allocate_string(ty.name());
            vm.define_own_property(prototype, names.name, name, PropertyAttributes::DONT_ENUM);
            let message = vm.heap.allocate_string("");
            vm.define_own_property(prototype, names.message, message, PropertyAttributes::DONT_ENUM);
        }
        log::debug!(
            "vm bootstrapped: {} cells, {} structures",
            vm.heap.live_cells(),
            vm.structures.len()
        );
        Ok(vm)
    }

    // ── Values ─────────────────────────────────────────────────────

    /// A fixnum when `n` is integral and fits, otherwise a boxed double.
    pub fn number_value(&mut self, n: f64) -> Value {
        if n.fract() == 0.0 && !(n == 0.0 && n.is_sign_negative()) && n.abs() < 4.0e18 {
            if let Some(value) = Value::try_from_i64(n as i64) {
                return value;
            }
        }
        self.heap.allocate_number(n)
    }

    pub fn to_number(&self, value: Value) -> Option<f64> {
        if let Some(n) = value.as_i64() {
            return Some(n as f64);
        }
        match value.as_cell() {
            Some(cell) => self.heap.number(cell),
            None if value.is_undefined() => Some(f64::NAN),
            None if value.is_null() => Some(0.0),
            None => value.as_bool().map(|b| b as i64 as f64),
        }
    }

    pub fn string_value(&self, value: Value) -> Option<&str> {
        self.heap.string(value.as_cell()?)
    }

    pub fn is_object(&self, value: Value) -> bool {
        value.as_cell().is_some_and(|cell| self.heap.object(cell).is_some())
    }

    pub fn truthy(&self, value: Value) -> bool {
        if let Some(n) = value.as_i64() {
            return n != 0;
        }
        if let Some(b) = value.as_bool() {
            return b;
        }
        match value.as_cell() {
            Some(cell) => match self.heap.get(cell) {
                Cell::Number(n) => *n != 0.0 && !n.is_nan(),
                Cell::String(s) => !s.is_empty(),
                _ => true,
            },
            None => false,
        }
    }

    /// Human readable rendering for diagnostics.
    pub fn display_value(&self, value: Value) -> String {
        if let Some(n) = value.as_i64() {
            return n.to_string();
        }
        if let Some(b) = value.as_bool() {
            return b.to_string();
        }
        let Some(cell) = value.as_cell() else {
            return if value.is_null() {
                "null".into()
            } else if value.is_empty() {
                "<empty>".into()
            } else {
                "undefined".into()
            };
        };
        match self.heap.get(cell) {
            Cell::Number(n) => n.to_string(),
            Cell::String(s) => s.to_string(),
            Cell::Scope(_) => "[scope]".into(),
            Cell::GetterSetter(_) => "[accessor]".into(),
            Cell::Object(object) => match &object.kind {
                ObjectKind::Error(ty) => match self.error_message(value) {
                    Some(message) if !message.is_empty() => format!("{}: {message}", ty.name()),
                    _ => ty.name().to_string(),
                },
                ObjectKind::Function(FunctionData::Script { executable, .. }) => {
                    let name = self.executables[executable.index() as usize].name;
                    format!("function {}", self.identifiers.name(name))
                }
                ObjectKind::Function(FunctionData::Host { name, .. }) => {
                    format!("function {} [host]", self.identifiers.name(*name))
                }
                ObjectKind::Arguments(_) => "[object Arguments]".into(),
                ObjectKind::Global(_) => "[object Global]".into(),
                ObjectKind::Plain => "[object Object]".into(),
            },
        }
    }

    // ── Objects ────────────────────────────────────────────────────

    pub fn new_object(&mut self, prototype: Value) -> CellId {
        let capacity = self.settings.inline_capacity;
        plain_object(&mut self.heap, &mut self.structures, prototype, capacity)
    }

    pub fn new_plain_object(&mut self) -> CellId {
        self.new_object(Value::from_cell(self.object_prototype))
    }

    fn function_structure(&mut self) -> StructureId {
        self.structures.empty_structure(
            Value::from_cell(self.function_prototype),
            ObjectClass::Function,
            self.settings.inline_capacity,
        )
    }

    /// Close `executable` over `scope`.
    pub fn new_function(&mut self, executable: ExecutableId, scope: CellId) -> CellId {
        let structure = self.function_structure();
        let capacity = self.settings.inline_capacity;
        self.heap.allocate(Cell::Object(JsObject::new(
            structure,
            capacity,
            ObjectKind::Function(FunctionData::Script { executable, scope }),
        )))
    }

    pub fn create_host_function(
        &mut self,
        name: &str,
        arity: u32,
        function: HostFn,
        constructor: Option<HostFn>,
    ) -> CellId {
        let name = self.identifiers.add(name);
        let structure = self.function_structure();
        let capacity = self.settings.inline_capacity;
        self.heap.allocate(Cell::Object(JsObject::new(
            structure,
            capacity,
            ObjectKind::Function(FunctionData::Host {
                name,
                arity,
                function,
                constructor,
            }),
        )))
    }

    /// Create a host function and bind it as a global property.
    pub fn define_host_function(&mut self, name: &str, arity: u32, function: HostFn) -> CellId {
        let cell = self.create_host_function(name, arity, function, None);
        let key = self.identifiers.add(name);
        self.define_own_property(
            self.global_object,
            key,
            Value::from_cell(cell),
            PropertyAttributes::DONT_ENUM,
        );
        cell
    }

    pub fn function_data(&self, value: Value) -> Option<FunctionData> {
        self.heap.object(value.as_cell()?)?.as_function().copied()
    }

    pub fn is_callable(&self, value: Value) -> bool {
        self.function_data(value).is_some()
    }

    pub fn global_data(&self) -> &GlobalData {
        match self.heap.object(self.global_object).and_then(JsObject::as_global) {
            Some(data) => data,
            None => unreachable!("global object lost its global data"),
        }
    }

    pub(crate) fn global_data_mut(&mut self) -> &mut GlobalData {
        match self
            .heap
            .object_mut(self.global_object)
            .and_then(JsObject::as_global_mut)
        {
            Some(data) => data,
            None => unreachable!("global object lost its global data"),
        }
    }

    /// Declare a global `var`. Redeclaring an existing variable or an
    /// existing own property of the global object does nothing.
    pub fn declare_global_variable(&mut self, name: Identifier, attributes: PropertyAttributes) {
        if self.global_data().symbol_table.contains(name) {
            return;
        }
        let structure = self.heap.object(self.global_object).map(JsObject::structure);
        if let Some(structure) = structure
            && self.structures.find_property(structure, name).is_some()
        {
            return;
        }
        let global = self.global_data_mut();
        let index = global.variables.len() as i32;
        global.variables.push(Value::UNDEFINED);
        global
            .symbol_table
            .add(name, SymbolTableEntry::new(index, attributes | PropertyAttributes::DONT_DELETE));
        log::trace!("declared global variable #{index}");
    }

    pub fn global_variable(&self, name: &str) -> Option<Value> {
        let name = self.identifiers.lookup(name)?;
        let global = self.global_data();
        let entry = global.symbol_table.get(name)?;
        global.variables.get(entry.index as usize).copied()
    }

    /// Store into global variable `index`, firing its watchpoint.
    pub(crate) fn set_global_variable(&mut self, name: Identifier, index: usize, value: Value) {
        let global_object = self.global_object;
        let global = self.global_data_mut();
        if let Some(slot) = global.variables.get_mut(index) {
            *slot = value;
        }
        if let Some(entry) = global.symbol_table.get_mut(name) {
            entry.watchpoint.notify_write();
        }
        self.heap.write_barrier(global_object, value);
    }

    // ── Errors ─────────────────────────────────────────────────────

    pub fn create_error(&mut self, ty: ErrorType, message: &str) -> Value {
        let prototype = Value::from_cell(self.error_prototypes[ty as usize]);
        let capacity = self.settings.inline_capacity;
        let structure = self
            .structures
            .empty_structure(prototype, ObjectClass::Error, capacity);
        let error = self
            .heap
            .allocate(Cell::Object(JsObject::new(structure, capacity, ObjectKind::Error(ty))));
        let message = self.heap.allocate_string(message);
        self.define_own_property(error, self.names.message, message, PropertyAttributes::DONT_ENUM);
        Value::from_cell(error)
    }

    pub fn throw_error(&mut self, ty: ErrorType, message: &str) -> Exception {
        log::debug!("throwing {}: {message}", ty.name());
        Exception::new(self.create_error(ty, message))
    }

    pub fn error_type(&self, value: Value) -> Option<ErrorType> {
        self.heap.object(value.as_cell()?)?.error_type()
    }

    pub fn error_message(&self, value: Value) -> Option<String> {
        let object = self.heap.object(value.as_cell()?)?;
        let entry = self
            .structures
            .find_property(object.structure(), self.names.message)?;
        self.string_value(object.get_direct(entry.offset)).map(str::to_string)
    }

    // ── Garbage collection ─────────────────────────────────────────

    /// Collect now. Only call at a safepoint.
    pub fn collect_garbage(&mut self) -> usize {
        let live_end = self.register_file.end();
        let mut specials = vec![
            Value::from_cell(self.global_object),
            Value::from_cell(self.global_scope),
            Value::from_cell(self.object_prototype),
            Value::from_cell(self.function_prototype),
        ];
        specials.extend(self.error_prototypes.iter().map(|&cell| Value::from_cell(cell)));
        if let Some(pending) = self.pending_exception {
            specials.push(pending);
        }
        let mut roots = VMRoots {
            register_file: &self.register_file,
            code_blocks: &self.code_blocks,
            structures: &self.structures,
            specials: &specials,
        };
        let mut stale_arguments = 0usize;
        let freed = self.heap.collect(&mut roots, |id, cell| {
            if aliases_dead_frame(cell, live_end) {
                log::error!("arguments {id:?} reclaimed while aliasing a dead frame");
                stale_arguments += 1;
            }
        });
        stale_arguments += self.arguments_outliving_frames();
        debug_assert_eq!(stale_arguments, 0, "arguments object outlived its frame without tear-off");
        freed
    }

    /// Live arguments objects still aliasing register file slots above the
    /// live top. Zero whenever every finished frame was torn off.
    pub fn arguments_outliving_frames(&self) -> usize {
        let live_end = self.register_file.end();
        self.heap
            .cells()
            .filter(|(id, cell)| {
                let stale = aliases_dead_frame(cell, live_end);
                if stale {
                    log::error!("arguments {id:?} aliases a dead frame");
                }
                stale
            })
            .count()
    }

    /// Collect if the allocation budget is spent and no host function is
    /// on the native stack.
    pub(crate) fn safepoint(&mut self) {
        if self.host_call_depth == 0 && self.heap.should_collect() {
            self.collect_garbage();
        }
    }
}

fn aliases_dead_frame(cell: &Cell, live_end: usize) -> bool {
    matches!(cell, Cell::Object(object)
        if object
            .as_arguments()
            .and_then(|arguments| arguments.frame_arguments_start())
            .is_some_and(|start| start >= live_end))
}

/// Roots of one collection: live register file slots, special objects,
/// linked code and structure-held values.
struct VMRoots<'a> {
    register_file: &'a RegisterFile,
    code_blocks: &'a [CodeBlock],
    structures: &'a StructureTable,
    specials: &'a [Value],
}

impl RootProvider for VMRoots<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Value)) {
        self.register_file.visit_live(visitor);
        for &value in self.specials {
            visitor(value);
        }
        for code_block in self.code_blocks {
            for &constant in code_block.constants.iter() {
                visitor(constant);
            }
            for cache in &code_block.resolve {
                cache.trace(visitor);
            }
            for callee in code_block.calls.iter().filter_map(CallLinkInfo::callee) {
                visitor(Value::from_cell(callee));
            }
        }
        self.structures.visit_roots(visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_creates_the_global_environment() {
        let vm = VM::new(VMSettings::default()).unwrap();
        assert!(vm.heap.scope(vm.global_scope).unwrap().is_global());
        assert!(vm.global_data().symbol_table.is_empty());
        assert_eq!(vm.top_call_frame, None);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let settings = VMSettings {
            gc_threshold: 0,
            ..VMSettings::default()
        };
        assert!(VM::new(settings).is_err());
    }

    #[test]
    fn numbers_prefer_fixnums() {
        let mut vm = VM::new(VMSettings::default()).unwrap();
        assert_eq!(vm.number_value(3.0), Value::from_i64(3));
        let half = vm.number_value(0.5);
        assert!(half.is_ref());
        assert_eq!(vm.to_number(half), Some(0.5));
        assert!(vm.number_value(-0.0).is_ref());
    }

    #[test]
    fn errors_carry_type_and_message() {
        let mut vm = VM::new(VMSettings::default()).unwrap();
        let error = vm.create_error(ErrorType::TypeError, "bad receiver");
        assert_eq!(vm.error_type(error), Some(ErrorType::TypeError));
        assert_eq!(vm.error_message(error).as_deref(), Some("bad receiver"));
        assert_eq!(vm.display_value(error), "TypeError: bad receiver");
    }

    #[test]
    fn global_variables_are_declared_once() {
        let mut vm = VM::new(VMSettings::default()).unwrap();
        let x = vm.identifiers.add("x");
        vm.declare_global_variable(x, PropertyAttributes::empty());
        vm.declare_global_variable(x, PropertyAttributes::empty());
        assert_eq!(vm.global_data().variables.len(), 1);
        assert_eq!(vm.global_variable("x"), Some(Value::UNDEFINED));
    }

    #[test]
    fn collection_keeps_specials_and_drops_garbage() {
        let mut vm = VM::new(VMSettings::default()).unwrap();
        let before = vm.heap.live_cells();
        for _ in 0..10 {
            vm.new_plain_object();
        }
        let freed = vm.collect_garbage();
        assert_eq!(freed, 10);
        assert_eq!(vm.heap.live_cells(), before);
        assert!(vm.heap.object(vm.global_object).is_some());
    }

    #[test]
    fn structures_keep_their_prototypes_alive() {
        let mut vm = VM::new(VMSettings::default()).unwrap();
        let prototype = vm.new_plain_object();
        vm.new_object(Value::from_cell(prototype));
        let structures = vm.structures.len();

        assert_eq!(vm.collect_garbage(), 1);
        assert!(vm.heap.object(prototype).is_some());
        assert_eq!(vm.structures.len(), structures);
    }
}
