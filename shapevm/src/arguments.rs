//! `arguments` objects.
//!
//! An arguments object reads its values straight out of the frame that
//! created it until it is torn off. Tear-off copies the values into storage
//! owned by the object and happens at most once; it is mandatory before the
//! frame dies.

use bitflags::bitflags;

use crate::{
    CallFrame, Cell, CellId, JsObject, ObjectKind, Register, Value, VM,
};

bitflags! {
    /// Well-known properties the script has redefined. An overridden name
    /// is answered by the ordinary property table instead of the frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ArgumentsOverrides: u8 {
        const LENGTH = 1 << 0;
        const CALLEE = 1 << 1;
        const CALLER = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowArgument {
    Normal,
    /// Aliases binding `index` of the function's activation.
    Captured { index: i32 },
    Deleted,
}

#[derive(Debug)]
pub enum ArgumentsStorage {
    /// `arguments_start` is the frame slot holding `this`.
    Frame { arguments_start: usize },
    TornOff(Box<[Value]>),
}

/// How an optimised caller represents one argument of an inlined call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueRecovery {
    AlreadyInRegisterFile(usize),
    Int32(i32),
    Double(f64),
    Constant(Value),
}

#[derive(Debug)]
pub struct ArgumentsData {
    pub num_arguments: usize,
    pub callee: Value,
    pub overrides: ArgumentsOverrides,
    storage: ArgumentsStorage,
    slow_arguments: Option<Box<[SlowArgument]>>,
    activation: Option<CellId>,
    tear_off_allocations: u32,
}

impl ArgumentsData {
    #[inline]
    pub fn is_torn_off(&self) -> bool {
        matches!(self.storage, ArgumentsStorage::TornOff(_))
    }

    /// Still reads through a live frame.
    #[inline]
    pub fn aliases_frame(&self) -> bool {
        !self.is_torn_off()
    }

    pub fn storage(&self) -> &ArgumentsStorage {
        &self.storage
    }

    pub fn frame_arguments_start(&self) -> Option<usize> {
        match self.storage {
            ArgumentsStorage::Frame { arguments_start } => Some(arguments_start),
            ArgumentsStorage::TornOff(_) => None,
        }
    }

    pub fn slow_argument(&self, index: usize) -> SlowArgument {
        self.slow_arguments
            .as_ref()
            .and_then(|slow| slow.get(index).copied())
            .unwrap_or(SlowArgument::Normal)
    }

    pub fn activation(&self) -> Option<CellId> {
        self.activation
    }

    /// Number of times independent storage was allocated for this object.
    pub fn tear_off_allocations(&self) -> u32 {
        self.tear_off_allocations
    }

    pub fn trace(&self, visitor: &mut dyn FnMut(Value)) {
        visitor(self.callee);
        if let Some(activation) = self.activation {
            visitor(Value::from_cell(activation));
        }
        if let ArgumentsStorage::TornOff(values) = &self.storage {
            for &value in values.iter() {
                visitor(value);
            }
        }
    }
}

impl VM {
    /// Create the arguments object of `frame`.
    pub fn create_arguments(&mut self, frame: CallFrame) -> CellId {
        let registers = &self.register_file;
        let num_arguments = frame.argument_count(registers);
        let callee = frame.callee(registers);
        let arguments_start = frame.arguments_start(registers);

        let mut activation = None;
        let mut slow_arguments = None;
        if let Some(code_block) = frame.code_block(registers) {
            let code_block = &self.code_blocks[code_block.index() as usize];
            activation = code_block
                .activation_register
                .and_then(|r| frame.r(registers, r).as_cell())
                .filter(|&cell| {
                    self.heap
                        .scope(cell)
                        .is_some_and(|scope| scope.as_activation().is_some())
                });
            if activation.is_some() {
                let slow: Box<[SlowArgument]> = (0..num_arguments)
                    .map(|i| {
                        let index = Register::argument(i as u32).raw();
                        if code_block.symbol_table.iter().any(|(_, e)| e.index == index) {
                            SlowArgument::Captured { index }
                        } else {
                            SlowArgument::Normal
                        }
                    })
                    .collect();
                if slow.iter().any(|s| *s != SlowArgument::Normal) {
                    slow_arguments = Some(slow);
                }
            }
        }

        let data = ArgumentsData {
            num_arguments,
            callee,
            overrides: ArgumentsOverrides::empty(),
            storage: ArgumentsStorage::Frame { arguments_start },
            slow_arguments,
            activation,
            tear_off_allocations: 0,
        };
        let structure = self.arguments_structure;
        let capacity = self.structures[structure].inline_capacity();
        let cell = self.heap.allocate(Cell::Object(JsObject::new(
            structure,
            capacity,
            ObjectKind::Arguments(Box::new(data)),
        )));
        log::trace!("created arguments {cell:?} over {num_arguments} arguments at {arguments_start}");
        cell
    }

    fn activation_register(&self, activation: Option<CellId>, index: i32) -> Value {
        activation
            .and_then(|cell| self.heap.scope(cell))
            .and_then(|scope| scope.as_activation())
            .map_or(Value::UNDEFINED, |a| a.register(index, &self.register_file))
    }

    /// Element `index`, or `None` when it is out of range or deleted.
    pub fn arguments_get_index(&self, cell: CellId, index: usize) -> Option<Value> {
        let data = self.heap.object(cell)?.as_arguments()?;
        if index >= data.num_arguments {
            return None;
        }
        match data.slow_argument(index) {
            SlowArgument::Deleted => None,
            SlowArgument::Captured { index: binding } => {
                Some(self.activation_register(data.activation, binding))
            }
            SlowArgument::Normal => Some(match &data.storage {
                ArgumentsStorage::Frame { arguments_start } => {
                    self.register_file.get(arguments_start + 1 + index)
                }
                ArgumentsStorage::TornOff(values) => values[index],
            }),
        }
    }

    /// Store element `index`. Returns `false` when the index is not backed
    /// by the frame or the torn-off storage.
    pub fn arguments_put_index(&mut self, cell: CellId, index: usize, value: Value) -> bool {
        let Some(data) = self.heap.object_mut(cell).and_then(JsObject::as_arguments_mut) else {
            return false;
        };
        if index >= data.num_arguments {
            return false;
        }
        match data.slow_argument(index) {
            SlowArgument::Deleted => false,
            SlowArgument::Captured { index: binding } => {
                let activation = data.activation;
                if let Some(activation) = activation
                    .and_then(|a| self.heap.scope_mut(a))
                    .and_then(|s| s.as_activation_mut())
                {
                    activation.set_register(binding, value, &mut self.register_file);
                }
                if let Some(activation) = activation {
                    self.heap.write_barrier(activation, value);
                }
                true
            }
            SlowArgument::Normal => {
                match &mut data.storage {
                    ArgumentsStorage::Frame { arguments_start } => {
                        let slot = *arguments_start + 1 + index;
                        self.register_file.set(slot, value);
                    }
                    ArgumentsStorage::TornOff(values) => {
                        values[index] = value;
                        self.heap.write_barrier(cell, value);
                    }
                }
                true
            }
        }
    }

    /// Detach element `index` from the frame. Later reads fall through to
    /// the ordinary property table.
    pub fn arguments_delete_index(&mut self, cell: CellId, index: usize) -> bool {
        let Some(data) = self.heap.object_mut(cell).and_then(JsObject::as_arguments_mut) else {
            return false;
        };
        if index >= data.num_arguments {
            return false;
        }
        let num_arguments = data.num_arguments;
        let slow = data
            .slow_arguments
            .get_or_insert_with(|| vec![SlowArgument::Normal; num_arguments].into_boxed_slice());
        slow[index] = SlowArgument::Deleted;
        true
    }

    /// Copy the arguments out of the frame. Returns `false` when the object
    /// was already torn off.
    pub fn tear_off_arguments(&mut self, cell: CellId) -> bool {
        let Some(data) = self.heap.object(cell).and_then(JsObject::as_arguments) else {
            return false;
        };
        let ArgumentsStorage::Frame { arguments_start } = data.storage else {
            return false;
        };
        let values: Box<[Value]> = (0..data.num_arguments)
            .map(|i| match data.slow_argument(i) {
                SlowArgument::Captured { index } => {
                    self.activation_register(data.activation, index)
                }
                _ => self.register_file.get(arguments_start + 1 + i),
            })
            .collect();
        self.install_torn_off(cell, values);
        true
    }

    /// Tear off arguments whose values an optimised caller kept in its own
    /// representation rather than in a frame.
    pub fn tear_off_arguments_with_recoveries(
        &mut self,
        cell: CellId,
        recoveries: &[ValueRecovery],
    ) -> bool {
        let Some(data) = self.heap.object(cell).and_then(JsObject::as_arguments) else {
            return false;
        };
        if data.is_torn_off() {
            return false;
        }
        debug_assert_eq!(recoveries.len(), data.num_arguments);
        let values: Box<[Value]> = recoveries
            .iter()
            .map(|recovery| match *recovery {
                ValueRecovery::AlreadyInRegisterFile(slot) => self.register_file.get(slot),
                ValueRecovery::Int32(n) => Value::from_i64(n as i64),
                ValueRecovery::Double(n) => self.number_value(n),
                ValueRecovery::Constant(value) => value,
            })
            .collect();
        self.install_torn_off(cell, values);
        true
    }

    fn install_torn_off(&mut self, cell: CellId, values: Box<[Value]>) {
        for &value in values.iter() {
            self.heap.write_barrier(cell, value);
        }
        let Some(data) = self.heap.object_mut(cell).and_then(JsObject::as_arguments_mut) else {
            return;
        };
        if !values.is_empty() {
            data.tear_off_allocations += 1;
        }
        if let Some(slow) = &mut data.slow_arguments {
            for slot in slow.iter_mut() {
                if let SlowArgument::Captured { .. } = slot {
                    *slot = SlowArgument::Normal;
                }
            }
        }
        log::debug!("tore off arguments {cell:?}: {} values", values.len());
        data.storage = ArgumentsStorage::TornOff(values);
        self.stats.arguments_tear_offs += 1;
    }
}
