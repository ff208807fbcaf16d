//! Call frame layout inside the [`RegisterFile`].
//!
//! ```text
//! arguments_start ─► this, arg0 .. argN-1      (N = padded argument count)
//!                    CodeBlock                 base - 6
//!                    ScopeChain                base - 5
//!                    CallerFrame               base - 4
//!                    ReturnPc                  base - 3
//!                    ArgumentCount             base - 2
//!                    Callee                    base - 1
//! base ────────────► r0 .. rK-1                (callee locals)
//! ```

use crate::{CellId, CodeBlockId, Register, RegisterFile, StackOverflow, Value};

pub const HEADER_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum HeaderEntry {
    CodeBlock = 6,
    ScopeChain = 5,
    CallerFrame = 4,
    ReturnPc = 3,
    ArgumentCount = 2,
    Callee = 1,
}

/// Where a frame returns to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerLink {
    /// Outermost frame of the register file.
    None,
    /// Caller is another frame on this register file. `host_entry` is set
    /// when host code sits between the two, so unwinding must hand control
    /// back to the host here.
    Frame { frame: CallFrame, host_entry: bool },
}

/// Handle to a live frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFrame {
    base: usize,
}

impl CallFrame {
    #[inline(always)]
    pub fn from_base(base: usize) -> Self {
        Self { base }
    }

    #[inline(always)]
    pub fn base(self) -> usize {
        self.base
    }

    #[inline(always)]
    fn slot(self, entry: HeaderEntry) -> usize {
        self.base - entry as usize
    }

    pub fn code_block(self, registers: &RegisterFile) -> Option<CodeBlockId> {
        registers
            .get(self.slot(HeaderEntry::CodeBlock))
            .as_i64()
            .map(|index| CodeBlockId::from_index(index as u32))
    }

    pub fn scope(self, registers: &RegisterFile) -> Option<CellId> {
        registers.get(self.slot(HeaderEntry::ScopeChain)).as_cell()
    }

    pub fn set_scope(self, registers: &mut RegisterFile, scope: CellId) {
        registers.set(self.slot(HeaderEntry::ScopeChain), Value::from_cell(scope));
    }

    pub fn caller(self, registers: &RegisterFile) -> CallerLink {
        match registers.get(self.slot(HeaderEntry::CallerFrame)).as_i64() {
            Some(encoded) => CallerLink::Frame {
                frame: CallFrame::from_base((encoded >> 1) as usize),
                host_entry: encoded & 1 == 1,
            },
            None => CallerLink::None,
        }
    }

    pub fn caller_frame(self, registers: &RegisterFile) -> Option<CallFrame> {
        match self.caller(registers) {
            CallerLink::Frame { frame, .. } => Some(frame),
            CallerLink::None => None,
        }
    }

    pub fn return_pc(self, registers: &RegisterFile) -> usize {
        registers
            .get(self.slot(HeaderEntry::ReturnPc))
            .as_i64()
            .unwrap_or(0) as usize
    }

    /// Arguments actually passed, excluding `this`.
    pub fn argument_count(self, registers: &RegisterFile) -> usize {
        let packed = registers
            .get(self.slot(HeaderEntry::ArgumentCount))
            .as_i64()
            .unwrap_or(0);
        (packed & 0xffff_ffff) as usize
    }

    /// Argument slots present in the frame, excluding `this`. Larger than
    /// [`argument_count`](Self::argument_count) after an arity fixup.
    pub fn padded_argument_count(self, registers: &RegisterFile) -> usize {
        let packed = registers
            .get(self.slot(HeaderEntry::ArgumentCount))
            .as_i64()
            .unwrap_or(0);
        (packed >> 32) as usize
    }

    pub fn callee(self, registers: &RegisterFile) -> Value {
        registers.get(self.slot(HeaderEntry::Callee))
    }

    /// Slot holding `this`.
    pub fn arguments_start(self, registers: &RegisterFile) -> usize {
        self.base - HEADER_SIZE - self.padded_argument_count(registers) - 1
    }

    pub fn this_value(self, registers: &RegisterFile) -> Value {
        registers.get(self.arguments_start(registers))
    }

    /// Argument `index`, or undefined past the passed arguments.
    pub fn argument(self, registers: &RegisterFile, index: usize) -> Value {
        if index < self.padded_argument_count(registers) {
            registers.get(self.arguments_start(registers) + 1 + index)
        } else {
            Value::UNDEFINED
        }
    }

    #[inline]
    pub fn register_index(self, registers: &RegisterFile, register: Register) -> usize {
        match register.parameter_slot() {
            None => self.base + register.raw() as usize,
            Some(slot) => self.arguments_start(registers) + slot as usize,
        }
    }

    #[inline]
    pub fn r(self, registers: &RegisterFile, register: Register) -> Value {
        registers.get(self.register_index(registers, register))
    }

    #[inline]
    pub fn set_r(self, registers: &mut RegisterFile, register: Register, value: Value) {
        let index = self.register_index(registers, register);
        registers.set(index, value);
    }
}

/// Everything [`RegisterFile::push_frame`] needs to lay out a frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameRequest {
    pub caller: Option<CallFrame>,
    pub entered_from_host: bool,
    /// Slot of `this`, followed by `argument_count` arguments.
    pub arguments_start: usize,
    pub argument_count: usize,
    /// Declared parameters, excluding `this`.
    pub parameter_count: usize,
    pub num_registers: usize,
    pub code_block: Option<CodeBlockId>,
    pub scope: Option<CellId>,
    pub callee: Value,
    pub return_pc: usize,
}

impl RegisterFile {
    /// Lay out a new frame directly above its arguments. Registers above
    /// the argument window are reused by the callee.
    ///
    /// When fewer arguments than parameters were passed, the arguments are
    /// copied into a fresh window just above the provided one and the
    /// missing parameters read as undefined. The caller's window is left
    /// untouched.
    pub fn push_frame(&mut self, request: &FrameRequest) -> Result<CallFrame, StackOverflow> {
        let mut start = request.arguments_start;
        let mut padded = request.argument_count;

        if request.argument_count < request.parameter_count {
            let new_start = start + request.argument_count + 1;
            padded = request.parameter_count;
            self.grow(new_start + padded + 1)?;
            self.copy(start, new_start, request.argument_count + 1);
            self.fill(
                new_start + request.argument_count + 1..new_start + padded + 1,
                Value::UNDEFINED,
            );
            log::debug!(
                "arity fixup: {} -> {} argument slots at {new_start}",
                request.argument_count,
                padded
            );
            self.arity_fixups += 1;
            start = new_start;
        }

        let base = start + padded + 1 + HEADER_SIZE;
        let end = base + request.num_registers;
        self.grow(end)?;

        let frame = CallFrame::from_base(base);
        let code_block = request
            .code_block
            .map_or(Value::UNDEFINED, |id| Value::from_i64(id.index() as i64));
        let scope = request.scope.map_or(Value::UNDEFINED, Value::from_cell);
        let caller = request.caller.map_or(Value::UNDEFINED, |c| {
            Value::from_i64(((c.base() as i64) << 1) | request.entered_from_host as i64)
        });
        self.set(frame.slot(HeaderEntry::CodeBlock), code_block);
        self.set(frame.slot(HeaderEntry::ScopeChain), scope);
        self.set(frame.slot(HeaderEntry::CallerFrame), caller);
        self.set(
            frame.slot(HeaderEntry::ReturnPc),
            Value::from_i64(request.return_pc as i64),
        );
        self.set(
            frame.slot(HeaderEntry::ArgumentCount),
            Value::from_i64(((padded as i64) << 32) | request.argument_count as i64),
        );
        self.set(frame.slot(HeaderEntry::Callee), request.callee);
        self.fill(base..end, Value::UNDEFINED);
        self.set_end(end);
        log::trace!("push frame base={base} argc={} end={end}", request.argument_count);
        Ok(frame)
    }

    /// Release `frame`, restoring the register file top to `caller_end`.
    /// A callee built on an argument window below the caller's top may end
    /// below it, so the top can move up here.
    pub fn pop_frame(&mut self, frame: CallFrame, caller_end: usize) -> CallerLink {
        let caller = frame.caller(self);
        if caller_end <= self.end() {
            self.shrink(caller_end);
        } else {
            self.set_end(caller_end);
        }
        log::trace!("pop frame base={}", frame.base());
        caller
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registers() -> RegisterFile {
        let mut registers = RegisterFile::new(256, 32);
        registers.grow(16).unwrap();
        registers.set_end(16);
        registers
    }

    fn request(arguments_start: usize, argument_count: usize, parameter_count: usize) -> FrameRequest {
        FrameRequest {
            caller: None,
            entered_from_host: true,
            arguments_start,
            argument_count,
            parameter_count,
            num_registers: 4,
            code_block: Some(CodeBlockId::from_index(3)),
            scope: Some(CellId::from_index(9)),
            callee: Value::from_cell(CellId::from_index(2)),
            return_pc: 11,
        }
    }

    #[test]
    fn header_round_trip() {
        let mut registers = registers();
        registers.set(10, Value::TRUE);
        registers.set(11, Value::from_i64(1));
        let caller = CallFrame::from_base(8);
        let frame = registers
            .push_frame(&FrameRequest {
                caller: Some(caller),
                entered_from_host: false,
                ..request(10, 1, 1)
            })
            .unwrap();

        assert_eq!(frame.base(), 10 + 2 + HEADER_SIZE);
        assert_eq!(frame.code_block(&registers), Some(CodeBlockId::from_index(3)));
        assert_eq!(frame.scope(&registers), Some(CellId::from_index(9)));
        assert_eq!(frame.return_pc(&registers), 11);
        assert_eq!(frame.argument_count(&registers), 1);
        assert_eq!(frame.this_value(&registers), Value::TRUE);
        assert_eq!(frame.argument(&registers, 0), Value::from_i64(1));
        assert_eq!(
            frame.caller(&registers),
            CallerLink::Frame { frame: caller, host_entry: false }
        );
        assert_eq!(registers.end(), frame.base() + 4);
    }

    #[test]
    fn arity_fixup_builds_a_fresh_window() {
        let mut registers = registers();
        registers.set(10, Value::NULL);
        registers.set(11, Value::from_i64(1));
        registers.set(12, Value::from_i64(99));

        let frame = registers.push_frame(&request(10, 1, 2)).unwrap();
        let start = frame.arguments_start(&registers);
        assert_eq!(start, 12);
        assert_eq!(frame.argument_count(&registers), 1);
        assert_eq!(frame.padded_argument_count(&registers), 2);
        assert_eq!(registers.arity_fixups(), 1);
        assert_eq!(frame.argument(&registers, 0), Value::from_i64(1));
        assert_eq!(frame.argument(&registers, 1), Value::UNDEFINED);
        assert_eq!(frame.r(&registers, Register::argument(1)), Value::UNDEFINED);

        // The window the caller provided is unchanged.
        assert_eq!(registers.get(10), Value::NULL);
        assert_eq!(registers.get(11), Value::from_i64(1));
    }

    #[test]
    fn matching_arity_uses_the_window_in_place() {
        let mut registers = registers();
        registers.set(4, Value::NULL);
        registers.set(5, Value::from_i64(1));
        registers.set(6, Value::from_i64(2));

        let frame = registers.push_frame(&request(4, 2, 2)).unwrap();
        assert_eq!(frame.arguments_start(&registers), 4);
        assert_eq!(frame.base(), 4 + 3 + HEADER_SIZE);
        assert_eq!(frame.padded_argument_count(&registers), 2);
        assert_eq!(registers.arity_fixups(), 0);
        assert_eq!(frame.r(&registers, Register::argument(1)), Value::from_i64(2));

        // Extra arguments stay where the caller put them too.
        let frame = registers.push_frame(&request(4, 2, 1)).unwrap();
        assert_eq!(frame.arguments_start(&registers), 4);
        assert_eq!(registers.arity_fixups(), 0);
    }

    #[test]
    fn overflow_leaves_the_register_file_alone() {
        let mut registers = registers();
        let result = registers.push_frame(&FrameRequest {
            num_registers: 1000,
            ..request(10, 0, 0)
        });
        assert!(result.is_err());
        assert_eq!(registers.end(), 16);
    }

    #[test]
    fn pop_restores_caller_end() {
        let mut registers = registers();
        let frame = registers.push_frame(&request(16, 0, 0)).unwrap();
        assert!(registers.end() > 16);
        let link = registers.pop_frame(frame, 16);
        assert_eq!(link, CallerLink::None);
        assert_eq!(registers.end(), 16);
    }

    #[test]
    fn pop_restores_a_caller_end_above_the_callee() {
        let mut registers = registers();
        let frame = registers
            .push_frame(&FrameRequest {
                num_registers: 0,
                ..request(2, 0, 0)
            })
            .unwrap();
        assert_eq!(registers.end(), 3 + HEADER_SIZE);
        registers.pop_frame(frame, 16);
        assert_eq!(registers.end(), 16);
    }
}
