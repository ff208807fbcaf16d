//! Internal instruction set.
//!
//! Operands index into the owning code block: `constant` into its constant
//! pool, `name` into its identifier list, `function` into its nested
//! function list and `site` into the cache table of the instruction's kind.

use crate::Value;

/// A frame-relative register operand.
///
/// Non-negative values are locals. Negative values address the parameter
/// area: `-1` is `this`, `-2` the first argument, and so on.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register(i32);

impl Register {
    #[inline(always)]
    pub const fn local(index: u32) -> Self {
        Self(index as i32)
    }

    /// Parameter slot `slot`, where slot 0 is `this`.
    #[inline(always)]
    pub const fn parameter(slot: u32) -> Self {
        Self(-(slot as i32) - 1)
    }

    #[inline(always)]
    pub const fn this() -> Self {
        Self::parameter(0)
    }

    /// The `index`-th declared argument (0-based).
    #[inline(always)]
    pub const fn argument(index: u32) -> Self {
        Self::parameter(index + 1)
    }

    #[inline(always)]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> i32 {
        self.0
    }

    #[inline(always)]
    pub const fn is_local(self) -> bool {
        self.0 >= 0
    }

    #[inline(always)]
    pub const fn parameter_slot(self) -> Option<u32> {
        if self.0 < 0 {
            Some((-(self.0 + 1)) as u32)
        } else {
            None
        }
    }
}

impl core::fmt::Debug for Register {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.parameter_slot() {
            Some(0) => write!(f, "this"),
            Some(p) => write!(f, "arg{}", p - 1),
            None => write!(f, "r{}", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    LoadConstant { dst: Register, constant: u32 },
    /// Load a non-cell value (fixnum or immediate).
    LoadImmediate { dst: Register, value: Value },
    Move { dst: Register, src: Register },

    Add { dst: Register, lhs: Register, rhs: Register },
    Sub { dst: Register, lhs: Register, rhs: Register },
    Mul { dst: Register, lhs: Register, rhs: Register },
    Less { dst: Register, lhs: Register, rhs: Register },
    LessEq { dst: Register, lhs: Register, rhs: Register },
    StrictEq { dst: Register, lhs: Register, rhs: Register },
    Not { dst: Register, src: Register },

    Jump { target: u32 },
    JumpIfTrue { cond: Register, target: u32 },
    JumpIfFalse { cond: Register, target: u32 },
    /// Loop back-edge marker: watchdog tick and GC safepoint.
    LoopHint,

    NewObject { dst: Register },
    /// Close nested function `function` over the current scope.
    NewFunction { dst: Register, function: u32 },

    GetById { dst: Register, base: Register, name: u32, site: u32 },
    PutById { base: Register, name: u32, value: Register, site: u32 },
    PutGetterSetter { base: Register, name: u32, getter: Register, setter: Register },
    DeleteById { dst: Register, base: Register, name: u32 },
    GetByVal { dst: Register, base: Register, key: Register, site: u32 },
    PutByVal { base: Register, key: Register, value: Register, site: u32 },

    Resolve { dst: Register, name: u32, site: u32 },
    ResolveBase { dst: Register, name: u32, site: u32 },
    ResolveWithBase { base_dst: Register, dst: Register, name: u32, site: u32 },
    ResolveWithThis { this_dst: Register, dst: Register, name: u32, site: u32 },
    /// `site` is the put-to-base cache shared with the `ResolveBase`
    /// producing `base`.
    PutToBase { base: Register, name: u32, value: Register, site: u32 },
    /// Sloppy `eval` style declaration into the nearest variable object.
    DeclareVar { name: u32, value: Register },

    PushWithScope { object: Register },
    PushNameScope { name: u32, value: Register },
    PopScope,

    CreateActivation { dst: Register },
    CreateArguments { dst: Register },
    TearOffActivation { activation: Register },
    TearOffArguments { arguments: Register },

    /// `first_arg` holds `this`, followed by `argc` arguments.
    Call { dst: Register, callee: Register, first_arg: Register, argc: u32, site: u32 },
    Construct { dst: Register, callee: Register, first_arg: Register, argc: u32, site: u32 },
    Return { value: Register },

    Throw { value: Register },
    /// First instruction of a handler: receive the exception.
    Catch { dst: Register },

    /// Statement boundary for the debugger hook.
    Debug { line: u32 },
}

impl Instruction {
    /// Destination register written when a call returns to this
    /// instruction.
    pub fn call_destination(&self) -> Option<Register> {
        match *self {
            Instruction::Call { dst, .. } | Instruction::Construct { dst, .. } => Some(dst),
            _ => None,
        }
    }

    pub fn jump_target(&self) -> Option<u32> {
        match *self {
            Instruction::Jump { target }
            | Instruction::JumpIfTrue { target, .. }
            | Instruction::JumpIfFalse { target, .. } => Some(target),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_encoding() {
        assert_eq!(Register::this().raw(), -1);
        assert_eq!(Register::argument(0).raw(), -2);
        assert_eq!(Register::argument(1).parameter_slot(), Some(2));
        assert_eq!(Register::local(3).parameter_slot(), None);
        assert!(Register::local(0).is_local());
        assert_eq!(format!("{:?}", Register::argument(2)), "arg2");
    }
}
