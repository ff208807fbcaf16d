//! Interface to compiled code.
//!
//! The engine never looks inside compiled code. A [`JitBackend`] either
//! hands out a [`NativeEntry`] for a code block or declines, in which case
//! the bytecode loop runs it.

use crate::{CallFrame, CodeBlock, Exception, Value, VM};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeSpecializationKind {
    Call,
    Construct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArityCheckMode {
    ArityCheckNotRequired,
    MustCheckArity,
}

impl ArityCheckMode {
    pub fn for_call(argument_count: usize, parameter_count: usize) -> Self {
        if argument_count < parameter_count {
            ArityCheckMode::MustCheckArity
        } else {
            ArityCheckMode::ArityCheckNotRequired
        }
    }
}

/// Compiled body of a code block. Runs inside the frame the engine pushed
/// for it and returns the completion value.
pub type NativeEntry = fn(&mut VM, CallFrame) -> Result<Value, Exception>;

pub trait JitBackend {
    fn name(&self) -> &str;

    /// Entry point for `code_block`, or `None` to interpret it.
    fn entry_for(
        &mut self,
        code_block: &CodeBlock,
        kind: CodeSpecializationKind,
        arity: ArityCheckMode,
    ) -> Option<NativeEntry>;
}

/// How a linked call site reaches its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    Interpreted {
        code_block: crate::CodeBlockId,
        arity: ArityCheckMode,
    },
    Native {
        code_block: crate::CodeBlockId,
        entry: NativeEntry,
        arity: ArityCheckMode,
    },
    Host,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_mode_depends_on_missing_parameters() {
        assert_eq!(ArityCheckMode::for_call(1, 2), ArityCheckMode::MustCheckArity);
        assert_eq!(ArityCheckMode::for_call(2, 2), ArityCheckMode::ArityCheckNotRequired);
        assert_eq!(ArityCheckMode::for_call(3, 2), ArityCheckMode::ArityCheckNotRequired);
    }
}
