//! Walking the register file for stack traces.

use std::fmt;

use crate::{CallFrame, CodeType, FunctionData, VM};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackFrameKind {
    Global,
    Function,
    Eval,
    Host,
}

/// One entry of a captured stack, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub function_name: String,
    pub source_id: u32,
    pub line: Option<u32>,
    pub bytecode_offset: usize,
    pub kind: StackFrameKind,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.kind {
            StackFrameKind::Global => "<global>",
            StackFrameKind::Eval => "<eval>",
            _ => self.function_name.as_str(),
        };
        match (self.kind, self.line) {
            (StackFrameKind::Host, _) => write!(f, "at {name} [host]"),
            (_, Some(line)) => write!(f, "at {name} ({}:{line})", self.source_id),
            (_, None) => write!(f, "at {name} ({}@{})", self.source_id, self.bytecode_offset),
        }
    }
}

impl VM {
    /// Stack of the code running right now.
    pub fn stack_trace(&self) -> Vec<StackFrame> {
        match self.top_call_frame {
            Some(frame) => self.stack_trace_from(frame, self.current_pc),
            None => Vec::new(),
        }
    }

    /// Stack starting at `frame`, suspended at `pc`. Host boundaries are
    /// crossed.
    pub(crate) fn stack_trace_from(&self, frame: CallFrame, pc: usize) -> Vec<StackFrame> {
        let mut frames = Vec::new();
        let mut current = Some((frame, pc));
        while let Some((frame, pc)) = current {
            frames.push(self.describe_frame(frame, pc));
            let return_pc = frame.return_pc(&self.register_file);
            current = frame
                .caller_frame(&self.register_file)
                .map(|caller| (caller, return_pc));
        }
        frames
    }

    fn describe_frame(&self, frame: CallFrame, pc: usize) -> StackFrame {
        let Some(code_block) = frame.code_block(&self.register_file) else {
            let function_name = match self.function_data(frame.callee(&self.register_file)) {
                Some(FunctionData::Host { name, .. }) => self.identifiers.name(name).to_string(),
                _ => String::from("<native>"),
            };
            return StackFrame {
                function_name,
                source_id: 0,
                line: None,
                bytecode_offset: 0,
                kind: StackFrameKind::Host,
            };
        };
        let code = self.code_block(code_block);
        let kind = match code.code_type {
            CodeType::Global => StackFrameKind::Global,
            CodeType::Function => StackFrameKind::Function,
            CodeType::Eval => StackFrameKind::Eval,
        };
        StackFrame {
            function_name: self.identifiers.name(code.name).to_string(),
            source_id: code.source_id,
            line: code.line_for(pc),
            bytecode_offset: pc,
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_render_by_kind() {
        let frame = StackFrame {
            function_name: "inner".into(),
            source_id: 2,
            line: Some(14),
            bytecode_offset: 5,
            kind: StackFrameKind::Function,
        };
        assert_eq!(frame.to_string(), "at inner (2:14)");
        let global = StackFrame {
            line: None,
            kind: StackFrameKind::Global,
            ..frame.clone()
        };
        assert_eq!(global.to_string(), "at <global> (2@5)");
        let host = StackFrame {
            function_name: "print".into(),
            kind: StackFrameKind::Host,
            ..frame
        };
        assert_eq!(host.to_string(), "at print [host]");
    }
}
