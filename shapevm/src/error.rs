use std::fmt;

use crate::Value;

/// Class of a script-visible error object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    Error,
    TypeError,
    ReferenceError,
    RangeError,
    SyntaxError,
}

impl ErrorType {
    pub const ALL: [ErrorType; 5] = [
        ErrorType::Error,
        ErrorType::TypeError,
        ErrorType::ReferenceError,
        ErrorType::RangeError,
        ErrorType::SyntaxError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ErrorType::Error => "Error",
            ErrorType::TypeError => "TypeError",
            ErrorType::ReferenceError => "ReferenceError",
            ErrorType::RangeError => "RangeError",
            ErrorType::SyntaxError => "SyntaxError",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    Normal,
    /// Forced stop requested by the host. Script handlers never see it.
    Termination,
}

/// A value in flight through the unwinder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception {
    pub value: Value,
    pub kind: ExceptionKind,
}

impl Exception {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            kind: ExceptionKind::Normal,
        }
    }

    pub fn termination(value: Value) -> Self {
        Self {
            value,
            kind: ExceptionKind::Termination,
        }
    }

    #[inline]
    pub fn is_termination(&self) -> bool {
        self.kind == ExceptionKind::Termination
    }
}

/// The register file could not grow to the requested extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackOverflow {
    pub requested: usize,
    pub capacity: usize,
}

impl fmt::Display for StackOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stack overflow: {} slots requested, {} reserved",
            self.requested, self.capacity
        )
    }
}

impl std::error::Error for StackOverflow {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// A jump or handler points outside the instruction stream.
    InvalidTarget { function: String, target: u32 },
    /// A register operand exceeds the declared register count.
    InvalidRegister { function: String, register: i32 },
    /// An operand indexes past a constant/identifier/function table.
    InvalidOperand { function: String, what: &'static str, index: u32 },
    /// The front end refused to produce code.
    Rejected { function: String, reason: String },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::InvalidTarget { function, target } => {
                write!(f, "{function}: jump target {target} out of range")
            }
            CompileError::InvalidRegister { function, register } => {
                write!(f, "{function}: register {register} out of range")
            }
            CompileError::InvalidOperand {
                function,
                what,
                index,
            } => write!(f, "{function}: {what} index {index} out of range"),
            CompileError::Rejected { function, reason } => {
                write!(f, "{function}: {reason}")
            }
        }
    }
}

impl std::error::Error for CompileError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    ZeroSize(&'static str),
    SegmentMismatch { capacity: usize, segment: usize },
    OutOfRange { name: &'static str, value: u64 },
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::ZeroSize(what) => write!(f, "{what} must be > 0"),
            SettingsError::SegmentMismatch { capacity, segment } => write!(
                f,
                "register file capacity {capacity} is not a multiple of segment size {segment}"
            ),
            SettingsError::OutOfRange { name, value } => {
                write!(f, "{name} = {value} is out of range")
            }
        }
    }
}

impl std::error::Error for SettingsError {}

/// An exception that unwound every frame of a top-level evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UncaughtException {
    pub value: Value,
    pub frames_unwound: usize,
    pub terminated: bool,
}

impl fmt::Display for UncaughtException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terminated {
            write!(f, "execution terminated after unwinding {} frames", self.frames_unwound)
        } else {
            write!(
                f,
                "uncaught exception {:?} after unwinding {} frames",
                self.value, self.frames_unwound
            )
        }
    }
}

impl std::error::Error for UncaughtException {}

/// Failure of [`VM::evaluate`](crate::VM::evaluate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    Compile(CompileError),
    Uncaught(UncaughtException),
}

impl fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluationError::Compile(e) => write!(f, "compile error: {e}"),
            EvaluationError::Uncaught(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EvaluationError {}

impl From<CompileError> for EvaluationError {
    fn from(e: CompileError) -> Self {
        EvaluationError::Compile(e)
    }
}

impl From<UncaughtException> for EvaluationError {
    fn from(e: UncaughtException) -> Self {
        EvaluationError::Uncaught(e)
    }
}
