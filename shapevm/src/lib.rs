mod arguments;
mod builder;
mod bytecode;
mod call_frame;
mod call_link;
mod code_block;
mod config;
mod debugger;
pub mod demos;
mod entry_point;
mod error;
mod heap;
mod identifier;
mod inline_cache;
mod interpreter;
mod object;
mod property;
mod property_access;
mod register_file;
mod resolve;
mod scope;
mod stack_trace;
mod structure;
mod unwind;
mod value;
mod vm;
mod watchdog;
mod watchpoint;

pub use arguments::{
    ArgumentsData, ArgumentsOverrides, ArgumentsStorage, SlowArgument, ValueRecovery,
};
pub use builder::CodeBlockBuilder;
pub use bytecode::{Instruction, Register};
pub use call_frame::{CallFrame, CallerLink, FrameRequest, HEADER_SIZE, HeaderEntry};
pub use call_link::{CallLinkInfo, CallLinkState, CalleeIdentity};
pub use code_block::{
    CodeBlock, CodeBlockId, CodeGenerator, CodeType, Constant, ExecutableId, FunctionExecutable,
    HandlerInfo, SiteCounts, UnlinkedCodeBlock, UnlinkedFunction,
};
pub use config::VMSettings;
pub use debugger::Debugger;
pub use entry_point::{
    ArityCheckMode, CallTarget, CodeSpecializationKind, JitBackend, NativeEntry,
};
pub use error::{
    CompileError, ErrorType, EvaluationError, Exception, ExceptionKind, SettingsError,
    StackOverflow, UncaughtException,
};
pub use heap::{Cell, CellId, GcStats, Heap, RootProvider};
pub use identifier::{CommonIdentifiers, Identifier, IdentifierTable};
pub use inline_cache::{
    ByValKey, ByValState, CacheCounters, GetByIdAccess, GetByIdCache, GetByIdState,
    GetByValCache, PutByIdAccess, PutByIdCache, PutByIdState, PutByValCache, PutHit,
    validate_chain,
};
pub use object::{FunctionData, GetterSetter, GlobalData, HostFn, JsObject, ObjectKind};
pub use property::{PropertyAttributes, PropertyEntry, PropertyOffset, PropertyTable};
pub use property_access::{LookupResult, PropertySlot, PutOutcome};
pub use register_file::RegisterFile;
pub use resolve::{PutToBaseOperation, ResolveCache, ResolveMode, ResolveOperation, Resolved};
pub use scope::{Activation, ActivationStorage, Scope, ScopeKind, SymbolTable, SymbolTableEntry};
pub use stack_trace::{StackFrame, StackFrameKind};
pub use structure::{
    DictionaryKind, ObjectClass, Structure, StructureChain, StructureFlags, StructureId,
    StructurePolicy, StructureTable,
};
pub use value::{FIXNUM_MAX, FIXNUM_MIN, Value};
pub use vm::{VM, VMStats};
pub use watchdog::{TerminationHandle, TerminationReason, Watchdog};
pub use watchpoint::{WatchpointSet, WatchpointState};
