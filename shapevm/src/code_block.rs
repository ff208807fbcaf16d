//! Code units: what the front end hands over, and the linked form the
//! interpreter executes.

use std::rc::Rc;

use crate::{
    CallLinkInfo, CodeSpecializationKind, CompileError, GetByIdCache, GetByValCache,
    Identifier, Instruction, PropertyAttributes, PutByIdCache, PutByValCache,
    PutToBaseOperation, Register, ResolveCache, SymbolTable, SymbolTableEntry, Value, VM,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeBlockId(u32);

impl CodeBlockId {
    #[inline(always)]
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    #[inline(always)]
    pub const fn index(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutableId(u32);

impl ExecutableId {
    #[inline(always)]
    pub const fn index(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeType {
    Global,
    Function,
    Eval,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Number(f64),
    String(String),
    /// A fixnum or immediate.
    Immediate(Value),
}

/// Exception handler covering `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerInfo {
    pub start: u32,
    pub end: u32,
    pub target: u32,
    /// Scopes pushed inside the frame when control reaches `target`.
    pub scope_depth: u32,
}

/// Number of cache slots per instruction kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiteCounts {
    pub get_by_id: u32,
    pub put_by_id: u32,
    pub get_by_val: u32,
    pub put_by_val: u32,
    pub resolve: u32,
    pub put_to_base: u32,
    pub call: u32,
}

/// Produces code for a function on first call.
pub trait CodeGenerator {
    fn generate(&self) -> Result<UnlinkedCodeBlock, CompileError>;
}

impl CodeGenerator for UnlinkedCodeBlock {
    fn generate(&self) -> Result<UnlinkedCodeBlock, CompileError> {
        Ok(self.clone())
    }
}

impl<F> CodeGenerator for F
where
    F: Fn() -> Result<UnlinkedCodeBlock, CompileError>,
{
    fn generate(&self) -> Result<UnlinkedCodeBlock, CompileError> {
        self()
    }
}

#[derive(Clone)]
pub struct UnlinkedFunction {
    pub name: String,
    pub parameter_count: u32,
    pub generator: Rc<dyn CodeGenerator>,
}

impl core::fmt::Debug for UnlinkedFunction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UnlinkedFunction")
            .field("name", &self.name)
            .field("parameter_count", &self.parameter_count)
            .finish()
    }
}

/// A code unit as produced by the front end.
#[derive(Debug, Clone)]
pub struct UnlinkedCodeBlock {
    pub name: String,
    pub code_type: CodeType,
    pub source_id: u32,
    pub strict: bool,
    pub parameter_count: u32,
    pub num_registers: u32,
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub identifiers: Vec<String>,
    pub functions: Vec<UnlinkedFunction>,
    pub handlers: Vec<HandlerInfo>,
    /// `(pc, line)` pairs sorted by pc.
    pub line_info: Vec<(u32, u32)>,
    /// Heap-visible bindings: closed-over locals and parameters, or the
    /// declared variables of global code.
    pub variables: Vec<(String, i32, PropertyAttributes)>,
    pub activation_register: Option<Register>,
    pub arguments_register: Option<Register>,
    pub uses_eval: bool,
    pub sites: SiteCounts,
}

/// A linked, executable code unit with its per-site caches.
#[derive(Debug)]
pub struct CodeBlock {
    pub id: CodeBlockId,
    pub name: Identifier,
    pub code_type: CodeType,
    pub source_id: u32,
    pub strict: bool,
    pub parameter_count: usize,
    pub num_registers: usize,
    pub instructions: Box<[Instruction]>,
    pub constants: Box<[Value]>,
    pub identifiers: Box<[Identifier]>,
    pub functions: Box<[ExecutableId]>,
    pub handlers: Box<[HandlerInfo]>,
    pub line_info: Box<[(u32, u32)]>,
    pub symbol_table: Rc<SymbolTable>,
    pub activation_register: Option<Register>,
    pub arguments_register: Option<Register>,

    pub get_by_id: Vec<GetByIdCache>,
    pub put_by_id: Vec<PutByIdCache>,
    pub get_by_val: Vec<GetByValCache>,
    pub put_by_val: Vec<PutByValCache>,
    pub resolve: Vec<ResolveCache>,
    pub put_to_base: Vec<PutToBaseOperation>,
    pub calls: Vec<CallLinkInfo>,
    pub execution_count: u64,
}

impl CodeBlock {
    #[inline]
    pub fn needs_activation(&self) -> bool {
        self.activation_register.is_some()
    }

    /// Innermost handler covering `pc`.
    pub fn handler_for(&self, pc: usize) -> Option<HandlerInfo> {
        let pc = pc as u32;
        self.handlers
            .iter()
            .filter(|h| h.start <= pc && pc < h.end)
            .min_by_key(|h| h.end - h.start)
            .copied()
    }

    pub fn line_for(&self, pc: usize) -> Option<u32> {
        let pc = pc as u32;
        match self.line_info.binary_search_by_key(&pc, |&(p, _)| p) {
            Ok(i) => Some(self.line_info[i].1),
            Err(0) => None,
            Err(i) => Some(self.line_info[i - 1].1),
        }
    }
}

/// A function body shared by every closure created from it.
pub struct FunctionExecutable {
    pub name: Identifier,
    pub parameter_count: u32,
    generator: Rc<dyn CodeGenerator>,
    code_block: Option<CodeBlockId>,
    pub compile_failures: u32,
}

impl FunctionExecutable {
    #[inline]
    pub fn code_block(&self) -> Option<CodeBlockId> {
        self.code_block
    }

    pub fn is_compiled(&self) -> bool {
        self.code_block.is_some()
    }
}

impl core::fmt::Debug for FunctionExecutable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FunctionExecutable")
            .field("name", &self.name)
            .field("parameter_count", &self.parameter_count)
            .field("code_block", &self.code_block)
            .finish()
    }
}

fn validate(unlinked: &UnlinkedCodeBlock) -> Result<(), CompileError> {
    let function = || unlinked.name.clone();
    let len = unlinked.instructions.len() as u32;
    let registers = unlinked.num_registers as i32;
    let parameters = unlinked.parameter_count as i32;

    let check_register = |r: Register| -> Result<(), CompileError> {
        let ok = match r.parameter_slot() {
            None => r.raw() < registers,
            Some(slot) => slot as i32 <= parameters,
        };
        if ok {
            Ok(())
        } else {
            Err(CompileError::InvalidRegister {
                function: function(),
                register: r.raw(),
            })
        }
    };
    let check = |what: &'static str, index: u32, bound: usize| -> Result<(), CompileError> {
        if (index as usize) < bound {
            Ok(())
        } else {
            Err(CompileError::InvalidOperand {
                function: function(),
                what,
                index,
            })
        }
    };
    let names = unlinked.identifiers.len();
    let sites = unlinked.sites;

    for instruction in &unlinked.instructions {
        if let Some(target) = instruction.jump_target()
            && target >= len
        {
            return Err(CompileError::InvalidTarget {
                function: function(),
                target,
            });
        }
        use Instruction::*;
        match *instruction {
            LoadConstant { dst, constant } => {
                check_register(dst)?;
                check("constant", constant, unlinked.constants.len())?;
            }
            LoadImmediate { dst, value } => {
                check_register(dst)?;
                if value.is_ref() {
                    return Err(CompileError::Rejected {
                        function: function(),
                        reason: "cell immediate".into(),
                    });
                }
            }
            Move { dst, src } | Not { dst, src } => {
                check_register(dst)?;
                check_register(src)?;
            }
            Add { dst, lhs, rhs }
            | Sub { dst, lhs, rhs }
            | Mul { dst, lhs, rhs }
            | Less { dst, lhs, rhs }
            | LessEq { dst, lhs, rhs }
            | StrictEq { dst, lhs, rhs } => {
                check_register(dst)?;
                check_register(lhs)?;
                check_register(rhs)?;
            }
            Jump { .. } | LoopHint | PopScope | Debug { .. } => {}
            JumpIfTrue { cond, .. } | JumpIfFalse { cond, .. } => check_register(cond)?,
            NewObject { dst } | CreateActivation { dst } | CreateArguments { dst } | Catch { dst } => {
                check_register(dst)?
            }
            NewFunction { dst, function: f } => {
                check_register(dst)?;
                check("function", f, unlinked.functions.len())?;
            }
            GetById { dst, base, name, site } => {
                check_register(dst)?;
                check_register(base)?;
                check("identifier", name, names)?;
                check("get_by_id site", site, sites.get_by_id as usize)?;
            }
            PutById { base, name, value, site } => {
                check_register(base)?;
                check_register(value)?;
                check("identifier", name, names)?;
                check("put_by_id site", site, sites.put_by_id as usize)?;
            }
            PutGetterSetter { base, name, getter, setter } => {
                check_register(base)?;
                check_register(getter)?;
                check_register(setter)?;
                check("identifier", name, names)?;
            }
            DeleteById { dst, base, name } => {
                check_register(dst)?;
                check_register(base)?;
                check("identifier", name, names)?;
            }
            GetByVal { dst, base, key, site } => {
                check_register(dst)?;
                check_register(base)?;
                check_register(key)?;
                check("get_by_val site", site, sites.get_by_val as usize)?;
            }
            PutByVal { base, key, value, site } => {
                check_register(base)?;
                check_register(key)?;
                check_register(value)?;
                check("put_by_val site", site, sites.put_by_val as usize)?;
            }
            Resolve { dst, name, site } | ResolveBase { dst, name, site } => {
                check_register(dst)?;
                check("identifier", name, names)?;
                check("resolve site", site, sites.resolve as usize)?;
                if matches!(instruction, ResolveBase { .. }) {
                    check("put_to_base site", site, sites.put_to_base as usize)?;
                }
            }
            ResolveWithBase { base_dst: a, dst, name, site }
            | ResolveWithThis { this_dst: a, dst, name, site } => {
                check_register(a)?;
                check_register(dst)?;
                check("identifier", name, names)?;
                check("resolve site", site, sites.resolve as usize)?;
            }
            PutToBase { base, name, value, site } => {
                check_register(base)?;
                check_register(value)?;
                check("identifier", name, names)?;
                check("put_to_base site", site, sites.put_to_base as usize)?;
            }
            DeclareVar { name, value } => {
                check_register(value)?;
                check("identifier", name, names)?;
            }
            PushWithScope { object } => check_register(object)?,
            PushNameScope { name, value } => {
                check_register(value)?;
                check("identifier", name, names)?;
            }
            TearOffActivation { activation: r } | TearOffArguments { arguments: r } => {
                check_register(r)?
            }
            Call { dst, callee, first_arg, argc, site }
            | Construct { dst, callee, first_arg, argc, site } => {
                check_register(dst)?;
                check_register(callee)?;
                check_register(first_arg)?;
                if first_arg.is_local() && first_arg.raw() + argc as i32 >= registers {
                    return Err(CompileError::InvalidRegister {
                        function: function(),
                        register: first_arg.raw() + argc as i32,
                    });
                }
                check("call site", site, sites.call as usize)?;
            }
            Return { value } | Throw { value } => check_register(value)?,
        }
    }

    for handler in &unlinked.handlers {
        if handler.start > handler.end || handler.end > len || handler.target >= len {
            return Err(CompileError::InvalidTarget {
                function: function(),
                target: handler.target,
            });
        }
    }
    for register in [unlinked.activation_register, unlinked.arguments_register]
        .into_iter()
        .flatten()
    {
        check_register(register)?;
    }
    Ok(())
}

impl VM {
    /// Link `unlinked` into this VM: intern names, allocate constants,
    /// register nested functions and create empty caches.
    pub fn link_code_block(
        &mut self,
        unlinked: &UnlinkedCodeBlock,
    ) -> Result<CodeBlockId, CompileError> {
        validate(unlinked)?;

        let constants: Box<[Value]> = unlinked
            .constants
            .iter()
            .map(|constant| match constant {
                Constant::Immediate(value) => *value,
                Constant::Number(n) => self.number_value(*n),
                Constant::String(s) => self.heap.allocate_string(s),
            })
            .collect();
        let identifiers: Box<[Identifier]> = unlinked
            .identifiers
            .iter()
            .map(|name| self.identifiers.add(name))
            .collect();
        let functions: Box<[ExecutableId]> = unlinked
            .functions
            .iter()
            .map(|function| self.create_executable(function))
            .collect();

        let mut symbol_table = SymbolTable::new();
        symbol_table.uses_non_strict_eval = unlinked.uses_eval && !unlinked.strict;
        if unlinked.code_type != CodeType::Global {
            for (name, index, attributes) in &unlinked.variables {
                symbol_table.add(
                    self.identifiers.add(name),
                    SymbolTableEntry::new(*index, *attributes),
                );
            }
        }

        let sites = unlinked.sites;
        let poly = self.settings.poly_cache_size;
        let id = CodeBlockId(self.code_blocks.len() as u32);
        let mut code_block = CodeBlock {
            id,
            name: self.identifiers.add(&unlinked.name),
            code_type: unlinked.code_type,
            source_id: unlinked.source_id,
            strict: unlinked.strict,
            parameter_count: unlinked.parameter_count as usize,
            num_registers: unlinked.num_registers as usize,
            instructions: unlinked.instructions.clone().into_boxed_slice(),
            constants,
            identifiers,
            functions,
            handlers: unlinked.handlers.clone().into_boxed_slice(),
            line_info: unlinked.line_info.clone().into_boxed_slice(),
            symbol_table: Rc::new(symbol_table),
            activation_register: unlinked.activation_register,
            arguments_register: unlinked.arguments_register,
            get_by_id: (0..sites.get_by_id).map(|_| GetByIdCache::new(poly)).collect(),
            put_by_id: (0..sites.put_by_id).map(|_| PutByIdCache::new(poly)).collect(),
            get_by_val: (0..sites.get_by_val).map(|_| GetByValCache::new(poly)).collect(),
            put_by_val: (0..sites.put_by_val).map(|_| PutByValCache::new(poly)).collect(),
            resolve: (0..sites.resolve).map(|_| ResolveCache::default()).collect(),
            put_to_base: vec![PutToBaseOperation::Uninitialised; sites.put_to_base as usize],
            calls: (0..sites.call).map(|_| CallLinkInfo::new(CodeSpecializationKind::Call)).collect(),
            execution_count: 0,
        };
        for instruction in code_block.instructions.iter() {
            if let Instruction::Construct { site, .. } = *instruction
                && let Some(info) = code_block.calls.get_mut(site as usize)
            {
                *info = CallLinkInfo::new(CodeSpecializationKind::Construct);
            }
        }

        if unlinked.code_type == CodeType::Global {
            for (name, _, attributes) in &unlinked.variables {
                let name = self.identifiers.add(name);
                self.declare_global_variable(name, *attributes);
            }
        }

        log::debug!(
            "linked code block {} `{}`: {} instructions, {} registers",
            id.0,
            unlinked.name,
            code_block.instructions.len(),
            code_block.num_registers
        );
        self.code_blocks.push(code_block);
        Ok(id)
    }

    fn create_executable(&mut self, function: &UnlinkedFunction) -> ExecutableId {
        let id = ExecutableId(self.executables.len() as u32);
        self.executables.push(FunctionExecutable {
            name: self.identifiers.add(&function.name),
            parameter_count: function.parameter_count,
            generator: function.generator.clone(),
            code_block: None,
            compile_failures: 0,
        });
        id
    }

    /// Code block of `executable`, compiling it on first use.
    pub fn code_block_for(
        &mut self,
        executable: ExecutableId,
    ) -> Result<CodeBlockId, CompileError> {
        let entry = &self.executables[executable.0 as usize];
        if let Some(code_block) = entry.code_block {
            return Ok(code_block);
        }
        let generator = entry.generator.clone();
        let unlinked = match generator.generate() {
            Ok(unlinked) => unlinked,
            Err(e) => {
                self.executables[executable.0 as usize].compile_failures += 1;
                log::warn!("lazy compilation failed: {e}");
                return Err(e);
            }
        };
        let code_block = match self.link_code_block(&unlinked) {
            Ok(code_block) => code_block,
            Err(e) => {
                self.executables[executable.0 as usize].compile_failures += 1;
                log::warn!("lazy compilation failed: {e}");
                return Err(e);
            }
        };
        self.executables[executable.0 as usize].code_block = Some(code_block);
        Ok(code_block)
    }

    #[inline]
    pub fn code_block(&self, id: CodeBlockId) -> &CodeBlock {
        &self.code_blocks[id.0 as usize]
    }

    #[inline]
    pub fn code_block_mut(&mut self, id: CodeBlockId) -> &mut CodeBlock {
        &mut self.code_blocks[id.0 as usize]
    }

    #[inline]
    pub fn executable(&self, id: ExecutableId) -> &FunctionExecutable {
        &self.executables[id.0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CodeBlockBuilder, VMSettings};

    #[test]
    fn handler_lookup_prefers_innermost() {
        let mut builder = CodeBlockBuilder::function("f", 0);
        let r = builder.local();
        for _ in 0..6 {
            builder.emit(Instruction::LoadImmediate { dst: r, value: Value::NULL });
        }
        builder.emit(Instruction::Return { value: r });
        builder.handler(0, 6, 5, 0);
        builder.handler(2, 4, 4, 1);
        let mut vm = VM::new(VMSettings::default()).unwrap();
        let id = vm.link_code_block(&builder.finish()).unwrap();
        let code_block = vm.code_block(id);
        assert_eq!(code_block.handler_for(3).map(|h| h.target), Some(4));
        assert_eq!(code_block.handler_for(1).map(|h| h.target), Some(5));
        assert_eq!(code_block.handler_for(6), None);
    }

    #[test]
    fn line_lookup_uses_preceding_entry() {
        let mut builder = CodeBlockBuilder::function("f", 0);
        let r = builder.local();
        builder.line(10);
        builder.emit(Instruction::LoadImmediate { dst: r, value: Value::NULL });
        builder.line(12);
        builder.emit(Instruction::Move { dst: r, src: r });
        builder.emit(Instruction::Return { value: r });
        let mut vm = VM::new(VMSettings::default()).unwrap();
        let id = vm.link_code_block(&builder.finish()).unwrap();
        assert_eq!(vm.code_block(id).line_for(0), Some(10));
        assert_eq!(vm.code_block(id).line_for(2), Some(12));
    }

    #[test]
    fn bad_jump_targets_are_rejected() {
        let mut builder = CodeBlockBuilder::function("broken", 0);
        builder.emit(Instruction::Jump { target: 99 });
        let mut vm = VM::new(VMSettings::default()).unwrap();
        let err = vm.link_code_block(&builder.finish()).unwrap_err();
        assert!(matches!(err, CompileError::InvalidTarget { target: 99, .. }));
    }

    #[test]
    fn lazy_compilation_failure_is_reported() {
        let mut builder = CodeBlockBuilder::program("main");
        builder.function_with(
            "bad",
            0,
            Rc::new(|| -> Result<UnlinkedCodeBlock, CompileError> {
                Err(CompileError::Rejected {
                    function: "bad".into(),
                    reason: "unsupported".into(),
                })
            }),
        );
        let mut vm = VM::new(VMSettings::default()).unwrap();
        let id = vm.link_code_block(&builder.finish()).unwrap();
        let executable = vm.code_block(id).functions[0];
        assert!(vm.code_block_for(executable).is_err());
        assert_eq!(vm.executable(executable).compile_failures, 1);
        assert!(!vm.executable(executable).is_compiled());
    }
}
