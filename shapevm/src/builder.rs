//! Assembler for [`UnlinkedCodeBlock`]s.
//!
//! Stands in for the front end in tests, benches and the demo programs.

use std::rc::Rc;

use crate::{
    CodeGenerator, CodeType, Constant, HandlerInfo, Instruction, PropertyAttributes,
    Register, SiteCounts, UnlinkedCodeBlock, UnlinkedFunction, Value,
};

#[derive(Debug)]
pub struct CodeBlockBuilder {
    code: UnlinkedCodeBlock,
}

impl CodeBlockBuilder {
    fn new(name: &str, code_type: CodeType, parameter_count: u32) -> Self {
        Self {
            code: UnlinkedCodeBlock {
                name: name.to_string(),
                code_type,
                source_id: 0,
                strict: false,
                parameter_count,
                num_registers: 0,
                instructions: Vec::new(),
                constants: Vec::new(),
                identifiers: Vec::new(),
                functions: Vec::new(),
                handlers: Vec::new(),
                line_info: Vec::new(),
                variables: Vec::new(),
                activation_register: None,
                arguments_register: None,
                uses_eval: false,
                sites: SiteCounts::default(),
            },
        }
    }

    pub fn program(name: &str) -> Self {
        Self::new(name, CodeType::Global, 0)
    }

    pub fn function(name: &str, parameter_count: u32) -> Self {
        Self::new(name, CodeType::Function, parameter_count)
    }

    pub fn set_strict(&mut self) -> &mut Self {
        self.code.strict = true;
        self
    }

    pub fn set_source_id(&mut self, source_id: u32) -> &mut Self {
        self.code.source_id = source_id;
        self
    }

    pub fn set_uses_eval(&mut self) -> &mut Self {
        self.code.uses_eval = true;
        self
    }

    // ── Registers ──────────────────────────────────────────────────

    pub fn local(&mut self) -> Register {
        self.locals(1)
    }

    /// `count` consecutive locals; returns the first.
    pub fn locals(&mut self, count: u32) -> Register {
        let first = self.code.num_registers;
        self.code.num_registers += count;
        Register::local(first)
    }

    /// Local bound to `name` and visible to nested functions.
    pub fn captured_local(&mut self, name: &str) -> Register {
        let register = self.local();
        self.code
            .variables
            .push((name.to_string(), register.raw(), PropertyAttributes::DONT_DELETE));
        register
    }

    /// Name declared argument `index` for nested functions.
    pub fn captured_argument(&mut self, name: &str, index: u32) -> Register {
        let register = Register::argument(index);
        self.code
            .variables
            .push((name.to_string(), register.raw(), PropertyAttributes::DONT_DELETE));
        register
    }

    /// Declare a global variable (program code only).
    pub fn global_variable(&mut self, name: &str, attributes: PropertyAttributes) {
        let index = self.code.variables.len() as i32;
        self.code.variables.push((
            name.to_string(),
            index,
            attributes | PropertyAttributes::DONT_DELETE,
        ));
    }

    pub fn activation(&mut self) -> Register {
        let register = self.local();
        self.code.activation_register = Some(register);
        register
    }

    pub fn arguments(&mut self) -> Register {
        let register = self.local();
        self.code.arguments_register = Some(register);
        register
    }

    // ── Tables ─────────────────────────────────────────────────────

    pub fn constant(&mut self, constant: Constant) -> u32 {
        if let Some(i) = self.code.constants.iter().position(|c| *c == constant) {
            return i as u32;
        }
        self.code.constants.push(constant);
        (self.code.constants.len() - 1) as u32
    }

    pub fn identifier(&mut self, name: &str) -> u32 {
        if let Some(i) = self.code.identifiers.iter().position(|n| n == name) {
            return i as u32;
        }
        self.code.identifiers.push(name.to_string());
        (self.code.identifiers.len() - 1) as u32
    }

    pub fn nested(&mut self, code: UnlinkedCodeBlock) -> u32 {
        let name = code.name.clone();
        let parameter_count = code.parameter_count;
        self.function_with(&name, parameter_count, Rc::new(code))
    }

    pub fn function_with(
        &mut self,
        name: &str,
        parameter_count: u32,
        generator: Rc<dyn CodeGenerator>,
    ) -> u32 {
        self.code.functions.push(UnlinkedFunction {
            name: name.to_string(),
            parameter_count,
            generator,
        });
        (self.code.functions.len() - 1) as u32
    }

    pub fn handler(&mut self, start: u32, end: u32, target: u32, scope_depth: u32) {
        self.code.handlers.push(HandlerInfo {
            start,
            end,
            target,
            scope_depth,
        });
    }

    /// Source line of the next instruction.
    pub fn line(&mut self, line: u32) {
        let pc = self.pc();
        match self.code.line_info.last_mut() {
            Some(last) if last.0 == pc => last.1 = line,
            _ => self.code.line_info.push((pc, line)),
        }
    }

    // ── Instructions ───────────────────────────────────────────────

    pub fn pc(&self) -> u32 {
        self.code.instructions.len() as u32
    }

    pub fn emit(&mut self, instruction: Instruction) -> u32 {
        self.code.instructions.push(instruction);
        self.pc() - 1
    }

    /// Point the jump at `at` to `target`.
    pub fn patch_jump(&mut self, at: u32, target: u32) {
        match &mut self.code.instructions[at as usize] {
            Instruction::Jump { target: t }
            | Instruction::JumpIfTrue { target: t, .. }
            | Instruction::JumpIfFalse { target: t, .. } => *t = target,
            other => debug_assert!(false, "not a jump: {other:?}"),
        }
    }

    pub fn load_int(&mut self, dst: Register, n: i64) {
        self.emit(Instruction::LoadImmediate {
            dst,
            value: Value::from_i64(n),
        });
    }

    pub fn load_value(&mut self, dst: Register, value: Value) {
        self.emit(Instruction::LoadImmediate { dst, value });
    }

    pub fn load_string(&mut self, dst: Register, s: &str) {
        let constant = self.constant(Constant::String(s.to_string()));
        self.emit(Instruction::LoadConstant { dst, constant });
    }

    pub fn load_number(&mut self, dst: Register, n: f64) {
        let constant = self.constant(Constant::Number(n));
        self.emit(Instruction::LoadConstant { dst, constant });
    }

    pub fn new_function(&mut self, dst: Register, function: u32) {
        self.emit(Instruction::NewFunction { dst, function });
    }

    pub fn get_by_id(&mut self, dst: Register, base: Register, name: &str) -> u32 {
        let name = self.identifier(name);
        let site = bump(&mut self.code.sites.get_by_id);
        self.emit(Instruction::GetById { dst, base, name, site });
        site
    }

    pub fn put_by_id(&mut self, base: Register, name: &str, value: Register) -> u32 {
        let name = self.identifier(name);
        let site = bump(&mut self.code.sites.put_by_id);
        self.emit(Instruction::PutById { base, name, value, site });
        site
    }

    pub fn put_getter_setter(
        &mut self,
        base: Register,
        name: &str,
        getter: Register,
        setter: Register,
    ) {
        let name = self.identifier(name);
        self.emit(Instruction::PutGetterSetter {
            base,
            name,
            getter,
            setter,
        });
    }

    pub fn delete_by_id(&mut self, dst: Register, base: Register, name: &str) {
        let name = self.identifier(name);
        self.emit(Instruction::DeleteById { dst, base, name });
    }

    pub fn get_by_val(&mut self, dst: Register, base: Register, key: Register) -> u32 {
        let site = bump(&mut self.code.sites.get_by_val);
        self.emit(Instruction::GetByVal { dst, base, key, site });
        site
    }

    pub fn put_by_val(&mut self, base: Register, key: Register, value: Register) -> u32 {
        let site = bump(&mut self.code.sites.put_by_val);
        self.emit(Instruction::PutByVal {
            base,
            key,
            value,
            site,
        });
        site
    }

    pub fn resolve(&mut self, dst: Register, name: &str) -> u32 {
        let name = self.identifier(name);
        let site = bump(&mut self.code.sites.resolve);
        self.emit(Instruction::Resolve { dst, name, site });
        site
    }

    /// Emits a `ResolveBase`; the returned site pairs it with
    /// [`put_to_base`](Self::put_to_base).
    pub fn resolve_base(&mut self, dst: Register, name: &str) -> u32 {
        let name = self.identifier(name);
        let site = bump(&mut self.code.sites.resolve);
        self.code.sites.put_to_base = self.code.sites.put_to_base.max(site + 1);
        self.emit(Instruction::ResolveBase { dst, name, site });
        site
    }

    pub fn put_to_base(&mut self, base: Register, name: &str, value: Register, site: u32) {
        let name = self.identifier(name);
        self.code.sites.put_to_base = self.code.sites.put_to_base.max(site + 1);
        self.emit(Instruction::PutToBase {
            base,
            name,
            value,
            site,
        });
    }

    /// Resolve `name` and assign `value` to it.
    pub fn assign(&mut self, name: &str, value: Register) {
        let base = self.local();
        let site = self.resolve_base(base, name);
        self.put_to_base(base, name, value, site);
    }

    pub fn resolve_with_base(&mut self, base_dst: Register, dst: Register, name: &str) -> u32 {
        let name = self.identifier(name);
        let site = bump(&mut self.code.sites.resolve);
        self.emit(Instruction::ResolveWithBase {
            base_dst,
            dst,
            name,
            site,
        });
        site
    }

    pub fn resolve_with_this(&mut self, this_dst: Register, dst: Register, name: &str) -> u32 {
        let name = self.identifier(name);
        let site = bump(&mut self.code.sites.resolve);
        self.emit(Instruction::ResolveWithThis {
            this_dst,
            dst,
            name,
            site,
        });
        site
    }

    pub fn declare_var(&mut self, name: &str, value: Register) {
        let name = self.identifier(name);
        self.emit(Instruction::DeclareVar { name, value });
    }

    pub fn push_name_scope(&mut self, name: &str, value: Register) {
        let name = self.identifier(name);
        self.emit(Instruction::PushNameScope { name, value });
    }

    /// `first_arg` holds `this` followed by `argc` arguments. The callee
    /// frame is laid out on top of that window, so registers allocated
    /// after it do not survive the call.
    pub fn call(&mut self, dst: Register, callee: Register, first_arg: Register, argc: u32) -> u32 {
        let site = bump(&mut self.code.sites.call);
        self.emit(Instruction::Call {
            dst,
            callee,
            first_arg,
            argc,
            site,
        });
        site
    }

    pub fn construct(
        &mut self,
        dst: Register,
        callee: Register,
        first_arg: Register,
        argc: u32,
    ) -> u32 {
        let site = bump(&mut self.code.sites.call);
        self.emit(Instruction::Construct {
            dst,
            callee,
            first_arg,
            argc,
            site,
        });
        site
    }

    pub fn ret(&mut self, value: Register) {
        self.emit(Instruction::Return { value });
    }

    pub fn finish(self) -> UnlinkedCodeBlock {
        self.code
    }
}

fn bump(counter: &mut u32) -> u32 {
    *counter += 1;
    *counter - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sites_are_numbered_per_kind() {
        let mut builder = CodeBlockBuilder::function("f", 1);
        let r = builder.locals(3);
        assert_eq!(builder.get_by_id(r, Register::argument(0), "x"), 0);
        assert_eq!(builder.get_by_id(r, Register::argument(0), "y"), 1);
        assert_eq!(builder.put_by_id(r, "x", r), 0);
        let site = builder.resolve_base(r, "g");
        builder.put_to_base(r, "g", r, site);
        let code = builder.finish();
        assert_eq!(code.sites.get_by_id, 2);
        assert_eq!(code.sites.put_by_id, 1);
        assert_eq!(code.sites.put_to_base, 1);
        assert_eq!(code.identifiers, vec!["x", "y", "g"]);
        assert_eq!(code.num_registers, 3);
    }

    #[test]
    fn jumps_can_be_patched() {
        let mut builder = CodeBlockBuilder::function("f", 0);
        let r = builder.local();
        let jump = builder.emit(Instruction::JumpIfFalse { cond: r, target: 0 });
        builder.ret(r);
        let end = builder.pc();
        builder.patch_jump(jump, end);
        let code = builder.finish();
        assert_eq!(code.instructions[0].jump_target(), Some(2));
    }
}
