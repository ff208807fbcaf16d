//! The bytecode loop and the call protocol.
//!
//! Script-to-script calls never recurse on the native stack: the loop
//! pushes the callee's frame and keeps going. Host functions run natively
//! and re-enter through [`VM::call_function`], which starts a nested loop
//! that stops at the frame it was entered with.

use std::{
    cmp::Ordering,
    ops::{Deref, DerefMut},
};

use crate::{
    ArityCheckMode, CallFrame, CallLinkInfo, CallTarget, CalleeIdentity, CallerLink, CellId,
    CodeBlockId, CodeSpecializationKind, ErrorType, EvaluationError, Exception, ExecutableId,
    FrameRequest, FunctionData, HostFn, Identifier, Instruction, JsObject, PropertyAttributes,
    Register, ResolveMode, ScopeKind, StackOverflow, UncaughtException, UnlinkedCodeBlock,
    Value, VM,
};

/// Where the loop is: the running frame, its code and the next
/// instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExecState {
    pub frame: CallFrame,
    pub code_block: CodeBlockId,
    pub pc: usize,
}

enum Step {
    Continue,
    /// The frame the loop was entered with returned.
    Return(Value),
}

enum CallOutcome {
    /// A bytecode frame was pushed; continue there.
    Enter(ExecState),
    /// The callee ran to completion natively.
    Returned(Value),
}

/// Holds the VM for one nested evaluation and puts the native-stack state
/// back when dropped.
struct ReentryGuard<'a> {
    vm: &'a mut VM,
    top_call_frame: Option<CallFrame>,
    current_pc: usize,
    register_end: usize,
}

impl<'a> ReentryGuard<'a> {
    fn enter(vm: &'a mut VM) -> Result<Self, Exception> {
        if vm.reentry_depth >= vm.settings.max_reentry_depth {
            log::warn!("re-entry depth {} exceeded", vm.reentry_depth);
            return Err(vm.throw_error(ErrorType::RangeError, "Maximum call stack size exceeded"));
        }
        if vm.reentry_depth == 0 {
            vm.watchdog.start();
        }
        vm.reentry_depth += 1;
        Ok(Self {
            top_call_frame: vm.top_call_frame,
            current_pc: vm.current_pc,
            register_end: vm.register_file.end(),
            vm,
        })
    }
}

impl Deref for ReentryGuard<'_> {
    type Target = VM;

    fn deref(&self) -> &VM {
        self.vm
    }
}

impl DerefMut for ReentryGuard<'_> {
    fn deref_mut(&mut self) -> &mut VM {
        self.vm
    }
}

impl Drop for ReentryGuard<'_> {
    fn drop(&mut self) {
        self.vm.reentry_depth -= 1;
        self.vm.top_call_frame = self.top_call_frame;
        self.vm.current_pc = self.current_pc;
        if self.vm.register_file.end() > self.register_end {
            self.vm.register_file.shrink(self.register_end);
        }
    }
}

impl VM {
    // ── Entry points ───────────────────────────────────────────────

    /// Link and run program code.
    pub fn evaluate(&mut self, code: &UnlinkedCodeBlock) -> Result<Value, EvaluationError> {
        let code_block = self.link_code_block(code)?;
        Ok(self.run_program(code_block)?)
    }

    /// Run linked program code with the global object as `this`.
    pub fn run_program(&mut self, code_block: CodeBlockId) -> Result<Value, UncaughtException> {
        let this = Value::from_cell(self.global_object);
        let scope = self.global_scope;
        let mut escaped = None;
        let result = self.reentrant(|vm| {
            let state = vm
                .push_entry_frame(code_block, Value::UNDEFINED, this, &[], scope)
                .map_err(|overflow| vm.stack_overflow(overflow))?;
            vm.execute(state).map_err(|uncaught| {
                escaped = Some(uncaught);
                vm.uncaught_to_exception(uncaught)
            })
        });
        result.map_err(|exception| {
            escaped.unwrap_or(UncaughtException {
                value: exception.value,
                frames_unwound: 0,
                terminated: exception.is_termination(),
            })
        })
    }

    /// Call `callee` from native code. Exceptions that escape the callee
    /// come back as `Err`; a termination stays a termination.
    pub fn call_function(
        &mut self,
        callee: Value,
        this: Value,
        args: &[Value],
    ) -> Result<Value, Exception> {
        self.reentrant(|vm| vm.call_from_host(callee, this, args, CodeSpecializationKind::Call))
    }

    /// `new callee(...args)` from native code.
    pub fn construct(&mut self, callee: Value, args: &[Value]) -> Result<Value, Exception> {
        self.reentrant(|vm| {
            vm.call_from_host(callee, Value::UNDEFINED, args, CodeSpecializationKind::Construct)
        })
    }

    fn reentrant<T>(
        &mut self,
        body: impl FnOnce(&mut VM) -> Result<T, Exception>,
    ) -> Result<T, Exception> {
        let mut guard = ReentryGuard::enter(self)?;
        body(&mut guard)
    }

    fn call_from_host(
        &mut self,
        callee: Value,
        this: Value,
        args: &[Value],
        kind: CodeSpecializationKind,
    ) -> Result<Value, Exception> {
        let data = self.function_data(callee);
        match data {
            Some(FunctionData::Host {
                function,
                constructor,
                ..
            }) => {
                let function = match kind {
                    CodeSpecializationKind::Call => function,
                    CodeSpecializationKind::Construct => match constructor {
                        Some(constructor) => constructor,
                        None => return Err(self.not_callable(callee, kind)),
                    },
                };
                self.invoke_host(function, this, args)
            }
            Some(FunctionData::Script { executable, scope }) => {
                let code_block = self.compile_for_call(executable)?;
                let this = match kind {
                    CodeSpecializationKind::Call => this,
                    CodeSpecializationKind::Construct => self.construct_this(callee)?,
                };
                let state = self
                    .push_entry_frame(code_block, callee, this, args, scope)
                    .map_err(|overflow| self.stack_overflow(overflow))?;
                let result = self
                    .execute(state)
                    .map_err(|uncaught| self.uncaught_to_exception(uncaught))?;
                Ok(match kind {
                    CodeSpecializationKind::Construct if !self.is_object(result) => this,
                    _ => result,
                })
            }
            None => Err(self.not_callable(callee, kind)),
        }
    }

    /// Lay out `this` and `args` at the register file top and push a frame
    /// linked to whatever is currently running.
    fn push_entry_frame(
        &mut self,
        code_block: CodeBlockId,
        callee: Value,
        this: Value,
        args: &[Value],
        scope: CellId,
    ) -> Result<ExecState, StackOverflow> {
        let start = self.register_file.end();
        self.register_file.grow(start + args.len() + 1)?;
        self.register_file.set(start, this);
        for (i, &arg) in args.iter().enumerate() {
            self.register_file.set(start + 1 + i, arg);
        }
        let code = &self.code_blocks[code_block.index() as usize];
        let frame = self.register_file.push_frame(&FrameRequest {
            caller: self.top_call_frame,
            entered_from_host: true,
            arguments_start: start,
            argument_count: args.len(),
            parameter_count: code.parameter_count,
            num_registers: code.num_registers,
            code_block: Some(code_block),
            scope: Some(scope),
            callee,
            return_pc: 0,
        })?;
        Ok(ExecState {
            frame,
            code_block,
            pc: 0,
        })
    }

    fn uncaught_to_exception(&self, uncaught: UncaughtException) -> Exception {
        if uncaught.terminated {
            Exception::termination(uncaught.value)
        } else {
            Exception::new(uncaught.value)
        }
    }

    fn invoke_host(&mut self, function: HostFn, this: Value, args: &[Value]) -> Result<Value, Exception> {
        self.host_call_depth += 1;
        self.stats.host_calls += 1;
        let result = function(self, this, args);
        self.host_call_depth -= 1;
        result
    }

    // ── The loop ───────────────────────────────────────────────────

    /// Run until the frame in `entry` returns or an exception escapes it.
    pub(crate) fn execute(&mut self, entry: ExecState) -> Result<Value, UncaughtException> {
        let mut state = entry;
        if let Err(exception) = self.frame_prologue(state) {
            state = self.unwind(state.frame, state.pc, exception)?;
        }
        loop {
            self.top_call_frame = Some(state.frame);
            self.current_pc = state.pc;
            match self.step(&mut state) {
                Ok(Step::Continue) => {}
                Ok(Step::Return(value)) => return Ok(value),
                Err(exception) => state = self.unwind(state.frame, state.pc, exception)?,
            }
        }
    }

    /// Entry bookkeeping for a freshly pushed bytecode frame.
    fn frame_prologue(&mut self, state: ExecState) -> Result<(), Exception> {
        self.code_blocks[state.code_block.index() as usize].execution_count += 1;
        self.poll_safepoint()?;
        let frame = state.frame;
        self.notify_debugger(|debugger, vm| debugger.call_entered(vm, frame));
        Ok(())
    }

    /// Watchdog check plus a chance to collect.
    fn poll_safepoint(&mut self) -> Result<(), Exception> {
        if let Some(reason) = self.watchdog.tick() {
            log::info!("terminating execution: {reason}");
            let value = self.heap.allocate_string(&reason.to_string());
            return Err(Exception::termination(value));
        }
        self.safepoint();
        Ok(())
    }

    fn step(&mut self, state: &mut ExecState) -> Result<Step, Exception> {
        let cb = state.code_block;
        let frame = state.frame;
        let code = &self.code_blocks[cb.index() as usize];
        let Some(&instruction) = code.instructions.get(state.pc) else {
            return self.do_return(state, Value::UNDEFINED);
        };
        let strict = code.strict;

        macro_rules! r {
            ($reg:expr) => {
                frame.r(&self.register_file, $reg)
            };
        }
        macro_rules! set {
            ($reg:expr, $value:expr) => {{
                let value = $value;
                frame.set_r(&mut self.register_file, $reg, value)
            }};
        }

        match instruction {
            Instruction::LoadConstant { dst, constant } => {
                let value = self.code_blocks[cb.index() as usize].constants[constant as usize];
                set!(dst, value);
            }
            Instruction::LoadImmediate { dst, value } => set!(dst, value),
            Instruction::Move { dst, src } => set!(dst, r!(src)),

            Instruction::Add { dst, lhs, rhs } => {
                let (lhs, rhs) = (r!(lhs), r!(rhs));
                let value = if self.string_value(lhs).is_some() || self.string_value(rhs).is_some() {
                    let joined = format!("{}{}", self.display_value(lhs), self.display_value(rhs));
                    self.heap.allocate_string(&joined)
                } else {
                    self.arithmetic(lhs, rhs, i64::checked_add, |a, b| a + b)
                };
                set!(dst, value);
            }
            Instruction::Sub { dst, lhs, rhs } => {
                let value = self.arithmetic(r!(lhs), r!(rhs), i64::checked_sub, |a, b| a - b);
                set!(dst, value);
            }
            Instruction::Mul { dst, lhs, rhs } => {
                let value = self.arithmetic(r!(lhs), r!(rhs), i64::checked_mul, |a, b| a * b);
                set!(dst, value);
            }
            Instruction::Less { dst, lhs, rhs } => {
                let ordering = self.compare(r!(lhs), r!(rhs));
                set!(dst, Value::from(ordering == Some(Ordering::Less)));
            }
            Instruction::LessEq { dst, lhs, rhs } => {
                let ordering = self.compare(r!(lhs), r!(rhs));
                set!(dst, Value::from(matches!(ordering, Some(Ordering::Less | Ordering::Equal))));
            }
            Instruction::StrictEq { dst, lhs, rhs } => {
                let equal = self.strict_equals(r!(lhs), r!(rhs));
                set!(dst, Value::from(equal));
            }
            Instruction::Not { dst, src } => {
                let value = !self.truthy(r!(src));
                set!(dst, Value::from(value));
            }

            Instruction::Jump { target } => {
                state.pc = target as usize;
                return Ok(Step::Continue);
            }
            Instruction::JumpIfTrue { cond, target } => {
                if self.truthy(r!(cond)) {
                    state.pc = target as usize;
                    return Ok(Step::Continue);
                }
            }
            Instruction::JumpIfFalse { cond, target } => {
                if !self.truthy(r!(cond)) {
                    state.pc = target as usize;
                    return Ok(Step::Continue);
                }
            }
            Instruction::LoopHint => self.poll_safepoint()?,

            Instruction::NewObject { dst } => {
                let object = self.new_plain_object();
                set!(dst, Value::from_cell(object));
            }
            Instruction::NewFunction { dst, function } => {
                let executable = self.code_blocks[cb.index() as usize].functions[function as usize];
                let scope = self.frame_scope(frame);
                let function = self.new_function(executable, scope);
                set!(dst, Value::from_cell(function));
            }

            Instruction::GetById {
                dst,
                base,
                name,
                site,
            } => {
                let name = self.identifier_at(cb, name);
                let value = self.get_by_id_cached(cb, site as usize, r!(base), name)?;
                set!(dst, value);
            }
            Instruction::PutById {
                base,
                name,
                value,
                site,
            } => {
                let name = self.identifier_at(cb, name);
                self.put_by_id_cached(cb, site as usize, r!(base), name, r!(value))?;
            }
            Instruction::PutGetterSetter {
                base,
                name,
                getter,
                setter,
            } => {
                let name = self.identifier_at(cb, name);
                let base = r!(base);
                let Some(object) = base.as_cell().filter(|&cell| self.heap.object(cell).is_some())
                else {
                    let message = format!("{} is not an object", self.display_value(base));
                    return Err(self.throw_error(ErrorType::TypeError, &message));
                };
                self.define_accessor(object, name, r!(getter), r!(setter));
            }
            Instruction::DeleteById { dst, base, name } => {
                let name = self.identifier_at(cb, name);
                let base = r!(base);
                let deleted = match base.as_cell().filter(|&cell| self.heap.object(cell).is_some()) {
                    Some(object) => self.delete_property(object, name, strict)?,
                    None if base.is_undefined_or_null() => {
                        let message =
                            format!("cannot delete property of {}", self.display_value(base));
                        return Err(self.throw_error(ErrorType::TypeError, &message));
                    }
                    None => true,
                };
                set!(dst, Value::from(deleted));
            }
            Instruction::GetByVal {
                dst,
                base,
                key,
                site,
            } => {
                let value = self.get_by_val_cached(cb, site as usize, r!(base), r!(key))?;
                set!(dst, value);
            }
            Instruction::PutByVal {
                base,
                key,
                value,
                site,
            } => {
                self.put_by_val_cached(cb, site as usize, r!(base), r!(key), r!(value))?;
            }

            Instruction::Resolve { dst, name, site } => {
                let name = self.identifier_at(cb, name);
                let resolved = self.resolve_cached(frame, cb, site as usize, name, ResolveMode::Get)?;
                set!(dst, resolved.value);
            }
            Instruction::ResolveBase { dst, name, site } => {
                let name = self.identifier_at(cb, name);
                let resolved = self.resolve_cached(frame, cb, site as usize, name, ResolveMode::Base)?;
                set!(dst, resolved.base);
            }
            Instruction::ResolveWithBase {
                base_dst,
                dst,
                name,
                site,
            } => {
                let name = self.identifier_at(cb, name);
                let resolved =
                    self.resolve_cached(frame, cb, site as usize, name, ResolveMode::WithBase)?;
                set!(base_dst, resolved.base);
                set!(dst, resolved.value);
            }
            Instruction::ResolveWithThis {
                this_dst,
                dst,
                name,
                site,
            } => {
                let name = self.identifier_at(cb, name);
                let resolved =
                    self.resolve_cached(frame, cb, site as usize, name, ResolveMode::WithThis)?;
                set!(this_dst, resolved.base);
                set!(dst, resolved.value);
            }
            Instruction::PutToBase {
                base,
                name,
                value,
                site,
            } => {
                let name = self.identifier_at(cb, name);
                self.put_to_base_cached(cb, site as usize, r!(base), name, r!(value))?;
            }
            Instruction::DeclareVar { name, value } => {
                let name = self.identifier_at(cb, name);
                self.declare_var(frame, name, r!(value));
            }

            Instruction::PushWithScope { object } => {
                self.push_with_scope(frame, r!(object))?;
            }
            Instruction::PushNameScope { name, value } => {
                let name = self.identifier_at(cb, name);
                self.push_name_scope(frame, name, r!(value), PropertyAttributes::DONT_DELETE);
            }
            Instruction::PopScope => self.pop_scope(frame),

            Instruction::CreateActivation { dst } => {
                let activation = self.create_activation(frame);
                set!(dst, activation.map_or(Value::UNDEFINED, Value::from_cell));
            }
            Instruction::CreateArguments { dst } => {
                let arguments = self.create_arguments(frame);
                set!(dst, Value::from_cell(arguments));
            }
            Instruction::TearOffActivation { activation } => {
                if let Some(scope) = r!(activation).as_cell() {
                    self.tear_off_activation(scope);
                }
            }
            Instruction::TearOffArguments { arguments } => {
                if let Some(arguments) = r!(arguments).as_cell() {
                    self.tear_off_arguments(arguments);
                }
            }

            Instruction::Call {
                dst,
                callee,
                first_arg,
                argc,
                site,
            }
            | Instruction::Construct {
                dst,
                callee,
                first_arg,
                argc,
                site,
            } => {
                let kind = match instruction {
                    Instruction::Construct { .. } => CodeSpecializationKind::Construct,
                    _ => CodeSpecializationKind::Call,
                };
                let call = CallSite {
                    callee: r!(callee),
                    first_arg,
                    argc: argc as usize,
                    site: site as usize,
                    kind,
                };
                match self.call_from_bytecode(*state, call)? {
                    CallOutcome::Enter(callee_state) => {
                        *state = callee_state;
                        self.frame_prologue(callee_state)?;
                        return Ok(Step::Continue);
                    }
                    CallOutcome::Returned(value) => set!(dst, value),
                }
            }
            Instruction::Return { value } => {
                let value = r!(value);
                return self.do_return(state, value);
            }

            Instruction::Throw { value } => return Err(Exception::new(r!(value))),
            Instruction::Catch { dst } => {
                let exception = self.pending_exception.take().unwrap_or(Value::UNDEFINED);
                set!(dst, exception);
            }

            Instruction::Debug { line } => {
                self.notify_debugger(|debugger, vm| debugger.at_statement(vm, frame, line));
            }
        }
        state.pc += 1;
        Ok(Step::Continue)
    }

    fn do_return(&mut self, state: &mut ExecState, value: Value) -> Result<Step, Exception> {
        let frame = state.frame;
        self.notify_debugger(|debugger, vm| debugger.will_return(vm, frame));
        self.tear_off_frame(frame, state.code_block);

        let caller = frame.caller(&self.register_file);
        let return_pc = frame.return_pc(&self.register_file);
        let this = frame.this_value(&self.register_file);
        let caller_code = match caller {
            CallerLink::Frame {
                frame: caller,
                host_entry: false,
            } => caller.code_block(&self.register_file).map(|cb| (caller, cb)),
            _ => None,
        };

        let Some((caller, caller_cb)) = caller_code else {
            let end = frame.arguments_start(&self.register_file);
            self.register_file.pop_frame(frame, end);
            self.top_call_frame = match caller {
                CallerLink::Frame { frame, .. } => Some(frame),
                CallerLink::None => None,
            };
            return Ok(Step::Return(value));
        };

        let caller_code = &self.code_blocks[caller_cb.index() as usize];
        let caller_end = caller.base() + caller_code.num_registers;
        let instruction = caller_code.instructions[return_pc];
        self.register_file.pop_frame(frame, caller_end);

        let value = match instruction {
            Instruction::Construct { .. } if !self.is_object(value) => this,
            _ => value,
        };
        if let Some(dst) = instruction.call_destination() {
            caller.set_r(&mut self.register_file, dst, value);
        }
        *state = ExecState {
            frame: caller,
            code_block: caller_cb,
            pc: return_pc + 1,
        };
        Ok(Step::Continue)
    }

    /// Detach the activation and arguments of a frame that is going away.
    pub(crate) fn tear_off_frame(&mut self, frame: CallFrame, code_block: CodeBlockId) {
        let code = &self.code_blocks[code_block.index() as usize];
        let registers = &self.register_file;
        let arguments = code
            .arguments_register
            .and_then(|r| frame.r(registers, r).as_cell());
        let activation = code
            .activation_register
            .and_then(|r| frame.r(registers, r).as_cell());
        if let Some(arguments) = arguments {
            self.tear_off_arguments(arguments);
        }
        if let Some(activation) = activation {
            self.tear_off_activation(activation);
        }
    }

    // ── Calls ──────────────────────────────────────────────────────

    fn call_from_bytecode(&mut self, caller: ExecState, call: CallSite) -> Result<CallOutcome, Exception> {
        let registers = &self.register_file;
        let caller_frame = caller.frame;
        let arguments_start = caller_frame.register_index(registers, call.first_arg);
        let caller_end =
            caller_frame.base() + self.code_blocks[caller.code_block.index() as usize].num_registers;

        let Some(data) = self.function_data(call.callee) else {
            return Err(self.not_callable(call.callee, call.kind));
        };
        let (executable, scope) = match data {
            FunctionData::Script { executable, scope } => (executable, scope),
            FunctionData::Host {
                function,
                constructor,
                ..
            } => {
                let function = match call.kind {
                    CodeSpecializationKind::Call => function,
                    CodeSpecializationKind::Construct => match constructor {
                        Some(constructor) => constructor,
                        None => return Err(self.not_callable(call.callee, call.kind)),
                    },
                };
                self.note_call_target(caller.code_block, &call, None, CallTarget::Host);
                return self
                    .call_host_from_bytecode(caller, &call, function, arguments_start, caller_end)
                    .map(CallOutcome::Returned);
            }
        };

        if call.kind == CodeSpecializationKind::Construct {
            let this = self.construct_this(call.callee)?;
            self.register_file.set(arguments_start, this);
        }

        let target = self.link_call(caller.code_block, &call, executable)?;
        let (code_block, native) = match target {
            CallTarget::Interpreted { code_block, .. } => (code_block, None),
            CallTarget::Native {
                code_block, entry, ..
            } => (code_block, Some(entry)),
            CallTarget::Host => {
                return Err(self.throw_error(ErrorType::TypeError, "call target changed kind"));
            }
        };

        let code = &self.code_blocks[code_block.index() as usize];
        let request = FrameRequest {
            caller: Some(caller_frame),
            entered_from_host: false,
            arguments_start,
            argument_count: call.argc,
            parameter_count: code.parameter_count,
            num_registers: code.num_registers,
            code_block: Some(code_block),
            scope: Some(scope),
            callee: call.callee,
            return_pc: caller.pc,
        };
        let frame = match self.register_file.push_frame(&request) {
            Ok(frame) => frame,
            Err(overflow) => return Err(self.stack_overflow(overflow)),
        };
        let state = ExecState {
            frame,
            code_block,
            pc: 0,
        };

        let Some(entry) = native else {
            return Ok(CallOutcome::Enter(state));
        };
        let this = frame.this_value(&self.register_file);
        self.top_call_frame = Some(frame);
        let result = self.frame_prologue(state).and_then(|()| entry(self, frame));
        self.tear_off_frame(frame, code_block);
        self.register_file.pop_frame(frame, caller_end);
        self.top_call_frame = Some(caller_frame);
        let value = result?;
        Ok(CallOutcome::Returned(match call.kind {
            CodeSpecializationKind::Construct if !self.is_object(value) => this,
            _ => value,
        }))
    }

    fn call_host_from_bytecode(
        &mut self,
        caller: ExecState,
        call: &CallSite,
        function: HostFn,
        arguments_start: usize,
        caller_end: usize,
    ) -> Result<Value, Exception> {
        let scope = self.frame_scope(caller.frame);
        let request = FrameRequest {
            caller: Some(caller.frame),
            entered_from_host: false,
            arguments_start,
            argument_count: call.argc,
            parameter_count: 0,
            num_registers: 0,
            code_block: None,
            scope: Some(scope),
            callee: call.callee,
            return_pc: caller.pc,
        };
        let frame = match self.register_file.push_frame(&request) {
            Ok(frame) => frame,
            Err(overflow) => return Err(self.stack_overflow(overflow)),
        };
        let this = match call.kind {
            CodeSpecializationKind::Call => frame.this_value(&self.register_file),
            CodeSpecializationKind::Construct => Value::UNDEFINED,
        };
        let args: Vec<Value> = (0..call.argc)
            .map(|i| frame.argument(&self.register_file, i))
            .collect();
        self.top_call_frame = Some(frame);
        let result = self.invoke_host(function, this, &args);
        self.register_file.pop_frame(frame, caller_end);
        self.top_call_frame = Some(caller.frame);
        result
    }

    /// Consult the site's call link, compiling and linking on a miss.
    fn link_call(
        &mut self,
        caller: CodeBlockId,
        call: &CallSite,
        executable: ExecutableId,
    ) -> Result<CallTarget, Exception> {
        let identity = self.callee_identity(call.callee, Some(executable));
        let info = self.call_link_mut(caller, call.site);
        if let Some(identity) = &identity
            && let Some(target) = info.lookup(identity)
        {
            info.hits += 1;
            return Ok(target);
        }

        let code_block = self.compile_for_call(executable)?;
        let code = &self.code_blocks[code_block.index() as usize];
        let arity = ArityCheckMode::for_call(call.argc, code.parameter_count);
        let native = self
            .jit
            .as_mut()
            .and_then(|jit| jit.entry_for(code, call.kind, arity));
        let target = match native {
            Some(entry) => CallTarget::Native {
                code_block,
                entry,
                arity,
            },
            None => CallTarget::Interpreted { code_block, arity },
        };
        let info = self.call_link_mut(caller, call.site);
        match identity {
            Some(identity) => info.observe(identity, target),
            None => info.slow_path_count += 1,
        }
        Ok(target)
    }

    fn note_call_target(
        &mut self,
        caller: CodeBlockId,
        call: &CallSite,
        executable: Option<ExecutableId>,
        target: CallTarget,
    ) {
        let identity = self.callee_identity(call.callee, executable);
        let info = self.call_link_mut(caller, call.site);
        match identity {
            Some(identity) if info.lookup(&identity).is_some() => info.hits += 1,
            Some(identity) => info.observe(identity, target),
            None => info.slow_path_count += 1,
        }
    }

    fn callee_identity(&self, callee: Value, executable: Option<ExecutableId>) -> Option<CalleeIdentity> {
        let cell = callee.as_cell()?;
        let structure = self.heap.object(cell).map(JsObject::structure)?;
        Some(CalleeIdentity {
            cell,
            executable,
            structure,
        })
    }

    fn call_link_mut(&mut self, code_block: CodeBlockId, site: usize) -> &mut CallLinkInfo {
        &mut self.code_blocks[code_block.index() as usize].calls[site]
    }

    /// Code block of `executable`; a failed lazy compile surfaces as a
    /// `SyntaxError` at the call site.
    fn compile_for_call(&mut self, executable: ExecutableId) -> Result<CodeBlockId, Exception> {
        let was_compiled = self.executable(executable).is_compiled();
        match self.code_block_for(executable) {
            Ok(code_block) => {
                if !was_compiled {
                    self.stats.lazy_compilations += 1;
                }
                Ok(code_block)
            }
            Err(e) => Err(self.throw_error(ErrorType::SyntaxError, &e.to_string())),
        }
    }

    /// Fresh `this` for a constructor call, inheriting from
    /// `callee.prototype` when that is an object.
    fn construct_this(&mut self, callee: Value) -> Result<Value, Exception> {
        let prototype = self.get(callee, self.names.prototype)?;
        let prototype = if self.is_object(prototype) {
            prototype
        } else {
            Value::from_cell(self.object_prototype)
        };
        Ok(Value::from_cell(self.new_object(prototype)))
    }

    fn not_callable(&mut self, callee: Value, kind: CodeSpecializationKind) -> Exception {
        let what = match kind {
            CodeSpecializationKind::Call => "a function",
            CodeSpecializationKind::Construct => "a constructor",
        };
        let message = format!("{} is not {what}", self.display_value(callee));
        self.throw_error(ErrorType::TypeError, &message)
    }

    fn stack_overflow(&mut self, overflow: StackOverflow) -> Exception {
        self.stats.stack_overflows += 1;
        log::debug!("{overflow}");
        self.throw_error(ErrorType::RangeError, "Maximum call stack size exceeded")
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn identifier_at(&self, code_block: CodeBlockId, index: u32) -> Identifier {
        self.code_blocks[code_block.index() as usize].identifiers[index as usize]
    }

    fn arithmetic(
        &mut self,
        lhs: Value,
        rhs: Value,
        int: fn(i64, i64) -> Option<i64>,
        float: fn(f64, f64) -> f64,
    ) -> Value {
        if let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64())
            && let Some(result) = int(a, b).and_then(Value::try_from_i64)
        {
            return result;
        }
        let a = self.to_number(lhs).unwrap_or(f64::NAN);
        let b = self.to_number(rhs).unwrap_or(f64::NAN);
        self.number_value(float(a, b))
    }

    fn compare(&self, lhs: Value, rhs: Value) -> Option<Ordering> {
        if let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) {
            return Some(a.cmp(&b));
        }
        if let (Some(a), Some(b)) = (self.string_value(lhs), self.string_value(rhs)) {
            return Some(a.cmp(b));
        }
        let a = self.to_number(lhs).unwrap_or(f64::NAN);
        let b = self.to_number(rhs).unwrap_or(f64::NAN);
        a.partial_cmp(&b)
    }

    pub fn strict_equals(&self, lhs: Value, rhs: Value) -> bool {
        let is_number = |v: Value| {
            v.as_i64().is_some() || v.as_cell().and_then(|c| self.heap.number(c)).is_some()
        };
        if is_number(lhs) && is_number(rhs) {
            return self.to_number(lhs) == self.to_number(rhs);
        }
        if let (Some(a), Some(b)) = (self.string_value(lhs), self.string_value(rhs)) {
            return a == b;
        }
        lhs == rhs
    }

    /// `var name = value` from eval code: bind in the nearest variable
    /// object of the frame.
    fn declare_var(&mut self, frame: CallFrame, name: Identifier, value: Value) {
        let mut scope = Some(self.frame_scope(frame));
        while let Some(cell) = scope {
            let Some(current) = self.heap.scope_mut(cell) else {
                break;
            };
            match &mut current.kind {
                ScopeKind::Activation(activation) => {
                    match activation.symbol_table.get(name).map(|entry| entry.index) {
                        Some(index) => activation.set_register(index, value, &mut self.register_file),
                        None => activation.put_dynamic(name, value),
                    }
                    self.heap.write_barrier(cell, value);
                    return;
                }
                ScopeKind::Global { .. } => break,
                _ => scope = current.next,
            }
        }

        self.declare_global_variable(name, PropertyAttributes::empty());
        let index = self
            .global_data()
            .symbol_table
            .get(name)
            .map(|entry| entry.index as usize);
        match index {
            Some(index) => self.set_global_variable(name, index, value),
            None => {
                let global = Value::from_cell(self.global_object);
                if let Err(exception) = self.put(global, name, value, false) {
                    log::debug!("declaration of global property failed: {:?}", exception.kind);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CallSite {
    callee: Value,
    first_arg: Register,
    argc: usize,
    site: usize,
    kind: CodeSpecializationKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CallLinkState, CodeBlockBuilder, Constant, VMSettings};

    fn vm() -> VM {
        VM::new(VMSettings::default()).unwrap()
    }

    fn int(n: i64) -> Value {
        Value::from_i64(n)
    }

    #[test]
    fn arithmetic_and_branches() {
        let mut vm = vm();
        let mut p = CodeBlockBuilder::program("loop");
        let (i, sum, limit, one, cond) = (p.local(), p.local(), p.local(), p.local(), p.local());
        p.load_int(i, 0);
        p.load_int(sum, 0);
        p.load_int(limit, 10);
        p.load_int(one, 1);
        let top = p.pc();
        p.emit(Instruction::LoopHint);
        p.emit(Instruction::Less { dst: cond, lhs: i, rhs: limit });
        let exit = p.emit(Instruction::JumpIfFalse { cond, target: 0 });
        p.emit(Instruction::Add { dst: sum, lhs: sum, rhs: i });
        p.emit(Instruction::Add { dst: i, lhs: i, rhs: one });
        p.emit(Instruction::Jump { target: top });
        let end = p.pc();
        p.patch_jump(exit, end);
        p.ret(sum);
        assert_eq!(vm.evaluate(&p.finish()).unwrap(), int(45));
    }

    #[test]
    fn string_concatenation() {
        let mut vm = vm();
        let mut p = CodeBlockBuilder::program("concat");
        let (a, b) = (p.local(), p.local());
        p.load_string(a, "n=");
        p.load_int(b, 4);
        p.emit(Instruction::Add { dst: a, lhs: a, rhs: b });
        p.ret(a);
        let result = vm.evaluate(&p.finish()).unwrap();
        assert_eq!(vm.string_value(result), Some("n=4"));
    }

    fn add_function() -> UnlinkedCodeBlock {
        let mut f = CodeBlockBuilder::function("add", 2);
        let r = f.local();
        f.emit(Instruction::Add {
            dst: r,
            lhs: Register::argument(0),
            rhs: Register::argument(1),
        });
        f.ret(r);
        f.finish()
    }

    #[test]
    fn calls_link_monomorphically() {
        let mut vm = vm();
        let mut p = CodeBlockBuilder::program("caller");
        let add = p.nested(add_function());
        let (f, result, i, limit, cond, one) =
            (p.local(), p.local(), p.local(), p.local(), p.local(), p.local());
        let args = p.locals(3);
        p.new_function(f, add);
        p.load_int(i, 0);
        p.load_int(limit, 5);
        p.load_int(one, 1);
        let top = p.pc();
        p.emit(Instruction::Less { dst: cond, lhs: i, rhs: limit });
        let exit = p.emit(Instruction::JumpIfFalse { cond, target: 0 });
        p.load_value(args, Value::UNDEFINED);
        p.emit(Instruction::Move { dst: Register::local(args.raw() as u32 + 1), src: i });
        p.load_int(Register::local(args.raw() as u32 + 2), 100);
        p.call(result, f, args, 2);
        p.emit(Instruction::Add { dst: i, lhs: i, rhs: one });
        p.emit(Instruction::Jump { target: top });
        let end = p.pc();
        p.patch_jump(exit, end);
        p.ret(result);

        let code_block = vm.link_code_block(&p.finish()).unwrap();
        assert_eq!(vm.run_program(code_block).unwrap(), int(104));
        let info = &vm.code_block(code_block).calls[0];
        assert!(matches!(info.state(), CallLinkState::Linked { .. }));
        assert_eq!(info.slow_path_count, 2);
        assert_eq!(info.hits, 3);
        assert_eq!(vm.stats.lazy_compilations, 1);
        assert_eq!(vm.register_file.arity_fixups(), 0);
    }

    #[test]
    fn matching_arity_builds_the_callee_on_the_argument_window() {
        let mut vm = vm();
        // function clobber(a) { a = 5; return 0 }
        let mut f = CodeBlockBuilder::function("clobber", 1);
        let r = f.local();
        f.load_int(Register::argument(0), 5);
        f.load_int(r, 0);
        f.ret(r);

        let mut p = CodeBlockBuilder::program("in_place");
        let function = p.nested(f.finish());
        let (callee, result) = (p.local(), p.local());
        let args = p.locals(2);
        let argument = Register::local(args.raw() as u32 + 1);
        p.new_function(callee, function);
        p.load_value(args, Value::UNDEFINED);
        p.load_int(argument, 1);
        p.call(result, callee, args, 1);
        p.ret(argument);

        assert_eq!(vm.evaluate(&p.finish()).unwrap(), int(5));
        assert_eq!(vm.register_file.arity_fixups(), 0);
    }

    #[test]
    fn missing_arguments_read_undefined() {
        let mut vm = vm();
        let mut f = CodeBlockBuilder::function("second", 2);
        f.ret(Register::argument(1));
        let mut p = CodeBlockBuilder::program("arity");
        let function = p.nested(f.finish());
        let (callee, result) = (p.local(), p.local());
        let args = p.locals(2);
        p.new_function(callee, function);
        p.load_value(args, Value::UNDEFINED);
        p.load_int(Register::local(args.raw() as u32 + 1), 7);
        p.call(result, callee, args, 1);
        p.ret(result);
        assert_eq!(vm.evaluate(&p.finish()).unwrap(), Value::UNDEFINED);
        assert_eq!(vm.register_file.arity_fixups(), 1);
    }

    #[test]
    fn host_functions_reenter() {
        fn twice(vm: &mut VM, _this: Value, args: &[Value]) -> Result<Value, Exception> {
            let callee = args.first().copied().unwrap_or(Value::UNDEFINED);
            let once = vm.call_function(callee, Value::UNDEFINED, &[Value::from_i64(1)])?;
            vm.call_function(callee, Value::UNDEFINED, &[once])
        }
        let mut vm = vm();
        vm.define_host_function("twice", 1, twice);

        let mut inc = CodeBlockBuilder::function("inc", 1);
        let (r, one) = (inc.local(), inc.local());
        inc.load_int(one, 1);
        inc.emit(Instruction::Add { dst: r, lhs: Register::argument(0), rhs: one });
        inc.ret(r);

        let mut p = CodeBlockBuilder::program("host");
        let inc = p.nested(inc.finish());
        let (host, result) = (p.local(), p.local());
        let args = p.locals(2);
        p.resolve(host, "twice");
        p.load_value(args, Value::UNDEFINED);
        p.new_function(Register::local(args.raw() as u32 + 1), inc);
        p.call(result, host, args, 1);
        p.ret(result);

        assert_eq!(vm.evaluate(&p.finish()).unwrap(), int(3));
        assert_eq!(vm.stats.host_calls, 1);
        assert_eq!(vm.reentry_depth, 0);
        assert!(vm.top_call_frame.is_none());
        assert_eq!(vm.register_file.end(), 0);
    }

    #[test]
    fn construct_uses_the_prototype_property() {
        let mut vm = vm();
        let mut ctor = CodeBlockBuilder::function("Point", 1);
        ctor.put_by_id(Register::this(), "x", Register::argument(0));
        let r = ctor.local();
        ctor.load_int(r, 0);
        ctor.ret(r);
        let point = vm.link_code_block(&{
            let mut p = CodeBlockBuilder::program("make");
            let function = p.nested(ctor.finish());
            let f = p.local();
            p.new_function(f, function);
            p.ret(f);
            p.finish()
        });
        let point = vm.run_program(point.unwrap()).unwrap();
        let prototype = Value::from_cell(vm.new_plain_object());
        vm.put(point, vm.names.prototype, prototype, false).unwrap();

        let object = vm.construct(point, &[int(3)]).unwrap();
        let x = vm.identifiers.add("x");
        assert_eq!(vm.get(object, x).unwrap(), int(3));
        let cell = object.as_cell().unwrap();
        let structure = vm.heap.object(cell).unwrap().structure();
        assert_eq!(vm.structures[structure].prototype(), prototype);
    }

    #[test]
    fn calling_a_non_function_throws() {
        let mut vm = vm();
        let mut p = CodeBlockBuilder::program("bad");
        let (callee, result) = (p.local(), p.local());
        let args = p.locals(1);
        p.load_int(callee, 3);
        p.load_value(args, Value::UNDEFINED);
        p.call(result, callee, args, 0);
        p.ret(result);
        let error = vm.evaluate(&p.finish()).unwrap_err();
        let EvaluationError::Uncaught(uncaught) = error else {
            panic!("expected an uncaught exception");
        };
        assert_eq!(vm.error_type(uncaught.value), Some(ErrorType::TypeError));
    }

    #[test]
    fn lazy_compile_failure_is_a_syntax_error() {
        let mut vm = vm();
        let mut broken = CodeBlockBuilder::function("broken", 0);
        broken.emit(Instruction::Jump { target: 99 });
        let mut p = CodeBlockBuilder::program("lazy");
        let function = p.nested(broken.finish());
        let (f, result) = (p.local(), p.local());
        let args = p.locals(1);
        p.new_function(f, function);
        p.load_value(args, Value::UNDEFINED);
        p.call(result, f, args, 0);
        p.ret(result);
        let Err(EvaluationError::Uncaught(uncaught)) = vm.evaluate(&p.finish()) else {
            panic!("expected an uncaught exception");
        };
        assert_eq!(vm.error_type(uncaught.value), Some(ErrorType::SyntaxError));
    }

    #[test]
    fn declare_var_binds_globals() {
        let mut vm = vm();
        let mut p = CodeBlockBuilder::program("eval");
        let r = p.local();
        let c = p.constant(Constant::Number(1.5));
        p.emit(Instruction::LoadConstant { dst: r, constant: c });
        p.declare_var("answer", r);
        p.ret(r);
        vm.evaluate(&p.finish()).unwrap();
        let answer = vm.global_variable("answer").unwrap();
        assert_eq!(vm.to_number(answer), Some(1.5));
    }
}
