//! Exception propagation through bytecode frames.

use crate::{CallFrame, CallerLink, CellId, Exception, FunctionData, UncaughtException, VM};
use crate::interpreter::ExecState;

impl VM {
    /// Find the handler for an exception thrown in `frame` at `pc`.
    ///
    /// Frames without a matching handler have their activation and
    /// arguments torn off and are popped. Unwinding stops at the frame the
    /// current native entry pushed; past that point the exception belongs
    /// to the host. Terminations skip every handler.
    pub(crate) fn unwind(
        &mut self,
        frame: CallFrame,
        pc: usize,
        exception: Exception,
    ) -> Result<ExecState, UncaughtException> {
        self.last_exception_stack = self.stack_trace_from(frame, pc);
        let terminated = exception.is_termination();
        let has_handler = !terminated
            && frame
                .code_block(&self.register_file)
                .is_some_and(|cb| self.code_block(cb).handler_for(pc).is_some());
        self.notify_debugger(|debugger, vm| debugger.exception(vm, frame, &exception, has_handler));

        let mut frame = frame;
        let mut pc = pc;
        let mut unwound = 0usize;
        loop {
            let code_block = frame.code_block(&self.register_file);
            if !terminated
                && let Some(cb) = code_block
                && let Some(handler) = self.code_block(cb).handler_for(pc)
            {
                self.restore_handler_scope(frame, handler.scope_depth);
                self.pending_exception = Some(exception.value);
                self.stats.frames_unwound += unwound as u64;
                log::debug!(
                    "exception caught at {} after unwinding {unwound} frame(s)",
                    handler.target
                );
                return Ok(ExecState {
                    frame,
                    code_block: cb,
                    pc: handler.target as usize,
                });
            }

            if let Some(cb) = code_block {
                self.tear_off_frame(frame, cb);
            }
            let caller = frame.caller(&self.register_file);
            let return_pc = frame.return_pc(&self.register_file);
            unwound += 1;
            match caller {
                CallerLink::Frame {
                    frame: caller,
                    host_entry: false,
                } => {
                    let caller_registers = caller
                        .code_block(&self.register_file)
                        .map_or(0, |cb| self.code_block(cb).num_registers);
                    self.register_file
                        .pop_frame(frame, caller.base() + caller_registers);
                    frame = caller;
                    pc = return_pc;
                }
                CallerLink::Frame { .. } | CallerLink::None => {
                    let end = frame.arguments_start(&self.register_file);
                    self.register_file.pop_frame(frame, end);
                    self.stats.frames_unwound += unwound as u64;
                    self.top_call_frame = match caller {
                        CallerLink::Frame { frame, .. } => Some(frame),
                        CallerLink::None => None,
                    };
                    log::debug!("exception escaped after unwinding {unwound} frame(s)");
                    return Err(UncaughtException {
                        value: exception.value,
                        frames_unwound: unwound,
                        terminated,
                    });
                }
            }
        }
    }

    /// Scope a frame starts with: the closure's scope, or the global scope
    /// for program code.
    fn frame_base_scope(&self, frame: CallFrame) -> CellId {
        match self.function_data(frame.callee(&self.register_file)) {
            Some(FunctionData::Script { scope, .. }) => scope,
            _ => self.global_scope,
        }
    }

    /// Scopes pushed on top of the frame's base scope.
    pub(crate) fn scope_depth(&self, frame: CallFrame) -> u32 {
        let base = self.frame_base_scope(frame);
        let mut depth = 0;
        let mut scope = Some(self.frame_scope(frame));
        while let Some(cell) = scope
            && cell != base
        {
            depth += 1;
            scope = self.heap.scope(cell).and_then(|s| s.next);
        }
        depth
    }

    fn restore_handler_scope(&mut self, frame: CallFrame, target_depth: u32) {
        let depth = self.scope_depth(frame);
        for _ in target_depth..depth {
            self.pop_scope(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        CodeBlockBuilder, ErrorType, EvaluationError, Instruction, Register, Value, VMSettings,
        VM,
    };

    fn vm() -> VM {
        VM::new(VMSettings::default()).unwrap()
    }

    /// `function name(n) { var local = n; return callee(n); }` where the
    /// callee is looked up as a global and `local` is closed over.
    fn forwarding_function(name: &str, callee: &str) -> crate::UnlinkedCodeBlock {
        let mut f = CodeBlockBuilder::function(name, 1);
        let activation = f.activation();
        let local = f.captured_local("local");
        let (target, result) = (f.local(), f.local());
        let args = f.locals(2);
        f.emit(Instruction::CreateActivation { dst: activation });
        f.emit(Instruction::Move { dst: local, src: Register::argument(0) });
        f.resolve(target, callee);
        f.load_value(args, Value::UNDEFINED);
        f.emit(Instruction::Move {
            dst: Register::local(args.raw() as u32 + 1),
            src: Register::argument(0),
        });
        f.call(result, target, args, 1);
        f.emit(Instruction::TearOffActivation { activation });
        f.ret(result);
        f.finish()
    }

    #[test]
    fn throw_unwinds_to_the_catching_frame() {
        let mut vm = vm();

        let mut h = CodeBlockBuilder::function("h", 1);
        h.line(30);
        h.emit(Instruction::Throw { value: Register::argument(0) });

        // f calls g inside a try block and returns what it caught.
        let mut f = CodeBlockBuilder::function("f", 1);
        let (target, result, caught) = (f.local(), f.local(), f.local());
        let args = f.locals(2);
        f.line(10);
        f.resolve(target, "g");
        f.load_value(args, Value::UNDEFINED);
        f.emit(Instruction::Move {
            dst: Register::local(args.raw() as u32 + 1),
            src: Register::argument(0),
        });
        let try_start = f.pc();
        f.call(result, target, args, 1);
        let try_end = f.pc();
        f.ret(result);
        let catch = f.pc();
        f.emit(Instruction::Catch { dst: caught });
        f.ret(caught);
        f.handler(try_start, try_end, catch, 0);

        let mut p = CodeBlockBuilder::program("main");
        let functions = [
            ("f", p.nested(f.finish())),
            ("g", p.nested(forwarding_function("g", "h"))),
            ("h", p.nested(h.finish())),
        ];
        let (function, result) = (p.local(), p.local());
        let args = p.locals(2);
        for (name, index) in functions {
            p.new_function(function, index);
            p.declare_var(name, function);
        }
        p.resolve(function, "f");
        p.load_value(args, Value::UNDEFINED);
        p.load_int(Register::local(args.raw() as u32 + 1), 42);
        p.call(result, function, args, 1);
        p.ret(result);

        let before = vm.stats;
        assert_eq!(vm.evaluate(&p.finish()).unwrap(), Value::from_i64(42));
        assert_eq!(vm.stats.frames_unwound - before.frames_unwound, 2);
        assert_eq!(vm.stats.activation_tear_offs - before.activation_tear_offs, 1);

        let names: Vec<_> = vm
            .last_exception_stack
            .iter()
            .map(|frame| frame.function_name.as_str())
            .collect();
        assert_eq!(names, ["h", "g", "f", "main"]);
        assert_eq!(vm.last_exception_stack[0].line, Some(30));
        assert_eq!(vm.register_file.end(), 0);
    }

    /// `function name(n) { var local = n; saved_name = arguments; ... }`
    /// with `n` closed over. Calls `callee(n)`, or sets `n = 7` and throws
    /// it when there is no callee.
    fn capturing_function(name: &str, callee: Option<&str>) -> crate::UnlinkedCodeBlock {
        let mut f = CodeBlockBuilder::function(name, 1);
        let activation = f.activation();
        let arguments = f.arguments();
        let n = f.captured_argument("n", 0);
        let local = f.captured_local("local");
        f.line(20);
        f.emit(Instruction::CreateActivation { dst: activation });
        f.emit(Instruction::CreateArguments { dst: arguments });
        f.emit(Instruction::Move { dst: local, src: n });
        f.assign(&format!("saved_{name}"), arguments);
        match callee {
            Some(callee) => {
                let (target, result) = (f.local(), f.local());
                let args = f.locals(2);
                f.resolve(target, callee);
                f.load_value(args, Value::UNDEFINED);
                f.emit(Instruction::Move {
                    dst: Register::local(args.raw() as u32 + 1),
                    src: n,
                });
                f.call(result, target, args, 1);
                f.ret(result);
            }
            None => {
                f.load_int(n, 7);
                f.emit(Instruction::Throw { value: n });
            }
        }
        f.finish()
    }

    #[test]
    fn unwinding_tears_off_every_frame_it_pops() {
        let mut vm = vm();

        let mut f = CodeBlockBuilder::function("f", 1);
        let (target, result, caught) = (f.local(), f.local(), f.local());
        let args = f.locals(2);
        f.resolve(target, "g");
        f.load_value(args, Value::UNDEFINED);
        f.emit(Instruction::Move {
            dst: Register::local(args.raw() as u32 + 1),
            src: Register::argument(0),
        });
        let try_start = f.pc();
        f.call(result, target, args, 1);
        let try_end = f.pc();
        f.ret(result);
        let catch = f.pc();
        f.emit(Instruction::Catch { dst: caught });
        f.ret(caught);
        f.handler(try_start, try_end, catch, 0);

        let mut p = CodeBlockBuilder::program("main");
        let functions = [
            ("f", p.nested(f.finish())),
            ("g", p.nested(capturing_function("g", Some("h")))),
            ("h", p.nested(capturing_function("h", None))),
        ];
        let (function, result) = (p.local(), p.local());
        let args = p.locals(2);
        for (name, index) in functions {
            p.new_function(function, index);
            p.declare_var(name, function);
        }
        p.resolve(function, "f");
        p.load_value(args, Value::UNDEFINED);
        p.load_int(Register::local(args.raw() as u32 + 1), 42);
        p.call(result, function, args, 1);
        p.ret(result);

        let before = vm.stats;
        assert_eq!(vm.evaluate(&p.finish()).unwrap(), Value::from_i64(7));
        assert_eq!(vm.stats.frames_unwound - before.frames_unwound, 2);
        assert_eq!(vm.stats.activation_tear_offs - before.activation_tear_offs, 2);
        assert_eq!(vm.stats.arguments_tear_offs - before.arguments_tear_offs, 2);
        assert_eq!(vm.register_file.end(), 0);
        assert_eq!(vm.arguments_outliving_frames(), 0);

        let global = Value::from_cell(vm.global_object);
        for (name, expected) in [("saved_g", 42), ("saved_h", 7)] {
            let name = vm.identifiers.add(name);
            let saved = vm.get(global, name).unwrap().as_cell().unwrap();
            let data = vm.heap.object(saved).unwrap().as_arguments().unwrap();
            assert!(data.is_torn_off());
            assert_eq!(vm.arguments_get_index(saved, 0), Some(Value::from_i64(expected)));
        }
    }

    #[test]
    fn uncaught_exceptions_reach_the_host() {
        let mut vm = vm();
        let mut p = CodeBlockBuilder::program("main");
        let r = p.local();
        p.load_int(r, 7);
        p.emit(Instruction::Throw { value: r });
        let Err(EvaluationError::Uncaught(uncaught)) = vm.evaluate(&p.finish()) else {
            panic!("expected an uncaught exception");
        };
        assert_eq!(uncaught.value, Value::from_i64(7));
        assert_eq!(uncaught.frames_unwound, 1);
        assert!(!uncaught.terminated);
        assert!(vm.top_call_frame.is_none());
    }

    #[test]
    fn handlers_restore_the_scope_chain() {
        let mut vm = vm();
        let mut p = CodeBlockBuilder::program("with");
        let (object, value, caught) = (p.local(), p.local(), p.local());
        p.emit(Instruction::NewObject { dst: object });
        p.load_int(value, 1);
        p.put_by_id(object, "shadow", value);
        let try_start = p.pc();
        p.emit(Instruction::PushWithScope { object });
        p.emit(Instruction::Throw { value });
        p.emit(Instruction::PopScope);
        let try_end = p.pc();
        p.emit(Instruction::Catch { dst: caught });
        p.resolve_base(caught, "shadow");
        p.ret(caught);
        p.handler(try_start, try_end, try_end, 0);

        let result = vm.evaluate(&p.finish()).unwrap();
        assert_eq!(result, Value::from_cell(vm.global_object));
    }

    #[test]
    fn watchdog_terminates_through_handlers() {
        let mut vm = VM::new(VMSettings {
            watchdog_tick_limit: Some(1_000),
            ..VMSettings::default()
        })
        .unwrap();
        let mut p = CodeBlockBuilder::program("spin");
        let caught = p.local();
        let top = p.pc();
        p.emit(Instruction::LoopHint);
        p.emit(Instruction::Jump { target: top });
        let end = p.pc();
        p.emit(Instruction::Catch { dst: caught });
        p.ret(caught);
        p.handler(top, end, end, 0);

        let Err(EvaluationError::Uncaught(uncaught)) = vm.evaluate(&p.finish()) else {
            panic!("expected termination");
        };
        assert!(uncaught.terminated);
        assert_eq!(vm.watchdog.fired(), 1);
        assert!(vm.pending_exception.is_none());
    }

    #[test]
    fn runaway_recursion_overflows_the_register_file() {
        let mut vm = VM::new(VMSettings {
            register_file_capacity: 8 * 1024,
            register_segment_size: 1024,
            ..VMSettings::default()
        })
        .unwrap();

        let mut p = CodeBlockBuilder::program("main");
        let recurse = p.nested(forwarding_function("recurse", "recurse"));
        let (function, result) = (p.local(), p.local());
        let args = p.locals(2);
        p.new_function(function, recurse);
        p.declare_var("recurse", function);
        p.load_value(args, Value::UNDEFINED);
        p.load_int(Register::local(args.raw() as u32 + 1), 0);
        p.call(result, function, args, 1);
        p.ret(result);

        let Err(EvaluationError::Uncaught(uncaught)) = vm.evaluate(&p.finish()) else {
            panic!("expected a stack overflow");
        };
        assert_eq!(vm.error_type(uncaught.value), Some(ErrorType::RangeError));
        assert_eq!(vm.stats.stack_overflows, 1);
        assert!(uncaught.frames_unwound > 100);
        assert_eq!(vm.stats.activation_tear_offs as usize, uncaught.frames_unwound - 1);
        assert_eq!(vm.register_file.end(), 0);
    }
}
