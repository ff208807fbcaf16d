//! Small programs exercising the engine end to end. The CLI runs them and
//! the benches time them.

use crate::{CodeBlockBuilder, Instruction, Register, UnlinkedCodeBlock, Value};

#[derive(Debug, Clone, Copy)]
pub struct Demo {
    pub name: &'static str,
    pub description: &'static str,
    pub build: fn(u32) -> UnlinkedCodeBlock,
}

pub const DEMOS: [Demo; 5] = [
    Demo {
        name: "properties",
        description: "same-shape objects warm up property caches",
        build: property_warmup,
    },
    Demo {
        name: "closures",
        description: "a counter closure writes through its captured scope",
        build: closures,
    },
    Demo {
        name: "exceptions",
        description: "a ReferenceError unwinds two frames to a handler",
        build: exceptions,
    },
    Demo {
        name: "arity",
        description: "missing arguments and the arguments object",
        build: arity,
    },
    Demo {
        name: "overflow",
        description: "runaway recursion exhausts the register file",
        build: overflow,
    },
];

pub fn find(name: &str) -> Option<&'static Demo> {
    DEMOS.iter().find(|demo| demo.name == name)
}

/// Emit `dst = callee.call(this, args...)` with a fresh argument window.
fn call(
    b: &mut CodeBlockBuilder,
    dst: Register,
    callee: Register,
    this: Option<Register>,
    args: &[Register],
) {
    let window = b.locals(args.len() as u32 + 1);
    let first = window.raw() as u32;
    match this {
        Some(this) => {
            b.emit(Instruction::Move { dst: window, src: this });
        }
        None => b.load_value(window, Value::UNDEFINED),
    }
    for (i, &arg) in args.iter().enumerate() {
        b.emit(Instruction::Move {
            dst: Register::local(first + 1 + i as u32),
            src: arg,
        });
    }
    b.call(dst, callee, window, args.len() as u32);
}

/// `for (i = 0; i < n; i++) { o = {}; o.x = i; o.y = 1; sum += o.x }`
pub fn property_warmup(iterations: u32) -> UnlinkedCodeBlock {
    let mut p = CodeBlockBuilder::program("properties");
    let (object, sum, i, limit, one, cond, value) =
        (p.local(), p.local(), p.local(), p.local(), p.local(), p.local(), p.local());
    p.line(1);
    p.load_int(sum, 0);
    p.load_int(i, 0);
    p.load_int(limit, iterations as i64);
    p.load_int(one, 1);
    let top = p.pc();
    p.line(2);
    p.emit(Instruction::LoopHint);
    p.emit(Instruction::Less {
        dst: cond,
        lhs: i,
        rhs: limit,
    });
    let exit = p.emit(Instruction::JumpIfFalse { cond, target: 0 });
    p.line(3);
    p.emit(Instruction::NewObject { dst: object });
    p.put_by_id(object, "x", i);
    p.put_by_id(object, "y", one);
    p.line(4);
    p.get_by_id(value, object, "x");
    p.emit(Instruction::Add {
        dst: sum,
        lhs: sum,
        rhs: value,
    });
    p.emit(Instruction::Add {
        dst: i,
        lhs: i,
        rhs: one,
    });
    p.emit(Instruction::Jump { target: top });
    let end = p.pc();
    p.patch_jump(exit, end);
    p.ret(sum);
    p.finish()
}

/// `function counter() { count = count + 1; return count }`
fn counter_body() -> UnlinkedCodeBlock {
    let mut f = CodeBlockBuilder::function("counter", 0);
    let (base, value, one) = (f.local(), f.local(), f.local());
    f.line(3);
    let site = f.resolve_base(base, "count");
    f.resolve(value, "count");
    f.load_int(one, 1);
    f.emit(Instruction::Add {
        dst: value,
        lhs: value,
        rhs: one,
    });
    f.put_to_base(base, "count", value, site);
    f.ret(value);
    f.finish()
}

/// `function makeCounter() { var count = 0; return counter }`, then call
/// the counter `n` times.
pub fn closures(calls: u32) -> UnlinkedCodeBlock {
    let mut make = CodeBlockBuilder::function("makeCounter", 0);
    let counter = make.nested(counter_body());
    let activation = make.activation();
    let count = make.captured_local("count");
    let closure = make.local();
    make.line(2);
    make.emit(Instruction::CreateActivation { dst: activation });
    make.load_int(count, 0);
    make.new_function(closure, counter);
    make.emit(Instruction::TearOffActivation { activation });
    make.ret(closure);

    let mut p = CodeBlockBuilder::program("closures");
    let make = p.nested(make.finish());
    let (factory, counter, result) = (p.local(), p.local(), p.local());
    p.line(1);
    p.new_function(factory, make);
    call(&mut p, counter, factory, None, &[]);
    p.load_value(result, Value::UNDEFINED);
    for _ in 0..calls.max(1) {
        p.line(5);
        call(&mut p, result, counter, None, &[]);
    }
    p.ret(result);
    p.finish()
}

/// `f` calls `g` calls `h`; `h` reads an undeclared name and `f` catches
/// the ReferenceError.
pub fn exceptions(_: u32) -> UnlinkedCodeBlock {
    let mut h = CodeBlockBuilder::function("h", 0);
    let missing = h.local();
    h.line(12);
    h.resolve(missing, "undeclared");
    h.ret(missing);

    let mut g = CodeBlockBuilder::function("g", 0);
    let (target, result) = (g.local(), g.local());
    g.line(8);
    g.resolve(target, "h");
    call(&mut g, result, target, None, &[]);
    g.ret(result);

    let mut f = CodeBlockBuilder::function("f", 0);
    let (target, result, caught, message) = (f.local(), f.local(), f.local(), f.local());
    f.line(3);
    f.resolve(target, "g");
    let try_start = f.pc();
    call(&mut f, result, target, None, &[]);
    let try_end = f.pc();
    f.ret(result);
    let catch = f.pc();
    f.line(5);
    f.emit(Instruction::Catch { dst: caught });
    f.get_by_id(message, caught, "message");
    f.ret(message);
    f.handler(try_start, try_end, catch, 0);

    let mut p = CodeBlockBuilder::program("exceptions");
    let functions = [
        ("f", p.nested(f.finish())),
        ("g", p.nested(g.finish())),
        ("h", p.nested(h.finish())),
    ];
    let (function, result) = (p.local(), p.local());
    for (name, index) in functions {
        p.new_function(function, index);
        p.declare_var(name, function);
    }
    p.line(15);
    p.resolve(function, "f");
    call(&mut p, result, function, None, &[]);
    p.ret(result);
    p.finish()
}

/// `function f(a, b, c) { return arguments.length + (c === undefined) }`
/// called with one argument.
pub fn arity(_: u32) -> UnlinkedCodeBlock {
    let mut f = CodeBlockBuilder::function("f", 3);
    let arguments = f.arguments();
    let (length, missing, undefined) = (f.local(), f.local(), f.local());
    f.emit(Instruction::CreateArguments { dst: arguments });
    f.get_by_id(length, arguments, "length");
    f.load_value(undefined, Value::UNDEFINED);
    f.emit(Instruction::StrictEq {
        dst: missing,
        lhs: Register::argument(2),
        rhs: undefined,
    });
    let skip = f.emit(Instruction::JumpIfFalse {
        cond: missing,
        target: 0,
    });
    f.load_int(missing, 1);
    f.emit(Instruction::Add {
        dst: length,
        lhs: length,
        rhs: missing,
    });
    let end = f.pc();
    f.patch_jump(skip, end);
    f.emit(Instruction::TearOffArguments { arguments });
    f.ret(length);

    let mut p = CodeBlockBuilder::program("arity");
    let function = p.nested(f.finish());
    let (callee, argument, result) = (p.local(), p.local(), p.local());
    p.new_function(callee, function);
    p.load_int(argument, 10);
    call(&mut p, result, callee, None, &[argument]);
    p.ret(result);
    p.finish()
}

/// `function recurse(n) { return recurse(n + 1) }`
pub fn overflow(_: u32) -> UnlinkedCodeBlock {
    let mut f = CodeBlockBuilder::function("recurse", 1);
    let (target, next, one, result) = (f.local(), f.local(), f.local(), f.local());
    f.line(2);
    f.resolve(target, "recurse");
    f.load_int(one, 1);
    f.emit(Instruction::Add {
        dst: next,
        lhs: Register::argument(0),
        rhs: one,
    });
    call(&mut f, result, target, None, &[next]);
    f.ret(result);

    let mut p = CodeBlockBuilder::program("overflow");
    let function = p.nested(f.finish());
    let (callee, start, result) = (p.local(), p.local(), p.local());
    p.new_function(callee, function);
    p.declare_var("recurse", callee);
    p.load_int(start, 0);
    call(&mut p, result, callee, None, &[start]);
    p.ret(result);
    p.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorType, EvaluationError, GetByIdState, PutByIdState, VM, VMSettings};

    fn vm() -> VM {
        VM::new(VMSettings::default()).unwrap()
    }

    #[test]
    fn property_warmup_goes_monomorphic() {
        let mut vm = vm();
        let code_block = vm.link_code_block(&property_warmup(50)).unwrap();
        assert_eq!(vm.run_program(code_block).unwrap(), Value::from_i64(1225));
        let code = vm.code_block(code_block);
        assert!(matches!(code.get_by_id[0].state(), GetByIdState::Monomorphic(_)));
        assert_eq!(code.get_by_id[0].counters.hits, 49);
        assert!(matches!(code.put_by_id[0].state(), PutByIdState::Monomorphic(_)));
    }

    #[test]
    fn closures_share_the_captured_binding() {
        let mut vm = vm();
        assert_eq!(vm.evaluate(&closures(3)).unwrap(), Value::from_i64(3));
        assert_eq!(vm.stats.activation_tear_offs, 1);
    }

    #[test]
    fn exceptions_are_caught_two_frames_up() {
        let mut vm = vm();
        let result = vm.evaluate(&exceptions(0)).unwrap();
        assert_eq!(vm.string_value(result), Some("undeclared is not defined"));
        assert_eq!(vm.stats.frames_unwound, 2);
        assert_eq!(vm.last_exception_stack.len(), 4);
        assert_eq!(vm.last_exception_stack[0].line, Some(12));
    }

    #[test]
    fn arity_fixup_pads_with_undefined() {
        let mut vm = vm();
        assert_eq!(vm.evaluate(&arity(0)).unwrap(), Value::from_i64(2));
    }

    #[test]
    fn overflow_is_a_range_error() {
        let mut vm = VM::new(VMSettings {
            register_file_capacity: 16 * 1024,
            register_segment_size: 1024,
            ..VMSettings::default()
        })
        .unwrap();
        let Err(EvaluationError::Uncaught(uncaught)) = vm.evaluate(&overflow(0)) else {
            panic!("expected a stack overflow");
        };
        assert_eq!(vm.error_type(uncaught.value), Some(ErrorType::RangeError));
        assert_eq!(vm.register_file.end(), 0);
    }

    #[test]
    fn demos_are_found_by_name() {
        assert_eq!(find("closures").map(|demo| demo.name), Some("closures"));
        assert!(find("missing").is_none());
    }
}
