//! Observational debugger hooks.

use crate::{CallFrame, Exception, VM};

/// Callbacks the interpreter invokes when a debugger is attached. All
/// methods default to doing nothing.
pub trait Debugger {
    fn call_entered(&mut self, _vm: &VM, _frame: CallFrame) {}

    fn will_return(&mut self, _vm: &VM, _frame: CallFrame) {}

    fn at_statement(&mut self, _vm: &VM, _frame: CallFrame, _line: u32) {}

    /// `has_handler` tells whether the throwing frame catches it itself.
    fn exception(&mut self, _vm: &VM, _frame: CallFrame, _exception: &Exception, _has_handler: bool) {}
}

impl VM {
    /// Run `hook` against the attached debugger, if any.
    pub(crate) fn notify_debugger(&mut self, hook: impl FnOnce(&mut dyn Debugger, &VM)) {
        if let Some(mut debugger) = self.debugger.take() {
            hook(debugger.as_mut(), self);
            self.debugger = Some(debugger);
        }
    }
}
