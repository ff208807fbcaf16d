//! Call site linking.
//!
//! A call site starts unlinked, remembers the first callee it sees and
//! links to it directly on the second matching call. Closures of one
//! function body that share a structure link through a closure stub
//! instead. Anything else makes the site virtual for good; there is no
//! polymorphic call list.

use crate::{CallTarget, CellId, CodeSpecializationKind, ExecutableId, StructureId};

/// What the slow path learned about the callee of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalleeIdentity {
    pub cell: CellId,
    /// `None` for host functions.
    pub executable: Option<ExecutableId>,
    pub structure: StructureId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallLinkState {
    Unlinked,
    SeenOnce {
        callee: CalleeIdentity,
    },
    Linked {
        callee: CalleeIdentity,
        target: CallTarget,
    },
    ClosureLinked {
        executable: ExecutableId,
        structure: StructureId,
        target: CallTarget,
    },
    Virtual,
}

impl CallLinkState {
    pub fn rank(&self) -> u8 {
        match self {
            CallLinkState::Unlinked => 0,
            CallLinkState::SeenOnce { .. } => 1,
            CallLinkState::Linked { .. } => 2,
            CallLinkState::ClosureLinked { .. } => 3,
            CallLinkState::Virtual => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallLinkInfo {
    kind: CodeSpecializationKind,
    state: CallLinkState,
    pub hits: u64,
    pub slow_path_count: u64,
}

impl CallLinkInfo {
    pub fn new(kind: CodeSpecializationKind) -> Self {
        Self {
            kind,
            state: CallLinkState::Unlinked,
            hits: 0,
            slow_path_count: 0,
        }
    }

    #[inline]
    pub fn kind(&self) -> CodeSpecializationKind {
        self.kind
    }

    #[inline]
    pub fn state(&self) -> &CallLinkState {
        &self.state
    }

    /// Linked target for `callee`, if the site is linked to it.
    #[inline]
    pub fn lookup(&self, callee: &CalleeIdentity) -> Option<CallTarget> {
        match self.state {
            CallLinkState::Linked { callee: linked, target } if linked.cell == callee.cell => {
                Some(target)
            }
            CallLinkState::ClosureLinked {
                executable,
                structure,
                target,
            } if callee.executable == Some(executable) && callee.structure == structure => {
                Some(target)
            }
            _ => None,
        }
    }

    /// Feed a call that went through the slow path.
    pub fn observe(&mut self, callee: CalleeIdentity, target: CallTarget) {
        self.slow_path_count += 1;
        self.state = match self.state {
            CallLinkState::Unlinked => CallLinkState::SeenOnce { callee },
            CallLinkState::SeenOnce { callee: seen } if seen.cell == callee.cell => {
                log::trace!("call link: linked to {:?}", callee.cell);
                CallLinkState::Linked { callee, target }
            }
            CallLinkState::SeenOnce { callee: seen } => Self::closure_or_virtual(seen, callee, target),
            CallLinkState::Linked { callee: linked, .. } => {
                Self::closure_or_virtual(linked, callee, target)
            }
            CallLinkState::ClosureLinked { .. } | CallLinkState::Virtual => CallLinkState::Virtual,
        };
        if self.state == CallLinkState::Virtual {
            log::trace!("call link: virtual");
        }
    }

    fn closure_or_virtual(
        seen: CalleeIdentity,
        callee: CalleeIdentity,
        target: CallTarget,
    ) -> CallLinkState {
        match (seen.executable, callee.executable) {
            (Some(a), Some(b)) if a == b && seen.structure == callee.structure => {
                log::trace!("call link: closure link for executable {}", a.index());
                CallLinkState::ClosureLinked {
                    executable: a,
                    structure: callee.structure,
                    target,
                }
            }
            _ => CallLinkState::Virtual,
        }
    }

    /// Callee cell the site keeps alive.
    pub fn callee(&self) -> Option<CellId> {
        match self.state {
            CallLinkState::SeenOnce { callee } => Some(callee.cell),
            CallLinkState::Linked { callee, .. } => Some(callee.cell),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArityCheckMode, CodeBlockId, ObjectClass, StructurePolicy, StructureTable, Value};

    fn target() -> CallTarget {
        CallTarget::Interpreted {
            code_block: CodeBlockId::from_index(0),
            arity: ArityCheckMode::ArityCheckNotRequired,
        }
    }

    fn identities() -> (StructureId, StructureId) {
        let mut structures = StructureTable::new(StructurePolicy::default());
        let a = structures.empty_structure(Value::NULL, ObjectClass::Function, 2);
        let b = structures.empty_structure(Value::UNDEFINED, ObjectClass::Function, 2);
        (a, b)
    }

    fn callee(cell: u32, executable: Option<ExecutableId>, structure: StructureId) -> CalleeIdentity {
        CalleeIdentity {
            cell: CellId::from_index(cell),
            executable,
            structure,
        }
    }

    #[test]
    fn second_matching_call_links() {
        let (s, _) = identities();
        let f = callee(1, None, s);
        let mut info = CallLinkInfo::new(CodeSpecializationKind::Call);
        assert_eq!(info.lookup(&f), None);
        info.observe(f, target());
        assert!(matches!(info.state(), CallLinkState::SeenOnce { .. }));
        info.observe(f, target());
        assert_eq!(info.lookup(&f), Some(target()));
        assert_eq!(info.callee(), Some(f.cell));
    }

    #[test]
    fn different_host_callee_goes_virtual() {
        let (s, _) = identities();
        let mut info = CallLinkInfo::new(CodeSpecializationKind::Call);
        info.observe(callee(1, None, s), CallTarget::Host);
        info.observe(callee(2, None, s), CallTarget::Host);
        assert_eq!(info.state(), &CallLinkState::Virtual);
        info.observe(callee(1, None, s), CallTarget::Host);
        assert_eq!(info.state(), &CallLinkState::Virtual);
        assert_eq!(info.slow_path_count, 3);
    }

    #[test]
    fn closures_of_one_body_share_a_link() {
        let (s, other) = identities();
        let mut builder = crate::CodeBlockBuilder::program("main");
        builder.nested(crate::CodeBlockBuilder::function("f", 0).finish());
        let mut vm = crate::VM::new(crate::VMSettings::default()).unwrap();
        let id = vm.link_code_block(&builder.finish()).unwrap();
        let exe = Some(vm.code_block(id).functions[0]);

        let mut info = CallLinkInfo::new(CodeSpecializationKind::Call);
        info.observe(callee(1, exe, s), target());
        info.observe(callee(2, exe, s), target());
        assert!(matches!(info.state(), CallLinkState::ClosureLinked { .. }));
        assert_eq!(info.lookup(&callee(3, exe, s)), Some(target()));
        assert_eq!(info.lookup(&callee(3, exe, other)), None);

        let before = info.state().rank();
        info.observe(callee(4, exe, other), target());
        assert!(info.state().rank() > before);
        assert_eq!(info.state(), &CallLinkState::Virtual);
    }
}
