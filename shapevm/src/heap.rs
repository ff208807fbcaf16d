//! Cell arena with a non-moving mark-and-sweep collector.
//!
//! The engine core only talks to the collector through three entry points:
//! [`Heap::allocate`], [`Heap::write_barrier`] and [`Heap::collect`]. Cells are
//! addressed by [`CellId`] handles instead of raw pointers, so a reclaimed
//! cell can never be observed through a stale reference without tripping the
//! `use of reclaimed cell` check.
//!
//! Consumers provide a [`RootProvider`] to supply live roots at collection
//! time. Collections only happen at safepoints chosen by the interpreter.

use crate::{GetterSetter, JsObject, Scope, Value};

/// Handle to a cell in the [`Heap`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CellId(u32);

impl CellId {
    #[inline(always)]
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    #[inline(always)]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl core::fmt::Debug for CellId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Cell({})", self.0)
    }
}

/// Every heap-allocated entity the engine core knows about.
#[derive(Debug)]
pub enum Cell {
    Object(JsObject),
    Scope(Scope),
    String(Box<str>),
    Number(f64),
    GetterSetter(GetterSetter),
}

impl Cell {
    /// Call `visitor` for every value edge of this cell.
    pub fn trace(&self, visitor: &mut dyn FnMut(Value)) {
        match self {
            Cell::Object(object) => object.trace(visitor),
            Cell::Scope(scope) => scope.trace(visitor),
            Cell::GetterSetter(pair) => {
                visitor(pair.getter);
                visitor(pair.setter);
            }
            Cell::String(_) | Cell::Number(_) => {}
        }
    }
}

/// Consumers implement this to provide GC roots.
///
/// Called at safepoints to discover live roots from VM state (the register
/// file, special objects, code block constants and cache contents).
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(Value));
}

/// Collection statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub collections: u64,
    pub cells_allocated: u64,
    pub cells_freed: u64,
    /// Number of barrier calls that added an owner to the remembered set.
    pub barrier_hits: u64,
    pub live_after_last_collection: usize,
}

#[derive(Debug)]
struct HeapSlot {
    cell: Option<Cell>,
    marked: bool,
    /// Survived at least one collection.
    old: bool,
    remembered: bool,
}

#[derive(Debug)]
pub struct Heap {
    slots: Vec<HeapSlot>,
    free: Vec<u32>,
    live: usize,
    allocated_since_collection: usize,
    collect_threshold: usize,
    remembered: Vec<CellId>,
    stats: GcStats,
}

impl Heap {
    pub fn new(collect_threshold: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            allocated_since_collection: 0,
            collect_threshold: collect_threshold.max(1),
            remembered: Vec::new(),
            stats: GcStats::default(),
        }
    }

    /// Allocate `cell` and return its handle. Never collects.
    pub fn allocate(&mut self, cell: Cell) -> CellId {
        self.live += 1;
        self.allocated_since_collection += 1;
        self.stats.cells_allocated += 1;

        let slot = HeapSlot {
            cell: Some(cell),
            marked: false,
            old: false,
            remembered: false,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = slot;
                CellId(index)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(slot);
                CellId(index)
            }
        }
    }

    pub fn allocate_string(&mut self, s: &str) -> Value {
        Value::from_cell(self.allocate(Cell::String(s.into())))
    }

    pub fn allocate_number(&mut self, n: f64) -> Value {
        Value::from_cell(self.allocate(Cell::Number(n)))
    }

    #[inline]
    pub fn try_get(&self, id: CellId) -> Option<&Cell> {
        self.slots.get(id.0 as usize).and_then(|s| s.cell.as_ref())
    }

    #[inline]
    pub fn get(&self, id: CellId) -> &Cell {
        match self.try_get(id) {
            Some(cell) => cell,
            None => panic!("use of reclaimed cell {id:?}"),
        }
    }

    #[inline]
    pub fn get_mut(&mut self, id: CellId) -> &mut Cell {
        match self.slots.get_mut(id.0 as usize).and_then(|s| s.cell.as_mut()) {
            Some(cell) => cell,
            None => panic!("use of reclaimed cell {id:?}"),
        }
    }

    #[inline]
    pub fn object(&self, id: CellId) -> Option<&JsObject> {
        match self.try_get(id) {
            Some(Cell::Object(object)) => Some(object),
            _ => None,
        }
    }

    #[inline]
    pub fn object_mut(&mut self, id: CellId) -> Option<&mut JsObject> {
        match self.slots.get_mut(id.0 as usize).and_then(|s| s.cell.as_mut()) {
            Some(Cell::Object(object)) => Some(object),
            _ => None,
        }
    }

    #[inline]
    pub fn scope(&self, id: CellId) -> Option<&Scope> {
        match self.try_get(id) {
            Some(Cell::Scope(scope)) => Some(scope),
            _ => None,
        }
    }

    #[inline]
    pub fn scope_mut(&mut self, id: CellId) -> Option<&mut Scope> {
        match self.slots.get_mut(id.0 as usize).and_then(|s| s.cell.as_mut()) {
            Some(Cell::Scope(scope)) => Some(scope),
            _ => None,
        }
    }

    #[inline]
    pub fn string(&self, id: CellId) -> Option<&str> {
        match self.try_get(id) {
            Some(Cell::String(s)) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn number(&self, id: CellId) -> Option<f64> {
        match self.try_get(id) {
            Some(Cell::Number(n)) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn getter_setter(&self, id: CellId) -> Option<&GetterSetter> {
        match self.try_get(id) {
            Some(Cell::GetterSetter(pair)) => Some(pair),
            _ => None,
        }
    }

    /// Record that `owner` now references `value`.
    ///
    /// Must be called on every pointer-field store into an existing cell.
    /// Old owners that gain a reference to a young cell enter the
    /// remembered set.
    pub fn write_barrier(&mut self, owner: CellId, value: Value) {
        let Some(target) = value.as_cell() else {
            return;
        };
        let target_old = self
            .slots
            .get(target.0 as usize)
            .is_some_and(|slot| slot.old);
        let Some(slot) = self.slots.get_mut(owner.0 as usize) else {
            return;
        };
        if slot.old && !target_old && !slot.remembered {
            slot.remembered = true;
            self.remembered.push(owner);
            self.stats.barrier_hits += 1;
        }
    }

    pub fn remembered_set_len(&self) -> usize {
        self.remembered.len()
    }

    #[inline]
    pub fn should_collect(&self) -> bool {
        self.allocated_since_collection >= self.collect_threshold
    }

    /// Every allocated cell.
    pub fn cells(&self) -> impl Iterator<Item = (CellId, &Cell)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.cell.as_ref().map(|cell| (CellId(index as u32), cell))
        })
    }

    #[inline]
    pub fn live_cells(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Run a full collection. `finalize` sees every cell right before it
    /// is reclaimed. Returns the number of reclaimed cells.
    pub fn collect(
        &mut self,
        roots: &mut dyn RootProvider,
        mut finalize: impl FnMut(CellId, &Cell),
    ) -> usize {
        let mut worklist: Vec<CellId> = Vec::new();
        roots.visit_roots(&mut |value| {
            if let Some(cell) = value.as_cell() {
                worklist.push(cell);
            }
        });

        while let Some(id) = worklist.pop() {
            let Some(slot) = self.slots.get_mut(id.0 as usize) else {
                continue;
            };
            if slot.marked {
                continue;
            }
            let Some(cell) = slot.cell.as_ref() else {
                debug_assert!(false, "root or edge to reclaimed cell {id:?}");
                continue;
            };
            slot.marked = true;
            cell.trace(&mut |value| {
                if let Some(child) = value.as_cell() {
                    worklist.push(child);
                }
            });
        }

        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.cell.is_none() {
                continue;
            }
            if slot.marked {
                slot.marked = false;
                slot.old = true;
                slot.remembered = false;
                continue;
            }
            if let Some(cell) = slot.cell.take() {
                finalize(CellId(index as u32), &cell);
            }
            slot.old = false;
            slot.remembered = false;
            self.free.push(index as u32);
            freed += 1;
        }

        self.remembered.clear();
        self.live -= freed;
        self.allocated_since_collection = 0;
        self.stats.collections += 1;
        self.stats.cells_freed += freed as u64;
        self.stats.live_after_last_collection = self.live;
        log::debug!(
            "gc: reclaimed {freed} cells, {} live",
            self.live
        );
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Roots(Vec<Value>);

    impl RootProvider for Roots {
        fn visit_roots(&mut self, visitor: &mut dyn FnMut(Value)) {
            for v in &self.0 {
                visitor(*v);
            }
        }
    }

    #[test]
    fn unreachable_cells_are_reclaimed() {
        let mut heap = Heap::new(16);
        let kept = heap.allocate_string("kept");
        let _dropped = heap.allocate_string("dropped");
        assert_eq!(heap.live_cells(), 2);

        let freed = heap.collect(&mut Roots(vec![kept]), |_, _| {});
        assert_eq!(freed, 1);
        assert_eq!(heap.live_cells(), 1);
        assert_eq!(heap.string(kept.as_cell().unwrap()), Some("kept"));
    }

    #[test]
    fn getter_setter_edges_keep_targets_alive() {
        let mut heap = Heap::new(16);
        let getter = heap.allocate_string("getter");
        let pair = heap.allocate(Cell::GetterSetter(GetterSetter {
            getter,
            setter: Value::UNDEFINED,
        }));
        heap.collect(&mut Roots(vec![Value::from_cell(pair)]), |_, _| {});
        assert!(heap.try_get(getter.as_cell().unwrap()).is_some());
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new(16);
        let a = heap.allocate(Cell::Number(1.0));
        heap.collect(&mut Roots(vec![]), |_, _| {});
        let b = heap.allocate(Cell::Number(2.0));
        assert_eq!(a, b);
        assert_eq!(heap.number(b), Some(2.0));
    }

    #[test]
    fn barrier_remembers_old_owner_of_young_value() {
        let mut heap = Heap::new(16);
        let owner = heap.allocate(Cell::GetterSetter(GetterSetter {
            getter: Value::UNDEFINED,
            setter: Value::UNDEFINED,
        }));
        heap.collect(&mut Roots(vec![Value::from_cell(owner)]), |_, _| {});

        let young = heap.allocate_string("young");
        heap.write_barrier(owner, young);
        heap.write_barrier(owner, young);
        assert_eq!(heap.remembered_set_len(), 1);
        assert_eq!(heap.stats().barrier_hits, 1);

        heap.write_barrier(owner, Value::from_i64(3));
        assert_eq!(heap.remembered_set_len(), 1);
    }

    #[test]
    fn finalizer_sees_reclaimed_cells() {
        let mut heap = Heap::new(16);
        heap.allocate(Cell::Number(4.5));
        let mut seen = Vec::new();
        heap.collect(&mut Roots(vec![]), |id, cell| {
            if let Cell::Number(n) = cell {
                seen.push((id, *n));
            }
        });
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, 4.5);
    }

    #[test]
    #[should_panic(expected = "use of reclaimed cell")]
    fn reclaimed_cell_access_panics() {
        let mut heap = Heap::new(16);
        let id = heap.allocate(Cell::Number(1.0));
        heap.collect(&mut Roots(vec![]), |_, _| {});
        let _ = heap.get(id);
    }
}
