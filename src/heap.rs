//! The two-space cell heap, its copying collector, and the root table.
//!
//! Cells live in a single backing vector: the static atoms first, then
//! two equal semispaces. Allocation is a bump of `next` inside the
//! active semispace. Collection is Cheney's algorithm: roots are
//! forwarded into the idle semispace, then a scan pointer chases the
//! allocation pointer rewriting children until the two meet.

use crate::expr::{atom, Cell, Expr, ExprRef, STATIC_EXPRS};
use crate::Error;
use log::debug;

/// Upper bound on a semispace so every cell index fits an `ExprRef`.
const MAX_SEMI_CELLS: usize = (u32::MAX as usize - atom::COUNT) / 2 - 1;

pub struct Heap {
    cells: Vec<Cell>,
    semi_cells: usize,
    /// Start of the active semispace.
    from_base: usize,
    /// Start of the idle semispace.
    to_base: usize,
    /// Next free cell (absolute index into `cells`).
    next: usize,
    /// Collection scan pointer; only meaningful mid-collection.
    scan: usize,
    collections: u64,
    allocations: u64,
}

impl Heap {
    pub fn new(semi_cells: usize) -> Result<Heap, Error> {
        if semi_cells == 0 || semi_cells > MAX_SEMI_CELLS {
            return Err(Error::OutOfMemory);
        }
        let total = atom::COUNT + 2 * semi_cells;
        let mut cells = vec![
            Cell {
                expr: Expr::I,
                forward: ExprRef::NIL,
            };
            total
        ];
        for (i, e) in STATIC_EXPRS.iter().enumerate() {
            cells[i].expr = *e;
        }
        Ok(Heap {
            cells,
            semi_cells,
            from_base: atom::COUNT,
            to_base: atom::COUNT + semi_cells,
            next: atom::COUNT,
            scan: 0,
            collections: 0,
            allocations: 0,
        })
    }

    pub fn get(&self, r: ExprRef) -> Expr {
        self.cells[r.index()].expr
    }

    /// Destructively rewrite a cell. Every holder of `r` observes the
    /// new expression; the caller is responsible for the new value
    /// denoting the same function as the old one.
    pub fn set(&mut self, r: ExprRef, e: Expr) {
        debug_assert!(!is_static(r), "attempted to rewrite a static atom");
        self.cells[r.index()].expr = e;
    }

    /// True if `n` more cells fit without a collection.
    pub fn fits(&self, n: usize) -> bool {
        self.next + n <= self.from_base + self.semi_cells
    }

    /// Bump-allocate one cell. The caller must already have verified
    /// space with `fits` (normally via `Machine::check`).
    pub fn alloc(&mut self, e: Expr) -> ExprRef {
        debug_assert!(self.fits(1), "allocation without a preceding check");
        let i = self.next;
        self.next += 1;
        self.allocations += 1;
        self.cells[i] = Cell {
            expr: e,
            forward: ExprRef::NIL,
        };
        ExprRef(i as u32)
    }

    /// Allocation that refuses rather than collects. This is what the
    /// parser and startup use: at those points no root discipline is in
    /// force, so triggering a collection would be unsound.
    pub fn try_alloc(&mut self, e: Expr) -> Option<ExprRef> {
        if self.fits(1) {
            Some(self.alloc(e))
        } else {
            None
        }
    }

    pub fn collections(&self) -> u64 {
        self.collections
    }

    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    pub fn live_cells(&self) -> usize {
        self.next - self.from_base
    }

    /// Flip semispaces and reset the allocation and scan frontiers.
    /// The caller must forward every root and then call
    /// [`Heap::finish_collect`] before the next allocation.
    pub fn begin_collect(&mut self) {
        std::mem::swap(&mut self.from_base, &mut self.to_base);
        self.next = self.from_base;
        self.scan = self.from_base;
    }

    /// Relocate one reference into the active semispace, copying the
    /// cell on first visit. Static atoms and `NIL` pass through.
    pub fn forward(&mut self, r: ExprRef) -> ExprRef {
        if r == ExprRef::NIL || is_static(r) {
            return r;
        }
        let i = r.index();
        if self.cells[i].forward != ExprRef::NIL {
            return self.cells[i].forward;
        }
        let new = ExprRef(self.next as u32);
        self.cells[new.index()] = Cell {
            expr: self.cells[i].expr,
            forward: ExprRef::NIL,
        };
        self.next += 1;
        self.cells[i].forward = new;
        new
    }

    /// Drain the scan frontier: rewrite the children of every copied
    /// cell, copying what they reach. Copies cannot outrun the space
    /// because everything copied was live in a semispace of equal size.
    pub fn finish_collect(&mut self) {
        while self.scan < self.next {
            let e = self.cells[self.scan].expr;
            let rewritten = match e {
                Expr::A(f, x) => Expr::A(self.forward(f), self.forward(x)),
                Expr::K1(x) => Expr::K1(self.forward(x)),
                Expr::S1(x) => Expr::S1(self.forward(x)),
                Expr::S2(x, y) => Expr::S2(self.forward(x), self.forward(y)),
                Expr::I1(x) => Expr::I1(self.forward(x)),
                leaf => leaf,
            };
            self.cells[self.scan].expr = rewritten;
            self.scan += 1;
        }
        self.collections += 1;
        debug!(
            "gc #{}: {} cells live, {} free",
            self.collections,
            self.live_cells(),
            self.semi_cells - self.live_cells()
        );
    }

    /// True if `r` can be dereferenced right now: a static atom or a
    /// cell of the active semispace.
    pub fn is_valid_ref(&self, r: ExprRef) -> bool {
        is_static(r) || (r.index() >= self.from_base && r.index() < self.next)
    }

    /// Every currently allocated cell of the active semispace.
    #[cfg(test)]
    pub(crate) fn live_refs(&self) -> impl Iterator<Item = ExprRef> + '_ {
        (self.from_base..self.next).map(|i| ExprRef(i as u32))
    }
}

pub fn is_static(r: ExprRef) -> bool {
    r.index() < atom::COUNT
}

/// GC roots. Slot 0 is the top-level output list, slot 1 the numeral
/// currently being decoded; everything above is a stack used to keep
/// reducer-local references alive across collections.
pub struct RootTable {
    slots: Vec<ExprRef>,
}

pub const MAX_ROOTS: usize = 10_000;
const NAMED_SLOTS: usize = 2;

impl RootTable {
    pub fn new() -> RootTable {
        RootTable {
            slots: vec![ExprRef::NIL; NAMED_SLOTS],
        }
    }

    pub fn toplevel(&self) -> ExprRef {
        self.slots[0]
    }

    pub fn set_toplevel(&mut self, r: ExprRef) {
        self.slots[0] = r;
    }

    pub fn set_decoder(&mut self, r: ExprRef) {
        self.slots[1] = r;
    }

    pub fn push(&mut self, r: ExprRef) -> Result<(), Error> {
        if self.slots.len() == MAX_ROOTS {
            return Err(Error::Internal("root stack overflow"));
        }
        self.slots.push(r);
        Ok(())
    }

    pub fn pop(&mut self) -> ExprRef {
        debug_assert!(self.slots.len() > NAMED_SLOTS, "unbalanced root pop");
        self.slots.pop().unwrap_or(ExprRef::NIL)
    }

    /// Stack depth above the named slots.
    pub fn depth(&self) -> usize {
        self.slots.len() - NAMED_SLOTS
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ExprRef> {
        self.slots.iter_mut()
    }

    #[cfg(test)]
    pub(crate) fn as_slice(&self) -> &[ExprRef] {
        &self.slots
    }
}

impl Default for RootTable {
    fn default() -> Self {
        RootTable::new()
    }
}
