//! The evaluator: normal-order graph reduction over the cell heap,
//! the Church character cache, and the byte-at-a-time output loop.

use crate::expr::{atom, Expr, ExprRef};
use crate::heap::{Heap, RootTable};
use crate::Error;
use log::debug;
use std::io::{self, Read, Write};

const INC_NON_NUMBER: &str = "invalid output format (attempted to apply inc to a non-number)";
const APPLIED_NUMBER: &str = "invalid output format (attempted to apply a number)";
const NOT_A_NUMBER: &str = "invalid output format (result was not a number)";

/// One self-contained evaluator: heap, roots, character cache, the
/// reducer's ancestor stack, and the byte streams it reads and writes.
/// Independent machines share nothing, so tests can run several at
/// once.
pub struct Machine {
    heap: Heap,
    roots: RootTable,
    /// Church numerals for byte values 0..=255 plus the end-of-stream
    /// sentinel 256. Entries are rewritten in place by reduction, so
    /// the whole table is part of the GC root set.
    ccc: [ExprRef; 257],
    /// Application nodes above the cell currently being reduced,
    /// innermost last. Lives here rather than on the call stack so the
    /// collector can rewrite the entries when a reduction step triggers
    /// a collection.
    spine: Vec<ExprRef>,
    input: Box<dyn Read>,
    output: Box<dyn Write>,
    prim_apps: u64,
    part_apps: u64,
}

impl Machine {
    /// Build a machine with `semi_cells` cells per semispace and
    /// eagerly populate the character cache so the output fast path
    /// never allocates numerals.
    pub fn new(
        semi_cells: usize,
        input: Box<dyn Read>,
        output: Box<dyn Write>,
    ) -> Result<Machine, Error> {
        let mut heap = Heap::new(semi_cells)?;
        let mut ccc = [ExprRef::NIL; 257];
        ccc[0] = atom::KI;
        ccc[1] = atom::I;
        for i in 2..=256 {
            ccc[i] = heap
                .try_alloc(Expr::S2(atom::SKSK, ccc[i - 1]))
                .ok_or(Error::OutOfMemory)?;
        }
        Ok(Machine {
            heap,
            roots: RootTable::new(),
            ccc,
            spine: Vec::with_capacity(256),
            input,
            output,
            prim_apps: 0,
            part_apps: 0,
        })
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub(crate) fn church_char(&self, ch: usize) -> ExprRef {
        self.ccc[ch.min(256)]
    }

    /// Install `program` applied to the input stream as the top-level
    /// output list.
    pub fn load(&mut self, program: ExprRef) -> Result<(), Error> {
        let reader = self
            .heap
            .try_alloc(Expr::LazyRead)
            .ok_or(Error::OutOfMemory)?;
        let top = self
            .heap
            .try_alloc(Expr::A(program, reader))
            .ok_or(Error::OutOfMemory)?;
        self.roots.set_toplevel(top);
        Ok(())
    }

    /// Demand, decode, and print output bytes until the program yields
    /// a value ≥ 256; the exit status is that value minus 256.
    pub fn run(&mut self) -> Result<i32, Error> {
        loop {
            self.check(1)?;
            let top = self.roots.toplevel();
            let head = self.heap.alloc(Expr::A(top, atom::K));
            let ch = self.church_to_int(head)?;
            if ch >= 256 {
                debug!(
                    "done: {} reductions, {} primitive steps, {} cells allocated, {} collections",
                    self.part_apps,
                    self.prim_apps,
                    self.heap.allocations(),
                    self.heap.collections()
                );
                return Ok((ch - 256) as i32);
            }
            self.output
                .write_all(&[ch as u8])
                .and_then(|_| self.output.flush())
                .map_err(|_| Error::Internal("write to standard output failed"))?;

            self.check(1)?;
            let top = self.roots.toplevel();
            let tail = self.heap.alloc(Expr::A(top, atom::KI));
            self.roots.set_toplevel(tail);
        }
    }

    /// Apply a Church numeral to `Inc` and `Num(0)` and reduce,
    /// yielding the numeral's integer value.
    pub(crate) fn church_to_int(&mut self, church: ExprRef) -> Result<i64, Error> {
        let mut church = church;
        self.check_rooted(2, &mut church)?;
        let partial = self.heap.alloc(Expr::A(church, atom::INC));
        let decoder = self.heap.alloc(Expr::A(partial, atom::NUM0));
        self.roots.set_decoder(decoder);
        let result = self.reduce(decoder)?;
        self.roots.set_decoder(ExprRef::NIL);
        match self.heap.get(result) {
            Expr::Num(n) => Ok(n),
            _ => Err(Error::Runtime(NOT_A_NUMBER)),
        }
    }

    /// Reduce `node` to weak head normal form: follow the left spine
    /// down to a non-application, then repeatedly rewrite the innermost
    /// application with one primitive step. Ancestors are kept on
    /// `self.spine`, not the call stack, so the walk is iterative and
    /// collection-safe at every allocation point.
    pub(crate) fn reduce(&mut self, node: ExprRef) -> Result<ExprRef, Error> {
        self.part_apps += 1;
        let base = self.spine.len();
        let mut cur = node;
        loop {
            cur = self.drop_i1(cur);
            while let Expr::A(fun, _) = self.heap.get(cur) {
                self.spine.push(cur);
                cur = self.drop_i1(fun);
            }
            if self.spine.len() == base {
                return Ok(cur);
            }
            let Some(e) = self.spine.pop() else {
                return Err(Error::Internal("reducer spine underflow"));
            };
            cur = self.apply_primitive(e, cur)?;
        }
    }

    /// Skip a chain of `I1` cells, rewriting the outermost one to point
    /// straight at the bottom of the chain.
    fn drop_i1(&mut self, r: ExprRef) -> ExprRef {
        let mut cur = r;
        if let Expr::I1(x) = self.heap.get(cur) {
            let outermost = cur;
            cur = x;
            while let Expr::I1(x) = self.heap.get(cur) {
                cur = x;
            }
            self.heap.set(outermost, Expr::I1(cur));
        }
        cur
    }

    /// One reduction step on the application `e`, whose function part
    /// has already reached head normal form as `lhs`. `e` is rewritten
    /// in place so every other holder of the reference sees the reduct;
    /// the returned ref is where reduction continues.
    fn apply_primitive(&mut self, mut e: ExprRef, lhs: ExprRef) -> Result<ExprRef, Error> {
        self.prim_apps += 1;
        let Expr::A(_, rhs) = self.heap.get(e) else {
            return Err(Error::Internal("primitive rewrite on a non-application"));
        };
        // Put the compressed function part back in place; from here on
        // `e` keeps `lhs` and `rhs` alive across collections.
        self.heap.set(e, Expr::A(lhs, rhs));

        match self.heap.get(lhs) {
            Expr::I => {
                self.heap.set(e, Expr::I1(rhs));
                Ok(rhs)
            }
            Expr::K => {
                self.heap.set(e, Expr::K1(rhs));
                Ok(e)
            }
            Expr::K1(x) => {
                self.heap.set(e, Expr::I1(x));
                Ok(x)
            }
            Expr::S => {
                self.heap.set(e, Expr::S1(rhs));
                Ok(e)
            }
            Expr::S1(x) => {
                self.heap.set(e, Expr::S2(x, rhs));
                Ok(e)
            }
            Expr::LazyRead => {
                // 6 cells: 4 here, 2 in the S2 rewrite we fall into.
                self.check_rooted(6, &mut e)?;
                let Expr::A(reader, _) = self.heap.get(e) else {
                    return Err(Error::Internal("lazy-read application vanished"));
                };
                let ch = self.read_byte();
                let head = self.heap.alloc(Expr::K1(self.ccc[ch]));
                let pair_head = self.heap.alloc(Expr::S2(atom::I, head));
                let next_reader = self.heap.alloc(Expr::LazyRead);
                let tail = self.heap.alloc(Expr::K1(next_reader));
                // Rewrite the LazyRead cell itself: every holder of the
                // stream sees this byte exactly once.
                self.heap.set(reader, Expr::S2(pair_head, tail));
                self.rewrite_s2(e)
            }
            Expr::S2(..) => {
                self.check_rooted(2, &mut e)?;
                self.rewrite_s2(e)
            }
            Expr::Inc => {
                // The one place evaluation of an argument is forced.
                // Recursion depth is bounded by the decoded integer.
                self.roots.push(e)?;
                let forced = self.reduce(rhs)?;
                let e = self.roots.pop();
                let Expr::Num(n) = self.heap.get(forced) else {
                    return Err(Error::Runtime(INC_NON_NUMBER));
                };
                let n = n.checked_add(1).ok_or(Error::Runtime(INC_NON_NUMBER))?;
                self.heap.set(e, Expr::Num(n));
                Ok(e)
            }
            Expr::Num(_) => Err(Error::Runtime(APPLIED_NUMBER)),
            Expr::A(..) | Expr::I1(_) => {
                Err(Error::Internal("invalid tag in primitive rewrite"))
            }
        }
    }

    /// `S2(x, y)` applied to `z` becomes `A(A(x, z), A(y, z))`, the
    /// branching rewrite that shares `z` between both sides. The caller
    /// has reserved the two cells.
    fn rewrite_s2(&mut self, e: ExprRef) -> Result<ExprRef, Error> {
        let Expr::A(lhs, rhs) = self.heap.get(e) else {
            return Err(Error::Internal("s2 rewrite on a non-application"));
        };
        let Expr::S2(x, y) = self.heap.get(lhs) else {
            return Err(Error::Internal("s2 rewrite without an S2 head"));
        };
        let left = self.heap.alloc(Expr::A(x, rhs));
        let right = self.heap.alloc(Expr::A(y, rhs));
        self.heap.set(e, Expr::A(left, right));
        Ok(e)
    }

    fn read_byte(&mut self) -> usize {
        let mut buf = [0u8; 1];
        loop {
            match self.input.read(&mut buf) {
                Ok(0) => return 256,
                Ok(_) => return buf[0] as usize,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return 256,
            }
        }
    }

    /// Verify space for `n` cells, collecting if needed. Every live
    /// reference the caller holds must be reachable from the root set
    /// before calling this.
    fn check(&mut self, n: usize) -> Result<(), Error> {
        if !self.heap.fits(n) {
            self.gc();
            if !self.heap.fits(n) {
                return Err(Error::OutOfMemory);
            }
        }
        Ok(())
    }

    /// `check` for the reducer: keeps `e` alive and relocated across a
    /// collection. The ancestor spine and the named slots are standing
    /// roots, so one transient slot covers the rewrite in progress.
    fn check_rooted(&mut self, n: usize, e: &mut ExprRef) -> Result<(), Error> {
        if self.heap.fits(n) {
            return Ok(());
        }
        self.roots.push(*e)?;
        let res = self.check(n);
        *e = self.roots.pop();
        res
    }

    fn gc(&mut self) {
        self.heap.begin_collect();
        for slot in self.roots.iter_mut() {
            *slot = self.heap.forward(*slot);
        }
        for entry in self.ccc.iter_mut() {
            *entry = self.heap.forward(*entry);
        }
        for anc in self.spine.iter_mut() {
            *anc = self.heap.forward(*anc);
        }
        self.heap.finish_collect();
    }

    #[cfg(test)]
    fn integrity(&self) -> bool {
        let valid = |r: ExprRef| self.heap.is_valid_ref(r);
        let cell_ok = |r: ExprRef| match self.heap.get(r) {
            Expr::A(f, x) | Expr::S2(f, x) => valid(f) && valid(x),
            Expr::K1(x) | Expr::S1(x) | Expr::I1(x) => valid(x),
            _ => true,
        };
        self.roots
            .as_slice()
            .iter()
            .all(|&r| r == ExprRef::NIL || (valid(r) && cell_ok(r)))
            && self.ccc.iter().all(|&r| valid(r) && cell_ok(r))
            && self.spine.iter().all(|&r| valid(r) && cell_ok(r))
            && self.heap.live_refs().all(cell_ok)
    }

    #[cfg(test)]
    fn root_depth(&self) -> usize {
        self.roots.depth()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn machine(semi_cells: usize) -> Machine {
        Machine::new(semi_cells, Box::new(io::empty()), Box::new(io::sink()))
            .expect("heap too small for the character cache")
    }

    fn machine_with_input(semi_cells: usize, input: &[u8]) -> Machine {
        Machine::new(
            semi_cells,
            Box::new(io::Cursor::new(input.to_vec())),
            Box::new(io::sink()),
        )
        .expect("heap too small for the character cache")
    }

    fn app(m: &mut Machine, f: ExprRef, x: ExprRef) -> ExprRef {
        m.heap.try_alloc(Expr::A(f, x)).expect("test heap exhausted")
    }

    #[test]
    fn test_church_cache_round_trip() {
        let mut m = machine(4096);
        for n in 0..=256 {
            let c = m.church_char(n);
            assert_eq!(m.church_to_int(c).unwrap(), n as i64, "ccc[{}]", n);
        }
        assert_eq!(m.root_depth(), 0);
    }

    type Builder = fn(&mut Machine) -> ExprRef;

    #[test]
    fn test_reduce_idempotent() {
        let cases: [Builder; 3] = [
            |m| {
                let sk = app(m, atom::S, atom::K);
                let skk = app(m, sk, atom::K);
                app(m, skk, atom::S)
            },
            |m| app(m, atom::I, atom::K),
            |m| {
                let ik = app(m, atom::I, atom::K);
                app(m, ik, atom::S)
            },
        ];
        for mk in cases {
            let mut m = machine(4096);
            let e = mk(&mut m);
            let once = m.reduce(e).unwrap();
            let twice = m.reduce(once).unwrap();
            assert_eq!(once, twice, "reduce must be idempotent");
        }
    }

    #[test]
    fn test_rewrites_are_seen_through_sharing() {
        let mut m = machine(4096);
        let e = app(&mut m, atom::I, atom::K);
        let holder = app(&mut m, e, atom::S);
        let r = m.reduce(e).unwrap();
        assert_eq!(r, atom::K);
        // The shared cell was rewritten in place, so the other holder
        // observes the reduced value.
        assert_eq!(m.heap.get(e), Expr::I1(atom::K));
        let reduced_holder = m.reduce(holder).unwrap();
        // (I K) S  ==  K S, in head normal form a K1.
        assert!(matches!(m.heap.get(reduced_holder), Expr::K1(_)));
    }

    #[test]
    fn test_i1_chain_is_compressed() {
        let mut m = machine(4096);
        let c1 = m.heap.try_alloc(Expr::I1(atom::K)).unwrap();
        let c2 = m.heap.try_alloc(Expr::I1(c1)).unwrap();
        let c3 = m.heap.try_alloc(Expr::I1(c2)).unwrap();
        let r = m.reduce(c3).unwrap();
        assert_eq!(r, atom::K);
        assert_eq!(m.heap.get(c3), Expr::I1(atom::K));
    }

    #[test]
    fn test_applying_a_number_is_a_runtime_error() {
        let mut m = machine(4096);
        let e = app(&mut m, atom::NUM0, atom::K);
        match m.reduce(e) {
            Err(Error::Runtime(msg)) => assert!(msg.contains("apply a number")),
            other => panic!("expected a runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_inc_of_non_number_is_a_runtime_error() {
        let mut m = machine(4096);
        let e = app(&mut m, atom::INC, atom::K);
        match m.reduce(e) {
            Err(Error::Runtime(msg)) => assert!(msg.contains("inc")),
            other => panic!("expected a runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_non_numeral_is_a_runtime_error() {
        let mut m = machine(4096);
        // K applied to Inc and Num(0) leaves Inc, not a number.
        match m.church_to_int(atom::K) {
            Err(Error::Runtime(msg)) => assert!(msg.contains("not a number")),
            other => panic!("expected a runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_collection_during_reduction() {
        // Just enough headroom over the 255 cache cells that repeated
        // numeral decoding has to collect over and over mid-reduction.
        let mut m = machine(600);
        for _ in 0..100 {
            let c = m.church_char(32);
            assert_eq!(m.church_to_int(c).unwrap(), 32);
        }
        assert!(m.heap.collections() >= 2, "test did not stress gc");
        assert!(m.integrity());
        assert_eq!(m.root_depth(), 0);
        assert!(m.spine.is_empty());
    }

    #[test]
    fn test_gc_keeps_roots_and_cache_valid() {
        let mut m = machine(4096);
        let e = app(&mut m, atom::I, atom::K);
        let top = app(&mut m, e, atom::S);
        m.roots.set_toplevel(top);
        m.gc();
        assert!(m.integrity());
        let top = m.roots.toplevel();
        assert!(m.heap.is_valid_ref(top));
        assert!(matches!(m.heap.get(top), Expr::A(..)));
        for n in 0..=256 {
            assert!(m.heap.is_valid_ref(m.church_char(n)));
        }
    }

    #[test]
    fn test_out_of_memory_after_collection() {
        let mut m = machine(300);
        // Chain every new cell onto the toplevel root so nothing is
        // collectable; check() must eventually give up.
        let mut top = atom::I;
        loop {
            if !m.heap.fits(1) {
                match m.check(1) {
                    Ok(()) => {
                        top = m.roots.toplevel();
                        continue;
                    }
                    Err(Error::OutOfMemory) => break,
                    other => panic!("expected out-of-memory, got {:?}", other),
                }
            }
            top = app(&mut m, atom::K, top);
            m.roots.set_toplevel(top);
        }
    }

    #[test]
    fn test_lazy_read_rewrites_in_place() {
        let mut m = machine_with_input(4096, b"AB");
        let reader = m.heap.try_alloc(Expr::LazyRead).unwrap();
        // Two distinct applications of the same stream cell.
        let first = app(&mut m, reader, atom::K);
        let second = app(&mut m, reader, atom::K);
        m.roots.set_toplevel(second);
        assert_eq!(m.church_to_int(first).unwrap(), b'A' as i64);
        // The second holder must see the same byte, not consume 'B'.
        let second = m.roots.toplevel();
        assert_eq!(m.church_to_int(second).unwrap(), b'A' as i64);
    }

    #[test]
    fn test_lazy_read_end_of_stream_is_256_forever() {
        let mut m = machine_with_input(4096, b"");
        let reader = m.heap.try_alloc(Expr::LazyRead).unwrap();
        let head = app(&mut m, reader, atom::K);
        m.roots.set_toplevel(reader);
        assert_eq!(m.church_to_int(head).unwrap(), 256);
        // The tail keeps yielding the sentinel.
        let reader = m.roots.toplevel();
        let tail = app(&mut m, reader, atom::KI);
        let head2 = app(&mut m, tail, atom::K);
        assert_eq!(m.church_to_int(head2).unwrap(), 256);
    }

    // A deliberately naive recursive evaluator over boxed trees; the
    // iterative reducer must agree with it on weak head normal forms.
    #[derive(Debug)]
    enum Tree {
        S,
        K,
        I,
        K1(Rc<Tree>),
        S1(Rc<Tree>),
        S2(Rc<Tree>, Rc<Tree>),
        App(Rc<Tree>, Rc<Tree>),
    }

    fn tree_whnf(t: Rc<Tree>) -> Rc<Tree> {
        match &*t {
            Tree::App(f, x) => {
                let f = tree_whnf(f.clone());
                match &*f {
                    Tree::I => tree_whnf(x.clone()),
                    Tree::K => Rc::new(Tree::K1(x.clone())),
                    Tree::K1(y) => tree_whnf(y.clone()),
                    Tree::S => Rc::new(Tree::S1(x.clone())),
                    Tree::S1(y) => Rc::new(Tree::S2(y.clone(), x.clone())),
                    Tree::S2(y, z) => tree_whnf(Rc::new(Tree::App(
                        Rc::new(Tree::App(y.clone(), x.clone())),
                        Rc::new(Tree::App(z.clone(), x.clone())),
                    ))),
                    Tree::App(..) => unreachable!("whnf returned an application"),
                }
            }
            _ => t,
        }
    }

    fn mirror(m: &Machine, r: ExprRef) -> Rc<Tree> {
        Rc::new(match m.heap.get(r) {
            Expr::S => Tree::S,
            Expr::K => Tree::K,
            Expr::I => Tree::I,
            Expr::K1(x) => Tree::K1(mirror(m, x)),
            Expr::S1(x) => Tree::S1(mirror(m, x)),
            Expr::S2(x, y) => Tree::S2(mirror(m, x), mirror(m, y)),
            Expr::A(f, x) => Tree::App(mirror(m, f), mirror(m, x)),
            Expr::I1(x) => return mirror(m, x),
            other => panic!("not mirrorable: {:?}", other),
        })
    }

    fn head_class(m: &Machine, r: ExprRef) -> &'static str {
        match m.heap.get(r) {
            Expr::S => "S",
            Expr::K => "K",
            Expr::I => "I",
            Expr::K1(_) => "K1",
            Expr::S1(_) => "S1",
            Expr::S2(..) => "S2",
            other => panic!("unexpected whnf {:?}", other),
        }
    }

    fn tree_class(t: &Tree) -> &'static str {
        match t {
            Tree::S => "S",
            Tree::K => "K",
            Tree::I => "I",
            Tree::K1(_) => "K1",
            Tree::S1(_) => "S1",
            Tree::S2(..) => "S2",
            Tree::App(..) => panic!("unexpected whnf App"),
        }
    }

    #[test]
    fn test_agrees_with_recursive_reference_evaluator() {
        let cases: Vec<(&str, Builder)> = vec![
            ("I K", |m| app(m, atom::I, atom::K)),
            ("(K S) I", |m| {
                let ks = app(m, atom::K, atom::S);
                app(m, ks, atom::I)
            }),
            ("(S K) K", |m| {
                let sk = app(m, atom::S, atom::K);
                app(m, sk, atom::K)
            }),
            ("((S K) K) S", |m| {
                let sk = app(m, atom::S, atom::K);
                let skk = app(m, sk, atom::K);
                app(m, skk, atom::S)
            }),
            ("((S S) K) I", |m| {
                let ss = app(m, atom::S, atom::S);
                let ssk = app(m, ss, atom::K);
                app(m, ssk, atom::I)
            }),
            ("(S (K S)) K", |m| {
                let ks = app(m, atom::K, atom::S);
                let sks = app(m, atom::S, ks);
                app(m, sks, atom::K)
            }),
        ];
        for (name, build) in cases {
            let mut m = machine(4096);
            let term = build(&mut m);
            let reference = tree_whnf(mirror(&m, term));
            let got = m.reduce(term).unwrap();
            assert_eq!(
                head_class(&m, got),
                tree_class(&reference),
                "term {}",
                name
            );
        }
    }
}
