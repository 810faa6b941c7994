//! Expression cells and the statically allocated combinator atoms.

/// Index of a cell, either in the static atom table or in one of the
/// heap semispaces. The numeric value is meaningless to callers; only
/// the heap knows how to dereference it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ExprRef(pub(crate) u32);

impl ExprRef {
    pub const NIL: ExprRef = ExprRef(u32::MAX);

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A combinator graph node. All variants are the same size, so the heap
/// can bump-allocate and copy cells without looking at the tag.
///
/// `I1(x)` means exactly `x`; it is the residue an application node
/// leaves behind when identity-like reductions rewrite it in place, and
/// exists so that every holder of the old reference still sees the
/// reduced value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Expr {
    /// Unevaluated application.
    A(ExprRef, ExprRef),
    K,
    K1(ExprRef),
    S,
    S1(ExprRef),
    S2(ExprRef, ExprRef),
    I,
    I1(ExprRef),
    /// Reads one byte from the input stream the first time it is forced,
    /// then rewrites itself into a cons cell of that byte and a fresh
    /// `LazyRead`.
    LazyRead,
    /// Numeric increment, used only while decoding output numerals.
    Inc,
    /// A decoded integer. Never a valid function.
    Num(i64),
}

/// One heap cell: the expression plus the forwarding slot used by the
/// copying collector. `forward` is `ExprRef::NIL` except between the
/// moment the collector copies the cell and the end of that collection.
#[derive(Clone, Copy, Debug)]
pub struct Cell {
    pub expr: Expr,
    pub forward: ExprRef,
}

/// The static atoms. They occupy the first `COUNT` cell indices, below
/// both semispaces, so `index < COUNT` is the "not relocatable" test.
/// They are never mutated; the reducer always allocates a fresh
/// application node rather than rewriting an atom.
pub mod atom {
    use super::ExprRef;

    pub const S: ExprRef = ExprRef(0);
    pub const K: ExprRef = ExprRef(1);
    pub const I: ExprRef = ExprRef(2);
    pub const INC: ExprRef = ExprRef(3);
    pub const NUM0: ExprRef = ExprRef(4);
    /// `K1(I)`, Church numeral zero.
    pub const KI: ExprRef = ExprRef(5);
    /// `S1(I)`.
    pub const SI: ExprRef = ExprRef(6);
    /// `K1(S)`.
    pub const KS: ExprRef = ExprRef(7);
    /// `K1(K)`.
    pub const KK: ExprRef = ExprRef(8);
    /// `S2(K1(S), K)`, the Church successor.
    pub const SKSK: ExprRef = ExprRef(9);
    /// `S2(I, K1(S))`.
    pub const SIKS: ExprRef = ExprRef(10);
    /// `S2(S2(I, K1(S)), K1(K))`, i.e. the iota combinator `λf. f S K`.
    pub const IOTA: ExprRef = ExprRef(11);

    pub const COUNT: usize = 12;
}

/// Expressions of the static atoms, indexed by `atom::*`.
pub(crate) const STATIC_EXPRS: [Expr; atom::COUNT] = [
    Expr::S,
    Expr::K,
    Expr::I,
    Expr::Inc,
    Expr::Num(0),
    Expr::K1(atom::I),
    Expr::S1(atom::I),
    Expr::K1(atom::S),
    Expr::K1(atom::K),
    Expr::S2(atom::KS, atom::K),
    Expr::S2(atom::I, atom::KS),
    Expr::S2(atom::SIKS, atom::KK),
];
