//! Interpreter for Lazy K, the purely-functional combinator language:
//! a program is an SKI/iota term denoting a function from a lazy stream
//! of input byte numerals to a lazy stream of output byte numerals.
//!
//! The interesting machinery is the graph-reduction evaluator in
//! [`eval`]: destructive normal-order reduction over a two-space cell
//! heap with a copying collector. [`parse`] turns source text into an
//! initial graph.

pub mod eval;
pub mod expr;
pub mod heap;
pub mod parse;


use std::fmt;

/// Everything that can abort an interpreter run. Nothing is recovered
/// from; the exit code is part of the interpreter's contract.
#[derive(Debug)]
pub enum Error {
    /// Malformed source, with rendered position context.
    Parse(String),
    /// The program's output violated the numeric protocol.
    Runtime(&'static str),
    /// The live set no longer fits a semispace even after collection.
    OutOfMemory,
    /// A broken evaluator invariant, never a user error.
    Internal(&'static str),
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Parse(_) => 1,
            Error::Runtime(_) => 3,
            Error::OutOfMemory | Error::Internal(_) => 4,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Parse(msg) => write!(f, "{}", msg),
            Error::Runtime(msg) => write!(f, "Runtime error: {}", msg),
            Error::OutOfMemory => write!(f, "out of memory!"),
            Error::Internal(msg) => write!(f, "INTERNAL ERROR: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
