//! Program sources and the recursive-descent parser for the `` ` ``/`*`
//! application forms, parenthesized lists, combinator atoms, and
//! Unlambda-style `0`/`1` numeral literals.

use crate::expr::{atom, Expr, ExprRef};
use crate::heap::Heap;
use crate::Error;
use itertools::PeekingNext;

/// How many characters of context a parse diagnostic shows at most.
const CONTEXT_WINDOW: usize = 256;

/// A program fragment with enough position bookkeeping to render a
/// useful parse diagnostic: file-style sources get a trailing window of
/// the text, command-line fragments get a caret.
pub struct Source {
    name: String,
    bytes: Vec<u8>,
    pos: usize,
    caret: bool,
}

impl Source {
    pub fn file(name: impl Into<String>, bytes: Vec<u8>) -> Source {
        Source {
            name: name.into(),
            bytes,
            pos: 0,
            caret: false,
        }
    }

    pub fn command_line(text: &str) -> Source {
        Source {
            name: "command line".to_string(),
            bytes: text.as_bytes().to_vec(),
            pos: 0,
            caret: true,
        }
    }

    /// Next significant character: whitespace is skipped, `#` starts a
    /// comment running to end of line.
    fn next_token(&mut self) -> Option<u8> {
        while let Some(ch) = self.next() {
            match ch {
                b'#' => {
                    for ch in self.by_ref() {
                        if ch == b'\n' {
                            break;
                        }
                    }
                }
                ch if ch.is_ascii_whitespace() => {}
                ch => return Some(ch),
            }
        }
        None
    }

    /// A parse failure at the current position.
    fn error(&self, msg: &str) -> Error {
        if self.caret {
            let text = String::from_utf8_lossy(&self.bytes);
            let pad = " ".repeat(self.pos.saturating_sub(1));
            return Error::Parse(format!(
                "While parsing {}: {}\n{}\n{}^",
                self.name, msg, text, pad
            ));
        }
        let line_start = self.bytes[..self.pos]
            .iter()
            .rposition(|&c| c == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        let (from, clipped) = if self.pos - line_start < CONTEXT_WINDOW {
            (line_start, false)
        } else {
            (self.pos + 1 - CONTEXT_WINDOW, true)
        };
        let mut window = String::new();
        if clipped {
            window.push_str("...");
        }
        window.push_str(&String::from_utf8_lossy(&self.bytes[from..self.pos]));
        Error::Parse(format!(
            "While parsing \"{}\": {}\n{} <--",
            self.name, msg, window
        ))
    }
}

impl Iterator for Source {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        let ch = self.bytes.get(self.pos).copied()?;
        self.pos += 1;
        Some(ch)
    }
}

impl PeekingNext for Source {
    fn peeking_next<F>(&mut self, accept: F) -> Option<u8>
    where
        F: FnOnce(&u8) -> bool,
    {
        let ch = self.bytes.get(self.pos).copied()?;
        if accept(&ch) {
            self.next()
        } else {
            None
        }
    }
}

/// Parse a whole source fragment: a list of juxtaposed expressions,
/// left-associated, running to end of input. An empty fragment is the
/// identity program.
pub fn parse_source(heap: &mut Heap, src: &mut Source) -> Result<ExprRef, Error> {
    parse_list(heap, src, None)
}

/// `compose(f, g) = S2(K1(f), g)`, i.e. the program that pipes `g`'s
/// output into `f`.
pub fn compose(heap: &mut Heap, f: ExprRef, g: ExprRef) -> Result<ExprRef, Error> {
    let kf = alloc(heap, Expr::K1(f))?;
    alloc(heap, Expr::S2(kf, g))
}

fn alloc(heap: &mut Heap, e: Expr) -> Result<ExprRef, Error> {
    heap.try_alloc(e).ok_or(Error::OutOfMemory)
}

fn apply(heap: &mut Heap, f: ExprRef, x: ExprRef) -> Result<ExprRef, Error> {
    alloc(heap, Expr::A(f, x))
}

fn parse_list(
    heap: &mut Heap,
    src: &mut Source,
    terminator: Option<u8>,
) -> Result<ExprRef, Error> {
    let mut acc: Option<ExprRef> = None;
    loop {
        match src.next_token() {
            Some(b')') => {
                if terminator != Some(b')') {
                    return Err(src.error("Unmatched trailing close-parenthesis!"));
                }
                break;
            }
            None => {
                if terminator.is_some() {
                    return Err(src.error("Premature end of program!"));
                }
                break;
            }
            Some(ch) => {
                let item = parse_expr(heap, src, ch, false)?;
                acc = Some(match acc {
                    Some(f) => apply(heap, f, item)?,
                    None => item,
                });
            }
        }
    }
    Ok(acc.unwrap_or(atom::I))
}

fn parse_expr(
    heap: &mut Heap,
    src: &mut Source,
    ch: u8,
    i_is_iota: bool,
) -> Result<ExprRef, Error> {
    match ch {
        b'`' | b'*' => {
            let iota = ch == b'*';
            let c = operand(src)?;
            let f = parse_expr(heap, src, c, iota)?;
            let c = operand(src)?;
            let x = parse_expr(heap, src, c, iota)?;
            apply(heap, f, x)
        }
        b'(' => parse_list(heap, src, Some(b')')),
        b')' => Err(src.error("Mismatched close-parenthesis!")),
        b'k' | b'K' => Ok(atom::K),
        b's' | b'S' => Ok(atom::S),
        b'i' if i_is_iota => Ok(atom::IOTA),
        b'i' | b'I' => Ok(atom::I),
        b'0' | b'1' => {
            // Unlambda numeral: left-fold the digit run starting from I.
            let mut e = atom::I;
            let mut digit = ch;
            loop {
                e = if digit == b'0' {
                    let es = apply(heap, e, atom::S)?;
                    apply(heap, es, atom::K)?
                } else {
                    let ke = apply(heap, atom::K, e)?;
                    apply(heap, atom::S, ke)?
                };
                match src.peeking_next(|c| *c == b'0' || *c == b'1') {
                    Some(d) => digit = d,
                    None => break,
                }
            }
            Ok(e)
        }
        _ => Err(src.error("Invalid character!")),
    }
}

fn operand(src: &mut Source) -> Result<u8, Error> {
    src.next_token()
        .ok_or_else(|| src.error("Premature end of program!"))
}
