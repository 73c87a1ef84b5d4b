// Sable, a compact Scheme runtime core.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// Sable is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/runtime/parser.rs

// Reads source text into `Datum` trees, and turns those into heap
// values under the frame discipline.

// <>

use std::iter;
use std::str;

use super::error::{Error, Result};
use super::object::Value;
use super::stack::Frame;
use super::Runtime;

/// One read expression, before it lives on the heap
#[derive(Clone, Debug, PartialEq)]
pub enum Datum {
    Int(i64),
    Float(f64),
    Str(String),
    Sym(String),
    Bool(bool),
    /// Elements and an optional improper tail
    List(Vec<Datum>, Option<Box<Datum>>),
    Vector(Vec<Datum>),
}

pub struct Parser<'a> {
    chars: iter::Peekable<str::Bytes<'a>>,
    acc: Vec<u8>,
    line: usize,
}

/// Reads every expression in `code`
pub fn parse(code: &str) -> Result<Vec<Datum>> {
    let mut parser = Parser::new(code);
    let mut out = Vec::new();
    while let Some(datum) = parser.next_datum()? {
        out.push(datum);
    }
    Ok(out)
}

fn delimits(c: u8) -> bool {
    matches!(c, b'(' | b')' | b'"' | b';' | b'\'' | b'`' | b',') || c.is_ascii_whitespace()
}

fn quoted(name: &str, datum: Datum) -> Datum {
    Datum::List(vec![Datum::Sym(name.to_string()), datum], None)
}

impl<'a> Parser<'a> {
    pub fn new(code: &'a str) -> Self {
        Parser {
            chars: code.bytes().peekable(),
            acc: Vec::new(),
            line: 1,
        }
    }

    fn error(&self, what: &str) -> Error {
        Error::Read(format!("line {}: {}", self.line, what))
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.chars.next()?;
        if c == b'\n' {
            self.line += 1;
        }
        Some(c)
    }

    /// Skips whitespace and comments; the next byte, if any
    fn skip_blank(&mut self) -> Option<u8> {
        loop {
            let c = *self.chars.peek()?;
            if c == b';' {
                while !matches!(self.bump(), Some(b'\n') | None) {}
            } else if c.is_ascii_whitespace() {
                self.bump();
            } else {
                return Some(c);
            }
        }
    }

    /// The next complete expression, or `None` at end of input
    pub fn next_datum(&mut self) -> Result<Option<Datum>> {
        match self.skip_blank() {
            None => Ok(None),
            Some(b')') => Err(self.error("unexpected )")),
            Some(_) => self.read_value().map(Some),
        }
    }

    /// Returns a contiguous value; the reader is chosen by its first
    /// character
    fn read_value(&mut self) -> Result<Datum> {
        let c = match self.skip_blank() {
            Some(c) => c,
            None => return Err(self.error("unexpected end of input")),
        };

        match c {
            b'\'' => {
                self.bump();
                Ok(quoted("quote", self.read_value()?))
            }
            b'`' => {
                self.bump();
                Ok(quoted("quasiquote", self.read_value()?))
            }
            b',' => {
                self.bump();
                if self.chars.peek() == Some(&b'@') {
                    self.bump();
                    Ok(quoted("unquote-splicing", self.read_value()?))
                } else {
                    Ok(quoted("unquote", self.read_value()?))
                }
            }
            b'(' => {
                self.bump();
                self.read_list()
            }
            b')' => Err(self.error("unexpected )")),
            b'"' => {
                self.bump();
                self.read_string()
            }
            b'#' => {
                self.bump();
                self.read_special()
            }
            _ => self.read_atom(),
        }
    }

    fn read_list(&mut self) -> Result<Datum> {
        let mut items = Vec::new();

        loop {
            match self.skip_blank() {
                None => return Err(self.error("unterminated list")),
                Some(b')') => {
                    self.bump();
                    return Ok(Datum::List(items, None));
                }
                Some(b'.') if self.dot_alone() => {
                    // may only appear immediately before the final element
                    if items.is_empty() {
                        return Err(self.error("dot at start of list"));
                    }
                    let tail = self.read_value()?;
                    return match self.skip_blank() {
                        Some(b')') => {
                            self.bump();
                            Ok(Datum::List(items, Some(Box::new(tail))))
                        }
                        _ => Err(self.error("expected ) after dotted tail")),
                    };
                }
                Some(_) => items.push(self.read_value()?),
            }
        }
    }

    /// Consumes a `.` if it stands alone as a token
    fn dot_alone(&mut self) -> bool {
        let mut ahead = self.chars.clone();
        ahead.next();
        match ahead.peek() {
            Some(&c) if !delimits(c) => false,
            _ => {
                self.bump();
                true
            }
        }
    }

    fn read_vector(&mut self) -> Result<Datum> {
        let mut items = Vec::new();
        loop {
            match self.skip_blank() {
                None => return Err(self.error("unterminated vector")),
                Some(b')') => {
                    self.bump();
                    return Ok(Datum::Vector(items));
                }
                Some(_) => items.push(self.read_value()?),
            }
        }
    }

    fn read_string(&mut self) -> Result<Datum> {
        self.acc.clear();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    Some(b'n') => self.acc.push(b'\n'),
                    Some(b't') => self.acc.push(b'\t'),
                    Some(b'\\') => self.acc.push(b'\\'),
                    Some(b'"') => self.acc.push(b'"'),
                    Some(c) => return Err(self.error(&format!("bad escape \\{}", c as char))),
                    None => return Err(self.error("unterminated string")),
                },
                Some(c) => self.acc.push(c),
            }
        }

        match str::from_utf8(&self.acc) {
            Ok(s) => Ok(Datum::Str(s.to_string())),
            Err(_) => Err(self.error("string is not UTF-8")),
        }
    }

    fn read_special(&mut self) -> Result<Datum> {
        if self.chars.peek() == Some(&b'(') {
            self.bump();
            return self.read_vector();
        }

        self.take_token();
        match &self.acc[..] {
            b"t" | b"true" => Ok(Datum::Bool(true)),
            b"f" | b"false" => Ok(Datum::Bool(false)),
            other => {
                let text = String::from_utf8_lossy(other).into_owned();
                Err(self.error(&format!("unknown syntax #{}", text)))
            }
        }
    }

    /// Number or symbol
    fn read_atom(&mut self) -> Result<Datum> {
        self.take_token();
        let text = match str::from_utf8(&self.acc) {
            Ok(s) => s,
            Err(_) => return Err(self.error("symbol is not UTF-8")),
        };

        if let Ok(n) = text.parse::<i64>() {
            return Ok(Datum::Int(n));
        }

        let numeric = text
            .trim_start_matches(['+', '-'])
            .trim_start_matches('.')
            .starts_with(|c: char| c.is_ascii_digit());
        if numeric {
            return match text.parse::<f64>() {
                Ok(x) => Ok(Datum::Float(x)),
                Err(_) => Err(self.error(&format!("bad number {}", text))),
            };
        }

        Ok(Datum::Sym(text.to_string()))
    }

    fn take_token(&mut self) {
        self.acc.clear();
        while let Some(&c) = self.chars.peek() {
            if delimits(c) {
                break;
            }
            self.acc.push(c);
            self.bump();
        }
    }
}

impl Runtime {
    /// Builds the heap value for `datum`. Partial structure stays in
    /// a slot of a work frame below `frame` while it grows.
    pub fn materialize(&mut self, frame: Frame, datum: &Datum) -> Result<Value> {
        match datum {
            Datum::Int(n) => self.fixnum(frame, *n),
            Datum::Float(x) => self.flonum(frame, *x),
            Datum::Str(s) => self.string(frame, s),
            Datum::Sym(name) => self.intern(frame, name),
            Datum::Bool(b) => Ok(Value::Bool(*b)),
            Datum::List(items, tail) => {
                let w = self.stack.extend_raw(frame, 1, true)?;
                let mut acc = match tail {
                    Some(t) => self.materialize(w, t)?,
                    None => Value::Nil,
                };
                self.stack.set(w, 0, acc);
                for item in items.iter().rev() {
                    let v = self.materialize(w, item)?;
                    acc = self.cons(w, v, acc)?;
                    self.stack.set(w, 0, acc);
                }
                Ok(acc)
            }
            Datum::Vector(items) => {
                let w = self.stack.extend_raw(frame, 1, true)?;
                let vec = self.make_vector(w, items.len(), Value::Unspecified)?;
                self.stack.set(w, 0, vec);
                for (i, item) in items.iter().enumerate() {
                    let v = self.materialize(w, item)?;
                    self.heap.vector_set(vec, i, v)?;
                }
                Ok(vec)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Config;

    fn one(code: &str) -> Datum {
        let mut all = parse(code).unwrap();
        assert_eq!(all.len(), 1);
        all.remove(0)
    }

    fn sym(s: &str) -> Datum {
        Datum::Sym(s.to_string())
    }

    #[test]
    fn atoms() {
        assert_eq!(one("42"), Datum::Int(42));
        assert_eq!(one("-7"), Datum::Int(-7));
        assert_eq!(one("+3"), Datum::Int(3));
        assert_eq!(one("2.5"), Datum::Float(2.5));
        assert_eq!(one("-.5"), Datum::Float(-0.5));
        assert_eq!(one("#t"), Datum::Bool(true));
        assert_eq!(one("#f"), Datum::Bool(false));
        assert_eq!(one("-"), sym("-"));
        assert_eq!(one("set-car!"), sym("set-car!"));
        assert_eq!(one("call/ec"), sym("call/ec"));
        assert_eq!(one("..."), sym("..."));
    }

    #[test]
    fn strings_with_escapes() {
        assert_eq!(
            one(r#""a \"b\"\n\\""#),
            Datum::Str("a \"b\"\n\\".to_string())
        );
        assert!(matches!(parse("\"open"), Err(Error::Read(_))));
    }

    #[test]
    fn lists_and_dotted_tails() {
        assert_eq!(
            one("(a (b) . c)"),
            Datum::List(
                vec![sym("a"), Datum::List(vec![sym("b")], None)],
                Some(Box::new(sym("c")))
            )
        );
        assert_eq!(one("()"), Datum::List(vec![], None));
        assert_eq!(one("(.5)"), Datum::List(vec![Datum::Float(0.5)], None));
        assert!(parse("(. a)").is_err());
        assert!(parse("(a . b c)").is_err());
        assert!(parse("(a").is_err());
        assert!(parse(")").is_err());
    }

    #[test]
    fn quote_shorthands() {
        assert_eq!(
            one("'x"),
            Datum::List(vec![sym("quote"), sym("x")], None)
        );
        assert_eq!(
            one("`(a ,b ,@c)"),
            Datum::List(
                vec![
                    sym("quasiquote"),
                    Datum::List(
                        vec![
                            sym("a"),
                            Datum::List(vec![sym("unquote"), sym("b")], None),
                            Datum::List(vec![sym("unquote-splicing"), sym("c")], None),
                        ],
                        None
                    )
                ],
                None
            )
        );
    }

    #[test]
    fn vectors_and_comments() {
        let all = parse("; header\n#(1 x) ; trailing\n\n2").unwrap();
        assert_eq!(
            all,
            vec![Datum::Vector(vec![Datum::Int(1), sym("x")]), Datum::Int(2)]
        );
        assert!(parse("").unwrap().is_empty());
        assert!(parse("  ; only a comment").unwrap().is_empty());
    }

    #[test]
    fn errors_name_the_line() {
        match parse("1\n2\n(3") {
            Err(Error::Read(msg)) => assert!(msg.starts_with("line 3")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn materialized_under_stress() {
        let mut rt = Runtime::with_config(Config {
            gc_stress: true,
            ..Config::default()
        });
        let top = rt.toplevel();
        let datum = one("(1 (2 \"three\") #(4 five) . 6.5)");
        let v = rt.materialize(top, &datum).unwrap();
        assert_eq!(rt.repr(v), "(1 (2 \"three\") #(4 five) . 6.5)");
    }
}
