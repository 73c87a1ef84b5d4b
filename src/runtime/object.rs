// Sable, a compact Scheme runtime core.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// Sable is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/runtime/object.rs

// The object model. Defines the value representation, every heap
// object variant, typed accessors that check the variant before
// touching a payload, constructors that go through the collecting
// allocator, hashing, identity, and printing.

// <>

use std::fmt::Write;

use super::error::{Error, Flow, Result};
use super::memmgt::{Gc, Heap};
use super::stack::Frame;
use super::Runtime;

/// Host procedure; receives the application frame holding its arguments
pub type NativeFn = fn(&mut Runtime, Frame) -> Result<Value>;

/// Special form; receives a frame whose slot 0 holds the operand list
pub type SpecialFn = fn(&mut Runtime, Frame) -> Flow<Step>;

/// What a special form hands back to the evaluator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Final value of the form
    Done(Value),
    /// Expression to evaluate in place of the form, in the same frame
    Tail(Value),
}

/// A Scheme value. Immediates are carried inline; everything else is
/// a handle to a heap record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    /// The empty list
    Nil,
    Bool(bool),
    Unspecified,
    Eof,
    Obj(Gc),
}

impl Value {
    /// Everything but `#f` counts as true
    #[inline(always)]
    pub fn truthy(self) -> bool {
        self != Value::Bool(false)
    }

    #[inline(always)]
    pub fn handle(self) -> Option<Gc> {
        match self {
            Value::Obj(gc) => Some(gc),
            _ => None,
        }
    }
}

impl From<Gc> for Value {
    fn from(gc: Gc) -> Self {
        Value::Obj(gc)
    }
}

/// Runtime type of a value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    Nil,
    Bool,
    Unspecified,
    Eof,
    Pair,
    Symbol,
    Str,
    Fixnum,
    Flonum,
    Procedure,
    Closure,
    Environment,
    Dictionary,
    Vector,
    SpecialForm,
    Macro,
    Escape,
}

impl Tag {
    pub fn name(self) -> &'static str {
        match self {
            Tag::Nil => "empty list",
            Tag::Bool => "boolean",
            Tag::Unspecified => "unspecified",
            Tag::Eof => "eof",
            Tag::Pair => "pair",
            Tag::Symbol => "symbol",
            Tag::Str => "string",
            Tag::Fixnum => "fixnum",
            Tag::Flonum => "flonum",
            Tag::Procedure => "procedure",
            Tag::Closure => "closure",
            Tag::Environment => "environment",
            Tag::Dictionary => "dictionary",
            Tag::Vector => "vector",
            Tag::SpecialForm => "special form",
            Tag::Macro => "macro",
            Tag::Escape => "escape continuation",
        }
    }
}

/// Payload of a heap record
pub enum Object {
    Pair(Value, Value),
    Symbol { text: Box<str>, hash: u32 },
    Str(Box<str>),
    Fixnum(i64),
    Flonum(f64),
    Procedure { name: &'static str, func: NativeFn },
    Closure { env: Value, formals: Value, body: Value },
    Environment { dict: Value, outer: Value },
    /// Buckets are chains of `((key . value) . rest)` held in a vector
    Dictionary { buckets: Value, count: usize, mask: usize },
    Vector(Vec<Value>),
    SpecialForm { name: &'static str, func: SpecialFn },
    Macro { rule: Value },
    Escape { aux: Value, live: bool },
}

/// Size charged for every record on top of its payload
pub const HEADER_BYTES: usize = 16;

const WORD: usize = std::mem::size_of::<Value>();

impl Object {
    pub fn tag(&self) -> Tag {
        match self {
            Object::Pair(..) => Tag::Pair,
            Object::Symbol { .. } => Tag::Symbol,
            Object::Str(_) => Tag::Str,
            Object::Fixnum(_) => Tag::Fixnum,
            Object::Flonum(_) => Tag::Flonum,
            Object::Procedure { .. } => Tag::Procedure,
            Object::Closure { .. } => Tag::Closure,
            Object::Environment { .. } => Tag::Environment,
            Object::Dictionary { .. } => Tag::Dictionary,
            Object::Vector(_) => Tag::Vector,
            Object::SpecialForm { .. } => Tag::SpecialForm,
            Object::Macro { .. } => Tag::Macro,
            Object::Escape { .. } => Tag::Escape,
        }
    }

    /// Footprint of a vector of `len` items, or `None` past `usize`
    pub fn vector_bytes(len: usize) -> Option<usize> {
        len.checked_mul(WORD)?.checked_add(HEADER_BYTES + 8)
    }

    /// Bytes this record counts against the heap budget
    pub fn footprint(&self) -> usize {
        HEADER_BYTES
            + match self {
                Object::Pair(..) => 2 * WORD,
                Object::Symbol { text, .. } => 8 + text.len(),
                Object::Str(text) => 8 + text.len(),
                Object::Fixnum(_) | Object::Flonum(_) => 8,
                Object::Procedure { .. } | Object::SpecialForm { .. } => 2 * WORD,
                Object::Closure { .. } => 3 * WORD,
                Object::Environment { .. } => 2 * WORD,
                Object::Dictionary { .. } => 3 * WORD,
                Object::Vector(items) => 8 + items.len() * WORD,
                Object::Macro { .. } => WORD,
                Object::Escape { .. } => WORD + 8,
            }
    }

    /// Direct references held by this object
    pub(crate) fn references(&self) -> Vec<Value> {
        let mut refs = match self {
            Object::Pair(first, rest) => vec![*first, *rest],
            Object::Closure { env, formals, body } => vec![*env, *formals, *body],
            Object::Environment { dict, outer } => vec![*dict, *outer],
            Object::Dictionary { buckets, .. } => vec![*buckets],
            Object::Vector(items) => items.clone(),
            Object::Macro { rule } => vec![*rule],
            Object::Escape { aux, .. } => vec![*aux],
            _ => Vec::new(),
        };
        refs.retain(|v| v.handle().is_some());
        refs.dedup();
        refs
    }
}

/// Symbol text hash, cached in the symbol at creation
pub fn str_hash(text: &[u8]) -> u32 {
    let mut acc: u32 = 1;
    for b in text {
        acc = acc.wrapping_add(acc << 5).wrapping_add(*b as u32);
    }
    acc
}

#[inline(always)]
fn fold64(bits: u64) -> usize {
    (bits ^ (bits >> 32)) as usize
}

// Typed accessors. Each checks the variant and reports a type error
// naming what it wanted and what it got.
impl Heap {
    #[inline]
    pub fn deref(&self, v: Value) -> Result<Option<&Object>> {
        match v {
            Value::Obj(gc) => self.get(gc).map(Some),
            _ => Ok(None),
        }
    }

    pub fn tag(&self, v: Value) -> Result<Tag> {
        Ok(match v {
            Value::Nil => Tag::Nil,
            Value::Bool(_) => Tag::Bool,
            Value::Unspecified => Tag::Unspecified,
            Value::Eof => Tag::Eof,
            Value::Obj(gc) => self.get(gc)?.tag(),
        })
    }

    /// Type name for messages; never fails
    pub fn type_name(&self, v: Value) -> &'static str {
        self.tag(v).map(Tag::name).unwrap_or("reclaimed object")
    }

    pub(crate) fn mismatch(&self, expected: &str, v: Value) -> Error {
        Error::type_err(expected, self.type_name(v))
    }

    #[inline]
    pub fn is(&self, v: Value, tag: Tag) -> bool {
        matches!(self.tag(v), Ok(t) if t == tag)
    }

    pub fn is_pair(&self, v: Value) -> bool {
        self.is(v, Tag::Pair)
    }

    pub fn is_symbol(&self, v: Value) -> bool {
        self.is(v, Tag::Symbol)
    }

    pub fn callable(&self, v: Value) -> bool {
        matches!(
            self.tag(v),
            Ok(Tag::Procedure) | Ok(Tag::Closure) | Ok(Tag::Escape)
        )
    }

    pub fn car(&self, v: Value) -> Result<Value> {
        match self.deref(v)? {
            Some(Object::Pair(first, _)) => Ok(*first),
            _ => Err(self.mismatch("pair", v)),
        }
    }

    pub fn cdr(&self, v: Value) -> Result<Value> {
        match self.deref(v)? {
            Some(Object::Pair(_, rest)) => Ok(*rest),
            _ => Err(self.mismatch("pair", v)),
        }
    }

    pub fn set_car(&mut self, pair: Value, v: Value) -> Result<()> {
        if let Value::Obj(gc) = pair {
            if let Object::Pair(first, _) = self.get_mut(gc)? {
                *first = v;
                return Ok(());
            }
        }
        Err(self.mismatch("pair", pair))
    }

    pub fn set_cdr(&mut self, pair: Value, v: Value) -> Result<()> {
        if let Value::Obj(gc) = pair {
            if let Object::Pair(_, rest) = self.get_mut(gc)? {
                *rest = v;
                return Ok(());
            }
        }
        Err(self.mismatch("pair", pair))
    }

    pub fn fixnum(&self, v: Value) -> Result<i64> {
        match self.deref(v)? {
            Some(Object::Fixnum(n)) => Ok(*n),
            _ => Err(self.mismatch("fixnum", v)),
        }
    }

    #[cfg(test)]
    pub fn symbol_text(&self, v: Value) -> Result<&str> {
        match self.deref(v)? {
            Some(Object::Symbol { text, .. }) => Ok(&**text),
            _ => Err(self.mismatch("symbol", v)),
        }
    }

    pub fn vector_len(&self, v: Value) -> Result<usize> {
        match self.deref(v)? {
            Some(Object::Vector(items)) => Ok(items.len()),
            _ => Err(self.mismatch("vector", v)),
        }
    }

    pub fn vector_ref(&self, v: Value, i: usize) -> Result<Value> {
        match self.deref(v)? {
            Some(Object::Vector(items)) => items.get(i).copied().ok_or_else(|| {
                Error::Type(format!("index {} out of range for length {}", i, items.len()))
            }),
            _ => Err(self.mismatch("vector", v)),
        }
    }

    pub fn vector_set(&mut self, v: Value, i: usize, item: Value) -> Result<()> {
        if let Value::Obj(gc) = v {
            if let Object::Vector(items) = self.get_mut(gc)? {
                let len = items.len();
                let slot = items.get_mut(i).ok_or_else(|| {
                    Error::Type(format!("index {} out of range for length {}", i, len))
                })?;
                *slot = item;
                return Ok(());
            }
        }
        Err(self.mismatch("vector", v))
    }

    pub fn closure_parts(&self, v: Value) -> Result<(Value, Value, Value)> {
        match self.deref(v)? {
            Some(Object::Closure { env, formals, body }) => Ok((*env, *formals, *body)),
            _ => Err(self.mismatch("closure", v)),
        }
    }

    pub fn env_parts(&self, v: Value) -> Result<(Value, Value)> {
        match self.deref(v)? {
            Some(Object::Environment { dict, outer }) => Ok((*dict, *outer)),
            _ => Err(self.mismatch("environment", v)),
        }
    }

    pub fn dict_parts(&self, v: Value) -> Result<(Value, usize, usize)> {
        match self.deref(v)? {
            Some(Object::Dictionary {
                buckets,
                count,
                mask,
            }) => Ok((*buckets, *count, *mask)),
            _ => Err(self.mismatch("dictionary", v)),
        }
    }

    pub(crate) fn dict_update(
        &mut self,
        v: Value,
        new_buckets: Option<Value>,
        new_count: usize,
        new_mask: usize,
    ) -> Result<()> {
        if let Value::Obj(gc) = v {
            if let Object::Dictionary {
                buckets,
                count,
                mask,
            } = self.get_mut(gc)?
            {
                if let Some(b) = new_buckets {
                    *buckets = b;
                }
                *count = new_count;
                *mask = new_mask;
                return Ok(());
            }
        }
        Err(self.mismatch("dictionary", v))
    }

    /// Delivered value and liveness of an escape continuation
    pub(crate) fn escape_parts(&self, v: Value) -> Result<(Value, bool)> {
        match self.deref(v)? {
            Some(Object::Escape { aux, live }) => Ok((*aux, *live)),
            _ => Err(self.mismatch("escape continuation", v)),
        }
    }

    pub(crate) fn escape_update(&mut self, v: Value, value: Option<Value>, alive: bool) -> Result<()> {
        if let Value::Obj(gc) = v {
            if let Object::Escape { aux, live } = self.get_mut(gc)? {
                if let Some(value) = value {
                    *aux = value;
                }
                *live = alive;
                return Ok(());
            }
        }
        Err(self.mismatch("escape continuation", v))
    }

    /// Number of pairs in a chain, ignoring any improper tail
    pub fn list_len(&self, mut list: Value) -> usize {
        let mut n = 0;
        while let Ok(Some(Object::Pair(_, rest))) = self.deref(list) {
            n += 1;
            list = *rest;
        }
        n
    }

    /// Proper list to a vector of its elements
    pub fn list_items(&self, mut list: Value, what: &str) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        while list != Value::Nil {
            match self.deref(list)? {
                Some(Object::Pair(first, rest)) => {
                    items.push(*first);
                    list = *rest;
                }
                _ => return Err(Error::MalformedList(what.to_string())),
            }
        }
        Ok(items)
    }

    /// Hash consistent with `equivalent`
    pub fn generic_hash(&self, v: Value) -> Result<usize> {
        Ok(match v {
            Value::Nil => 0,
            Value::Bool(b) => 1 + b as usize,
            Value::Unspecified => 3,
            Value::Eof => 4,
            Value::Obj(gc) => match self.get(gc)? {
                Object::Symbol { hash, .. } => *hash as usize,
                Object::Fixnum(n) => fold64(*n as u64),
                Object::Flonum(x) => fold64(x.to_bits()),
                _ => gc.index() as usize,
            },
        })
    }

    /// Identity, extended to numbers by value
    pub fn equivalent(&self, a: Value, b: Value) -> Result<bool> {
        if a == b {
            return Ok(true);
        }
        Ok(match (self.deref(a)?, self.deref(b)?) {
            (Some(Object::Fixnum(x)), Some(Object::Fixnum(y))) => x == y,
            (Some(Object::Flonum(x)), Some(Object::Flonum(y))) => x.to_bits() == y.to_bits(),
            _ => false,
        })
    }

    /// External representation (`write` style)
    pub fn repr(&self, v: Value) -> String {
        self.render(v, true, usize::MAX)
    }

    /// `repr` that gives up once the text passes `width` bytes
    pub fn repr_within(&self, v: Value, width: usize) -> String {
        self.render(v, true, width)
    }

    /// Human representation; strings print without quotes
    pub fn display(&self, v: Value) -> String {
        self.render(v, false, usize::MAX)
    }

    /// Prints from an explicit work stack, so nesting depth costs heap
    /// and never native stack
    fn render(&self, v: Value, write: bool, width: usize) -> String {
        let mut out = String::new();
        let mut budget = PRINT_BUDGET;
        let mut work = vec![Piece::Value(v)];

        while let Some(piece) = work.pop() {
            if out.len() > width {
                out.push_str("...");
                break;
            }
            match piece {
                Piece::Value(_) if budget == 0 => out.push_str("..."),
                Piece::Value(v) => {
                    budget -= 1;
                    self.print_one(&mut out, v, write, &mut work);
                }
                Piece::Tail(Value::Nil) => out.push(')'),
                Piece::Tail(_) if budget == 0 => out.push_str(" ...)"),
                Piece::Tail(rest) => match self.deref(rest) {
                    Ok(Some(Object::Pair(head, rest))) => {
                        out.push(' ');
                        work.push(Piece::Tail(*rest));
                        work.push(Piece::Value(*head));
                    }
                    _ => {
                        out.push_str(" . ");
                        work.push(Piece::Close);
                        work.push(Piece::Value(rest));
                    }
                },
                Piece::Items(vec, i) => match self.deref(vec) {
                    Ok(Some(Object::Vector(items))) if i < items.len() => {
                        if budget == 0 {
                            out.push_str(" ...)");
                            continue;
                        }
                        if i > 0 {
                            out.push(' ');
                        }
                        work.push(Piece::Items(vec, i + 1));
                        work.push(Piece::Value(items[i]));
                    }
                    _ => out.push(')'),
                },
                Piece::Close => out.push(')'),
            }
        }
        out
    }

    /// Writes an atom whole, or opens a compound and queues its parts
    fn print_one(&self, out: &mut String, v: Value, write: bool, work: &mut Vec<Piece>) {
        let obj = match v {
            Value::Nil => return out.push_str("()"),
            Value::Bool(true) => return out.push_str("#t"),
            Value::Bool(false) => return out.push_str("#f"),
            Value::Unspecified => return out.push_str("#<unspecified>"),
            Value::Eof => return out.push_str("#<eof>"),
            Value::Obj(gc) => match self.get(gc) {
                Ok(obj) => obj,
                Err(_) => return out.push_str("#<reclaimed>"),
            },
        };

        let _ = match obj {
            Object::Pair(head, rest) => {
                out.push('(');
                work.push(Piece::Tail(*rest));
                work.push(Piece::Value(*head));
                Ok(())
            }
            Object::Vector(_) => {
                out.push_str("#(");
                work.push(Piece::Items(v, 0));
                Ok(())
            }
            Object::Symbol { text, .. } => write!(out, "{}", text),
            Object::Str(text) if write => write!(out, "{:?}", text),
            Object::Str(text) => write!(out, "{}", text),
            Object::Fixnum(n) => write!(out, "{}", n),
            Object::Flonum(x) => write!(out, "{:?}", x),
            Object::Procedure { name, .. } => write!(out, "#<procedure {}>", name),
            Object::Closure { .. } => write!(out, "#<closure>"),
            Object::Environment { .. } => write!(out, "#<environment>"),
            Object::Dictionary { count, .. } => write!(out, "#<dictionary {}>", count),
            Object::SpecialForm { name, .. } => write!(out, "#<syntax {}>", name),
            Object::Macro { .. } => write!(out, "#<macro>"),
            Object::Escape { .. } => write!(out, "#<continuation>"),
        };
    }
}

/// Pending printer work
enum Piece {
    Value(Value),
    /// Remainder of a list whose earlier elements are printed
    Tail(Value),
    /// A vector's items from the given position on
    Items(Value, usize),
    /// Closing paren after a dotted tail
    Close,
}

/// Upper bound on values printed in one representation, so cyclic
/// structure still terminates
const PRINT_BUDGET: usize = 100_000;

// Constructors. All of them allocate through the collecting
// allocator, which roots the new object's references itself.
impl Runtime {
    pub fn cons(&mut self, frame: Frame, first: Value, rest: Value) -> Result<Value> {
        self.alloc(frame, Object::Pair(first, rest)).map(Value::Obj)
    }

    pub fn fixnum(&mut self, frame: Frame, n: i64) -> Result<Value> {
        self.alloc(frame, Object::Fixnum(n)).map(Value::Obj)
    }

    pub fn flonum(&mut self, frame: Frame, x: f64) -> Result<Value> {
        self.alloc(frame, Object::Flonum(x)).map(Value::Obj)
    }

    pub fn string(&mut self, frame: Frame, text: &str) -> Result<Value> {
        self.alloc(frame, Object::Str(text.into())).map(Value::Obj)
    }

    /// Vector of `len` copies of `fill`. The size is checked against
    /// the heap budget before any item storage exists.
    pub fn make_vector(&mut self, frame: Frame, len: usize, fill: Value) -> Result<Value> {
        let requested = Object::vector_bytes(len).unwrap_or(usize::MAX);
        let frame = self.stack.push_roots(frame, &[fill])?;
        self.reserve(frame, requested)?;

        let mut items = Vec::new();
        items
            .try_reserve_exact(len)
            .map_err(|_| Error::OutOfMemory {
                requested,
                live: self.heap.stats().live_bytes,
            })?;
        items.resize(len, fill);
        self.alloc(frame, Object::Vector(items)).map(Value::Obj)
    }

    pub fn procedure(&mut self, frame: Frame, name: &'static str, func: NativeFn) -> Result<Value> {
        self.alloc(frame, Object::Procedure { name, func })
            .map(Value::Obj)
    }

    pub(crate) fn special_form(
        &mut self,
        frame: Frame,
        name: &'static str,
        func: SpecialFn,
    ) -> Result<Value> {
        self.alloc(frame, Object::SpecialForm { name, func })
            .map(Value::Obj)
    }

    pub fn closure(&mut self, frame: Frame, env: Value, formals: Value, body: Value) -> Result<Value> {
        self.alloc(frame, Object::Closure { env, formals, body })
            .map(Value::Obj)
    }

    pub fn make_macro(&mut self, frame: Frame, rule: Value) -> Result<Value> {
        self.alloc(frame, Object::Macro { rule }).map(Value::Obj)
    }

    /// Proper list from elements, built back to front
    pub fn list(&mut self, frame: Frame, items: &[Value]) -> Result<Value> {
        let frame = self.stack.push_roots(frame, items)?;
        let mut acc = Value::Nil;
        for item in items.iter().rev() {
            acc = self.cons(frame, *item, acc)?;
        }
        Ok(acc)
    }

    pub fn repr(&self, v: Value) -> String {
        self.heap.repr(v)
    }
}
