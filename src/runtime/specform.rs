// Sable, a compact Scheme runtime core.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// Sable is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/runtime/specform.rs

// Special forms. Each receives a frame holding its unevaluated
// operands in slot 0 and either produces a value or names the
// expression to evaluate in its place, which keeps `if`, `begin`,
// and friends properly tail recursive.

// <>

use super::error::{Error, Flow, Result};
use super::object::{SpecialFn, Step, Tag, Value};
use super::stack::{Extend, Frame};
use super::Runtime;

/// Special forms bound in every toplevel environment
pub const SPECIAL_FORMS: &[(&str, SpecialFn)] = &[
    ("quote", sf_quote),
    ("if", sf_if),
    ("define", sf_define),
    ("set!", sf_set),
    ("lambda", sf_lambda),
    ("begin", sf_begin),
    ("quasiquote", sf_quasiquote),
    ("unquote", sf_unquote),
    ("unquote-splicing", sf_unquote),
    ("lambda-syntax", sf_lambda_syntax),
];

/// Binds the special forms into `env`; returns the `begin` and
/// `quote` objects, which the evaluator splices into code it builds
pub(crate) fn install(rt: &mut Runtime, frame: Frame, env: Value) -> Result<(Value, Value)> {
    let mut begin = Value::Nil;
    let mut quote = Value::Nil;
    for &(name, func) in SPECIAL_FORMS {
        let form = rt.special_form(frame, name, func)?;
        let sym = rt.intern(frame, name)?;
        rt.env_define(frame, env, sym, form)?;
        match name {
            "begin" => begin = form,
            "quote" => quote = form,
            _ => (),
        }
    }
    Ok((begin, quote))
}

impl Runtime {
    /// Operands as exactly `N` values, or a syntax error; nothing is
    /// evaluated before the shape is known good
    fn operands<const N: usize>(&self, frame: Frame, form: &str) -> Result<[Value; N]> {
        let mut out = [Value::Nil; N];
        let mut rest = self.stack.get(frame, 0);
        for slot in out.iter_mut() {
            if !self.heap.is_pair(rest) {
                return Err(bad_shape(form, N));
            }
            *slot = self.heap.car(rest)?;
            rest = self.heap.cdr(rest)?;
        }
        if rest != Value::Nil {
            return Err(bad_shape(form, N));
        }
        Ok(out)
    }

    /// Formals must be a symbol, or a list of symbols possibly ending
    /// in a dotted rest symbol
    fn check_formals(&self, mut formals: Value) -> Result<()> {
        loop {
            match self.heap.tag(formals)? {
                Tag::Nil | Tag::Symbol => return Ok(()),
                Tag::Pair => {
                    let name = self.heap.car(formals)?;
                    if !self.heap.is_symbol(name) {
                        return Err(Error::Syntax(format!(
                            "formal {} is not a symbol",
                            self.heap.repr(name)
                        )));
                    }
                    formals = self.heap.cdr(formals)?;
                }
                _ => {
                    return Err(Error::Syntax(format!(
                        "bad formals {}",
                        self.heap.repr(formals)
                    )))
                }
            }
        }
    }

    /// Closure over the frame's environment
    fn make_lambda(&mut self, frame: Frame, formals: Value, body: Value) -> Result<Value> {
        self.check_formals(formals)?;
        self.heap.list_items(body, "lambda body")?;
        let env = self.stack.env(frame);
        self.closure(frame, env, formals, body)
    }
}

fn bad_shape(form: &str, n: usize) -> Error {
    Error::Syntax(format!("{} takes {} operand{}", form, n, if n == 1 { "" } else { "s" }))
}

fn sf_quote(rt: &mut Runtime, frame: Frame) -> Flow<Step> {
    let [datum] = rt.operands::<1>(frame, "quote")?;
    Ok(Step::Done(datum))
}

fn sf_if(rt: &mut Runtime, frame: Frame) -> Flow<Step> {
    let ops = rt.stack.get(frame, 0);
    let (pred, conseq, alt) = match rt.heap.list_items(ops, "if")?.as_slice() {
        [p, c] => (*p, *c, Value::Unspecified),
        [p, c, a] => (*p, *c, *a),
        _ => return Err(Error::Syntax("if takes 2 or 3 operands".to_string()).into()),
    };

    if rt.eval_in(frame, pred)?.truthy() {
        Ok(Step::Tail(conseq))
    } else {
        Ok(Step::Tail(alt))
    }
}

fn sf_define(rt: &mut Runtime, frame: Frame) -> Flow<Step> {
    let ops = rt.stack.get(frame, 0);
    if !rt.heap.is_pair(ops) {
        return Err(Error::Syntax("define takes a target".to_string()).into());
    }
    let target = rt.heap.car(ops)?;
    let rest = rt.heap.cdr(ops)?;
    let env = rt.stack.env(frame);

    match rt.heap.tag(target)? {
        Tag::Symbol => {
            let value = match rt.heap.list_items(rest, "define")?.as_slice() {
                [expr] => rt.eval_in(frame, *expr)?,
                _ => return Err(bad_shape("define", 2).into()),
            };
            rt.env_define(frame, env, target, value)?;
        }
        // (define (name . formals) body...)
        Tag::Pair => {
            let name = rt.heap.car(target)?;
            if !rt.heap.is_symbol(name) {
                return Err(Error::Syntax(format!(
                    "cannot define {}",
                    rt.heap.repr(name)
                ))
                .into());
            }
            let formals = rt.heap.cdr(target)?;
            let proc = rt.make_lambda(frame, formals, rest)?;
            rt.env_define(frame, env, name, proc)?;
        }
        _ => {
            return Err(Error::Syntax(format!(
                "cannot define {}",
                rt.heap.repr(target)
            ))
            .into())
        }
    }
    Ok(Step::Done(Value::Unspecified))
}

fn sf_set(rt: &mut Runtime, frame: Frame) -> Flow<Step> {
    let [name, expr] = rt.operands::<2>(frame, "set!")?;
    if !rt.heap.is_symbol(name) {
        return Err(Error::Syntax(format!("cannot set! {}", rt.heap.repr(name))).into());
    }
    let value = rt.eval_in(frame, expr)?;
    let env = rt.stack.env(frame);
    rt.heap.env_set(env, name, value)?;
    Ok(Step::Done(Value::Unspecified))
}

fn sf_lambda(rt: &mut Runtime, frame: Frame) -> Flow<Step> {
    let ops = rt.stack.get(frame, 0);
    if !rt.heap.is_pair(ops) {
        return Err(Error::Syntax("lambda takes formals".to_string()).into());
    }
    let formals = rt.heap.car(ops)?;
    let body = rt.heap.cdr(ops)?;
    Ok(Step::Done(rt.make_lambda(frame, formals, body)?))
}

/// Like `lambda`, but the closure becomes a macro rule. A use
/// `(m a b)` applies the rule to the unevaluated operands spread as
/// separate arguments, not as one list; a rule wanting the whole list
/// takes a rest formal, as in `(lambda-syntax args ...)`.
fn sf_lambda_syntax(rt: &mut Runtime, frame: Frame) -> Flow<Step> {
    let ops = rt.stack.get(frame, 0);
    if !rt.heap.is_pair(ops) {
        return Err(Error::Syntax("lambda-syntax takes formals".to_string()).into());
    }
    let formals = rt.heap.car(ops)?;
    let body = rt.heap.cdr(ops)?;
    let rule = rt.make_lambda(frame, formals, body)?;
    Ok(Step::Done(rt.make_macro(frame, rule)?))
}

fn sf_begin(rt: &mut Runtime, frame: Frame) -> Flow<Step> {
    let ops = rt.stack.get(frame, 0);
    let exprs = rt.heap.list_items(ops, "begin")?;
    let Some((last, init)) = exprs.split_last() else {
        return Ok(Step::Done(Value::Unspecified));
    };
    // `exprs` stays reachable through the operand list in slot 0
    for expr in init {
        rt.eval_in(frame, *expr)?;
    }
    Ok(Step::Tail(*last))
}

fn sf_unquote(_rt: &mut Runtime, _frame: Frame) -> Flow<Step> {
    Err(Error::Syntax("unquote outside of quasiquote".to_string()).into())
}

fn sf_quasiquote(rt: &mut Runtime, frame: Frame) -> Flow<Step> {
    let [template] = rt.operands::<1>(frame, "quasiquote")?;
    Ok(Step::Done(rt.quasi(frame, template, true)?))
}

// quasiquote builder slots
const CURSOR: usize = 0;
const HEAD: usize = 1;
const LAST: usize = 2;
const SPLICE: usize = 3;

impl Runtime {
    /// Payload of `(marker x)` if `v` is exactly that form
    fn marked(&self, v: Value, marker: Value) -> Result<Option<Value>> {
        if !self.heap.is_pair(v) || self.heap.car(v)? != marker {
            return Ok(None);
        }
        let rest = self.heap.cdr(v)?;
        if self.heap.is_pair(rest) && self.heap.cdr(rest)? == Value::Nil {
            return Ok(Some(self.heap.car(rest)?));
        }
        Err(Error::Syntax(format!(
            "{} takes 1 operand",
            self.heap.display(marker)
        )))
    }

    /// Copies `template`, evaluating unquoted parts and splicing
    /// unquote-spliced lists in place. With `scan` off, or inside a
    /// nested quasiquote, the copy is plain data.
    fn quasi(&mut self, frame: Frame, template: Value, scan: bool) -> Flow<Value> {
        let unquote = self.syms.unquote;
        let splicing = self.syms.unquote_splicing;

        let scan = scan
            && !(self.heap.is_pair(template)
                && self.heap.car(template)? == self.syms.quasiquote);

        if scan {
            if let Some(expr) = self.marked(template, unquote)? {
                return self.eval_in(frame, expr);
            }
        }
        match self.heap.tag(template)? {
            Tag::Pair => (),
            Tag::Vector => return self.quasi_vector(frame, template, scan),
            _ => return Ok(template),
        }

        let w = self.extend(frame, 4, Extend::CLEAR | Extend::SAVE_LINK | Extend::SAME_ENV)?;
        self.stack.set(w, CURSOR, template);
        self.stack.set(w, HEAD, Value::Nil);
        self.stack.set(w, LAST, Value::Nil);

        loop {
            let cursor = self.stack.get(w, CURSOR);
            if cursor == Value::Nil {
                break;
            }
            // dotted tail: `(a . ,b)` reads as `(a unquote b)`
            let tail = if scan { self.marked(cursor, unquote)? } else { None };
            if let Some(expr) = tail {
                let v = self.eval_in(w, expr)?;
                self.quasi_attach(w, v)?;
                break;
            }
            if !self.heap.is_pair(cursor) {
                self.quasi_attach(w, cursor)?;
                break;
            }

            let item = self.heap.car(cursor)?;
            let splice = if scan { self.marked(item, splicing)? } else { None };
            if let Some(expr) = splice {
                let spliced = self.eval_in(w, expr)?;
                self.stack.set(w, SPLICE, spliced);
                let mut rest = spliced;
                while rest != Value::Nil {
                    if !self.heap.is_pair(rest) {
                        return Err(Error::MalformedList("unquote-splicing".to_string()).into());
                    }
                    let v = self.heap.car(rest)?;
                    self.quasi_append(w, v)?;
                    rest = self.heap.cdr(rest)?;
                }
            } else {
                let v = self.quasi(w, item, scan)?;
                self.quasi_append(w, v)?;
            }

            let next = self.heap.cdr(self.stack.get(w, CURSOR))?;
            self.stack.set(w, CURSOR, next);
        }

        Ok(self.stack.get(w, HEAD))
    }

    fn quasi_vector(&mut self, frame: Frame, template: Value, scan: bool) -> Flow<Value> {
        let w = self.extend(frame, 2, Extend::CLEAR | Extend::SAVE_LINK | Extend::SAME_ENV)?;
        self.stack.set(w, 0, template);
        let len = self.heap.vector_len(template)?;
        let copy = self.make_vector(w, len, Value::Nil)?;
        self.stack.set(w, 1, copy);
        for i in 0..len {
            let item = self.heap.vector_ref(template, i)?;
            let v = self.quasi(w, item, scan)?;
            self.heap.vector_set(copy, i, v)?;
        }
        Ok(copy)
    }

    fn quasi_append(&mut self, w: Frame, v: Value) -> Result<()> {
        let cell = self.cons(w, v, Value::Nil)?;
        self.quasi_attach(w, cell)?;
        self.stack.set(w, LAST, cell);
        Ok(())
    }

    /// Hooks `tail` onto the end of the list built so far
    fn quasi_attach(&mut self, w: Frame, tail: Value) -> Result<()> {
        let last = self.stack.get(w, LAST);
        if last == Value::Nil {
            self.stack.set(w, HEAD, tail);
        } else {
            self.heap.set_cdr(last, tail)?;
        }
        Ok(())
    }
}
