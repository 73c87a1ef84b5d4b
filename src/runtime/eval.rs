// Sable, a compact Scheme runtime core.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// Sable is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/runtime/eval.rs

// Iterative evaluator. Each evaluation owns one frame whose slot 0
// holds the expression; tail positions replace that expression and
// loop instead of descending, so a tail-recursive loop runs in
// constant frame stack and constant native stack.

// <>

use log::trace;

use super::error::{Error, Fatal, Flow, Signal};
use super::object::{Object, SpecialFn, Step, Tag, Value};
use super::stack::{Extend, Frame, Slot};
use super::Runtime;

/// What a combination's head names when it is syntax
enum Syntax {
    Form(SpecialFn),
    Macro(Value),
}

/// Longest backtrace reported
const TRACE_LINES: usize = 48;
/// Longest representation of one value in a backtrace line
const TRACE_WIDTH: usize = 160;

impl Runtime {
    /// Evaluates `expr` in a child of `frame` and its environment
    pub fn evaluate(&mut self, frame: Frame, expr: Value) -> Result<Value, Fatal> {
        let sub = self
            .extend(frame, 1, Extend::SAVE_LINK | Extend::SAME_ENV)
            .map_err(Fatal::new)?;
        self.stack.set(sub, 0, expr);
        self.eval_frame(sub).map_err(Self::into_fatal)
    }

    pub(crate) fn into_fatal(sig: Signal) -> Fatal {
        match sig {
            Signal::Fatal(fatal) => *fatal,
            // no live `call/ec` matched; its extent has ended
            Signal::Escape(_) => Fatal::new(Error::DeadContinuation),
        }
    }

    /// Evaluates `expr` in a fresh child frame sharing `frame`'s
    /// environment
    pub(crate) fn eval_in(&mut self, frame: Frame, expr: Value) -> Flow<Value> {
        let sub = self.extend(frame, 1, Extend::SAVE_LINK | Extend::SAME_ENV)?;
        self.stack.set(sub, 0, expr);
        self.eval_frame(sub)
    }

    /// Evaluates the expression in slot 0 of `frame`
    ///
    /// The first fatal error to pass through picks up a backtrace of
    /// the frames live where it was raised.
    pub fn eval_frame(&mut self, frame: Frame) -> Flow<Value> {
        match self.eval_loop(frame) {
            Err(Signal::Fatal(mut fatal)) if !fatal.traced => {
                fatal.backtrace = self.backtrace(frame);
                fatal.traced = true;
                Err(Signal::Fatal(fatal))
            }
            other => other,
        }
    }

    fn eval_loop(&mut self, frame: Frame) -> Flow<Value> {
        loop {
            let expr = self.stack.get(frame, 0);

            if cfg!(feature = "stkdbg") {
                trace!("eval @{}: {}", frame.index(), self.heap.repr(expr));
            }

            match self.heap.tag(expr)? {
                Tag::Pair => (),
                Tag::Symbol => return Ok(self.eval_symbol(frame, expr)?),
                Tag::Nil => return Err(Error::Eval("empty combination ()".to_string()).into()),
                _ => return Ok(expr),
            }

            let head = self.heap.car(expr)?;
            let operands = self.heap.cdr(expr)?;

            let step = match self.syntax_of(frame, head)? {
                Some(Syntax::Form(form)) => {
                    let sub = self.extend(frame, 1, Extend::SAVE_LINK | Extend::SAME_ENV)?;
                    self.stack.set(sub, 0, operands);
                    form(self, sub)?
                }
                Some(Syntax::Macro(rule)) => Step::Tail(self.expand_macro(frame, rule, operands)?),
                None => self.combine(frame, head, operands)?,
            };

            match step {
                Step::Done(v) => return Ok(v),
                Step::Tail(next) => self.stack.set(frame, 0, next),
            }
        }
    }

    /// A head is syntax if it is a special form object itself, or a
    /// symbol whose visible binding is a special form or macro
    fn syntax_of(&self, frame: Frame, head: Value) -> Flow<Option<Syntax>> {
        let target = match self.heap.tag(head)? {
            Tag::Symbol => match self.heap.env_lookup(self.stack.env(frame), head)? {
                Some(v) => v,
                None => return Ok(None),
            },
            Tag::SpecialForm => head,
            _ => return Ok(None),
        };

        Ok(match self.heap.deref(target)? {
            Some(Object::SpecialForm { func, .. }) => Some(Syntax::Form(*func)),
            Some(Object::Macro { rule }) => Some(Syntax::Macro(*rule)),
            _ => None,
        })
    }

    fn eval_symbol(&self, frame: Frame, sym: Value) -> Result<Value, Error> {
        match self.heap.env_lookup(self.stack.env(frame), sym)? {
            Some(v) => match self.heap.tag(v)? {
                Tag::SpecialForm | Tag::Macro => Err(Error::BadSyntax(self.heap.display(sym))),
                _ => Ok(v),
            },
            None => Err(Error::UnboundVariable(self.heap.display(sym))),
        }
    }

    /// Runs a macro's rule on the unevaluated operands by evaluating
    /// `(apply rule (quote operands))`; the result is the expansion
    fn expand_macro(&mut self, frame: Frame, rule: Value, operands: Value) -> Flow<Value> {
        let sub = self.extend(frame, 1, Extend::SAVE_LINK | Extend::SAME_ENV)?;
        let quote = self.builtins.quote;
        let apply = self.builtins.apply;

        let call = self.list(sub, &[quote, operands])?;
        self.stack.set(sub, 0, call);
        let call = self.list(sub, &[apply, rule, call])?;
        self.stack.set(sub, 0, call);

        if cfg!(feature = "stkdbg") {
            trace!("expand {}", self.heap.repr(call));
        }

        self.eval_frame(sub)
    }

    /// Evaluates a procedure call. Returns `Step::Tail` when the call
    /// continues in `orig` with a new expression and environment.
    fn combine(&mut self, orig: Frame, head: Value, operands: Value) -> Flow<Step> {
        let env = self.stack.env(orig);

        let mut proc = self.eval_in(orig, head)?;
        if !self.heap.callable(proc) {
            return Err(Error::NotCallable(self.heap.repr(proc)).into());
        }

        let mut args = operands;
        let mut evaluate = true;

        loop {
            // callable just below the frame, then argument expressions
            // leftmost first, each pushed below the last
            let mut sp = self.stack.push(orig, proc)?;
            let mut argc = 0;
            while self.heap.is_pair(args) {
                sp = self.stack.push(sp, self.heap.car(args)?)?;
                args = self.heap.cdr(args)?;
                argc += 1;
            }
            if args != Value::Nil {
                return Err(Error::MalformedList(format!(
                    "arguments to {}",
                    self.heap.repr(proc)
                ))
                .into());
            }

            // rightmost argument sits lowest and is evaluated first
            if evaluate {
                for i in 0..argc {
                    let af = self.stack.extend_raw(sp, 1, true)?;
                    self.stack.set_link(af, orig);
                    self.stack.set_env(af, env);
                    self.stack.set(af, 0, self.stack.peek(sp, i));
                    let v = self.eval_frame(af)?;
                    self.stack.poke(sp, i, v);
                }
            }

            let app = self.stack.extend_raw(sp, 0, true)?;
            self.stack.set_link(app, orig);

            if proc == self.builtins.eval {
                return self.eval_primitive(orig, app);
            }

            if proc == self.builtins.apply {
                if argc != 2 {
                    return Err(Error::Arity(format!("apply takes 2 arguments, got {}", argc)).into());
                }
                let target = self.stack.arg(app, 0);
                if !self.heap.callable(target) {
                    return Err(Error::NotCallable(self.heap.repr(target)).into());
                }
                args = self.stack.arg(app, 1);
                proc = target;
                evaluate = false;
                continue;
            }

            if proc == self.builtins.call_ec {
                return self.call_with_escape(orig, app).map(Step::Done);
            }

            return match self.heap.deref(proc)? {
                Some(Object::Procedure { func, .. }) => {
                    let func = *func;
                    Ok(Step::Done(func(self, app)?))
                }
                Some(Object::Escape { .. }) => {
                    if argc != 1 {
                        return Err(Error::Arity(format!(
                            "escape continuation takes 1 argument, got {}",
                            argc
                        ))
                        .into());
                    }
                    let v = self.stack.arg(app, 0);
                    Err(self.throw(proc, v))
                }
                Some(Object::Closure { .. }) => {
                    let seq = self.bind_closure(orig, app, proc)?;
                    Ok(Step::Tail(seq))
                }
                _ => Err(Error::NotCallable(self.heap.repr(proc)).into()),
            };
        }
    }

    /// `(eval expr)` continues in the caller's environment; with a
    /// second argument it continues in that environment instead
    fn eval_primitive(&mut self, orig: Frame, app: Frame) -> Flow<Step> {
        match self.stack.argc(app) {
            1 => Ok(Step::Tail(self.stack.arg(app, 0))),
            2 => {
                let env = self.stack.arg(app, 1);
                if !self.heap.is(env, Tag::Environment) {
                    return Err(self.heap.mismatch("environment", env).into());
                }
                self.stack.set_env(orig, env);
                Ok(Step::Tail(self.stack.arg(app, 0)))
            }
            n => Err(Error::Arity(format!("eval takes 1 or 2 arguments, got {}", n)).into()),
        }
    }

    /// Binds a closure's formals to the arguments in a fresh
    /// environment, installs that environment in `orig`, and returns
    /// the body as one sequence to continue with
    fn bind_closure(&mut self, orig: Frame, app: Frame, proc: Value) -> Result<Value, Error> {
        let (cenv, mut formals, body) = self.heap.closure_parts(proc)?;
        let argc = self.stack.argc(app);

        let env = self.make_env(app, cenv)?;
        self.stack.set_env(app, env);

        let mut bound = 0;
        loop {
            match self.heap.tag(formals)? {
                Tag::Pair => {
                    if bound == argc {
                        return Err(arity_mismatch(bound + self.heap.list_len(formals), argc));
                    }
                    let name = self.heap.car(formals)?;
                    let v = self.stack.arg(app, bound);
                    self.env_define(app, env, name, v)?;
                    bound += 1;
                    formals = self.heap.cdr(formals)?;
                }
                Tag::Nil => {
                    if bound < argc {
                        return Err(arity_mismatch(bound, argc));
                    }
                    break;
                }
                Tag::Symbol => {
                    let mut rest = Value::Nil;
                    for i in (bound..argc).rev() {
                        rest = self.cons(app, self.stack.arg(app, i), rest)?;
                    }
                    self.env_define(app, env, formals, rest)?;
                    break;
                }
                _ => return Err(Error::Syntax(format!("bad formals {}", self.heap.repr(formals)))),
            }
        }

        let seq = self.cons(app, self.builtins.begin, body)?;
        self.stack.set_env(orig, env);
        Ok(seq)
    }

    /// Representations of the rooted values from `frame` outward;
    /// saved links mark frame boundaries and environments are skipped
    pub(crate) fn backtrace(&self, frame: Frame) -> Vec<String> {
        let mut lines = Vec::new();
        let mut depth = 0;
        for slot in self.stack.slots_from(frame) {
            match slot {
                Slot::Link(_) => depth += 1,
                Slot::Val(v) if !self.heap.is(*v, Tag::Environment) => {
                    if lines.len() == TRACE_LINES {
                        lines.push("...".to_string());
                        break;
                    }
                    let mut text = self.heap.repr_within(*v, TRACE_WIDTH);
                    if text.len() > TRACE_WIDTH {
                        let mut cut = TRACE_WIDTH;
                        while !text.is_char_boundary(cut) {
                            cut -= 1;
                        }
                        text.truncate(cut);
                        text.push_str("...");
                    }
                    lines.push(format!("#{} {}", depth, text));
                }
                _ => (),
            }
        }
        lines
    }
}

fn arity_mismatch(expected: usize, got: usize) -> Error {
    Error::Arity(format!("expected {} arguments, got {}", expected, got))
}
