// Sable, a compact Scheme runtime core.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// Sable is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/runtime/cont.rs

// One-shot escape continuations. `call/ec` hands its argument an
// escape object; invoking that object unwinds to the `call/ec` with a
// value. Escapes are valid only during the dynamic extent of the call
// that created them.

// <>

use log::trace;

use super::error::{Error, Flow, Signal};
use super::object::{Object, Value};
use super::stack::Frame;
use super::Runtime;

impl Runtime {
    /// Invokes the single argument of an application frame with a new
    /// escape continuation and returns either its result or the value
    /// delivered through the escape
    pub(crate) fn call_with_escape(&mut self, orig: Frame, app: Frame) -> Flow<Value> {
        let argc = self.stack.argc(app);
        if argc != 1 {
            return Err(Error::Arity(format!(
                "call-with-escape-continuation takes 1 argument, got {}",
                argc
            ))
            .into());
        }

        let receiver = self.stack.arg(app, 0);
        if !self.heap.callable(receiver) {
            return Err(Error::NotCallable(self.heap.repr(receiver)).into());
        }

        // slot 0 the call, slot 1 the continuation
        let sub = self.stack.extend_raw(app, 2, true)?;
        self.stack.set_link(sub, app);
        self.stack.set_env(sub, self.stack.env(orig));

        let k = Value::Obj(self.alloc(
            sub,
            Object::Escape {
                aux: Value::Unspecified,
                live: true,
            },
        )?);
        self.stack.set(sub, 1, k);

        let call = self.list(sub, &[receiver, k])?;
        self.stack.set(sub, 0, call);

        let result = self.eval_frame(sub);
        self.heap.escape_update(k, None, false)?;

        match result {
            Err(Signal::Escape(target)) if Value::Obj(target) == k => {
                trace!("escape caught");
                Ok(self.heap.escape_parts(k)?.0)
            }
            other => other,
        }
    }

    /// Delivers `v` through escape `k`, producing the signal that
    /// unwinds to its `call/ec`
    pub(crate) fn throw(&mut self, k: Value, v: Value) -> Signal {
        let live = match self.heap.escape_parts(k) {
            Ok((_, live)) => live,
            Err(e) => return e.into(),
        };
        if !live {
            return Error::DeadContinuation.into();
        }
        if let Err(e) = self.heap.escape_update(k, Some(v), true) {
            return e.into();
        }
        match k.handle() {
            Some(gc) => Signal::Escape(gc),
            None => Error::NotCallable(self.heap.repr(k)).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::{Config, Error, Runtime};

    fn eval(rt: &mut Runtime, src: &str) -> String {
        match rt.eval_str(src) {
            Ok(v) => rt.repr(v),
            Err(fatal) => panic!("{}", fatal),
        }
    }

    #[test]
    fn normal_return() {
        let mut rt = Runtime::new();
        assert_eq!(eval(&mut rt, "(call/ec (lambda (k) 5))"), "5");
    }

    #[test]
    fn escape_from_depth() {
        let mut rt = Runtime::new();
        eval(
            &mut rt,
            "(define (dive n k) (if (< n 1) (k 42) (+ 1 (dive (- n 1) k))))",
        );
        assert_eq!(
            eval(&mut rt, "(call/ec (lambda (k) (dive 50 k)))"),
            "42"
        );
        assert_eq!(
            eval(&mut rt, "(+ 1 (call-with-escape-continuation (lambda (k) (k 1) 99)))"),
            "2"
        );
    }

    #[test]
    fn nested_escapes_reach_their_own_catch() {
        let mut rt = Runtime::new();
        assert_eq!(
            eval(
                &mut rt,
                "(call/ec (lambda (outer) (+ 10 (call/ec (lambda (inner) (outer 1))))))"
            ),
            "1"
        );
        assert_eq!(
            eval(
                &mut rt,
                "(call/ec (lambda (outer) (+ 10 (call/ec (lambda (inner) (inner 1))))))"
            ),
            "11"
        );
    }

    #[test]
    fn escape_after_extent_is_an_error() {
        let mut rt = Runtime::new();
        eval(&mut rt, "(define saved #f)");
        eval(&mut rt, "(call/ec (lambda (k) (set! saved k) 0))");
        let fatal = rt.eval_str("(saved 1)").unwrap_err();
        assert_eq!(fatal.error, Error::DeadContinuation);
    }

    #[test]
    fn escape_under_stress() {
        let mut rt = Runtime::with_config(Config {
            gc_stress: true,
            ..Config::default()
        });
        eval(
            &mut rt,
            "(define (dive n k) (if (< n 1) (k (cons 'found n)) (+ 1 (dive (- n 1) k))))",
        );
        assert_eq!(
            eval(&mut rt, "(call/ec (lambda (k) (dive 10 k)))"),
            "(found . 0)"
        );
    }
}
