// Sable, a compact Scheme runtime core.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// Sable is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/runtime/mod.rs

// The runtime context: heap, root-scan stack, and the handful of
// objects the evaluator must recognize by identity.

// <>

use log::{debug, info};

mod cont;
mod env;
mod error;
mod eval;
mod memmgt;
mod object;
mod parser;
mod specform;
mod stack;
mod stdenv;
mod symtab;

pub use error::{Error, Fatal, Result};
pub use memmgt::{Gc, HeapStats};
pub use object::{NativeFn, Object, Tag, Value};
pub use parser::{parse, Datum, Parser};
pub use stack::{Extend, Frame};

use memmgt::Heap;
use stack::RootStack;

/// Smallest root-scan stack accepted
const MIN_STACK_SLOTS: usize = 256;

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Root-scan stack capacity, in slots
    pub stack_slots: usize,
    /// Floor of the collection threshold, in bytes
    pub min_heap: usize,
    /// Collect before every allocation
    pub gc_stress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stack_slots: 8 * 1024,
            min_heap: 2 * 1024 * 1024,
            gc_stress: false,
        }
    }
}

impl Config {
    /// Defaults, with `SABLE_STRESS=1` turning on stress collection
    pub fn from_env() -> Self {
        Config {
            gc_stress: std::env::var("SABLE_STRESS").map_or(false, |v| v == "1"),
            ..Config::default()
        }
    }
}

/// Objects the evaluator intercepts or splices into code it builds
pub(crate) struct Builtins {
    pub eval: Value,
    pub apply: Value,
    pub call_ec: Value,
    pub begin: Value,
    pub quote: Value,
}

/// Symbols quasiquote looks for
pub(crate) struct Symbols {
    pub quasiquote: Value,
    pub unquote: Value,
    pub unquote_splicing: Value,
}

pub struct Runtime {
    pub(crate) heap: Heap,
    pub(crate) stack: RootStack,
    /// Interner dictionary
    pub(crate) symtab: Value,
    /// Frame holding the toplevel environment; every evaluation
    /// descends from it
    pub(crate) base: Frame,
    pub(crate) builtins: Builtins,
    pub(crate) syms: Symbols,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Builds a runtime; bootstrap runs with collection off and a stack
    /// of at least the minimum size, so it cannot fail
    pub fn with_config(config: Config) -> Self {
        match Self::try_with_config(config) {
            Ok(rt) => rt,
            Err(e) => panic!("runtime bootstrap failed: {}", e),
        }
    }

    pub fn try_with_config(config: Config) -> Result<Self> {
        let slots = config.stack_slots.max(MIN_STACK_SLOTS);
        let stack = RootStack::new(slots);
        let end = stack.end();

        let mut rt = Runtime {
            heap: Heap::new(config.min_heap, config.gc_stress),
            stack,
            symtab: Value::Nil,
            base: end,
            builtins: Builtins {
                eval: Value::Nil,
                apply: Value::Nil,
                call_ec: Value::Nil,
                begin: Value::Nil,
                quote: Value::Nil,
            },
            syms: Symbols {
                quasiquote: Value::Nil,
                unquote: Value::Nil,
                unquote_splicing: Value::Nil,
            },
        };

        rt.heap.set_enabled(false);

        rt.symtab = rt.make_dict(end, 256)?;
        let sp = rt.stack.push(end, rt.symtab)?;
        let toplevel = rt.make_env(sp, Value::Nil)?;
        let sp = rt.stack.push(sp, toplevel)?;

        rt.syms = Symbols {
            quasiquote: rt.intern(sp, "quasiquote")?,
            unquote: rt.intern(sp, "unquote")?,
            unquote_splicing: rt.intern(sp, "unquote-splicing")?,
        };

        let (begin, quote) = specform::install(&mut rt, sp, toplevel)?;
        let lib = stdenv::install(&mut rt, sp, toplevel)?;
        rt.builtins = Builtins {
            eval: lib.eval,
            apply: lib.apply,
            call_ec: lib.call_ec,
            begin,
            quote,
        };

        // pinned below the interner and toplevel, so rebinding a name
        // never frees what the evaluator holds by identity
        let pinned = [lib.eval, lib.apply, lib.call_ec, begin, quote];
        let sp = rt.stack.push_roots(sp, &pinned)?;

        rt.base = rt.stack.extend_raw(sp, 0, true)?;
        rt.stack.set_env(rt.base, toplevel);

        rt.heap.set_enabled(true);

        let stats = rt.heap.stats();
        info!(
            "runtime ready: {} symbols, {} records, {} bytes",
            rt.symbol_count(),
            stats.population,
            stats.live_bytes
        );
        Ok(rt)
    }

    /// The base frame; its environment is the toplevel
    pub fn toplevel(&self) -> Frame {
        self.base
    }

    /// Deepest root-scan stack extent reached so far, in slots
    pub fn stack_peak(&self) -> usize {
        self.stack.peak_depth()
    }

    /// Reads and evaluates every expression of `src` in the toplevel,
    /// returning the last value
    pub fn eval_str(&mut self, src: &str) -> Result<Value, Fatal> {
        let base = self.base;
        let env = self.stack.env(base);
        self.eval_source(base, env, src)
    }

    /// Reads and evaluates every expression of `src` in `env`, each in
    /// its own child of `frame`
    pub fn eval_source(&mut self, frame: Frame, env: Value, src: &str) -> Result<Value, Fatal> {
        let data = parser::parse(src).map_err(Fatal::new)?;
        debug!("evaluating {} expressions", data.len());

        let mut last = Value::Unspecified;
        for datum in &data {
            let sub = self
                .extend(frame, 1, Extend::CLEAR | Extend::SAVE_LINK)
                .map_err(Fatal::new)?;
            self.stack.set_env(sub, env);
            let expr = self.materialize(sub, datum).map_err(Fatal::new)?;
            self.stack.set(sub, 0, expr);
            last = self.eval_frame(sub).map_err(Self::into_fatal)?;

            if self.heap.want_collect() {
                let sp = self.stack.push_roots(frame, &[last]).map_err(Fatal::new)?;
                self.collect_from(sp);
            }
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_leaves_builtins_pinned() {
        let mut rt = Runtime::new();
        let before = rt.heap_stats().population;
        rt.eval_str("(define eval 1) (define apply 2) (define begin 3)")
            .unwrap();
        rt.collect();
        assert!(rt.heap.contains(rt.builtins.eval));
        assert!(rt.heap.contains(rt.builtins.apply));
        assert!(rt.heap.contains(rt.builtins.begin));
        assert!(rt.heap_stats().population <= before + 8);
        // closures still splice the pinned `begin`
        assert_eq!(
            rt.eval_str("((lambda () 1 2))").map(|v| rt.repr(v)).unwrap(),
            "2"
        );
    }

    #[test]
    fn small_stacks_are_raised_to_minimum() {
        let rt = Runtime::with_config(Config {
            stack_slots: 4,
            ..Config::default()
        });
        assert_eq!(rt.stack.capacity(), MIN_STACK_SLOTS);
    }

    #[test]
    fn eval_str_returns_last_value() {
        let mut rt = Runtime::new();
        let v = rt.eval_str("1 2 (+ 1 2)").unwrap();
        assert_eq!(rt.repr(v), "3");
        let v = rt.eval_str("").unwrap();
        assert_eq!(v, Value::Unspecified);
    }

    #[test]
    fn pending_collection_runs_between_forms() {
        let mut rt = Runtime::with_config(Config {
            min_heap: 1,
            ..Config::default()
        });
        // bootstrap ran with collection off, so the heap is over threshold
        assert!(rt.heap.want_collect());
        assert_eq!(rt.heap_stats().collections, 0);
        rt.eval_str("#t").unwrap();
        assert_eq!(rt.heap_stats().collections, 1);
        assert!(!rt.heap.want_collect());
    }

    #[test]
    fn read_errors_are_fatal() {
        let mut rt = Runtime::new();
        let fatal = rt.eval_str("(car '(1)").unwrap_err();
        assert!(matches!(fatal.error, Error::Read(_)));
    }

    #[test]
    fn evaluate_datum_from_host() {
        let mut rt = Runtime::new();
        let top = rt.toplevel();
        let data = parse("(cons 1 2)").unwrap();
        let w = rt.extend(top, 1, Extend::SAVE_LINK | Extend::SAME_ENV).unwrap();
        let expr = rt.materialize(w, &data[0]).unwrap();
        rt.stack.set(w, 0, expr);
        let v = rt.evaluate(w, expr).unwrap();
        assert_eq!(rt.repr(v), "(1 . 2)");
    }
}
