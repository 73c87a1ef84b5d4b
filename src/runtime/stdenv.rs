// Sable, a compact Scheme runtime core.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// Sable is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/runtime/stdenv.rs

// Native procedures which are part of the standard environment and
// are loaded into every toplevel.

// <>

use std::cmp::Ordering;

use super::error::{Error, Result};
use super::object::{NativeFn, Object, Tag, Value};
use super::stack::Frame;
use super::Runtime;

/// Generates a table of native procedures. Each entry gives a name, an
/// argument count (or `_` for procedures that check their own), the
/// argument names, and a body.
macro_rules! sable_fn {
    ( @bind $rt:ident $frame:ident $name:literal _ [ ] ) => {};

    ( @bind $rt:ident $frame:ident $name:literal $argct:literal [ $($args:ident),* ] ) => {
        let [$($args),*] = $rt.args::<$argct>($frame, $name)?;
    };

    ( const $array:ident; $rt:ident $frame:ident;
      $( $name:literal $argct:tt [ $($args:ident),* ] $body:block )+
    ) => {
        pub const $array: &[(&str, NativeFn)] =
            &[$(($name, |$rt: &mut Runtime, $frame: Frame| -> Result<Value> {
                sable_fn!(@bind $rt $frame $name $argct [ $($args),* ]);
                $body
            })),+];
    };
}

/// Alternate names bound to the same procedure object
pub const ALIASES: &[(&str, &str)] = &[
    ("call/ec", "call-with-escape-continuation"),
    ("call/cc", "call-with-escape-continuation"),
];

/// Report version accepted by the environment constructors
const REPORT_VERSION: i64 = 5;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Num {
    Fix(i64),
    Flo(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Fix(n) => n as f64,
            Num::Flo(x) => x,
        }
    }

    fn combine(self, other: Num, fix: fn(i64, i64) -> i64, flo: fn(f64, f64) -> f64) -> Num {
        match (self, other) {
            (Num::Fix(a), Num::Fix(b)) => Num::Fix(fix(a, b)),
            (a, b) => Num::Flo(flo(a.as_f64(), b.as_f64())),
        }
    }

    fn compare(self, other: Num) -> Option<Ordering> {
        match (self, other) {
            (Num::Fix(a), Num::Fix(b)) => Some(a.cmp(&b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }
}

impl Runtime {
    /// Exactly `N` arguments of an application frame, in call order
    pub fn args<const N: usize>(&self, frame: Frame, name: &str) -> Result<[Value; N]> {
        let argc = self.stack.argc(frame);
        if argc != N {
            return Err(Error::Arity(format!(
                "{} takes {} argument{}, got {}",
                name,
                N,
                if N == 1 { "" } else { "s" },
                argc
            )));
        }
        let mut out = [Value::Nil; N];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.stack.arg(frame, i);
        }
        Ok(out)
    }

    fn num(&self, v: Value) -> Result<Num> {
        match self.heap.deref(v)? {
            Some(Object::Fixnum(n)) => Ok(Num::Fix(*n)),
            Some(Object::Flonum(x)) => Ok(Num::Flo(*x)),
            _ => Err(self.heap.mismatch("number", v)),
        }
    }

    fn make_num(&mut self, frame: Frame, n: Num) -> Result<Value> {
        match n {
            Num::Fix(n) => self.fixnum(frame, n),
            Num::Flo(x) => self.flonum(frame, x),
        }
    }

    /// Left fold of every argument with `fix`/`flo`, starting at `unit`
    fn fold_nums(
        &mut self,
        frame: Frame,
        unit: Num,
        fix: fn(i64, i64) -> i64,
        flo: fn(f64, f64) -> f64,
    ) -> Result<Value> {
        let mut acc = unit;
        for i in 0..self.stack.argc(frame) {
            acc = acc.combine(self.num(self.stack.arg(frame, i))?, fix, flo);
        }
        self.make_num(frame, acc)
    }

    fn compare_nums(&self, a: Value, b: Value, want: fn(Ordering) -> bool) -> Result<Value> {
        let ord = self.num(a)?.compare(self.num(b)?);
        Ok(Value::Bool(ord.map(want).unwrap_or(false)))
    }

    fn index(&self, v: Value) -> Result<usize> {
        let n = self.heap.fixnum(v)?;
        usize::try_from(n).map_err(|_| Error::Type(format!("index {} is negative", n)))
    }

    fn check_version(&self, v: Value) -> Result<()> {
        match self.heap.fixnum(v)? {
            REPORT_VERSION => Ok(()),
            n => Err(Error::Type(format!(
                "expected report version {}, found {}",
                REPORT_VERSION, n
            ))),
        }
    }
}

sable_fn! {
    const LIBRARY;
    rt frame;

    "+" _ [] {
        rt.fold_nums(frame, Num::Fix(0), i64::wrapping_add, |a, b| a + b)
    }

    "*" _ [] {
        rt.fold_nums(frame, Num::Fix(1), i64::wrapping_mul, |a, b| a * b)
    }

    "-" _ [] {
        let argc = rt.stack.argc(frame);
        if argc == 0 {
            return Err(Error::Arity("- takes at least 1 argument, got 0".to_string()));
        }
        let first = rt.num(rt.stack.arg(frame, 0))?;
        if argc == 1 {
            return rt.make_num(frame, Num::Fix(0).combine(first, i64::wrapping_sub, |a, b| a - b));
        }
        let mut acc = first;
        for i in 1..argc {
            acc = acc.combine(rt.num(rt.stack.arg(frame, i))?, i64::wrapping_sub, |a, b| a - b);
        }
        rt.make_num(frame, acc)
    }

    "<" 2 [fst, snd] {
        rt.compare_nums(fst, snd, Ordering::is_lt)
    }

    ">" 2 [fst, snd] {
        rt.compare_nums(fst, snd, Ordering::is_gt)
    }

    "=" 2 [fst, snd] {
        rt.compare_nums(fst, snd, Ordering::is_eq)
    }

    "cons" 2 [fst, snd] {
        rt.cons(frame, fst, snd)
    }

    "car" 1 [pair] {
        rt.heap.car(pair)
    }

    "cdr" 1 [pair] {
        rt.heap.cdr(pair)
    }

    "set-car!" 2 [pair, val] {
        rt.heap.set_car(pair, val)?;
        Ok(Value::Unspecified)
    }

    "set-cdr!" 2 [pair, val] {
        rt.heap.set_cdr(pair, val)?;
        Ok(Value::Unspecified)
    }

    "list" _ [] {
        let mut acc = Value::Nil;
        for i in (0..rt.stack.argc(frame)).rev() {
            acc = rt.cons(frame, rt.stack.arg(frame, i), acc)?;
        }
        Ok(acc)
    }

    "length" 1 [list] {
        let n = rt.heap.list_items(list, "length")?.len();
        rt.fixnum(frame, n as i64)
    }

    "make-vector" _ [] {
        let (len, fill) = match rt.stack.argc(frame) {
            1 => (rt.stack.arg(frame, 0), Value::Unspecified),
            2 => (rt.stack.arg(frame, 0), rt.stack.arg(frame, 1)),
            n => {
                return Err(Error::Arity(format!(
                    "make-vector takes 1 or 2 arguments, got {}",
                    n
                )))
            }
        };
        let len = rt.index(len)?;
        rt.make_vector(frame, len, fill)
    }

    "vector-length" 1 [vec] {
        let len = rt.heap.vector_len(vec)?;
        rt.fixnum(frame, len as i64)
    }

    "vector-ref" 2 [vec, idx] {
        let i = rt.index(idx)?;
        rt.heap.vector_ref(vec, i)
    }

    "vector-set!" 3 [vec, idx, val] {
        let i = rt.index(idx)?;
        rt.heap.vector_set(vec, i, val)?;
        Ok(Value::Unspecified)
    }

    "null?" 1 [val] {
        Ok(Value::Bool(val == Value::Nil))
    }

    "pair?" 1 [val] {
        Ok(Value::Bool(rt.heap.is(val, Tag::Pair)))
    }

    "symbol?" 1 [val] {
        Ok(Value::Bool(rt.heap.is(val, Tag::Symbol)))
    }

    "integer?" 1 [val] {
        Ok(Value::Bool(rt.heap.is(val, Tag::Fixnum)))
    }

    "vector?" 1 [val] {
        Ok(Value::Bool(rt.heap.is(val, Tag::Vector)))
    }

    "procedure?" 1 [val] {
        Ok(Value::Bool(rt.heap.callable(val)))
    }

    "eq?" 2 [fst, snd] {
        Ok(Value::Bool(rt.heap.equivalent(fst, snd)?))
    }

    "not" 1 [val] {
        Ok(Value::Bool(!val.truthy()))
    }

    // the evaluator intercepts these three by identity
    "eval" _ [] {
        Err(Error::Eval(format!(
            "eval reached as an ordinary procedure with {} arguments",
            rt.stack.argc(frame)
        )))
    }

    "apply" _ [] {
        Err(Error::Eval(format!(
            "apply reached as an ordinary procedure with {} arguments",
            rt.stack.argc(frame)
        )))
    }

    "call-with-escape-continuation" _ [] {
        Err(Error::Eval(format!(
            "call/ec reached as an ordinary procedure with {} arguments",
            rt.stack.argc(frame)
        )))
    }

    "scheme-report-environment" 1 [version] {
        rt.check_version(version)?;
        let top = rt.stack.env(rt.toplevel());
        rt.make_env(frame, top)
    }

    "null-environment" 1 [version] {
        rt.check_version(version)?;
        let env = rt.make_env(frame, Value::Nil)?;
        let inner = rt.stack.push_roots(frame, &[env])?;
        super::specform::install(rt, inner, env)?;
        Ok(env)
    }

    "runtime-info" 0 [] {
        let stats = rt.heap_stats();
        println!(
            "frame stack: {} deep, {} peak, {} capacity",
            rt.stack.capacity() - frame.index(),
            rt.stack.peak_depth(),
            rt.stack.capacity()
        );
        for line in rt.backtrace(frame) {
            println!("  {}", line);
        }
        println!(
            "heap: {} records, {} bytes live, next collection at {}, {} collections",
            stats.population, stats.live_bytes, stats.threshold, stats.collections
        );
        println!(
            "symbols: {} interned in {} buckets",
            rt.symbol_count(),
            rt.heap.dict_buckets(rt.symtab)?
        );
        Ok(Value::Unspecified)
    }

    "gc" 0 [] {
        let freed = rt.collect_from(frame);
        rt.fixnum(frame, freed as i64)
    }

    "display" 1 [val] {
        print!("{}", rt.heap.display(val));
        Ok(Value::Unspecified)
    }

    "newline" 0 [] {
        println!();
        Ok(Value::Unspecified)
    }

    "load" 1 [path] {
        let path = match rt.heap.deref(path)? {
            Some(Object::Str(text)) => text.to_string(),
            _ => return Err(rt.heap.mismatch("string", path)),
        };
        let src = std::fs::read_to_string(&path)
            .map_err(|e| Error::Read(format!("{}: {}", path, e)))?;
        let top = rt.stack.env(rt.toplevel());
        rt.eval_source(frame, top, &src).map_err(|fatal| fatal.error)
    }
}

/// Installed escape-capture, `eval`, and `apply` procedures
pub(crate) struct Intercepted {
    pub eval: Value,
    pub apply: Value,
    pub call_ec: Value,
}

/// Binds the library into `env`
pub(crate) fn install(rt: &mut Runtime, frame: Frame, env: Value) -> Result<Intercepted> {
    for &(name, func) in LIBRARY {
        let proc = rt.procedure(frame, name, func)?;
        let sym = rt.intern(frame, name)?;
        rt.env_define(frame, env, sym, proc)?;
    }

    for &(alias, name) in ALIASES {
        let proc = lookup(rt, frame, env, name)?;
        let sym = rt.intern(frame, alias)?;
        rt.env_define(frame, env, sym, proc)?;
    }

    Ok(Intercepted {
        eval: lookup(rt, frame, env, "eval")?,
        apply: lookup(rt, frame, env, "apply")?,
        call_ec: lookup(rt, frame, env, "call-with-escape-continuation")?,
    })
}

fn lookup(rt: &mut Runtime, frame: Frame, env: Value, name: &str) -> Result<Value> {
    let sym = rt.intern(frame, name)?;
    rt.heap
        .env_lookup(env, sym)?
        .ok_or_else(|| Error::UnboundVariable(name.to_string()))
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

    fn fail(rt: &mut Runtime, src: &str) -> Error {
        rt.eval_str(src).unwrap_err().error
    }

    #[test]
    fn arithmetic() {
        let mut rt = Runtime::new();
        assert_eq!(eval(&mut rt, "(+)"), "0");
        assert_eq!(eval(&mut rt, "(- 10 1 2)"), "7");
        assert_eq!(eval(&mut rt, "(- 4)"), "-4");
        assert_eq!(eval(&mut rt, "(* 2 3 4)"), "24");
        assert_eq!(eval(&mut rt, "(+ 1 0.5)"), "1.5");
        assert_eq!(eval(&mut rt, "(< 1 2)"), "#t");
        assert_eq!(eval(&mut rt, "(> 1 2)"), "#f");
        assert_eq!(eval(&mut rt, "(= 3 3)"), "#t");
        assert!(matches!(fail(&mut rt, "(+ 1 'a)"), Error::Type(_)));
        assert!(matches!(fail(&mut rt, "(-)"), Error::Arity(_)));
        assert!(matches!(fail(&mut rt, "(< 1)"), Error::Arity(_)));
    }

    #[test]
    fn pairs_and_lists() {
        let mut rt = Runtime::new();
        assert_eq!(eval(&mut rt, "(cons 1 2)"), "(1 . 2)");
        assert_eq!(eval(&mut rt, "(car '(1 2))"), "1");
        assert_eq!(eval(&mut rt, "(cdr '(1 2))"), "(2)");
        assert_eq!(eval(&mut rt, "(list 1 2 3)"), "(1 2 3)");
        assert_eq!(eval(&mut rt, "(list)"), "()");
        assert_eq!(eval(&mut rt, "(length '(1 2 3))"), "3");
        eval(&mut rt, "(define p (cons 1 2))");
        eval(&mut rt, "(set-car! p 'a)");
        eval(&mut rt, "(set-cdr! p '(b))");
        assert_eq!(eval(&mut rt, "p"), "(a b)");
    }

    #[test]
    fn vectors() {
        let mut rt = Runtime::new();
        eval(&mut rt, "(define v (make-vector 3 0))");
        eval(&mut rt, "(vector-set! v 1 'x)");
        assert_eq!(eval(&mut rt, "v"), "#(0 x 0)");
        assert_eq!(eval(&mut rt, "(vector-length v)"), "3");
        assert_eq!(eval(&mut rt, "(vector-ref v 1)"), "x");
        assert!(matches!(fail(&mut rt, "(vector-ref v 3)"), Error::Type(_)));
        assert!(matches!(fail(&mut rt, "(make-vector -1)"), Error::Type(_)));
    }

    #[test]
    fn huge_vector_is_out_of_memory() {
        let mut rt = Runtime::new();
        assert!(matches!(
            fail(&mut rt, "(make-vector 1152921504606846975)"),
            Error::OutOfMemory { .. }
        ));
        assert_eq!(eval(&mut rt, "(vector-length (make-vector 5 #t))"), "5");
    }

    #[test]
    fn predicates() {
        let mut rt = Runtime::new();
        assert_eq!(eval(&mut rt, "(null? '())"), "#t");
        assert_eq!(eval(&mut rt, "(pair? '())"), "#f");
        assert_eq!(eval(&mut rt, "(symbol? 'a)"), "#t");
        assert_eq!(eval(&mut rt, "(integer? 1)"), "#t");
        assert_eq!(eval(&mut rt, "(integer? 1.5)"), "#f");
        assert_eq!(eval(&mut rt, "(vector? (make-vector 1))"), "#t");
        assert_eq!(eval(&mut rt, "(procedure? car)"), "#t");
        assert_eq!(eval(&mut rt, "(procedure? (lambda () 1))"), "#t");
        assert_eq!(eval(&mut rt, "(procedure? 'car)"), "#f");
        assert_eq!(eval(&mut rt, "(eq? 'a 'a)"), "#t");
        assert_eq!(eval(&mut rt, "(eq? 100 100)"), "#t");
        assert_eq!(eval(&mut rt, "(eq? '(1) '(1))"), "#f");
        assert_eq!(eval(&mut rt, "(not #f)"), "#t");
        assert_eq!(eval(&mut rt, "(not '())"), "#f");
    }

    #[test]
    fn environments() {
        let mut rt = Runtime::new();
        assert_eq!(
            eval(&mut rt, "(eval '(car '(1)) (scheme-report-environment 5))"),
            "1"
        );
        assert_eq!(
            eval(&mut rt, "(eval '(if #t 'yes 'no) (null-environment 5))"),
            "yes"
        );
        assert!(matches!(
            fail(&mut rt, "(eval '(car '(1)) (null-environment 5))"),
            Error::UnboundVariable(_)
        ));
        assert!(matches!(
            fail(&mut rt, "(scheme-report-environment 4)"),
            Error::Type(_)
        ));
    }

    #[test]
    fn definitions_in_report_environment_stay_local() {
        let mut rt = Runtime::new();
        eval(&mut rt, "(define e (scheme-report-environment 5))");
        eval(&mut rt, "(eval '(define hidden 1) e)");
        assert_eq!(eval(&mut rt, "(eval 'hidden e)"), "1");
        assert!(matches!(fail(&mut rt, "hidden"), Error::UnboundVariable(_)));
    }

    #[test]
    fn forced_collection() {
        let mut rt = Runtime::new();
        eval(&mut rt, "(define keep (list 1 2 3))");
        eval(&mut rt, "(list 4 5 6)");
        eval(&mut rt, "(gc)");
        assert_eq!(eval(&mut rt, "keep"), "(1 2 3)");
        assert_eq!(eval(&mut rt, "(integer? (gc))"), "#t");
    }

    #[test]
    fn aliases_share_procedure() {
        let mut rt = Runtime::new();
        assert_eq!(eval(&mut rt, "(eq? call/ec call/cc)"), "#t");
        assert_eq!(
            eval(&mut rt, "(eq? call/ec call-with-escape-continuation)"),
            "#t"
        );
    }

    #[test]
    fn library_under_stress() {
        let mut rt = Runtime::with_config(Config {
            gc_stress: true,
            ..Config::default()
        });
        assert_eq!(eval(&mut rt, "(list (+ 1 2) (* 2 3) (- 9 1))"), "(3 6 8)");
        eval(&mut rt, "(define v (make-vector 2 (cons 1 2)))");
        eval(&mut rt, "(vector-set! v 0 (list 'a 'b))");
        assert_eq!(eval(&mut rt, "v"), "#((a b) (1 . 2))");
    }
}
