// Sable, a compact Scheme runtime core.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// Sable is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// tests/scenarios.rs

// End-to-end programs run through the public entry points.

// <>

use sable::runtime::{Config, Error, Runtime};

fn stressed() -> Runtime {
    Runtime::with_config(Config {
        gc_stress: true,
        ..Config::default()
    })
}

fn run(rt: &mut Runtime, src: &str) -> String {
    match rt.eval_str(src) {
        Ok(v) => rt.repr(v),
        Err(fatal) => panic!("{}", fatal),
    }
}

fn both(src: &str, expected: &str) {
    assert_eq!(run(&mut Runtime::new(), src), expected);
    assert_eq!(run(&mut stressed(), src), expected);
}

#[test]
fn arithmetic_application() {
    both("(+ 1 2 3)", "6");
}

#[test]
fn lambda_application() {
    both("((lambda (x y) (+ x y)) 3 4)", "7");
}

#[test]
fn recursive_factorial() {
    both(
        "(define (fact n) (if (< n 2) 1 (* n (fact (- n 1))))) (fact 10)",
        "3628800",
    );
}

#[test]
fn quasiquote_splicing() {
    both("(define x 2) `(1 ,x ,@(list 3 4))", "(1 2 3 4)");
}

#[test]
fn escape_continuation() {
    both("(call/ec (lambda (k) (+ 1 (k 42))))", "42");
}

#[test]
fn macro_defined_with_lambda_syntax() {
    both(
        "(define swap! (lambda-syntax (a b) `(begin (define tmp ,a) (set! ,a ,b) (set! ,b tmp))))
         (define p 1) (define q 2) (swap! p q) (list p q)",
        "(2 1)",
    );
}

#[test]
fn tail_loop_runs_in_constant_stack() {
    let mut rt = Runtime::new();
    run(
        &mut rt,
        "(define (count n acc) (if (= n 0) acc (count (- n 1) (+ acc 1))))",
    );
    run(&mut rt, "(count 10 0)");
    let shallow = rt.stack_peak();
    assert_eq!(run(&mut rt, "(count 1000000 0)"), "1000000");
    assert_eq!(rt.stack_peak(), shallow);
}

#[test]
fn mutual_tail_calls_run_in_constant_stack() {
    let mut rt = Runtime::new();
    run(
        &mut rt,
        "(define (ev? n) (if (= n 0) #t (od? (- n 1))))
         (define (od? n) (if (= n 0) #f (ev? (- n 1))))",
    );
    run(&mut rt, "(ev? 10)");
    let shallow = rt.stack_peak();
    assert_eq!(run(&mut rt, "(ev? 100001)"), "#f");
    assert_eq!(rt.stack_peak(), shallow);
}

#[test]
fn arguments_evaluate_right_to_left() {
    both(
        "(define seen '())
         (define (note x) (set! seen (cons x seen)) x)
         (note 'a) (set! seen '())
         (list (note 1) (note 2) (note 3))
         seen",
        "(1 2 3)",
    );
}

#[test]
fn garbage_is_reclaimed() {
    let mut rt = Runtime::new();
    rt.collect();
    let baseline = rt.heap_stats().population;

    run(
        &mut rt,
        "(define (junk n) (if (= n 0) 'done (begin (list n n n) (junk (- n 1)))))",
    );
    run(&mut rt, "(junk 2000)");
    rt.collect();
    let after = rt.heap_stats().population;

    // only the definition of junk should remain
    assert!(after < baseline + 100, "{} live after, {} before", after, baseline);
}

#[test]
fn cycles_are_collected() {
    let mut rt = Runtime::new();
    rt.collect();
    let baseline = rt.heap_stats().population;

    run(
        &mut rt,
        "(define c (cons 1 2))
         (set-cdr! c c)
         (define c #f)",
    );
    rt.collect();
    let after = rt.heap_stats().population;
    assert!(after < baseline + 40, "{} live after, {} before", after, baseline);
}

#[test]
fn cyclic_structure_survives_while_referenced() {
    let mut rt = stressed();
    run(&mut rt, "(define c (list 1 2 3))");
    run(&mut rt, "(set-cdr! (cdr (cdr c)) c)");
    run(&mut rt, "(gc)");
    assert_eq!(run(&mut rt, "(car (cdr (cdr (cdr c))))"), "1");
}

#[test]
fn failure_reports_and_recovers() {
    let mut rt = Runtime::new();
    let fatal = rt.eval_str("(define (bad) (vector-ref 5 0)) (bad)").unwrap_err();
    assert!(matches!(fatal.error, Error::Type(_)));
    assert!(fatal.to_string().starts_with("FATAL -- "));
    assert_eq!(run(&mut rt, "(+ 2 2)"), "4");
}

#[test]
fn unbound_and_uncallable() {
    let mut rt = Runtime::new();
    assert_eq!(
        rt.eval_str("(nowhere 1)").unwrap_err().error,
        Error::UnboundVariable("nowhere".to_string())
    );
    assert!(matches!(
        rt.eval_str("(\"str\" 1)").unwrap_err().error,
        Error::NotCallable(_)
    ));
}

#[test]
fn stress_mode_collects_constantly() {
    let mut rt = stressed();
    run(
        &mut rt,
        "(define (build n) (if (= n 0) '() (cons n (build (- n 1)))))",
    );
    assert_eq!(run(&mut rt, "(length (build 50))"), "50");
    assert!(rt.heap_stats().collections > 50);
}

#[test]
fn inner_define_shadows_parameter() {
    both("((lambda (x) (define x 2) x) 1)", "2");
    both(
        "(define x 'outer) ((lambda (x) (set! x 'inner) x) 0) x",
        "outer",
    );
}

#[test]
fn escape_skips_pending_work() {
    both(
        "(define log '())
         (define (walk n k)
           (if (= n 0) (k 42) (begin (set! log (cons n log)) (+ 1 (walk (- n 1) k)))))
         (define result (call/ec (lambda (k) (walk 20 k))))
         (list result (length log))",
        "(42 20)",
    );
}
