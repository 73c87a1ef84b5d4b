// Sable, a compact Scheme runtime core.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// Sable is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/main.rs

// Command line entry: `sable FILE` runs a program, `sable` alone
// starts a REPL.

// <>

use sable::runtime::{Config, Runtime};

use std::env;
use std::io::{self, BufRead, Write};
use std::process;
use std::thread;

use log::{error, LevelFilter};

/// Native stack for the evaluation thread; non-tail recursion in
/// programs nests native calls
const EVAL_THREAD_STACK: usize = 64 * 1024 * 1024;

fn main() {
    let level = env::var("SABLE_LOG")
        .ok()
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Warn);

    if let Err(e) = simple_logger::SimpleLogger::new().with_level(level).init() {
        eprintln!("logger setup failed: {}", e);
    }

    let args: Vec<String> = env::args().collect();
    let file = args.get(1).cloned();

    let worker = thread::Builder::new()
        .name("eval".to_string())
        .stack_size(EVAL_THREAD_STACK)
        .spawn(move || match file {
            Some(path) => run_file(&path),
            None => repl(),
        });

    let status = match worker.map(|handle| handle.join()) {
        Ok(Ok(status)) => status,
        Ok(Err(_)) => {
            error!("evaluation thread panicked");
            1
        }
        Err(e) => {
            error!("could not start evaluation thread: {}", e);
            1
        }
    };
    process::exit(status);
}

fn run_file(path: &str) -> i32 {
    let src = match std::fs::read_to_string(path) {
        Ok(src) => src,
        Err(e) => {
            eprintln!("{}: {}", path, e);
            return 1;
        }
    };

    let mut rt = Runtime::with_config(Config::from_env());
    match rt.eval_str(&src) {
        Ok(_) => 0,
        Err(fatal) => {
            eprintln!("{}", fatal);
            1
        }
    }
}

/// Line-based; a failed line reports its diagnostic and the session
/// continues with the toplevel as the failure left it
fn repl() -> i32 {
    let mut rt = Runtime::with_config(Config::from_env());
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return 0,
            Ok(_) => (),
            Err(e) => {
                eprintln!("read failure: {}", e);
                return 1;
            }
        }

        if line.trim().is_empty() {
            continue;
        }

        match rt.eval_str(&line) {
            Ok(v) => println!("{}", rt.repr(v)),
            Err(fatal) => eprintln!("{}", fatal),
        }
    }
}
