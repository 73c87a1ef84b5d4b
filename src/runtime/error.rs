// Sable, a compact Scheme runtime core.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// Sable is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/runtime/error.rs

// Error kinds raised by the runtime, the fatal report handed back to
// the host, and the internal control signal that carries either one
// of those or an escape continuation through the evaluator.

// <>

use std::fmt;

use super::memmgt::Gc;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Evaluator control flow; only escapes and fatal errors unwind
pub type Flow<T> = std::result::Result<T, Signal>;

/// Every way an evaluation can fail
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("type error: {0}")]
    Type(String),
    #[error("arity error: {0}")]
    Arity(String),
    #[error("unbound variable: {0}")]
    UnboundVariable(String),
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("not callable: {0}")]
    NotCallable(String),
    #[error("malformed list: {0}")]
    MalformedList(String),
    #[error("bad syntax: {0} used as a value")]
    BadSyntax(String),
    #[error("out of memory: {requested} bytes requested with {live} bytes live")]
    OutOfMemory { requested: usize, live: usize },
    #[error("eval error: {0}")]
    Eval(String),
    #[error("frame stack overflow ({0} slots)")]
    StackOverflow(usize),
    #[error("escape continuation invoked outside its dynamic extent")]
    DeadContinuation,
    #[error("read error: {0}")]
    Read(String),
}

impl Error {
    pub(crate) fn type_err(expected: &str, found: &str) -> Self {
        Error::Type(format!("expected {}, found {}", expected, found))
    }
}

/// An unrecoverable evaluation failure, with the frame stack as it
/// stood where the error was raised
#[derive(Debug)]
pub struct Fatal {
    pub error: Error,
    pub backtrace: Vec<String>,
    pub(crate) traced: bool,
}

impl Fatal {
    pub(crate) fn new(error: Error) -> Self {
        Fatal {
            error,
            backtrace: Vec::new(),
            traced: false,
        }
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FATAL -- {}", self.error)?;
        for line in &self.backtrace {
            write!(f, "\n{}", line)?;
        }
        Ok(())
    }
}

impl std::error::Error for Fatal {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Non-local exit through the evaluator
#[derive(Debug)]
pub enum Signal {
    Fatal(Box<Fatal>),
    /// Jump to the `call/ec` that created this continuation; the
    /// delivered value waits in the continuation object itself
    Escape(Gc),
}

impl From<Error> for Signal {
    fn from(error: Error) -> Self {
        Signal::Fatal(Box::new(Fatal::new(error)))
    }
}

impl From<Fatal> for Signal {
    fn from(fatal: Fatal) -> Self {
        Signal::Fatal(Box::new(fatal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_report_includes_trace() {
        let mut fatal = Fatal::new(Error::UnboundVariable("frob".to_string()));
        fatal.backtrace.push("#0 (frob 1)".to_string());
        assert_eq!(
            fatal.to_string(),
            "FATAL -- unbound variable: frob\n#0 (frob 1)"
        );
    }

    #[test]
    fn type_error_wording() {
        assert_eq!(
            Error::type_err("pair", "fixnum").to_string(),
            "type error: expected pair, found fixnum"
        );
    }
}
