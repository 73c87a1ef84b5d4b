// Sable, a compact Scheme runtime core.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// Sable is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/runtime/stack.rs

// The root-scan stack. A fixed array of slots growing downward from
// its end; every live frame occupies a contiguous region holding its
// environment, a link to its parent frame, and its value slots. The
// collector treats every value slot between the innermost frame and
// the end of the array as a root.

// <>

use std::ops::BitOr;

use log::trace;

use super::error::{Error, Result};
use super::object::Value;
use super::Runtime;

/// Environment and parent link precede a frame's value slots
pub const META_SLOTS: usize = 2;

const ENV: usize = 0;
const LINK: usize = 1;

/// Position in the root-scan stack
///
/// Names the first slot of a frame. During argument preparation the
/// evaluator also uses it as a bare stack pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Frame(usize);

impl Frame {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Slot {
    Empty,
    Val(Value),
    /// Saved parent frame; never scanned as a value
    Link(Frame),
}

/// Frame extension flags
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extend(u8);

impl Extend {
    pub const NONE: Extend = Extend(0);
    /// Empty every slot of the new frame
    pub const CLEAR: Extend = Extend(1);
    /// Record the old frame as the new frame's parent
    pub const SAVE_LINK: Extend = Extend(2);
    /// Give the new frame a fresh environment nested in the old one's
    pub const NEW_ENV: Extend = Extend(4);
    /// Share the old frame's environment
    pub const SAME_ENV: Extend = Extend(8);

    #[inline(always)]
    pub fn has(self, flag: Extend) -> bool {
        self.0 & flag.0 == flag.0
    }
}

impl BitOr for Extend {
    type Output = Extend;

    fn bitor(self, rhs: Extend) -> Extend {
        Extend(self.0 | rhs.0)
    }
}

pub struct RootStack {
    slots: Box<[Slot]>,
    /// Lowest slot index any frame has reached
    low_water: usize,
}

impl RootStack {
    pub fn new(capacity: usize) -> Self {
        RootStack {
            slots: vec![Slot::Empty; capacity].into_boxed_slice(),
            low_water: capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Position just past the last slot; nothing is live at or below it
    /// until the first push
    pub fn end(&self) -> Frame {
        Frame(self.slots.len())
    }

    /// Deepest extent reached so far, in slots from the end
    pub fn peak_depth(&self) -> usize {
        self.slots.len() - self.low_water
    }

    #[inline]
    fn descend(&mut self, top: Frame, n: usize) -> Result<Frame> {
        let start = top
            .0
            .checked_sub(n)
            .ok_or(Error::StackOverflow(self.slots.len()))?;
        self.low_water = self.low_water.min(start);
        Ok(Frame(start))
    }

    /// Carves a frame with `n` value slots just below `old`. Only slot
    /// clearing happens here; environment handling that may allocate
    /// is in `Runtime::extend`.
    pub fn extend_raw(&mut self, old: Frame, n: usize, clear: bool) -> Result<Frame> {
        let frame = self.descend(old, n + META_SLOTS)?;
        if clear {
            self.slots[frame.0..old.0].fill(Slot::Empty);
        }
        if cfg!(feature = "stkdbg") {
            trace!(
                "extend {} -> {} ({} slots)",
                old.0,
                frame.0,
                self.slots.len() - frame.0
            );
        }
        Ok(frame)
    }

    /// Pushes one bare value below `top`
    pub fn push(&mut self, top: Frame, v: Value) -> Result<Frame> {
        let sp = self.descend(top, 1)?;
        self.slots[sp.0] = Slot::Val(v);
        Ok(sp)
    }

    /// Roots `vals` just below `frame` and returns the deeper position
    /// from which a scan covers both
    pub fn push_roots(&mut self, frame: Frame, vals: &[Value]) -> Result<Frame> {
        let sp = self.descend(frame, vals.len())?;
        for (slot, v) in self.slots[sp.0..frame.0].iter_mut().zip(vals) {
            *slot = Slot::Val(*v);
        }
        Ok(sp)
    }

    #[inline]
    fn value_at(&self, i: usize) -> Value {
        match self.slots.get(i) {
            Some(Slot::Val(v)) => *v,
            _ => Value::Nil,
        }
    }

    /// Bare positional read relative to a stack pointer
    #[inline]
    pub fn peek(&self, sp: Frame, i: usize) -> Value {
        self.value_at(sp.0 + i)
    }

    #[inline]
    pub fn poke(&mut self, sp: Frame, i: usize, v: Value) {
        self.slots[sp.0 + i] = Slot::Val(v);
    }

    pub fn env(&self, frame: Frame) -> Value {
        self.value_at(frame.0 + ENV)
    }

    pub fn set_env(&mut self, frame: Frame, env: Value) {
        self.slots[frame.0 + ENV] = Slot::Val(env);
    }

    pub fn link(&self, frame: Frame) -> Option<Frame> {
        match self.slots.get(frame.0 + LINK) {
            Some(Slot::Link(parent)) => Some(*parent),
            _ => None,
        }
    }

    pub fn set_link(&mut self, frame: Frame, parent: Frame) {
        self.slots[frame.0 + LINK] = Slot::Link(parent);
    }

    /// Value slot `i` of `frame`
    #[inline]
    pub fn get(&self, frame: Frame, i: usize) -> Value {
        self.value_at(frame.0 + META_SLOTS + i)
    }

    #[inline]
    pub fn set(&mut self, frame: Frame, i: usize, v: Value) {
        self.slots[frame.0 + META_SLOTS + i] = Slot::Val(v);
    }

    /// Argument count of an application frame, measured as the gap
    /// between its first value slot and the callable, which sits just
    /// below the frame's parent
    pub fn argc(&self, frame: Frame) -> usize {
        match self.link(frame) {
            Some(parent) => (parent.0 - 1).saturating_sub(frame.0 + META_SLOTS),
            None => 0,
        }
    }

    /// Argument `i` of an application frame, counted in call order.
    /// Arguments sit in the frame in reverse.
    pub fn arg(&self, frame: Frame, i: usize) -> Value {
        let argc = self.argc(frame);
        if i >= argc {
            return Value::Unspecified;
        }
        self.get(frame, argc - 1 - i)
    }

    /// Every value slot from `from` to the end of the stack; saved
    /// links and empty slots are skipped
    pub fn roots(&self, from: Frame) -> impl Iterator<Item = Value> + '_ {
        self.slots[from.0.min(self.slots.len())..]
            .iter()
            .filter_map(|slot| match slot {
                Slot::Val(v) => Some(*v),
                _ => None,
            })
    }

    /// Slots from `from` to the end, for backtraces
    pub(crate) fn slots_from(&self, from: Frame) -> &[Slot] {
        &self.slots[from.0.min(self.slots.len())..]
    }
}

impl Runtime {
    /// Carves a child frame of `old` with `n` value slots, handling its
    /// link and environment as `flags` direct
    pub fn extend(&mut self, old: Frame, n: usize, flags: Extend) -> Result<Frame> {
        let clear = flags.has(Extend::CLEAR) || flags.has(Extend::NEW_ENV);
        let frame = self.stack.extend_raw(old, n, clear)?;

        if cfg!(feature = "stkdbg") {
            trace!("frame @{} flags {:#06b}", frame.0, flags.0);
        }

        if flags.has(Extend::SAVE_LINK) {
            self.stack.set_link(frame, old);
        }

        if flags.has(Extend::NEW_ENV) {
            let outer = self.stack.env(old);
            let env = self.make_env(frame, outer)?;
            self.stack.set_env(frame, env);
        } else if flags.has(Extend::SAME_ENV) {
            let env = self.stack.env(old);
            self.stack.set_env(frame, env);
        }

        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn frames_grow_downward() {
        let mut stack = RootStack::new(64);
        let top = stack.end();
        let a = stack.extend_raw(top, 3, true).unwrap();
        assert_eq!(a.index(), 64 - 5);
        let b = stack.extend_raw(a, 0, true).unwrap();
        assert_eq!(b.index(), a.index() - 2);
        assert_eq!(stack.peak_depth(), 7);
    }

    #[test]
    fn overflow_is_reported() {
        let mut stack = RootStack::new(8);
        let top = stack.end();
        let a = stack.extend_raw(top, 4, true).unwrap();
        assert_eq!(
            stack.extend_raw(a, 1, true),
            Err(Error::StackOverflow(8))
        );
    }

    #[test]
    fn links_are_not_roots() {
        let mut stack = RootStack::new(16);
        let top = stack.end();
        let a = stack.extend_raw(top, 1, true).unwrap();
        stack.set_env(a, Value::Bool(true));
        let b = stack.extend_raw(a, 1, true).unwrap();
        stack.set_link(b, a);
        stack.set(b, 0, Value::Eof);

        let roots: Vec<Value> = stack.roots(b).collect();
        assert_eq!(roots, vec![Value::Eof, Value::Bool(true)]);
    }

    #[test]
    fn application_frame_arguments() {
        let mut stack = RootStack::new(32);
        let orig = stack.extend_raw(stack.end(), 1, true).unwrap();
        let mut sp = stack.push(orig, Value::Unspecified).unwrap();
        for v in [Value::Bool(true), Value::Bool(false), Value::Eof] {
            sp = stack.push(sp, v).unwrap();
        }
        let app = stack.extend_raw(sp, 0, true).unwrap();
        stack.set_link(app, orig);

        assert_eq!(stack.argc(app), 3);
        assert_eq!(stack.arg(app, 0), Value::Bool(true));
        assert_eq!(stack.arg(app, 2), Value::Eof);
        assert_eq!(stack.get(app, 0), Value::Eof);
    }

    #[test]
    fn extend_flags() {
        let mut rt = Runtime::new();
        let top = rt.toplevel();
        let env = rt.stack.env(top);

        let same = rt.extend(top, 1, Extend::SAVE_LINK | Extend::SAME_ENV).unwrap();
        assert_eq!(rt.stack.env(same), env);
        assert_eq!(rt.stack.link(same), Some(top));

        let fresh = rt.extend(same, 1, Extend::NEW_ENV).unwrap();
        let inner = rt.stack.env(fresh);
        assert_ne!(inner, env);
        assert_eq!(rt.heap.env_parts(inner).unwrap().1, env);
        assert_eq!(rt.stack.get(fresh, 0), Value::Nil);
        assert_eq!(rt.stack.link(fresh), None);
    }
}
