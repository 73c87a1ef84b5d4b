// Sable, a compact Scheme runtime core.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// Sable is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/runtime/memmgt.rs

// Memory management. Records live in an index-stable arena and are
// threaded on a single heap list; a mark-sweep collector reclaims
// whatever the frame stack cannot reach. Handles carry a generation
// so a handle to a reclaimed record is detected instead of aliasing
// whatever reuses its cell.

// <>

use std::fmt;

use log::{debug, trace};

use super::error::{Error, Result};
use super::object::{Object, Value};
use super::stack::Frame;
use super::Runtime;

/// Handle to a heap record
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gc {
    idx: u32,
    gen: u32,
}

impl Gc {
    #[inline(always)]
    pub fn index(self) -> u32 {
        self.idx
    }
}

impl fmt::Debug for Gc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gc({}@{})", self.idx, self.gen)
    }
}

struct Record {
    /// Next record on the heap list
    next: Option<u32>,
    marked: bool,
    size: usize,
    obj: Object,
}

struct Cell {
    gen: u32,
    rec: Option<Record>,
}

/// Outcome of an allocation attempt
pub enum Alloc {
    Done(Gc),
    /// Over budget; the object comes back so the caller can collect
    /// and retry
    NeedsCollection(Object),
}

/// Snapshot of heap accounting
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub live_bytes: usize,
    pub threshold: usize,
    pub population: usize,
    pub collections: usize,
    pub last_freed: usize,
}

pub struct Heap {
    cells: Vec<Cell>,
    free: Vec<u32>,
    /// Most recently allocated record
    head: Option<u32>,
    live_bytes: usize,
    threshold: usize,
    min_heap: usize,
    population: usize,
    collections: usize,
    last_freed: usize,
    enabled: bool,
    stress: bool,
}

impl Heap {
    pub fn new(min_heap: usize, stress: bool) -> Self {
        Heap {
            cells: Vec::new(),
            free: Vec::new(),
            head: None,
            live_bytes: 0,
            threshold: min_heap,
            min_heap,
            population: 0,
            collections: 0,
            last_freed: 0,
            enabled: true,
            stress,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Collection is off while the runtime builds its base environment
    pub fn set_enabled(&mut self, on: bool) {
        self.enabled = on;
    }

    /// True when live data has outgrown the threshold, which happens
    /// only while collection was off
    pub fn want_collect(&self) -> bool {
        self.enabled && self.live_bytes > self.threshold
    }

    /// True when `size` more bytes would not fit under the threshold
    pub fn over_budget(&self, size: usize) -> bool {
        self.enabled && self.live_bytes.saturating_add(size) > self.threshold
    }

    pub fn allocate(&mut self, obj: Object) -> Alloc {
        let size = obj.footprint();
        if self.enabled && (self.stress || self.live_bytes + size > self.threshold) {
            return Alloc::NeedsCollection(obj);
        }
        Alloc::Done(self.place(obj, size))
    }

    /// Second attempt after a collection; stress mode no longer applies
    pub fn allocate_collected(&mut self, obj: Object) -> Alloc {
        let size = obj.footprint();
        if self.enabled && self.live_bytes + size > self.threshold {
            return Alloc::NeedsCollection(obj);
        }
        Alloc::Done(self.place(obj, size))
    }

    fn place(&mut self, obj: Object, size: usize) -> Gc {
        let rec = Record {
            next: self.head,
            marked: false,
            size,
            obj,
        };

        let idx = match self.free.pop() {
            Some(idx) => {
                self.cells[idx as usize].rec = Some(rec);
                idx
            }
            None => {
                self.cells.push(Cell {
                    gen: 0,
                    rec: Some(rec),
                });
                (self.cells.len() - 1) as u32
            }
        };

        self.head = Some(idx);
        self.live_bytes += size;
        self.population += 1;

        if cfg!(feature = "memdbg") {
            trace!("alloc #{} ({} bytes, {} live)", idx, size, self.live_bytes);
        }

        Gc {
            idx,
            gen: self.cells[idx as usize].gen,
        }
    }

    #[inline]
    fn record(&self, gc: Gc) -> Option<&Record> {
        match self.cells.get(gc.idx as usize) {
            Some(cell) if cell.gen == gc.gen => cell.rec.as_ref(),
            _ => None,
        }
    }

    #[inline]
    pub fn get(&self, gc: Gc) -> Result<&Object> {
        self.record(gc)
            .map(|rec| &rec.obj)
            .ok_or_else(reclaimed)
    }

    #[inline]
    pub fn get_mut(&mut self, gc: Gc) -> Result<&mut Object> {
        match self.cells.get_mut(gc.idx as usize) {
            Some(cell) if cell.gen == gc.gen => {
                cell.rec.as_mut().map(|rec| &mut rec.obj).ok_or_else(reclaimed)
            }
            _ => Err(reclaimed()),
        }
    }

    #[cfg(test)]
    pub fn contains(&self, v: Value) -> bool {
        match v {
            Value::Obj(gc) => self.record(gc).is_some(),
            _ => true,
        }
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_bytes: self.live_bytes,
            threshold: self.threshold,
            population: self.population,
            collections: self.collections,
            last_freed: self.last_freed,
        }
    }

    /// Marks everything reachable from `roots`, sweeps the rest, and
    /// returns the number of bytes freed
    pub fn collect<I: IntoIterator<Item = Value>>(&mut self, roots: I) -> usize {
        let before = self.live_bytes;
        let mut pending = Vec::new();
        let mut marked = 0;
        for root in roots {
            if let Some(gc) = root.handle() {
                pending.push(gc);
                marked += self.mark(&mut pending);
            }
        }

        let freed = self.sweep();
        self.threshold = self.min_heap.max(self.live_bytes + self.live_bytes / 2);
        self.collections += 1;
        self.last_freed = freed;

        if cfg!(feature = "memdbg") {
            trace!(
                "collection {}: {} bytes before, {} after, {} records remain",
                self.collections,
                before,
                self.live_bytes,
                self.population
            );
        }

        debug!(
            "collection {}: marked {}, freed {} bytes, {} live, next at {}",
            self.collections, marked, freed, self.live_bytes, self.threshold
        );

        freed
    }

    /// Drains the worklist. The last child of each object is followed
    /// in place and the others are queued, so long lists never grow
    /// the worklist or the native stack.
    fn mark(&mut self, pending: &mut Vec<Gc>) -> usize {
        let mut count = 0;
        while let Some(gc) = pending.pop() {
            let mut next = Some(gc);
            while let Some(gc) = next.take() {
                let rec = match self.cells.get_mut(gc.idx as usize) {
                    Some(cell) if cell.gen == gc.gen => match cell.rec.as_mut() {
                        Some(rec) => rec,
                        None => break,
                    },
                    _ => break,
                };
                if rec.marked {
                    break;
                }
                rec.marked = true;
                count += 1;
                next = visit(&rec.obj, pending);
            }
        }
        count
    }

    fn sweep(&mut self) -> usize {
        let mut freed = 0;
        let mut prev: Option<u32> = None;
        let mut cur = self.head;

        while let Some(idx) = cur {
            let cell = &mut self.cells[idx as usize];
            let Some(rec) = cell.rec.as_mut() else {
                break;
            };
            let next = rec.next;

            if rec.marked {
                rec.marked = false;
                prev = Some(idx);
            } else {
                freed += rec.size;
                if cfg!(feature = "memdbg") {
                    trace!("free #{} ({:?})", idx, rec.obj.tag());
                }
                cell.rec = None;
                cell.gen = cell.gen.wrapping_add(1);
                self.free.push(idx);
                self.population -= 1;

                match prev {
                    None => self.head = next,
                    Some(p) => {
                        if let Some(prec) = self.cells[p as usize].rec.as_mut() {
                            prec.next = next;
                        }
                    }
                }
            }

            cur = next;
        }

        self.live_bytes -= freed;
        freed
    }
}

fn reclaimed() -> Error {
    Error::type_err("live object", "reclaimed object")
}

/// Per-variant reference visitor. Queues all references but one and
/// returns that one for the marker to follow directly.
fn visit(obj: &Object, pending: &mut Vec<Gc>) -> Option<Gc> {
    match obj {
        Object::Pair(first, rest) => {
            pending.extend(first.handle());
            rest.handle()
        }
        Object::Closure { env, formals, body } => {
            pending.extend(env.handle());
            pending.extend(formals.handle());
            body.handle()
        }
        Object::Environment { dict, outer } => {
            pending.extend(dict.handle());
            outer.handle()
        }
        Object::Dictionary { buckets, .. } => buckets.handle(),
        Object::Vector(items) => {
            pending.extend(items.iter().filter_map(|v| v.handle()));
            None
        }
        Object::Macro { rule } => rule.handle(),
        Object::Escape { aux, .. } => aux.handle(),
        Object::Symbol { .. }
        | Object::Str(_)
        | Object::Fixnum(_)
        | Object::Flonum(_)
        | Object::Procedure { .. }
        | Object::SpecialForm { .. } => None,
    }
}

impl Runtime {
    /// Allocates `obj`, collecting first if the heap is over budget.
    ///
    /// `frame` must be the innermost live frame. The object's own
    /// references are rooted just below it for the duration of any
    /// collection.
    pub fn alloc(&mut self, frame: Frame, obj: Object) -> Result<Gc> {
        let obj = match self.heap.allocate(obj) {
            Alloc::Done(gc) => return Ok(gc),
            Alloc::NeedsCollection(obj) => obj,
        };

        let scan = self.stack.push_roots(frame, &obj.references())?;
        self.collect_from(scan);

        match self.heap.allocate_collected(obj) {
            Alloc::Done(gc) => Ok(gc),
            Alloc::NeedsCollection(obj) => Err(Error::OutOfMemory {
                requested: obj.footprint(),
                live: self.heap.stats().live_bytes,
            }),
        }
    }

    /// Makes room for `size` bytes, collecting once if needed, without
    /// building the object first
    pub fn reserve(&mut self, frame: Frame, size: usize) -> Result<()> {
        if !self.heap.over_budget(size) {
            return Ok(());
        }
        self.collect_from(frame);
        if self.heap.over_budget(size) {
            return Err(Error::OutOfMemory {
                requested: size,
                live: self.heap.stats().live_bytes,
            });
        }
        Ok(())
    }

    /// Collects with every value rooted at or above `frame` kept alive
    pub fn collect_from(&mut self, frame: Frame) -> usize {
        if !self.heap.enabled() {
            debug!("collection requested while disabled");
            return 0;
        }
        self.heap.collect(self.stack.roots(frame))
    }

    /// Collects from the base frame; only the pinned roots and the
    /// toplevel environment survive
    pub fn collect(&mut self) -> usize {
        let base = self.toplevel();
        self.collect_from(base)
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }
}
