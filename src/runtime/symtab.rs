// Sable, a compact Scheme runtime core.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// Sable is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/runtime/symtab.rs

// The symbol interner: one dictionary, pinned in the base of the
// frame stack, mapping symbol text to the unique symbol object for
// that text.

// <>

use super::error::Result;
use super::memmgt::Heap;
use super::object::{str_hash, Object, Value};
use super::stack::Frame;
use super::Runtime;

impl Heap {
    /// Finds an interned symbol by text, comparing cached hashes first
    fn symtab_find(&self, table: Value, name: &str, hash: u32) -> Result<Option<Value>> {
        let (buckets, _, mask) = self.dict_parts(table)?;
        let mut chain = self.vector_ref(buckets, hash as usize & mask)?;

        while chain != Value::Nil {
            let sym = self.car(self.car(chain)?)?;
            if let Some(Object::Symbol { text, hash: h }) = self.deref(sym)? {
                if *h == hash && &**text == name {
                    return Ok(Some(sym));
                }
            }
            chain = self.cdr(chain)?;
        }
        Ok(None)
    }
}

impl Runtime {
    /// The unique symbol spelled `name`
    pub fn intern(&mut self, frame: Frame, name: &str) -> Result<Value> {
        let hash = str_hash(name.as_bytes());
        if let Some(sym) = self.heap.symtab_find(self.symtab, name, hash)? {
            return Ok(sym);
        }

        let sym = Value::Obj(self.alloc(
            frame,
            Object::Symbol {
                text: name.into(),
                hash,
            },
        )?);
        let table = self.symtab;
        self.dict_insert(frame, table, sym, Value::Unspecified)?;
        Ok(sym)
    }

    pub fn symbol_count(&self) -> usize {
        self.heap.dict_len(self.symtab).unwrap_or(0)
    }
}
