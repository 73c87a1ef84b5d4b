// Sable, a compact Scheme runtime core.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// Sable is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/runtime/env.rs

// Heap-resident hash dictionaries and the lexical environments built
// on them. A dictionary is a power-of-two vector of bucket chains;
// each chain link is a pair whose head is a `(key . value)` binding.
// An environment is one dictionary plus a link to its enclosing
// environment.

// <>

use log::trace;

use super::error::{Error, Result};
use super::memmgt::Heap;
use super::object::{Object, Value};
use super::stack::Frame;
use super::Runtime;

/// Dictionaries never have fewer buckets than this
pub const MIN_BUCKETS: usize = 8;

/// Bucket count a dictionary with `count` entries should settle at,
/// starting from `buckets`
fn settled_buckets(count: usize, mut buckets: usize) -> usize {
    while count * 2 > buckets * 3 {
        buckets *= 2;
    }
    while buckets > MIN_BUCKETS && count * 10 <= buckets * 3 {
        buckets /= 2;
    }
    buckets
}

impl Heap {
    /// Binding pair for `key`, if present
    pub fn dict_find(&self, dict: Value, key: Value) -> Result<Option<Value>> {
        let (buckets, _, mask) = self.dict_parts(dict)?;
        let hash = self.generic_hash(key)?;
        let mut chain = self.vector_ref(buckets, hash & mask)?;

        while chain != Value::Nil {
            let binding = self.car(chain)?;
            if self.equivalent(self.car(binding)?, key)? {
                return Ok(Some(binding));
            }
            chain = self.cdr(chain)?;
        }
        Ok(None)
    }

    #[cfg(test)]
    pub fn dict_get(&self, dict: Value, key: Value) -> Result<Option<Value>> {
        match self.dict_find(dict, key)? {
            Some(binding) => self.cdr(binding).map(Some),
            None => Ok(None),
        }
    }

    pub fn dict_len(&self, dict: Value) -> Result<usize> {
        Ok(self.dict_parts(dict)?.1)
    }

    pub fn dict_buckets(&self, dict: Value) -> Result<usize> {
        Ok(self.dict_parts(dict)?.2 + 1)
    }

    /// Binding for `sym` in `env` or the nearest enclosing environment
    pub fn env_find(&self, mut env: Value, sym: Value) -> Result<Option<Value>> {
        while env != Value::Nil {
            let (dict, outer) = self.env_parts(env)?;
            if let Some(binding) = self.dict_find(dict, sym)? {
                return Ok(Some(binding));
            }
            env = outer;
        }
        Ok(None)
    }

    pub fn env_lookup(&self, env: Value, sym: Value) -> Result<Option<Value>> {
        match self.env_find(env, sym)? {
            Some(binding) => self.cdr(binding).map(Some),
            None => Ok(None),
        }
    }

    /// Rebinds an existing variable wherever it is found
    pub fn env_set(&mut self, env: Value, sym: Value, val: Value) -> Result<()> {
        match self.env_find(env, sym)? {
            Some(binding) => self.set_cdr(binding, val),
            None => Err(Error::UnboundVariable(self.display(sym))),
        }
    }
}

impl Runtime {
    pub fn make_dict(&mut self, frame: Frame, buckets: usize) -> Result<Value> {
        let n = buckets.max(MIN_BUCKETS).next_power_of_two();
        let vec = self.make_vector(frame, n, Value::Nil)?;
        self.alloc(
            frame,
            Object::Dictionary {
                buckets: vec,
                count: 0,
                mask: n - 1,
            },
        )
        .map(Value::Obj)
    }

    /// Binds `key` to `val`, replacing any existing binding, and returns
    /// the binding pair
    pub fn dict_insert(&mut self, frame: Frame, dict: Value, key: Value, val: Value) -> Result<Value> {
        if let Some(binding) = self.heap.dict_find(dict, key)? {
            self.heap.set_cdr(binding, val)?;
            return Ok(binding);
        }

        let frame = self.stack.push_roots(frame, &[dict])?;
        let binding = self.cons(frame, key, val)?;
        let frame = self.stack.push_roots(frame, &[binding])?;

        let (buckets, count, mask) = self.heap.dict_parts(dict)?;
        let idx = self.heap.generic_hash(key)? & mask;
        let chain = self.heap.vector_ref(buckets, idx)?;
        let link = self.cons(frame, binding, chain)?;
        self.heap.vector_set(buckets, idx, link)?;
        self.heap.dict_update(dict, None, count + 1, mask)?;

        self.dict_rehash(frame, dict)?;
        Ok(binding)
    }

    /// Removes the binding for `key`; true if there was one
    pub fn dict_delete(&mut self, frame: Frame, dict: Value, key: Value) -> Result<bool> {
        let (buckets, count, mask) = self.heap.dict_parts(dict)?;
        let idx = self.heap.generic_hash(key)? & mask;

        let mut prev = Value::Nil;
        let mut chain = self.heap.vector_ref(buckets, idx)?;
        while chain != Value::Nil {
            let next = self.heap.cdr(chain)?;
            let binding = self.heap.car(chain)?;
            if self.heap.equivalent(self.heap.car(binding)?, key)? {
                if prev == Value::Nil {
                    self.heap.vector_set(buckets, idx, next)?;
                } else {
                    self.heap.set_cdr(prev, next)?;
                }
                self.heap.dict_update(dict, None, count - 1, mask)?;
                self.dict_rehash(frame, dict)?;
                return Ok(true);
            }
            prev = chain;
            chain = next;
        }
        Ok(false)
    }

    /// Resizes the bucket vector if the load factor left its band.
    /// Chain links are moved into the new vector, not copied.
    fn dict_rehash(&mut self, frame: Frame, dict: Value) -> Result<()> {
        let (buckets, count, mask) = self.heap.dict_parts(dict)?;
        let n = mask + 1;
        let target = settled_buckets(count, n);
        if target == n {
            return Ok(());
        }

        trace!("rehash dictionary: {} -> {} buckets ({} entries)", n, target, count);

        let frame = self.stack.push_roots(frame, &[dict])?;
        let fresh = self.make_vector(frame, target, Value::Nil)?;
        let new_mask = target - 1;

        for i in 0..n {
            let mut chain = self.heap.vector_ref(buckets, i)?;
            while chain != Value::Nil {
                let next = self.heap.cdr(chain)?;
                let key = self.heap.car(self.heap.car(chain)?)?;
                let j = self.heap.generic_hash(key)? & new_mask;
                let head = self.heap.vector_ref(fresh, j)?;
                self.heap.set_cdr(chain, head)?;
                self.heap.vector_set(fresh, j, chain)?;
                chain = next;
            }
        }

        self.heap.dict_update(dict, Some(fresh), count, new_mask)
    }

    pub fn make_env(&mut self, frame: Frame, outer: Value) -> Result<Value> {
        let frame = self.stack.push_roots(frame, &[outer])?;
        let dict = self.make_dict(frame, MIN_BUCKETS)?;
        self.alloc(frame, Object::Environment { dict, outer })
            .map(Value::Obj)
    }

    /// Binds in the innermost environment, shadowing anything outside
    pub fn env_define(&mut self, frame: Frame, env: Value, sym: Value, val: Value) -> Result<()> {
        let (dict, _) = self.heap.env_parts(env)?;
        self.dict_insert(frame, dict, sym, val).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::stack::Extend;

    fn band_holds(rt: &Runtime, dict: Value) {
        let n = rt.heap.dict_len(dict).unwrap();
        let b = rt.heap.dict_buckets(dict).unwrap();
        assert!(b.is_power_of_two());
        assert!(b >= MIN_BUCKETS);
        assert!(n * 2 <= b * 3, "{} entries over {} buckets", n, b);
        assert!(b == MIN_BUCKETS || n * 10 > b * 3, "{} entries under {} buckets", n, b);
    }

    #[test]
    fn settling() {
        assert_eq!(settled_buckets(0, 8), 8);
        assert_eq!(settled_buckets(12, 8), 8);
        assert_eq!(settled_buckets(13, 8), 16);
        assert_eq!(settled_buckets(4, 16), 8);
        assert_eq!(settled_buckets(5, 16), 16);
    }

    #[test]
    fn insert_lookup_delete() {
        let mut rt = Runtime::new();
        let top = rt.toplevel();
        let frame = rt.extend(top, 1, Extend::CLEAR | Extend::SAVE_LINK).unwrap();
        let dict = rt.make_dict(frame, 8).unwrap();
        rt.stack.set(frame, 0, dict);
        let top = frame;

        let mut keys = Vec::new();
        for i in 0..100 {
            let k = rt.fixnum(top, i).unwrap();
            let v = rt.fixnum(top, i * 10).unwrap();
            rt.dict_insert(top, dict, k, v).unwrap();
            keys.push(k);
            band_holds(&rt, dict);
        }
        assert_eq!(rt.heap.dict_len(dict).unwrap(), 100);

        // keys match by value, not identity
        let key = rt.fixnum(top, 42).unwrap();
        let found = rt.heap.dict_get(dict, key).unwrap().unwrap();
        assert_eq!(rt.heap.fixnum(found).unwrap(), 420);

        // replacing keeps the count
        let v = rt.fixnum(top, -1).unwrap();
        rt.dict_insert(top, dict, key, v).unwrap();
        assert_eq!(rt.heap.dict_len(dict).unwrap(), 100);

        for k in &keys {
            assert!(rt.dict_delete(top, dict, *k).unwrap());
            band_holds(&rt, dict);
        }
        assert_eq!(rt.heap.dict_len(dict).unwrap(), 0);
        assert_eq!(rt.heap.dict_buckets(dict).unwrap(), MIN_BUCKETS);
        assert!(!rt.dict_delete(top, dict, keys[0]).unwrap());
    }

    #[test]
    fn shadowing_and_set() {
        let mut rt = Runtime::new();
        let top = rt.toplevel();
        let outer = rt.stack.env(top);
        let x = rt.intern(top, "x").unwrap();
        let one = rt.fixnum(top, 1).unwrap();
        let two = rt.fixnum(top, 2).unwrap();

        rt.env_define(top, outer, x, one).unwrap();
        let inner = rt.make_env(top, outer).unwrap();
        rt.env_define(top, inner, x, two).unwrap();

        assert_eq!(rt.heap.env_lookup(inner, x).unwrap(), Some(two));
        assert_eq!(rt.heap.env_lookup(outer, x).unwrap(), Some(one));

        // rebinding through the inner environment leaves the outer one alone
        let three = rt.fixnum(top, 3).unwrap();
        rt.heap.env_set(inner, x, three).unwrap();
        assert_eq!(rt.heap.env_lookup(outer, x).unwrap(), Some(one));

        let y = rt.intern(top, "never-defined").unwrap();
        assert_eq!(
            rt.heap.env_set(inner, y, three),
            Err(Error::UnboundVariable("never-defined".to_string()))
        );
    }

    #[test]
    fn redefine_does_not_duplicate() {
        let mut rt = Runtime::new();
        let top = rt.toplevel();
        let env = rt.make_env(top, Value::Nil).unwrap();
        let (dict, _) = rt.heap.env_parts(env).unwrap();
        let k = rt.intern(top, "k").unwrap();

        rt.env_define(top, env, k, Value::Bool(true)).unwrap();
        rt.env_define(top, env, k, Value::Bool(false)).unwrap();
        assert_eq!(rt.heap.dict_len(dict).unwrap(), 1);
        assert_eq!(rt.heap.env_lookup(env, k).unwrap(), Some(Value::Bool(false)));
    }
}
