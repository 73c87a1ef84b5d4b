// Sable, a compact Scheme runtime core.

// SPDX-FileCopyrightText: © 2024 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// Sable is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/lib.rs

// Library root. Everything lives in the runtime module; the most
// common entry points are re-exported here.

// <>

pub mod runtime;

pub use runtime::{Config, Error, Fatal, Runtime, Value};
