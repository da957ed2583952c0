//! Utilities for memory-efficient data structures.
//!
//! This module provides low-level utilities used internally by the reactor.
//! In particular, it exposes a [`Slab`] allocator used as the indexed table
//! of in-flight operations.

mod slab;

pub(crate) use slab::Slab;
