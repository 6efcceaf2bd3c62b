//! Assorted utility functions and structures.
//!
//! Re-exports the shared helpers so callers can write
//! `oxidegba::util::SharedMut` without reaching into the `common`
//! crate directly.

pub use oxidegba_common::util::{copy_fast, read_file, timestamp, write_file, SharedMut, SharedThread};
