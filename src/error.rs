//! Error related data structures.
//!
//! Re-exports the shared [`Error`] taxonomy so callers can write
//! `oxidegba::error::Error` without reaching into the `common` crate
//! directly.

pub use oxidegba_common::error::Error;
