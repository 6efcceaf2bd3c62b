#![allow(clippy::uninlined_format_args)]

//! Shared primitives used across the core crates: the error taxonomy,
//! small host-facing utilities, and little-endian state (de)serialization
//! helpers used by the save state format.

pub mod data;
pub mod error;
pub mod util;
