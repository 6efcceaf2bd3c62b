#![allow(clippy::uninlined_format_args)]

//! BIOS-compatible decompression codecs (`LZ77UnComp`, `RLUnComp`)
//! shared between the HLE SWI dispatcher and its tests.

pub mod codec;
pub mod lz77;
pub mod rle;
