use oxidegba_common::error::Error;

/// Common shape for the BIOS decompression routines.
///
/// Both LZ77 and run-length formats share the same eight-byte header
/// layout (a one-byte type tag, a 24-bit uncompressed size), so a
/// single trait lets the HLE SWI dispatcher treat them uniformly.
pub trait Codec {
    type EncodeOptions;
    type DecodeOptions;

    fn encode(data: &[u8], options: &Self::EncodeOptions) -> Result<Vec<u8>, Error>;
    fn decode(data: &[u8], options: &Self::DecodeOptions) -> Result<Vec<u8>, Error>;
}
