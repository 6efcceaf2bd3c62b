//! Save state format.
//!
//! The previous approach here laid the whole machine out as a
//! `#[repr(packed)]` struct (see `BeesCore` in version control history)
//! and wrote it with a single `memcpy`. That breaks the moment any
//! field stops being a fixed-size plain-old-data value, and it ties
//! the on-disk layout to whatever the compiler happens to do with
//! struct padding. Instead every component serializes itself field by
//! field through [`StateComponent`], and the top-level envelope fences
//! the whole blob behind a magic number and a version so a loader can
//! refuse a save it does not understand instead of misreading it.

use std::io::Cursor;

use oxidegba_common::data::{read_bytes, read_u16, read_u32, read_u64, read_u8};
use oxidegba_common::error::Error;

/// `"EMER"` read as a big-endian u32, matching the literal value named
/// in the save-state format.
pub const MAGIC: u32 = 0x454d_4552;
pub const VERSION: u32 = 1;

/// A value that can serialize itself into a save-state buffer and
/// reconstruct itself from one. Implemented by every piece of state
/// that survives a save/load round trip (CPU registers, peripheral
/// registers, RAM contents); the cartridge's ROM bytes are the
/// conspicuous exception; per the format, they are never written out.
pub trait StateComponent {
    fn save(&self, buffer: &mut Vec<u8>);
    fn load(&mut self, cursor: &mut Cursor<&[u8]>) -> Result<(), Error>;
}

impl StateComponent for u8 {
    fn save(&self, buffer: &mut Vec<u8>) {
        buffer.push(*self);
    }
    fn load(&mut self, cursor: &mut Cursor<&[u8]>) -> Result<(), Error> {
        *self = read_u8(cursor)?;
        Ok(())
    }
}

impl StateComponent for u16 {
    fn save(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.to_le_bytes());
    }
    fn load(&mut self, cursor: &mut Cursor<&[u8]>) -> Result<(), Error> {
        *self = read_u16(cursor)?;
        Ok(())
    }
}

impl StateComponent for u32 {
    fn save(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.to_le_bytes());
    }
    fn load(&mut self, cursor: &mut Cursor<&[u8]>) -> Result<(), Error> {
        *self = read_u32(cursor)?;
        Ok(())
    }
}

impl StateComponent for u64 {
    fn save(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.to_le_bytes());
    }
    fn load(&mut self, cursor: &mut Cursor<&[u8]>) -> Result<(), Error> {
        *self = read_u64(cursor)?;
        Ok(())
    }
}

impl StateComponent for bool {
    fn save(&self, buffer: &mut Vec<u8>) {
        buffer.push(*self as u8);
    }
    fn load(&mut self, cursor: &mut Cursor<&[u8]>) -> Result<(), Error> {
        *self = read_u8(cursor)? != 0;
        Ok(())
    }
}

impl StateComponent for Vec<u8> {
    fn save(&self, buffer: &mut Vec<u8>) {
        (self.len() as u32).save(buffer);
        buffer.extend_from_slice(self);
    }
    fn load(&mut self, cursor: &mut Cursor<&[u8]>) -> Result<(), Error> {
        let len = read_u32(cursor)? as usize;
        *self = read_bytes(cursor, len)?;
        Ok(())
    }
}

/// Writes the fixed-size [`MAGIC`]/[`VERSION`]/game-code header that
/// every save state opens with.
pub fn write_header(buffer: &mut Vec<u8>, game_code: &[u8; 4]) {
    MAGIC.save(buffer);
    VERSION.save(buffer);
    buffer.extend_from_slice(game_code);
}

/// Validates the header and returns a cursor positioned just past it,
/// ready for the caller to read the frame count and component state
/// that follow. `expected_game_code` is the currently attached
/// cartridge's code; a mismatch means the save belongs to a different
/// ROM and must be rejected rather than silently misapplied.
pub fn read_header<'a>(
    data: &'a [u8],
    expected_game_code: &[u8; 4],
) -> Result<Cursor<&'a [u8]>, Error> {
    let mut cursor = Cursor::new(data);
    let magic = read_u32(&mut cursor)?;
    if magic != MAGIC {
        return Err(Error::SaveStateMagicMismatch);
    }
    let version = read_u32(&mut cursor)?;
    if version != VERSION {
        return Err(Error::SaveStateVersionMismatch);
    }
    let game_code = read_bytes(&mut cursor, 4)?;
    if game_code.as_slice() != expected_game_code {
        return Err(Error::SaveStateRomMismatch);
    }
    Ok(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut buffer = Vec::new();
        write_header(&mut buffer, b"BPEE");
        42u64.save(&mut buffer);

        let mut cursor = read_header(&buffer, b"BPEE").expect("valid header");
        let mut frame_count = 0u64;
        frame_count.load(&mut cursor).unwrap();
        assert_eq!(frame_count, 42);
    }

    #[test]
    fn test_rejects_wrong_magic() {
        let buffer = vec![0u8; 16];
        assert_eq!(
            read_header(&buffer, b"BPEE").unwrap_err(),
            Error::SaveStateMagicMismatch
        );
    }

    #[test]
    fn test_rejects_rom_mismatch() {
        let mut buffer = Vec::new();
        write_header(&mut buffer, b"BPEE");
        assert_eq!(
            read_header(&buffer, b"AGBE").unwrap_err(),
            Error::SaveStateRomMismatch
        );
    }
}
