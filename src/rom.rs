//! Cartridge (ROM + SRAM/flash) related functions and structures.

use std::fmt::{self, Display, Formatter};

use oxidegba_common::error::Error;

use crate::consts::{ROM_MAX_SIZE, SRAM_SIZE};
use crate::warnln;

const HEADER_TITLE_START: usize = 0xa0;
const HEADER_TITLE_END: usize = 0xac;
const HEADER_CODE_END: usize = 0xb0;
const HEADER_CHECKSUM_ADDR: usize = 0xbd;

const FLASH_MANUFACTURER_ID: u8 = 0xc2;
const FLASH_DEVICE_ID: u8 = 0x09;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlashState {
    Ready,
    Unlock0,
    Unlock1,
    ByteProgram,
    Id,
    ErasePrefix,
    EraseUnlock0,
    EraseUnlock1,
}

/// A loaded GBA cartridge: the ROM image (read-only to the CPU except
/// for the GPIO window, handled a layer up by [`crate::bus::Bus`]) and
/// a 128 KiB flash chip modeled after the Macronix MX29L1011 command
/// set used by most commercial carts with battery-backed saves.
pub struct Cartridge {
    data: Vec<u8>,
    sram: Vec<u8>,
    flash_state: FlashState,
}

impl Cartridge {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            sram: vec![0xff; SRAM_SIZE as usize],
            flash_state: FlashState::Ready,
        }
    }

    /// Loads a ROM image, validating its size and header checksum.
    /// A checksum mismatch is still surfaced as [`Error::RomInvalid`]
    /// here since ROM loading is the top-level API boundary where
    /// errors are allowed to propagate; the caller may choose to run
    /// the ROM anyway by ignoring the error and retrying with a patched
    /// image.
    pub fn load(data: Vec<u8>) -> Result<Self, Error> {
        if data.is_empty() || data.len() as u32 > ROM_MAX_SIZE {
            return Err(Error::RomInvalid);
        }
        let cartridge = Self {
            data,
            sram: vec![0xff; SRAM_SIZE as usize],
            flash_state: FlashState::Ready,
        };
        cartridge.validate_header()?;
        Ok(cartridge)
    }

    fn validate_header(&self) -> Result<(), Error> {
        if self.data.len() <= HEADER_CHECKSUM_ADDR {
            return Err(Error::RomInvalid);
        }
        let mut sum: i32 = 0;
        for &byte in &self.data[HEADER_TITLE_START..=0xbc] {
            sum = sum.wrapping_sub(byte as i32);
        }
        let expected = sum.wrapping_sub(0x19) as u8;
        let actual = self.data[HEADER_CHECKSUM_ADDR];
        if expected != actual {
            warnln!(
                "ROM header checksum mismatch: expected 0x{:02x}, got 0x{:02x}",
                expected,
                actual
            );
            return Err(Error::RomInvalid);
        }
        Ok(())
    }

    pub fn title(&self) -> String {
        let bytes = &self.data[HEADER_TITLE_START..HEADER_TITLE_END.min(self.data.len())];
        String::from_utf8_lossy(bytes)
            .trim_end_matches('\0')
            .to_string()
    }

    /// The four ASCII bytes (e.g. `"BPEE"`) a save state reattaches
    /// against, per the save-state rule that the ROM itself is not
    /// serialized.
    pub fn game_code(&self) -> [u8; 4] {
        let mut code = [0u8; 4];
        let end = HEADER_CODE_END.min(self.data.len());
        let start = HEADER_TITLE_END.min(end);
        code[..end - start].copy_from_slice(&self.data[start..end]);
        code
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sram(&self) -> &[u8] {
        &self.sram
    }

    pub fn set_sram(&mut self, data: Vec<u8>) {
        self.sram = data;
        self.sram.resize(SRAM_SIZE as usize, 0xff);
    }

    /// ROM is addressed through a 32 MiB window mirrored across
    /// regions `0x8`-`0xd`; offsets past the actual image length read
    /// as open bus zero.
    pub fn read(&self, addr: u32) -> u8 {
        let offset = (addr & (ROM_MAX_SIZE - 1)) as usize;
        self.data.get(offset).copied().unwrap_or(0x00)
    }

    /// ROM is read-only to the CPU outside the GPIO window, which the
    /// bus routes elsewhere before reaching the cartridge.
    pub fn write(&mut self, _addr: u32, _value: u8) {}

    pub fn read_sram(&self, addr: u32) -> u8 {
        let offset = (addr & (SRAM_SIZE - 1)) as usize;
        if self.flash_state == FlashState::Id {
            match offset {
                0 => return FLASH_MANUFACTURER_ID,
                1 => return FLASH_DEVICE_ID,
                _ => {}
            }
        }
        self.sram[offset]
    }

    pub fn write_sram(&mut self, addr: u32, value: u8) {
        let offset = (addr & (SRAM_SIZE - 1)) as usize;
        self.flash_state = match self.flash_state {
            FlashState::Ready => {
                if offset == 0x5555 && value == 0xaa {
                    FlashState::Unlock0
                } else {
                    FlashState::Ready
                }
            }
            FlashState::Unlock0 => {
                if offset == 0x2aaa && value == 0x55 {
                    FlashState::Unlock1
                } else {
                    FlashState::Ready
                }
            }
            FlashState::Unlock1 => {
                if offset == 0x5555 {
                    match value {
                        0x90 => FlashState::Id,
                        0xf0 => FlashState::Ready,
                        0xa0 => FlashState::ByteProgram,
                        0x80 => FlashState::ErasePrefix,
                        _ => FlashState::Ready,
                    }
                } else {
                    FlashState::Ready
                }
            }
            FlashState::ByteProgram => {
                self.sram[offset] = value;
                FlashState::Ready
            }
            FlashState::Id => {
                if value == 0xf0 {
                    FlashState::Ready
                } else if offset == 0x5555 && value == 0xaa {
                    FlashState::Unlock0
                } else {
                    FlashState::Id
                }
            }
            FlashState::ErasePrefix => {
                if offset == 0x5555 && value == 0xaa {
                    FlashState::EraseUnlock0
                } else {
                    FlashState::Ready
                }
            }
            FlashState::EraseUnlock0 => {
                if offset == 0x2aaa && value == 0x55 {
                    FlashState::EraseUnlock1
                } else {
                    FlashState::Ready
                }
            }
            FlashState::EraseUnlock1 => {
                if offset == 0x5555 && value == 0x10 {
                    self.sram.iter_mut().for_each(|b| *b = 0xff);
                }
                FlashState::Ready
            }
        };
    }
}

impl Default for Cartridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Cartridge {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) [{} KiB]",
            self.title(),
            String::from_utf8_lossy(&self.game_code()),
            self.data.len() / 1024
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rom() -> Vec<u8> {
        let mut data = vec![0u8; 0x200];
        data[HEADER_TITLE_START..HEADER_TITLE_START + 6].copy_from_slice(b"OXIDEG");
        data[0xac..0xb0].copy_from_slice(b"OXGE");
        let mut sum: i32 = 0;
        for &byte in &data[HEADER_TITLE_START..=0xbc] {
            sum = sum.wrapping_sub(byte as i32);
        }
        data[HEADER_CHECKSUM_ADDR] = sum.wrapping_sub(0x19) as u8;
        data
    }

    #[test]
    fn test_load_accepts_valid_checksum() {
        let cartridge = Cartridge::load(sample_rom()).expect("valid header");
        assert_eq!(cartridge.game_code(), *b"OXGE");
    }

    #[test]
    fn test_load_rejects_bad_checksum() {
        let mut data = sample_rom();
        data[HEADER_CHECKSUM_ADDR] ^= 0xff;
        assert_eq!(Cartridge::load(data).unwrap_err(), Error::RomInvalid);
    }

    #[test]
    fn test_flash_id_sequence() {
        let mut cartridge = Cartridge::new();
        cartridge.write_sram(0x5555, 0xaa);
        cartridge.write_sram(0x2aaa, 0x55);
        cartridge.write_sram(0x5555, 0x90);
        assert_eq!(cartridge.read_sram(0x0000), FLASH_MANUFACTURER_ID);
        assert_eq!(cartridge.read_sram(0x0001), FLASH_DEVICE_ID);
        cartridge.write_sram(0x0000, 0xf0);
        assert_eq!(cartridge.read_sram(0x0000), 0xff);
    }

    #[test]
    fn test_flash_byte_program() {
        let mut cartridge = Cartridge::new();
        cartridge.write_sram(0x5555, 0xaa);
        cartridge.write_sram(0x2aaa, 0x55);
        cartridge.write_sram(0x5555, 0xa0);
        cartridge.write_sram(0x1234, 0x42);
        assert_eq!(cartridge.read_sram(0x1234), 0x42);
    }
}
