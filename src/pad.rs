//! Keypad input: `KEYINPUT` (active-low button state) and `KEYCNT`
//! (the keypad IRQ selection/condition register).

use std::io::Cursor;

use oxidegba_common::error::Error;

use crate::bus::BusComponent;
use crate::consts::{KEYCNT_ADDR, KEYINPUT_ADDR};
use crate::interrupts::{IrqSource, Interrupts};
use crate::state::StateComponent;
use crate::warnln;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PadKey {
    A = 0,
    B = 1,
    Select = 2,
    Start = 3,
    Right = 4,
    Left = 5,
    Up = 6,
    Down = 7,
    L = 8,
    R = 9,
}

#[derive(Debug)]
pub struct Pad {
    /// Active-high internal state (bit set = key held), inverted on
    /// read since `KEYINPUT` reports 0 for a pressed key.
    keys: u16,
    keycnt: u16,
}

impl Default for Pad {
    fn default() -> Self {
        Self::new()
    }
}

impl Pad {
    pub fn new() -> Self {
        Self { keys: 0, keycnt: 0 }
    }

    pub fn reset(&mut self) {
        self.keys = 0;
        self.keycnt = 0;
    }

    pub fn key_press(&mut self, key: PadKey) {
        self.keys |= 1 << (key as u16);
    }

    pub fn key_lift(&mut self, key: PadKey) {
        self.keys &= !(1 << (key as u16));
    }

    /// Replaces the whole active-high key state at once from a 16-bit
    /// mask (bit i = 1 means pressed), the form host input arrives in
    /// once per frame rather than as individual press/lift calls.
    pub fn set_keys(&mut self, mask: u16) {
        self.keys = mask & 0x03ff;
    }

    pub fn keys(&self) -> u16 {
        self.keys
    }

    fn keyinput(&self) -> u16 {
        (!self.keys) & 0x03ff
    }

    /// Evaluates the `KEYCNT` IRQ condition against the current key
    /// state and raises [`IrqSource::Keypad`] if it fires. Called once
    /// per frame (or step) by the driver, not on every register poke.
    pub fn check_irq(&self, interrupts: &mut Interrupts) {
        if self.keycnt & 0x4000 == 0 {
            return;
        }
        let selected = self.keycnt & 0x03ff;
        if selected == 0 {
            return;
        }
        let pressed = self.keys & selected;
        let fires = if self.keycnt & 0x8000 != 0 {
            pressed == selected // AND: every selected key held
        } else {
            pressed != 0 // OR: any selected key held
        };
        if fires {
            interrupts.raise(IrqSource::Keypad);
        }
    }
}

impl BusComponent for Pad {
    fn read(&self, addr: u32) -> u8 {
        match addr {
            KEYINPUT_ADDR => self.keyinput() as u8,
            a if a == KEYINPUT_ADDR + 1 => (self.keyinput() >> 8) as u8,
            KEYCNT_ADDR => self.keycnt as u8,
            a if a == KEYCNT_ADDR + 1 => (self.keycnt >> 8) as u8,
            _ => {
                warnln!("Reading from unknown Pad location 0x{:08x}", addr);
                0x00
            }
        }
    }

    fn write(&mut self, addr: u32, value: u8) {
        match addr {
            KEYCNT_ADDR => self.keycnt = (self.keycnt & 0xff00) | value as u16,
            a if a == KEYCNT_ADDR + 1 => self.keycnt = (self.keycnt & 0x00ff) | ((value as u16) << 8),
            // KEYINPUT is read-only on real hardware
            a if a == KEYINPUT_ADDR || a == KEYINPUT_ADDR + 1 => {}
            _ => warnln!("Writing to unknown Pad location 0x{:08x}", addr),
        }
    }
}

impl StateComponent for Pad {
    fn save(&self, buffer: &mut Vec<u8>) {
        self.keys.save(buffer);
        self.keycnt.save(buffer);
    }

    fn load(&mut self, cursor: &mut Cursor<&[u8]>) -> Result<(), Error> {
        self.keys.load(cursor)?;
        self.keycnt.load(cursor)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyinput_active_low() {
        let mut pad = Pad::new();
        assert_eq!(pad.keyinput(), 0x03ff);
        pad.key_press(PadKey::A);
        assert_eq!(pad.keyinput() & 0x01, 0x00);
    }

    #[test]
    fn test_keycnt_or_condition() {
        let mut pad = Pad::new();
        pad.keycnt = 0x4000 | 0x01; // IRQ enabled, select A, OR mode
        let mut irq = Interrupts::new();
        pad.check_irq(&mut irq);
        assert!(!irq.pending() && irq.iflag() == 0);

        pad.key_press(PadKey::A);
        pad.check_irq(&mut irq);
        assert_ne!(irq.iflag() & (1 << IrqSource::Keypad as u16), 0);
    }
}
