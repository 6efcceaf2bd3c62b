//! Top level structure that abstracts the per-scanline interleave of
//! CPU, PPU, DMA, timers and interrupts into the handful of calls a
//! host actually needs: boot a ROM, step a frame, read/write memory,
//! and save/load state.
//!
//! Should serve as the main entry-point API.

use oxidegba_common::error::Error;

use crate::bus::Bus;
use crate::consts::{CYCLES_PER_SCANLINE, INPUT_MASK_EWRAM_OFFSET, SCANLINES_PER_FRAME, VISIBLE_SCANLINES};
use crate::cpu::Cpu;
use crate::dma::DmaTiming;
use crate::rom::Cartridge;
use crate::state::{read_header, write_header, StateComponent};

/// Aggregation structure bundling the two halves of the machine
/// (execution and memory) for callers that need direct access beyond
/// what [`Gba`]'s own methods expose.
pub struct Components<'a> {
    pub cpu: &'a mut Cpu,
    pub bus: &'a mut Bus,
}

/// Top level structure that owns a running Game Boy Advance: the CPU,
/// the bus (and everything it owns: RAM, the PPU, DMA, timers,
/// interrupts, the pad, the cartridge) and the small amount of
/// bookkeeping (frame count) that lives above both.
pub struct Gba {
    cpu: Cpu,
    bus: Bus,
    frame_count: u64,
}

impl Gba {
    /// Loads `rom_bytes` into a fresh cartridge, attaches it to a new
    /// bus, and boots the CPU, ready for the first [`Gba::step_frame`]
    /// call.
    pub fn init(rom_bytes: Vec<u8>) -> Result<Self, Error> {
        let cartridge = Cartridge::load(rom_bytes)?;
        let mut bus = Bus::new(cartridge);
        let mut cpu = Cpu::new();
        cpu.boot();
        bus.reset();
        Ok(Self {
            cpu,
            bus,
            frame_count: 0,
        })
    }

    /// Reinitializes CPU and bus state and zeroes the frame counter,
    /// keeping the currently attached cartridge (its ROM and any flash
    /// contents survive a reset, matching real hardware).
    pub fn reset(&mut self) {
        self.bus.reset();
        self.cpu = Cpu::new();
        self.cpu.boot();
        self.frame_count = 0;
    }

    pub fn components(&mut self) -> Components {
        Components {
            cpu: &mut self.cpu,
            bus: &mut self.bus,
        }
    }

    pub fn cpu(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn bus(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn cpu_cycles(&self) -> u64 {
        self.cpu.cycles()
    }

    /// Reads one byte straight off the bus, honoring the same mapping
    /// and I/O side effects a CPU instruction would see.
    pub fn read_memory(&mut self, addr: u32) -> u8 {
        self.bus.read8_bus(addr)
    }

    pub fn write_memory(&mut self, addr: u32, value: u8) {
        self.bus.write8_bus(addr, value)
    }

    /// Mirrors the host-supplied button mask into EWRAM and the pad
    /// subsystem, which synthesizes `KEYINPUT` from it on the next
    /// read.
    fn apply_input(&mut self, buttons: u16) {
        let offset = INPUT_MASK_EWRAM_OFFSET as usize;
        let bytes = buttons.to_le_bytes();
        let ewram = self.bus.ewram_mut();
        ewram[offset] = bytes[0];
        ewram[offset + 1] = bytes[1];
        self.bus.pad().set_keys(buttons);
        self.bus.check_pad_irq();
    }

    /// Runs exactly one frame (228 scanlines, 1232 cycles each) and
    /// returns the resulting 240x160 RGB565 framebuffer.
    ///
    /// Order within a scanline is load-bearing and must not be
    /// reshuffled: VCOUNT update (and whatever VBlank/HBlank/VCount
    /// IRQs it raises) comes before the VBlank/HBlank DMA trigger,
    /// which comes before CPU execution, which interleaves with timer
    /// ticks, which comes before the scanline is rendered and the
    /// affine BG reference points are advanced. Games rely on HBlank
    /// DMA landing before the scanline it feeds is drawn, and on timer
    /// overflows reaching the interrupt controller before the CPU's
    /// next instruction sees them.
    pub fn step_frame(&mut self, buttons: u16) -> &[u16] {
        self.apply_input(buttons);

        for scanline in 0..SCANLINES_PER_FRAME {
            self.bus.update_vcount(scanline as u8);

            if scanline == VISIBLE_SCANLINES {
                self.bus.trigger_dma(DmaTiming::VBlank);
            }
            if scanline < VISIBLE_SCANLINES {
                self.bus.trigger_dma(DmaTiming::HBlank);
            }

            let mut cycles_left = CYCLES_PER_SCANLINE as i64;
            while cycles_left > 0 {
                if self.cpu.halted() {
                    if self.bus.interrupts_i().pending() {
                        self.cpu.wake();
                    } else {
                        // Halted CPU still burns scanline time so timers
                        // and the PPU keep advancing underneath it.
                        self.bus.clock_timer(cycles_left as u32);
                        break;
                    }
                }

                if self.bus.interrupts_i().pending() && !self.cpu.irq_disabled() {
                    self.cpu.handle_irq(&mut self.bus);
                }

                let cycles = self.cpu.step(&mut self.bus);
                self.bus.clock_timer(cycles);
                cycles_left -= cycles as i64;
            }

            if scanline < VISIBLE_SCANLINES {
                self.bus.render_scanline(scanline as usize);
            }
            self.bus.advance_affine_refs();
        }

        self.frame_count += 1;
        self.bus.framebuffer()
    }

    /// Serializes CPU and bus state behind the magic/version/game-code
    /// header. The cartridge's ROM bytes are never included; a loader
    /// must re-attach an identical ROM, checked by game code.
    pub fn save_state(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        write_header(&mut buffer, &self.bus.rom_i().game_code());
        self.frame_count.save(&mut buffer);
        self.cpu.save(&mut buffer);
        self.bus.save(&mut buffer);
        buffer
    }

    /// Restores CPU and bus state from a buffer previously produced by
    /// [`Gba::save_state`]. Fails if the header's magic, version, or
    /// game code don't match the currently attached cartridge; on
    /// failure the machine is left untouched.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), Error> {
        let game_code = self.bus.rom_i().game_code();
        let mut cursor = read_header(data, &game_code)?;

        let mut frame_count = 0u64;
        frame_count.load(&mut cursor)?;
        let mut cpu = Cpu::new();
        cpu.load(&mut cursor)?;
        self.bus.load(&mut cursor)?;

        self.frame_count = frame_count;
        self.cpu = cpu;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{build_rom, idle_rom};

    #[test]
    fn test_boot_baseline_advances_one_frame() {
        let mut gba = Gba::init(idle_rom()).unwrap();
        gba.step_frame(0);
        assert_eq!(gba.frame_count(), 1);
        assert!(!gba.cpu().halted());
    }

    #[test]
    fn test_input_mask_mirrors_into_ewram() {
        let mut gba = Gba::init(idle_rom()).unwrap();
        gba.step_frame(0x0001);
        let offset = INPUT_MASK_EWRAM_OFFSET as usize;
        let ewram = gba.bus().ewram();
        assert_eq!(u16::from_le_bytes([ewram[offset], ewram[offset + 1]]), 0x0001);
    }

    #[test]
    fn test_save_load_round_trip_preserves_frame_count() {
        let mut gba = Gba::init(idle_rom()).unwrap();
        gba.step_frame(0);
        gba.step_frame(0);
        let snapshot = gba.save_state();

        let mut reloaded = Gba::init(idle_rom()).unwrap();
        reloaded.load_state(&snapshot).unwrap();
        assert_eq!(reloaded.frame_count(), 2);
    }

    #[test]
    fn test_load_state_rejects_mismatched_game_code() {
        let mut gba = Gba::init(idle_rom()).unwrap();
        let snapshot = gba.save_state();

        let other_rom = build_rom(|data| {
            data[0x00] = 0xfe;
            data[0x01] = 0xff;
            data[0x02] = 0xff;
            data[0x03] = 0xea;
            data[0xac] = b'A';
            data[0xad] = b'G';
            data[0xae] = b'B';
            data[0xaf] = b'E';
        });

        let mut other = Gba::init(other_rom).unwrap();
        assert!(other.load_state(&snapshot).is_err());
    }
}
