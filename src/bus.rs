//! Bus (unified memory map) functions and structures.
//!
//! The bus is the sole owner of every addressable region: BIOS, work
//! RAM, I/O, palette/VRAM/OAM, the cartridge, and SRAM/flash. Every
//! other component reaches memory through it rather than holding its
//! own copy, so mirroring and side effects only need to be expressed
//! once.

use crate::consts::{
    BIOS_SIZE, DMA0SAD_ADDR, DMA_CHANNEL_STRIDE, EWRAM_SIZE, GPIO_CONTROL_ADDR, GPIO_DATA_ADDR,
    GPIO_DIRECTION_ADDR, IE_ADDR, IF_ADDR, IME_ADDR, IWRAM_SIZE, KEYCNT_ADDR, KEYINPUT_ADDR,
    OAM_SIZE, PALETTE_SIZE, TM0CNT_L_ADDR, VRAM_SIZE,
};
use crate::diag::Diagnostics;
use crate::dma::{Dma, DmaTiming};
use crate::gpio::Gpio;
use crate::interrupts::Interrupts;
use crate::pad::Pad;
use crate::ppu::Ppu;
use crate::rom::Cartridge;
use crate::state::StateComponent;
use crate::timer::Timer;
use std::io::Cursor;
use oxidegba_common::error::Error;

/// Byte-addressed register/memory component, read and written by the
/// [`Bus`]. Implementors only ever see the bytes that fall within
/// their own register file; the 16/32-bit helpers are composed from
/// `read`/`write` so a component only has to implement the byte-level
/// pair.
pub trait BusComponent {
    fn read(&self, addr: u32) -> u8;
    fn write(&mut self, addr: u32, value: u8);

    fn read16(&self, addr: u32) -> u16 {
        self.read(addr) as u16 | ((self.read(addr + 1) as u16) << 8)
    }

    fn write16(&mut self, addr: u32, value: u16) {
        self.write(addr, value as u8);
        self.write(addr + 1, (value >> 8) as u8);
    }

    fn read32(&self, addr: u32) -> u32 {
        self.read16(addr) as u32 | ((self.read16(addr + 2) as u32) << 16)
    }

    fn write32(&mut self, addr: u32, value: u32) {
        self.write16(addr, value as u16);
        self.write16(addr + 2, (value >> 16) as u16);
    }
}

const BIOS_REGION: u32 = 0x0;
const EWRAM_REGION: u32 = 0x2;
const IWRAM_REGION: u32 = 0x3;
const IO_REGION: u32 = 0x4;
const PALETTE_REGION: u32 = 0x5;
const VRAM_REGION: u32 = 0x6;
const OAM_REGION: u32 = 0x7;
const ROM_REGION_LO: u32 = 0x8;
const ROM_REGION_HI: u32 = 0xd;
const SRAM_REGION: u32 = 0xe;

pub struct Bus {
    bios: Vec<u8>,
    ewram: Vec<u8>,
    iwram: Vec<u8>,

    palette: Vec<u8>,
    vram: Vec<u8>,
    oam: Vec<u8>,

    rom: Cartridge,
    gpio: Gpio,

    ppu: Ppu,
    dma: Dma,
    timer: Timer,
    pad: Pad,
    interrupts: Interrupts,

    postflg: u8,
    haltcnt: u8,

    diagnostics: Diagnostics,
}

impl Bus {
    pub fn new(rom: Cartridge) -> Self {
        Self {
            bios: vec![0x00; BIOS_SIZE as usize],
            ewram: vec![0x00; EWRAM_SIZE as usize],
            iwram: vec![0x00; IWRAM_SIZE as usize],
            palette: vec![0x00; PALETTE_SIZE as usize],
            vram: vec![0x00; VRAM_SIZE as usize],
            oam: vec![0x00; OAM_SIZE as usize],
            rom,
            gpio: Gpio::new(),
            ppu: Ppu::new(),
            dma: Dma::new(),
            timer: Timer::new(),
            pad: Pad::new(),
            interrupts: Interrupts::new(),
            postflg: 0x00,
            haltcnt: 0x00,
            diagnostics: Diagnostics::new(),
        }
    }

    /// Reinitializes every owned region and peripheral but keeps the
    /// loaded ROM attached, matching the "reset preserves cartridge"
    /// lifecycle rule.
    pub fn reset(&mut self) {
        self.ewram.iter_mut().for_each(|b| *b = 0x00);
        self.iwram.iter_mut().for_each(|b| *b = 0x00);
        self.palette.iter_mut().for_each(|b| *b = 0x00);
        self.vram.iter_mut().for_each(|b| *b = 0x00);
        self.oam.iter_mut().for_each(|b| *b = 0x00);
        self.gpio.reset();
        self.ppu.reset();
        self.dma.reset();
        self.timer.reset();
        self.pad.reset();
        self.interrupts.reset();
        self.postflg = 0x00;
        self.haltcnt = 0x00;
    }

    pub fn load_bios(&mut self, data: &[u8]) {
        let len = data.len().min(self.bios.len());
        self.bios[..len].copy_from_slice(&data[..len]);
    }

    pub fn ppu(&mut self) -> &mut Ppu {
        &mut self.ppu
    }
    pub fn ppu_i(&self) -> &Ppu {
        &self.ppu
    }

    /// Sets VCOUNT and raises whichever VBlank/HBlank/VCount interrupts
    /// are due, given the PPU and interrupt controller are two
    /// separate fields here rather than the method call spec
    /// pseudocode implies.
    pub fn update_vcount(&mut self, scanline: u8) {
        self.ppu.update_vcount(scanline, &mut self.interrupts);
    }

    /// Renders one visible scanline, borrowing the palette/VRAM/OAM
    /// buffers this bus owns rather than handing the PPU its own copy.
    pub fn render_scanline(&mut self, scanline: usize) {
        self.ppu.render_scanline(scanline, &self.palette, &self.vram, &self.oam);
    }

    pub fn advance_affine_refs(&mut self) {
        self.ppu.advance_affine_refs();
    }

    pub fn framebuffer(&self) -> &[u16] {
        self.ppu.framebuffer()
    }
    pub fn dma(&mut self) -> &mut Dma {
        &mut self.dma
    }
    pub fn dma_i(&self) -> &Dma {
        &self.dma
    }
    pub fn timer(&mut self) -> &mut Timer {
        &mut self.timer
    }

    /// Advances every timer unit by `cycles` system clocks, wiring
    /// overflow interrupts back to this bus's own interrupt controller
    /// (the same split-borrow shape as [`Bus::trigger_dma`], needed
    /// since `Timer::clock` wants both pieces at once).
    pub fn clock_timer(&mut self, cycles: u32) {
        let mut timer = std::mem::take(&mut self.timer);
        let mut interrupts = std::mem::take(&mut self.interrupts);
        timer.clock(cycles, &mut interrupts);
        self.timer = timer;
        self.interrupts = interrupts;
    }
    pub fn pad(&mut self) -> &mut Pad {
        &mut self.pad
    }
    pub fn pad_i(&self) -> &Pad {
        &self.pad
    }
    pub fn interrupts(&mut self) -> &mut Interrupts {
        &mut self.interrupts
    }
    pub fn interrupts_i(&self) -> &Interrupts {
        &self.interrupts
    }

    /// Evaluates the `KEYCNT` keypad-interrupt condition against the
    /// current key state, raising `IrqSource::Keypad` on the interrupt
    /// controller this bus owns if it fires. Disjoint field borrows of
    /// `pad` and `interrupts` off the same `&mut self` avoid needing
    /// the `mem::take` split used where a component must itself be
    /// driven with a `&mut Bus`.
    pub fn check_pad_irq(&mut self) {
        self.pad.check_irq(&mut self.interrupts);
    }

    pub fn rom(&mut self) -> &mut Cartridge {
        &mut self.rom
    }
    pub fn rom_i(&self) -> &Cartridge {
        &self.rom
    }
    pub fn diagnostics(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }
    pub fn diagnostics_i(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn palette(&self) -> &[u8] {
        &self.palette
    }
    pub fn vram(&self) -> &[u8] {
        &self.vram
    }
    pub fn oam(&self) -> &[u8] {
        &self.oam
    }
    pub fn ewram(&self) -> &[u8] {
        &self.ewram
    }
    pub fn iwram(&self) -> &[u8] {
        &self.iwram
    }
    pub fn ewram_mut(&mut self) -> &mut [u8] {
        &mut self.ewram
    }
    pub fn iwram_mut(&mut self) -> &mut [u8] {
        &mut self.iwram
    }
    pub fn palette_mut(&mut self) -> &mut [u8] {
        &mut self.palette
    }
    pub fn vram_mut(&mut self) -> &mut [u8] {
        &mut self.vram
    }
    pub fn oam_mut(&mut self) -> &mut [u8] {
        &mut self.oam
    }

    /// Runs every DMA channel currently configured for `timing`, in
    /// channel-priority order, wiring each channel's generic transfer
    /// loop back to this bus's own `read32`/`read16`/`write32`/`write16`.
    pub fn trigger_dma(&mut self, timing: DmaTiming) {
        let ready = self.dma.ready_channels(timing);
        for index in ready {
            let mut dma = std::mem::take(&mut self.dma);
            let mut interrupts = std::mem::take(&mut self.interrupts);
            dma.run_transfer(
                index,
                &mut interrupts,
                |addr, word| {
                    if word {
                        self.read32_bus(addr & !3)
                    } else {
                        self.read16_bus(addr & !1) as u32
                    }
                },
                |addr, word, value| {
                    if word {
                        self.write32_bus(addr & !3, value)
                    } else {
                        self.write16_bus(addr & !1, value as u16)
                    }
                },
            );
            self.dma = dma;
            self.interrupts = interrupts;
        }
    }

    fn region_of(addr: u32) -> u32 {
        (addr >> 24) & 0xf
    }

    fn read8(&mut self, addr: u32) -> u8 {
        match Self::region_of(addr) {
            BIOS_REGION => {
                let offset = (addr % BIOS_SIZE) as usize;
                self.bios.get(offset).copied().unwrap_or(0x00)
            }
            EWRAM_REGION => {
                let offset = (addr % EWRAM_SIZE) as usize;
                self.ewram[offset]
            }
            IWRAM_REGION => {
                let offset = (addr % IWRAM_SIZE) as usize;
                self.iwram[offset]
            }
            IO_REGION => self.read_io(addr),
            PALETTE_REGION => {
                let offset = (addr % PALETTE_SIZE) as usize;
                self.palette[offset]
            }
            VRAM_REGION => {
                let offset = Self::vram_offset(addr);
                self.vram[offset]
            }
            OAM_REGION => {
                let offset = (addr % OAM_SIZE) as usize;
                self.oam[offset]
            }
            ROM_REGION_LO..=ROM_REGION_HI => {
                if (GPIO_DATA_ADDR..=GPIO_CONTROL_ADDR + 1).contains(&addr) {
                    self.gpio.read(addr)
                } else {
                    self.rom.read(addr)
                }
            }
            SRAM_REGION => self.rom.read_sram(addr),
            _ => {
                self.diagnostics
                    .note("bus-unmapped-read", || format!("unmapped read at 0x{:08x}", addr));
                0x00
            }
        }
    }

    fn write8(&mut self, addr: u32, value: u8) {
        match Self::region_of(addr) {
            BIOS_REGION => {}
            EWRAM_REGION => {
                let offset = (addr % EWRAM_SIZE) as usize;
                self.ewram[offset] = value;
            }
            IWRAM_REGION => {
                let offset = (addr % IWRAM_SIZE) as usize;
                self.iwram[offset] = value;
            }
            IO_REGION => self.write_io(addr, value),
            PALETTE_REGION => {
                // 8-bit writes replicate across both bytes of the
                // halfword they land in: there is no 8-bit palette
                // entry on real hardware.
                let offset = (addr % PALETTE_SIZE) as usize & !1;
                self.palette[offset] = value;
                self.palette[offset + 1] = value;
            }
            VRAM_REGION => {
                let offset = Self::vram_offset(addr);
                self.vram[offset] = value;
            }
            OAM_REGION => {
                let offset = (addr % OAM_SIZE) as usize;
                self.oam[offset] = value;
            }
            ROM_REGION_LO..=ROM_REGION_HI => {
                if (GPIO_DATA_ADDR..=GPIO_CONTROL_ADDR + 1).contains(&addr) {
                    self.gpio.write(addr, value);
                } else {
                    self.rom.write(addr, value);
                }
            }
            SRAM_REGION => self.rom.write_sram(addr, value),
            _ => self
                .diagnostics
                .note("bus-unmapped-write", || format!("unmapped write at 0x{:08x}", addr)),
        }
    }

    /// The 96 KiB VRAM region repeats its layout in a 128 KiB window
    /// (the last 32 KiB repeats the first 32 KiB of OBJ tile data).
    fn vram_offset(addr: u32) -> usize {
        let local = addr % 0x0002_0000;
        if local < VRAM_SIZE {
            local as usize
        } else {
            (local - VRAM_SIZE) as usize
        }
    }

    fn read_io(&mut self, addr: u32) -> u8 {
        match addr {
            a if (DMA0SAD_ADDR..TM0CNT_L_ADDR).contains(&a) => self.dma.read(a),
            a if (TM0CNT_L_ADDR..KEYINPUT_ADDR).contains(&a) => self.timer.read(a),
            KEYINPUT_ADDR | KEYCNT_ADDR => self.pad.read(addr),
            a if a == KEYINPUT_ADDR + 1 || a == KEYCNT_ADDR + 1 => self.pad.read(addr),
            IE_ADDR | IF_ADDR | IME_ADDR => self.interrupts.read(addr),
            a if a == IE_ADDR + 1 || a == IF_ADDR + 1 => self.interrupts.read(addr),
            a if (IME_ADDR..IME_ADDR + 4).contains(&a) => self.interrupts.read(addr),
            0x0400_0300 => self.postflg,
            0x0400_0301 => self.haltcnt,
            a if a < DMA0SAD_ADDR => self.ppu.read(a),
            _ => {
                self.diagnostics
                    .note("bus-unmapped-io-read", || format!("unmapped I/O read at 0x{:08x}", addr));
                0x00
            }
        }
    }

    fn write_io(&mut self, addr: u32, value: u8) {
        match addr {
            a if (DMA0SAD_ADDR..TM0CNT_L_ADDR).contains(&a) => {
                self.dma.write(a, value);
                // CNT_H's high byte carries the enable bit; a write here
                // may have just latched a channel for immediate timing,
                // which runs synchronously rather than waiting for the
                // frame driver's VBlank/HBlank trigger points.
                let is_cnt_h_high = (a - DMA0SAD_ADDR) % DMA_CHANNEL_STRIDE == 11;
                if is_cnt_h_high {
                    self.trigger_dma(DmaTiming::Immediate);
                }
            }
            a if (TM0CNT_L_ADDR..KEYINPUT_ADDR).contains(&a) => self.timer.write(a, value),
            // KEYINPUT is produced by the input subsystem, not the CPU
            KEYINPUT_ADDR => {}
            a if a == KEYINPUT_ADDR + 1 => {}
            KEYCNT_ADDR => self.pad.write(addr, value),
            a if a == KEYCNT_ADDR + 1 => self.pad.write(addr, value),
            IE_ADDR | IF_ADDR | IME_ADDR => self.interrupts.write(addr, value),
            a if a == IE_ADDR + 1 || a == IF_ADDR + 1 => self.interrupts.write(addr, value),
            a if (IME_ADDR..IME_ADDR + 4).contains(&a) => self.interrupts.write(addr, value),
            0x0400_0300 => self.postflg = value,
            0x0400_0301 => self.haltcnt = value,
            // VCOUNT is read-only
            0x0400_0006 | 0x0400_0007 => {}
            a if a < DMA0SAD_ADDR => self.ppu.write(a, value),
            _ => self
                .diagnostics
                .note("bus-unmapped-io-write", || format!("unmapped I/O write at 0x{:08x}", addr)),
        }
    }

    pub fn read8_bus(&mut self, addr: u32) -> u8 {
        self.read8(addr)
    }

    pub fn write8_bus(&mut self, addr: u32, value: u8) {
        self.write8(addr, value)
    }

    /// 16-bit read honoring the alignment rule: the address is rounded
    /// down to an even boundary before the two bytes are gathered.
    pub fn read16_bus(&mut self, addr: u32) -> u16 {
        let addr = addr & !1;
        self.read8(addr) as u16 | ((self.read8(addr + 1) as u16) << 8)
    }

    pub fn write16_bus(&mut self, addr: u32, value: u16) {
        let addr = addr & !1;
        self.write8(addr, value as u8);
        self.write8(addr + 1, (value >> 8) as u8);
    }

    /// 32-bit read. A misaligned `addr` is permitted by this call
    /// (unlike `read16_bus`/real ARM LDR semantics): it reads the
    /// word at the aligned base and leaves the caller (the CPU's LDR
    /// handler) to apply the ARM-defined rotate for the misaligned
    /// case.
    pub fn read32_bus(&mut self, addr: u32) -> u32 {
        let aligned = addr & !3;
        self.read8(aligned) as u32
            | ((self.read8(aligned + 1) as u32) << 8)
            | ((self.read8(aligned + 2) as u32) << 16)
            | ((self.read8(aligned + 3) as u32) << 24)
    }

    pub fn write32_bus(&mut self, addr: u32, value: u32) {
        let addr = addr & !3;
        self.write8(addr, value as u8);
        self.write8(addr + 1, (value >> 8) as u8);
        self.write8(addr + 2, (value >> 16) as u8);
        self.write8(addr + 3, (value >> 24) as u8);
    }
}

/// Serializes every region buffer and peripheral this bus owns except
/// the cartridge (ROM is never saved; SRAM/flash is backed up through
/// its own host-facing path, not the save-state blob). Field order
/// here is the on-disk layout: EWRAM/IWRAM, then the I/O-backing
/// peripherals, then PAL/VRAM/OAM, then interrupt/timer/DMA state.
impl StateComponent for Bus {
    fn save(&self, buffer: &mut Vec<u8>) {
        self.ewram.save(buffer);
        self.iwram.save(buffer);
        self.pad.save(buffer);
        self.ppu.save(buffer);
        self.gpio.save(buffer);
        self.postflg.save(buffer);
        self.haltcnt.save(buffer);
        self.palette.save(buffer);
        self.vram.save(buffer);
        self.oam.save(buffer);
        self.interrupts.save(buffer);
        self.timer.save(buffer);
        self.dma.save(buffer);
    }

    fn load(&mut self, cursor: &mut Cursor<&[u8]>) -> Result<(), Error> {
        self.ewram.load(cursor)?;
        self.iwram.load(cursor)?;
        self.pad.load(cursor)?;
        self.ppu.load(cursor)?;
        self.gpio.load(cursor)?;
        self.postflg.load(cursor)?;
        self.haltcnt.load(cursor)?;
        self.palette.load(cursor)?;
        self.vram.load(cursor)?;
        self.oam.load(cursor)?;
        self.interrupts.load(cursor)?;
        self.timer.load(cursor)?;
        self.dma.load(cursor)?;
        Ok(())
    }
}
