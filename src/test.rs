//! Synthetic test-program builders.
//!
//! Every scenario below drives a [`Gba`] through entirely in-memory
//! ROM images and register pokes rather than an external ROM file, so
//! the crate's own test suite never depends on anything outside it.

use crate::gba::Gba;

/// Builds a minimal valid ROM image: a 512-byte buffer with a correct
/// header (game code `BPEE`, checksum) and whatever `patch` writes into
/// it beforehand, typically a handful of ARM instructions at the entry
/// point.
pub fn build_rom(patch: impl FnOnce(&mut [u8])) -> Vec<u8> {
    let mut data = vec![0u8; 0x200];
    patch(&mut data);
    data[0xac] = b'B';
    data[0xad] = b'P';
    data[0xae] = b'E';
    data[0xaf] = b'E';
    let mut sum: i32 = 0;
    for &byte in &data[0xa0..=0xbc] {
        sum = sum.wrapping_sub(byte as i32);
    }
    data[0xbd] = sum.wrapping_sub(0x19) as u8;
    data
}

/// A ROM whose entry point is `B +0`, an infinite self-branch. Used by
/// scenarios that drive the machine through [`Gba::step_frame`] but
/// don't care what the CPU itself executes once DMA/interrupts have
/// done their work.
pub fn idle_rom() -> Vec<u8> {
    build_rom(|data| {
        data[0x00] = 0xfe;
        data[0x01] = 0xff;
        data[0x02] = 0xff;
        data[0x03] = 0xea;
    })
}

pub fn boot_and_run(rom: Vec<u8>, frames: u32) -> Gba {
    let mut gba = Gba::init(rom).unwrap();
    for _ in 0..frames {
        gba.step_frame(0);
    }
    gba
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::bgr555_to_rgb565;
    use crate::consts::{
        DISPCNT_ADDR, DISPSTAT_ADDR, DMA0SAD_ADDR, EWRAM_BASE, IE_ADDR, IME_ADDR, ROM_BASE, VRAM_BASE,
    };
    use crate::gba::Components;

    fn write_u16(gba: &mut Gba, addr: u32, value: u16) {
        gba.write_memory(addr, value as u8);
        gba.write_memory(addr + 1, (value >> 8) as u8);
    }

    fn write_u32(gba: &mut Gba, addr: u32, value: u32) {
        write_u16(gba, addr, value as u16);
        write_u16(gba, addr + 2, (value >> 16) as u16);
    }

    #[test]
    fn test_boot_baseline_holds_branch_to_self() {
        let mut gba = boot_and_run(idle_rom(), 1);
        assert_eq!(gba.cpu().reg(15), 0x0800_0008);
        assert_eq!(gba.frame_count(), 1);
    }

    #[test]
    fn test_bios_division_matches_quotient_remainder_and_abs() {
        let rom = build_rom(|data| {
            // SWI #0x06 (Div)
            data[0x00] = 0x00;
            data[0x01] = 0x00;
            data[0x02] = 0x06;
            data[0x03] = 0xef;
        });
        let mut gba = Gba::init(rom).unwrap();
        {
            let Components { cpu, bus } = gba.components();
            cpu.poke_reg(0, 1_000_000);
            cpu.poke_reg(1, 7);
            cpu.step(bus);
        }

        assert_eq!(gba.cpu().reg(0), 142857);
        assert_eq!(gba.cpu().reg(1), 1);
        assert_eq!(gba.cpu().reg(3), 142857);
    }

    #[test]
    fn test_bios_division_by_zero_leaves_numerator_in_remainder() {
        let rom = build_rom(|data| {
            data[0x00] = 0x00;
            data[0x01] = 0x00;
            data[0x02] = 0x06;
            data[0x03] = 0xef;
        });
        let mut gba = Gba::init(rom).unwrap();
        {
            let Components { cpu, bus } = gba.components();
            cpu.poke_reg(0, 77);
            cpu.poke_reg(1, 0);
            cpu.step(bus);
        }

        assert_eq!(gba.cpu().reg(0), 0);
        assert_eq!(gba.cpu().reg(1), 77);
    }

    /// DMA rectangle fill: a 240x160 halfword buffer DMA'd from EWRAM
    /// straight into VRAM must land every halfword, channel-agnostic of
    /// whatever real-hardware count limit channel 0 otherwise carries.
    #[test]
    fn test_dma_immediate_fill_covers_whole_bitmap_frame() {
        let mut gba = Gba::init(idle_rom()).unwrap();
        let src = EWRAM_BASE + 0x1000;
        let count = 240usize * 160;

        {
            let ewram = gba.bus().ewram_mut();
            let offset = 0x1000;
            for i in 0..count {
                ewram[offset + i * 2] = 0xff;
                ewram[offset + i * 2 + 1] = 0x7f;
            }
        }

        write_u32(&mut gba, DMA0SAD_ADDR, src);
        write_u32(&mut gba, DMA0SAD_ADDR + 4, VRAM_BASE);
        write_u16(&mut gba, DMA0SAD_ADDR + 8, count as u16);
        // enable, immediate timing, halfword size, increment/increment
        write_u16(&mut gba, DMA0SAD_ADDR + 10, 0x8000);

        let vram = gba.bus().vram();
        for chunk in vram[..count * 2].chunks(2) {
            assert_eq!(u16::from_le_bytes([chunk[0], chunk[1]]), 0x7fff);
        }
    }

    /// VBlank IRQ delivery: a handler installed through the BIOS
    /// trampoline's `0x0300_7ffc` pointer slot must run to completion
    /// and have its side effect visible once the frame that crosses
    /// into VBlank has been stepped.
    #[test]
    fn test_vblank_irq_invokes_installed_handler() {
        let mut gba = Gba::init(idle_rom()).unwrap();

        // LDR r0,[pc,#8] ; LDR r1,[pc,#8] ; STR r0,[r1] ; SUBS pc,lr,#4
        // followed by the two literal-pool words the LDRs pick up.
        let handler: [u8; 24] = [
            0x08, 0x00, 0x9f, 0xe5, 0x08, 0x10, 0x9f, 0xe5, 0x00, 0x00, 0x81, 0xe5, 0x04, 0xf0,
            0x5e, 0xe2, 0xbe, 0xba, 0xfe, 0xca, 0x00, 0x01, 0x00, 0x03,
        ];
        gba.bus().iwram_mut()[..handler.len()].copy_from_slice(&handler);
        gba.bus().iwram_mut()[0x7ffc..0x8000].copy_from_slice(&0x0300_0000u32.to_le_bytes());

        write_u16(&mut gba, IE_ADDR, 0x0001);
        write_u16(&mut gba, DISPSTAT_ADDR, 0x0008);
        write_u16(&mut gba, IME_ADDR, 0x0001);

        gba.step_frame(0);

        let iwram = gba.bus().iwram();
        let stored = u32::from_le_bytes([iwram[0x100], iwram[0x101], iwram[0x102], iwram[0x103]]);
        assert_eq!(stored, 0xcafe_babe);
    }

    /// LZ77 decompression: a hand-built compressed stream (5 literal
    /// bytes followed by one back-reference copying them, disp=5
    /// len=11) must expand to `"ABCDEABCDEABCDEA"` through SWI 0x11.
    #[test]
    fn test_lz77_uncomp_expands_backreference_into_repeated_text() {
        let compressed: [u8; 12] = [
            0x01, 0x10, 0x00, 0x00, // header: type=1, size=16
            0x04, // control byte: op5 is a back-reference, rest literal
            b'A', b'B', b'C', b'D', b'E', // five literal bytes
            0x80, 0x04, // backref: len-3=8 (len=11), disp-1=4 (disp=5)
        ];
        let src = ROM_BASE + 0x100;
        let dst = EWRAM_BASE + 0x2000;

        let rom = build_rom(|data| {
            data[0x00] = 0xfe;
            data[0x01] = 0xff;
            data[0x02] = 0xff;
            data[0x03] = 0xea;
            data[0x100..0x100 + compressed.len()].copy_from_slice(&compressed);
            // SWI #0x11 (LZ77UnCompReadNormalWrite8bit)
            data[0x04] = 0x00;
            data[0x05] = 0x00;
            data[0x06] = 0x11;
            data[0x07] = 0xef;
        });
        let mut gba = Gba::init(rom).unwrap();
        {
            let Components { cpu, bus } = gba.components();
            cpu.poke_reg(0, src);
            cpu.poke_reg(1, dst);
            // regs[15] carries the pipeline-biased PC (fetch address + 8)
            cpu.poke_reg(15, ROM_BASE + 0x04 + 8);
            cpu.step(bus);
        }

        let ewram = gba.bus().ewram();
        let offset = 0x2000;
        assert_eq!(&ewram[offset..offset + 16], b"ABCDEABCDEABCDEA");
    }

    /// Sprite draw: a 16x16 8bpp OBJ at OAM entry 0, positioned at
    /// (120, 80), using sprite palette index 1, must paint exactly that
    /// 16x16 region the configured color and leave the backdrop
    /// elsewhere.
    #[test]
    fn test_sprite_draw_paints_its_footprint_and_nothing_else() {
        let mut gba = Gba::init(idle_rom()).unwrap();

        write_u16(&mut gba, DISPCNT_ADDR, 0x1040); // mode 0, OBJ on, 1D mapping

        {
            let vram = gba.bus().vram_mut();
            // 1D-mapped 8bpp tiles are two tile-slots apart per column
            // of a 16x16 sprite (tile_index steps by 2), so the actual
            // tiles touched are 0, 2, 4 and 6; overfill the whole span
            // rather than poke four exact 64-byte windows.
            vram[0x10000..0x10000 + 8 * 64].fill(0x01);
        }
        {
            let palette = gba.bus().palette_mut();
            // OBJ palette entry 1 (index 0x100 + 1), BGR555 0x001f
            let offset = (0x100 + 1) * 2;
            palette[offset] = 0x1f;
            palette[offset + 1] = 0x00;
        }
        {
            let oam = gba.bus().oam_mut();
            // attr0: y=80, 8bpp, square shape; attr1: x=120, size=16x16
            oam[0] = 80;
            oam[1] = 0x20;
            oam[2] = 120;
            oam[3] = 0x40;
        }

        gba.step_frame(0);

        let expected = bgr555_to_rgb565(0x001f);
        let backdrop = bgr555_to_rgb565(0);
        let framebuffer = gba.bus().framebuffer();
        for y in 0..160 {
            for x in 0..240 {
                let pixel = framebuffer[y * 240 + x];
                let inside = (120..136).contains(&x) && (80..96).contains(&y);
                if inside {
                    assert_eq!(pixel, expected, "expected sprite color at ({x}, {y})");
                } else {
                    assert_eq!(pixel, backdrop, "expected backdrop outside sprite at ({x}, {y})");
                }
            }
        }
    }
}
