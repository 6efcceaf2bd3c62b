//! PPU (Picture Processing Unit): the per-scanline background/object
//! renderer and layer compositor.
//!
//! Unlike the CPU or the DMA engine, the PPU does not own the memory
//! it reads: palette RAM, VRAM and OAM stay with the [`crate::bus::Bus`],
//! and `render_scanline` borrows them for the duration of a single
//! call. The PPU itself only holds its own register file
//! and the handful of per-frame accumulators (the BG2/BG3 affine
//! reference points) that outlive a single scanline.

use std::io::Cursor;

use crate::bus::BusComponent;
use crate::color::bgr555_to_rgb565;
use crate::consts::{
    BG0CNT_ADDR, BG0HOFS_ADDR, BG2PA_ADDR, BG2X_ADDR, BG2Y_ADDR, BG3PA_ADDR, BG3X_ADDR,
    BG3Y_ADDR, BLDALPHA_ADDR, BLDCNT_ADDR, BLDY_ADDR, DISPCNT_ADDR, DISPSTAT_ADDR, MOSAIC_ADDR,
    PPU_REG_SPAN, VCOUNT_ADDR, WIN0H_ADDR, WININ_ADDR, WINOUT_ADDR,
};
use crate::interrupts::{Interrupts, IrqSource};
use crate::state::StateComponent;
use crate::warnln;
use oxidegba_common::error::Error;

/// Visible screen dimensions, also the size of a [`Ppu::framebuffer`]
/// frame in pixels.
pub const SCREEN_WIDTH: usize = 240;
pub const SCREEN_HEIGHT: usize = 160;
pub const FRAME_BUFFER_SIZE: usize = SCREEN_WIDTH * SCREEN_HEIGHT;

const OAM_ENTRY_COUNT: usize = 128;
const OAM_ENTRY_SIZE: usize = 8;

/// `(shape, size)` to `(width, height)` in pixels, per the OBJ
/// attribute encoding. `shape == 3` is reserved and never indexed.
const OBJ_DIMENSIONS: [[(u32, u32); 4]; 3] = [
    [(8, 8), (16, 16), (32, 32), (64, 64)],
    [(16, 8), (32, 8), (32, 16), (64, 32)],
    [(8, 16), (8, 32), (16, 32), (32, 64)],
];

fn set_bit(value: u16, bit: u8, set: bool) -> u16 {
    if set {
        value | (1 << bit)
    } else {
        value & !(1 << bit)
    }
}

fn sign_extend28(value: u32) -> i32 {
    ((value << 4) as i32) >> 4
}

#[derive(Debug, Clone, Copy)]
struct BgPixel {
    color555: u16,
    priority: u8,
}

#[derive(Debug, Clone, Copy)]
struct ObjPixel {
    color555: u16,
    priority: u8,
    semi_transparent: bool,
}

pub struct Ppu {
    regs: [u8; PPU_REG_SPAN as usize],

    /// Internal BG2/BG3 affine reference points, latched from
    /// `BGxX`/`BGxY` on write and advanced by `(PC, PD)` after each
    /// rendered scanline. 20.8 fixed point, sign-extended from the
    /// 28-bit register field.
    bg2_x: i32,
    bg2_y: i32,
    bg3_x: i32,
    bg3_y: i32,

    framebuffer: Vec<u16>,
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

impl Ppu {
    pub fn new() -> Self {
        Self {
            regs: [0x00; PPU_REG_SPAN as usize],
            bg2_x: 0,
            bg2_y: 0,
            bg3_x: 0,
            bg3_y: 0,
            framebuffer: vec![0x0000; FRAME_BUFFER_SIZE],
        }
    }

    pub fn reset(&mut self) {
        self.regs = [0x00; PPU_REG_SPAN as usize];
        self.bg2_x = 0;
        self.bg2_y = 0;
        self.bg3_x = 0;
        self.bg3_y = 0;
        self.framebuffer.iter_mut().for_each(|p| *p = 0x0000);
    }

    /// The last rendered frame, row-major, RGB565 (host pixel format).
    pub fn framebuffer(&self) -> &[u16] {
        &self.framebuffer
    }

    fn offset(addr: u32) -> usize {
        (addr - DISPCNT_ADDR) as usize
    }

    fn reg16(&self, addr: u32) -> u16 {
        let o = Self::offset(addr);
        self.regs[o] as u16 | ((self.regs[o + 1] as u16) << 8)
    }

    fn set_reg16(&mut self, addr: u32, value: u16) {
        let o = Self::offset(addr);
        self.regs[o] = value as u8;
        self.regs[o + 1] = (value >> 8) as u8;
    }

    fn reg32(&self, addr: u32) -> u32 {
        self.reg16(addr) as u32 | ((self.reg16(addr + 2) as u32) << 16)
    }

    fn dispcnt(&self) -> u16 {
        self.reg16(DISPCNT_ADDR)
    }

    fn bg_mode(&self) -> u16 {
        self.dispcnt() & 0x07
    }

    fn bg_enabled(&self, index: usize) -> bool {
        self.dispcnt() & (0x0100 << index) != 0
    }

    fn obj_enabled(&self) -> bool {
        self.dispcnt() & 0x1000 != 0
    }

    fn obj_1d_mapping(&self) -> bool {
        self.dispcnt() & 0x0040 != 0
    }

    fn forced_blank(&self) -> bool {
        self.dispcnt() & 0x0080 != 0
    }

    fn window_enabled(&self) -> (bool, bool, bool) {
        let d = self.dispcnt();
        (d & 0x2000 != 0, d & 0x4000 != 0, d & 0x8000 != 0)
    }

    fn bg_cnt(&self, index: usize) -> u16 {
        self.reg16(BG0CNT_ADDR + (index as u32) * 2)
    }

    fn bg_hofs(&self, index: usize) -> u16 {
        self.reg16(BG0HOFS_ADDR + (index as u32) * 4) & 0x01ff
    }

    fn bg_vofs(&self, index: usize) -> u16 {
        self.reg16(BG0HOFS_ADDR + 2 + (index as u32) * 4) & 0x01ff
    }

    fn affine_params(&self, bg: usize) -> (i16, i16, i16, i16) {
        let base = if bg == 2 { BG2PA_ADDR } else { BG3PA_ADDR };
        (
            self.reg16(base) as i16,
            self.reg16(base + 2) as i16,
            self.reg16(base + 4) as i16,
            self.reg16(base + 6) as i16,
        )
    }

    fn mosaic(&self) -> (u32, u32, u32, u32) {
        let m = self.reg16(MOSAIC_ADDR);
        (
            (m & 0x0f) as u32 + 1,
            ((m >> 4) & 0x0f) as u32 + 1,
            ((m >> 8) & 0x0f) as u32 + 1,
            ((m >> 12) & 0x0f) as u32 + 1,
        )
    }

    fn bldcnt(&self) -> u16 {
        self.reg16(BLDCNT_ADDR)
    }

    fn bldalpha(&self) -> (u32, u32) {
        let v = self.reg16(BLDALPHA_ADDR);
        ((v & 0x1f).min(16) as u32, ((v >> 8) & 0x1f).min(16) as u32)
    }

    fn bldy(&self) -> u32 {
        (self.reg16(BLDY_ADDR) & 0x1f).min(16) as u32
    }

    /// Sets VCOUNT and recomputes the V/H-blank and VCount-match
    /// DISPSTAT flags, raising whichever interrupts just became due.
    /// Called once per scanline by the frame driver, before that
    /// scanline's CPU slice runs.
    pub fn update_vcount(&mut self, scanline: u8, interrupts: &mut Interrupts) {
        self.regs[Self::offset(VCOUNT_ADDR)] = scanline;

        let mut dispstat = self.reg16(DISPSTAT_ADDR);
        let vblank = scanline >= 160 && scanline != 227;
        let vcount_target = (dispstat >> 8) as u8;
        let vcount_match = scanline == vcount_target;

        dispstat = set_bit(dispstat, 0, vblank);
        dispstat = set_bit(dispstat, 1, true);
        dispstat = set_bit(dispstat, 2, vcount_match);
        self.set_reg16(DISPSTAT_ADDR, dispstat);

        if scanline == 160 && dispstat & 0x0008 != 0 {
            interrupts.raise(IrqSource::VBlank);
        }
        if scanline < 160 && dispstat & 0x0010 != 0 {
            interrupts.raise(IrqSource::HBlank);
        }
        if vcount_match && dispstat & 0x0020 != 0 {
            interrupts.raise(IrqSource::VCount);
        }
    }

    /// Advances the BG2/BG3 affine reference points by `(PC, PD)`,
    /// called once per scanline after rendering it.
    pub fn advance_affine_refs(&mut self) {
        let (_, _, pc2, pd2) = self.affine_params(2);
        let (_, _, pc3, pd3) = self.affine_params(3);
        self.bg2_x = self.bg2_x.wrapping_add(pc2 as i32);
        self.bg2_y = self.bg2_y.wrapping_add(pd2 as i32);
        self.bg3_x = self.bg3_x.wrapping_add(pc3 as i32);
        self.bg3_y = self.bg3_y.wrapping_add(pd3 as i32);
    }

    /// Renders one visible scanline into the framebuffer, compositing
    /// every enabled background and sprite layer in priority order.
    pub fn render_scanline(&mut self, scanline: usize, palette: &[u8], vram: &[u8], oam: &[u8]) {
        let row = &mut self.framebuffer[scanline * SCREEN_WIDTH..(scanline + 1) * SCREEN_WIDTH];

        if self.forced_blank() {
            row.iter_mut().for_each(|p| *p = bgr555_to_rgb565(0x7fff));
            return;
        }

        let mode = self.bg_mode();
        let mut bg_lines: [Option<Vec<Option<BgPixel>>>; 4] = [None, None, None, None];

        match mode {
            0 => {
                for bg in 0..4 {
                    if self.bg_enabled(bg) {
                        bg_lines[bg] = Some(self.render_text_bg(bg, scanline, vram, palette));
                    }
                }
            }
            1 => {
                for bg in 0..2 {
                    if self.bg_enabled(bg) {
                        bg_lines[bg] = Some(self.render_text_bg(bg, scanline, vram, palette));
                    }
                }
                if self.bg_enabled(2) {
                    bg_lines[2] = Some(self.render_affine_bg(2, vram, palette));
                }
            }
            2 => {
                if self.bg_enabled(2) {
                    bg_lines[2] = Some(self.render_affine_bg(2, vram, palette));
                }
                if self.bg_enabled(3) {
                    bg_lines[3] = Some(self.render_affine_bg(3, vram, palette));
                }
            }
            3 => bg_lines[2] = Some(self.render_bitmap_direct(scanline, vram)),
            4 => bg_lines[2] = Some(self.render_bitmap_indexed(scanline, vram, palette)),
            5 => bg_lines[2] = Some(self.render_bitmap_small(scanline, vram, palette)),
            other => warnln!("Unsupported BG mode {}, rendering backdrop only", other),
        }

        let (obj_line, obj_window) = if self.obj_enabled() {
            self.render_objects(scanline, vram, oam, palette)
        } else {
            (vec![None; SCREEN_WIDTH], vec![false; SCREEN_WIDTH])
        };

        let backdrop = self.read_color(palette, 0);
        let bldcnt = self.bldcnt();
        let blend_mode = (bldcnt >> 6) & 0x03;
        let (win0_enabled, win1_enabled, winobj_enabled) = self.window_enabled();
        let any_window = win0_enabled || win1_enabled || winobj_enabled;

        for x in 0..SCREEN_WIDTH {
            let window = if any_window {
                Some(self.window_masks_at(x, scanline, win0_enabled, win1_enabled, winobj_enabled, obj_window[x]))
            } else {
                None
            };

            let mut candidates: Vec<(u8, u8, u16, bool)> = Vec::with_capacity(5);
            for bg in 0..4 {
                if let Some(allowed) = window.as_ref() {
                    if !allowed.bg[bg] {
                        continue;
                    }
                }
                if let Some(Some(pixel)) = bg_lines[bg].as_ref().map(|line| line[x]) {
                    candidates.push((pixel.priority, bg as u8, pixel.color555, false));
                }
            }
            let obj_allowed = window.as_ref().map(|w| w.obj).unwrap_or(true);
            if obj_allowed {
                if let Some(pixel) = obj_line[x] {
                    candidates.push((pixel.priority, 4, pixel.color555, pixel.semi_transparent));
                }
            }
            candidates.sort_by_key(|&(priority, kind, _, _)| (priority, if kind == 4 { 0u8 } else { 1u8 }, kind));

            let effects_allowed = window.as_ref().map(|w| w.effects).unwrap_or(true);
            let top = candidates.first().copied();
            let final_color = match top {
                None => backdrop,
                Some((_, kind, color, semi)) if effects_allowed && blend_mode != 0 => {
                    let is_first_target = semi || (bldcnt & (1 << kind) != 0);
                    if blend_mode == 1 && is_first_target {
                        let second = candidates.get(1).copied();
                        match second {
                            Some((_, skind, scolor, _)) if bldcnt & (0x100 << skind) != 0 => {
                                let (eva, evb) = self.bldalpha();
                                blend_alpha(color, scolor, eva, evb)
                            }
                            _ => color,
                        }
                    } else if blend_mode == 2 && is_first_target {
                        blend_toward(color, 0x7fff, self.bldy())
                    } else if blend_mode == 3 && is_first_target {
                        blend_toward(color, 0x0000, self.bldy())
                    } else {
                        color
                    }
                }
                Some((_, _, color, _)) => color,
            };

            row[x] = bgr555_to_rgb565(final_color);
        }
    }

    fn read_color(&self, palette: &[u8], index: usize) -> u16 {
        let offset = index * 2;
        palette[offset] as u16 | ((palette[offset + 1] as u16) << 8)
    }

    fn render_text_bg(&self, bg: usize, scanline: usize, vram: &[u8], palette: &[u8]) -> Vec<Option<BgPixel>> {
        let cnt = self.bg_cnt(bg);
        let priority = (cnt & 0x03) as u8;
        let char_base = ((cnt >> 2) & 0x03) as usize * 0x4000;
        let screen_base = ((cnt >> 8) & 0x1f) as usize * 0x0800;
        let bpp8 = cnt & 0x0080 != 0;
        let size = (cnt >> 14) & 0x03;
        let (map_w, map_h) = match size {
            0 => (256u32, 256u32),
            1 => (512, 256),
            2 => (256, 512),
            _ => (512, 512),
        };

        let hofs = self.bg_hofs(bg) as u32;
        let vofs = self.bg_vofs(bg) as u32;
        let mosaic_on = cnt & 0x0040 != 0;
        let (mosaic_h, mosaic_v) = if mosaic_on {
            let (h, v, _, _) = self.mosaic();
            (h, v)
        } else {
            (1, 1)
        };
        let mosaic_scanline = (scanline as u32 / mosaic_v) * mosaic_v;
        let y = (mosaic_scanline + vofs) % map_h;

        let mut out = Vec::with_capacity(SCREEN_WIDTH);
        for screen_x in 0..SCREEN_WIDTH as u32 {
            let mosaic_x = (screen_x / mosaic_h) * mosaic_h;
            let x = (mosaic_x + hofs) % map_w;

            let block_x = x / 256;
            let block_y = y / 256;
            let block_index = match size {
                0 => 0,
                1 => block_x,
                2 => block_y,
                _ => block_y * 2 + block_x,
            };
            let (tile_x, tile_y) = (x % 256 / 8, y % 256 / 8);
            let entry_addr = screen_base
                + block_index as usize * 0x0800
                + (tile_y as usize * 32 + tile_x as usize) * 2;
            let entry = vram[entry_addr] as u16 | ((vram[entry_addr + 1] as u16) << 8);

            let tile_num = entry & 0x03ff;
            let hflip = entry & 0x0400 != 0;
            let vflip = entry & 0x0800 != 0;
            let palette_bank = ((entry >> 12) & 0x0f) as usize;

            let (px, py) = (x % 8, y % 8);
            let px = if hflip { 7 - px } else { px };
            let py = if vflip { 7 - py } else { py };

            let color_index = if bpp8 {
                let tile_addr = char_base + tile_num as usize * 64 + (py * 8 + px) as usize;
                vram.get(tile_addr).copied().unwrap_or(0) as usize
            } else {
                let tile_addr = char_base + tile_num as usize * 32 + (py * 4 + px / 2) as usize;
                let byte = vram.get(tile_addr).copied().unwrap_or(0);
                let nibble = if px % 2 == 0 { byte & 0x0f } else { byte >> 4 };
                if nibble == 0 {
                    0
                } else {
                    palette_bank * 16 + nibble as usize
                }
            };

            out.push(if color_index == 0 {
                None
            } else {
                Some(BgPixel {
                    color555: self.read_color(palette, color_index),
                    priority,
                })
            });
        }
        out
    }

    fn render_affine_bg(&self, bg: usize, vram: &[u8], palette: &[u8]) -> Vec<Option<BgPixel>> {
        let cnt = self.bg_cnt(bg);
        let priority = (cnt & 0x03) as u8;
        let char_base = ((cnt >> 2) & 0x03) as usize * 0x4000;
        let screen_base = ((cnt >> 8) & 0x1f) as usize * 0x0800;
        let size_sel = (cnt >> 14) & 0x03;
        let map_size: i32 = match size_sel {
            0 => 128,
            1 => 256,
            2 => 512,
            _ => 1024,
        };
        let wrap = cnt & 0x2000 != 0;

        let (pa, pb, pc, pd) = self.affine_params(bg);
        let (mut x, mut y) = if bg == 2 {
            (self.bg2_x, self.bg2_y)
        } else {
            (self.bg3_x, self.bg3_y)
        };

        let tiles_per_row = (map_size / 8) as u32;
        let mut out = Vec::with_capacity(SCREEN_WIDTH);
        for _ in 0..SCREEN_WIDTH {
            let (mut tx, mut ty) = (x >> 8, y >> 8);
            let mut visible = true;
            if wrap {
                tx = tx.rem_euclid(map_size);
                ty = ty.rem_euclid(map_size);
            } else if tx < 0 || ty < 0 || tx >= map_size || ty >= map_size {
                visible = false;
            }

            if !visible {
                out.push(None);
            } else {
                let (tile_x, tile_y) = ((tx / 8) as u32, (ty / 8) as u32);
                let (px, py) = ((tx % 8) as u32, (ty % 8) as u32);
                let tile_entry_addr = screen_base + (tile_y * tiles_per_row + tile_x) as usize;
                let tile_num = vram.get(tile_entry_addr).copied().unwrap_or(0) as usize;
                let tile_addr = char_base + tile_num * 64 + (py * 8 + px) as usize;
                let color_index = vram.get(tile_addr).copied().unwrap_or(0) as usize;
                out.push(if color_index == 0 {
                    None
                } else {
                    Some(BgPixel { color555: self.read_color(palette, color_index), priority })
                });
            }

            x = x.wrapping_add(pa as i32);
            y = y.wrapping_add(pb as i32);
        }
        out
    }

    fn render_bitmap_direct(&self, scanline: usize, vram: &[u8]) -> Vec<Option<BgPixel>> {
        let base = scanline * SCREEN_WIDTH * 2;
        (0..SCREEN_WIDTH)
            .map(|x| {
                let addr = base + x * 2;
                let color = vram.get(addr).copied().unwrap_or(0) as u16
                    | ((vram.get(addr + 1).copied().unwrap_or(0) as u16) << 8);
                Some(BgPixel { color555: color, priority: 0 })
            })
            .collect()
    }

    fn render_bitmap_indexed(&self, scanline: usize, vram: &[u8], palette: &[u8]) -> Vec<Option<BgPixel>> {
        let page = if self.dispcnt() & 0x0010 != 0 { 0xa000 } else { 0 };
        let base = page + scanline * SCREEN_WIDTH;
        (0..SCREEN_WIDTH)
            .map(|x| {
                let index = vram.get(base + x).copied().unwrap_or(0) as usize;
                if index == 0 {
                    None
                } else {
                    Some(BgPixel { color555: self.read_color(palette, index), priority: 0 })
                }
            })
            .collect()
    }

    fn render_bitmap_small(&self, scanline: usize, vram: &[u8], palette: &[u8]) -> Vec<Option<BgPixel>> {
        const MODE5_WIDTH: usize = 160;
        const MODE5_HEIGHT: usize = 128;
        let page = if self.dispcnt() & 0x0010 != 0 { 0xa000 } else { 0 };
        if scanline >= MODE5_HEIGHT {
            return vec![None; SCREEN_WIDTH];
        }
        let base = page + scanline * MODE5_WIDTH * 2;
        (0..SCREEN_WIDTH)
            .map(|x| {
                if x >= MODE5_WIDTH {
                    return None;
                }
                let addr = base + x * 2;
                let color = vram.get(addr).copied().unwrap_or(0) as u16
                    | ((vram.get(addr + 1).copied().unwrap_or(0) as u16) << 8);
                let _ = palette;
                Some(BgPixel { color555: color, priority: 0 })
            })
            .collect()
    }

    /// Returns, per screen column, the topmost visible sprite pixel and
    /// whether that column is inside an OBJ-window sprite's footprint.
    fn render_objects(
        &self,
        scanline: usize,
        vram: &[u8],
        oam: &[u8],
        palette: &[u8],
    ) -> (Vec<Option<ObjPixel>>, Vec<bool>) {
        let mut line: Vec<Option<ObjPixel>> = vec![None; SCREEN_WIDTH];
        let mut window = vec![false; SCREEN_WIDTH];
        let obj_1d = self.obj_1d_mapping();

        // later entries draw underneath earlier ones within the same
        // priority class, so entries are visited in reverse OAM order
        for entry in (0..OAM_ENTRY_COUNT).rev() {
            let base = entry * OAM_ENTRY_SIZE;
            let attr0 = oam[base] as u16 | ((oam[base + 1] as u16) << 8);
            let attr1 = oam[base + 2] as u16 | ((oam[base + 3] as u16) << 8);
            let attr2 = oam[base + 4] as u16 | ((oam[base + 5] as u16) << 8);

            let affine = attr0 & 0x0100 != 0;
            let disabled = !affine && attr0 & 0x0200 != 0;
            if disabled {
                continue;
            }
            let obj_mode = (attr0 >> 10) & 0x03;
            if obj_mode == 3 {
                continue;
            }
            let shape = (attr0 >> 14) & 0x03;
            if shape == 3 || affine {
                // affine (rotated/scaled) sprites are not rendered
                continue;
            }
            let size = (attr1 >> 14) & 0x03;
            let (width, height) = OBJ_DIMENSIONS[shape as usize][size as usize];

            let y = attr0 & 0xff;
            let sprite_y = wrapping_obj_coord(y, 256);
            let row = wrap_delta(scanline as i32, sprite_y, 256);
            if row < 0 || row as u32 >= height {
                continue;
            }

            let x_raw = attr1 & 0x01ff;
            let sprite_x = wrapping_obj_coord(x_raw, 512);

            let hflip = attr1 & 0x1000 != 0;
            let vflip = attr1 & 0x2000 != 0;
            let priority = ((attr2 >> 10) & 0x03) as u8;
            let bpp8 = attr0 & 0x2000 != 0;
            let tile_num = (attr2 & 0x03ff) as usize;
            let palette_bank = ((attr2 >> 12) & 0x0f) as usize;

            let sprite_row = if vflip { height - 1 - row as u32 } else { row as u32 };
            let tiles_wide = width / 8;

            for col in 0..width {
                let screen_x = (sprite_x as i32 + col as i32).rem_euclid(512);
                if screen_x >= SCREEN_WIDTH as i32 {
                    continue;
                }

                let sprite_col = if hflip { width - 1 - col } else { col };
                let (tile_x, tile_y) = (sprite_col / 8, sprite_row / 8);
                let (px, py) = (sprite_col % 8, sprite_row % 8);

                let tile_index = if obj_1d {
                    tile_num + (tile_y * tiles_wide + tile_x) as usize * if bpp8 { 2 } else { 1 }
                } else {
                    tile_num + (tile_y * 32 + tile_x) as usize
                };

                let obj_tile_base = 0x10000;
                let color_index = if bpp8 {
                    let addr = obj_tile_base + tile_index * 64 + (py * 8 + px) as usize;
                    vram.get(addr).copied().unwrap_or(0) as usize
                } else {
                    let addr = obj_tile_base + tile_index * 32 + (py * 4 + px / 2) as usize;
                    let byte = vram.get(addr).copied().unwrap_or(0);
                    let nibble = if px % 2 == 0 { byte & 0x0f } else { byte >> 4 };
                    if nibble == 0 { 0 } else { palette_bank * 16 + nibble as usize }
                };

                if color_index == 0 {
                    continue;
                }

                let x = screen_x as usize;
                if obj_mode == 2 {
                    window[x] = true;
                    continue;
                }

                let palette_index = 0x100 + color_index;
                let color555 = self.read_color(palette, palette_index);
                // Entries are visited in reverse OAM order (127 down to
                // 0) so that on a priority tie the lower-index entry,
                // processed last, wins and sits on top, matching
                // hardware's OAM-index tie-break.
                let existing_priority = line[x].map(|p| p.priority);
                if existing_priority.is_none() || existing_priority.unwrap() >= priority {
                    line[x] = Some(ObjPixel {
                        color555,
                        priority,
                        semi_transparent: obj_mode == 1,
                    });
                }
            }
        }

        (line, window)
    }

    fn window_masks_at(
        &self,
        x: usize,
        scanline: usize,
        win0: bool,
        win1: bool,
        winobj: bool,
        in_obj_window: bool,
    ) -> WindowMask {
        if win0 {
            if let Some(mask) = self.window_rect_mask(WIN0H_ADDR, 0, x, scanline) {
                return mask;
            }
        }
        if win1 {
            if let Some(mask) = self.window_rect_mask(WIN0H_ADDR + 2, 1, x, scanline) {
                return mask;
            }
        }
        if winobj && in_obj_window {
            let winout = self.reg16(WINOUT_ADDR);
            return WindowMask::from_bits(winout >> 8);
        }
        if win0 || win1 || winobj {
            let winout = self.reg16(WINOUT_ADDR);
            return WindowMask::from_bits(winout);
        }
        WindowMask::all()
    }

    fn window_rect_mask(&self, h_addr: u32, index: u32, x: usize, scanline: usize) -> Option<WindowMask> {
        let h = self.reg16(h_addr);
        let v = self.reg16(WIN0H_ADDR + 4 + index * 2);
        let (x1, x2) = ((h >> 8) as usize, (h & 0xff) as usize);
        let (y1, y2) = ((v >> 8) as usize, (v & 0xff) as usize);

        let x_in = if x2 > SCREEN_WIDTH || x2 <= x1 { x >= x1 } else { x >= x1 && x < x2 };
        let y_in = if y2 > SCREEN_HEIGHT || y2 <= y1 { scanline >= y1 } else { scanline >= y1 && scanline < y2 };

        if x_in && y_in {
            let winin = self.reg16(WININ_ADDR);
            let bits = if index == 0 { winin } else { winin >> 8 };
            Some(WindowMask::from_bits(bits))
        } else {
            None
        }
    }
}

struct WindowMask {
    bg: [bool; 4],
    obj: bool,
    effects: bool,
}

impl WindowMask {
    fn from_bits(bits: u16) -> Self {
        Self {
            bg: [bits & 1 != 0, bits & 2 != 0, bits & 4 != 0, bits & 8 != 0],
            obj: bits & 0x10 != 0,
            effects: bits & 0x20 != 0,
        }
    }

    fn all() -> Self {
        Self { bg: [true; 4], obj: true, effects: true }
    }
}

fn blend_alpha(top: u16, bottom: u16, eva: u32, evb: u32) -> u16 {
    let blend_channel = |shift: u32| {
        let t = ((top >> shift) & 0x1f) as u32;
        let b = ((bottom >> shift) & 0x1f) as u32;
        (((t * eva + b * evb) >> 4).min(31)) as u16
    };
    blend_channel(0) | (blend_channel(5) << 5) | (blend_channel(10) << 10)
}

fn blend_toward(color: u16, target: u16, evy: u32) -> u16 {
    let blend_channel = |shift: u32| {
        let c = ((color >> shift) & 0x1f) as i32;
        let t = ((target >> shift) & 0x1f) as i32;
        (c + ((t - c) * evy as i32) / 16).clamp(0, 31) as u16
    };
    blend_channel(0) | (blend_channel(5) << 5) | (blend_channel(10) << 10)
}

fn wrapping_obj_coord(raw: u16, modulus: u32) -> u32 {
    raw as u32 % modulus
}

fn wrap_delta(scanline: i32, sprite_origin: u32, modulus: i32) -> i32 {
    let mut delta = scanline - sprite_origin as i32;
    if delta < 0 {
        delta += modulus;
    }
    if delta >= modulus {
        delta -= modulus;
    }
    delta
}

impl BusComponent for Ppu {
    fn read(&self, addr: u32) -> u8 {
        let o = Self::offset(addr);
        if o >= self.regs.len() {
            warnln!("Reading from unmapped PPU register 0x{:08x}", addr);
            return 0x00;
        }
        if addr == VCOUNT_ADDR + 1 {
            0x00
        } else {
            self.regs[o]
        }
    }

    fn write(&mut self, addr: u32, value: u8) {
        let o = Self::offset(addr);
        if o >= self.regs.len() {
            warnln!("Writing to unmapped PPU register 0x{:08x}", addr);
            return;
        }
        if addr != VCOUNT_ADDR && addr != VCOUNT_ADDR + 1 {
            self.regs[o] = value;
        }

        // writes to the low byte of BGxX/BGxY latch the internal
        // affine reference immediately; the high byte (of the 4-byte
        // register) arrives in a following write, so re-latch on every
        // byte to keep it simple and always consistent once all 4
        // bytes have landed.
        if (BG2X_ADDR..BG2X_ADDR + 4).contains(&addr) {
            self.bg2_x = sign_extend28(self.reg32(BG2X_ADDR));
        } else if (BG2Y_ADDR..BG2Y_ADDR + 4).contains(&addr) {
            self.bg2_y = sign_extend28(self.reg32(BG2Y_ADDR));
        } else if (BG3X_ADDR..BG3X_ADDR + 4).contains(&addr) {
            self.bg3_x = sign_extend28(self.reg32(BG3X_ADDR));
        } else if (BG3Y_ADDR..BG3Y_ADDR + 4).contains(&addr) {
            self.bg3_y = sign_extend28(self.reg32(BG3Y_ADDR));
        }
    }
}

impl StateComponent for Ppu {
    fn save(&self, buffer: &mut Vec<u8>) {
        self.regs.to_vec().save(buffer);
        (self.bg2_x as u32).save(buffer);
        (self.bg2_y as u32).save(buffer);
        (self.bg3_x as u32).save(buffer);
        (self.bg3_y as u32).save(buffer);
    }

    fn load(&mut self, cursor: &mut Cursor<&[u8]>) -> Result<(), Error> {
        let mut regs = Vec::new();
        regs.load(cursor)?;
        let len = regs.len().min(self.regs.len());
        self.regs[..len].copy_from_slice(&regs[..len]);

        let mut raw = 0u32;
        raw.load(cursor)?;
        self.bg2_x = raw as i32;
        raw.load(cursor)?;
        self.bg2_y = raw as i32;
        raw.load(cursor)?;
        self.bg3_x = raw as i32;
        raw.load(cursor)?;
        self.bg3_y = raw as i32;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_palette_color(palette: &mut [u8], index: usize, color555: u16) {
        palette[index * 2] = color555 as u8;
        palette[index * 2 + 1] = (color555 >> 8) as u8;
    }

    #[test]
    fn test_bitmap_mode3_identity() {
        let mut ppu = Ppu::new();
        ppu.write(DISPCNT_ADDR, 0x03); // mode 3, BG2 not even required for this direct path
        let mut vram = vec![0u8; 0x18000];
        vram[0] = 0x1f;
        vram[1] = 0x00; // pure red BGR555 at (0,0)
        let palette = vec![0u8; 0x400];
        let oam = vec![0u8; 0x400];

        ppu.render_scanline(0, &palette, &vram, &oam);
        assert_eq!(ppu.framebuffer()[0], bgr555_to_rgb565(0x001f));
    }

    #[test]
    fn test_forced_blank_is_white() {
        let mut ppu = Ppu::new();
        ppu.write(DISPCNT_ADDR, 0x80);
        let palette = vec![0u8; 0x400];
        let vram = vec![0u8; 0x18000];
        let oam = vec![0u8; 0x400];

        ppu.render_scanline(0, &palette, &vram, &oam);
        assert_eq!(ppu.framebuffer()[0], bgr555_to_rgb565(0x7fff));
    }

    #[test]
    fn test_vblank_irq_on_rising_edge_only() {
        let mut ppu = Ppu::new();
        ppu.write(DISPSTAT_ADDR, 0x08); // VBlank IRQ enable
        let mut interrupts = Interrupts::new();

        ppu.update_vcount(159, &mut interrupts);
        assert!(!interrupts.pending() && interrupts.iflag() == 0);

        ppu.update_vcount(160, &mut interrupts);
        assert_ne!(interrupts.iflag() & (1 << IrqSource::VBlank as u16), 0);
    }

    #[test]
    fn test_alpha_blend_midpoint() {
        let blended = blend_alpha(0x001f, 0x7c00, 8, 8);
        // half red, half blue -> roughly mid grey-purple per channel
        assert_eq!(blended & 0x1f, 15);
        assert_eq!((blended >> 10) & 0x1f, 15);
    }

    #[test]
    fn test_text_mode_first_tile_color() {
        let mut ppu = Ppu::new();
        ppu.write16(DISPCNT_ADDR, 0x0100); // mode 0, BG0 enabled

        let mut vram = vec![0u8; 0x18000];
        // screen entry 0 at the default screen base (0x0000) points at tile 1
        vram[0] = 0x01;
        vram[1] = 0x00;
        // tile 1, 4bpp, row 0: every pixel is palette index 1
        let tile_addr = 0x20; // char base 0 + tile 1 * 32 bytes
        for b in vram[tile_addr..tile_addr + 4].iter_mut() {
            *b = 0x11;
        }

        let mut palette = vec![0u8; 0x400];
        write_palette_color(&mut palette, 1, 0x03e0); // pure green
        let oam = vec![0u8; 0x400];

        ppu.render_scanline(0, &palette, &vram, &oam);
        assert_eq!(ppu.framebuffer()[0], bgr555_to_rgb565(0x03e0));
    }
}
