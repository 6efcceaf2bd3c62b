//! Address constants for the memory map and I/O register file.

// region base addresses, see `bus.rs` for the full decode
pub const BIOS_BASE: u32 = 0x0000_0000;
pub const BIOS_SIZE: u32 = 0x0000_4000;
pub const EWRAM_BASE: u32 = 0x0200_0000;
pub const EWRAM_SIZE: u32 = 0x0004_0000;
pub const IWRAM_BASE: u32 = 0x0300_0000;
pub const IWRAM_SIZE: u32 = 0x0000_8000;
pub const IO_BASE: u32 = 0x0400_0000;
pub const IO_SIZE: u32 = 0x0000_0400;
pub const PALETTE_BASE: u32 = 0x0500_0000;
pub const PALETTE_SIZE: u32 = 0x0000_0400;
pub const VRAM_BASE: u32 = 0x0600_0000;
pub const VRAM_SIZE: u32 = 0x0001_8000;
pub const OAM_BASE: u32 = 0x0700_0000;
pub const OAM_SIZE: u32 = 0x0000_0400;
pub const ROM_BASE: u32 = 0x0800_0000;
pub const ROM_MAX_SIZE: u32 = 0x0200_0000;
pub const SRAM_BASE: u32 = 0x0e00_0000;
pub const SRAM_SIZE: u32 = 0x0001_0000;

// display registers
pub const DISPCNT_ADDR: u32 = 0x0400_0000;
pub const DISPSTAT_ADDR: u32 = 0x0400_0004;
pub const VCOUNT_ADDR: u32 = 0x0400_0006;
pub const BG0CNT_ADDR: u32 = 0x0400_0008;
pub const BG1CNT_ADDR: u32 = 0x0400_000a;
pub const BG2CNT_ADDR: u32 = 0x0400_000c;
pub const BG3CNT_ADDR: u32 = 0x0400_000e;
pub const BG0HOFS_ADDR: u32 = 0x0400_0010;
pub const BG0VOFS_ADDR: u32 = 0x0400_0012;
pub const BG1HOFS_ADDR: u32 = 0x0400_0014;
pub const BG1VOFS_ADDR: u32 = 0x0400_0016;
pub const BG2HOFS_ADDR: u32 = 0x0400_0018;
pub const BG2VOFS_ADDR: u32 = 0x0400_001a;
pub const BG3HOFS_ADDR: u32 = 0x0400_001c;
pub const BG3VOFS_ADDR: u32 = 0x0400_001e;
pub const BG2PA_ADDR: u32 = 0x0400_0020;
pub const BG2PB_ADDR: u32 = 0x0400_0022;
pub const BG2PC_ADDR: u32 = 0x0400_0024;
pub const BG2PD_ADDR: u32 = 0x0400_0026;
pub const BG2X_ADDR: u32 = 0x0400_0028;
pub const BG2Y_ADDR: u32 = 0x0400_002c;
pub const BG3PA_ADDR: u32 = 0x0400_0030;
pub const BG3PB_ADDR: u32 = 0x0400_0032;
pub const BG3PC_ADDR: u32 = 0x0400_0034;
pub const BG3PD_ADDR: u32 = 0x0400_0036;
pub const BG3X_ADDR: u32 = 0x0400_0038;
pub const BG3Y_ADDR: u32 = 0x0400_003c;
pub const WIN0H_ADDR: u32 = 0x0400_0040;
pub const WIN1H_ADDR: u32 = 0x0400_0042;
pub const WIN0V_ADDR: u32 = 0x0400_0044;
pub const WIN1V_ADDR: u32 = 0x0400_0046;
pub const WININ_ADDR: u32 = 0x0400_0048;
pub const WINOUT_ADDR: u32 = 0x0400_004a;
pub const MOSAIC_ADDR: u32 = 0x0400_004c;
pub const BLDCNT_ADDR: u32 = 0x0400_0050;
pub const BLDALPHA_ADDR: u32 = 0x0400_0052;
pub const BLDY_ADDR: u32 = 0x0400_0054;
pub const PPU_REG_SPAN: u32 = 0x0000_0056;

// DMA registers, channels 0-3 spaced 0x0c apart
pub const DMA0SAD_ADDR: u32 = 0x0400_00b0;
pub const DMA_CHANNEL_STRIDE: u32 = 0x0c;
pub const DMA_CHANNEL_COUNT: usize = 4;

// timer registers, units 0-3 spaced 0x04 apart
pub const TM0CNT_L_ADDR: u32 = 0x0400_0100;
pub const TIMER_UNIT_STRIDE: u32 = 0x04;
pub const TIMER_UNIT_COUNT: usize = 4;

// interrupt/system registers
pub const KEYINPUT_ADDR: u32 = 0x0400_0130;
pub const KEYCNT_ADDR: u32 = 0x0400_0132;
pub const IE_ADDR: u32 = 0x0400_0200;
pub const IF_ADDR: u32 = 0x0400_0202;
pub const WAITCNT_ADDR: u32 = 0x0400_0204;
pub const IME_ADDR: u32 = 0x0400_0208;

// cartridge GPIO window, mirrored at the top of the ROM address space
pub const GPIO_DATA_ADDR: u32 = 0x080_000c4;
pub const GPIO_DIRECTION_ADDR: u32 = 0x080_000c6;
pub const GPIO_CONTROL_ADDR: u32 = 0x080_000c8;

pub const IRQ_VECTOR: u32 = 0x0000_0018;
pub const RESET_VECTOR: u32 = 0x0000_0000;
pub const SWI_VECTOR: u32 = 0x0000_0008;

/// Offset into EWRAM where the host-driven button mask is mirrored on
/// every `step_frame` call, alongside the active-low `KEYINPUT`
/// register the pad subsystem synthesizes from the same mask.
pub const INPUT_MASK_EWRAM_OFFSET: u32 = 0x0003_cf64;

/// Scanlines per frame and the fixed per-scanline CPU cycle budget the
/// frame driver steps with (280896 cycles per frame / 228 scanlines).
pub const SCANLINES_PER_FRAME: u32 = 228;
pub const VISIBLE_SCANLINES: u32 = 160;
pub const CYCLES_PER_SCANLINE: u32 = 1232;
