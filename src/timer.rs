//! The four independent 16-bit timer/counter units.
//!
//! Each unit free-runs at one of four fixed prescalers (1/64/256/1024
//! cycles per tick) or, when its cascade bit is set, increments once
//! per overflow of the timer below it instead of from the system
//! clock. Overflow reloads the counter from `TMxCNT_L`'s latched
//! value and optionally raises an interrupt.

use std::io::Cursor;

use oxidegba_common::error::Error;

use crate::bus::BusComponent;
use crate::consts::{TIMER_UNIT_COUNT, TIMER_UNIT_STRIDE, TM0CNT_L_ADDR};
use crate::interrupts::{IrqSource, Interrupts};
use crate::state::StateComponent;
use crate::warnln;

const PRESCALERS: [u32; 4] = [1, 64, 256, 1024];

#[derive(Debug, Default, Clone, Copy)]
struct TimerUnit {
    reload: u16,
    counter: u16,
    prescaler_sel: u8,
    cascade: bool,
    irq_enable: bool,
    enabled: bool,
    accumulator: u32,
}

impl TimerUnit {
    fn prescaler(&self) -> u32 {
        PRESCALERS[(self.prescaler_sel & 0x03) as usize]
    }

    /// Advances a free-running (non-cascade) unit by `cycles` system
    /// clocks, returns whether it overflowed (possibly more than
    /// once, though the caller only needs to know "at least once" to
    /// chain a cascade and raise one interrupt per call).
    fn clock(&mut self, cycles: u32) -> bool {
        if !self.enabled || self.cascade {
            return false;
        }
        self.accumulator += cycles;
        let step = self.prescaler();
        let mut overflowed = false;
        while self.accumulator >= step {
            self.accumulator -= step;
            overflowed |= self.increment();
        }
        overflowed
    }

    /// Advances a cascade unit by a single count, invoked once per
    /// overflow observed on the timer immediately below it.
    fn tick_cascade(&mut self) -> bool {
        if !self.enabled || !self.cascade {
            return false;
        }
        self.increment()
    }

    fn increment(&mut self) -> bool {
        if self.counter == 0xffff {
            self.counter = self.reload;
            true
        } else {
            self.counter = self.counter.wrapping_add(1);
            false
        }
    }

    fn cnt_h(&self) -> u16 {
        self.prescaler_sel as u16
            | if self.cascade { 0x04 } else { 0 }
            | if self.irq_enable { 0x40 } else { 0 }
            | if self.enabled { 0x80 } else { 0 }
    }

    fn set_cnt_h(&mut self, value: u16) {
        let was_enabled = self.enabled;
        self.prescaler_sel = (value & 0x03) as u8;
        self.cascade = value & 0x04 != 0;
        self.irq_enable = value & 0x40 != 0;
        self.enabled = value & 0x80 != 0;
        // a 0->1 transition on the enable bit reloads the counter and
        // restarts the prescaler, matching the hardware start-up rule
        if self.enabled && !was_enabled {
            self.counter = self.reload;
            self.accumulator = 0;
        }
    }
}

#[derive(Debug, Default)]
pub struct Timer {
    units: [TimerUnit; TIMER_UNIT_COUNT],
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.units = [TimerUnit::default(); TIMER_UNIT_COUNT];
    }

    /// Advances all four units by `cycles` and raises any interrupts
    /// their overflow triggers, chaining cascade units in index order
    /// (0 feeds 1, 1 feeds 2, 2 feeds 3) within the same call.
    pub fn clock(&mut self, cycles: u32, interrupts: &mut Interrupts) {
        let mut carry = false;
        for (index, unit) in self.units.iter_mut().enumerate() {
            let overflowed = if unit.cascade {
                if carry {
                    unit.tick_cascade()
                } else {
                    false
                }
            } else {
                unit.clock(cycles)
            };
            if overflowed && unit.irq_enable {
                interrupts.raise(irq_for_index(index));
            }
            carry = overflowed;
        }
    }

    pub fn counter(&self, index: usize) -> u16 {
        self.units[index].counter
    }
}

fn irq_for_index(index: usize) -> IrqSource {
    match index {
        0 => IrqSource::Timer0,
        1 => IrqSource::Timer1,
        2 => IrqSource::Timer2,
        _ => IrqSource::Timer3,
    }
}

fn unit_for_addr(addr: u32) -> Option<(usize, u32)> {
    if addr < TM0CNT_L_ADDR {
        return None;
    }
    let offset = addr - TM0CNT_L_ADDR;
    let index = (offset / TIMER_UNIT_STRIDE) as usize;
    if index >= TIMER_UNIT_COUNT {
        return None;
    }
    Some((index, offset % TIMER_UNIT_STRIDE))
}

impl BusComponent for Timer {
    fn read(&self, addr: u32) -> u8 {
        let Some((index, local)) = unit_for_addr(addr) else {
            warnln!("Reading from unknown Timer location 0x{:08x}", addr);
            return 0x00;
        };
        let unit = &self.units[index];
        match local {
            0 => unit.counter as u8,
            1 => (unit.counter >> 8) as u8,
            2 => unit.cnt_h() as u8,
            3 => (unit.cnt_h() >> 8) as u8,
            _ => 0x00,
        }
    }

    fn write(&mut self, addr: u32, value: u8) {
        let Some((index, local)) = unit_for_addr(addr) else {
            warnln!("Writing to unknown Timer location 0x{:08x}", addr);
            return;
        };
        let unit = &mut self.units[index];
        match local {
            0 => unit.reload = (unit.reload & 0xff00) | value as u16,
            1 => unit.reload = (unit.reload & 0x00ff) | ((value as u16) << 8),
            2 => {
                let cnt_h = (unit.cnt_h() & 0xff00) | value as u16;
                unit.set_cnt_h(cnt_h);
            }
            3 => {
                let cnt_h = (unit.cnt_h() & 0x00ff) | ((value as u16) << 8);
                unit.set_cnt_h(cnt_h);
            }
            _ => {}
        }
    }
}

impl StateComponent for TimerUnit {
    fn save(&self, buffer: &mut Vec<u8>) {
        self.reload.save(buffer);
        self.counter.save(buffer);
        self.prescaler_sel.save(buffer);
        self.cascade.save(buffer);
        self.irq_enable.save(buffer);
        self.enabled.save(buffer);
        self.accumulator.save(buffer);
    }

    fn load(&mut self, cursor: &mut Cursor<&[u8]>) -> Result<(), Error> {
        self.reload.load(cursor)?;
        self.counter.load(cursor)?;
        self.prescaler_sel.load(cursor)?;
        self.cascade.load(cursor)?;
        self.irq_enable.load(cursor)?;
        self.enabled.load(cursor)?;
        self.accumulator.load(cursor)?;
        Ok(())
    }
}

impl StateComponent for Timer {
    fn save(&self, buffer: &mut Vec<u8>) {
        for unit in &self.units {
            unit.save(buffer);
        }
    }

    fn load(&mut self, cursor: &mut Cursor<&[u8]>) -> Result<(), Error> {
        for unit in &mut self.units {
            unit.load(cursor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_running_overflow_reloads() {
        let mut timer = Timer::new();
        let mut irq = Interrupts::new();
        timer.units[0].reload = 0xfffe;
        timer.units[0].set_cnt_h(0x80); // enabled, prescaler /1

        timer.clock(1, &mut irq);
        assert_eq!(timer.counter(0), 0xffff);
        timer.clock(1, &mut irq);
        assert_eq!(timer.counter(0), 0xfffe, "should reload from TMxCNT_L");
    }

    #[test]
    fn test_cascade_increments_on_overflow_only() {
        let mut timer = Timer::new();
        let mut irq = Interrupts::new();
        timer.units[0].reload = 0xffff;
        timer.units[0].set_cnt_h(0x80); // overflows every cycle
        timer.units[1].set_cnt_h(0x84); // enabled, cascade

        timer.clock(1, &mut irq);
        assert_eq!(timer.counter(1), 1, "timer 1 ticks once per timer 0 overflow");
    }
}
