//! Intel 8253/8254 Programmable Interval Timer: the clock-pulse source
//! [`crate::timer::report_clock_pulse`] needs before preemption (C9) or any
//! sleep deadline (C6) can ever fire on real hardware.
//!
//! Grounded on `original_source/kernel/arch/i686/drivers/pit.c`.

use crate::io_port::IoPort;

const CHANNEL_0: u16 = 0x40;
const CMD_REGISTER: u16 = 0x43;

const SELECT_CHANNEL_0: u8 = 0x00;
const MODE_SQUARE_WAVE: u8 = 0x06;
const HI_LO_ACCESS_MODE: u8 = 0x30;

const BASE_FREQUENCY: u32 = 1_193_182;
const DEFAULT_FREQUENCY: u32 = 1000;
const MAX_FREQUENCY: u32 = BASE_FREQUENCY;
const MIN_FREQUENCY: u32 = (BASE_FREQUENCY / 0x10000) + 1;

/// Nanosecond period of the channel-0 square wave at whatever frequency
/// [`set_frequency`] last programmed. Read by the IRQ0 top half to report
/// the pulse.
static mut PERIOD_NS: u64 = 1_000_000_000 / DEFAULT_FREQUENCY as u64;

/// Programs channel 0's reload value for the given frequency. Returns
/// `false` and leaves the PIT untouched if `freq` is out of range.
pub fn set_frequency(freq: u32) -> bool {
    if !(MIN_FREQUENCY..=MAX_FREQUENCY).contains(&freq) {
        return false;
    }

    let mut reload_value = (BASE_FREQUENCY + freq / 2) / freq;
    if reload_value == 0x10000 {
        reload_value = 0x0000;
    }

    IoPort::write_u8(CHANNEL_0, (reload_value & 0xff) as u8);
    IoPort::write_u8(CHANNEL_0, ((reload_value >> 8) & 0xff) as u8);

    unsafe { PERIOD_NS = 1_000_000_000 / freq as u64 };
    true
}

/// Selects channel 0, square-wave mode, and programs the default 1kHz rate.
pub fn init() {
    IoPort::write_u8(CMD_REGISTER, SELECT_CHANNEL_0 | HI_LO_ACCESS_MODE | MODE_SQUARE_WAVE);
    let ok = set_frequency(DEFAULT_FREQUENCY);
    debug_assert!(ok, "pit: default frequency must be in range");
}

/// Nanosecond period of the currently programmed square wave.
pub fn period_ns() -> u64 {
    unsafe { PERIOD_NS }
}
