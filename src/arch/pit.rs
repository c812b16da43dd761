//! 8253/8254 Programmable Interval Timer — periodic preemption tick.
//!
//! Grounded on the reference kernel's `pit.c`: channel 0, mode 3 (square
//! wave), reload value derived from the requested period in milliseconds
//! against PIT's fixed 1.193182 MHz input clock.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::cpu::{inb, outb};

const PORT_CMD: u16 = 0x0043;
const PORT_CH0_DATA: u16 = 0x0040;

const REG_CH0: u8 = 0 << 6;
const REG_BOTH_BYTES: u8 = 3 << 4;
const REG_SQUARE_WAVE: u8 = 3 << 1;

const BASE_FREQ_KHZ: u32 = 1193;

/// Milliseconds between timer IRQs.
pub const PERIOD_MS: u8 = 10;

static TICKS_MS: AtomicU64 = AtomicU64::new(0);

/// Programs channel 0 for a `period_ms`-millisecond square wave.
///
/// # Panics
/// If the computed reload value does not fit in 16 bits.
pub fn init(period_ms: u8) {
    let reload = BASE_FREQ_KHZ * period_ms as u32;
    assert!(reload <= 0xFFFF, "pit: reload value {reload} too large for period {period_ms}ms");

    unsafe {
        outb(PORT_CMD, REG_SQUARE_WAVE | REG_BOTH_BYTES | REG_CH0);
        outb(PORT_CH0_DATA, reload as u8);
        outb(PORT_CH0_DATA, (reload >> 8) as u8);
    }
}

/// Returns the number of milliseconds elapsed since `init`, as tracked by
/// the IRQ handler's tick counter.
pub fn counter_ms() -> u64 {
    TICKS_MS.load(Ordering::Relaxed)
}

/// Called from the timer IRQ handler after EOI. Advances the tick
/// counter; the caller is responsible for invoking the scheduler.
pub fn on_tick() {
    TICKS_MS.fetch_add(PERIOD_MS as u64, Ordering::Relaxed);
}

/// Busy-waits approximately `ms` milliseconds by polling the tick
/// counter. Used only during early boot, before the scheduler can
/// usefully `sleep_ms` (e.g. between SMP trampoline IPIs).
pub fn delay_ms(ms: u64) {
    let start = counter_ms();
    while counter_ms() - start < ms {
        core::hint::spin_loop();
    }
}
