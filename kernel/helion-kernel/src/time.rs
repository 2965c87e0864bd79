//! Kernel time: millisecond ticks from the LAPIC timer.

use crate::arch::x86_64::instructions::hlt;
use crate::arch::x86_64::platform;

/// Milliseconds since the LAPIC timer started.
pub fn uptime_ms() -> u64 {
    platform::timer_ticks()
}

/// Sleeps for at least `ms` milliseconds.
///
/// Cooperative: halts until the next interrupt between tick checks, so the
/// CPU idles instead of spinning. Requires interrupts enabled and the
/// timer running.
pub fn sleep_ms(ms: u64) {
    let deadline = platform::timer_ticks() + ms;
    while platform::timer_ticks() < deadline {
        hlt();
    }
}
