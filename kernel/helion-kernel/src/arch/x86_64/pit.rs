//! 8254 PIT channel-2 one-shot busy waits.
//!
//! Channel 2 is gated through port 0x61 bit 0 and raises port 0x61 bit 5
//! when its countdown expires, which makes it usable as a polled one-shot
//! reference without taking an interrupt. The LAPIC timer calibration
//! busy-waits on it.

use crate::arch::x86_64::instructions::Port;

/// PIT input clock in Hz.
const PIT_INPUT_HZ: u32 = 1_193_182;

/// Channel 2 data port.
const PIT_CH2_DATA: u16 = 0x42;

/// Mode/command register.
const PIT_COMMAND: u16 = 0x43;

/// NMI status/control: gate (bit 0), speaker (bit 1), OUT2 state (bit 5).
const PORT_61: u16 = 0x61;

/// Channel 2, lobyte/hibyte, mode 0 (interrupt on terminal count).
const CH2_ONE_SHOT: u8 = 0xB0;

/// Busy-waits roughly 10 ms using a channel-2 one-shot.
///
/// # Safety
///
/// Reprograms PIT channel 2 and the port 0x61 gate; the caller must not
/// rely on either concurrently.
pub unsafe fn busy_wait_10ms() {
    let divisor = (PIT_INPUT_HZ / 100) as u16;

    let port61 = Port::<u8>::new(PORT_61);
    let command = Port::<u8>::new(PIT_COMMAND);
    let data = Port::<u8>::new(PIT_CH2_DATA);

    // SAFETY: PIT and port 0x61 accesses per the function contract.
    unsafe {
        // Gate on, speaker off.
        let gate = port61.read();
        port61.write((gate & !0x02) | 0x01);

        // Program the one-shot.
        command.write(CH2_ONE_SHOT);
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);

        // Wait for OUT2 to go high.
        while port61.read() & 0x20 == 0 {
            core::hint::spin_loop();
        }
    }
}

/// Busy-waits `ms` milliseconds in 10 ms chunks.
///
/// # Safety
///
/// Same contract as [`busy_wait_10ms`].
pub unsafe fn busy_wait_ms(ms: u32) {
    let chunks = ms.div_ceil(10);
    for _ in 0..chunks {
        // SAFETY: forwarded contract.
        unsafe { busy_wait_10ms() };
    }
}
