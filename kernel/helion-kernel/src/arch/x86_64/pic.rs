//! Legacy 8259 PIC: remap out of the exception range, then mask.
//!
//! The kernel runs on the APICs; the PIC is only initialized far enough to
//! park it. The timer line must stay masked once the LAPIC timer runs, or
//! IRQ0 fires twice per tick.

use crate::arch::x86_64::instructions::Port;

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

/// ICW1: initialize, ICW4 follows.
const ICW1_INIT: u8 = 0x11;
/// ICW4: 8086 mode.
const ICW4_8086: u8 = 0x01;

/// Remaps the PICs to vectors 32-47 and masks every line.
///
/// # Safety
///
/// Must be called once, with interrupts disabled.
pub unsafe fn remap_and_disable() {
    let pic1_cmd = Port::<u8>::new(PIC1_CMD);
    let pic1_data = Port::<u8>::new(PIC1_DATA);
    let pic2_cmd = Port::<u8>::new(PIC2_CMD);
    let pic2_data = Port::<u8>::new(PIC2_DATA);

    // SAFETY: the 8259 init sequence writes only PIC ports.
    unsafe {
        // ICW1: start the init sequence on both PICs.
        pic1_cmd.write(ICW1_INIT);
        io_wait();
        pic2_cmd.write(ICW1_INIT);
        io_wait();

        // ICW2: vector offsets 32 (master) and 40 (slave).
        pic1_data.write(32);
        io_wait();
        pic2_data.write(40);
        io_wait();

        // ICW3: slave on IRQ2, cascade identity 2.
        pic1_data.write(4);
        io_wait();
        pic2_data.write(2);
        io_wait();

        // ICW4: 8086 mode.
        pic1_data.write(ICW4_8086);
        io_wait();
        pic2_data.write(ICW4_8086);
        io_wait();

        // Mask everything.
        pic1_data.write(0xFF);
        pic2_data.write(0xFF);
    }
}

/// Masks the PIC timer line (IRQ0).
///
/// Idempotent; called again after LAPIC timer start so a BIOS that
/// re-enabled the line cannot double-deliver timer ticks.
pub fn mask_timer() {
    let pic1_data = Port::<u8>::new(PIC1_DATA);
    // SAFETY: read-modify-write of the PIC mask register.
    unsafe {
        let mask = pic1_data.read();
        pic1_data.write(mask | 0x01);
    }
}

/// Small I/O delay via the POST diagnostic port.
#[inline]
fn io_wait() {
    let port = Port::<u8>::new(0x80);
    // SAFETY: writing 0 to port 0x80 is harmless.
    unsafe { port.write(0) };
}
