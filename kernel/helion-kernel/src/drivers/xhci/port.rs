//! Root hub port reset with bounded polling.

use super::XhciError;
use super::regs::{MmioOps, op, portsc};

/// Maximum PORTSC polls before a reset is declared stuck.
pub const PORT_RESET_SPINS: usize = 10_000;

/// Resets a root hub port (0-based index) and returns the settled PORTSC.
///
/// Sets power + reset with the RW1C change bits masked, then polls until
/// the controller clears PR. The reset-change bit is acknowledged before
/// returning.
pub fn reset_port(op_regs: &impl MmioOps, port: usize) -> Result<u32, XhciError> {
    let offset = op::portsc(port);

    let raw = op_regs.read32(offset);
    op_regs.write32(offset, portsc::rmw(raw) | portsc::PP | portsc::PR);

    for _ in 0..PORT_RESET_SPINS {
        let current = op_regs.read32(offset);
        if current & portsc::PR == 0 {
            // Acknowledge the reset-change bit so the next change is
            // observable.
            op_regs.write32(offset, portsc::rmw(current) | portsc::PRC);
            return Ok(current);
        }
        core::hint::spin_loop();
    }

    Err(XhciError::MmioTimeout)
}

/// Issues a warm reset (USB3 recovery) and polls like [`reset_port`].
pub fn warm_reset_port(op_regs: &impl MmioOps, port: usize) -> Result<u32, XhciError> {
    let offset = op::portsc(port);

    let raw = op_regs.read32(offset);
    op_regs.write32(offset, portsc::rmw(raw) | portsc::PP | portsc::WPR);

    for _ in 0..PORT_RESET_SPINS {
        let current = op_regs.read32(offset);
        if current & (portsc::PR | portsc::WPR) == 0 {
            op_regs.write32(offset, portsc::rmw(current) | portsc::PRC | portsc::WRC);
            return Ok(current);
        }
        core::hint::spin_loop();
    }

    Err(XhciError::MmioTimeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::xhci::regs::testutil::FakeRegs;

    /// PORTSC dword index for port 0 in the fake register file.
    const PORT0: usize = op::portsc(0);

    fn port_regs() -> FakeRegs {
        // Enough dwords to cover the port register sets.
        FakeRegs::new((PORT0 + 0x40) / 4)
    }

    /// Clears PR after a few observations, like hardware finishing the
    /// reset sequence. The last register slot doubles as the poll counter.
    fn auto_clear_pr(regs: &mut Vec<u32>, offset: usize, value: u32) {
        if offset == PORT0 && value & portsc::PR != 0 {
            let counter = regs.len() - 1;
            regs[counter] += 1;
            if regs[counter] >= 3 {
                regs[counter] = 0;
                regs[offset / 4] = (value & !portsc::PR) | portsc::PED | portsc::PRC;
            }
        }
    }

    #[test]
    fn reset_completes_when_pr_clears() {
        let mut regs = port_regs();
        regs.set(PORT0, portsc::CCS);
        regs.read_hook = Some(auto_clear_pr);

        let settled = reset_port(&regs, 0).expect("reset should settle");
        assert_eq!(settled & portsc::PR, 0);
        assert_ne!(settled & portsc::PED, 0, "port enabled after reset");
        assert_ne!(settled & portsc::CCS, 0, "device still connected");
    }

    #[test]
    fn reset_times_out_when_pr_sticks() {
        let regs = port_regs();
        regs.set(PORT0, portsc::CCS);
        // No hook: PR stays set forever once written.
        assert_eq!(reset_port(&regs, 0), Err(XhciError::MmioTimeout));
    }

    #[test]
    fn reset_never_writes_one_to_ped() {
        let mut regs = port_regs();
        // PED and change bits set by "hardware"; writing any of them back
        // as 1 would disable the port or eat a change notification.
        regs.set(PORT0, portsc::CCS | portsc::PED | portsc::CSC);
        regs.read_hook = Some(auto_clear_pr);

        reset_port(&regs, 0).unwrap();
        // The fake stores the last written value verbatim, so a stored PED
        // of 0 proves no write ever carried a 1 in that position. PRC is
        // the deliberate exception (the acknowledge write).
        let last_write = regs.get(PORT0);
        assert_eq!(last_write & portsc::PED, 0);
        assert_eq!(last_write & portsc::CSC, 0);
        assert_ne!(last_write & portsc::PRC, 0);
    }
}
