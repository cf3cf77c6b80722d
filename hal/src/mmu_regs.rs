//! # MMU Control Registers
//!
//! Two register surfaces matter to the core: the control/status
//! register whose PTT-access bit must be set around translation-table
//! mutation, and the memory-control register whose bits the network
//! layer flips during DMA setup.

use core::sync::atomic::{AtomicU16, Ordering};

bitflags::bitflags! {
    /// MMU control/status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmuCsr: u16 {
        /// Translation-table access window open.
        const PTT_ACCESS = 0x0100;
        /// Address translation enabled.
        const TRANSLATE = 0x0001;
    }
}

/// The MMU register file.
#[derive(Debug)]
pub struct MmuRegisters {
    csr: AtomicU16,
    mcr: AtomicU16,
}

impl MmuRegisters {
    /// Registers in their reset state.
    pub const fn new() -> Self {
        Self {
            csr: AtomicU16::new(0),
            mcr: AtomicU16::new(0),
        }
    }

    /// Current control/status bits.
    pub fn csr(&self) -> MmuCsr {
        MmuCsr::from_bits_truncate(self.csr.load(Ordering::Acquire))
    }

    /// Open the PTT access window, returning the previous CSR value
    /// for restoration.
    pub fn open_ptt_access(&self) -> u16 {
        self.csr
            .fetch_or(MmuCsr::PTT_ACCESS.bits(), Ordering::AcqRel)
    }

    /// Restore the CSR to a previously read value.
    pub fn restore_csr(&self, value: u16) {
        self.csr.store(value, Ordering::Release);
    }

    /// Flip one memory-control register bit, returning the new value.
    pub fn mcr_change(&self, bit: u16) -> u16 {
        self.mcr.fetch_xor(1 << (bit & 0xF), Ordering::AcqRel) ^ (1 << (bit & 0xF))
    }

    /// Current MCR value.
    pub fn mcr(&self) -> u16 {
        self.mcr.load(Ordering::Acquire)
    }
}

impl Default for MmuRegisters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ptt_access_window() {
        let regs = MmuRegisters::new();
        let old = regs.open_ptt_access();
        assert!(regs.csr().contains(MmuCsr::PTT_ACCESS));
        regs.restore_csr(old);
        assert!(!regs.csr().contains(MmuCsr::PTT_ACCESS));
    }

    #[test]
    fn test_mcr_change_toggles() {
        let regs = MmuRegisters::new();
        assert_eq!(regs.mcr_change(3), 0x0008);
        assert_eq!(regs.mcr_change(3), 0x0000);
    }
}
