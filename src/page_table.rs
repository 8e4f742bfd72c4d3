//! Stage 1 page table access for lifting write protection on AArch64.
//!
//! AArch64 has no global write-protect switch. The table lives in read-only
//! kernel data, so the protection state is the leaf descriptor that maps the
//! table's page, and lifting protection clears its AP read-only bit.

use axerrno::AxResult;

use crate::guard::ProtectionControl;

/// AArch64 Stage 1 page table entry bits
mod pte_bits {
    /// Access Permission bit [7] - 0=RW, 1=RO
    pub const AP_RO_BIT: u64 = 1 << 7;
    /// Valid bit
    pub const VALID: u64 = 1 << 0;
    /// Table/Block bit
    pub const TABLE: u64 = 1 << 1;
    /// Address mask for next-level table or output address
    pub const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;
}

#[inline]
fn phys_to_virt(paddr: u64) -> usize {
    axhal::mem::phys_to_virt((paddr as usize).into()).as_usize()
}

/// Stage 1 page table root (physical address) from TTBR0_EL2.
fn page_table_root_phys() -> u64 {
    let ttbr: u64;
    unsafe {
        core::arch::asm!(
            "mrs {}, ttbr0_el2",
            out(reg) ttbr,
            options(nostack, preserves_flags)
        );
    }
    ttbr & pte_bits::ADDR_MASK
}

/// Walk the 4-level table down to the descriptor mapping `vaddr`.
///
/// Block descriptors at L1 (1GB) and L2 (2MB) are returned as-is.
unsafe fn walk_page_table(vaddr: usize) -> Option<*mut u64> {
    use pte_bits::*;

    let root_phys = page_table_root_phys();
    if root_phys == 0 {
        log::error!("page_table: TTBR0_EL2 is null");
        return None;
    }

    let indices = [
        (vaddr >> 39) & 0x1FF,
        (vaddr >> 30) & 0x1FF,
        (vaddr >> 21) & 0x1FF,
        (vaddr >> 12) & 0x1FF,
    ];

    let mut table = phys_to_virt(root_phys) as *mut u64;
    for (level, idx) in indices.iter().enumerate() {
        let entry_ptr = unsafe { table.add(*idx) };
        let entry = unsafe { core::ptr::read_volatile(entry_ptr) };
        log::trace!("page_table: L{}[{}] = {:#x}", level, idx, entry);

        if entry & VALID == 0 {
            log::error!("page_table: L{} entry invalid for {:#x}", level, vaddr);
            return None;
        }
        if level == 3 || (level > 0 && entry & TABLE == 0) {
            return Some(entry_ptr);
        }
        table = phys_to_virt(entry & ADDR_MASK) as *mut u64;
    }
    None
}

/// Flush TLB for all entries at EL2.
fn flush_tlb() {
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi alle2is",
            "dsb ish",
            "isb",
            options(nostack, preserves_flags)
        );
    }
}

/// Write protection through the descriptor mapping the guarded address.
#[derive(Debug, Default, Clone, Copy)]
pub struct PteProtection;

impl ProtectionControl for PteProtection {
    fn read(&self, addr: usize) -> AxResult<usize> {
        match unsafe { walk_page_table(addr) } {
            Some(pte) => Ok(unsafe { core::ptr::read_volatile(pte) } as usize),
            None => axerrno::ax_err!(NotFound, "no page table entry maps the table"),
        }
    }

    fn write(&self, addr: usize, state: usize) -> AxResult<()> {
        let Some(pte) = (unsafe { walk_page_table(addr) }) else {
            return axerrno::ax_err!(NotFound, "no page table entry maps the table");
        };

        unsafe {
            if core::ptr::read_volatile(pte) != state as u64 {
                core::ptr::write_volatile(pte, state as u64);
                log::trace!("page_table: PTE for {:#x} set to {:#x}", addr, state);
            }
        }
        flush_tlb();
        Ok(())
    }

    fn writable(&self, state: usize) -> usize {
        state & !(pte_bits::AP_RO_BIT as usize)
    }
}
