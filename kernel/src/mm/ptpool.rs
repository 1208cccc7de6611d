//! Page-table pool.
//!
//! One 1024-entry page directory per process. Kernel-range directory
//! entries all point into a single shared identity map (one page table
//! per directory slot, living in the low flat-RAM pages), so every
//! process resolves kernel addresses identically and those tables are
//! never freed. User-range entries own page tables drawn from the frame
//! allocator; `unmap_page` clears the leaf entry but keeps the table
//! (pool semantics).

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::{boxed::Box, vec::Vec};

use bitflags::bitflags;

use super::{FlatMem, FrameAlloc, IDPMAP_BASE_PAGE, MmError};
use crate::config::{NUM_PROC, PDIR_ENTRIES, VM_USERHI_PDE, VM_USERLO_PDE};

bitflags! {
    /// x86 page-table entry permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtePerm: u32 {
        /// Present.
        const P = 1 << 0;
        /// Writable.
        const W = 1 << 1;
        /// User-accessible.
        const U = 1 << 2;
        /// Global.
        const G = 1 << 8;
    }
}

impl PtePerm {
    /// Permissions of page-table pages and kernel-range directory
    /// entries.
    pub const PTU: Self = Self::P.union(Self::W).union(Self::U);
    /// Permissions of the kernel identity mappings.
    pub const KERN: Self = Self::P.union(Self::W).union(Self::G);
}

/// Mask selecting the frame number of an entry.
const PTE_FRAME_MASK: u32 = !0xfff;

/// A page directory; entries encode `frame << 12 | perm`.
type PageDir = [u32; PDIR_ENTRIES];

/// The pool of per-process page directories plus the shared identity map.
pub struct PtPool {
    pdirs: Vec<Box<PageDir>>,
    current: Option<usize>,
}

impl PtPool {
    pub fn new() -> Self {
        let mut pdirs = Vec::with_capacity(NUM_PROC);
        for _ in 0..NUM_PROC {
            pdirs.push(Box::new([0u32; PDIR_ENTRIES]));
        }
        Self {
            pdirs,
            current: None,
        }
    }

    /// Populate the shared identity map for every kernel-range directory
    /// slot. Called once at world construction.
    pub fn init_kernel_range(&mut self, flat: &mut FlatMem) {
        for pde in (0..VM_USERLO_PDE).chain(VM_USERHI_PDE..PDIR_ENTRIES) {
            let pt_page = IDPMAP_BASE_PAGE + pde as u32;
            for ptx in 0..PDIR_ENTRIES as u32 {
                let frame = pde as u32 * PDIR_ENTRIES as u32 + ptx;
                flat.fstore(
                    pt_page * PDIR_ENTRIES as u32 + ptx,
                    (frame << 12) | PtePerm::KERN.bits(),
                );
            }
        }
    }

    /// Initialize the page directory of `pid`: user range cleared, kernel
    /// range wired to the shared identity map.
    pub fn pdir_init(&mut self, pid: usize) {
        let pdir = &mut self.pdirs[pid];
        pdir.fill(0);
        for pde in (0..VM_USERLO_PDE).chain(VM_USERHI_PDE..PDIR_ENTRIES) {
            pdir[pde] = ((IDPMAP_BASE_PAGE + pde as u32) << 12) | PtePerm::PTU.bits();
        }
        self.current = self.current.filter(|&c| c != pid);
    }

    /// Point directory entry `pde` of `pid` at the shared identity map.
    pub fn set_pde(&mut self, pid: usize, pde: usize) {
        self.pdirs[pid][pde] = ((IDPMAP_BASE_PAGE + pde as u32) << 12) | PtePerm::PTU.bits();
    }

    /// Point directory entry `pde` of `pid` at the process-owned page
    /// table living in flat-RAM page `pt_page`.
    pub fn set_pde_user(&mut self, pid: usize, pde: usize, pt_page: u32) {
        self.pdirs[pid][pde] = (pt_page << 12) | PtePerm::PTU.bits();
    }

    /// Clear directory entry `pde` of `pid`.
    pub fn rmv_pde(&mut self, pid: usize, pde: usize) {
        self.pdirs[pid][pde] = 0;
    }

    /// Raw directory entry.
    pub fn get_pde(&self, pid: usize, pde: usize) -> u32 {
        self.pdirs[pid][pde]
    }

    /// Raw leaf entry for `vaddr`, or zero when no table is mapped.
    pub fn get_pte(&self, flat: &FlatMem, pid: usize, vaddr: u32) -> u32 {
        let pde = self.pdirs[pid][(vaddr >> 22) as usize];
        if pde & PtePerm::P.bits() == 0 {
            return 0;
        }
        let pt_page = pde >> 12;
        flat.fload(pt_page * PDIR_ENTRIES as u32 + ((vaddr >> 12) & 0x3ff))
    }

    fn set_pte(&self, flat: &mut FlatMem, pde: u32, vaddr: u32, value: u32) {
        let pt_page = pde >> 12;
        flat.fstore(pt_page * PDIR_ENTRIES as u32 + ((vaddr >> 12) & 0x3ff), value);
    }

    /// Map flat-RAM page `page` at user address `vaddr` for `pid`,
    /// creating the page table on demand.
    pub fn map_page(
        &mut self,
        flat: &mut FlatMem,
        frames: &mut dyn FrameAlloc,
        pid: usize,
        vaddr: u32,
        page: u32,
        perm: PtePerm,
    ) -> Result<(), MmError> {
        let pdx = (vaddr >> 22) as usize;
        if !(VM_USERLO_PDE..VM_USERHI_PDE).contains(&pdx) {
            return Err(MmError::BadVaddr);
        }
        if self.pdirs[pid][pdx] & PtePerm::P.bits() == 0 {
            let pt_page = frames.alloc_frame().ok_or(MmError::NoMem)?;
            flat.zero_page(pt_page);
            self.set_pde_user(pid, pdx, pt_page);
        }
        let pde = self.pdirs[pid][pdx];
        self.set_pte(flat, pde, vaddr, (page << 12) | perm.bits());
        Ok(())
    }

    /// Clear the mapping of `vaddr` for `pid`. The page-table page is not
    /// returned to the allocator.
    pub fn unmap_page(&mut self, flat: &mut FlatMem, pid: usize, vaddr: u32) -> Result<(), MmError> {
        let pdx = (vaddr >> 22) as usize;
        if !(VM_USERLO_PDE..VM_USERHI_PDE).contains(&pdx) {
            return Err(MmError::BadVaddr);
        }
        let pde = self.pdirs[pid][pdx];
        if pde & PtePerm::P.bits() != 0 {
            self.set_pte(flat, pde, vaddr, 0);
        }
        Ok(())
    }

    /// Resolve `vaddr` for `pid`. Kernel-range addresses resolve to the
    /// identity mapping; user-range addresses walk the process tables.
    pub fn resolve(&self, flat: &FlatMem, pid: usize, vaddr: u32) -> Option<(u32, PtePerm)> {
        let pdx = (vaddr >> 22) as usize;
        if !(VM_USERLO_PDE..VM_USERHI_PDE).contains(&pdx) {
            return Some((vaddr >> 12, PtePerm::KERN));
        }
        let pte = self.get_pte(flat, pid, vaddr);
        if pte & PtePerm::P.bits() == 0 {
            return None;
        }
        Some((
            (pte & PTE_FRAME_MASK) >> 12,
            PtePerm::from_bits_truncate(pte & !PTE_FRAME_MASK),
        ))
    }

    /// Install the address space of `pid` (CR3 equivalent). Returns the
    /// directory root for the arch layer.
    pub fn install(&mut self, pid: usize) -> usize {
        self.current = Some(pid);
        self.pdirs[pid].as_ptr() as usize
    }

    /// Process whose address space is currently installed.
    pub fn current(&self) -> Option<usize> {
        self.current
    }
}

impl Default for PtPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PAGESIZE, VM_USERLO};
    use crate::mm::{MemoryManager, POOL_BASE_PAGE};

    fn world() -> MemoryManager {
        MemoryManager::new(POOL_BASE_PAGE as usize + 64)
    }

    #[test]
    fn map_then_resolve_round_trips() {
        let mut mm = world();
        mm.pt.pdir_init(1);
        let va = VM_USERLO + 5 * PAGESIZE as u32;
        let perm = PtePerm::P | PtePerm::U | PtePerm::W;
        mm.map_page(1, va, 0x500, perm).unwrap();
        assert_eq!(mm.resolve(1, va), Some((0x500, perm)));

        mm.unmap_page(1, va).unwrap();
        assert_eq!(mm.resolve(1, va), None);
    }

    #[test]
    fn remap_overrides_previous_mapping() {
        let mut mm = world();
        mm.pt.pdir_init(0);
        let va = VM_USERLO;
        mm.map_page(0, va, 0x500, PtePerm::P | PtePerm::U).unwrap();
        mm.map_page(0, va, 0x600, PtePerm::P | PtePerm::U | PtePerm::W)
            .unwrap();
        assert_eq!(
            mm.resolve(0, va),
            Some((0x600, PtePerm::P | PtePerm::U | PtePerm::W))
        );
    }

    #[test]
    fn kernel_range_resolves_identity() {
        let mut mm = world();
        mm.pt.pdir_init(3);
        let va = 0x0010_3000;
        let (frame, perm) = mm.resolve(3, va).unwrap();
        assert_eq!(frame, va >> 12);
        assert!(perm.contains(PtePerm::G));

        // The identity map is shared: the backing words are the same for
        // every process.
        mm.pt.pdir_init(4);
        assert_eq!(mm.pt.get_pde(3, 0), mm.pt.get_pde(4, 0));
    }

    #[test]
    fn map_page_reports_allocator_exhaustion() {
        let mut mm = MemoryManager::new(POOL_BASE_PAGE as usize + 1);
        mm.pt.pdir_init(0);
        // The single pool page is consumed by the first page table.
        mm.map_page(0, VM_USERLO, 1, PtePerm::P | PtePerm::U).unwrap();
        // A second directory slot needs a fresh table and must fail.
        let far = VM_USERLO + 4 * 1024 * PAGESIZE as u32;
        assert_eq!(
            mm.map_page(0, far, 2, PtePerm::P | PtePerm::U),
            Err(MmError::NoMem)
        );
    }

    #[test]
    fn kernel_addresses_are_rejected_for_mapping() {
        let mut mm = world();
        mm.pt.pdir_init(0);
        assert_eq!(
            mm.map_page(0, 0x1000, 1, PtePerm::P | PtePerm::U),
            Err(MmError::BadVaddr)
        );
    }

    #[test]
    fn shared_frame_is_visible_through_both_mappings() {
        let mut mm = world();
        mm.pt.pdir_init(1);
        mm.pt.pdir_init(2);
        let perm = PtePerm::P | PtePerm::U | PtePerm::W;
        let frame = mm.frames.alloc_frame().unwrap();
        mm.map_page(1, VM_USERLO, frame, perm).unwrap();
        mm.map_page(2, VM_USERLO + PAGESIZE as u32, frame, perm).unwrap();

        let (f1, _) = mm.resolve(1, VM_USERLO).unwrap();
        let (f2, _) = mm.resolve(2, VM_USERLO + PAGESIZE as u32).unwrap();
        assert_eq!(f1, f2);

        // A store through one mapping is observed through the other.
        mm.flat.fstore(f1 * 1024, 0xfeed_f00d);
        assert_eq!(mm.flat.fload(f2 * 1024), 0xfeed_f00d);
    }
}
