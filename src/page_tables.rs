// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The guest's 4-level x86-64 paging hierarchy (PML4 → PDPT → PD → PT),
//! built inside a single contiguous guest-physical arena.
//!
//! Entry layouts mirror the bitfields in the original `xhype` source's
//! `paging.h` (`PML4E`, `PDPTE_1GB`, `PDPTE`, `PDE_2MB`, `PDE`, `PTE`), kept
//! here as typed integer newtypes via the `bitfield` crate rather than as
//! reinterpreted packed-struct memory, the way
//! `tandasat-Hypervisor-101-in-Rust`'s `NestedPagingStructureEntry` does for
//! its own nested paging structure.

use bitfield::bitfield;
use thiserror::Error;

const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
const WORDS_PER_PAGE: usize = (PAGE_SIZE / 8) as usize;

const ONE_GB_SHIFT: u32 = 30;
const TWO_MB_SHIFT: u32 = 21;

bitfield! {
    /// PML4E / non-leaf PDPTE / non-leaf PDE: points at the next table down.
    #[derive(Clone, Copy)]
    pub struct TableEntry(u64);
    impl Debug;
    pub present, set_present: 0;
    pub rw, set_rw: 1;
    u64, next_table_frame, set_next_table_frame: 51, 12;
}

bitfield! {
    /// PDPTE_1GB: a 1 GiB leaf.
    #[derive(Clone, Copy)]
    pub struct Pdpte1Gb(u64);
    impl Debug;
    pub present, set_present: 0;
    pub rw, set_rw: 1;
    pub page_size, set_page_size: 7;
    u64, page_frame, set_page_frame: 51, 30;
}

bitfield! {
    /// PDE_2MB: a 2 MiB leaf.
    #[derive(Clone, Copy)]
    pub struct Pde2Mb(u64);
    impl Debug;
    pub present, set_present: 0;
    pub rw, set_rw: 1;
    pub page_size, set_page_size: 7;
    u64, page_frame, set_page_frame: 51, 21;
}

bitfield! {
    /// PTE: a 4 KiB leaf.
    #[derive(Clone, Copy)]
    pub struct Pte(u64);
    impl Debug;
    pub present, set_present: 0;
    pub rw, set_rw: 1;
    u64, page_frame, set_page_frame: 51, 12;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size1Gb,
    Size2Mb,
    Size4Kb,
}

impl PageSize {
    pub fn bytes(self) -> u64 {
        match self {
            PageSize::Size1Gb => 1 << ONE_GB_SHIFT,
            PageSize::Size2Mb => 1 << TWO_MB_SHIFT,
            PageSize::Size4Kb => PAGE_SIZE,
        }
    }

    /// Classifies a region by the joint alignment of its start and size,
    /// largest page size first.
    pub fn classify(host_start: u64, size: u64) -> PageSize {
        let one_gb = 1u64 << ONE_GB_SHIFT;
        let two_mb = 1u64 << TWO_MB_SHIFT;
        if host_start % one_gb == 0 && size % one_gb == 0 {
            PageSize::Size1Gb
        } else if host_start % two_mb == 0 && size % two_mb == 0 {
            PageSize::Size2Mb
        } else {
            PageSize::Size4Kb
        }
    }
}

fn pml4_index(v: u64) -> usize {
    ((v >> 39) & 0x1ff) as usize
}
fn pdpt_index(v: u64) -> usize {
    ((v >> 30) & 0x1ff) as usize
}
fn pd_index(v: u64) -> usize {
    ((v >> 21) & 0x1ff) as usize
}
fn pt_index(v: u64) -> usize {
    ((v >> 12) & 0x1ff) as usize
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("guest paging arena exhausted: {requested} pages needed, {available} available")]
    ArenaExhausted { requested: usize, available: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A contiguous guest-physical arena holding the page-table tree. Frame 0
/// (the arena's first page) is always deterministically the root PML4.
pub struct PageTables {
    words: Vec<u64>,
    arena_pages: usize,
    next_free_page: usize,
}

impl PageTables {
    /// Allocates an arena of `arena_pages` 4 KiB pages, all zeroed (every
    /// non-present entry is therefore all-zero).
    pub fn new(arena_pages: usize) -> PageTables {
        // Frame 0 is the PML4; nothing else to do, it starts zeroed.
        PageTables {
            words: vec![0u64; arena_pages * WORDS_PER_PAGE],
            arena_pages,
            next_free_page: 1,
        }
    }

    pub fn arena_pages(&self) -> usize {
        self.arena_pages
    }

    /// Byte length of the whole arena, for mapping it as one `Region`.
    pub fn arena_len(&self) -> u64 {
        (self.arena_pages as u64) * PAGE_SIZE
    }

    pub fn root_frame(&self) -> u64 {
        0
    }

    /// Host-virtual address of the arena's backing storage. Stable for the
    /// lifetime of this `PageTables`: the backing `Vec` is sized once in
    /// [`Self::new`] and never resized afterwards.
    pub fn host_ptr(&self) -> u64 {
        self.words.as_ptr() as u64
    }

    fn alloc_page(&mut self) -> Result<usize> {
        if self.next_free_page >= self.arena_pages {
            return Err(Error::ArenaExhausted {
                requested: self.next_free_page + 1,
                available: self.arena_pages,
            });
        }
        let frame = self.next_free_page;
        self.next_free_page += 1;
        Ok(frame)
    }

    fn page_words(&mut self, frame: usize) -> &mut [u64] {
        let start = frame * WORDS_PER_PAGE;
        &mut self.words[start..start + WORDS_PER_PAGE]
    }

    fn table_entry(&mut self, frame: usize, index: usize) -> TableEntry {
        TableEntry(self.page_words(frame)[index])
    }

    fn set_table_entry(&mut self, frame: usize, index: usize, entry: TableEntry) {
        self.page_words(frame)[index] = entry.0;
    }

    /// Walks from the PML4 root, creating intermediate tables on first
    /// touch, and returns the frame number of the PDPT covering `v`.
    fn walk_to_pdpt(&mut self, v: u64) -> Result<usize> {
        let pml4_idx = pml4_index(v);
        let entry = self.table_entry(0, pml4_idx);
        if entry.present() {
            return Ok(entry.next_table_frame() as usize);
        }
        let frame = self.alloc_page()?;
        let mut e = TableEntry(0);
        e.set_present(true);
        e.set_rw(true);
        e.set_next_table_frame(frame as u64);
        self.set_table_entry(0, pml4_idx, e);
        Ok(frame)
    }

    /// Walks from a PDPT frame to the PD covering `v` (only valid when the
    /// PDPT entry is a non-leaf table entry, i.e. this region isn't 1 GiB
    /// mapped at that slot).
    fn walk_to_pd(&mut self, pdpt_frame: usize, v: u64) -> Result<usize> {
        let pdpt_idx = pdpt_index(v);
        let entry = self.table_entry(pdpt_frame, pdpt_idx);
        if entry.present() {
            return Ok(entry.next_table_frame() as usize);
        }
        let frame = self.alloc_page()?;
        let mut e = TableEntry(0);
        e.set_present(true);
        e.set_rw(true);
        e.set_next_table_frame(frame as u64);
        self.set_table_entry(pdpt_frame, pdpt_idx, e);
        Ok(frame)
    }

    fn walk_to_pt(&mut self, pd_frame: usize, v: u64) -> Result<usize> {
        let pd_idx = pd_index(v);
        let entry = self.table_entry(pd_frame, pd_idx);
        if entry.present() {
            return Ok(entry.next_table_frame() as usize);
        }
        let frame = self.alloc_page()?;
        let mut e = TableEntry(0);
        e.set_present(true);
        e.set_rw(true);
        e.set_next_table_frame(frame as u64);
        self.set_table_entry(pd_frame, pd_idx, e);
        Ok(frame)
    }

    /// Installs a single leaf mapping linear address `v` to guest-physical
    /// `guest_phys`, at the given page size. `v` and `guest_phys` must
    /// already be aligned to `size`.
    pub fn insert(&mut self, v: u64, guest_phys: u64, size: PageSize) -> Result<()> {
        debug_assert_eq!(v % size.bytes(), 0);
        debug_assert_eq!(guest_phys % size.bytes(), 0);

        match size {
            PageSize::Size1Gb => {
                let pdpt_frame = self.walk_to_pdpt(v)?;
                let pdpt_idx = pdpt_index(v);
                let mut e = Pdpte1Gb(0);
                e.set_present(true);
                e.set_rw(true);
                e.set_page_size(true);
                e.set_page_frame(guest_phys >> ONE_GB_SHIFT);
                self.page_words(pdpt_frame)[pdpt_idx] = e.0;
            }
            PageSize::Size2Mb => {
                let pdpt_frame = self.walk_to_pdpt(v)?;
                let pd_frame = self.walk_to_pd(pdpt_frame, v)?;
                let pd_idx = pd_index(v);
                let mut e = Pde2Mb(0);
                e.set_present(true);
                e.set_rw(true);
                e.set_page_size(true);
                e.set_page_frame(guest_phys >> TWO_MB_SHIFT);
                self.page_words(pd_frame)[pd_idx] = e.0;
            }
            PageSize::Size4Kb => {
                let pdpt_frame = self.walk_to_pdpt(v)?;
                let pd_frame = self.walk_to_pd(pdpt_frame, v)?;
                let pt_frame = self.walk_to_pt(pd_frame, v)?;
                let pt_idx = pt_index(v);
                let mut e = Pte(0);
                e.set_present(true);
                e.set_rw(true);
                e.set_page_frame(guest_phys >> PAGE_SHIFT);
                self.page_words(pt_frame)[pt_idx] = e.0;
            }
        }
        Ok(())
    }

    /// Walks the tree from the root with `v` as the linear address and
    /// returns the guest-physical address it resolves to, or `None` if no
    /// mapping covers it. Used to verify the identity invariant in tests.
    pub fn translate(&self, v: u64) -> Option<u64> {
        let pml4_idx = pml4_index(v);
        let pml4e = TableEntry(self.words[pml4_idx]);
        if !pml4e.present() {
            return None;
        }
        let pdpt_frame = pml4e.next_table_frame() as usize;
        let pdpt_idx = pdpt_index(v);
        let pdpt_word = self.words[pdpt_frame * WORDS_PER_PAGE + pdpt_idx];
        let pdpte_1gb = Pdpte1Gb(pdpt_word);
        if pdpte_1gb.present() && pdpte_1gb.page_size() {
            let base = pdpte_1gb.page_frame() << ONE_GB_SHIFT;
            return Some(base | (v & ((1 << ONE_GB_SHIFT) - 1)));
        }
        let pdpte = TableEntry(pdpt_word);
        if !pdpte.present() {
            return None;
        }
        let pd_frame = pdpte.next_table_frame() as usize;
        let pd_idx = pd_index(v);
        let pd_word = self.words[pd_frame * WORDS_PER_PAGE + pd_idx];
        let pde_2mb = Pde2Mb(pd_word);
        if pde_2mb.present() && pde_2mb.page_size() {
            let base = pde_2mb.page_frame() << TWO_MB_SHIFT;
            return Some(base | (v & ((1 << TWO_MB_SHIFT) - 1)));
        }
        let pde = TableEntry(pd_word);
        if !pde.present() {
            return None;
        }
        let pt_frame = pde.next_table_frame() as usize;
        let pt_idx = pt_index(v);
        let pt_word = self.words[pt_frame * WORDS_PER_PAGE + pt_idx];
        let pte = Pte(pt_word);
        if !pte.present() {
            return None;
        }
        let base = pte.page_frame() << PAGE_SHIFT;
        Some(base | (v & (PAGE_SIZE - 1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_mapping_round_trips_at_each_page_size() {
        let mut pt = PageTables::new(16);
        pt.insert(0x4000_0000, 0x4000_0000, PageSize::Size1Gb).unwrap();
        pt.insert(0x8020_0000, 0x8020_0000, PageSize::Size2Mb).unwrap();
        pt.insert(0x9000_1000, 0x9000_1000, PageSize::Size4Kb).unwrap();

        assert_eq!(pt.translate(0x4000_0000 + 123), Some(0x4000_0000 + 123));
        assert_eq!(pt.translate(0x8020_0000 + 45), Some(0x8020_0000 + 45));
        assert_eq!(pt.translate(0x9000_1000 + 7), Some(0x9000_1000 + 7));
    }

    #[test]
    fn unmapped_address_has_no_translation() {
        let pt = PageTables::new(4);
        assert_eq!(pt.translate(0x1234_5000), None);
    }

    #[test]
    fn arena_exhaustion_is_reported_not_panicked() {
        let mut pt = PageTables::new(1); // only the PML4 page, no room for a PDPT
        let err = pt.insert(0x9000_1000, 0x9000_1000, PageSize::Size4Kb).unwrap_err();
        assert!(matches!(err, Error::ArenaExhausted { .. }));
    }

    #[test]
    fn classify_picks_largest_page_size_alignment_allows() {
        let one_gb = 1u64 << ONE_GB_SHIFT;
        let two_mb = 1u64 << TWO_MB_SHIFT;
        assert_eq!(PageSize::classify(one_gb, one_gb), PageSize::Size1Gb);
        assert_eq!(PageSize::classify(two_mb, two_mb), PageSize::Size2Mb);
        assert_eq!(PageSize::classify(0x1000, 0x3000), PageSize::Size4Kb);
    }
}
