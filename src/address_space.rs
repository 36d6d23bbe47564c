// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The identity address-space builder: discovers the host process's mapped
//! regions, maps each into guest-physical space through the hypervisor
//! primitive, and drives [`PageTables`] to build a guest paging hierarchy
//! where `guest-linear == guest-physical == host-virtual` for every byte of
//! every region in use.
//!
//! Structurally this is the direct descendant of `identity_map.cpp`'s
//! `setup_identity_map`: classify regions by alignment, map largest-page
//! regions first, drive the page-table insertion for each stride. It
//! diverges from that source in one place, deliberately: the original
//! relocates guest-physical addresses to a separate bump range starting at
//! 1 GiB, while this builder keeps `guest_start == host_start` — true
//! identity, not a shadow range.

use std::ffi::c_void;
use std::ptr::NonNull;

use log::{debug, trace, warn};
use thiserror::Error;

use crate::hv::{HvError, Hypervisor, Protection, Region, RegionSource};
use crate::page_tables::{self, PageSize, PageTables};

#[derive(Debug, Error)]
pub enum Error {
    #[error("host region discovery failed: {0}")]
    Discovery(#[from] std::io::Error),
    #[error("hypervisor call failed while building address space: {0}")]
    Hypervisor(#[from] HvError),
    #[error("guest paging arena exhausted while building address space: {0}")]
    PageTables(#[from] page_tables::Error),
    #[error("host allocation for the {what} failed")]
    HostAlloc { what: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;

/// One identity-mapped region of guest-physical memory backed by a host
/// region of the same size.
#[derive(Debug, Clone, Copy)]
pub struct MappedRegion {
    pub host_start: u64,
    pub size: u64,
    pub guest_start: u64,
    pub protections: Protection,
}

/// Parameters of the dedicated per-vthread stack pool. The pool itself is
/// identity-mapped once, here, alongside
/// every other region; [`crate::facade`] owns the mutable bump pointer that
/// doles out slots from it.
#[derive(Debug, Clone, Copy)]
pub struct StackArena {
    base: u64,
    slot_pages: usize,
    slots: usize,
}

impl StackArena {
    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn slot_bytes(&self) -> u64 {
        (self.slot_pages as u64) * page_tables::PAGE_SIZE
    }

    /// Guest-physical (== host-virtual) address of the top of stack `slot`
    /// uses for its initial RSP (stacks grow down, so the top is the
    /// highest address in the slot).
    pub fn stack_top(&self, slot: usize) -> u64 {
        assert!(slot < self.slots);
        self.base + (slot as u64 + 1) * self.slot_bytes()
    }
}

pub struct AddressSpace {
    pt: PageTables,
    regions: Vec<MappedRegion>,
    stack_arena: StackArena,
    cr3: u64,
}

/// Host allocation big enough to host the arena/stack pool, page-aligned,
/// freed only on process exit (these pools live for the process's
/// lifetime — there is exactly one VM per process).
fn alloc_pages(len: u64, what: &'static str) -> Result<NonNull<c_void>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::HostAlloc { what });
    }
    Ok(NonNull::new(ptr).expect("mmap returned null without MAP_FAILED"))
}

impl AddressSpace {
    /// Builds the one-time, process-wide identity address space: discovers
    /// host regions, reserves and maps the stack-slot arena, builds the
    /// guest paging tree, and maps the tree's own backing memory at
    /// guest-physical 0 so CR3 points there.
    pub fn build(
        hv: &dyn Hypervisor,
        regions: &dyn RegionSource,
        stack_slots: usize,
        stack_pages: usize,
    ) -> Result<AddressSpace> {
        let mut host_regions = regions.regions()?;
        host_regions.retain(|r| r.size > 0);

        let stack_bytes = (stack_slots as u64) * (stack_pages as u64) * page_tables::PAGE_SIZE;
        let stack_host = alloc_pages(stack_bytes, "stack arena")?;
        let stack_region = Region {
            host_start: stack_host.as_ptr() as u64,
            size: stack_bytes,
            protections: Protection::READ | Protection::WRITE,
        };

        let mut all_regions = host_regions;
        all_regions.push(stack_region);

        let arena_pages = estimate_arena_pages(&all_regions);
        let mut pt = PageTables::new(arena_pages);

        let mut mapped = Vec::with_capacity(all_regions.len());
        for class in [PageSize::Size1Gb, PageSize::Size2Mb, PageSize::Size4Kb] {
            for region in &all_regions {
                if PageSize::classify(region.host_start, region.size) != class {
                    continue;
                }
                map_region(hv, &mut pt, region, class)?;
                mapped.push(MappedRegion {
                    host_start: region.host_start,
                    size: region.size,
                    guest_start: region.host_start,
                    protections: region.protections,
                });
            }
        }

        // Map the paging arena's own backing memory at guest-physical 0, the
        // same placement `identity_map.cpp` uses (`hv_vm_map(guest_paging_h,
        // 0, ...)`). This has to be guest-physical 0: a PML4E/PDPTE/PDE's
        // address field is an absolute guest-physical frame number, and
        // `PageTables::insert` stores arena-relative frame indices into it
        // (frame 1, 2, 3, ...) — those two only agree when the arena's own
        // base guest-physical address is 0. No guest-linear identity mapping
        // of the arena's own pages is needed: CR3 and the PML4E/PDPTE/PDE
        // frame fields are guest-physical addresses the hardware table
        // walker dereferences directly through EPT, not guest-linear
        // addresses requiring a leaf of their own.
        let arena_host = pt.host_ptr();
        let arena_len = pt.arena_len();
        hv.vm_map(arena_host as *const c_void, 0, arena_len, Protection::READ | Protection::WRITE)?;
        mapped.sort_by_key(|r| r.guest_start);

        debug!(
            "address space built: {} regions, {} arena pages, cr3=0x0",
            mapped.len(),
            pt.arena_pages(),
        );

        Ok(AddressSpace {
            pt,
            regions: mapped,
            stack_arena: StackArena {
                base: stack_region.host_start,
                slot_pages: stack_pages,
                slots: stack_slots,
            },
            cr3: 0,
        })
    }

    pub fn cr3(&self) -> u64 {
        self.cr3
    }

    pub fn regions(&self) -> &[MappedRegion] {
        &self.regions
    }

    pub fn stack_arena(&self) -> &StackArena {
        &self.stack_arena
    }

    /// Walks the guest paging tree the same way hardware would; exposed so
    /// tests can assert the identity invariant directly against the tree
    /// rather than trusting the bookkeeping in `regions()`.
    pub fn translate(&self, v: u64) -> Option<u64> {
        self.pt.translate(v)
    }
}

fn map_region(
    hv: &dyn Hypervisor,
    pt: &mut PageTables,
    region: &Region,
    class: PageSize,
) -> Result<()> {
    trace!(
        "mapping region host=0x{:x} size=0x{:x} as {:?}",
        region.host_start,
        region.size,
        class
    );
    hv.vm_map(
        region.host_start as *const c_void,
        region.host_start,
        region.size,
        region.protections,
    )?;

    let stride = class.bytes();
    let mut offset = 0u64;
    while offset < region.size {
        let v = region.host_start + offset;
        pt.insert(v, v, class)?;
        offset += stride;
    }
    Ok(())
}

/// Generous heuristic sizing for the arena: one PML4 page, plus a PDPT, PD
/// and PT per region-aligned stride touched, rounded up with headroom. This
/// mirrors the shape of `identity_map.cpp`'s own `estimated_pgs` running
/// total without chasing its exact arithmetic, which assumed the shifted
/// guest-physical scheme this crate does not use.
fn estimate_arena_pages(regions: &[Region]) -> usize {
    let mut pages = 1usize; // PML4
    for region in regions {
        match PageSize::classify(region.host_start, region.size) {
            PageSize::Size1Gb => {
                pages += 1 + (region.size >> 30) as usize;
            }
            PageSize::Size2Mb => {
                pages += 2 + (region.size >> 21) as usize;
            }
            PageSize::Size4Kb => {
                let leaves = (region.size >> 12) as usize;
                pages += 3 + leaves.div_ceil(512) + leaves.div_ceil(512 * 512);
            }
        }
    }
    // Headroom for the arena's own self-mapping pass, which adds its own
    // pages as 4 KiB leaves after this estimate is used to size it.
    pages += pages / 4 + 8;
    if pages == 0 {
        warn!("address space has no regions to map");
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hv::backend::{MockBackend, MockRegionSource};

    #[test]
    fn identity_property_holds_for_every_discovered_region() {
        let hv = MockBackend::new();
        let regions = MockRegionSource(vec![Region {
            host_start: 0x1_0000,
            size: 0x4000,
            protections: Protection::READ | Protection::WRITE,
        }]);
        let space = AddressSpace::build(&hv, &regions, 4, 8).unwrap();

        for k in (0..0x4000).step_by(0x1000) {
            let v = 0x1_0000 + k;
            assert_eq!(space.translate(v), Some(v));
        }
    }

    #[test]
    fn disjoint_regions_produce_disjoint_guest_ranges() {
        let hv = MockBackend::new();
        let regions = MockRegionSource(vec![
            Region {
                host_start: 0x1000,
                size: 0x1000,
                protections: Protection::READ,
            },
            Region {
                host_start: 0x5000,
                size: 0x1000,
                protections: Protection::READ,
            },
        ]);
        let space = AddressSpace::build(&hv, &regions, 2, 4).unwrap();
        let mut ranges: Vec<(u64, u64)> = space
            .regions()
            .iter()
            .map(|r| (r.guest_start, r.guest_start + r.size))
            .collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlapping guest ranges: {pair:?}");
        }
    }

    #[test]
    fn stack_arena_slots_are_distinct_and_identity_mapped() {
        let hv = MockBackend::new();
        let regions = MockRegionSource(vec![]);
        let space = AddressSpace::build(&hv, &regions, 3, 8).unwrap();
        assert_eq!(space.stack_arena().slots(), 3);
        let top0 = space.stack_arena().stack_top(0);
        let top1 = space.stack_arena().stack_top(1);
        assert_ne!(top0, top1);
        assert_eq!(space.translate(top0 - 1), Some(top0 - 1));
    }
}
