// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Per-vCPU architectural state container.
//!
//! One `VcpuState` is created per vthread in [`crate::facade::vthread_create`]
//! and lives for exactly the lifetime of that vthread's host thread: built
//! just before [`crate::vcpu_bootstrap::bootstrap`] runs, read and mutated
//! by [`crate::exit_loop::run`], dropped once the loop returns.

use std::sync::Arc;

use crate::address_space::AddressSpace;
use crate::hv::VcpuId;
use crate::msr::MsrTable;
use crate::msr_index::{LAPIC_INITCOUNT, LAPIC_TIMER};

/// A snapshot of the guest's general-purpose registers, captured by
/// [`crate::exit_loop`] once the loop terminates so a caller can inspect the
/// guest's final state without reaching back into the (by then destroyed)
/// hypervisor vCPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// Per-guest-vCPU state: the hypervisor's vCPU handle, the MSR table this
/// vCPU owns exclusively (never shared across vCPUs, to avoid racing two
/// vthreads over the same emulated register), and a read-only view of the
/// address space shared by every vthread in the process.
pub struct VcpuState {
    id: VcpuId,
    /// Identifies which host core's MSR slot `host_msr_{read,write}` should
    /// use. On the Hypervisor Framework backend this is simply the owning
    /// vCPU's own id — see
    /// [`crate::hv::backend::macos::HvfBackend::host_msr_read`].
    core_index: u32,
    msr_table: MsrTable,
    address_space: Arc<AddressSpace>,
    stack_slot: usize,
    regs: Option<GuestRegs>,
}

impl VcpuState {
    pub fn new(id: VcpuId, address_space: Arc<AddressSpace>, stack_slot: usize) -> VcpuState {
        VcpuState {
            id,
            core_index: id,
            msr_table: MsrTable::new(),
            address_space,
            stack_slot,
            regs: None,
        }
    }

    pub fn id(&self) -> VcpuId {
        self.id
    }

    pub fn core_index(&self) -> u32 {
        self.core_index
    }

    pub fn msr_table(&mut self) -> &mut MsrTable {
        &mut self.msr_table
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.address_space
    }

    pub fn stack_slot(&self) -> usize {
        self.stack_slot
    }

    /// The emulated LAPIC timer LVT register's last guest-written value, or
    /// `0` if the guest never wrote it.
    pub fn timer_msr(&self) -> u64 {
        self.msr_table.cached(LAPIC_TIMER).unwrap_or(0)
    }

    /// The emulated LAPIC initial-count register's last guest-written
    /// value, or `0` if the guest never wrote it.
    pub fn initial_count(&self) -> u64 {
        self.msr_table.cached(LAPIC_INITCOUNT).unwrap_or(0)
    }

    pub fn record_final_regs(&mut self, regs: GuestRegs) {
        self.regs = Some(regs);
    }

    pub fn final_regs(&self) -> Option<GuestRegs> {
        self.regs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hv::backend::{MockBackend, MockRegionSource};

    #[test]
    fn timer_state_defaults_to_zero_until_written() {
        let hv = MockBackend::new();
        let regions = MockRegionSource(vec![]);
        let space = Arc::new(AddressSpace::build(&hv, &regions, 1, 8).unwrap());
        let mut state = VcpuState::new(0, space, 0);
        assert_eq!(state.timer_msr(), 0);
        assert_eq!(state.initial_count(), 0);

        state.msr_table().wrmsr(&hv, 0, LAPIC_TIMER, 7).unwrap();
        assert_eq!(state.timer_msr(), 7);
    }
}
