// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! One-shot VMCS programming that makes a freshly created vCPU wake up in
//! 64-bit long mode at a host-supplied entry point.
//!
//! Directly descended from `vthread.c`'s `vcpu_unpaged_protected_mode` and
//! the native-MSR enable list at the top of `vcpu_create_run`, generalized
//! in one place: the original boots into *unpaged* protected mode and lets
//! guest code load CR3 itself once it is ready; this crate's guest has no
//! bootstrap assembly of its own, so CR0/CR3/CR4/EFER are programmed here to
//! enter paged long mode directly, with CR3 already pointing at the address
//! space's PML4.

use log::debug;
use thiserror::Error;

use crate::address_space::AddressSpace;
use crate::hv::{GuestReg, HvError, Hypervisor, VcpuId, VmcsField, VmxCapability};
use crate::msr_index::{
    CSTAR, EFER_LMA, EFER_LME, FS_BASE, GS_BASE, KERNEL_GS_BASE, LSTAR, SF_MASK, STAR,
    IA32_SYSENTER_CS, IA32_SYSENTER_EIP, IA32_SYSENTER_ESP, TSC, TSC_AUX,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("hypervisor call failed during vcpu bootstrap: {0}")]
    Hypervisor(#[from] HvError),
}

pub type Result<T> = std::result::Result<T, Error>;

const SEL_CODE: u64 = 0x10;
const SEL_DATA: u64 = 0x18;
const AR_CODE_64: u64 = 0xa09b;
const AR_DATA: u64 = 0xc093;
const AR_LDTR: u64 = 0x82;
const AR_TR_BUSY_64: u64 = 0x8b;
const FLAT_LIMIT: u64 = 0xffff_ffff;

const GDTR_LIMIT: u64 = 0x17;
const GDTR_BASE: u64 = 0xfe0;

const X86_CR0_PE: u64 = 1 << 0;
const X86_CR0_ET: u64 = 1 << 4;
const X86_CR0_NE: u64 = 1 << 5;
const X86_CR0_PG: u64 = 1 << 31;
const CR0_GUEST_VALUE: u64 = X86_CR0_PE | X86_CR0_ET | X86_CR0_NE | X86_CR0_PG;

const X86_CR4_PAE: u64 = 1 << 5;
const X86_CR4_VMXE: u64 = 1 << 13;
const CR4_GUEST_VALUE: u64 = X86_CR4_VMXE | X86_CR4_PAE;
/// Hides `VMXE` from the guest's view of CR4; only that bit is
/// shadow-masked, the guest is free to read/write the rest of CR4 directly.
const CR4_MASK: u64 = X86_CR4_VMXE;

const CPU_BASED_HLT_EXITING: u64 = 1 << 7;
const CPU_BASED_CR8_LOAD_EXITING: u64 = 1 << 19;
const CPU_BASED_CR8_STORE_EXITING: u64 = 1 << 20;
const CPU_BASED2_RDTSCP_ENABLE: u64 = 1 << 3;
const VMENTRY_GUEST_IA32E: u64 = 1 << 9;
/// Exception bitmap bit 18: #MC (machine check), the only vector this
/// crate intercepts.
const EXC_BITMAP_MC: u64 = 1 << 18;

const RFLAGS_RESERVED_BIT1: u64 = 0x2;

/// `(allowed0, allowed1)`-encoded VMX capability MSR turned into a control
/// value: force-set every bit `allowed0` requires, then mask off every bit
/// `allowed1` forbids. Transcribed from `utils.c`'s `cap2ctrl`.
fn cap2ctrl(cap: u64, requested: u64) -> u64 {
    (requested | (cap & 0xffff_ffff)) & (cap >> 32)
}

/// Native MSRs passed straight through to hardware for this vCPU,
/// transcribed from `vcpu_create_run`'s `hv_vcpu_enable_native_msr` calls.
const NATIVE_PASSTHROUGH_MSRS: &[u32] = &[
    LSTAR,
    CSTAR,
    STAR,
    SF_MASK,
    KERNEL_GS_BASE,
    GS_BASE,
    FS_BASE,
    IA32_SYSENTER_CS,
    IA32_SYSENTER_ESP,
    IA32_SYSENTER_EIP,
    TSC,
    TSC_AUX,
];

/// Programs `id`'s VMCS guest state so the vCPU enters 64-bit long mode at
/// `entry` with `rsp` at `stack_top`, and enables the native-MSR
/// pass-through list. `arg` is handed to the guest in `RDI`, the first
/// SysV-ABI argument register, so `entry` can be called like an ordinary
/// one-argument host function.
pub fn bootstrap(
    hv: &dyn Hypervisor,
    id: VcpuId,
    address_space: &AddressSpace,
    entry: u64,
    stack_top: u64,
    arg: u64,
) -> Result<()> {
    use VmcsField::*;

    hv.vmcs_write(id, GUEST_CS, SEL_CODE)?;
    hv.vmcs_write(id, GUEST_CS_AR, AR_CODE_64)?;
    hv.vmcs_write(id, GUEST_CS_LIMIT, FLAT_LIMIT)?;
    hv.vmcs_write(id, GUEST_CS_BASE, 0)?;

    for (sel, ar, limit, base) in [
        (GUEST_DS, GUEST_DS_AR, GUEST_DS_LIMIT, GUEST_DS_BASE),
        (GUEST_ES, GUEST_ES_AR, GUEST_ES_LIMIT, GUEST_ES_BASE),
        (GUEST_SS, GUEST_SS_AR, GUEST_SS_LIMIT, GUEST_SS_BASE),
    ] {
        hv.vmcs_write(id, sel, SEL_DATA)?;
        hv.vmcs_write(id, ar, AR_DATA)?;
        hv.vmcs_write(id, limit, FLAT_LIMIT)?;
        hv.vmcs_write(id, base, 0)?;
    }

    // FS/GS as data segments, but with base 0.
    for (sel, ar, limit, base) in [
        (GUEST_FS, GUEST_FS_AR, GUEST_FS_LIMIT, GUEST_FS_BASE),
        (GUEST_GS, GUEST_GS_AR, GUEST_GS_LIMIT, GUEST_GS_BASE),
    ] {
        hv.vmcs_write(id, sel, SEL_DATA)?;
        hv.vmcs_write(id, ar, AR_DATA)?;
        hv.vmcs_write(id, limit, FLAT_LIMIT)?;
        hv.vmcs_write(id, base, 0)?;
    }

    hv.vmcs_write(id, GUEST_LDTR, 0)?;
    hv.vmcs_write(id, GUEST_LDTR_AR, AR_LDTR)?;
    hv.vmcs_write(id, GUEST_LDTR_LIMIT, 0xffff)?;
    hv.vmcs_write(id, GUEST_LDTR_BASE, 0)?;

    hv.vmcs_write(id, GUEST_TR, 0)?;
    hv.vmcs_write(id, GUEST_TR_AR, AR_TR_BUSY_64)?;
    hv.vmcs_write(id, GUEST_TR_LIMIT, 0)?;
    hv.vmcs_write(id, GUEST_TR_BASE, 0)?;

    hv.vmcs_write(id, GUEST_GDTR_LIMIT, GDTR_LIMIT)?;
    hv.vmcs_write(id, GUEST_GDTR_BASE, GDTR_BASE)?;
    hv.vmcs_write(id, GUEST_IDTR_LIMIT, 0)?;
    hv.vmcs_write(id, GUEST_IDTR_BASE, 0)?;

    let cap_pin = hv.vmx_cap_read(VmxCapability::PinBased)?;
    let cap_cpu = hv.vmx_cap_read(VmxCapability::ProcBased)?;
    let cap_cpu2 = hv.vmx_cap_read(VmxCapability::ProcBased2)?;
    let cap_entry = hv.vmx_cap_read(VmxCapability::Entry)?;

    hv.vmcs_write(id, CTRL_PIN_BASED, cap2ctrl(cap_pin, 0))?;
    hv.vmcs_write(
        id,
        CTRL_CPU_BASED,
        cap2ctrl(
            cap_cpu,
            CPU_BASED_HLT_EXITING | CPU_BASED_CR8_LOAD_EXITING | CPU_BASED_CR8_STORE_EXITING,
        ),
    )?;
    hv.vmcs_write(id, CTRL_CPU_BASED2, cap2ctrl(cap_cpu2, CPU_BASED2_RDTSCP_ENABLE))?;
    hv.vmcs_write(id, CTRL_VMENTRY_CONTROLS, cap2ctrl(cap_entry, VMENTRY_GUEST_IA32E))?;
    hv.vmcs_write(id, CTRL_EXC_BITMAP, EXC_BITMAP_MC)?;

    hv.vmcs_write(id, GUEST_CR0, CR0_GUEST_VALUE)?;
    hv.vmcs_write(id, CTRL_CR0_SHADOW, CR0_GUEST_VALUE)?;
    // Mask is all-ones here: every CR0 bit the guest writes must be observed
    // by the host, unlike CR4's single hidden VMXE bit.
    hv.vmcs_write(id, CTRL_CR0_MASK, u32::MAX as u64)?;

    hv.vmcs_write(id, GUEST_CR3, address_space.cr3())?;

    hv.vmcs_write(id, GUEST_CR4, CR4_GUEST_VALUE)?;
    hv.vmcs_write(id, CTRL_CR4_SHADOW, CR4_GUEST_VALUE)?;
    hv.vmcs_write(id, CTRL_CR4_MASK, CR4_MASK)?;

    hv.vmcs_write(id, GUEST_IA32_EFER, EFER_LME | EFER_LMA)?;

    hv.vmcs_write(id, GUEST_RIP, entry)?;
    hv.vmcs_write(id, GUEST_RFLAGS, RFLAGS_RESERVED_BIT1)?;
    hv.vmcs_write(id, GUEST_RSP, stack_top)?;

    for &msr in NATIVE_PASSTHROUGH_MSRS {
        hv.enable_native_msr(id, msr, true)?;
    }

    hv.reg_write(id, GuestReg::RDI, arg)?;

    debug!(
        "vcpu {} bootstrapped: rip=0x{:x} rsp=0x{:x} cr3=0x{:x}",
        id,
        entry,
        stack_top,
        address_space.cr3()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hv::backend::{MockBackend, MockRegionSource};

    #[test]
    fn bootstrap_enters_long_mode_with_paging_enabled() {
        let hv = MockBackend::new();
        let regions = MockRegionSource(vec![]);
        let space = AddressSpace::build(&hv, &regions, 1, 8).unwrap();
        let id = hv.vcpu_create().unwrap();

        bootstrap(&hv, id, &space, 0x1000, 0x2000, 0xabcd).unwrap();

        assert_eq!(hv.vmcs_read(id, VmcsField::GUEST_RIP).unwrap(), 0x1000);
        assert_eq!(hv.vmcs_read(id, VmcsField::GUEST_RSP).unwrap(), 0x2000);
        assert_eq!(hv.vmcs_read(id, VmcsField::GUEST_CR3).unwrap(), space.cr3());
        assert_eq!(hv.reg_read(id, crate::hv::GuestReg::RDI).unwrap(), 0xabcd);
        let efer = hv.vmcs_read(id, VmcsField::GUEST_IA32_EFER).unwrap();
        assert_eq!(efer & (EFER_LME | EFER_LMA), EFER_LME | EFER_LMA);
        let cr0 = hv.vmcs_read(id, VmcsField::GUEST_CR0).unwrap();
        assert_ne!(cr0 & X86_CR0_PG, 0);
    }

    #[test]
    fn cap2ctrl_forces_must_one_bits_and_masks_must_zero_bits() {
        // allowed0 (must-be-1) = bit 0; allowed1 (may-be-1) = bits 0..2.
        let cap = (0b011u64 << 32) | 0b001;
        assert_eq!(cap2ctrl(cap, 0), 0b001);
        assert_eq!(cap2ctrl(cap, 0b100), 0b001);
    }
}
