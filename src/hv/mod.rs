// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Abstract hypervisor capability surface.
//!
//! The hardware virtualization primitive is treated as an external
//! collaborator: something the core consumes through an abstract surface
//! rather than something it implements. This module is that surface. The
//! [`Hypervisor`] trait names the same verbs Apple's `Hypervisor.framework`
//! exposes (`hv_vm_create`, `hv_vcpu_run`, `hv_vmx_vcpu_read_vmcs`, ...),
//! because that is the substrate the distilled original (`xhype`) ran on.
//!
//! Two implementations exist:
//! - [`backend::macos`] (only compiled for `target_os = "macos"`), a thin
//!   adapter over the `hv`/`hv-sys` crates.
//! - [`backend::mock`] (only compiled under `#[cfg(test)]`), an in-process
//!   fake used to unit test [`crate::page_tables`], [`crate::address_space`]
//!   and [`crate::msr`] without real hardware virtualization.

use std::ffi::c_void;

pub mod backend;

/// Identifies a single guest vCPU within the current process's one VM.
pub type VcpuId = u32;

bitflags::bitflags! {
    /// Memory region permissions, mirrored from `HV_MEMORY_{READ,WRITE,EXEC}`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXEC = 0b100;
    }
}

/// A mapped region of the launching process's address space, as produced by
/// [`RegionSource`]. Immutable once discovered; consumed once by
/// [`crate::address_space::AddressSpace::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub host_start: u64,
    pub size: u64,
    pub protections: Protection,
}

/// VMCS field identifiers this crate needs. A strict subset of the real
/// VMCS encoding space — see `hv::x86::vmx::Vmcs` in the `hv` crate for the
/// full list this is cut down from.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmcsField {
    GUEST_CS,
    GUEST_CS_AR,
    GUEST_CS_LIMIT,
    GUEST_CS_BASE,
    GUEST_DS,
    GUEST_DS_AR,
    GUEST_DS_LIMIT,
    GUEST_DS_BASE,
    GUEST_ES,
    GUEST_ES_AR,
    GUEST_ES_LIMIT,
    GUEST_ES_BASE,
    GUEST_FS,
    GUEST_FS_AR,
    GUEST_FS_LIMIT,
    GUEST_FS_BASE,
    GUEST_GS,
    GUEST_GS_AR,
    GUEST_GS_LIMIT,
    GUEST_GS_BASE,
    GUEST_SS,
    GUEST_SS_AR,
    GUEST_SS_LIMIT,
    GUEST_SS_BASE,
    GUEST_LDTR,
    GUEST_LDTR_AR,
    GUEST_LDTR_LIMIT,
    GUEST_LDTR_BASE,
    GUEST_TR,
    GUEST_TR_AR,
    GUEST_TR_LIMIT,
    GUEST_TR_BASE,
    GUEST_GDTR_LIMIT,
    GUEST_GDTR_BASE,
    GUEST_IDTR_LIMIT,
    GUEST_IDTR_BASE,
    GUEST_CR0,
    GUEST_CR3,
    GUEST_CR4,
    CTRL_CR0_MASK,
    CTRL_CR0_SHADOW,
    CTRL_CR4_MASK,
    CTRL_CR4_SHADOW,
    CTRL_PIN_BASED,
    CTRL_CPU_BASED,
    CTRL_CPU_BASED2,
    CTRL_VMENTRY_CONTROLS,
    CTRL_EXC_BITMAP,
    GUEST_IA32_EFER,
    GUEST_RIP,
    GUEST_RSP,
    GUEST_RFLAGS,
    RO_EXIT_REASON,
    RO_VMEXIT_INSTR_LEN,
    RO_EXIT_QUALIFIC,
    RO_GUEST_LIN_ADDR,
    GUEST_PHYSICAL_ADDRESS,
}

/// Architectural x86-64 general-purpose / control registers this crate
/// needs to read or write directly (as opposed to through the VMCS).
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestReg {
    RAX,
    RBX,
    RCX,
    RDX,
    RSI,
    RDI,
    RBP,
    RSP,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    RIP,
    RFLAGS,
}

/// VMX capability MSR groups, as read by `hv_vmx_read_capability` and
/// consumed by vCPU bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmxCapability {
    PinBased,
    ProcBased,
    ProcBased2,
    Entry,
}

/// Reasons the exit loop dispatches on. A strict subset of the real VMX
/// exit reason space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Hlt,
    ExternalInterrupt,
    EptViolation,
    MovCr,
    Rdmsr,
    Wrmsr,
    Other(u64),
}

/// Any call into the hypervisor primitive failed — typically a programmer
/// error in VMCS setup, fatal to the affected vCPU.
#[derive(Debug, Clone, thiserror::Error)]
#[error("hypervisor call failed: {0}")]
pub struct HvError(pub String);

impl HvError {
    pub fn new(context: impl Into<String>) -> Self {
        Self(context.into())
    }
}

/// The abstract hardware-virtualization primitive consumed by the core.
/// One VM per process; callers are responsible for pinning all
/// per-`VcpuId` calls to the thread that created that vCPU — this trait
/// does not enforce that itself.
pub trait Hypervisor: Send + Sync {
    fn vm_create(&self) -> Result<(), HvError>;
    fn vm_destroy(&self) -> Result<(), HvError>;

    fn vcpu_create(&self) -> Result<VcpuId, HvError>;
    fn vcpu_destroy(&self, id: VcpuId) -> Result<(), HvError>;
    fn vcpu_run(&self, id: VcpuId) -> Result<(), HvError>;

    fn vmcs_read(&self, id: VcpuId, field: VmcsField) -> Result<u64, HvError>;
    fn vmcs_write(&self, id: VcpuId, field: VmcsField, value: u64) -> Result<(), HvError>;

    fn reg_read(&self, id: VcpuId, reg: GuestReg) -> Result<u64, HvError>;
    fn reg_write(&self, id: VcpuId, reg: GuestReg, value: u64) -> Result<(), HvError>;

    fn vm_map(
        &self,
        host_ptr: *const c_void,
        guest_phys: u64,
        len: u64,
        prot: Protection,
    ) -> Result<(), HvError>;
    fn vm_unmap(&self, guest_phys: u64, len: u64) -> Result<(), HvError>;

    fn vmx_cap_read(&self, which: VmxCapability) -> Result<u64, HvError>;

    fn enable_native_msr(&self, id: VcpuId, msr: u32, enable: bool) -> Result<(), HvError>;

    fn host_msr_read(&self, core: u32, index: u32) -> Result<u64, HvError>;
    fn host_msr_write(&self, core: u32, index: u32, value: u64) -> Result<(), HvError>;

    /// Classifies the vCPU's current `RO_EXIT_REASON` into the subset of
    /// exit reasons `ExitLoop` understands. Returns `ExitReason::Other` for
    /// anything outside that subset, which `ExitLoop` terminates on.
    fn classify_exit(&self, id: VcpuId) -> Result<ExitReason, HvError> {
        let raw = self.vmcs_read(id, VmcsField::RO_EXIT_REASON)?;
        Ok(match raw {
            0 => ExitReason::ExternalInterrupt, // VMX_REASON_EXC_NMI overlaps 0 in degenerate mocks
            1 => ExitReason::ExternalInterrupt,
            12 => ExitReason::Hlt,
            28 => ExitReason::MovCr,
            31 => ExitReason::Rdmsr,
            32 => ExitReason::Wrmsr,
            48 => ExitReason::EptViolation,
            other => ExitReason::Other(other),
        })
    }
}

/// Discovers the mapped regions of the current process's address space.
pub trait RegionSource: Send + Sync {
    fn regions(&self) -> std::io::Result<Vec<Region>>;
}
