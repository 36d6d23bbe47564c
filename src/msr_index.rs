// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Numeric indices of the model-specific registers [`crate::msr`] knows about.
//!
//! Names and values follow the Intel SDM / the `msr-index.h` constants the
//! original `vmm-akaros` MSR emulation table (`lib/vmxmsr.c`) was built
//! against.

pub const IA32_MISC_ENABLE: u32 = 0x1a0;
pub const IA32_SYSENTER_CS: u32 = 0x174;
pub const IA32_SYSENTER_ESP: u32 = 0x175;
pub const IA32_SYSENTER_EIP: u32 = 0x176;
pub const IA32_UCODE_REV: u32 = 0x8b;
pub const CSTAR: u32 = 0xc000_0083;
pub const LSTAR: u32 = 0xc000_0082;
pub const STAR: u32 = 0xc000_0081;
pub const SF_MASK: u32 = 0xc000_0084;
pub const KERNEL_GS_BASE: u32 = 0xc000_0102;
pub const FS_BASE: u32 = 0xc000_0100;
pub const GS_BASE: u32 = 0xc000_0101;
pub const TSC: u32 = 0x10;
pub const TSC_AUX: u32 = 0xc000_0103;
pub const EFER: u32 = 0xc000_0080;

pub const IA32_VMX_BASIC: u32 = 0x480;
pub const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
pub const IA32_VMX_PROCBASED_CTLS: u32 = 0x482;
pub const IA32_VMX_EXIT_CTLS: u32 = 0x483;
pub const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
pub const IA32_VMX_PROCBASED_CTLS2: u32 = 0x48b;

pub const IA32_ENERGY_PERF_BIAS: u32 = 0x1b0;

pub const LBR_SELECT: u32 = 0x1c8;
pub const LBR_TOS: u32 = 0x1c9;
pub const LBR_NHM_FROM: u32 = 0x680;
pub const LBR_NHM_TO: u32 = 0x6c0;
pub const LBR_CORE_FROM: u32 = 0x40;
pub const LBR_CORE_TO: u32 = 0x60;

pub const OFFCORE_RSP_0: u32 = 0x1a6;
pub const OFFCORE_RSP_1: u32 = 0x1a7;
pub const PEBS_LD_LAT_THRESHOLD: u32 = 0x3f6;
pub const ARCH_PERFMON_EVENTSEL0: u32 = 0x186;
pub const ARCH_PERFMON_EVENTSEL1: u32 = 0x187;
pub const IA32_PERF_CAPABILITIES: u32 = 0x345;

pub const IA32_APICBASE: u32 = 0x1b;
pub const RAPL_POWER_UNIT: u32 = 0x606;

/// x2APIC LVT Timer register.
pub const LAPIC_TIMER: u32 = 0x832;
/// x2APIC LVT Thermal Monitor register.
pub const LAPIC_THERMAL: u32 = 0x833;
/// x2APIC Initial Count register.
pub const LAPIC_INITCOUNT: u32 = 0x838;

/// Bit set in `IA32_MISC_ENABLE` to report that precise event-based sampling
/// is unavailable, matching the original emulation's `emsr_miscenable`.
pub const MISC_ENABLE_PEBS_UNAVAIL: u64 = 1 << 12;

/// `EFER.LME` — long mode enable.
pub const EFER_LME: u64 = 1 << 8;
/// `EFER.LMA` — long mode active.
pub const EFER_LMA: u64 = 1 << 10;
