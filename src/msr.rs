// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! MSR emulation table: the policy-driven RDMSR/WRMSR dispatch that backs
//! `ExitLoop`'s MSR exits.
//!
//! Directly descended from the original `vmxmsr.c`'s `emmsrs[]` table and
//! its `emsr_*` handler functions, generalized from one process-wide mutable
//! C array into a per-`VcpuState` `Vec<MsrSlot>` — a shared global table is a
//! latent cross-vthread data race the moment two vthreads touch the same
//! stateful MSR.

use log::{trace, warn};
use thiserror::Error;

use crate::hv::{HvError, Hypervisor};
use crate::msr_index::*;

#[derive(Debug, Error)]
pub enum Error {
    #[error("rdmsr/wrmsr for unknown index 0x{0:x}")]
    UnknownMsr(u32),
    #[error("msr violation on {name} (0x{index:x}): {reason}")]
    Violation {
        index: u32,
        name: &'static str,
        reason: &'static str,
    },
    #[error("hypervisor call failed servicing msr {name} (0x{index:x})")]
    Hypervisor {
        index: u32,
        name: &'static str,
        #[source]
        source: HvError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Bit set in `IA32_MISC_ENABLE` reads, reporting precise event-based
/// sampling unavailable — matches `emsr_miscenable`'s hardcoded bit.
const MISC_ENABLE_PEBS_UNAVAIL_BIT: u64 = MISC_ENABLE_PEBS_UNAVAIL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrPolicy {
    /// Read and write pass straight through to the host MSR
    /// (`emsr_ok`).
    PassThrough,
    /// Reads always return 0; writes are a violation (`emsr_readzero`).
    ReadZero,
    /// Reads pass through; writes are a violation (`emsr_readonly`).
    ReadOnly,
    /// Reads pass through; writes are accepted only if they match the
    /// current host value, otherwise a violation (`emsr_mustmatch`).
    MustMatch,
    /// Reads return the last faked value once written, else pass through;
    /// writes that don't change the visible value are silently accepted,
    /// writes that do change it are cached and never actually committed
    /// (`emsr_fakewrite`).
    FakeWrite,
    /// The LAPIC timer LVT register: writes cache the vector/mode guest
    /// programmed, reads return the cached value once written, else pass
    /// through (`emsr_lapicvec`).
    LapicTimerVector,
    /// The LAPIC initial-count register, same shape as
    /// `LapicTimerVector` (`emsr_lapicinitialcount`).
    LapicInitialCount,
    /// `IA32_MISC_ENABLE`: reads are passed through host, with the
    /// PEBS-unavailable bit forced set; writes are accepted only if they
    /// match what a read would currently return (`emsr_miscenable`).
    MiscEnable,
}

#[derive(Debug, Clone, Copy)]
pub struct MsrDescriptor {
    pub index: u32,
    pub name: &'static str,
    pub policy: MsrPolicy,
}

/// The minimum MSR set a guest booted into long mode touches before it can
/// run ordinary code, transcribed from `vmxmsr.c`'s `emmsrs[]`.
pub const MSR_TABLE: &[MsrDescriptor] = &[
    MsrDescriptor { index: IA32_MISC_ENABLE, name: "IA32_MISC_ENABLE", policy: MsrPolicy::MiscEnable },
    MsrDescriptor { index: IA32_SYSENTER_CS, name: "IA32_SYSENTER_CS", policy: MsrPolicy::PassThrough },
    MsrDescriptor { index: IA32_SYSENTER_EIP, name: "IA32_SYSENTER_EIP", policy: MsrPolicy::PassThrough },
    MsrDescriptor { index: IA32_SYSENTER_ESP, name: "IA32_SYSENTER_ESP", policy: MsrPolicy::PassThrough },
    MsrDescriptor { index: IA32_UCODE_REV, name: "IA32_UCODE_REV", policy: MsrPolicy::FakeWrite },
    MsrDescriptor { index: CSTAR, name: "CSTAR", policy: MsrPolicy::FakeWrite },
    MsrDescriptor { index: IA32_VMX_BASIC, name: "IA32_VMX_BASIC", policy: MsrPolicy::FakeWrite },
    MsrDescriptor { index: IA32_VMX_PINBASED_CTLS, name: "IA32_VMX_PINBASED_CTLS", policy: MsrPolicy::FakeWrite },
    MsrDescriptor { index: IA32_VMX_PROCBASED_CTLS, name: "IA32_VMX_PROCBASED_CTLS", policy: MsrPolicy::FakeWrite },
    MsrDescriptor { index: IA32_VMX_PROCBASED_CTLS2, name: "IA32_VMX_PROCBASED_CTLS2", policy: MsrPolicy::FakeWrite },
    MsrDescriptor { index: IA32_VMX_EXIT_CTLS, name: "IA32_VMX_EXIT_CTLS", policy: MsrPolicy::FakeWrite },
    MsrDescriptor { index: IA32_VMX_ENTRY_CTLS, name: "IA32_VMX_ENTRY_CTLS", policy: MsrPolicy::FakeWrite },
    MsrDescriptor { index: IA32_ENERGY_PERF_BIAS, name: "IA32_ENERGY_PERF_BIAS", policy: MsrPolicy::FakeWrite },
    MsrDescriptor { index: LBR_SELECT, name: "LBR_SELECT", policy: MsrPolicy::PassThrough },
    MsrDescriptor { index: LBR_TOS, name: "LBR_TOS", policy: MsrPolicy::PassThrough },
    MsrDescriptor { index: LBR_NHM_FROM, name: "LBR_NHM_FROM", policy: MsrPolicy::PassThrough },
    MsrDescriptor { index: LBR_NHM_TO, name: "LBR_NHM_TO", policy: MsrPolicy::PassThrough },
    MsrDescriptor { index: LBR_CORE_FROM, name: "LBR_CORE_FROM", policy: MsrPolicy::PassThrough },
    MsrDescriptor { index: LBR_CORE_TO, name: "LBR_CORE_TO", policy: MsrPolicy::PassThrough },
    MsrDescriptor { index: OFFCORE_RSP_0, name: "OFFCORE_RSP_0", policy: MsrPolicy::PassThrough },
    MsrDescriptor { index: OFFCORE_RSP_1, name: "OFFCORE_RSP_1", policy: MsrPolicy::PassThrough },
    MsrDescriptor { index: PEBS_LD_LAT_THRESHOLD, name: "PEBS_LD_LAT_THRESHOLD", policy: MsrPolicy::PassThrough },
    MsrDescriptor { index: ARCH_PERFMON_EVENTSEL0, name: "ARCH_PERFMON_EVENTSEL0", policy: MsrPolicy::PassThrough },
    MsrDescriptor { index: ARCH_PERFMON_EVENTSEL1, name: "ARCH_PERFMON_EVENTSEL1", policy: MsrPolicy::PassThrough },
    MsrDescriptor { index: IA32_PERF_CAPABILITIES, name: "IA32_PERF_CAPABILITIES", policy: MsrPolicy::PassThrough },
    MsrDescriptor { index: IA32_APICBASE, name: "IA32_APICBASE", policy: MsrPolicy::FakeWrite },
    MsrDescriptor { index: TSC_AUX, name: "TSC_AUX", policy: MsrPolicy::FakeWrite },
    MsrDescriptor { index: RAPL_POWER_UNIT, name: "RAPL_POWER_UNIT", policy: MsrPolicy::ReadZero },
    MsrDescriptor { index: LAPIC_TIMER, name: "LAPIC_TIMER", policy: MsrPolicy::LapicTimerVector },
    MsrDescriptor { index: LAPIC_THERMAL, name: "LAPIC_THERMAL", policy: MsrPolicy::FakeWrite },
    MsrDescriptor { index: LAPIC_INITCOUNT, name: "LAPIC_INITCOUNT", policy: MsrPolicy::LapicInitialCount },
];

#[derive(Debug, Clone)]
struct MsrSlot {
    descriptor: MsrDescriptor,
    written: bool,
    cached: u64,
}

/// Owns one vCPU's MSR emulation state. Cloned from [`MSR_TABLE`] fresh for
/// every vCPU, never shared — the single global C array this was
/// transcribed from would otherwise race the moment two vthreads touch the
/// same stateful MSR concurrently.
pub struct MsrTable {
    slots: Vec<MsrSlot>,
}

impl MsrTable {
    pub fn new() -> MsrTable {
        MsrTable {
            slots: MSR_TABLE
                .iter()
                .map(|&descriptor| MsrSlot {
                    descriptor,
                    written: false,
                    cached: 0,
                })
                .collect(),
        }
    }

    fn slot_mut(&mut self, index: u32) -> Result<&mut MsrSlot> {
        self.slots
            .iter_mut()
            .find(|s| s.descriptor.index == index)
            .ok_or(Error::UnknownMsr(index))
    }

    /// The last value the guest wrote to `index`, if any. Used by
    /// [`crate::vcpu_state::VcpuState`] to expose `timer_msr`/
    /// `initial_count` without duplicating the cache this table already
    /// keeps for `LapicTimerVector`/`LapicInitialCount`.
    pub fn cached(&self, index: u32) -> Option<u64> {
        self.slots
            .iter()
            .find(|s| s.descriptor.index == index && s.written)
            .map(|s| s.cached)
    }

    /// Services an RDMSR exit for MSR `index` on the vCPU identified by
    /// `core` (the host MSR device is keyed by core index).
    pub fn rdmsr(&mut self, hv: &dyn Hypervisor, core: u32, index: u32) -> Result<u64> {
        let slot = self.slot_mut(index)?;
        let descriptor = slot.descriptor;
        trace!("rdmsr {} (0x{:x})", descriptor.name, index);

        let host_read = |hv: &dyn Hypervisor| {
            hv.host_msr_read(core, index).map_err(|source| Error::Hypervisor {
                index,
                name: descriptor.name,
                source,
            })
        };

        match descriptor.policy {
            MsrPolicy::PassThrough | MsrPolicy::ReadOnly | MsrPolicy::MustMatch => host_read(hv),
            MsrPolicy::ReadZero => Ok(0),
            MsrPolicy::MiscEnable => Ok(host_read(hv)? | MISC_ENABLE_PEBS_UNAVAIL_BIT),
            MsrPolicy::FakeWrite | MsrPolicy::LapicTimerVector | MsrPolicy::LapicInitialCount => {
                if slot.written {
                    Ok(slot.cached)
                } else {
                    host_read(hv)
                }
            }
        }
    }

    /// Services a WRMSR exit for MSR `index` with the guest-supplied
    /// 64-bit `value` (EDX:EAX already reassembled by the caller).
    pub fn wrmsr(&mut self, hv: &dyn Hypervisor, core: u32, index: u32, value: u64) -> Result<()> {
        let slot = self.slot_mut(index)?;
        let descriptor = slot.descriptor;
        trace!("wrmsr {} (0x{:x}) <- 0x{:x}", descriptor.name, index, value);

        match descriptor.policy {
            MsrPolicy::PassThrough => hv
                .host_msr_write(core, index, value)
                .map_err(|source| Error::Hypervisor { index, name: descriptor.name, source }),
            MsrPolicy::ReadZero | MsrPolicy::ReadOnly => {
                warn!("{}: rejected write to a read-only register", descriptor.name);
                Err(Error::Violation { index, name: descriptor.name, reason: "register is read-only" })
            }
            MsrPolicy::MustMatch => {
                let current = hv
                    .host_msr_read(core, index)
                    .map_err(|source| Error::Hypervisor { index, name: descriptor.name, source })?;
                if current == value {
                    Ok(())
                } else {
                    warn!(
                        "{}: wanted to write 0x{:x}, host value is 0x{:x}",
                        descriptor.name, value, current
                    );
                    Err(Error::Violation { index, name: descriptor.name, reason: "write did not match host value" })
                }
            }
            MsrPolicy::MiscEnable => {
                let current = hv
                    .host_msr_read(core, index)
                    .map_err(|source| Error::Hypervisor { index, name: descriptor.name, source })?;
                if current == value {
                    Ok(())
                } else {
                    Err(Error::Violation { index, name: descriptor.name, reason: "write did not match host value" })
                }
            }
            MsrPolicy::FakeWrite => {
                let visible = if slot.written { slot.cached } else {
                    hv.host_msr_read(core, index)
                        .map_err(|source| Error::Hypervisor { index, name: descriptor.name, source })?
                };
                if visible == value {
                    Ok(())
                } else {
                    slot.cached = value;
                    slot.written = true;
                    Ok(())
                }
            }
            MsrPolicy::LapicTimerVector | MsrPolicy::LapicInitialCount => {
                slot.cached = value;
                slot.written = true;
                Ok(())
            }
        }
    }
}

impl Default for MsrTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hv::backend::MockBackend;

    #[test]
    fn read_zero_rejects_writes() {
        let hv = MockBackend::new();
        let mut table = MsrTable::new();
        assert_eq!(table.rdmsr(&hv, 0, RAPL_POWER_UNIT).unwrap(), 0);
        let err = table.wrmsr(&hv, 0, RAPL_POWER_UNIT, 1).unwrap_err();
        assert!(matches!(err, Error::Violation { .. }));
    }

    #[test]
    fn fake_write_round_trips_without_reaching_hardware() {
        let hv = MockBackend::new();
        let mut table = MsrTable::new();
        table.wrmsr(&hv, 0, IA32_APICBASE, 0xdead_beef).unwrap();
        assert_eq!(table.rdmsr(&hv, 0, IA32_APICBASE).unwrap(), 0xdead_beef);
        // Host-side MSR was never actually touched.
        assert!(hv.host_msrs.lock().unwrap().is_empty());
    }

    #[test]
    fn lapic_timer_prefers_cached_value_once_written() {
        let hv = MockBackend::new();
        hv.host_msrs.lock().unwrap().insert((0, LAPIC_TIMER), 0x1111);
        let mut table = MsrTable::new();
        assert_eq!(table.rdmsr(&hv, 0, LAPIC_TIMER).unwrap(), 0x1111);
        table.wrmsr(&hv, 0, LAPIC_TIMER, 0x2222).unwrap();
        assert_eq!(table.rdmsr(&hv, 0, LAPIC_TIMER).unwrap(), 0x2222);
    }

    #[test]
    fn misc_enable_read_sets_pebs_unavailable_bit() {
        let hv = MockBackend::new();
        hv.host_msrs.lock().unwrap().insert((0, IA32_MISC_ENABLE), 0);
        let mut table = MsrTable::new();
        let value = table.rdmsr(&hv, 0, IA32_MISC_ENABLE).unwrap();
        assert_eq!(value & MISC_ENABLE_PEBS_UNAVAIL, MISC_ENABLE_PEBS_UNAVAIL);
    }

    #[test]
    fn unknown_msr_is_reported() {
        let hv = MockBackend::new();
        let mut table = MsrTable::new();
        assert!(matches!(table.rdmsr(&hv, 0, 0xffff_ffff), Err(Error::UnknownMsr(_))));
    }
}
