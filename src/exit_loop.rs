// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Per-vCPU VM-exit dispatch loop.
//!
//! Directly descended from `vcpu_create_run`'s `for` loop in the original
//! `vthread.c`, generalized from a fixed ten-iteration debug loop with
//! `printf`/`abort` diagnostics into an unbounded loop that returns a
//! `Result` instead of aborting the process, plus a debug-only iteration
//! watchdog.

use log::{trace, warn};
use thiserror::Error;

use crate::hv::{ExitReason, GuestReg, HvError, Hypervisor, VcpuId, VmcsField};
use crate::msr;
use crate::msr_index::EFER;
use crate::vcpu_state::{GuestRegs, VcpuState};

#[derive(Debug, Error)]
pub enum Error {
    #[error("hypervisor call failed servicing a vm-exit: {0}")]
    Hypervisor(#[from] HvError),
    #[error("msr violation: {0}")]
    Msr(#[from] msr::Error),
    #[error("vm-exit reason {0:?} is not handled by this dispatcher")]
    UnhandledExit(ExitReason),
    #[error("cr-access exit had an unsupported shape: {0}")]
    UnsupportedCrAccess(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a fully run exit loop: the guest executed HLT and stopped
/// voluntarily. Any other termination surfaces as an `Err` instead of a
/// `Terminated` variant, since it *is* the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Halted;

/// Development-only backstop against a runaway guest that never halts. A
/// `panic!`, not an `Err` variant — this cap must not be mistaken for a
/// normal termination path — and only active under `debug_assertions`.
const DEBUG_ITERATION_CAP: u64 = 1_000_000;

/// Runs `state`'s vCPU until it halts or hits an unhandled/fatal exit. The
/// ready/running/deciding state machine this models is flattened into a
/// loop since every edge is taken synchronously on this thread.
pub fn run(hv: &dyn Hypervisor, state: &mut VcpuState) -> Result<Halted> {
    let id = state.id();
    let mut iterations: u64 = 0;

    loop {
        iterations += 1;
        if cfg!(debug_assertions) && iterations > DEBUG_ITERATION_CAP {
            panic!("vcpu {id} exceeded the debug iteration watchdog ({DEBUG_ITERATION_CAP} exits) without halting");
        }

        hv.vcpu_run(id)?;
        let reason = hv.classify_exit(id)?;
        trace!("vcpu {id} exit: {reason:?}");

        match reason {
            ExitReason::Hlt => {
                capture_final_regs(hv, id, state)?;
                return Ok(Halted);
            }
            ExitReason::ExternalInterrupt => {
                // Re-enter without advancing RIP.
                continue;
            }
            ExitReason::EptViolation => {
                // No-op re-entry: `AddressSpace` pre-maps everything present
                // at `vth_init` time, so a true EPT violation here means a
                // guest touched something outside that snapshot.
                warn!("vcpu {id}: ept violation treated as spurious, re-entering");
                continue;
            }
            ExitReason::MovCr => {
                handle_mov_cr(hv, id)?;
                advance_rip(hv, id)?;
            }
            ExitReason::Rdmsr => {
                handle_rdmsr(hv, state)?;
                advance_rip(hv, id)?;
            }
            ExitReason::Wrmsr => {
                handle_wrmsr(hv, state)?;
                advance_rip(hv, id)?;
            }
            ExitReason::Other(raw) => return Err(Error::UnhandledExit(ExitReason::Other(raw))),
        }
    }
}

fn advance_rip(hv: &dyn Hypervisor, id: VcpuId) -> Result<()> {
    let rip = hv.vmcs_read(id, VmcsField::GUEST_RIP)?;
    let instr_len = hv.vmcs_read(id, VmcsField::RO_VMEXIT_INSTR_LEN)?;
    hv.vmcs_write(id, VmcsField::GUEST_RIP, rip + instr_len)?;
    Ok(())
}

/// Exit-qualification bitfield for a `MOV_CR` exit (Intel SDM Table 27-3):
/// bits 0-3 control-register number, bits 4-5 access type, bits 8-11 the
/// general-purpose register. Decoded here rather than as a `bitfield!`
/// newtype since it is read exactly once per exit and never stored.
struct CrQualification {
    cr_number: u8,
    access_type: u8,
    source_reg: u8,
}

impl CrQualification {
    fn decode(raw: u64) -> CrQualification {
        CrQualification {
            cr_number: (raw & 0xf) as u8,
            access_type: ((raw >> 4) & 0x3) as u8,
            source_reg: ((raw >> 8) & 0xf) as u8,
        }
    }
}

const CR_ACCESS_MOV_TO_CR: u8 = 0;

fn guest_reg_from_index(index: u8) -> Option<GuestReg> {
    Some(match index {
        0 => GuestReg::RAX,
        1 => GuestReg::RCX,
        2 => GuestReg::RDX,
        3 => GuestReg::RBX,
        4 => GuestReg::RSP,
        5 => GuestReg::RBP,
        6 => GuestReg::RSI,
        7 => GuestReg::RDI,
        8 => GuestReg::R8,
        9 => GuestReg::R9,
        10 => GuestReg::R10,
        11 => GuestReg::R11,
        12 => GuestReg::R12,
        13 => GuestReg::R13,
        14 => GuestReg::R14,
        15 => GuestReg::R15,
        _ => return None,
    })
}

/// Decodes a CR-access exit qualification's `{cr_number, access_type,
/// source_reg}` and mirrors a `MOV-to-CR0`/`MOV-to-CR4` into the VMCS
/// shadow and guest fields; anything else is fatal.
fn handle_mov_cr(hv: &dyn Hypervisor, id: VcpuId) -> Result<()> {
    let qual = CrQualification::decode(hv.vmcs_read(id, VmcsField::RO_EXIT_QUALIFIC)?);
    if qual.access_type != CR_ACCESS_MOV_TO_CR {
        return Err(Error::UnsupportedCrAccess(format!(
            "cr{} access_type {} is not MOV-to-CR",
            qual.cr_number, qual.access_type
        )));
    }
    let source = guest_reg_from_index(qual.source_reg).ok_or_else(|| {
        Error::UnsupportedCrAccess(format!("source register index {} out of range", qual.source_reg))
    })?;
    let value = hv.reg_read(id, source)?;

    match qual.cr_number {
        0 => {
            hv.vmcs_write(id, VmcsField::CTRL_CR0_SHADOW, value)?;
            hv.vmcs_write(id, VmcsField::GUEST_CR0, value)?;

            let efer = hv.vmcs_read(id, VmcsField::GUEST_IA32_EFER)?;
            const X86_CR0_PG: u64 = 1 << 31;
            if value & X86_CR0_PG != 0 && efer & crate::msr_index::EFER_LME != 0 {
                let new_efer = efer | crate::msr_index::EFER_LMA;
                hv.vmcs_write(id, VmcsField::GUEST_IA32_EFER, new_efer)?;
                let entry_ctrl = hv.vmcs_read(id, VmcsField::CTRL_VMENTRY_CONTROLS)?;
                const VMENTRY_GUEST_IA32E: u64 = 1 << 9;
                hv.vmcs_write(id, VmcsField::CTRL_VMENTRY_CONTROLS, entry_ctrl | VMENTRY_GUEST_IA32E)?;
                trace!("vcpu {id}: cr0 set pg while efer.lme set, turning on lma");
            }
            Ok(())
        }
        4 => {
            hv.vmcs_write(id, VmcsField::CTRL_CR4_SHADOW, value)?;
            hv.vmcs_write(id, VmcsField::GUEST_CR4, value)?;
            Ok(())
        }
        other => Err(Error::UnsupportedCrAccess(format!("cr{other} is not emulated"))),
    }
}

/// For EFER specifically, bypasses the MSR table and serves the value
/// directly from the VMCS `GUEST_IA32_EFER` field.
fn handle_rdmsr(hv: &dyn Hypervisor, state: &mut VcpuState) -> Result<()> {
    let id = state.id();
    let index = hv.reg_read(id, GuestReg::RCX)? as u32;

    let value = if index == EFER {
        hv.vmcs_read(id, VmcsField::GUEST_IA32_EFER)?
    } else {
        state.msr_table().rdmsr(hv, state.core_index(), index)?
    };

    hv.reg_write(id, GuestReg::RAX, value & 0xffff_ffff)?;
    hv.reg_write(id, GuestReg::RDX, value >> 32)?;
    Ok(())
}

fn handle_wrmsr(hv: &dyn Hypervisor, state: &mut VcpuState) -> Result<()> {
    let id = state.id();
    let index = hv.reg_read(id, GuestReg::RCX)? as u32;
    let eax = hv.reg_read(id, GuestReg::RAX)? & 0xffff_ffff;
    let edx = hv.reg_read(id, GuestReg::RDX)? & 0xffff_ffff;
    let value = (edx << 32) | eax;

    if index == EFER {
        hv.vmcs_write(id, VmcsField::GUEST_IA32_EFER, value)?;
    } else {
        state.msr_table().wrmsr(hv, state.core_index(), index, value)?;
    }
    Ok(())
}

fn capture_final_regs(hv: &dyn Hypervisor, id: VcpuId, state: &mut VcpuState) -> Result<()> {
    let regs = GuestRegs {
        rax: hv.reg_read(id, GuestReg::RAX)?,
        rbx: hv.reg_read(id, GuestReg::RBX)?,
        rcx: hv.reg_read(id, GuestReg::RCX)?,
        rdx: hv.reg_read(id, GuestReg::RDX)?,
        rsi: hv.reg_read(id, GuestReg::RSI)?,
        rdi: hv.reg_read(id, GuestReg::RDI)?,
        rbp: hv.reg_read(id, GuestReg::RBP)?,
        rsp: hv.reg_read(id, GuestReg::RSP)?,
        r8: hv.reg_read(id, GuestReg::R8)?,
        r9: hv.reg_read(id, GuestReg::R9)?,
        r10: hv.reg_read(id, GuestReg::R10)?,
        r11: hv.reg_read(id, GuestReg::R11)?,
        r12: hv.reg_read(id, GuestReg::R12)?,
        r13: hv.reg_read(id, GuestReg::R13)?,
        r14: hv.reg_read(id, GuestReg::R14)?,
        r15: hv.reg_read(id, GuestReg::R15)?,
        rip: hv.reg_read(id, GuestReg::RIP)?,
        rflags: hv.reg_read(id, GuestReg::RFLAGS)?,
    };
    state.record_final_regs(regs);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::AddressSpace;
    use crate::hv::backend::{MockBackend, MockRegionSource};
    use crate::msr_index::{IA32_APICBASE, RAPL_POWER_UNIT};
    use std::sync::Arc;

    fn new_state(hv: &MockBackend) -> VcpuState {
        let regions = MockRegionSource(vec![]);
        let space = Arc::new(AddressSpace::build(hv, &regions, 1, 8).unwrap());
        let id = hv.vcpu_create().unwrap();
        VcpuState::new(id, space, 0)
    }

    #[test]
    fn hlt_terminates_the_loop_successfully() {
        let hv = MockBackend::new();
        let mut state = new_state(&hv);
        hv.set_next_exit(state.id(), ExitReason::Hlt);
        assert!(run(&hv, &mut state).is_ok());
    }

    #[test]
    fn unhandled_exit_reason_is_an_error() {
        let hv = MockBackend::new();
        let mut state = new_state(&hv);
        hv.set_next_exit(state.id(), ExitReason::Other(999));
        assert!(matches!(run(&hv, &mut state), Err(Error::UnhandledExit(_))));
    }

    #[test]
    fn cr0_write_enabling_paging_turns_on_lma_and_ia32e() {
        let hv = MockBackend::new();
        let id = hv.vcpu_create().unwrap();
        hv.vmcs_write(id, VmcsField::GUEST_IA32_EFER, crate::msr_index::EFER_LME).unwrap();
        // access_type=MOV-to-CR (0), cr_number=0, source_reg=RAX (0).
        hv.vmcs_write(id, VmcsField::RO_EXIT_QUALIFIC, 0).unwrap();
        hv.reg_write(id, GuestReg::RAX, 1 << 31).unwrap();

        handle_mov_cr(&hv, id).unwrap();

        let efer = hv.vmcs_read(id, VmcsField::GUEST_IA32_EFER).unwrap();
        assert_ne!(efer & crate::msr_index::EFER_LMA, 0);
        let entry = hv.vmcs_read(id, VmcsField::CTRL_VMENTRY_CONTROLS).unwrap();
        assert_ne!(entry & (1 << 9), 0);
    }

    #[test]
    fn rdmsr_and_wrmsr_go_through_the_msr_table() {
        let hv = MockBackend::new();
        let mut state = new_state(&hv);
        let id = state.id();

        hv.reg_write(id, GuestReg::RCX, RAPL_POWER_UNIT as u64).unwrap();
        handle_rdmsr(&hv, &mut state).unwrap();
        assert_eq!(hv.reg_read(id, GuestReg::RAX).unwrap(), 0);
        assert_eq!(hv.reg_read(id, GuestReg::RDX).unwrap(), 0);

        hv.reg_write(id, GuestReg::RCX, IA32_APICBASE as u64).unwrap();
        hv.reg_write(id, GuestReg::RAX, 0xcafe_babe).unwrap();
        hv.reg_write(id, GuestReg::RDX, 0xdead_beef).unwrap();
        handle_wrmsr(&hv, &mut state).unwrap();
        handle_rdmsr(&hv, &mut state).unwrap();
        assert_eq!(hv.reg_read(id, GuestReg::RAX).unwrap(), 0xcafe_babe);
        assert_eq!(hv.reg_read(id, GuestReg::RDX).unwrap(), 0xdead_beef);
    }

    #[test]
    fn efer_msr_bypasses_the_table() {
        let hv = MockBackend::new();
        let mut state = new_state(&hv);
        let id = state.id();
        hv.vmcs_write(id, VmcsField::GUEST_IA32_EFER, 0x500).unwrap();
        hv.reg_write(id, GuestReg::RCX, EFER as u64).unwrap();
        handle_rdmsr(&hv, &mut state).unwrap();
        assert_eq!(hv.reg_read(id, GuestReg::RAX).unwrap(), 0x500);
    }
}
