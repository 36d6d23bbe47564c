// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! In-process fake [`Hypervisor`] / [`RegionSource`], used by unit tests in
//! [`crate::page_tables`], [`crate::address_space`] and [`crate::msr`]. It
//! does not virtualize anything: `vmcs_write`/`reg_write` land in a table a
//! test can inspect, and `vcpu_run` always reports an `Hlt` exit so
//! `ExitLoop` tests can drive a handful of iterations deterministically.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Mutex;

use super::super::{
    ExitReason, GuestReg, HvError, Hypervisor, Protection, Region, RegionSource, VcpuId,
    VmcsField, VmxCapability,
};

#[derive(Default)]
struct VcpuRecord {
    vmcs: HashMap<VmcsField, u64>,
    regs: HashMap<GuestReg, u64>,
    next_exit: ExitReason,
    native_msrs: HashMap<u32, bool>,
}

/// A fake VM. `mapped` records every `vm_map`/`vm_unmap` call so tests can
/// assert the exact set of regions [`crate::address_space::AddressSpace`]
/// installed, without touching real memory.
pub struct MockBackend {
    next_id: Mutex<VcpuId>,
    vcpus: Mutex<HashMap<VcpuId, VcpuRecord>>,
    pub mapped: Mutex<Vec<(u64, u64, Protection)>>,
    pub host_msrs: Mutex<HashMap<(u32, u32), u64>>,
    /// Caps set here for `vmx_cap_read` in bootstrap tests.
    pub vmx_caps: Mutex<HashMap<VmxCapability, u64>>,
}

impl MockBackend {
    pub fn new() -> Self {
        MockBackend {
            next_id: Mutex::new(0),
            vcpus: Mutex::new(HashMap::new()),
            mapped: Mutex::new(Vec::new()),
            host_msrs: Mutex::new(HashMap::new()),
            vmx_caps: Mutex::new(HashMap::new()),
        }
    }

    /// Test hook: make the next `vcpu_run` on `id` report `reason`.
    pub fn set_next_exit(&self, id: VcpuId, reason: ExitReason) {
        self.vcpus
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .next_exit = reason;
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for ExitReason {
    fn default() -> Self {
        ExitReason::Hlt
    }
}

impl Hypervisor for MockBackend {
    fn vm_create(&self) -> Result<(), HvError> {
        Ok(())
    }

    fn vm_destroy(&self) -> Result<(), HvError> {
        Ok(())
    }

    fn vcpu_create(&self) -> Result<VcpuId, HvError> {
        let mut next = self.next_id.lock().unwrap();
        let id = *next;
        *next += 1;
        self.vcpus.lock().unwrap().insert(id, VcpuRecord::default());
        Ok(id)
    }

    fn vcpu_destroy(&self, id: VcpuId) -> Result<(), HvError> {
        self.vcpus
            .lock()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| HvError::new(format!("no such vcpu {id}")))
    }

    fn vcpu_run(&self, id: VcpuId) -> Result<(), HvError> {
        let mut table = self.vcpus.lock().unwrap();
        let rec = table
            .get_mut(&id)
            .ok_or_else(|| HvError::new(format!("no such vcpu {id}")))?;
        let raw = match rec.next_exit {
            ExitReason::ExternalInterrupt => 1,
            ExitReason::Hlt => 12,
            ExitReason::MovCr => 28,
            ExitReason::Rdmsr => 31,
            ExitReason::Wrmsr => 32,
            ExitReason::EptViolation => 48,
            ExitReason::Other(r) => r,
        };
        rec.vmcs.insert(VmcsField::RO_EXIT_REASON, raw);
        Ok(())
    }

    fn vmcs_read(&self, id: VcpuId, field: VmcsField) -> Result<u64, HvError> {
        let table = self.vcpus.lock().unwrap();
        let rec = table
            .get(&id)
            .ok_or_else(|| HvError::new(format!("no such vcpu {id}")))?;
        Ok(*rec.vmcs.get(&field).unwrap_or(&0))
    }

    fn vmcs_write(&self, id: VcpuId, field: VmcsField, value: u64) -> Result<(), HvError> {
        let mut table = self.vcpus.lock().unwrap();
        let rec = table
            .get_mut(&id)
            .ok_or_else(|| HvError::new(format!("no such vcpu {id}")))?;
        rec.vmcs.insert(field, value);
        Ok(())
    }

    fn reg_read(&self, id: VcpuId, reg: GuestReg) -> Result<u64, HvError> {
        let table = self.vcpus.lock().unwrap();
        let rec = table
            .get(&id)
            .ok_or_else(|| HvError::new(format!("no such vcpu {id}")))?;
        Ok(*rec.regs.get(&reg).unwrap_or(&0))
    }

    fn reg_write(&self, id: VcpuId, reg: GuestReg, value: u64) -> Result<(), HvError> {
        let mut table = self.vcpus.lock().unwrap();
        let rec = table
            .get_mut(&id)
            .ok_or_else(|| HvError::new(format!("no such vcpu {id}")))?;
        rec.regs.insert(reg, value);
        Ok(())
    }

    fn vm_map(
        &self,
        _host_ptr: *const c_void,
        guest_phys: u64,
        len: u64,
        prot: Protection,
    ) -> Result<(), HvError> {
        self.mapped.lock().unwrap().push((guest_phys, len, prot));
        Ok(())
    }

    fn vm_unmap(&self, guest_phys: u64, len: u64) -> Result<(), HvError> {
        self.mapped
            .lock()
            .unwrap()
            .retain(|(gpa, l, _)| !(*gpa == guest_phys && *l == len));
        Ok(())
    }

    fn vmx_cap_read(&self, which: VmxCapability) -> Result<u64, HvError> {
        Ok(*self.vmx_caps.lock().unwrap().get(&which).unwrap_or(&0))
    }

    fn enable_native_msr(&self, id: VcpuId, msr: u32, enable: bool) -> Result<(), HvError> {
        let mut table = self.vcpus.lock().unwrap();
        let rec = table
            .get_mut(&id)
            .ok_or_else(|| HvError::new(format!("no such vcpu {id}")))?;
        rec.native_msrs.insert(msr, enable);
        Ok(())
    }

    fn host_msr_read(&self, core: u32, index: u32) -> Result<u64, HvError> {
        Ok(*self.host_msrs.lock().unwrap().get(&(core, index)).unwrap_or(&0))
    }

    fn host_msr_write(&self, core: u32, index: u32, value: u64) -> Result<(), HvError> {
        self.host_msrs.lock().unwrap().insert((core, index), value);
        Ok(())
    }
}

/// A fixed, caller-supplied set of regions, standing in for the real
/// process's address space during tests.
pub struct MockRegionSource(pub Vec<Region>);

impl RegionSource for MockRegionSource {
    fn regions(&self) -> std::io::Result<Vec<Region>> {
        Ok(self.0.clone())
    }
}
