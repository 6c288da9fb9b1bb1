//! KVM VM: guest memory slots and the vCPU.

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;
use log::{debug, info};

use super::Vcpu;
use crate::error::{Error, Result};
use crate::exit::{ExitAction, ExitHandler};
use crate::memory::{GuestMemoryMap, GuestRegion};

/// A KVM virtual machine.
///
/// Owns every guest region and every vCPU. Region views are borrowed from
/// the VM, and resuming a vCPU borrows the VM mutably, so a host view of
/// guest memory can never be alive while the guest runs.
pub struct Vm {
    // Field order is drop order: vCPU fds close before the VM fd, and the
    // host mappings go last.
    vcpus: Vec<Vcpu>,
    fd: VmFd,
    memory: GuestMemoryMap,
    /// Size of each vCPU's shared `kvm_run` mapping.
    run_size: usize,
}

impl Vm {
    pub(super) fn new(fd: VmFd, run_size: usize) -> Self {
        Self {
            vcpus: Vec::new(),
            fd,
            memory: GuestMemoryMap::new(),
            run_size,
        }
    }

    /// Allocate a region and register it as guest memory slot `slot`.
    ///
    /// `requested_size` is rounded up to a whole page. On a failed
    /// registration the host mapping is released again.
    pub fn create_region(
        &mut self,
        slot: u32,
        guest_addr: u64,
        requested_size: usize,
    ) -> Result<&mut GuestRegion> {
        self.memory.check_free(slot, guest_addr, requested_size)?;
        let region = GuestRegion::new(slot, guest_addr, requested_size)?;

        let mem_region = kvm_userspace_memory_region {
            slot,
            flags: 0,
            guest_phys_addr: region.guest_addr(),
            memory_size: region.size() as u64,
            userspace_addr: region.host_addr(),
        };

        // SAFETY: the mapping is owned by `region`, which moves into
        // `self.memory` and stays there until the VM fd is closed.
        unsafe { self.fd.set_user_memory_region(mem_region) }
            .map_err(|source| Error::RegisterMemoryRegion { slot, source })?;

        info!(
            "slot {slot}: guest 0x{:x}..0x{:x} (0x{:x} bytes, requested 0x{requested_size:x})",
            region.guest_addr(),
            region.end_addr(),
            region.size()
        );
        self.memory.insert(region)
    }

    /// Create vCPU `id`. Only a single vCPU (id 0) is supported.
    pub fn create_vcpu(&mut self, id: u64) -> Result<&mut Vcpu> {
        if id != 0 || !self.vcpus.is_empty() {
            return Err(Error::NotSupported(format!(
                "vCPU {id}: only a single vCPU with id 0 is supported"
            )));
        }
        let fd = self.fd.create_vcpu(id).map_err(Error::CreateVcpu)?;
        debug!("vCPU {id} created");
        self.vcpus.push(Vcpu::new(fd, id, self.run_size));
        Ok(&mut self.vcpus[0])
    }

    /// Guest memory, for host access between resumes.
    pub fn memory(&self) -> &GuestMemoryMap {
        &self.memory
    }

    /// Get a vCPU by id.
    pub fn vcpu(&self, id: u64) -> Result<&Vcpu> {
        self.vcpus
            .iter()
            .find(|v| v.id() == id)
            .ok_or(Error::NoSuchVcpu(id))
    }

    /// Get a mutable vCPU by id.
    pub fn vcpu_mut(&mut self, id: u64) -> Result<&mut Vcpu> {
        self.vcpus
            .iter_mut()
            .find(|v| v.id() == id)
            .ok_or(Error::NoSuchVcpu(id))
    }

    /// Program vCPU `id` for long mode from the GDT and page table regions.
    pub fn program_initial_state(
        &mut self,
        id: u64,
        gdt_slot: u32,
        page_table_slot: u32,
        entry_point: u64,
        stack_top: u64,
    ) -> Result<()> {
        let gdt = self
            .memory
            .region(gdt_slot)
            .ok_or(Error::NoSuchSlot(gdt_slot))?;
        let tables = self
            .memory
            .region(page_table_slot)
            .ok_or(Error::NoSuchSlot(page_table_slot))?;
        let vcpu = self
            .vcpus
            .iter_mut()
            .find(|v| v.id() == id)
            .ok_or(Error::NoSuchVcpu(id))?;
        vcpu.program_initial_state(gdt, tables, entry_point, stack_top)
    }

    /// Run vCPU `id` until its next exit and hand the exit to `handler`.
    pub fn resume(&mut self, id: u64, handler: &mut dyn ExitHandler) -> Result<ExitAction> {
        self.vcpu_mut(id)?.resume(handler)
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("vcpus", &self.vcpus.len())
            .field("memory", &self.memory)
            .finish()
    }
}
