//! KVM vCPU: register programming and the resume/exit cycle.

use kvm_bindings::{
    kvm_regs, kvm_run, kvm_sregs, KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT, KVM_EXIT_INTERNAL_ERROR,
    KVM_EXIT_IO, KVM_EXIT_IO_OUT, KVM_EXIT_MMIO,
};
use kvm_ioctls::VcpuFd;
use log::{debug, trace};

use crate::error::{Error, Result};
use crate::exit::{ExitAction, ExitHandler, IoDirection, VcpuExit};
use crate::loader::gdt::{
    self, segment_from_descriptor, CODE_INDEX, DATA_INDEX, GDT_ENTRY_COUNT, GDT_SIZE, TSS_INDEX,
};
use crate::memory::GuestRegion;

/// CR0: protected mode enable.
pub const CR0_PE: u64 = 1 << 0;
/// CR0: paging enable.
pub const CR0_PG: u64 = 1 << 31;
/// CR4: physical address extension.
pub const CR4_PAE: u64 = 1 << 5;
/// EFER: long mode enable.
pub const EFER_LME: u64 = 1 << 8;
/// EFER: long mode active.
pub const EFER_LMA: u64 = 1 << 10;
/// RFLAGS: interrupt enable.
pub const RFLAGS_IF: u64 = 1 << 9;
/// RFLAGS: bit 1 always reads as one.
pub const RFLAGS_RESERVED: u64 = 1 << 1;

/// Switch `sregs` straight into 64-bit long mode.
///
/// Segment registers are loaded from `gdt`; cr3 points at the PML4. The IDT
/// is empty, so any exception the guest raises ends in a triple fault.
pub fn configure_long_mode(
    sregs: &mut kvm_sregs,
    gdt: &[u64; GDT_ENTRY_COUNT],
    gdt_base: u64,
    cr3: u64,
) {
    sregs.idt.base = 0;
    sregs.idt.limit = 0;
    sregs.gdt.base = gdt_base;
    sregs.gdt.limit = (GDT_SIZE - 1) as u16;

    let code = segment_from_descriptor(gdt[usize::from(CODE_INDEX)], CODE_INDEX);
    let data = segment_from_descriptor(gdt[usize::from(DATA_INDEX)], DATA_INDEX);
    sregs.cs = code;
    sregs.ds = data;
    sregs.es = data;
    sregs.fs = data;
    sregs.gs = data;
    sregs.ss = data;
    sregs.tr = segment_from_descriptor(gdt[usize::from(TSS_INDEX)], TSS_INDEX);

    sregs.efer |= EFER_LMA | EFER_LME;
    sregs.cr0 |= CR0_PG | CR0_PE;
    sregs.cr3 = cr3;
    sregs.cr4 |= CR4_PAE;
}

/// General registers for the first instruction.
pub fn initial_regs(entry_point: u64, stack_top: u64) -> kvm_regs {
    kvm_regs {
        rip: entry_point,
        rsp: stack_top,
        rbp: stack_top,
        rflags: RFLAGS_IF | RFLAGS_RESERVED,
        ..Default::default()
    }
}

/// A KVM virtual CPU.
pub struct Vcpu {
    fd: VcpuFd,
    id: u64,
    /// Size of the shared `kvm_run` mapping.
    run_size: usize,
}

impl Vcpu {
    pub(super) fn new(fd: VcpuFd, id: u64, run_size: usize) -> Self {
        Self { fd, id, run_size }
    }

    /// vCPU index.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Read the general registers.
    pub fn get_regs(&self) -> Result<kvm_regs> {
        self.fd.get_regs().map_err(|source| Error::GetRegisters {
            op: "KVM_GET_REGS",
            source,
        })
    }

    /// Write the general registers.
    pub fn set_regs(&self, regs: &kvm_regs) -> Result<()> {
        self.fd.set_regs(regs).map_err(|source| Error::SetRegisters {
            op: "KVM_SET_REGS",
            source,
        })
    }

    /// Read the special registers.
    pub fn get_sregs(&self) -> Result<kvm_sregs> {
        self.fd.get_sregs().map_err(|source| Error::GetRegisters {
            op: "KVM_GET_SREGS",
            source,
        })
    }

    /// Write the special registers.
    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<()> {
        self.fd.set_sregs(sregs).map_err(|source| Error::SetRegisters {
            op: "KVM_SET_SREGS",
            source,
        })
    }

    /// Make the vCPU runnable in long mode at `entry_point`.
    ///
    /// The GDT is read back from `gdt_region` so the segment registers match
    /// exactly what the guest sees in memory.
    pub fn program_initial_state(
        &mut self,
        gdt_region: &GuestRegion,
        page_table_region: &GuestRegion,
        entry_point: u64,
        stack_top: u64,
    ) -> Result<()> {
        let mut entries = [0u64; GDT_ENTRY_COUNT];
        for (index, entry) in (0u16..).zip(entries.iter_mut()) {
            *entry = gdt::read_descriptor(gdt_region, index)?;
        }

        let mut sregs = self.get_sregs()?;
        configure_long_mode(
            &mut sregs,
            &entries,
            gdt_region.guest_addr(),
            page_table_region.guest_addr(),
        );
        self.set_sregs(&sregs)?;

        self.set_regs(&initial_regs(entry_point, stack_top))?;
        debug!(
            "vCPU {}: rip=0x{entry_point:x} rsp=0x{stack_top:x} cr3=0x{:x}",
            self.id,
            page_table_region.guest_addr()
        );
        Ok(())
    }

    /// Run the guest until the next exit and let `handler` process it.
    ///
    /// Blocks for as long as the guest runs. Any data the exit borrows from
    /// `kvm_run` is released before this returns.
    pub fn resume(&mut self, handler: &mut dyn ExitHandler) -> Result<ExitAction> {
        if let Err(e) = self.fd.run().map(|_| ()) {
            // A signal interrupted KVM_RUN before the guest exited on its own.
            if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN {
                trace!("vCPU {}: KVM_RUN interrupted", self.id);
                return Ok(ExitAction::Continue);
            }
            return Err(Error::Resume(e));
        }

        let run_size = self.run_size;
        let run = self.fd.get_kvm_run();
        // SAFETY: KVM_RUN has returned, so the kernel is not touching the
        // shared page, and `run` is the live mapping of `run_size` bytes.
        let exit = unsafe { decode_exit(run, run_size)? };
        handler.handle_exit(exit)
    }
}

impl std::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vcpu").field("id", &self.id).finish()
    }
}

/// Decode the exit KVM left in the shared `kvm_run` area.
///
/// # Safety
///
/// `run` must be the vCPU's mapping of `run_size` bytes, read after KVM_RUN
/// has returned.
unsafe fn decode_exit(run: &mut kvm_run, run_size: usize) -> Result<VcpuExit<'_>> {
    let exit = match run.exit_reason {
        KVM_EXIT_HLT => VcpuExit::Hlt,
        KVM_EXIT_MMIO => {
            let mmio = &mut run.__bindgen_anon_1.mmio;
            let addr = mmio.phys_addr;
            let len = (mmio.len as usize).min(mmio.data.len());
            if mmio.is_write != 0 {
                VcpuExit::MmioWrite {
                    addr,
                    data: &mmio.data[..len],
                }
            } else {
                VcpuExit::MmioRead {
                    addr,
                    data: &mut mmio.data[..len],
                }
            }
        }
        KVM_EXIT_IO => {
            let io = run.__bindgen_anon_1.io;
            let direction = if u32::from(io.direction) == KVM_EXIT_IO_OUT {
                IoDirection::Out
            } else {
                IoDirection::In
            };
            let len = usize::from(io.size) * io.count as usize;
            let offset = io.data_offset as usize;
            if offset.checked_add(len).map_or(true, |end| end > run_size) {
                return Err(Error::UnhandledIo {
                    direction,
                    port: io.port,
                    size: io.size,
                    count: io.count,
                });
            }
            let base = (run as *mut kvm_run).cast::<u8>();
            VcpuExit::Io {
                direction,
                port: io.port,
                size: io.size,
                count: io.count,
                data: std::slice::from_raw_parts_mut(base.add(offset), len),
            }
        }
        KVM_EXIT_FAIL_ENTRY => VcpuExit::FailEntry {
            reason: run.__bindgen_anon_1.fail_entry.hardware_entry_failure_reason,
        },
        KVM_EXIT_INTERNAL_ERROR => VcpuExit::InternalError {
            suberror: run.__bindgen_anon_1.internal.suberror,
        },
        other => VcpuExit::Unknown(other),
    };
    Ok(exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::gdt::boot_descriptors;

    fn long_mode_sregs() -> kvm_sregs {
        let mut sregs = kvm_sregs::default();
        configure_long_mode(&mut sregs, &boot_descriptors(), 0x5000, 0x1000);
        sregs
    }

    #[test]
    fn test_long_mode_control_bits() {
        let sregs = long_mode_sregs();
        assert_eq!(sregs.cr0 & (CR0_PE | CR0_PG), CR0_PE | CR0_PG);
        assert_eq!(sregs.cr4 & CR4_PAE, CR4_PAE);
        assert_eq!(sregs.efer & (EFER_LME | EFER_LMA), EFER_LME | EFER_LMA);
        assert_eq!(sregs.cr3, 0x1000);
        assert_eq!(sregs.idt.base, 0);
        assert_eq!(sregs.idt.limit, 0);
        assert_eq!(sregs.gdt.base, 0x5000);
        assert_eq!(sregs.gdt.limit, 31);
    }

    #[test]
    fn test_existing_control_bits_are_kept() {
        let mut sregs = kvm_sregs::default();
        sregs.cr0 = 0x10; // ET
        sregs.cr4 = 0x200; // OSFXSR
        configure_long_mode(&mut sregs, &boot_descriptors(), 0x5000, 0x1000);
        assert_eq!(sregs.cr0 & 0x10, 0x10);
        assert_eq!(sregs.cr4 & 0x200, 0x200);
    }

    #[test]
    fn test_segments_come_from_gdt() {
        let sregs = long_mode_sregs();
        assert_eq!(sregs.cs.selector, 0x08);
        assert_eq!(sregs.cs.l, 1);
        for seg in [sregs.ds, sregs.es, sregs.fs, sregs.gs, sregs.ss] {
            assert_eq!(seg.selector, 0x10);
            assert_eq!(seg.present, 1);
            assert_eq!(seg.type_, 0x3);
        }
        assert_eq!(sregs.tr.selector, 0x18);
        assert_eq!(sregs.tr.s, 0);
    }

    #[test]
    fn test_initial_regs() {
        let regs = initial_regs(0x10000, 0x10000);
        assert_eq!(regs.rip, 0x10000);
        assert_eq!(regs.rsp, 0x10000);
        assert_eq!(regs.rbp, 0x10000);
        assert_eq!(regs.rflags, 0x202);
        assert_eq!(regs.rax, 0);
    }
}
