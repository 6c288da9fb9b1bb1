//! Guest launch context.
//!
//! [`Launcher`] owns every resource of one guest run: the device handle, the
//! VM with its memory regions and its vCPU. It is built once, run once, and
//! releases everything on drop.

use log::{debug, info};

use crate::backend::kvm::{Device, Vm};
use crate::backend::LaunchConfig;
use crate::debug::{hex_dump, RegisterDump};
use crate::device::{DispatchStats, ExitDispatcher};
use crate::error::{Error, Result};
use crate::exit::{ExitAction, ExitHandler};
use crate::loader::gdt::{build_gdt, GDT_SIZE};
use crate::loader::paging::build_paging;
use crate::loader::Payload;
use crate::memory::layout::*;
use crate::memory::GuestMemoryMap;
use crate::runner::{Machine, RunLoop, RunSummary};

/// Index of the only vCPU.
const BOOT_VCPU: u64 = 0;

/// Bytes at the top of the stack shown in dumps.
const STACK_DUMP_LEN: usize = 64;

/// Result of a run that ended in a clean halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchReport {
    pub summary: RunSummary,
    pub stats: DispatchStats,
}

/// Check the entry offset and payload size before any device is touched.
pub fn validate_payload(payload: &Payload, config: &LaunchConfig) -> Result<u64> {
    let len = payload.len() as u64;
    if config.entry_offset >= len {
        return Err(Error::InvalidEntryOffset(format!(
            "0x{:x} is outside the {len}-byte payload",
            config.entry_offset
        )));
    }

    let window = config.paging.window();
    if CODE_START + len > window {
        return Err(Error::PayloadTooLarge {
            size: payload.len(),
            base: CODE_START,
            window,
        });
    }

    Ok(CODE_START + config.entry_offset)
}

/// A fully prepared guest, ready to run.
pub struct Launcher {
    config: LaunchConfig,
    entry_point: u64,
    // Dropped before the device handle.
    vm: Vm,
    device: Device,
}

impl Launcher {
    /// Load the payload and build the guest.
    ///
    /// The payload is read and validated first, so a bad file never opens
    /// the device. Then the regions are mapped and filled, and the vCPU is
    /// programmed to start at the payload's entry point.
    pub fn new(config: LaunchConfig) -> Result<Self> {
        let payload = Payload::from_file(&config.payload)?;
        let entry_point = validate_payload(&payload, &config)?;
        info!("entry point: 0x{entry_point:x} (offset 0x{:x})", config.entry_offset);

        let device = Device::open()?;
        let mut vm = device.create_vm()?;

        vm.create_region(CODE_SLOT, CODE_START, payload.len())?
            .write(0, payload.bytes())?;

        let tables = vm.create_region(PAGE_TABLES_SLOT, PAGE_TABLES_START, PAGE_TABLES_SIZE)?;
        build_paging(config.paging, tables, PAGE_TABLES_START)?;
        info!("paging: {} pages, 0x{:x} byte identity window", config.paging, config.paging.window());

        build_gdt(vm.create_region(GDT_SLOT, GDT_START, GDT_SIZE)?)?;

        vm.create_region(STACK_SLOT, STACK_START, STACK_SIZE)?
            .fill(STACK_FILL);

        vm.create_vcpu(BOOT_VCPU)?;
        vm.program_initial_state(BOOT_VCPU, GDT_SLOT, PAGE_TABLES_SLOT, entry_point, STACK_TOP)?;

        let launcher = Self {
            config,
            entry_point,
            vm,
            device,
        };
        debug!("initial registers:\n{}", launcher.registers()?);
        Ok(launcher)
    }

    /// The configuration this guest was built from.
    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Guest-physical address of the first instruction.
    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    /// The open device handle.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Guest memory. Only reachable between resumes.
    pub fn memory(&self) -> &GuestMemoryMap {
        self.vm.memory()
    }

    /// Current registers of the vCPU.
    pub fn registers(&self) -> Result<RegisterDump> {
        RegisterDump::capture(self.vm.vcpu(BOOT_VCPU)?)
    }

    /// The last bytes of the stack region.
    pub fn stack_tail(&self, len: usize) -> Result<&[u8]> {
        let stack = self
            .vm
            .memory()
            .region(STACK_SLOT)
            .ok_or(Error::NoSuchSlot(STACK_SLOT))?;
        let bytes = stack.as_slice();
        Ok(&bytes[bytes.len().saturating_sub(len)..])
    }

    /// Run the guest with `handler` until it halts.
    pub fn run_with(&mut self, handler: &mut dyn ExitHandler) -> Result<RunSummary> {
        let mut run_loop = RunLoop::new(self.config.trace_exits, self.config.stack_dump);
        run_loop.run(self, handler)
    }

    /// Run the guest with the standard devices until it halts.
    pub fn run(&mut self, dispatcher: &mut ExitDispatcher) -> Result<LaunchReport> {
        let summary = self.run_with(dispatcher)?;
        let stats = dispatcher.stats();
        info!(
            "run summary: {} resume(s), {} serial byte(s), {} MMIO read(s), {} MMIO write(s)",
            summary.resumes, stats.serial_bytes, stats.mmio_reads, stats.mmio_writes
        );
        Ok(LaunchReport { summary, stats })
    }
}

impl Machine for Launcher {
    fn resume(&mut self, handler: &mut dyn ExitHandler) -> Result<ExitAction> {
        self.vm.resume(BOOT_VCPU, handler)
    }

    fn dump_state(&mut self, include_stack: bool) -> Result<()> {
        info!("registers for vCPU {BOOT_VCPU}:\n{}", self.registers()?);
        if include_stack {
            info!(
                "stack content (last {STACK_DUMP_LEN} bytes):\n{}",
                hex_dump(self.stack_tail(STACK_DUMP_LEN)?, STACK_DUMP_LEN)
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("config", &self.config)
            .field("entry_point", &format_args!("0x{:x}", self.entry_point))
            .field("vm", &self.vm)
            .finish()
    }
}
