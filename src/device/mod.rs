//! Host-side device emulation and exit dispatch.
//!
//! The guest sees exactly two devices: the transmit side of COM1 and an MMIO
//! stub covering every unmapped guest-physical address. [`ExitDispatcher`]
//! routes each vCPU exit to one of them or turns it into a fatal error.

pub mod mmio;
pub mod serial;

pub use mmio::MmioStub;
pub use serial::{Serial, COM1_PORT};

use log::{debug, error};

use crate::error::{Error, Result};
use crate::exit::{ExitAction, ExitHandler, IoDirection, VcpuExit};

/// Counters for the exits a dispatcher has served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub serial_bytes: u64,
    pub mmio_reads: u64,
    pub mmio_writes: u64,
}

/// Routes vCPU exits to the emulated devices.
pub struct ExitDispatcher {
    serial: Serial,
    mmio: MmioStub,
}

impl ExitDispatcher {
    /// Dispatcher whose serial output goes to stdout.
    pub fn new() -> Self {
        Self::with_serial(Serial::new())
    }

    /// Dispatcher with a custom serial sink.
    pub fn with_serial(serial: Serial) -> Self {
        Self {
            serial,
            mmio: MmioStub::new(),
        }
    }

    /// Exits served so far.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            serial_bytes: self.serial.bytes_written(),
            mmio_reads: self.mmio.reads(),
            mmio_writes: self.mmio.writes(),
        }
    }

    fn handle_io(
        &mut self,
        direction: IoDirection,
        port: u16,
        size: u8,
        count: u32,
        data: &[u8],
    ) -> Result<ExitAction> {
        if direction == IoDirection::Out && port == COM1_PORT && size == 1 && count == 1 {
            if let Some(&byte) = data.first() {
                self.serial.write_byte(byte).map_err(Error::GuestOutput)?;
                return Ok(ExitAction::Continue);
            }
        }
        Err(Error::UnhandledIo {
            direction,
            port,
            size,
            count,
        })
    }
}

impl Default for ExitDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitHandler for ExitDispatcher {
    fn handle_exit(&mut self, exit: VcpuExit<'_>) -> Result<ExitAction> {
        let result = match exit {
            VcpuExit::MmioRead { addr, data } => {
                self.mmio.read(addr, data);
                Ok(ExitAction::Continue)
            }
            VcpuExit::MmioWrite { addr, data } => {
                self.mmio.write(addr, data);
                Ok(ExitAction::Continue)
            }
            VcpuExit::Io {
                direction,
                port,
                size,
                count,
                data,
            } => self.handle_io(direction, port, size, count, data),
            VcpuExit::Hlt => {
                debug!("KVM_EXIT_HLT");
                Ok(ExitAction::Halt)
            }
            VcpuExit::FailEntry { reason } => Err(Error::FailEntry { reason }),
            VcpuExit::InternalError { suberror } => Err(Error::InternalError { suberror }),
            VcpuExit::Unknown(reason) => Err(Error::UnhandledExit { reason }),
        };

        if let Err(e) = &result {
            error!("{e}");
        }
        result
    }
}
