//! vCPU exit events.
//!
//! A [`VcpuExit`] is produced once per resume call and handed to an
//! [`ExitHandler`] before the vCPU is resumed again. Data slices borrow the
//! vCPU's shared `kvm_run` page, so an exit cannot outlive the handler call.

use std::fmt;

use crate::error::Result;

/// Direction of a port I/O transfer, as seen from the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    /// `IN`: the guest reads from the port.
    In,
    /// `OUT`: the guest writes to the port.
    Out,
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoDirection::In => write!(f, "in"),
            IoDirection::Out => write!(f, "out"),
        }
    }
}

/// Exit reason from vCPU execution.
#[derive(Debug)]
pub enum VcpuExit<'a> {
    /// The guest read from a guest-physical address with no memory slot.
    /// The host fills `data` (1 to 8 bytes) before the next resume.
    MmioRead { addr: u64, data: &'a mut [u8] },
    /// The guest wrote `data` to a guest-physical address with no memory slot.
    MmioWrite { addr: u64, data: &'a [u8] },
    /// The guest executed `IN`/`OUT` (or a string variant).
    ///
    /// `data` holds `size * count` bytes; for `In` the host fills it.
    Io {
        direction: IoDirection,
        port: u16,
        size: u8,
        count: u32,
        data: &'a mut [u8],
    },
    /// The guest executed `HLT`.
    Hlt,
    /// The processor refused to enter the guest.
    FailEntry { reason: u64 },
    /// KVM could not complete an exit on the guest's behalf.
    InternalError { suberror: u32 },
    /// Any other exit reason, as the raw `KVM_EXIT_*` value.
    Unknown(u32),
}

/// Action to take after handling a VM exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Resume the vCPU.
    Continue,
    /// The guest halted cleanly; stop the run loop.
    Halt,
}

/// Host-side handling of vCPU exits.
///
/// Returning an error terminates the run loop; there is no recovery path.
pub trait ExitHandler {
    fn handle_exit(&mut self, exit: VcpuExit<'_>) -> Result<ExitAction>;
}
