//! Error types for barevm.

use std::path::PathBuf;
use thiserror::Error;

use crate::exit::IoDirection;

/// Result type alias using barevm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while preparing or running a guest.
///
/// Every variant is fatal: the launcher has no retry layer. Variants that
/// originate in a KVM ioctl carry the raw errno; variants that originate in
/// a guest exit carry the raw code reported in `kvm_run`.
#[derive(Error, Debug)]
pub enum Error {
    // Device errors
    #[error("hypervisor not available: /dev/kvm does not exist")]
    HypervisorNotAvailable,

    #[error("open /dev/kvm failed: {0} (try: sudo setfacl -m u:${{USER}}:rw /dev/kvm)")]
    OpenDevice(#[source] kvm_ioctls::Error),

    #[error("KVM_GET_API_VERSION returned {reported}, expected {expected} (built against this version)")]
    ApiVersionMismatch { reported: i32, expected: i32 },

    #[error("KVM_CREATE_VM failed: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("KVM_CREATE_VCPU failed: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    #[error("KVM_GET_VCPU_MMAP_SIZE failed: {0}")]
    VcpuMmapSize(#[source] kvm_ioctls::Error),

    // Memory errors
    #[error("memory allocation failed: {0}")]
    MemoryAllocationFailed(String),

    #[error("guest physical address 0x{0:x} is not page aligned")]
    MisalignedGuestAddress(u64),

    #[error("memory slot {0} is already in use")]
    SlotInUse(u32),

    #[error("memory slot {0} is not registered")]
    NoSuchSlot(u32),

    #[error("region [0x{start:x}, 0x{end:x}) overlaps memory slot {slot}")]
    RegionOverlap { slot: u32, start: u64, end: u64 },

    #[error("KVM_SET_USER_MEMORY_REGION failed for slot {slot}: {source}")]
    RegisterMemoryRegion {
        slot: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("invalid guest address: 0x{0:x}")]
    InvalidGuestAddress(u64),

    #[error("paging tables need 0x{needed:x} bytes, region holds 0x{actual:x}")]
    TableRegionTooSmall { needed: usize, actual: usize },

    // Register errors
    #[error("{op} failed: {source}")]
    GetRegisters {
        op: &'static str,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("{op} failed: {source}")]
    SetRegisters {
        op: &'static str,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("vCPU {0} does not exist")]
    NoSuchVcpu(u64),

    // Execution errors
    #[error("KVM_RUN failed: {0}")]
    Resume(#[source] kvm_ioctls::Error),

    #[error("KVM_EXIT_FAIL_ENTRY: hardware_entry_failure_reason = 0x{reason:x}")]
    FailEntry { reason: u64 },

    #[error("KVM_EXIT_INTERNAL_ERROR: suberror = 0x{suberror:x}")]
    InternalError { suberror: u32 },

    #[error("unhandled KVM_EXIT_IO: {direction} port 0x{port:x}, size {size}, count {count}")]
    UnhandledIo {
        direction: IoDirection,
        port: u16,
        size: u8,
        count: u32,
    },

    #[error("unhandled exit_reason = 0x{reason:x}")]
    UnhandledExit { reason: u32 },

    #[error("guest serial output failed: {0}")]
    GuestOutput(#[source] std::io::Error),

    // Payload and usage errors
    #[error("payload not found: {0}")]
    PayloadNotFound(PathBuf),

    #[error("payload is empty: {0}")]
    EmptyPayload(PathBuf),

    #[error("payload of {size} bytes at 0x{base:x} does not fit the 0x{window:x} byte identity window")]
    PayloadTooLarge { size: usize, base: u64, window: u64 },

    #[error("invalid entry offset: {0}")]
    InvalidEntryOffset(String),

    #[error("feature not supported: {0}")]
    NotSupported(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse grouping of fatal conditions, used to pick a process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad command line or payload file.
    Usage,
    /// Device open, API version, VM or vCPU creation.
    Device,
    /// Host allocation or guest-physical slot registration.
    Memory,
    /// Register read/write on the vCPU.
    Registers,
    /// The guest stopped in a way the run loop does not handle.
    Guest,
}

impl ErrorCategory {
    /// Process exit status for this category. Zero is reserved for a clean halt.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCategory::Usage => 1,
            ErrorCategory::Device => 2,
            ErrorCategory::Memory => 3,
            ErrorCategory::Registers => 4,
            ErrorCategory::Guest => 5,
        }
    }
}

impl Error {
    /// The category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::HypervisorNotAvailable
            | Error::OpenDevice(_)
            | Error::ApiVersionMismatch { .. }
            | Error::CreateVm(_)
            | Error::CreateVcpu(_)
            | Error::VcpuMmapSize(_)
            | Error::NotSupported(_) => ErrorCategory::Device,

            Error::MemoryAllocationFailed(_)
            | Error::MisalignedGuestAddress(_)
            | Error::SlotInUse(_)
            | Error::NoSuchSlot(_)
            | Error::RegionOverlap { .. }
            | Error::RegisterMemoryRegion { .. }
            | Error::InvalidGuestAddress(_)
            | Error::TableRegionTooSmall { .. } => ErrorCategory::Memory,

            Error::GetRegisters { .. } | Error::SetRegisters { .. } | Error::NoSuchVcpu(_) => {
                ErrorCategory::Registers
            }

            Error::Resume(_)
            | Error::FailEntry { .. }
            | Error::InternalError { .. }
            | Error::UnhandledIo { .. }
            | Error::UnhandledExit { .. }
            | Error::GuestOutput(_) => ErrorCategory::Guest,

            Error::PayloadNotFound(_)
            | Error::EmptyPayload(_)
            | Error::PayloadTooLarge { .. }
            | Error::InvalidEntryOffset(_)
            | Error::Io(_) => ErrorCategory::Usage,
        }
    }

    /// Process exit status for this error (never 0).
    pub fn exit_code(&self) -> i32 {
        self.category().exit_code()
    }

    /// Whether the error was produced by a guest exit rather than by host setup.
    pub fn is_guest_fatal(&self) -> bool {
        self.category() == ErrorCategory::Guest
    }
}
