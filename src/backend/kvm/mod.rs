//! Linux KVM backend.
//!
//! Thin layer over the rust-vmm `kvm-ioctls` crate:
//!
//! - [`Device`]: the open `/dev/kvm` handle, checked against the API version
//!   this crate was built with
//! - [`Vm`]: guest memory slots and the single vCPU
//! - [`Vcpu`]: register programming and the resume/exit cycle
//!
//! ## Requirements
//!
//! - Linux kernel with KVM support
//! - Read/write access to /dev/kvm
//! - CPU with VT-x (Intel) or AMD-V (AMD)

mod vcpu;
mod vm;

pub use vcpu::{configure_long_mode, initial_regs, Vcpu, RFLAGS_IF, RFLAGS_RESERVED};
pub use vm::Vm;

use kvm_bindings::KVM_API_VERSION;
use kvm_ioctls::Kvm;
use log::{debug, info};

use crate::error::{Error, Result};

/// Path of the KVM device node.
pub const KVM_DEVICE: &str = "/dev/kvm";

/// Check if KVM is available on this system.
pub fn is_available() -> bool {
    std::path::Path::new(KVM_DEVICE).exists()
}

/// API version this crate was built against.
pub const fn expected_api_version() -> i32 {
    KVM_API_VERSION as i32
}

/// Require an exact API version match.
///
/// A newer kernel is rejected as well as an older one.
pub fn check_api_version(reported: i32, expected: i32) -> Result<()> {
    if reported != expected {
        return Err(Error::ApiVersionMismatch { reported, expected });
    }
    Ok(())
}

/// An open, version-checked handle to the KVM device.
pub struct Device {
    kvm: Kvm,
}

impl Device {
    /// Open `/dev/kvm` and verify its API version.
    pub fn open() -> Result<Self> {
        if !is_available() {
            return Err(Error::HypervisorNotAvailable);
        }

        let kvm = Kvm::new().map_err(Error::OpenDevice)?;
        let reported = kvm.get_api_version();
        check_api_version(reported, expected_api_version())?;
        info!("KVM API version: {reported}");

        Ok(Self { kvm })
    }

    /// API version reported by the kernel.
    pub fn api_version(&self) -> i32 {
        self.kvm.get_api_version()
    }

    /// Create an empty VM with no memory and no vCPU.
    pub fn create_vm(&self) -> Result<Vm> {
        let run_size = self.kvm.get_vcpu_mmap_size().map_err(Error::VcpuMmapSize)?;
        let fd = self.kvm.create_vm().map_err(Error::CreateVm)?;
        debug!("VM created, kvm_run area 0x{run_size:x} bytes");
        Ok(Vm::new(fd, run_size))
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("api_version", &self.api_version())
            .finish()
    }
}
