//! # barevm
//!
//! Runs a raw x86-64 machine-code blob directly in 64-bit long mode on
//! Linux KVM. There is no firmware and no guest OS: the host installs the
//! page tables, the GDT and the registers, then drives the vCPU until the
//! guest executes `HLT`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use barevm::{ExitDispatcher, LaunchConfig, Launcher, Result};
//!
//! fn main() -> Result<()> {
//!     let config = LaunchConfig::builder("guest.bin").build()?;
//!     let mut launcher = Launcher::new(config)?;
//!     let report = launcher.run(&mut ExitDispatcher::new())?;
//!     println!("halted after {} resume(s)", report.summary.resumes);
//!     Ok(())
//! }
//! ```
//!
//! ## Guest devices
//!
//! - **COM1** (port 0x3F8): one-byte `OUT`s are copied to stdout
//! - **MMIO**: reads of unmapped addresses return 0x12, writes are logged

mod builder;
pub mod debug;
mod error;
pub mod exit;
mod launcher;
pub mod runner;

pub mod backend;
pub mod device;
pub mod loader;
pub mod memory;

// Re-exports
pub use backend::LaunchConfig;
pub use builder::LaunchBuilder;
pub use device::{DispatchStats, ExitDispatcher};
pub use error::{Error, ErrorCategory, Result};
pub use exit::{ExitAction, ExitHandler, IoDirection, VcpuExit};
pub use launcher::{validate_payload, LaunchReport, Launcher};
pub use loader::paging::PagingMode;
pub use runner::{RunState, RunSummary};

/// Check if the current platform supports hardware virtualization.
///
/// Returns `true` if the hypervisor device node exists. It may still be
/// unusable, for instance without read/write permission.
pub fn is_supported() -> bool {
    backend::is_available()
}

/// Get the name of the hypervisor backend for the current platform.
///
/// Returns `None` if no backend is available.
pub fn backend_name() -> Option<&'static str> {
    backend::name()
}
