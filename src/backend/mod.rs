//! Hypervisor backend.
//!
//! Only Linux KVM is supported. This module holds the configuration the
//! launcher consumes and the availability checks the CLI runs first.

use std::path::PathBuf;

use crate::builder::LaunchBuilder;
use crate::loader::paging::PagingMode;

pub mod kvm;

/// Configuration for launching one guest.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Path to the raw guest code image.
    pub payload: PathBuf,
    /// Offset of the first instruction from the start of the code region.
    pub entry_offset: u64,
    /// Page table layout to install.
    pub paging: PagingMode,
    /// Dump registers after every handled exit.
    pub trace_exits: bool,
    /// Dump the top of the stack when the guest stops.
    pub stack_dump: bool,
}

impl LaunchConfig {
    /// Configuration with defaults: entry offset 0, huge pages, stack dump on.
    pub fn new(payload: impl Into<PathBuf>) -> Self {
        Self {
            payload: payload.into(),
            entry_offset: 0,
            paging: PagingMode::default(),
            trace_exits: false,
            stack_dump: true,
        }
    }

    /// Start building a configuration for `payload`.
    pub fn builder(payload: impl Into<PathBuf>) -> LaunchBuilder {
        LaunchBuilder::new(payload)
    }
}

/// Check if the hypervisor device node is present on this platform.
pub fn is_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        kvm::is_available()
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Get the name of the backend for this platform.
pub fn name() -> Option<&'static str> {
    #[cfg(target_os = "linux")]
    {
        Some("kvm")
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_config_defaults() {
        let config = LaunchConfig::new("guest.bin");
        assert_eq!(config.payload, PathBuf::from("guest.bin"));
        assert_eq!(config.entry_offset, 0);
        assert_eq!(config.paging, PagingMode::Huge);
        assert!(!config.trace_exits);
        assert!(config.stack_dump);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_backend_name() {
        assert_eq!(name(), Some("kvm"));
    }
}
