//! Builder for launch configurations.

use std::path::PathBuf;

use crate::backend::LaunchConfig;
use crate::error::{Error, Result};
use crate::loader::paging::PagingMode;

/// Builder for a [`LaunchConfig`].
///
/// # Example
///
/// ```rust,no_run
/// use barevm::{LaunchConfig, PagingMode};
///
/// let config = LaunchConfig::builder("/path/to/guest.bin")
///     .entry_offset(0x10)
///     .paging(PagingMode::Normal)
///     .trace_exits(true)
///     .build()?;
/// # Ok::<(), barevm::Error>(())
/// ```
#[derive(Debug)]
pub struct LaunchBuilder {
    payload: PathBuf,
    entry_offset: Option<u64>,
    paging: Option<PagingMode>,
    trace_exits: bool,
    stack_dump: Option<bool>,
}

impl LaunchBuilder {
    /// Create a builder for the given payload path.
    pub fn new(payload: impl Into<PathBuf>) -> Self {
        Self {
            payload: payload.into(),
            entry_offset: None,
            paging: None,
            trace_exits: false,
            stack_dump: None,
        }
    }

    /// Set the entry-point offset inside the payload.
    ///
    /// Default: 0
    pub fn entry_offset(mut self, offset: u64) -> Self {
        self.entry_offset = Some(offset);
        self
    }

    /// Set the page table layout.
    ///
    /// Default: [`PagingMode::Huge`]
    pub fn paging(mut self, mode: PagingMode) -> Self {
        self.paging = Some(mode);
        self
    }

    /// Dump registers after every handled exit.
    pub fn trace_exits(mut self, enabled: bool) -> Self {
        self.trace_exits = enabled;
        self
    }

    /// Dump the top of the stack when the guest stops.
    ///
    /// Default: true
    pub fn stack_dump(mut self, enabled: bool) -> Self {
        self.stack_dump = Some(enabled);
        self
    }

    /// Validate and build the configuration.
    ///
    /// The payload must exist; its contents are checked when it is loaded.
    pub fn build(self) -> Result<LaunchConfig> {
        if !self.payload.exists() {
            return Err(Error::PayloadNotFound(self.payload));
        }

        let mut config = LaunchConfig::new(self.payload);
        config.entry_offset = self.entry_offset.unwrap_or(0);
        config.paging = self.paging.unwrap_or_default();
        config.trace_exits = self.trace_exits;
        config.stack_dump = self.stack_dump.unwrap_or(true);
        Ok(config)
    }
}
