//! Placeholder device for unmapped guest-physical addresses.
//!
//! Reads return a fixed byte pattern and writes are logged and dropped. This
//! lets a guest probe addresses outside its memory slots without stopping.

use log::{debug, info};

/// Value returned in the first byte of every MMIO read.
pub const MMIO_READ_VALUE: u8 = 0x12;

/// Trivial MMIO responder.
#[derive(Debug, Default)]
pub struct MmioStub {
    reads: u64,
    writes: u64,
}

impl MmioStub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a guest read of `data.len()` bytes at `addr`.
    ///
    /// The first byte is [`MMIO_READ_VALUE`], any further bytes are zero.
    pub fn read(&mut self, addr: u64, data: &mut [u8]) {
        data.fill(0);
        if let Some(first) = data.first_mut() {
            *first = MMIO_READ_VALUE;
        }
        self.reads += 1;
        debug!(
            "MMIO read {} byte(s) at 0x{addr:016x} -> 0x{MMIO_READ_VALUE:02x}",
            data.len()
        );
    }

    /// Record a guest write of `data` to `addr`; the bytes are discarded.
    pub fn write(&mut self, addr: u64, data: &[u8]) {
        self.writes += 1;
        match write_value(data) {
            Some(value) => info!(
                "MMIO write {} byte(s) at 0x{addr:016x}: 0x{value:016x}",
                data.len()
            ),
            None => info!(
                "MMIO write {} byte(s) at 0x{addr:016x}: {data:02x?}",
                data.len()
            ),
        }
    }

    /// Reads served.
    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// Writes recorded.
    pub fn writes(&self) -> u64 {
        self.writes
    }
}

/// Interpret up to 8 written bytes as a little-endian value.
pub fn write_value(data: &[u8]) -> Option<u64> {
    if data.is_empty() || data.len() > 8 {
        return None;
    }
    let mut bytes = [0u8; 8];
    bytes[..data.len()].copy_from_slice(data);
    Some(u64::from_le_bytes(bytes))
}
