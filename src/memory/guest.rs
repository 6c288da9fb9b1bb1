//! Host-backed guest memory region.

use std::ptr::NonNull;

use log::debug;

use super::{round_up_to_page, PAGE_SIZE};
use crate::error::{Error, Result};

/// One block of guest-physical memory backed by an anonymous host mapping.
///
/// The region exclusively owns its mapping; it is unmapped on drop. The
/// host may read and write it through the slice accessors only while it
/// holds a borrow, which the owning `Vm` never hands out across a resume
/// call. The raw pointer keeps this type `!Send` and `!Sync`.
#[derive(Debug)]
pub struct GuestRegion {
    /// KVM memory slot
    slot: u32,
    /// Guest physical address of the first byte
    guest_addr: u64,
    /// Host mapping
    ptr: NonNull<u8>,
    /// Size in bytes, a multiple of [`PAGE_SIZE`]
    size: usize,
}

impl GuestRegion {
    /// Allocate a zeroed, page-aligned host mapping for a guest region.
    ///
    /// `requested_size` is rounded up to the next page boundary.
    pub fn new(slot: u32, guest_addr: u64, requested_size: usize) -> Result<Self> {
        if requested_size == 0 {
            return Err(Error::MemoryAllocationFailed(
                "Size must be greater than 0".to_string(),
            ));
        }
        if guest_addr % PAGE_SIZE as u64 != 0 {
            return Err(Error::MisalignedGuestAddress(guest_addr));
        }

        let size = round_up_to_page(requested_size).ok_or_else(|| {
            Error::MemoryAllocationFailed(format!(
                "size 0x{requested_size:x} cannot be rounded to a page multiple"
            ))
        })?;
        // The region must end at or below the top of the address space.
        guest_addr
            .checked_add(size as u64)
            .ok_or(Error::InvalidGuestAddress(guest_addr))?;
        debug!("slot {slot}: mmap size 0x{requested_size:x} -> 0x{size:x}");

        // MAP_SHARED keeps the pages stable for KVM to pin; mmap returns
        // page-aligned, zero-filled memory.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::MemoryAllocationFailed(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
            Error::MemoryAllocationFailed("mmap returned a null mapping".to_string())
        })?;

        Ok(Self {
            slot,
            guest_addr,
            ptr,
            size,
        })
    }

    /// KVM memory slot of this region.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Guest physical address of the first byte.
    pub fn guest_addr(&self) -> u64 {
        self.guest_addr
    }

    /// Guest physical address one past the last byte.
    pub fn end_addr(&self) -> u64 {
        self.guest_addr + self.size as u64
    }

    /// Size of the region in bytes (page multiple).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Host virtual address of the mapping, as KVM expects it.
    pub fn host_addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Check if an address falls within this region.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.guest_addr && addr < self.end_addr()
    }

    /// Get a slice view of the region.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is a live mapping of `size` bytes owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Get a mutable slice view of the region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self makes the view exclusive on the host.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    /// Read bytes at an offset from the start of the region.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let end = self.checked_end(offset, buf.len())?;
        buf.copy_from_slice(&self.as_slice()[offset..end]);
        Ok(())
    }

    /// Write bytes at an offset from the start of the region.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = self.checked_end(offset, data.len())?;
        self.as_mut_slice()[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Read a little-endian u64 at an offset.
    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        let mut bytes = [0u8; 8];
        self.read(offset, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Write a little-endian u64 at an offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Fill the whole region with one byte value.
    pub fn fill(&mut self, value: u8) {
        self.as_mut_slice().fill(value);
    }

    fn checked_end(&self, offset: usize, len: usize) -> Result<usize> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(end),
            _ => Err(Error::InvalidGuestAddress(
                self.guest_addr.saturating_add(offset as u64),
            )),
        }
    }
}

impl Drop for GuestRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.size);
        }
    }
}
