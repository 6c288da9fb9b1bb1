//! Guest physical memory.
//!
//! Guest memory is a set of independent regions, each registered with KVM
//! under its own slot. [`GuestMemoryMap`] keeps the slot bookkeeping and
//! resolves guest-physical addresses to host bytes.

mod guest;

pub use guest::GuestRegion;

use crate::error::{Error, Result};

/// Guest page size. Region sizes and guest addresses are multiples of it.
pub const PAGE_SIZE: usize = 0x1000;

/// Round a size up to the next multiple of [`PAGE_SIZE`].
///
/// Returns `None` when the rounded size does not fit in a `usize`.
pub fn round_up_to_page(size: usize) -> Option<usize> {
    size.checked_next_multiple_of(PAGE_SIZE)
}

/// Guest physical layout used by the launcher.
///
/// Everything sits below the code region so a payload can grow upward
/// without colliding with the tables or the stack.
pub mod layout {
    /// Paging structures (PML4, PDPT, PD, PT): 0x1000 - 0x5000
    pub const PAGE_TABLES_SLOT: u32 = 1;
    pub const PAGE_TABLES_START: u64 = 0x1000;
    pub const PAGE_TABLES_SIZE: usize = 0x4000;

    /// GDT: one page at 0x5000
    pub const GDT_SLOT: u32 = 2;
    pub const GDT_START: u64 = 0x5000;

    /// Stack: 0x6000 - 0x10000, grows down from the code base
    pub const STACK_SLOT: u32 = 3;
    pub const STACK_START: u64 = 0x6000;
    pub const STACK_SIZE: usize = (CODE_START - STACK_START) as usize;
    pub const STACK_TOP: u64 = STACK_START + STACK_SIZE as u64;

    /// Fill byte for a fresh stack, so untouched slots stand out in dumps.
    pub const STACK_FILL: u8 = 0xfe;

    /// Raw payload: 0x10000 upward
    pub const CODE_SLOT: u32 = 0;
    pub const CODE_START: u64 = 0x10000;
}

/// The set of guest regions belonging to one VM, keyed by slot.
#[derive(Debug, Default)]
pub struct GuestMemoryMap {
    regions: Vec<GuestRegion>,
}

impl GuestMemoryMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that a region could be inserted: free slot, no overlap.
    pub fn check_free(&self, slot: u32, guest_addr: u64, size: usize) -> Result<()> {
        let end = guest_addr
            .checked_add(size as u64)
            .ok_or(Error::InvalidGuestAddress(guest_addr))?;
        for region in &self.regions {
            if region.slot() == slot {
                return Err(Error::SlotInUse(slot));
            }
            if guest_addr < region.end_addr() && region.guest_addr() < end {
                return Err(Error::RegionOverlap {
                    slot: region.slot(),
                    start: guest_addr,
                    end,
                });
            }
        }
        Ok(())
    }

    /// Take ownership of a region.
    pub fn insert(&mut self, region: GuestRegion) -> Result<&mut GuestRegion> {
        self.check_free(region.slot(), region.guest_addr(), region.size())?;
        self.regions.push(region);
        let index = self.regions.len() - 1;
        Ok(&mut self.regions[index])
    }

    /// Get a region by slot.
    pub fn region(&self, slot: u32) -> Option<&GuestRegion> {
        self.regions.iter().find(|r| r.slot() == slot)
    }

    /// Find the region backing a guest physical address.
    pub fn find(&self, addr: u64) -> Option<&GuestRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    /// Read guest memory at a guest physical address.
    ///
    /// The read must not cross a region boundary.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let region = self.find(addr).ok_or(Error::InvalidGuestAddress(addr))?;
        let offset = (addr - region.guest_addr()) as usize;
        region.read(offset, buf)
    }

    /// Write guest memory at a guest physical address.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.contains(addr))
            .ok_or(Error::InvalidGuestAddress(addr))?;
        let offset = (addr - region.guest_addr()) as usize;
        region.write(offset, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_round_up_to_page() {
        assert_eq!(round_up_to_page(0), Some(0));
        assert_eq!(round_up_to_page(1), Some(0x1000));
        assert_eq!(round_up_to_page(0x1000), Some(0x1000));
        assert_eq!(round_up_to_page(0x1001), Some(0x2000));
        assert_eq!(round_up_to_page(8 * 4), Some(0x1000));
    }

    #[test]
    fn test_round_up_to_page_near_usize_max() {
        assert_eq!(round_up_to_page(usize::MAX - 10), None);

        // Highest page multiple rounds to itself, one byte more has no room.
        let last_page = usize::MAX - (PAGE_SIZE - 1);
        assert_eq!(round_up_to_page(last_page), Some(last_page));
        assert_eq!(round_up_to_page(last_page + 1), None);
    }

    #[test]
    fn test_region_past_end_of_address_space() {
        let map = GuestMemoryMap::new();
        assert!(matches!(
            map.check_free(1, 0xffff_ffff_ffff_f000, 0x2000),
            Err(Error::InvalidGuestAddress(0xffff_ffff_ffff_f000))
        ));
        assert!(map.check_free(1, 0xffff_ffff_ffff_e000, 0x2000).is_ok());
    }

    #[test]
    fn test_layout_regions_do_not_overlap() {
        use layout::*;
        assert!(PAGE_TABLES_START + PAGE_TABLES_SIZE as u64 <= GDT_START);
        assert!(GDT_START + PAGE_SIZE as u64 <= STACK_START);
        assert_eq!(STACK_TOP, CODE_START);
        for addr in [PAGE_TABLES_START, GDT_START, STACK_START, CODE_START] {
            assert_eq!(addr % PAGE_SIZE as u64, 0);
        }
    }

    #[test]
    fn test_slots_are_unique() {
        let mut map = GuestMemoryMap::new();
        map.insert(GuestRegion::new(0, 0x10000, 0x1000).unwrap()).unwrap();

        let dup = GuestRegion::new(0, 0x20000, 0x1000).unwrap();
        assert!(matches!(map.insert(dup), Err(Error::SlotInUse(0))));
    }

    #[test]
    fn test_regions_cannot_overlap() {
        let mut map = GuestMemoryMap::new();
        map.insert(GuestRegion::new(0, 0x10000, 0x2000).unwrap()).unwrap();

        let overlapping = GuestRegion::new(1, 0x11000, 0x1000).unwrap();
        assert!(matches!(
            map.insert(overlapping),
            Err(Error::RegionOverlap { slot: 0, .. })
        ));

        let adjacent = GuestRegion::new(1, 0x12000, 0x1000).unwrap();
        assert!(map.insert(adjacent).is_ok());
    }

    #[test]
    fn test_read_write_by_guest_address() {
        let mut map = GuestMemoryMap::new();
        map.insert(GuestRegion::new(3, 0x6000, 0xa000).unwrap()).unwrap();
        map.insert(GuestRegion::new(0, 0x10000, 0x10).unwrap()).unwrap();

        map.write(0x10004, &[0xf4]).unwrap();
        let mut byte = [0u8];
        map.read(0x10004, &mut byte).unwrap();
        assert_eq!(byte, [0xf4]);
        assert_eq!(map.region(0).unwrap().as_slice()[4], 0xf4);

        assert!(matches!(
            map.read(0x2000_0000, &mut byte),
            Err(Error::InvalidGuestAddress(0x2000_0000))
        ));
        assert_eq!(map.find(0x6000).map(GuestRegion::slot), Some(3));
        assert!(map.find(0x10000 + PAGE_SIZE as u64).is_none());
    }

    proptest! {
        #[test]
        fn prop_round_up_to_page(size in any::<usize>()) {
            match round_up_to_page(size) {
                Some(rounded) => {
                    prop_assert_eq!(rounded % PAGE_SIZE, 0);
                    prop_assert!(rounded >= size);
                    prop_assert!(rounded - size < PAGE_SIZE);
                }
                None => prop_assert!(size > usize::MAX - (PAGE_SIZE - 1)),
            }
        }
    }
}
