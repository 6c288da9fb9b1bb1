//! Identity-mapped x86-64 page tables.
//!
//! Both layouts live in one contiguous region starting at `phys_base`:
//!
//! ```text
//! +0x0000  PML4   entry 0 -> PDPT
//! +0x1000  PDPT   entry 0 -> PD
//! +0x2000  PD     huge:   512 x 2 MiB pages
//!                 normal: entry 0 -> PT
//! +0x3000  PT     normal only: 512 x 4 KiB pages
//! ```

use std::fmt;
use std::str::FromStr;

use log::debug;

use crate::error::{Error, Result};
use crate::memory::{GuestRegion, PAGE_SIZE};

/// Page is present.
pub const PRESENT: u64 = 1 << 0;
/// Page is writable.
pub const WRITABLE: u64 = 1 << 1;
/// PDE maps a 2 MiB page instead of pointing to a PT.
pub const PAGE_SIZE_BIT: u64 = 1 << 7;
/// Physical address bits 51:12 of an entry.
pub const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Entries per table.
pub const ENTRIES_PER_TABLE: usize = 512;

const PML4_OFFSET: usize = 0;
const PDPT_OFFSET: usize = 0x1000;
const PD_OFFSET: usize = 0x2000;
const PT_OFFSET: usize = 0x3000;

const HUGE_PAGE_SIZE: u64 = 2 << 20;

/// Which paging layout to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PagingMode {
    /// PML4, PDPT and PD with 2 MiB pages.
    #[default]
    Huge,
    /// PML4, PDPT, PD and a single PT with 4 KiB pages.
    Normal,
}

impl PagingMode {
    /// Size of the identity-mapped window starting at guest address 0.
    pub fn window(self) -> u64 {
        match self {
            PagingMode::Huge => ENTRIES_PER_TABLE as u64 * HUGE_PAGE_SIZE,
            PagingMode::Normal => (ENTRIES_PER_TABLE * PAGE_SIZE) as u64,
        }
    }

    /// Bytes of table memory the layout needs.
    pub fn tables_size(self) -> usize {
        match self {
            PagingMode::Huge => 3 * PAGE_SIZE,
            PagingMode::Normal => 4 * PAGE_SIZE,
        }
    }
}

impl fmt::Display for PagingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PagingMode::Huge => write!(f, "huge"),
            PagingMode::Normal => write!(f, "normal"),
        }
    }
}

impl FromStr for PagingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "huge" => Ok(PagingMode::Huge),
            "normal" => Ok(PagingMode::Normal),
            other => Err(format!("unknown paging mode '{other}' (expected huge or normal)")),
        }
    }
}

/// Entry pointing at the next-level table at `table_addr`.
fn table_entry(table_addr: u64) -> u64 {
    (table_addr & ADDR_MASK) | PRESENT | WRITABLE
}

fn prepare(region: &mut GuestRegion, mode: PagingMode) -> Result<()> {
    let needed = mode.tables_size();
    if region.size() < needed {
        return Err(Error::TableRegionTooSmall {
            needed,
            actual: region.size(),
        });
    }
    region.as_mut_slice()[..needed].fill(0);
    Ok(())
}

/// Build a 1 GiB identity map out of 2 MiB pages.
pub fn build_paging_huge(region: &mut GuestRegion, phys_base: u64) -> Result<()> {
    prepare(region, PagingMode::Huge)?;

    region.write_u64(PML4_OFFSET, table_entry(phys_base + PDPT_OFFSET as u64))?;
    region.write_u64(PDPT_OFFSET, table_entry(phys_base + PD_OFFSET as u64))?;
    for i in 0..ENTRIES_PER_TABLE {
        let page = (i as u64) * HUGE_PAGE_SIZE;
        region.write_u64(
            PD_OFFSET + i * 8,
            (page & ADDR_MASK) | PRESENT | WRITABLE | PAGE_SIZE_BIT,
        )?;
    }

    debug!("paging: huge, PML4 at 0x{phys_base:x}, window 0x{:x}", PagingMode::Huge.window());
    Ok(())
}

/// Build a 2 MiB identity map out of 4 KiB pages, using the first PT only.
pub fn build_paging_normal(region: &mut GuestRegion, phys_base: u64) -> Result<()> {
    prepare(region, PagingMode::Normal)?;

    region.write_u64(PML4_OFFSET, table_entry(phys_base + PDPT_OFFSET as u64))?;
    region.write_u64(PDPT_OFFSET, table_entry(phys_base + PD_OFFSET as u64))?;
    region.write_u64(PD_OFFSET, table_entry(phys_base + PT_OFFSET as u64))?;
    for i in 0..ENTRIES_PER_TABLE {
        let page = (i * PAGE_SIZE) as u64;
        region.write_u64(PT_OFFSET + i * 8, (page & ADDR_MASK) | PRESENT | WRITABLE)?;
    }

    debug!("paging: normal, PML4 at 0x{phys_base:x}, window 0x{:x}", PagingMode::Normal.window());
    Ok(())
}

/// Build the tables for `mode`.
pub fn build_paging(mode: PagingMode, region: &mut GuestRegion, phys_base: u64) -> Result<()> {
    match mode {
        PagingMode::Huge => build_paging_huge(region, phys_base),
        PagingMode::Normal => build_paging_normal(region, phys_base),
    }
}

fn read_entry(tables: &[u8], phys_base: u64, table_addr: u64, index: u64) -> Option<u64> {
    let offset = table_addr.checked_sub(phys_base)? as usize + (index as usize) * 8;
    let bytes = tables.get(offset..offset + 8)?;
    let entry = u64::from_le_bytes(bytes.try_into().ok()?);
    (entry & PRESENT != 0).then_some(entry)
}

/// Walk the tables in `tables` (loaded at `phys_base`) the way the MMU does.
///
/// Returns `None` for a non-present entry or a table outside `tables`.
pub fn translate(tables: &[u8], phys_base: u64, vaddr: u64) -> Option<u64> {
    let pml4e = read_entry(tables, phys_base, phys_base, (vaddr >> 39) & 0x1ff)?;
    let pdpte = read_entry(tables, phys_base, pml4e & ADDR_MASK, (vaddr >> 30) & 0x1ff)?;
    let pde = read_entry(tables, phys_base, pdpte & ADDR_MASK, (vaddr >> 21) & 0x1ff)?;
    if pde & PAGE_SIZE_BIT != 0 {
        let base = pde & ADDR_MASK & !(HUGE_PAGE_SIZE - 1);
        return Some(base | (vaddr & (HUGE_PAGE_SIZE - 1)));
    }
    let pte = read_entry(tables, phys_base, pde & ADDR_MASK, (vaddr >> 12) & 0x1ff)?;
    Some((pte & ADDR_MASK) | (vaddr & (PAGE_SIZE as u64 - 1)))
}
