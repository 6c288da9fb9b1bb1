//! Global Descriptor Table for 64-bit long mode.
//!
//! Descriptors are handled as plain `u64` words. Each field has an explicit
//! shift/mask accessor; nothing depends on struct layout.
//!
//! ```text
//! 63      56 55 54 53 52 51   48 47 46 45 44 43  40 39        16 15        0
//! +---------+--+--+--+---+-------+--+-----+--+-----+------------+-----------+
//! |base31:24| G|DB| L|AVL|lim19:16| P| DPL | S|type |  base23:0  | lim15:0   |
//! +---------+--+--+--+---+-------+--+-----+--+-----+------------+-----------+
//! ```

use kvm_bindings::kvm_segment;

use crate::error::Result;
use crate::memory::GuestRegion;

/// Size of one descriptor in bytes.
pub const DESCRIPTOR_SIZE: usize = 8;

/// Entry indices. The selector of entry `i` is `i * 8`.
pub const NULL_INDEX: u16 = 0;
pub const CODE_INDEX: u16 = 1;
pub const DATA_INDEX: u16 = 2;
pub const TSS_INDEX: u16 = 3;

/// Number of entries in the boot GDT.
pub const GDT_ENTRY_COUNT: usize = 4;

/// Size of the boot GDT in bytes.
pub const GDT_SIZE: usize = GDT_ENTRY_COUNT * DESCRIPTOR_SIZE;

/// Present, ring 0, code, execute/read, accessed; G=1, L=1.
pub const FLAGS_CODE64: u16 = 0xa09b;

/// Present, ring 0, data, read/write, accessed; G=1, DB=1.
pub const FLAGS_DATA: u16 = 0xc093;

/// Present, ring 0, system, 64-bit TSS (busy); G=1.
pub const FLAGS_TSS: u16 = 0x808b;

/// Flat 4 GiB limit (20 bits, page granular).
pub const FLAT_LIMIT: u32 = 0xfffff;

/// Build a descriptor from packed flags, base and 20-bit limit.
///
/// `flags[7:0]` is the access byte (P, DPL, S, type) and `flags[15:12]` is
/// the G/DB/L/AVL nibble; `flags[11:8]` is ignored.
pub const fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    let flags = flags as u64;
    let base = base as u64;
    let limit = limit as u64;

    ((base & 0xff00_0000) << (56 - 24))
        | ((flags & 0x0000_f0ff) << 40)
        | ((limit & 0x000f_0000) << (48 - 16))
        | ((base & 0x00ff_ffff) << 16)
        | (limit & 0x0000_ffff)
}

/// Segment base, bits 63:56 and 39:16.
pub fn get_base(entry: u64) -> u32 {
    (((entry & 0xff00_0000_0000_0000) >> 32)
        | ((entry & 0x0000_00ff_0000_0000) >> 16)
        | ((entry & 0x0000_0000_ffff_0000) >> 16)) as u32
}

/// Raw 20-bit segment limit, bits 51:48 and 15:0.
pub fn get_limit(entry: u64) -> u32 {
    (((entry & 0x000f_0000_0000_0000) >> 32) | (entry & 0x0000_0000_0000_ffff)) as u32
}

/// Granularity, bit 55.
pub fn get_g(entry: u64) -> u8 {
    ((entry & 0x0080_0000_0000_0000) >> 55) as u8
}

/// Default operation size, bit 54.
pub fn get_db(entry: u64) -> u8 {
    ((entry & 0x0040_0000_0000_0000) >> 54) as u8
}

/// 64-bit code segment, bit 53.
pub fn get_l(entry: u64) -> u8 {
    ((entry & 0x0020_0000_0000_0000) >> 53) as u8
}

/// Available for system use, bit 52.
pub fn get_avl(entry: u64) -> u8 {
    ((entry & 0x0010_0000_0000_0000) >> 52) as u8
}

/// Present, bit 47.
pub fn get_p(entry: u64) -> u8 {
    ((entry & 0x0000_8000_0000_0000) >> 47) as u8
}

/// Descriptor privilege level, bits 46:45.
pub fn get_dpl(entry: u64) -> u8 {
    ((entry & 0x0000_6000_0000_0000) >> 45) as u8
}

/// Descriptor type (0 = system, 1 = code/data), bit 44.
pub fn get_s(entry: u64) -> u8 {
    ((entry & 0x0000_1000_0000_0000) >> 44) as u8
}

/// Segment type, bits 43:40.
pub fn get_type(entry: u64) -> u8 {
    ((entry & 0x0000_0f00_0000_0000) >> 40) as u8
}

/// A descriptor split into its discrete fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorFields {
    pub base: u32,
    /// Raw 20-bit limit, in units selected by `g`.
    pub limit: u32,
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
}

impl DescriptorFields {
    /// Split a raw descriptor into fields.
    pub fn decode(entry: u64) -> Self {
        Self {
            base: get_base(entry),
            limit: get_limit(entry),
            type_: get_type(entry),
            present: get_p(entry),
            dpl: get_dpl(entry),
            db: get_db(entry),
            s: get_s(entry),
            l: get_l(entry),
            g: get_g(entry),
            avl: get_avl(entry),
        }
    }

    /// Pack the fields back into a raw descriptor.
    pub fn encode(&self) -> u64 {
        let access = (u16::from(self.present & 1) << 7)
            | (u16::from(self.dpl & 0b11) << 5)
            | (u16::from(self.s & 1) << 4)
            | u16::from(self.type_ & 0xf);
        let nibble = (u16::from(self.g & 1) << 15)
            | (u16::from(self.db & 1) << 14)
            | (u16::from(self.l & 1) << 13)
            | (u16::from(self.avl & 1) << 12);
        gdt_entry(nibble | access, self.base, self.limit)
    }

    /// Limit in bytes, scaled by the granularity bit.
    pub fn byte_limit(&self) -> u32 {
        if self.g == 0 {
            self.limit
        } else {
            (self.limit << 12) | 0xfff
        }
    }
}

/// Segment selector for a GDT index (RPL 0, GDT).
pub const fn selector(index: u16) -> u16 {
    index * DESCRIPTOR_SIZE as u16
}

/// Decode a raw descriptor into the segment-register form KVM expects.
///
/// A descriptor without the present bit is loaded as unusable.
pub fn segment_from_descriptor(entry: u64, index: u16) -> kvm_segment {
    let fields = DescriptorFields::decode(entry);
    kvm_segment {
        base: u64::from(fields.base),
        limit: fields.byte_limit(),
        selector: selector(index),
        type_: fields.type_,
        present: fields.present,
        dpl: fields.dpl,
        db: fields.db,
        s: fields.s,
        l: fields.l,
        g: fields.g,
        avl: fields.avl,
        unusable: u8::from(fields.present == 0),
        padding: 0,
    }
}

/// The four boot descriptors: null, flat 64-bit code, flat data, TSS.
pub const fn boot_descriptors() -> [u64; GDT_ENTRY_COUNT] {
    [
        gdt_entry(0, 0, 0),
        gdt_entry(FLAGS_CODE64, 0, FLAT_LIMIT),
        gdt_entry(FLAGS_DATA, 0, FLAT_LIMIT),
        gdt_entry(FLAGS_TSS, 0, FLAT_LIMIT),
    ]
}

/// Write the boot GDT at the start of `region` and return its entries.
pub fn build_gdt(region: &mut GuestRegion) -> Result<[u64; GDT_ENTRY_COUNT]> {
    let entries = boot_descriptors();
    for (index, entry) in entries.iter().enumerate() {
        region.write_u64(index * DESCRIPTOR_SIZE, *entry)?;
    }
    Ok(entries)
}

/// Read descriptor `index` back from a GDT region.
pub fn read_descriptor(region: &GuestRegion, index: u16) -> Result<u64> {
    region.read_u64(usize::from(index) * DESCRIPTOR_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_boot_descriptor_values() {
        let gdt = boot_descriptors();
        assert_eq!(gdt[0], 0);
        assert_eq!(gdt[1], 0x00af_9b00_0000_ffff);
        assert_eq!(gdt[2], 0x00cf_9300_0000_ffff);
        assert_eq!(gdt[3], 0x008f_8b00_0000_ffff);
    }

    #[test]
    fn test_code_segment_is_long_mode() {
        let cs = segment_from_descriptor(boot_descriptors()[1], CODE_INDEX);
        assert_eq!(cs.selector, 0x08);
        assert_eq!(cs.type_, 0xb);
        assert_eq!((cs.present, cs.s, cs.l, cs.db, cs.g), (1, 1, 1, 0, 1));
        assert_eq!(cs.limit, 0xffff_ffff);
        assert_eq!(cs.unusable, 0);
    }

    #[test]
    fn test_data_and_task_segments() {
        let ds = segment_from_descriptor(boot_descriptors()[2], DATA_INDEX);
        assert_eq!(ds.selector, 0x10);
        assert_eq!(ds.type_, 0x3);
        assert_eq!((ds.present, ds.s, ds.l, ds.db), (1, 1, 0, 1));

        let tr = segment_from_descriptor(boot_descriptors()[3], TSS_INDEX);
        assert_eq!(tr.selector, 0x18);
        assert_eq!(tr.type_, 0xb);
        assert_eq!((tr.present, tr.s), (1, 0));
    }

    #[test]
    fn test_null_descriptor_is_unusable() {
        let seg = segment_from_descriptor(0, NULL_INDEX);
        assert_eq!(seg.selector, 0);
        assert_eq!(seg.present, 0);
        assert_eq!(seg.unusable, 1);
    }

    #[test]
    fn test_byte_limit_follows_granularity() {
        let fields = DescriptorFields { limit: 0xfffff, g: 0, ..Default::default() };
        assert_eq!(fields.byte_limit(), 0xfffff);
        let fields = DescriptorFields { limit: 0xfffff, g: 1, ..Default::default() };
        assert_eq!(fields.byte_limit(), 0xffff_ffff);
    }

    #[test]
    fn test_build_gdt_writes_region() {
        let mut region = GuestRegion::new(2, 0x5000, GDT_SIZE).unwrap();
        let entries = build_gdt(&mut region).unwrap();
        for index in 0..GDT_ENTRY_COUNT as u16 {
            assert_eq!(
                read_descriptor(&region, index).unwrap(),
                entries[usize::from(index)]
            );
        }
    }

    proptest! {
        #[test]
        fn prop_decode_encode_is_identity(entry in any::<u64>()) {
            prop_assert_eq!(DescriptorFields::decode(entry).encode(), entry);
        }

        #[test]
        fn prop_gdt_entry_fields_round_trip(
            flags in any::<u16>(),
            base in any::<u32>(),
            limit in 0u32..=0xfffff,
        ) {
            let entry = gdt_entry(flags, base, limit);
            let fields = DescriptorFields::decode(entry);
            prop_assert_eq!(fields.base, base);
            prop_assert_eq!(fields.limit, limit);
            prop_assert_eq!(u16::from(fields.type_), flags & 0xf);
            prop_assert_eq!(u16::from(fields.s), (flags >> 4) & 1);
            prop_assert_eq!(u16::from(fields.dpl), (flags >> 5) & 0b11);
            prop_assert_eq!(u16::from(fields.present), (flags >> 7) & 1);
            prop_assert_eq!(u16::from(fields.avl), (flags >> 12) & 1);
            prop_assert_eq!(u16::from(fields.l), (flags >> 13) & 1);
            prop_assert_eq!(u16::from(fields.db), (flags >> 14) & 1);
            prop_assert_eq!(u16::from(fields.g), (flags >> 15) & 1);
        }
    }
}
