/*!
Parsing and validation of raw dumps.

A raw dump starts with a `RawDumpHeader` followed by `sections_count`
`RawSectionEntry` records. Validation happens in three steps, each
producing the input of the next one:

```text
validate_header -> DumpHeader::validate_sections -> SectionTable::build_memory_map
```

The resulting `DdrMemoryMap` translates physical addresses into file offsets.
*/

pub mod header;
pub mod mem_map;
pub mod section;

#[doc(hidden)]
pub use header::{validate_header, DumpHeader, RawDumpHeader};
#[doc(hidden)]
pub use mem_map::{DdrMemoryMap, DdrRange};
#[doc(hidden)]
pub use section::{RawSectionEntry, SectionStats, SectionTable, SectionType};

use std::mem::size_of;

/// "Raw_Dmp!"
pub const RAW_DUMP_SIGNATURE: u64 = 0x2170_6D44_5F77_6152;
pub const RAW_DUMP_HEADER_VERSION: u32 = 0x1000;
pub const RAW_DUMP_SECTION_VERSION: u32 = 0x1000;

pub const RAW_DUMP_HEADER_SIZE: usize = size_of::<RawDumpHeader>();
pub const RAW_DUMP_SECTION_SIZE: usize = size_of::<RawSectionEntry>();

/// Length of the fixed name field of a section.
pub const SECTION_NAME_LEN: usize = 20;

bitflags! {
    /// Flags of the dump header and of every section.
    ///
    /// A valid header or section carries exactly one of the two flags.
    #[repr(transparent)]
    pub struct DumpFlags: u32 {
        /// The dump or section was written completely.
        const VALID = 0x1;
        /// The dump or section was truncated because the storage was too small.
        const INSUFFICIENT_STORAGE = 0x2;
    }
}

impl DumpFlags {
    /// Accepts exactly one of the defined flags and no undefined bits.
    pub fn validate(raw: u32) -> Option<DumpFlags> {
        let flags = DumpFlags::from_bits(raw)?;
        if flags == DumpFlags::VALID || flags == DumpFlags::INSUFFICIENT_STORAGE {
            Some(flags)
        } else {
            None
        }
    }
}

/// Computes the size of the header together with a table of `sections_count` entries.
pub fn section_table_size(sections_count: u32) -> Option<usize> {
    (sections_count as usize)
        .checked_mul(RAW_DUMP_SECTION_SIZE)?
        .checked_add(RAW_DUMP_HEADER_SIZE)
}

/// Decodes a NUL padded ASCII name.
pub(crate) fn decode_name(raw: &[u8]) -> String {
    let len = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..len]).into_owned()
}

/// Encodes a name into a NUL padded field, truncating if necessary.
pub(crate) fn encode_name(name: &str) -> [u8; SECTION_NAME_LEN] {
    let mut raw = [0u8; SECTION_NAME_LEN];
    for (dst, src) in raw.iter_mut().take(SECTION_NAME_LEN - 1).zip(name.bytes()) {
        *dst = src;
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_exclusive() {
        assert_eq!(DumpFlags::validate(0b01), Some(DumpFlags::VALID));
        assert_eq!(
            DumpFlags::validate(0b10),
            Some(DumpFlags::INSUFFICIENT_STORAGE)
        );
        assert_eq!(DumpFlags::validate(0), None);
        assert_eq!(DumpFlags::validate(0b11), None);
        assert_eq!(DumpFlags::validate(0b100), None);
        assert_eq!(DumpFlags::validate(0b101), None);
        assert_eq!(DumpFlags::validate(0x8000_0001), None);
    }

    #[test]
    fn table_size() {
        assert_eq!(section_table_size(1), Some(56 + 64));
        assert_eq!(section_table_size(3), Some(56 + 3 * 64));
    }

    #[test]
    fn names() {
        let raw = encode_name("DDRCS0_0.BIN");
        assert_eq!(decode_name(&raw), "DDRCS0_0.BIN");
        let raw = encode_name("A_VERY_LONG_SECTION_NAME");
        assert_eq!(raw[SECTION_NAME_LEN - 1], 0);
        assert_eq!(decode_name(&raw), "A_VERY_LONG_SECTION");
    }
}
