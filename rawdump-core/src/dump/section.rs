use super::header::DumpHeader;
use super::mem_map::DdrMemoryMap;
use super::{decode_name, encode_name, DumpFlags, RAW_DUMP_SECTION_VERSION, SECTION_NAME_LEN};
use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::types::Guid;

use std::convert::TryInto;
use std::fmt;

use dataview::{Pod, PodMethods};
use log::{info, warn};

/// The type tag of a section entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SectionType {
    Reserved,
    DdrRange,
    CpuContext,
    SvSpecific,
    Unknown(u32),
}

impl SectionType {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            0 => SectionType::Reserved,
            1 => SectionType::DdrRange,
            2 => SectionType::CpuContext,
            3 => SectionType::SvSpecific,
            n => SectionType::Unknown(n),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            SectionType::Reserved => 0,
            SectionType::DdrRange => 1,
            SectionType::CpuContext => 2,
            SectionType::SvSpecific => 3,
            SectionType::Unknown(n) => n,
        }
    }

    pub fn to_str(self) -> &'static str {
        match self {
            SectionType::Reserved => "reserved",
            SectionType::DdrRange => "DDR_RANGE",
            SectionType::CpuContext => "CPU_CONTEXT",
            SectionType::SvSpecific => "SV_SPECIFIC",
            SectionType::Unknown(_) => "UNKNOWN",
        }
    }
}

/// A section entry as stored in the section table.
///
/// The meaning of `info` depends on the section type:
/// DDR ranges store the physical base address,
/// CPU contexts the architecture (u16) followed by the core count (u32),
/// vendor specific sections a GUID.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct RawSectionEntry {
    pub flags: u32,                    // 0x00
    pub version: u32,                  // 0x04
    pub section_type: u32,             // 0x08
    pub offset: u64,                   // 0x0C
    pub size: u64,                     // 0x14
    pub info: [u8; 16],                // 0x1C
    pub name: [u8; SECTION_NAME_LEN],  // 0x2C
} // size: 0x40
unsafe impl Pod for RawSectionEntry {}

impl RawSectionEntry {
    fn with_type(section_type: SectionType, name: &str, offset: u64, size: u64) -> Self {
        let mut entry = Self::zeroed();
        entry.flags = DumpFlags::VALID.bits();
        entry.version = RAW_DUMP_SECTION_VERSION;
        entry.section_type = section_type.to_u32();
        entry.offset = offset;
        entry.size = size;
        entry.name = encode_name(name);
        entry
    }

    /// Creates a DDR range section.
    pub fn ddr(name: &str, base: u64, offset: u64, size: u64) -> Self {
        let mut entry = Self::with_type(SectionType::DdrRange, name, offset, size);
        entry.info[..8].copy_from_slice(&base.to_le_bytes());
        entry
    }

    /// Creates a CPU context section.
    pub fn cpu_context(name: &str, architecture: u16, core_count: u32, offset: u64, size: u64) -> Self {
        let mut entry = Self::with_type(SectionType::CpuContext, name, offset, size);
        entry.info[..2].copy_from_slice(&architecture.to_le_bytes());
        entry.info[2..6].copy_from_slice(&core_count.to_le_bytes());
        entry
    }

    /// Creates a vendor specific section.
    pub fn sv(name: &str, guid: Guid, offset: u64, size: u64) -> Self {
        let mut entry = Self::with_type(SectionType::SvSpecific, name, offset, size);
        entry.info = guid.to_bytes();
        entry
    }

    pub fn section_type(&self) -> SectionType {
        SectionType::from_u32(self.section_type)
    }

    pub fn name(&self) -> String {
        let name = self.name;
        decode_name(&name)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn is_insufficient_storage(&self) -> bool {
        self.flags & DumpFlags::INSUFFICIENT_STORAGE.bits() != 0
    }

    /// Physical base address of a DDR range section.
    pub fn ddr_base(&self) -> u64 {
        let info = self.info;
        u64::from_le_bytes(info[..8].try_into().unwrap_or([0; 8]))
    }

    /// Processor architecture of a CPU context section.
    pub fn cpu_architecture(&self) -> u16 {
        let info = self.info;
        u16::from_le_bytes([info[0], info[1]])
    }

    /// Number of cores of a CPU context section.
    pub fn cpu_core_count(&self) -> u32 {
        let info = self.info;
        u32::from_le_bytes([info[2], info[3], info[4], info[5]])
    }

    /// GUID of a vendor specific section.
    pub fn sv_guid(&self) -> Guid {
        let info = self.info;
        Guid::from_bytes(&info)
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn set_flags(&mut self, flags: DumpFlags) {
        self.flags = flags.bits();
    }
}

impl fmt::Debug for RawSectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (flags, version, offset, size) = (self.flags, self.version, self.offset, self.size);
        f.debug_struct("RawSectionEntry")
            .field("flags", &format_args!("{:x}", flags))
            .field("version", &format_args!("{:x}", version))
            .field("type", &self.section_type())
            .field("offset", &format_args!("{:x}", offset))
            .field("size", &format_args!("{:x}", size))
            .field("name", &self.name())
            .finish()
    }
}

impl fmt::Display for RawSectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (flags, offset, size) = (self.flags, self.offset, self.size);
        write!(
            f,
            "{:<20} {:<11} flags={:x} offset={:#x} size={:#x}",
            self.name(),
            self.section_type().to_str(),
            flags,
            offset,
            size
        )?;
        match self.section_type() {
            SectionType::DdrRange => write!(f, " base={:#x}", self.ddr_base()),
            SectionType::CpuContext => write!(
                f,
                " architecture={} cores={}",
                self.cpu_architecture(),
                self.cpu_core_count()
            ),
            SectionType::SvSpecific => write!(f, " guid={}", self.sv_guid()),
            _ => Ok(()),
        }
    }
}

/// Counters collected while validating a section table.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SectionStats {
    pub ddr_count: usize,
    pub first_ddr_index: Option<usize>,
    pub total_ddr_size: u64,
    pub cpu_context_count: usize,
    pub total_cpu_context_size: u64,
    /// File offset of the last CPU context section
    pub cpu_context_offset: u64,
    pub cpu_architecture: Option<u16>,
    pub sv_count: usize,
    pub total_sv_size: u64,
    pub largest_sv_size: u64,
    pub invalid_version_count: usize,
    pub invalid_flags_count: usize,
    pub misplaced_insufficient_storage_count: usize,
    pub invalid_type_count: usize,
    /// The last section carries the insufficient storage flag
    pub truncated: bool,
}

impl SectionStats {
    /// Collects the counters over all sections of `header`.
    pub fn collect(header: &DumpHeader) -> Result<Self> {
        let mut stats = SectionStats::default();
        let count = header.sections_count() as usize;
        let mut last_ddr = None;

        for (index, section) in header.sections().enumerate() {
            let version = section.version;
            if version != RAW_DUMP_SECTION_VERSION {
                warn!("section {} has invalid version {:x}", index, version);
                stats.invalid_version_count += 1;
            }

            let flags = section.flags();
            if DumpFlags::validate(flags).is_none() {
                warn!("section {} has invalid flags {:x}", index, flags);
                stats.invalid_flags_count += 1;
            }

            if section.is_insufficient_storage() {
                if index + 1 != count {
                    warn!("section {} has insufficient storage set but is not the last section", index);
                    stats.misplaced_insufficient_storage_count += 1;
                } else {
                    warn!("last section {} is incomplete", index);
                    stats.truncated = true;
                }
            }

            match section.section_type() {
                SectionType::DdrRange => {
                    if let Some(last) = last_ddr {
                        if last + 1 != index {
                            return Err(Error(ErrorOrigin::SectionTable, ErrorKind::DdrSectionsNotAdjacent)
                                .log_warn(format!("ddr section {} follows ddr section {}", index, last)));
                        }
                    }
                    if stats.first_ddr_index.is_none() {
                        stats.first_ddr_index = Some(index);
                    }
                    last_ddr = Some(index);
                    stats.ddr_count += 1;
                    stats.total_ddr_size += section.size();
                }
                SectionType::CpuContext => {
                    stats.cpu_context_count += 1;
                    stats.total_cpu_context_size += section.size();
                    stats.cpu_context_offset = section.offset();
                    stats.cpu_architecture = Some(section.cpu_architecture());
                }
                SectionType::SvSpecific => {
                    stats.sv_count += 1;
                    stats.total_sv_size += section.size();
                    if stats.largest_sv_size < section.size() {
                        stats.largest_sv_size = section.size();
                    }
                }
                SectionType::Reserved | SectionType::Unknown(_) => {
                    stats.invalid_type_count += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Maps the collected counters to the first failing check.
    pub fn check(&self) -> Result<()> {
        let fail = |kind: ErrorKind, count: usize| {
            Err(Error(ErrorOrigin::SectionTable, kind).log_warn(format!("count={} stats={:?}", count, self)))
        };

        if self.ddr_count == 0 {
            fail(ErrorKind::NoDdrSections, 0)
        } else if self.invalid_version_count > 0 {
            fail(ErrorKind::InvalidSectionVersion, self.invalid_version_count)
        } else if self.invalid_flags_count > 0 {
            fail(ErrorKind::InvalidSectionFlags, self.invalid_flags_count)
        } else if self.misplaced_insufficient_storage_count > 0 {
            fail(
                ErrorKind::MisplacedInsufficientStorage,
                self.misplaced_insufficient_storage_count,
            )
        } else if self.invalid_type_count > 0 {
            fail(ErrorKind::InvalidSectionType, self.invalid_type_count)
        } else {
            Ok(())
        }
    }
}

/// A section table which passed validation.
pub struct SectionTable<'a> {
    header: &'a DumpHeader,
    stats: SectionStats,
}

impl<'a> SectionTable<'a> {
    /// Validates the section table of a validated header.
    pub fn validate(header: &'a DumpHeader) -> Result<Self> {
        let stats = SectionStats::collect(header)?;
        stats.check()?;
        Ok(Self { header, stats })
    }

    pub fn header(&self) -> &'a DumpHeader {
        self.header
    }

    pub fn stats(&self) -> &SectionStats {
        &self.stats
    }

    /// All DDR range sections, in table order.
    pub fn ddr_sections(&self) -> impl Iterator<Item = RawSectionEntry> + 'a {
        self.header
            .sections()
            .filter(|s| s.section_type() == SectionType::DdrRange)
    }

    /// Finds a vendor specific section by name, ignoring ascii case.
    pub fn sv_section(&self, name: &str) -> Option<RawSectionEntry> {
        self.header
            .sections()
            .find(|s| s.section_type() == SectionType::SvSpecific && s.name().eq_ignore_ascii_case(name))
    }

    /// Finds a vendor specific section by its GUID.
    pub fn sv_section_by_guid(&self, guid: &Guid) -> Option<RawSectionEntry> {
        self.header
            .sections()
            .find(|s| s.section_type() == SectionType::SvSpecific && s.sv_guid() == *guid)
    }

    /// The last CPU context section of the table.
    pub fn cpu_context(&self) -> Option<RawSectionEntry> {
        self.header
            .sections()
            .filter(|s| s.section_type() == SectionType::CpuContext)
            .last()
    }

    /// Builds the physical memory map from the DDR sections.
    pub fn build_memory_map(&self) -> Result<DdrMemoryMap> {
        let map = DdrMemoryMap::build(self.ddr_sections())?;
        info!(
            "memory map built: ranges={} fragments={}",
            map.len(),
            map.fragmentation_count()
        );
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::header::RawDumpHeader;
    use std::mem::size_of;

    const OCIMEM: Guid = Guid::new(
        0xD0A2_67A1,
        0x9CA5,
        0x471D,
        [0x8E, 0x9C, 0x79, 0xC9, 0x86, 0xBE, 0x77, 0x77],
    );

    fn header(sections: &[RawSectionEntry]) -> DumpHeader {
        let mut raw = RawDumpHeader::new(0);
        raw.dump_size = 0x10_0000;
        DumpHeader::from_parts(raw, sections).unwrap()
    }

    fn table() -> Vec<RawSectionEntry> {
        vec![
            RawSectionEntry::cpu_context("CPU_CTX", 12, 8, 0x200, 0x100),
            RawSectionEntry::ddr("DDRCS0.BIN", 0x8000_0000, 0x1000, 0x1000),
            RawSectionEntry::ddr("DDRCS1.BIN", 0x8000_1000, 0x2000, 0x1000),
            RawSectionEntry::sv("OCIMEM.BIN", OCIMEM, 0x3000, 0x800),
            RawSectionEntry::sv("RST_STAT.BIN", Guid::NIL, 0x3800, 0x4),
        ]
    }

    fn fails_with(sections: &[RawSectionEntry]) -> ErrorKind {
        header(sections).validate_sections().err().unwrap().1
    }

    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<RawSectionEntry>(), 0x40);
    }

    #[test]
    fn test_union_layout() {
        let cpu = RawSectionEntry::cpu_context("CPU", 5, 4, 0, 0);
        let info = cpu.info;
        assert_eq!(&info[..6], &[5, 0, 4, 0, 0, 0]);
        assert_eq!(cpu.cpu_architecture(), 5);
        assert_eq!(cpu.cpu_core_count(), 4);

        let ddr = RawSectionEntry::ddr("DDR", 0x1_2345_6789, 0, 0);
        assert_eq!(ddr.ddr_base(), 0x1_2345_6789);

        let sv = RawSectionEntry::sv("OCIMEM.BIN", OCIMEM, 0, 0);
        assert_eq!(sv.sv_guid(), OCIMEM);
    }

    #[test]
    fn valid_table() {
        let header = header(&table());
        let table = header.validate_sections().unwrap();
        let stats = table.stats();
        assert_eq!(stats.ddr_count, 2);
        assert_eq!(stats.first_ddr_index, Some(1));
        assert_eq!(stats.total_ddr_size, 0x2000);
        assert_eq!(stats.cpu_context_count, 1);
        assert_eq!(stats.cpu_context_offset, 0x200);
        assert_eq!(stats.cpu_architecture, Some(12));
        assert_eq!(stats.sv_count, 2);
        assert_eq!(stats.total_sv_size, 0x804);
        assert_eq!(stats.largest_sv_size, 0x800);
        assert!(!stats.truncated);

        assert_eq!(table.ddr_sections().count(), 2);
        assert_eq!(table.sv_section("ocimem.bin").unwrap().offset(), 0x3000);
        assert_eq!(table.sv_section_by_guid(&OCIMEM).unwrap().name(), "OCIMEM.BIN");
        assert_eq!(table.cpu_context().unwrap().cpu_core_count(), 8);
    }

    #[test]
    fn no_ddr() {
        let sections = [RawSectionEntry::sv("OCIMEM.BIN", OCIMEM, 0x3000, 0x800)];
        assert_eq!(fails_with(&sections), ErrorKind::NoDdrSections);
    }

    #[test]
    fn ddr_not_adjacent() {
        let mut sections = table();
        sections.swap(2, 3);
        assert_eq!(fails_with(&sections), ErrorKind::DdrSectionsNotAdjacent);
    }

    #[test]
    fn insufficient_storage_last_only() {
        let mut sections = table();
        let last = sections.len() - 1;
        sections[last].set_flags(DumpFlags::INSUFFICIENT_STORAGE);
        let header = header(&sections);
        assert!(header.validate_sections().unwrap().stats().truncated);

        let mut sections = table();
        sections[2].set_flags(DumpFlags::INSUFFICIENT_STORAGE);
        assert_eq!(
            fails_with(&sections),
            ErrorKind::MisplacedInsufficientStorage
        );
    }

    #[test]
    fn failure_order() {
        // every kind of defect at once reports the version first
        let mut sections = table();
        sections[0].version = 0x2000;
        sections[0].flags = 0;
        sections[1].set_flags(DumpFlags::INSUFFICIENT_STORAGE);
        sections[3].section_type = 7;
        assert_eq!(fails_with(&sections), ErrorKind::InvalidSectionVersion);

        sections[0].version = RAW_DUMP_SECTION_VERSION;
        assert_eq!(fails_with(&sections), ErrorKind::InvalidSectionFlags);

        sections[0].flags = 3;
        assert_eq!(fails_with(&sections), ErrorKind::InvalidSectionFlags);

        sections[0].set_flags(DumpFlags::VALID);
        assert_eq!(
            fails_with(&sections),
            ErrorKind::MisplacedInsufficientStorage
        );

        sections[1].set_flags(DumpFlags::VALID);
        assert_eq!(fails_with(&sections), ErrorKind::InvalidSectionType);

        sections[3].section_type = 0;
        assert_eq!(fails_with(&sections), ErrorKind::InvalidSectionType);

        sections[3].section_type = SectionType::SvSpecific.to_u32();
        assert!(header(&sections).validate_sections().is_ok());
    }

    #[test]
    fn display() {
        let text = table()[1].to_string();
        assert!(text.contains("DDRCS0.BIN"));
        assert!(text.contains("DDR_RANGE"));
        assert!(text.contains("base=0x80000000"));
        assert_eq!(SectionType::from_u32(9).to_str(), "UNKNOWN");
        assert_eq!(SectionType::from_u32(0).to_str(), "reserved");
    }
}
