use super::section::{RawSectionEntry, SectionTable};
use super::{
    section_table_size, DumpFlags, RAW_DUMP_HEADER_SIZE, RAW_DUMP_HEADER_VERSION,
    RAW_DUMP_SECTION_SIZE, RAW_DUMP_SIGNATURE,
};
use crate::error::{Error, ErrorKind, ErrorOrigin, Result};

use std::fmt;
use std::io::{Read, Seek, SeekFrom};

use dataview::{DataView, Pod, PodMethods};
use log::{debug, info};

/// The on-disk header of a raw dump.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct RawDumpHeader {
    pub signature: u64,                // 0x00
    pub version: u32,                  // 0x08
    pub flags: u32,                    // 0x0C
    pub os_data: u64,                  // 0x10
    pub cpu_context: u64,              // 0x18
    pub reset_trigger: u32,            // 0x20
    pub dump_size: u64,                // 0x24
    pub total_dump_size_required: u64, // 0x2C
    pub sections_count: u32,           // 0x34
} // size: 0x38
unsafe impl Pod for RawDumpHeader {}

impl RawDumpHeader {
    /// Creates a header with a valid signature, version and flags.
    pub fn new(sections_count: u32) -> Self {
        let mut header = Self::zeroed();
        header.signature = RAW_DUMP_SIGNATURE;
        header.version = RAW_DUMP_HEADER_VERSION;
        header.flags = DumpFlags::VALID.bits();
        header.sections_count = sections_count;
        header
    }

    /// Runs the header checks in order, each failing check maps to a distinct error.
    pub fn validate(&self) -> Result<DumpFlags> {
        let signature = self.signature;
        if signature != RAW_DUMP_SIGNATURE {
            return Err(Error(ErrorOrigin::DumpHeader, ErrorKind::InvalidSignature)
                .log_warn(format!("signature={:x}", signature)));
        }

        let version = self.version;
        if version != RAW_DUMP_HEADER_VERSION {
            return Err(Error(ErrorOrigin::DumpHeader, ErrorKind::InvalidVersion)
                .log_warn(format!("version={:x}", version)));
        }

        let flags = self.flags;
        let flags = DumpFlags::validate(flags).ok_or_else(|| {
            Error(ErrorOrigin::DumpHeader, ErrorKind::InvalidFlags).log_warn(format!("flags={:x}", flags))
        })?;

        let dump_size = self.dump_size;
        if dump_size == 0 {
            return Err(Error(ErrorOrigin::DumpHeader, ErrorKind::InvalidDumpSize).log_warn("dump_size=0"));
        }

        let sections_count = self.sections_count;
        if sections_count == 0 {
            return Err(
                Error(ErrorOrigin::DumpHeader, ErrorKind::InvalidSectionCount).log_warn("sections_count=0")
            );
        }

        Ok(flags)
    }
}

impl fmt::Debug for RawDumpHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (signature, version, flags) = (self.signature, self.version, self.flags);
        let (os_data, cpu_context, reset_trigger) = (self.os_data, self.cpu_context, self.reset_trigger);
        let (dump_size, total, count) = (
            self.dump_size,
            self.total_dump_size_required,
            self.sections_count,
        );
        f.debug_struct("RawDumpHeader")
            .field("signature", &format_args!("{:x}", signature))
            .field("version", &format_args!("{:x}", version))
            .field("flags", &format_args!("{:x}", flags))
            .field("os_data", &format_args!("{:x}", os_data))
            .field("cpu_context", &format_args!("{:x}", cpu_context))
            .field("reset_trigger", &format_args!("{:x}", reset_trigger))
            .field("dump_size", &format_args!("{:x}", dump_size))
            .field("total_dump_size_required", &format_args!("{:x}", total))
            .field("sections_count", &count)
            .finish()
    }
}

/// A raw dump header which passed validation together with its section table.
///
/// The buffer holds the header followed by `sections_count` entries exactly as stored in the dump.
#[derive(Clone)]
pub struct DumpHeader {
    raw: RawDumpHeader,
    flags: DumpFlags,
    buf: Vec<u8>,
}

/// Reads and validates the header at the start of `reader`.
///
/// On success the header and the complete section table are read into an owned buffer.
pub fn validate_header<R: Read + Seek>(reader: &mut R) -> Result<DumpHeader> {
    let len = reader.seek(SeekFrom::End(0)).map_err(|err| {
        Error(ErrorOrigin::DumpHeader, ErrorKind::UnableToSeekFile).log_error(err)
    })?;

    let mut raw = RawDumpHeader::zeroed();
    read_at(reader, 0, raw.as_bytes_mut())?;
    raw.validate()?;

    let count = raw.sections_count;
    let size = section_table_size(count)
        .ok_or_else(|| Error(ErrorOrigin::DumpHeader, ErrorKind::Overflow).log_warn(count))?;
    if size as u64 > len {
        return Err(Error(ErrorOrigin::DumpHeader, ErrorKind::InvalidSectionCount).log_warn(
            format!(
                "section table of {} entries exceeds the stream: table_size={:x} stream_size={:x}",
                count, size, len
            ),
        ));
    }

    let mut buf = vec![0u8; size];
    read_at(reader, 0, &mut buf)?;

    debug!("dump header: {:?}", raw);
    DumpHeader::from_bytes(buf)
}

fn read_at<R: Read + Seek>(reader: &mut R, offset: u64, buf: &mut [u8]) -> Result<()> {
    reader.seek(SeekFrom::Start(offset)).map_err(|err| {
        Error(ErrorOrigin::DumpHeader, ErrorKind::UnableToSeekFile)
            .log_error(format!("offset={:x}: {}", offset, err))
    })?;
    reader.read_exact(buf).map_err(|err| {
        Error(ErrorOrigin::DumpHeader, ErrorKind::UnableToReadFile)
            .log_error(format!("offset={:x} len={:x}: {}", offset, buf.len(), err))
    })
}

impl DumpHeader {
    /// Validates a buffer holding a header followed by its complete section table.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self> {
        let raw = DataView::from(&buf[..])
            .try_read::<RawDumpHeader>(0)
            .ok_or(Error(ErrorOrigin::DumpHeader, ErrorKind::InvalidBuffer))?;
        let flags = raw.validate()?;

        let count = raw.sections_count;
        if section_table_size(count) != Some(buf.len()) {
            return Err(Error(ErrorOrigin::DumpHeader, ErrorKind::InvalidBuffer)
                .log_debug(format!("buffer of {:x} bytes for {} sections", buf.len(), count)));
        }

        Ok(Self { raw, flags, buf })
    }

    /// Builds a header from its fields and sections, the result is validated.
    pub fn from_parts(raw: RawDumpHeader, sections: &[RawSectionEntry]) -> Result<Self> {
        let mut raw = raw;
        raw.sections_count = sections.len() as u32;

        let mut buf = Vec::with_capacity(RAW_DUMP_HEADER_SIZE + sections.len() * RAW_DUMP_SECTION_SIZE);
        buf.extend_from_slice(raw.as_bytes());
        for section in sections.iter() {
            buf.extend_from_slice(section.as_bytes());
        }
        Self::from_bytes(buf)
    }

    pub fn raw(&self) -> &RawDumpHeader {
        &self.raw
    }

    pub fn flags(&self) -> DumpFlags {
        self.flags
    }

    /// True if the dump was truncated because the storage was too small.
    pub fn is_truncated(&self) -> bool {
        self.flags.contains(DumpFlags::INSUFFICIENT_STORAGE)
    }

    pub fn os_data(&self) -> u64 {
        self.raw.os_data
    }

    pub fn cpu_context(&self) -> u64 {
        self.raw.cpu_context
    }

    pub fn reset_trigger(&self) -> u32 {
        self.raw.reset_trigger
    }

    pub fn dump_size(&self) -> u64 {
        self.raw.dump_size
    }

    pub fn total_dump_size_required(&self) -> u64 {
        self.raw.total_dump_size_required
    }

    pub fn sections_count(&self) -> u32 {
        self.raw.sections_count
    }

    /// Size of the header together with the section table.
    pub fn table_size(&self) -> usize {
        self.buf.len()
    }

    /// The header and section table as stored on disk.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn section(&self, index: usize) -> Option<RawSectionEntry> {
        if index >= self.sections_count() as usize {
            return None;
        }
        DataView::from(&self.buf[..])
            .try_read::<RawSectionEntry>(RAW_DUMP_HEADER_SIZE + index * RAW_DUMP_SECTION_SIZE)
    }

    pub fn sections(&self) -> impl Iterator<Item = RawSectionEntry> + '_ {
        (0..self.sections_count() as usize).filter_map(move |i| self.section(i))
    }

    /// Replaces the section entry at `index`.
    pub fn set_section(&mut self, index: usize, section: &RawSectionEntry) -> Result<()> {
        if index >= self.sections_count() as usize {
            return Err(Error(ErrorOrigin::SectionTable, ErrorKind::InvalidPosition));
        }
        let start = RAW_DUMP_HEADER_SIZE + index * RAW_DUMP_SECTION_SIZE;
        self.buf[start..start + RAW_DUMP_SECTION_SIZE].copy_from_slice(section.as_bytes());
        Ok(())
    }

    /// Updates the declared dump size.
    pub fn set_dump_size(&mut self, dump_size: u64) -> Result<()> {
        if dump_size == 0 {
            return Err(Error(ErrorOrigin::DumpHeader, ErrorKind::InvalidDumpSize));
        }
        self.raw.dump_size = dump_size;
        self.buf[..RAW_DUMP_HEADER_SIZE].copy_from_slice(self.raw.as_bytes());
        Ok(())
    }

    /// Validates the section table of this header.
    pub fn validate_sections(&self) -> Result<SectionTable<'_>> {
        let table = SectionTable::validate(self)?;
        info!(
            "section table valid: ddr={} cpu={} sv={}",
            table.stats().ddr_count,
            table.stats().cpu_context_count,
            table.stats().sv_count
        );
        Ok(table)
    }
}

impl fmt::Debug for DumpHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.raw)
    }
}

impl fmt::Display for DumpHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Raw dump header:")?;
        writeln!(f, "  Version:                  {:#x}", self.raw.version as u32)?;
        writeln!(f, "  Flags:                    {:?}", self.flags)?;
        writeln!(f, "  OS data:                  {:#x}", self.os_data())?;
        writeln!(f, "  CPU context:              {:#x}", self.cpu_context())?;
        writeln!(f, "  Reset trigger:            {:#x}", self.reset_trigger())?;
        writeln!(f, "  Dump size:                {:#x}", self.dump_size())?;
        writeln!(f, "  Total dump size required: {:#x}", self.total_dump_size_required())?;
        writeln!(f, "  Sections:                 {}", self.sections_count())?;
        for (i, section) in self.sections().enumerate() {
            writeln!(f, "  [{:3}] {}", i, section)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::mem::size_of;

    fn sample() -> Vec<u8> {
        let mut raw = RawDumpHeader::new(2);
        raw.dump_size = 0x3000;
        raw.total_dump_size_required = 0x3000;
        raw.cpu_context = 0x8000_1000;
        let sections = [
            RawSectionEntry::ddr("DDRCS0.BIN", 0x8000_0000, 0x1000, 0x1000),
            RawSectionEntry::ddr("DDRCS1.BIN", 0x8000_1000, 0x2000, 0x1000),
        ];
        let mut buf = DumpHeader::from_parts(raw, &sections)
            .unwrap()
            .as_bytes()
            .to_vec();
        buf.resize(0x3000, 0);
        buf
    }

    fn patch<F: FnOnce(&mut RawDumpHeader)>(buf: &mut Vec<u8>, f: F) {
        let mut raw = RawDumpHeader::zeroed();
        raw.as_bytes_mut()
            .copy_from_slice(&buf[..RAW_DUMP_HEADER_SIZE]);
        f(&mut raw);
        buf[..RAW_DUMP_HEADER_SIZE].copy_from_slice(raw.as_bytes());
    }

    fn kind(buf: Vec<u8>) -> ErrorKind {
        validate_header(&mut Cursor::new(buf)).unwrap_err().1
    }

    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<RawDumpHeader>(), 0x38);
        assert_eq!(RAW_DUMP_HEADER_SIZE, 56);
    }

    #[test]
    fn test_signature_bytes() {
        let raw = RawDumpHeader::new(1);
        assert_eq!(&raw.as_bytes()[..8], b"Raw_Dmp!");
    }

    #[test]
    fn valid_header() {
        let header = validate_header(&mut Cursor::new(sample())).unwrap();
        assert_eq!(header.sections_count(), 2);
        assert_eq!(header.table_size(), 56 + 2 * 64);
        assert_eq!(header.dump_size(), 0x3000);
        assert_eq!(header.cpu_context(), 0x8000_1000);
        assert!(!header.is_truncated());
        assert_eq!(header.section(1).unwrap().name(), "DDRCS1.BIN");
        assert!(header.section(2).is_none());
        assert_eq!(header.sections().count(), 2);
    }

    #[test]
    fn header_round_trip() {
        let buf = sample();
        let header = validate_header(&mut Cursor::new(buf.clone())).unwrap();
        assert_eq!(header.as_bytes(), &buf[..header.table_size()]);
        let again = DumpHeader::from_bytes(header.as_bytes().to_vec()).unwrap();
        assert_eq!(again.as_bytes(), header.as_bytes());
    }

    #[test]
    fn check_order() {
        let mut buf = sample();
        patch(&mut buf, |h| {
            h.signature = 0;
            h.version = 0;
        });
        assert_eq!(kind(buf), ErrorKind::InvalidSignature);

        let mut buf = sample();
        patch(&mut buf, |h| {
            h.version = 0x2000;
            h.flags = 3;
        });
        assert_eq!(kind(buf), ErrorKind::InvalidVersion);

        for flags in [0u32, 3, 4, 5, 0x10].iter() {
            let mut buf = sample();
            patch(&mut buf, |h| {
                h.flags = *flags;
                h.dump_size = 0;
            });
            assert_eq!(kind(buf), ErrorKind::InvalidFlags);
        }

        let mut buf = sample();
        patch(&mut buf, |h| {
            h.dump_size = 0;
            h.sections_count = 0;
        });
        assert_eq!(kind(buf), ErrorKind::InvalidDumpSize);

        let mut buf = sample();
        patch(&mut buf, |h| h.sections_count = 0);
        assert_eq!(kind(buf), ErrorKind::InvalidSectionCount);
    }

    #[test]
    fn insufficient_storage_header() {
        let mut buf = sample();
        patch(&mut buf, |h| h.flags = DumpFlags::INSUFFICIENT_STORAGE.bits());
        let header = validate_header(&mut Cursor::new(buf)).unwrap();
        assert!(header.is_truncated());
    }

    #[test]
    fn truncated_table() {
        let mut buf = sample();
        patch(&mut buf, |h| h.sections_count = 0x1000_0000);
        assert_eq!(kind(buf), ErrorKind::InvalidSectionCount);

        let buf = sample()[..40].to_vec();
        assert_eq!(kind(buf), ErrorKind::UnableToReadFile);
    }

    #[test]
    fn structural_origin() {
        let mut buf = sample();
        patch(&mut buf, |h| h.signature = 1);
        let err = validate_header(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.0, ErrorOrigin::DumpHeader);
        assert!(err.is_structural());
    }

    #[test]
    fn display() {
        let header = validate_header(&mut Cursor::new(sample())).unwrap();
        let text = header.to_string();
        assert!(text.contains("Sections:                 2"));
        assert!(text.contains("DDR_RANGE"));
        assert!(text.contains("DDRCS0.BIN"));
    }
}
