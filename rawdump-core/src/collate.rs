/*!
Collation of raw dumps which were written as one file per section.

Dumps stored on removable media consist of a `rawdump.bin` holding only the
header and section table, with the contents of every section stored in a file
named after the section next to it. Collation builds a single dump out of them.

Collation happens in two steps: `CollatePlan::new` inspects the directory and computes
the final offset of every section, `CollatePlan::write` writes the dump in a single pass.
*/

use crate::dump::DumpHeader;
use crate::error::{Error, ErrorKind, ErrorOrigin, Result};

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};

use itertools::Itertools;
use log::{debug, info, warn};

/// Where the contents of a section come from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SectionSource {
    /// The section file exists
    File { path: PathBuf, len: u64 },
    /// No file was found, the section keeps its original offset
    Missing,
}

/// A planned section of the collated dump.
#[derive(Clone, Debug)]
pub struct PlannedSection {
    pub index: usize,
    pub name: String,
    pub source: SectionSource,
    /// Offset of the section in the collated dump
    pub offset: u64,
}

/// The immutable layout of a collated dump.
#[derive(Clone, Debug)]
pub struct CollatePlan {
    header: DumpHeader,
    sections: Vec<PlannedSection>,
    total_size: u64,
}

/// Section names are taken from the dump and may only name a file directly inside the dump directory.
fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() || name.contains('/') || name.contains('\\') {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

impl CollatePlan {
    /// Looks up the file of every section of `header` in `dir` and computes the final offsets.
    ///
    /// Sections are placed back to back directly after the section table.
    pub fn new<P: AsRef<Path>>(header: &DumpHeader, dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(Error(ErrorOrigin::Collator, ErrorKind::InvalidPath).log_error(dir.display()));
        }

        let mut header = header.clone();
        let mut sections = Vec::with_capacity(header.sections_count() as usize);
        let mut offset = header.table_size() as u64;

        let entries = header.sections().collect::<Vec<_>>();
        for (index, mut entry) in entries.into_iter().enumerate() {
            let name = entry.name();
            let path = dir.join(&name);

            let source = match (is_plain_file_name(&name), fs::metadata(&path)) {
                (false, _) => {
                    warn!("section name '{}' does not denote a file in {}", name, dir.display());
                    SectionSource::Missing
                }
                (true, Ok(meta)) if meta.is_file() => SectionSource::File {
                    path,
                    len: meta.len(),
                },
                _ => {
                    warn!("section file for '{}' not found in {}", name, dir.display());
                    SectionSource::Missing
                }
            };

            let planned_offset = match &source {
                SectionSource::File { len, .. } => {
                    let current = offset;
                    offset = offset
                        .checked_add(*len)
                        .ok_or(Error(ErrorOrigin::Collator, ErrorKind::Overflow))?;
                    entry.set_offset(current);
                    header.set_section(index, &entry)?;
                    current
                }
                SectionSource::Missing => entry.offset(),
            };

            debug!("planned section {} '{}' at {:x}", index, name, planned_offset);
            sections.push(PlannedSection {
                index,
                name,
                source,
                offset: planned_offset,
            });
        }

        Ok(Self {
            header,
            sections,
            total_size: offset,
        })
    }

    /// The header with the planned offsets.
    pub fn header(&self) -> &DumpHeader {
        &self.header
    }

    pub fn sections(&self) -> &[PlannedSection] {
        &self.sections
    }

    /// Size of the collated dump.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Number of sections without a file.
    pub fn missing_count(&self) -> usize {
        self.sections
            .iter()
            .filter(|s| s.source == SectionSource::Missing)
            .count()
    }

    /// Writes the collated dump into `out` and returns its header.
    pub fn write<W: Write>(&self, out: &mut W) -> Result<DumpHeader> {
        out.write_all(self.header.as_bytes()).map_err(|err| {
            Error(ErrorOrigin::Collator, ErrorKind::UnableToWriteFile).log_error(format!("header: {}", err))
        })?;

        let mut written = self.header.table_size() as u64;
        for section in self.sections.iter() {
            if let SectionSource::File { path, len } = &section.source {
                let file = File::open(path).map_err(|err| {
                    Error(ErrorOrigin::Collator, ErrorKind::UnableToOpenFile)
                        .log_error(format!("{}: {}", path.display(), err))
                })?;

                let copied = io::copy(&mut BufReader::new(file).take(*len), out).map_err(|err| {
                    Error(ErrorOrigin::Collator, ErrorKind::UnableToWriteFile).log_error(format!(
                        "section '{}' at {:x}: {}",
                        section.name, written, err
                    ))
                })?;

                if copied != *len {
                    return Err(Error(ErrorOrigin::Collator, ErrorKind::PartialData).log_error(format!(
                        "section '{}' shrank while copying: expected={:x} copied={:x}",
                        section.name, len, copied
                    )));
                }
                written += copied;
            }
        }

        info!(
            "collated {} sections into {:x} bytes",
            self.sections.len(),
            written
        );
        if self.missing_count() > 0 {
            warn!(
                "sections without a file: {}",
                self.sections
                    .iter()
                    .filter(|s| s.source == SectionSource::Missing)
                    .map(|s| &s.name)
                    .join(", ")
            );
        }
        Ok(self.header.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::{validate_header, RawDumpHeader, RawSectionEntry};
    use crate::types::Guid;
    use std::io::Cursor;

    fn header() -> DumpHeader {
        let mut raw = RawDumpHeader::new(0);
        raw.dump_size = 0x3000;
        DumpHeader::from_parts(
            raw,
            &[
                RawSectionEntry::ddr("DDRCS0.BIN", 0x8000_0000, 0x1000, 0x1000),
                RawSectionEntry::ddr("DDRCS1.BIN", 0x8000_1000, 0x2000, 0x1000),
                RawSectionEntry::ddr("DDRCS2.BIN", 0x8000_2000, 0x3000, 0x1000),
            ],
        )
        .unwrap()
    }

    #[test]
    fn plan_and_write() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("DDRCS0.BIN"), vec![0xAAu8; 0x100]).unwrap();
        fs::write(dir.path().join("DDRCS2.BIN"), vec![0xCCu8; 0x80]).unwrap();

        let header = header();
        let plan = CollatePlan::new(&header, dir.path()).unwrap();
        let table = header.table_size() as u64;

        assert_eq!(plan.missing_count(), 1);
        assert_eq!(plan.sections()[0].offset, table);
        // missing sections keep their original offset
        assert_eq!(plan.sections()[1].offset, 0x2000);
        assert_eq!(plan.sections()[2].offset, table + 0x100);
        assert_eq!(plan.total_size(), table + 0x180);
        assert_eq!(plan.header().section(2).unwrap().offset(), table + 0x100);

        let mut out = Cursor::new(Vec::new());
        let written = plan.write(&mut out).unwrap();
        assert_eq!(out.get_ref().len() as u64, plan.total_size());

        let reread = validate_header(&mut out).unwrap();
        assert_eq!(reread.as_bytes(), written.as_bytes());
        let data = out.get_ref();
        assert_eq!(data[table as usize], 0xAA);
        assert_eq!(data[(table + 0x100) as usize], 0xCC);
    }

    #[test]
    fn section_names_stay_in_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("1");
        fs::create_dir(&dir).unwrap();
        fs::write(root.path().join("SECRET.BIN"), b"SECRET").unwrap();
        fs::write(dir.join("DDRCS0.BIN"), vec![0xAAu8; 0x10]).unwrap();

        let secret = root.path().join("SECRET.BIN");
        let absolute = secret.to_string_lossy().to_string();
        let mut raw = RawDumpHeader::new(0);
        raw.dump_size = 0x1000;
        let mut sections = vec![
            RawSectionEntry::ddr("DDRCS0.BIN", 0x8000_0000, 0x1000, 0x10),
            RawSectionEntry::sv("../SECRET.BIN", Guid::NIL, 0x2000, 6),
            RawSectionEntry::sv("1\\..\\..\\SECRET.BIN", Guid::NIL, 0x3000, 6),
            RawSectionEntry::sv("..", Guid::NIL, 0x4000, 6),
        ];
        if absolute.len() <= 20 {
            sections.push(RawSectionEntry::sv(&absolute, Guid::NIL, 0x5000, 6));
        }
        let header = DumpHeader::from_parts(raw, &sections).unwrap();

        let plan = CollatePlan::new(&header, &dir).unwrap();
        assert_eq!(plan.missing_count(), sections.len() - 1);
        assert_eq!(plan.sections()[1].source, SectionSource::Missing);
        assert_eq!(plan.sections()[1].offset, 0x2000);

        let mut out = Cursor::new(Vec::new());
        plan.write(&mut out).unwrap();
        // only the DDR section follows the table
        assert_eq!(&out.get_ref()[header.table_size()..], &[0xAAu8; 0x10][..]);

        assert!(is_plain_file_name("DDRCS0.BIN"));
        assert!(!is_plain_file_name("/SECRET.BIN"));
        assert!(!is_plain_file_name("."));
        assert!(!is_plain_file_name(""));
    }

    #[test]
    fn missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = CollatePlan::new(&header(), dir.path().join("nope")).unwrap_err();
        assert_eq!(err, Error(ErrorOrigin::Collator, ErrorKind::InvalidPath));
    }
}
