/*!
Synthesis of raw dumps.

The `DumpBuilder` lays out DDR, CPU context and SV sections back to back
after the section table and produces a dump which passes validation.
It can also produce deliberately corrupted headers and the split form
in which removable media store a dump (a `rawdump.bin` holding only the
header and table, one file per section next to it).

# Examples

```
use rawdump_core::builder::DumpBuilder;
use rawdump_core::dump::validate_header;
use std::io::Cursor;

let mut builder = DumpBuilder::new();
builder
    .add_ddr(0x8000_0000, vec![0xAA; 0x1000])
    .add_ddr(0x8000_1000, vec![0xBB; 0x1000]);

let mut dump = Cursor::new(builder.to_bytes().unwrap());
let header = validate_header(&mut dump).unwrap();
assert_eq!(header.sections_count(), 2);
```
*/

use crate::dump::{section_table_size, DumpFlags, DumpHeader, RawDumpHeader, RawSectionEntry};
use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::sv;

use std::fs;
use std::io::Write;
use std::path::Path;

use dataview::PodMethods;
use log::{debug, info};

/// File name of the header in the split form.
pub const SPLIT_HEADER_NAME: &str = "rawdump.bin";

/// Header fields which can be corrupted on purpose.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Corruption {
    Signature,
    Version,
    Flags,
}

#[derive(Clone)]
struct BuilderSection {
    entry: RawSectionEntry,
    data: Vec<u8>,
}

/// Builds raw dumps section by section.
///
/// Sections are stored in the order they were added. DDR sections have to
/// be added next to each other for the result to pass table validation.
#[derive(Clone)]
pub struct DumpBuilder {
    raw: RawDumpHeader,
    sections: Vec<BuilderSection>,
    ddr_count: usize,
    missing_bytes: u64,
    corruptions: Vec<Corruption>,
}

impl Default for DumpBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DumpBuilder {
    pub fn new() -> Self {
        Self {
            raw: RawDumpHeader::new(0),
            sections: Vec::new(),
            ddr_count: 0,
            missing_bytes: 0,
            corruptions: Vec::new(),
        }
    }

    pub fn os_data(&mut self, os_data: u64) -> &mut Self {
        self.raw.os_data = os_data;
        self
    }

    /// Sets the physical address of the cpu context stored in the header.
    pub fn cpu_context_address(&mut self, address: u64) -> &mut Self {
        self.raw.cpu_context = address;
        self
    }

    pub fn reset_trigger(&mut self, reset_trigger: u32) -> &mut Self {
        self.raw.reset_trigger = reset_trigger;
        self
    }

    /// Adds a DDR range, named `DDRCS<nnn>.BIN` after the number of DDR ranges added before.
    pub fn add_ddr(&mut self, base: u64, data: Vec<u8>) -> &mut Self {
        let name = format!("DDRCS{:03}.BIN", self.ddr_count);
        self.ddr_count += 1;
        let entry = RawSectionEntry::ddr(&name, base, 0, data.len() as u64);
        self.push(entry, data)
    }

    pub fn add_cpu_context(&mut self, architecture: u16, core_count: u32, data: Vec<u8>) -> &mut Self {
        let entry = RawSectionEntry::cpu_context("CPU_CTX", architecture, core_count, 0, data.len() as u64);
        self.push(entry, data)
    }

    /// Adds a vendor specific section, the GUID is taken from the known SV sections.
    pub fn add_sv(&mut self, name: &str, data: Vec<u8>) -> &mut Self {
        let entry = RawSectionEntry::sv(name, sv::by_name(name).guid, 0, data.len() as u64);
        self.push(entry, data)
    }

    /// Adds a zero filled vendor specific section of its default size.
    pub fn add_sv_default(&mut self, name: &str) -> &mut Self {
        let size = sv::by_name(name).default_size as usize;
        self.add_sv(name, vec![0u8; size])
    }

    /// Adds an arbitrary section entry. Its offset and size are replaced when the dump is laid out.
    pub fn add_raw(&mut self, entry: RawSectionEntry, data: Vec<u8>) -> &mut Self {
        self.push(entry, data)
    }

    /// Marks the dump as truncated. `missing_bytes` is the amount of storage that was lacking.
    ///
    /// The flag is set on the header and on the last section.
    pub fn insufficient_storage(&mut self, missing_bytes: u64) -> &mut Self {
        self.missing_bytes = missing_bytes;
        self
    }

    pub fn corrupt(&mut self, corruption: Corruption) -> &mut Self {
        self.corruptions.push(corruption);
        self
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    fn push(&mut self, entry: RawSectionEntry, data: Vec<u8>) -> &mut Self {
        self.sections.push(BuilderSection { entry, data });
        self
    }

    /// Computes the final header and section entries.
    fn layout(&self) -> Result<(RawDumpHeader, Vec<RawSectionEntry>)> {
        let count = self.sections.len() as u32;
        let table = section_table_size(count)
            .ok_or(Error(ErrorOrigin::Builder, ErrorKind::Overflow))? as u64;

        let mut offset = table;
        let mut entries = Vec::with_capacity(self.sections.len());
        for section in self.sections.iter() {
            let mut entry = section.entry;
            entry.set_offset(offset);
            entry.size = section.data.len() as u64;
            offset = offset
                .checked_add(section.data.len() as u64)
                .ok_or(Error(ErrorOrigin::Builder, ErrorKind::Overflow))?;
            entries.push(entry);
        }

        let mut raw = self.raw;
        raw.sections_count = count;
        raw.dump_size = offset;
        raw.total_dump_size_required = offset
            .checked_add(self.missing_bytes)
            .ok_or(Error(ErrorOrigin::Builder, ErrorKind::Overflow))?;

        if self.missing_bytes > 0 {
            raw.flags = DumpFlags::INSUFFICIENT_STORAGE.bits();
            if let Some(last) = entries.last_mut() {
                last.set_flags(DumpFlags::INSUFFICIENT_STORAGE);
            }
        }

        for corruption in self.corruptions.iter() {
            match corruption {
                Corruption::Signature => raw.signature = !raw.signature,
                Corruption::Version => raw.version = raw.version.wrapping_add(1),
                Corruption::Flags => raw.flags = (DumpFlags::VALID | DumpFlags::INSUFFICIENT_STORAGE).bits(),
            }
        }

        Ok((raw, entries))
    }

    fn table_bytes(raw: &RawDumpHeader, entries: &[RawSectionEntry]) -> Vec<u8> {
        let mut buf = raw.as_bytes().to_vec();
        for entry in entries.iter() {
            buf.extend_from_slice(entry.as_bytes());
        }
        buf
    }

    /// Builds the header of the dump. Fails if a corruption was requested.
    pub fn header(&self) -> Result<DumpHeader> {
        let (raw, entries) = self.layout()?;
        DumpHeader::from_parts(raw, &entries)
    }

    /// Writes the complete dump into `out` and returns the number of bytes written.
    pub fn write<W: Write>(&self, out: &mut W) -> Result<u64> {
        let (raw, entries) = self.layout()?;

        let table = Self::table_bytes(&raw, &entries);
        out.write_all(&table).map_err(|err| {
            Error(ErrorOrigin::Builder, ErrorKind::UnableToWriteFile).log_error(format!("header: {}", err))
        })?;

        let mut written = table.len() as u64;
        for (section, entry) in self.sections.iter().zip(entries.iter()) {
            out.write_all(&section.data).map_err(|err| {
                Error(ErrorOrigin::Builder, ErrorKind::UnableToWriteFile)
                    .log_error(format!("section '{}' at {:x}: {}", entry.name(), written, err))
            })?;
            written += section.data.len() as u64;
        }

        debug!("built dump of {} sections and {:x} bytes", entries.len(), written);
        Ok(written)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write(&mut buf)?;
        Ok(buf)
    }

    /// Writes the dump in split form into `dir`.
    ///
    /// `rawdump.bin` receives header and table only, every section is written to a file named after it.
    pub fn write_split<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        let (raw, entries) = self.layout()?;

        let path = dir.join(SPLIT_HEADER_NAME);
        fs::write(&path, Self::table_bytes(&raw, &entries)).map_err(|err| {
            Error(ErrorOrigin::Builder, ErrorKind::UnableToWriteFile)
                .log_error(format!("{}: {}", path.display(), err))
        })?;

        for (section, entry) in self.sections.iter().zip(entries.iter()) {
            let path = dir.join(entry.name());
            fs::write(&path, &section.data).map_err(|err| {
                Error(ErrorOrigin::Builder, ErrorKind::UnableToWriteFile)
                    .log_error(format!("{}: {}", path.display(), err))
            })?;
        }

        info!("wrote split dump of {} sections to {}", entries.len(), dir.display());
        Ok(())
    }
}

#[cfg(feature = "serde")]
#[derive(::serde::Deserialize)]
struct DumpLayoutFile {
    #[serde(default)]
    os_data: u64,
    #[serde(default)]
    cpu_context: u64,
    #[serde(default)]
    reset_trigger: u32,
    #[serde(default)]
    missing_bytes: u64,
    #[serde(default)]
    ddr: Vec<DdrLayout>,
    #[serde(default)]
    cpu: Vec<CpuLayout>,
    #[serde(default)]
    sv: Vec<SvLayout>,
}

#[cfg(feature = "serde")]
#[derive(::serde::Deserialize)]
struct DdrLayout {
    base: u64,
    size: u64,
    #[serde(default)]
    fill: u8,
}

#[cfg(feature = "serde")]
#[derive(::serde::Deserialize)]
struct CpuLayout {
    architecture: u16,
    cores: u32,
    size: u64,
}

#[cfg(feature = "serde")]
#[derive(::serde::Deserialize)]
struct SvLayout {
    name: String,
    size: Option<u64>,
    #[serde(default)]
    fill: u8,
}

/// A dump layout loaded from a [TOML](https://toml.io/) file.
///
/// # Examples
///
/// ```toml
/// reset_trigger = 1
///
/// [[ddr]]
/// base = 0x80000000
/// size = 0x1000
///
/// [[cpu]]
/// architecture = 12
/// cores = 8
/// size = 0x200
///
/// [[sv]]
/// name = "RST_STAT.BIN"
/// ```
///
/// Sections are laid out DDR first, then CPU context, then SV sections.
/// SV sections without a size use their default size.
#[cfg(feature = "serde")]
pub struct DumpLayout {
    file: DumpLayoutFile,
}

#[cfg(feature = "layoutfiles")]
impl DumpLayout {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            Error(ErrorOrigin::Builder, ErrorKind::UnableToOpenFile)
                .log_error(format!("{}: {}", path.display(), err))
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let file: DumpLayoutFile = ::toml::from_str(contents).map_err(|err| {
            Error(ErrorOrigin::Builder, ErrorKind::Configuration)
                .log_error(format!("unable to parse the dump layout: {}", err))
        })?;
        Ok(Self { file })
    }
}

#[cfg(feature = "serde")]
impl DumpLayout {
    /// Creates a builder holding all sections of this layout.
    pub fn builder(&self) -> DumpBuilder {
        let file = &self.file;
        let mut builder = DumpBuilder::new();
        builder
            .os_data(file.os_data)
            .cpu_context_address(file.cpu_context)
            .reset_trigger(file.reset_trigger)
            .insufficient_storage(file.missing_bytes);

        for ddr in file.ddr.iter() {
            builder.add_ddr(ddr.base, vec![ddr.fill; ddr.size as usize]);
        }
        for cpu in file.cpu.iter() {
            builder.add_cpu_context(cpu.architecture, cpu.cores, vec![0u8; cpu.size as usize]);
        }
        for section in file.sv.iter() {
            let size = section
                .size
                .unwrap_or_else(|| sv::by_name(&section.name).default_size);
            builder.add_sv(&section.name, vec![section.fill; size as usize]);
        }
        builder
    }
}
