/*!
GUID partition table parsing.

Block devices holding raw dumps are required to be GPT formatted.
Legacy MBR layouts and unpartitioned media are detected and rejected.
*/

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::types::Guid;

use std::convert::TryFrom;
use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem::size_of;

use dataview::{Pod, PodMethods};
use log::{debug, info, warn};

/// GPT header signature "EFI PART"
pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";

/// Block sizes which are tried when probing for a GPT header.
pub const PROBE_BLOCK_SIZES: [usize; 2] = [512, 4096];

const MBR_BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const MBR_PROTECTIVE_TYPE: u8 = 0xEE;

/// Upper bound of partition entries accepted from a header.
const MAX_PARTITION_ENTRIES: u32 = 1024;

/// Partition scheme found on a medium
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PartitionScheme {
    Gpt,
    Mbr,
    Raw,
}

impl PartitionScheme {
    pub fn to_str(self) -> &'static str {
        match self {
            PartitionScheme::Gpt => "GPT",
            PartitionScheme::Mbr => "MBR",
            PartitionScheme::Raw => "RAW",
        }
    }
}

/// The GPT header as stored in LBA 1.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct GptHeader {
    pub signature: [u8; 8],       // 0x00
    pub revision: u32,            // 0x08
    pub header_size: u32,         // 0x0C
    pub header_crc32: u32,        // 0x10
    pub reserved: u32,            // 0x14
    pub current_lba: u64,         // 0x18
    pub backup_lba: u64,          // 0x20
    pub first_usable_lba: u64,    // 0x28
    pub last_usable_lba: u64,     // 0x30
    pub disk_guid: Guid,          // 0x38
    pub entries_lba: u64,         // 0x48
    pub entry_count: u32,         // 0x50
    pub entry_size: u32,          // 0x54
    pub entries_crc32: u32,       // 0x58
    pub pad: u32,                 // 0x5C
} // size: 0x60
unsafe impl Pod for GptHeader {}

/// A single GPT partition entry.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct GptEntry {
    pub type_guid: Guid,   // 0x00
    pub unique_guid: Guid, // 0x10
    pub first_lba: u64,    // 0x20
    pub last_lba: u64,     // 0x28
    pub attributes: u64,   // 0x30
    pub name: [u16; 36],   // 0x38
} // size: 0x80
unsafe impl Pod for GptEntry {}

impl GptEntry {
    pub fn name(&self) -> String {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(self.name.len());
        String::from_utf16_lossy(&self.name[..len])
    }
}

/// A used partition of a GPT formatted medium.
#[derive(Clone, Eq, PartialEq)]
pub struct Partition {
    /// Index among the used entries of the table
    pub index: usize,
    pub name: String,
    pub type_guid: Guid,
    pub unique_guid: Guid,
    pub first_lba: u64,
    /// Last LBA, inclusive
    pub last_lba: u64,
    pub attributes: u64,
    /// Byte offset of the partition on the medium
    pub offset: u64,
    /// Length of the partition in bytes
    pub length: u64,
}

impl Partition {
    pub fn block_count(&self) -> u64 {
        self.last_lba - self.first_lba + 1
    }
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "#{} '{}' type={} lba={:x}-{:x} offset={:x} length={:x}",
            self.index,
            self.name,
            self.type_guid,
            self.first_lba,
            self.last_lba,
            self.offset,
            self.length
        )
    }
}

/// The parsed partition table of a block medium.
#[derive(Clone, Debug)]
pub struct PartitionTable {
    block_size: usize,
    block_count: u64,
    disk_guid: Guid,
    partitions: Vec<Partition>,
}

fn read_exact_at<T: Read + Seek>(handle: &mut T, offset: u64, buf: &mut [u8]) -> Result<()> {
    handle
        .seek(SeekFrom::Start(offset))
        .map_err(|err| Error(ErrorOrigin::PartitionTable, ErrorKind::UnableToSeekFile).log_debug(err))?;
    handle
        .read_exact(buf)
        .map_err(|err| Error(ErrorOrigin::PartitionTable, ErrorKind::UnableToReadFile).log_debug(err))
}

/// Detects the partition scheme and block size of a medium.
///
/// If `block_size` is set only that block size is tried, otherwise all `PROBE_BLOCK_SIZES`.
pub fn probe<T: Read + Seek>(
    handle: &mut T,
    block_size: Option<usize>,
) -> Result<(usize, PartitionScheme)> {
    let candidates = match block_size {
        Some(bs) => vec![bs],
        None => PROBE_BLOCK_SIZES.to_vec(),
    };

    for bs in candidates.iter() {
        let mut signature = [0u8; 8];
        if read_exact_at(handle, *bs as u64, &mut signature).is_ok() && signature == GPT_SIGNATURE {
            debug!("found gpt header with block_size={:x}", bs);
            return Ok((*bs, PartitionScheme::Gpt));
        }
    }

    let mut mbr = [0u8; 512];
    let bs = candidates[0];
    if read_exact_at(handle, 0, &mut mbr).is_ok() && mbr[510..512] == MBR_BOOT_SIGNATURE {
        Ok((bs, PartitionScheme::Mbr))
    } else {
        Ok((bs, PartitionScheme::Raw))
    }
}

impl PartitionTable {
    /// Reads the partition table from a medium.
    ///
    /// Fails with `UnsupportedPartition` if the medium is not GPT formatted.
    pub fn read<T: Read + Seek>(handle: &mut T, block_size: Option<usize>) -> Result<Self> {
        let len = handle
            .seek(SeekFrom::End(0))
            .map_err(|err| Error(ErrorOrigin::PartitionTable, ErrorKind::UnableToSeekFile).log_error(err))?;

        let (block_size, scheme) = probe(handle, block_size)?;
        if scheme != PartitionScheme::Gpt {
            return Err(Error(ErrorOrigin::PartitionTable, ErrorKind::UnsupportedPartition)
                .log_warn(format!("partition style is {}", scheme.to_str())));
        }

        let block_count = len / block_size as u64;

        let mut header = GptHeader::zeroed();
        read_exact_at(handle, block_size as u64, header.as_bytes_mut())?;

        if header.entry_count > MAX_PARTITION_ENTRIES
            || (header.entry_size as usize) < size_of::<GptEntry>()
        {
            return Err(Error(ErrorOrigin::PartitionTable, ErrorKind::UnsupportedPartition)
                .log_warn(format!(
                    "invalid gpt entry geometry: count={} size={}",
                    header.entry_count, header.entry_size
                )));
        }

        let table_offset = header
            .entries_lba
            .checked_mul(block_size as u64)
            .ok_or(Error(ErrorOrigin::PartitionTable, ErrorKind::Overflow))?;
        let table_len = header.entry_count as usize * header.entry_size as usize;
        let table_end = table_offset
            .checked_add(table_len as u64)
            .ok_or(Error(ErrorOrigin::PartitionTable, ErrorKind::Overflow))?;
        if table_end > len {
            return Err(Error(ErrorOrigin::PartitionTable, ErrorKind::EndOfMedium)
                .log_warn("gpt entries exceed the medium"));
        }

        let mut table = vec![0u8; table_len];
        read_exact_at(handle, table_offset, &mut table)?;

        let mut partitions = Vec::new();
        for raw in table.chunks_exact(header.entry_size as usize) {
            let mut entry = GptEntry::zeroed();
            entry
                .as_bytes_mut()
                .copy_from_slice(&raw[..size_of::<GptEntry>()]);

            if entry.type_guid.is_nil() {
                continue;
            }

            if entry.last_lba < entry.first_lba || entry.last_lba >= block_count {
                warn!(
                    "skipping gpt entry '{}' with invalid range {:x}-{:x}",
                    entry.name(),
                    entry.first_lba,
                    entry.last_lba
                );
                continue;
            }

            let partition = Partition {
                index: partitions.len(),
                name: entry.name(),
                type_guid: entry.type_guid,
                unique_guid: entry.unique_guid,
                first_lba: entry.first_lba,
                last_lba: entry.last_lba,
                attributes: entry.attributes,
                offset: entry.first_lba * block_size as u64,
                length: (entry.last_lba - entry.first_lba + 1) * block_size as u64,
            };
            debug!("partition {:?}", partition);
            partitions.push(partition);
        }

        info!(
            "gpt with {} partitions: block_size={:x} block_count={:x}",
            partitions.len(),
            block_size,
            block_count
        );

        Ok(Self {
            block_size,
            block_count,
            disk_guid: header.disk_guid,
            partitions,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn disk_guid(&self) -> Guid {
        self.disk_guid
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Partition> {
        self.partitions.get(index)
    }

    /// Finds a partition by its name, ignoring ascii case.
    pub fn find_by_name(&self, name: &str) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Finds the first partition with the given type GUID.
    pub fn find_by_type(&self, type_guid: &Guid) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.type_guid == *type_guid)
    }
}

/// Description of a partition to be written by `write_gpt`.
#[derive(Clone, Debug)]
pub struct PartitionSpec {
    pub name: String,
    pub type_guid: Guid,
    pub unique_guid: Guid,
    pub block_count: u64,
}

impl PartitionSpec {
    pub fn new(name: &str, type_guid: Guid, block_count: u64) -> Self {
        Self {
            name: name.to_string(),
            type_guid,
            unique_guid: Guid::NIL,
            block_count,
        }
    }
}

/// Number of entries written by `write_gpt`.
const WRITE_ENTRY_COUNT: u32 = 128;

/// Formats a medium with a protective MBR and a primary GPT.
///
/// Partitions are laid out back to back after the entry array.
/// Checksums are not computed. Returns the first LBA of every partition.
pub fn write_gpt<T: Write + Seek>(
    handle: &mut T,
    block_size: usize,
    block_count: u64,
    disk_guid: Guid,
    specs: &[PartitionSpec],
) -> Result<Vec<u64>> {
    let write_at = |handle: &mut T, offset: u64, buf: &[u8]| -> Result<()> {
        handle
            .seek(SeekFrom::Start(offset))
            .map_err(|err| Error(ErrorOrigin::PartitionTable, ErrorKind::UnableToSeekFile).log_error(err))?;
        handle
            .write_all(buf)
            .map_err(|err| Error(ErrorOrigin::PartitionTable, ErrorKind::UnableToWriteFile).log_error(err))
    };

    let bs = block_size as u64;
    let entries_len = WRITE_ENTRY_COUNT as u64 * size_of::<GptEntry>() as u64;
    let entries_blocks = (entries_len + bs - 1) / bs;
    let first_usable = 2 + entries_blocks;

    if specs.len() > WRITE_ENTRY_COUNT as usize {
        return Err(Error(ErrorOrigin::PartitionTable, ErrorKind::InvalidBuffer));
    }

    let mut mbr = vec![0u8; block_size];
    mbr[446 + 4] = MBR_PROTECTIVE_TYPE;
    mbr[446 + 8..446 + 12].copy_from_slice(&1u32.to_le_bytes());
    let protective_len = u32::try_from(block_count - 1).unwrap_or(u32::MAX);
    mbr[446 + 12..446 + 16].copy_from_slice(&protective_len.to_le_bytes());
    mbr[510..512].copy_from_slice(&MBR_BOOT_SIGNATURE);
    write_at(handle, 0, &mbr)?;

    let mut entries = vec![0u8; entries_len as usize];
    let mut next_lba = first_usable;
    let mut starts = Vec::with_capacity(specs.len());
    for (spec, raw) in specs
        .iter()
        .zip(entries.chunks_exact_mut(size_of::<GptEntry>()))
    {
        let last_lba = next_lba + spec.block_count - 1;
        if spec.block_count == 0 || last_lba >= block_count {
            return Err(Error(ErrorOrigin::PartitionTable, ErrorKind::EndOfMedium)
                .log_error(format!("partition '{}' does not fit", spec.name)));
        }

        let mut entry = GptEntry::zeroed();
        entry.type_guid = spec.type_guid;
        entry.unique_guid = spec.unique_guid;
        entry.first_lba = next_lba;
        entry.last_lba = last_lba;
        for (dst, src) in entry.name.iter_mut().take(35).zip(spec.name.encode_utf16()) {
            *dst = src;
        }
        raw.copy_from_slice(entry.as_bytes());

        starts.push(next_lba);
        next_lba = last_lba + 1;
    }
    write_at(handle, 2 * bs, &entries)?;

    let mut header = GptHeader::zeroed();
    header.signature = GPT_SIGNATURE;
    header.revision = 0x0001_0000;
    header.header_size = 92;
    header.current_lba = 1;
    header.backup_lba = block_count - 1;
    header.first_usable_lba = first_usable;
    header.last_usable_lba = block_count - 1;
    header.disk_guid = disk_guid;
    header.entries_lba = 2;
    header.entry_count = WRITE_ENTRY_COUNT;
    header.entry_size = size_of::<GptEntry>() as u32;
    write_at(handle, bs, header.as_bytes())?;

    Ok(starts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const DATA_TYPE: Guid = Guid::new(
        0xEBD0A0A2,
        0xB9E5,
        0x4433,
        [0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7],
    );
    const DUMP_TYPE: Guid = Guid::new(
        0x66C9B323,
        0xF7FC,
        0x48B6,
        [0xBF, 0x96, 0x6F, 0x32, 0xE3, 0x35, 0xA4, 0x28],
    );

    fn disk(block_size: usize, block_count: u64) -> Cursor<Vec<u8>> {
        let mut disk = Cursor::new(vec![0u8; block_size * block_count as usize]);
        write_gpt(
            &mut disk,
            block_size,
            block_count,
            Guid::NIL,
            &[
                PartitionSpec::new("MainOS", DATA_TYPE, 16),
                PartitionSpec::new("SVRawDump", DUMP_TYPE, 8),
            ],
        )
        .unwrap();
        disk
    }

    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<GptHeader>(), 0x60);
        assert_eq!(size_of::<GptEntry>(), 0x80);
    }

    #[test]
    fn read_table_512() {
        let mut disk = disk(512, 128);
        let table = PartitionTable::read(&mut disk, None).unwrap();
        assert_eq!(table.block_size(), 512);
        assert_eq!(table.block_count(), 128);
        assert_eq!(table.len(), 2);

        let main = table.find_by_name("mainos").unwrap();
        assert_eq!(main.index, 0);
        assert_eq!(main.first_lba, 34);
        assert_eq!(main.block_count(), 16);
        assert_eq!(main.offset, 34 * 512);
        assert_eq!(main.length, 16 * 512);

        let dump = table.find_by_type(&DUMP_TYPE).unwrap();
        assert_eq!(dump.name, "SVRawDump");
        assert_eq!(dump.first_lba, 50);
    }

    #[test]
    fn read_table_4k() {
        let mut disk = disk(4096, 64);
        let table = PartitionTable::read(&mut disk, None).unwrap();
        assert_eq!(table.block_size(), 4096);
        // 128 entries of 128 bytes take 4 blocks
        assert_eq!(table.get(0).unwrap().first_lba, 6);
    }

    #[test]
    fn reject_mbr() {
        let mut disk = Cursor::new(vec![0u8; 512 * 8]);
        disk.get_mut()[510] = 0x55;
        disk.get_mut()[511] = 0xAA;
        let err = PartitionTable::read(&mut disk, None).unwrap_err();
        assert_eq!(err.1, ErrorKind::UnsupportedPartition);
        assert_eq!(
            probe(&mut disk, None).unwrap(),
            (512, PartitionScheme::Mbr)
        );
    }

    #[test]
    fn reject_raw() {
        let mut disk = Cursor::new(vec![0u8; 512 * 8]);
        assert_eq!(
            probe(&mut disk, None).unwrap(),
            (512, PartitionScheme::Raw)
        );
        assert!(PartitionTable::read(&mut disk, None).is_err());
    }

    #[test]
    fn entries_lba_overflow() {
        let mut disk = disk(512, 128);
        let entries_lba = u64::MAX / 512;
        disk.get_mut()[512 + 0x48..512 + 0x50].copy_from_slice(&entries_lba.to_le_bytes());
        assert_eq!(
            PartitionTable::read(&mut disk, None).unwrap_err(),
            Error(ErrorOrigin::PartitionTable, ErrorKind::Overflow)
        );

        disk.get_mut()[512 + 0x48..512 + 0x50].copy_from_slice(&127u64.to_le_bytes());
        assert_eq!(
            PartitionTable::read(&mut disk, None).unwrap_err(),
            Error(ErrorOrigin::PartitionTable, ErrorKind::EndOfMedium)
        );
    }

    #[test]
    fn partition_too_large() {
        let mut disk = Cursor::new(vec![0u8; 512 * 40]);
        let res = write_gpt(
            &mut disk,
            512,
            40,
            Guid::NIL,
            &[PartitionSpec::new("Data", DATA_TYPE, 16)],
        );
        assert!(res.is_err());
    }
}
