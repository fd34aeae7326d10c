/*!
Block device and plain file access.

`DeviceIo` exposes a GPT formatted block medium or a plain dump file
through a single byte oriented interface. Block media are accessed
through a per-partition `BlockCache`, plain files are accessed directly.

# Examples

```
use rawdump_core::device::{DeviceIo, DeviceOptions, MediumKind};
use std::io::Cursor;

let mut file = DeviceIo::new(DeviceOptions::default());
file.attach(Cursor::new(vec![0u8; 0x100]), "rawdump.bin", MediumKind::PlainFile)
    .unwrap();

let mut buf = [0u8; 0x10];
file.set_position(0x20).unwrap();
file.read(&mut buf).unwrap();
```
*/

pub mod cache;
pub mod gpt;

#[doc(hidden)]
pub use cache::{BlockCache, DEFAULT_CACHE_BLOCKS};
#[doc(hidden)]
pub use gpt::{Partition, PartitionScheme, PartitionSpec, PartitionTable};

use crate::error::{Error, ErrorKind, ErrorOrigin, PartialError, PartialResult, Result};
use crate::types::Guid;

use std::cmp::min;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};

use log::{debug, info, trace, warn};

/// Block size used when neither a GPT header nor the configuration provides one.
pub const DEFAULT_BLOCK_SIZE: usize = 0x1000;

/// Highest drive index accepted by `DeviceTarget::Index`.
pub const MAX_DRIVE_INDEX: u32 = 999;

/// Name of the legacy dump partition.
pub const CRASHDUMP_PARTITION: &str = "CrashDump";
/// Name of the EFI system partition.
pub const EFIESP_PARTITION: &str = "EFIESP";
/// Name of the operating system partition.
pub const MAINOS_PARTITION: &str = "MainOS";
/// Name of the user data partition.
pub const DATA_PARTITION: &str = "Data";

/// Type GUID of the dedicated raw dump partition (`SVRawDump`).
pub const SVRAWDUMP_PARTITION_TYPE: Guid = Guid::new(
    0x66C9_B323,
    0xF7FC,
    0x48B6,
    [0xBF, 0x96, 0x6F, 0x32, 0xE3, 0x35, 0xA4, 0x28],
);

/// The kind of medium backing a `DeviceIo`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MediumKind {
    /// Fixed block device
    Raw,
    /// Removable block device, e.g. an SD card
    Removable,
    /// Regular file, block size 1
    PlainFile,
}

impl MediumKind {
    pub fn is_block(self) -> bool {
        self != MediumKind::PlainFile
    }
}

/// Identifies the medium to be opened.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeviceTarget {
    /// A drive name like `\\.\PhysicalDrive0`, `/dev/sdb` or a file path
    Name(String),
    /// A physical drive index
    Index(u32),
}

impl From<&str> for DeviceTarget {
    fn from(name: &str) -> Self {
        DeviceTarget::Name(name.to_string())
    }
}

impl From<u32> for DeviceTarget {
    fn from(index: u32) -> Self {
        DeviceTarget::Index(index)
    }
}

/// Selects a partition on a block medium.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PartitionSelector {
    Index(usize),
    Name(String),
    TypeGuid(Guid),
}

/// The result of `DeviceIo::set_position`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Position {
    /// The position is inside the medium
    Within(u64),
    /// The requested position was at or past the end and got clamped to the end
    Eof(u64),
}

impl Position {
    pub fn offset(self) -> u64 {
        match self {
            Position::Within(offset) | Position::Eof(offset) => offset,
        }
    }

    pub fn is_eof(self) -> bool {
        matches!(self, Position::Eof(_))
    }
}

/// Options used when opening a medium.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceOptions {
    /// Block size override, probed from the partition table otherwise
    pub block_size: Option<usize>,
    /// Number of blocks held by the cache
    pub cache_blocks: usize,
    /// Removable override, detected from the platform otherwise
    pub removable: Option<bool>,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            block_size: None,
            cache_blocks: DEFAULT_CACHE_BLOCKS,
            removable: None,
        }
    }
}

/// Returns true if the name refers to a block device rather than a file.
pub fn is_block_device_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with(r"\\.\physicaldrive") || name.starts_with("/dev/")
}

/// Builds the platform name of the physical drive with the given index.
pub fn drive_name(index: u32) -> Result<String> {
    if index > MAX_DRIVE_INDEX {
        return Err(Error(ErrorOrigin::Device, ErrorKind::NotFound)
            .log_error(format!("drive index {} out of range", index)));
    }

    if cfg!(windows) {
        Ok(format!(r"\\.\PhysicalDrive{}", index))
    } else {
        // sda..sdz, sdaa..
        let mut suffix = Vec::new();
        let mut n = index + 1;
        while n > 0 {
            n -= 1;
            suffix.push(b'a' + (n % 26) as u8);
            n /= 26;
        }
        suffix.reverse();
        Ok(format!("/dev/sd{}", String::from_utf8_lossy(&suffix)))
    }
}

/// Queries the platform whether the given block device is removable.
pub fn is_removable(name: &str) -> bool {
    match name.strip_prefix("/dev/") {
        Some(dev) => std::fs::read_to_string(format!("/sys/block/{}/removable", dev))
            .map(|s| s.trim() == "1")
            .unwrap_or(false),
        None => false,
    }
}

/// Handle wrapper remembering the OS error code of its last failed operation.
struct TrackedHandle<T> {
    inner: T,
    last_os_error: Option<i32>,
}

impl<T> TrackedHandle<T> {
    fn new(inner: T) -> Self {
        Self {
            inner,
            last_os_error: None,
        }
    }

    fn track<R>(&mut self, result: io::Result<R>) -> io::Result<R> {
        if let Err(err) = &result {
            self.last_os_error = err.raw_os_error();
        }
        result
    }
}

impl<T: Read> Read for TrackedHandle<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.inner.read(buf);
        self.track(result)
    }
}

impl<T: Write> Write for TrackedHandle<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.inner.write(buf);
        self.track(result)
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = self.inner.flush();
        self.track(result)
    }
}

impl<T: Seek> Seek for TrackedHandle<T> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let result = self.inner.seek(pos);
        self.track(result)
    }
}

/// Byte level access to a block medium or a plain file.
pub struct DeviceIo<T = File> {
    handle: Option<TrackedHandle<T>>,
    last_os_error: Option<i32>,
    name: String,
    kind: MediumKind,
    options: DeviceOptions,
    block_size: usize,
    size: u64,
    table: Option<PartitionTable>,
    partition: Option<Partition>,
    cache: Option<BlockCache>,
    position: u64,
}

impl DeviceIo<File> {
    /// Opens a block device or a dump file.
    pub fn open(&mut self, target: &DeviceTarget) -> Result<()> {
        if self.is_open() {
            return Err(Error(ErrorOrigin::Device, ErrorKind::AlreadyOpened).log_warn(&self.name));
        }

        let name = match target {
            DeviceTarget::Name(name) => name.clone(),
            DeviceTarget::Index(index) => drive_name(*index)?,
        };

        let kind = if is_block_device_name(&name) {
            if self.options.removable.unwrap_or_else(|| is_removable(&name)) {
                MediumKind::Removable
            } else {
                MediumKind::Raw
            }
        } else {
            MediumKind::PlainFile
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&name)
            .or_else(|err| {
                debug!("unable to open {} for writing ({}), opening read-only", name, err);
                File::open(&name)
            })
            .map_err(|err| {
                self.last_os_error = err.raw_os_error();
                let kind = match err.kind() {
                    io::ErrorKind::NotFound => ErrorKind::NotFound,
                    _ => ErrorKind::UnableToOpenFile,
                };
                Error(ErrorOrigin::Device, kind).log_error(format!("{}: {}", name, err))
            })?;

        self.attach(file, &name, kind)
    }

    /// Opens a plain dump file.
    pub fn open_file(path: &str, options: DeviceOptions) -> Result<Self> {
        let mut device = Self::new(options);
        device.open(&DeviceTarget::Name(path.to_string()))?;
        Ok(device)
    }
}

impl<T> DeviceIo<T> {
    /// Creates an accessor which is not attached to any medium yet.
    pub fn new(options: DeviceOptions) -> Self {
        Self {
            handle: None,
            last_os_error: None,
            name: String::new(),
            kind: MediumKind::PlainFile,
            options,
            block_size: 1,
            size: 0,
            table: None,
            partition: None,
            cache: None,
            position: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// OS error code of the last failed open or I/O operation.
    ///
    /// `None` if nothing failed since the medium was attached or the failure carried no OS code.
    /// The value survives `close`.
    pub fn last_os_error(&self) -> Option<i32> {
        match &self.handle {
            Some(handle) => handle.last_os_error,
            None => self.last_os_error,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MediumKind {
        self.kind
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total size of the medium in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current byte offset, relative to the selected partition on block media.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Partitions of a block medium, empty for plain files.
    pub fn partitions(&self) -> &[Partition] {
        self.table.as_ref().map(|t| t.partitions()).unwrap_or(&[])
    }

    pub fn partition_count(&self) -> usize {
        self.partitions().len()
    }

    pub fn current_partition(&self) -> Option<&Partition> {
        self.partition.as_ref()
    }

    /// Returns the first block and block count currently held by the cache.
    pub fn cache_range(&self) -> Option<(u64, usize)> {
        self.cache.as_ref().and_then(BlockCache::range)
    }

    /// Releases the handle, the partition table and the cache.
    ///
    /// Closing an accessor which is not open is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            debug!("closing {}", self.name);
            self.last_os_error = handle.last_os_error;
        }
        self.table = None;
        self.partition = None;
        self.cache = None;
        self.position = 0;
        self.size = 0;
        Ok(())
    }

    /// Number of bytes addressable at the current state.
    fn length(&self) -> Result<u64> {
        if !self.is_open() {
            return Err(Error(ErrorOrigin::Device, ErrorKind::NotReady));
        }
        if self.kind.is_block() {
            self.partition
                .as_ref()
                .map(|p| p.length)
                .ok_or(Error(ErrorOrigin::Device, ErrorKind::PartitionNotSet))
        } else {
            Ok(self.size)
        }
    }

    /// Moves the current position.
    ///
    /// Offsets at or past the end are clamped to the end and reported as `Position::Eof`.
    pub fn set_position(&mut self, offset: u64) -> Result<Position> {
        let length = self.length()?;
        if offset >= length {
            self.position = length;
            Ok(Position::Eof(length))
        } else {
            self.position = offset;
            Ok(Position::Within(offset))
        }
    }
}

impl<T: Read + Write + Seek> DeviceIo<T> {
    /// Creates an accessor over an already opened block medium.
    pub fn with_block_medium(handle: T, name: &str, removable: bool, options: DeviceOptions) -> Result<Self> {
        let mut device = Self::new(options);
        let kind = if removable {
            MediumKind::Removable
        } else {
            MediumKind::Raw
        };
        device.attach(handle, name, kind)?;
        Ok(device)
    }

    /// Creates an accessor over an already opened plain file.
    pub fn with_plain_file(handle: T, name: &str, options: DeviceOptions) -> Result<Self> {
        let mut device = Self::new(options);
        device.attach(handle, name, MediumKind::PlainFile)?;
        Ok(device)
    }

    /// Attaches an opened handle to this accessor.
    ///
    /// Block media have their partition table read, only GPT is supported.
    pub fn attach(&mut self, handle: T, name: &str, kind: MediumKind) -> Result<()> {
        if self.is_open() {
            return Err(Error(ErrorOrigin::Device, ErrorKind::AlreadyOpened).log_warn(name));
        }

        let mut handle = TrackedHandle::new(handle);
        let (size, table) = match probe_medium(&mut handle, name, kind, self.options.block_size) {
            Ok(probed) => probed,
            Err(err) => {
                self.last_os_error = handle.last_os_error;
                return Err(err);
            }
        };

        match table {
            Some(table) => {
                self.block_size = table.block_size();
                self.table = Some(table);
            }
            None => {
                self.block_size = 1;
                self.table = None;
            }
        }

        info!(
            "opened {}: kind={:?} size={:x} block_size={:x}",
            name, kind, size, self.block_size
        );

        self.handle = Some(handle);
        self.last_os_error = None;
        self.name = name.to_string();
        self.kind = kind;
        self.size = size;
        self.partition = None;
        self.cache = None;
        self.position = 0;
        Ok(())
    }

    /// Selects a partition on a block medium and resets position and cache.
    pub fn select_partition(&mut self, selector: &PartitionSelector) -> Result<&Partition> {
        if !self.is_open() {
            return Err(Error(ErrorOrigin::Device, ErrorKind::NotReady));
        }
        let table = self
            .table
            .as_ref()
            .ok_or(Error(ErrorOrigin::Device, ErrorKind::NotSupported))?;

        let partition = match selector {
            PartitionSelector::Index(index) => table.get(*index),
            PartitionSelector::Name(name) => table.find_by_name(name),
            PartitionSelector::TypeGuid(guid) => table.find_by_type(guid),
        }
        .cloned()
        .ok_or_else(|| {
            Error(ErrorOrigin::Device, ErrorKind::PartitionNotFound).log_debug(format!("{:?}", selector))
        })?;

        let cache = BlockCache::new(
            self.block_size,
            self.options.cache_blocks,
            partition.offset,
            partition.block_count(),
        )?;

        debug!(
            "selected partition {:?}: cache_blocks={:x}",
            partition,
            cache.capacity()
        );

        self.cache = Some(cache);
        self.position = 0;
        Ok(self.partition.insert(partition))
    }

    /// Reads at the current position and advances it.
    ///
    /// Requests crossing the end of the medium are clamped and reported as `PartialError::PartialRead`.
    pub fn read(&mut self, buf: &mut [u8]) -> PartialResult<usize> {
        if buf.is_empty() {
            return Err(PartialError::Error(Error(ErrorOrigin::Device, ErrorKind::InvalidBuffer)));
        }

        let length = self.length()?;
        if self.position >= length {
            return Err(PartialError::Error(Error(ErrorOrigin::Device, ErrorKind::EndOfMedium)));
        }

        let wanted = min(buf.len() as u64, length - self.position) as usize;
        let done = if self.kind.is_block() {
            self.read_blocks(&mut buf[..wanted])?
        } else {
            self.read_file(&mut buf[..wanted])?
        };

        if done < buf.len() {
            trace!("partial read: wanted={:x} got={:x}", buf.len(), done);
            Err(PartialError::PartialRead(done))
        } else {
            Ok(done)
        }
    }

    /// Writes at the current position and advances it.
    ///
    /// Plain files grow when written at their end, block media never do.
    pub fn write(&mut self, data: &[u8]) -> PartialResult<usize> {
        if data.is_empty() {
            return Err(PartialError::Error(Error(ErrorOrigin::Device, ErrorKind::InvalidBuffer)));
        }

        if !self.kind.is_block() {
            self.length()?;
            return Ok(self.write_file(data)?);
        }

        let length = self.length()?;
        if self.position >= length {
            return Err(PartialError::Error(Error(ErrorOrigin::Device, ErrorKind::EndOfMedium)));
        }

        let wanted = min(data.len() as u64, length - self.position) as usize;
        let done = self.write_blocks(&data[..wanted])?;
        if done < data.len() {
            Err(PartialError::PartialWrite(done))
        } else {
            Ok(done)
        }
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.set_position(offset)?.is_eof() {
            return Err(Error(ErrorOrigin::Device, ErrorKind::EndOfMedium)
                .log_debug(format!("offset={:x}", offset)));
        }
        match self.read(buf) {
            Ok(_) => Ok(()),
            Err(PartialError::PartialRead(n)) => Err(Error(ErrorOrigin::Device, ErrorKind::PartialData)
                .log_debug(format!("offset={:x} len={:x} got={:x}", offset, buf.len(), n))),
            Err(err) => Err(err.into()),
        }
    }

    /// Streams the whole selected partition (or file) into `out`, returns the number of bytes copied.
    pub fn copy_partition_to<W: Write>(&mut self, out: &mut W) -> Result<u64> {
        let length = self.length()?;
        let chunk = self
            .cache
            .as_ref()
            .map(BlockCache::capacity_bytes)
            .unwrap_or(DEFAULT_BLOCK_SIZE * 0x100);
        let mut buf = vec![0u8; chunk];

        self.set_position(0)?;
        let mut copied = 0u64;
        while copied < length {
            let n = match self.read(&mut buf) {
                Ok(n) => n,
                Err(PartialError::PartialRead(n)) => n,
                Err(err) => return Err(err.into()),
            };
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).map_err(|err| {
                Error(ErrorOrigin::Device, ErrorKind::UnableToWriteFile)
                    .log_error(format!("offset={:x}: {}", copied, err))
            })?;
            copied += n as u64;
        }

        info!("copied {:x} bytes from {}", copied, self.name);
        Ok(copied)
    }

    fn parts(&mut self) -> Result<(&mut TrackedHandle<T>, &mut BlockCache, u64)> {
        let handle = self
            .handle
            .as_mut()
            .ok_or(Error(ErrorOrigin::Device, ErrorKind::InvalidHandle))?;
        let cache = self
            .cache
            .as_mut()
            .ok_or(Error(ErrorOrigin::Device, ErrorKind::CacheInvalid))?;
        let offset = self
            .partition
            .as_ref()
            .map(|p| p.offset)
            .ok_or(Error(ErrorOrigin::Device, ErrorKind::PartitionNotSet))?;
        Ok((handle, cache, offset))
    }

    /// Number of bytes transferred directly so the remainder fits into the cache.
    fn direct_len(&self, remaining: usize) -> usize {
        let cache_bytes = self
            .cache
            .as_ref()
            .map(BlockCache::capacity_bytes)
            .unwrap_or(0);
        if remaining > cache_bytes {
            let bs = self.block_size;
            (remaining - cache_bytes + bs - 1) / bs * bs
        } else {
            0
        }
    }

    fn read_blocks(&mut self, buf: &mut [u8]) -> Result<usize> {
        let bs = self.block_size as u64;
        let mut done = 0;

        // finish the partially consumed block
        let head = (self.position % bs) as usize;
        if head != 0 {
            let n = min(self.block_size - head, buf.len());
            let pos = self.position;
            let (handle, cache, _) = self.parts()?;
            cache.ensure(handle, pos / bs, 1)?;
            cache.copy_out(pos, &mut buf[..n])?;
            done += n;
            self.position += n as u64;
        }

        let direct = self.direct_len(buf.len() - done);
        if direct > 0 {
            let pos = self.position;
            let (handle, _, offset) = self.parts()?;
            let got = read_fully(handle, offset + pos, &mut buf[done..done + direct])?;
            done += got;
            self.position += got as u64;
            if got < direct {
                return Ok(done);
            }
        }

        if done < buf.len() {
            let rest = buf.len() - done;
            let pos = self.position;
            let first = pos / bs;
            let blocks = ((pos + rest as u64 + bs - 1) / bs - first) as usize;
            let (handle, cache, _) = self.parts()?;
            cache.ensure(handle, first, blocks)?;
            cache.copy_out(pos, &mut buf[done..])?;
            done += rest;
            self.position += rest as u64;
        }

        Ok(done)
    }

    fn write_blocks(&mut self, data: &[u8]) -> Result<usize> {
        let bs = self.block_size as u64;
        let mut done = 0;

        let head = (self.position % bs) as usize;
        if head != 0 {
            let n = min(self.block_size - head, data.len());
            let pos = self.position;
            let (handle, cache, _) = self.parts()?;
            cache.ensure(handle, pos / bs, 1)?;
            cache.copy_in(pos, &data[..n])?;
            cache.flush(handle, pos / bs, 1)?;
            done += n;
            self.position += n as u64;
        }

        let direct = self.direct_len(data.len() - done);
        if direct > 0 {
            let pos = self.position;
            let (handle, cache, offset) = self.parts()?;
            cache.invalidate();
            write_all_at(handle, offset + pos, &data[done..done + direct])?;
            done += direct;
            self.position += direct as u64;
        }

        if done < data.len() {
            let rest = data.len() - done;
            let pos = self.position;
            let first = pos / bs;
            let blocks = ((pos + rest as u64 + bs - 1) / bs - first) as usize;
            let (handle, cache, _) = self.parts()?;
            cache.ensure(handle, first, blocks)?;
            cache.copy_in(pos, &data[done..])?;
            cache.flush(handle, first, blocks)?;
            done += rest;
            self.position += rest as u64;
        }

        Ok(done)
    }

    fn read_file(&mut self, buf: &mut [u8]) -> Result<usize> {
        let pos = self.position;
        let handle = self
            .handle
            .as_mut()
            .ok_or(Error(ErrorOrigin::Device, ErrorKind::InvalidHandle))?;
        let got = read_fully(handle, pos, buf)?;
        self.position += got as u64;
        Ok(got)
    }

    fn write_file(&mut self, data: &[u8]) -> Result<usize> {
        let pos = self.position;
        let handle = self
            .handle
            .as_mut()
            .ok_or(Error(ErrorOrigin::Device, ErrorKind::InvalidHandle))?;
        write_all_at(handle, pos, data)?;
        self.position += data.len() as u64;
        if self.position > self.size {
            self.size = self.position;
        }
        Ok(data.len())
    }
}

/// Returns the size of the medium and, for block media, its partition table.
fn probe_medium<T: Read + Seek>(
    handle: &mut T,
    name: &str,
    kind: MediumKind,
    block_size: Option<usize>,
) -> Result<(u64, Option<PartitionTable>)> {
    let size = handle.seek(SeekFrom::End(0)).map_err(|err| {
        Error(ErrorOrigin::Device, ErrorKind::UnableToSeekFile).log_error(format!("{}: {}", name, err))
    })?;

    let table = if kind.is_block() {
        Some(PartitionTable::read(handle, block_size)?)
    } else {
        None
    };
    Ok((size, table))
}

/// Reads until `buf` is full or the handle reports the end, returns the number of bytes read.
fn read_fully<T: Read + Seek>(handle: &mut T, offset: u64, buf: &mut [u8]) -> Result<usize> {
    handle.seek(SeekFrom::Start(offset)).map_err(|err| {
        Error(ErrorOrigin::Device, ErrorKind::UnableToSeekFile).log_error(format!("offset={:x}: {}", offset, err))
    })?;

    let mut done = 0;
    while done < buf.len() {
        match handle.read(&mut buf[done..]) {
            Ok(0) => {
                warn!(
                    "medium ended early: offset={:x} len={:x} got={:x}",
                    offset,
                    buf.len(),
                    done
                );
                break;
            }
            Ok(n) => done += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                return Err(Error(ErrorOrigin::Device, ErrorKind::UnableToReadFile).log_error(format!(
                    "offset={:x} len={:x}: {}",
                    offset,
                    buf.len(),
                    err
                )))
            }
        }
    }
    Ok(done)
}

fn write_all_at<T: Write + Seek>(handle: &mut T, offset: u64, data: &[u8]) -> Result<()> {
    handle.seek(SeekFrom::Start(offset)).map_err(|err| {
        Error(ErrorOrigin::Device, ErrorKind::UnableToSeekFile).log_error(format!("offset={:x}: {}", offset, err))
    })?;
    handle.write_all(data).map_err(|err| {
        Error(ErrorOrigin::Device, ErrorKind::UnableToWriteFile).log_error(format!(
            "offset={:x} len={:x}: {}",
            offset,
            data.len(),
            err
        ))
    })
}

impl<T> Drop for DeviceIo<T> {
    fn drop(&mut self) {
        self.close().ok();
    }
}

impl<T: Read + Write + Seek> Read for DeviceIo<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match DeviceIo::read(self, buf) {
            Ok(n) | Err(PartialError::PartialRead(n)) => Ok(n),
            Err(PartialError::Error(Error(_, ErrorKind::EndOfMedium))) => Ok(0),
            Err(err) => Err(Error::from(err).into()),
        }
    }
}

impl<T: Read + Write + Seek> Write for DeviceIo<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match DeviceIo::write(self, buf) {
            Ok(n) | Err(PartialError::PartialWrite(n)) => Ok(n),
            Err(PartialError::Error(Error(_, ErrorKind::EndOfMedium))) => Ok(0),
            Err(err) => Err(Error::from(err).into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.handle.as_mut() {
            Some(handle) => handle.flush(),
            None => Ok(()),
        }
    }
}

impl<T: Read + Write + Seek> Seek for DeviceIo<T> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let length = self.length()?;
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => offset_by(self.position, delta),
            SeekFrom::End(delta) => offset_by(length, delta),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid seek position"))?;

        Ok(self.set_position(target)?.offset())
    }
}

fn offset_by(base: u64, delta: i64) -> Option<u64> {
    if delta >= 0 {
        base.checked_add(delta as u64)
    } else {
        base.checked_sub(delta.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const BS: usize = 512;
    const DATA_TYPE: Guid = Guid::new(
        0xEBD0_A0A2,
        0xB9E5,
        0x4433,
        [0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7],
    );

    fn pattern(offset: u64) -> u8 {
        (offset % 251) as u8
    }

    /// A disk with a 16 block MainOS partition followed by a 64 block dump partition.
    fn disk() -> Cursor<Vec<u8>> {
        let blocks = 128u64;
        let mut disk = Cursor::new(vec![0u8; BS * blocks as usize]);
        let starts = gpt::write_gpt(
            &mut disk,
            BS,
            blocks,
            Guid::NIL,
            &[
                PartitionSpec::new(MAINOS_PARTITION, DATA_TYPE, 16),
                PartitionSpec::new("SVRawDump", SVRAWDUMP_PARTITION_TYPE, 64),
            ],
        )
        .unwrap();

        let start = starts[1] as usize * BS;
        for (i, b) in disk.get_mut()[start..start + 64 * BS].iter_mut().enumerate() {
            *b = pattern(i as u64);
        }
        disk
    }

    fn device(cache_blocks: usize) -> DeviceIo<Cursor<Vec<u8>>> {
        let options = DeviceOptions {
            cache_blocks,
            ..DeviceOptions::default()
        };
        let mut dev = DeviceIo::with_block_medium(disk(), "disk", true, options).unwrap();
        dev.select_partition(&PartitionSelector::TypeGuid(SVRAWDUMP_PARTITION_TYPE))
            .unwrap();
        dev
    }

    #[test]
    fn partitions() {
        let mut dev = DeviceIo::with_block_medium(disk(), "disk", false, DeviceOptions::default()).unwrap();
        assert_eq!(dev.kind(), MediumKind::Raw);
        assert_eq!(dev.block_size(), BS);
        assert_eq!(dev.partition_count(), 2);
        assert!(dev.current_partition().is_none());

        let mut buf = [0u8; 4];
        assert_eq!(
            dev.read(&mut buf),
            Err(PartialError::Error(Error(
                ErrorOrigin::Device,
                ErrorKind::PartitionNotSet
            )))
        );

        let p = dev
            .select_partition(&PartitionSelector::Name("mainos".to_string()))
            .unwrap();
        assert_eq!(p.index, 0);
        let p = dev.select_partition(&PartitionSelector::Index(1)).unwrap();
        assert_eq!(p.name, "SVRawDump");
        assert_eq!(dev.cache_range(), None);

        assert!(dev.select_partition(&PartitionSelector::Index(2)).is_err());
        assert!(dev
            .select_partition(&PartitionSelector::Name(CRASHDUMP_PARTITION.to_string()))
            .is_err());
    }

    #[test]
    fn unsupported_mbr() {
        let mut medium = vec![0u8; BS * 8];
        medium[510] = 0x55;
        medium[511] = 0xAA;
        let err = DeviceIo::with_block_medium(Cursor::new(medium), "disk", false, DeviceOptions::default())
            .err()
            .unwrap();
        assert_eq!(err, Error(ErrorOrigin::PartitionTable, ErrorKind::UnsupportedPartition));
    }

    #[test]
    fn read_phases() {
        let mut dev = device(4);

        // unaligned head, direct blocks and cached tail
        dev.set_position(100).unwrap();
        let mut buf = vec![0u8; 10 * BS + 33];
        assert_eq!(dev.read(&mut buf).unwrap(), buf.len());
        for (i, b) in buf.iter().enumerate() {
            assert_eq!(*b, pattern(100 + i as u64));
        }
        assert_eq!(dev.position(), 100 + buf.len() as u64);

        // small reads are served from the cache
        let range = dev.cache_range();
        let mut small = [0u8; 8];
        dev.read(&mut small).unwrap();
        assert_eq!(dev.cache_range(), range);
        assert_eq!(small[0], pattern(100 + buf.len() as u64));
    }

    #[test]
    fn read_clamped_at_partition_end() {
        let mut dev = device(8);
        let len = 64 * BS as u64;

        dev.set_position(len - 10).unwrap();
        let mut buf = [0u8; 32];
        match dev.read(&mut buf) {
            Err(PartialError::PartialRead(n)) => assert_eq!(n, 10),
            _ => panic!("expected partial read"),
        }
        assert_eq!(buf[9], pattern(len - 1));
        // cache got moved back inside the partition
        assert_eq!(dev.cache_range(), Some((56, 8)));

        assert_eq!(dev.set_position(len + 5).unwrap(), Position::Eof(len));
        assert!(dev.read(&mut buf).is_err());
    }

    #[test]
    fn write_clamped_at_partition_end() {
        let mut dev = device(8);
        let len = 64 * BS as u64;

        dev.set_position(len - 10).unwrap();
        match dev.write(&[0x55u8; 40]) {
            Err(PartialError::PartialWrite(n)) => assert_eq!(n, 10),
            _ => panic!("expected partial write"),
        }

        let mut buf = [0u8; 12];
        dev.read_at(len - 12, &mut buf).unwrap();
        assert_eq!(buf[0], pattern(len - 12));
        assert_eq!(buf[1], pattern(len - 11));
        assert!(buf[2..].iter().all(|&b| b == 0x55));

        dev.set_position(len).unwrap();
        assert!(dev.write(&[0x55u8; 4]).is_err());
    }

    #[test]
    fn write_read_modify() {
        let mut dev = device(4);

        dev.set_position(BS as u64 - 2).unwrap();
        let data = vec![0xEEu8; 6 * BS];
        assert_eq!(dev.write(&data).unwrap(), data.len());

        let mut buf = vec![0u8; 6 * BS + 4];
        dev.read_at(BS as u64 - 4, &mut buf).unwrap();
        assert_eq!(buf[0], pattern(BS as u64 - 4));
        assert_eq!(buf[1], pattern(BS as u64 - 3));
        assert!(buf[2..2 + data.len()].iter().all(|&b| b == 0xEE));
        assert_eq!(buf[buf.len() - 1], pattern(7 * BS as u64 - 1));
    }

    #[test]
    fn io_traits() {
        let mut dev = device(4);
        assert_eq!(dev.seek(SeekFrom::End(-4)).unwrap(), 64 * BS as u64 - 4);
        let mut rest = Vec::new();
        dev.read_to_end(&mut rest).unwrap();
        assert_eq!(rest.len(), 4);

        let mut out = Vec::new();
        assert_eq!(dev.copy_partition_to(&mut out).unwrap(), 64 * BS as u64);
        assert_eq!(out[1000], pattern(1000));
    }

    #[test]
    fn plain_file_grows() {
        let mut dev = DeviceIo::with_plain_file(Cursor::new(vec![1u8; 16]), "file", DeviceOptions::default())
            .unwrap();
        assert_eq!(dev.block_size(), 1);
        assert!(dev.select_partition(&PartitionSelector::Index(0)).is_err());

        assert_eq!(dev.set_position(100).unwrap(), Position::Eof(16));
        dev.write(&[2u8; 8]).unwrap();
        assert_eq!(dev.size(), 24);

        let mut buf = [0u8; 32];
        dev.set_position(12).unwrap();
        match dev.read(&mut buf) {
            Err(PartialError::PartialRead(n)) => assert_eq!(n, 12),
            _ => panic!("expected partial read"),
        }
        assert_eq!(&buf[..6], &[1, 1, 1, 1, 2, 2]);
    }

    #[test]
    fn open_close() {
        let mut dev = DeviceIo::<Cursor<Vec<u8>>>::new(DeviceOptions::default());
        let mut buf = [0u8; 4];
        assert!(dev.read(&mut buf).is_err());
        assert_eq!(
            dev.set_position(0).unwrap_err(),
            Error(ErrorOrigin::Device, ErrorKind::NotReady)
        );

        dev.attach(Cursor::new(vec![0u8; 16]), "a", MediumKind::PlainFile)
            .unwrap();
        assert_eq!(
            dev.attach(Cursor::new(vec![0u8; 16]), "b", MediumKind::PlainFile)
                .unwrap_err(),
            Error(ErrorOrigin::Device, ErrorKind::AlreadyOpened)
        );

        dev.close().unwrap();
        assert!(!dev.is_open());
        dev.close().unwrap();
        dev.attach(Cursor::new(vec![0u8; 16]), "b", MediumKind::PlainFile)
            .unwrap();
        assert_eq!(dev.name(), "b");
    }

    /// A plain file whose reads fail with the given OS error.
    struct FailingReads {
        inner: Cursor<Vec<u8>>,
        code: i32,
    }

    impl Read for FailingReads {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(self.code))
        }
    }

    impl Write for FailingReads {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FailingReads {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[test]
    fn last_os_error_recorded() {
        let mut dev = DeviceIo::new(DeviceOptions::default());
        assert_eq!(dev.last_os_error(), None);

        let medium = FailingReads {
            inner: Cursor::new(vec![0u8; 0x100]),
            code: 5,
        };
        dev.attach(medium, "failing", MediumKind::PlainFile).unwrap();
        assert_eq!(dev.last_os_error(), None);

        // writes succeed and leave the code untouched
        dev.write(&[1, 2, 3, 4]).unwrap();
        assert_eq!(dev.last_os_error(), None);

        let mut buf = [0u8; 0x10];
        dev.set_position(0).unwrap();
        match dev.read(&mut buf) {
            Err(PartialError::Error(err)) => assert_eq!(err, Error(ErrorOrigin::Device, ErrorKind::UnableToReadFile)),
            _ => panic!("read of a failing medium must fail"),
        }
        assert_eq!(dev.last_os_error(), Some(5));

        dev.close().unwrap();
        assert_eq!(dev.last_os_error(), Some(5));

        // attaching a new medium starts over
        dev.attach(
            FailingReads {
                inner: Cursor::new(vec![0u8; 0x10]),
                code: 5,
            },
            "again",
            MediumKind::PlainFile,
        )
        .unwrap();
        assert_eq!(dev.last_os_error(), None);
    }

    #[test]
    fn last_os_error_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.bin");
        let mut dev = DeviceIo::new(DeviceOptions::default());
        assert_eq!(
            dev.open(&DeviceTarget::Name(missing.to_string_lossy().into_owned()))
                .unwrap_err(),
            Error(ErrorOrigin::Device, ErrorKind::NotFound)
        );
        // ENOENT and ERROR_FILE_NOT_FOUND
        assert_eq!(dev.last_os_error(), Some(2));

        // errors raised by in-memory media carry no OS code
        let mut dev = DeviceIo::new(DeviceOptions::default());
        dev.attach(Cursor::new(vec![0u8; 0x10]), "a", MediumKind::PlainFile)
            .unwrap();
        assert!(dev.set_position(0x20).unwrap().is_eof());
        assert_eq!(dev.last_os_error(), None);
    }

    #[test]
    fn names() {
        assert!(is_block_device_name(r"\\.\PhysicalDrive3"));
        assert!(is_block_device_name("/dev/mmcblk0"));
        assert!(!is_block_device_name("/tmp/rawdump.bin"));
        assert!(drive_name(1000).is_err());
        if !cfg!(windows) {
            assert_eq!(drive_name(0).unwrap(), "/dev/sda");
            assert_eq!(drive_name(27).unwrap(), "/dev/sdab");
        }
    }
}
