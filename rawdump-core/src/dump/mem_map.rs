/*!
Physical memory map of a raw dump.

Every DDR range section maps a range of physical memory to an offset in the dump.
The ranges are sorted by their base address, ranges following each other without
a gap are marked as contiguous and can be read across.
*/

use super::section::RawSectionEntry;
use crate::error::{Error, ErrorKind, ErrorOrigin, PartialError, PartialResult, Result};

use std::cmp::min;
use std::fmt;
use std::io::{Read, Seek, SeekFrom};

use dataview::{Pod, PodMethods};
use log::{debug, info, trace};

/// A physical memory range backed by the dump.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DdrRange {
    pub base: u64,
    /// Last address of the range, inclusive
    pub end: u64,
    /// Offset of the range in the dump
    pub offset: u64,
    pub size: u64,
    /// The range starts directly after the previous one
    pub contiguous: bool,
}

impl DdrRange {
    pub fn new(base: u64, size: u64, offset: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error(ErrorOrigin::MemoryMap, ErrorKind::InvalidRange)
                .log_warn(format!("empty range at base={:x}", base)));
        }
        let end = base.checked_add(size - 1).ok_or_else(|| {
            Error(ErrorOrigin::MemoryMap, ErrorKind::Overflow)
                .log_warn(format!("range overflows: base={:x} size={:x}", base, size))
        })?;
        Ok(Self {
            base,
            end,
            offset,
            size,
            contiguous: false,
        })
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.base <= addr && addr <= self.end
    }
}

/// Sorted, non-overlapping physical memory ranges of a raw dump.
#[derive(Clone, Default)]
pub struct DdrMemoryMap {
    ranges: Vec<DdrRange>,
    fragmentation_count: usize,
}

impl DdrMemoryMap {
    /// Builds the memory map from DDR range sections.
    ///
    /// Gaps between ranges are tolerated and counted, overlapping ranges are rejected.
    pub fn build<I: IntoIterator<Item = RawSectionEntry>>(sections: I) -> Result<Self> {
        let mut ranges = sections
            .into_iter()
            .map(|s| DdrRange::new(s.ddr_base(), s.size(), s.offset()))
            .collect::<Result<Vec<_>>>()?;

        if ranges.is_empty() {
            return Err(Error(ErrorOrigin::MemoryMap, ErrorKind::NoDdrSections));
        }

        ranges.sort_unstable_by_key(|r| r.base);

        let mut fragmentation_count = 0;
        for i in 1..ranges.len() {
            let prev = ranges[i - 1];
            let cur = &mut ranges[i];
            if cur.base <= prev.end {
                return Err(Error(ErrorOrigin::MemoryMap, ErrorKind::MemoryMapOverlap).log_warn(
                    format!(
                        "range base={:x} end={:x} overlaps base={:x} end={:x}",
                        cur.base, cur.end, prev.base, prev.end
                    ),
                ));
            } else if cur.base == prev.end + 1 {
                cur.contiguous = true;
            } else {
                info!(
                    "gap in memory map: {:x}-{:x}",
                    prev.end + 1,
                    cur.base - 1
                );
                fragmentation_count += 1;
            }
        }

        for range in ranges.iter() {
            debug!(
                "adding memory mapping: base={:x} end={:x} offset={:x} contiguous={}",
                range.base, range.end, range.offset, range.contiguous
            );
        }

        Ok(Self {
            ranges,
            fragmentation_count,
        })
    }

    pub fn ranges(&self) -> &[DdrRange] {
        &self.ranges
    }

    pub fn iter(&self) -> impl Iterator<Item = &DdrRange> {
        self.ranges.iter()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of gaps between the ranges.
    pub fn fragmentation_count(&self) -> usize {
        self.fragmentation_count
    }

    /// Sum of the sizes of all ranges.
    pub fn total_size(&self) -> u64 {
        self.ranges.iter().map(|r| r.size).sum()
    }

    fn find(&self, addr: u64) -> Option<usize> {
        let idx = self.ranges.partition_point(|r| r.end < addr);
        match self.ranges.get(idx) {
            Some(range) if range.contains(addr) => Some(idx),
            _ => None,
        }
    }

    /// Translates a physical address into an offset in the dump.
    pub fn translate(&self, addr: u64) -> Option<u64> {
        let range = &self.ranges[self.find(addr)?];
        range.offset.checked_add(addr - range.base)
    }

    /// Reads physical memory starting at `addr` into `buf`.
    ///
    /// Reads continue into the following range only if it is contiguous.
    /// If the map ends before `buf` is filled the number of bytes read is
    /// returned as `PartialError::PartialRead`.
    pub fn read_physical<R: Read + Seek>(&self, reader: &mut R, addr: u64, buf: &mut [u8]) -> PartialResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut idx = self.find(addr).ok_or_else(|| {
            Error(ErrorOrigin::PhysicalMemory, ErrorKind::OutOfMemoryRange).log_debug(format!("addr={:x}", addr))
        })?;

        let mut addr = addr;
        let mut done = 0;
        loop {
            let range = &self.ranges[idx];

            let delta = addr - range.base;
            let avail = range.size - delta;
            let len = min((buf.len() - done) as u64, avail) as usize;
            let offset = range
                .offset
                .checked_add(delta)
                .ok_or(Error(ErrorOrigin::PhysicalMemory, ErrorKind::Overflow))?;

            trace!("read_physical: addr={:x} offset={:x} len={:x}", addr, offset, len);
            read_exact_at(reader, offset, &mut buf[done..done + len])?;
            done += len;

            if done == buf.len() {
                return Ok(done);
            }

            idx += 1;
            match self.ranges.get(idx) {
                Some(next) if next.contiguous => addr = next.base,
                Some(next) => {
                    return Err(PartialError::Error(
                        Error(ErrorOrigin::PhysicalMemory, ErrorKind::NonContiguousRead).log_warn(format!(
                            "read crosses gap {:x}-{:x}",
                            range.end + 1,
                            next.base
                        )),
                    ));
                }
                None => {
                    debug!(
                        "read_physical: memory map exhausted after {:x} of {:x} bytes",
                        done,
                        buf.len()
                    );
                    return Err(PartialError::PartialRead(done));
                }
            }
        }
    }

    /// Reads exactly `buf.len()` bytes of physical memory.
    pub fn read_physical_exact<R: Read + Seek>(&self, reader: &mut R, addr: u64, buf: &mut [u8]) -> Result<()> {
        match self.read_physical(reader, addr, buf) {
            Ok(_) => Ok(()),
            Err(PartialError::PartialRead(n)) => Err(Error(ErrorOrigin::PhysicalMemory, ErrorKind::PartialData)
                .log_debug(format!("addr={:x} len={:x} got={:x}", addr, buf.len(), n))),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads a plain old data structure from physical memory.
    pub fn read_physical_pod<T: Pod, R: Read + Seek>(&self, reader: &mut R, addr: u64) -> Result<T> {
        let mut out = T::zeroed();
        self.read_physical_exact(reader, addr, out.as_bytes_mut())?;
        Ok(out)
    }
}

fn read_exact_at<R: Read + Seek>(reader: &mut R, offset: u64, buf: &mut [u8]) -> Result<()> {
    reader.seek(SeekFrom::Start(offset)).map_err(|err| {
        Error(ErrorOrigin::PhysicalMemory, ErrorKind::UnableToSeekFile)
            .log_error(format!("offset={:x}: {}", offset, err))
    })?;
    reader.read_exact(buf).map_err(|err| {
        Error(ErrorOrigin::PhysicalMemory, ErrorKind::UnableToReadFile)
            .log_error(format!("offset={:x} len={:x}: {}", offset, buf.len(), err))
    })
}

impl fmt::Debug for DdrMemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(
                f,
                "DdrRange: base={:x} end={:x} offset={:x}{}",
                r.base,
                r.end,
                r.offset,
                if r.contiguous { " contiguous" } else { "" }
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;
    use std::io::Cursor;

    fn ddr(base: u64, offset: u64, size: u64) -> RawSectionEntry {
        RawSectionEntry::ddr("DDR", base, offset, size)
    }

    /// A dump where every byte holds the low byte of its own file offset divided by 16.
    fn dump(len: usize) -> Cursor<Vec<u8>> {
        Cursor::new((0..len).map(|i| (i / 16) as u8).collect())
    }

    #[test]
    fn sorted_and_contiguous() {
        let mut sections = vec![
            ddr(0x1000, 0x0000, 0x1000),
            ddr(0x2000, 0x1000, 0x1000),
            ddr(0x3000, 0x2000, 0x800),
            ddr(0x4000, 0x2800, 0x1000),
            ddr(0x5000, 0x3800, 0x1000),
            ddr(0x8000, 0x4800, 0x2000),
        ];

        let mut rng = XorShiftRng::seed_from_u64(0x5EED);
        for _ in 0..16 {
            sections.shuffle(&mut rng);
            let map = DdrMemoryMap::build(sections.iter().copied()).unwrap();

            assert!(map.ranges().windows(2).all(|w| w[0].base < w[1].base));
            let contiguous = map.iter().map(|r| r.contiguous).collect::<Vec<_>>();
            assert_eq!(contiguous, vec![false, true, true, false, true, false]);
            assert_eq!(map.fragmentation_count(), 2);
            assert_eq!(map.total_size(), 0x6800);
        }
    }

    #[test]
    fn first_never_contiguous() {
        let map = DdrMemoryMap::build(vec![ddr(0, 0, 0x1000)]).unwrap();
        assert!(!map.ranges()[0].contiguous);
        assert_eq!(map.ranges()[0].end, 0xFFF);
    }

    #[test]
    fn overlap_rejected() {
        let overlapping = [
            vec![ddr(0x1000, 0, 0x1000), ddr(0x1FFF, 0x1000, 0x1000)],
            vec![ddr(0x1000, 0, 0x1000), ddr(0x1000, 0x1000, 0x10)],
            vec![
                ddr(0x1000, 0x0000, 0x1000),
                ddr(0x2000, 0x1000, 0x1000),
                ddr(0x4000, 0x2000, 0x1000),
                ddr(0x4800, 0x3000, 0x1000),
                ddr(0x8000, 0x4000, 0x1000),
            ],
        ];

        let mut rng = XorShiftRng::seed_from_u64(0x0FF5E7);
        for sections in overlapping.iter() {
            let mut sections = sections.clone();
            let mut reversed = sections.clone();
            reversed.reverse();
            assert_eq!(
                DdrMemoryMap::build(reversed).unwrap_err(),
                Error(ErrorOrigin::MemoryMap, ErrorKind::MemoryMapOverlap)
            );

            for _ in 0..16 {
                sections.shuffle(&mut rng);
                assert_eq!(
                    DdrMemoryMap::build(sections.iter().copied()).unwrap_err(),
                    Error(ErrorOrigin::MemoryMap, ErrorKind::MemoryMapOverlap)
                );
            }
        }
    }

    #[test]
    fn invalid_ranges() {
        assert_eq!(
            DdrMemoryMap::build(vec![ddr(0x1000, 0, 0)]).unwrap_err().1,
            ErrorKind::InvalidRange
        );
        assert_eq!(
            DdrMemoryMap::build(vec![ddr(u64::MAX, 0, 2)]).unwrap_err().1,
            ErrorKind::Overflow
        );
        let top = DdrMemoryMap::build(vec![ddr(u64::MAX, 0, 1)]).unwrap();
        assert_eq!(top.ranges()[0].end, u64::MAX);
    }

    #[test]
    fn translate_across_contiguous() {
        let a = 0x100;
        let b = 0x3000;
        let map = DdrMemoryMap::build(vec![ddr(0x2000, b, 0x2000), ddr(0x1000, a, 0x1000)]).unwrap();
        assert_eq!(map.translate(0x1C00), Some(a + 0xC00));
        assert_eq!(map.translate(0x2000), Some(b));
        assert_eq!(map.translate(0x4000), None);
        assert_eq!(map.translate(0xFFF), None);

        let mut reader = dump(0x6000);
        let mut buf = vec![0u8; 0x1800];
        assert_eq!(map.read_physical(&mut reader, 0x1C00, &mut buf), Ok(0x1800));

        let expected = reader.get_ref();
        let a_off = (a + 0xC00) as usize;
        assert_eq!(&buf[..0x400], &expected[a_off..a_off + 0x400]);
        assert_eq!(&buf[0x400..], &expected[b as usize..b as usize + 0x1400]);
    }

    #[test]
    fn non_contiguous_rejected() {
        let map = DdrMemoryMap::build(vec![ddr(0x1000, 0, 0x1000), ddr(0x2100, 0x1000, 0x1000)]).unwrap();
        assert_eq!(map.fragmentation_count(), 1);

        let mut reader = dump(0x2000);
        let mut buf = vec![0u8; 0x800];
        assert_eq!(
            map.read_physical(&mut reader, 0x1C00, &mut buf),
            Err(PartialError::Error(Error(
                ErrorOrigin::PhysicalMemory,
                ErrorKind::NonContiguousRead
            )))
        );

        // reads inside a single range are unaffected
        let mut buf = vec![0u8; 0x400];
        assert_eq!(map.read_physical(&mut reader, 0x1C00, &mut buf), Ok(0x400));
    }

    #[test]
    fn map_exhausted() {
        let map = DdrMemoryMap::build(vec![ddr(0x1000, 0, 0x1000), ddr(0x2000, 0x1000, 0x1000)]).unwrap();
        let mut reader = dump(0x2000);
        let mut buf = vec![0u8; 0x1000];
        assert_eq!(
            map.read_physical(&mut reader, 0x2800, &mut buf),
            Err(PartialError::PartialRead(0x800))
        );
        assert_eq!(
            map.read_physical_exact(&mut reader, 0x2800, &mut buf).unwrap_err().1,
            ErrorKind::PartialData
        );
        assert_eq!(
            map.read_physical(&mut reader, 0x3000, &mut buf),
            Err(PartialError::Error(Error(
                ErrorOrigin::PhysicalMemory,
                ErrorKind::OutOfMemoryRange
            )))
        );
    }

    #[test]
    fn read_pod() {
        let map = DdrMemoryMap::build(vec![ddr(0x8000_0000, 0x20, 0x100)]).unwrap();
        let mut reader = dump(0x200);
        let value: u32 = map.read_physical_pod(&mut reader, 0x8000_0010).unwrap();
        // file offset 0x30
        assert_eq!(value, 0x0303_0303);
    }

    #[test]
    fn debug_output() {
        let map = DdrMemoryMap::build(vec![ddr(0x1000, 0, 0x1000), ddr(0x2000, 0x1000, 0x1000)]).unwrap();
        let text = format!("{:?}", map);
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with("contiguous"));
    }
}
