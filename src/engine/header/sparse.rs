use std::io::Read;

use super::helper::*;
use crate::error::{BackupError, Result};

/// Bytes used by one encoded sparse region (offset + numbytes).
pub const REGION_SIZE: usize = 24;
/// Regions carried inline by the main header.
pub const INLINE_REGIONS: usize = 4;
/// Regions carried by each extended sparse block.
pub const EXTENDED_REGIONS: usize = 21;

/// Flag byte offset inside an extended sparse block.
const EXTENDED_FLAG_OFFSET: usize = EXTENDED_REGIONS * REGION_SIZE;

/// Represents one allocated data region of a sparse file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseRegion {
    /// Offset in the logical file (as bytes from start).
    pub offset: u64,
    /// Number of data bytes stored for the region.
    pub numbytes: u64,
}

impl SparseRegion {
    pub fn new(offset: u64, numbytes: u64) -> Self {
        Self { offset, numbytes }
    }

    /// Encodes the region into a 24 byte slot.
    ///
    /// # Arguments
    /// * `dst` - Slot of exactly `REGION_SIZE` bytes.
    pub fn encode(&self, dst: &mut [u8]) {
        put_numeric(&mut dst[0..12], self.offset);
        put_numeric(&mut dst[12..24], self.numbytes);
    }

    /// Decodes a region from a 24 byte slot.
    ///
    /// # Returns
    /// * `Ok(Some(region))` - The slot holds a region.
    /// * `Ok(None)` - The slot is empty (null filled).
    /// * `Err(e)` - The slot is malformed.
    pub fn decode(src: &[u8]) -> Result<Option<Self>> {
        if src[0] == 0 && src[12] == 0 {
            return Ok(None);
        }
        let offset = parse_numeric(&src[0..12])?;
        let numbytes = parse_numeric(&src[12..24])?;
        Ok(Some(Self { offset, numbytes }))
    }
}

/// GNU sparse metadata carried by the 155 byte prefix field of a sparse header.
///
/// Layout (relative to the prefix start): atime(12), ctime(12), data
/// offset(12), long name length(4), pad(1), 4 regions(96), extended flag(1),
/// real size(12), pad(5).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SparseMap {
    pub atime: u64,
    pub ctime: u64,
    /// Offset of this entry's data for multi-volume archives.
    pub data_offset: u64,
    pub longnames_len: u32,
    /// Logical size of the file including holes.
    pub real_size: u64,
    /// Data regions, in file order.
    pub regions: Vec<SparseRegion>,
}

impl SparseMap {
    pub const PREFIX_SIZE: usize = 155;

    const ATIME: usize = 0;
    const CTIME: usize = 12;
    const DATA_OFFSET: usize = 24;
    const LONGNAMES: usize = 36;
    const REGIONS: usize = 41;
    const IS_EXTENDED: usize = 137;
    const REAL_SIZE: usize = 138;

    pub fn new(real_size: u64, regions: Vec<SparseRegion>) -> Self {
        Self {
            real_size,
            regions,
            ..Default::default()
        }
    }

    /// Number of data bytes stored in the archive for this file.
    pub fn stored_size(&self) -> u64 {
        self.regions.iter().map(|r| r.numbytes).sum()
    }

    /// Tells if the regions overflow the header into extended blocks.
    pub fn is_extended(&self) -> bool {
        self.regions.len() > INLINE_REGIONS
    }

    /// Number of extended 512-byte blocks needed after the header.
    pub fn extended_blocks(&self) -> usize {
        self.regions.len().saturating_sub(INLINE_REGIONS).div_ceil(EXTENDED_REGIONS)
    }

    /// Writes the sparse metadata into the prefix field of a header.
    ///
    /// # Arguments
    /// * `prefix` - The 155 byte prefix field.
    pub fn encode_prefix(&self, prefix: &mut [u8]) {
        prefix.fill(0);
        put_numeric(&mut prefix[Self::ATIME..Self::ATIME + 12], self.atime);
        put_numeric(&mut prefix[Self::CTIME..Self::CTIME + 12], self.ctime);
        put_numeric(&mut prefix[Self::DATA_OFFSET..Self::DATA_OFFSET + 12], self.data_offset);
        put_numeric(&mut prefix[Self::LONGNAMES..Self::LONGNAMES + 4], u64::from(self.longnames_len));
        for (i, region) in self.regions.iter().take(INLINE_REGIONS).enumerate() {
            let off = Self::REGIONS + i * REGION_SIZE;
            region.encode(&mut prefix[off..off + REGION_SIZE]);
        }
        prefix[Self::IS_EXTENDED] = u8::from(self.is_extended());
        put_numeric(&mut prefix[Self::REAL_SIZE..Self::REAL_SIZE + 12], self.real_size);
    }

    /// Builds the extended blocks holding the regions past the first 4.
    pub fn encode_extended(&self) -> Vec<[u8; 512]> {
        let rest = self.regions.get(INLINE_REGIONS..).unwrap_or(&[]);
        let chunks: Vec<&[SparseRegion]> = rest.chunks(EXTENDED_REGIONS).collect();
        let last = chunks.len().saturating_sub(1);
        chunks
            .iter()
            .enumerate()
            .map(|(n, chunk)| {
                let mut block = [0u8; 512];
                for (i, region) in chunk.iter().enumerate() {
                    let off = i * REGION_SIZE;
                    region.encode(&mut block[off..off + REGION_SIZE]);
                }
                block[EXTENDED_FLAG_OFFSET] = u8::from(n < last);
                block
            })
            .collect()
    }

    /// Decodes the sparse metadata from a header prefix field, pulling
    /// extended blocks from `next_block` while the continuation flag is set.
    ///
    /// # Arguments
    /// * `prefix` - The 155 byte prefix field.
    /// * `next_block` - Callback returning the next 512-byte block of the archive.
    pub fn decode(prefix: &[u8], next_block: &mut impl FnMut() -> Result<[u8; 512]>) -> Result<Self> {
        if prefix.len() != Self::PREFIX_SIZE {
            return Err(BackupError::corrupt(format!("sparse prefix must be {} bytes", Self::PREFIX_SIZE)));
        }
        let mut map = Self {
            atime: parse_numeric(&prefix[Self::ATIME..Self::ATIME + 12])?,
            ctime: parse_numeric(&prefix[Self::CTIME..Self::CTIME + 12])?,
            data_offset: parse_numeric(&prefix[Self::DATA_OFFSET..Self::DATA_OFFSET + 12])?,
            longnames_len: parse_numeric_u32(&prefix[Self::LONGNAMES..Self::LONGNAMES + 4])?,
            real_size: parse_numeric(&prefix[Self::REAL_SIZE..Self::REAL_SIZE + 12])?,
            regions: Vec::new(),
        };
        for i in 0..INLINE_REGIONS {
            let off = Self::REGIONS + i * REGION_SIZE;
            match SparseRegion::decode(&prefix[off..off + REGION_SIZE])? {
                Some(region) => map.regions.push(region),
                None => break,
            }
        }

        let mut next = is_flag_set(prefix[Self::IS_EXTENDED])?;
        if next && map.regions.len() < INLINE_REGIONS {
            return Err(BackupError::corrupt("extended sparse flag set with free inline slots"));
        }
        while next {
            let block = next_block()?;
            for i in 0..EXTENDED_REGIONS {
                let off = i * REGION_SIZE;
                match SparseRegion::decode(&block[off..off + REGION_SIZE])? {
                    Some(region) => map.regions.push(region),
                    None => break,
                }
            }
            next = is_flag_set(block[EXTENDED_FLAG_OFFSET])?;
        }
        Ok(map)
    }

    /// Scans `reader` in 512-byte blocks and records the non-zero blocks as
    /// data regions. A trailing hole is closed by a zero length region at
    /// `real_size`.
    ///
    /// # Arguments
    /// * `reader` - File content positioned at the start.
    /// * `real_size` - Logical size of the file.
    pub fn scan(reader: &mut impl Read, real_size: u64) -> std::io::Result<Self> {
        let mut regions: Vec<SparseRegion> = Vec::new();
        let mut block = [0u8; 512];
        let mut pos = 0u64;
        while pos < real_size {
            let want = (real_size - pos).min(512) as usize;
            let read = read_full(reader, &mut block[..want])?;
            if read == 0 {
                break;
            }
            if block[..read].iter().any(|&b| b != 0) {
                match regions.last_mut() {
                    Some(last) if last.offset + last.numbytes == pos => last.numbytes += read as u64,
                    _ => regions.push(SparseRegion::new(pos, read as u64)),
                }
            }
            pos += read as u64;
        }
        let covered = regions.last().map(|r| r.offset + r.numbytes).unwrap_or(0);
        if covered < real_size {
            regions.push(SparseRegion::new(real_size, 0));
        }
        Ok(Self::new(real_size, regions))
    }
}

fn is_flag_set(flag: u8) -> Result<bool> {
    match flag {
        1 | b'1' => Ok(true),
        0 | b'0' | b' ' => Ok(false),
        v => Err(BackupError::corrupt(format!("invalid extended sparse flag {:#04x}", v))),
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn regions(count: u64) -> Vec<SparseRegion> {
        (0..count).map(|i| SparseRegion::new(i * 4096, 512 + i)).collect()
    }

    fn round_trip(map: &SparseMap) -> SparseMap {
        let mut prefix = [0u8; SparseMap::PREFIX_SIZE];
        map.encode_prefix(&mut prefix);
        let mut blocks = map.encode_extended().into_iter();
        let mut next = || blocks.next().ok_or_else(|| BackupError::corrupt("out of blocks"));
        match SparseMap::decode(&prefix, &mut next) {
            Ok(v) => v,
            Err(e) => panic!("failed to decode sparse map: {}", e),
        }
    }

    #[test]
    fn region_slot_layout() {
        let mut slot = [0u8; REGION_SIZE];
        SparseRegion::new(0o100, 0o7).encode(&mut slot);
        assert_eq!(&slot[..12], b"00000000100\0");
        assert_eq!(&slot[12..], b"00000000007\0");
        assert_eq!(SparseRegion::decode(&slot).unwrap(), Some(SparseRegion::new(0o100, 0o7)));
    }

    #[test]
    fn empty_region_slot() {
        assert_eq!(SparseRegion::decode(&[0u8; REGION_SIZE]).unwrap(), None);
    }

    #[test]
    fn zero_offset_region_is_not_empty() {
        let mut slot = [0u8; REGION_SIZE];
        SparseRegion::new(0, 0).encode(&mut slot);
        assert_eq!(SparseRegion::decode(&slot).unwrap(), Some(SparseRegion::new(0, 0)));
    }

    #[test]
    fn prefix_field_offsets() {
        let mut map = SparseMap::new(0o777, regions(5));
        map.atime = 1;
        map.ctime = 2;
        map.data_offset = 3;
        map.longnames_len = 4;
        let mut prefix = [0u8; SparseMap::PREFIX_SIZE];
        map.encode_prefix(&mut prefix);
        assert_eq!(&prefix[0..12], b"00000000001\0");
        assert_eq!(&prefix[12..24], b"00000000002\0");
        assert_eq!(&prefix[24..36], b"00000000003\0");
        assert_eq!(&prefix[36..40], b"004\0");
        assert_eq!(prefix[40], 0);
        assert_eq!(prefix[137], 1);
        assert_eq!(&prefix[138..150], b"00000000777\0");
        assert_eq!(&prefix[150..155], &[0u8; 5]);
    }

    #[test]
    fn round_trip_region_boundaries() {
        for count in [0u64, 1, 4, 5, 25, 26, 46, 47] {
            let map = SparseMap::new(1 << 40, regions(count));
            let loaded = round_trip(&map);
            assert_eq!(loaded, map, "region count {}", count);
        }
    }

    #[test]
    fn extended_block_counts() {
        assert_eq!(SparseMap::new(0, regions(0)).extended_blocks(), 0);
        assert_eq!(SparseMap::new(0, regions(4)).extended_blocks(), 0);
        assert_eq!(SparseMap::new(0, regions(5)).extended_blocks(), 1);
        assert_eq!(SparseMap::new(0, regions(25)).extended_blocks(), 1);
        assert_eq!(SparseMap::new(0, regions(26)).extended_blocks(), 2);
        let blocks = SparseMap::new(0, regions(26)).encode_extended();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0][EXTENDED_FLAG_OFFSET], 1);
        assert_eq!(blocks[1][EXTENDED_FLAG_OFFSET], 0);
    }

    #[test]
    fn truncated_extension_fails() {
        let map = SparseMap::new(10, regions(9));
        let mut prefix = [0u8; SparseMap::PREFIX_SIZE];
        map.encode_prefix(&mut prefix);
        let mut next = || -> Result<[u8; 512]> { Err(BackupError::corrupt("eof")) };
        assert!(SparseMap::decode(&prefix, &mut next).is_err());
    }

    #[test]
    fn malformed_flag_fails() {
        let map = SparseMap::new(10, regions(4));
        let mut prefix = [0u8; SparseMap::PREFIX_SIZE];
        map.encode_prefix(&mut prefix);
        prefix[137] = b'x';
        let mut next = || -> Result<[u8; 512]> { Err(BackupError::corrupt("eof")) };
        match SparseMap::decode(&prefix, &mut next) {
            Err(BackupError::Corrupt { .. }) => {},
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn scan_detects_holes() {
        let mut data = vec![0u8; 4096];
        data[0] = 1;
        data[2048..2560].fill(7);
        let map = SparseMap::scan(&mut Cursor::new(&data), data.len() as u64).unwrap();
        assert_eq!(map.regions, vec![
            SparseRegion::new(0, 512),
            SparseRegion::new(2048, 512),
            SparseRegion::new(4096, 0),
        ]);
        assert_eq!(map.stored_size(), 1024);
        assert_eq!(map.real_size, 4096);
    }

    #[test]
    fn scan_merges_adjacent_blocks_and_partial_tail() {
        let mut data = vec![9u8; 1500];
        data[512..1024].fill(0);
        let map = SparseMap::scan(&mut Cursor::new(&data), 1500).unwrap();
        assert_eq!(map.regions, vec![SparseRegion::new(0, 512), SparseRegion::new(1024, 476)]);

        let data = vec![3u8; 1100];
        let map = SparseMap::scan(&mut Cursor::new(&data), 1100).unwrap();
        assert_eq!(map.regions, vec![SparseRegion::new(0, 1100)]);
    }

    #[test]
    fn scan_all_zero_file() {
        let data = vec![0u8; 2000];
        let map = SparseMap::scan(&mut Cursor::new(&data), 2000).unwrap();
        assert_eq!(map.regions, vec![SparseRegion::new(2000, 0)]);
        assert_eq!(map.stored_size(), 0);
    }
}
