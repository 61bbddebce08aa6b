pub mod helper;
pub mod sparse;
mod traits;

pub use sparse::{SparseMap, SparseRegion};
pub use traits::{IsTypeTrait, UsedBlocksTrait};

use std::io::{Read, Write};
use std::ops::Range;

use crate::error::{BackupError, Result};
use helper::*;

/// Archive block size.
pub const BLOCK_SIZE: usize = 512;

/// GNU magic and version.
pub const GNU_MAGIC: &str = "ustar ";
pub const GNU_VERSION: &str = " \0";

/// Byte range of the checksum field.
pub const CHKSUM_RANGE: Range<usize> = 148..156;

const NAME_SIZE: usize = 100;
const PREFIX_SIZE: usize = 155;
const LONG_LINK_NAME: &str = "././@LongLink";

/// Header type flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFlag {
    RegularFile,
    /// Pre-POSIX regular file ('\0').
    AlternateRegularFile,
    HardLink,
    SymbolicLink,
    CharacterSpecial,
    BlockSpecial,
    Directory,
    Fifo,
    ContiguousFile,
    GnuLongName,
    GnuLongLink,
    GnuSparse,
    Unknown(u8),
}

impl From<u8> for TypeFlag {
    fn from(value: u8) -> Self {
        match value {
            b'0' => Self::RegularFile,
            b'\0' => Self::AlternateRegularFile,
            b'1' => Self::HardLink,
            b'2' => Self::SymbolicLink,
            b'3' => Self::CharacterSpecial,
            b'4' => Self::BlockSpecial,
            b'5' => Self::Directory,
            b'6' => Self::Fifo,
            b'7' => Self::ContiguousFile,
            b'L' => Self::GnuLongName,
            b'K' => Self::GnuLongLink,
            b'S' => Self::GnuSparse,
            v => Self::Unknown(v),
        }
    }
}

impl From<TypeFlag> for u8 {
    fn from(value: TypeFlag) -> Self {
        match value {
            TypeFlag::RegularFile => b'0',
            TypeFlag::AlternateRegularFile => b'\0',
            TypeFlag::HardLink => b'1',
            TypeFlag::SymbolicLink => b'2',
            TypeFlag::CharacterSpecial => b'3',
            TypeFlag::BlockSpecial => b'4',
            TypeFlag::Directory => b'5',
            TypeFlag::Fifo => b'6',
            TypeFlag::ContiguousFile => b'7',
            TypeFlag::GnuLongName => b'L',
            TypeFlag::GnuLongLink => b'K',
            TypeFlag::GnuSparse => b'S',
            TypeFlag::Unknown(v) => v,
        }
    }
}

impl IsTypeTrait for TypeFlag {
    fn is_regular_file(&self) -> bool {
        matches!(self, Self::RegularFile | Self::AlternateRegularFile | Self::ContiguousFile | Self::GnuSparse)
    }

    fn is_hard_link(&self) -> bool {
        matches!(self, Self::HardLink)
    }

    fn is_symbolic_link(&self) -> bool {
        matches!(self, Self::SymbolicLink)
    }

    fn is_character_special(&self) -> bool {
        matches!(self, Self::CharacterSpecial)
    }

    fn is_block_special(&self) -> bool {
        matches!(self, Self::BlockSpecial)
    }

    fn is_directory(&self) -> bool {
        matches!(self, Self::Directory)
    }

    fn is_fifo(&self) -> bool {
        matches!(self, Self::Fifo)
    }

    fn is_sparse(&self) -> bool {
        matches!(self, Self::GnuSparse)
    }
}

/// Computes the header checksum: 256 (eight blanks standing in for the
/// checksum field) plus every other byte of the block.
pub fn checksum(block: &[u8; BLOCK_SIZE]) -> u32 {
    let mut sum: u32 = 8 * u32::from(b' ');
    for (i, b) in block.iter().enumerate() {
        if !CHKSUM_RANGE.contains(&i) {
            sum += u32::from(*b);
        }
    }
    sum
}

/// Tells if the block is an all-zero end-of-archive block.
pub fn is_zero_block(block: &[u8; BLOCK_SIZE]) -> bool {
    block.iter().all(|&b| b == 0)
}

/// Number of bytes `size` content bytes take once padded to whole blocks.
pub fn padded_size(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64
}

fn verify_checksum(block: &[u8; BLOCK_SIZE]) -> Result<()> {
    let stored = parse_octal::<u32>(&block[CHKSUM_RANGE])?;
    let computed = checksum(block);
    if stored != computed {
        return Err(BackupError::corrupt(format!(
            "header checksum mismatch: stored {:o}, computed {:o}",
            stored, computed
        )));
    }
    Ok(())
}

fn seal(block: &mut [u8; BLOCK_SIZE]) {
    block[CHKSUM_RANGE].fill(b' ');
    let chksum = checksum(block);
    let field = format!("{:06o}\0 ", chksum);
    block[CHKSUM_RANGE].copy_from_slice(&field.as_bytes()[..CHKSUM_RANGE.len()]);
}

/// Represents one archive entry header in GNU format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarHeader {
    /// File name, the ustar prefix holds the leading directories when split.
    name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Bytes of content stored after the header.
    pub size: u64,
    pub mtime: u64,
    typeflag: TypeFlag,
    linkname: String,
    pub magic: String,
    pub version: String,
    pub uname: String,
    pub gname: String,
    pub devmajor: u32,
    pub devminor: u32,
    prefix: String,
    /// Sparse metadata, stored in the prefix field when typeflag is sparse.
    sparse: Option<SparseMap>,
}

impl TarHeader {
    /// Creates a new GNU header.
    pub fn new(typeflag: TypeFlag) -> Self {
        let mut header = Self {
            name: String::new(),
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
            typeflag: TypeFlag::RegularFile,
            linkname: String::new(),
            magic: GNU_MAGIC.to_string(),
            version: GNU_VERSION.to_string(),
            uname: String::new(),
            gname: String::new(),
            devmajor: 0,
            devminor: 0,
            prefix: String::new(),
            sparse: None,
        };
        header.set_typeflag(typeflag);
        header
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_prefix(&self) -> &str {
        &self.prefix
    }

    pub fn get_linkname(&self) -> &str {
        &self.linkname
    }

    pub fn set_linkname(&mut self, linkname: String) {
        self.linkname = linkname;
    }

    pub fn typeflag(&self) -> TypeFlag {
        self.typeflag
    }

    /// Sets the type flag, a sparse flag gets an empty sparse map.
    pub fn set_typeflag(&mut self, typeflag: TypeFlag) {
        self.typeflag = typeflag;
        if typeflag.is_sparse() {
            if self.sparse.is_none() {
                self.set_sparse(SparseMap::default());
            }
        } else {
            self.sparse = None;
        }
    }

    pub fn sparse(&self) -> Option<&SparseMap> {
        self.sparse.as_ref()
    }

    /// Turns the header into a GNU sparse header. The prefix field is taken
    /// by the sparse metadata so any split path is merged back into the name.
    ///
    /// # Arguments
    /// * `map` - Sparse metadata, `size` becomes the stored data size.
    pub fn set_sparse(&mut self, map: SparseMap) {
        if !self.prefix.is_empty() {
            self.name = self.path();
            self.prefix.clear();
        }
        self.typeflag = TypeFlag::GnuSparse;
        self.size = map.stored_size();
        self.sparse = Some(map);
    }

    /// Returns the full entry path.
    pub fn path(&self) -> String {
        if self.prefix.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.prefix, self.name)
        }
    }

    /// Sets the entry path, splitting it into ustar prefix and name when it
    /// does not fit the name field. Paths that cannot be split are kept whole
    /// and saved through a GNU long name record.
    pub fn set_path(&mut self, path: &str) {
        self.prefix.clear();
        self.name = path.to_string();
        if path.len() <= NAME_SIZE || self.sparse.is_some() || path.len() > PREFIX_SIZE + 1 + NAME_SIZE {
            return;
        }
        let bytes = path.as_bytes();
        let split = bytes
            .iter()
            .enumerate()
            .filter(|(i, b)| **b == b'/' && *i > 0 && *i <= PREFIX_SIZE && bytes.len() - i - 1 <= NAME_SIZE && bytes.len() - i - 1 > 0)
            .map(|(i, _)| i)
            .next();
        if let Some(i) = split {
            self.prefix = path[..i].to_string();
            self.name = path[i + 1..].to_string();
        }
    }

    /// Sets the entry path without the ustar prefix split. GNU readers ignore
    /// the prefix field, so long paths go through a long name record instead.
    pub fn set_gnu_path(&mut self, path: &str) {
        self.prefix.clear();
        self.name = path.to_string();
    }

    fn needs_long_name(&self) -> bool {
        self.name.len() > NAME_SIZE
    }

    fn needs_long_link(&self) -> bool {
        self.linkname.len() > NAME_SIZE
    }

    /// Encodes the main 512-byte header block.
    pub fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut buf = [0u8; BLOCK_SIZE];
        put_str(&mut buf[0..100], &self.name);
        put_numeric(&mut buf[100..108], u64::from(self.mode));
        put_numeric(&mut buf[108..116], u64::from(self.uid));
        put_numeric(&mut buf[116..124], u64::from(self.gid));
        put_numeric(&mut buf[124..136], self.size);
        put_numeric(&mut buf[136..148], self.mtime);
        buf[156] = self.typeflag.into();
        put_str(&mut buf[157..257], &self.linkname);
        put_str(&mut buf[257..263], &self.magic);
        put_str(&mut buf[263..265], &self.version);
        put_str(&mut buf[265..297], &self.uname);
        put_str(&mut buf[297..329], &self.gname);
        put_numeric(&mut buf[329..337], u64::from(self.devmajor));
        put_numeric(&mut buf[337..345], u64::from(self.devminor));
        match &self.sparse {
            Some(map) => map.encode_prefix(&mut buf[345..500]),
            None => put_str(&mut buf[345..500], &self.prefix),
        }
        seal(&mut buf);
        buf
    }

    /// Encodes every block of the entry header: GNU long name/link records,
    /// the main header and the extended sparse blocks.
    pub fn encode_all(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.calc_used_blocks() * BLOCK_SIZE);
        if self.needs_long_link() {
            encode_long_record(&mut out, TypeFlag::GnuLongLink, &self.linkname);
        }
        if self.needs_long_name() {
            encode_long_record(&mut out, TypeFlag::GnuLongName, &self.name);
        }
        out.extend_from_slice(&self.encode());
        if let Some(map) = &self.sparse {
            for block in map.encode_extended() {
                out.extend_from_slice(&block);
            }
        }
        out
    }

    /// Saves the header blocks into the writer.
    ///
    /// # Returns
    /// * `Ok(bytes)` - The number of bytes written.
    /// * `Err(e)` - If write fails.
    pub fn save(&self, writer: &mut impl Write) -> std::io::Result<u64> {
        let bytes = self.encode_all();
        writer.write_all(&bytes)?;
        Ok(bytes.len() as u64)
    }

    /// Decodes a header from its first block. GNU long name/link records and
    /// extended sparse blocks are pulled from `next_block`.
    ///
    /// # Arguments
    /// * `buf` - First 512-byte block of the entry.
    /// * `next_block` - Callback returning the following archive block.
    ///
    /// # Returns
    /// * `Ok(Self)` - The decoded header.
    /// * `Err(e)` - Corrupt block (checksum mismatch, malformed field) or read error.
    pub fn decode(buf: &[u8; BLOCK_SIZE], next_block: &mut impl FnMut() -> Result<[u8; BLOCK_SIZE]>) -> Result<Self> {
        let mut long_name = None;
        let mut long_link = None;
        let mut block = *buf;
        loop {
            verify_checksum(&block)?;
            match TypeFlag::from(block[156]) {
                TypeFlag::GnuLongName => long_name = Some(read_long_record(&block, next_block)?),
                TypeFlag::GnuLongLink => long_link = Some(read_long_record(&block, next_block)?),
                _ => break,
            }
            block = next_block()?;
        }

        let typeflag = TypeFlag::from(block[156]);
        let mut header = Self {
            name: match long_name {
                Some(name) => name,
                None => get_str(&block[0..100])?,
            },
            mode: parse_numeric_u32(&block[100..108])?,
            uid: parse_numeric_u32(&block[108..116])?,
            gid: parse_numeric_u32(&block[116..124])?,
            size: parse_numeric(&block[124..136])?,
            mtime: parse_numeric(&block[136..148])?,
            typeflag,
            linkname: match long_link {
                Some(link) => link,
                None => get_str(&block[157..257])?,
            },
            magic: get_str_with_min_size(&block[257..263], 6)?,
            version: get_str_with_min_size(&block[263..265], 2)?,
            uname: get_str(&block[265..297])?,
            gname: get_str(&block[297..329])?,
            devmajor: parse_numeric_u32(&block[329..337])?,
            devminor: parse_numeric_u32(&block[337..345])?,
            prefix: String::new(),
            sparse: None,
        };
        if typeflag.is_sparse() {
            header.sparse = Some(SparseMap::decode(&block[345..500], next_block)?);
        } else {
            header.prefix = get_str(&block[345..500])?;
        }
        Ok(header)
    }

    /// Loads the next header from the reader.
    ///
    /// # Returns
    /// * `Ok(Some(header))` - The loaded header.
    /// * `Ok(None)` - An end-of-archive zero block was found.
    /// * `Err(e)` - If the header is corrupt or could not be read.
    pub fn load(reader: &mut impl Read) -> Result<Option<Self>> {
        let mut buf = [0u8; BLOCK_SIZE];
        reader
            .read_exact(&mut buf)
            .map_err(|e| BackupError::corrupt(format!("truncated header block: {}", e)))?;
        if is_zero_block(&buf) {
            return Ok(None);
        }
        let mut next = || -> Result<[u8; BLOCK_SIZE]> {
            let mut block = [0u8; BLOCK_SIZE];
            reader
                .read_exact(&mut block)
                .map_err(|e| BackupError::corrupt(format!("truncated header continuation: {}", e)))?;
            Ok(block)
        };
        Self::decode(&buf, &mut next).map(Some)
    }
}

impl UsedBlocksTrait for TarHeader {
    fn calc_used_blocks(&self) -> usize {
        let mut used_blocks = 1;
        if self.needs_long_name() {
            used_blocks += 1 + (self.name.len() + 1).div_ceil(BLOCK_SIZE);
        }
        if self.needs_long_link() {
            used_blocks += 1 + (self.linkname.len() + 1).div_ceil(BLOCK_SIZE);
        }
        if let Some(map) = &self.sparse {
            used_blocks += map.extended_blocks();
        }
        used_blocks
    }
}

impl IsTypeTrait for TarHeader {
    fn is_regular_file(&self) -> bool {
        self.typeflag.is_regular_file()
    }

    fn is_hard_link(&self) -> bool {
        self.typeflag.is_hard_link()
    }

    fn is_symbolic_link(&self) -> bool {
        self.typeflag.is_symbolic_link()
    }

    fn is_character_special(&self) -> bool {
        self.typeflag.is_character_special()
    }

    fn is_block_special(&self) -> bool {
        self.typeflag.is_block_special()
    }

    fn is_directory(&self) -> bool {
        self.typeflag.is_directory()
    }

    fn is_fifo(&self) -> bool {
        self.typeflag.is_fifo()
    }

    fn is_sparse(&self) -> bool {
        self.typeflag.is_sparse()
    }
}

// GNU long records store the value (plus a terminating null) as the content of a pseudo entry
fn encode_long_record(out: &mut Vec<u8>, typeflag: TypeFlag, value: &str) {
    let mut header = TarHeader::new(typeflag);
    header.name = LONG_LINK_NAME.to_string();
    header.size = value.len() as u64 + 1;
    out.extend_from_slice(&header.encode());
    let start = out.len();
    out.extend_from_slice(value.as_bytes());
    out.resize(start + padded_size(header.size) as usize, 0);
}

fn read_long_record(block: &[u8; BLOCK_SIZE], next_block: &mut impl FnMut() -> Result<[u8; BLOCK_SIZE]>) -> Result<String> {
    let size = parse_numeric(&block[124..136])?;
    let mut data = Vec::with_capacity(size as usize);
    let mut remaining = size;
    while remaining > 0 {
        let chunk = next_block()?;
        let n = remaining.min(BLOCK_SIZE as u64);
        data.extend_from_slice(&chunk[..n as usize]);
        remaining -= n;
    }
    while data.last() == Some(&0) {
        data.pop();
    }
    String::from_utf8(data).map_err(|e| BackupError::corrupt(format!("invalid utf-8 in long name: {}", e)))
}
