use std::fs::File;
use std::io::{Read, Result as IoResult, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::engine::DEFAULT_BUFFER_SIZE;
use crate::error::{BackupError, Result};

/// Signature at the start of every tree file.
pub const GUARD: &[u8] = b"#!/bin/false rbackup-tree-v1\n";
/// Offset of the one byte "build complete" flag.
pub const FLAG_OFFSET: u64 = GUARD.len() as u64;
/// Offset of the 20 digit total entry count.
pub const TOTAL_OFFSET: u64 = FLAG_OFFSET + 2;
const TOTAL_WIDTH: usize = 20;
/// Size of the fixed header, entry lines start right after it.
pub const HEADER_LEN: u64 = TOTAL_OFFSET + TOTAL_WIDTH as u64 + 1;

pub const FLAG_BUILDING: u8 = b'0';
pub const FLAG_COMPLETE: u8 = b'1';

const KIND_FILE: u8 = b'f';
const KIND_DIR: u8 = b'd';
const MARKER: &[u8] = b"\t@";

/// Backward read chunk size.
const CHUNK_SIZE: usize = DEFAULT_BUFFER_SIZE;

/// Decoded tree file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHeader {
    pub complete: bool,
    pub total: u64,
}

impl TreeHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN as usize);
        out.extend_from_slice(GUARD);
        out.push(if self.complete { FLAG_COMPLETE } else { FLAG_BUILDING });
        out.push(b' ');
        out.extend_from_slice(&encode_total(self.total));
        out.push(b'\n');
        out
    }

    pub fn decode(buf: &[u8], path: &Path) -> Result<Self> {
        if buf.len() < HEADER_LEN as usize || &buf[..GUARD.len()] != GUARD {
            return Err(BackupError::checkpoint(path, "not a tree file"));
        }
        let complete = match buf[FLAG_OFFSET as usize] {
            FLAG_COMPLETE => true,
            FLAG_BUILDING => false,
            v => return Err(BackupError::checkpoint(path, format!("invalid build flag {:#04x}", v))),
        };
        let total = std::str::from_utf8(&buf[TOTAL_OFFSET as usize..TOTAL_OFFSET as usize + TOTAL_WIDTH])
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| BackupError::checkpoint(path, "invalid entry total"))?;
        Ok(Self { complete, total })
    }
}

/// The zero padded total field, written at [`TOTAL_OFFSET`].
pub fn encode_total(total: u64) -> Vec<u8> {
    format!("{:0width$}", total, width = TOTAL_WIDTH).into_bytes()
}

/// One recorded filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeLine {
    /// Path relative to the scanned root.
    pub relative: PathBuf,
    pub is_dir: bool,
    /// Archive byte offset where the entry started being written.
    pub archive_position: Option<u64>,
}

impl TreeLine {
    /// Encodes the line, without the trailing line break.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(if self.is_dir { KIND_DIR } else { KIND_FILE });
        escape_into(&path_to_bytes(&self.relative), &mut out);
        if let Some(pos) = self.archive_position {
            out.extend_from_slice(&marker(pos));
        }
        out
    }

    pub fn decode(line: &[u8]) -> Result<Self> {
        let (kind, rest) = line
            .split_first()
            .ok_or_else(|| BackupError::corrupt("empty tree line"))?;
        let is_dir = match *kind {
            KIND_DIR => true,
            KIND_FILE => false,
            v => return Err(BackupError::corrupt(format!("invalid tree line kind {:#04x}", v))),
        };
        let (escaped, archive_position) = match rest.iter().position(|&b| b == b'\t') {
            Some(i) => {
                let pos = rest[i..]
                    .strip_prefix(MARKER)
                    .and_then(|digits| std::str::from_utf8(digits).ok())
                    .and_then(|digits| digits.parse::<u64>().ok())
                    .ok_or_else(|| BackupError::corrupt("invalid archive marker in tree line"))?;
                (&rest[..i], Some(pos))
            },
            None => (rest, None),
        };
        Ok(Self {
            relative: bytes_to_path(unescape(escaped)?),
            is_dir,
            archive_position,
        })
    }
}

/// Encodes the "already placed at archive byte N" marker.
pub fn marker(pos: u64) -> Vec<u8> {
    let mut buf = itoa::Buffer::new();
    let mut out = MARKER.to_vec();
    out.extend_from_slice(buf.format(pos).as_bytes());
    out
}

/// Drops a torn marker (a tab with no line break after it) from an
/// unterminated tail line.
pub fn strip_torn_marker(line: &[u8]) -> &[u8] {
    match line.iter().position(|&b| b == b'\t') {
        Some(i) => &line[..i],
        None => line,
    }
}

// Control bytes and the escape byte itself become \xHH so an entry is always one line
fn escape_into(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        if b < 0x20 || b == 0x7f || b == b'\\' {
            out.extend_from_slice(format!("\\x{:02x}", b).as_bytes());
        } else {
            out.push(b);
        }
    }
}

fn unescape(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = bytes
                .get(i + 1..i + 4)
                .filter(|h| h[0] == b'x')
                .and_then(|h| std::str::from_utf8(&h[1..]).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| BackupError::corrupt("invalid escape in tree line"))?;
            out.push(hex);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

#[cfg(unix)]
fn path_to_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(unix)]
fn bytes_to_path(bytes: Vec<u8>) -> PathBuf {
    use std::os::unix::ffi::OsStringExt;
    PathBuf::from(std::ffi::OsString::from_vec(bytes))
}

#[cfg(not(unix))]
fn path_to_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().replace('\\', "/").into_bytes()
}

#[cfg(not(unix))]
fn bytes_to_path(bytes: Vec<u8>) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())
}

/// Last line of the tree file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailLine {
    /// Offset of the first byte of the line.
    pub start: u64,
    /// Line content without the line break.
    pub bytes: Vec<u8>,
    /// False when the line has no trailing line break (torn write).
    pub terminated: bool,
}

/// Reads the last line of `file` backwards in chunks, never crossing `floor`.
///
/// # Returns
/// * `Ok(Some(line))` - The last line.
/// * `Ok(None)` - The file holds nothing past `floor`.
pub fn read_last_line(file: &mut File, floor: u64) -> IoResult<Option<TailLine>> {
    let len = file.seek(SeekFrom::End(0))?;
    if len <= floor {
        return Ok(None);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    let terminated = last[0] == b'\n';
    let mut pos = if terminated { len - 1 } else { len };

    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let start = loop {
        if pos <= floor {
            break floor;
        }
        let size = ((pos - floor) as usize).min(CHUNK_SIZE);
        let chunk_start = pos - size as u64;
        file.seek(SeekFrom::Start(chunk_start))?;
        file.read_exact(&mut buf[..size])?;
        if let Some(i) = buf[..size].iter().rposition(|&b| b == b'\n') {
            chunks.push(buf[i + 1..size].to_vec());
            break chunk_start + i as u64 + 1;
        }
        chunks.push(buf[..size].to_vec());
        pos = chunk_start;
    };
    let bytes = chunks.into_iter().rev().flatten().collect();
    Ok(Some(TailLine { start, bytes, terminated }))
}

/// Truncates a torn trailing line left by an interrupted append.
///
/// # Returns
/// * `Ok(len)` - The new file length.
pub fn drop_unterminated_tail(file: &mut File, floor: u64) -> IoResult<u64> {
    let len = file.seek(SeekFrom::End(0))?;
    match read_last_line(file, floor)? {
        Some(tail) if !tail.terminated => {
            file.set_len(tail.start)?;
            Ok(tail.start)
        },
        _ => Ok(len),
    }
}

/// Counts the entry lines past the header.
pub fn count_lines(file: &mut File, floor: u64) -> IoResult<u64> {
    file.seek(SeekFrom::Start(floor))?;
    let mut count = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        count += buf[..read].iter().filter(|&&b| b == b'\n').count() as u64;
    }
    Ok(count)
}

/// Writes a complete line at the end of the file.
pub fn append_line(writer: &mut impl Write, line: &TreeLine) -> IoResult<()> {
    let mut bytes = line.encode();
    bytes.push(b'\n');
    writer.write_all(&bytes)
}
