use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::engine::header::{padded_size, SparseMap, TarHeader, TypeFlag, BLOCK_SIZE};
use crate::engine::scanner::ScanItem;
use crate::error::{BackupError, IoContext, Result};

const ZERO_BLOCK: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

/// Appends GNU tar entries to a single archive file and tracks the byte
/// offset of the stream.
pub struct ArchiveWriter {
    path: PathBuf,
    file: File,
    position: u64,
    sparse_threshold: u64,
}

impl ArchiveWriter {
    /// Opens or creates the archive, positioned at its end.
    ///
    /// # Arguments
    /// * `path` - Archive file.
    /// * `sparse_threshold` - Regular files at least this large are scanned
    ///   for holes, 0 disables sparse detection.
    pub fn open(path: impl Into<PathBuf>, sparse_threshold: u64) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .at(&path)?;
        let position = file.seek(SeekFrom::End(0)).at(&path)?;
        debug!(path = %path.display(), position, "opened archive");
        Ok(Self { path, file, position, sparse_threshold })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset where the next entry starts.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Cuts the archive back to `pos`, dropping a half written entry.
    pub fn truncate_to(&mut self, pos: u64) -> Result<()> {
        let len = self.file.metadata().at(&self.path)?.len();
        if pos > len {
            return Err(BackupError::checkpoint(
                &self.path,
                format!("archive is {} bytes, cannot rewind to {}", len, pos),
            ));
        }
        self.file.set_len(pos).at(&self.path)?;
        self.file.seek(SeekFrom::Start(pos)).at(&self.path)?;
        self.file.sync_data().at(&self.path)?;
        if pos != self.position {
            debug!(from = self.position, to = pos, "rewound archive");
        }
        self.position = pos;
        Ok(())
    }

    /// Writes the header and content of one scanned entry.
    ///
    /// # Returns
    /// * `Ok(bytes)` - Bytes appended, 0 for entry types that are not archived.
    /// * `Err(BackupError::Vanished)` - The entry is gone, nothing was written.
    /// * `Err(BackupError::Unreadable)` - The entry cannot be read, nothing was written.
    pub fn append_entry(&mut self, item: &ScanItem) -> Result<u64> {
        let meta = fs::symlink_metadata(&item.path).map_err(|e| source_error(&item.path, e))?;
        let file_type = meta.file_type();

        let mut header = TarHeader::new(TypeFlag::RegularFile);
        header.set_gnu_path(&archive_name(&item.relative, file_type.is_dir()));
        fill_metadata(&mut header, &meta);

        if file_type.is_file() {
            return self.append_file(item, header, &meta);
        }
        if file_type.is_dir() {
            header.set_typeflag(TypeFlag::Directory);
        } else if file_type.is_symlink() {
            let target = fs::read_link(&item.path).map_err(|e| source_error(&item.path, e))?;
            header.set_typeflag(TypeFlag::SymbolicLink);
            header.set_linkname(target.to_string_lossy().into_owned());
        } else if !fill_special(&mut header, &meta) {
            warn!(path = %item.path.display(), "skipping unsupported file type");
            return Ok(0);
        }
        header.size = 0;

        let written = header.save(&mut self.file).at(&self.path)?;
        self.position += written;
        Ok(written)
    }

    fn append_file(&mut self, item: &ScanItem, mut header: TarHeader, meta: &Metadata) -> Result<u64> {
        let mut source = File::open(&item.path).map_err(|e| source_error(&item.path, e))?;
        let real_size = meta.len();
        header.size = real_size;

        let mut sparse = None;
        if self.sparse_threshold > 0 && real_size >= self.sparse_threshold {
            let mut map = SparseMap::scan(&mut source, real_size).at(&item.path)?;
            if map.stored_size() < real_size {
                (map.atime, map.ctime) = access_times(meta);
                debug!(path = %item.path.display(), regions = map.regions.len(), stored = map.stored_size(), "sparse file");
                header.set_sparse(map.clone());
                sparse = Some(map);
            }
            source.seek(SeekFrom::Start(0)).at(&item.path)?;
        }

        let mut out = BufWriter::new(&mut self.file);
        let mut written = header.save(&mut out).at(&self.path)?;
        let mut copied = 0u64;
        match &sparse {
            Some(map) => {
                for region in &map.regions {
                    source.seek(SeekFrom::Start(region.offset)).at(&item.path)?;
                    copied += copy_exact(&mut source, &mut out, region.numbytes).at(&item.path)?;
                }
            },
            None => copied = copy_exact(&mut source, &mut out, header.size).at(&item.path)?,
        }
        if copied < header.size {
            warn!(path = %item.path.display(), expected = header.size, read = copied, "file shrank while archiving, padded with zeros");
        }
        let padding = (padded_size(header.size) - header.size) as usize;
        out.write_all(&ZERO_BLOCK[..padding]).at(&self.path)?;
        out.flush().at(&self.path)?;
        written += padded_size(header.size);

        self.position += written;
        Ok(written)
    }

    /// Writes the two zero end blocks and syncs the archive.
    ///
    /// # Returns
    /// * `Ok(size)` - The final archive size.
    pub fn finish(&mut self) -> Result<u64> {
        self.file.write_all(&ZERO_BLOCK).at(&self.path)?;
        self.file.write_all(&ZERO_BLOCK).at(&self.path)?;
        self.file.sync_all().at(&self.path)?;
        self.position += 2 * BLOCK_SIZE as u64;
        Ok(self.position)
    }

    /// Flushes written entries to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data().at(&self.path)
    }
}

// Failures to stat or open a source entry only affect that entry
fn source_error(path: &Path, e: io::Error) -> BackupError {
    let path = path.to_path_buf();
    match e.kind() {
        io::ErrorKind::NotFound => BackupError::Vanished { path },
        _ => BackupError::Unreadable { path, source: e },
    }
}

/// Archive member name, `/` separated, directories end with `/`.
fn archive_name(relative: &Path, is_dir: bool) -> String {
    let mut name = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if is_dir {
        name.push('/');
    }
    name
}

/// Copies exactly `len` bytes: a longer source is cut, a shorter one is
/// padded with zeros.
///
/// # Returns
/// * `Ok(copied)` - Bytes actually read from the source.
fn copy_exact(reader: &mut impl Read, writer: &mut impl Write, len: u64) -> io::Result<u64> {
    let copied = io::copy(&mut reader.take(len), writer)?;
    let mut missing = len - copied;
    while missing > 0 {
        let chunk = missing.min(BLOCK_SIZE as u64) as usize;
        writer.write_all(&ZERO_BLOCK[..chunk])?;
        missing -= chunk as u64;
    }
    Ok(copied)
}

#[cfg(unix)]
fn fill_metadata(header: &mut TarHeader, meta: &Metadata) {
    use std::os::unix::fs::MetadataExt;
    header.mode = meta.mode() & 0o7777;
    header.uid = meta.uid();
    header.gid = meta.gid();
    header.mtime = meta.mtime().max(0) as u64;
}

#[cfg(not(unix))]
fn fill_metadata(header: &mut TarHeader, meta: &Metadata) {
    header.mode = match (meta.is_dir(), meta.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    };
    header.mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
}

#[cfg(unix)]
fn access_times(meta: &Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.atime().max(0) as u64, meta.ctime().max(0) as u64)
}

#[cfg(not(unix))]
fn access_times(_meta: &Metadata) -> (u64, u64) {
    (0, 0)
}

/// Fills fifo and device headers.
///
/// # Returns
/// * `true` - The entry is a fifo or a device.
#[cfg(unix)]
fn fill_special(header: &mut TarHeader, meta: &Metadata) -> bool {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};
    let file_type = meta.file_type();
    let flag = if file_type.is_fifo() {
        TypeFlag::Fifo
    } else if file_type.is_char_device() {
        TypeFlag::CharacterSpecial
    } else if file_type.is_block_device() {
        TypeFlag::BlockSpecial
    } else {
        return false;
    };
    header.set_typeflag(flag);
    if flag != TypeFlag::Fifo {
        let rdev = meta.rdev();
        header.devmajor = dev_major(rdev);
        header.devminor = dev_minor(rdev);
    }
    true
}

#[cfg(not(unix))]
fn fill_special(_header: &mut TarHeader, _meta: &Metadata) -> bool {
    false
}

// glibc device number layout
#[cfg(unix)]
fn dev_major(rdev: u64) -> u32 {
    (((rdev >> 32) & 0xffff_f000) | ((rdev >> 8) & 0x0fff)) as u32
}

#[cfg(unix)]
fn dev_minor(rdev: u64) -> u32 {
    (((rdev >> 12) & 0xffff_ff00) | (rdev & 0xff)) as u32
}
