use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::engine::checkpoint::CheckpointStore;
use crate::engine::context::TaskContext;
use crate::error::{BackupError, IoContext, Result};

/// Extension of objects still being uploaded.
const PARTIAL_EXTENSION: &str = "part";

/// Handle of one upload session, persisted in checkpoints so a later
/// invocation can continue the same session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub name: String,
    pub id: String,
}

/// Chunked and resumable object storage.
pub trait RemoteStorage {
    /// Starts or reopens the upload session of `name`.
    fn prepare_upload(&self, name: &str) -> Result<SessionHandle>;

    /// Bytes already stored for the session.
    fn get_offset(&self, session: &SessionHandle) -> Result<u64>;

    /// Stores `data` at `offset`. Writing the same chunk twice is harmless.
    fn upload_chunk(&self, session: &SessionHandle, offset: u64, data: &[u8]) -> Result<()>;

    /// Publishes the uploaded object. Finalizing twice is harmless.
    fn finalize(&self, session: &SessionHandle) -> Result<()>;

    /// Copies bytes `start..end` of a published object into `writer`.
    ///
    /// # Returns
    /// * `Ok(bytes)` - Bytes written, less than requested past the object end.
    fn download_range(&self, name: &str, start: u64, end: u64, writer: &mut dyn Write) -> Result<u64>;
}

/// Storage backed by a local directory. Sessions are `<name>.part` files
/// renamed to `<name>` on finalize.
#[derive(Debug, Clone)]
pub struct LocalDirectoryStorage {
    root: PathBuf,
}

impl LocalDirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).at(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(BackupError::config(format!("invalid object name '{}'", name)));
        }
        Ok(self.root.join(name))
    }

    fn partial_path(&self, session: &SessionHandle) -> Result<PathBuf> {
        self.object_path(&format!("{}.{}", session.id, PARTIAL_EXTENSION))
    }
}

impl RemoteStorage for LocalDirectoryStorage {
    fn prepare_upload(&self, name: &str) -> Result<SessionHandle> {
        self.object_path(name)?;
        let session = SessionHandle { name: name.to_string(), id: name.to_string() };
        let partial = self.partial_path(&session)?;
        OpenOptions::new().write(true).create(true).truncate(false).open(&partial).at(&partial)?;
        debug!(path = %partial.display(), "prepared upload");
        Ok(session)
    }

    fn get_offset(&self, session: &SessionHandle) -> Result<u64> {
        let partial = self.partial_path(session)?;
        match fs::metadata(&partial) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let object = self.object_path(&session.name)?;
                Ok(fs::metadata(&object).at(&object)?.len())
            },
            Err(e) => Err(BackupError::io(partial, e)),
        }
    }

    fn upload_chunk(&self, session: &SessionHandle, offset: u64, data: &[u8]) -> Result<()> {
        let partial = self.partial_path(session)?;
        let mut file = OpenOptions::new().write(true).open(&partial).at(&partial)?;
        let len = file.metadata().at(&partial)?.len();
        if offset > len {
            return Err(BackupError::checkpoint(
                &partial,
                format!("chunk at {} leaves a gap after {} stored bytes", offset, len),
            ));
        }
        file.seek(SeekFrom::Start(offset)).at(&partial)?;
        file.write_all(data).at(&partial)?;
        file.sync_data().at(&partial)
    }

    fn finalize(&self, session: &SessionHandle) -> Result<()> {
        let partial = self.partial_path(session)?;
        let object = self.object_path(&session.name)?;
        if !partial.exists() && object.exists() {
            return Ok(());
        }
        fs::rename(&partial, &object).at(&object)?;
        info!(path = %object.display(), "upload finalized");
        Ok(())
    }

    fn download_range(&self, name: &str, start: u64, end: u64, writer: &mut dyn Write) -> Result<u64> {
        let object = self.object_path(name)?;
        let mut file = File::open(&object).at(&object)?;
        file.seek(SeekFrom::Start(start)).at(&object)?;
        io::copy(&mut file.take(end.saturating_sub(start)), writer).at(&object)
    }
}

/// Uploads `path` in chunks, resuming from the offset the storage already
/// holds. The session handle and the final publish go through the
/// checkpoint store so neither is repeated by a later invocation.
///
/// # Arguments
/// * `storage` - Destination.
/// * `ctx` - Invocation context, checked between chunks.
/// * `store` - Checkpoint store of the job.
/// * `path` - Local file, uploaded under its file name.
/// * `chunk_size` - Bytes per chunk.
///
/// # Returns
/// * `Ok(size)` - Size of the uploaded object.
pub fn upload_resumable(
    storage: &dyn RemoteStorage,
    ctx: &mut TaskContext<'_>,
    store: &mut CheckpointStore,
    path: &Path,
    chunk_size: usize,
) -> Result<u64> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| BackupError::config(format!("cannot upload '{}' without a file name", path.display())))?;
    let key = ctx.sequenced_key("upload");

    let session: SessionHandle = store.run_once(ctx, &format!("{}:prepare", key), name, |_, name: String| {
        storage.prepare_upload(&name)
    })?;

    let mut file = File::open(path).at(path)?;
    let total = file.metadata().at(path)?.len();
    let mut offset = storage.get_offset(&session)?;
    if offset > total {
        return Err(BackupError::checkpoint(
            path,
            format!("remote object holds {} bytes, local file only {}", offset, total),
        ));
    }
    if offset > 0 && offset < total {
        info!(name = %session.name, offset, total, "resuming upload");
    }

    file.seek(SeekFrom::Start(offset)).at(path)?;
    let mut buf = vec![0u8; chunk_size.max(1)];
    while offset < total {
        ctx.checkpoint()?;
        let want = (total - offset).min(buf.len() as u64) as usize;
        file.read_exact(&mut buf[..want]).at(path)?;
        storage.upload_chunk(&session, offset, &buf[..want])?;
        offset += want as u64;
        debug!(name = %session.name, offset, total, "uploaded chunk");
    }

    store.run_once(ctx, &format!("{}:finalize", key), session, |_, session: SessionHandle| {
        storage.finalize(&session)
    })?;
    Ok(total)
}
