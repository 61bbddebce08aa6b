pub mod tree_file;

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::ffi::OsString;
use std::fs::{self, File, FileType, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::engine::context::TaskContext;
use crate::error::{BackupError, IoContext, Result};
use tree_file::{HEADER_LEN, TreeHeader, TreeLine};

/// Extension of the tree file.
pub const TREE_EXTENSION: &str = "tree";

/// Lifecycle of a tree file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Nothing recorded yet.
    Empty,
    /// Part of the tree is recorded.
    Building,
    /// The whole tree is recorded and nothing was drained yet.
    BuildComplete,
    /// Some entries were popped, in this invocation or an earlier one.
    Draining,
    /// Every recorded entry was drained.
    Done,
}

/// Work item popped from the tree file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanItem {
    /// Path relative to the scanned root, as stored in the archive.
    pub relative: PathBuf,
    /// Absolute path on disk.
    pub path: PathBuf,
    pub is_dir: bool,
    /// Set when an earlier attempt already started writing this entry at
    /// that archive offset.
    pub archive_position: Option<u64>,
}

/// Glob based exclusion, matched against paths relative to the root.
#[derive(Debug, Clone)]
pub struct ExcludeFilter {
    set: GlobSet,
}

impl ExcludeFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = Glob::new(pattern).map_err(|source| BackupError::Pattern {
                pattern: pattern.to_string(),
                source,
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|source| BackupError::Pattern {
            pattern: patterns.iter().map(|p| p.as_ref()).collect::<Vec<_>>().join(", "),
            source,
        })?;
        Ok(Self { set })
    }

    /// Directories are tested with and without a trailing separator.
    pub fn is_excluded(&self, relative: &Path, is_dir: bool) -> bool {
        if self.set.is_empty() {
            return false;
        }
        if self.set.is_match(relative) {
            return true;
        }
        if !is_dir {
            return false;
        }
        let mut with_separator = relative.as_os_str().to_os_string();
        with_separator.push("/");
        self.set.is_match(Path::new(&with_separator))
    }
}

enum Frame {
    Enter(PathBuf),
    Leave(PathBuf),
}

struct Pending {
    start: u64,
    item: ScanItem,
}

type ErrorHandler = Box<dyn FnMut(&Path, &io::Error)>;

/// Persistent and resumable enumeration of a directory tree, drained as a
/// stack from the end of the tree file.
///
/// The build walks the tree with an explicit stack, sorted per directory so
/// a resumed build emits the same sequence and can skip what was already
/// written. A directory line follows all of its descendants, which puts the
/// directory before its content once drained from the end.
pub struct TreeScanner {
    root: PathBuf,
    path: PathBuf,
    file: File,
    header: TreeHeader,
    exclude: ExcludeFilter,
    on_error: ErrorHandler,
    skipped: u64,
    pending: Option<Pending>,
}

impl TreeScanner {
    /// Opens or creates the tree file `<work_dir>/<scan_id>.tree`.
    ///
    /// # Arguments
    /// * `work_dir` - Directory holding the tree file.
    /// * `scan_id` - Identifier reused across invocations of the same job.
    /// * `root` - Source root to enumerate.
    /// * `exclude` - Glob patterns for entries to leave out.
    pub fn open<S: AsRef<str>>(work_dir: &Path, scan_id: &str, root: impl Into<PathBuf>, exclude: &[S]) -> Result<Self> {
        let path = work_dir.join(format!("{}.{}", scan_id, TREE_EXTENSION));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .at(&path)?;
        let len = file.metadata().at(&path)?.len();

        let header = if len < HEADER_LEN {
            // creation never finished, nothing recorded yet
            let header = TreeHeader { complete: false, total: 0 };
            file.set_len(0).at(&path)?;
            file.seek(SeekFrom::Start(0)).at(&path)?;
            file.write_all(&header.encode()).at(&path)?;
            file.sync_all().at(&path)?;
            header
        } else {
            let mut buf = vec![0u8; HEADER_LEN as usize];
            file.seek(SeekFrom::Start(0)).at(&path)?;
            file.read_exact(&mut buf).at(&path)?;
            TreeHeader::decode(&buf, &path)?
        };
        debug!(path = %path.display(), complete = header.complete, total = header.total, "opened tree file");

        Ok(Self {
            root: root.into(),
            path,
            file,
            header,
            exclude: ExcludeFilter::new(exclude)?,
            on_error: Box::new(|_: &Path, _: &io::Error| {}),
            skipped: 0,
            pending: None,
        })
    }

    /// Sets the callback told about entries that could not be read.
    pub fn set_error_handler(&mut self, handler: impl FnMut(&Path, &io::Error) + 'static) {
        self.on_error = Box::new(handler);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of unreadable entries skipped by this scanner.
    pub fn skipped_entries(&self) -> u64 {
        self.skipped
    }

    /// Works the state out from the tree file, so it holds across restarts.
    /// Draining starts once fewer lines remain than the build recorded.
    pub fn state(&mut self) -> Result<ScanState> {
        let has_lines = self.file.metadata().at(&self.path)?.len() > HEADER_LEN;
        Ok(match (self.header.complete, has_lines) {
            (false, false) => ScanState::Empty,
            (false, true) => ScanState::Building,
            (true, false) => ScanState::Done,
            (true, true) if self.pending.is_some() => ScanState::Draining,
            (true, true) => {
                let remaining = tree_file::count_lines(&mut self.file, HEADER_LEN).at(&self.path)?;
                if remaining < self.header.total {
                    ScanState::Draining
                } else {
                    ScanState::BuildComplete
                }
            },
        })
    }

    /// Forces the build to completion and returns the number of recorded
    /// entries.
    pub fn total_files(&mut self, ctx: &mut TaskContext<'_>) -> Result<u64> {
        self.build(ctx)
    }

    /// Records the whole tree, resuming an interrupted build.
    ///
    /// # Returns
    /// * `Ok(total)` - The number of recorded entries.
    /// * `Err(BackupError::Interrupted)` - The stop hook fired, every line
    ///   written so far is kept.
    pub fn build(&mut self, ctx: &mut TaskContext<'_>) -> Result<u64> {
        if self.header.complete {
            return Ok(self.header.total);
        }
        tree_file::drop_unterminated_tail(&mut self.file, HEADER_LEN).at(&self.path)?;
        let already = tree_file::count_lines(&mut self.file, HEADER_LEN).at(&self.path)?;
        if already > 0 {
            info!(path = %self.path.display(), already, "resuming tree build");
        }

        self.file.seek(SeekFrom::End(0)).at(&self.path)?;
        let mut writer = BufWriter::new(self.file.try_clone().at(&self.path)?);
        let walked = self.walk(ctx, &mut writer, already);
        let flushed = writer.flush().and_then(|_| self.file.sync_data()).at(&self.path);
        let total = walked?;
        flushed?;

        self.complete_header(total)?;
        info!(root = %self.root.display(), total, skipped = self.skipped, "tree build complete");
        Ok(total)
    }

    fn walk(&mut self, ctx: &mut TaskContext<'_>, writer: &mut impl Write, already: u64) -> Result<u64> {
        let mut emitted = 0u64;
        let mut stack = vec![Frame::Enter(PathBuf::new())];

        while let Some(frame) = stack.pop() {
            ctx.checkpoint()?;
            let relative = match frame {
                Frame::Leave(relative) => {
                    let line = TreeLine { relative, is_dir: true, archive_position: None };
                    self.emit(writer, &line, &mut emitted, already)?;
                    continue;
                },
                Frame::Enter(relative) => relative,
            };

            let dir = self.root.join(&relative);
            let entries = match self.read_sorted(&dir) {
                Ok(entries) => entries,
                Err(e) if relative.as_os_str().is_empty() => return Err(BackupError::io(dir, e)),
                Err(e) => {
                    self.report(&dir, &e);
                    continue;
                },
            };
            if !relative.as_os_str().is_empty() {
                stack.push(Frame::Leave(relative.clone()));
            }

            let mut subdirs = Vec::new();
            for (name, file_type) in entries {
                ctx.checkpoint()?;
                let child = relative.join(&name);
                let is_dir = file_type.is_dir();
                if self.exclude.is_excluded(&child, is_dir) {
                    debug!(path = %child.display(), "excluded");
                    continue;
                }
                if is_dir {
                    subdirs.push(child);
                } else {
                    let line = TreeLine { relative: child, is_dir: false, archive_position: None };
                    self.emit(writer, &line, &mut emitted, already)?;
                }
            }
            stack.extend(subdirs.into_iter().rev().map(Frame::Enter));
        }
        Ok(emitted)
    }

    // Lines up to `already` were written by an earlier invocation
    fn emit(&self, writer: &mut impl Write, line: &TreeLine, emitted: &mut u64, already: u64) -> Result<()> {
        if *emitted >= already {
            tree_file::append_line(writer, line).at(&self.path)?;
        }
        *emitted += 1;
        Ok(())
    }

    fn read_sorted(&mut self, dir: &Path) -> io::Result<Vec<(OsString, FileType)>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    self.report(dir, &e);
                    continue;
                },
            };
            match entry.file_type() {
                Ok(file_type) => entries.push((entry.file_name(), file_type)),
                Err(e) => self.report(&entry.path(), &e),
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    fn report(&mut self, path: &Path, e: &io::Error) {
        self.skipped += 1;
        warn!(path = %path.display(), error = %e, "skipping unreadable entry");
        (self.on_error)(path, e);
    }

    // The total lands on disk before the one byte flag flip, a torn update
    // leaves the build incomplete and the next build recounts the lines.
    fn complete_header(&mut self, total: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(tree_file::TOTAL_OFFSET)).at(&self.path)?;
        self.file.write_all(&tree_file::encode_total(total)).at(&self.path)?;
        self.file.sync_data().at(&self.path)?;
        self.file.seek(SeekFrom::Start(tree_file::FLAG_OFFSET)).at(&self.path)?;
        self.file.write_all(&[tree_file::FLAG_COMPLETE]).at(&self.path)?;
        self.file.sync_data().at(&self.path)?;
        self.header = TreeHeader { complete: true, total };
        Ok(())
    }

    /// Returns the last recorded entry without removing it. The same item is
    /// returned until [`save`](Self::save) is called, including after a
    /// restart.
    ///
    /// # Returns
    /// * `Ok(Some(item))` - The next work item.
    /// * `Ok(None)` - Every entry was drained.
    pub fn pop(&mut self, ctx: &mut TaskContext<'_>) -> Result<Option<ScanItem>> {
        if let Some(pending) = &self.pending {
            return Ok(Some(pending.item.clone()));
        }
        self.build(ctx)?;
        ctx.checkpoint()?;

        loop {
            let tail = match tree_file::read_last_line(&mut self.file, HEADER_LEN).at(&self.path)? {
                Some(tail) => tail,
                None => return Ok(None),
            };
            if !tail.terminated {
                // a marker write was cut short, the entry was never started
                let mut repaired = tree_file::strip_torn_marker(&tail.bytes).to_vec();
                self.file.set_len(tail.start).at(&self.path)?;
                if !repaired.is_empty() {
                    repaired.push(b'\n');
                    self.file.seek(SeekFrom::Start(tail.start)).at(&self.path)?;
                    self.file.write_all(&repaired).at(&self.path)?;
                }
                self.file.sync_data().at(&self.path)?;
                warn!(path = %self.path.display(), "repaired torn tree line");
                continue;
            }
            if tail.bytes.is_empty() {
                self.file.set_len(tail.start).at(&self.path)?;
                continue;
            }

            let line = TreeLine::decode(&tail.bytes)?;
            let item = ScanItem {
                path: self.root.join(&line.relative),
                relative: line.relative,
                is_dir: line.is_dir,
                archive_position: line.archive_position,
            };
            self.pending = Some(Pending { start: tail.start, item: item.clone() });
            return Ok(Some(item));
        }
    }

    /// Records on disk that the popped entry starts at `archive_position`.
    /// A line that already carries a marker is left untouched.
    pub fn mark(&mut self, archive_position: u64) -> Result<()> {
        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| BackupError::checkpoint(&self.path, "no popped entry to mark"))?;
        if pending.item.archive_position.is_some() {
            return Ok(());
        }

        let end = self.file.seek(SeekFrom::End(0)).at(&self.path)?;
        let mut bytes = tree_file::marker(archive_position);
        bytes.push(b'\n');
        // overwrite the line break of the last line
        self.file.seek(SeekFrom::Start(end - 1)).at(&self.path)?;
        self.file.write_all(&bytes).at(&self.path)?;
        self.file.sync_data().at(&self.path)?;
        pending.item.archive_position = Some(archive_position);
        Ok(())
    }

    /// Drops the popped entry from the tree file, marking it first when an
    /// archive position is given.
    pub fn save(&mut self, archive_position: Option<u64>) -> Result<()> {
        if let Some(pos) = archive_position {
            self.mark(pos)?;
        }
        let pending = self
            .pending
            .take()
            .ok_or_else(|| BackupError::checkpoint(&self.path, "no popped entry to save"))?;
        self.file.set_len(pending.start).at(&self.path)?;
        self.file.sync_data().at(&self.path)?;
        Ok(())
    }

    /// Removes the tree file.
    pub fn discard(self) -> Result<()> {
        drop(self.file);
        fs::remove_file(&self.path).at(&self.path)
    }
}
