mod task;

pub use task::{StoreDocument, TaskCheckpoint, TaskKind, TaskProgress, TaskStatus, SCHEMA_VERSION};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::engine::context::TaskContext;
use crate::error::{BackupError, IoContext, Result};

/// Extension of the checkpoint file.
pub const CHECKPOINT_EXTENSION: &str = "checkpoint";
/// Extension appended to the checkpoint file while it is being replaced.
pub const SWAP_EXTENSION: &str = "swp";

/// Crash-safe key to state persistence for resumable tasks.
///
/// Every mutation rewrites the whole document into a swap file and renames
/// it over the checkpoint file, so a reader only ever sees a complete
/// document. Nothing here is thread-safe, one worker owns a store at a time.
pub struct CheckpointStore {
    path: PathBuf,
    swap_path: PathBuf,
    doc: StoreDocument,
}

impl CheckpointStore {
    /// Opens the checkpoint store of a job inside `dir`.
    ///
    /// # Arguments
    /// * `dir` - Job scoped work directory.
    /// * `job_id` - Job identifier, names the `<job-id>.checkpoint` file.
    pub fn open(dir: &Path, job_id: &str) -> Result<Self> {
        Self::open_path(dir.join(format!("{}.{}", job_id, CHECKPOINT_EXTENSION)))
    }

    /// Opens a checkpoint store at an explicit path, recovering a leftover
    /// swap file first: a well-formed swap file is promoted over the main
    /// file, an empty or malformed one is discarded.
    pub fn open_path(path: PathBuf) -> Result<Self> {
        let mut swap_name = path.clone().into_os_string();
        swap_name.push(".");
        swap_name.push(SWAP_EXTENSION);
        let swap_path = PathBuf::from(swap_name);

        if swap_path.exists() {
            match read_document(&swap_path) {
                Ok(_) => {
                    fs::rename(&swap_path, &path).at(&path)?;
                    info!(path = %path.display(), "promoted leftover checkpoint swap file");
                },
                Err(e) => {
                    warn!(path = %swap_path.display(), error = %e, "discarding torn checkpoint swap file");
                    fs::remove_file(&swap_path).at(&swap_path)?;
                },
            }
        }

        let doc = if path.exists() {
            read_document(&path)?
        } else {
            StoreDocument::default()
        };
        debug!(path = %path.display(), tasks = doc.tasks.len(), sequence = doc.sequence, "opened checkpoint store");
        Ok(Self { path, swap_path, doc })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of writes the store has gone through.
    pub fn sequence(&self) -> u64 {
        self.doc.sequence
    }

    /// Returns the checkpoint of a task, if any.
    pub fn get(&self, kind: TaskKind, name: &str) -> Option<&TaskCheckpoint> {
        self.doc.tasks.get(&kind.key(name))
    }

    /// Returns the status of a task, `Pending` when never started.
    pub fn status(&self, kind: TaskKind, name: &str) -> TaskStatus {
        self.get(kind, name).map(|t| t.status).unwrap_or(TaskStatus::Pending)
    }

    pub fn is_completed(&self, kind: TaskKind, name: &str) -> bool {
        self.status(kind, name) == TaskStatus::Completed
    }

    /// Forgets a single task so it runs again from scratch.
    pub fn reset(&mut self, kind: TaskKind, name: &str) -> Result<()> {
        if self.doc.tasks.shift_remove(&kind.key(name)).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    /// Deletes the checkpoint files.
    pub fn discard(self) -> Result<()> {
        for path in [&self.swap_path, &self.path] {
            match fs::remove_file(path) {
                Ok(()) => {},
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => return Err(BackupError::io(path, e)),
            }
        }
        info!(path = %self.path.display(), "discarded checkpoint store");
        Ok(())
    }

    /// Runs `f` once per key. A completed key returns its stored result
    /// without calling `f`; otherwise the arguments are persisted before the
    /// call, so a retry after a crash gets the exact original arguments.
    ///
    /// # Arguments
    /// * `ctx` - Invocation context, its stop hook is checked before the call.
    /// * `name` - Checkpoint key.
    /// * `args` - Arguments for the first call.
    /// * `f` - Work to run; it may be re-run after a crash so it must be idempotent.
    pub fn run_once<'a, A, R, F>(&mut self, ctx: &mut TaskContext<'a>, name: &str, args: A, f: F) -> Result<R>
    where
        A: Serialize + DeserializeOwned,
        R: Serialize + DeserializeOwned,
        F: FnOnce(&mut TaskContext<'a>, A) -> Result<R>,
    {
        let key = TaskKind::RunOnce.key(name);
        let stored_args = match self.doc.tasks.get(&key) {
            Some(task) if task.is_completed() => {
                debug!(key = %key, "task already completed");
                let result = task.result.clone().unwrap_or(Value::Null);
                return Ok(serde_json::from_value(result)?);
            },
            Some(TaskCheckpoint { progress: Some(TaskProgress::RunOnce { args }), .. }) => Some(args.clone()),
            _ => None,
        };
        let args_value = match stored_args {
            Some(args) => {
                debug!(key = %key, "retrying task with its original arguments");
                args
            },
            None => {
                let args = serde_json::to_value(&args)?;
                self.put(key.clone(), TaskCheckpoint::in_progress(TaskProgress::RunOnce { args: args.clone() }))?;
                args
            },
        };

        ctx.checkpoint()?;
        let result = f(&mut *ctx, serde_json::from_value(args_value)?)?;
        self.put(key, TaskCheckpoint::completed(None, Some(serde_json::to_value(&result)?)))?;
        Ok(result)
    }

    /// Calls `f` on every item exactly once across restarts. The remaining
    /// items are persisted before the first call and after each item; a
    /// resumed call ignores `items` and continues with what is left.
    ///
    /// # Returns
    /// * `Ok(count)` - Items processed by this call.
    pub fn iterate_once<'a, T, I, F>(&mut self, ctx: &mut TaskContext<'a>, name: &str, items: I, mut f: F) -> Result<usize>
    where
        T: Serialize + DeserializeOwned,
        I: IntoIterator<Item = T>,
        F: FnMut(&mut TaskContext<'a>, T) -> Result<()>,
    {
        let key = TaskKind::IterateOnce.key(name);
        let mut remaining = match self.doc.tasks.get(&key) {
            Some(task) if task.is_completed() => return Ok(0),
            Some(TaskCheckpoint { progress: Some(TaskProgress::IterateOnce { remaining }), .. }) => remaining.clone(),
            _ => {
                let remaining = items
                    .into_iter()
                    .map(|item| serde_json::to_value(&item))
                    .collect::<std::result::Result<VecDeque<Value>, _>>()?;
                self.put(key.clone(), TaskCheckpoint::in_progress(TaskProgress::IterateOnce { remaining: remaining.clone() }))?;
                remaining
            },
        };

        let mut processed = 0;
        while let Some(next) = remaining.front() {
            ctx.checkpoint()?;
            f(&mut *ctx, serde_json::from_value(next.clone())?)?;
            remaining.pop_front();
            processed += 1;
            self.put(key.clone(), TaskCheckpoint::in_progress(TaskProgress::IterateOnce { remaining: remaining.clone() }))?;
        }
        self.put(key, TaskCheckpoint::completed(None, None))?;
        Ok(processed)
    }

    /// Calls `f` on every line of `path`, persisting the line cursor after
    /// each one so a restart resumes at the next unread line.
    ///
    /// # Returns
    /// * `Ok(lines)` - Total lines consumed for this key, across restarts.
    /// * `Err(BackupError::Corrupt)` - A line is not valid UTF-8, the cursor
    ///   stays on it.
    pub fn read_lines<'a, F>(&mut self, ctx: &mut TaskContext<'a>, name: &str, path: &Path, mut f: F) -> Result<u64>
    where
        F: FnMut(&mut TaskContext<'a>, &str) -> Result<()>,
    {
        let key = TaskKind::ReadLines.key(name);
        let (mut line, mut offset) = match self.doc.tasks.get(&key) {
            Some(TaskCheckpoint { status: TaskStatus::Completed, progress: Some(TaskProgress::ReadLines { line, .. }), .. }) => {
                return Ok(*line);
            },
            Some(TaskCheckpoint { progress: Some(TaskProgress::ReadLines { line, offset }), .. }) => (*line, *offset),
            _ => {
                self.put(key.clone(), TaskCheckpoint::in_progress(TaskProgress::ReadLines { line: 0, offset: 0 }))?;
                (0, 0)
            },
        };

        let mut file = File::open(path).at(path)?;
        file.seek(SeekFrom::Start(offset)).at(path)?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        loop {
            ctx.checkpoint()?;
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf).at(path)?;
            if read == 0 {
                break;
            }
            let text = std::str::from_utf8(trim_line_end(&buf)).map_err(|e| {
                BackupError::corrupt(format!("line {} of '{}' is not valid UTF-8: {}", line + 1, path.display(), e))
            })?;
            f(&mut *ctx, text)?;
            line += 1;
            offset += read as u64;
            self.put(key.clone(), TaskCheckpoint::in_progress(TaskProgress::ReadLines { line, offset }))?;
        }
        self.put(key, TaskCheckpoint::completed(Some(TaskProgress::ReadLines { line, offset }), None))?;
        Ok(line)
    }

    /// Appends every line of `source` to `target`, with separate
    /// read and write cursors persisted after every line. On resume the
    /// target is re-read up to the write cursor and anything past it (a
    /// partially flushed earlier write) is dropped before appending again.
    ///
    /// # Returns
    /// * `Ok(lines)` - Lines written into the target for this key, across restarts.
    pub fn merge_lines(&mut self, ctx: &mut TaskContext<'_>, name: &str, source: &Path, target: &Path) -> Result<u64> {
        let key = TaskKind::MergeLines.key(name);
        let (mut read_line, mut read_offset, mut write_line, base) = match self.doc.tasks.get(&key) {
            Some(TaskCheckpoint { status: TaskStatus::Completed, progress: Some(TaskProgress::MergeLines { write_line, .. }), result, .. }) => {
                let base = result.as_ref().and_then(Value::as_u64).unwrap_or(0);
                return Ok(write_line - base);
            },
            Some(TaskCheckpoint { progress: Some(TaskProgress::MergeLines { read_line, read_offset, write_line }), result, .. }) => {
                let base = result.as_ref().and_then(Value::as_u64).unwrap_or(0);
                (*read_line, *read_offset, *write_line, base)
            },
            _ => {
                let base = prepare_merge_target(target)?;
                let mut checkpoint = TaskCheckpoint::in_progress(TaskProgress::MergeLines { read_line: 0, read_offset: 0, write_line: base });
                checkpoint.result = Some(Value::from(base));
                self.put(key.clone(), checkpoint)?;
                (0, 0, base, base)
            },
        };

        let mut out = OpenOptions::new().read(true).write(true).open(target).at(target)?;
        let write_offset = offset_after_lines(&mut out, write_line, target)?;
        out.set_len(write_offset).at(target)?;
        out.seek(SeekFrom::Start(write_offset)).at(target)?;

        let mut input = File::open(source).at(source)?;
        input.seek(SeekFrom::Start(read_offset)).at(source)?;
        let mut reader = BufReader::new(input);
        let mut buf = Vec::new();
        loop {
            ctx.checkpoint()?;
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf).at(source)?;
            if read == 0 {
                break;
            }
            if buf.last() != Some(&b'\n') {
                buf.push(b'\n');
            }
            out.write_all(&buf).at(target)?;
            out.sync_data().at(target)?;
            write_line += 1;
            read_line += 1;
            read_offset += read as u64;
            let mut checkpoint = TaskCheckpoint::in_progress(TaskProgress::MergeLines { read_line, read_offset, write_line });
            checkpoint.result = Some(Value::from(base));
            self.put(key.clone(), checkpoint)?;
        }
        let progress = TaskProgress::MergeLines { read_line, read_offset, write_line };
        self.put(key, TaskCheckpoint::completed(Some(progress), Some(Value::from(base))))?;
        Ok(write_line - base)
    }

    fn put(&mut self, key: String, checkpoint: TaskCheckpoint) -> Result<()> {
        self.doc.tasks.insert(key, checkpoint);
        self.persist()
    }

    /// Writes the whole document to the swap file and renames it over the
    /// checkpoint file.
    fn persist(&mut self) -> Result<()> {
        self.doc.sequence += 1;
        let bytes = serde_json::to_vec(&self.doc)?;
        {
            let mut file = File::create(&self.swap_path).at(&self.swap_path)?;
            file.write_all(&bytes).at(&self.swap_path)?;
            file.sync_all().at(&self.swap_path)?;
        }
        fs::rename(&self.swap_path, &self.path).at(&self.path)?;
        sync_parent(&self.path)?;
        debug!(path = %self.path.display(), sequence = self.doc.sequence, "persisted checkpoint");
        Ok(())
    }
}

fn read_document(path: &Path) -> Result<StoreDocument> {
    let mut bytes = Vec::new();
    File::open(path).at(path)?.read_to_end(&mut bytes).at(path)?;
    if bytes.is_empty() {
        return Err(BackupError::checkpoint(path, "empty checkpoint file"));
    }
    let doc: StoreDocument = serde_json::from_slice(&bytes)
        .map_err(|e| BackupError::checkpoint(path, format!("malformed checkpoint: {}", e)))?;
    if doc.schema_version != SCHEMA_VERSION {
        return Err(BackupError::checkpoint(
            path,
            format!("unsupported checkpoint schema version {}", doc.schema_version),
        ));
    }
    Ok(doc)
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(dir).at(dir)?.sync_all().at(dir)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<()> {
    Ok(())
}

fn trim_line_end(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
        if end > 0 && buf[end - 1] == b'\r' {
            end -= 1;
        }
    }
    &buf[..end]
}

// Makes sure the target ends with a line break and returns its line count
fn prepare_merge_target(target: &Path) -> Result<u64> {
    let mut file = OpenOptions::new().read(true).append(true).create(true).open(target).at(target)?;
    let mut lines = 0u64;
    let mut last = None;
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf).at(target)?;
        if read == 0 {
            break;
        }
        lines += buf[..read].iter().filter(|&&b| b == b'\n').count() as u64;
        last = Some(buf[read - 1]);
    }
    if last.is_some_and(|b| b != b'\n') {
        file.write_all(b"\n").at(target)?;
        file.sync_data().at(target)?;
        lines += 1;
    }
    Ok(lines)
}

// Re-reads the file up to `lines` line breaks and returns the byte offset right after them
fn offset_after_lines(file: &mut File, lines: u64, path: &Path) -> Result<u64> {
    file.seek(SeekFrom::Start(0)).at(path)?;
    let mut reader = BufReader::new(&mut *file);
    let mut offset = 0u64;
    let mut buf = Vec::new();
    for _ in 0..lines {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf).at(path)?;
        if read == 0 || buf.last() != Some(&b'\n') {
            return Err(BackupError::checkpoint(path, "merge target is shorter than its write cursor"));
        }
        offset += read as u64;
    }
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::{NeverStop, TaskContext};
    use std::cell::RefCell;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> CheckpointStore {
        match CheckpointStore::open(dir.path(), "job") {
            Ok(store) => store,
            Err(e) => panic!("failed to open store: {}", e),
        }
    }

    #[test]
    fn run_once_returns_cached_result() {
        let dir = TempDir::new().unwrap();
        let mut hook = NeverStop;
        let mut ctx = TaskContext::new(&mut hook);
        let calls = RefCell::new(0);
        let mut store = open(&dir);
        let first: u64 = store
            .run_once(&mut ctx, "sum", vec![1u64, 2, 3], |_, args: Vec<u64>| {
                *calls.borrow_mut() += 1;
                Ok(args.iter().sum())
            })
            .unwrap();
        let second: u64 = store
            .run_once(&mut ctx, "sum", vec![10u64], |_, args: Vec<u64>| {
                *calls.borrow_mut() += 1;
                Ok(args.iter().sum())
            })
            .unwrap();
        assert_eq!(first, 6);
        assert_eq!(second, 6);
        assert_eq!(*calls.borrow(), 1);

        // survives a restart
        let mut store = open(&dir);
        let third: u64 = store.run_once(&mut ctx, "sum", vec![0u64], |_, _: Vec<u64>| panic!("must not run")).unwrap();
        assert_eq!(third, 6);
        assert!(store.is_completed(TaskKind::RunOnce, "sum"));
    }

    #[test]
    fn run_once_retries_with_original_args() {
        let dir = TempDir::new().unwrap();
        let mut hook = NeverStop;
        let mut ctx = TaskContext::new(&mut hook);
        let mut store = open(&dir);
        let failed: Result<String> = store.run_once(&mut ctx, "greet", "first".to_string(), |_, _: String| {
            Err(anyhow::anyhow!("crashed").into())
        });
        assert!(failed.is_err());
        assert_eq!(store.status(TaskKind::RunOnce, "greet"), TaskStatus::InProgress);

        let mut store = open(&dir);
        let greeting: String = store
            .run_once(&mut ctx, "greet", "second".to_string(), |_, name: String| Ok(format!("hello {}", name)))
            .unwrap();
        assert_eq!(greeting, "hello first");
    }

    #[test]
    fn run_once_honours_stop_hook() {
        let dir = TempDir::new().unwrap();
        let mut hook = || true;
        let mut ctx = TaskContext::new(&mut hook);
        let mut store = open(&dir);
        let res: Result<u8> = store.run_once(&mut ctx, "stop", (), |_, _: ()| panic!("must not run"));
        assert!(res.unwrap_err().is_interrupted());
        assert_eq!(store.status(TaskKind::RunOnce, "stop"), TaskStatus::InProgress);
    }

    #[test]
    fn iterate_once_resumes_after_crash() {
        let dir = TempDir::new().unwrap();
        let mut hook = NeverStop;
        let mut ctx = TaskContext::new(&mut hook);
        let items: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let seen = RefCell::new(Vec::new());
        {
            let mut store = open(&dir);
            let res = store.iterate_once(&mut ctx, "letters", items.clone(), |_, item: String| {
                if item == "c" {
                    return Err(anyhow::anyhow!("simulated crash").into());
                }
                seen.borrow_mut().push(item);
                Ok(())
            });
            assert!(res.is_err());
            // in-memory state is dropped here without a completion write
        }
        assert_eq!(*seen.borrow(), vec!["a", "b"]);

        seen.borrow_mut().clear();
        let mut store = open(&dir);
        let processed = store
            .iterate_once(&mut ctx, "letters", items.clone(), |_, item: String| {
                seen.borrow_mut().push(item);
                Ok(())
            })
            .unwrap();
        assert_eq!(processed, 2);
        assert_eq!(*seen.borrow(), vec!["c", "d"]);
        assert!(store.is_completed(TaskKind::IterateOnce, "letters"));

        let again = store.iterate_once(&mut ctx, "letters", items, |_, _: String| panic!("must not run")).unwrap();
        assert_eq!(again, 0);
    }

    #[test]
    fn iterate_once_stops_between_items() {
        let dir = TempDir::new().unwrap();
        let mut checks = 0;
        let mut hook = || {
            checks += 1;
            checks > 2
        };
        let mut ctx = TaskContext::new(&mut hook);
        let mut store = open(&dir);
        let mut seen = Vec::new();
        let res = store.iterate_once(&mut ctx, "n", 1..=5u32, |_, n: u32| {
            seen.push(n);
            Ok(())
        });
        assert!(res.unwrap_err().is_interrupted());
        assert_eq!(seen, vec![1, 2]);
        match store.get(TaskKind::IterateOnce, "n") {
            Some(TaskCheckpoint { progress: Some(TaskProgress::IterateOnce { remaining }), .. }) => {
                assert_eq!(remaining.len(), 3);
            },
            other => panic!("unexpected checkpoint: {:?}", other),
        }
    }

    #[test]
    fn zero_length_swap_is_discarded() {
        let dir = TempDir::new().unwrap();
        let mut hook = NeverStop;
        let mut ctx = TaskContext::new(&mut hook);
        let before = {
            let mut store = open(&dir);
            let _: u32 = store.run_once(&mut ctx, "value", (), |_, _: ()| Ok(42)).unwrap();
            fs::read(store.path()).unwrap()
        };
        let swap = dir.path().join("job.checkpoint.swp");
        File::create(&swap).unwrap();

        let mut store = open(&dir);
        assert!(!swap.exists());
        assert_eq!(fs::read(store.path()).unwrap(), before);
        let value: u32 = store.run_once(&mut ctx, "value", (), |_, _: ()| panic!("must not run")).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn malformed_swap_is_discarded() {
        let dir = TempDir::new().unwrap();
        let swap = dir.path().join("job.checkpoint.swp");
        fs::write(&swap, b"{\"schema_version\":1,\"seq").unwrap();
        let store = open(&dir);
        assert!(!swap.exists());
        assert_eq!(store.sequence(), 0);
    }

    #[test]
    fn valid_swap_is_promoted() {
        let dir = TempDir::new().unwrap();
        let mut doc = StoreDocument::default();
        doc.sequence = 9;
        doc.tasks.insert(TaskKind::RunOnce.key("late"), TaskCheckpoint::completed(None, Some(Value::from("done"))));
        let swap = dir.path().join("job.checkpoint.swp");
        fs::write(&swap, serde_json::to_vec(&doc).unwrap()).unwrap();

        let store = open(&dir);
        assert!(!swap.exists());
        assert_eq!(store.sequence(), 9);
        assert!(store.is_completed(TaskKind::RunOnce, "late"));
    }

    #[test]
    fn unsupported_schema_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut doc = StoreDocument::default();
        doc.schema_version = SCHEMA_VERSION + 1;
        fs::write(dir.path().join("job.checkpoint"), serde_json::to_vec(&doc).unwrap()).unwrap();
        match CheckpointStore::open(dir.path(), "job") {
            Err(BackupError::Checkpoint { .. }) => {},
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("expected schema rejection"),
        }
    }

    #[test]
    fn read_lines_resumes_at_next_line() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input.txt");
        fs::write(&input, "one\ntwo\r\nthree\nfour").unwrap();
        let mut seen = Vec::new();
        {
            let mut store = open(&dir);
            let mut hook = NeverStop;
            let mut ctx = TaskContext::new(&mut hook);
            let res = store.read_lines(&mut ctx, "input", &input, |_, line| {
                if line == "three" {
                    return Err(anyhow::anyhow!("crash").into());
                }
                seen.push(line.to_string());
                Ok(())
            });
            assert!(res.is_err());
        }
        let mut store = open(&dir);
        let mut hook = NeverStop;
        let mut ctx = TaskContext::new(&mut hook);
        let total = store
            .read_lines(&mut ctx, "input", &input, |_, line| {
                seen.push(line.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(total, 4);
        assert_eq!(seen, vec!["one", "two", "three", "four"]);
        let total = store.read_lines(&mut ctx, "input", &input, |_, _| panic!("must not run")).unwrap();
        assert_eq!(total, 4);
    }

    #[test]
    fn read_lines_rejects_invalid_utf8() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input.txt");
        fs::write(&input, b"ok\n\xff\xfe\nnever\n").unwrap();
        let mut store = open(&dir);
        let mut hook = NeverStop;
        let mut ctx = TaskContext::new(&mut hook);
        let mut seen = Vec::new();
        let res = store.read_lines(&mut ctx, "input", &input, |_, line| {
            seen.push(line.to_string());
            Ok(())
        });
        assert!(matches!(res, Err(BackupError::Corrupt { .. })));
        assert_eq!(seen, vec!["ok"]);
    }

    #[test]
    fn merge_lines_appends_once() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.txt");
        let target = dir.path().join("target.txt");
        fs::write(&source, "a\n\nb\nc\n").unwrap();
        fs::write(&target, "existing").unwrap();
        let mut store = open(&dir);
        let mut hook = NeverStop;
        let mut ctx = TaskContext::new(&mut hook);
        let written = store.merge_lines(&mut ctx, "merge", &source, &target).unwrap();
        assert_eq!(written, 4);
        assert_eq!(fs::read_to_string(&target).unwrap(), "existing\na\n\nb\nc\n");
        let written = store.merge_lines(&mut ctx, "merge", &source, &target).unwrap();
        assert_eq!(written, 4);
        assert_eq!(fs::read_to_string(&target).unwrap(), "existing\na\n\nb\nc\n");
    }

    #[test]
    fn merge_lines_drops_partially_flushed_tail() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.txt");
        let target = dir.path().join("target.txt");
        fs::write(&source, "a\nb\nc\n").unwrap();
        {
            let mut checks = 0;
            let mut hook = || {
                checks += 1;
                checks > 2
            };
            let mut ctx = TaskContext::new(&mut hook);
            let mut store = open(&dir);
            let res = store.merge_lines(&mut ctx, "merge", &source, &target);
            assert!(res.unwrap_err().is_interrupted());
        }
        assert_eq!(fs::read_to_string(&target).unwrap(), "a\nb\n");
        // a write that reached the file without its cursor being persisted
        let mut file = OpenOptions::new().append(true).open(&target).unwrap();
        file.write_all(b"c\npart").unwrap();
        drop(file);

        let mut store = open(&dir);
        let mut hook = NeverStop;
        let mut ctx = TaskContext::new(&mut hook);
        let written = store.merge_lines(&mut ctx, "merge", &source, &target).unwrap();
        assert_eq!(written, 3);
        assert_eq!(fs::read_to_string(&target).unwrap(), "a\nb\nc\n");
    }

    #[test]
    fn reset_and_discard() {
        let dir = TempDir::new().unwrap();
        let mut hook = NeverStop;
        let mut ctx = TaskContext::new(&mut hook);
        let mut store = open(&dir);
        let _: u8 = store.run_once(&mut ctx, "x", (), |_, _: ()| Ok(1)).unwrap();
        store.reset(TaskKind::RunOnce, "x").unwrap();
        assert_eq!(store.status(TaskKind::RunOnce, "x"), TaskStatus::Pending);
        let path = store.path().to_path_buf();
        assert!(path.exists());
        store.discard().unwrap();
        assert!(!path.exists());
    }
}
