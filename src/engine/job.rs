use std::fs;
use tracing::{debug, info, warn};

use crate::config::BackupConfig;
use crate::engine::archive::ArchiveWriter;
use crate::engine::checkpoint::CheckpointStore;
use crate::engine::context::{StopHook, TaskContext};
use crate::engine::remote::{upload_resumable, LocalDirectoryStorage};
use crate::engine::scanner::TreeScanner;
use crate::error::{BackupError, IoContext, Result};

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The archive is complete.
    Done,
    /// The stop hook fired, another invocation must continue the job.
    Interrupted,
}

/// Counters of the current invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepStats {
    /// Entries recorded by the scan.
    pub total: u64,
    pub archived: u64,
    /// Entries gone between scan and archiving.
    pub vanished: u64,
    /// Entries that exist but could not be read.
    pub unreadable: u64,
}

/// One bounded invocation of a backup job. Every invocation reopens the
/// same checkpoint, tree and archive files and continues where the last one
/// stopped.
pub struct BackupJob {
    config: BackupConfig,
    store: CheckpointStore,
    scanner: TreeScanner,
    writer: ArchiveWriter,
    stats: StepStats,
}

impl BackupJob {
    pub fn open(config: BackupConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.work_dir).at(&config.work_dir)?;
        let store = CheckpointStore::open(&config.work_dir, &config.job_id)?;
        let scanner = TreeScanner::open(&config.work_dir, &config.job_id, &config.source_root, &config.exclude)?;
        let writer = ArchiveWriter::open(&config.archive_path, config.sparse_threshold)?;
        Ok(Self {
            config,
            store,
            scanner,
            writer,
            stats: StepStats::default(),
        })
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn stats(&self) -> StepStats {
        self.stats
    }

    /// Runs until the job is done or `stop` fires.
    ///
    /// # Returns
    /// * `Ok(StepOutcome::Done)` - The archive is finished (and uploaded).
    /// * `Ok(StepOutcome::Interrupted)` - Progress is saved, run again.
    /// * `Err(e)` - A failure that needs attention, progress is saved too.
    pub fn run_step(&mut self, stop: &mut dyn StopHook) -> Result<StepOutcome> {
        let mut ctx = TaskContext::new(stop);
        match self.step(&mut ctx) {
            Ok(()) => Ok(StepOutcome::Done),
            Err(e) if e.is_interrupted() => {
                self.writer.sync()?;
                info!(
                    job = %self.config.job_id,
                    archived = self.stats.archived,
                    total = self.stats.total,
                    "step interrupted, progress saved"
                );
                Ok(StepOutcome::Interrupted)
            },
            Err(e) => Err(e),
        }
    }

    fn step(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let scanner = &mut self.scanner;
        self.stats.total = self.store.run_once(ctx, "scan", (), |ctx, ()| scanner.total_files(ctx))?;
        info!(job = %self.config.job_id, total = self.stats.total, "scan ready");

        while let Some(item) = self.scanner.pop(ctx)? {
            if let Some(pos) = item.archive_position {
                warn!(path = %item.relative.display(), pos, "redoing partially archived entry");
                self.writer.truncate_to(pos)?;
            }
            let start = self.writer.position();
            self.scanner.mark(start)?;
            match self.writer.append_entry(&item) {
                Ok(_) => self.stats.archived += 1,
                Err(e) if e.is_skippable() => {
                    warn!(path = %item.relative.display(), error = %e, "skipping entry");
                    self.writer.truncate_to(start)?;
                    match e {
                        BackupError::Unreadable { .. } => self.stats.unreadable += 1,
                        _ => self.stats.vanished += 1,
                    }
                },
                Err(e) => return Err(e),
            }
            // the entry must be on disk before its tree line goes away
            self.writer.sync()?;
            self.scanner.save(None)?;
            debug!(
                path = %item.relative.display(),
                archived = self.stats.archived,
                total = self.stats.total,
                "archived entry"
            );
        }

        let writer = &mut self.writer;
        let start = writer.position();
        let size = self.store.run_once(ctx, "finish", start, |_, start: u64| {
            // a replay drops the end blocks written by the interrupted attempt
            writer.truncate_to(start)?;
            writer.finish()
        })?;
        info!(
            job = %self.config.job_id,
            size,
            vanished = self.stats.vanished,
            unreadable = self.stats.unreadable,
            "archive finished"
        );

        if let Some(dir) = &self.config.upload_dir {
            let storage = LocalDirectoryStorage::new(dir)?;
            let uploaded = upload_resumable(
                &storage,
                ctx,
                &mut self.store,
                &self.config.archive_path,
                self.config.upload_chunk_size,
            )?;
            info!(job = %self.config.job_id, uploaded, "archive uploaded");
        }
        Ok(())
    }
}
