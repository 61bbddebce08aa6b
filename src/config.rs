use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BackupError, IoContext, Result};

pub const DEFAULT_SPARSE_THRESHOLD: u64 = 1024 * 1024;
pub const DEFAULT_TIME_BUDGET_SECS: u64 = 25;
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;

fn default_sparse_threshold() -> u64 {
    DEFAULT_SPARSE_THRESHOLD
}

fn default_time_budget_secs() -> u64 {
    DEFAULT_TIME_BUDGET_SECS
}

fn default_upload_chunk_size() -> usize {
    DEFAULT_UPLOAD_CHUNK_SIZE
}

/// Settings of one backup job, shared by every invocation of the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Names the checkpoint and tree files.
    pub job_id: String,
    pub source_root: PathBuf,
    /// Job scoped directory holding the checkpoint and tree files.
    pub work_dir: PathBuf,
    pub archive_path: PathBuf,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Minimum size of a file scanned for holes, 0 disables it.
    #[serde(default = "default_sparse_threshold")]
    pub sparse_threshold: u64,
    /// Wall-clock budget of one invocation.
    #[serde(default = "default_time_budget_secs")]
    pub time_budget_secs: u64,
    #[serde(default = "default_upload_chunk_size")]
    pub upload_chunk_size: usize,
    /// Directory the finished archive is uploaded into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_dir: Option<PathBuf>,
}

impl BackupConfig {
    pub fn new(job_id: impl Into<String>, source_root: impl Into<PathBuf>, work_dir: impl Into<PathBuf>, archive_path: impl Into<PathBuf>) -> Self {
        Self {
            job_id: job_id.into(),
            source_root: source_root.into(),
            work_dir: work_dir.into(),
            archive_path: archive_path.into(),
            exclude: Vec::new(),
            sparse_threshold: DEFAULT_SPARSE_THRESHOLD,
            time_budget_secs: DEFAULT_TIME_BUDGET_SECS,
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            upload_dir: None,
        }
    }

    /// Loads and validates a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).at(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_id.is_empty() {
            return Err(BackupError::config("job_id must not be empty"));
        }
        if self.job_id.contains(['/', '\\']) || self.job_id == "." || self.job_id == ".." {
            return Err(BackupError::config(format!("job_id '{}' must not contain path separators", self.job_id)));
        }
        if self.upload_chunk_size == 0 {
            return Err(BackupError::config("upload_chunk_size must be positive"));
        }
        if self.archive_path.file_name().is_none() {
            return Err(BackupError::config(format!("archive_path '{}' has no file name", self.archive_path.display())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_applies_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.json");
        fs::write(
            &path,
            r#"{"job_id": "nightly", "source_root": "/srv", "work_dir": "/tmp/w", "archive_path": "/tmp/out.tar", "exclude": ["*.tmp"]}"#,
        )
        .unwrap();
        let config = BackupConfig::load(&path).unwrap();
        assert_eq!(config.job_id, "nightly");
        assert_eq!(config.exclude, vec!["*.tmp".to_string()]);
        assert_eq!(config.sparse_threshold, DEFAULT_SPARSE_THRESHOLD);
        assert_eq!(config.time_budget_secs, 25);
        assert_eq!(config.upload_chunk_size, DEFAULT_UPLOAD_CHUNK_SIZE);
        assert_eq!(config.upload_dir, None);
    }

    #[test]
    fn validation() {
        let good = BackupConfig::new("job", "/src", "/work", "/out.tar");
        assert!(good.validate().is_ok());

        let mut bad = good.clone();
        bad.job_id = String::new();
        assert!(matches!(bad.validate(), Err(BackupError::Config { .. })));

        let mut bad = good.clone();
        bad.job_id = "a/b".to_string();
        assert!(bad.validate().is_err());

        let mut bad = good.clone();
        bad.upload_chunk_size = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.json");
        fs::write(&path, "{\"job_id\": 3}").unwrap();
        assert!(matches!(BackupConfig::load(&path), Err(BackupError::Serialization(_))));
        assert!(matches!(BackupConfig::load(&dir.path().join("missing.json")), Err(BackupError::Io { .. })));
    }
}
