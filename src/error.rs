use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the backup engine.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Checksum mismatch, malformed archive block or undecodable line.
    #[error("corrupt data: {message}")]
    Corrupt {
        message: String,
    },

    #[error("checkpoint error at '{path}': {message}")]
    Checkpoint {
        path: PathBuf,
        message: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid exclude pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("configuration error: {message}")]
    Config {
        message: String,
    },

    /// The source entry disappeared between enumeration and archiving.
    #[error("source entry vanished: '{path}'")]
    Vanished {
        path: PathBuf,
    },

    /// The source entry exists but cannot be read.
    #[error("source entry unreadable: '{path}': {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The cooperative stop hook asked for the current invocation to end.
    #[error("interrupted by stop hook")]
    Interrupted,

    #[error(transparent)]
    Task(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;

impl BackupError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    pub fn checkpoint(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Checkpoint {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Tells if the error came from the cooperative stop hook.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// Tells if the error only affects a single entry and the job may go on.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::Vanished { .. } | Self::Unreadable { .. })
    }
}

/// Extension used to attach a path to raw `std::io` results.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| BackupError::io(path, e))
    }
}
