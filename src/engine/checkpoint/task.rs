use std::collections::VecDeque;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version of the on-disk checkpoint document.
pub const SCHEMA_VERSION: u32 = 1;

/// Lifecycle of a resumable task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

/// Kind of resumable primitive a checkpoint belongs to. Together with the
/// caller supplied name it forms the checkpoint key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    RunOnce,
    IterateOnce,
    ReadLines,
    MergeLines,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunOnce => "run_once",
            Self::IterateOnce => "iterate_once",
            Self::ReadLines => "read_lines",
            Self::MergeLines => "merge_lines",
        }
    }

    /// Builds the checkpoint key for `name`.
    pub fn key(&self, name: &str) -> String {
        format!("{}:{}", self.as_str(), name)
    }
}

/// Partial progress of a task, tagged by primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskProgress {
    /// Arguments of the first call, replayed on retry.
    RunOnce { args: Value },
    /// Items not processed yet, in order.
    IterateOnce { remaining: VecDeque<Value> },
    /// Lines consumed and the byte offset right after them.
    ReadLines { line: u64, offset: u64 },
    /// Independent source read and target write cursors.
    MergeLines { read_line: u64, read_offset: u64, write_line: u64 },
}

/// Persisted state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TaskProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl TaskCheckpoint {
    pub fn in_progress(progress: TaskProgress) -> Self {
        Self {
            status: TaskStatus::InProgress,
            progress: Some(progress),
            result: None,
        }
    }

    pub fn completed(progress: Option<TaskProgress>, result: Option<Value>) -> Self {
        Self {
            status: TaskStatus::Completed,
            progress,
            result,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// The whole checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    pub schema_version: u32,
    /// Incremented on every write.
    pub sequence: u64,
    pub tasks: IndexMap<String, TaskCheckpoint>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            sequence: 0,
            tasks: IndexMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn progress_is_tagged() {
        let progress = TaskProgress::ReadLines { line: 3, offset: 42 };
        let value = serde_json::to_value(&progress).unwrap();
        assert_eq!(value, json!({"kind": "read_lines", "line": 3, "offset": 42}));
        let back: TaskProgress = serde_json::from_value(value).unwrap();
        assert_eq!(back, progress);
    }

    #[test]
    fn document_layout() {
        let mut doc = StoreDocument::default();
        doc.tasks.insert(
            TaskKind::RunOnce.key("prepare"),
            TaskCheckpoint::completed(None, Some(json!(7))),
        );
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["schema_version"], json!(SCHEMA_VERSION));
        assert_eq!(value["tasks"]["run_once:prepare"]["status"], json!("completed"));
        assert_eq!(value["tasks"]["run_once:prepare"]["result"], json!(7));
        assert!(value["tasks"]["run_once:prepare"].get("progress").is_none());
    }

    #[test]
    fn keys_separate_kinds() {
        assert_ne!(TaskKind::RunOnce.key("a"), TaskKind::IterateOnce.key("a"));
        assert_eq!(TaskKind::MergeLines.key("logs"), "merge_lines:logs");
    }
}
