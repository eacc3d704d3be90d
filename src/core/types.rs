use std::path::PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::utils::progress::percent;
use super::errors::ErrorKind;

/// Current schema version of persisted queue snapshots.
pub const QUEUE_SNAPSHOT_VERSION: u32 = 1;

/// 上传任务唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct UploadId(pub Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier the remote service assigns to a finished upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct RemoteObjectId(pub String);

impl std::fmt::Display for RemoteObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// Waiting for a worker
    Pending,
    /// Claimed by a worker
    Uploading,
    /// Interrupted by the caller, re-enters the pending pool on resume
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Cancelled)
    }

    /// Whether the queue state machine allows `self -> next`.
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;

        matches!(
            (self, next),
            (Pending, Uploading)
                | (Pending, Cancelled)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Uploading, Cancelled)
                | (Uploading, Paused)
                | (Paused, Pending)
                | (Paused, Cancelled)
        )
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One file's upload lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadItem {
    pub id: UploadId,
    pub file_path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    fingerprint: String,
    /// Target channel, `None` means the active channel at upload time
    pub channel_id: Option<String>,
    pub status: UploadStatus,
    /// 0.0 ..= 100.0
    pub progress: f64,
    pub bytes_transferred: u64,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub remote_id: Option<RemoteObjectId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl UploadItem {
    pub fn new(
        file_path: PathBuf,
        file_size: u64,
        fingerprint: impl Into<String>,
        channel_id: Option<String>,
    ) -> Self {
        let file_name = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.display().to_string());

        Self {
            id: UploadId::new(),
            file_path,
            file_name,
            file_size,
            fingerprint: fingerprint.into(),
            channel_id,
            status: UploadStatus::Pending,
            progress: 0.0,
            bytes_transferred: 0,
            retry_count: 0,
            error_message: None,
            error_kind: None,
            remote_id: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Hex content digest, fixed at creation.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Applies a state-machine transition, keeping timestamps and progress
    /// consistent. Returns `false` and leaves the item untouched when the
    /// transition is not allowed.
    pub(crate) fn transition(&mut self, next: UploadStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }

        match next {
            UploadStatus::Pending => {
                self.progress = 0.0;
                self.bytes_transferred = 0;
            }
            UploadStatus::Uploading => {
                self.started_at = Some(Utc::now());
            }
            UploadStatus::Completed => {
                self.progress = 100.0;
                self.bytes_transferred = self.file_size;
            }
            UploadStatus::Paused | UploadStatus::Failed | UploadStatus::Cancelled => {}
        }
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        self.status = next;
        true
    }

    pub(crate) fn record_progress(&mut self, bytes_transferred: u64) {
        self.bytes_transferred = bytes_transferred.min(self.file_size);
        self.progress = percent(self.bytes_transferred, self.file_size);
    }

    /// Seconds between start and end, or until now while running.
    pub fn duration(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.ended_at.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }

    /// Average speed in bytes per second.
    pub fn upload_speed(&self) -> Option<f64> {
        let duration = self.duration()?;
        if duration > 0.0 && self.bytes_transferred > 0 {
            Some(self.bytes_transferred as f64 / duration)
        } else {
            None
        }
    }
}

/// Per-status counters returned by `get_queue_status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub uploading: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Items ever added
    pub total: usize,
    /// Items still in the active queue
    pub queue_length: usize,
}

/// Queue notifications, delivered through a broadcast channel.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Added(UploadItem),

    Progress(UploadItem),

    StatusChanged {
        item: UploadItem,
        from: UploadStatus,
    },

    Completed(UploadItem),

    Failed {
        item: UploadItem,
        kind: ErrorKind,
        error: String,
    },
}

/// Versioned export of the queue and its history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: u32,
    pub items: Vec<UploadItem>,
}

// 静态断言确保类型是 Send的
const _: () = {
    fn assert_send<T: Send>() {}
    fn assert_types() {
        assert_send::<UploadItem>();
        assert_send::<QueueEvent>();
        assert_send::<QueueSnapshot>();
    }
};
