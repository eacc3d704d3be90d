use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use crate::utils::completion::CompletionDetector;
use crate::utils::fingerprint::fingerprint_file;
use crate::utils::retry::{retry_with_policy, Retrier, RetryPolicy};
use super::errors::{ErrorKind, Result, UploadError};
use super::ledger::DedupLedger;
use super::queue::UploadQueue;
use super::types::{RemoteObjectId, UploadId, UploadItem, UploadStatus};

/// What to do with a source file once its upload is confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispositionPolicy {
    Delete,
    /// Move into this folder; relative paths are resolved against the batch folder
    MoveTo(PathBuf),
    Keep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    TooSmall { size: u64 },
    TooLarge { size: u64 },
    /// Still being written; picked up by a later run
    Incomplete,
    /// Fingerprint already in the ledger
    AlreadyUploaded,
    /// Same content as another file in this run or an item already queued
    Duplicate,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    Uploaded {
        remote_id: RemoteObjectId,
        /// Post-upload bookkeeping that went wrong without undoing the upload
        warning: Option<String>,
    },
    Skipped(SkipReason),
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub file: PathBuf,
    pub outcome: FileOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Per-file results, sorted by path
    pub outcomes: Vec<BatchOutcome>,
}

impl BatchSummary {
    fn record(&mut self, file: PathBuf, outcome: FileOutcome) {
        match &outcome {
            FileOutcome::Uploaded { .. } => self.uploaded += 1,
            FileOutcome::Skipped(_) => self.skipped += 1,
            FileOutcome::Failed { .. } => self.failed += 1,
        }
        self.outcomes.push(BatchOutcome { file, outcome });
    }
}

/// Admission rules applied to candidate files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFilter {
    /// Lower-case, without the dot
    pub extension: String,
    pub min_bytes: u64,
    pub max_bytes: Option<u64>,
}

impl FileFilter {
    pub fn new(extension: &str, min_bytes: u64, max_bytes: Option<u64>) -> Self {
        Self {
            extension: extension.trim_start_matches('.').to_lowercase(),
            min_bytes,
            max_bytes,
        }
    }

    pub fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.to_lowercase() == self.extension)
    }

    pub fn check_size(&self, size: u64) -> Option<SkipReason> {
        if size < self.min_bytes {
            return Some(SkipReason::TooSmall { size });
        }
        match self.max_bytes {
            Some(max) if size > max => Some(SkipReason::TooLarge { size }),
            _ => None,
        }
    }
}

/// 批量上传编排
///
/// Scans one folder, admits files through the extension, size, completion
/// and dedup checks, feeds them to the queue and settles every item: ledger
/// first, then the disposition policy.
pub struct BatchOrchestrator {
    queue: Arc<UploadQueue>,
    ledger: Arc<DedupLedger>,
    detector: CompletionDetector,
    filter: FileFilter,
    file_retry: RetryPolicy,
    disposition_lock: Mutex<()>,
}

impl BatchOrchestrator {
    pub fn new(
        queue: Arc<UploadQueue>,
        ledger: Arc<DedupLedger>,
        detector: CompletionDetector,
        filter: FileFilter,
    ) -> Self {
        Self {
            queue,
            ledger,
            detector,
            filter,
            file_retry: RetryPolicy::file_operation(),
            disposition_lock: Mutex::new(()),
        }
    }

    pub fn with_file_retry(mut self, policy: RetryPolicy) -> Self {
        self.file_retry = policy;
        self
    }

    pub async fn run(&self, folder: &Path, channel: Option<&str>, policy: &DispositionPolicy) -> Result<BatchSummary> {
        let candidates = self.scan(folder).await?;
        info!(folder = %folder.display(), candidates = candidates.len(), "batch started");

        let mut summary = BatchSummary::default();

        // Size bounds
        let mut sized = Vec::new();
        for (path, size) in candidates {
            match self.filter.check_size(size) {
                Some(reason) => {
                    debug!(file = %path.display(), size, ?reason, "outside size bounds");
                    summary.record(path, FileOutcome::Skipped(reason));
                }
                None => sized.push((path, size)),
            }
        }

        // Completion polls run side by side; each one takes rounds * interval.
        let verdicts = join_all(sized.iter().map(|(path, _)| self.detector.is_complete(path))).await;

        let mut seen = HashSet::new();
        let mut submitted: Vec<(UploadId, PathBuf)> = Vec::new();
        for ((path, size), complete) in sized.into_iter().zip(verdicts) {
            if !complete {
                summary.record(path, FileOutcome::Skipped(SkipReason::Incomplete));
                continue;
            }

            let fingerprint = match fingerprint_file(&path).await {
                Ok(fingerprint) => fingerprint,
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "fingerprinting failed");
                    summary.record(path, failed(&err));
                    continue;
                }
            };

            if self.ledger.contains(&fingerprint).await {
                summary.record(path, FileOutcome::Skipped(SkipReason::AlreadyUploaded));
                continue;
            }
            let queued = self
                .queue
                .get_by_fingerprint(&fingerprint)
                .is_some_and(|item| !item.status.is_terminal());
            if queued || !seen.insert(fingerprint.clone()) {
                summary.record(path, FileOutcome::Skipped(SkipReason::Duplicate));
                continue;
            }

            let item = self
                .queue
                .add(UploadItem::new(path.clone(), size, fingerprint, channel.map(str::to_string)));
            submitted.push((item.id, path));
        }

        self.queue.start();

        let mut waiting: FuturesUnordered<_> = submitted
            .into_iter()
            .map(|(id, path)| async move { (path, self.queue.wait_for_terminal(&id).await) })
            .collect();

        while let Some((path, item)) = waiting.next().await {
            let outcome = match item {
                Some(item) => self.settle(folder, item, policy).await,
                None => FileOutcome::Skipped(SkipReason::Cancelled),
            };
            summary.record(path, outcome);
        }

        summary.outcomes.sort_by(|a, b| a.file.cmp(&b.file));
        info!(
            uploaded = summary.uploaded,
            skipped = summary.skipped,
            failed = summary.failed,
            "batch finished"
        );
        Ok(summary)
    }

    /// Regular files with the target extension directly inside `folder`,
    /// in lexical order.
    async fn scan(&self, folder: &Path) -> Result<Vec<(PathBuf, u64)>> {
        let mut entries = tokio::fs::read_dir(folder)
            .await
            .map_err(|e| UploadError::file_op(folder, "read_dir", e))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UploadError::file_op(folder, "read_dir", e))?
        {
            let path = entry.path();
            if !self.filter.matches_extension(&path) {
                continue;
            }
            match entry.metadata().await {
                Ok(meta) if meta.is_file() => files.push((path, meta.len())),
                Ok(_) => {}
                Err(err) => warn!(file = %path.display(), error = %err, "cannot stat candidate"),
            }
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    async fn settle(&self, folder: &Path, item: UploadItem, policy: &DispositionPolicy) -> FileOutcome {
        match item.status {
            UploadStatus::Completed => {}
            UploadStatus::Failed => {
                return FileOutcome::Failed {
                    kind: item.error_kind.unwrap_or(ErrorKind::Internal),
                    message: item.error_message.unwrap_or_default(),
                };
            }
            _ => return FileOutcome::Skipped(SkipReason::Cancelled),
        }

        let Some(remote_id) = item.remote_id.clone() else {
            return FileOutcome::Failed {
                kind: ErrorKind::Internal,
                message: "completed without a remote id".to_string(),
            };
        };

        // Only a confirmed remote id makes it into the ledger.
        let ledger = &self.ledger;
        let fingerprint = item.fingerprint();
        if let Err(err) = retry_with_policy(&self.file_retry, move || ledger.append(fingerprint)).await {
            warn!(file = %item.file_name, error = %err, "failed to record fingerprint, keeping source file");
            return FileOutcome::Uploaded {
                remote_id,
                warning: Some(format!("fingerprint not recorded: {}", err)),
            };
        }

        let warning = match self.dispose(folder, &item.file_path, policy).await {
            Ok(()) => None,
            Err(err) => {
                warn!(file = %item.file_name, error = %err, "post-upload disposition failed");
                Some(format!("disposition failed: {}", err))
            }
        };
        FileOutcome::Uploaded { remote_id, warning }
    }

    async fn dispose(&self, folder: &Path, path: &Path, policy: &DispositionPolicy) -> Result<()> {
        let _guard = self.disposition_lock.lock().await;
        let retrier = Retrier::new(self.file_retry.clone()).name("dispose");

        match policy {
            DispositionPolicy::Keep => Ok(()),
            DispositionPolicy::Delete => {
                retrier
                    .run(move || async move {
                        tokio::fs::remove_file(path)
                            .await
                            .map_err(|e| UploadError::file_op(path, "delete", e))
                    })
                    .await?;
                info!(file = %path.display(), "source file deleted");
                Ok(())
            }
            DispositionPolicy::MoveTo(target) => {
                let dir = if target.is_absolute() { target.clone() } else { folder.join(target) };
                let dir = dir.as_path();
                let dest = retrier.run(move || move_into(path, dir)).await?;
                info!(file = %path.display(), dest = %dest.display(), "source file moved");
                Ok(())
            }
        }
    }
}

fn failed(err: &UploadError) -> FileOutcome {
    FileOutcome::Failed {
        kind: err.kind(),
        message: err.to_string(),
    }
}

/// Moves `path` into `dir` without overwriting, falling back to copy and
/// remove when a rename is not possible (e.g. across file systems).
async fn move_into(path: &Path, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| UploadError::file_op(dir, "create_dir", e))?;

    let dest = reserve_destination(path, dir).await?;
    if let Err(rename_err) = tokio::fs::rename(path, &dest).await {
        debug!(file = %path.display(), error = %rename_err, "rename failed, copying instead");
        if let Err(err) = copy_then_remove(path, &dest).await {
            // Drop the placeholder; the source is still in place.
            if let Err(cleanup) = tokio::fs::remove_file(&dest).await {
                warn!(dest = %dest.display(), error = %cleanup, "failed to remove reserved destination");
            }
            return Err(err);
        }
    }
    Ok(dest)
}

async fn copy_then_remove(path: &Path, dest: &Path) -> Result<()> {
    tokio::fs::copy(path, dest)
        .await
        .map_err(|e| UploadError::file_op(path, "copy", e))?;
    tokio::fs::remove_file(path)
        .await
        .map_err(|e| UploadError::file_op(path, "remove_after_copy", e))?;
    Ok(())
}

/// Claims the first free `name.ext`, `name (1).ext`, ... in `dir` by creating
/// it exclusively, so concurrent movers never pick the same name.
async fn reserve_destination(path: &Path, dir: &Path) -> Result<PathBuf> {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = path.extension().map(|e| format!(".{}", e.to_string_lossy())).unwrap_or_default();

    let mut n = 0u32;
    loop {
        let candidate = match n {
            0 => dir.join(format!("{}{}", stem, ext)),
            n => dir.join(format!("{} ({}){}", stem, n, ext)),
        };
        match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&candidate).await {
            Ok(_) => return Ok(candidate),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(err) => return Err(UploadError::file_op(candidate, "reserve_destination", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_extension_case_insensitively() {
        let filter = FileFilter::new(".MP4", 0, None);
        assert!(filter.matches_extension(Path::new("/c/clip.mp4")));
        assert!(filter.matches_extension(Path::new("/c/CLIP.Mp4")));
        assert!(!filter.matches_extension(Path::new("/c/clip.mkv")));
        assert!(!filter.matches_extension(Path::new("/c/mp4")));
    }

    #[test]
    fn zero_bounds_are_unbounded() {
        let filter = FileFilter::new("mp4", 0, None);
        assert_eq!(filter.check_size(0), None);
        assert_eq!(filter.check_size(u64::MAX), None);

        let filter = FileFilter::new("mp4", 10, Some(20));
        assert_eq!(filter.check_size(9), Some(SkipReason::TooSmall { size: 9 }));
        assert_eq!(filter.check_size(21), Some(SkipReason::TooLarge { size: 21 }));
        assert_eq!(filter.check_size(20), None);
    }

    #[tokio::test]
    async fn move_never_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("uploaded");
        std::fs::create_dir_all(&archive).unwrap();
        std::fs::write(archive.join("clip.mp4"), b"older").unwrap();
        let source = tmp.path().join("clip.mp4");
        std::fs::write(&source, b"newer").unwrap();

        let dest = move_into(&source, &archive).await.unwrap();
        assert_eq!(dest, archive.join("clip (1).mp4"));
        assert!(!source.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"newer");
        assert_eq!(std::fs::read(archive.join("clip.mp4")).unwrap(), b"older");
    }

    #[tokio::test]
    async fn concurrent_moves_of_the_same_name_keep_both_files() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("uploaded");
        let (left, right) = (tmp.path().join("left"), tmp.path().join("right"));
        std::fs::create_dir_all(&left).unwrap();
        std::fs::create_dir_all(&right).unwrap();
        std::fs::write(left.join("clip.mp4"), b"left").unwrap();
        std::fs::write(right.join("clip.mp4"), b"right").unwrap();

        let (from_left, from_right) = (left.join("clip.mp4"), right.join("clip.mp4"));
        let (a, b) = tokio::join!(move_into(&from_left, &archive), move_into(&from_right, &archive));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a, b);
        let mut contents = vec![std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap()];
        contents.sort();
        assert_eq!(contents, vec![b"left".to_vec(), b"right".to_vec()]);
        assert_eq!(std::fs::read_dir(&archive).unwrap().count(), 2);
    }
}
