use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use super::errors::{Result, UploadError};

/// Append-only log of fingerprints that finished uploading.
///
/// One hex digest per line. Existing lines are never rewritten; appends are
/// serialized through the ledger's lock and flushed before returning.
pub struct DedupLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

struct LedgerState {
    known: HashSet<String>,
    /// The file's last line has no terminating newline
    unterminated: bool,
}

impl DedupLedger {
    /// Loads the ledger at `path`; a missing file is an empty ledger.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(UploadError::file_op(&path, "read_ledger", err)),
        };
        let known: HashSet<String> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        debug!(path = %path.display(), entries = known.len(), "dedup ledger loaded");

        Ok(Self {
            path,
            state: Mutex::new(LedgerState {
                known,
                unterminated: !contents.is_empty() && !contents.ends_with('\n'),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn contains(&self, fingerprint: &str) -> bool {
        self.state.lock().await.known.contains(fingerprint)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.known.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.known.is_empty()
    }

    /// Records a confirmed upload. Returns `false` if it was already known.
    pub async fn append(&self, fingerprint: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.known.contains(fingerprint) {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| UploadError::file_op(parent, "create_dir", e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| UploadError::file_op(&self.path, "open_ledger", e))?;
        let line = if state.unterminated {
            format!("\n{}\n", fingerprint)
        } else {
            format!("{}\n", fingerprint)
        };
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| UploadError::file_op(&self.path, "append_ledger", e))?;
        file.sync_data()
            .await
            .map_err(|e| UploadError::file_op(&self.path, "sync_ledger", e))?;

        state.unterminated = false;
        state.known.insert(fingerprint.to_string());
        info!(fingerprint = %fingerprint, "fingerprint recorded");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("uploaded_hashes.txt");

        let ledger = DedupLedger::open(&path).await.unwrap();
        assert!(ledger.is_empty().await);
        assert!(ledger.append("abc").await.unwrap());
        assert!(!ledger.append("abc").await.unwrap());
        assert!(ledger.append("def").await.unwrap());

        let reopened = DedupLedger::open(&path).await.unwrap();
        assert!(reopened.contains("abc").await);
        assert!(reopened.contains("def").await);
        assert_eq!(reopened.len().await, 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "abc\ndef\n");
    }

    #[tokio::test]
    async fn existing_lines_are_kept_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("hashes.txt");
        std::fs::write(&path, "old1\n\nold2\n").unwrap();

        let ledger = DedupLedger::open(&path).await.unwrap();
        ledger.append("new").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old1\n\nold2\nnew\n");
    }

    #[tokio::test]
    async fn unterminated_last_line_is_not_merged() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("hashes.txt");
        std::fs::write(&path, "old").unwrap();

        let ledger = DedupLedger::open(&path).await.unwrap();
        ledger.append("new").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old\nnew\n");
    }
}
