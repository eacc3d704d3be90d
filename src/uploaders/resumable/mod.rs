use std::io::SeekFrom;
use std::path::Path;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use crate::channel::AuthenticatedTransport;
use crate::core::{RemoteObjectId, Result, UploadError};
use crate::remote::{ChunkOutcome, VideoMetadata};

/// 默认分片大小 1MB
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Progress sink invoked with `(bytes_sent, total_bytes)` after every chunk.
pub type ProgressSink<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// 可续传分片上传器
///
/// Drives one file through a resumable session: open the session, then send
/// fixed-size chunks from the offset the service last committed until it
/// reports the created object. Failures are classified and returned on the
/// first occurrence; retrying is left to the caller.
#[derive(Debug, Clone)]
pub struct ResumableUploader {
    chunk_size: usize,
}

impl ResumableUploader {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub async fn upload(
        &self,
        transport: &AuthenticatedTransport,
        file_path: &Path,
        metadata: &VideoMetadata,
        progress: ProgressSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<RemoteObjectId> {
        let mut file = File::open(file_path)
            .await
            .map_err(|e| UploadError::file_op(file_path, "open", e))?;
        let total = file
            .metadata()
            .await
            .map_err(|e| UploadError::file_op(file_path, "stat", e))?
            .len();

        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let session = transport
            .service
            .initiate_session(&transport.credential, metadata, total)
            .await
            .map_err(UploadError::from_remote)?;
        debug!(file = %file_path.display(), channel = %transport.channel_id, total, "upload session opened");

        let mut offset = 0u64;
        loop {
            // 每个分片之间检查取消
            if cancel.is_cancelled() {
                debug!(file = %file_path.display(), offset, "upload cancelled between chunks");
                return Err(UploadError::Cancelled);
            }

            let len = self.chunk_size.min(total.saturating_sub(offset) as usize);
            let chunk = read_chunk(&mut file, offset, len)
                .await
                .map_err(|e| UploadError::file_op(file_path, "read_chunk", e))?;
            let sent = chunk.len() as u64;

            let outcome = transport
                .service
                .send_chunk(&transport.credential, &session, offset, total, chunk)
                .await
                .map_err(UploadError::from_remote)?;

            match outcome {
                ChunkOutcome::Completed(id) => {
                    progress(total, total);
                    debug!(file = %file_path.display(), remote_id = %id, "upload completed");
                    return Ok(id);
                }
                ChunkOutcome::Progress { committed } => {
                    let committed = committed.min(total);
                    trace!(offset, sent, committed, "chunk acknowledged");
                    if committed <= offset {
                        return Err(UploadError::TransientService(format!(
                            "service stopped committing bytes at offset {} of {}",
                            offset, total
                        )));
                    }
                    offset = committed;
                    progress(offset, total);
                }
            }
        }
    }
}

impl Default for ResumableUploader {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

/// Reads up to `len` bytes starting at `offset`; shorter only at end of file.
async fn read_chunk(file: &mut File, offset: u64, len: usize) -> std::io::Result<Bytes> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buffer = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buffer.truncate(filled);
    Ok(Bytes::from(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use crate::channel::{Channel, Credential};
    use crate::core::{ErrorKind, RemoteFailure, RemoteUploadService};
    use crate::remote::SessionHandle;

    /// Commits everything it receives except that `short_commit` bytes are
    /// dropped from the first chunk, forcing a resend from the committed offset.
    struct RecordingService {
        received: Mutex<Vec<(u64, usize)>>,
        short_commit: u64,
        fail_with: Option<RemoteFailure>,
    }

    impl RecordingService {
        fn new() -> Self {
            Self {
                received: Mutex::new(Vec::new()),
                short_commit: 0,
                fail_with: None,
            }
        }
    }

    #[async_trait]
    impl RemoteUploadService for RecordingService {
        async fn initiate_session(
            &self,
            _credential: &Credential,
            _metadata: &VideoMetadata,
            _total_bytes: u64,
        ) -> std::result::Result<SessionHandle, RemoteFailure> {
            Ok(SessionHandle::new("mem://session"))
        }

        async fn send_chunk(
            &self,
            _credential: &Credential,
            _session: &SessionHandle,
            offset: u64,
            total_bytes: u64,
            chunk: Bytes,
        ) -> std::result::Result<ChunkOutcome, RemoteFailure> {
            if let Some(failure) = &self.fail_with {
                return Err(failure.clone());
            }
            let mut received = self.received.lock();
            let first = received.is_empty();
            received.push((offset, chunk.len()));

            let mut committed = offset + chunk.len() as u64;
            if first {
                committed -= self.short_commit;
            }
            if committed >= total_bytes {
                Ok(ChunkOutcome::Completed(RemoteObjectId("vid-1".to_string())))
            } else {
                Ok(ChunkOutcome::Progress { committed })
            }
        }

        async fn list_channels(&self, _credential: &Credential) -> std::result::Result<Vec<Channel>, RemoteFailure> {
            Ok(Vec::new())
        }
    }

    fn transport(service: Arc<RecordingService>) -> AuthenticatedTransport {
        AuthenticatedTransport {
            channel_id: "UC1".to_string(),
            credential: Credential::new("tok"),
            service,
        }
    }

    fn metadata() -> VideoMetadata {
        VideoMetadata::from_settings(&crate::channel::ChannelSettings::new("UC1"), Path::new("clip.mp4"))
    }

    fn write_file(dir: &Path, len: usize) -> std::path::PathBuf {
        let path = dir.join("clip.mp4");
        std::fs::write(&path, vec![7u8; len]).unwrap();
        path
    }

    #[tokio::test]
    async fn sends_fixed_size_chunks_and_reports_progress() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_file(tmp.path(), 2500);
        let service = Arc::new(RecordingService::new());
        let reports = Mutex::new(Vec::new());

        let id = ResumableUploader::new(1000)
            .upload(
                &transport(service.clone()),
                &path,
                &metadata(),
                &|sent, total| reports.lock().push((sent, total)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(id, RemoteObjectId("vid-1".to_string()));
        assert_eq!(*service.received.lock(), vec![(0, 1000), (1000, 1000), (2000, 500)]);
        assert_eq!(*reports.lock(), vec![(1000, 2500), (2000, 2500), (2500, 2500)]);
    }

    #[tokio::test]
    async fn resends_from_committed_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_file(tmp.path(), 2000);
        let mut service = RecordingService::new();
        service.short_commit = 200;
        let service = Arc::new(service);

        ResumableUploader::new(1000)
            .upload(&transport(service.clone()), &path, &metadata(), &|_, _| {}, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*service.received.lock(), vec![(0, 1000), (800, 1000), (1800, 200)]);
    }

    #[tokio::test]
    async fn remote_failures_are_classified_not_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_file(tmp.path(), 10);
        let mut service = RecordingService::new();
        service.fail_with = Some(RemoteFailure::new(403, "quotaExceeded"));

        let err = ResumableUploader::default()
            .upload(&transport(Arc::new(service)), &path, &metadata(), &|_, _| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_sending() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_file(tmp.path(), 10);
        let service = Arc::new(RecordingService::new());
        let token = CancellationToken::new();
        token.cancel();

        let err = ResumableUploader::default()
            .upload(&transport(service.clone()), &path, &metadata(), &|_, _| {}, &token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(service.received.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_file_is_a_file_operation_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ResumableUploader::default()
            .upload(
                &transport(Arc::new(RecordingService::new())),
                &tmp.path().join("nope.mp4"),
                &metadata(),
                &|_, _| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileOperation);
    }
}
