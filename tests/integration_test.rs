use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use bytes::Bytes;
use parking_lot::Mutex;
use clipdrop::channel::{Channel, Credential};
use clipdrop::core::{
    Authorizer, FileOutcome, RemoteFailure, RemoteObjectId, RemoteUploadService, SkipReason,
};
use clipdrop::remote::{ChunkOutcome, SessionHandle, VideoMetadata};
use clipdrop::{AppConfig, DispositionPolicy, ErrorKind, UploadError, UploadStatus, Uploader};

const MB: usize = 1024 * 1024;

/// 模拟上传服务 - 用于测试
#[derive(Default)]
struct MockService {
    sessions: Mutex<HashMap<String, (u64, Vec<u8>)>>,
    titles: Mutex<Vec<String>>,
    counter: AtomicUsize,
}

impl MockService {
    fn uploaded_titles(&self) -> Vec<String> {
        let mut titles = self.titles.lock().clone();
        titles.sort();
        titles
    }
}

#[async_trait::async_trait]
impl RemoteUploadService for MockService {
    async fn initiate_session(
        &self,
        _credential: &Credential,
        metadata: &VideoMetadata,
        total_bytes: u64,
    ) -> Result<SessionHandle, RemoteFailure> {
        if metadata.title == "broken" {
            return Err(RemoteFailure::new(400, "invalidVideoMetadata"));
        }
        let location = format!("session-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.sessions.lock().insert(location.clone(), (total_bytes, Vec::new()));
        self.titles.lock().push(metadata.title.clone());
        Ok(SessionHandle::new(location))
    }

    async fn send_chunk(
        &self,
        _credential: &Credential,
        session: &SessionHandle,
        offset: u64,
        _total_bytes: u64,
        chunk: Bytes,
    ) -> Result<ChunkOutcome, RemoteFailure> {
        let mut sessions = self.sessions.lock();
        let (total, data) = sessions
            .get_mut(&session.location)
            .ok_or_else(|| RemoteFailure::new(404, "unknown session"))?;
        data.truncate(offset as usize);
        data.extend_from_slice(&chunk);
        if data.len() as u64 >= *total {
            Ok(ChunkOutcome::Completed(RemoteObjectId(format!("id-{}", session.location))))
        } else {
            Ok(ChunkOutcome::Progress { committed: data.len() as u64 })
        }
    }

    async fn list_channels(&self, _credential: &Credential) -> Result<Vec<Channel>, RemoteFailure> {
        Ok(vec![Channel::new("UC-one", "One"), Channel::new("UC-two", "Two")])
    }
}

#[derive(Default)]
struct MockAuthorizer {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl Authorizer for MockAuthorizer {
    async fn authorize(&self, scopes: &[String]) -> clipdrop::Result<Credential> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Credential::new("granted").with_scopes(scopes.to_vec()))
    }

    async fn refresh(&self, _credential: &Credential) -> clipdrop::Result<Credential> {
        Err(UploadError::auth("no refresh token"))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    clips: PathBuf,
    service: Arc<MockService>,
    authorizer: Arc<MockAuthorizer>,
    uploader: Uploader,
}

fn test_config(data_dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.paths.data_dir = data_dir.to_path_buf();
    config.completion.rounds = 2;
    config.completion.interval_ms = 5;
    config
}

async fn harness(configure: impl FnOnce(&mut AppConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let clips = dir.path().join("clips");
    std::fs::create_dir_all(&clips).unwrap();

    let mut config = test_config(&dir.path().join("data"));
    configure(&mut config);

    let service = Arc::new(MockService::default());
    let authorizer = Arc::new(MockAuthorizer::default());
    let uploader = Uploader::open(config, service.clone(), authorizer.clone()).await.unwrap();
    uploader.discover_channels().await.unwrap();

    Harness {
        _dir: dir,
        clips,
        service,
        authorizer,
        uploader,
    }
}

fn write_clip(folder: &Path, name: &str, size: usize, fill: u8) -> PathBuf {
    let path = folder.join(name);
    std::fs::write(&path, vec![fill; size]).unwrap();
    path
}

#[tokio::test]
async fn test_batch_uploads_deletes_and_ledgers() {
    let h = harness(|_| {}).await;
    let first = write_clip(&h.clips, "first.mp4", 2 * MB + 17, 1);
    let second = write_clip(&h.clips, "second.MP4", 1000, 2);
    write_clip(&h.clips, "notes.txt", 10, 3);

    let summary = h.uploader.run_batch(&h.clips, None, None).await.unwrap();

    assert_eq!(summary.uploaded, 2);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.outcomes.len(), 2);
    assert_eq!(summary.outcomes[0].file, first);
    assert!(matches!(summary.outcomes[0].outcome, FileOutcome::Uploaded { warning: None, .. }));

    assert!(!first.exists());
    assert!(!second.exists());
    assert!(h.clips.join("notes.txt").exists());
    assert_eq!(h.uploader.ledger().len().await, 2);
    assert_eq!(h.service.uploaded_titles(), vec!["first", "second"]);

    // Discovery authorized once; every upload reused the seeded credentials
    assert_eq!(h.authorizer.calls.load(Ordering::SeqCst), 1);
    h.uploader.shutdown().await;
}

#[tokio::test]
async fn test_same_content_is_uploaded_once() {
    let h = harness(|config| config.file_management.auto_delete = false).await;
    write_clip(&h.clips, "a.mp4", 4096, 7);
    write_clip(&h.clips, "b.mp4", 4096, 7);

    let summary = h.uploader.run_batch(&h.clips, None, None).await.unwrap();
    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.outcomes[1].outcome, FileOutcome::Skipped(SkipReason::Duplicate));

    // A renamed copy in a later run is already ledgered
    write_clip(&h.clips, "renamed.mp4", 4096, 7);
    let summary = h.uploader.run_batch(&h.clips, None, None).await.unwrap();
    assert_eq!(summary.uploaded, 0);
    assert_eq!(summary.skipped, 3);
    assert!(summary
        .outcomes
        .iter()
        .all(|outcome| outcome.outcome == FileOutcome::Skipped(SkipReason::AlreadyUploaded)));

    assert_eq!(h.service.uploaded_titles(), vec!["a"]);
    h.uploader.shutdown().await;
}

#[tokio::test]
async fn test_out_of_bounds_files_are_skipped() {
    let h = harness(|config| {
        config.file_management.min_file_size_mb = 1;
        config.file_management.max_file_size_mb = 2;
    })
    .await;
    write_clip(&h.clips, "tiny.mp4", 100, 1);
    write_clip(&h.clips, "huge.mp4", 3 * MB, 2);

    let summary = h.uploader.run_batch(&h.clips, None, None).await.unwrap();

    assert_eq!((summary.uploaded, summary.skipped, summary.failed), (0, 2, 0));
    assert_eq!(summary.outcomes[0].outcome, FileOutcome::Skipped(SkipReason::TooLarge { size: 3 * MB as u64 }));
    assert_eq!(summary.outcomes[1].outcome, FileOutcome::Skipped(SkipReason::TooSmall { size: 100 }));
    assert_eq!(h.uploader.get_queue_status().total, 0);
    assert!(h.service.uploaded_titles().is_empty());
    h.uploader.shutdown().await;
}

#[tokio::test]
async fn test_move_policy_archives_into_batch_folder() {
    let h = harness(|config| config.file_management.move_instead_of_delete = true).await;
    write_clip(&h.clips, "clip.mp4", 1500, 4);
    std::fs::create_dir_all(h.clips.join("uploaded")).unwrap();
    std::fs::write(h.clips.join("uploaded").join("clip.mp4"), b"older").unwrap();

    let summary = h
        .uploader
        .run_batch(&h.clips, Some("UC-two"), None)
        .await
        .unwrap();

    assert_eq!(summary.uploaded, 1);
    assert!(!h.clips.join("clip.mp4").exists());
    assert_eq!(std::fs::read(h.clips.join("uploaded").join("clip (1).mp4")).unwrap(), vec![4u8; 1500]);
    h.uploader.shutdown().await;
}

#[tokio::test]
async fn test_keep_policy_leaves_source() {
    let h = harness(|_| {}).await;
    let clip = write_clip(&h.clips, "clip.mp4", 1500, 5);

    let summary = h
        .uploader
        .run_batch(&h.clips, None, Some(DispositionPolicy::Keep))
        .await
        .unwrap();

    assert_eq!(summary.uploaded, 1);
    assert!(clip.exists());
    h.uploader.shutdown().await;
}

#[tokio::test]
async fn test_missing_folder_fails_the_run() {
    let h = harness(|_| {}).await;
    let err = h
        .uploader
        .run_batch(&h.clips.join("nope"), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileOperation);
    h.uploader.shutdown().await;
}

#[tokio::test]
async fn test_rejected_file_fails_alone() {
    let h = harness(|_| {}).await;
    let broken = write_clip(&h.clips, "broken.mp4", 1500, 6);
    let fine = write_clip(&h.clips, "fine.mp4", 1500, 7);

    let summary = h.uploader.run_batch(&h.clips, None, None).await.unwrap();

    assert_eq!((summary.uploaded, summary.skipped, summary.failed), (1, 0, 1));
    assert!(matches!(
        summary.outcomes[0].outcome,
        FileOutcome::Failed { kind: ErrorKind::PermanentRequest, .. }
    ));
    assert!(broken.exists(), "failed uploads keep their source file");
    assert!(!fine.exists());
    assert_eq!(h.uploader.ledger().len().await, 1);
    h.uploader.shutdown().await;
}

#[tokio::test]
async fn test_add_upload_and_callbacks() {
    let h = harness(|_| {}).await;
    let clip = write_clip(&h.clips, "manual.mp4", 3 * MB, 8);

    let completed = Arc::new(AtomicUsize::new(0));
    let counter = completed.clone();
    h.uploader.on_complete(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let item = h.uploader.add_upload(&clip, Some("UC-one")).await.unwrap();
    let done = h.uploader.queue().wait_for_terminal(&item.id).await.unwrap();
    assert_eq!(done.status, UploadStatus::Completed);
    assert_eq!(done.bytes_transferred, 3 * MB as u64);

    h.uploader.shutdown().await;
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert_eq!(h.uploader.get_queue_status().completed, 1);
}

#[tokio::test]
async fn test_active_channel_and_logout() {
    let h = harness(|_| {}).await;
    assert_eq!(h.uploader.channels().active_channel_id().as_deref(), Some("UC-one"));

    h.uploader.set_active_channel("UC-two").await.unwrap();
    assert_eq!(h.uploader.channels().active_channel_id().as_deref(), Some("UC-two"));
    assert_eq!(
        h.uploader.set_active_channel("UC-zzz").await.unwrap_err().kind(),
        ErrorKind::Validation
    );

    h.uploader.logout().await.unwrap();
    assert!(h.uploader.channels().channels().is_empty());

    let clip = write_clip(&h.clips, "after_logout.mp4", 100, 9);
    let item = h.uploader.add_upload(&clip, None).await.unwrap();
    let failed = h.uploader.queue().wait_for_terminal(&item.id).await.unwrap();
    assert_eq!(failed.error_kind, Some(ErrorKind::Authentication));
    h.uploader.shutdown().await;
}

#[tokio::test]
async fn test_file_still_being_written_is_left_for_later() {
    let h = harness(|config| config.completion.interval_ms = 100).await;
    let growing = write_clip(&h.clips, "recording.mp4", 1000, 1);
    let finished = write_clip(&h.clips, "finished.mp4", 1000, 2);

    let writing = Arc::new(AtomicBool::new(true));
    let writer = {
        let writing = writing.clone();
        let growing = growing.clone();
        std::thread::spawn(move || {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().append(true).open(&growing).unwrap();
            while writing.load(Ordering::SeqCst) {
                file.write_all(&[1u8; 64]).unwrap();
                file.flush().unwrap();
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
        })
    };

    let summary = h.uploader.run_batch(&h.clips, None, None).await.unwrap();
    writing.store(false, Ordering::SeqCst);
    writer.join().unwrap();

    assert_eq!((summary.uploaded, summary.skipped, summary.failed), (1, 1, 0));
    let recording = summary.outcomes.iter().find(|outcome| outcome.file == growing).unwrap();
    assert_eq!(recording.outcome, FileOutcome::Skipped(SkipReason::Incomplete));
    assert!(growing.exists(), "incomplete files are left untouched");
    assert!(!finished.exists());
    assert_eq!(h.service.uploaded_titles(), vec!["finished"]);
    assert_eq!(h.uploader.ledger().len().await, 1);
    h.uploader.shutdown().await;
}
