use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use crate::channel::{Channel, ChannelManager};
use crate::config::AppConfig;
use crate::uploaders::ResumableUploader;
use crate::utils::completion::CompletionDetector;
use crate::utils::fingerprint::fingerprint_file;
use super::batch::{BatchOrchestrator, BatchSummary, DispositionPolicy, FileFilter};
use super::errors::{ErrorKind, Result, UploadError};
use super::handler::ChannelUploadHandler;
use super::ledger::DedupLedger;
use super::queue::UploadQueue;
use super::traits::{Authorizer, RemoteUploadService};
use super::types::{QueueEvent, QueueStatus, UploadId, UploadItem, UploadStatus};

/// 上传器
///
/// Owns one channel manager, one queue with its worker pool and one dedup
/// ledger, all built from a single [`AppConfig`]. The queue is started on
/// [`open`](Self::open) and stopped by [`shutdown`](Self::shutdown).
pub struct Uploader {
    config: AppConfig,
    channels: Arc<ChannelManager>,
    queue: Arc<UploadQueue>,
    ledger: Arc<DedupLedger>,
    batch: BatchOrchestrator,
}

impl Uploader {
    pub async fn open(
        config: AppConfig,
        service: Arc<dyn RemoteUploadService>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self> {
        config.validate()?;

        let channels = ChannelManager::open(
            config.paths.channel_paths(),
            service,
            authorizer,
            config.api.scopes.clone(),
        )
        .await?
        .with_default_settings(config.default_channel_settings());
        let channels = Arc::new(channels);

        let handler = ChannelUploadHandler::new(channels.clone(), ResumableUploader::new(config.chunk_size_bytes()));
        let queue = Arc::new(UploadQueue::new(Arc::new(handler), config.upload.max_concurrent));
        let ledger = Arc::new(DedupLedger::open(config.paths.hash_log_path()).await?);

        let detector = CompletionDetector::new(config.completion.rounds, config.completion.interval());
        let filter = FileFilter::new(
            &config.upload.video_extension,
            config.min_file_size_bytes(),
            config.max_file_size_bytes(),
        );
        let batch = BatchOrchestrator::new(queue.clone(), ledger.clone(), detector, filter);

        queue.start();
        info!(
            workers = config.upload.max_concurrent,
            ledger = ledger.len().await,
            "uploader ready"
        );

        Ok(Self {
            config,
            channels,
            queue,
            ledger,
            batch,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub fn queue(&self) -> &Arc<UploadQueue> {
        &self.queue
    }

    pub fn ledger(&self) -> &Arc<DedupLedger> {
        &self.ledger
    }

    /// Fingerprints `path` and queues it for `channel` (the active channel
    /// when `None`).
    pub async fn add_upload(&self, path: &Path, channel: Option<&str>) -> Result<UploadItem> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| UploadError::file_op(path, "stat", e))?;
        if !meta.is_file() {
            return Err(UploadError::validation("path", format!("{} is not a file", path.display())));
        }

        let fingerprint = fingerprint_file(path).await?;
        let item = UploadItem::new(path.to_path_buf(), meta.len(), fingerprint, channel.map(str::to_string));
        Ok(self.queue.add(item))
    }

    pub fn pause(&self, id: &UploadId) -> bool {
        self.queue.pause(id)
    }

    pub fn resume(&self, id: &UploadId) -> bool {
        self.queue.resume(id)
    }

    pub fn cancel(&self, id: &UploadId) -> bool {
        self.queue.cancel(id)
    }

    pub fn pause_all(&self) -> usize {
        self.queue.pause_all()
    }

    pub fn resume_all(&self) -> usize {
        self.queue.resume_all()
    }

    pub fn cancel_all(&self) -> usize {
        self.queue.cancel_all()
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        self.queue.get_queue_status()
    }

    pub fn get_item(&self, id: &UploadId) -> Option<UploadItem> {
        self.queue.get_item(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&UploadItem) + Send + Sync + 'static,
    {
        self.queue.on_progress(callback);
    }

    pub fn on_status_change<F>(&self, callback: F)
    where
        F: Fn(&UploadItem, UploadStatus) + Send + Sync + 'static,
    {
        self.queue.on_status_change(callback);
    }

    pub fn on_complete<F>(&self, callback: F)
    where
        F: Fn(&UploadItem) + Send + Sync + 'static,
    {
        self.queue.on_complete(callback);
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&UploadItem, ErrorKind, &str) + Send + Sync + 'static,
    {
        self.queue.on_error(callback);
    }

    pub async fn discover_channels(&self) -> Result<Vec<Channel>> {
        self.channels.discover_channels().await
    }

    pub async fn set_active_channel(&self, channel_id: &str) -> Result<()> {
        self.channels.set_active_channel(channel_id).await
    }

    pub async fn logout(&self) -> Result<()> {
        self.channels.logout().await
    }

    /// Uploads every eligible file in `folder`. `policy` defaults to the
    /// configured disposition.
    pub async fn run_batch(
        &self,
        folder: &Path,
        channel: Option<&str>,
        policy: Option<DispositionPolicy>,
    ) -> Result<BatchSummary> {
        let policy = policy.unwrap_or_else(|| self.config.disposition_policy());
        self.batch.run(folder, channel, &policy).await
    }

    pub async fn wait_until_idle(&self) {
        self.queue.wait_until_idle().await;
    }

    /// Cancels whatever is still queued and stops the workers.
    pub async fn shutdown(&self) {
        self.queue.stop().await;
        info!(status = ?self.queue.get_queue_status(), "uploader shut down");
    }
}
