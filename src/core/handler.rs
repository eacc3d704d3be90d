use std::sync::Arc;
use async_trait::async_trait;
use tracing::{debug, info};
use crate::channel::ChannelManager;
use crate::remote::VideoMetadata;
use crate::uploaders::ResumableUploader;
use crate::utils::retry::{Retrier, RetryPolicy};
use super::errors::Result;
use super::queue::UploadContext;
use super::traits::UploadHandler;
use super::types::{RemoteObjectId, UploadItem};

/// Queue handler uploading an item to its channel.
///
/// Resolves the channel transport, renders metadata from the channel's
/// settings and runs the resumable driver under the upload retry policy.
/// Each retry is recorded on the item.
pub struct ChannelUploadHandler {
    channels: Arc<ChannelManager>,
    uploader: ResumableUploader,
    retry: RetryPolicy,
}

impl ChannelUploadHandler {
    pub fn new(channels: Arc<ChannelManager>, uploader: ResumableUploader) -> Self {
        Self {
            channels,
            uploader,
            retry: RetryPolicy::upload(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl UploadHandler for ChannelUploadHandler {
    async fn upload(&self, item: UploadItem, ctx: UploadContext) -> Result<RemoteObjectId> {
        let transport = self.channels.get_transport(item.channel_id.as_deref()).await?;
        let settings = self.channels.channel_settings(&transport.channel_id);
        let metadata = VideoMetadata::from_settings(&settings, &item.file_path);
        debug!(item = %item.id, channel = %transport.channel_id, title = %metadata.title, "starting transfer");

        let retry_ctx = ctx.clone();
        let retrier = Retrier::new(self.retry.clone())
            .name(format!("upload {}", item.file_name))
            .cancel_token(ctx.cancel_token().clone())
            .on_retry(move |_attempt, err| {
                retry_ctx.record_retry(err);
                Ok(())
            });

        let progress = |sent: u64, _total: u64| ctx.report_progress(sent);
        let remote_id = retrier
            .run(|| {
                self.uploader
                    .upload(&transport, &item.file_path, &metadata, &progress, ctx.cancel_token())
            })
            .await?;

        // Playlist membership is managed outside the upload session.
        if let Some(playlist) = &metadata.playlist_id {
            info!(item = %item.id, remote_id = %remote_id, playlist = %playlist, "video destined for playlist");
        }
        Ok(remote_id)
    }
}
