use async_trait::async_trait;
use bytes::Bytes;
use crate::channel::{Channel, Credential};
use crate::remote::{ChunkOutcome, SessionHandle, VideoMetadata};
use super::errors::{RemoteFailure, Result};
use super::queue::UploadContext;
use super::types::{RemoteObjectId, UploadItem};

/// Remote upload service capability - the only surface the core needs from
/// the video host.
///
/// Implementations report raw failures; classification into the error
/// taxonomy happens in the driver via [`crate::UploadError::from_remote`].
#[async_trait]
pub trait RemoteUploadService: Send + Sync {
    /// Opens a resumable session for `total_bytes` of content.
    async fn initiate_session(
        &self,
        credential: &Credential,
        metadata: &VideoMetadata,
        total_bytes: u64,
    ) -> Result<SessionHandle, RemoteFailure>;

    /// Sends the chunk starting at `offset`.
    async fn send_chunk(
        &self,
        credential: &Credential,
        session: &SessionHandle,
        offset: u64,
        total_bytes: u64,
        chunk: Bytes,
    ) -> Result<ChunkOutcome, RemoteFailure>;

    /// Lists the channels reachable with `credential`.
    async fn list_channels(&self, credential: &Credential) -> Result<Vec<Channel>, RemoteFailure>;
}

/// Interactive authorization capability.
///
/// `authorize` may block on out-of-process user interaction; the credential
/// manager only calls it when nothing cached or refreshable exists.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, scopes: &[String]) -> Result<Credential>;

    /// Exchanges a refresh token for a fresh credential.
    async fn refresh(&self, credential: &Credential) -> Result<Credential>;
}

/// Work executed by queue workers for every claimed item.
#[async_trait]
pub trait UploadHandler: Send + Sync {
    async fn upload(&self, item: UploadItem, ctx: UploadContext) -> Result<RemoteObjectId>;
}
