use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, trace};
use url::Url;
use crate::channel::{Channel, Credential};
use crate::config::ApiConfig;
use crate::core::{RemoteFailure, RemoteObjectId, RemoteUploadService};
use super::types::{ChunkOutcome, SessionHandle, VideoMetadata};

const UPLOAD_PATH: &str = "upload/videos";
const CHANNELS_PATH: &str = "channels";
/// "Resume Incomplete"
const STATUS_RESUME_INCOMPLETE: u16 = 308;

/// Remote upload service speaking a resumable HTTP upload protocol.
///
/// `POST {endpoint}/upload/videos?uploadType=resumable` opens a session whose
/// URL comes back in `Location`; chunks are `PUT` there with `Content-Range`.
/// `308` acknowledges a chunk (committed range in `Range`), `200`/`201`
/// finishes the upload with the created resource as JSON.
#[derive(Debug, Clone)]
pub struct HttpUploadService {
    client: Client,
    endpoint: String,
}

impl HttpUploadService {
    /// Every request, chunk uploads included, is bounded by `request_timeout`.
    pub fn new(endpoint: &str, request_timeout: Duration, connect_timeout: Duration) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self::with_client(client, endpoint))
    }

    pub fn from_config(api: &ApiConfig) -> crate::Result<Self> {
        Self::new(&api.endpoint, api.request_timeout(), api.connect_timeout())
    }

    pub fn with_client(client: Client, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }

    fn auth_headers(credential: &Credential) -> Result<HeaderMap, RemoteFailure> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.access_token))
            .map_err(|e| RemoteFailure::new(400, format!("invalid access token header: {}", e)))?;
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }

    /// Parses `Range: bytes=0-N` into the committed byte count `N + 1`.
    pub(crate) fn parse_range_header(headers: &HeaderMap) -> Option<u64> {
        let value = headers.get(RANGE)?.to_str().ok()?;
        let end = value.trim().strip_prefix("bytes=")?.split('-').nth(1)?;
        end.trim().parse::<u64>().ok().map(|last| last + 1)
    }

    /// Resolves a possibly relative `Location` against the endpoint origin.
    fn resolve_location(&self, location: &str) -> Result<String, RemoteFailure> {
        if location.starts_with("http") {
            return Ok(location.to_string());
        }

        let url = Url::parse(&self.endpoint)
            .map_err(|_| RemoteFailure::new(400, format!("invalid endpoint url: {}", self.endpoint)))?;
        let origin = url.origin().ascii_serialization();
        Ok(format!("{}{}", origin, location))
    }

    /// Pulls the most specific reason out of an error response body.
    pub(crate) fn error_reason(body: &str) -> Option<String> {
        let value: Value = serde_json::from_str(body).ok()?;
        let error = value.get("error")?;
        error
            .pointer("/errors/0/reason")
            .and_then(Value::as_str)
            .or_else(|| error.get("message").and_then(Value::as_str))
            .map(str::to_string)
    }

    async fn failure_from(response: Response, context: &str) -> RemoteFailure {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let reason = Self::error_reason(&body).unwrap_or_else(|| context.to_string());
        RemoteFailure::new(status, reason)
    }

    fn connection_failure(err: reqwest::Error) -> RemoteFailure {
        match err.status() {
            Some(status) => RemoteFailure::new(status.as_u16(), err.to_string()),
            None => RemoteFailure::connection(err.to_string()),
        }
    }

    fn count(value: &Value, pointer: &str) -> u64 {
        match value.pointer(pointer) {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    fn text(value: &Value, pointer: &str) -> String {
        value.pointer(pointer).and_then(Value::as_str).unwrap_or_default().to_string()
    }

    pub(crate) fn parse_channels(body: &Value) -> Vec<Channel> {
        let Some(items) = body.get("items").and_then(Value::as_array) else {
            return Vec::new();
        };

        items
            .iter()
            .filter_map(|item| {
                let id = item.get("id")?.as_str()?;
                let mut channel = Channel::new(id, Self::text(item, "/snippet/title"));
                channel.description = Self::text(item, "/snippet/description");
                channel.custom_url = Self::text(item, "/snippet/customUrl");
                channel.thumbnail_url = Self::text(item, "/snippet/thumbnails/default/url");
                channel.subscriber_count = Self::count(item, "/statistics/subscriberCount");
                channel.video_count = Self::count(item, "/statistics/videoCount");
                channel.view_count = Self::count(item, "/statistics/viewCount");
                Some(channel)
            })
            .collect()
    }
}

#[async_trait]
impl RemoteUploadService for HttpUploadService {
    async fn initiate_session(
        &self,
        credential: &Credential,
        metadata: &VideoMetadata,
        total_bytes: u64,
    ) -> Result<SessionHandle, RemoteFailure> {
        let mut headers = Self::auth_headers(credential)?;
        headers.insert("X-Upload-Content-Length", HeaderValue::from(total_bytes));
        headers.insert("X-Upload-Content-Type", HeaderValue::from_static("video/*"));

        let body = json!({
            "snippet": {
                "title": metadata.title,
                "description": metadata.description,
                "categoryId": metadata.category_id,
                "tags": metadata.tags,
            },
            "status": { "privacyStatus": metadata.privacy_status },
        });

        let response = self
            .client
            .post(self.url(UPLOAD_PATH))
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(Self::connection_failure)?;

        if !response.status().is_success() {
            return Err(Self::failure_from(response, "failed to initiate upload session").await);
        }

        let location = match response.headers().get(LOCATION) {
            Some(location) => location
                .to_str()
                .map_err(|e| RemoteFailure::new(502, format!("unreadable Location header: {}", e)))?
                .to_string(),
            None => {
                return Err(RemoteFailure::new(
                    response.status().as_u16(),
                    "no 'Location' header in response",
                ));
            }
        };

        let location = self.resolve_location(&location)?;
        debug!(location = %location, "upload session created");
        Ok(SessionHandle::new(location))
    }

    async fn send_chunk(
        &self,
        credential: &Credential,
        session: &SessionHandle,
        offset: u64,
        total_bytes: u64,
        chunk: Bytes,
    ) -> Result<ChunkOutcome, RemoteFailure> {
        let mut headers = Self::auth_headers(credential)?;
        let range = if chunk.is_empty() {
            format!("bytes */{}", total_bytes)
        } else {
            format!("bytes {}-{}/{}", offset, offset + chunk.len() as u64 - 1, total_bytes)
        };
        headers.insert(
            CONTENT_RANGE,
            HeaderValue::from_str(&range).map_err(|e| RemoteFailure::new(400, e.to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));

        let response = self
            .client
            .put(&session.location)
            .headers(headers)
            .body(chunk)
            .send()
            .await
            .map_err(Self::connection_failure)?;

        let status = response.status();
        trace!(status = status.as_u16(), range = %range, "chunk response");

        if status.as_u16() == STATUS_RESUME_INCOMPLETE {
            let committed = Self::parse_range_header(response.headers()).unwrap_or(0);
            return Ok(ChunkOutcome::Progress { committed });
        }

        if status == StatusCode::OK || status == StatusCode::CREATED {
            let body: Value = response.json().await.map_err(Self::connection_failure)?;
            let id = body
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| RemoteFailure::new(status.as_u16(), "no 'id' in completed upload response"))?;
            return Ok(ChunkOutcome::Completed(RemoteObjectId(id.to_string())));
        }

        Err(Self::failure_from(response, "failed to upload chunk").await)
    }

    async fn list_channels(&self, credential: &Credential) -> Result<Vec<Channel>, RemoteFailure> {
        let response = self
            .client
            .get(self.url(CHANNELS_PATH))
            .query(&[("part", "snippet,statistics"), ("mine", "true")])
            .headers(Self::auth_headers(credential)?)
            .send()
            .await
            .map_err(Self::connection_failure)?;

        if !response.status().is_success() {
            return Err(Self::failure_from(response, "failed to list channels").await);
        }

        let body: Value = response.json().await.map_err(Self::connection_failure)?;
        Ok(Self::parse_channels(&body))
    }
}
