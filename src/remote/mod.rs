mod http;
mod types;

pub use http::HttpUploadService;
pub use types::{ChunkOutcome, SessionHandle, VideoMetadata};
