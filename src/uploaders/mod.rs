pub mod resumable;

pub use resumable::{ProgressSink, ResumableUploader, DEFAULT_CHUNK_SIZE};
