//! Batch uploader for recorded video clips.
//!
//! Files from a capture folder go through a completion check and content
//! dedup, then a bounded worker pool uploads them over a resumable protocol
//! to one of several authorized channels.

pub mod channel;
pub mod config;
pub mod core;
pub mod logging;
pub mod remote;
pub mod uploaders;
pub mod utils;

// 重新导出核心类型
pub use crate::config::AppConfig;
pub use crate::core::{
    BatchSummary,
    DispositionPolicy,
    ErrorKind,
    QueueStatus,
    Result,
    UploadError,
    UploadId,
    UploadItem,
    UploadQueue,
    UploadStatus,
    Uploader,
};
