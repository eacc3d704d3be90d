mod batch;
mod errors;
mod facade;
mod handler;
mod ledger;
mod queue;
mod store;
mod traits;
mod types;
mod worker;

pub use batch::{BatchOrchestrator, BatchOutcome, BatchSummary, DispositionPolicy, FileFilter, FileOutcome, SkipReason};
pub use errors::{ErrorKind, RemoteFailure, Result, UploadError};
pub use facade::Uploader;
pub use handler::ChannelUploadHandler;
pub use ledger::DedupLedger;
pub use queue::{
    CompleteCallback,
    ErrorCallback,
    ProgressCallback,
    StatusCallback,
    UploadContext,
    UploadQueue,
};
pub use traits::{Authorizer, RemoteUploadService, UploadHandler};
pub use types::{
    QueueEvent,
    QueueSnapshot,
    QueueStatus,
    RemoteObjectId,
    UploadId,
    UploadItem,
    UploadStatus,
    QUEUE_SNAPSHOT_VERSION,
};
