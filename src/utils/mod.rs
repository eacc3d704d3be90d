pub mod atomic;
pub mod completion;
pub mod fingerprint;
pub mod progress;
pub mod retry;

pub use atomic::write_atomic;
pub use completion::CompletionDetector;
pub use fingerprint::fingerprint_file;
pub use progress::{format_bytes, format_duration, format_speed, mb_to_bytes, percent};
pub use retry::{retry_with_policy, Retrier, RetryPolicy};
