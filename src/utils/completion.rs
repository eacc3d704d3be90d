use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Size-stability poll deciding whether a file is still being written.
///
/// This is a heuristic, not a lock. A writer that pauses for longer than
/// `rounds * interval` and then appends again is not detected, so a file
/// reported complete may still change afterwards. An incomplete verdict only
/// means "try again on a later run".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionDetector {
    rounds: u32,
    interval: Duration,
}

impl CompletionDetector {
    pub fn new(rounds: u32, interval: Duration) -> Self {
        Self {
            rounds: rounds.max(1),
            interval,
        }
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Polls the size of `path` on disk.
    pub async fn is_complete(&self, path: &Path) -> bool {
        let complete = self
            .is_complete_with(|| async move {
                match tokio::fs::metadata(path).await {
                    Ok(meta) if meta.is_file() => Some(meta.len()),
                    _ => None,
                }
            })
            .await;

        if !complete {
            debug!(file = %path.display(), rounds = self.rounds, "file still changing or missing");
        }
        complete
    }

    /// Runs the poll against an arbitrary size source; `None` means the file
    /// does not exist.
    ///
    /// Complete only when every round observed the same size, the last round
    /// included.
    pub async fn is_complete_with<F, Fut>(&self, mut measure: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<u64>>,
    {
        let mut first = None;
        for round in 0..self.rounds {
            if round > 0 {
                sleep(self.interval).await;
            }

            let Some(size) = measure().await else {
                return false;
            };
            match first {
                None => first = Some(size),
                Some(expected) if expected != size => return false,
                Some(_) => {}
            }
        }
        true
    }
}

impl Default for CompletionDetector {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    async fn observe(sizes: &[Option<u64>]) -> bool {
        let queue = Mutex::new(sizes.iter().copied().collect::<VecDeque<_>>());
        CompletionDetector::new(sizes.len() as u32, Duration::from_secs(1))
            .is_complete_with(|| {
                let next = queue.lock().unwrap().pop_front().flatten();
                async move { next }
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn stable_size_is_complete() {
        assert!(observe(&[Some(100), Some(100), Some(100)]).await);
    }

    #[tokio::test(start_paused = true)]
    async fn growing_file_is_incomplete() {
        assert!(!observe(&[Some(100), Some(150), Some(150)]).await);
        assert!(!observe(&[Some(100), Some(100), Some(150)]).await);
    }

    #[tokio::test(start_paused = true)]
    async fn disappearing_file_is_incomplete() {
        assert!(!observe(&[Some(100), Some(100), None]).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_between_rounds_only() {
        let start = tokio::time::Instant::now();
        assert!(observe(&[Some(7), Some(7), Some(7)]).await);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn settled_file_on_disk_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, vec![0u8; 1024]).unwrap();

        let detector = CompletionDetector::new(2, Duration::from_millis(10));
        assert!(detector.is_complete(&path).await);
        assert!(!detector.is_complete(&dir.path().join("missing.mp4")).await);
    }
}
