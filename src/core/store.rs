use std::collections::{HashMap, HashSet};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use super::errors::{ErrorKind, Result, UploadError};
use super::types::{
    QueueSnapshot, QueueStatus, RemoteObjectId, UploadId, UploadItem, UploadStatus, QUEUE_SNAPSHOT_VERSION,
};

/// Outcome of applying a worker's result to the store.
#[derive(Debug)]
pub(crate) enum Settled {
    Completed { item: UploadItem, from: UploadStatus },
    Failed { item: UploadItem, kind: ErrorKind, error: String },
    Cancelled { item: UploadItem },
    /// Result of an attempt interrupted by `pause`; the item stays paused, or
    /// pending if it was resumed meanwhile
    Interrupted,
    /// Item already reached a terminal state through `cancel`
    AlreadyTerminal { item: UploadItem },
    Unknown,
}

/// 队列状态存储
///
/// Active items stay in queue order; terminal items move to `history`. All
/// access goes through the queue's single lock.
#[derive(Default)]
pub(crate) struct QueueStore {
    items: Vec<UploadItem>,
    history: Vec<UploadItem>,
    tokens: HashMap<UploadId, CancellationToken>,
    /// Items whose handler has not returned yet
    in_flight: HashSet<UploadId>,
    total_added: usize,
    dispatch_paused: bool,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, item: UploadItem) {
        self.total_added += 1;
        self.items.push(item);
    }

    pub fn get(&self, id: &UploadId) -> Option<&UploadItem> {
        self.items
            .iter()
            .find(|item| item.id == *id)
            .or_else(|| self.history.iter().find(|item| item.id == *id))
    }

    fn position(&self, id: &UploadId) -> Option<usize> {
        self.items.iter().position(|item| item.id == *id)
    }

    pub fn items(&self) -> &[UploadItem] {
        &self.items
    }

    pub fn history(&self) -> &[UploadItem] {
        &self.history
    }

    pub fn by_fingerprint(&self, fingerprint: &str) -> Option<&UploadItem> {
        self.items
            .iter()
            .chain(self.history.iter())
            .find(|item| item.fingerprint() == fingerprint)
    }

    pub fn dispatch_paused(&self) -> bool {
        self.dispatch_paused
    }

    pub fn set_dispatch_paused(&mut self, paused: bool) {
        self.dispatch_paused = paused;
    }

    pub fn is_idle(&self) -> bool {
        !self
            .items
            .iter()
            .any(|item| matches!(item.status, UploadStatus::Pending | UploadStatus::Uploading))
    }

    /// Flips the first pending item to uploading and hands it out together
    /// with a cancellation token derived from `parent`.
    pub fn claim_next(&mut self, parent: &CancellationToken) -> Option<(UploadItem, CancellationToken)> {
        if self.dispatch_paused {
            return None;
        }

        // A resumed item is not handed out again until its previous attempt returned.
        let in_flight = &self.in_flight;
        let item = self
            .items
            .iter_mut()
            .find(|item| item.status == UploadStatus::Pending && !in_flight.contains(&item.id))?;
        if !item.transition(UploadStatus::Uploading) {
            return None;
        }

        let token = parent.child_token();
        self.tokens.insert(item.id, token.clone());
        self.in_flight.insert(item.id);
        Some((item.clone(), token))
    }

    /// Applies a legal transition to an active item. Terminal items move to
    /// history and lose their token; pausing or cancelling trips the token.
    pub fn transition(&mut self, id: &UploadId, next: UploadStatus) -> Option<(UploadItem, UploadStatus)> {
        let index = self.position(id)?;
        let from = self.items[index].status;
        if !self.items[index].transition(next) {
            return None;
        }

        if matches!(next, UploadStatus::Paused | UploadStatus::Cancelled) {
            if let Some(token) = self.tokens.remove(id) {
                token.cancel();
            }
        }

        let snapshot = self.items[index].clone();
        if next.is_terminal() {
            self.tokens.remove(id);
            let item = self.items.remove(index);
            self.history.push(item);
        }
        Some((snapshot, from))
    }

    pub fn ids_with_status(&self, status: UploadStatus) -> Vec<UploadId> {
        self.items
            .iter()
            .filter(|item| item.status == status)
            .map(|item| item.id)
            .collect()
    }

    pub fn record_progress(&mut self, id: &UploadId, bytes: u64) -> Option<UploadItem> {
        let index = self.position(id)?;
        let item = &mut self.items[index];
        if item.status != UploadStatus::Uploading {
            return None;
        }
        item.record_progress(bytes);
        Some(item.clone())
    }

    pub fn record_retry(&mut self, id: &UploadId, error: &UploadError) -> Option<UploadItem> {
        let index = self.position(id)?;
        let item = &mut self.items[index];
        item.retry_count += 1;
        item.error_message = Some(error.to_string());
        item.error_kind = Some(error.kind());
        Some(item.clone())
    }

    /// Applies the handler's result for an item a worker was processing.
    pub fn settle(&mut self, id: &UploadId, result: Result<RemoteObjectId>) -> Settled {
        self.in_flight.remove(id);
        let Some(index) = self.position(id) else {
            return match self.history.iter_mut().find(|item| item.id == *id) {
                Some(item) => {
                    if let Ok(remote_id) = result {
                        item.remote_id = Some(remote_id);
                    }
                    Settled::AlreadyTerminal { item: item.clone() }
                }
                None => Settled::Unknown,
            };
        };

        self.tokens.remove(id);
        let from = self.items[index].status;
        match (from, result) {
            (UploadStatus::Uploading | UploadStatus::Paused | UploadStatus::Pending, Ok(remote_id)) => {
                let item = &mut self.items[index];
                // A transfer that finished before the pause landed still counts.
                item.status = UploadStatus::Uploading;
                item.remote_id = Some(remote_id);
                item.error_message = None;
                item.error_kind = None;
                item.transition(UploadStatus::Completed);
                let item = self.items.remove(index);
                self.history.push(item.clone());
                Settled::Completed { item, from }
            }
            (UploadStatus::Paused | UploadStatus::Pending, Err(_)) => Settled::Interrupted,
            (UploadStatus::Uploading, Err(UploadError::Cancelled)) => {
                self.items[index].transition(UploadStatus::Cancelled);
                let item = self.items.remove(index);
                self.history.push(item.clone());
                Settled::Cancelled { item }
            }
            (UploadStatus::Uploading, Err(err)) => {
                let kind = err.kind();
                let error = err.to_string();
                let item = &mut self.items[index];
                item.error_message = Some(error.clone());
                item.error_kind = Some(kind);
                item.transition(UploadStatus::Failed);
                let item = self.items.remove(index);
                self.history.push(item.clone());
                Settled::Failed { item, kind, error }
            }
            _ => Settled::Unknown,
        }
    }

    /// Removes a pending item from the queue without recording it.
    pub fn remove_pending(&mut self, id: &UploadId) -> Option<UploadItem> {
        let index = self.position(id)?;
        if self.items[index].status != UploadStatus::Pending {
            return None;
        }
        Some(self.items.remove(index))
    }

    /// Moves an active item to `new_index` (clamped to the queue length).
    pub fn move_item(&mut self, id: &UploadId, new_index: usize) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        let item = self.items.remove(index);
        let new_index = new_index.min(self.items.len());
        self.items.insert(new_index, item);
        true
    }

    pub fn clear_history(&mut self, status: UploadStatus) -> usize {
        let before = self.history.len();
        self.history.retain(|item| item.status != status);
        before - self.history.len()
    }

    pub fn status(&self) -> QueueStatus {
        let mut status = QueueStatus {
            total: self.total_added,
            queue_length: self.items.len(),
            ..Default::default()
        };
        for item in self.items.iter().chain(self.history.iter()) {
            match item.status {
                UploadStatus::Pending => status.pending += 1,
                UploadStatus::Uploading => status.uploading += 1,
                UploadStatus::Paused => status.paused += 1,
                UploadStatus::Completed => status.completed += 1,
                UploadStatus::Failed => status.failed += 1,
                UploadStatus::Cancelled => status.cancelled += 1,
            }
        }
        status
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            version: QUEUE_SNAPSHOT_VERSION,
            items: self.items.iter().chain(self.history.iter()).cloned().collect(),
        }
    }

    /// Replaces the store's contents with a snapshot. Interrupted uploads come
    /// back as pending.
    pub fn restore(&mut self, snapshot: QueueSnapshot) -> Result<usize> {
        if snapshot.version > QUEUE_SNAPSHOT_VERSION {
            return Err(UploadError::validation(
                "version",
                format!("queue snapshot version {} is newer than supported {}", snapshot.version, QUEUE_SNAPSHOT_VERSION),
            ));
        }
        if self.items.iter().any(|item| item.status == UploadStatus::Uploading) {
            return Err(UploadError::validation("queue", "cannot import while uploads are running"));
        }

        self.items.clear();
        self.history.clear();
        self.tokens.clear();
        self.total_added = snapshot.items.len();

        for mut item in snapshot.items {
            match item.status {
                UploadStatus::Uploading | UploadStatus::Pending => {
                    item.status = UploadStatus::Pending;
                    item.progress = 0.0;
                    item.bytes_transferred = 0;
                    item.ended_at = None;
                    self.items.push(item);
                }
                UploadStatus::Paused => {
                    item.ended_at = None;
                    self.items.push(item);
                }
                _ => {
                    item.ended_at.get_or_insert_with(Utc::now);
                    self.history.push(item);
                }
            }
        }
        Ok(self.total_added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn item(name: &str) -> UploadItem {
        UploadItem::new(PathBuf::from(format!("/clips/{}", name)), 100, format!("hash-{}", name), None)
    }

    #[test]
    fn claim_takes_first_pending_in_order() {
        let mut store = QueueStore::new();
        let a = item("a");
        let b = item("b");
        let (a_id, b_id) = (a.id, b.id);
        store.add(a);
        store.add(b);

        let parent = CancellationToken::new();
        let (claimed, _) = store.claim_next(&parent).unwrap();
        assert_eq!(claimed.id, a_id);
        assert_eq!(claimed.status, UploadStatus::Uploading);
        assert!(claimed.started_at.is_some());

        let (claimed, _) = store.claim_next(&parent).unwrap();
        assert_eq!(claimed.id, b_id);
        assert!(store.claim_next(&parent).is_none());
    }

    #[test]
    fn dispatch_pause_blocks_claims() {
        let mut store = QueueStore::new();
        store.add(item("a"));
        store.set_dispatch_paused(true);
        assert!(store.claim_next(&CancellationToken::new()).is_none());
        store.set_dispatch_paused(false);
        assert!(store.claim_next(&CancellationToken::new()).is_some());
    }

    #[test]
    fn pause_trips_the_item_token() {
        let mut store = QueueStore::new();
        let a = item("a");
        let id = a.id;
        store.add(a);
        let (_, token) = store.claim_next(&CancellationToken::new()).unwrap();

        let (paused, from) = store.transition(&id, UploadStatus::Paused).unwrap();
        assert_eq!(from, UploadStatus::Uploading);
        assert_eq!(paused.status, UploadStatus::Paused);
        assert!(token.is_cancelled());
    }

    #[test]
    fn illegal_transition_leaves_item_untouched() {
        let mut store = QueueStore::new();
        let a = item("a");
        let id = a.id;
        store.add(a);

        assert!(store.transition(&id, UploadStatus::Paused).is_none());
        assert!(store.transition(&id, UploadStatus::Completed).is_none());
        assert_eq!(store.get(&id).unwrap().status, UploadStatus::Pending);
    }

    #[test]
    fn success_wins_over_racing_pause() {
        let mut store = QueueStore::new();
        let a = item("a");
        let id = a.id;
        store.add(a);
        store.claim_next(&CancellationToken::new()).unwrap();
        store.transition(&id, UploadStatus::Paused).unwrap();

        match store.settle(&id, Ok(RemoteObjectId("v1".into()))) {
            Settled::Completed { item, from } => {
                assert_eq!(from, UploadStatus::Paused);
                assert_eq!(item.status, UploadStatus::Completed);
                assert_eq!(item.progress, 100.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.status().completed, 1);
    }

    #[test]
    fn resumed_item_waits_for_its_previous_attempt() {
        let mut store = QueueStore::new();
        let a = item("a");
        let id = a.id;
        store.add(a);
        let parent = CancellationToken::new();
        store.claim_next(&parent).unwrap();
        store.transition(&id, UploadStatus::Paused).unwrap();
        store.transition(&id, UploadStatus::Pending).unwrap();

        // The interrupted handler has not returned yet
        assert!(store.claim_next(&parent).is_none());

        assert!(matches!(store.settle(&id, Err(UploadError::Cancelled)), Settled::Interrupted));
        assert_eq!(store.get(&id).unwrap().status, UploadStatus::Pending);
        let (again, _) = store.claim_next(&parent).unwrap();
        assert_eq!(again.id, id);
    }

    #[test]
    fn late_success_after_cancel_stays_cancelled() {
        let mut store = QueueStore::new();
        let a = item("a");
        let id = a.id;
        store.add(a);
        store.claim_next(&CancellationToken::new()).unwrap();
        store.transition(&id, UploadStatus::Cancelled).unwrap();

        match store.settle(&id, Ok(RemoteObjectId("v1".into()))) {
            Settled::AlreadyTerminal { item } => {
                assert_eq!(item.status, UploadStatus::Cancelled);
                assert_eq!(item.remote_id, Some(RemoteObjectId("v1".into())));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn failure_records_kind_and_moves_to_history() {
        let mut store = QueueStore::new();
        let a = item("a");
        let id = a.id;
        store.add(a);
        store.claim_next(&CancellationToken::new()).unwrap();

        let settled = store.settle(&id, Err(UploadError::PermanentRequest("invalidTitle".into())));
        assert!(matches!(settled, Settled::Failed { kind: ErrorKind::PermanentRequest, .. }));
        assert!(store.items().is_empty());
        let failed = &store.history()[0];
        assert_eq!(failed.error_kind, Some(ErrorKind::PermanentRequest));
        assert!(failed.ended_at.is_some());
    }

    #[test]
    fn snapshot_restore_requeues_interrupted_uploads() {
        let mut store = QueueStore::new();
        let a = item("a");
        let b = item("b");
        let b_id = b.id;
        store.add(a);
        store.add(b);
        store.claim_next(&CancellationToken::new()).unwrap();
        store.transition(&b_id, UploadStatus::Cancelled).unwrap();

        let mut snapshot = store.snapshot();
        assert_eq!(snapshot.version, QUEUE_SNAPSHOT_VERSION);
        snapshot.items[0].bytes_transferred = 50;

        let mut restored = QueueStore::new();
        assert_eq!(restored.restore(snapshot).unwrap(), 2);
        let status = restored.status();
        assert_eq!(status.pending, 1);
        assert_eq!(status.cancelled, 1);
        assert_eq!(restored.items()[0].bytes_transferred, 0);

        let future = QueueSnapshot { version: QUEUE_SNAPSHOT_VERSION + 1, items: vec![] };
        assert!(restored.restore(future).is_err());
    }

    #[test]
    fn reorder_and_remove_pending() {
        let mut store = QueueStore::new();
        let (a, b, c) = (item("a"), item("b"), item("c"));
        let (a_id, c_id) = (a.id, c.id);
        store.add(a);
        store.add(b);
        store.add(c);

        assert!(store.move_item(&c_id, 0));
        assert_eq!(store.items()[0].id, c_id);
        assert!(store.remove_pending(&a_id).is_some());
        assert_eq!(store.items().len(), 2);
        assert_eq!(store.by_fingerprint("hash-b").map(|i| i.file_name.as_str()), Some("b"));
    }
}
