use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use super::errors::{ErrorKind, Result, UploadError};
use super::store::{QueueStore, Settled};
use super::traits::UploadHandler;
use super::types::{QueueEvent, QueueSnapshot, QueueStatus, RemoteObjectId, UploadId, UploadItem, UploadStatus};
use super::worker::{run_dispatcher, run_worker};

/// Capacity of the `subscribe` broadcast channel. Slow subscribers lag;
/// registered callbacks are fed separately and never miss an event.
const EVENT_CAPACITY: usize = 1024;

/// Upper bound on how long an idle worker waits before rescanning.
pub(crate) const IDLE_POLL: Duration = Duration::from_millis(500);

pub type ProgressCallback = Arc<dyn Fn(&UploadItem) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(&UploadItem, UploadStatus) + Send + Sync>;
pub type CompleteCallback = Arc<dyn Fn(&UploadItem) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&UploadItem, ErrorKind, &str) + Send + Sync>;

#[derive(Default, Clone)]
pub(crate) struct Callbacks {
    pub progress: Vec<ProgressCallback>,
    pub status: Vec<StatusCallback>,
    pub complete: Vec<CompleteCallback>,
    pub error: Vec<ErrorCallback>,
}

impl Callbacks {
    /// Whether any registered callback listens for `event`.
    pub fn wants(&self, event: &QueueEvent) -> bool {
        match event {
            QueueEvent::Added(_) => false,
            QueueEvent::Progress(_) => !self.progress.is_empty(),
            QueueEvent::StatusChanged { .. } => !self.status.is_empty(),
            QueueEvent::Completed(_) => !self.complete.is_empty(),
            QueueEvent::Failed { .. } => !self.error.is_empty(),
        }
    }
}

/// Work for the callback dispatcher.
pub(crate) enum CallbackEvent {
    /// Latest progress for the item is waiting in `QueueShared::latest_progress`
    Progress(UploadId),
    Queue(QueueEvent),
}

/// State shared between the queue handle, its workers and upload contexts.
pub(crate) struct QueueShared {
    store: Mutex<QueueStore>,
    events: broadcast::Sender<QueueEvent>,
    callback_tx: mpsc::UnboundedSender<CallbackEvent>,
    /// Held by the running dispatcher
    pub callback_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<CallbackEvent>>,
    /// Progress coalesced per item until the dispatcher picks it up
    latest_progress: Mutex<HashMap<UploadId, UploadItem>>,
    /// Signalled when new pending work may be available
    pub work_available: Notify,
    /// Signalled after every status change
    changed: Notify,
    pub callbacks: RwLock<Callbacks>,
}

impl QueueShared {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        Self {
            store: Mutex::new(QueueStore::new()),
            events,
            callback_tx,
            callback_rx: tokio::sync::Mutex::new(callback_rx),
            latest_progress: Mutex::new(HashMap::new()),
            work_available: Notify::new(),
            changed: Notify::new(),
            callbacks: RwLock::new(Callbacks::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        if !matches!(event, QueueEvent::Added(_) | QueueEvent::Progress(_)) {
            // The receiver lives as long as `self`
            let _ = self.callback_tx.send(CallbackEvent::Queue(event.clone()));
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_progress(&self, item: UploadItem) {
        let first = self.latest_progress.lock().insert(item.id, item.clone()).is_none();
        if first {
            let _ = self.callback_tx.send(CallbackEvent::Progress(item.id));
        }
        let _ = self.events.send(QueueEvent::Progress(item));
    }

    pub fn take_progress(&self, id: &UploadId) -> Option<UploadItem> {
        self.latest_progress.lock().remove(id)
    }

    fn status_changed(&self, item: UploadItem, from: UploadStatus) {
        self.emit(QueueEvent::StatusChanged { item, from });
        self.changed.notify_waiters();
    }

    pub fn claim_next(&self, stop: &CancellationToken) -> Option<(UploadItem, CancellationToken)> {
        let mut store = self.store.lock();
        let (item, token) = store.claim_next(stop)?;
        debug!(item = %item.id, file = %item.file_name, "claimed upload");
        self.status_changed(item.clone(), UploadStatus::Pending);
        Some((item, token))
    }

    pub fn settle(&self, id: &UploadId, result: Result<RemoteObjectId>) {
        let mut store = self.store.lock();
        match store.settle(id, result) {
            Settled::Completed { item, from } => {
                info!(item = %id, file = %item.file_name, remote_id = ?item.remote_id, "upload completed");
                self.emit(QueueEvent::StatusChanged { item: item.clone(), from });
                self.emit(QueueEvent::Completed(item));
            }
            Settled::Failed { item, kind, error } => {
                warn!(item = %id, file = %item.file_name, kind = %kind, error = %error, "upload failed");
                self.emit(QueueEvent::StatusChanged { item: item.clone(), from: UploadStatus::Uploading });
                self.emit(QueueEvent::Failed { item, kind, error });
            }
            Settled::Cancelled { item } => {
                info!(item = %id, file = %item.file_name, "upload cancelled");
                self.emit(QueueEvent::StatusChanged { item, from: UploadStatus::Uploading });
            }
            Settled::Interrupted => {
                debug!(item = %id, "upload interrupted by pause");
                self.work_available.notify_waiters();
            }
            Settled::AlreadyTerminal { item } => {
                if let Some(remote_id) = &item.remote_id {
                    warn!(item = %id, remote_id = %remote_id, status = %item.status, "transfer finished after the item was cancelled");
                }
            }
            Settled::Unknown => {
                warn!(item = %id, "result for unknown upload discarded");
            }
        }
        drop(store);
        self.changed.notify_waiters();
    }

    fn record_progress(&self, id: &UploadId, bytes: u64) {
        let mut store = self.store.lock();
        if let Some(item) = store.record_progress(id, bytes) {
            self.emit_progress(item);
        }
    }

    fn record_retry(&self, id: &UploadId, error: &UploadError) {
        let mut store = self.store.lock();
        if let Some(item) = store.record_retry(id, error) {
            debug!(item = %id, retries = item.retry_count, "retry recorded");
        }
    }
}

/// Handle given to an [`UploadHandler`] for one claimed item.
#[derive(Clone)]
pub struct UploadContext {
    id: UploadId,
    cancel: CancellationToken,
    shared: Arc<QueueShared>,
}

impl UploadContext {
    pub(crate) fn new(id: UploadId, cancel: CancellationToken, shared: Arc<QueueShared>) -> Self {
        Self { id, cancel, shared }
    }

    pub fn id(&self) -> UploadId {
        self.id
    }

    /// Tripped on pause, cancel or queue stop.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn report_progress(&self, bytes_sent: u64) {
        self.shared.record_progress(&self.id, bytes_sent);
    }

    pub fn record_retry(&self, error: &UploadError) {
        self.shared.record_retry(&self.id, error);
    }
}

struct QueueRuntime {
    stop: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    /// Stops the dispatcher once the workers are gone
    dispatcher_stop: CancellationToken,
    dispatcher: JoinHandle<()>,
}

/// 上传队列
///
/// Pull-based pool: `start` spawns `max_concurrent` workers that each claim
/// the first pending item under the queue lock and run it through the
/// [`UploadHandler`] outside the lock. Callbacks are invoked from a separate
/// dispatcher task fed by an unbounded channel, never on the mutation path.
/// Progress is coalesced per item so a slow progress callback only sees
/// fewer updates.
pub struct UploadQueue {
    shared: Arc<QueueShared>,
    handler: Arc<dyn UploadHandler>,
    max_concurrent: usize,
    runtime: Mutex<Option<QueueRuntime>>,
}

impl UploadQueue {
    pub fn new(handler: Arc<dyn UploadHandler>, max_concurrent: usize) -> Self {
        Self {
            shared: Arc::new(QueueShared::new()),
            handler,
            max_concurrent: max_concurrent.max(1),
            runtime: Mutex::new(None),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Spawns the worker pool and the callback dispatcher. Calling it on a
    /// running queue does nothing.
    pub fn start(&self) {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return;
        }

        let stop = CancellationToken::new();
        let workers = (0..self.max_concurrent)
            .map(|index| {
                tokio::spawn(run_worker(index, self.shared.clone(), self.handler.clone(), stop.clone()))
            })
            .collect();

        let dispatcher_stop = CancellationToken::new();
        let dispatcher = tokio::spawn(run_dispatcher(self.shared.clone(), dispatcher_stop.clone()));

        info!(workers = self.max_concurrent, "upload queue started");
        *runtime = Some(QueueRuntime {
            stop,
            workers,
            dispatcher_stop,
            dispatcher,
        });
    }

    /// Cancels every non-terminal item and waits for the workers to exit.
    pub async fn stop(&self) {
        let runtime = self.runtime.lock().take();
        let Some(runtime) = runtime else {
            return;
        };

        let cancelled = self.cancel_all();
        runtime.stop.cancel();
        for worker in runtime.workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "upload worker ended abnormally");
            }
        }
        // Settled cancellations are already queued for the callbacks
        runtime.dispatcher_stop.cancel();
        if let Err(err) = runtime.dispatcher.await {
            warn!(error = %err, "callback dispatcher ended abnormally");
        }
        info!(cancelled, "upload queue stopped");
    }

    /// Appends a pending item. Workers pick it up once the queue is started.
    pub fn add(&self, item: UploadItem) -> UploadItem {
        let snapshot = item.clone();
        {
            let mut store = self.shared.store.lock();
            store.add(item);
            self.shared.emit(QueueEvent::Added(snapshot.clone()));
        }
        debug!(item = %snapshot.id, file = %snapshot.file_name, "upload queued");
        self.shared.work_available.notify_waiters();
        snapshot
    }

    fn apply(&self, id: &UploadId, next: UploadStatus) -> bool {
        let mut store = self.shared.store.lock();
        match store.transition(id, next) {
            Some((item, from)) => {
                info!(item = %id, file = %item.file_name, from = %from, to = %next, "status changed");
                self.shared.status_changed(item, from);
                true
            }
            None => false,
        }
    }

    /// Legal only while uploading.
    pub fn pause(&self, id: &UploadId) -> bool {
        self.apply(id, UploadStatus::Paused)
    }

    /// Legal only while paused; the item re-enters the pending pool.
    pub fn resume(&self, id: &UploadId) -> bool {
        let resumed = self.apply(id, UploadStatus::Pending);
        if resumed {
            self.shared.work_available.notify_waiters();
        }
        resumed
    }

    /// Legal from pending, uploading and paused.
    pub fn cancel(&self, id: &UploadId) -> bool {
        self.apply(id, UploadStatus::Cancelled)
    }

    /// Pauses running uploads and stops dispatching pending ones until
    /// [`resume_all`](Self::resume_all).
    pub fn pause_all(&self) -> usize {
        let ids = {
            let mut store = self.shared.store.lock();
            store.set_dispatch_paused(true);
            store.ids_with_status(UploadStatus::Uploading)
        };
        ids.iter().filter(|id| self.pause(id)).count()
    }

    pub fn resume_all(&self) -> usize {
        let ids = {
            let mut store = self.shared.store.lock();
            store.set_dispatch_paused(false);
            store.ids_with_status(UploadStatus::Paused)
        };
        let resumed = ids.iter().filter(|id| self.resume(id)).count();
        self.shared.work_available.notify_waiters();
        resumed
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<UploadId> = {
            let store = self.shared.store.lock();
            store.items().iter().map(|item| item.id).collect()
        };
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    pub fn is_dispatch_paused(&self) -> bool {
        self.shared.store.lock().dispatch_paused()
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        self.shared.store.lock().status()
    }

    pub fn get_item(&self, id: &UploadId) -> Option<UploadItem> {
        self.shared.store.lock().get(id).cloned()
    }

    /// Active (non-terminal) items in queue order.
    pub fn items(&self) -> Vec<UploadItem> {
        self.shared.store.lock().items().to_vec()
    }

    /// Terminal items in the order they finished.
    pub fn history(&self) -> Vec<UploadItem> {
        self.shared.store.lock().history().to_vec()
    }

    pub fn get_by_fingerprint(&self, fingerprint: &str) -> Option<UploadItem> {
        self.shared.store.lock().by_fingerprint(fingerprint).cloned()
    }

    pub fn clear_completed(&self) -> usize {
        self.shared.store.lock().clear_history(UploadStatus::Completed)
    }

    pub fn clear_failed(&self) -> usize {
        self.shared.store.lock().clear_history(UploadStatus::Failed)
    }

    /// Drops a pending item from the queue.
    pub fn remove(&self, id: &UploadId) -> bool {
        let removed = self.shared.store.lock().remove_pending(id);
        if let Some(item) = &removed {
            info!(item = %id, file = %item.file_name, "removed from queue");
        }
        removed.is_some()
    }

    pub fn move_item(&self, id: &UploadId, new_index: usize) -> bool {
        self.shared.store.lock().move_item(id, new_index)
    }

    pub fn export(&self) -> QueueSnapshot {
        self.shared.store.lock().snapshot()
    }

    pub fn import(&self, snapshot: QueueSnapshot) -> Result<usize> {
        let restored = self.shared.store.lock().restore(snapshot)?;
        self.shared.work_available.notify_waiters();
        self.shared.changed.notify_waiters();
        Ok(restored)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.subscribe()
    }

    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&UploadItem) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().progress.push(Arc::new(callback));
    }

    pub fn on_status_change<F>(&self, callback: F)
    where
        F: Fn(&UploadItem, UploadStatus) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().status.push(Arc::new(callback));
    }

    pub fn on_complete<F>(&self, callback: F)
    where
        F: Fn(&UploadItem) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().complete.push(Arc::new(callback));
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&UploadItem, ErrorKind, &str) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().error.push(Arc::new(callback));
    }

    /// Resolves with the item once it is terminal, or `None` if the id is
    /// unknown or was removed.
    pub async fn wait_for_terminal(&self, id: &UploadId) -> Option<UploadItem> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.get_item(id) {
                Some(item) if item.status.is_terminal() => return Some(item),
                Some(_) => {}
                None => return None,
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
        }
    }

    /// Resolves once nothing is pending or uploading.
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let idle = self.shared.store.lock().is_idle();
            if idle {
                return;
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
        }
    }
}

impl Drop for UploadQueue {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.stop.cancel();
        }
    }
}
