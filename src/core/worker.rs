use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::task;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use super::errors::UploadError;
use super::queue::{CallbackEvent, Callbacks, QueueShared, UploadContext, IDLE_POLL};
use super::traits::UploadHandler;
use super::types::QueueEvent;

/// Worker loop: claim the next pending item, run it, settle the result.
pub(crate) async fn run_worker(
    index: usize,
    shared: Arc<QueueShared>,
    handler: Arc<dyn UploadHandler>,
    stop: CancellationToken,
) {
    debug!(worker = index, "upload worker started");

    loop {
        if stop.is_cancelled() {
            break;
        }

        let Some((item, token)) = shared.claim_next(&stop) else {
            // 没有待处理任务, 等待通知或超时后重新扫描
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = shared.work_available.notified() => {}
                _ = sleep(IDLE_POLL) => {}
            }
            continue;
        };

        let id = item.id;
        let ctx = UploadContext::new(id, token, shared.clone());
        let handler = handler.clone();

        // A panicking handler must not take the worker down with it.
        let result = match tokio::spawn(async move { handler.upload(item, ctx).await }).await {
            Ok(result) => result,
            Err(err) => Err(UploadError::internal(format!("upload task aborted: {}", err))),
        };

        shared.settle(&id, result);
    }

    debug!(worker = index, "upload worker stopped");
}

/// Feeds queue events to registered callbacks until `stop`, then drains
/// whatever is still queued.
pub(crate) async fn run_dispatcher(shared: Arc<QueueShared>, stop: CancellationToken) {
    let mut rx = shared.callback_rx.lock().await;

    loop {
        let event = tokio::select! {
            biased;
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
            _ = stop.cancelled() => break,
        };
        dispatch(&shared, event).await;
    }

    while let Ok(event) = rx.try_recv() {
        dispatch(&shared, event).await;
    }
}

async fn dispatch(shared: &QueueShared, event: CallbackEvent) {
    let event = match event {
        CallbackEvent::Progress(id) => match shared.take_progress(&id) {
            Some(item) => QueueEvent::Progress(item),
            None => return,
        },
        CallbackEvent::Queue(event) => event,
    };

    // Snapshot so registration never waits on a running callback.
    let callbacks = shared.callbacks.read().clone();
    if !callbacks.wants(&event) {
        return;
    }

    // Callbacks are user code; keep them off the runtime threads.
    if let Err(err) = task::spawn_blocking(move || invoke(&callbacks, &event)).await {
        warn!(error = %err, "callback task failed");
    }
}

fn invoke(callbacks: &Callbacks, event: &QueueEvent) {
    match event {
        QueueEvent::Added(_) => {}
        QueueEvent::Progress(item) => {
            for callback in &callbacks.progress {
                guarded("progress", || callback(item));
            }
        }
        QueueEvent::StatusChanged { item, from } => {
            for callback in &callbacks.status {
                guarded("status_change", || callback(item, *from));
            }
        }
        QueueEvent::Completed(item) => {
            for callback in &callbacks.complete {
                guarded("complete", || callback(item));
            }
        }
        QueueEvent::Failed { item, kind, error } => {
            for callback in &callbacks.error {
                guarded("error", || callback(item, *kind, error));
            }
        }
    }
}

/// Runs one callback, logging a panic instead of unwinding into the dispatcher.
fn guarded(callback: &'static str, call: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(call)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        warn!(callback, panic = %message, "queue callback panicked");
    }
}
