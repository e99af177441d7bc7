use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use super::dispatch::CallbackContext;
use super::{DownloadError, Progress};

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;
pub type CompletionCallback = Box<dyn FnOnce(Result<(), DownloadError>) + Send>;

/// Handle returned for every accepted download call, used to cancel that
/// caller's interest later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt {
    id: Uuid,
    url: String,
}

impl Receipt {
    pub(crate) fn new(id: Uuid, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The requested URL. Informational only.
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// One caller's callbacks attached to a merged task or pending entry.
///
/// Handlers compare by identity: two handlers wrapping equal callbacks are
/// still distinct.
pub struct ResponseHandler {
    id: Uuid,
    dest_path: PathBuf,
    context: Arc<dyn CallbackContext>,
    on_progress: Option<ProgressCallback>,
    on_completion: Mutex<Option<CompletionCallback>>,
    /// Set once completion is requested; nothing new is queued after it.
    finished: AtomicBool,
    /// Set when the caller withdrew; progress already queued is dropped.
    cancelled: AtomicBool,
    /// Set once a live progress event has run, so a stale replay is skipped.
    saw_live_progress: AtomicBool,
}

impl ResponseHandler {
    pub(crate) fn new(
        dest_path: PathBuf,
        context: Arc<dyn CallbackContext>,
        on_progress: Option<ProgressCallback>,
        on_completion: Option<CompletionCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            dest_path,
            context,
            on_progress,
            on_completion: Mutex::new(on_completion),
            finished: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            saw_live_progress: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dest_path(&self) -> &Path {
        &self.dest_path
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Queue a progress event on the handler's context.
    ///
    /// Events queued before a normal completion still run ahead of it; events
    /// still queued when the caller cancels are dropped.
    pub(crate) fn deliver_progress(self: &Arc<Self>, progress: Progress) {
        self.queue_progress(progress, false);
    }

    /// Queue the latest known progress for an observer that just joined.
    /// Skipped if a live event reached the observer first.
    pub(crate) fn replay_progress(self: &Arc<Self>, progress: Progress) {
        self.queue_progress(progress, true);
    }

    fn queue_progress(self: &Arc<Self>, progress: Progress, replay: bool) {
        if self.on_progress.is_none() || self.is_finished() {
            return;
        }
        let handler = Arc::clone(self);
        self.context.run(Box::new(move || {
            if handler.is_cancelled() {
                return;
            }
            if replay {
                if handler.saw_live_progress.load(Ordering::SeqCst) {
                    return;
                }
            } else {
                handler.saw_live_progress.store(true, Ordering::SeqCst);
            }
            if let Some(callback) = &handler.on_progress {
                callback(progress);
            }
        }));
    }

    /// Fire the completion callback on the handler's context. Only the first
    /// call has any effect.
    pub(crate) fn complete(self: &Arc<Self>, result: Result<(), DownloadError>) {
        let callback = self.take_completion();
        if let Some(callback) = callback {
            self.context.run(Box::new(move || callback(result)));
        }
    }

    /// Complete with `error` after the caller withdrew. Progress still waiting
    /// on the context is discarded.
    pub(crate) fn complete_cancelled(self: &Arc<Self>, error: DownloadError) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.complete(Err(error));
    }

    /// Like [`complete`](Self::complete) but runs synchronously when the
    /// caller is already on the handler's context.
    pub(crate) fn complete_immediately(self: &Arc<Self>, result: Result<(), DownloadError>) {
        if !self.context.is_current() {
            self.complete(result);
            return;
        }
        if let Some(callback) = self.take_completion() {
            callback(result);
        }
    }

    fn take_completion(&self) -> Option<CompletionCallback> {
        self.finished.store(true, Ordering::SeqCst);
        self.on_completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl PartialEq for ResponseHandler {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ResponseHandler {}

impl std::fmt::Debug for ResponseHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandler")
            .field("id", &self.id)
            .field("dest_path", &self.dest_path)
            .field("finished", &self.is_finished())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{DispatchQueue, InlineContext};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    fn counting_handler(
        progress_hits: Arc<AtomicUsize>,
        completion_hits: Arc<AtomicUsize>,
    ) -> Arc<ResponseHandler> {
        ResponseHandler::new(
            PathBuf::from("/tmp/file.bin"),
            Arc::new(InlineContext),
            Some(Arc::new(move |_| {
                progress_hits.fetch_add(1, Ordering::SeqCst);
            })),
            Some(Box::new(move |_| {
                completion_hits.fetch_add(1, Ordering::SeqCst);
            })),
        )
    }

    #[test]
    fn test_completion_fires_once() {
        let progress = Arc::new(AtomicUsize::new(0));
        let completion = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(progress.clone(), completion.clone());

        handler.complete(Ok(()));
        handler.complete(Err(DownloadError::cancelled("https://example.com")));
        handler.complete_immediately(Ok(()));

        assert_eq!(completion.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_progress_after_completion() {
        let progress = Arc::new(AtomicUsize::new(0));
        let completion = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(progress.clone(), completion.clone());

        handler.deliver_progress(Progress::new(1, Some(10)));
        handler.complete(Ok(()));
        handler.deliver_progress(Progress::new(2, Some(10)));

        assert_eq!(progress.load(Ordering::SeqCst), 1);
    }

    fn gated_queue() -> (Arc<DispatchQueue>, std_mpsc::Sender<()>) {
        let queue = Arc::new(DispatchQueue::new("receipt-test").unwrap());
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        queue.run(Box::new(move || {
            let _ = gate_rx.recv();
        }));
        (queue, gate_tx)
    }

    fn recording_handler(
        context: Arc<DispatchQueue>,
        seen: Arc<Mutex<Vec<u64>>>,
        done: std_mpsc::Sender<Result<(), DownloadError>>,
    ) -> Arc<ResponseHandler> {
        ResponseHandler::new(
            PathBuf::from("/tmp/file.bin"),
            context,
            Some(Arc::new(move |p: Progress| {
                seen.lock().unwrap().push(p.bytes_received)
            })),
            Some(Box::new(move |result| {
                let _ = done.send(result);
            })),
        )
    }

    #[test]
    fn test_queued_progress_runs_before_success() {
        let (queue, gate) = gated_queue();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = std_mpsc::channel();
        let handler = recording_handler(queue, seen.clone(), done_tx);

        handler.deliver_progress(Progress::new(10, Some(10)));
        handler.complete(Ok(()));
        gate.send(()).unwrap();

        assert!(done_rx.recv_timeout(Duration::from_secs(2)).unwrap().is_ok());
        assert_eq!(*seen.lock().unwrap(), vec![10]);
    }

    #[test]
    fn test_queued_progress_dropped_on_cancel() {
        let (queue, gate) = gated_queue();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = std_mpsc::channel();
        let handler = recording_handler(queue, seen.clone(), done_tx);

        handler.deliver_progress(Progress::new(3, Some(10)));
        handler.complete_cancelled(DownloadError::cancelled("https://example.com/f"));
        gate.send(()).unwrap();

        let result = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_stale_replay_skipped_after_live_progress() {
        let (queue, gate) = gated_queue();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = std_mpsc::channel();
        let handler = recording_handler(queue, seen.clone(), done_tx);

        handler.deliver_progress(Progress::new(8, Some(10)));
        handler.replay_progress(Progress::new(5, Some(10)));
        handler.complete(Ok(()));
        gate.send(()).unwrap();

        done_rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![8]);
    }

    #[test]
    fn test_replay_delivered_when_first() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let handler = ResponseHandler::new(
            PathBuf::from("/tmp/file.bin"),
            Arc::new(InlineContext),
            Some(Arc::new(move |p: Progress| {
                recorder.lock().unwrap().push(p.bytes_received)
            })),
            None,
        );

        handler.replay_progress(Progress::new(5, Some(10)));
        handler.deliver_progress(Progress::new(8, Some(10)));
        assert_eq!(*seen.lock().unwrap(), vec![5, 8]);
    }

    #[test]
    fn test_handlers_compare_by_identity() {
        let a = ResponseHandler::new(PathBuf::from("/a"), Arc::new(InlineContext), None, None);
        let b = ResponseHandler::new(PathBuf::from("/a"), Arc::new(InlineContext), None, None);
        assert_ne!(*a, *b);
        assert_eq!(*a, *a);
    }
}
