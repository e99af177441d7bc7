use anyhow::{Context, Result, bail};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatch::CallbackContext;
use super::key::{DEFAULT_IDENTITY_HEADERS, RequestKey, validate_dest_path, validate_url};
use super::receipt::{CompletionCallback, ProgressCallback, ResponseHandler};
use super::resume::ResumeStore;
use super::storage::{FileStore, LocalFileStore};
use super::task::{MergedTask, PendingRequest, TaskState};
use super::transport::{
    CancelSignal, HttpTransport, HttpTransportOptions, TransferOutcome, TransferRequest, Transport,
};
use super::{DownloadError, DownloadRequest, Progress, Receipt};

/// Default number of transfers allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

#[derive(Debug, Clone)]
pub struct DownloaderOptions {
    pub max_concurrent: usize,
    /// Root wiped by a full cache clear.
    pub cache_root: PathBuf,
    /// Request headers that take part in deduplication.
    pub identity_headers: Vec<String>,
}

impl Default for DownloaderOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            cache_root: std::env::temp_dir().join("fetchcache"),
            identity_headers: DEFAULT_IDENTITY_HEADERS
                .iter()
                .map(|h| h.to_string())
                .collect(),
        }
    }
}

/// Bookkeeping guarded by the scheduler lock.
#[derive(Default)]
struct Scheduler {
    active: HashMap<RequestKey, MergedTask>,
    pending: VecDeque<PendingRequest>,
    /// Receipt id to the key of the task or queue entry backing it.
    receipts: HashMap<Uuid, RequestKey>,
    resume: ResumeStore,
    /// Files known to hold each URL, for targeted cache clears.
    destinations: HashMap<String, BTreeSet<PathBuf>>,
}

impl Scheduler {
    fn remember_destination(&mut self, url: &str, path: &Path) {
        self.destinations
            .entry(url.to_string())
            .or_default()
            .insert(path.to_path_buf());
    }
}

/// Callback work collected under the lock and run after releasing it, so a
/// callback may call back into the downloader.
#[derive(Default)]
struct Deferred {
    replays: Vec<(Arc<ResponseHandler>, Progress)>,
    satisfied: Vec<Arc<ResponseHandler>>,
}

impl Deferred {
    fn fire(self) {
        for (handler, progress) in self.replays {
            handler.replay_progress(progress);
        }
        for handler in self.satisfied {
            handler.complete(Ok(()));
        }
    }
}

struct Shared {
    options: DownloaderOptions,
    transport: Arc<dyn Transport>,
    store: Arc<dyn FileStore>,
    semaphore: Arc<Semaphore>,
    runtime: Handle,
    scheduler: Mutex<Scheduler>,
}

/// Deduplicating, concurrency-bounded download scheduler.
///
/// Cheap to clone; clones share the same task table, queue and resume data.
#[derive(Clone)]
pub struct Downloader {
    shared: Arc<Shared>,
}

impl Downloader {
    /// Must be called from within a tokio runtime; transfers are spawned on it.
    pub fn new(
        options: DownloaderOptions,
        transport: Arc<dyn Transport>,
        store: Arc<dyn FileStore>,
    ) -> Result<Self> {
        if options.max_concurrent == 0 {
            bail!("max_concurrent must be greater than 0");
        }

        let runtime =
            Handle::try_current().context("Downloader must be created inside a tokio runtime")?;

        Ok(Self {
            shared: Arc::new(Shared {
                semaphore: Arc::new(Semaphore::new(options.max_concurrent)),
                options,
                transport,
                store,
                runtime,
                scheduler: Mutex::new(Scheduler::default()),
            }),
        })
    }

    /// Downloader over HTTP writing to the local disk.
    pub fn with_http(
        options: DownloaderOptions,
        transport_options: HttpTransportOptions,
    ) -> Result<Self> {
        let transport =
            HttpTransport::new(transport_options).context("Failed to create HTTP transport")?;
        Self::new(options, Arc::new(transport), Arc::new(LocalFileStore::new()))
    }

    pub fn options(&self) -> &DownloaderOptions {
        &self.shared.options
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.options.max_concurrent
    }

    pub fn download_file(
        &self,
        url: impl Into<String>,
        dest_path: impl Into<PathBuf>,
        context: Arc<dyn CallbackContext>,
        on_completion: CompletionCallback,
    ) -> Option<Receipt> {
        self.download(
            DownloadRequest::new(url, dest_path),
            context,
            None,
            Some(on_completion),
        )
    }

    pub fn download_file_with_progress(
        &self,
        url: impl Into<String>,
        dest_path: impl Into<PathBuf>,
        context: Arc<dyn CallbackContext>,
        on_progress: ProgressCallback,
        on_completion: CompletionCallback,
    ) -> Option<Receipt> {
        self.download(
            DownloadRequest::new(url, dest_path),
            context,
            Some(on_progress),
            Some(on_completion),
        )
    }

    /// Request `request.url` at `request.dest_path`.
    ///
    /// - Invalid input returns `None`; the completion receives
    ///   [`DownloadError::InvalidRequest`] on `context`.
    /// - An existing file at the destination completes successfully without
    ///   any transfer, synchronously if the caller is already on `context`.
    /// - A request matching a running or queued transfer joins it.
    /// - Otherwise a transfer starts, or queues if the concurrency limit is
    ///   reached.
    ///
    /// Callbacks always run on `context`.
    pub fn download(
        &self,
        request: DownloadRequest,
        context: Arc<dyn CallbackContext>,
        on_progress: Option<ProgressCallback>,
        on_completion: Option<CompletionCallback>,
    ) -> Option<Receipt> {
        let validated =
            validate_url(&request.url).and_then(|url| validate_dest_path(&request.dest_path).map(|_| url));
        let url = match validated {
            Ok(url) => url,
            Err(e) => {
                warn!(url = %request.url, error = %e, "rejecting download request");
                if let Some(callback) = on_completion {
                    context.run(Box::new(move || callback(Err(e))));
                }
                return None;
            }
        };

        let handler = ResponseHandler::new(
            request.dest_path.clone(),
            context,
            on_progress,
            on_completion,
        );
        let receipt = Receipt::new(handler.id(), request.url.clone());

        if self.shared.store.exists(&request.dest_path) {
            debug!(
                url = %url,
                dest = %request.dest_path.display(),
                "destination already present, skipping transfer"
            );
            self.shared
                .lock()
                .remember_destination(url.as_str(), &request.dest_path);
            handler.complete_immediately(Ok(()));
            return Some(receipt);
        }

        let key = RequestKey::new(&url, &request.headers, &self.shared.options.identity_headers);
        let deferred = {
            let mut scheduler = self.shared.lock();
            scheduler.receipts.insert(handler.id(), key.clone());
            let mut deferred = Deferred::default();
            self.shared.admit(
                &mut scheduler,
                PendingRequest {
                    url,
                    key,
                    headers: request.headers,
                    remove_cached_response: request.remove_cached_response,
                    handlers: vec![handler],
                },
                &mut deferred,
            );
            deferred
        };
        deferred.fire();

        Some(receipt)
    }

    /// Cancel the receipt's interest, keeping resume data if this stops the
    /// transfer.
    pub fn cancel(&self, receipt: &Receipt) {
        self.cancel_with(receipt, true);
    }

    /// Withdraw one caller from its download.
    ///
    /// The caller's completion fires once with [`DownloadError::Cancelled`].
    /// The transfer itself only stops when no other caller is attached; then
    /// `keep_resume_data` decides whether a later request resumes it.
    /// Receipts for cache hits or finished downloads are ignored.
    pub fn cancel_with(&self, receipt: &Receipt, keep_resume_data: bool) {
        let handler = {
            let mut scheduler = self.shared.lock();
            let Some(key) = scheduler.receipts.remove(&receipt.id()) else {
                debug!(receipt = %receipt.id(), "receipt has no live download, nothing to cancel");
                return;
            };

            if let Some(task) = scheduler.active.get_mut(&key) {
                let handler = task.detach(receipt.id(), keep_resume_data);
                if task.state() == TaskState::Cancelling && task.handler_count() == 0 {
                    info!(url = %task.url(), keep_resume_data, "last observer left, cancelling transfer");
                } else {
                    debug!(url = %task.url(), remaining = task.handler_count(), "observer detached");
                }
                handler
            } else if let Some(index) = scheduler.pending.iter().position(|p| p.key == key) {
                let entry = &mut scheduler.pending[index];
                let handler = entry.remove_handler(receipt.id());
                if entry.handlers.is_empty() {
                    debug!(url = %entry.url, "dropping queued request with no observers");
                    scheduler.pending.remove(index);
                }
                handler
            } else {
                None
            }
        };

        if let Some(handler) = handler {
            handler.complete_cancelled(DownloadError::cancelled(receipt.url()));
        }
    }

    /// Delete cached files: those recorded for `url`, or everything under the
    /// cache root when `url` is `None`. Matching resume data is dropped too.
    /// Running transfers are left alone.
    pub async fn clear_cache(&self, url: Option<&str>) -> Result<(), DownloadError> {
        let shared = &self.shared;
        match url {
            Some(raw) => {
                let url = validate_url(raw)?;
                let (paths, tokens) = {
                    let mut scheduler = shared.lock();
                    let paths = scheduler
                        .destinations
                        .remove(url.as_str())
                        .unwrap_or_default();
                    (paths, scheduler.resume.remove_url(url.as_str()))
                };

                for token in tokens {
                    shared.transport.discard_resume_data(token).await;
                }
                for path in &paths {
                    shared
                        .store
                        .delete(path)
                        .await
                        .map_err(|e| DownloadError::filesystem(path, e))?;
                }
                info!(url = %url, files = paths.len(), "cleared cached download");
            }
            None => {
                let tokens = {
                    let mut scheduler = shared.lock();
                    scheduler.destinations.clear();
                    scheduler.resume.drain()
                };

                for token in tokens {
                    shared.transport.discard_resume_data(token).await;
                }
                let root = &shared.options.cache_root;
                let removed = shared
                    .store
                    .delete_all(root)
                    .await
                    .map_err(|e| DownloadError::filesystem(root, e))?;
                info!(root = %root.display(), removed, "cleared download cache");
            }
        }
        Ok(())
    }

    /// Callback flavour of [`clear_cache`](Self::clear_cache).
    pub fn clear_cache_with(
        &self,
        url: Option<String>,
        context: Arc<dyn CallbackContext>,
        on_completion: CompletionCallback,
    ) {
        let downloader = self.clone();
        self.shared.runtime.spawn(async move {
            let result = downloader.clear_cache(url.as_deref()).await;
            if let Err(e) = &result {
                warn!(error = %e, "cache clear failed");
            }
            context.run(Box::new(move || on_completion(result)));
        });
    }

    /// Transfers currently holding a slot (running or winding down).
    pub fn active_count(&self) -> usize {
        self.shared.lock().active.len()
    }

    /// Distinct requests waiting for a slot.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn has_resume_data(&self, url: &str) -> bool {
        match validate_url(url) {
            Ok(url) => self.shared.lock().resume.contains_url(url.as_str()),
            Err(_) => false,
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join an existing transfer or queue entry, start a new transfer, or
    /// queue. Called with the scheduler lock held.
    fn admit(
        self: &Arc<Self>,
        scheduler: &mut Scheduler,
        request: PendingRequest,
        deferred: &mut Deferred,
    ) {
        if let Some(task) = scheduler.active.get_mut(&request.key) {
            if task.state() != TaskState::Completed {
                debug!(url = %request.url, state = ?task.state(), "joining in-flight transfer");
                for handler in request.handlers {
                    if let Some(progress) = task.attach(Arc::clone(&handler)) {
                        deferred.replays.push((handler, progress));
                    }
                }
                return;
            }
        }

        if let Some(entry) = scheduler.pending.iter_mut().find(|p| p.key == request.key) {
            debug!(url = %request.url, "joining queued request");
            entry.handlers.extend(request.handlers);
            return;
        }

        // Anything already queued goes first.
        if !scheduler.pending.is_empty() {
            debug!(url = %request.url, queued = scheduler.pending.len(), "queueing behind earlier requests");
            scheduler.pending.push_back(request);
            return;
        }

        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => self.start(scheduler, request, permit),
            Err(_) => {
                info!(url = %request.url, limit = self.options.max_concurrent, "concurrency limit reached, queueing");
                scheduler.pending.push_back(request);
            }
        }
    }

    /// Admit queued requests while slots are free, oldest first.
    fn drain(self: &Arc<Self>, scheduler: &mut Scheduler, deferred: &mut Deferred) {
        while !scheduler.pending.is_empty() {
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };
            let Some(mut request) = scheduler.pending.pop_front() else {
                break;
            };

            // Files may have appeared while the request waited.
            let (satisfied, waiting): (Vec<_>, Vec<_>) = request
                .handlers
                .drain(..)
                .partition(|h| self.store.exists(h.dest_path()));
            for handler in satisfied {
                scheduler.receipts.remove(&handler.id());
                scheduler.remember_destination(request.url.as_str(), handler.dest_path());
                deferred.satisfied.push(handler);
            }

            if waiting.is_empty() {
                continue;
            }
            request.handlers = waiting;
            self.start(scheduler, request, permit);
        }
    }

    fn start(
        self: &Arc<Self>,
        scheduler: &mut Scheduler,
        request: PendingRequest,
        permit: OwnedSemaphorePermit,
    ) {
        let resume = scheduler.resume.take(&request.key);
        // Resuming wins over a cache purge request.
        let discard_cached = resume.is_none() && request.remove_cached_response;

        let (cancel_handle, cancel_signal) = CancelSignal::channel();
        let mut task = MergedTask::new(
            request.url.clone(),
            request.key.clone(),
            request.headers.clone(),
            cancel_handle,
        );
        for handler in request.handlers {
            task.attach(handler);
        }

        info!(
            url = %request.url,
            resumed = resume.is_some(),
            observers = task.handler_count(),
            "starting transfer"
        );
        scheduler.active.insert(request.key.clone(), task);

        let transfer = TransferRequest {
            url: request.url,
            key: request.key,
            headers: request.headers,
            resume,
        };
        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            shared
                .drive(transfer, discard_cached, cancel_signal, permit)
                .await;
        });
    }

    async fn drive(
        self: Arc<Self>,
        request: TransferRequest,
        discard_cached: bool,
        cancel: CancelSignal,
        permit: OwnedSemaphorePermit,
    ) {
        let key = request.key.clone();
        let url = request.url.to_string();

        if discard_cached {
            debug!(url = %url, "discarding cached response before transfer");
            self.transport.discard_cached_response(&key).await;
        }

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let transfer = self.transport.transfer(request, progress_tx, cancel);
        tokio::pin!(transfer);

        let outcome = loop {
            tokio::select! {
                biased;
                Some(progress) = progress_rx.recv() => self.fan_out_progress(&key, progress),
                outcome = &mut transfer => break outcome,
            }
        };
        while let Ok(progress) = progress_rx.try_recv() {
            self.fan_out_progress(&key, progress);
        }

        self.finish(key, url, outcome, permit).await;
    }

    fn fan_out_progress(&self, key: &RequestKey, progress: Progress) {
        let handlers = match self.lock().active.get_mut(key) {
            Some(task) => task.record_progress(progress),
            None => return,
        };
        for handler in handlers {
            handler.deliver_progress(progress);
        }
    }

    async fn finish(
        self: &Arc<Self>,
        key: RequestKey,
        url: String,
        outcome: TransferOutcome,
        permit: OwnedSemaphorePermit,
    ) {
        match outcome {
            TransferOutcome::Completed { temp_path, bytes } => {
                self.finish_completed(key, url, temp_path, bytes, permit)
                    .await
            }
            outcome => self.retire(key, url, outcome, permit),
        }
    }

    /// Place a finished body for every observer, including those that join
    /// while placement runs, then retire the task.
    async fn finish_completed(
        self: &Arc<Self>,
        key: RequestKey,
        url: String,
        temp_path: PathBuf,
        bytes: u64,
        permit: OwnedSemaphorePermit,
    ) {
        let mut permit = Some(permit);
        let mut placement = Placement::new(temp_path);
        let mut first_batch = true;

        loop {
            let mut deferred = Deferred::default();
            let batch = {
                let mut scheduler = self.lock();
                let Some(task) = scheduler.active.get_mut(&key) else {
                    warn!(url = %url, "finished transfer was not in the task table");
                    return;
                };
                let handlers = task.take_for_placement();
                if handlers.is_empty() {
                    if let Some(mut task) = scheduler.active.remove(&key) {
                        task.finish();
                    }
                    drop(permit.take());
                    self.drain(&mut scheduler, &mut deferred);
                    None
                } else {
                    for handler in &handlers {
                        scheduler.receipts.remove(&handler.id());
                    }
                    Some(handlers)
                }
            };
            deferred.fire();

            let Some(handlers) = batch else {
                break;
            };
            if first_batch {
                info!(url = %url, bytes, observers = handlers.len(), "transfer completed");
                first_batch = false;
            } else {
                debug!(url = %url, observers = handlers.len(), "placing for observers that joined late");
            }
            self.place_file(&url, &mut placement, handlers).await;
        }

        if first_batch {
            debug!(url = %url, "transfer finished after every observer left");
        }
        if placement.placed.is_none() {
            if let Err(e) = self.store.delete(&placement.temp_path).await {
                warn!(path = %placement.temp_path.display(), error = %e, "failed to remove unplaced download");
            }
        }
    }

    /// Retire a failed or cancelled task, free its slot, admit queued work,
    /// then notify.
    fn retire(
        self: &Arc<Self>,
        key: RequestKey,
        url: String,
        outcome: TransferOutcome,
        permit: OwnedSemaphorePermit,
    ) {
        let mut deferred = Deferred::default();
        let handlers = {
            let mut scheduler = self.lock();
            let Some(mut task) = scheduler.active.remove(&key) else {
                warn!(url = %url, "finished transfer was not in the task table");
                return;
            };
            let handlers = task.finish();
            drop(permit);

            let handlers = match &outcome {
                TransferOutcome::Cancelled { resume } => {
                    if let Some(token) = resume {
                        debug!(url = %url, "storing resume data");
                        scheduler.resume.insert(key.clone(), token.clone());
                    }
                    if !handlers.is_empty() {
                        // Callers joined while the transfer was winding down;
                        // run it again for them, resuming if possible.
                        debug!(url = %url, observers = handlers.len(), "requeueing late observers");
                        scheduler.pending.push_front(PendingRequest {
                            url: task.url().clone(),
                            key: key.clone(),
                            headers: task.headers().clone(),
                            remove_cached_response: false,
                            handlers,
                        });
                    }
                    Vec::new()
                }
                _ => {
                    for handler in &handlers {
                        scheduler.receipts.remove(&handler.id());
                    }
                    handlers
                }
            };

            self.drain(&mut scheduler, &mut deferred);
            handlers
        };
        deferred.fire();

        match outcome {
            TransferOutcome::Failed(e) => {
                warn!(url = %url, error = %e, "transfer failed");
                let error = DownloadError::transfer_failed(url, e);
                for handler in handlers {
                    handler.complete(Err(error.clone()));
                }
            }
            TransferOutcome::Cancelled { .. } => {
                info!(url = %url, "transfer cancelled");
            }
            TransferOutcome::Completed { .. } => {}
        }
    }

    /// Put the finished file at each observer's destination and complete the
    /// observers with their destination's result.
    async fn place_file(
        &self,
        url: &str,
        placement: &mut Placement,
        handlers: Vec<Arc<ResponseHandler>>,
    ) {
        let mut results = Vec::with_capacity(handlers.len());
        for handler in &handlers {
            results.push(placement.place(self.store.as_ref(), handler.dest_path()).await);
        }

        {
            let mut scheduler = self.lock();
            for (handler, result) in handlers.iter().zip(&results) {
                if result.is_ok() {
                    scheduler.remember_destination(url, handler.dest_path());
                }
            }
        }

        for (handler, result) in handlers.into_iter().zip(results) {
            handler.complete(result);
        }
    }
}

/// Where a finished body has been put so far. The first destination receives
/// the file by move, later ones by copy from it.
struct Placement {
    temp_path: PathBuf,
    placed: Option<PathBuf>,
    results: HashMap<PathBuf, Result<(), DownloadError>>,
}

impl Placement {
    fn new(temp_path: PathBuf) -> Self {
        Self {
            temp_path,
            placed: None,
            results: HashMap::new(),
        }
    }

    async fn place(&mut self, store: &dyn FileStore, dest: &Path) -> Result<(), DownloadError> {
        if let Some(result) = self.results.get(dest) {
            return result.clone();
        }

        let moved = match &self.placed {
            None => store.atomic_move(&self.temp_path, dest).await,
            Some(first) => store.atomic_copy(first, dest).await,
        };
        let result = match moved {
            Ok(()) => {
                if self.placed.is_none() {
                    self.placed = Some(dest.to_path_buf());
                }
                Ok(())
            }
            Err(e) => {
                warn!(dest = %dest.display(), error = %e, "failed to place downloaded file");
                Err(DownloadError::filesystem(dest, e))
            }
        };
        self.results.insert(dest.to_path_buf(), result.clone());
        result
    }
}
