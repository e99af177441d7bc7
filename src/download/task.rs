use reqwest::Url;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::key::RequestKey;
use super::receipt::ResponseHandler;
use super::transport::{CancelHandle, CancelMode};
use super::Progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    /// The last observer left; waiting for the transport to wind down.
    Cancelling,
    /// The body is complete and being moved into place. Late observers still
    /// attach and share the file.
    Finalizing,
    Completed,
}

/// One in-flight transfer shared by every caller asking for the same key.
#[derive(Debug)]
pub struct MergedTask {
    url: Url,
    key: RequestKey,
    headers: BTreeMap<String, String>,
    state: TaskState,
    handlers: Vec<Arc<ResponseHandler>>,
    cancel: CancelHandle,
    progress: Option<Progress>,
}

impl MergedTask {
    pub(crate) fn new(
        url: Url,
        key: RequestKey,
        headers: BTreeMap<String, String>,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            url,
            key,
            headers,
            state: TaskState::Running,
            handlers: Vec::new(),
            cancel,
            progress: None,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn bytes_received(&self) -> u64 {
        self.progress.map(|p| p.bytes_received).unwrap_or(0)
    }

    pub fn bytes_expected(&self) -> Option<u64> {
        self.progress.and_then(|p| p.bytes_expected)
    }

    /// Attach an observer. Returns the latest progress, which the caller
    /// replays to the new observer once it has released the scheduler lock.
    pub(crate) fn attach(&mut self, handler: Arc<ResponseHandler>) -> Option<Progress> {
        self.handlers.push(handler);
        self.progress
    }

    /// Remove the observer with `handler_id`. When the last observer goes, the
    /// transport is asked to stop and the task moves to `Cancelling`.
    pub(crate) fn detach(
        &mut self,
        handler_id: Uuid,
        keep_resume_data: bool,
    ) -> Option<Arc<ResponseHandler>> {
        let index = self.handlers.iter().position(|h| h.id() == handler_id)?;
        let handler = self.handlers.remove(index);

        if self.handlers.is_empty() && self.state == TaskState::Running {
            let mode = if keep_resume_data {
                CancelMode::KeepResumeData
            } else {
                CancelMode::DiscardResumeData
            };
            self.cancel.cancel(mode);
            self.state = TaskState::Cancelling;
        }

        Some(handler)
    }

    /// Record a progress event and return the observers to notify.
    pub(crate) fn record_progress(&mut self, progress: Progress) -> Vec<Arc<ResponseHandler>> {
        if self.state == TaskState::Completed {
            return Vec::new();
        }
        self.progress = Some(progress);
        self.handlers.clone()
    }

    /// Hand over the observers attached so far for placement, keeping the task
    /// open for more.
    pub(crate) fn take_for_placement(&mut self) -> Vec<Arc<ResponseHandler>> {
        self.state = TaskState::Finalizing;
        std::mem::take(&mut self.handlers)
    }

    /// Move to the terminal state, handing back the remaining observers.
    pub(crate) fn finish(&mut self) -> Vec<Arc<ResponseHandler>> {
        self.state = TaskState::Completed;
        std::mem::take(&mut self.handlers)
    }
}

/// A request waiting for a free transfer slot.
#[derive(Debug)]
pub struct PendingRequest {
    pub url: Url,
    pub key: RequestKey,
    pub headers: BTreeMap<String, String>,
    pub remove_cached_response: bool,
    pub handlers: Vec<Arc<ResponseHandler>>,
}

impl PendingRequest {
    pub(crate) fn remove_handler(&mut self, handler_id: Uuid) -> Option<Arc<ResponseHandler>> {
        let index = self.handlers.iter().position(|h| h.id() == handler_id)?;
        Some(self.handlers.remove(index))
    }
}
