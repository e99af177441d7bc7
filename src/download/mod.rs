pub mod dispatch;
pub mod error;
pub mod key;
pub mod manager;
pub mod progress;
pub mod receipt;
pub mod resume;
pub mod storage;
pub mod task;
pub mod transport;

pub use dispatch::{CallbackContext, DispatchQueue, InlineContext};
pub use error::{DownloadError, TransportError};
pub use key::RequestKey;
pub use manager::{DEFAULT_MAX_CONCURRENT, Downloader, DownloaderOptions};
pub use progress::Progress;
pub use receipt::{CompletionCallback, ProgressCallback, Receipt, ResponseHandler};
pub use storage::{FileStore, LocalFileStore};
pub use task::{MergedTask, TaskState};
pub use transport::{
    CancelMode, CancelSignal, HttpTransport, HttpTransportOptions, ResumeToken, TransferOutcome,
    TransferRequest, Transport,
};

use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub dest_path: PathBuf,
    pub headers: BTreeMap<String, String>,
    pub remove_cached_response: bool,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, dest_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest_path: dest_path.into(),
            headers: BTreeMap::new(),
            remove_cached_response: false,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Ask the transport to bypass cached responses. Ignored when resume data
    /// exists for the request.
    pub fn remove_cached_response(mut self) -> Self {
        self.remove_cached_response = true;
        self
    }
}
