use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{
    CACHE_CONTROL, CONTENT_RANGE, ETAG, HeaderName, IF_RANGE, LAST_MODIFIED, PRAGMA, RANGE,
};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use super::key::RequestKey;
use super::{Progress, TransportError};

/// Opaque state that lets a transport continue a cancelled transfer.
#[derive(Clone, PartialEq, Eq)]
pub struct ResumeToken(Vec<u8>);

impl ResumeToken {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl std::fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResumeToken({} bytes)", self.0.len())
    }
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: Url,
    pub key: RequestKey,
    pub headers: BTreeMap<String, String>,
    pub resume: Option<ResumeToken>,
}

#[derive(Debug)]
pub enum TransferOutcome {
    /// The body is complete in `temp_path`; the caller moves it into place.
    Completed { temp_path: PathBuf, bytes: u64 },
    Failed(TransportError),
    Cancelled { resume: Option<ResumeToken> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    KeepResumeData,
    DiscardResumeData,
}

/// Scheduler side of a transfer's cancellation channel.
#[derive(Debug)]
pub struct CancelHandle {
    sender: Option<oneshot::Sender<CancelMode>>,
}

impl CancelHandle {
    /// Returns `false` if cancellation was already requested or the transfer
    /// is gone.
    pub fn cancel(&mut self, mode: CancelMode) -> bool {
        match self.sender.take() {
            Some(sender) => sender.send(mode).is_ok(),
            None => false,
        }
    }
}

/// Transport side of a transfer's cancellation channel.
#[derive(Debug)]
pub struct CancelSignal {
    receiver: Option<oneshot::Receiver<CancelMode>>,
}

impl CancelSignal {
    pub fn channel() -> (CancelHandle, CancelSignal) {
        let (sender, receiver) = oneshot::channel();
        (
            CancelHandle {
                sender: Some(sender),
            },
            CancelSignal {
                receiver: Some(receiver),
            },
        )
    }

    /// Resolves once cancellation is requested. Never resolves if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) -> CancelMode {
        if let Some(receiver) = self.receiver.as_mut() {
            let result = receiver.await;
            self.receiver = None;
            if let Ok(mode) = result {
                return mode;
            }
        }
        std::future::pending().await
    }
}

/// The network side of the downloader.
///
/// One call to [`transfer`](Transport::transfer) runs one transfer to a
/// terminal outcome, reporting cumulative progress on `progress`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn transfer(
        &self,
        request: TransferRequest,
        progress: mpsc::UnboundedSender<Progress>,
        cancel: CancelSignal,
    ) -> TransferOutcome;

    /// Drop any cached response metadata for `key` before the next transfer.
    async fn discard_cached_response(&self, key: &RequestKey);

    /// Release whatever a resume token refers to (partial files etc).
    async fn discard_resume_data(&self, _token: ResumeToken) {}
}

#[derive(Debug, Clone)]
pub struct HttpTransportOptions {
    pub timeout: Duration,
    pub user_agent: String,
    pub partial_dir: PathBuf,
    pub progress_interval: Duration,
}

impl Default for HttpTransportOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("fetchcache/", env!("CARGO_PKG_VERSION")).to_string(),
            partial_dir: std::env::temp_dir().join("fetchcache-partial"),
            progress_interval: Duration::from_millis(250),
        }
    }
}

/// What the HTTP transport serializes into a [`ResumeToken`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct ResumeState {
    partial_path: PathBuf,
    bytes: u64,
    total: Option<u64>,
    etag: Option<String>,
    last_modified: Option<String>,
}

impl ResumeState {
    fn encode(&self) -> Option<ResumeToken> {
        serde_json::to_vec(self).ok().map(ResumeToken::new)
    }

    fn decode(token: &ResumeToken) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(token.as_bytes())
    }

    fn validator(&self) -> Option<&str> {
        self.etag.as_deref().or(self.last_modified.as_deref())
    }
}

enum Finished {
    Completed(u64),
    Cancelled(CancelMode, ResumeState),
}

/// [`Transport`] over HTTP(S) with byte-range resume.
pub struct HttpTransport {
    client: Client,
    options: HttpTransportOptions,
    no_cache: Mutex<HashSet<RequestKey>>,
}

impl HttpTransport {
    pub fn new(options: HttpTransportOptions) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(options.timeout)
            .user_agent(options.user_agent.clone())
            .build()
            .map_err(|e| TransportError::Other(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            options,
            no_cache: Mutex::new(HashSet::new()),
        })
    }

    pub fn options(&self) -> &HttpTransportOptions {
        &self.options
    }

    fn take_no_cache(&self, key: &RequestKey) -> bool {
        self.no_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Decode a token and check that its partial file still matches it.
    async fn usable_resume_state(&self, request: &TransferRequest) -> Option<ResumeState> {
        let token = request.resume.as_ref()?;
        let state = match ResumeState::decode(token) {
            Ok(state) => state,
            Err(e) => {
                warn!(url = %request.url, error = %e, "ignoring undecodable resume data");
                return None;
            }
        };

        match fs::metadata(&state.partial_path).await {
            Ok(metadata) if metadata.len() == state.bytes && state.bytes > 0 => Some(state),
            _ => {
                debug!(url = %request.url, "partial file missing or changed, restarting");
                let _ = fs::remove_file(&state.partial_path).await;
                None
            }
        }
    }

    async fn run(
        &self,
        request: &TransferRequest,
        resume: Option<&ResumeState>,
        partial_path: &Path,
        progress: &mpsc::UnboundedSender<Progress>,
        cancel: &mut CancelSignal,
    ) -> Result<Finished, TransportError> {
        let url = request.url.as_str();
        let mut builder = self.client.get(request.url.clone());

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if self.take_no_cache(&request.key) {
            builder = builder
                .header(CACHE_CONTROL, "no-cache")
                .header(PRAGMA, "no-cache");
        }

        if let Some(state) = resume {
            builder = builder.header(RANGE, format!("bytes={}-", state.bytes));
            if let Some(validator) = state.validator() {
                builder = builder.header(IF_RANGE, validator);
            }
        }

        let response = tokio::select! {
            mode = cancel.cancelled() => {
                let state = resume.cloned().unwrap_or_else(|| ResumeState {
                    partial_path: partial_path.to_path_buf(),
                    bytes: 0,
                    total: None,
                    etag: None,
                    last_modified: None,
                });
                return Ok(Finished::Cancelled(mode, state));
            }
            response = builder.send() => response.map_err(|e| TransportError::network(url, e))?,
        };

        let status = response.status();
        if resume.is_some() && status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(TransportError::ResumeRejected {
                url: url.to_string(),
                reason: "server refused the byte range".to_string(),
            });
        }
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        // A 200 to a ranged request means the server ignored the range.
        let offset = match resume {
            Some(state) if status == StatusCode::PARTIAL_CONTENT => state.bytes,
            _ => 0,
        };

        let header_string = |name: HeaderName| -> Option<String> {
            response
                .headers()
                .get(&name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header_string(ETAG);
        let last_modified = header_string(LAST_MODIFIED);

        let total = if offset > 0 {
            // "bytes 1024-2047/2048"
            header_string(CONTENT_RANGE)
                .and_then(|s| s.rsplit('/').next().and_then(|t| t.parse().ok()))
                .or_else(|| response.content_length().map(|len| len + offset))
        } else {
            response.content_length()
        };

        if let Some(parent) = partial_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransportError::io(parent, e))?;
        }

        let mut file = if offset > 0 {
            OpenOptions::new()
                .append(true)
                .open(partial_path)
                .await
                .map_err(|e| TransportError::io(partial_path, e))?
        } else {
            File::create(partial_path)
                .await
                .map_err(|e| TransportError::io(partial_path, e))?
        };

        let mut downloaded = offset;
        let mut last_update = Instant::now();
        let _ = progress.send(Progress::new(downloaded, total));

        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                mode = cancel.cancelled() => {
                    file.flush().await.map_err(|e| TransportError::io(partial_path, e))?;
                    let state = ResumeState {
                        partial_path: partial_path.to_path_buf(),
                        bytes: downloaded,
                        total,
                        etag,
                        last_modified,
                    };
                    return Ok(Finished::Cancelled(mode, state));
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) => {
                        file.write_all(&chunk)
                            .await
                            .map_err(|e| TransportError::io(partial_path, e))?;
                        downloaded += chunk.len() as u64;

                        if last_update.elapsed() >= self.options.progress_interval {
                            let _ = progress.send(Progress::new(downloaded, total));
                            last_update = Instant::now();
                        }
                    }
                    Some(Err(e)) => return Err(TransportError::network(url, e)),
                    None => break,
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| TransportError::io(partial_path, e))?;
        let _ = progress.send(Progress::new(downloaded, total.or(Some(downloaded))));

        Ok(Finished::Completed(downloaded))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn transfer(
        &self,
        request: TransferRequest,
        progress: mpsc::UnboundedSender<Progress>,
        mut cancel: CancelSignal,
    ) -> TransferOutcome {
        let mut resume = self.usable_resume_state(&request).await;

        loop {
            let partial_path = match &resume {
                Some(state) => state.partial_path.clone(),
                None => self
                    .options
                    .partial_dir
                    .join(format!("{}.part", Uuid::new_v4())),
            };

            let result = self
                .run(&request, resume.as_ref(), &partial_path, &progress, &mut cancel)
                .await;

            match result {
                Ok(Finished::Completed(bytes)) => {
                    return TransferOutcome::Completed {
                        temp_path: partial_path,
                        bytes,
                    };
                }
                Ok(Finished::Cancelled(CancelMode::KeepResumeData, state)) if state.bytes > 0 => {
                    return TransferOutcome::Cancelled {
                        resume: state.encode(),
                    };
                }
                Ok(Finished::Cancelled(_, state)) => {
                    let _ = fs::remove_file(&state.partial_path).await;
                    return TransferOutcome::Cancelled { resume: None };
                }
                Err(TransportError::ResumeRejected { reason, .. }) if resume.is_some() => {
                    debug!(url = %request.url, %reason, "restarting transfer from zero");
                    let _ = fs::remove_file(&partial_path).await;
                    resume = None;
                }
                Err(e) => {
                    let _ = fs::remove_file(&partial_path).await;
                    return TransferOutcome::Failed(e);
                }
            }
        }
    }

    async fn discard_cached_response(&self, key: &RequestKey) {
        self.no_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
    }

    async fn discard_resume_data(&self, token: ResumeToken) {
        if let Ok(state) = ResumeState::decode(&token) {
            if let Err(e) = fs::remove_file(&state.partial_path).await {
                debug!(path = %state.partial_path.display(), error = %e, "partial file already gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_state_round_trips_through_token() {
        let state = ResumeState {
            partial_path: PathBuf::from("/tmp/x.part"),
            bytes: 1024,
            total: Some(4096),
            etag: Some("\"abc\"".to_string()),
            last_modified: None,
        };
        let token = state.encode().unwrap();
        assert_eq!(ResumeState::decode(&token).unwrap(), state);
        assert_eq!(state.validator(), Some("\"abc\""));
    }

    #[test]
    fn test_garbage_token_does_not_decode() {
        assert!(ResumeState::decode(&ResumeToken::new(b"nope".to_vec())).is_err());
    }

    #[tokio::test]
    async fn test_cancel_signal_resolves_with_mode() {
        let (mut handle, mut signal) = CancelSignal::channel();
        assert!(handle.cancel(CancelMode::DiscardResumeData));
        assert!(!handle.cancel(CancelMode::KeepResumeData));
        assert_eq!(signal.cancelled().await, CancelMode::DiscardResumeData);
    }

    #[tokio::test]
    async fn test_cancel_signal_pends_when_handle_dropped() {
        let (handle, mut signal) = CancelSignal::channel();
        drop(handle);
        let waited =
            tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_unusable_resume_state_is_dropped() {
        let dir = tempfile::TempDir::new().unwrap();
        let transport = HttpTransport::new(HttpTransportOptions {
            partial_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();

        let url = Url::parse("https://example.com/f.bin").unwrap();
        let key = RequestKey::new(&url, &BTreeMap::new(), &[]);
        let token = ResumeState {
            partial_path: dir.path().join("missing.part"),
            bytes: 10,
            total: None,
            etag: None,
            last_modified: None,
        }
        .encode();

        let request = TransferRequest {
            url,
            key,
            headers: BTreeMap::new(),
            resume: token,
        };
        assert!(transport.usable_resume_state(&request).await.is_none());
    }

    mod http {
        use super::*;
        use wiremock::matchers::{header, header_exists, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn transport(dir: &Path) -> HttpTransport {
            HttpTransport::new(HttpTransportOptions {
                partial_dir: dir.to_path_buf(),
                ..Default::default()
            })
            .unwrap()
        }

        fn request(url: &str, resume: Option<ResumeToken>) -> TransferRequest {
            let url = Url::parse(url).unwrap();
            let key = RequestKey::new(&url, &BTreeMap::new(), &[]);
            TransferRequest {
                url,
                key,
                headers: BTreeMap::new(),
                resume,
            }
        }

        fn resume_token(partial: &Path, bytes: u64, etag: Option<&str>) -> Option<ResumeToken> {
            ResumeState {
                partial_path: partial.to_path_buf(),
                bytes,
                total: None,
                etag: etag.map(str::to_string),
                last_modified: None,
            }
            .encode()
        }

        async fn run(
            transport: &HttpTransport,
            request: TransferRequest,
        ) -> (TransferOutcome, Vec<Progress>) {
            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
            let (_handle, signal) = CancelSignal::channel();
            let outcome = transport.transfer(request, progress_tx, signal).await;

            let mut events = Vec::new();
            while let Ok(progress) = progress_rx.try_recv() {
                events.push(progress);
            }
            (outcome, events)
        }

        fn completed(outcome: TransferOutcome) -> (PathBuf, u64) {
            match outcome {
                TransferOutcome::Completed { temp_path, bytes } => (temp_path, bytes),
                other => panic!("expected a completed transfer, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_fresh_transfer_streams_to_partial_file() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/f.bin"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
                .expect(1)
                .mount(&server)
                .await;

            let dir = tempfile::TempDir::new().unwrap();
            let transport = transport(dir.path());
            let (outcome, events) =
                run(&transport, request(&format!("{}/f.bin", server.uri()), None)).await;

            let (temp_path, bytes) = completed(outcome);
            assert_eq!(bytes, 11);
            assert!(temp_path.starts_with(dir.path()));
            assert_eq!(fs::read(&temp_path).await.unwrap(), b"hello world");
            assert_eq!(events.last(), Some(&Progress::new(11, Some(11))));
        }

        #[tokio::test]
        async fn test_resume_sends_range_and_appends_partial_content() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/f.bin"))
                .and(header("Range", "bytes=3-"))
                .and(header("If-Range", "\"v1\""))
                .respond_with(
                    ResponseTemplate::new(206)
                        .set_body_bytes(b"BBB".to_vec())
                        .insert_header("Content-Range", "bytes 3-5/6"),
                )
                .expect(1)
                .mount(&server)
                .await;

            let dir = tempfile::TempDir::new().unwrap();
            let partial = dir.path().join("resume.part");
            fs::write(&partial, b"AAA").await.unwrap();

            let transport = transport(dir.path());
            let token = resume_token(&partial, 3, Some("\"v1\""));
            let (outcome, events) =
                run(&transport, request(&format!("{}/f.bin", server.uri()), token)).await;

            let (temp_path, bytes) = completed(outcome);
            assert_eq!(temp_path, partial);
            assert_eq!(bytes, 6);
            assert_eq!(fs::read(&partial).await.unwrap(), b"AAABBB");
            assert_eq!(events.first(), Some(&Progress::new(3, Some(6))));
            assert_eq!(events.last(), Some(&Progress::new(6, Some(6))));
        }

        #[tokio::test]
        async fn test_full_response_to_range_restarts_from_zero() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/f.bin"))
                .and(header_exists("Range"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(b"AAABBB".to_vec()))
                .expect(1)
                .mount(&server)
                .await;

            let dir = tempfile::TempDir::new().unwrap();
            let partial = dir.path().join("resume.part");
            fs::write(&partial, b"AAA").await.unwrap();

            let transport = transport(dir.path());
            let token = resume_token(&partial, 3, None);
            let (outcome, _) =
                run(&transport, request(&format!("{}/f.bin", server.uri()), token)).await;

            let (temp_path, bytes) = completed(outcome);
            assert_eq!(bytes, 6);
            assert_eq!(fs::read(&temp_path).await.unwrap(), b"AAABBB");
        }

        #[tokio::test]
        async fn test_rejected_range_retries_without_resume() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/f.bin"))
                .and(header_exists("Range"))
                .respond_with(ResponseTemplate::new(416))
                .with_priority(1)
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/f.bin"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
                .with_priority(u8::MAX)
                .expect(1)
                .mount(&server)
                .await;

            let dir = tempfile::TempDir::new().unwrap();
            let partial = dir.path().join("resume.part");
            fs::write(&partial, b"stale").await.unwrap();

            let transport = transport(dir.path());
            let token = resume_token(&partial, 5, Some("\"old\""));
            let (outcome, _) =
                run(&transport, request(&format!("{}/f.bin", server.uri()), token)).await;

            let (temp_path, bytes) = completed(outcome);
            assert_ne!(temp_path, partial);
            assert_eq!(bytes, 5);
            assert_eq!(fs::read(&temp_path).await.unwrap(), b"fresh");
            assert!(!partial.exists());

            let received = server.received_requests().await.unwrap();
            assert_eq!(received.len(), 2);
            assert!(received[1].headers.get("range").is_none());
            assert!(received[1].headers.get("if-range").is_none());
        }

        #[tokio::test]
        async fn test_discarded_cached_response_sends_no_cache_once() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/f.bin"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
                .expect(2)
                .mount(&server)
                .await;

            let dir = tempfile::TempDir::new().unwrap();
            let transport = transport(dir.path());
            let url = format!("{}/f.bin", server.uri());

            let first = request(&url, None);
            transport.discard_cached_response(&first.key).await;
            completed(run(&transport, first).await.0);
            completed(run(&transport, request(&url, None)).await.0);

            let received = server.received_requests().await.unwrap();
            let header_value = |index: usize, name: &str| {
                received[index]
                    .headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            assert_eq!(header_value(0, "cache-control").as_deref(), Some("no-cache"));
            assert_eq!(header_value(0, "pragma").as_deref(), Some("no-cache"));
            assert_eq!(header_value(1, "cache-control"), None);
        }

        #[tokio::test]
        async fn test_error_status_fails_without_partial_file() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(404))
                .mount(&server)
                .await;

            let dir = tempfile::TempDir::new().unwrap();
            let transport = transport(dir.path());
            let (outcome, _) =
                run(&transport, request(&format!("{}/missing.bin", server.uri()), None)).await;

            assert!(matches!(
                outcome,
                TransferOutcome::Failed(TransportError::HttpStatus { status: 404, .. })
            ));
            assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        }

        #[tokio::test]
        async fn test_cancel_before_response_leaves_no_resume_data() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_bytes(b"slow".to_vec())
                        .set_delay(Duration::from_secs(5)),
                )
                .mount(&server)
                .await;

            let dir = tempfile::TempDir::new().unwrap();
            let transport = transport(dir.path());
            let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
            let (mut handle, signal) = CancelSignal::channel();
            handle.cancel(CancelMode::KeepResumeData);

            let outcome = transport
                .transfer(
                    request(&format!("{}/f.bin", server.uri()), None),
                    progress_tx,
                    signal,
                )
                .await;
            assert!(matches!(outcome, TransferOutcome::Cancelled { resume: None }));
        }
    }
}
