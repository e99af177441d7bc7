//! Request validation and the deduplication key.

use reqwest::Url;
use std::collections::BTreeMap;
use std::path::Path;

use super::DownloadError;

/// Headers that change the bytes a server returns for the same URL.
pub const DEFAULT_IDENTITY_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "accept-language",
    "authorization",
    "cookie",
    "range",
];

/// Parse and check a download URL. Only `http` and `https` are accepted.
pub fn validate_url(url: &str) -> Result<Url, DownloadError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(DownloadError::invalid_request("URL is empty"));
    }

    let parsed = Url::parse(trimmed)
        .map_err(|e| DownloadError::invalid_request(format!("malformed URL {trimmed:?}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(DownloadError::invalid_request(format!(
                "unsupported URL scheme {other:?} in {trimmed:?}"
            )));
        }
    }

    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(DownloadError::invalid_request(format!(
            "URL {trimmed:?} has no host"
        )));
    }

    Ok(parsed)
}

/// The destination must be a complete path naming a file.
pub fn validate_dest_path(path: &Path) -> Result<(), DownloadError> {
    if path.as_os_str().is_empty() {
        return Err(DownloadError::invalid_request("destination path is empty"));
    }
    if !path.is_absolute() {
        return Err(DownloadError::invalid_request(format!(
            "destination {} is not an absolute path",
            path.display()
        )));
    }
    if path.file_name().is_none() {
        return Err(DownloadError::invalid_request(format!(
            "destination {} does not name a file",
            path.display()
        )));
    }
    Ok(())
}

/// Identity of a transfer: normalized URL plus the content-relevant headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn new(url: &Url, headers: &BTreeMap<String, String>, identity_headers: &[String]) -> Self {
        let mut key = url.as_str().to_string();

        // BTreeMap iteration keeps the header order stable.
        let relevant: BTreeMap<String, &str> = headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.trim()))
            .filter(|(name, _)| identity_headers.iter().any(|h| h.eq_ignore_ascii_case(name)))
            .collect();

        for (name, value) in relevant {
            key.push('\n');
            key.push_str(&name);
            key.push(':');
            key.push_str(value);
        }

        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The URL part of the key.
    pub fn url(&self) -> &str {
        self.0.split('\n').next().unwrap_or_default()
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.replace('\n', " "))
    }
}
