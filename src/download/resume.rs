use std::collections::HashMap;

use super::key::RequestKey;
use super::transport::ResumeToken;

/// Resume tokens captured from cancelled transfers, keyed by request identity.
///
/// A token is consumed by the next admission for the same key.
#[derive(Debug, Default)]
pub struct ResumeStore {
    tokens: HashMap<RequestKey, ResumeToken>,
}

impl ResumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a token, returning the one it replaced.
    pub fn insert(&mut self, key: RequestKey, token: ResumeToken) -> Option<ResumeToken> {
        self.tokens.insert(key, token)
    }

    pub fn take(&mut self, key: &RequestKey) -> Option<ResumeToken> {
        self.tokens.remove(key)
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.tokens.contains_key(key)
    }

    /// Whether any token exists for `url`, whatever headers it was fetched with.
    pub fn contains_url(&self, url: &str) -> bool {
        self.tokens.keys().any(|key| key.url() == url)
    }

    /// Remove every token recorded for `url`.
    pub fn remove_url(&mut self, url: &str) -> Vec<ResumeToken> {
        let keys: Vec<RequestKey> = self
            .tokens
            .keys()
            .filter(|key| key.url() == url)
            .cloned()
            .collect();
        keys.iter().filter_map(|key| self.tokens.remove(key)).collect()
    }

    pub fn drain(&mut self) -> Vec<ResumeToken> {
        self.tokens.drain().map(|(_, token)| token).collect()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::key::{DEFAULT_IDENTITY_HEADERS, validate_url};
    use std::collections::BTreeMap;

    fn key(url: &str, auth: Option<&str>) -> RequestKey {
        let identity: Vec<String> = DEFAULT_IDENTITY_HEADERS.iter().map(|s| s.to_string()).collect();
        let mut headers = BTreeMap::new();
        if let Some(auth) = auth {
            headers.insert("Authorization".to_string(), auth.to_string());
        }
        RequestKey::new(&validate_url(url).unwrap(), &headers, &identity)
    }

    #[test]
    fn test_take_consumes_token() {
        let mut store = ResumeStore::new();
        let k = key("https://example.com/a", None);
        store.insert(k.clone(), ResumeToken::new(vec![1, 2, 3]));

        assert!(store.contains(&k));
        assert_eq!(store.take(&k).map(|t| t.into_bytes()), Some(vec![1, 2, 3]));
        assert!(store.take(&k).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_url_covers_all_header_variants() {
        let mut store = ResumeStore::new();
        store.insert(key("https://example.com/a", None), ResumeToken::new(vec![1]));
        store.insert(key("https://example.com/a", Some("t")), ResumeToken::new(vec![2]));
        store.insert(key("https://example.com/b", None), ResumeToken::new(vec![3]));

        assert!(store.contains_url("https://example.com/a"));
        let removed = store.remove_url("https://example.com/a");
        assert_eq!(removed.len(), 2);
        assert!(!store.contains_url("https://example.com/a"));
        assert_eq!(store.len(), 1);

        assert_eq!(store.drain().len(), 1);
        assert!(store.is_empty());
    }
}
