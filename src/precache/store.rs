//! Durable response stores keyed by content hash.
//!
//! `MemoryStore` keeps responses in a bounded LRU; `DiskStore` writes one JSON
//! document per key so primed responses survive a restart.

use std::{
    num::NonZeroUsize,
    path::PathBuf,
    sync::RwLock,
};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;

use crate::handler::ProxyResponse;
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "precache::store";
const ENTRY_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store key `{0}` is not a content hash")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to encode stored response: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("stored response for `{key}` is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Key/value storage for primed responses.
#[async_trait]
pub trait ResponseStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<ProxyResponse>, StoreError>;

    async fn put(&self, key: &str, response: &ProxyResponse) -> Result<(), StoreError>;

    /// Remove `key`, returning whether an entry existed.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    async fn contains(&self, key: &str) -> Result<bool, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;
}

// ============================================================================
// Memory store
// ============================================================================

/// In-memory store bounded by an LRU capacity.
pub struct MemoryStore {
    responses: RwLock<LruCache<String, ProxyResponse>>,
}

impl MemoryStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            responses: RwLock::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl ResponseStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<ProxyResponse>, StoreError> {
        Ok(rw_write(&self.responses, SOURCE, "memory_get")
            .get(key)
            .cloned())
    }

    async fn put(&self, key: &str, response: &ProxyResponse) -> Result<(), StoreError> {
        let evicted = rw_write(&self.responses, SOURCE, "memory_put")
            .push(key.to_string(), response.clone())
            .filter(|(evicted_key, _)| evicted_key != key);
        if let Some((evicted_key, _)) = evicted {
            debug!(key = %evicted_key, "primed response evicted by capacity");
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(rw_write(&self.responses, SOURCE, "memory_remove")
            .pop(key)
            .is_some())
    }

    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(rw_read(&self.responses, SOURCE, "memory_contains").contains(key))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        rw_write(&self.responses, SOURCE, "memory_clear").clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(rw_read(&self.responses, SOURCE, "memory_len").len())
    }
}

// ============================================================================
// Disk store
// ============================================================================

/// On-disk form of a response. Header values and the body are base64 so
/// values that are not valid UTF-8 survive the round trip.
#[derive(Debug, Serialize, Deserialize)]
struct StoredResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl StoredResponse {
    fn from_response(response: &ProxyResponse) -> Self {
        Self {
            status: response.status.as_u16(),
            headers: response
                .headers
                .iter()
                .map(|(name, value)| (name.to_string(), STANDARD.encode(value.as_bytes())))
                .collect(),
            body: STANDARD.encode(&response.body),
        }
    }

    fn into_response(self, key: &str) -> Result<ProxyResponse, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            key: key.to_string(),
            reason,
        };

        let status = StatusCode::from_u16(self.status).map_err(|err| corrupt(err.to_string()))?;
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in self.headers {
            let name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|err| corrupt(err.to_string()))?;
            let value = STANDARD
                .decode(value)
                .map_err(|err| corrupt(err.to_string()))?;
            let value = HeaderValue::from_bytes(&value).map_err(|err| corrupt(err.to_string()))?;
            headers.append(name, value);
        }
        let body = STANDARD
            .decode(self.body)
            .map_err(|err| corrupt(err.to_string()))?;

        Ok(ProxyResponse::new(status, headers, Bytes::from(body)))
    }
}

/// Filesystem-backed store: one `<key>.json` document per entry.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Open a store rooted at `root`, creating the directory if necessary.
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = key.len() == 64
            && key
                .bytes()
                .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte));
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(format!("{key}.{ENTRY_EXTENSION}")))
    }

    async fn entry_paths(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut paths = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path
                .extension()
                .is_some_and(|extension| extension == ENTRY_EXTENSION)
            {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

#[async_trait]
impl ResponseStore for DiskStore {
    async fn get(&self, key: &str) -> Result<Option<ProxyResponse>, StoreError> {
        let path = self.path_for(key)?;
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let stored: StoredResponse =
            serde_json::from_slice(&raw).map_err(|err| StoreError::Corrupt {
                key: key.to_string(),
                reason: err.to_string(),
            })?;
        stored.into_response(key).map(Some)
    }

    async fn put(&self, key: &str, response: &ProxyResponse) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let encoded = serde_json::to_vec(&StoredResponse::from_response(response))?;

        // Write beside the target and rename so readers never see a partial file.
        let staging = path.with_extension("tmp");
        let mut file = fs::File::create(&staging).await?;
        let written = async {
            file.write_all(&encoded).await?;
            file.flush().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&staging).await;
            return Err(err.into());
        }
        fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        for path in self.entry_paths().await? {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entry_paths().await?.len())
    }
}

#[cfg(test)]
mod tests {
    use axum::http::header::CONTENT_TYPE;

    use super::*;
    use crate::precache::keys::content_hash;

    fn sample_response(body: &'static str) -> ProxyResponse {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/msgpack"));
        ProxyResponse::new(StatusCode::OK, headers, Bytes::from_static(body.as_bytes()))
    }

    #[tokio::test]
    async fn memory_store_put_get_remove() {
        let store = MemoryStore::new(NonZeroUsize::new(4).expect("non-zero"));
        let key = content_hash(b"request");

        assert!(store.get(&key).await.expect("get").is_none());
        store
            .put(&key, &sample_response("payload"))
            .await
            .expect("put");

        let cached = store.get(&key).await.expect("get").expect("hit");
        assert_eq!(cached.body, Bytes::from_static(b"payload"));
        assert!(store.contains(&key).await.expect("contains"));

        assert!(store.remove(&key).await.expect("remove"));
        assert!(!store.remove(&key).await.expect("second remove"));
        assert_eq!(store.len().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn memory_store_evicts_least_recent_entry() {
        let store = MemoryStore::new(NonZeroUsize::new(2).expect("non-zero"));
        for body in ["a", "b", "c"] {
            store
                .put(&content_hash(body.as_bytes()), &sample_response(body))
                .await
                .expect("put");
        }

        assert!(!store.contains(&content_hash(b"a")).await.expect("contains"));
        assert!(store.contains(&content_hash(b"c")).await.expect("contains"));
        assert_eq!(store.len().await.expect("len"), 2);
    }

    #[tokio::test]
    async fn disk_store_round_trips_status_headers_and_body() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DiskStore::new(dir.path().join("entries")).expect("store");
        let key = content_hash(b"disk request");
        let response = ProxyResponse::new(
            StatusCode::CREATED,
            sample_response("").headers,
            Bytes::from_static(&[0, 159, 146, 150]),
        );

        store.put(&key, &response).await.expect("put");
        assert_eq!(store.len().await.expect("len"), 1);

        let restored = store.get(&key).await.expect("get").expect("hit");
        assert_eq!(restored.status, StatusCode::CREATED);
        assert_eq!(
            restored.headers.get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/msgpack"))
        );
        assert_eq!(restored.body, response.body);

        store.clear().await.expect("clear");
        assert!(store.get(&key).await.expect("get").is_none());
        assert!(!store.remove(&key).await.expect("remove"));
    }

    #[tokio::test]
    async fn disk_store_keeps_header_values_that_are_not_utf8() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DiskStore::new(dir.path().to_path_buf()).expect("store");
        let key = content_hash(b"latin-1 header");

        let mut response = sample_response("body");
        let raw =
            HeaderValue::from_bytes(b"caf\xe9").expect("obs-text is a valid header value");
        assert!(raw.to_str().is_err());
        response.headers.insert("x-station-name", raw.clone());

        store.put(&key, &response).await.expect("put");
        let restored = store.get(&key).await.expect("get").expect("hit");

        assert_eq!(restored.headers.get("x-station-name"), Some(&raw));
        assert_eq!(restored.headers.len(), response.headers.len());
    }

    #[tokio::test]
    async fn disk_store_rejects_keys_that_are_not_hashes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DiskStore::new(dir.path().to_path_buf()).expect("store");

        let error = store
            .get("../../etc/passwd")
            .await
            .expect_err("path-like key rejected");
        assert!(matches!(error, StoreError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn disk_store_reports_corrupt_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DiskStore::new(dir.path().to_path_buf()).expect("store");
        let key = content_hash(b"corrupt");

        std::fs::write(dir.path().join(format!("{key}.json")), b"not json").expect("write");

        let error = store.get(&key).await.expect_err("corrupt entry");
        assert!(matches!(error, StoreError::Corrupt { .. }));
    }
}
