//! Object storage capability used for per-source payloads and final archives.
//!
//! Bodies move as byte streams in both directions so that neither uploads nor
//! downloads have to be held in memory.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::RwLock;

/// Stream of body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, ObjectStoreError>>;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object {0} not found")]
    NotFound(String),

    /// The caller-supplied body failed while it was being read.
    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("object store error: {0}")]
    Backend(String),
}

/// Key and size of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `body` under `key` and returns the number of bytes written.
    async fn put(
        &self,
        key: &str,
        body: ByteStream,
        content_type: &str,
    ) -> Result<u64, ObjectStoreError>;

    async fn get(&self, key: &str) -> Result<ByteStream, ObjectStoreError>;

    /// Returns `None` when the object does not exist.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, ObjectStoreError>;

    /// Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;

    /// Lists every object whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, ObjectStoreError>;
}

/// Wraps a single buffer as a [`ByteStream`].
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    stream::once(futures::future::ready(Ok(data.into()))).boxed()
}

/// Object store held in process memory.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
    fail_puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` puts fail after consuming their body.
    pub fn fail_next_puts(&self, count: usize) {
        self.fail_puts.store(count, Ordering::SeqCst);
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    pub async fn get_bytes(&self, key: &str) -> Option<Bytes> {
        self.objects.read().await.get(key).cloned()
    }

    fn take_failure(&self) -> bool {
        self.fail_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        mut body: ByteStream,
        _content_type: &str,
    ) -> Result<u64, ObjectStoreError> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }

        if self.take_failure() {
            return Err(ObjectStoreError::Backend(format!(
                "injected failure writing {}",
                key
            )));
        }

        let size = buffer.len() as u64;
        self.objects
            .write()
            .await
            .insert(key.to_string(), buffer.freeze());
        Ok(size)
    }

    async fn get(&self, key: &str) -> Result<ByteStream, ObjectStoreError> {
        let data = self
            .get_bytes(key)
            .await
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))?;
        Ok(bytes_stream(data))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, ObjectStoreError> {
        Ok(self.get_bytes(key).await.map(|data| ObjectMeta {
            key: key.to_string(),
            size: data.len() as u64,
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, ObjectStoreError> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, data)| ObjectMeta {
                key: key.clone(),
                size: data.len() as u64,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut body: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_put_get_head_delete() {
        let store = MemoryObjectStore::new();
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ])
        .boxed();

        let size = store.put("org/req/a.json", body, "application/json").await.unwrap();
        assert_eq!(size, 11);
        assert_eq!(collect(store.get("org/req/a.json").await.unwrap()).await, b"hello world");
        assert_eq!(
            store.head("org/req/a.json").await.unwrap(),
            Some(ObjectMeta {
                key: "org/req/a.json".into(),
                size: 11
            })
        );

        store.delete("org/req/a.json").await.unwrap();
        assert!(store.head("org/req/a.json").await.unwrap().is_none());
        assert!(matches!(
            store.get("org/req/a.json").await,
            Err(ObjectStoreError::NotFound(_))
        ));
        store.delete("org/req/a.json").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = MemoryObjectStore::new();
        for key in ["org/req1/a.csv", "org/req1/b.csv", "org/req10/c.csv", "org/x.tar.gz"] {
            store.put(key, bytes_stream("x"), "text/csv").await.unwrap();
        }

        let keys: Vec<_> = store
            .list("org/req1/")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(keys, ["org/req1/a.csv", "org/req1/b.csv"]);
    }

    #[tokio::test]
    async fn test_body_error_is_propagated() {
        let store = MemoryObjectStore::new();
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(ObjectStoreError::Body("connection reset".into())),
        ])
        .boxed();

        let err = store.put("k", body, "application/json").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::Body(_)));
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_injected_put_failure() {
        let store = MemoryObjectStore::new();
        store.fail_next_puts(1);
        assert!(store.put("k", bytes_stream("x"), "t").await.is_err());
        assert!(store.put("k", bytes_stream("x"), "t").await.is_ok());
    }
}
