//! In-process collaborators, used by dry runs and tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CdnInvalidator, ObjectMetadata, ObjectStore, RemoteError, RemoteResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub metadata: ObjectMetadata,
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    puts: Mutex<Vec<String>>,
    operations: AtomicUsize,
    fail_puts: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an object without counting it as an operation.
    pub fn insert(&self, key: impl Into<String>, body: impl Into<Vec<u8>>, content_type: &str) {
        let object = StoredObject {
            body: body.into(),
            metadata: ObjectMetadata {
                content_type: content_type.to_string(),
                cache_control: String::new(),
            },
        };
        self.lock().insert(key.into(), object);
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Keys in the order `put` received them.
    pub fn put_log(&self) -> Vec<String> {
        self.puts.lock().map(|puts| puts.clone()).unwrap_or_default()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn count(&self) {
        self.operations.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> RemoteResult<Option<Vec<u8>>> {
        self.count();
        Ok(self.lock().get(key).map(|object| object.body.clone()))
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        cache_control: &str,
    ) -> RemoteResult<()> {
        self.count();
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(RemoteError::storage(key, "put rejected"));
        }
        if let Ok(mut puts) = self.puts.lock() {
            puts.push(key.to_string());
        }
        self.lock().insert(
            key.to_string(),
            StoredObject {
                body,
                metadata: ObjectMetadata {
                    content_type: content_type.to_string(),
                    cache_control: cache_control.to_string(),
                },
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> RemoteResult<bool> {
        self.count();
        Ok(self.lock().contains_key(key))
    }

    async fn copy(
        &self,
        source_key: &str,
        dest_key: &str,
        metadata: Option<&ObjectMetadata>,
    ) -> RemoteResult<()> {
        self.count();
        let mut objects = self.lock();
        let mut object = objects
            .get(source_key)
            .cloned()
            .ok_or_else(|| RemoteError::storage(source_key, "no such key"))?;
        if let Some(metadata) = metadata {
            object.metadata = metadata.clone();
        }
        objects.insert(dest_key.to_string(), object);
        Ok(())
    }

    async fn delete(&self, key: &str) -> RemoteResult<()> {
        self.count();
        self.lock().remove(key);
        Ok(())
    }
}

/// Records purge requests instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingInvalidator {
    urls: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingInvalidator {
    pub fn failing() -> Self {
        Self {
            urls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().map(|urls| urls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CdnInvalidator for RecordingInvalidator {
    async fn invalidate(&self, urls: &[String]) -> RemoteResult<()> {
        if self.fail {
            return Err(RemoteError::Config("purge endpoint unavailable".into()));
        }
        if let Ok(mut recorded) = self.urls.lock() {
            recorded.extend(urls.iter().cloned());
        }
        Ok(())
    }
}
