//! Object store gateway.
//!
//! Uploaded files land in an object store under a collision-free key
//! before anything else happens to them; the original bytes stay
//! retrievable even when later extraction or indexing fails. Provenance
//! (conversation and message ids, original filename) rides along as
//! per-object metadata so whole conversations can be cleaned up later
//! without a separate bookkeeping table.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::models::{Provenance, UploadedFile};

/// Maximum keys per bulk delete request (the S3 DeleteObjects limit).
pub const DELETE_BATCH_SIZE: usize = 1000;

/// Abstract object store (S3 or in-memory).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()>;

    async fn get_object(&self, key: &str) -> Result<Vec<u8>>;

    /// All object keys in the store, in no particular order.
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// Per-object metadata written at upload time.
    async fn head_metadata(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Bulk delete. Returns the number of objects removed.
    async fn delete_objects(&self, keys: &[String]) -> Result<usize>;
}

/// Build a storage key that never collides across uploads of the same
/// filename: a fresh UUID, keeping the original extension.
pub fn object_key_for(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => format!("{}.{}", Uuid::new_v4(), ext),
        _ => Uuid::new_v4().to_string(),
    }
}

/// Store a file's bytes with provenance metadata. Returns the object key.
pub async fn upload_file(
    store: &dyn ObjectStore,
    file: &UploadedFile,
    provenance: &Provenance,
) -> Result<String> {
    let key = object_key_for(&file.filename);

    let mut metadata = HashMap::new();
    metadata.insert("filename".to_string(), file.filename.clone());
    metadata.insert(
        "conversation_id".to_string(),
        provenance.conversation_id.clone(),
    );
    metadata.insert("message_id".to_string(), provenance.message_id.clone());

    store
        .put_object(&key, &file.content, &file.media_type, &metadata)
        .await
        .with_context(|| format!("failed to store object for '{}'", file.filename))?;

    Ok(key)
}

/// Delete every object whose metadata carries `value` under `key`.
///
/// Scans all keys, heads each for metadata, and bulk-deletes matches in
/// batches. Objects whose metadata cannot be read are skipped with a
/// warning rather than aborting the sweep; so are failed batches.
/// Returns the number of objects deleted.
pub async fn delete_by_metadata(
    store: &dyn ObjectStore,
    key: &str,
    value: &str,
) -> Result<usize> {
    let all_keys = store.list_keys().await?;

    let mut matched = Vec::new();
    for object_key in all_keys {
        match store.head_metadata(&object_key).await {
            Ok(metadata) => {
                if metadata.get(key).map(|v| v.as_str()) == Some(value) {
                    matched.push(object_key);
                }
            }
            Err(e) => {
                warn!(object_key = %object_key, error = %e, "skipping object with unreadable metadata");
            }
        }
    }

    let mut deleted = 0;
    for batch in matched.chunks(DELETE_BATCH_SIZE) {
        match store.delete_objects(batch).await {
            Ok(n) => deleted += n,
            Err(e) => {
                warn!(batch_len = batch.len(), error = %e, "bulk delete batch failed");
            }
        }
    }

    Ok(deleted)
}

struct StoredObject {
    bytes: Vec<u8>,
    metadata: HashMap<String, String>,
}

/// In-memory object store for tests and offline use.
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored objects. Test helper.
    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        self.objects.write().unwrap().insert(
            key.to_string(),
            StoredObject {
                bytes: bytes.to_vec(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        match self.objects.read().unwrap().get(key) {
            Some(object) => Ok(object.bytes.clone()),
            None => anyhow::bail!("No such object: {}", key),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.objects.read().unwrap().keys().cloned().collect())
    }

    async fn head_metadata(&self, key: &str) -> Result<HashMap<String, String>> {
        match self.objects.read().unwrap().get(key) {
            Some(object) => Ok(object.metadata.clone()),
            None => anyhow::bail!("No such object: {}", key),
        }
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<usize> {
        let mut objects = self.objects.write().unwrap();
        let mut deleted = 0;
        for key in keys {
            if objects.remove(key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
