//! Content-addressed resource caches.
//!
//! A resource cache identifies "this type + version + source + params, fetched
//! through this chain of custom types". Two builds asking for an equivalent
//! key get the same cache, so a worker holding an initialized volume for it
//! can skip the fetch entirely.
//!
//! Stores:
//! - `InMemoryResourceCacheFactory`: process-local, used by tests and nested fetches
//! - `FileResourceCacheFactory`: append-only JSONL, replayed on first use

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::domain::{Params, Source, Version, VersionedResourceTypes};
use crate::error::{CacheError, StepError};

/// A resolved resource cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCache {
    /// Store-assigned identifier
    pub id: u64,

    /// Hex SHA-256 of the cache identity
    pub key: String,

    /// Type the plan asked for (may be custom)
    pub resource_type: String,

    /// Base type at the bottom of the custom type chain
    pub base_type: String,

    /// Version fetched, if pinned
    pub version: Option<Version>,

    pub source_hash: String,
    pub params_hash: String,
}

impl ResourceCache {
    /// Only pinned versions identify a fixed set of bits worth reusing
    pub fn is_reusable(&self) -> bool {
        self.version.is_some()
    }
}

/// Finds or creates resource caches.
///
/// Implementations must be idempotent: equivalent keys always resolve to the
/// same cache, also under concurrent callers.
#[async_trait]
pub trait ResourceCacheFactory: Send + Sync {
    async fn find_or_create(
        &self,
        resource_type: &str,
        version: Option<&Version>,
        source: &Source,
        params: &Params,
        types: &VersionedResourceTypes,
    ) -> Result<ResourceCache, StepError>;
}

/// Identity of a resource cache, derived from interpolated inputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub key: String,
    pub base_type: String,
    pub source_hash: String,
    pub params_hash: String,
}

impl CacheKey {
    /// Derive the cache identity.
    ///
    /// Only the part of the type chain reachable from `resource_type`
    /// contributes, and chain entries contribute without their params.
    pub fn derive(
        resource_type: &str,
        version: Option<&Version>,
        source: &Source,
        params: &Params,
        types: &VersionedResourceTypes,
    ) -> Result<Self, StepError> {
        let base_type = types.base_type(resource_type)?;
        let chain: Vec<Value> = types
            .chain_for(resource_type)?
            .into_iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "type": t.type_name,
                    "source": t.source,
                    "version": t.version,
                    "privileged": t.privileged,
                })
            })
            .collect();

        let identity = json!({
            "type": resource_type,
            "version": version,
            "source": source,
            "params": params,
            "types": chain,
        });

        Ok(Self {
            key: hash_json(&identity),
            base_type,
            source_hash: hash_json(&Value::Object(source.clone())),
            params_hash: hash_json(&Value::Object(params.clone())),
        })
    }
}

/// Hex SHA-256 of a JSON value's canonical encoding (object keys sorted)
pub fn hash_json(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Caches indexed by key, shared by both stores
#[derive(Debug, Default)]
struct CacheIndex {
    by_key: HashMap<String, ResourceCache>,
    next_id: u64,
}

impl CacheIndex {
    fn insert_existing(&mut self, cache: ResourceCache) {
        self.next_id = self.next_id.max(cache.id);
        self.by_key.insert(cache.key.clone(), cache);
    }

    /// Returns the cache for `key` and whether it was newly created
    fn find_or_insert(
        &mut self,
        resource_type: &str,
        version: Option<&Version>,
        key: CacheKey,
    ) -> (ResourceCache, bool) {
        if let Some(existing) = self.by_key.get(&key.key) {
            return (existing.clone(), false);
        }

        self.next_id += 1;
        let cache = ResourceCache {
            id: self.next_id,
            key: key.key,
            resource_type: resource_type.to_string(),
            base_type: key.base_type,
            version: version.cloned(),
            source_hash: key.source_hash,
            params_hash: key.params_hash,
        };
        self.by_key.insert(cache.key.clone(), cache.clone());
        (cache, true)
    }
}

/// Process-local resource cache store
#[derive(Debug, Default)]
pub struct InMemoryResourceCacheFactory {
    index: Mutex<CacheIndex>,
}

impl InMemoryResourceCacheFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.by_key.len()
    }
}

#[async_trait]
impl ResourceCacheFactory for InMemoryResourceCacheFactory {
    #[instrument(skip_all, fields(resource_type = %resource_type))]
    async fn find_or_create(
        &self,
        resource_type: &str,
        version: Option<&Version>,
        source: &Source,
        params: &Params,
        types: &VersionedResourceTypes,
    ) -> Result<ResourceCache, StepError> {
        let key = CacheKey::derive(resource_type, version, source, params, types)?;
        let (cache, created) = self
            .index
            .lock()
            .await
            .find_or_insert(resource_type, version, key);

        debug!(cache_id = cache.id, created, "Resolved resource cache");
        Ok(cache)
    }
}

/// Resource cache store persisted as newline-delimited JSON records.
///
/// The lock is held across the append so concurrent callers with the same
/// key never write two records.
pub struct FileResourceCacheFactory {
    path: PathBuf,
    index: Mutex<Option<CacheIndex>>,
}

impl FileResourceCacheFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            index: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All caches on record, ordered by ID
    pub async fn list(&self) -> Result<Vec<ResourceCache>, CacheError> {
        let mut guard = self.index.lock().await;
        let index = self.loaded(&mut guard).await?;

        let mut caches: Vec<_> = index.by_key.values().cloned().collect();
        caches.sort_by_key(|c| c.id);
        Ok(caches)
    }

    async fn loaded<'a>(
        &self,
        guard: &'a mut Option<CacheIndex>,
    ) -> Result<&'a mut CacheIndex, CacheError> {
        if guard.is_none() {
            *guard = Some(self.replay().await?);
        }
        guard
            .as_mut()
            .ok_or_else(|| CacheError::Storage("cache index failed to load".to_string()))
    }

    async fn replay(&self) -> Result<CacheIndex, CacheError> {
        let mut index = CacheIndex::default();

        if !self.path.exists() {
            return Ok(index);
        }

        let file = File::open(&self.path).await.map_err(|e| {
            CacheError::Storage(format!("failed to open {}: {}", self.path.display(), e))
        })?;

        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))?
        {
            if line.trim().is_empty() {
                continue;
            }
            let cache: ResourceCache = serde_json::from_str(&line)
                .map_err(|e| CacheError::Corrupt(format!("{}: {}", e, line)))?;
            index.insert_existing(cache);
        }

        debug!(caches = index.by_key.len(), path = %self.path.display(), "Replayed resource caches");
        Ok(index)
    }

    async fn append(&self, cache: &ResourceCache) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::Storage(e.to_string()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                CacheError::Storage(format!("failed to open {}: {}", self.path.display(), e))
            })?;

        let json = serde_json::to_string(cache).map_err(|e| CacheError::Corrupt(e.to_string()))?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl ResourceCacheFactory for FileResourceCacheFactory {
    #[instrument(skip_all, fields(resource_type = %resource_type))]
    async fn find_or_create(
        &self,
        resource_type: &str,
        version: Option<&Version>,
        source: &Source,
        params: &Params,
        types: &VersionedResourceTypes,
    ) -> Result<ResourceCache, StepError> {
        let key = CacheKey::derive(resource_type, version, source, params, types)?;

        let mut guard = self.index.lock().await;
        let index = self.loaded(&mut guard).await?;

        let (cache, created) = index.find_or_insert(resource_type, version, key);
        if created {
            if let Err(e) = self.append(&cache).await {
                index.by_key.remove(&cache.key);
                return Err(e.into());
            }
            info!(cache_id = cache.id, "Created resource cache");
        }

        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VersionedResourceType;
    use serde_json::json;

    fn source(value: Value) -> Source {
        value.as_object().cloned().unwrap()
    }

    fn version(v: &str) -> Version {
        [("ref".to_string(), v.to_string())].into_iter().collect()
    }

    #[test]
    fn test_key_is_stable() {
        let types = VersionedResourceTypes::default();
        let a = CacheKey::derive("git", Some(&version("1")), &source(json!({"uri": "x", "branch": "main"})), &Params::new(), &types).unwrap();
        let b = CacheKey::derive("git", Some(&version("1")), &source(json!({"branch": "main", "uri": "x"})), &Params::new(), &types).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.key.len(), 64);
    }

    #[test]
    fn test_key_depends_on_version_and_source() {
        let types = VersionedResourceTypes::default();
        let base = CacheKey::derive("git", Some(&version("1")), &source(json!({"uri": "x"})), &Params::new(), &types).unwrap();
        let other_version = CacheKey::derive("git", Some(&version("2")), &source(json!({"uri": "x"})), &Params::new(), &types).unwrap();
        let other_source = CacheKey::derive("git", Some(&version("1")), &source(json!({"uri": "y"})), &Params::new(), &types).unwrap();

        assert_ne!(base.key, other_version.key);
        assert_ne!(base.key, other_source.key);
    }

    #[test]
    fn test_chain_params_do_not_affect_key() {
        let mut custom = VersionedResourceType {
            name: "custom".to_string(),
            type_name: "registry-image".to_string(),
            source: source(json!({"repository": "img"})),
            ..Default::default()
        };
        let plain = VersionedResourceTypes::new(vec![custom.clone()]);
        custom.params = source(json!({"format": "oci"}));
        let with_params = VersionedResourceTypes::new(vec![custom]);

        let a = CacheKey::derive("custom", None, &Source::new(), &Params::new(), &plain).unwrap();
        let b = CacheKey::derive("custom", None, &Source::new(), &Params::new(), &with_params).unwrap();

        assert_eq!(a.key, b.key);
        assert_eq!(a.base_type, "registry-image");
    }

    #[test]
    fn test_unrelated_types_do_not_affect_key() {
        let unrelated = VersionedResourceTypes::new(vec![VersionedResourceType {
            name: "slack".to_string(),
            type_name: "registry-image".to_string(),
            ..Default::default()
        }]);

        let a = CacheKey::derive("git", None, &Source::new(), &Params::new(), &VersionedResourceTypes::default()).unwrap();
        let b = CacheKey::derive("git", None, &Source::new(), &Params::new(), &unrelated).unwrap();

        assert_eq!(a.key, b.key);
    }

    #[tokio::test]
    async fn test_in_memory_is_idempotent() {
        let factory = InMemoryResourceCacheFactory::new();
        let types = VersionedResourceTypes::default();
        let src = source(json!({"uri": "x"}));

        let first = factory.find_or_create("git", Some(&version("1")), &src, &Params::new(), &types).await.unwrap();
        let second = factory.find_or_create("git", Some(&version("1")), &src, &Params::new(), &types).await.unwrap();
        let third = factory.find_or_create("git", Some(&version("2")), &src, &Params::new(), &types).await.unwrap();

        assert_eq!(first, second);
        assert_ne!(first.id, third.id);
        assert_eq!(factory.len().await, 2);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("caches.jsonl");
        let src = source(json!({"uri": "x"}));
        let types = VersionedResourceTypes::default();

        let created = {
            let factory = FileResourceCacheFactory::new(&path);
            factory.find_or_create("git", Some(&version("1")), &src, &Params::new(), &types).await.unwrap()
        };

        let reopened = FileResourceCacheFactory::new(&path);
        let found = reopened.find_or_create("git", Some(&version("1")), &src, &Params::new(), &types).await.unwrap();
        let next = reopened.find_or_create("git", Some(&version("2")), &src, &Params::new(), &types).await.unwrap();

        assert_eq!(created, found);
        assert_eq!(next.id, created.id + 1);
        assert_eq!(reopened.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_file_store_reports_unreachable_storage() {
        let temp = tempfile::TempDir::new().unwrap();
        // A directory where the file should be
        let path = temp.path().join("caches.jsonl");
        std::fs::create_dir_all(&path).unwrap();

        let factory = FileResourceCacheFactory::new(&path);
        let err = factory
            .find_or_create("git", None, &Source::new(), &Params::new(), &VersionedResourceTypes::default())
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::Cache(CacheError::Storage(_))));
    }
}
