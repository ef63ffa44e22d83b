//! In-memory backend.
//!
//! Buckets and objects live in a `BTreeMap` behind a `RwLock`, so listings
//! come out in key order for free. Bodies are fully read and verified before
//! the map is touched; a failed upload never leaves anything behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use ditto_common::types::{
    paginate, paginate_v2, validate_bucket_name, validate_object_name, CONTENT_TYPE_KEY,
};
use ditto_common::{
    BucketInfo, ByteRange, HashReader, ListObjectsInfo, ListObjectsQuery, ListObjectsV2Info,
    ListObjectsV2Query, ObjectInfo, ObjectLayer, ObjectOptions, ObjectSink, OpContext,
    StorageError, StorageInfo, StorageResult,
};

struct StoredObject {
    data: Bytes,
    info: ObjectInfo,
}

struct Bucket {
    info: BucketInfo,
    objects: BTreeMap<String, StoredObject>,
}

#[derive(Default)]
pub struct MemoryBackend {
    buckets: RwLock<BTreeMap<String, Bucket>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects stored in `bucket`, or `None` if it does not exist.
    pub fn object_count(&self, bucket: &str) -> Option<usize> {
        let buckets = self.buckets.read().expect("lock poisoned");
        buckets.get(bucket).map(|b| b.objects.len())
    }

    /// Whether `bucket/key` is present.
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        let buckets = self.buckets.read().expect("lock poisoned");
        buckets
            .get(bucket)
            .is_some_and(|b| b.objects.contains_key(key))
    }

    fn object_info(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo> {
        let buckets = self.buckets.read().expect("lock poisoned");
        let b = buckets
            .get(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
        b.objects
            .get(key)
            .map(|o| o.info.clone())
            .ok_or_else(|| not_found(bucket, key))
    }

    fn sorted_objects(&self, bucket: &str) -> StorageResult<Vec<ObjectInfo>> {
        let buckets = self.buckets.read().expect("lock poisoned");
        let b = buckets
            .get(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
        Ok(b.objects.values().map(|o| o.info.clone()).collect())
    }

    fn insert(&self, bucket: &str, key: &str, data: Bytes, info: ObjectInfo) -> StorageResult<()> {
        let mut buckets = self.buckets.write().expect("lock poisoned");
        let b = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
        b.objects.insert(key.to_string(), StoredObject { data, info });
        Ok(())
    }
}

fn not_found(bucket: &str, key: &str) -> StorageError {
    StorageError::ObjectNotFound {
        bucket: bucket.to_string(),
        key: key.to_string(),
    }
}

fn reject_versions(opts: &ObjectOptions) -> StorageResult<()> {
    if opts.version_id.is_some() {
        return Err(StorageError::Unsupported("object versions"));
    }
    Ok(())
}

#[async_trait]
impl ObjectLayer for MemoryBackend {
    async fn storage_info(&self, _ctx: &OpContext) -> StorageResult<StorageInfo> {
        let buckets = self.buckets.read().expect("lock poisoned");
        let objects = buckets.values().map(|b| b.objects.len()).sum();
        let used_bytes = buckets
            .values()
            .flat_map(|b| b.objects.values())
            .map(|o| o.info.size)
            .sum();
        Ok(StorageInfo {
            backend: self.backend_type().to_string(),
            used_bytes,
            buckets: buckets.len(),
            objects,
        })
    }

    async fn make_bucket_with_location(
        &self,
        _ctx: &OpContext,
        bucket: &str,
        _location: &str,
    ) -> StorageResult<()> {
        validate_bucket_name(bucket)?;
        let mut buckets = self.buckets.write().expect("lock poisoned");
        if buckets.contains_key(bucket) {
            return Err(StorageError::BucketExists(bucket.to_string()));
        }
        buckets.insert(
            bucket.to_string(),
            Bucket {
                info: BucketInfo {
                    name: bucket.to_string(),
                    created: Utc::now(),
                },
                objects: BTreeMap::new(),
            },
        );
        debug!(bucket = %bucket, "Memory bucket created");
        Ok(())
    }

    async fn get_bucket_info(&self, _ctx: &OpContext, bucket: &str) -> StorageResult<BucketInfo> {
        let buckets = self.buckets.read().expect("lock poisoned");
        buckets
            .get(bucket)
            .map(|b| b.info.clone())
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))
    }

    async fn list_buckets(&self, _ctx: &OpContext) -> StorageResult<Vec<BucketInfo>> {
        let buckets = self.buckets.read().expect("lock poisoned");
        Ok(buckets.values().map(|b| b.info.clone()).collect())
    }

    async fn delete_bucket(&self, _ctx: &OpContext, bucket: &str) -> StorageResult<()> {
        let mut buckets = self.buckets.write().expect("lock poisoned");
        match buckets.get(bucket) {
            None => Err(StorageError::BucketNotFound(bucket.to_string())),
            Some(b) if !b.objects.is_empty() => {
                Err(StorageError::BucketNotEmpty(bucket.to_string()))
            }
            Some(_) => {
                buckets.remove(bucket);
                debug!(bucket = %bucket, "Memory bucket deleted");
                Ok(())
            }
        }
    }

    async fn list_objects(
        &self,
        _ctx: &OpContext,
        bucket: &str,
        query: &ListObjectsQuery,
    ) -> StorageResult<ListObjectsInfo> {
        let objects = self.sorted_objects(bucket)?;
        Ok(paginate(
            objects,
            &query.prefix,
            &query.marker,
            &query.delimiter,
            query.max_keys,
        ))
    }

    async fn list_objects_v2(
        &self,
        _ctx: &OpContext,
        bucket: &str,
        query: &ListObjectsV2Query,
    ) -> StorageResult<ListObjectsV2Info> {
        let objects = self.sorted_objects(bucket)?;
        paginate_v2(objects, query)
    }

    async fn get_object(
        &self,
        _ctx: &OpContext,
        bucket: &str,
        key: &str,
        range: ByteRange,
        sink: &mut ObjectSink<'_>,
        etag: Option<&str>,
        opts: &ObjectOptions,
    ) -> StorageResult<()> {
        reject_versions(opts)?;
        let slice = {
            let buckets = self.buckets.read().expect("lock poisoned");
            let b = buckets
                .get(bucket)
                .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
            let object = b.objects.get(key).ok_or_else(|| not_found(bucket, key))?;
            if let Some(expected) = etag {
                if expected != object.info.etag {
                    return Err(StorageError::PreconditionFailed(format!(
                        "etag {expected} does not match {}",
                        object.info.etag
                    )));
                }
            }
            let (start, len) = range.resolve(object.info.size)?;
            object.data.slice(start as usize..(start + len) as usize)
        };

        sink.write_all(&slice).await?;
        sink.flush().await?;
        Ok(())
    }

    async fn get_object_info(
        &self,
        _ctx: &OpContext,
        bucket: &str,
        key: &str,
        opts: &ObjectOptions,
    ) -> StorageResult<ObjectInfo> {
        reject_versions(opts)?;
        self.object_info(bucket, key)
    }

    async fn put_object(
        &self,
        _ctx: &OpContext,
        bucket: &str,
        key: &str,
        data: HashReader,
        metadata: HashMap<String, String>,
        opts: &ObjectOptions,
    ) -> StorageResult<ObjectInfo> {
        reject_versions(opts)?;
        validate_object_name(key)?;
        // Fail fast before consuming the body.
        self.get_bucket_info(&OpContext::background(), bucket).await?;

        let (body, etag) = data.read_verified().await?;
        let info = ObjectInfo {
            bucket: bucket.to_string(),
            name: key.to_string(),
            size: body.len() as u64,
            etag,
            content_type: metadata.get(CONTENT_TYPE_KEY).cloned(),
            mod_time: Utc::now(),
            user_defined: metadata,
        };
        self.insert(bucket, key, body, info.clone())?;
        debug!(bucket = %bucket, key = %key, size = info.size, "Memory object stored");
        Ok(info)
    }

    async fn copy_object(
        &self,
        _ctx: &OpContext,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        src_info: &ObjectInfo,
        src_opts: &ObjectOptions,
        dst_opts: &ObjectOptions,
    ) -> StorageResult<ObjectInfo> {
        reject_versions(src_opts)?;
        reject_versions(dst_opts)?;
        validate_object_name(dst_key)?;

        let (data, mut info) = {
            let buckets = self.buckets.read().expect("lock poisoned");
            let b = buckets
                .get(src_bucket)
                .ok_or_else(|| StorageError::BucketNotFound(src_bucket.to_string()))?;
            let object = b
                .objects
                .get(src_key)
                .ok_or_else(|| not_found(src_bucket, src_key))?;
            (object.data.clone(), object.info.clone())
        };

        info.bucket = dst_bucket.to_string();
        info.name = dst_key.to_string();
        info.mod_time = Utc::now();
        info.user_defined.extend(src_info.user_defined.clone());
        if src_info.content_type.is_some() {
            info.content_type = src_info.content_type.clone();
        }
        self.insert(dst_bucket, dst_key, data, info.clone())?;
        Ok(info)
    }

    async fn delete_object(&self, _ctx: &OpContext, bucket: &str, key: &str) -> StorageResult<()> {
        let mut buckets = self.buckets.write().expect("lock poisoned");
        let b = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
        b.objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| not_found(bucket, key))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buckets = self.buckets.read().expect("lock poisoned");
        f.debug_struct("MemoryBackend")
            .field("buckets", &buckets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ditto_common::sha256_hex;

    async fn put(store: &MemoryBackend, bucket: &str, key: &str, body: &'static [u8]) -> ObjectInfo {
        let data = HashReader::from_bytes(Bytes::from_static(body), Some(sha256_hex(body))).unwrap();
        store
            .put_object(&OpContext::background(), bucket, key, data, HashMap::new(), &ObjectOptions::default())
            .await
            .unwrap()
    }

    async fn read(store: &MemoryBackend, bucket: &str, key: &str, range: ByteRange) -> StorageResult<Vec<u8>> {
        let mut out = Vec::new();
        store
            .get_object(&OpContext::background(), bucket, key, range, &mut out, None, &ObjectOptions::default())
            .await?;
        Ok(out)
    }

    #[tokio::test]
    async fn test_bucket_lifecycle() {
        let store = MemoryBackend::new();
        let ctx = OpContext::background();
        store.make_bucket_with_location(&ctx, "photos", "").await.unwrap();

        let err = store.make_bucket_with_location(&ctx, "photos", "").await.unwrap_err();
        assert!(matches!(err, StorageError::BucketExists(_)));

        put(&store, "photos", "a.jpg", b"jpeg").await;
        let err = store.delete_bucket(&ctx, "photos").await.unwrap_err();
        assert!(matches!(err, StorageError::BucketNotEmpty(_)));

        store.delete_object(&ctx, "photos", "a.jpg").await.unwrap();
        store.delete_bucket(&ctx, "photos").await.unwrap();
        assert!(store.list_buckets(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_get_ranged() {
        let store = MemoryBackend::new();
        store
            .make_bucket_with_location(&OpContext::background(), "data", "")
            .await
            .unwrap();
        let info = put(&store, "data", "greeting.txt", b"hello world").await;
        assert_eq!(info.size, 11);
        assert_eq!(info.etag, sha256_hex(b"hello world"));

        assert_eq!(read(&store, "data", "greeting.txt", ByteRange::full()).await.unwrap(), b"hello world");
        assert_eq!(read(&store, "data", "greeting.txt", ByteRange::new(6, 5)).await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn test_corrupt_put_leaves_nothing() {
        let store = MemoryBackend::new();
        let ctx = OpContext::background();
        store.make_bucket_with_location(&ctx, "data", "").await.unwrap();

        let data = HashReader::from_bytes(Bytes::from_static(b"hi"), Some(sha256_hex(b"bye"))).unwrap();
        let err = store
            .put_object(&ctx, "data", "a.txt", data, HashMap::new(), &ObjectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::HashMismatch { .. }));
        assert!(!store.contains("data", "a.txt"));
    }

    #[tokio::test]
    async fn test_get_with_stale_etag() {
        let store = MemoryBackend::new();
        let ctx = OpContext::background();
        store.make_bucket_with_location(&ctx, "data", "").await.unwrap();
        put(&store, "data", "k", b"v1").await;

        let mut out = Vec::new();
        let err = store
            .get_object(&ctx, "data", "k", ByteRange::full(), &mut out, Some("deadbeef"), &ObjectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_copy_within_backend() {
        let store = MemoryBackend::new();
        let ctx = OpContext::background();
        store.make_bucket_with_location(&ctx, "src", "").await.unwrap();
        store.make_bucket_with_location(&ctx, "dst", "").await.unwrap();
        let src_info = put(&store, "src", "a", b"payload").await;

        let copied = store
            .copy_object(&ctx, "src", "a", "dst", "b", &src_info, &ObjectOptions::default(), &ObjectOptions::default())
            .await
            .unwrap();
        assert_eq!(copied.etag, src_info.etag);
        assert_eq!(read(&store, "dst", "b", ByteRange::full()).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_listing() {
        let store = MemoryBackend::new();
        let ctx = OpContext::background();
        store.make_bucket_with_location(&ctx, "data", "").await.unwrap();
        for key in ["logs/1", "logs/2", "readme"] {
            put(&store, "data", key, b"x").await;
        }

        let query = ListObjectsQuery {
            delimiter: "/".into(),
            ..Default::default()
        };
        let page = store.list_objects(&ctx, "data", &query).await.unwrap();
        assert_eq!(page.keys(), vec!["readme"]);
        assert_eq!(page.prefixes, vec!["logs/".to_string()]);

        let err = store.list_objects(&ctx, "missing", &query).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
