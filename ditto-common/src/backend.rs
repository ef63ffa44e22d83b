use std::collections::HashMap;

use tokio::io::AsyncWrite;

use crate::context::OpContext;
use crate::error::{StorageError, StorageResult};
use crate::hash::HashReader;
use crate::types::{
    BucketInfo, ByteRange, ListObjectsInfo, ListObjectsQuery, ListObjectsV2Info,
    ListObjectsV2Query, ObjectInfo, ObjectOptions, StorageInfo,
};

/// Byte sink a ranged read streams into.
pub type ObjectSink<'a> = dyn AsyncWrite + Send + Unpin + 'a;

/// Object-storage capability set implemented by every backend.
///
/// Both halves of a mirror implement this trait, and so does the mirror
/// itself. Implementations own their concurrency control; callers may issue
/// any number of calls in parallel.
#[async_trait::async_trait]
pub trait ObjectLayer: Send + Sync {
    /// Release backend resources. No-op by default.
    async fn shutdown(&self, _ctx: &OpContext) -> StorageResult<()> {
        Ok(())
    }

    async fn storage_info(&self, _ctx: &OpContext) -> StorageResult<StorageInfo> {
        Err(StorageError::Unsupported("storage_info"))
    }

    /// Create a bucket. Fails with `BucketExists` if it is already present.
    async fn make_bucket_with_location(
        &self,
        ctx: &OpContext,
        bucket: &str,
        location: &str,
    ) -> StorageResult<()>;

    async fn get_bucket_info(&self, ctx: &OpContext, bucket: &str) -> StorageResult<BucketInfo>;

    async fn list_buckets(&self, ctx: &OpContext) -> StorageResult<Vec<BucketInfo>>;

    /// Delete an empty bucket.
    async fn delete_bucket(&self, ctx: &OpContext, bucket: &str) -> StorageResult<()>;

    async fn list_objects(
        &self,
        ctx: &OpContext,
        bucket: &str,
        query: &ListObjectsQuery,
    ) -> StorageResult<ListObjectsInfo>;

    async fn list_objects_v2(
        &self,
        ctx: &OpContext,
        bucket: &str,
        query: &ListObjectsV2Query,
    ) -> StorageResult<ListObjectsV2Info>;

    /// Stream `range` of an object into `sink`.
    ///
    /// When `etag` is given the read fails with `PreconditionFailed` unless
    /// the stored object still carries it.
    #[allow(clippy::too_many_arguments)]
    async fn get_object(
        &self,
        ctx: &OpContext,
        bucket: &str,
        key: &str,
        range: ByteRange,
        sink: &mut ObjectSink<'_>,
        etag: Option<&str>,
        opts: &ObjectOptions,
    ) -> StorageResult<()>;

    async fn get_object_info(
        &self,
        ctx: &OpContext,
        bucket: &str,
        key: &str,
        opts: &ObjectOptions,
    ) -> StorageResult<ObjectInfo>;

    /// Store an object. The body must verify before anything is committed.
    async fn put_object(
        &self,
        ctx: &OpContext,
        bucket: &str,
        key: &str,
        data: HashReader,
        metadata: HashMap<String, String>,
        opts: &ObjectOptions,
    ) -> StorageResult<ObjectInfo>;

    /// Copy an object within this backend.
    #[allow(clippy::too_many_arguments)]
    async fn copy_object(
        &self,
        ctx: &OpContext,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        src_info: &ObjectInfo,
        src_opts: &ObjectOptions,
        dst_opts: &ObjectOptions,
    ) -> StorageResult<ObjectInfo>;

    async fn delete_object(&self, ctx: &OpContext, bucket: &str, key: &str) -> StorageResult<()>;

    /// Short name of the backend for logging.
    fn backend_type(&self) -> &'static str;
}
