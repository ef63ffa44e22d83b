//! Fault-injecting wrapper around another backend.
//!
//! Used to exercise outage, rejection and slow-backend paths of the mirror.
//! Faults are armed per operation or for the whole backend and can be
//! cleared at any time; every call is counted whether or not it failed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use ditto_common::{
    BucketInfo, ByteRange, HashReader, ListObjectsInfo, ListObjectsQuery, ListObjectsV2Info,
    ListObjectsV2Query, ObjectInfo, ObjectLayer, ObjectOptions, ObjectSink, OpContext,
    StorageError, StorageInfo, StorageResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    StorageInfo,
    MakeBucket,
    GetBucketInfo,
    ListBuckets,
    DeleteBucket,
    ListObjects,
    ListObjectsV2,
    GetObject,
    GetObjectInfo,
    PutObject,
    CopyObject,
    DeleteObject,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::StorageInfo => "storage_info",
            Op::MakeBucket => "make_bucket",
            Op::GetBucketInfo => "get_bucket_info",
            Op::ListBuckets => "list_buckets",
            Op::DeleteBucket => "delete_bucket",
            Op::ListObjects => "list_objects",
            Op::ListObjectsV2 => "list_objects_v2",
            Op::GetObject => "get_object",
            Op::GetObjectInfo => "get_object_info",
            Op::PutObject => "put_object",
            Op::CopyObject => "copy_object",
            Op::DeleteObject => "delete_object",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a transient error.
    Unavailable,
    /// Fail with a permanent permission error.
    Rejected,
    /// Report the bucket or object as absent.
    NotFound,
    /// Delay the call, then forward it. Subject to the caller's deadline.
    Stall(Duration),
    /// For reads, stream this many bytes and then fail transiently.
    /// Other operations fail as [`Fault::Unavailable`].
    BreakAfter(u64),
}

impl Fault {
    fn error(&self, op: Op, bucket: &str, key: Option<&str>) -> StorageError {
        match (self, key) {
            (Fault::NotFound, Some(key)) => StorageError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            (Fault::NotFound, None) => StorageError::BucketNotFound(bucket.to_string()),
            (Fault::Rejected, _) => {
                StorageError::AccessDenied(format!("injected rejection on {}", op.as_str()))
            }
            _ => StorageError::Unavailable(format!("injected outage on {}", op.as_str())),
        }
    }
}

pub struct FaultyBackend {
    inner: Arc<dyn ObjectLayer>,
    faults: Mutex<HashMap<Op, Fault>>,
    outage: Mutex<Option<Fault>>,
    calls: Mutex<HashMap<Op, usize>>,
}

impl FaultyBackend {
    pub fn new(inner: Arc<dyn ObjectLayer>) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
            outage: Mutex::new(None),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &Arc<dyn ObjectLayer> {
        &self.inner
    }

    /// Arm `fault` for every future call of `op`.
    pub fn fail(&self, op: Op, fault: Fault) {
        self.faults.lock().expect("lock poisoned").insert(op, fault);
    }

    /// Arm `fault` for every operation. Per-operation faults take precedence.
    pub fn fail_all(&self, fault: Fault) {
        *self.outage.lock().expect("lock poisoned") = Some(fault);
    }

    /// Clear all armed faults.
    pub fn heal(&self) {
        self.faults.lock().expect("lock poisoned").clear();
        *self.outage.lock().expect("lock poisoned") = None;
    }

    pub fn calls(&self, op: Op) -> usize {
        self.calls
            .lock()
            .expect("lock poisoned")
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().expect("lock poisoned").values().sum()
    }

    fn armed(&self, op: Op) -> Option<Fault> {
        *self.calls.lock().expect("lock poisoned").entry(op).or_insert(0) += 1;
        if let Some(fault) = self.faults.lock().expect("lock poisoned").get(&op) {
            return Some(*fault);
        }
        *self.outage.lock().expect("lock poisoned")
    }

    /// Count the call and apply whatever fault is armed for it.
    async fn inject(
        &self,
        ctx: &OpContext,
        op: Op,
        bucket: &str,
        key: Option<&str>,
    ) -> StorageResult<()> {
        match self.armed(op) {
            None => Ok(()),
            Some(Fault::Stall(delay)) => stall(ctx, delay).await,
            Some(fault) => {
                debug!(op = op.as_str(), bucket = %bucket, fault = ?fault, "Injecting fault");
                Err(fault.error(op, bucket, key))
            }
        }
    }
}

#[async_trait]
impl ObjectLayer for FaultyBackend {
    async fn shutdown(&self, ctx: &OpContext) -> StorageResult<()> {
        self.inner.shutdown(ctx).await
    }

    async fn storage_info(&self, ctx: &OpContext) -> StorageResult<StorageInfo> {
        self.inject(ctx, Op::StorageInfo, "", None).await?;
        self.inner.storage_info(ctx).await
    }

    async fn make_bucket_with_location(
        &self,
        ctx: &OpContext,
        bucket: &str,
        location: &str,
    ) -> StorageResult<()> {
        self.inject(ctx, Op::MakeBucket, bucket, None).await?;
        self.inner.make_bucket_with_location(ctx, bucket, location).await
    }

    async fn get_bucket_info(&self, ctx: &OpContext, bucket: &str) -> StorageResult<BucketInfo> {
        self.inject(ctx, Op::GetBucketInfo, bucket, None).await?;
        self.inner.get_bucket_info(ctx, bucket).await
    }

    async fn list_buckets(&self, ctx: &OpContext) -> StorageResult<Vec<BucketInfo>> {
        self.inject(ctx, Op::ListBuckets, "", None).await?;
        self.inner.list_buckets(ctx).await
    }

    async fn delete_bucket(&self, ctx: &OpContext, bucket: &str) -> StorageResult<()> {
        self.inject(ctx, Op::DeleteBucket, bucket, None).await?;
        self.inner.delete_bucket(ctx, bucket).await
    }

    async fn list_objects(
        &self,
        ctx: &OpContext,
        bucket: &str,
        query: &ListObjectsQuery,
    ) -> StorageResult<ListObjectsInfo> {
        self.inject(ctx, Op::ListObjects, bucket, None).await?;
        self.inner.list_objects(ctx, bucket, query).await
    }

    async fn list_objects_v2(
        &self,
        ctx: &OpContext,
        bucket: &str,
        query: &ListObjectsV2Query,
    ) -> StorageResult<ListObjectsV2Info> {
        self.inject(ctx, Op::ListObjectsV2, bucket, None).await?;
        self.inner.list_objects_v2(ctx, bucket, query).await
    }

    async fn get_object(
        &self,
        ctx: &OpContext,
        bucket: &str,
        key: &str,
        range: ByteRange,
        sink: &mut ObjectSink<'_>,
        etag: Option<&str>,
        opts: &ObjectOptions,
    ) -> StorageResult<()> {
        match self.armed(Op::GetObject) {
            None => {}
            Some(Fault::Stall(delay)) => stall(ctx, delay).await?,
            Some(Fault::BreakAfter(limit)) => {
                let mut body = Vec::new();
                self.inner
                    .get_object(ctx, bucket, key, range, &mut body, etag, opts)
                    .await?;
                let cut = body.len().min(usize::try_from(limit).unwrap_or(usize::MAX));
                sink.write_all(&body[..cut]).await?;
                return Err(Fault::BreakAfter(limit).error(Op::GetObject, bucket, Some(key)));
            }
            Some(fault) => return Err(fault.error(Op::GetObject, bucket, Some(key))),
        }
        self.inner
            .get_object(ctx, bucket, key, range, sink, etag, opts)
            .await
    }

    async fn get_object_info(
        &self,
        ctx: &OpContext,
        bucket: &str,
        key: &str,
        opts: &ObjectOptions,
    ) -> StorageResult<ObjectInfo> {
        self.inject(ctx, Op::GetObjectInfo, bucket, Some(key)).await?;
        self.inner.get_object_info(ctx, bucket, key, opts).await
    }

    async fn put_object(
        &self,
        ctx: &OpContext,
        bucket: &str,
        key: &str,
        data: HashReader,
        metadata: HashMap<String, String>,
        opts: &ObjectOptions,
    ) -> StorageResult<ObjectInfo> {
        // On failure `data` is dropped unread, like a backend that hung up.
        self.inject(ctx, Op::PutObject, bucket, Some(key)).await?;
        self.inner
            .put_object(ctx, bucket, key, data, metadata, opts)
            .await
    }

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
    ) -> StorageResult<ObjectInfo> {
        self.inject(ctx, Op::CopyObject, src_bucket, Some(src_key)).await?;
        self.inner
            .copy_object(
                ctx, src_bucket, src_key, dst_bucket, dst_key, src_info, src_opts, dst_opts,
            )
            .await
    }

    async fn delete_object(&self, ctx: &OpContext, bucket: &str, key: &str) -> StorageResult<()> {
        self.inject(ctx, Op::DeleteObject, bucket, Some(key)).await?;
        self.inner.delete_object(ctx, bucket, key).await
    }

    fn backend_type(&self) -> &'static str {
        self.inner.backend_type()
    }
}

async fn stall(ctx: &OpContext, delay: Duration) -> StorageResult<()> {
    debug!(delay_ms = delay.as_millis() as u64, "Stalling call");
    ctx.bound(async {
        tokio::time::sleep(delay).await;
        Ok(())
    })
    .await
}

impl std::fmt::Debug for FaultyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyBackend")
            .field("inner", &self.inner.backend_type())
            .field("faults", &self.faults.lock().map(|f| f.len()).unwrap_or(0))
            .finish()
    }
}
