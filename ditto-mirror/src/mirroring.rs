//! The mirroring facade.
//!
//! [`MirroringLayer`] is itself an [`ObjectLayer`], so it drops in wherever a
//! single backend is expected. Its inherent methods carry the same names but
//! return an [`Outcome`] telling the caller which backend(s) served the call.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use ditto_common::{
    BucketInfo, ByteRange, HashReader, ListObjectsInfo, ListObjectsQuery, ListObjectsV2Info,
    ListObjectsV2Query, ObjectInfo, ObjectLayer, ObjectOptions, ObjectSink, OpContext,
    StorageError, StorageInfo, StorageResult,
};

use crate::config::{MirrorConfig, MirrorOptions};
use crate::events::{MirrorLog, TracingLog};
use crate::handlers::{self, Mirror};
use crate::outcome::Outcome;

pub struct MirroringLayer {
    prime: Arc<dyn ObjectLayer>,
    alter: Arc<dyn ObjectLayer>,
    log: Arc<dyn MirrorLog>,
    options: MirrorOptions,
}

impl MirroringLayer {
    pub fn new(prime: Arc<dyn ObjectLayer>, alter: Arc<dyn ObjectLayer>) -> Self {
        Self {
            prime,
            alter,
            log: Arc::new(TracingLog),
            options: MirrorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: MirrorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_log(mut self, log: Arc<dyn MirrorLog>) -> Self {
        self.log = log;
        self
    }

    /// Build both backends from configuration.
    pub fn from_config(config: &MirrorConfig) -> anyhow::Result<Self> {
        let prime = ditto_backend::from_config(&config.prime)?;
        let alter = ditto_backend::from_config(&config.alter)?;
        info!(
            prime = prime.backend_type(),
            alter = alter.backend_type(),
            put_strategy = ?config.mirror.put_strategy,
            "Mirroring layer configured"
        );
        Ok(Self::new(prime, alter).with_options(config.mirror.clone()))
    }

    pub fn prime(&self) -> &Arc<dyn ObjectLayer> {
        &self.prime
    }

    pub fn alter(&self) -> &Arc<dyn ObjectLayer> {
        &self.alter
    }

    pub fn options(&self) -> &MirrorOptions {
        &self.options
    }

    fn mirror(&self) -> Mirror<'_> {
        Mirror {
            prime: self.prime.as_ref(),
            alter: self.alter.as_ref(),
            log: self.log.as_ref(),
            options: &self.options,
        }
    }

    // ── Buckets ──────────────────────────────────────────────────────────────

    pub async fn make_bucket_with_location(
        &self,
        ctx: &OpContext,
        bucket: &str,
        location: &str,
    ) -> StorageResult<Outcome<()>> {
        handlers::bucket::make_bucket(self.mirror(), ctx, bucket, location).await
    }

    pub async fn get_bucket_info(
        &self,
        ctx: &OpContext,
        bucket: &str,
    ) -> StorageResult<Outcome<BucketInfo>> {
        handlers::bucket::get_bucket_info(self.mirror(), ctx, bucket).await
    }

    pub async fn list_buckets(&self, ctx: &OpContext) -> StorageResult<Outcome<Vec<BucketInfo>>> {
        handlers::bucket::list_buckets(self.mirror(), ctx).await
    }

    pub async fn delete_bucket(&self, ctx: &OpContext, bucket: &str) -> StorageResult<Outcome<()>> {
        handlers::bucket::delete_bucket(self.mirror(), ctx, bucket).await
    }

    // ── Listing ──────────────────────────────────────────────────────────────

    pub async fn list_objects(
        &self,
        ctx: &OpContext,
        bucket: &str,
        query: &ListObjectsQuery,
    ) -> StorageResult<Outcome<ListObjectsInfo>> {
        handlers::listing::list_objects(self.mirror(), ctx, bucket, query).await
    }

    pub async fn list_objects_v2(
        &self,
        ctx: &OpContext,
        bucket: &str,
        query: &ListObjectsV2Query,
    ) -> StorageResult<Outcome<ListObjectsV2Info>> {
        handlers::listing::list_objects_v2(self.mirror(), ctx, bucket, query).await
    }

    // ── Objects ──────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn get_object(
        &self,
        ctx: &OpContext,
        bucket: &str,
        key: &str,
        range: ByteRange,
        sink: &mut ObjectSink<'_>,
        etag: Option<&str>,
        opts: &ObjectOptions,
    ) -> StorageResult<Outcome<()>> {
        handlers::object::get_object(self.mirror(), ctx, bucket, key, range, sink, etag, opts).await
    }

    pub async fn get_object_info(
        &self,
        ctx: &OpContext,
        bucket: &str,
        key: &str,
        opts: &ObjectOptions,
    ) -> StorageResult<Outcome<ObjectInfo>> {
        handlers::object::get_object_info(self.mirror(), ctx, bucket, key, opts).await
    }

    pub async fn put_object(
        &self,
        ctx: &OpContext,
        bucket: &str,
        key: &str,
        data: HashReader,
        metadata: HashMap<String, String>,
        opts: &ObjectOptions,
    ) -> StorageResult<Outcome<ObjectInfo>> {
        handlers::put::put_object(self.mirror(), ctx, bucket, key, data, metadata, opts).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn copy_object(
        &self,
        ctx: &OpContext,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        src_info: &ObjectInfo,
        src_opts: &ObjectOptions,
        dst_opts: &ObjectOptions,
    ) -> StorageResult<Outcome<ObjectInfo>> {
        handlers::object::copy_object(
            self.mirror(),
            ctx,
            src_bucket,
            src_key,
            dst_bucket,
            dst_key,
            src_info,
            src_opts,
            dst_opts,
        )
        .await
    }

    pub async fn delete_object(
        &self,
        ctx: &OpContext,
        bucket: &str,
        key: &str,
    ) -> StorageResult<Outcome<()>> {
        handlers::object::delete_object(self.mirror(), ctx, bucket, key).await
    }
}

#[async_trait]
impl ObjectLayer for MirroringLayer {
    async fn shutdown(&self, _ctx: &OpContext) -> StorageResult<()> {
        Ok(())
    }

    async fn storage_info(&self, _ctx: &OpContext) -> StorageResult<StorageInfo> {
        Err(StorageError::Unsupported("storage_info"))
    }

    async fn make_bucket_with_location(
        &self,
        ctx: &OpContext,
        bucket: &str,
        location: &str,
    ) -> StorageResult<()> {
        handlers::bucket::make_bucket(self.mirror(), ctx, bucket, location)
            .await
            .map(Outcome::into_inner)
    }

    async fn get_bucket_info(&self, ctx: &OpContext, bucket: &str) -> StorageResult<BucketInfo> {
        handlers::bucket::get_bucket_info(self.mirror(), ctx, bucket)
            .await
            .map(Outcome::into_inner)
    }

    async fn list_buckets(&self, ctx: &OpContext) -> StorageResult<Vec<BucketInfo>> {
        handlers::bucket::list_buckets(self.mirror(), ctx)
            .await
            .map(Outcome::into_inner)
    }

    async fn delete_bucket(&self, ctx: &OpContext, bucket: &str) -> StorageResult<()> {
        handlers::bucket::delete_bucket(self.mirror(), ctx, bucket)
            .await
            .map(Outcome::into_inner)
    }

    async fn list_objects(
        &self,
        ctx: &OpContext,
        bucket: &str,
        query: &ListObjectsQuery,
    ) -> StorageResult<ListObjectsInfo> {
        handlers::listing::list_objects(self.mirror(), ctx, bucket, query)
            .await
            .map(Outcome::into_inner)
    }

    async fn list_objects_v2(
        &self,
        ctx: &OpContext,
        bucket: &str,
        query: &ListObjectsV2Query,
    ) -> StorageResult<ListObjectsV2Info> {
        handlers::listing::list_objects_v2(self.mirror(), ctx, bucket, query)
            .await
            .map(Outcome::into_inner)
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
        handlers::object::get_object(self.mirror(), ctx, bucket, key, range, sink, etag, opts)
            .await
            .map(Outcome::into_inner)
    }

    async fn get_object_info(
        &self,
        ctx: &OpContext,
        bucket: &str,
        key: &str,
        opts: &ObjectOptions,
    ) -> StorageResult<ObjectInfo> {
        handlers::object::get_object_info(self.mirror(), ctx, bucket, key, opts)
            .await
            .map(Outcome::into_inner)
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
        handlers::put::put_object(self.mirror(), ctx, bucket, key, data, metadata, opts)
            .await
            .map(Outcome::into_inner)
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
        handlers::object::copy_object(
            self.mirror(),
            ctx,
            src_bucket,
            src_key,
            dst_bucket,
            dst_key,
            src_info,
            src_opts,
            dst_opts,
        )
        .await
        .map(Outcome::into_inner)
    }

    async fn delete_object(&self, ctx: &OpContext, bucket: &str, key: &str) -> StorageResult<()> {
        handlers::object::delete_object(self.mirror(), ctx, bucket, key)
            .await
            .map(Outcome::into_inner)
    }

    fn backend_type(&self) -> &'static str {
        "mirroring"
    }
}

impl std::fmt::Debug for MirroringLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirroringLayer")
            .field("prime", &self.prime.backend_type())
            .field("alter", &self.alter.backend_type())
            .field("options", &self.options)
            .finish()
    }
}
