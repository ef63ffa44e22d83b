//! Local directory backend.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<bucket>/bucket.json                   bucket record
//! <root>/<bucket>/objects/<sha256(key)>.<uuid>  object body, one file per version
//! <root>/<bucket>/meta/<sha256(key)>            ObjectInfo plus the body file name
//! <root>/.tmp/                                  staging area
//! ```
//!
//! Keys are addressed by their hash so arbitrary keys (including ones that
//! are prefixes of each other) never collide on disk. Bodies are written to
//! a staging file that is removed again if the upload fails or is dropped.
//! A finished body is moved in under a fresh name, and the rename of its
//! metadata record is what makes it visible.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};
use walkdir::WalkDir;

use ditto_common::types::{
    paginate, paginate_v2, validate_bucket_name, validate_object_name, CONTENT_TYPE_KEY,
};
use ditto_common::{
    sha256_hex, BucketInfo, ByteRange, HashReader, ListObjectsInfo, ListObjectsQuery,
    ListObjectsV2Info, ListObjectsV2Query, ObjectInfo, ObjectLayer, ObjectOptions, ObjectSink,
    OpContext, StorageError, StorageInfo, StorageResult,
};

const BUCKET_RECORD: &str = "bucket.json";
const OBJECTS_DIR: &str = "objects";
const META_DIR: &str = "meta";
const STAGING_DIR: &str = ".tmp";

/// On-disk metadata record for one key.
#[derive(Debug, Serialize, Deserialize)]
struct ObjectRecord {
    #[serde(flatten)]
    info: ObjectInfo,
    /// File name of the current body under `objects/`.
    body: String,
}

fn invalid_data(e: serde_json::Error) -> StorageError {
    StorageError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn persist(staged: TempPath, dest: &Path) -> StorageResult<()> {
    staged.persist(dest).map_err(|e| StorageError::from(e.error))
}

pub struct DirectoryBackend {
    base_path: PathBuf,
}

impl DirectoryBackend {
    /// Open a backend rooted at `base_path`, creating the directory if needed.
    pub fn open(base_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(base_path.join(STAGING_DIR))
            .with_context(|| format!("Failed to create {}", base_path.display()))?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn bucket_path(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    fn objects_dir(&self, bucket: &str) -> PathBuf {
        self.bucket_path(bucket).join(OBJECTS_DIR)
    }

    fn meta_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.bucket_path(bucket).join(META_DIR).join(sha256_hex(key.as_bytes()))
    }

    /// Open a staging file. It is deleted when the returned path is dropped
    /// without being persisted.
    fn stage(&self) -> StorageResult<(tokio::fs::File, TempPath)> {
        let (file, path) = tempfile::Builder::new()
            .prefix("stage-")
            .tempfile_in(self.base_path.join(STAGING_DIR))?
            .into_parts();
        Ok((tokio::fs::File::from_std(file), path))
    }

    async fn stage_json<T: Serialize>(&self, value: &T) -> StorageResult<TempPath> {
        let json = serde_json::to_vec(value).map_err(invalid_data)?;
        let (mut file, path) = self.stage()?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        Ok(path)
    }

    async fn require_bucket(&self, bucket: &str) -> StorageResult<()> {
        validate_bucket_name(bucket)
            .map_err(|_| StorageError::BucketNotFound(bucket.to_string()))?;
        let record = self.bucket_path(bucket).join(BUCKET_RECORD);
        if !tokio::fs::try_exists(&record).await? {
            return Err(StorageError::BucketNotFound(bucket.to_string()));
        }
        Ok(())
    }

    async fn read_record(&self, bucket: &str, key: &str) -> StorageResult<ObjectRecord> {
        self.require_bucket(bucket).await?;
        let raw = match tokio::fs::read(self.meta_path(bucket, key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw).map_err(invalid_data)
    }

    /// Publish a staged body as the current version of `info`'s key.
    ///
    /// The metadata rename is the commit point: readers see either the old
    /// record and body or the new ones, never a mix.
    async fn commit(&self, staged: TempPath, info: ObjectInfo) -> StorageResult<()> {
        let previous = match self.read_record(&info.bucket, &info.name).await {
            Ok(record) => Some(record.body),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(bucket = %info.bucket, key = %info.name, error = %e, "Previous metadata record unreadable");
                None
            }
        };

        let record = ObjectRecord {
            body: format!(
                "{}.{}",
                sha256_hex(info.name.as_bytes()),
                uuid::Uuid::new_v4().simple()
            ),
            info,
        };
        let meta = self.stage_json(&record).await?;
        let objects = self.objects_dir(&record.info.bucket);
        let body_path = objects.join(&record.body);

        // Both renames run without yielding, so a dropped future cannot split them.
        persist(staged, &body_path)?;
        if let Err(e) = persist(meta, &self.meta_path(&record.info.bucket, &record.info.name)) {
            let _ = std::fs::remove_file(&body_path);
            return Err(e);
        }

        if let Some(old) = previous {
            match tokio::fs::remove_file(objects.join(&old)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %old, error = %e, "Failed to remove replaced body"),
            }
        }
        Ok(())
    }

    async fn sorted_objects(&self, bucket: &str) -> StorageResult<Vec<ObjectInfo>> {
        self.require_bucket(bucket).await?;
        let mut objects = Vec::new();
        let mut entries = tokio::fs::read_dir(self.bucket_path(bucket).join(META_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let raw = tokio::fs::read(entry.path()).await?;
            match serde_json::from_slice::<ObjectRecord>(&raw) {
                Ok(record) => objects.push(record.info),
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Skipping unreadable metadata record");
                }
            }
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }
}

#[async_trait]
impl ObjectLayer for DirectoryBackend {
    async fn storage_info(&self, _ctx: &OpContext) -> StorageResult<StorageInfo> {
        let root = self.base_path.clone();
        let (buckets, objects, used_bytes) = tokio::task::spawn_blocking(move || {
            let mut buckets = 0usize;
            let mut objects = 0usize;
            let mut used_bytes = 0u64;
            for entry in WalkDir::new(&root).min_depth(1).max_depth(3) {
                let Ok(entry) = entry else { continue };
                let depth = entry.depth();
                if depth == 1 && entry.file_type().is_dir() && entry.file_name() != STAGING_DIR {
                    buckets += 1;
                }
                let in_objects = entry
                    .path()
                    .parent()
                    .and_then(|p| p.file_name())
                    .is_some_and(|name| name == OBJECTS_DIR);
                if depth == 3 && in_objects && entry.file_type().is_file() {
                    objects += 1;
                    used_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
            }
            (buckets, objects, used_bytes)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("storage scan failed: {e}")))?;

        Ok(StorageInfo {
            backend: self.backend_type().to_string(),
            used_bytes,
            buckets,
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
        let path = self.bucket_path(bucket);
        let record = path.join(BUCKET_RECORD);
        if tokio::fs::try_exists(&record).await? {
            return Err(StorageError::BucketExists(bucket.to_string()));
        }

        tokio::fs::create_dir_all(path.join(OBJECTS_DIR)).await?;
        tokio::fs::create_dir_all(path.join(META_DIR)).await?;

        let info = BucketInfo {
            name: bucket.to_string(),
            created: Utc::now(),
        };
        persist(self.stage_json(&info).await?, &record)?;

        debug!(bucket = %bucket, "Directory bucket created");
        Ok(())
    }

    async fn get_bucket_info(&self, _ctx: &OpContext, bucket: &str) -> StorageResult<BucketInfo> {
        self.require_bucket(bucket).await?;
        let raw = tokio::fs::read(self.bucket_path(bucket).join(BUCKET_RECORD)).await?;
        serde_json::from_slice(&raw).map_err(invalid_data)
    }

    async fn list_buckets(&self, ctx: &OpContext) -> StorageResult<Vec<BucketInfo>> {
        let mut buckets = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == STAGING_DIR || !entry.metadata().await?.is_dir() {
                continue;
            }
            match self.get_bucket_info(ctx, &name).await {
                Ok(info) => buckets.push(info),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    async fn delete_bucket(&self, _ctx: &OpContext, bucket: &str) -> StorageResult<()> {
        self.require_bucket(bucket).await?;
        let path = self.bucket_path(bucket);
        let mut meta = tokio::fs::read_dir(path.join(META_DIR)).await?;
        if meta.next_entry().await?.is_some() {
            return Err(StorageError::BucketNotEmpty(bucket.to_string()));
        }
        tokio::fs::remove_dir_all(&path).await?;
        debug!(bucket = %bucket, "Directory bucket deleted");
        Ok(())
    }

    async fn list_objects(
        &self,
        _ctx: &OpContext,
        bucket: &str,
        query: &ListObjectsQuery,
    ) -> StorageResult<ListObjectsInfo> {
        let objects = self.sorted_objects(bucket).await?;
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
        let objects = self.sorted_objects(bucket).await?;
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
        if opts.version_id.is_some() {
            return Err(StorageError::Unsupported("object versions"));
        }
        let ObjectRecord { info, body: body_file } = self.read_record(bucket, key).await?;
        if let Some(expected) = etag {
            if expected != info.etag {
                return Err(StorageError::PreconditionFailed(format!(
                    "etag {expected} does not match {}",
                    info.etag
                )));
            }
        }
        let (start, len) = range.resolve(info.size)?;

        let mut file = match tokio::fs::File::open(self.objects_dir(bucket).join(body_file)).await {
            Ok(file) => file,
            // Replaced by a concurrent put after the record was read.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(start)).await?;
        let mut body = file.take(len);
        tokio::io::copy(&mut body, sink).await?;
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
        if opts.version_id.is_some() {
            return Err(StorageError::Unsupported("object versions"));
        }
        self.read_record(bucket, key).await.map(|record| record.info)
    }

    async fn put_object(
        &self,
        _ctx: &OpContext,
        bucket: &str,
        key: &str,
        mut data: HashReader,
        metadata: HashMap<String, String>,
        opts: &ObjectOptions,
    ) -> StorageResult<ObjectInfo> {
        if opts.version_id.is_some() {
            return Err(StorageError::Unsupported("object versions"));
        }
        validate_object_name(key)?;
        self.require_bucket(bucket).await?;

        let (mut file, staged) = self.stage()?;
        let written = async {
            let copied = tokio::io::copy(&mut data, &mut file).await?;
            file.sync_all().await?;
            Ok::<u64, StorageError>(copied)
        }
        .await;
        drop(file);
        let size = match written {
            Ok(size) => size,
            Err(e) => {
                debug!(bucket = %bucket, key = %key, error = %e, "Discarded staged upload");
                return Err(e);
            }
        };

        let etag = match data.computed_sha256() {
            Some(digest) => digest.to_string(),
            None => {
                return Err(StorageError::IncompleteBody {
                    expected: data.size(),
                    received: size,
                })
            }
        };

        let content_type = metadata.get(CONTENT_TYPE_KEY).cloned().or_else(|| {
            mime_guess::from_path(key)
                .first()
                .map(|mime| mime.essence_str().to_string())
        });
        let info = ObjectInfo {
            bucket: bucket.to_string(),
            name: key.to_string(),
            size,
            etag,
            content_type,
            mod_time: Utc::now(),
            user_defined: metadata,
        };

        self.commit(staged, info.clone()).await?;
        debug!(bucket = %bucket, key = %key, size = size, "Directory upload complete");
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
        if src_opts.version_id.is_some() || dst_opts.version_id.is_some() {
            return Err(StorageError::Unsupported("object versions"));
        }
        validate_object_name(dst_key)?;
        let ObjectRecord { mut info, body: body_file } = self.read_record(src_bucket, src_key).await?;
        self.require_bucket(dst_bucket).await?;

        let (mut file, staged) = self.stage()?;
        let mut src = tokio::fs::File::open(self.objects_dir(src_bucket).join(body_file)).await?;
        tokio::io::copy(&mut src, &mut file).await?;
        file.sync_all().await?;
        drop(file);

        info.bucket = dst_bucket.to_string();
        info.name = dst_key.to_string();
        info.mod_time = Utc::now();
        info.user_defined.extend(src_info.user_defined.clone());
        if src_info.content_type.is_some() {
            info.content_type = src_info.content_type.clone();
        }
        self.commit(staged, info.clone()).await?;
        Ok(info)
    }

    async fn delete_object(&self, _ctx: &OpContext, bucket: &str, key: &str) -> StorageResult<()> {
        // Surfaces ObjectNotFound for absent keys.
        let record = self.read_record(bucket, key).await?;
        tokio::fs::remove_file(self.meta_path(bucket, key)).await?;
        match tokio::fs::remove_file(self.objects_dir(bucket).join(&record.body)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(bucket = %bucket, key = %key, "Directory delete complete");
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "directory"
    }
}

impl std::fmt::Debug for DirectoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryBackend")
            .field("base_path", &self.base_path)
            .finish()
    }
}
