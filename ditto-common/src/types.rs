use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Upper bound on keys returned by one listing page.
pub const MAX_LIST_KEYS: usize = 1000;

/// Maximum object key length in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// User metadata key carrying the object's content type.
pub const CONTENT_TYPE_KEY: &str = "content-type";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketInfo {
    pub name: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectInfo {
    pub bucket: String,
    pub name: String,
    pub size: u64,
    /// Hex SHA-256 of the object body.
    pub etag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub mod_time: DateTime<Utc>,
    #[serde(default)]
    pub user_defined: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectOptions {
    pub version_id: Option<String>,
}

/// Byte range of a ranged read. `length: None` reads to the end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length: Some(length) }
    }

    /// Resolve against an object of `size` bytes into `(start, len)`.
    pub fn resolve(&self, size: u64) -> StorageResult<(u64, u64)> {
        if self.offset > size || (self.offset == size && size > 0 && self.length != Some(0)) {
            return Err(StorageError::InvalidRange { offset: self.offset, size });
        }
        let available = size - self.offset;
        let len = self.length.map_or(available, |l| l.min(available));
        Ok((self.offset, len))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageInfo {
    pub backend: String,
    pub used_bytes: u64,
    pub buckets: usize,
    pub objects: usize,
}

// ── Listing ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListObjectsQuery {
    pub prefix: String,
    pub marker: String,
    pub delimiter: String,
    pub max_keys: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListObjectsV2Query {
    pub prefix: String,
    pub continuation_token: Option<String>,
    pub delimiter: String,
    pub max_keys: usize,
    pub fetch_owner: bool,
    pub start_after: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListObjectsInfo {
    pub is_truncated: bool,
    pub next_marker: Option<String>,
    pub objects: Vec<ObjectInfo>,
    pub prefixes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListObjectsV2Info {
    pub is_truncated: bool,
    pub continuation_token: Option<String>,
    pub next_continuation_token: Option<String>,
    pub objects: Vec<ObjectInfo>,
    pub prefixes: Vec<String>,
}

impl ListObjectsInfo {
    pub fn keys(&self) -> Vec<&str> {
        self.objects.iter().map(|o| o.name.as_str()).collect()
    }
}

impl ListObjectsV2Info {
    pub fn keys(&self) -> Vec<&str> {
        self.objects.iter().map(|o| o.name.as_str()).collect()
    }
}

/// Build one listing page from objects sorted by key.
///
/// Keys at or before `marker` are skipped, keys outside `prefix` are dropped
/// and keys containing `delimiter` after the prefix are rolled up into a
/// common prefix. Each object and each common prefix counts against the page.
pub fn paginate(
    sorted: impl IntoIterator<Item = ObjectInfo>,
    prefix: &str,
    marker: &str,
    delimiter: &str,
    max_keys: usize,
) -> ListObjectsInfo {
    let limit = match max_keys {
        0 => MAX_LIST_KEYS,
        n => n.min(MAX_LIST_KEYS),
    };

    let mut page = ListObjectsInfo::default();
    let mut last_entry: Option<String> = None;
    let mut emitted = 0usize;

    for object in sorted {
        if !object.name.starts_with(prefix) || object.name.as_str() <= marker {
            continue;
        }

        let rollup = if delimiter.is_empty() {
            None
        } else {
            object.name[prefix.len()..]
                .find(delimiter)
                .map(|idx| object.name[..prefix.len() + idx + delimiter.len()].to_string())
        };

        if let Some(common) = rollup {
            if page.prefixes.last() == Some(&common) {
                continue;
            }
            // A prefix already covered by the marker was returned on an earlier page.
            if marker.starts_with(common.as_str()) {
                continue;
            }
            if emitted == limit {
                page.is_truncated = true;
                break;
            }
            last_entry = Some(common.clone());
            page.prefixes.push(common);
        } else {
            if emitted == limit {
                page.is_truncated = true;
                break;
            }
            last_entry = Some(object.name.clone());
            page.objects.push(object);
        }
        emitted += 1;
    }

    if page.is_truncated {
        page.next_marker = last_entry;
    }
    page
}

/// Encode the resume key of a V2 listing as an opaque token.
pub fn encode_continuation_token(key: &str) -> String {
    hex::encode(key.as_bytes())
}

pub fn decode_continuation_token(token: &str) -> StorageResult<String> {
    let bytes = hex::decode(token)
        .map_err(|_| StorageError::PreconditionFailed(format!("invalid continuation token: {token}")))?;
    String::from_utf8(bytes)
        .map_err(|_| StorageError::PreconditionFailed(format!("invalid continuation token: {token}")))
}

/// V2 listing on top of [`paginate`].
pub fn paginate_v2(
    sorted: impl IntoIterator<Item = ObjectInfo>,
    query: &ListObjectsV2Query,
) -> StorageResult<ListObjectsV2Info> {
    let marker = match &query.continuation_token {
        Some(token) => decode_continuation_token(token)?,
        None => query.start_after.clone(),
    };
    let page = paginate(sorted, &query.prefix, &marker, &query.delimiter, query.max_keys);
    Ok(ListObjectsV2Info {
        is_truncated: page.is_truncated,
        continuation_token: query.continuation_token.clone(),
        next_continuation_token: page.next_marker.as_deref().map(encode_continuation_token),
        objects: page.objects,
        prefixes: page.prefixes,
    })
}

// ── Name validation ──────────────────────────────────────────────────────────

pub fn validate_bucket_name(bucket: &str) -> StorageResult<()> {
    let invalid = || StorageError::InvalidBucketName(bucket.to_string());
    if !(3..=63).contains(&bucket.len()) {
        return Err(invalid());
    }
    let bytes = bucket.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return Err(invalid());
    }
    if !bytes
        .iter()
        .all(|&b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
    {
        return Err(invalid());
    }
    if bucket.contains("..") {
        return Err(invalid());
    }
    Ok(())
}

pub fn validate_object_name(key: &str) -> StorageResult<()> {
    let invalid = || StorageError::InvalidObjectName(key.to_string());
    if key.is_empty() || key.len() > MAX_KEY_LEN || key.starts_with('/') {
        return Err(invalid());
    }
    if key.split('/').any(|segment| segment == "." || segment == "..") {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn objects(keys: &[&str]) -> Vec<ObjectInfo> {
        let mut keys: Vec<&str> = keys.to_vec();
        keys.sort();
        keys.into_iter()
            .map(|k| ObjectInfo {
                bucket: "bucket".into(),
                name: k.into(),
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn test_paginate_prefix_and_delimiter() {
        let page = paginate(
            objects(&["a.txt", "photos/2024/x.jpg", "photos/2024/y.jpg", "photos/z.jpg", "zeta"]),
            "photos/",
            "",
            "/",
            0,
        );
        assert_eq!(page.keys(), vec!["photos/z.jpg"]);
        assert_eq!(page.prefixes, vec!["photos/2024/".to_string()]);
        assert!(!page.is_truncated);
    }

    #[test]
    fn test_paginate_truncation_and_marker() {
        let all = objects(&["a", "b", "c", "d", "e"]);
        let first = paginate(all.clone(), "", "", "", 2);
        assert_eq!(first.keys(), vec!["a", "b"]);
        assert!(first.is_truncated);
        assert_eq!(first.next_marker.as_deref(), Some("b"));

        let second = paginate(all, "", "b", "", 10);
        assert_eq!(second.keys(), vec!["c", "d", "e"]);
        assert!(!second.is_truncated);
        assert!(second.next_marker.is_none());
    }

    #[test]
    fn test_paginate_v2_continuation() {
        let all = objects(&["k1", "k2", "k3"]);
        let query = ListObjectsV2Query { max_keys: 2, ..Default::default() };
        let first = paginate_v2(all.clone(), &query).unwrap();
        assert_eq!(first.keys(), vec!["k1", "k2"]);
        let token = first.next_continuation_token.clone().unwrap();
        assert_ne!(token, "k2");

        let query = ListObjectsV2Query {
            max_keys: 2,
            continuation_token: Some(token),
            ..Default::default()
        };
        let second = paginate_v2(all, &query).unwrap();
        assert_eq!(second.keys(), vec!["k3"]);
        assert!(!second.is_truncated);
    }

    #[test]
    fn test_paginate_v2_start_after() {
        let query = ListObjectsV2Query {
            start_after: "k1".into(),
            ..Default::default()
        };
        let page = paginate_v2(objects(&["k1", "k2"]), &query).unwrap();
        assert_eq!(page.keys(), vec!["k2"]);
    }

    #[test]
    fn test_byte_range_resolve() {
        assert_eq!(ByteRange::full().resolve(10).unwrap(), (0, 10));
        assert_eq!(ByteRange::new(4, 100).resolve(10).unwrap(), (4, 6));
        assert_eq!(ByteRange::full().resolve(0).unwrap(), (0, 0));
        assert!(ByteRange::new(11, 1).resolve(10).is_err());
    }

    #[test]
    fn test_bucket_name_validation() {
        assert!(validate_bucket_name("my-bucket.01").is_ok());
        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name("Upper").is_err());
        assert!(validate_bucket_name(".hidden").is_err());
        assert!(validate_bucket_name("a..b").is_err());
        assert!(validate_bucket_name("trailing-").is_err());
    }

    #[test]
    fn test_object_name_validation() {
        assert!(validate_object_name("dir/file.txt").is_ok());
        assert!(validate_object_name("").is_err());
        assert!(validate_object_name("/abs").is_err());
        assert!(validate_object_name("a/../b").is_err());
    }
}
