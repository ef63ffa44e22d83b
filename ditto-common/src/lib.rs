//! Shared types for the ditto mirroring object layer: the backend capability
//! trait, object metadata, listing helpers, errors and request context.

pub mod backend;
pub mod context;
pub mod error;
pub mod hash;
pub mod types;

pub use backend::{ObjectLayer, ObjectSink};
pub use context::OpContext;
pub use error::{ErrorKind, StorageError, StorageResult};
pub use hash::{sha256_hex, HashReader};
pub use types::{
    BucketInfo, ByteRange, ListObjectsInfo, ListObjectsQuery, ListObjectsV2Info,
    ListObjectsV2Query, ObjectInfo, ObjectOptions, StorageInfo,
};
