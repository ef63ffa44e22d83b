use std::io;

/// Coarse classification of a [`StorageError`].
///
/// The mirroring engine decides fallback, idempotence and propagation from
/// the kind alone, never from the concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bucket or object absent on the queried backend.
    NotFound,
    /// Bucket already present; idempotent for creation.
    AlreadyExists,
    /// Transient failure, eligible for read fallback.
    BackendUnavailable,
    /// Permanent validation or permission failure. Never failed over.
    BackendRejected,
    /// Prime applied a mutation that Alter did not.
    PartialMirrorFailure,
    /// Payload failed its integrity check.
    HashMismatch,
    /// Operation not provided by this layer.
    Unsupported,
    /// Caller cancelled the request.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::BackendRejected => "backend_rejected",
            ErrorKind::PartialMirrorFailure => "partial_mirror_failure",
            ErrorKind::HashMismatch => "hash_mismatch",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),
    #[error("Object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },
    #[error("Bucket already exists: {0}")]
    BucketExists(String),
    #[error("Bucket not empty: {0}")]
    BucketNotEmpty(String),
    #[error("Invalid bucket name: {0}")]
    InvalidBucketName(String),
    #[error("Invalid object name: {0}")]
    InvalidObjectName(String),
    #[error("Invalid content digest: {0}")]
    InvalidDigest(String),
    #[error("Invalid range: offset {offset} beyond object size {size}")]
    InvalidRange { offset: u64, size: u64 },
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("Access denied: {0}")]
    AccessDenied(String),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Deadline exceeded")]
    DeadlineExceeded,
    #[error("Content hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },
    #[error("Incomplete body: expected {expected} bytes, received {received}")]
    IncompleteBody { expected: u64, received: u64 },
    #[error("Object too large: {size} bytes exceeds the limit of {limit}")]
    EntityTooLarge { size: u64, limit: u64 },
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Partial mirror failure during {operation}: {detail}")]
    PartialMirror { operation: String, detail: String },
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::BucketNotFound(_) | StorageError::ObjectNotFound { .. } => {
                ErrorKind::NotFound
            }
            StorageError::BucketExists(_) => ErrorKind::AlreadyExists,
            StorageError::BucketNotEmpty(_)
            | StorageError::InvalidBucketName(_)
            | StorageError::InvalidObjectName(_)
            | StorageError::InvalidDigest(_)
            | StorageError::InvalidRange { .. }
            | StorageError::PreconditionFailed(_)
            | StorageError::EntityTooLarge { .. }
            | StorageError::AccessDenied(_) => ErrorKind::BackendRejected,
            StorageError::Unavailable(_) | StorageError::DeadlineExceeded => {
                ErrorKind::BackendUnavailable
            }
            StorageError::HashMismatch { .. } | StorageError::IncompleteBody { .. } => {
                ErrorKind::HashMismatch
            }
            StorageError::Unsupported(_) => ErrorKind::Unsupported,
            StorageError::Cancelled => ErrorKind::Cancelled,
            StorageError::PartialMirror { .. } => ErrorKind::PartialMirrorFailure,
            StorageError::Io(e) => match e.kind() {
                io::ErrorKind::PermissionDenied
                | io::ErrorKind::InvalidInput
                | io::ErrorKind::InvalidData => ErrorKind::BackendRejected,
                _ => ErrorKind::BackendUnavailable,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::BackendUnavailable
    }

    /// Wrap into an `io::Error` so it can travel through `AsyncRead`/`AsyncWrite`.
    pub fn into_io(self) -> io::Error {
        match self {
            StorageError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<StorageError>()) {
            return StorageError::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<StorageError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => StorageError::Io(io::Error::new(kind, other)),
            None => StorageError::Io(io::Error::from(kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            StorageError::ObjectNotFound { bucket: "b".into(), key: "k".into() }.kind(),
            ErrorKind::NotFound
        );
        assert_eq!(StorageError::BucketExists("b".into()).kind(), ErrorKind::AlreadyExists);
        assert_eq!(StorageError::BucketNotEmpty("b".into()).kind(), ErrorKind::BackendRejected);
        assert_eq!(StorageError::DeadlineExceeded.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(
            StorageError::EntityTooLarge { size: 10, limit: 5 }.kind(),
            ErrorKind::BackendRejected
        );
        assert_eq!(
            StorageError::IncompleteBody { expected: 2, received: 1 }.kind(),
            ErrorKind::HashMismatch
        );
    }

    #[test]
    fn test_io_kind_classification() {
        let reset = StorageError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(reset.is_transient());

        let denied = StorageError::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(denied.kind(), ErrorKind::BackendRejected);
    }

    #[test]
    fn test_io_roundtrip_preserves_inner_error() {
        let original = StorageError::HashMismatch {
            expected: "aa".into(),
            computed: "bb".into(),
        };
        let back = StorageError::from(original.into_io());
        match back {
            StorageError::HashMismatch { expected, computed } => {
                assert_eq!(expected, "aa");
                assert_eq!(computed, "bb");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
