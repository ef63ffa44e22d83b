//! Mirror event log.
//!
//! Conditions an operator must be able to see (a backend that fell behind,
//! a read served from the wrong half, a write cut short by cancellation) are
//! reported as [`MirrorEvent`]s through a [`MirrorLog`]. The default log
//! forwards to `tracing`; [`MemoryLog`] keeps events for inspection.

use std::sync::Mutex;

use tracing::{error, info, warn};

use ditto_common::{ErrorKind, StorageError};

use crate::outcome::BackendRole;

/// Logical operation a mirror event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
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

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::MakeBucket => "make_bucket",
            Operation::GetBucketInfo => "get_bucket_info",
            Operation::ListBuckets => "list_buckets",
            Operation::DeleteBucket => "delete_bucket",
            Operation::ListObjects => "list_objects",
            Operation::ListObjectsV2 => "list_objects_v2",
            Operation::GetObject => "get_object",
            Operation::GetObjectInfo => "get_object_info",
            Operation::PutObject => "put_object",
            Operation::CopyObject => "copy_object",
            Operation::DeleteObject => "delete_object",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Prime applied a mutation that Alter did not.
    PartialMirrorFailure,
    /// Prime was unavailable; Alter answered the read.
    ReadFallback,
    /// Prime did not have the object; Alter did.
    StaleRead,
    /// Both backends answered but disagree.
    Divergence,
    /// The caller went away after Prime committed; Alter ran detached.
    CancelledAfterPrime,
    /// A stray Alter copy was removed after a failed put.
    Compensated,
    /// Removing a stray Alter copy failed as well.
    CompensationFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PartialMirrorFailure => "partial_mirror_failure",
            EventKind::ReadFallback => "read_fallback",
            EventKind::StaleRead => "stale_read",
            EventKind::Divergence => "divergence",
            EventKind::CancelledAfterPrime => "cancelled_after_prime",
            EventKind::Compensated => "compensated",
            EventKind::CompensationFailed => "compensation_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorEvent {
    pub kind: EventKind,
    pub operation: Operation,
    pub bucket: String,
    pub key: Option<String>,
    /// Backend the event is about.
    pub backend: BackendRole,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

impl MirrorEvent {
    pub fn new(
        kind: EventKind,
        operation: Operation,
        bucket: &str,
        key: Option<&str>,
        backend: BackendRole,
    ) -> Self {
        Self {
            kind,
            operation,
            bucket: bucket.to_string(),
            key: key.map(str::to_string),
            backend,
            error_kind: None,
            error: None,
        }
    }

    pub fn with_error(mut self, err: &StorageError) -> Self {
        self.error_kind = Some(err.kind());
        self.error = Some(err.to_string());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.error = Some(detail.into());
        self
    }
}

pub trait MirrorLog: Send + Sync {
    fn record(&self, event: MirrorEvent);
}

/// Emits events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl MirrorLog for TracingLog {
    fn record(&self, event: MirrorEvent) {
        let key = event.key.as_deref().unwrap_or("");
        let error = event.error.as_deref().unwrap_or("");
        let error_kind = event.error_kind.map(|k| k.as_str()).unwrap_or("");
        match event.kind {
            EventKind::CompensationFailed => error!(
                event = event.kind.as_str(),
                operation = %event.operation,
                bucket = %event.bucket,
                key = %key,
                backend = %event.backend,
                error_kind = error_kind,
                error = %error,
                "Mirror compensation failed"
            ),
            EventKind::Compensated => info!(
                event = event.kind.as_str(),
                operation = %event.operation,
                bucket = %event.bucket,
                key = %key,
                backend = %event.backend,
                "Mirror compensation applied"
            ),
            _ => warn!(
                event = event.kind.as_str(),
                operation = %event.operation,
                bucket = %event.bucket,
                key = %key,
                backend = %event.backend,
                error_kind = error_kind,
                error = %error,
                "Mirror degraded"
            ),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryLog {
    events: Mutex<Vec<MirrorEvent>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MirrorEvent> {
        self.events.lock().expect("lock poisoned").clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("lock poisoned").clear();
    }
}

impl MirrorLog for MemoryLog {
    fn record(&self, event: MirrorEvent) {
        self.events.lock().expect("lock poisoned").push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_log_counts_by_kind() {
        let log = MemoryLog::new();
        let err = StorageError::Unavailable("down".into());
        log.record(
            MirrorEvent::new(EventKind::PartialMirrorFailure, Operation::PutObject, "b", Some("k"), BackendRole::Alter)
                .with_error(&err),
        );
        log.record(MirrorEvent::new(
            EventKind::ReadFallback,
            Operation::GetObject,
            "b",
            Some("k"),
            BackendRole::Prime,
        ));

        assert_eq!(log.count(EventKind::PartialMirrorFailure), 1);
        assert_eq!(log.count(EventKind::Divergence), 0);
        let events = log.events();
        assert_eq!(events[0].error_kind, Some(ErrorKind::BackendUnavailable));
        assert_eq!(events[0].key.as_deref(), Some("k"));

        log.clear();
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_tracing_log_accepts_every_kind() {
        let log = TracingLog;
        for kind in [
            EventKind::PartialMirrorFailure,
            EventKind::ReadFallback,
            EventKind::StaleRead,
            EventKind::Divergence,
            EventKind::CancelledAfterPrime,
            EventKind::Compensated,
            EventKind::CompensationFailed,
        ] {
            log.record(MirrorEvent::new(kind, Operation::DeleteObject, "b", None, BackendRole::Alter).with_detail("x"));
        }
    }
}
