//! Dual-write coordinator.
//!
//! A mutation runs against Prime first. Prime's failure is final and Alter is
//! never touched. Once Prime has committed, Alter is attempted; its failure
//! downgrades the result to [`ServedBy::Degraded`](crate::ServedBy) and is
//! recorded exactly once as a `PartialMirrorFailure` event, but never undoes
//! Prime.
//!
//! The protocol is exposed as explicit steps (`prime`, `alter_context`,
//! `alter`, `finish`) so each handler can build the Alter call from the
//! context the coordinator hands back.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use ditto_common::{ErrorKind, ObjectInfo, OpContext, StorageError, StorageResult};

use crate::events::{EventKind, MirrorEvent, MirrorLog, Operation};
use crate::outcome::{BackendRole, Outcome};

/// End state a mutation drives a resource to.
///
/// Reaching it by other means counts as success for that leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndState {
    /// No idempotence; every error is a failure.
    Applied,
    /// Resource exists afterwards. `AlreadyExists` is success.
    Present,
    /// Resource is gone afterwards. `NotFound` is success.
    Absent,
}

impl EndState {
    fn absorbs(&self, err: &StorageError) -> bool {
        matches!(
            (self, err.kind()),
            (EndState::Present, ErrorKind::AlreadyExists) | (EndState::Absent, ErrorKind::NotFound)
        )
    }
}

pub struct DualWrite<'a> {
    log: &'a dyn MirrorLog,
    grace: Duration,
    operation: Operation,
    bucket: &'a str,
    key: Option<&'a str>,
    end_state: EndState,
}

impl<'a> DualWrite<'a> {
    pub fn new(
        log: &'a dyn MirrorLog,
        grace: Duration,
        operation: Operation,
        bucket: &'a str,
        key: Option<&'a str>,
    ) -> Self {
        Self {
            log,
            grace,
            operation,
            bucket,
            key,
            end_state: EndState::Applied,
        }
    }

    pub fn expecting(mut self, end_state: EndState) -> Self {
        self.end_state = end_state;
        self
    }

    /// Run the Prime leg. An error here is the operation's result.
    pub async fn prime<T, F>(&self, ctx: &OpContext, leg: F) -> StorageResult<T>
    where
        T: Default,
        F: Future<Output = StorageResult<T>>,
    {
        self.settle(BackendRole::Prime, ctx.bound(leg).await)
    }

    /// Context the Alter leg must run under.
    ///
    /// A caller that gave up after Prime committed would otherwise leave the
    /// mirror half-applied, so Alter then runs detached for `grace`.
    pub fn alter_context(&self, ctx: &OpContext) -> OpContext {
        if !ctx.is_cancelled() && !ctx.is_expired() {
            return ctx.clone();
        }
        warn!(
            operation = %self.operation,
            bucket = %self.bucket,
            key = %self.key.unwrap_or(""),
            grace_ms = self.grace.as_millis() as u64,
            "Caller gave up after prime committed, finishing alter detached"
        );
        self.log.record(MirrorEvent::new(
            EventKind::CancelledAfterPrime,
            self.operation,
            self.bucket,
            self.key,
            BackendRole::Alter,
        ));
        ctx.detached(self.grace)
    }

    /// Run the Alter leg. Call only after [`DualWrite::prime`] succeeded.
    pub async fn alter<T, F>(&self, ctx: &OpContext, leg: F) -> StorageResult<T>
    where
        T: Default,
        F: Future<Output = StorageResult<T>>,
    {
        self.settle(BackendRole::Alter, ctx.bound(leg).await)
    }

    /// Combine Prime's value with the Alter leg's result.
    pub fn finish<T, U>(&self, value: T, alter: StorageResult<U>) -> Outcome<T> {
        match alter {
            Ok(_) => Outcome::mirrored(value),
            Err(e) => {
                self.partial_failure(&e);
                Outcome::degraded(value)
            }
        }
    }

    /// Record that Alter did not apply what Prime applied.
    pub fn partial_failure(&self, err: &StorageError) {
        warn!(
            operation = %self.operation,
            bucket = %self.bucket,
            key = %self.key.unwrap_or(""),
            error = %err,
            "Alter failed after prime committed"
        );
        self.log.record(
            MirrorEvent::new(
                EventKind::PartialMirrorFailure,
                self.operation,
                self.bucket,
                self.key,
                BackendRole::Alter,
            )
            .with_error(err),
        );
    }

    /// Log a divergence when the two committed copies disagree. Prime wins.
    pub fn reconcile_info(&self, prime: &ObjectInfo, alter: &ObjectInfo) {
        if let Some(detail) = describe_mismatch(prime, alter) {
            self.log.record(
                MirrorEvent::new(
                    EventKind::Divergence,
                    self.operation,
                    self.bucket,
                    self.key,
                    BackendRole::Alter,
                )
                .with_detail(detail),
            );
        }
    }

    fn settle<T: Default>(&self, role: BackendRole, result: StorageResult<T>) -> StorageResult<T> {
        match result {
            Ok(value) => {
                debug!(operation = %self.operation, backend = %role, bucket = %self.bucket, "Leg applied");
                Ok(value)
            }
            Err(e) if self.end_state.absorbs(&e) => {
                debug!(
                    operation = %self.operation,
                    backend = %role,
                    bucket = %self.bucket,
                    error = %e,
                    "Leg already in requested state"
                );
                Ok(T::default())
            }
            Err(e) => Err(e),
        }
    }
}

/// Describe how two copies of an object differ in size or ETag.
pub(crate) fn describe_mismatch(prime: &ObjectInfo, alter: &ObjectInfo) -> Option<String> {
    let mut diffs = Vec::new();
    if prime.size != alter.size {
        diffs.push(format!("size {} != {}", prime.size, alter.size));
    }
    if prime.etag != alter.etag {
        diffs.push(format!("etag {} != {}", prime.etag, alter.etag));
    }
    (!diffs.is_empty()).then(|| diffs.join(", "))
}
