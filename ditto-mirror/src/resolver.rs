//! Read resolver.
//!
//! Reads go to Prime. Only a transient Prime failure sends the read to Alter;
//! a `NotFound` from Prime is the answer, and rejections, hash failures and
//! cancellations propagate untouched. When Alter cannot answer either, the
//! caller sees Prime's error.

use std::future::Future;

use tracing::debug;

use ditto_common::{ErrorKind, OpContext, StorageError, StorageResult};

use crate::events::{EventKind, MirrorEvent, MirrorLog, Operation};
use crate::outcome::{BackendRole, Outcome};

/// Whether a Prime read failure may be answered from Alter.
pub fn fallback_allowed(err: &StorageError) -> bool {
    err.kind() == ErrorKind::BackendUnavailable
}

pub struct ReadResolver<'a> {
    log: &'a dyn MirrorLog,
    operation: Operation,
    bucket: &'a str,
    key: Option<&'a str>,
}

impl<'a> ReadResolver<'a> {
    pub fn new(
        log: &'a dyn MirrorLog,
        operation: Operation,
        bucket: &'a str,
        key: Option<&'a str>,
    ) -> Self {
        Self {
            log,
            operation,
            bucket,
            key,
        }
    }

    /// Resolve a read. `alter` is only invoked when Prime failed transiently.
    pub async fn resolve<T, P, A, AF>(&self, ctx: &OpContext, prime: P, alter: A) -> StorageResult<Outcome<T>>
    where
        P: Future<Output = StorageResult<T>>,
        A: FnOnce() -> AF,
        AF: Future<Output = StorageResult<T>>,
    {
        let prime_err = match ctx.bound(prime).await {
            Ok(value) => return Ok(Outcome::primary(value)),
            Err(e) if fallback_allowed(&e) => e,
            Err(e) => return Err(e),
        };

        match ctx.bound(alter()).await {
            Ok(value) => {
                self.log.record(
                    MirrorEvent::new(
                        EventKind::ReadFallback,
                        self.operation,
                        self.bucket,
                        self.key,
                        BackendRole::Prime,
                    )
                    .with_error(&prime_err),
                );
                Ok(Outcome::fallback(value))
            }
            Err(alter_err) => {
                debug!(
                    operation = %self.operation,
                    bucket = %self.bucket,
                    prime_error = %prime_err,
                    alter_error = %alter_err,
                    "Fallback read failed"
                );
                Err(prime_err)
            }
        }
    }

    /// Record that Alter disagrees with what Prime served.
    pub fn divergence(&self, detail: impl Into<String>) {
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
