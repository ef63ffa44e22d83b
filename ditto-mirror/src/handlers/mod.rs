//! Per-operation mirroring protocols.
//!
//! Each handler is a free function over a [`Mirror`], a short-lived bundle
//! of the two backends, the event log and the options, built by the facade
//! for a single call.

pub mod bucket;
pub mod listing;
pub mod object;
pub mod put;

use std::collections::BTreeSet;

use tracing::debug;

use ditto_common::{ObjectInfo, ObjectLayer, ObjectOptions, OpContext};

use crate::config::MirrorOptions;
use crate::coordinator::{describe_mismatch, DualWrite};
use crate::events::{MirrorEvent, MirrorLog, Operation};
use crate::resolver::ReadResolver;

#[derive(Clone, Copy)]
pub struct Mirror<'a> {
    pub prime: &'a dyn ObjectLayer,
    pub alter: &'a dyn ObjectLayer,
    pub log: &'a dyn MirrorLog,
    pub options: &'a MirrorOptions,
}

impl<'a> Mirror<'a> {
    pub fn dual_write<'s>(
        &self,
        operation: Operation,
        bucket: &'s str,
        key: Option<&'s str>,
    ) -> DualWrite<'s>
    where
        'a: 's,
    {
        DualWrite::new(self.log, self.options.alter_grace(), operation, bucket, key)
    }

    pub fn resolver<'s>(
        &self,
        operation: Operation,
        bucket: &'s str,
        key: Option<&'s str>,
    ) -> ReadResolver<'s>
    where
        'a: 's,
    {
        ReadResolver::new(self.log, operation, bucket, key)
    }

    pub fn record(&self, event: MirrorEvent) {
        self.log.record(event);
    }

    /// Compare an object Prime served against Alter's copy.
    ///
    /// Only runs when `verify_reads` is on. Never fails the read.
    pub async fn cross_check_object(
        &self,
        ctx: &OpContext,
        resolver: &ReadResolver<'_>,
        bucket: &str,
        key: &str,
        prime_info: &ObjectInfo,
        opts: &ObjectOptions,
    ) {
        if !self.options.verify_reads {
            return;
        }
        match ctx.bound(self.alter.get_object_info(ctx, bucket, key, opts)).await {
            Ok(alter_info) => {
                if let Some(detail) = describe_mismatch(prime_info, &alter_info) {
                    resolver.divergence(detail);
                }
            }
            Err(e) if e.is_not_found() => resolver.divergence("object missing on alter"),
            Err(e) => debug!(bucket = %bucket, key = %key, error = %e, "Cross-check skipped"),
        }
    }
}

/// Describe which names exist on only one side.
pub(crate) fn describe_key_sets<'k>(
    prime: impl IntoIterator<Item = &'k str>,
    alter: impl IntoIterator<Item = &'k str>,
) -> Option<String> {
    let prime: BTreeSet<&str> = prime.into_iter().collect();
    let alter: BTreeSet<&str> = alter.into_iter().collect();
    let only_prime: Vec<&str> = prime.difference(&alter).copied().collect();
    let only_alter: Vec<&str> = alter.difference(&prime).copied().collect();

    let mut parts = Vec::new();
    if !only_prime.is_empty() {
        parts.push(format!("only on prime: {}", only_prime.join(",")));
    }
    if !only_alter.is_empty() {
        parts.push(format!("only on alter: {}", only_alter.join(",")));
    }
    (!parts.is_empty()).then(|| parts.join("; "))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_key_sets() {
        assert_eq!(describe_key_sets(["a", "b"], ["b", "a"]), None);
        assert_eq!(
            describe_key_sets(["a", "b"], ["a", "b", "c"]).as_deref(),
            Some("only on alter: c")
        );
        assert_eq!(
            describe_key_sets(["a", "x"], ["a", "y"]).as_deref(),
            Some("only on prime: x; only on alter: y")
        );
    }
}
