use tracing::debug;

use ditto_common::{
    ListObjectsInfo, ListObjectsQuery, ListObjectsV2Info, ListObjectsV2Query, OpContext,
    StorageResult,
};

use super::{describe_key_sets, Mirror};
use crate::events::Operation;
use crate::outcome::{Outcome, ServedBy};

pub async fn list_objects(
    m: Mirror<'_>,
    ctx: &OpContext,
    bucket: &str,
    query: &ListObjectsQuery,
) -> StorageResult<Outcome<ListObjectsInfo>> {
    let resolver = m.resolver(Operation::ListObjects, bucket, None);
    let outcome = resolver
        .resolve(ctx, m.prime.list_objects(ctx, bucket, query), || {
            m.alter.list_objects(ctx, bucket, query)
        })
        .await?;

    if m.options.verify_reads && outcome.served_by == ServedBy::Primary {
        match ctx.bound(m.alter.list_objects(ctx, bucket, query)).await {
            Ok(alter) => {
                if let Some(detail) = describe_key_sets(outcome.value.keys(), alter.keys()) {
                    resolver.divergence(detail);
                }
            }
            Err(e) => debug!(bucket = %bucket, error = %e, "Cross-check skipped"),
        }
    }
    Ok(outcome)
}

pub async fn list_objects_v2(
    m: Mirror<'_>,
    ctx: &OpContext,
    bucket: &str,
    query: &ListObjectsV2Query,
) -> StorageResult<Outcome<ListObjectsV2Info>> {
    let resolver = m.resolver(Operation::ListObjectsV2, bucket, None);
    let outcome = resolver
        .resolve(ctx, m.prime.list_objects_v2(ctx, bucket, query), || {
            m.alter.list_objects_v2(ctx, bucket, query)
        })
        .await?;

    if m.options.verify_reads && outcome.served_by == ServedBy::Primary {
        match ctx.bound(m.alter.list_objects_v2(ctx, bucket, query)).await {
            Ok(alter) => {
                if let Some(detail) = describe_key_sets(outcome.value.keys(), alter.keys()) {
                    resolver.divergence(detail);
                }
            }
            Err(e) => debug!(bucket = %bucket, error = %e, "Cross-check skipped"),
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use crate::config::MirrorOptions;
    use crate::events::EventKind;
    use crate::handlers::testing::{fixture, fixture_with, seed};
    use crate::outcome::ServedBy;
    use ditto_backend::{Fault, Op};
    use ditto_common::{ListObjectsQuery, ListObjectsV2Query, OpContext};

    #[tokio::test]
    async fn test_listing_follows_prime() {
        let f = fixture();
        let ctx = OpContext::background();
        for key in ["a", "b"] {
            seed(f.prime.as_ref(), "docs", key, b"x").await;
        }
        for key in ["a", "b", "c"] {
            seed(f.alter.as_ref(), "docs", key, b"x").await;
        }

        let outcome = f
            .layer
            .list_objects(&ctx, "docs", &ListObjectsQuery::default())
            .await
            .unwrap();
        assert_eq!(outcome.value.keys(), vec!["a", "b"]);
        assert_eq!(outcome.served_by, ServedBy::Primary);
        assert!(f.log.events().is_empty());
    }

    #[tokio::test]
    async fn test_listing_v2_falls_back_on_outage() {
        let f = fixture();
        let ctx = OpContext::background();
        seed(f.alter.as_ref(), "docs", "a", b"x").await;
        f.prime.fail(Op::ListObjectsV2, Fault::Unavailable);

        let outcome = f
            .layer
            .list_objects_v2(&ctx, "docs", &ListObjectsV2Query::default())
            .await
            .unwrap();
        assert_eq!(outcome.served_by, ServedBy::Fallback);
        assert_eq!(outcome.value.keys(), vec!["a"]);
        assert_eq!(f.log.count(EventKind::ReadFallback), 1);
    }

    #[tokio::test]
    async fn test_listing_missing_bucket_not_masked() {
        let f = fixture();
        let ctx = OpContext::background();
        seed(f.alter.as_ref(), "docs", "a", b"x").await;

        let err = f
            .layer
            .list_objects(&ctx, "docs", &ListObjectsQuery::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_verify_reads_reports_listing_divergence() {
        let f = fixture_with(MirrorOptions {
            verify_reads: true,
            ..MirrorOptions::default()
        });
        let ctx = OpContext::background();
        seed(f.prime.as_ref(), "docs", "a", b"x").await;
        seed(f.alter.as_ref(), "docs", "a", b"x").await;
        seed(f.alter.as_ref(), "docs", "c", b"x").await;

        let outcome = f
            .layer
            .list_objects_v2(&ctx, "docs", &ListObjectsV2Query::default())
            .await
            .unwrap();
        assert_eq!(outcome.value.keys(), vec!["a"]);
        assert_eq!(f.log.count(EventKind::Divergence), 1);
        assert_eq!(f.log.events()[0].error.as_deref(), Some("only on alter: c"));
    }
}
