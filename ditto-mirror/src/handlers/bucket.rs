use tracing::debug;

use ditto_common::{BucketInfo, OpContext, StorageResult};

use super::{describe_key_sets, Mirror};
use crate::coordinator::EndState;
use crate::events::Operation;
use crate::outcome::{Outcome, ServedBy};

pub async fn make_bucket(
    m: Mirror<'_>,
    ctx: &OpContext,
    bucket: &str,
    location: &str,
) -> StorageResult<Outcome<()>> {
    let dw = m
        .dual_write(Operation::MakeBucket, bucket, None)
        .expecting(EndState::Present);
    dw.prime(ctx, m.prime.make_bucket_with_location(ctx, bucket, location))
        .await?;
    let actx = dw.alter_context(ctx);
    let alter = dw
        .alter(&actx, m.alter.make_bucket_with_location(&actx, bucket, location))
        .await;
    Ok(dw.finish((), alter))
}

pub async fn delete_bucket(m: Mirror<'_>, ctx: &OpContext, bucket: &str) -> StorageResult<Outcome<()>> {
    let dw = m
        .dual_write(Operation::DeleteBucket, bucket, None)
        .expecting(EndState::Absent);
    dw.prime(ctx, m.prime.delete_bucket(ctx, bucket)).await?;
    let actx = dw.alter_context(ctx);
    let alter = dw.alter(&actx, m.alter.delete_bucket(&actx, bucket)).await;
    Ok(dw.finish((), alter))
}

pub async fn get_bucket_info(
    m: Mirror<'_>,
    ctx: &OpContext,
    bucket: &str,
) -> StorageResult<Outcome<BucketInfo>> {
    let resolver = m.resolver(Operation::GetBucketInfo, bucket, None);
    let outcome = resolver
        .resolve(ctx, m.prime.get_bucket_info(ctx, bucket), || {
            m.alter.get_bucket_info(ctx, bucket)
        })
        .await?;

    if m.options.verify_reads && outcome.served_by == ServedBy::Primary {
        match ctx.bound(m.alter.get_bucket_info(ctx, bucket)).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => resolver.divergence("bucket missing on alter"),
            Err(e) => debug!(bucket = %bucket, error = %e, "Cross-check skipped"),
        }
    }
    Ok(outcome)
}

/// Prime's bucket set is authoritative; Alter only answers while Prime is down.
pub async fn list_buckets(m: Mirror<'_>, ctx: &OpContext) -> StorageResult<Outcome<Vec<BucketInfo>>> {
    let resolver = m.resolver(Operation::ListBuckets, "", None);
    let outcome = resolver
        .resolve(ctx, m.prime.list_buckets(ctx), || m.alter.list_buckets(ctx))
        .await?;

    if m.options.verify_reads && outcome.served_by == ServedBy::Primary {
        match ctx.bound(m.alter.list_buckets(ctx)).await {
            Ok(alter) => {
                let prime_names = outcome.value.iter().map(|b| b.name.as_str());
                if let Some(detail) = describe_key_sets(prime_names, alter.iter().map(|b| b.name.as_str())) {
                    resolver.divergence(detail);
                }
            }
            Err(e) => debug!(error = %e, "Cross-check skipped"),
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use crate::config::MirrorOptions;
    use crate::events::EventKind;
    use crate::handlers::testing::{fixture, fixture_with};
    use crate::outcome::ServedBy;
    use ditto_backend::{Fault, Op};
    use ditto_common::{ErrorKind, ObjectLayer, OpContext};

    #[tokio::test]
    async fn test_make_bucket_twice_succeeds() {
        let f = fixture();
        let ctx = OpContext::background();
        let first = f.layer.make_bucket_with_location(&ctx, "photos", "").await.unwrap();
        let second = f.layer.make_bucket_with_location(&ctx, "photos", "").await.unwrap();
        assert_eq!(first.served_by, ServedBy::Mirrored);
        assert_eq!(second.served_by, ServedBy::Mirrored);
        assert!(f.log.events().is_empty());
    }

    #[tokio::test]
    async fn test_make_bucket_prime_failure_skips_alter() {
        let f = fixture();
        f.prime.fail(Op::MakeBucket, Fault::Unavailable);
        let err = f
            .layer
            .make_bucket_with_location(&OpContext::background(), "photos", "")
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(f.alter.calls(Op::MakeBucket), 0);
    }

    #[tokio::test]
    async fn test_make_bucket_alter_failure_degrades() {
        let f = fixture();
        f.alter.fail(Op::MakeBucket, Fault::Rejected);
        let outcome = f
            .layer
            .make_bucket_with_location(&OpContext::background(), "photos", "")
            .await
            .unwrap();
        assert!(outcome.is_degraded());
        assert_eq!(f.log.count(EventKind::PartialMirrorFailure), 1);
        let event = &f.log.events()[0];
        assert_eq!(event.bucket, "photos");
        assert_eq!(event.error_kind, Some(ErrorKind::BackendRejected));
    }

    #[tokio::test]
    async fn test_delete_bucket_missing_on_one_side() {
        let f = fixture();
        let ctx = OpContext::background();
        f.prime.make_bucket_with_location(&ctx, "photos", "").await.unwrap();

        let outcome = f.layer.delete_bucket(&ctx, "photos").await.unwrap();
        assert_eq!(outcome.served_by, ServedBy::Mirrored);
        assert!(f.prime.get_bucket_info(&ctx, "photos").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_non_empty_bucket_rejected() {
        let f = fixture();
        let ctx = OpContext::background();
        crate::handlers::testing::seed(f.prime.as_ref(), "photos", "a.jpg", b"x").await;
        f.alter.make_bucket_with_location(&ctx, "photos", "").await.unwrap();

        let err = f.layer.delete_bucket(&ctx, "photos").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendRejected);
        assert_eq!(f.alter.calls(Op::DeleteBucket), 0);
    }

    #[tokio::test]
    async fn test_bucket_info_not_masked_by_alter() {
        let f = fixture();
        let ctx = OpContext::background();
        f.alter.make_bucket_with_location(&ctx, "photos", "").await.unwrap();

        let err = f.layer.get_bucket_info(&ctx, "photos").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(f.alter.calls(Op::GetBucketInfo), 0);
    }

    #[tokio::test]
    async fn test_bucket_info_falls_back_during_outage() {
        let f = fixture();
        let ctx = OpContext::background();
        f.layer.make_bucket_with_location(&ctx, "photos", "").await.unwrap();
        f.prime.fail_all(Fault::Unavailable);

        let outcome = f.layer.get_bucket_info(&ctx, "photos").await.unwrap();
        assert_eq!(outcome.served_by, ServedBy::Fallback);
        assert_eq!(outcome.value.name, "photos");
        assert_eq!(f.log.count(EventKind::ReadFallback), 1);
    }

    #[tokio::test]
    async fn test_list_buckets_prime_authoritative() {
        let f = fixture();
        let ctx = OpContext::background();
        for name in ["aaa", "bbb"] {
            f.layer.make_bucket_with_location(&ctx, name, "").await.unwrap();
        }
        f.alter.make_bucket_with_location(&ctx, "ccc", "").await.unwrap();

        let outcome = f.layer.list_buckets(&ctx).await.unwrap();
        let names: Vec<&str> = outcome.value.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["aaa", "bbb"]);
        assert_eq!(outcome.served_by, ServedBy::Primary);

        f.prime.fail(Op::ListBuckets, Fault::Unavailable);
        let outcome = f.layer.list_buckets(&ctx).await.unwrap();
        assert_eq!(outcome.served_by, ServedBy::Fallback);
        assert_eq!(outcome.value.len(), 3);
    }

    #[tokio::test]
    async fn test_verify_reads_reports_bucket_divergence() {
        let f = fixture_with(MirrorOptions {
            verify_reads: true,
            ..MirrorOptions::default()
        });
        let ctx = OpContext::background();
        f.prime.make_bucket_with_location(&ctx, "aaa", "").await.unwrap();
        f.alter.make_bucket_with_location(&ctx, "bbb", "").await.unwrap();

        let outcome = f.layer.list_buckets(&ctx).await.unwrap();
        assert_eq!(outcome.value.len(), 1);
        f.layer.get_bucket_info(&ctx, "aaa").await.unwrap();

        let events = f.log.events();
        assert_eq!(f.log.count(EventKind::Divergence), 2);
        assert_eq!(events[0].error.as_deref(), Some("only on prime: aaa; only on alter: bbb"));
        assert_eq!(events[1].error.as_deref(), Some("bucket missing on alter"));
    }
}
