use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::AsyncWrite;
use tracing::debug;

use ditto_common::{
    ByteRange, ObjectInfo, ObjectOptions, ObjectSink, OpContext, StorageResult,
};

use super::Mirror;
use crate::coordinator::EndState;
use crate::events::{EventKind, MirrorEvent, Operation};
use crate::outcome::{BackendRole, Outcome, ServedBy};

/// Sink wrapper that counts the bytes a backend delivered.
struct CountingWriter<'a, 'b> {
    inner: &'a mut ObjectSink<'b>,
    written: u64,
}

impl<'a, 'b> CountingWriter<'a, 'b> {
    fn new(inner: &'a mut ObjectSink<'b>) -> Self {
        Self { inner, written: 0 }
    }

    fn written(&self) -> u64 {
        self.written
    }

    fn into_inner(self) -> &'a mut ObjectSink<'b> {
        self.inner
    }
}

impl AsyncWrite for CountingWriter<'_, '_> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut *this.inner).poll_write(cx, buf))?;
        this.written += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Stream an object into `sink`.
///
/// Unlike the metadata reads, a Prime `NotFound` is retried on Alter too, as
/// Prime may simply not have caught up. Once Prime has delivered any bytes
/// its error stands, since the sink cannot be rewound.
#[allow(clippy::too_many_arguments)]
pub async fn get_object(
    m: Mirror<'_>,
    ctx: &OpContext,
    bucket: &str,
    key: &str,
    range: ByteRange,
    sink: &mut ObjectSink<'_>,
    etag: Option<&str>,
    opts: &ObjectOptions,
) -> StorageResult<Outcome<()>> {
    let mut counting = CountingWriter::new(sink);
    let prime_result = ctx
        .bound(m.prime.get_object(ctx, bucket, key, range, &mut counting, etag, opts))
        .await;

    let prime_err = match prime_result {
        Ok(()) => {
            if m.options.verify_reads {
                let resolver = m.resolver(Operation::GetObject, bucket, Some(key));
                if let Ok(info) = ctx.bound(m.prime.get_object_info(ctx, bucket, key, opts)).await {
                    m.cross_check_object(ctx, &resolver, bucket, key, &info, opts).await;
                }
            }
            return Ok(Outcome::primary(()));
        }
        Err(e) if counting.written() > 0 => {
            debug!(bucket = %bucket, key = %key, written = counting.written(), error = %e, "Prime read broke mid-stream");
            return Err(e);
        }
        Err(e) if e.is_not_found() || e.is_transient() => e,
        Err(e) => return Err(e),
    };

    let sink = counting.into_inner();
    match ctx
        .bound(m.alter.get_object(ctx, bucket, key, range, sink, etag, opts))
        .await
    {
        Ok(()) => {
            let kind = if prime_err.is_not_found() {
                EventKind::StaleRead
            } else {
                EventKind::ReadFallback
            };
            m.record(
                MirrorEvent::new(kind, Operation::GetObject, bucket, Some(key), BackendRole::Prime)
                    .with_error(&prime_err),
            );
            Ok(Outcome::fallback(()))
        }
        Err(alter_err) => {
            debug!(
                bucket = %bucket,
                key = %key,
                prime_error = %prime_err,
                alter_error = %alter_err,
                "Fallback read failed"
            );
            Err(prime_err)
        }
    }
}

pub async fn get_object_info(
    m: Mirror<'_>,
    ctx: &OpContext,
    bucket: &str,
    key: &str,
    opts: &ObjectOptions,
) -> StorageResult<Outcome<ObjectInfo>> {
    let resolver = m.resolver(Operation::GetObjectInfo, bucket, Some(key));
    let outcome = resolver
        .resolve(ctx, m.prime.get_object_info(ctx, bucket, key, opts), || {
            m.alter.get_object_info(ctx, bucket, key, opts)
        })
        .await?;
    if outcome.served_by == ServedBy::Primary {
        m.cross_check_object(ctx, &resolver, bucket, key, &outcome.value, opts)
            .await;
    }
    Ok(outcome)
}

/// Copy inside each backend. Both legs copy from their own source object.
#[allow(clippy::too_many_arguments)]
pub async fn copy_object(
    m: Mirror<'_>,
    ctx: &OpContext,
    src_bucket: &str,
    src_key: &str,
    dst_bucket: &str,
    dst_key: &str,
    src_info: &ObjectInfo,
    src_opts: &ObjectOptions,
    dst_opts: &ObjectOptions,
) -> StorageResult<Outcome<ObjectInfo>> {
    let dw = m.dual_write(Operation::CopyObject, dst_bucket, Some(dst_key));
    let prime_info = dw
        .prime(
            ctx,
            m.prime.copy_object(
                ctx, src_bucket, src_key, dst_bucket, dst_key, src_info, src_opts, dst_opts,
            ),
        )
        .await?;

    let actx = dw.alter_context(ctx);
    let alter = dw
        .alter(
            &actx,
            m.alter.copy_object(
                &actx, src_bucket, src_key, dst_bucket, dst_key, src_info, src_opts, dst_opts,
            ),
        )
        .await;
    if let Ok(alter_info) = &alter {
        dw.reconcile_info(&prime_info, alter_info);
    }
    Ok(dw.finish(prime_info, alter))
}

pub async fn delete_object(
    m: Mirror<'_>,
    ctx: &OpContext,
    bucket: &str,
    key: &str,
) -> StorageResult<Outcome<()>> {
    let dw = m
        .dual_write(Operation::DeleteObject, bucket, Some(key))
        .expecting(EndState::Absent);
    dw.prime(ctx, m.prime.delete_object(ctx, bucket, key)).await?;
    let actx = dw.alter_context(ctx);
    let alter = dw.alter(&actx, m.alter.delete_object(&actx, bucket, key)).await;
    Ok(dw.finish((), alter))
}

#[cfg(test)]
mod tests {
    use crate::config::MirrorOptions;
    use crate::events::EventKind;
    use crate::handlers::testing::{fixture, fixture_with, read, seed};
    use crate::outcome::ServedBy;
    use ditto_backend::{Fault, Op};
    use ditto_common::{ByteRange, ErrorKind, ObjectLayer, ObjectOptions, OpContext};

    async fn get(f: &crate::handlers::testing::Fixture, key: &str) -> (Vec<u8>, ditto_common::StorageResult<ServedBy>) {
        let mut out = Vec::new();
        let result = f
            .layer
            .get_object(&OpContext::background(), "docs", key, ByteRange::full(), &mut out, None, &ObjectOptions::default())
            .await
            .map(|o| o.served_by);
        (out, result)
    }

    #[tokio::test]
    async fn test_get_from_prime() {
        let f = fixture();
        seed(f.prime.as_ref(), "docs", "a.txt", b"prime").await;
        seed(f.alter.as_ref(), "docs", "a.txt", b"alter").await;

        let (bytes, served) = get(&f, "a.txt").await;
        assert_eq!(bytes, b"prime");
        assert_eq!(served.unwrap(), ServedBy::Primary);
        assert_eq!(f.alter.calls(Op::GetObject), 0);
    }

    #[tokio::test]
    async fn test_get_stale_prime_served_by_alter() {
        let f = fixture();
        f.prime
            .make_bucket_with_location(&OpContext::background(), "docs", "")
            .await
            .unwrap();
        seed(f.alter.as_ref(), "docs", "a.txt", b"alter").await;

        let (bytes, served) = get(&f, "a.txt").await;
        assert_eq!(bytes, b"alter");
        assert_eq!(served.unwrap(), ServedBy::Fallback);
        assert_eq!(f.log.count(EventKind::StaleRead), 1);
        assert_eq!(f.log.events()[0].error_kind, Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_get_during_prime_outage() {
        let f = fixture();
        seed(f.prime.as_ref(), "docs", "a.txt", b"same").await;
        seed(f.alter.as_ref(), "docs", "a.txt", b"same").await;
        f.prime.fail_all(Fault::Unavailable);

        let (bytes, served) = get(&f, "a.txt").await;
        assert_eq!(bytes, b"same");
        assert_eq!(served.unwrap(), ServedBy::Fallback);
        assert_eq!(f.log.count(EventKind::ReadFallback), 1);
    }

    #[tokio::test]
    async fn test_get_missing_everywhere_returns_prime_error() {
        let f = fixture();
        seed(f.prime.as_ref(), "docs", "other", b"x").await;
        seed(f.alter.as_ref(), "docs", "other", b"x").await;

        let (bytes, served) = get(&f, "a.txt").await;
        assert!(bytes.is_empty());
        assert!(served.unwrap_err().is_not_found());
        assert!(f.log.events().is_empty());
    }

    #[tokio::test]
    async fn test_get_no_fallback_after_partial_stream() {
        let f = fixture();
        seed(f.prime.as_ref(), "docs", "a.txt", b"0123456789").await;
        seed(f.alter.as_ref(), "docs", "a.txt", b"0123456789").await;
        f.prime.fail(Op::GetObject, Fault::BreakAfter(3));

        let (bytes, served) = get(&f, "a.txt").await;
        assert_eq!(bytes, b"012");
        assert!(served.unwrap_err().is_transient());
        assert_eq!(f.alter.calls(Op::GetObject), 0);
    }

    #[tokio::test]
    async fn test_get_rejection_not_failed_over() {
        let f = fixture();
        seed(f.prime.as_ref(), "docs", "a.txt", b"x").await;
        seed(f.alter.as_ref(), "docs", "a.txt", b"x").await;
        let mut out = Vec::new();
        let err = f
            .layer
            .get_object(&OpContext::background(), "docs", "a.txt", ByteRange::full(), &mut out, Some("stale"), &ObjectOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendRejected);
        assert_eq!(f.alter.calls(Op::GetObject), 0);
    }

    #[tokio::test]
    async fn test_object_info_not_masked() {
        let f = fixture();
        f.prime
            .make_bucket_with_location(&OpContext::background(), "docs", "")
            .await
            .unwrap();
        seed(f.alter.as_ref(), "docs", "a.txt", b"x").await;

        let err = f
            .layer
            .get_object_info(&OpContext::background(), "docs", "a.txt", &ObjectOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(f.alter.calls(Op::GetObjectInfo), 0);
    }

    #[tokio::test]
    async fn test_object_info_divergence_check() {
        let f = fixture_with(MirrorOptions {
            verify_reads: true,
            ..MirrorOptions::default()
        });
        seed(f.prime.as_ref(), "docs", "a.txt", b"one").await;
        seed(f.alter.as_ref(), "docs", "a.txt", b"three").await;

        let outcome = f
            .layer
            .get_object_info(&OpContext::background(), "docs", "a.txt", &ObjectOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.value.size, 3);
        assert_eq!(outcome.served_by, ServedBy::Primary);
        assert_eq!(f.log.count(EventKind::Divergence), 1);

        let (bytes, _) = get(&f, "a.txt").await;
        assert_eq!(bytes, b"one");
        assert_eq!(f.log.count(EventKind::Divergence), 2);
    }

    #[tokio::test]
    async fn test_copy_mirrors_within_each_backend() {
        let f = fixture();
        let ctx = OpContext::background();
        seed(f.prime.as_ref(), "docs", "src", b"payload").await;
        seed(f.alter.as_ref(), "docs", "src", b"payload").await;
        let src_info = f
            .prime
            .get_object_info(&ctx, "docs", "src", &ObjectOptions::default())
            .await
            .unwrap();

        let outcome = f
            .layer
            .copy_object(&ctx, "docs", "src", "docs", "dst", &src_info, &ObjectOptions::default(), &ObjectOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.served_by, ServedBy::Mirrored);
        assert_eq!(outcome.value.name, "dst");
        assert_eq!(read(f.alter.as_ref(), "docs", "dst").await.unwrap(), b"payload");
        assert!(f.log.events().is_empty());
    }

    #[tokio::test]
    async fn test_copy_source_missing_on_alter_degrades() {
        let f = fixture();
        let ctx = OpContext::background();
        seed(f.prime.as_ref(), "docs", "src", b"payload").await;
        f.alter.make_bucket_with_location(&ctx, "docs", "").await.unwrap();
        let src_info = f
            .prime
            .get_object_info(&ctx, "docs", "src", &ObjectOptions::default())
            .await
            .unwrap();

        let outcome = f
            .layer
            .copy_object(&ctx, "docs", "src", "docs", "dst", &src_info, &ObjectOptions::default(), &ObjectOptions::default())
            .await
            .unwrap();
        assert!(outcome.is_degraded());
        let events = f.log.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::PartialMirrorFailure);
        assert_eq!(events[0].key.as_deref(), Some("dst"));
    }

    #[tokio::test]
    async fn test_delete_object_present_on_one_side() {
        let f = fixture();
        let ctx = OpContext::background();
        f.prime.make_bucket_with_location(&ctx, "docs", "").await.unwrap();
        seed(f.alter.as_ref(), "docs", "orphan", b"x").await;

        let outcome = f.layer.delete_object(&ctx, "docs", "orphan").await.unwrap();
        assert_eq!(outcome.served_by, ServedBy::Mirrored);
        assert!(read(f.prime.as_ref(), "docs", "orphan").await.unwrap_err().is_not_found());
        assert!(read(f.alter.as_ref(), "docs", "orphan").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_prime_failure_skips_alter() {
        let f = fixture();
        let ctx = OpContext::background();
        seed(f.prime.as_ref(), "docs", "k", b"x").await;
        seed(f.alter.as_ref(), "docs", "k", b"x").await;
        f.prime.fail(Op::DeleteObject, Fault::Unavailable);

        assert!(f.layer.delete_object(&ctx, "docs", "k").await.unwrap_err().is_transient());
        assert_eq!(f.alter.calls(Op::DeleteObject), 0);
        assert_eq!(read(f.alter.as_ref(), "docs", "k").await.unwrap(), b"x");
    }
}
