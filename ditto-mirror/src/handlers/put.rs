use std::collections::HashMap;

use tracing::{debug, error};

use ditto_common::{HashReader, ObjectInfo, ObjectOptions, OpContext, StorageError, StorageResult};

use super::Mirror;
use crate::config::PutStrategy;
use crate::events::{EventKind, MirrorEvent, Operation};
use crate::outcome::{BackendRole, Outcome};
use crate::tee::{Tee, TeeResult};

/// Store an object on both backends.
///
/// Small bodies are verified in memory and then replayed to Prime and Alter
/// in turn. Larger ones are streamed to both at once (see [`crate::tee`]),
/// unless buffering is forced, in which case they are refused up front.
pub async fn put_object(
    m: Mirror<'_>,
    ctx: &OpContext,
    bucket: &str,
    key: &str,
    data: HashReader,
    metadata: HashMap<String, String>,
    opts: &ObjectOptions,
) -> StorageResult<Outcome<ObjectInfo>> {
    let limit = m.options.put_buffer_limit;
    if m.options.put_strategy == PutStrategy::Buffer && data.size() > limit {
        return Err(StorageError::EntityTooLarge {
            size: data.size(),
            limit,
        });
    }
    if m.options.buffers(data.size()) {
        put_buffered(m, ctx, bucket, key, data, metadata, opts).await
    } else {
        put_teed(m, ctx, bucket, key, data, metadata, opts).await
    }
}

async fn put_buffered(
    m: Mirror<'_>,
    ctx: &OpContext,
    bucket: &str,
    key: &str,
    data: HashReader,
    metadata: HashMap<String, String>,
    opts: &ObjectOptions,
) -> StorageResult<Outcome<ObjectInfo>> {
    let (body, sha256) = ctx.bound(data.read_verified()).await?;
    debug!(bucket = %bucket, key = %key, size = body.len(), "Put body verified, replaying");

    let dw = m.dual_write(Operation::PutObject, bucket, Some(key));
    let prime_body = HashReader::from_bytes(body.clone(), Some(sha256.clone()))?;
    let prime_info = dw
        .prime(
            ctx,
            m.prime
                .put_object(ctx, bucket, key, prime_body, metadata.clone(), opts),
        )
        .await?;

    let actx = dw.alter_context(ctx);
    let alter_body = HashReader::from_bytes(body, Some(sha256))?;
    let alter = dw
        .alter(&actx, m.alter.put_object(&actx, bucket, key, alter_body, metadata, opts))
        .await;
    match &alter {
        Ok(alter_info) => dw.reconcile_info(&prime_info, alter_info),
        Err(_) if m.options.compensate_partial_puts => {
            discard(m, &actx, BackendRole::Alter, bucket, key).await
        }
        Err(_) => {}
    }
    Ok(dw.finish(prime_info, alter))
}

async fn put_teed(
    m: Mirror<'_>,
    ctx: &OpContext,
    bucket: &str,
    key: &str,
    data: HashReader,
    metadata: HashMap<String, String>,
    opts: &ObjectOptions,
) -> StorageResult<Outcome<ObjectInfo>> {
    let tee = Tee {
        prime: m.prime,
        alter: m.alter,
        pipe_capacity: m.options.tee_pipe_capacity,
        stall_timeout: m.options.tee_stall(),
    };
    let TeeResult {
        source,
        prime,
        alter,
    } = tee.put(ctx, bucket, key, data, metadata, opts).await?;

    if let Err(e) = source {
        if prime.is_ok() {
            discard(m, ctx, BackendRole::Prime, bucket, key).await;
        }
        if alter.is_ok() {
            discard(m, ctx, BackendRole::Alter, bucket, key).await;
        }
        return Err(e);
    }

    let dw = m.dual_write(Operation::PutObject, bucket, Some(key));
    match (prime, alter) {
        (Ok(prime_info), Ok(alter_info)) => {
            dw.reconcile_info(&prime_info, &alter_info);
            Ok(Outcome::mirrored(prime_info))
        }
        (Ok(prime_info), Err(alter_err)) => {
            dw.partial_failure(&alter_err);
            if m.options.compensate_partial_puts {
                discard(m, ctx, BackendRole::Alter, bucket, key).await;
            }
            Ok(Outcome::degraded(prime_info))
        }
        (Err(prime_err), Ok(_)) => {
            // Alter must not hold an object Prime never committed.
            discard(m, ctx, BackendRole::Alter, bucket, key).await;
            Err(prime_err)
        }
        (Err(prime_err), Err(_)) => Err(prime_err),
    }
}

/// Best-effort removal of a stray copy. Runs detached from the caller.
async fn discard(m: Mirror<'_>, ctx: &OpContext, role: BackendRole, bucket: &str, key: &str) {
    let backend = match role {
        BackendRole::Prime => m.prime,
        BackendRole::Alter => m.alter,
    };
    let dctx = ctx.detached(m.options.alter_grace());
    let event = match dctx.bound(backend.delete_object(&dctx, bucket, key)).await {
        Ok(()) => MirrorEvent::new(
            EventKind::Compensated,
            Operation::PutObject,
            bucket,
            Some(key),
            role,
        ),
        Err(e) if e.is_not_found() => {
            debug!(backend = %role, bucket = %bucket, key = %key, "Nothing to discard");
            return;
        }
        Err(e) => {
            error!(backend = %role, bucket = %bucket, key = %key, error = %e, "Failed to discard stray copy");
            MirrorEvent::new(
                EventKind::CompensationFailed,
                Operation::PutObject,
                bucket,
                Some(key),
                role,
            )
            .with_error(&e)
        }
    };
    m.record(event);
}
