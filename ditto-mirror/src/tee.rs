//! Streaming fan-out of one put body to both backends.
//!
//! The source is pumped chunk by chunk into two bounded in-memory pipes.
//! Each backend reads its pipe through its own [`HashReader`], so each leg
//! checks the declared length and hash by itself. A leg that stops accepting
//! data is detached and the other keeps being fed: a leg whose pipe breaks
//! is dropped at once, and a leg that leaves a chunk unread for longer than
//! the stall window is dropped and its put is cancelled.
//!
//! The pump holds the most recent chunk back until the source has produced
//! the next one, or verified at end of stream. When the source fails, the
//! held chunk is never delivered and both legs see a short body, so neither
//! can commit what the source rejected.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ditto_common::{
    HashReader, ObjectInfo, ObjectLayer, ObjectOptions, OpContext, StorageError, StorageResult,
};

use crate::outcome::BackendRole;

const CHUNK_SIZE: usize = 32 * 1024;

/// Per-leg results of a teed put.
#[derive(Debug)]
pub struct TeeResult {
    pub source: StorageResult<()>,
    pub prime: StorageResult<ObjectInfo>,
    pub alter: StorageResult<ObjectInfo>,
}

pub struct Tee<'a> {
    pub prime: &'a dyn ObjectLayer,
    pub alter: &'a dyn ObjectLayer,
    pub pipe_capacity: usize,
    pub stall_timeout: Duration,
}

/// Write end of one leg's pipe plus the switch that cancels that leg's put.
struct Leg {
    role: BackendRole,
    tx: Option<DuplexStream>,
    stop: CancellationToken,
    stalled: bool,
}

impl Leg {
    fn new(role: BackendRole, tx: DuplexStream, stop: CancellationToken) -> Self {
        Self {
            role,
            tx: Some(tx),
            stop,
            stalled: false,
        }
    }

    async fn write(&mut self, chunk: &[u8], stall: Duration) {
        let Some(tx) = self.tx.as_mut() else { return };
        match tokio::time::timeout(stall, tx.write_all(chunk)).await {
            Ok(Ok(())) => return,
            Ok(Err(_)) => debug!(backend = %self.role, "Tee leg stopped reading, detaching"),
            Err(_) => {
                warn!(backend = %self.role, stall_ms = stall.as_millis() as u64, "Tee leg stalled, detaching");
                self.stalled = true;
                self.stop.cancel();
            }
        }
        self.tx = None;
    }
}

impl Tee<'_> {
    /// Stream `data` to both backends concurrently.
    ///
    /// Each leg and the pump are bounded by `ctx` independently, and each
    /// leg can additionally be cut loose by the pump when it stalls.
    #[allow(clippy::too_many_arguments)]
    pub async fn put(
        &self,
        ctx: &OpContext,
        bucket: &str,
        key: &str,
        data: HashReader,
        metadata: HashMap<String, String>,
        opts: &ObjectOptions,
    ) -> StorageResult<TeeResult> {
        let size = data.size();
        let expected = data.expected_sha256().map(str::to_string);
        let capacity = self.pipe_capacity.max(1);

        let (prime_tx, prime_rx) = tokio::io::duplex(capacity);
        let (alter_tx, alter_rx) = tokio::io::duplex(capacity);
        let prime_body = HashReader::new(prime_rx, size, expected.clone())?;
        let alter_body = HashReader::new(alter_rx, size, expected)?;

        let prime_ctx = ctx.clone().with_cancellation(ctx.cancellation().child_token());
        let alter_ctx = ctx.clone().with_cancellation(ctx.cancellation().child_token());
        let mut legs = [
            Leg::new(BackendRole::Prime, prime_tx, prime_ctx.cancellation().clone()),
            Leg::new(BackendRole::Alter, alter_tx, alter_ctx.cancellation().clone()),
        ];

        let pump = ctx.bound(pump(data, &mut legs, capacity.min(CHUNK_SIZE), self.stall_timeout));
        let prime_leg = prime_ctx.bound(self.prime.put_object(
            &prime_ctx,
            bucket,
            key,
            prime_body,
            metadata.clone(),
            opts,
        ));
        let alter_leg =
            alter_ctx.bound(self.alter.put_object(&alter_ctx, bucket, key, alter_body, metadata, opts));

        let (source, prime, alter) = tokio::join!(pump, prime_leg, alter_leg);
        let [prime_state, alter_state] = &legs;
        let prime = self.stalled(prime_state, prime);
        let alter = self.stalled(alter_state, alter);
        debug!(
            bucket = %bucket,
            key = %key,
            size = size,
            source_ok = source.is_ok(),
            prime_ok = prime.is_ok(),
            alter_ok = alter.is_ok(),
            "Tee put finished"
        );
        Ok(TeeResult {
            source,
            prime,
            alter,
        })
    }

    /// A leg cancelled for stalling reports as unavailable, not cancelled.
    fn stalled(&self, leg: &Leg, result: StorageResult<ObjectInfo>) -> StorageResult<ObjectInfo> {
        match result {
            Err(StorageError::Cancelled) if leg.stalled => Err(StorageError::Unavailable(format!(
                "{} accepted no data for {:?}",
                leg.role, self.stall_timeout
            ))),
            other => other,
        }
    }
}

async fn pump(
    mut source: HashReader,
    legs: &mut [Leg; 2],
    chunk_size: usize,
    stall: Duration,
) -> StorageResult<()> {
    let mut held: Option<Bytes> = None;
    let mut buf = BytesMut::new();

    let result = loop {
        buf.reserve(chunk_size);
        let n = match source.read_buf(&mut buf).await {
            Ok(n) => n,
            Err(e) => break Err(StorageError::from(e)),
        };
        if let Some(chunk) = held.take() {
            let [prime, alter] = &mut *legs;
            tokio::join!(prime.write(&chunk, stall), alter.write(&chunk, stall));
        }
        if n == 0 {
            break Ok(());
        }
        held = Some(buf.split().freeze());
    };

    // Closing the pipes without the held chunk leaves both legs short.
    for leg in legs.iter_mut() {
        if let Some(mut tx) = leg.tx.take() {
            if result.is_ok() {
                let _ = tx.shutdown().await;
            }
        }
    }
    result
}
