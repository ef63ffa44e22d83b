//! Verifying payload reader.
//!
//! A [`HashReader`] wraps the upload body together with its declared length
//! and (optionally) its declared SHA-256. Bytes are hashed as they are read;
//! at end of stream the reader fails with `IncompleteBody` or `HashMismatch`
//! instead of reporting EOF if the body does not match. Backends must read
//! the body to completion before committing anything.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::error::{StorageError, StorageResult};

pub struct HashReader {
    inner: Pin<Box<dyn AsyncRead + Send>>,
    size: u64,
    expected_sha256: Option<String>,
    hasher: Sha256,
    received: u64,
    computed_sha256: Option<String>,
}

impl std::fmt::Debug for HashReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashReader")
            .field("size", &self.size)
            .field("expected_sha256", &self.expected_sha256)
            .field("received", &self.received)
            .finish()
    }
}

impl HashReader {
    pub fn new(
        reader: impl AsyncRead + Send + 'static,
        size: u64,
        sha256_hex: Option<String>,
    ) -> StorageResult<Self> {
        let expected_sha256 = match sha256_hex {
            Some(hex_digest) => {
                let normalized = hex_digest.to_ascii_lowercase();
                match hex::decode(&normalized) {
                    Ok(raw) if raw.len() == 32 => Some(normalized),
                    _ => return Err(StorageError::InvalidDigest(hex_digest)),
                }
            }
            None => None,
        };
        Ok(Self {
            inner: Box::pin(reader),
            size,
            expected_sha256,
            hasher: Sha256::new(),
            received: 0,
            computed_sha256: None,
        })
    }

    /// In-memory body; the declared hash is checked like any other source.
    pub fn from_bytes(data: Bytes, sha256_hex: Option<String>) -> StorageResult<Self> {
        let size = data.len() as u64;
        Self::new(io::Cursor::new(data), size, sha256_hex)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn expected_sha256(&self) -> Option<&str> {
        self.expected_sha256.as_deref()
    }

    /// Hex SHA-256 of the body, available once the stream verified at EOF.
    pub fn computed_sha256(&self) -> Option<&str> {
        self.computed_sha256.as_deref()
    }

    /// Read and verify the whole body, returning it with its hex SHA-256.
    pub async fn read_verified(mut self) -> StorageResult<(Bytes, String)> {
        let capacity = usize::try_from(self.size).unwrap_or(usize::MAX).min(64 * 1024 * 1024);
        let mut buf = BytesMut::with_capacity(capacity);
        loop {
            let n = self.read_buf(&mut buf).await.map_err(StorageError::from)?;
            if n == 0 {
                break;
            }
        }
        let digest = self
            .computed_sha256
            .take()
            .ok_or(StorageError::IncompleteBody { expected: self.size, received: self.received })?;
        Ok((buf.freeze(), digest))
    }

    fn finish(&mut self) -> StorageResult<()> {
        if self.computed_sha256.is_some() {
            return Ok(());
        }
        if self.received != self.size {
            return Err(StorageError::IncompleteBody {
                expected: self.size,
                received: self.received,
            });
        }
        let computed = hex::encode(self.hasher.finalize_reset());
        if let Some(expected) = &self.expected_sha256 {
            if *expected != computed {
                return Err(StorageError::HashMismatch {
                    expected: expected.clone(),
                    computed,
                });
            }
        }
        self.computed_sha256 = Some(computed);
        Ok(())
    }
}

impl AsyncRead for HashReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.computed_sha256.is_some() {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(this.inner.as_mut().poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];

        if fresh.is_empty() {
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            return Poll::Ready(this.finish().map_err(StorageError::into_io));
        }

        this.received += fresh.len() as u64;
        if this.received > this.size {
            return Poll::Ready(Err(StorageError::IncompleteBody {
                expected: this.size,
                received: this.received,
            }
            .into_io()));
        }
        this.hasher.update(fresh);
        Poll::Ready(Ok(()))
    }
}

/// Hex SHA-256 of an in-memory body.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_verified_body() {
        let data = Bytes::from_static(b"hello world");
        let reader = HashReader::from_bytes(data.clone(), Some(sha256_hex(&data))).unwrap();
        let (body, digest) = reader.read_verified().await.unwrap();
        assert_eq!(body, data);
        assert_eq!(digest, sha256_hex(b"hello world"));
    }

    #[tokio::test]
    async fn test_hash_mismatch() {
        let reader =
            HashReader::from_bytes(Bytes::from_static(b"hi"), Some(sha256_hex(b"ho"))).unwrap();
        let err = reader.read_verified().await.unwrap_err();
        assert!(matches!(err, StorageError::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn test_short_body() {
        let reader = HashReader::new(io::Cursor::new(b"abc".to_vec()), 10, None).unwrap();
        let err = reader.read_verified().await.unwrap_err();
        assert!(matches!(err, StorageError::IncompleteBody { expected: 10, received: 3 }));
    }

    #[tokio::test]
    async fn test_long_body() {
        let reader = HashReader::new(io::Cursor::new(b"abcdef".to_vec()), 2, None).unwrap();
        let err = reader.read_verified().await.unwrap_err();
        assert!(matches!(err, StorageError::IncompleteBody { expected: 2, .. }));
    }

    #[test]
    fn test_rejects_malformed_digest() {
        let err = HashReader::from_bytes(Bytes::new(), Some("not-hex".into())).unwrap_err();
        assert!(matches!(err, StorageError::InvalidDigest(_)));
    }

    #[tokio::test]
    async fn test_uppercase_digest_accepted() {
        let digest = sha256_hex(b"x").to_ascii_uppercase();
        let reader = HashReader::from_bytes(Bytes::from_static(b"x"), Some(digest)).unwrap();
        assert_eq!(reader.expected_sha256(), Some(sha256_hex(b"x").as_str()));
        reader.read_verified().await.unwrap();
    }
}
