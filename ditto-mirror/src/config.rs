use std::path::Path;
use std::time::Duration;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use ditto_backend::BackendConfig;

/// How a put body is replayed to the two backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PutStrategy {
    /// Buffer bodies up to `put_buffer_limit`, tee anything larger.
    #[default]
    Auto,
    /// Always verify in memory, then replay to each backend in turn.
    /// Bodies over `put_buffer_limit` are refused.
    Buffer,
    /// Always stream to both backends concurrently.
    Tee,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorOptions {
    pub put_strategy: PutStrategy,
    pub put_buffer_limit: u64,
    pub tee_pipe_capacity: usize,
    /// How long a teed leg may refuse a chunk before it is dropped.
    pub tee_stall_ms: u64,
    pub verify_reads: bool,
    pub alter_grace_ms: u64,
    pub compensate_partial_puts: bool,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            put_strategy: PutStrategy::Auto,
            put_buffer_limit: 8 * 1024 * 1024,
            tee_pipe_capacity: 64 * 1024,
            tee_stall_ms: 5_000,
            verify_reads: false,
            alter_grace_ms: 30_000,
            compensate_partial_puts: true,
        }
    }
}

impl MirrorOptions {
    pub fn alter_grace(&self) -> Duration {
        Duration::from_millis(self.alter_grace_ms)
    }

    pub fn tee_stall(&self) -> Duration {
        Duration::from_millis(self.tee_stall_ms)
    }

    /// Whether a body of `size` bytes should be buffered rather than teed.
    pub fn buffers(&self, size: u64) -> bool {
        match self.put_strategy {
            PutStrategy::Buffer => true,
            PutStrategy::Tee => false,
            PutStrategy::Auto => size <= self.put_buffer_limit,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.put_buffer_limit == 0 {
            bail!("put_buffer_limit must be greater than zero");
        }
        if self.tee_pipe_capacity == 0 {
            bail!("tee_pipe_capacity must be greater than zero");
        }
        if self.tee_stall_ms == 0 {
            bail!("tee_stall_ms must be greater than zero");
        }
        if self.alter_grace_ms == 0 {
            bail!("alter_grace_ms must be greater than zero");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub prime: BackendConfig,
    pub alter: BackendConfig,
    #[serde(default)]
    pub mirror: MirrorOptions,
}

impl MirrorConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        Self::from_toml_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: MirrorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if let (BackendConfig::Directory { path: prime }, BackendConfig::Directory { path: alter }) =
            (&self.prime, &self.alter)
        {
            if prime == alter {
                bail!("prime and alter must not share a directory: {}", prime.display());
            }
        }
        self.mirror.validate()
    }
}
