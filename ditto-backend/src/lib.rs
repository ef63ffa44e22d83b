//! Reference object-layer backends: in-memory, local directory and a
//! fault-injecting wrapper for exercising failure paths.

pub mod directory;
pub mod faulty;
pub mod memory;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use ditto_common::ObjectLayer;

pub use directory::DirectoryBackend;
pub use faulty::{Fault, FaultyBackend, Op};
pub use memory::MemoryBackend;

/// Backend selection as it appears in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Memory,
    Directory { path: PathBuf },
}

impl BackendConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            BackendConfig::Memory => "memory",
            BackendConfig::Directory { .. } => "directory",
        }
    }
}

/// Construct a backend from its configuration.
pub fn from_config(config: &BackendConfig) -> anyhow::Result<Arc<dyn ObjectLayer>> {
    match config {
        BackendConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
        BackendConfig::Directory { path } => {
            if path.as_os_str().is_empty() {
                bail!("Directory backend requires a non-empty path");
            }
            Ok(Arc::new(DirectoryBackend::open(path)?))
        }
    }
}
