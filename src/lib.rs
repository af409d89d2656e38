// Coffer - embedded hierarchical storage-container engine
// Core library module

pub mod cache;
pub mod common;
pub mod context;
pub mod error;
pub mod freespace;
pub mod vfd;

pub use error::{CofferError, ErrorKind, Result};

use serde::{Deserialize, Serialize};

/// Container-level configuration assembled by the opener and handed to the
/// cache and free-space layers pre-validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub driver: String,
    pub cache: cache::CacheConfig,
    pub free_space: freespace::FreeSpaceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: "file".to_string(),
            cache: cache::CacheConfig::default(),
            free_space: freespace::FreeSpaceConfig::default(),
        }
    }
}

impl Config {
    /// Parse a configuration record. Unknown fields are rejected so typos
    /// in operator configs surface instead of silently defaulting.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| ErrorKind::InvalidArgument(format!("bad config record: {e}")).into())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ErrorKind::Internal(format!("config encode: {e}")).into())
    }
}


/// Register the built-in block drivers. Idempotent; call once at startup
/// or before the first open.
pub fn register_default_drivers() {
    use std::sync::Arc;
    vfd::register_driver(Arc::new(vfd::MemoryDriverClass));
    vfd::register_driver(Arc::new(vfd::FileDriverClass));
}
