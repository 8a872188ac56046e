use std::num::NonZeroUsize;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

/// Device configuration, usually deserialized from the embedder's config
/// file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name the device registers under with the host storage stack.
    #[serde(default = "default_name")]
    pub name: String,
    /// Backing device to bind at creation. If the bind fails, the whole
    /// creation fails and partially built resources are released.
    #[serde(default)]
    pub target: Option<String>,
    /// Upper bound of forwarded clones outstanding at once. Admission fails
    /// with `CloneFailed` when the pool is exhausted.
    #[serde(default = "default_submit_pool")]
    pub submit_pool: NonZeroUsize,
}

fn default_name() -> String {
    "blkrelay".to_owned()
}

fn default_submit_pool() -> NonZeroUsize {
    NonZeroUsize::new(64).unwrap()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            target: None,
            submit_pool: default_submit_pool(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.name.trim().is_empty(), "device name must not be empty");
        ensure!(
            self.submit_pool.get() <= Semaphore::MAX_PERMITS,
            "`submit_pool` must not exceed {}",
            Semaphore::MAX_PERMITS,
        );
        Ok(())
    }
}
