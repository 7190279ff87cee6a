// Cache module
// Moves named caches between the local cache directory and a build container

pub mod directory;
pub mod images;
pub mod manager;

pub use directory::{sanitize_remote_path, DirectoryCache};
pub use images::ImageCache;
pub use manager::{CacheManager, IgnoredCache};

use crate::config::{CacheConfig, DOCKER_NAME};
use crate::container::{CommandOutput, ContainerDriver, DriverError};
use crate::utils::human_size;

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while synchronizing a cache
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache '{0}' is not defined")]
    Undefined(String),

    #[error("Invalid cache name '{0}': use letters, digits, '-', '_' and '.'")]
    InvalidName(String),

    #[error("Failed to transfer cache '{cache}': {message}")]
    Transfer {
        cache: String,
        message: String,
        /// Output captured from the container, if any
        output: String,
    },

    #[error("Cache '{cache}': {operation} timed out after {timeout:?}")]
    Timeout {
        cache: String,
        operation: String,
        timeout: Duration,
    },

    #[error("Cache '{cache}': IO error: {source}")]
    Io {
        cache: String,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    pub(crate) fn transfer(cache: &str, message: impl Into<String>) -> Self {
        CacheError::Transfer {
            cache: cache.to_string(),
            message: message.into(),
            output: String::new(),
        }
    }

    pub(crate) fn io(cache: &str, source: io::Error) -> Self {
        CacheError::Io {
            cache: cache.to_string(),
            source,
        }
    }
}

/// How a cache name is synchronized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// A directory inside the build container, archived as `<name>.tar`
    Directory,
    /// The runtime's image store, one archive per image
    DockerImages,
    /// Never transferred
    Ignore,
}

impl CacheStrategy {
    pub fn resolve(name: &str, config: &CacheConfig) -> Self {
        if name == DOCKER_NAME && config.docker_images {
            CacheStrategy::DockerImages
        } else if config.ignored_caches.contains(name) {
            CacheStrategy::Ignore
        } else {
            CacheStrategy::Directory
        }
    }
}

/// Result of synchronizing one cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum CacheOutcome {
    Restored { bytes: u64 },
    Saved { bytes: u64 },
    Images { count: usize, bytes: u64 },
    NotFound,
    Ignored,
    Failed { reason: String },
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheOutcome::Restored { bytes } => write!(f, "restored ({})", human_size(*bytes)),
            CacheOutcome::Saved { bytes } => write!(f, "saved ({})", human_size(*bytes)),
            CacheOutcome::Images { count, bytes } => {
                write!(f, "{} image(s) ({})", count, human_size(*bytes))
            }
            CacheOutcome::NotFound => write!(f, "not found"),
            CacheOutcome::Ignored => write!(f, "ignored"),
            CacheOutcome::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Per-name report returned by [`CacheManager`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheReport {
    pub name: String,
    pub strategy: CacheStrategy,
    pub outcome: CacheOutcome,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

/// One way of moving a cache in and out of a container
#[async_trait::async_trait]
pub trait CacheTransfer: Send + Sync {
    /// Local → container
    async fn restore(&self) -> Result<CacheOutcome, CacheError>;

    /// Container → local
    async fn save(&self) -> Result<CacheOutcome, CacheError>;
}

/// Run a driver call under the configured time limit
pub(crate) async fn bounded<T, F>(
    cache: &str,
    operation: &str,
    timeout: Duration,
    call: F,
) -> Result<T, CacheError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(DriverError::IoError(e))) => Err(CacheError::io(cache, e)),
        Ok(Err(e)) => Err(CacheError::transfer(cache, format!("{}: {}", operation, e))),
        Err(_) => Err(CacheError::Timeout {
            cache: cache.to_string(),
            operation: operation.to_string(),
            timeout,
        }),
    }
}

/// Run a script in the container, failing on a non-zero exit
pub(crate) async fn run_script(
    driver: &dyn ContainerDriver,
    cache: &str,
    operation: &str,
    timeout: Duration,
    script: &str,
) -> Result<CommandOutput, CacheError> {
    tracing::debug!(cache = %cache, script = %script, "Running cache command");

    let output = bounded(cache, operation, timeout, driver.run_command(script)).await?;
    if !output.success() {
        return Err(CacheError::Transfer {
            cache: cache.to_string(),
            message: format!("{} exited with status {}", operation, output.exit_code),
            output: output.output,
        });
    }

    Ok(output)
}

/// Double-quote `value` for sh, leaving `$` expansion active
pub(crate) fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}
