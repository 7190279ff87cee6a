// Container Driver
// Seam between cache synchronization and the container runtime

pub mod docker;

#[cfg(test)]
pub(crate) mod fake;

pub use docker::DockerCliDriver;

use crate::utils::slugify;

use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Byte stream of a tar archive moving into or out of the runtime
pub type ArchiveReader = Pin<Box<dyn AsyncRead + Send>>;

/// Errors raised by a container driver
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Docker is not available: {0}")]
    DockerNotAvailable(String),

    #[error("Container command failed: {0}")]
    CommandFailed(String),

    #[error("Unexpected runtime output: {0}")]
    InvalidOutput(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Exit code and combined output of a command run in the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An image in the runtime's image store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    /// Content id, e.g. `sha256:4f2d…`
    pub id: String,
    /// `repository:tag` references; empty for dangling images
    pub tags: Vec<String>,
}

impl ImageSummary {
    /// First 12 hex digits of the content id
    pub fn short_id(&self) -> &str {
        let digest = self
            .id
            .split_once(':')
            .map(|(_, digest)| digest)
            .unwrap_or(&self.id);
        digest.get(..12).unwrap_or(digest)
    }

    /// Reference handed to the runtime when exporting
    pub fn reference(&self) -> &str {
        self.tags.first().map(String::as_str).unwrap_or(&self.id)
    }

    /// File stem of the exported archive: slug of the first tag, else the short id
    pub fn archive_stem(&self) -> String {
        match self.tags.first().map(|tag| slugify(tag)) {
            Some(slug) if !slug.is_empty() => slug,
            _ => self.short_id().to_string(),
        }
    }
}

/// Operations the cache manager needs from a running build container
/// and its image store.
#[async_trait::async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Run a shell script inside the container
    async fn run_command(&self, script: &str) -> Result<CommandOutput, DriverError>;

    /// Extract a tar archive into `destination_dir`.
    ///
    /// `false` when the runtime refused it without detail; drivers that capture
    /// diagnostics return [`DriverError::CommandFailed`] instead.
    async fn put_archive(
        &self,
        destination_dir: &str,
        archive: ArchiveReader,
    ) -> Result<bool, DriverError>;

    /// Stream `source_path` out of the container as a tar archive.
    ///
    /// Failures after the stream has started surface as read errors.
    async fn get_archive(&self, source_path: &str) -> Result<ArchiveReader, DriverError>;

    async fn path_exists(&self, path: &str) -> Result<bool, DriverError>;

    async fn list_images(&self) -> Result<Vec<ImageSummary>, DriverError>;

    async fn load_image(&self, archive: ArchiveReader) -> Result<(), DriverError>;

    async fn save_image(&self, image: &ImageSummary) -> Result<ArchiveReader, DriverError>;
}
