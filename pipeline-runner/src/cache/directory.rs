// Directory Cache
// Archives a directory of the build container as <local_dir>/<name>.tar

use super::{bounded, run_script, shell_quote, CacheError, CacheOutcome, CacheTransfer};
use crate::config::CacheConfig;
use crate::container::{ArchiveReader, ContainerDriver};
use crate::utils::human_size;

use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Rewrite a leading `~` to `$HOME` so the container shell resolves it
pub fn sanitize_remote_path(path: &str) -> String {
    if path == "~" {
        "$HOME".to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        format!("$HOME/{}", rest)
    } else {
        path.to_string()
    }
}

/// Cache backed by a directory inside the build container
pub struct DirectoryCache<'a> {
    driver: &'a dyn ContainerDriver,
    config: &'a CacheConfig,
    name: &'a str,
    path: &'a str,
}

impl<'a> DirectoryCache<'a> {
    pub fn new(
        driver: &'a dyn ContainerDriver,
        config: &'a CacheConfig,
        name: &'a str,
        path: &'a str,
    ) -> Self {
        Self {
            driver,
            config,
            name,
            path,
        }
    }

    fn target(&self) -> String {
        shell_quote(&sanitize_remote_path(self.path))
    }

    fn staging(&self) -> String {
        self.config.staging_dir(self.name)
    }

    fn staging_parent(&self) -> &str {
        self.config.remote_dir.trim_end_matches('/')
    }
}

#[async_trait::async_trait]
impl CacheTransfer for DirectoryCache<'_> {
    async fn restore(&self) -> Result<CacheOutcome, CacheError> {
        let name = self.name;
        let timeout = self.config.operation_timeout;
        let archive_path = self.config.archive_path(name);

        // Nothing to restore: touch neither the container nor the disk
        let exists = tokio::fs::try_exists(&archive_path)
            .await
            .map_err(|e| CacheError::io(name, e))?;
        if !exists {
            info!(cache = %name, "Cache not found locally, skipping restore");
            return Ok(CacheOutcome::NotFound);
        }

        let staging = shell_quote(&self.staging());
        let target = self.target();

        let prepare = format!(
            "[ -d {staging} ] && rm -rf {staging}; mkdir -p {parent}",
            staging = staging,
            parent = shell_quote(self.staging_parent()),
        );
        run_script(self.driver, name, "prepare restore", timeout, &prepare).await?;

        let start = Instant::now();
        let file = tokio::fs::File::open(&archive_path)
            .await
            .map_err(|e| CacheError::io(name, e))?;
        let bytes = file
            .metadata()
            .await
            .map_err(|e| CacheError::io(name, e))?
            .len();

        let accepted = bounded(
            name,
            "upload",
            timeout,
            self.driver.put_archive(self.staging_parent(), Box::pin(file)),
        )
        .await?;
        if !accepted {
            return Err(CacheError::transfer(
                name,
                format!("container rejected archive upload into {}", self.staging_parent()),
            ));
        }
        debug!(
            cache = %name,
            size = %human_size(bytes),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Uploaded cache archive"
        );

        let start = Instant::now();
        let finalize = format!(
            "if [ -e {target} ]; then rm -rf {target}; fi && mkdir -p \"$(dirname {target})\" && mv {staging} {target}",
            target = target,
            staging = staging,
        );
        run_script(self.driver, name, "restore", timeout, &finalize).await?;
        info!(
            cache = %name,
            size = %human_size(bytes),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Cache restored"
        );

        Ok(CacheOutcome::Restored { bytes })
    }

    async fn save(&self) -> Result<CacheOutcome, CacheError> {
        let name = self.name;
        let timeout = self.config.operation_timeout;
        let staging_path = self.staging();
        let staging = shell_quote(&staging_path);
        let target = self.target();

        let prepare = format!(
            "[ -d {staging} ] && rm -rf {staging}; mkdir -p {parent}; if [ -e {target} ]; then mv {target} {staging}; fi",
            staging = staging,
            parent = shell_quote(self.staging_parent()),
            target = target,
        );
        run_script(self.driver, name, "prepare save", timeout, &prepare).await?;

        let present = bounded(
            name,
            "check staging",
            timeout,
            self.driver.path_exists(&staging_path),
        )
        .await?;
        if !present {
            info!(cache = %name, "Cache directory not found in container, skipping save");
            return Ok(CacheOutcome::NotFound);
        }

        let start = Instant::now();
        let reader = bounded(
            name,
            "download",
            timeout,
            self.driver.get_archive(&staging_path),
        )
        .await?;

        let archive_path = self.config.archive_path(name);
        let bytes = write_archive(name, &self.config.local_dir, &archive_path, reader, timeout).await?;
        info!(
            cache = %name,
            size = %human_size(bytes),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Cache saved"
        );

        Ok(CacheOutcome::Saved { bytes })
    }
}

/// Stream `reader` into a temp file in `dir`, then rename it onto `destination`.
///
/// On any failure the temp file is removed and `destination` is left as it was.
pub(crate) async fn write_archive(
    cache: &str,
    dir: &Path,
    destination: &Path,
    mut reader: ArchiveReader,
    timeout: Duration,
) -> Result<u64, CacheError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| CacheError::io(cache, e))?;

    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| CacheError::io(cache, e))?;
    let mut file = tokio::fs::File::from_std(temp.reopen().map_err(|e| CacheError::io(cache, e))?);

    let copy = async {
        let bytes = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok::<u64, std::io::Error>(bytes)
    };

    let bytes = match tokio::time::timeout(timeout, copy).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            return Err(CacheError::transfer(cache, format!("archive stream failed: {}", e)));
        }
        Err(_) => {
            return Err(CacheError::Timeout {
                cache: cache.to_string(),
                operation: "download".to_string(),
                timeout,
            });
        }
    };
    drop(file);

    temp.persist(destination)
        .map_err(|e| CacheError::io(cache, e.error))?;

    Ok(bytes)
}
