// Image Cache
// Exports and reloads the runtime's image store, one archive per image

use super::directory::write_archive;
use super::{bounded, CacheError, CacheOutcome, CacheTransfer};
use crate::config::CacheConfig;
use crate::container::ContainerDriver;
use crate::utils::human_size;

use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Cache backed by the runtime's image store instead of a container directory
pub struct ImageCache<'a> {
    driver: &'a dyn ContainerDriver,
    config: &'a CacheConfig,
    name: &'a str,
}

impl<'a> ImageCache<'a> {
    pub fn new(driver: &'a dyn ContainerDriver, config: &'a CacheConfig, name: &'a str) -> Self {
        Self {
            driver,
            config,
            name,
        }
    }

    /// Archives in the image directory, sorted by file name
    async fn archives(&self) -> Result<Vec<PathBuf>, CacheError> {
        let dir = self.config.images_dir();
        let exists = tokio::fs::try_exists(&dir)
            .await
            .map_err(|e| CacheError::io(self.name, e))?;
        if !exists {
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| CacheError::io(self.name, e))?;

        let mut archives = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io(self.name, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tar") && path.is_file() {
                archives.push(path);
            }
        }

        archives.sort();
        Ok(archives)
    }
}

#[async_trait::async_trait]
impl CacheTransfer for ImageCache<'_> {
    async fn restore(&self) -> Result<CacheOutcome, CacheError> {
        let name = self.name;
        let archives = self.archives().await?;
        if archives.is_empty() {
            info!(cache = %name, "No saved images found, skipping restore");
            return Ok(CacheOutcome::NotFound);
        }

        let start = Instant::now();
        let mut total = 0;
        for path in &archives {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| CacheError::io(name, e))?;
            let size = file
                .metadata()
                .await
                .map_err(|e| CacheError::io(name, e))?
                .len();

            bounded(
                name,
                "load image",
                self.config.operation_timeout,
                self.driver.load_image(Box::pin(file)),
            )
            .await?;

            debug!(cache = %name, archive = %path.display(), size = %human_size(size), "Loaded image");
            total += size;
        }

        info!(
            cache = %name,
            images = archives.len(),
            size = %human_size(total),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Images restored"
        );

        Ok(CacheOutcome::Images {
            count: archives.len(),
            bytes: total,
        })
    }

    async fn save(&self) -> Result<CacheOutcome, CacheError> {
        let name = self.name;
        let timeout = self.config.operation_timeout;
        let dir = self.config.images_dir();

        let images = bounded(name, "list images", timeout, self.driver.list_images()).await?;
        if images.is_empty() {
            info!(cache = %name, "No images in the image store, skipping save");
            return Ok(CacheOutcome::NotFound);
        }

        let start = Instant::now();
        let mut count = 0;
        let mut total = 0;
        for image in &images {
            let destination = dir.join(format!("{}.tar", image.archive_stem()));

            // One failing image must not cost the others
            let saved = match bounded(name, "save image", timeout, self.driver.save_image(image)).await
            {
                Ok(reader) => write_archive(name, &dir, &destination, reader, timeout).await,
                Err(e) => Err(e),
            };

            match saved {
                Ok(bytes) => {
                    debug!(cache = %name, image = %image.reference(), size = %human_size(bytes), "Saved image");
                    count += 1;
                    total += bytes;
                }
                Err(e) => {
                    warn!(cache = %name, image = %image.reference(), error = %e, "Failed to save image, skipping");
                }
            }
        }

        info!(
            cache = %name,
            images = count,
            size = %human_size(total),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Images saved"
        );

        Ok(CacheOutcome::Images {
            count,
            bytes: total,
        })
    }
}
