// Cache Manager
// Resolves a strategy per cache name and runs restores and saves in order

use super::{
    CacheError, CacheOutcome, CacheReport, CacheStrategy, CacheTransfer, DirectoryCache,
    ImageCache,
};
use crate::config::CacheConfig;
use crate::container::ContainerDriver;
use crate::utils::is_valid_cache_name;

use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{error, info, warn};

/// Strategy for cache names that are never transferred
pub struct IgnoredCache<'a> {
    name: &'a str,
}

impl<'a> IgnoredCache<'a> {
    pub fn new(name: &'a str) -> Self {
        Self { name }
    }
}

#[async_trait::async_trait]
impl CacheTransfer for IgnoredCache<'_> {
    async fn restore(&self) -> Result<CacheOutcome, CacheError> {
        info!(cache = %self.name, "Ignoring cache on restore");
        Ok(CacheOutcome::Ignored)
    }

    async fn save(&self) -> Result<CacheOutcome, CacheError> {
        info!(cache = %self.name, "Ignoring cache on save");
        Ok(CacheOutcome::Ignored)
    }
}

/// Synchronizes the caches of one step with one build container
pub struct CacheManager<'a> {
    driver: &'a dyn ContainerDriver,
    caches: &'a BTreeMap<String, String>,
    config: &'a CacheConfig,
}

impl<'a> CacheManager<'a> {
    /// `caches` maps cache names to paths inside the container
    pub fn new(
        driver: &'a dyn ContainerDriver,
        caches: &'a BTreeMap<String, String>,
        config: &'a CacheConfig,
    ) -> Self {
        Self {
            driver,
            caches,
            config,
        }
    }

    /// Restore caches in order; the first failure aborts the rest
    pub async fn restore_all(&self, names: &[String]) -> Result<Vec<CacheReport>, CacheError> {
        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            reports.push(self.restore(name).await?);
        }
        Ok(reports)
    }

    /// Save caches in order; failures are logged and reported, never raised
    pub async fn save_all(&self, names: &[String]) -> Vec<CacheReport> {
        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            let start = Instant::now();
            let report = match self.save(name).await {
                Ok(report) => report,
                Err(e) => {
                    error!(cache = %name, error = %e, "Failed to save cache");
                    CacheReport {
                        name: name.clone(),
                        strategy: CacheStrategy::resolve(name, self.config),
                        outcome: CacheOutcome::Failed {
                            reason: e.to_string(),
                        },
                        elapsed: start.elapsed(),
                    }
                }
            };
            reports.push(report);
        }
        reports
    }

    pub async fn restore(&self, name: &str) -> Result<CacheReport, CacheError> {
        let start = Instant::now();
        let (strategy, transfer) = self.transfer_for(name)?;
        let outcome = transfer.restore().await?;

        Ok(CacheReport {
            name: name.to_string(),
            strategy,
            outcome,
            elapsed: start.elapsed(),
        })
    }

    pub async fn save(&self, name: &str) -> Result<CacheReport, CacheError> {
        let start = Instant::now();
        let (strategy, transfer) = self.transfer_for(name)?;
        let outcome = transfer.save().await?;

        Ok(CacheReport {
            name: name.to_string(),
            strategy,
            outcome,
            elapsed: start.elapsed(),
        })
    }

    fn transfer_for<'n>(
        &self,
        name: &'n str,
    ) -> Result<(CacheStrategy, Box<dyn CacheTransfer + 'n>), CacheError>
    where
        'a: 'n,
    {
        if !is_valid_cache_name(name) {
            warn!(cache = %name, "Refusing cache with an unsafe name");
            return Err(CacheError::InvalidName(name.to_string()));
        }

        let strategy = CacheStrategy::resolve(name, self.config);

        let transfer: Box<dyn CacheTransfer + 'n> = match strategy {
            CacheStrategy::Ignore => Box::new(IgnoredCache::new(name)),
            CacheStrategy::DockerImages => Box::new(ImageCache::new(self.driver, self.config, name)),
            CacheStrategy::Directory => {
                let path = self.caches.get(name).ok_or_else(|| {
                    warn!(cache = %name, "Cache is not defined");
                    CacheError::Undefined(name.to_string())
                })?;
                Box::new(DirectoryCache::new(self.driver, self.config, name, path))
            }
        };

        Ok((strategy, transfer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fake::{DriverCall, FakeArchive, FakeDriver};
    use crate::container::ImageSummary;

    const REMOTE: &str = "/opt/atlassian/pipelines/agent/cache";

    fn caches() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("pip".to_string(), "~/.cache/pip".to_string()),
            ("node".to_string(), "node_modules".to_string()),
            ("gradle".to_string(), "~/.gradle".to_string()),
        ])
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_restore_all_reports_each_name() {
        let temp = tempfile::tempdir().unwrap();
        let config = CacheConfig::new(temp.path());
        std::fs::write(config.archive_path("pip"), b"pip").unwrap();
        let caches = caches();
        let driver = FakeDriver::new();

        let reports = CacheManager::new(&driver, &caches, &config)
            .restore_all(&names(&["pip", "node", "docker"]))
            .await
            .unwrap();

        let outcomes: Vec<_> = reports.iter().map(|r| r.outcome.clone()).collect();
        assert_eq!(
            outcomes,
            vec![
                CacheOutcome::Restored { bytes: 3 },
                CacheOutcome::NotFound,
                CacheOutcome::Ignored,
            ]
        );
        assert_eq!(reports[2].strategy, CacheStrategy::Ignore);
    }

    #[tokio::test]
    async fn test_unsafe_cache_names_never_reach_the_driver() {
        let temp = tempfile::tempdir().unwrap();
        let config = CacheConfig::new(temp.path().join("caches"));
        let caches = BTreeMap::from([("../escape".to_string(), "/tmp".to_string())]);
        let driver = FakeDriver::new();
        let manager = CacheManager::new(&driver, &caches, &config);

        let err = manager.restore("../escape").await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidName(ref name) if name == "../escape"));

        let reports = manager.save_all(&names(&["../escape"])).await;
        assert!(matches!(reports[0].outcome, CacheOutcome::Failed { .. }));

        assert!(driver.calls().is_empty());
        assert!(!temp.path().join("escape.tar").exists());
    }

    #[tokio::test]
    async fn test_restore_all_stops_at_first_failure() {
        let temp = tempfile::tempdir().unwrap();
        let config = CacheConfig::new(temp.path());
        for name in ["pip", "node", "gradle"] {
            std::fs::write(config.archive_path(name), name).unwrap();
        }
        let caches = caches();
        let driver = FakeDriver::new().fail_commands_containing("node_modules");

        let err = CacheManager::new(&driver, &caches, &config)
            .restore_all(&names(&["pip", "node", "gradle"]))
            .await
            .unwrap_err();

        match err {
            CacheError::Transfer { cache, .. } => assert_eq!(cache, "node"),
            other => panic!("expected transfer error, got {:?}", other),
        }

        // gradle was never attempted
        let uploads: Vec<String> = driver.uploads().into_iter().map(|(dir, _)| dir).collect();
        assert_eq!(uploads.len(), 2);
        assert!(!driver.commands().iter().any(|c| c.contains(".gradle")));
    }

    #[tokio::test]
    async fn test_restore_undefined_cache_is_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let config = CacheConfig::new(temp.path());
        let caches = caches();
        let driver = FakeDriver::new();

        let err = CacheManager::new(&driver, &caches, &config)
            .restore_all(&names(&["missing"]))
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::Undefined(ref name) if name == "missing"));
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_save_all_continues_past_failures() {
        let temp = tempfile::tempdir().unwrap();
        let config = CacheConfig::new(temp.path());
        let caches = caches();
        let driver = FakeDriver::new()
            .with_archive(&format!("{}/pip", REMOTE), FakeArchive::Truncated(b"p".to_vec()))
            .with_archive(&format!("{}/node", REMOTE), FakeArchive::Complete(b"node".to_vec()));

        let reports = CacheManager::new(&driver, &caches, &config)
            .save_all(&names(&["pip", "missing", "node", "gradle", "docker"]))
            .await;

        assert_eq!(reports.len(), 5);
        assert!(matches!(reports[0].outcome, CacheOutcome::Failed { .. }));
        assert!(matches!(
            &reports[1].outcome,
            CacheOutcome::Failed { reason } if reason.contains("not defined")
        ));
        assert_eq!(reports[2].outcome, CacheOutcome::Saved { bytes: 4 });
        assert_eq!(reports[3].outcome, CacheOutcome::NotFound);
        assert_eq!(reports[4].outcome, CacheOutcome::Ignored);

        assert!(!config.archive_path("pip").exists());
        assert_eq!(std::fs::read(config.archive_path("node")).unwrap(), b"node");
    }

    #[tokio::test]
    async fn test_docker_cache_uses_image_store_when_enabled() {
        let temp = tempfile::tempdir().unwrap();
        let config = CacheConfig::new(temp.path()).with_docker_images(true);
        let caches = BTreeMap::new();
        let driver = FakeDriver::new().with_image(
            ImageSummary {
                id: "sha256:0123456789abcdef".to_string(),
                tags: vec!["redis:7".to_string()],
            },
            FakeArchive::Complete(b"redis".to_vec()),
        );
        let manager = CacheManager::new(&driver, &caches, &config);

        let saved = manager.save_all(&names(&["docker"])).await;
        assert_eq!(saved[0].strategy, CacheStrategy::DockerImages);
        assert_eq!(saved[0].outcome, CacheOutcome::Images { count: 1, bytes: 5 });

        let restored = manager.restore_all(&names(&["docker"])).await.unwrap();
        assert_eq!(restored[0].outcome, CacheOutcome::Images { count: 1, bytes: 5 });
        assert!(driver.calls().contains(&DriverCall::LoadImage));
    }

    #[tokio::test]
    async fn test_docker_cache_ignored_by_default() {
        let temp = tempfile::tempdir().unwrap();
        let config = CacheConfig::new(temp.path());
        let caches = BTreeMap::from([("docker".to_string(), "/var/lib/docker".to_string())]);
        let driver = FakeDriver::new();

        let reports = CacheManager::new(&driver, &caches, &config)
            .save_all(&names(&["docker"]))
            .await;

        assert_eq!(reports[0].outcome, CacheOutcome::Ignored);
        assert!(driver.calls().is_empty());
    }
}
