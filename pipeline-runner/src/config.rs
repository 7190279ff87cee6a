// Runner Configuration
// Defaults for parsing and cache synchronization, overridable from the environment

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Name of the reserved service and cache that refer to the Docker daemon
pub const DOCKER_NAME: &str = "docker";

/// Prefix of every environment variable read by [`RunnerConfig::from_env`]
pub const ENV_PREFIX: &str = "PIPELINE_RUNNER_";

/// Errors raised while loading configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Defaults applied while parsing a pipeline specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecConfig {
    /// Image used when neither the step nor the pipeline declares one
    pub default_image: String,

    /// Memory limit (MB) of a service that does not declare one
    pub service_memory_limit: u32,

    /// Memory limit (MB) of the `docker` service when it does not declare one
    pub docker_service_memory_limit: u32,
}

impl Default for SpecConfig {
    fn default() -> Self {
        Self {
            default_image: "atlassian/default-image:latest".to_string(),
            service_memory_limit: 1024,
            docker_service_memory_limit: 2048,
        }
    }
}

impl SpecConfig {
    /// Memory limit a service gets when its definition omits `memory`
    pub fn default_memory_for(&self, service_name: &str) -> u32 {
        if service_name == DOCKER_NAME {
            self.docker_service_memory_limit
        } else {
            self.service_memory_limit
        }
    }
}

/// Settings for one cache synchronization run
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Local directory holding `<name>.tar` archives and the `docker/` image cache
    pub local_dir: PathBuf,

    /// Directory inside the build container used for staging cache data
    pub remote_dir: String,

    /// Cache names that are never transferred
    pub ignored_caches: BTreeSet<String>,

    /// Route the `docker` cache to the image-store strategy instead of ignoring it
    pub docker_images: bool,

    /// Upper bound for each individual container operation
    pub operation_timeout: Duration,
}

impl CacheConfig {
    pub fn new(local_dir: impl Into<PathBuf>) -> Self {
        Self {
            local_dir: local_dir.into(),
            remote_dir: "/opt/atlassian/pipelines/agent/cache".to_string(),
            ignored_caches: BTreeSet::from([DOCKER_NAME.to_string()]),
            docker_images: false,
            operation_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_docker_images(mut self, enabled: bool) -> Self {
        self.docker_images = enabled;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Local archive for a directory cache
    pub fn archive_path(&self, cache_name: &str) -> PathBuf {
        self.local_dir.join(format!("{}.tar", cache_name))
    }

    /// Local directory holding exported container images
    pub fn images_dir(&self) -> PathBuf {
        self.local_dir.join(DOCKER_NAME)
    }

    /// Staging directory for a cache inside the container
    pub fn staging_dir(&self, cache_name: &str) -> String {
        format!("{}/{}", self.remote_dir.trim_end_matches('/'), cache_name)
    }
}

/// Top-level configuration shared by the CLI and embedding engines
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Root holding one cache directory per project
    pub cache_root: PathBuf,

    pub spec: SpecConfig,

    pub remote_caches_dir: String,

    pub docker_images: bool,

    pub operation_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let cache_root = dirs::cache_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pipeline-runner");

        Self {
            cache_root,
            spec: SpecConfig::default(),
            remote_caches_dir: "/opt/atlassian/pipelines/agent/cache".to_string(),
            docker_images: false,
            operation_timeout: Duration::from_secs(600),
        }
    }
}

impl RunnerConfig {
    /// Load defaults overridden by `PIPELINE_RUNNER_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load defaults overridden by values returned from `lookup`
    ///
    /// Keys are full variable names, e.g. `PIPELINE_RUNNER_CACHE_ROOT`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| {
            let key = format!("{}{}", ENV_PREFIX, name);
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, value)) = get("CACHE_ROOT") {
            config.cache_root = PathBuf::from(value);
        }
        if let Some((_, value)) = get("DEFAULT_IMAGE") {
            config.spec.default_image = value;
        }
        if let Some((key, value)) = get("SERVICE_MEMORY") {
            config.spec.service_memory_limit = parse_number(&key, &value)?;
        }
        if let Some((key, value)) = get("DOCKER_SERVICE_MEMORY") {
            config.spec.docker_service_memory_limit = parse_number(&key, &value)?;
        }
        if let Some((_, value)) = get("REMOTE_CACHES_DIR") {
            config.remote_caches_dir = value;
        }
        if let Some((key, value)) = get("DOCKER_IMAGE_CACHE") {
            config.docker_images = parse_bool(&key, &value)?;
        }
        if let Some((key, value)) = get("CACHE_TIMEOUT_SECS") {
            config.operation_timeout = Duration::from_secs(parse_number(&key, &value)?);
        }

        Ok(config)
    }

    /// Cache directory of one project
    pub fn project_cache_dir(&self, project_slug: &str) -> PathBuf {
        self.cache_root.join(project_slug).join("caches")
    }

    /// Cache settings for one project
    pub fn cache_config(&self, project_slug: &str) -> CacheConfig {
        let mut cache = CacheConfig::new(self.project_cache_dir(project_slug))
            .with_docker_images(self.docker_images)
            .with_operation_timeout(self.operation_timeout);
        cache.remote_dir = self.remote_caches_dir.clone();
        cache
    }

    /// Project directories currently present under the cache root
    pub fn cached_projects(&self) -> std::io::Result<Vec<PathBuf>> {
        list_dirs(&self.cache_root)
    }
}

fn list_dirs(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
