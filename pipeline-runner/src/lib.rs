// Pipeline Runner Library
// Bitbucket pipeline specification model and step cache synchronization

pub mod cache;
pub mod config;
pub mod container;
pub mod spec;
pub mod utils;

// Re-export configuration types
pub use config::{CacheConfig, ConfigError, RunnerConfig, SpecConfig};

// Re-export specification types
pub use spec::{
    PipelineSpec, SpecParser, SpecResult, SpecValidator, SpecificationError,
    SpecificationErrorKind, ValidationError,
};

// Re-export cache types
pub use cache::{CacheError, CacheManager, CacheOutcome, CacheReport, CacheStrategy};

// Re-export container types
pub use container::{ArchiveReader, CommandOutput, ContainerDriver, DockerCliDriver, DriverError, ImageSummary};
