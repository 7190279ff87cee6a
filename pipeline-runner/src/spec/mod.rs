// Specification module for Bitbucket pipelines
// Provides YAML parsing, variable expansion and semantic validation

pub mod error;
pub mod expand;
pub mod models;
pub mod parser;
pub mod validate;

pub use error::{SpecResult, SpecificationError, SpecificationErrorKind, ValidationError};
pub use expand::{expand_str, expand_value, is_image_name, PathSegment};
pub use models::*;
pub use parser::SpecParser;
pub use validate::SpecValidator;
