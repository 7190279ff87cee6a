// Pipeline Specification Parser
// Turns YAML/JSON documents into a validated PipelineSpec and expands variables

use super::error::{SpecResult, SpecificationError};
use super::expand::{expand_value, is_image_name};
use super::models::{Definitions, DefinitionsDocument, PipelineSpec, SpecDocument};
use crate::config::SpecConfig;

use serde_yaml::Value;
use std::collections::HashMap;
use std::path::Path;

/// Parser for `bitbucket-pipelines.yml` documents
#[derive(Debug, Clone, Default)]
pub struct SpecParser {
    config: SpecConfig,
}

impl SpecParser {
    pub fn new(config: SpecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SpecConfig {
        &self.config
    }

    /// Parse YAML (or JSON) text; failures carry line, column and an excerpt
    pub fn parse_str(&self, source: &str) -> SpecResult<PipelineSpec> {
        if source.trim().is_empty() {
            return Err(SpecificationError::schema("pipeline document is empty"));
        }

        // Anything that fails before the typed pass is malformed YAML
        serde_yaml::from_str::<Value>(source)
            .map_err(|e| SpecificationError::from_yaml_syntax_error(&e, source))?;

        let doc: SpecDocument = serde_yaml::from_str(source)
            .map_err(|e| SpecificationError::from_yaml_error(&e, Some(source)))?;

        let spec = doc.resolve(&self.config);
        tracing::debug!(
            pipelines = spec.available_pipelines().len(),
            services = spec.definitions.services.len(),
            caches = spec.definitions.caches.len(),
            "Parsed pipeline specification"
        );
        Ok(spec)
    }

    /// Parse an already loaded document tree
    pub fn parse_value(&self, document: Value) -> SpecResult<PipelineSpec> {
        let doc: SpecDocument = serde_yaml::from_value(document)
            .map_err(|e| SpecificationError::from_yaml_error(&e, None))?;
        Ok(doc.resolve(&self.config))
    }

    /// Read and parse a pipeline file
    pub fn parse_file(&self, path: &Path) -> SpecResult<PipelineSpec> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            SpecificationError::io(format!("failed to read {}: {}", path.display(), e))
        })?;
        self.parse_str(&source)
    }

    /// Parse a bare `definitions` block
    pub fn parse_definitions_value(&self, document: Value) -> SpecResult<Definitions> {
        let doc: DefinitionsDocument = if document.is_null() {
            DefinitionsDocument::default()
        } else {
            serde_yaml::from_value(document)
                .map_err(|e| SpecificationError::from_yaml_error(&e, None))?
        };
        Ok(doc.resolve(&self.config))
    }

    /// Substitute `vars` into every string of `spec` except image names.
    ///
    /// Returns a new graph; `spec` is left untouched.
    pub fn expand(
        &self,
        spec: &PipelineSpec,
        vars: &HashMap<String, String>,
    ) -> SpecResult<PipelineSpec> {
        let document = serde_yaml::to_value(spec).map_err(|e| {
            SpecificationError::schema(format!("failed to serialize specification: {}", e))
        })?;

        let expanded = expand_value(&document, vars, &is_image_name);
        self.parse_value(expanded)
    }
}
