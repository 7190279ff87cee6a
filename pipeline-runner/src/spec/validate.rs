// Specification Validator
// Cross-reference checks that parsing alone does not enforce

use super::error::ValidationError;
use super::models::{PipelineItem, PipelineSpec, Step};
use crate::config::DOCKER_NAME;
use crate::utils::is_valid_cache_name;

/// Semantic lint for parsed specifications
pub struct SpecValidator;

impl SpecValidator {
    /// Check cache names, and that every service and cache a step refers to is defined.
    ///
    /// The reserved `docker` name is always accepted. All problems are
    /// collected rather than stopping at the first one.
    pub fn validate(spec: &PipelineSpec) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        for name in spec.definitions.caches.keys() {
            if !is_valid_cache_name(name) {
                errors.push(
                    ValidationError::new(
                        format!("cache name '{}' is not allowed", name),
                        format!("definitions.caches.{}", name),
                    )
                    .with_suggestion("use letters, digits, '-', '_' and '.', not starting with '.'"),
                );
            }
        }

        for (address, pipeline) in spec.pipelines.iter() {
            for (i, item) in pipeline.items().iter().enumerate() {
                let path = format!("pipelines.{}[{}]", address, i);

                match item {
                    PipelineItem::Variables(_) => {}
                    PipelineItem::Step(wrapper) => {
                        Self::validate_step(spec, &wrapper.step, &format!("{}.step", path), &mut errors);
                    }
                    PipelineItem::Parallel(group) => {
                        for (j, wrapper) in group.parallel.iter().enumerate() {
                            let step_path = format!("{}.parallel[{}].step", path, j);
                            Self::validate_step(spec, &wrapper.step, &step_path, &mut errors);
                        }
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_step(
        spec: &PipelineSpec,
        step: &Step,
        path: &str,
        errors: &mut Vec<ValidationError>,
    ) {
        let definitions = &spec.definitions;

        for service in &step.services {
            if service != DOCKER_NAME && !definitions.services.contains_key(service) {
                errors.push(
                    ValidationError::new(
                        format!("service '{}' is not defined", service),
                        format!("{}.services", path),
                    )
                    .with_suggestion(available("definitions.services", definitions.services.keys())),
                );
            }
        }

        for cache in &step.caches {
            if cache != DOCKER_NAME && !definitions.caches.contains_key(cache) {
                errors.push(
                    ValidationError::new(
                        format!("cache '{}' is not defined", cache),
                        format!("{}.caches", path),
                    )
                    .with_suggestion(available("definitions.caches", definitions.caches.keys())),
                );
            }
        }
    }
}

fn available<'a>(section: &str, names: impl Iterator<Item = &'a String>) -> String {
    let names: Vec<&str> = names.map(String::as_str).collect();
    if names.is_empty() {
        format!("add it under {}", section)
    } else {
        format!("defined in {}: {}", section, names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::SpecParser;

    fn validate(yaml: &str) -> Result<(), Vec<ValidationError>> {
        let spec = SpecParser::default().parse_str(yaml).unwrap();
        SpecValidator::validate(&spec)
    }

    #[test]
    fn test_valid_spec() {
        let yaml = r#"
definitions:
  caches:
    pip: ~/.cache/pip
  services:
    redis:
      image: redis
pipelines:
  default:
    - step:
        caches: [pip, docker]
        services: [redis, docker]
        script: [pytest]
"#;
        assert!(validate(yaml).is_ok());
    }

    #[test]
    fn test_undefined_service() {
        let yaml = r#"
definitions:
  services:
    redis:
      image: redis
pipelines:
  default:
    - step:
        services: [mysql]
        script: []
"#;
        let errors = validate(yaml).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "pipelines.default[0].step.services");
        assert!(errors[0].message.contains("mysql"));
        assert_eq!(
            errors[0].suggestion.as_deref(),
            Some("defined in definitions.services: redis")
        );
    }

    #[test]
    fn test_undefined_caches_in_parallel_steps_are_all_reported() {
        let yaml = r#"
pipelines:
  branches:
    main:
      - parallel:
          - step:
              caches: [node]
              script: []
          - step:
              caches: [gradle]
              script: []
"#;
        let errors = validate(yaml).unwrap_err();
        let paths: Vec<&str> = errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "pipelines.branches.main[0].parallel[0].step.caches",
                "pipelines.branches.main[0].parallel[1].step.caches",
            ]
        );
        assert_eq!(
            errors[0].suggestion.as_deref(),
            Some("add it under definitions.caches")
        );
    }

    #[test]
    fn test_variables_item_is_skipped_in_paths() {
        let yaml = r#"
pipelines:
  custom:
    deploy:
      - variables:
          - name: ENV
      - step:
          services: [postgres]
          script: []
"#;
        let errors = validate(yaml).unwrap_err();
        assert_eq!(errors[0].path, "pipelines.custom.deploy[1].step.services");
    }

    #[test]
    fn test_cache_names_that_escape_directories_are_rejected() {
        let yaml = r#"
definitions:
  caches:
    "../escape": /tmp/outside
    pip: ~/.cache/pip
pipelines:
  default:
    - step:
        caches: ["../escape", pip]
        script: []
"#;
        let errors = validate(yaml).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "definitions.caches.../escape");
        assert!(errors[0].message.contains("'../escape'"));
    }
}
