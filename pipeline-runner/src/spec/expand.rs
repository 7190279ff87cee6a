// Environment Expander
// Substitutes $NAME / ${NAME} tokens in string leaves of a document tree

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_yaml::Value;
use std::collections::HashMap;

static VARIABLE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("variable pattern is a valid regex")
});

/// One step of the path from the document root to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Replace `$NAME` and `${NAME}` with values from `vars`; unknown names are left untouched
pub fn expand_str(input: &str, vars: &HashMap<String, String>) -> String {
    VARIABLE_PATTERN
        .replace_all(input, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();

            match vars.get(name) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Expand every string leaf of `value` whose path is not matched by `exclude`.
///
/// Mapping keys are never expanded.
pub fn expand_value(
    value: &Value,
    vars: &HashMap<String, String>,
    exclude: &dyn Fn(&[PathSegment]) -> bool,
) -> Value {
    let mut path = Vec::new();
    expand_node(value, vars, exclude, &mut path)
}

/// Default exclusion: image names are used verbatim
pub fn is_image_name(path: &[PathSegment]) -> bool {
    matches!(
        path,
        [.., PathSegment::Key(parent), PathSegment::Key(leaf)] if parent == "image" && leaf == "name"
    )
}

fn expand_node(
    value: &Value,
    vars: &HashMap<String, String>,
    exclude: &dyn Fn(&[PathSegment]) -> bool,
    path: &mut Vec<PathSegment>,
) -> Value {
    if exclude(path) {
        return value.clone();
    }

    match value {
        Value::String(s) => Value::String(expand_str(s, vars)),
        Value::Sequence(items) => {
            let expanded = items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    path.push(PathSegment::Index(i));
                    let node = expand_node(item, vars, exclude, path);
                    path.pop();
                    node
                })
                .collect();
            Value::Sequence(expanded)
        }
        Value::Mapping(map) => {
            let mut expanded = serde_yaml::Mapping::with_capacity(map.len());
            for (key, item) in map {
                let segment = match key {
                    Value::String(s) => PathSegment::Key(s.clone()),
                    other => PathSegment::Key(
                        serde_yaml::to_string(other)
                            .map(|s| s.trim_end().to_string())
                            .unwrap_or_default(),
                    ),
                };
                path.push(segment);
                let node = expand_node(item, vars, exclude, path);
                path.pop();
                expanded.insert(key.clone(), node);
            }
            Value::Mapping(expanded)
        }
        other => other.clone(),
    }
}
