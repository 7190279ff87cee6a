// Utility Functions
// Size formatting, slugs and project root discovery

use std::path::{Path, PathBuf};

/// File name of the pipeline definition at the root of a repository
pub const PIPELINE_FILE_NAME: &str = "bitbucket-pipelines.yml";

/// Render a byte count with binary units, e.g. `1.5 MiB`
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{:.1} {}", size, UNITS[unit])
}

/// Lowercase `input` and collapse every run of non-alphanumeric characters into `-`
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;

    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    slug
}

/// Whether `name` can name a local archive and a staging directory.
///
/// Letters, digits, `-`, `_` and `.` are allowed; a leading `.` is not,
/// which also rules out `.` and `..`.
pub fn is_valid_cache_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Walk up from `start` to the first directory containing the pipeline file.
///
/// Returns `None` when no ancestor holds a `bitbucket-pipelines.yml`.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().ok()?;
    start
        .ancestors()
        .find(|dir| dir.join(PIPELINE_FILE_NAME).is_file())
        .map(Path::to_path_buf)
}

/// Slug identifying a project in the local cache root
pub fn project_slug(project_root: &Path) -> String {
    let name = project_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let slug = slugify(&name);
    if slug.is_empty() {
        "default".to_string()
    } else {
        slug
    }
}
