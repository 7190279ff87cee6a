// CLI subcommands and the project lookup they share

pub mod cache;
pub mod list;
pub mod parse;
pub mod validate;

use crate::output;

use std::path::{Path, PathBuf};

use clap::Args;
use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;

use pipeline_runner::utils::{find_project_root, PIPELINE_FILE_NAME};
use pipeline_runner::{PipelineSpec, RunnerConfig, SpecParser};

/// Repository selection shared by every subcommand
#[derive(Args, Debug, Clone, Default)]
pub struct ProjectArgs {
    /// Repository root (default: nearest ancestor holding bitbucket-pipelines.yml)
    #[arg(short = 'r', long = "repository", value_name = "DIR")]
    pub repository: Option<PathBuf>,
}

impl ProjectArgs {
    /// Resolve the repository root
    pub fn root(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.repository {
            if !dir.join(PIPELINE_FILE_NAME).is_file() {
                bail!("{} not found in {}", PIPELINE_FILE_NAME, dir.display());
            }
            return Ok(dir.clone());
        }

        let cwd = std::env::current_dir()?;
        find_project_root(&cwd).ok_or_else(|| {
            eyre!(
                "no {} found in {} or any parent directory",
                PIPELINE_FILE_NAME,
                cwd.display()
            )
        })
    }
}

/// Parse the pipeline file of `root`, printing a located report on failure
pub fn load_spec(config: &RunnerConfig, root: &Path) -> Result<PipelineSpec> {
    let path = root.join(PIPELINE_FILE_NAME);
    let parser = SpecParser::new(config.spec.clone());

    parser.parse_file(&path).map_err(|e| {
        output::error(&format!("{}: {}", path.display(), e.message));
        if !e.context.is_empty() {
            output::dim(e.context.trim_end());
        }
        if let Some(suggestion) = &e.suggestion {
            output::info(&format!("Suggestion: {}", suggestion));
        }
        eyre!("failed to parse {}", path.display())
    })
}
