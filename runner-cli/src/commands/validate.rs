use crate::commands::{load_spec, ProjectArgs};
use crate::output;

use clap::Args;
use color_eyre::eyre::bail;
use color_eyre::Result;

use pipeline_runner::utils::PIPELINE_FILE_NAME;
use pipeline_runner::{RunnerConfig, SpecValidator};

/// Validate the repository's pipeline file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let config = RunnerConfig::from_env()?;
    let root = args.project.root()?;

    // Step 1: Parse
    output::status(
        "Validating",
        &format!("{}", root.join(PIPELINE_FILE_NAME).display()),
    );
    let spec = load_spec(&config, &root)?;

    let pipelines = spec.available_pipelines().len();
    let steps: usize = spec
        .pipelines
        .iter()
        .map(|(_, pipeline)| pipeline.all_steps().len())
        .sum();
    output::check(&format!("Structure: {} pipelines, {} steps", pipelines, steps));

    // Step 2: Cross-references
    match SpecValidator::validate(&spec) {
        Ok(()) => output::check("Services and caches are defined"),
        Err(errors) => {
            output::failure(&format!("{} validation error(s):", errors.len()));
            for error in &errors {
                output::error(&format!("[{}] {}", error.path, error.message));
                if let Some(suggestion) = &error.suggestion {
                    output::info(suggestion);
                }
            }
            bail!("pipeline file is invalid");
        }
    }

    println!();
    output::success("Pipeline is valid");
    Ok(())
}
