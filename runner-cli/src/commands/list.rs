use crate::commands::{load_spec, ProjectArgs};
use crate::output;

use clap::Args;
use color_eyre::Result;

use pipeline_runner::spec::PipelineSpec;
use pipeline_runner::RunnerConfig;

/// List available pipelines
#[derive(Args, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
}

pub fn execute(args: ListArgs) -> Result<()> {
    let config = RunnerConfig::from_env()?;
    let root = args.project.root()?;
    let spec = load_spec(&config, &root)?;

    let lines = describe(&spec);
    if lines.is_empty() {
        output::warning("No pipelines defined");
        return Ok(());
    }

    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

/// One line per pipeline: address and step count
fn describe(spec: &PipelineSpec) -> Vec<String> {
    spec.pipelines
        .iter()
        .map(|(address, pipeline)| {
            let steps = pipeline.all_steps().len();
            let variables = pipeline.variables().len();
            if variables > 0 {
                format!("{}  ({} steps, {} variables)", address, steps, variables)
            } else {
                format!("{}  ({} steps)", address, steps)
            }
        })
        .collect()
}
