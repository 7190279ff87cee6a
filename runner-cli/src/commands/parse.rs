use crate::commands::{load_spec, ProjectArgs};

use std::collections::HashMap;

use clap::{Args, ValueEnum};
use color_eyre::eyre::bail;
use color_eyre::Result;
use serde::Serialize;

use pipeline_runner::{RunnerConfig, SpecParser};

/// Print the parsed specification
#[derive(Args, Debug)]
pub struct ParseArgs {
    /// Pipeline to print, e.g. `default` or `custom.deploy` (default: whole file)
    pub pipeline: Option<String>,

    #[command(flatten)]
    pub project: ProjectArgs,

    /// Expand a variable before printing (repeatable)
    #[arg(short = 'e', long = "env", value_name = "VAR=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Json)]
    pub format: Format,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Yaml,
}

pub fn execute(args: ParseArgs) -> Result<()> {
    let config = RunnerConfig::from_env()?;
    let root = args.project.root()?;
    let mut spec = load_spec(&config, &root)?;

    if !args.env.is_empty() {
        let vars: HashMap<String, String> = args.env.into_iter().collect();
        spec = SpecParser::new(config.spec.clone()).expand(&spec, &vars)?;
    }

    let rendered = match &args.pipeline {
        Some(name) => match spec.pipeline(name) {
            Some(pipeline) => render(pipeline, args.format)?,
            None => bail!(
                "pipeline '{}' not found (available: {})",
                name,
                spec.available_pipelines().join(", ")
            ),
        },
        None => render(&spec, args.format)?,
    };

    println!("{}", rendered.trim_end());
    Ok(())
}

fn render<T: Serialize>(value: &T, format: Format) -> Result<String> {
    Ok(match format {
        Format::Json => serde_json::to_string_pretty(value)?,
        Format::Yaml => serde_yaml::to_string(value)?,
    })
}

/// Parse `VAR=VALUE`; the value may itself contain `=`
pub fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected VAR=VALUE, got '{}'", raw))?;

    if name.is_empty() {
        return Err(format!("missing variable name in '{}'", raw));
    }

    Ok((name.to_string(), value.to_string()))
}
