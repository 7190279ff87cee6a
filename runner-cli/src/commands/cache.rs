use crate::commands::{load_spec, ProjectArgs};
use crate::output;

use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;

use pipeline_runner::utils::{human_size, project_slug};
use pipeline_runner::{
    CacheConfig, CacheManager, CacheOutcome, CacheReport, DockerCliDriver, RunnerConfig,
};

/// Inspect, clear or synchronize local caches
#[derive(Args, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Show the caches stored for the current project
    List {
        #[command(flatten)]
        project: ProjectArgs,

        /// Show every project under the cache root
        #[arg(long)]
        all: bool,
    },

    /// Delete the caches stored for the current project
    Clear {
        #[command(flatten)]
        project: ProjectArgs,

        /// Delete the caches of every project
        #[arg(long)]
        all: bool,
    },

    /// Copy caches from the local directory into a running container
    Restore(TransferArgs),

    /// Copy caches out of a running container into the local directory
    Save(SaveArgs),
}

#[derive(Args, Debug)]
pub struct TransferArgs {
    /// Name or ID of the build container
    pub container: String,

    /// Caches to transfer, as named in definitions.caches
    #[arg(required = true)]
    pub names: Vec<String>,

    /// Docker daemon holding the image store, e.g. tcp://localhost:2375
    #[arg(long, value_name = "HOST")]
    pub docker_host: Option<String>,

    #[command(flatten)]
    pub project: ProjectArgs,
}

#[derive(Args, Debug)]
pub struct SaveArgs {
    #[command(flatten)]
    pub transfer: TransferArgs,

    /// Exit with an error when any cache could not be saved
    #[arg(long)]
    pub strict: bool,
}

pub async fn execute(args: CacheArgs) -> Result<()> {
    let config = RunnerConfig::from_env()?;

    match args.command {
        CacheCommand::List { project, all } => list(&config, &project, all),
        CacheCommand::Clear { project, all } => clear(&config, &project, all),
        CacheCommand::Restore(args) => restore(&config, args).await,
        CacheCommand::Save(args) => save(&config, args).await,
    }
}

fn list(config: &RunnerConfig, project: &ProjectArgs, all: bool) -> Result<()> {
    let dirs = if all {
        config
            .cached_projects()?
            .into_iter()
            .map(|dir| dir.join("caches"))
            .collect()
    } else {
        let slug = project_slug(&project.root()?);
        vec![config.project_cache_dir(&slug)]
    };

    let mut shown = 0;
    for dir in dirs {
        let entries = summarize(&dir)?;
        if entries.is_empty() {
            continue;
        }
        shown += 1;

        output::status("Caches", &dir.display().to_string());
        for entry in entries {
            println!("  {:<24} {}", entry.name, entry.description);
        }
    }

    if shown == 0 {
        output::warning("No caches stored");
    }
    Ok(())
}

fn clear(config: &RunnerConfig, project: &ProjectArgs, all: bool) -> Result<()> {
    let targets: Vec<PathBuf> = if all {
        config.cached_projects()?
    } else {
        let slug = project_slug(&project.root()?);
        vec![config.cache_root.join(slug)]
    };

    let mut removed = 0;
    for target in targets.iter().filter(|t| t.exists()) {
        std::fs::remove_dir_all(target)
            .wrap_err_with(|| format!("failed to remove {}", target.display()))?;
        output::dim(&format!("removed {}", target.display()));
        removed += 1;
    }

    if removed == 0 {
        output::warning("No caches stored");
    } else {
        output::success(&format!("Cleared {} project cache(s)", removed));
    }
    Ok(())
}

async fn restore(config: &RunnerConfig, args: TransferArgs) -> Result<()> {
    let root = args.project.root()?;
    let spec = load_spec(config, &root)?;
    let cache_config = config.cache_config(&project_slug(&root));
    let driver = connect(&args)?;

    output::status("Restoring", &format!("caches into {}", args.container));
    let manager = CacheManager::new(&driver, &spec.definitions.caches, &cache_config);
    let reports = manager.restore_all(&args.names).await?;

    print_reports(&reports);
    Ok(())
}

async fn save(config: &RunnerConfig, save_args: SaveArgs) -> Result<()> {
    let args = save_args.transfer;
    let root = args.project.root()?;
    let spec = load_spec(config, &root)?;
    let cache_config = config.cache_config(&project_slug(&root));
    ensure_dir(&cache_config)?;
    let driver = connect(&args)?;

    output::status("Saving", &format!("caches from {}", args.container));
    let manager = CacheManager::new(&driver, &spec.definitions.caches, &cache_config);
    let reports = manager.save_all(&args.names).await;

    let failures = print_reports(&reports);
    save_verdict(failures, save_args.strict)
}

/// Saves are best effort unless `strict` is set
fn save_verdict(failures: usize, strict: bool) -> Result<()> {
    if failures == 0 {
        return Ok(());
    }

    if strict {
        bail!("{} cache(s) could not be saved", failures);
    }
    output::warning(&format!(
        "{} cache(s) could not be saved; the next run starts without them",
        failures
    ));
    Ok(())
}

fn connect(args: &TransferArgs) -> Result<DockerCliDriver> {
    let driver = DockerCliDriver::new(args.container.as_str())?;
    tracing::debug!(
        container = %args.container,
        docker_host = ?args.docker_host,
        "Using docker CLI driver"
    );
    Ok(match &args.docker_host {
        Some(host) => driver.with_docker_host(host.as_str()),
        None => driver,
    })
}

fn ensure_dir(config: &CacheConfig) -> Result<()> {
    std::fs::create_dir_all(&config.local_dir)
        .wrap_err_with(|| format!("failed to create {}", config.local_dir.display()))
}

/// Print one line per report, returning the number of failures
fn print_reports(reports: &[CacheReport]) -> usize {
    let mut failures = 0;
    for report in reports {
        let line = format!(
            "{}: {} in {:.1}s",
            report.name,
            report.outcome,
            report.elapsed.as_secs_f64()
        );
        match &report.outcome {
            CacheOutcome::Failed { .. } => {
                failures += 1;
                output::failure(&line);
            }
            CacheOutcome::NotFound | CacheOutcome::Ignored => output::info(&line),
            _ => output::check(&line),
        }
    }
    failures
}

#[derive(Debug, PartialEq, Eq)]
struct CacheEntry {
    name: String,
    description: String,
}

/// Describe the archives and image cache found in a project's cache directory
fn summarize(dir: &Path) -> Result<Vec<CacheEntry>> {
    let mut entries = Vec::new();
    if !dir.is_dir() {
        return Ok(entries);
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    paths.sort();

    for path in paths {
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };

        if path.is_dir() {
            let (count, bytes) = tar_files(&path)?;
            entries.push(CacheEntry {
                name: file_name,
                description: format!("{} image(s), {}", count, human_size(bytes)),
            });
        } else if let Some(name) = file_name.strip_suffix(".tar") {
            entries.push(CacheEntry {
                name: name.to_string(),
                description: human_size(path.metadata()?.len()),
            });
        }
    }

    Ok(entries)
}

fn tar_files(dir: &Path) -> Result<(usize, u64)> {
    let mut count = 0;
    let mut bytes = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "tar") {
            count += 1;
            bytes += path.metadata()?.len();
        }
    }
    Ok((count, bytes))
}
