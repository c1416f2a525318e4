//! Cascade - CI pipeline planner for package recipe repositories
//!
//! The `cascade` command inspects a recipe repository, works out which
//! packages a change affects and writes a pipeline for the CI engine.
//!
//! ## Commands
//!
//! - `examine`: plan the pipeline for a change set and write it to disk

mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use cascade_core::concourse::{self, ConcourseOptions};
use cascade_core::{
    capture_head_sha, changed_paths_from_git, discover_recipes, load_matrix_dir, ChangeSet,
    PlanContext, PlanOptions, Planner, ProjectConfig, TomlRecipeRenderer,
};

const PLAN_FILE: &str = "plan.json";
const PIPELINE_FILE: &str = "pipeline.json";
const DIGEST_FILE: &str = "plan.sha256";

#[derive(Parser)]
#[command(name = "cascade")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Plan CI pipelines for interdependent package recipes", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the build plan for changed recipes and write it out
    Examine(ExamineArgs),
}

#[derive(clap::Args, Debug)]
struct ExamineArgs {
    /// Project name; also the default config root
    base_name: String,

    /// Root of the recipe repository
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Explicit recipe folders to plan; skips git inspection
    #[arg(long, num_args = 1..)]
    folders: Vec<String>,

    /// Downstream hops to follow (-1 = all) [default: 0]
    #[arg(long, allow_negative_numbers = true)]
    steps: Option<i64>,

    /// Cap on units added downstream (-1 = unbounded) [default: 5]
    #[arg(long, allow_negative_numbers = true)]
    max_downstream: Option<i64>,

    /// Revision whose changes are planned
    #[arg(long, default_value = "HEAD")]
    git_rev: String,

    /// Plan the range git_rev..stop_rev instead of the single revision
    #[arg(long)]
    stop_rev: Option<String>,

    /// Only test the changed recipes instead of rebuilding them
    #[arg(long)]
    test: bool,

    /// Folder of matrix row files (default: <config root>/matrix)
    #[arg(long)]
    matrix_base_dir: Option<PathBuf>,

    /// Folder with config.toml and uploads.d (default: <base_name>)
    #[arg(long)]
    config_root_dir: Option<PathBuf>,

    /// Folder the plan files are written to
    #[arg(long, default_value = "../output")]
    output_dir: PathBuf,

    /// Commit id used in artifact paths (default: resolved from git)
    #[arg(long)]
    commit_id: Option<String>,

    /// Drop invalid upload targets instead of failing
    #[arg(long)]
    lenient_uploads: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(cli.verbose, cli.json);

    match cli.command {
        Commands::Examine(args) => cmd_examine(&args),
    }
}

fn cmd_examine(args: &ExamineArgs) -> Result<()> {
    let config_root = args
        .config_root_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&args.base_name));
    let config = ProjectConfig::load(&config_root)
        .with_context(|| format!("Failed to load configuration from {}", config_root.display()))?;
    let matrix_dir = args
        .matrix_base_dir
        .clone()
        .unwrap_or_else(|| config.matrix_dir());
    let matrix = load_matrix_dir(&matrix_dir)
        .with_context(|| format!("Failed to load build matrix from {}", matrix_dir.display()))?;

    let recipes = discover_recipes(&args.path)
        .with_context(|| format!("Failed to scan recipes under {}", args.path.display()))?;
    info!(recipes = recipes.len(), root = %args.path.display(), "Discovered recipes");

    let change_set = change_set(args, &recipes)?;
    if change_set.is_empty() {
        warn!("No changed recipes; the plan will be empty");
    }

    let commit_id = match &args.commit_id {
        Some(id) => id.clone(),
        None => {
            let rev = args.stop_rev.as_deref().unwrap_or(&args.git_rev);
            capture_head_sha(&args.path, rev).context("Failed to resolve commit id")?
        }
    };

    let options = plan_options(args, &config, commit_id)?;
    let concourse_options = ConcourseOptions::from_config(&config.shared, &config.planner)
        .context("Failed to read CI resource settings")?;
    let context = PlanContext::new(TomlRecipeRenderer::new(&args.path), matrix)
        .with_uploads(config.uploads)
        .with_shared(config.shared)
        .with_options(options);
    let outcome = Planner::new(context).plan(&recipes, &change_set)?;

    for warning in &outcome.warnings {
        warn!(%warning, "Planning warning");
    }
    for rejected in &outcome.rejected {
        warn!(upload = %rejected.target, error = %rejected.error, "Upload target skipped");
    }

    let digest = outcome.pipeline.digest()?;
    let rendered = concourse::render(&outcome.pipeline, &concourse_options)
        .context("Failed to render the Concourse pipeline")?;
    write_outputs(&args.output_dir, &rendered, &outcome.pipeline, &digest)?;
    info!(digest = %digest, output = %args.output_dir.display(), "Wrote plan");

    println!(
        "Planned {} job(s) from {} change(s) into {}",
        outcome.pipeline.len(),
        change_set.len(),
        args.output_dir.join(PLAN_FILE).display()
    );
    println!("  Digest: {digest}");
    Ok(())
}

fn change_set(args: &ExamineArgs, recipes: &[String]) -> Result<ChangeSet> {
    if !args.folders.is_empty() {
        return Ok(ChangeSet::from_folders(&args.folders));
    }
    let paths = changed_paths_from_git(&args.path, &args.git_rev, args.stop_rev.as_deref())
        .context("Failed to list changed files")?;
    Ok(ChangeSet::from_paths(paths, recipes))
}

/// Flags win over the `[planner]` table, which wins over built-in defaults.
fn plan_options(
    args: &ExamineArgs,
    config: &ProjectConfig,
    commit_id: String,
) -> Result<PlanOptions> {
    let mut options = PlanOptions::from_settings(&config.planner)
        .context("Invalid [planner] settings")?;
    if let Some(steps) = args.steps {
        options.bounds.steps = steps;
    }
    if let Some(max) = args.max_downstream {
        options.bounds.max_downstream = max;
    }
    options.bounds.test_only = args.test;
    if args.lenient_uploads {
        options.strict_uploads = false;
    }
    options.assemble.commit_id = commit_id;
    options
        .bounds
        .validate()
        .context("Invalid --steps or --max-downstream")?;
    Ok(options)
}

fn write_outputs(
    dir: &Path,
    rendered: &concourse::ConcoursePipeline,
    pipeline: &cascade_core::Pipeline,
    digest: &str,
) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;

    let plan = serde_json::to_string_pretty(rendered)?;
    write_file(&dir.join(PLAN_FILE), &plan)?;
    let abstract_plan = serde_json::to_string_pretty(pipeline)?;
    write_file(&dir.join(PIPELINE_FILE), &abstract_plan)?;
    write_file(&dir.join(DIGEST_FILE), &format!("{digest}\n"))?;
    Ok(())
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}
