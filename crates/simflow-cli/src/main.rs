//! simflow - simulation production planner CLI
//!
//! The `simflow` command drives the planning core for an external executor.
//!
//! ## Commands
//!
//! - `plan`: Expand the catalog into an ordered job plan (JSON)
//! - `fingerprint`: Print the change fingerprint of one node
//! - `partition`: Split a simulation's events across runs by live time
//! - `parse-path`: Map an artifact path back to its tuple
//! - `render-macro`: Write the rendered macro of one job

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, Level};

use simflow_core::persist::write_atomic;
use simflow_core::{
    expand, Catalog, EventStatistics, Fingerprinter, PartitionTable, PathEngine, Plan, Planner,
    ResolvedCatalog, RunInfoTable, Selection, SimflowConfig, StructuralInputs, Target, Tier,
};

/// Format of `--log-stamp now`.
const STAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Parser)]
#[command(name = "simflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Monte Carlo simulation production planner", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Production configuration file (YAML or JSON)
    #[arg(
        short,
        long,
        global = true,
        env = "SIMFLOW_CONFIG",
        default_value = "simflow-config.yaml"
    )]
    config: PathBuf,

    /// Per-invocation log subdirectory (`now` for a UTC timestamp)
    #[arg(long, global = true)]
    log_stamp: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand the catalog into a job plan
    Plan {
        /// Comma-separated targets (`<tier>.<simid>`, `<simid>` or `all`)
        #[arg(short, long, conflicts_with = "targets_file")]
        targets: Option<String>,

        /// File with one target per line
        #[arg(long)]
        targets_file: Option<PathBuf>,

        /// Write the plan here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the change fingerprint of `<tier>.<simid>`
    Fingerprint {
        /// Node to fingerprint
        node: String,
    },

    /// Partition a simulation's events across runs by live time
    Partition {
        /// Simulation id
        #[arg(long)]
        simid: String,

        /// Events to distribute
        #[arg(long, conflicts_with = "stats")]
        total_events: Option<u64>,

        /// Per-job event counts recorded by the executor
        #[arg(long)]
        stats: Option<PathBuf>,

        /// Comma-separated runs (default: the configured run list)
        #[arg(long)]
        runs: Option<String>,

        /// Output path (default: the canonical partition file)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the (tier, simid, job, kind) tuple of an artifact path
    ParsePath {
        /// Artifact path
        path: PathBuf,
    },

    /// Render and write the macro of one job
    RenderMacro {
        /// Node `<tier>.<simid>` (ver or stp)
        node: String,

        /// Job index
        #[arg(short, long, default_value = "0")]
        job: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    simflow_core::telemetry::init_tracing(cli.json, level);

    let config = load_config(&cli.config, cli.log_stamp.as_deref())?;
    match cli.command {
        Commands::Plan {
            targets,
            targets_file,
            output,
        } => {
            let selection = selection(&config, targets.as_deref(), targets_file.as_deref())?;
            let plan = cmd_plan(&config, &selection)?;
            emit(&plan.to_json()?, output.as_deref())
        }
        Commands::Fingerprint { node } => {
            let digest = cmd_fingerprint(&config, &node)?;
            println!("{digest}");
            Ok(())
        }
        Commands::Partition {
            simid,
            total_events,
            stats,
            runs,
            output,
        } => {
            let written = cmd_partition(
                &config,
                &simid,
                total_events,
                stats.as_deref(),
                runs.as_deref(),
                output.as_deref(),
            )?;
            println!("{}", written.display());
            Ok(())
        }
        Commands::ParsePath { path } => cmd_parse_path(&config, &path),
        Commands::RenderMacro { node, job } => {
            let written = cmd_render_macro(&config, &node, job)?;
            println!("{}", written.display());
            Ok(())
        }
    }
}

/// Load the configuration, applying a command-line log stamp.
fn load_config(path: &Path, log_stamp: Option<&str>) -> Result<SimflowConfig> {
    let mut config = SimflowConfig::load(path)
        .with_context(|| format!("Failed to load configuration {:?}", path))?;
    if let Some(stamp) = log_stamp {
        config.log_stamp = Some(if stamp == "now" {
            chrono::Utc::now().format(STAMP_FORMAT).to_string()
        } else {
            stamp.to_string()
        });
        config.validate().context("Invalid --log-stamp")?;
    }
    Ok(config)
}

/// Explicit targets win over the configured `simlist`; with neither, plan
/// everything.
fn selection(
    config: &SimflowConfig,
    targets: Option<&str>,
    targets_file: Option<&Path>,
) -> Result<Selection> {
    if let Some(targets) = targets {
        return Selection::parse(targets).context("Invalid --targets");
    }
    if let Some(file) = targets_file {
        return Selection::from_file(file)
            .with_context(|| format!("Failed to read targets from {:?}", file));
    }
    match &config.simlist {
        Some(simlist) => Selection::from_tokens(simlist.iter().map(String::as_str))
            .context("Invalid simlist in configuration"),
        None => Ok(Selection::Everything),
    }
}

fn resolve_catalog(config: &SimflowConfig) -> Result<ResolvedCatalog> {
    let catalog = Catalog::load(config).context("Failed to load catalog")?;
    catalog
        .resolve(config, &[])
        .context("Failed to resolve catalog")
}

fn structural_inputs(config: &SimflowConfig) -> Result<StructuralInputs> {
    StructuralInputs::from_config(config).context("Failed to digest geometry configuration")
}

/// Parse a single `<tier>.<simid>` argument.
fn node_target(token: &str) -> Result<(Tier, String)> {
    match Selection::parse(token)? {
        Selection::Targets(targets) => match targets.as_slice() {
            [Target::Node { tier, simid }] => Ok((*tier, simid.clone())),
            _ => anyhow::bail!("Expected a single <tier>.<simid>, got '{}'", token),
        },
        Selection::Everything => anyhow::bail!("Expected a single <tier>.<simid>, got '{}'", token),
    }
}

/// Write `text` to `output`, or print it.
fn emit(text: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            write_atomic(path, text.as_bytes())
                .with_context(|| format!("Failed to write {:?}", path))?;
            info!(path = %path.display(), "wrote output");
        }
        None => print!("{text}"),
    }
    Ok(())
}

/// Run metadata, when the configuration names a detector status table,
/// adds drift-time map targets to the plan.
fn cmd_plan(config: &SimflowConfig, selection: &Selection) -> Result<Plan> {
    let catalog = resolve_catalog(config)?;
    let structural = structural_inputs(config)?;
    let runinfo = match (&config.paths.livetimes, &config.paths.detector_status) {
        (Some(_), Some(_)) => {
            Some(RunInfoTable::from_config(config).context("Failed to load run metadata")?)
        }
        _ => None,
    };
    let mut planner = Planner::new(&catalog, config, structural);
    if let Some(runinfo) = &runinfo {
        planner = planner.with_run_metadata(runinfo);
    }
    let plan = planner.expand(selection).context("Failed to expand plan")?;
    Ok(plan)
}

fn cmd_fingerprint(config: &SimflowConfig, node: &str) -> Result<String> {
    let (tier, simid) = node_target(node)?;
    let catalog = resolve_catalog(config)?;
    let fingerprinter = Fingerprinter::from_config(&catalog, config)?;
    fingerprinter
        .node(tier, &simid)
        .with_context(|| format!("Failed to fingerprint {}", node))
}

fn cmd_partition(
    config: &SimflowConfig,
    simid: &str,
    total_events: Option<u64>,
    stats: Option<&Path>,
    runs: Option<&str>,
    output: Option<&Path>,
) -> Result<PathBuf> {
    let total = match (total_events, stats) {
        (Some(n), _) => n,
        (None, Some(path)) => {
            let stats = EventStatistics::load(path)
                .with_context(|| format!("Failed to read event statistics {:?}", path))?;
            let expected = resolve_catalog(config)?
                .require(Tier::Stp, simid)?
                .number_of_jobs;
            stats
                .require_complete(simid, expected)
                .with_context(|| format!("Statistics {:?} are incomplete", path))?;
            stats.total()
        }
        (None, None) => resolve_catalog(config)?
            .total_primaries(simid)
            .context("No --total-events given and primaries cannot be counted")?,
    };
    let runs: Vec<String> = match runs {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect(),
        None => config.runlist.clone(),
    };

    let runinfo = RunInfoTable::from_config(config).context("Failed to load run metadata")?;
    let table = PartitionTable::compute(simid, total, &runs, &runinfo)
        .with_context(|| format!("Failed to partition {}", simid))?;

    let path = match output {
        Some(path) => path.to_path_buf(),
        None => PathEngine::new(config).partition_file(simid),
    };
    table
        .write(&path)
        .with_context(|| format!("Failed to write partition {:?}", path))?;
    Ok(path)
}

#[derive(Debug, Serialize)]
struct ParsedPath {
    tier: Tier,
    simid: String,
    job_index: usize,
    kind: String,
}

fn cmd_parse_path(config: &SimflowConfig, path: &Path) -> Result<()> {
    let artifact = PathEngine::new(config).parse_path(path)?;
    let parsed = ParsedPath {
        tier: artifact.tier,
        simid: artifact.simid,
        job_index: artifact.job_index,
        kind: artifact.kind.to_string(),
    };
    println!("{}", serde_json::to_string_pretty(&parsed)?);
    Ok(())
}

fn cmd_render_macro(config: &SimflowConfig, node: &str, job_index: usize) -> Result<PathBuf> {
    let (tier, simid) = node_target(node)?;
    let catalog = resolve_catalog(config)?;
    let structural = structural_inputs(config)?;
    let selection = Selection::Targets(vec![Target::Node {
        tier,
        simid: simid.clone(),
    }]);
    let plan = expand(&catalog, config, &selection, &structural)?;
    let count = plan.jobs_of(tier).filter(|j| j.simid == simid).count();
    let job = plan
        .jobs_of(tier)
        .find(|j| j.simid == simid && j.job_index == job_index)
        .ok_or(simflow_core::SimflowError::JobIndexOutOfRange {
            tier,
            simid: simid.clone(),
            job_index,
            count,
        })?;
    let written = simflow_core::write_macro(config, &catalog, job)
        .with_context(|| format!("Failed to render macro for {}", job.name()))?;
    Ok(written)
}
