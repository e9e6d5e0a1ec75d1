//! Immutable production configuration.
//!
//! A [`SimflowConfig`] is loaded once per invocation and then only ever
//! borrowed. Components receive `&SimflowConfig`; none of them mutate it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimflowError};
use crate::tier::Tier;

/// Placeholder expanded to the directory holding the config file.
const CONFIG_DIR_VAR: &str = "$_";

/// Filesystem roots for every derived artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    pub macros: PathBuf,
    pub log: PathBuf,
    pub benchmarks: PathBuf,
    pub plots: PathBuf,
    pub partitions: PathBuf,
    pub geom: PathBuf,
    pub tier_ver: PathBuf,
    pub tier_stp: PathBuf,
    pub tier_hit: PathBuf,
    pub tier_evt: PathBuf,
    pub tier_pdf: PathBuf,
    /// Geometry configuration; its digest is a structural fingerprint input.
    #[serde(default)]
    pub geom_config: Option<PathBuf>,
    /// Live-time table keyed by run label.
    #[serde(default)]
    pub livetimes: Option<PathBuf>,
    /// Per-run detector status and resolution records.
    #[serde(default)]
    pub detector_status: Option<PathBuf>,
    /// Directory relative macro templates resolve against. Defaults to the
    /// config file's directory.
    #[serde(default)]
    pub templates: Option<PathBuf>,
    /// Root of the per-run HPGe drift-time maps. No map targets are planned
    /// without it.
    #[serde(default)]
    pub dtmaps: Option<PathBuf>,
}

impl PathsConfig {
    /// Conventional layout under a single production directory.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let generated = root.join("generated");
        Self {
            macros: generated.join("macros"),
            log: generated.join("log"),
            benchmarks: generated.join("benchmarks"),
            plots: generated.join("plots"),
            partitions: generated.join("partitions"),
            geom: generated.join("geom"),
            tier_ver: generated.join("tier").join("ver"),
            tier_stp: generated.join("tier").join("stp"),
            tier_hit: generated.join("tier").join("hit"),
            tier_evt: generated.join("tier").join("evt"),
            tier_pdf: generated.join("tier").join("pdf"),
            geom_config: None,
            livetimes: None,
            detector_status: None,
            templates: None,
            dtmaps: Some(generated.join("dtmaps")),
        }
    }

    /// Output root of a tier.
    pub fn tier_root(&self, tier: Tier) -> &Path {
        match tier {
            Tier::Ver => &self.tier_ver,
            Tier::Stp => &self.tier_stp,
            Tier::Hit => &self.tier_hit,
            Tier::Evt => &self.tier_evt,
            Tier::Pdf => &self.tier_pdf,
        }
    }

    fn for_each_mut(&mut self, mut f: impl FnMut(&mut PathBuf)) {
        for p in [
            &mut self.macros,
            &mut self.log,
            &mut self.benchmarks,
            &mut self.plots,
            &mut self.partitions,
            &mut self.geom,
            &mut self.tier_ver,
            &mut self.tier_stp,
            &mut self.tier_hit,
            &mut self.tier_evt,
            &mut self.tier_pdf,
        ] {
            f(p);
        }
        for p in [
            &mut self.geom_config,
            &mut self.livetimes,
            &mut self.detector_status,
            &mut self.templates,
            &mut self.dtmaps,
        ]
        .into_iter()
        .flatten()
        {
            f(p);
        }
    }
}

/// Benchmark mode: one short job per definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Primaries per job for each generation tier while benchmarking.
    #[serde(default)]
    pub n_primaries: BTreeMap<Tier, u64>,
}

/// Per-tier fields, in addition to the built-in ones, that never invalidate
/// existing outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintConfig {
    #[serde(default)]
    pub exclude: BTreeMap<Tier, Vec<String>>,
}

/// How to invoke the simulation executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommandConfig {
    #[serde(default)]
    pub remage: Option<String>,
    #[serde(default = "default_threads")]
    pub threads: usize,
}

impl Default for RunCommandConfig {
    fn default() -> Self {
        Self {
            remage: None,
            threads: default_threads(),
        }
    }
}

fn default_threads() -> usize {
    1
}

/// A list given either inline or as a string: a path to a file with one item
/// per line, otherwise a single item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListSource {
    Items(Vec<String>),
    Text(String),
}

impl Default for ListSource {
    fn default() -> Self {
        ListSource::Items(Vec::new())
    }
}

impl ListSource {
    /// Expand into items. Blank lines and `#` comments in list files are
    /// dropped.
    pub fn items(&self, base: &Path) -> Result<Vec<String>> {
        match self {
            ListSource::Items(items) => Ok(items.iter().map(|s| s.trim().to_string()).collect()),
            ListSource::Text(text) => {
                let candidate = resolve_path(base, text);
                if candidate.is_file() {
                    let content = fs::read_to_string(&candidate)?;
                    Ok(content
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty() && !l.starts_with('#'))
                        .map(str::to_string)
                        .collect())
                } else {
                    let item = text.trim();
                    Ok(if item.is_empty() {
                        Vec::new()
                    } else {
                        vec![item.to_string()]
                    })
                }
            }
        }
    }
}

/// On-disk shape of the configuration file.
#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    experiment: String,
    paths: PathsConfig,
    #[serde(default)]
    catalog: Vec<String>,
    #[serde(default)]
    runlist: ListSource,
    #[serde(default)]
    simlist: Option<ListSource>,
    #[serde(default)]
    benchmark: BenchmarkConfig,
    #[serde(default)]
    log_stamp: Option<String>,
    #[serde(default)]
    fingerprint: FingerprintConfig,
    #[serde(default)]
    runcmd: RunCommandConfig,
}

/// Resolved production configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimflowConfig {
    /// Experiment label embedded in every file name.
    pub experiment: String,
    pub paths: PathsConfig,
    /// Catalog documents, in load order.
    pub catalog: Vec<PathBuf>,
    /// Operating runs the event-building tier is split into.
    pub runlist: Vec<String>,
    /// Default restriction input for planning, if any.
    pub simlist: Option<Vec<String>>,
    pub benchmark: BenchmarkConfig,
    /// Per-invocation subdirectory for logs.
    pub log_stamp: Option<String>,
    pub fingerprint: FingerprintConfig,
    pub runcmd: RunCommandConfig,
}

impl SimflowConfig {
    /// Minimal configuration with the conventional layout under `root`.
    pub fn new(experiment: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let config = Self {
            experiment: experiment.into(),
            paths: PathsConfig::under(root),
            catalog: Vec::new(),
            runlist: Vec::new(),
            simlist: None,
            benchmark: BenchmarkConfig::default(),
            log_stamp: None,
            fingerprint: FingerprintConfig::default(),
            runcmd: RunCommandConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Replace the run list, re-validating labels.
    pub fn with_runlist<I, S>(mut self, runs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runlist = runs.into_iter().map(Into::into).collect();
        self.validate()?;
        Ok(self)
    }

    /// Load from a YAML or JSON file.
    ///
    /// `$_` in path values expands to the config file's directory and
    /// relative paths are resolved against it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw: ConfigFile = read_structured(path)?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_file(raw, &base)
    }

    fn from_file(raw: ConfigFile, base: &Path) -> Result<Self> {
        let mut paths = raw.paths;
        paths.for_each_mut(|p| {
            let resolved = resolve_path(base, &p.to_string_lossy());
            *p = resolved;
        });
        if paths.templates.is_none() {
            paths.templates = Some(base.to_path_buf());
        }

        let catalog = raw
            .catalog
            .iter()
            .map(|p| resolve_path(base, p))
            .collect();
        let runlist = raw.runlist.items(base)?;
        let simlist = raw.simlist.map(|s| s.items(base)).transpose()?;

        let config = Self {
            experiment: raw.experiment,
            paths,
            catalog,
            runlist,
            simlist,
            benchmark: raw.benchmark,
            log_stamp: raw.log_stamp,
            fingerprint: raw.fingerprint,
            runcmd: raw.runcmd,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check labels that end up inside file names.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_label(&self.experiment) {
            return Err(SimflowError::InvalidConfig(format!(
                "experiment label '{}' must be non-empty and use only [A-Za-z0-9_+-]",
                self.experiment
            )));
        }
        if let Some(stamp) = &self.log_stamp {
            if stamp.is_empty() || stamp.contains(['/', '\\']) {
                return Err(SimflowError::InvalidConfig(format!(
                    "log stamp '{stamp}' must be a single path component"
                )));
            }
        }
        let mut seen = BTreeSet::new();
        for run in &self.runlist {
            validate_run_label(run)?;
            if !seen.insert(run.as_str()) {
                return Err(SimflowError::InvalidConfig(format!(
                    "run '{run}' listed more than once in runlist"
                )));
            }
        }
        for tier in self.benchmark.n_primaries.keys() {
            if !tier.is_generation() {
                return Err(SimflowError::InvalidConfig(format!(
                    "benchmark.n_primaries has no meaning for tier {tier}"
                )));
            }
        }
        Ok(())
    }

    /// Position of `run` in the run list.
    pub fn run_index(&self, run: &str) -> Option<usize> {
        self.runlist.iter().position(|r| r == run)
    }
}

/// Identifier charset shared by experiment labels and simulation ids.
pub(crate) fn is_valid_label(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+'))
}

/// Run labels follow `<experiment>-<period>-<run>-<type>`.
pub fn validate_run_label(run: &str) -> Result<()> {
    let parts: Vec<&str> = run.split('-').collect();
    let ok = parts.len() == 4
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric()));
    if ok {
        Ok(())
    } else {
        Err(SimflowError::InvalidConfig(format!(
            "run label '{run}' is not in the format <experiment>-<period>-<run>-<type>"
        )))
    }
}

fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let expanded = raw.replace(CONFIG_DIR_VAR, &base.to_string_lossy());
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Read a YAML or JSON document, choosing the parser by extension.
pub(crate) fn read_structured<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(serde_json::from_str(&text)?),
        _ => Ok(serde_yaml::from_str(&text)?),
    }
}
