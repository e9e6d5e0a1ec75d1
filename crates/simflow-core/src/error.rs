//! Error taxonomy for planning and partitioning.
//!
//! Every variant is fatal for the invocation that raised it: planning aborts
//! before a single job is handed to the executor.

use std::path::PathBuf;

use crate::tier::Tier;

/// Errors produced by the simflow core.
#[derive(Debug, thiserror::Error)]
pub enum SimflowError {
    #[error("malformed catalog: {0}")]
    MalformedCatalog(String),

    #[error("duplicate definition for {tier}.{simid} with conflicting content")]
    DuplicateDefinition { tier: Tier, simid: String },

    #[error("unknown simulation id: {tier}.{simid}")]
    UnknownSimulationId { tier: Tier, simid: String },

    #[error("invalid selector '{token}': {reason}")]
    InvalidSelector { token: String, reason: String },

    #[error("unknown run: {0}")]
    UnknownRun(String),

    #[error("total live time over runs {runs:?} is not positive")]
    ZeroLiveTime { runs: Vec<String> },

    #[error("invalid live time {value} for run {run}")]
    InvalidLiveTime { run: String, value: f64 },

    #[error("run {0} requested more than once")]
    DuplicateRun(String),

    #[error("event statistics of {simid} cover {found} of {expected} jobs")]
    IncompleteStatistics {
        simid: String,
        expected: usize,
        found: usize,
    },

    #[error("path collision: {path} is produced by both {first} and {second}")]
    PathCollision {
        path: PathBuf,
        first: String,
        second: String,
    },

    #[error("job index {job_index} out of range for {tier}.{simid} ({count} jobs)")]
    JobIndexOutOfRange {
        tier: Tier,
        simid: String,
        job_index: usize,
        count: usize,
    },

    #[error("artifact '{kind}' does not exist for tier {tier}")]
    ArtifactNotApplicable { tier: Tier, kind: String },

    #[error("cannot parse path {path}: {reason}")]
    UnparsablePath { path: PathBuf, reason: String },

    #[error("macro rendering failed for {tier}.{simid}: {reason}")]
    MacroRender {
        tier: Tier,
        simid: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for simflow core operations.
pub type Result<T> = std::result::Result<T, SimflowError>;
