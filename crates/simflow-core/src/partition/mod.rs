//! Live-time weighted partitioning of simulated events across runs.

pub mod artifact;
pub mod runinfo;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::read_structured;
use crate::error::{Result, SimflowError};
use crate::obs;

pub use artifact::{PartitionTable, PARTITION_SCHEMA_VERSION};
pub use runinfo::{EnergyResolution, RunInfoTable, RunMetadataSource, Usability};

/// Per-detector corrections applied downstream for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorCorrection {
    pub usability: Usability,
    /// Availability mask: only `on` channels contribute energy.
    pub included: bool,
    pub resolution: EnergyResolution,
    /// Set when no record existed and [`EnergyResolution::FALLBACK`] was used.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback_resolution: bool,
}

/// Allocation of one simulation's events to one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub livetime_in_s: f64,
    pub fraction: f64,
    pub events: u64,
    #[serde(default)]
    pub detectors: BTreeMap<String, DetectorCorrection>,
}

/// Split `total` proportionally to `weights` so the parts sum to `total`.
///
/// Parts start at the floor of their quota; leftover units go one at a time
/// by descending fractional part, ties to the lower index. `weights` must be
/// non-negative with a positive sum.
pub fn largest_remainder(total: u64, weights: &[f64]) -> Vec<u64> {
    let sum: f64 = weights.iter().sum();
    let quotas: Vec<f64> = weights.iter().map(|w| total as f64 * w / sum).collect();
    let mut parts: Vec<u64> = quotas.iter().map(|q| q.floor() as u64).collect();

    // Zero-weight parts never take leftover units.
    let mut order: Vec<usize> = (0..weights.len()).filter(|&i| weights[i] > 0.0).collect();
    if order.is_empty() {
        return parts;
    }
    order.sort_by(|&a, &b| {
        let fa = quotas[a] - quotas[a].floor();
        let fb = quotas[b] - quotas[b].floor();
        fb.total_cmp(&fa).then(a.cmp(&b))
    });

    let allocated: u64 = parts.iter().sum();
    if allocated <= total {
        // Float rounding on huge totals can leave more than one unit per part.
        let leftover = total - allocated;
        let n = order.len() as u64;
        let (each, extra) = (leftover / n, leftover % n);
        for (rank, &i) in order.iter().enumerate() {
            parts[i] += each + u64::from((rank as u64) < extra);
        }
    } else {
        let mut excess = allocated - total;
        for &i in order.iter().rev().cycle() {
            if excess == 0 {
                break;
            }
            if parts[i] > 0 {
                parts[i] -= 1;
                excess -= 1;
            }
        }
    }
    parts
}

/// Partition `total_events` over `runs` by live time, attaching each run's
/// detector corrections from `source`.
///
/// Fails on unknown or repeated runs, negative or non-finite live times and
/// a non-positive live-time sum (including an empty run list).
pub fn partition<S, R>(
    total_events: u64,
    runs: &[R],
    source: &S,
) -> Result<BTreeMap<String, PartitionEntry>>
where
    S: RunMetadataSource + ?Sized,
    R: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    let mut livetimes = Vec::with_capacity(runs.len());
    for run in runs {
        let run = run.as_ref();
        if !seen.insert(run) {
            return Err(SimflowError::DuplicateRun(run.to_string()));
        }
        let livetime = source
            .livetime(run)
            .ok_or_else(|| SimflowError::UnknownRun(run.to_string()))?;
        if !livetime.is_finite() || livetime < 0.0 {
            return Err(SimflowError::InvalidLiveTime {
                run: run.to_string(),
                value: livetime,
            });
        }
        livetimes.push(livetime);
    }

    let sum: f64 = livetimes.iter().sum();
    if sum <= 0.0 {
        return Err(SimflowError::ZeroLiveTime {
            runs: runs.iter().map(|r| r.as_ref().to_string()).collect(),
        });
    }

    let counts = largest_remainder(total_events, &livetimes);
    let entries = runs
        .iter()
        .zip(livetimes.iter().zip(counts))
        .map(|(run, (&livetime, events))| {
            let run = run.as_ref();
            let entry = PartitionEntry {
                livetime_in_s: livetime,
                fraction: livetime / sum,
                events,
                detectors: corrections(run, source),
            };
            (run.to_string(), entry)
        })
        .collect();
    Ok(entries)
}

fn corrections<S>(run: &str, source: &S) -> BTreeMap<String, DetectorCorrection>
where
    S: RunMetadataSource + ?Sized,
{
    let mut out = BTreeMap::new();
    for detector in source.detectors(run) {
        let Some(usability) = source.usability(run, &detector) else {
            continue;
        };
        let recorded = source.resolution(run, &detector);
        if usability == Usability::On && recorded.is_none() {
            obs::emit_resolution_missing(run, &detector);
        }
        out.insert(
            detector,
            DetectorCorrection {
                usability,
                included: usability == Usability::On,
                resolution: recorded.unwrap_or(EnergyResolution::FALLBACK),
                fallback_resolution: recorded.is_none(),
            },
        );
    }
    out
}

/// Accumulated per-job event counts of one simulation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStatistics {
    per_job: BTreeMap<String, u64>,
}

impl EventStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, job: impl Into<String>, events: u64) {
        self.per_job.insert(job.into(), events);
    }

    /// Read a `{job: events}` document written by the executor.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            per_job: read_structured(path.as_ref())?,
        })
    }

    pub fn jobs(&self) -> usize {
        self.per_job.len()
    }

    pub fn total(&self) -> u64 {
        self.per_job.values().sum()
    }

    /// Fail unless a count was recorded for each of `expected` jobs.
    pub fn require_complete(&self, simid: &str, expected: usize) -> Result<()> {
        if self.jobs() == expected {
            Ok(())
        } else {
            Err(SimflowError::IncompleteStatistics {
                simid: simid.to_string(),
                expected,
                found: self.jobs(),
            })
        }
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for EventStatistics {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        let mut stats = Self::new();
        for (job, events) in iter {
            stats.record(job, events);
        }
        stats
    }
}
