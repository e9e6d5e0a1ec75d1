//! Operating-run metadata consumed by the partition calculator.
//!
//! Two documents feed [`RunInfoTable`]:
//!
//! ```yaml
//! # live times
//! l200-p03-r000-phy: { livetime_in_s: 12345.6, detector_status: p03-r000 }
//!
//! # detector status
//! p03-r000:
//!   V02160A: { usability: on, energy: { sig0: 0.5, sig1: 0.02, sig2: 0.0 } }
//!   B00032B: { usability: off }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{read_structured, SimflowConfig};
use crate::error::{Result, SimflowError};

/// Analysis usability of a detector channel in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Usability {
    On,
    /// Anti-coincidence only: the channel vetoes but contributes no energy.
    Ac,
    Off,
}

/// Energy-resolution parameters `sqrt(sig0^2 + sig1^2 E + sig2^2 E^2)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyResolution {
    pub sig0: f64,
    pub sig1: f64,
    pub sig2: f64,
}

impl EnergyResolution {
    /// Used for channels without a resolution record.
    pub const FALLBACK: EnergyResolution = EnergyResolution {
        sig0: 2.0,
        sig1: 0.0,
        sig2: 0.0,
    };
}

/// Read-only lookups the calculator performs. Every method is a pure
/// function of its arguments.
pub trait RunMetadataSource {
    /// Live time of `run` in seconds, `None` for unknown runs.
    fn livetime(&self, run: &str) -> Option<f64>;

    /// Detector ids with a status record for `run`, sorted.
    fn detectors(&self, run: &str) -> Vec<String>;

    fn usability(&self, run: &str, detector: &str) -> Option<Usability>;

    fn resolution(&self, run: &str, detector: &str) -> Option<EnergyResolution>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RunRecord {
    livetime_in_s: f64,
    #[serde(default)]
    detector_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DetectorRecord {
    usability: Usability,
    #[serde(default)]
    energy: Option<EnergyResolution>,
}

type StatusTable = BTreeMap<String, BTreeMap<String, DetectorRecord>>;

/// In-memory live-time and detector-status tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunInfoTable {
    runs: BTreeMap<String, RunRecord>,
    status: StatusTable,
}

impl RunInfoTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live times only, without detector records.
    pub fn from_livetimes<I, S>(livetimes: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut table = Self::new();
        for (run, livetime) in livetimes {
            table.insert_run(run, livetime, None::<String>);
        }
        table
    }

    pub fn insert_run(
        &mut self,
        run: impl Into<String>,
        livetime_in_s: f64,
        detector_status: Option<impl Into<String>>,
    ) {
        self.runs.insert(
            run.into(),
            RunRecord {
                livetime_in_s,
                detector_status: detector_status.map(Into::into),
            },
        );
    }

    pub fn insert_detector(
        &mut self,
        status_key: impl Into<String>,
        detector: impl Into<String>,
        usability: Usability,
        energy: Option<EnergyResolution>,
    ) {
        self.status
            .entry(status_key.into())
            .or_default()
            .insert(detector.into(), DetectorRecord { usability, energy });
    }

    /// Build from already parsed documents.
    pub fn from_values(livetimes: Value, status: Option<Value>) -> Result<Self> {
        let runs: BTreeMap<String, RunRecord> = serde_json::from_value(livetimes)?;
        let status: StatusTable = match status {
            Some(value) => serde_json::from_value(value)?,
            None => StatusTable::new(),
        };
        let table = Self { runs, status };
        table.check_references()?;
        Ok(table)
    }

    /// Load the live-time document and, optionally, the status document.
    pub fn load(livetimes: impl AsRef<Path>, status: Option<&Path>) -> Result<Self> {
        let livetimes: Value = read_structured(livetimes.as_ref())?;
        let status = status.map(read_structured::<Value>).transpose()?;
        Self::from_values(livetimes, status)
    }

    /// Load the documents named by `paths.livetimes` and
    /// `paths.detector_status`.
    pub fn from_config(config: &SimflowConfig) -> Result<Self> {
        let livetimes = config.paths.livetimes.as_ref().ok_or_else(|| {
            SimflowError::InvalidConfig("paths.livetimes is required to partition".to_string())
        })?;
        Self::load(livetimes, config.paths.detector_status.as_deref())
    }

    fn check_references(&self) -> Result<()> {
        if self.status.is_empty() {
            return Ok(());
        }
        for (run, record) in &self.runs {
            if let Some(key) = &record.detector_status {
                if !self.status.contains_key(key) {
                    return Err(SimflowError::InvalidConfig(format!(
                        "run {run} references unknown detector status '{key}'"
                    )));
                }
            }
        }
        Ok(())
    }

    fn detector(&self, run: &str, detector: &str) -> Option<&DetectorRecord> {
        let key = self.runs.get(run)?.detector_status.as_ref()?;
        self.status.get(key)?.get(detector)
    }
}

impl RunMetadataSource for RunInfoTable {
    fn livetime(&self, run: &str) -> Option<f64> {
        self.runs.get(run).map(|r| r.livetime_in_s)
    }

    fn detectors(&self, run: &str) -> Vec<String> {
        self.runs
            .get(run)
            .and_then(|r| r.detector_status.as_ref())
            .and_then(|key| self.status.get(key))
            .map(|dets| dets.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn usability(&self, run: &str, detector: &str) -> Option<Usability> {
        self.detector(run, detector).map(|d| d.usability)
    }

    fn resolution(&self, run: &str, detector: &str) -> Option<EnergyResolution> {
        self.detector(run, detector).and_then(|d| d.energy)
    }
}
