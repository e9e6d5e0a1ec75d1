//! The per-simulation partition table handed to event building.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::obs;
use crate::persist::{to_pretty_json, write_json_atomic};

use super::{partition, PartitionEntry, RunMetadataSource};

pub const PARTITION_SCHEMA_VERSION: u32 = 1;

/// Persisted partition of one simulation id.
///
/// Written once per simulation id. Recomputing with the same inputs yields a
/// byte-identical file; a rewrite replaces the previous table entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionTable {
    pub schema_version: u32,
    pub simid: String,
    pub total_events: u64,
    pub runs: BTreeMap<String, PartitionEntry>,
}

impl PartitionTable {
    pub fn compute<S, R>(
        simid: impl Into<String>,
        total_events: u64,
        runs: &[R],
        source: &S,
    ) -> Result<Self>
    where
        S: RunMetadataSource + ?Sized,
        R: AsRef<str>,
    {
        let simid = simid.into();
        let runs = partition(total_events, runs, source)?;
        obs::emit_partition_computed(&simid, runs.len(), total_events);
        Ok(Self {
            schema_version: PARTITION_SCHEMA_VERSION,
            simid,
            total_events,
            runs,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        to_pretty_json(self)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)?;
        obs::emit_partition_written(&self.simid, path);
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// Sum of allocated events over all runs.
    pub fn allocated(&self) -> u64 {
        self.runs.values().map(|e| e.events).sum()
    }
}
