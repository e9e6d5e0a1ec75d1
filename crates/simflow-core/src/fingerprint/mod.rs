//! Change fingerprints for catalog nodes.
//!
//! A fingerprint is the SHA-256 of the canonical JSON of
//! `{"definition": <filtered document>, "structural": {name: digest}}`. The
//! filter removes the fields a tier declares as irrelevant for invalidation;
//! structural inputs carry digests of external files and upstream
//! definitions the node depends on.
//!
//! The fingerprint is an opaque comparison key. Nothing here decides whether
//! a job reruns.

pub mod canonical;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::catalog::ResolvedCatalog;
use crate::config::{FingerprintConfig, SimflowConfig};
use crate::error::Result;
use crate::obs;
use crate::tier::Tier;

pub use canonical::{canonical_json, compute_digest, sha256_hex};

/// Fields excluded for every tier.
pub const BASELINE_EXCLUSIONS: [&str; 3] = ["number_of_jobs", "description", "comment"];

/// Prefix of references into a namespace's snippet tables.
pub const DEFINES_PREFIX: &str = "~defines:";

/// Per-tier exclusion sets. Entries may be dotted paths into nested
/// objects, e.g. `geometry.comment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintPolicy {
    exclusions: BTreeMap<Tier, BTreeSet<String>>,
}

impl Default for FingerprintPolicy {
    fn default() -> Self {
        let baseline: BTreeSet<String> = BASELINE_EXCLUSIONS.iter().map(|s| s.to_string()).collect();
        Self {
            exclusions: Tier::ALL.iter().map(|t| (*t, baseline.clone())).collect(),
        }
    }
}

impl FingerprintPolicy {
    /// Baseline plus the extra fields configured per tier.
    pub fn from_config(config: &FingerprintConfig) -> Self {
        let mut policy = Self::default();
        for (tier, fields) in &config.exclude {
            policy.exclude(*tier, fields.iter().cloned());
        }
        policy
    }

    pub fn exclude<I>(&mut self, tier: Tier, fields: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.exclusions.entry(tier).or_default().extend(fields);
    }

    pub fn excluded(&self, tier: Tier) -> Vec<&str> {
        self.exclusions
            .get(&tier)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }
}

/// Named digests of the external inputs a node structurally depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StructuralInputs(BTreeMap<String, String>);

impl StructuralInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Digests shared by every node: the geometry configuration, when one is
    /// configured.
    pub fn from_config(config: &SimflowConfig) -> Result<Self> {
        let mut inputs = Self::new();
        if let Some(path) = &config.paths.geom_config {
            inputs.insert("geometry", file_digest(path)?);
        }
        Ok(inputs)
    }

    pub fn insert(&mut self, name: impl Into<String>, digest: impl Into<String>) {
        self.0.insert(name.into(), digest.into());
    }

    pub fn with(mut self, name: impl Into<String>, digest: impl Into<String>) -> Self {
        self.insert(name, digest);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// SHA-256 hex of a file's bytes.
pub fn file_digest(path: impl AsRef<Path>) -> Result<String> {
    Ok(sha256_hex(&fs::read(path.as_ref())?))
}

fn remove_field(map: &mut Map<String, Value>, path: &str) {
    if map.remove(path).is_some() {
        return;
    }
    if let Some((head, rest)) = path.split_once('.') {
        if let Some(Value::Object(inner)) = map.get_mut(head) {
            remove_field(inner, rest);
        }
    }
}

/// Fingerprint of `document` with `excluded` fields removed.
pub fn fingerprint<'e, I>(
    document: &Map<String, Value>,
    excluded: I,
    structural: &StructuralInputs,
) -> Result<String>
where
    I: IntoIterator<Item = &'e str>,
{
    let mut view = document.clone();
    for field in excluded {
        remove_field(&mut view, field);
    }
    compute_digest(&json!({
        "definition": Value::Object(view),
        "structural": serde_json::to_value(structural)?,
    }))
}

/// Computes node fingerprints over one resolved catalog.
#[derive(Debug, Clone)]
pub struct Fingerprinter<'a> {
    catalog: &'a ResolvedCatalog,
    policy: FingerprintPolicy,
    structural: StructuralInputs,
}

impl<'a> Fingerprinter<'a> {
    pub fn new(
        catalog: &'a ResolvedCatalog,
        policy: FingerprintPolicy,
        structural: StructuralInputs,
    ) -> Self {
        Self {
            catalog,
            policy,
            structural,
        }
    }

    /// Policy and shared structural inputs taken from `config`.
    pub fn from_config(catalog: &'a ResolvedCatalog, config: &SimflowConfig) -> Result<Self> {
        Ok(Self::new(
            catalog,
            FingerprintPolicy::from_config(&config.fingerprint),
            StructuralInputs::from_config(config)?,
        ))
    }

    pub fn policy(&self) -> &FingerprintPolicy {
        &self.policy
    }

    /// Fingerprint of node `<tier>.<simid>`.
    ///
    /// Besides the shared inputs, an stp definition with vertices depends on
    /// the fingerprint of its ver definition, and `~defines:` references
    /// depend on the referenced snippet text.
    pub fn node(&self, tier: Tier, simid: &str) -> Result<String> {
        let def = self.catalog.require(tier, simid)?;
        let mut structural = self.structural.clone();

        if let Some(vertices) = &def.vertices {
            structural.insert("vertices", self.node(Tier::Ver, vertices)?);
        }
        if let Some(tables) = self.catalog.tables(tier) {
            for (field, table) in [
                ("generator", &tables.generators),
                ("confinement", &tables.confinement),
            ] {
                let snippet = def
                    .field(field)
                    .and_then(Value::as_str)
                    .and_then(|s| s.strip_prefix(DEFINES_PREFIX))
                    .and_then(|key| table.get(key));
                if let Some(snippet) = snippet {
                    structural.insert(field, sha256_hex(snippet.render().as_bytes()));
                }
            }
        }

        let digest = fingerprint(&def.document, self.policy.excluded(tier), &structural)?;
        obs::emit_fingerprint_computed(tier, simid, &digest);
        Ok(digest)
    }
}
