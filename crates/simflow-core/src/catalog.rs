//! Simulation catalog loading and resolution.
//!
//! A catalog is one or more sparse documents keyed by tier, then by
//! simulation id. Entries inherit from their section's `defaults` block and
//! are resolved into immutable [`SimulationDefinition`]s once per
//! invocation.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::{is_valid_label, read_structured, SimflowConfig};
use crate::error::{Result, SimflowError};
use crate::tier::Tier;

/// Fields with a fixed meaning; everything else is a free-form override.
pub const KNOWN_FIELDS: [&str; 4] = [
    "template",
    "number_of_jobs",
    "primaries_per_job",
    "vertices",
];

/// A named macro fragment: a single string or a list of lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MacroSnippet {
    Text(String),
    Lines(Vec<String>),
}

impl MacroSnippet {
    pub fn render(&self) -> String {
        match self {
            MacroSnippet::Text(text) => text.clone(),
            MacroSnippet::Lines(lines) => lines.join("\n"),
        }
    }
}

/// Named generator and confinement fragments of one catalog namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroTables {
    #[serde(default)]
    pub generators: BTreeMap<String, MacroSnippet>,
    #[serde(default)]
    pub confinement: BTreeMap<String, MacroSnippet>,
}

/// One tier's section of a catalog document.
#[derive(Debug, Clone, Default, Deserialize)]
struct TierSection {
    #[serde(default)]
    defaults: Map<String, Value>,
    #[serde(default)]
    simulations: BTreeMap<String, Map<String, Value>>,
    #[serde(flatten)]
    tables: MacroTables,
}

/// A parsed catalog document.
#[derive(Debug, Clone, Default)]
pub struct CatalogDocument {
    source: String,
    sections: BTreeMap<Tier, TierSection>,
}

impl CatalogDocument {
    /// Parse a document from an already-decoded value. `source` names the
    /// document in error messages.
    pub fn from_value(source: impl Into<String>, value: Value) -> Result<Self> {
        let source = source.into();
        let Value::Object(top) = value else {
            return Err(SimflowError::MalformedCatalog(format!(
                "{source}: top level must be a mapping of tier names"
            )));
        };

        let mut sections = BTreeMap::new();
        for (key, section) in top {
            let tier: Tier = key
                .parse()
                .map_err(|e| SimflowError::MalformedCatalog(format!("{source}: {e}")))?;
            if !tier.is_generation() {
                return Err(SimflowError::MalformedCatalog(format!(
                    "{source}: tier {tier} has no catalog namespace (it derives from stp)"
                )));
            }
            let section: TierSection = serde_json::from_value(section).map_err(|e| {
                SimflowError::MalformedCatalog(format!("{source}: section {tier}: {e}"))
            })?;
            sections.insert(tier, section);
        }
        Ok(Self { source, sections })
    }

    /// Load a YAML or JSON catalog document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let value: Value = read_structured(path)?;
        Self::from_value(path.display().to_string(), value)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Identity of a definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DefinitionKey {
    pub tier: Tier,
    pub simid: String,
}

impl DefinitionKey {
    pub fn new(tier: Tier, simid: impl Into<String>) -> Self {
        Self {
            tier,
            simid: simid.into(),
        }
    }
}

/// A fully resolved simulation definition of a generation tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationDefinition {
    pub tier: Tier,
    pub simid: String,
    /// Macro template reference.
    pub template: String,
    pub number_of_jobs: usize,
    pub primaries_per_job: Option<u64>,
    /// `ver` simulation id providing input vertices (stp only).
    pub vertices: Option<String>,
    /// The merged document (defaults and entry) with effective job count and
    /// primaries written back. This is what gets fingerprinted.
    pub document: Map<String, Value>,
}

impl SimulationDefinition {
    pub fn key(&self) -> DefinitionKey {
        DefinitionKey::new(self.tier, self.simid.clone())
    }

    /// Free-form fields beyond the ones with a fixed meaning.
    pub fn overrides(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.document
            .iter()
            .filter(|(k, _)| !KNOWN_FIELDS.contains(&k.as_str()))
    }

    /// A field of the merged document.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.document.get(name)
    }
}

/// The unresolved set of catalog documents.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    documents: Vec<CatalogDocument>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, document: CatalogDocument) -> Self {
        self.documents.push(document);
        self
    }

    /// Load every document the configuration lists.
    pub fn load(config: &SimflowConfig) -> Result<Self> {
        let documents = config
            .catalog
            .iter()
            .map(CatalogDocument::load)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { documents })
    }

    /// Resolve the definitions needed for `selected_tiers` (all tiers when
    /// empty). Derived tiers select the `stp` namespace; `ver` definitions
    /// referenced as vertices are always resolved.
    pub fn resolve(
        &self,
        config: &SimflowConfig,
        selected_tiers: &[Tier],
    ) -> Result<ResolvedCatalog> {
        let namespaces: BTreeSet<Tier> = if selected_tiers.is_empty() {
            [Tier::Ver, Tier::Stp].into_iter().collect()
        } else {
            selected_tiers.iter().map(Tier::catalog_tier).collect()
        };

        let (entries, tables) = self.merge_entries(&namespaces)?;

        let mut wanted_ver: BTreeSet<&str> = BTreeSet::new();
        if namespaces.contains(&Tier::Ver) {
            wanted_ver.extend(entries_of(&entries, Tier::Ver).map(|(id, _)| id));
        }
        if namespaces.contains(&Tier::Stp) {
            for (simid, doc) in entries_of(&entries, Tier::Stp) {
                match doc.get("vertices") {
                    None => {}
                    Some(Value::String(ver)) => {
                        wanted_ver.insert(ver.as_str());
                    }
                    Some(_) => {
                        return Err(malformed(Tier::Stp, simid, "'vertices' must be a string"))
                    }
                }
            }
        }

        let mut definitions = BTreeMap::new();
        for simid in wanted_ver {
            let key = DefinitionKey::new(Tier::Ver, simid);
            let Some(doc) = entries.get(&key) else {
                continue;
            };
            let def = build_definition(config, Tier::Ver, simid, doc, &definitions)?;
            definitions.insert(key, def);
        }
        if namespaces.contains(&Tier::Stp) {
            for (simid, doc) in entries_of(&entries, Tier::Stp) {
                let def = build_definition(config, Tier::Stp, simid, doc, &definitions)?;
                definitions.insert(def.key(), def);
            }
        }

        for def in definitions.values() {
            debug!(
                tier = %def.tier,
                simid = %def.simid,
                number_of_jobs = def.number_of_jobs,
                "resolved definition"
            );
        }
        info!(
            definitions = definitions.len(),
            documents = self.documents.len(),
            "catalog resolved"
        );

        Ok(ResolvedCatalog {
            definitions,
            tables,
        })
    }

    /// Merge entries over their section defaults across all documents,
    /// rejecting conflicting re-definitions.
    fn merge_entries(
        &self,
        namespaces: &BTreeSet<Tier>,
    ) -> Result<(
        BTreeMap<DefinitionKey, Map<String, Value>>,
        BTreeMap<Tier, MacroTables>,
    )> {
        let mut entries: BTreeMap<DefinitionKey, Map<String, Value>> = BTreeMap::new();
        let mut tables: BTreeMap<Tier, MacroTables> = BTreeMap::new();

        for document in &self.documents {
            for (tier, section) in &document.sections {
                // Vertex definitions may be referenced from stp even when
                // ver is not selected.
                if !namespaces.contains(tier) && !namespaces.contains(&Tier::Stp) {
                    continue;
                }

                for (simid, entry) in &section.simulations {
                    if !is_valid_label(simid) {
                        return Err(SimflowError::MalformedCatalog(format!(
                            "{}: simulation id '{simid}' in tier {tier} must use only [A-Za-z0-9_+-]",
                            document.source
                        )));
                    }
                    let merged = deep_merge(&section.defaults, entry);
                    let key = DefinitionKey::new(*tier, simid.clone());
                    match entries.get(&key) {
                        Some(existing) if *existing != merged => {
                            return Err(SimflowError::DuplicateDefinition {
                                tier: *tier,
                                simid: simid.clone(),
                            });
                        }
                        Some(_) => {}
                        None => {
                            entries.insert(key, merged);
                        }
                    }
                }

                let merged_tables = tables.entry(*tier).or_default();
                merge_snippets(
                    &mut merged_tables.generators,
                    &section.tables.generators,
                    *tier,
                    "generators",
                    &document.source,
                )?;
                merge_snippets(
                    &mut merged_tables.confinement,
                    &section.tables.confinement,
                    *tier,
                    "confinement",
                    &document.source,
                )?;
            }
        }
        Ok((entries, tables))
    }
}

fn entries_of(
    entries: &BTreeMap<DefinitionKey, Map<String, Value>>,
    tier: Tier,
) -> impl Iterator<Item = (&str, &Map<String, Value>)> {
    entries
        .iter()
        .filter(move |(k, _)| k.tier == tier)
        .map(|(k, v)| (k.simid.as_str(), v))
}

fn merge_snippets(
    into: &mut BTreeMap<String, MacroSnippet>,
    from: &BTreeMap<String, MacroSnippet>,
    tier: Tier,
    table: &str,
    source: &str,
) -> Result<()> {
    for (name, snippet) in from {
        match into.get(name) {
            Some(existing) if existing != snippet => {
                return Err(SimflowError::MalformedCatalog(format!(
                    "{source}: {tier}.{table}.{name} conflicts with an earlier document"
                )));
            }
            Some(_) => {}
            None => {
                into.insert(name.clone(), snippet.clone());
            }
        }
    }
    Ok(())
}

fn malformed(tier: Tier, simid: &str, reason: &str) -> SimflowError {
    SimflowError::MalformedCatalog(format!("{tier}.{simid}: {reason}"))
}

fn build_definition(
    config: &SimflowConfig,
    tier: Tier,
    simid: &str,
    doc: &Map<String, Value>,
    resolved: &BTreeMap<DefinitionKey, SimulationDefinition>,
) -> Result<SimulationDefinition> {
    let template = match doc.get("template") {
        Some(Value::String(t)) if !t.is_empty() => t.clone(),
        Some(_) => return Err(malformed(tier, simid, "'template' must be a non-empty string")),
        None => return Err(malformed(tier, simid, "missing required field 'template'")),
    };

    let vertices = match doc.get("vertices") {
        None => None,
        Some(Value::String(v)) if tier == Tier::Stp => Some(v.clone()),
        Some(_) => {
            return Err(malformed(
                tier,
                simid,
                "'vertices' is only valid as a string in the stp tier",
            ))
        }
    };
    let vertex_jobs = match &vertices {
        Some(ver) => Some(
            resolved
                .get(&DefinitionKey::new(Tier::Ver, ver.clone()))
                .map(|d| d.number_of_jobs)
                .ok_or_else(|| {
                    malformed(tier, simid, &format!("vertices reference unknown ver.{ver}"))
                })?,
        ),
        None => None,
    };

    let declared_jobs = match doc.get("number_of_jobs") {
        None => None,
        Some(v) => Some(v.as_u64().map(|n| n as usize).ok_or_else(|| {
            malformed(tier, simid, "'number_of_jobs' must be a non-negative integer")
        })?),
    };
    let mut number_of_jobs = match (declared_jobs, vertex_jobs) {
        (Some(n), Some(available)) if n > available && !config.benchmark.enabled => {
            return Err(malformed(
                tier,
                simid,
                &format!("{n} jobs requested but vertices provide only {available}"),
            ))
        }
        (Some(n), _) => n,
        (None, Some(available)) => available,
        (None, None) => {
            return Err(malformed(tier, simid, "missing required field 'number_of_jobs'"))
        }
    };

    let mut primaries_per_job = match doc.get("primaries_per_job") {
        None => None,
        Some(v) => Some(v.as_u64().ok_or_else(|| {
            malformed(tier, simid, "'primaries_per_job' must be a non-negative integer")
        })?),
    };

    if config.benchmark.enabled {
        number_of_jobs = 1;
        if let Some(n) = config.benchmark.n_primaries.get(&tier) {
            primaries_per_job = Some(*n);
        }
    }

    let mut document = doc.clone();
    document.insert("number_of_jobs".to_string(), Value::from(number_of_jobs));
    if let Some(n) = primaries_per_job {
        document.insert("primaries_per_job".to_string(), Value::from(n));
    }

    Ok(SimulationDefinition {
        tier,
        simid: simid.to_string(),
        template,
        number_of_jobs,
        primaries_per_job,
        vertices,
        document,
    })
}

/// Recursively overlay `overlay` onto `base`; nested mappings merge, any
/// other value in `overlay` replaces the base value.
pub fn deep_merge(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in overlay {
        let next = match (merged.get(key), value) {
            (Some(Value::Object(b)), Value::Object(o)) => Value::Object(deep_merge(b, o)),
            _ => value.clone(),
        };
        merged.insert(key.clone(), next);
    }
    merged
}

/// Definitions of one resolution pass.
#[derive(Debug, Clone, Default)]
pub struct ResolvedCatalog {
    definitions: BTreeMap<DefinitionKey, SimulationDefinition>,
    tables: BTreeMap<Tier, MacroTables>,
}

impl ResolvedCatalog {
    /// Definition serving `tier` (derived tiers read the stp definition).
    pub fn get(&self, tier: Tier, simid: &str) -> Option<&SimulationDefinition> {
        self.definitions
            .get(&DefinitionKey::new(tier.catalog_tier(), simid))
    }

    /// Like [`get`](Self::get), failing with `UnknownSimulationId`.
    pub fn require(&self, tier: Tier, simid: &str) -> Result<&SimulationDefinition> {
        self.get(tier, simid)
            .ok_or_else(|| SimflowError::UnknownSimulationId {
                tier,
                simid: simid.to_string(),
            })
    }

    /// All definitions in (tier, simid) order.
    pub fn definitions(&self) -> impl Iterator<Item = &SimulationDefinition> {
        self.definitions.values()
    }

    /// Simulation ids available to `tier`, in lexicographic order.
    pub fn simids(&self, tier: Tier) -> impl Iterator<Item = &str> {
        let namespace = tier.catalog_tier();
        self.definitions
            .keys()
            .filter(move |k| k.tier == namespace)
            .map(|k| k.simid.as_str())
    }

    pub fn tables(&self, tier: Tier) -> Option<&MacroTables> {
        self.tables.get(&tier.catalog_tier())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Primaries simulated for `simid` over all its full-simulation jobs.
    pub fn total_primaries(&self, simid: &str) -> Result<u64> {
        let def = self.require(Tier::Stp, simid)?;
        let per_job = def.primaries_per_job.ok_or_else(|| {
            malformed(Tier::Stp, simid, "'primaries_per_job' is required to count primaries")
        })?;
        Ok(def.number_of_jobs as u64 * per_job)
    }
}
