//! Expansion of a resolved catalog into an ordered job plan.
//!
//! Nodes are `(tier, simid)` pairs. Each node depends on at most one
//! upstream node:
//!
//! ```text
//! ver.V ─▶ stp.X ─▶ hit.X ─▶ evt.X ─▶ pdf.X
//! ```
//!
//! `ver.V` is only upstream of `stp.X` when X declares `vertices: V`. The
//! plan is the closure of the requested nodes over that relation, with one
//! job per node and job index, plus partition, aggregate and release
//! targets. Files produced outside the job grid (geometry, stp vertex plots,
//! per-run drift-time maps) are planned as boundary targets. Expansion is a
//! pure function of its inputs.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::ResolvedCatalog;
use crate::config::SimflowConfig;
use crate::error::{Result, SimflowError};
use crate::fingerprint::{FingerprintPolicy, Fingerprinter, StructuralInputs};
use crate::config::is_valid_label;
use crate::obs;
use crate::partition::RunMetadataSource;
use crate::patterns::{PathEngine, PathRegistry};
use crate::persist::to_pretty_json;
use crate::selector::{Selection, Target};
use crate::tier::{ArtifactKind, Tier};

/// Name of the release target of a full expansion.
pub const RELEASE_TARGET: &str = "all";

/// A `(tier, simid)` node of the pipeline graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Node {
    pub tier: Tier,
    pub simid: String,
}

impl Node {
    pub fn new(tier: Tier, simid: impl Into<String>) -> Self {
        Self {
            tier,
            simid: simid.into(),
        }
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.tier, self.simid)
    }
}

/// One executable unit handed to the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub tier: Tier,
    pub simid: String,
    pub job_index: usize,
    /// Run label of event-building jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macro_path: Option<PathBuf>,
    pub output: PathBuf,
    pub log: PathBuf,
    pub benchmark: PathBuf,
    pub inputs: Vec<PathBuf>,
    pub fingerprint: String,
}

impl Job {
    /// Stable display name, e.g. `stp.birds-nest-K40[3]`.
    pub fn name(&self) -> String {
        format!("{}.{}[{}]", self.tier, self.simid, self.job_index)
    }

    pub fn node(&self) -> Node {
        Node::new(self.tier, self.simid.clone())
    }
}

/// Computation of one simulation's partition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTarget {
    pub simid: String,
    pub output: PathBuf,
    pub inputs: Vec<PathBuf>,
}

/// A target that only depends on other files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateTarget {
    pub name: String,
    pub tier: Tier,
    pub inputs: Vec<PathBuf>,
}

impl AggregateTarget {
    pub fn name_for(tier: Tier) -> String {
        format!("gen_all_tier_{tier}")
    }
}

/// Depends on every aggregate target of a full expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseTarget {
    pub name: String,
    pub requires: Vec<String>,
    /// Boundary outputs nothing else consumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<PathBuf>,
}

/// Build of the geometry description read by ver, stp and hit jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryTarget {
    pub output: PathBuf,
    pub log: PathBuf,
    pub inputs: Vec<PathBuf>,
}

/// Vertex distribution plot of one stp simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotTarget {
    pub simid: String,
    pub output: PathBuf,
    pub inputs: Vec<PathBuf>,
}

/// HPGe drift-time map of one run, produced by the external field solver.
///
/// `detector` is `None` for the merged file of the run, whose inputs are the
/// per-detector maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftTimeMapTarget {
    pub run: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detector: Option<String>,
    pub output: PathBuf,
    pub inputs: Vec<PathBuf>,
}

impl DriftTimeMapTarget {
    pub fn name(&self) -> String {
        match &self.detector {
            Some(det) => format!("dtmap.{}.{det}", self.run),
            None => format!("dtmap.{}", self.run),
        }
    }
}

/// A node left out because it has nothing to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedNode {
    pub tier: Tier,
    pub simid: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    Full,
    Restricted,
}

/// Ordered expansion result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub mode: PlanMode,
    pub jobs: Vec<Job>,
    pub partitions: Vec<PartitionTarget>,
    pub aggregates: Vec<AggregateTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<GeometryTarget>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plots: Vec<PlotTarget>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dtmaps: Vec<DriftTimeMapTarget>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedNode>,
}

impl Plan {
    pub fn jobs_of(&self, tier: Tier) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(move |j| j.tier == tier)
    }

    /// Distinct nodes with at least one job, in plan order.
    pub fn nodes(&self) -> BTreeSet<Node> {
        self.jobs.iter().map(Job::node).collect()
    }

    pub fn to_json(&self) -> Result<String> {
        to_pretty_json(self)
    }
}

/// Expands a resolved catalog under one configuration.
pub struct Planner<'a> {
    catalog: &'a ResolvedCatalog,
    config: &'a SimflowConfig,
    engine: PathEngine<'a>,
    fingerprinter: Fingerprinter<'a>,
    run_metadata: Option<&'a dyn RunMetadataSource>,
}

impl<'a> Planner<'a> {
    pub fn new(
        catalog: &'a ResolvedCatalog,
        config: &'a SimflowConfig,
        structural: StructuralInputs,
    ) -> Self {
        let policy = FingerprintPolicy::from_config(&config.fingerprint);
        Self {
            catalog,
            config,
            engine: PathEngine::new(config),
            fingerprinter: Fingerprinter::new(catalog, policy, structural),
            run_metadata: None,
        }
    }

    /// Plan drift-time maps for the detectors `source` lists per run.
    pub fn with_run_metadata(mut self, source: &'a dyn RunMetadataSource) -> Self {
        self.run_metadata = Some(source);
        self
    }

    /// Requested nodes before closure.
    fn requested(&self, selection: &Selection) -> Result<BTreeSet<Node>> {
        let mut nodes = BTreeSet::new();
        match selection {
            Selection::Everything => {
                for tier in Tier::ALL {
                    nodes.extend(self.catalog.simids(tier).map(|id| Node::new(tier, id)));
                }
            }
            Selection::Targets(targets) => {
                for target in targets {
                    nodes.insert(self.target_node(target)?);
                }
            }
        }
        Ok(nodes)
    }

    fn target_node(&self, target: &Target) -> Result<Node> {
        match target {
            Target::Node { tier, simid } => {
                self.catalog.require(*tier, simid)?;
                Ok(Node::new(*tier, simid.clone()))
            }
            Target::Simulation { simid } => {
                if self.catalog.get(Tier::Stp, simid).is_some() {
                    Ok(Node::new(Tier::terminal(), simid.clone()))
                } else if self.catalog.get(Tier::Ver, simid).is_some() {
                    Ok(Node::new(Tier::Ver, simid.clone()))
                } else {
                    Err(SimflowError::UnknownSimulationId {
                        tier: Tier::Stp,
                        simid: simid.clone(),
                    })
                }
            }
        }
    }

    /// The node whose outputs `node` consumes.
    fn upstream(&self, node: &Node) -> Result<Option<Node>> {
        Ok(match node.tier {
            Tier::Ver => None,
            Tier::Stp => self
                .catalog
                .require(Tier::Stp, &node.simid)?
                .vertices
                .as_ref()
                .map(|v| Node::new(Tier::Ver, v.clone())),
            tier => tier
                .upstream()
                .map(|up| Node::new(up, node.simid.clone())),
        })
    }

    /// Breadth-first closure over upstream edges.
    fn closure(&self, requested: BTreeSet<Node>) -> Result<BTreeSet<Node>> {
        let mut visited = requested.clone();
        let mut queue: VecDeque<Node> = requested.into_iter().collect();
        while let Some(node) = queue.pop_front() {
            if let Some(up) = self.upstream(&node)? {
                if visited.insert(up.clone()) {
                    queue.push_back(up);
                }
            }
        }
        Ok(visited)
    }

    fn job_count(&self, node: &Node) -> Result<usize> {
        match self.engine.fixed_job_count(node.tier) {
            Some(n) => Ok(n),
            None => Ok(self.catalog.require(node.tier, &node.simid)?.number_of_jobs),
        }
    }

    fn inputs(&self, node: &Node, job_index: usize) -> Result<Vec<PathBuf>> {
        let e = &self.engine;
        let simid = node.simid.as_str();
        Ok(match node.tier {
            Tier::Ver => vec![
                e.path_for(Tier::Ver, simid, job_index, ArtifactKind::Macro)?,
                e.geom_file(),
            ],
            Tier::Stp => {
                let mut inputs = vec![
                    e.path_for(Tier::Stp, simid, job_index, ArtifactKind::Macro)?,
                    e.geom_file(),
                ];
                if let Some(Node { simid: ver, .. }) = self.upstream(node)? {
                    inputs.push(e.path_for(Tier::Ver, &ver, job_index, ArtifactKind::Output)?);
                }
                inputs
            }
            Tier::Hit => vec![
                e.path_for(Tier::Stp, simid, job_index, ArtifactKind::Output)?,
                e.geom_file(),
            ],
            Tier::Evt => {
                let hits = self.job_count(&Node::new(Tier::Hit, simid))?;
                let mut inputs = e.job_outputs(Tier::Hit, simid, hits)?;
                inputs.push(e.partition_file(simid));
                inputs
            }
            Tier::Pdf => e.job_outputs(Tier::Evt, simid, self.config.runlist.len())?,
        })
    }

    fn job(&self, node: &Node, job_index: usize, fingerprint: &str) -> Result<Job> {
        let e = &self.engine;
        let (tier, simid) = (node.tier, node.simid.as_str());
        Ok(Job {
            tier,
            simid: simid.to_string(),
            job_index,
            run: match tier {
                Tier::Evt => self.config.runlist.get(job_index).cloned(),
                _ => None,
            },
            macro_path: if ArtifactKind::Macro.applies_to(tier) {
                Some(e.path_for(tier, simid, job_index, ArtifactKind::Macro)?)
            } else {
                None
            },
            output: e.path_for(tier, simid, job_index, ArtifactKind::Output)?,
            log: e.path_for(tier, simid, job_index, ArtifactKind::Log)?,
            benchmark: e.path_for(tier, simid, job_index, ArtifactKind::Benchmark)?,
            inputs: self.inputs(node, job_index)?,
            fingerprint: fingerprint.to_string(),
        })
    }

    fn geometry_target(&self) -> GeometryTarget {
        GeometryTarget {
            output: self.engine.geom_file(),
            log: self.engine.geom_log_file(),
            inputs: self.config.paths.geom_config.iter().cloned().collect(),
        }
    }

    /// Per-detector and merged maps of every run in the run list.
    fn dtmap_targets(&self) -> Result<Vec<DriftTimeMapTarget>> {
        let Some(source) = self.run_metadata else {
            return Ok(Vec::new());
        };
        let mut targets = Vec::new();
        for run in &self.config.runlist {
            let Some(merged) = self.engine.merged_dtmap_file(run) else {
                obs::emit_dtmaps_skipped(run, "paths.dtmaps is not configured");
                continue;
            };
            let detectors = source.detectors(run);
            if detectors.is_empty() {
                obs::emit_dtmaps_skipped(run, "no detectors deployed");
                continue;
            }
            let mut maps = Vec::with_capacity(detectors.len());
            for detector in detectors {
                if !is_valid_label(&detector) {
                    return Err(SimflowError::InvalidConfig(format!(
                        "detector id '{detector}' in run {run} cannot be used in a file name"
                    )));
                }
                let Some(output) = self.engine.dtmap_file(run, &detector) else {
                    continue;
                };
                maps.push(output.clone());
                targets.push(DriftTimeMapTarget {
                    run: run.clone(),
                    detector: Some(detector),
                    output,
                    inputs: Vec::new(),
                });
            }
            targets.push(DriftTimeMapTarget {
                run: run.clone(),
                detector: None,
                output: merged,
                inputs: maps,
            });
        }
        Ok(targets)
    }

    /// Expand `selection` into a plan.
    pub fn expand(&self, selection: &Selection) -> Result<Plan> {
        let _span = obs::PlanSpan::enter("plan");
        let mode = if selection.is_everything() {
            PlanMode::Full
        } else {
            PlanMode::Restricted
        };
        let nodes = self.closure(self.requested(selection)?)?;

        // Tier order guarantees upstream nodes are decided first.
        let mut skipped: BTreeMap<Node, String> = BTreeMap::new();
        let mut jobs = Vec::new();
        for node in &nodes {
            let reason = match self.upstream(node)? {
                Some(up) if skipped.contains_key(&up) => Some(format!("upstream {up} has no jobs")),
                _ => match self.job_count(node)? {
                    0 if node.tier == Tier::Evt => Some("runlist is empty".to_string()),
                    0 => Some("zero jobs declared".to_string()),
                    _ => None,
                },
            };
            if let Some(reason) = reason {
                obs::emit_node_skipped(node.tier, &node.simid, &reason);
                skipped.insert(node.clone(), reason);
                continue;
            }

            let fingerprint = self.fingerprinter.node(node.tier, &node.simid)?;
            let count = self.job_count(node)?;
            debug!(node = %node, jobs = count, "expanding node");
            for job_index in 0..count {
                jobs.push(self.job(node, job_index, &fingerprint)?);
            }
        }

        let mut partitions = Vec::new();
        for node in nodes.iter().filter(|n| n.tier == Tier::Evt) {
            if skipped.contains_key(node) {
                continue;
            }
            let hits = self.job_count(&Node::new(Tier::Hit, node.simid.clone()))?;
            partitions.push(PartitionTarget {
                simid: node.simid.clone(),
                output: self.engine.partition_file(&node.simid),
                inputs: self.engine.job_outputs(Tier::Hit, &node.simid, hits)?,
            });
        }

        let mut aggregates: Vec<AggregateTarget> = Vec::new();
        for tier in Tier::ALL {
            let inputs: Vec<PathBuf> = jobs
                .iter()
                .filter(|j| j.tier == tier)
                .map(|j| j.output.clone())
                .collect();
            if !inputs.is_empty() {
                aggregates.push(AggregateTarget {
                    name: AggregateTarget::name_for(tier),
                    tier,
                    inputs,
                });
            }
        }

        let geometry = jobs
            .iter()
            .any(|j| j.tier.is_generation() || j.tier == Tier::Hit)
            .then(|| self.geometry_target());
        let plots: Vec<PlotTarget> = nodes
            .iter()
            .filter(|n| n.tier == Tier::Stp && !skipped.contains_key(*n))
            .map(|n| PlotTarget {
                simid: n.simid.clone(),
                output: self.engine.vertex_plot_file(&n.simid),
                inputs: jobs
                    .iter()
                    .filter(|j| j.tier == Tier::Stp && j.simid == n.simid)
                    .map(|j| j.output.clone())
                    .collect(),
            })
            .collect();
        let dtmaps = if jobs.iter().any(|j| j.tier == Tier::Evt) {
            self.dtmap_targets()?
        } else {
            Vec::new()
        };

        let release = (mode == PlanMode::Full).then(|| ReleaseTarget {
            name: RELEASE_TARGET.to_string(),
            requires: aggregates.iter().map(|a| a.name.clone()).collect(),
            inputs: plots
                .iter()
                .map(|p| p.output.clone())
                .chain(
                    dtmaps
                        .iter()
                        .filter(|d| d.detector.is_none())
                        .map(|d| d.output.clone()),
                )
                .collect(),
        });

        let plan = Plan {
            mode,
            jobs,
            partitions,
            aggregates,
            release,
            geometry,
            plots,
            dtmaps,
            skipped: skipped
                .into_iter()
                .map(|(node, reason)| SkippedNode {
                    tier: node.tier,
                    simid: node.simid,
                    reason,
                })
                .collect(),
        };
        check_unique_paths(&plan)?;

        obs::emit_plan_expanded(
            plan.jobs.len(),
            plan.partitions.len(),
            plan.aggregates.len(),
            usize::from(plan.geometry.is_some()) + plan.plots.len() + plan.dtmaps.len(),
            mode == PlanMode::Full,
        );
        Ok(plan)
    }
}

/// Every produced file must have exactly one producer.
fn check_unique_paths(plan: &Plan) -> Result<()> {
    let mut registry = PathRegistry::new();
    for job in &plan.jobs {
        let name = job.name();
        if let Some(mac) = &job.macro_path {
            registry.claim(mac, name.as_str())?;
        }
        registry.claim(&job.output, name.as_str())?;
        registry.claim(&job.log, name.as_str())?;
        registry.claim(&job.benchmark, name.as_str())?;
    }
    for target in &plan.partitions {
        registry.claim(&target.output, format!("partition.{}", target.simid))?;
    }
    if let Some(geometry) = &plan.geometry {
        registry.claim(&geometry.output, "geometry")?;
        registry.claim(&geometry.log, "geometry")?;
    }
    for plot in &plan.plots {
        registry.claim(&plot.output, format!("plot.{}", plot.simid))?;
    }
    for map in &plan.dtmaps {
        registry.claim(&map.output, map.name())?;
    }
    Ok(())
}

/// Expand `selection` over `catalog` with the shared structural inputs.
pub fn expand(
    catalog: &ResolvedCatalog,
    config: &SimflowConfig,
    selection: &Selection,
    structural: &StructuralInputs,
) -> Result<Plan> {
    Planner::new(catalog, config, structural.clone()).expand(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogDocument};
    use serde_json::json;

    fn config() -> SimflowConfig {
        SimflowConfig::new("l200a", "/prod")
            .unwrap()
            .with_runlist(["l200-p03-r000-phy", "l200-p03-r001-phy"])
            .unwrap()
    }

    fn catalog(config: &SimflowConfig) -> ResolvedCatalog {
        let doc = CatalogDocument::from_value(
            "test",
            json!({
                "ver": { "simulations": {
                    "hpge-bulk-vertices": { "template": "ver.mac", "number_of_jobs": 3 }
                }},
                "stp": {
                    "defaults": { "template": "stp.mac", "primaries_per_job": 1000 },
                    "simulations": {
                        "birds-nest-K40": { "number_of_jobs": 2 },
                        "hpge-bulk-Co60": { "vertices": "hpge-bulk-vertices" },
                        "late-start": { "number_of_jobs": 0 }
                    }
                }
            }),
        )
        .unwrap();
        Catalog::new().with_document(doc).resolve(config, &[]).unwrap()
    }

    fn plan(selection: &str) -> Result<Plan> {
        let config = config();
        let catalog = catalog(&config);
        expand(
            &catalog,
            &config,
            &Selection::parse(selection).unwrap(),
            &StructuralInputs::new(),
        )
    }

    #[test]
    fn test_full_expansion_counts() {
        let plan = plan("all").unwrap();
        assert_eq!(plan.mode, PlanMode::Full);
        assert_eq!(plan.jobs_of(Tier::Ver).count(), 3);
        assert_eq!(plan.jobs_of(Tier::Stp).count(), 2 + 3);
        assert_eq!(plan.jobs_of(Tier::Hit).count(), 2 + 3);
        assert_eq!(plan.jobs_of(Tier::Evt).count(), 2 * 2);
        assert_eq!(plan.jobs_of(Tier::Pdf).count(), 2);
        assert_eq!(plan.partitions.len(), 2);
        assert_eq!(plan.aggregates.len(), 5);
        let release = plan.release.unwrap();
        assert_eq!(release.requires.len(), 5);
        assert_eq!(release.requires[0], "gen_all_tier_ver");
    }

    #[test]
    fn test_zero_job_node_is_skipped_with_downstream() {
        let plan = plan("all").unwrap();
        assert!(plan.jobs.iter().all(|j| j.simid != "late-start"));
        let skipped: Vec<String> = plan
            .skipped
            .iter()
            .map(|s| format!("{}.{}", s.tier, s.simid))
            .collect();
        assert_eq!(
            skipped,
            vec![
                "stp.late-start",
                "hit.late-start",
                "evt.late-start",
                "pdf.late-start"
            ]
        );
    }

    #[test]
    fn test_ordering_tier_simid_index() {
        let plan = plan("all").unwrap();
        let keys: Vec<(Tier, String, usize)> = plan
            .jobs
            .iter()
            .map(|j| (j.tier, j.simid.clone(), j.job_index))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_restricted_evt_closure() {
        let plan = plan("evt.hpge-bulk-Co60").unwrap();
        assert_eq!(plan.mode, PlanMode::Restricted);
        assert!(plan.release.is_none());
        let nodes: Vec<String> = plan.nodes().iter().map(ToString::to_string).collect();
        assert_eq!(
            nodes,
            vec![
                "ver.hpge-bulk-vertices",
                "stp.hpge-bulk-Co60",
                "hit.hpge-bulk-Co60",
                "evt.hpge-bulk-Co60"
            ]
        );
        assert_eq!(plan.partitions.len(), 1);
    }

    #[test]
    fn test_stp_without_vertices_needs_no_ver() {
        let plan = plan("stp.birds-nest-K40").unwrap();
        assert_eq!(plan.jobs.len(), 2);
        assert!(plan.jobs.iter().all(|j| j.tier == Tier::Stp));
    }

    #[test]
    fn test_bare_simid_means_all_tiers() {
        let simulation = plan("birds-nest-K40").unwrap();
        let tiers: BTreeSet<Tier> = simulation.jobs.iter().map(|j| j.tier).collect();
        assert_eq!(
            tiers,
            [Tier::Stp, Tier::Hit, Tier::Evt, Tier::Pdf].into_iter().collect()
        );
        let ver_only = plan("hpge-bulk-vertices").unwrap();
        assert!(ver_only.jobs.iter().all(|j| j.tier == Tier::Ver));
    }

    #[test]
    fn test_unknown_simid() {
        assert!(matches!(
            plan("stp.nope"),
            Err(SimflowError::UnknownSimulationId { .. })
        ));
        assert!(matches!(
            plan("nope"),
            Err(SimflowError::UnknownSimulationId { .. })
        ));
        assert!(matches!(
            plan("ver.birds-nest-K40"),
            Err(SimflowError::UnknownSimulationId { .. })
        ));
    }

    #[test]
    fn test_declared_inputs() {
        let plan = plan("all").unwrap();
        let stp = plan
            .jobs
            .iter()
            .find(|j| j.tier == Tier::Stp && j.simid == "hpge-bulk-Co60" && j.job_index == 2)
            .unwrap();
        assert_eq!(stp.inputs.len(), 3);
        assert!(stp.inputs[2].ends_with(
            "hpge-bulk-vertices/l200a-hpge-bulk-vertices_0002-tier_ver.lh5"
        ));

        let evt = plan
            .jobs
            .iter()
            .find(|j| j.tier == Tier::Evt && j.simid == "birds-nest-K40")
            .unwrap();
        assert_eq!(evt.run.as_deref(), Some("l200-p03-r000-phy"));
        assert_eq!(evt.inputs.len(), 2 + 1);
        assert!(evt.inputs[2].ends_with("l200a-birds-nest-K40-partition.json"));

        let pdf = plan.jobs_of(Tier::Pdf).next().unwrap();
        assert_eq!(pdf.inputs.len(), 2);
        assert!(pdf.macro_path.is_none());
    }

    #[test]
    fn test_expansion_is_idempotent() {
        let a = plan("all").unwrap().to_json().unwrap();
        let b = plan("all").unwrap().to_json().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_runlist_skips_evt_and_pdf() {
        let config = SimflowConfig::new("l200a", "/prod").unwrap();
        let catalog = catalog(&config);
        let plan = expand(
            &catalog,
            &config,
            &Selection::Everything,
            &StructuralInputs::new(),
        )
        .unwrap();
        assert_eq!(plan.jobs_of(Tier::Evt).count(), 0);
        assert_eq!(plan.jobs_of(Tier::Pdf).count(), 0);
        assert!(plan.partitions.is_empty());
        assert!(plan
            .skipped
            .iter()
            .any(|s| s.tier == Tier::Evt && s.reason == "runlist is empty"));
    }

    #[test]
    fn test_collision_detected() {
        let job = Job {
            tier: Tier::Stp,
            simid: "a".to_string(),
            job_index: 0,
            run: None,
            macro_path: None,
            output: PathBuf::from("/x.lh5"),
            log: PathBuf::from("/x.log"),
            benchmark: PathBuf::from("/x.tsv"),
            inputs: Vec::new(),
            fingerprint: String::new(),
        };
        let mut other = job.clone();
        other.simid = "b".to_string();
        other.log = PathBuf::from("/y.log");
        other.benchmark = PathBuf::from("/y.tsv");
        let mut plan = Plan {
            mode: PlanMode::Restricted,
            jobs: vec![job, other],
            partitions: Vec::new(),
            aggregates: Vec::new(),
            release: None,
            geometry: None,
            plots: Vec::new(),
            dtmaps: Vec::new(),
            skipped: Vec::new(),
        };
        let err = check_unique_paths(&plan).unwrap_err();
        assert!(matches!(err, SimflowError::PathCollision { .. }));

        plan.jobs.truncate(1);
        assert!(check_unique_paths(&plan).is_ok());
        plan.plots.push(PlotTarget {
            simid: "a".to_string(),
            output: PathBuf::from("/x.log"),
            inputs: Vec::new(),
        });
        match check_unique_paths(&plan).unwrap_err() {
            SimflowError::PathCollision { first, second, .. } => {
                assert_eq!(first, "stp.a[0]");
                assert_eq!(second, "plot.a");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_geometry_and_plot_targets() {
        let plan = plan("all").unwrap();
        let geometry = plan.geometry.as_ref().unwrap();
        assert_eq!(geometry.output, PathBuf::from("/prod/generated/geom/l200a-geom.gdml"));
        assert_eq!(
            geometry.log,
            PathBuf::from("/prod/generated/log/geom/l200a-geom.log")
        );
        assert!(geometry.inputs.is_empty());
        assert!(plan
            .jobs
            .iter()
            .filter(|j| j.tier <= Tier::Hit)
            .all(|j| j.inputs.contains(&geometry.output)));

        let plots: Vec<(&str, usize)> = plan
            .plots
            .iter()
            .map(|p| (p.simid.as_str(), p.inputs.len()))
            .collect();
        assert_eq!(plots, vec![("birds-nest-K40", 2), ("hpge-bulk-Co60", 3)]);
        assert!(plan.plots[0]
            .output
            .ends_with("plots/stp/birds-nest-K40/event-vertices-tier_stp.png"));

        let release = plan.release.unwrap();
        assert_eq!(release.inputs.len(), 2);
        assert!(plan.dtmaps.is_empty());
    }

    #[test]
    fn test_ver_only_plan_has_geometry_but_no_plots() {
        let plan = plan("ver.hpge-bulk-vertices").unwrap();
        assert!(plan.geometry.is_some());
        assert!(plan.plots.is_empty());
        assert!(plan.dtmaps.is_empty());
    }

    #[test]
    fn test_dtmap_targets_follow_deployed_detectors() {
        use crate::partition::{RunInfoTable, Usability};

        let config = config();
        let catalog = catalog(&config);
        let mut runinfo = RunInfoTable::new();
        runinfo.insert_run("l200-p03-r000-phy", 10.0, Some("s0"));
        runinfo.insert_run("l200-p03-r001-phy", 10.0, None::<String>);
        runinfo.insert_detector("s0", "V02160A", Usability::On, None);
        runinfo.insert_detector("s0", "B00032B", Usability::Off, None);

        let plan = Planner::new(&catalog, &config, StructuralInputs::new())
            .with_run_metadata(&runinfo)
            .expand(&Selection::Everything)
            .unwrap();
        let names: Vec<String> = plan.dtmaps.iter().map(DriftTimeMapTarget::name).collect();
        assert_eq!(
            names,
            vec![
                "dtmap.l200-p03-r000-phy.B00032B",
                "dtmap.l200-p03-r000-phy.V02160A",
                "dtmap.l200-p03-r000-phy",
            ]
        );
        let merged = &plan.dtmaps[2];
        assert_eq!(
            merged.inputs,
            vec![plan.dtmaps[0].output.clone(), plan.dtmaps[1].output.clone()]
        );
        assert!(merged
            .output
            .ends_with("dtmaps/l200-p03-r000-phy/l200a-l200-p03-r000-phy-dtmaps.lh5"));
        assert!(plan
            .release
            .unwrap()
            .inputs
            .contains(&merged.output));

        let stp_only = Planner::new(&catalog, &config, StructuralInputs::new())
            .with_run_metadata(&runinfo)
            .expand(&Selection::parse("stp.birds-nest-K40").unwrap())
            .unwrap();
        assert!(stp_only.dtmaps.is_empty());

        let mut no_root = config.clone();
        no_root.paths.dtmaps = None;
        let plan = Planner::new(&catalog, &no_root, StructuralInputs::new())
            .with_run_metadata(&runinfo)
            .expand(&Selection::Everything)
            .unwrap();
        assert!(plan.dtmaps.is_empty());
    }

    #[test]
    fn test_dtmap_rejects_unusable_detector_id() {
        use crate::partition::{RunInfoTable, Usability};

        let config = config();
        let catalog = catalog(&config);
        let mut runinfo = RunInfoTable::new();
        runinfo.insert_run("l200-p03-r000-phy", 10.0, Some("s0"));
        runinfo.insert_detector("s0", "V02/160A", Usability::On, None);
        let err = Planner::new(&catalog, &config, StructuralInputs::new())
            .with_run_metadata(&runinfo)
            .expand(&Selection::Everything)
            .unwrap_err();
        assert!(matches!(err, SimflowError::InvalidConfig(_)));
    }
}
