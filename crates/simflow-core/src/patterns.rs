//! Deterministic file layout for every job artifact.
//!
//! Layout, with `<bn>` the job basename:
//!
//! - macro: `<macros>/<tier>/<simid>/<bn>.mac`
//! - output: `<tier root>/<simid>/<bn>.lh5`
//! - log: `<log>[/<stamp>]/<tier>/<simid>/<bn>.log`
//! - benchmark: `<benchmarks>/<tier>/<simid>/<bn>.tsv`
//! - plot: `<plots>/<tier>/<simid>/<bn>.png`
//!
//! `<bn>` is `<experiment>-<simid>_<jobid>-tier_<tier>` where `<jobid>` is the
//! zero-padded job index for `ver`/`stp`/`hit` and the run label for `evt`;
//! `pdf` outputs carry no job token. Every path is parseable back into the
//! tuple that produced it with [`PathEngine::parse_path`].
//!
//! Files outside the job grid have fixed names: the geometry
//! `<geom>/<experiment>-geom.gdml` and its build log, one vertex plot per stp
//! simulation, partition tables, and per-run drift-time maps under
//! `<dtmaps>/<run>/`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{is_valid_label, SimflowConfig};
use crate::error::{Result, SimflowError};
use crate::tier::{ArtifactKind, Tier};

/// The tuple a derived path encodes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub tier: Tier,
    pub simid: String,
    pub job_index: usize,
    pub kind: ArtifactKind,
}

/// Derives artifact paths from the configured roots.
#[derive(Debug, Clone, Copy)]
pub struct PathEngine<'a> {
    config: &'a SimflowConfig,
}

impl<'a> PathEngine<'a> {
    pub fn new(config: &'a SimflowConfig) -> Self {
        Self { config }
    }

    /// Number of jobs a tier has per simulation id when the count does not
    /// come from the catalog (`evt`: one per run, `pdf`: one).
    pub fn fixed_job_count(&self, tier: Tier) -> Option<usize> {
        match tier {
            Tier::Evt => Some(self.config.runlist.len()),
            Tier::Pdf => Some(1),
            _ => None,
        }
    }

    fn job_token(&self, tier: Tier, simid: &str, job_index: usize) -> Result<Option<String>> {
        match tier {
            Tier::Ver | Tier::Stp | Tier::Hit => Ok(Some(format!("{job_index:04}"))),
            Tier::Evt => self
                .config
                .runlist
                .get(job_index)
                .cloned()
                .map(Some)
                .ok_or_else(|| SimflowError::JobIndexOutOfRange {
                    tier,
                    simid: simid.to_string(),
                    job_index,
                    count: self.config.runlist.len(),
                }),
            Tier::Pdf if job_index == 0 => Ok(None),
            Tier::Pdf => Err(SimflowError::JobIndexOutOfRange {
                tier,
                simid: simid.to_string(),
                job_index,
                count: 1,
            }),
        }
    }

    /// File name of a job without extension.
    pub fn basename(&self, tier: Tier, simid: &str, job_index: usize) -> Result<String> {
        if !is_valid_label(simid) {
            return Err(SimflowError::MalformedCatalog(format!(
                "simulation id '{simid}' cannot be used in a file name"
            )));
        }
        let experiment = &self.config.experiment;
        Ok(match self.job_token(tier, simid, job_index)? {
            Some(token) => format!("{experiment}-{simid}_{token}-tier_{tier}"),
            None => format!("{experiment}-{simid}-tier_{tier}"),
        })
    }

    /// Path of one artifact of one job.
    pub fn path_for(
        &self,
        tier: Tier,
        simid: &str,
        job_index: usize,
        kind: ArtifactKind,
    ) -> Result<PathBuf> {
        if !kind.applies_to(tier) {
            return Err(SimflowError::ArtifactNotApplicable {
                tier,
                kind: kind.to_string(),
            });
        }
        let file = format!(
            "{}.{}",
            self.basename(tier, simid, job_index)?,
            kind.extension()
        );
        let paths = &self.config.paths;
        let dir = match kind {
            ArtifactKind::Macro => paths.macros.join(tier.name()),
            ArtifactKind::Output => paths.tier_root(tier).to_path_buf(),
            ArtifactKind::Log => match &self.config.log_stamp {
                Some(stamp) => paths.log.join(stamp).join(tier.name()),
                None => paths.log.join(tier.name()),
            },
            ArtifactKind::Benchmark => paths.benchmarks.join(tier.name()),
            ArtifactKind::Plot => paths.plots.join(tier.name()),
        };
        Ok(dir.join(simid).join(file))
    }

    /// Outputs of the first `count` jobs of a node.
    pub fn job_outputs(&self, tier: Tier, simid: &str, count: usize) -> Result<Vec<PathBuf>> {
        (0..count)
            .map(|j| self.path_for(tier, simid, j, ArtifactKind::Output))
            .collect()
    }

    /// Glob matching every job output of a node.
    pub fn output_glob(&self, tier: Tier, simid: &str) -> PathBuf {
        self.config.paths.tier_root(tier).join(simid).join(format!(
            "{}-{simid}*-tier_{tier}.{}",
            self.config.experiment,
            ArtifactKind::Output.extension()
        ))
    }

    /// Geometry description consumed by every generation and hit job.
    pub fn geom_file(&self) -> PathBuf {
        self.config
            .paths
            .geom
            .join(format!("{}-geom.gdml", self.config.experiment))
    }

    /// Log of the geometry build.
    pub fn geom_log_file(&self) -> PathBuf {
        let paths = &self.config.paths;
        let dir = match &self.config.log_stamp {
            Some(stamp) => paths.log.join(stamp).join("geom"),
            None => paths.log.join("geom"),
        };
        dir.join(format!("{}-geom.log", self.config.experiment))
    }

    /// Vertex distribution plot of one stp simulation.
    pub fn vertex_plot_file(&self, simid: &str) -> PathBuf {
        self.config
            .paths
            .plots
            .join(Tier::Stp.name())
            .join(simid)
            .join(format!("event-vertices-tier_{}.png", Tier::Stp))
    }

    /// Drift-time map of one HPGe detector in `run`, if a map root is
    /// configured.
    pub fn dtmap_file(&self, run: &str, detector: &str) -> Option<PathBuf> {
        let root = self.config.paths.dtmaps.as_ref()?;
        Some(root.join(run).join(format!(
            "{}-{run}-{detector}-dtmap.lh5",
            self.config.experiment
        )))
    }

    /// All drift-time maps of `run` merged into one file.
    pub fn merged_dtmap_file(&self, run: &str) -> Option<PathBuf> {
        let root = self.config.paths.dtmaps.as_ref()?;
        Some(
            root.join(run)
                .join(format!("{}-{run}-dtmaps.lh5", self.config.experiment)),
        )
    }

    /// Partition table consumed by the event-building jobs of `simid`.
    pub fn partition_file(&self, simid: &str) -> PathBuf {
        self.config.paths.partitions.join(simid).join(format!(
            "{}-{simid}-partition.json",
            self.config.experiment
        ))
    }

    /// Recover the tuple that produced `path`.
    ///
    /// Only exact outputs of [`path_for`](Self::path_for) are accepted: the
    /// parsed tuple is re-derived and compared with the input.
    pub fn parse_path(&self, path: impl AsRef<Path>) -> Result<ArtifactRef> {
        let path = path.as_ref();
        let fail = |reason: &str| SimflowError::UnparsablePath {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let kind = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(ArtifactKind::from_extension)
            .ok_or_else(|| fail("unknown artifact extension"))?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| fail("missing file name"))?;
        let simid = path
            .parent()
            .and_then(Path::file_name)
            .and_then(|s| s.to_str())
            .ok_or_else(|| fail("missing simulation id directory"))?;

        let (head, tier_name) = stem
            .rsplit_once("-tier_")
            .ok_or_else(|| fail("missing '-tier_<tier>' suffix"))?;
        let tier: Tier = tier_name.parse().map_err(|e: String| fail(&e))?;

        let prefix = format!("{}-{simid}", self.config.experiment);
        let rest = head
            .strip_prefix(&prefix)
            .ok_or_else(|| fail("file name does not start with <experiment>-<simid>"))?;

        let job_index = match tier {
            Tier::Pdf if rest.is_empty() => 0,
            Tier::Pdf => return Err(fail("pdf artifacts carry no job token")),
            Tier::Evt => {
                let run = rest
                    .strip_prefix('_')
                    .ok_or_else(|| fail("missing run label"))?;
                self.config
                    .run_index(run)
                    .ok_or_else(|| fail("run label is not in the configured runlist"))?
            }
            _ => rest
                .strip_prefix('_')
                .and_then(|token| token.parse::<usize>().ok())
                .ok_or_else(|| fail("missing numeric job id"))?,
        };

        let expected = self
            .path_for(tier, simid, job_index, kind)
            .map_err(|e| fail(&e.to_string()))?;
        if expected != path {
            return Err(fail(&format!(
                "canonical location would be {}",
                expected.display()
            )));
        }

        Ok(ArtifactRef {
            tier,
            simid: simid.to_string(),
            job_index,
            kind,
        })
    }
}

/// Tracks which producer claimed each path, failing on the second claim.
#[derive(Debug, Default)]
pub struct PathRegistry {
    owners: HashMap<PathBuf, String>,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&mut self, path: &Path, owner: impl Into<String>) -> Result<()> {
        let owner = owner.into();
        if let Some(first) = self.owners.get(path) {
            return Err(SimflowError::PathCollision {
                path: path.to_path_buf(),
                first: first.clone(),
                second: owner,
            });
        }
        self.owners.insert(path.to_path_buf(), owner);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config() -> SimflowConfig {
        SimflowConfig::new("l200a", "/prod")
            .unwrap()
            .with_runlist(["l200-p03-r000-phy", "l200-p03-r001-phy"])
            .unwrap()
    }

    #[test]
    fn test_boundary_file_layout() {
        let mut config = config();
        let engine = PathEngine::new(&config);
        assert_eq!(
            engine.geom_log_file(),
            PathBuf::from("/prod/generated/log/geom/l200a-geom.log")
        );
        assert_eq!(
            engine.vertex_plot_file("hpge-bulk-Co60"),
            PathBuf::from("/prod/generated/plots/stp/hpge-bulk-Co60/event-vertices-tier_stp.png")
        );
        assert_eq!(
            engine.dtmap_file("l200-p03-r000-phy", "V02160A"),
            Some(PathBuf::from(
                "/prod/generated/dtmaps/l200-p03-r000-phy/l200a-l200-p03-r000-phy-V02160A-dtmap.lh5"
            ))
        );
        assert_eq!(
            engine.merged_dtmap_file("l200-p03-r000-phy"),
            Some(PathBuf::from(
                "/prod/generated/dtmaps/l200-p03-r000-phy/l200a-l200-p03-r000-phy-dtmaps.lh5"
            ))
        );

        config.paths.dtmaps = None;
        config.log_stamp = Some("20260101T000000Z".to_string());
        let engine = PathEngine::new(&config);
        assert!(engine.merged_dtmap_file("l200-p03-r000-phy").is_none());
        assert_eq!(
            engine.geom_log_file(),
            PathBuf::from("/prod/generated/log/20260101T000000Z/geom/l200a-geom.log")
        );
    }

    #[test]
    fn test_output_layout() {
        let config = config();
        let engine = PathEngine::new(&config);
        assert_eq!(
            engine
                .path_for(Tier::Stp, "birds-nest-K40", 7, ArtifactKind::Output)
                .unwrap(),
            PathBuf::from(
                "/prod/generated/tier/stp/birds-nest-K40/l200a-birds-nest-K40_0007-tier_stp.lh5"
            )
        );
        assert_eq!(
            engine
                .path_for(Tier::Evt, "birds-nest-K40", 1, ArtifactKind::Output)
                .unwrap(),
            PathBuf::from(
                "/prod/generated/tier/evt/birds-nest-K40/l200a-birds-nest-K40_l200-p03-r001-phy-tier_evt.lh5"
            )
        );
        assert_eq!(
            engine
                .path_for(Tier::Pdf, "birds-nest-K40", 0, ArtifactKind::Output)
                .unwrap(),
            PathBuf::from("/prod/generated/tier/pdf/birds-nest-K40/l200a-birds-nest-K40-tier_pdf.lh5")
        );
    }

    #[test]
    fn test_log_stamp_subdirectory() {
        let mut config = config();
        config.log_stamp = Some("20260101T000000Z".to_string());
        let engine = PathEngine::new(&config);
        let log = engine
            .path_for(Tier::Hit, "x", 0, ArtifactKind::Log)
            .unwrap();
        assert_eq!(
            log,
            PathBuf::from("/prod/generated/log/20260101T000000Z/hit/x/l200a-x_0000-tier_hit.log")
        );
        assert_eq!(engine.parse_path(&log).unwrap().tier, Tier::Hit);
    }

    #[test]
    fn test_macro_not_applicable_to_derived_tiers() {
        let config = config();
        let engine = PathEngine::new(&config);
        assert!(matches!(
            engine.path_for(Tier::Hit, "x", 0, ArtifactKind::Macro),
            Err(SimflowError::ArtifactNotApplicable { .. })
        ));
    }

    #[test]
    fn test_out_of_range_job_tokens() {
        let config = config();
        let engine = PathEngine::new(&config);
        assert!(matches!(
            engine.path_for(Tier::Pdf, "x", 1, ArtifactKind::Output),
            Err(SimflowError::JobIndexOutOfRange { count: 1, .. })
        ));
        assert!(matches!(
            engine.path_for(Tier::Evt, "x", 2, ArtifactKind::Output),
            Err(SimflowError::JobIndexOutOfRange { count: 2, .. })
        ));
    }

    #[test]
    fn test_paths_distinct_across_kinds_and_tiers() {
        let config = config();
        let engine = PathEngine::new(&config);
        let mut seen = HashSet::new();
        for tier in Tier::ALL {
            let jobs = engine.fixed_job_count(tier).unwrap_or(3);
            for simid in ["a", "a-b", "a_b"] {
                for job in 0..jobs {
                    for kind in ArtifactKind::ALL {
                        if !kind.applies_to(tier) {
                            continue;
                        }
                        let path = engine.path_for(tier, simid, job, kind).unwrap();
                        assert!(seen.insert(path.clone()), "duplicate {}", path.display());
                    }
                }
            }
        }
    }

    #[test]
    fn test_parse_roundtrip_every_kind() {
        let config = config();
        let engine = PathEngine::new(&config);
        for tier in Tier::ALL {
            for kind in ArtifactKind::ALL {
                if !kind.applies_to(tier) {
                    continue;
                }
                let job = if tier == Tier::Pdf { 0 } else { 1 };
                let path = engine.path_for(tier, "sim_id-1", job, kind).unwrap();
                let parsed = engine.parse_path(&path).unwrap();
                assert_eq!(
                    parsed,
                    ArtifactRef {
                        tier,
                        simid: "sim_id-1".to_string(),
                        job_index: job,
                        kind,
                    }
                );
            }
        }
    }

    #[test]
    fn test_parse_rejects_foreign_paths() {
        let config = config();
        let engine = PathEngine::new(&config);
        for bad in [
            "/prod/generated/tier/stp/x/l200a-x_7-tier_stp.lh5",
            "/prod/generated/tier/stp/x/l200a-y_0007-tier_stp.lh5",
            "/elsewhere/x/l200a-x_0007-tier_stp.lh5",
            "/prod/generated/tier/stp/x/l200a-x_0007-tier_raw.lh5",
            "/prod/generated/tier/stp/x/l200a-x_0007-tier_stp.root",
            "/prod/generated/tier/evt/x/l200a-x_l200-p09-r000-phy-tier_evt.lh5",
        ] {
            assert!(
                matches!(
                    engine.parse_path(bad),
                    Err(SimflowError::UnparsablePath { .. })
                ),
                "accepted {bad}"
            );
        }
    }

    #[test]
    fn test_output_glob() {
        let config = config();
        let engine = PathEngine::new(&config);
        assert_eq!(
            engine.output_glob(Tier::Stp, "x"),
            PathBuf::from("/prod/generated/tier/stp/x/l200a-x*-tier_stp.lh5")
        );
    }

    #[test]
    fn test_registry_detects_collision() {
        let mut registry = PathRegistry::new();
        registry.claim(Path::new("/a"), "stp.x[0]").unwrap();
        let err = registry.claim(Path::new("/a"), "stp.y[0]").unwrap_err();
        assert!(matches!(err, SimflowError::PathCollision { .. }));
        assert_eq!(registry.len(), 1);
    }
}
