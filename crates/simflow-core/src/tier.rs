//! Pipeline tiers and artifact kinds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An ordered pipeline stage.
///
/// The declaration order is the pipeline order: each tier consumes only the
/// outputs of the tier before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Vertex generation.
    Ver,
    /// Full event simulation (steps).
    Stp,
    /// Post-processed hits.
    Hit,
    /// Event building, one output per operating run.
    Evt,
    /// Histogram summarization, one output per simulation id.
    Pdf,
}

impl Tier {
    /// All tiers in pipeline order.
    pub const ALL: [Tier; 5] = [Tier::Ver, Tier::Stp, Tier::Hit, Tier::Evt, Tier::Pdf];

    /// Short name used in selectors, file names and config keys.
    pub fn name(&self) -> &'static str {
        match self {
            Tier::Ver => "ver",
            Tier::Stp => "stp",
            Tier::Hit => "hit",
            Tier::Evt => "evt",
            Tier::Pdf => "pdf",
        }
    }

    /// Whether the tier runs the simulation executable on a macro and has
    /// its own catalog namespace.
    pub fn is_generation(&self) -> bool {
        matches!(self, Tier::Ver | Tier::Stp)
    }

    /// Catalog namespace a tier's definitions are read from.
    ///
    /// Derived tiers reuse the full-simulation definition of the same id.
    pub fn catalog_tier(&self) -> Tier {
        if self.is_generation() {
            *self
        } else {
            Tier::Stp
        }
    }

    /// The tier whose outputs this tier consumes. `ver` has none; `stp` only
    /// consumes vertices when a definition asks for them.
    pub fn upstream(&self) -> Option<Tier> {
        match self {
            Tier::Ver => None,
            Tier::Stp => Some(Tier::Ver),
            Tier::Hit => Some(Tier::Stp),
            Tier::Evt => Some(Tier::Hit),
            Tier::Pdf => Some(Tier::Evt),
        }
    }

    /// The last tier of the pipeline.
    pub fn terminal() -> Tier {
        Tier::Pdf
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ver" => Ok(Tier::Ver),
            "stp" => Ok(Tier::Stp),
            "hit" => Ok(Tier::Hit),
            "evt" => Ok(Tier::Evt),
            "pdf" => Ok(Tier::Pdf),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

/// Kind of file derived for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Macro,
    Output,
    Log,
    Benchmark,
    Plot,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::Macro,
        ArtifactKind::Output,
        ArtifactKind::Log,
        ArtifactKind::Benchmark,
        ArtifactKind::Plot,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ArtifactKind::Macro => "macro",
            ArtifactKind::Output => "output",
            ArtifactKind::Log => "log",
            ArtifactKind::Benchmark => "benchmark",
            ArtifactKind::Plot => "plot",
        }
    }

    /// File extension. Unique per kind, which is what lets the inverse
    /// parser recover the kind from a bare path.
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Macro => "mac",
            ArtifactKind::Output => "lh5",
            ArtifactKind::Log => "log",
            ArtifactKind::Benchmark => "tsv",
            ArtifactKind::Plot => "png",
        }
    }

    pub fn from_extension(ext: &str) -> Option<ArtifactKind> {
        ArtifactKind::ALL
            .into_iter()
            .find(|kind| kind.extension() == ext)
    }

    /// Whether the kind exists for jobs of `tier`.
    pub fn applies_to(&self, tier: Tier) -> bool {
        match self {
            ArtifactKind::Macro => tier.is_generation(),
            _ => true,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
