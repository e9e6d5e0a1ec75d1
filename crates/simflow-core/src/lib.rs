//! simflow core library
//!
//! Turns a declarative simulation catalog into an ordered job plan for an
//! external executor, tags every job with a change fingerprint, and
//! partitions simulated statistics across operating runs by live time.

pub mod catalog;
pub mod commands;
pub mod config;
pub mod dag;
pub mod error;
pub mod fingerprint;
pub mod obs;
pub mod partition;
pub mod patterns;
pub mod persist;
pub mod selector;
pub mod telemetry;
pub mod tier;

pub use catalog::{
    Catalog, CatalogDocument, DefinitionKey, MacroSnippet, MacroTables, ResolvedCatalog,
    SimulationDefinition,
};
pub use commands::{derive_seed, render_macro, simulation_command, write_macro};
pub use config::{PathsConfig, SimflowConfig};
pub use dag::{
    expand, AggregateTarget, DriftTimeMapTarget, GeometryTarget, Job, Node, PartitionTarget, Plan,
    PlanMode, Planner, PlotTarget, ReleaseTarget, SkippedNode,
};
pub use error::{Result, SimflowError};
pub use fingerprint::{fingerprint, FingerprintPolicy, Fingerprinter, StructuralInputs};
pub use partition::{
    partition, DetectorCorrection, EnergyResolution, EventStatistics, PartitionEntry,
    PartitionTable, RunInfoTable, RunMetadataSource, Usability,
};
pub use patterns::{ArtifactRef, PathEngine};
pub use selector::{Selection, Target};
pub use tier::{ArtifactKind, Tier};

/// Crate version, stamped into CLI output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
