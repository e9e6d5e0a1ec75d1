//! Structured lifecycle events for planning and partitioning passes.
//!
//! Every event carries a stable `event = "..."` key so log pipelines can
//! filter on it regardless of message wording.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::tier::Tier;

/// RAII guard entering a span tagged with the pass label for its lifetime.
///
/// ```ignore
/// let _span = PlanSpan::enter("plan");
/// ```
pub struct PlanSpan {
    _span: tracing::span::EnteredSpan,
}

impl PlanSpan {
    pub fn enter(pass: &str) -> Self {
        let span = tracing::info_span!("simflow.pass", pass = %pass);
        Self {
            _span: span.entered(),
        }
    }
}

/// Plan expansion finished.
pub fn emit_plan_expanded(
    jobs: usize,
    partitions: usize,
    aggregates: usize,
    boundary: usize,
    full: bool,
) {
    info!(
        event = "plan.expanded",
        jobs = jobs,
        partitions = partitions,
        aggregates = aggregates,
        boundary = boundary,
        full = full,
    );
}

/// A run contributes no drift-time maps.
pub fn emit_dtmaps_skipped(run: &str, reason: &str) {
    debug!(event = "plan.dtmaps_skipped", run = %run, reason = %reason);
}

/// A node with no jobs was left out of the plan.
pub fn emit_node_skipped(tier: Tier, simid: &str, reason: &str) {
    warn!(event = "plan.node_skipped", tier = %tier, simid = %simid, reason = %reason);
}

pub fn emit_fingerprint_computed(tier: Tier, simid: &str, digest: &str) {
    debug!(event = "fingerprint.computed", tier = %tier, simid = %simid, digest = %digest);
}

pub fn emit_partition_computed(simid: &str, runs: usize, total_events: u64) {
    info!(
        event = "partition.computed",
        simid = %simid,
        runs = runs,
        total_events = total_events,
    );
}

pub fn emit_partition_written(simid: &str, path: &Path) {
    info!(event = "partition.written", simid = %simid, path = %path.display());
}

/// An `on` detector has no energy-resolution record for a run and gets the
/// fallback curve.
pub fn emit_resolution_missing(run: &str, detector: &str) {
    warn!(event = "partition.resolution_missing", run = %run, detector = %detector);
}
