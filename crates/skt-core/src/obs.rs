//! Structured observability hooks for skt stage lifecycle events.
//!
//! - Run-scoped tracing span via the `RunSpan` RAII guard
//! - Emission functions for stage start/finish, state persistence, retries
//!   and external side effects (patches applied, artifacts published)

use skt_state::{Outcome, Stage};
use tracing::{info, warn};

/// RAII guard that enters a run-scoped tracing span for one invocation.
///
/// ```ignore
/// let _span = RunSpan::enter("5f0c...", "build");
/// // every event below carries run_id and stage
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str, command: &str) -> Self {
        let span = tracing::info_span!("skt.run", run_id = %run_id, command = %command);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_stage_started(stage: Stage) {
    info!(event = "stage.started", stage = %stage);
}

pub fn emit_stage_finished(stage: Stage, outcome: Outcome, duration_ms: u64, summary: &str) {
    if outcome == Outcome::Success {
        info!(
            event = "stage.finished",
            stage = %stage,
            outcome = outcome.as_str(),
            duration_ms = duration_ms,
            summary = %summary,
        );
    } else {
        warn!(
            event = "stage.finished",
            stage = %stage,
            outcome = outcome.as_str(),
            duration_ms = duration_ms,
            summary = %summary,
        );
    }
}

pub fn emit_state_saved(path: &std::path::Path) {
    info!(event = "state.saved", path = %path.display());
}

/// A transient failure is about to be retried (warning level).
pub fn emit_retry(what: &str, attempt: u32, delay_ms: u64, error: &dyn std::fmt::Display) {
    warn!(
        event = "retry.scheduled",
        what = %what,
        attempt = attempt,
        delay_ms = delay_ms,
        error = %error,
    );
}

pub fn emit_patch_applied(label: &str) {
    info!(event = "merge.patch_applied", patch = %label);
}

pub fn emit_artifact_published(url: &str) {
    info!(event = "publish.artifact", url = %url);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _span = RunSpan::enter("test-run-id", "merge");
        emit_stage_started(Stage::Merge);
        emit_stage_finished(Stage::Merge, Outcome::Failure, 12, "conflict");
    }
}
