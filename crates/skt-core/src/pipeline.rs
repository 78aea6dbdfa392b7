//! One pipeline session: the run state plus the stages that advance it.
//!
//! Every stage follows the same protocol: check its prerequisites in the
//! current state, run on the collaborators, record its result and persist
//! the state once. A stage that returns `Err` leaves the state untouched.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use skt_state::{MergedTree, Outcome, ReportRecord, RunState, Stage, StateStore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::boot::BootTestRunner;
use crate::build::{BuildRequest, BuildRunner};
use crate::error::{Result, SktError, EXIT_FAILURE, EXIT_INFRA, EXIT_SUCCESS};
use crate::git::KernelTree;
use crate::merge::{MergeRequest, PatchResolver};
use crate::obs::{emit_stage_finished, emit_stage_started, emit_state_saved};
use crate::publish::{publish_artifact, Publisher};
use crate::report::{Report, Reporter};

/// What a stage did, for the caller to print and turn into an exit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    pub outcome: Outcome,
    pub summary: String,
}

impl StageReport {
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            Outcome::Success => EXIT_SUCCESS,
            Outcome::Failure => EXIT_FAILURE,
            Outcome::Error => EXIT_INFRA,
        }
    }
}

/// Stage name used for `cleanup`, which leaves nothing in the state.
pub const CLEANUP: &str = "cleanup";

/// Run state of the current invocation.
///
/// The state is always loaded from the rc file; it is written back only
/// when the session persists (`skt --state`).
#[derive(Debug)]
pub struct Session {
    store: StateStore,
    persist: bool,
    state: RunState,
}

impl Session {
    pub fn open(rc: &Path, persist: bool) -> Result<Self> {
        let store = StateStore::new(rc);
        let state = store.load()?;
        debug!(rc = %rc.display(), persist, empty = state.is_empty(), "session opened");
        Ok(Self {
            store,
            persist,
            state,
        })
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Run id for log correlation; `None` before the first merge.
    pub fn run_id(&self) -> Option<Uuid> {
        self.state.run_id
    }

    fn commit(&self) -> Result<()> {
        if self.persist {
            self.store.save(&self.state)?;
            emit_state_saved(self.store.path());
        }
        Ok(())
    }

    fn finish(&self, stage: Stage, started: Instant, outcome: Outcome, summary: &str) -> StageReport {
        emit_stage_finished(stage, outcome, started.elapsed().as_millis() as u64, summary);
        StageReport {
            stage,
            outcome,
            summary: summary.to_string(),
        }
    }

    /// Check out the base and apply the patches into `workdir`.
    ///
    /// Starts a new run: the run id is fresh and every downstream record
    /// is dropped.
    pub async fn merge(
        &mut self,
        resolver: &PatchResolver<'_>,
        workdir: &Path,
        request: &MergeRequest,
    ) -> Result<StageReport> {
        let started = Instant::now();
        emit_stage_started(Stage::Merge);

        let record = resolver.merge(workdir, request).await?;
        let result = record.result.clone();

        self.state.run_id = Some(Uuid::new_v4());
        self.state.workdir = Some(workdir.to_path_buf());
        self.state.record_merge(record);
        self.commit()?;

        Ok(self.finish(Stage::Merge, started, result.outcome, &result.summary))
    }

    /// Build the merged tree. The request's config plan is already
    /// validated.
    pub async fn build(&mut self, runner: &BuildRunner, request: &BuildRequest) -> Result<StageReport> {
        let tree = self.state.merged_tree().cloned().ok_or(SktError::NoMergedTree)?;
        verify_head(&tree).await?;
        let started = Instant::now();
        emit_stage_started(Stage::Build);

        let record = runner.build(&tree, request).await?;
        let result = record.result.clone();
        self.state.record_build(record);
        self.commit()?;

        Ok(self.finish(Stage::Build, started, result.outcome, &result.summary))
    }

    pub async fn publish(&mut self, publisher: &dyn Publisher) -> Result<StageReport> {
        let artifact = self.state.built_artifact().cloned().ok_or(SktError::NoBuild)?;
        let started = Instant::now();
        emit_stage_started(Stage::Publish);

        let record = publish_artifact(publisher, &artifact).await?;
        let result = record.result.clone();
        self.state.record_publish(record);
        self.commit()?;

        Ok(self.finish(Stage::Publish, started, result.outcome, &result.summary))
    }

    pub async fn test(&mut self, runner: &BootTestRunner) -> Result<StageReport> {
        let artifact = self.state.built_artifact().cloned().ok_or(SktError::NoBuild)?;
        let workdir = self.workdir().ok_or(SktError::NoMergedTree)?;
        let started = Instant::now();
        emit_stage_started(Stage::Test);

        let record = runner
            .test(&artifact, self.state.publish.as_ref(), &workdir)
            .await?;
        let result = record.result.clone();
        self.state.record_test(record);
        self.commit()?;

        Ok(self.finish(Stage::Test, started, result.outcome, &result.summary))
    }

    /// Render the report from the recorded stages and deliver it.
    pub async fn report(&mut self, reporter: &dyn Reporter) -> Result<StageReport> {
        let started = Instant::now();
        emit_stage_started(Stage::Report);

        let report = Report::from_state(&self.state);
        reporter.emit(&report).await?;

        self.state.record_report(ReportRecord {
            reporter: reporter.kind().to_string(),
            destination: reporter.destination(),
            emitted_at: Utc::now(),
        });
        self.commit()?;

        let summary = format!("{} sent via {}", report.subject, reporter.kind());
        Ok(self.finish(Stage::Report, started, Outcome::Success, &summary))
    }

    /// Forget the run: remove the tarball, the work tree when `wipe` is
    /// set, and the `[state]` table of the rc file.
    pub fn cleanup(&mut self, wipe: bool) -> Result<String> {
        let mut removed = Vec::new();

        if let Some(tarball) = self.state.build.as_ref().and_then(|b| b.artifact.tarball.clone()) {
            if remove_if_exists(&tarball, false)? {
                removed.push(tarball);
            }
        }
        if wipe {
            if let Some(workdir) = self.workdir() {
                if remove_if_exists(&workdir, true)? {
                    removed.push(workdir);
                }
            }
        }

        self.store.clear()?;
        self.state = RunState::default();

        let summary = match removed.len() {
            0 => "state cleared".to_string(),
            n => format!("state cleared, {n} path(s) removed"),
        };
        info!(stage = CLEANUP, removed = ?removed, "{summary}");
        Ok(summary)
    }

    /// Merge, build, then the optional stages, stopping at the first
    /// stage that does not succeed. The report, when configured, is
    /// delivered even after a failure.
    ///
    /// Returns the first unsuccessful stage, or the last stage run.
    pub async fn run_all(&mut self, stages: AllStages<'_>) -> Result<StageReport> {
        let outcome = self.run_until_failure(&stages).await?;
        if let Some(reporter) = stages.reporter {
            let report = self.report(reporter).await?;
            if outcome.outcome == Outcome::Success {
                return Ok(report);
            }
        }
        Ok(outcome)
    }

    async fn run_until_failure(&mut self, stages: &AllStages<'_>) -> Result<StageReport> {
        let mut last = self
            .merge(stages.resolver, &stages.workdir, &stages.merge)
            .await?;
        if last.outcome != Outcome::Success {
            return Ok(last);
        }

        last = self.build(stages.builder, &stages.build).await?;
        if last.outcome != Outcome::Success {
            return Ok(last);
        }

        if let Some(publisher) = stages.publisher {
            last = self.publish(publisher).await?;
            if last.outcome != Outcome::Success {
                return Ok(last);
            }
        }

        if let Some(boot) = stages.boot {
            last = self.test(boot).await?;
        }
        Ok(last)
    }

    fn workdir(&self) -> Option<PathBuf> {
        self.state
            .workdir
            .clone()
            .or_else(|| self.state.merged_tree().map(|t| t.path.clone()))
    }
}

/// Everything `skt all` runs.
pub struct AllStages<'a> {
    pub resolver: &'a PatchResolver<'a>,
    pub workdir: PathBuf,
    pub merge: MergeRequest,
    pub builder: &'a BuildRunner,
    pub build: BuildRequest,
    pub publisher: Option<&'a dyn Publisher>,
    pub boot: Option<&'a BootTestRunner>,
    pub reporter: Option<&'a dyn Reporter>,
}

/// The work tree must still be at the merged head the state records.
async fn verify_head(tree: &MergedTree) -> Result<()> {
    if !tree.path.is_dir() {
        warn!(path = %tree.path.display(), "merged work tree is gone");
        return Err(SktError::NoMergedTree);
    }
    match KernelTree::new(&tree.path).head().await {
        Ok(head) if head == tree.head => Ok(()),
        Err(err @ SktError::ToolchainMissing { .. }) => Err(err),
        Ok(head) => {
            warn!(expected = %tree.head, found = %head, "work tree moved since the merge");
            Err(SktError::NoMergedTree)
        }
        Err(err) => {
            warn!(error = %err, "cannot read the work tree head");
            Err(SktError::NoMergedTree)
        }
    }
}

fn remove_if_exists(path: &Path, dir: bool) -> Result<bool> {
    let removed = if dir {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match removed {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SktError::io(format!("failed to remove {}", path.display()), e)),
    }
}
