//! RunState schema.
//!
//! Field order matters for TOML: plain values are declared before nested
//! tables and arrays of tables in every struct.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version of the `[state]` table layout written by this crate.
pub const SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Pipeline stages in chronological order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Merge,
    Build,
    Publish,
    Test,
    Report,
}

impl Stage {
    /// Stages whose results are aggregated into a report, in order.
    pub const REPORTED: [Stage; 4] = [Stage::Merge, Stage::Build, Stage::Publish, Stage::Test];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Merge => "merge",
            Stage::Build => "build",
            Stage::Publish => "publish",
            Stage::Test => "test",
            Stage::Report => "report",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Stage outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The stage did what it was asked to do.
    Success,
    /// The code under test is at fault (conflict, build failure, oops).
    Failure,
    /// Infrastructure problem; says nothing about the code under test.
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Error => "error",
        }
    }
}

/// Outcome of one stage plus diagnostic text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageResult {
    pub outcome: Outcome,
    pub summary: String,
    pub finished_at: DateTime<Utc>,
}

impl StageResult {
    pub fn new(outcome: Outcome, summary: impl Into<String>) -> Self {
        Self {
            outcome,
            summary: summary.into(),
            finished_at: Utc::now(),
        }
    }

    pub fn success(summary: impl Into<String>) -> Self {
        Self::new(Outcome::Success, summary)
    }

    pub fn failure(summary: impl Into<String>) -> Self {
        Self::new(Outcome::Failure, summary)
    }

    pub fn error(summary: impl Into<String>) -> Self {
        Self::new(Outcome::Error, summary)
    }

    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// A single change applied on top of the base checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatchReference {
    /// Patch downloaded as mbox from a Patchwork instance.
    Patchwork {
        url: String,
        name: String,
        mbox_sha256: String,
    },
    /// Patch file on the local filesystem.
    LocalFile { path: PathBuf },
    /// Git reference merged from another repository.
    GitRef {
        url: String,
        git_ref: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        head: Option<String>,
    },
}

impl PatchReference {
    /// Short human-readable label, used in logs and reports.
    pub fn label(&self) -> String {
        match self {
            PatchReference::Patchwork { url, .. } => url.clone(),
            PatchReference::LocalFile { path } => path.display().to_string(),
            PatchReference::GitRef { url, git_ref, .. } => format!("{url} {git_ref}"),
        }
    }
}

/// The checked-out base commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaseCheckout {
    pub repo: String,
    pub git_ref: String,
    pub head: String,
    /// Committer date of `head`, seconds since the epoch.
    pub commit_date: i64,
}

/// Identity of a successfully merged work tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergedTree {
    pub path: PathBuf,
    /// Commit at HEAD after all patches were applied.
    pub head: String,
    /// Git tree object id of HEAD; equal for equal content.
    pub tree_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeRecord {
    /// Label of the patch that failed to apply, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_patch: Option<String>,
    /// Output of the failed application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_log: Option<PathBuf>,
    pub result: StageResult,
    pub base: BaseCheckout,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged: Option<MergedTree>,
    #[serde(default)]
    pub patches: Vec<PatchReference>,
}

/// Where the kernel configuration came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigSource {
    /// A make config target such as `tinyconfig`, or `rh-configs`.
    Predefined { cfgtype: String },
    /// An explicit config file refreshed with `olddefconfig`.
    File { path: PathBuf },
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Predefined { cfgtype } => write!(f, "{cfgtype}"),
            ConfigSource::File { path } => write!(f, "{}", path.display()),
        }
    }
}

/// Files produced by a build, kept whether or not it succeeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildArtifact {
    pub arch: String,
    /// Combined stdout/stderr of the toolchain.
    pub log: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tarball: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub krelease: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildRecord {
    pub result: StageResult,
    pub config_source: ConfigSource,
    pub artifact: BuildArtifact,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tarball_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_url: Option<String>,
    pub result: StageResult,
}

/// Boot test classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TestVerdict {
    Pass,
    Fail,
    Timeout,
    InfraError,
}

impl TestVerdict {
    pub fn outcome(&self) -> Outcome {
        match self {
            TestVerdict::Pass => Outcome::Success,
            TestVerdict::Fail | TestVerdict::Timeout => Outcome::Failure,
            TestVerdict::InfraError => Outcome::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestVerdict::Pass => "pass",
            TestVerdict::Fail => "fail",
            TestVerdict::Timeout => "timeout",
            TestVerdict::InfraError => "infra-error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestRecord {
    pub verdict: TestVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_log: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_trace: Option<String>,
    pub result: StageResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportRecord {
    pub reporter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

/// Cross-invocation context of one pipeline session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<TestRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<ReportRecord>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            run_id: None,
            workdir: None,
            merge: None,
            build: None,
            publish: None,
            test: None,
            report: None,
        }
    }
}

impl RunState {
    /// True when no stage has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.merge.is_none()
            && self.build.is_none()
            && self.publish.is_none()
            && self.test.is_none()
            && self.report.is_none()
    }

    /// Result recorded for `stage`, if the stage ran.
    pub fn stage_result(&self, stage: Stage) -> Option<&StageResult> {
        match stage {
            Stage::Merge => self.merge.as_ref().map(|m| &m.result),
            Stage::Build => self.build.as_ref().map(|b| &b.result),
            Stage::Publish => self.publish.as_ref().map(|p| &p.result),
            Stage::Test => self.test.as_ref().map(|t| &t.result),
            Stage::Report => None,
        }
    }

    /// The merged tree, only when the last merge succeeded.
    pub fn merged_tree(&self) -> Option<&MergedTree> {
        self.merge
            .as_ref()
            .filter(|m| m.result.passed())
            .and_then(|m| m.merged.as_ref())
    }

    /// The build artifact, only when the last build succeeded.
    pub fn built_artifact(&self) -> Option<&BuildArtifact> {
        self.build
            .as_ref()
            .filter(|b| b.result.passed())
            .map(|b| &b.artifact)
    }

    /// Record a merge. Everything downstream referred to the previous tree
    /// and is dropped.
    pub fn record_merge(&mut self, record: MergeRecord) {
        self.merge = Some(record);
        self.build = None;
        self.publish = None;
        self.test = None;
        self.report = None;
    }

    /// Record a build, dropping results derived from an earlier build.
    pub fn record_build(&mut self, record: BuildRecord) {
        self.build = Some(record);
        self.publish = None;
        self.test = None;
        self.report = None;
    }

    pub fn record_publish(&mut self, record: PublishRecord) {
        self.publish = Some(record);
        self.report = None;
    }

    pub fn record_test(&mut self, record: TestRecord) {
        self.test = Some(record);
        self.report = None;
    }

    pub fn record_report(&mut self, record: ReportRecord) {
        self.report = Some(record);
    }

    /// True when no recorded stage failed or errored.
    pub fn all_passed(&self) -> bool {
        Stage::REPORTED
            .iter()
            .filter_map(|s| self.stage_result(*s))
            .all(StageResult::passed)
    }
}
