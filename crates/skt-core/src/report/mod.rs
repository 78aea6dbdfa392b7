//! Report rendering and delivery.
//!
//! A [`Report`] is rendered from the persisted `RunState` alone, so the
//! report stage can run in a different job than the stages it describes.
//! Delivery goes through a [`Reporter`]:
//! - `stdio`: prints the report
//! - `mail`: pipes an RFC 822 message to a sendmail-compatible program
//! - `artifact`: writes `report.txt`, `report.json` and the attachments
//!   into a directory collected by CI

mod artifact;
mod mail;
mod stdio;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use skt_state::{
    MergeRecord, Outcome, PatchReference, RunState, Stage, TestRecord, TestVerdict,
};
use tracing::debug;

use crate::merge::short;

pub use artifact::ArtifactReporter;
pub use mail::{MailReporter, MailSettings};
pub use stdio::{render_text, StdioReporter};

/// Status shown for a stage that has no recorded result.
pub const NOT_RUN: &str = "not run";

/// Reporter configuration or delivery failure.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("unknown reporter {0:?} (expected stdio, mail or artifact)")]
    UnknownReporter(String),

    #[error("the {reporter} reporter requires {option}")]
    MissingOption {
        reporter: &'static str,
        option: &'static str,
    },

    #[error("{option} cannot be used with the {reporter} reporter")]
    UnexpectedOption {
        reporter: &'static str,
        option: &'static str,
    },

    #[error("invalid mail header {0:?}: expected \"Name: value\"")]
    InvalidHeader(String),

    #[error("{option} must not contain line breaks: {value:?}")]
    LineBreak { option: &'static str, value: String },

    #[error("{program} rejected the message with {status}: {output}")]
    Sendmail {
        program: String,
        status: String,
        output: String,
    },

    #[error("failed to write report to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ReportError {
    /// True for mistakes in the invocation rather than delivery failures.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            ReportError::UnknownReporter(_)
                | ReportError::MissingOption { .. }
                | ReportError::UnexpectedOption { .. }
                | ReportError::InvalidHeader(_)
                | ReportError::LineBreak { .. }
        )
    }
}

/// A file sent along with the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub name: String,
    #[serde(skip)]
    pub content: String,
}

/// One line of the per-stage summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    pub stage: Stage,
    /// `success`, `failure`, `error` or `not run`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub subject: String,
    pub passed: bool,
    pub stages: Vec<StageSummary>,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

impl Report {
    pub fn from_state(state: &RunState) -> Self {
        let stages = Stage::REPORTED
            .iter()
            .map(|&stage| match state.stage_result(stage) {
                Some(result) => StageSummary {
                    stage,
                    status: result.outcome.as_str().to_string(),
                    summary: Some(result.summary.clone()),
                },
                None => StageSummary {
                    stage,
                    status: NOT_RUN.to_string(),
                    summary: None,
                },
            })
            .collect::<Vec<_>>();

        let mut attachments = Vec::new();
        let body = render_body(state, &stages, &mut attachments);

        Self {
            subject: subject(state),
            passed: state.all_passed(),
            stages,
            body,
            attachments,
        }
    }
}

fn failed(state: &RunState, stage: Stage) -> bool {
    state
        .stage_result(stage)
        .is_some_and(|r| r.outcome != Outcome::Success)
}

fn subject(state: &RunState) -> String {
    let verdict = if state.all_passed() { "PASS" } else { "FAIL" };
    let what = if failed(state, Stage::Merge) {
        "Patch application failed"
    } else if failed(state, Stage::Build) {
        "Build failed"
    } else {
        "Report"
    };
    let krelease = state
        .build
        .as_ref()
        .and_then(|b| b.artifact.krelease.as_deref());
    match krelease {
        Some(krelease) => format!("{verdict}: {what} for kernel {krelease}"),
        None => format!("{verdict}: {what}"),
    }
}

fn render_body(state: &RunState, stages: &[StageSummary], attachments: &mut Vec<Attachment>) -> String {
    let patched = state.merge.as_ref().is_some_and(|m| !m.patches.is_empty());
    let mut body = String::from(
        "Hello,\n\nWe appreciate your contributions to the Linux kernel and would like to help\n\
         test them. Below are the results of automatic tests we ran",
    );
    if patched {
        body.push_str(
            " on a patchset\nyou're involved with, with hope it will help you find possible issues sooner.\n",
        );
    } else {
        body.push_str(", with hope it\nwill help you find possible issues sooner.\n");
    }

    if let Some(merge) = &state.merge {
        body.push('\n');
        body.push_str(&merge_section(merge));
    }

    if failed(state, Stage::Merge) {
        if let Some(merge) = &state.merge {
            body.push_str(&merge_failure_section(merge));
        }
    } else if let Some(build) = &state.build {
        if let Some(config) = build.artifact.config.as_deref().and_then(read_attachment) {
            body.push_str("\nThe kernel was built with the attached configuration (config).\n");
            attachments.push(Attachment {
                name: "config".to_string(),
                content: config,
            });
        }
        if !build.result.passed() {
            body.push_str(
                "\nHowever, the build failed. We are attaching the build output for\n\
                 more information (build.log).\n",
            );
            if let Some(log) = read_attachment(&build.artifact.log) {
                attachments.push(Attachment {
                    name: "build.log".to_string(),
                    content: log,
                });
            }
        }
    }

    if let Some(publish) = &state.publish {
        if let Some(url) = &publish.tarball_url {
            body.push_str(&format!("\nThe kernel tarball is available at\n  {url}\n"));
        }
    }

    if let Some(test) = &state.test {
        body.push_str(&test_section(test, attachments));
    }

    body.push_str("\nStage summary:\n");
    for line in stages {
        match &line.summary {
            Some(summary) => body.push_str(&format!("  {}: {} ({summary})\n", line.stage, line.status)),
            None => body.push_str(&format!("  {}: {}\n", line.stage, line.status)),
        }
    }

    body.push_str(
        "\nPlease reply to this email if you find an issue with our testing process,\n\
         or wish to not receive these reports anymore.\n\n\
         Sincerely,\n  Kernel CI Team\n",
    );
    body
}

fn merge_section(merge: &MergeRecord) -> String {
    let base = short(&merge.base.head);
    if merge.patches.is_empty() {
        return format!(
            "We cloned the git tree and checked out {base} from the repository at\n  {}\n",
            merge.base.repo
        );
    }

    let mut text = if merge.patches.len() == 1 {
        String::from("We applied the following patch:\n\n")
    } else {
        String::from("We applied the following patches:\n\n")
    };
    for patch in &merge.patches {
        match patch {
            PatchReference::Patchwork { url, name, .. } => {
                text.push_str(&format!("  - {name},\n    grabbed from {url}\n"));
            }
            PatchReference::LocalFile { path } => {
                text.push_str(&format!("  - {}\n", path.display()));
            }
            PatchReference::GitRef { url, git_ref, .. } => {
                text.push_str(&format!("  - {git_ref} from {url}\n"));
            }
        }
    }
    text.push_str(&format!(
        "\non top of commit {base} from the repository at\n  {}\n",
        merge.base.repo
    ));
    text
}

fn merge_failure_section(merge: &MergeRecord) -> String {
    let mut text = String::from(
        "\nHowever, the application of the last patch above failed with the\nfollowing output:\n\n",
    );
    let log = merge
        .merge_log
        .as_deref()
        .and_then(read_attachment)
        .unwrap_or_else(|| merge.result.summary.clone());
    for line in log.lines() {
        // git's hints about resolving the conflict by hand are noise here
        if line.contains("The copy of the patch") || line.contains("see the failed patch") {
            break;
        }
        text.push_str(&format!("    {line}\n"));
    }
    text.push_str(
        "\nPlease note that if there are subsequent patches in the series, they weren't\n\
         applied because of the error message stated above.\n",
    );
    text
}

fn test_section(test: &TestRecord, attachments: &mut Vec<Attachment>) -> String {
    let mut text = String::from(
        "\nWe ran the following tests:\n  - Boot test\n\nwhich produced the results below:\n\n",
    );
    let verdict = match test.verdict {
        TestVerdict::Pass => "PASS",
        TestVerdict::Fail => "FAIL",
        TestVerdict::Timeout => "TIMEOUT",
        TestVerdict::InfraError => "INFRASTRUCTURE ERROR",
    };
    text.push_str(&format!("  Boot test: {verdict} ({})\n", test.result.summary));

    if test.verdict != TestVerdict::Pass {
        if let Some(trace) = &test.first_trace {
            text.push_str("\nThis is the first call trace we found:\n\n");
            for line in trace.lines() {
                text.push_str(&format!("    {line}\n"));
            }
        }
        if let Some(console) = test.console_log.as_deref().and_then(read_attachment) {
            text.push_str(
                "\nFor more information about the failure, see attached console log: console.log\n",
            );
            attachments.push(Attachment {
                name: "console.log".to_string(),
                content: console,
            });
        }
    }
    text
}

fn read_attachment(path: &Path) -> Option<String> {
    match std::fs::read(path) {
        Ok(raw) => Some(String::from_utf8_lossy(&raw).into_owned()),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "attachment not available");
            None
        }
    }
}

/// Delivers a rendered report.
#[async_trait]
pub trait Reporter: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Where reports go, for the run state.
    fn destination(&self) -> Option<String>;

    async fn emit(&self, report: &Report) -> crate::error::Result<()>;
}

/// Reporter options from the command line and the `[reporter]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReporterOptions {
    pub kind: String,
    pub mail_to: Vec<String>,
    pub mail_from: Option<String>,
    pub mail_subject: Option<String>,
    pub mail_headers: Vec<String>,
    pub output_dir: Option<PathBuf>,
    pub sendmail: Option<String>,
}

/// Validate `options` and build the reporter they describe.
pub fn reporter_from(options: &ReporterOptions) -> Result<Box<dyn Reporter>, ReportError> {
    match options.kind.as_str() {
        "stdio" => {
            reject_mail_options("stdio", options)?;
            if options.output_dir.is_some() {
                return Err(ReportError::UnexpectedOption {
                    reporter: "stdio",
                    option: "--output-dir",
                });
            }
            Ok(Box::new(StdioReporter))
        }
        "mail" => {
            if options.mail_to.is_empty() {
                return Err(ReportError::MissingOption {
                    reporter: "mail",
                    option: "--mail-to",
                });
            }
            let from = options.mail_from.clone().ok_or(ReportError::MissingOption {
                reporter: "mail",
                option: "--mail-from",
            })?;
            for to in &options.mail_to {
                single_line("--mail-to", to)?;
            }
            single_line("--mail-from", &from)?;
            if let Some(subject) = &options.mail_subject {
                single_line("--mail-subject", subject)?;
            }
            let settings = MailSettings {
                to: options.mail_to.clone(),
                from,
                subject: options.mail_subject.clone(),
                headers: mail::parse_headers(&options.mail_headers)?,
                sendmail: options
                    .sendmail
                    .clone()
                    .unwrap_or_else(|| mail::SENDMAIL.to_string()),
            };
            Ok(Box::new(MailReporter::new(settings)))
        }
        "artifact" => {
            reject_mail_options("artifact", options)?;
            let dir = options.output_dir.clone().ok_or(ReportError::MissingOption {
                reporter: "artifact",
                option: "--output-dir",
            })?;
            Ok(Box::new(ArtifactReporter::new(dir)))
        }
        other => Err(ReportError::UnknownReporter(other.to_string())),
    }
}

/// Mail option values go into a single header line.
fn single_line(option: &'static str, value: &str) -> Result<(), ReportError> {
    if value.contains(|c: char| c == '\r' || c == '\n') {
        return Err(ReportError::LineBreak {
            option,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn reject_mail_options(reporter: &'static str, options: &ReporterOptions) -> Result<(), ReportError> {
    let given = [
        (!options.mail_to.is_empty(), "--mail-to"),
        (options.mail_from.is_some(), "--mail-from"),
        (options.mail_subject.is_some(), "--mail-subject"),
        (!options.mail_headers.is_empty(), "--mail-header"),
    ];
    match given.iter().find(|(set, _)| *set) {
        Some(&(_, option)) => Err(ReportError::UnexpectedOption { reporter, option }),
        None => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use skt_state::{
        BaseCheckout, BuildArtifact, BuildRecord, ConfigSource, MergedTree, StageResult,
    };

    pub(crate) fn base() -> BaseCheckout {
        BaseCheckout {
            repo: "git://git.kernel.org/pub/scm/linux/kernel/git/stable/linux.git".to_string(),
            git_ref: "v4.19".to_string(),
            head: "84df9525b0c27f3ebc2ebb1864fa62a97fdedb7d".to_string(),
            commit_date: Utc::now().timestamp(),
        }
    }

    pub(crate) fn merged_state() -> RunState {
        let mut state = RunState::default();
        state.record_merge(MergeRecord {
            failed_patch: None,
            merge_log: None,
            result: StageResult::success("applied 1 change(s) on top of 84df9525b0c2"),
            base: base(),
            merged: Some(MergedTree {
                path: PathBuf::from("/work/linux"),
                head: "aaaa".to_string(),
                tree_id: "bbbb".to_string(),
            }),
            patches: vec![PatchReference::Patchwork {
                url: "https://patchwork.ozlabs.org/patch/976545/".to_string(),
                name: "[net] tcp: fix a stale ooo_last_skb".to_string(),
                mbox_sha256: "00".to_string(),
            }],
        });
        state
    }

    fn build(result: StageResult, dir: &Path) -> BuildRecord {
        let log = dir.join("build.log");
        std::fs::write(&log, "  CC init/main.o\nerror: expected ';'\n").unwrap();
        let config = dir.join("aaaa.config");
        std::fs::write(&config, "CONFIG_64BIT=y\n").unwrap();
        BuildRecord {
            result,
            config_source: ConfigSource::Predefined {
                cfgtype: "tinyconfig".to_string(),
            },
            artifact: BuildArtifact {
                arch: "x86_64".to_string(),
                log,
                config: Some(config),
                config_sha256: None,
                tarball: None,
                krelease: Some("4.19.0".to_string()),
            },
        }
    }

    #[test]
    fn stages_not_run_are_rendered_as_such() {
        let report = Report::from_state(&merged_state());
        let statuses: Vec<_> = report.stages.iter().map(|s| s.status.as_str()).collect();
        assert_eq!(statuses, vec!["success", NOT_RUN, NOT_RUN, NOT_RUN]);
        assert!(report.body.contains("  build: not run\n"));
        assert!(report.body.contains("  test: not run\n"));
        assert!(report.body.contains("  merge: success ("));
    }

    #[test]
    fn successful_build_subject_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = merged_state();
        state.record_build(build(StageResult::success("built"), dir.path()));

        let report = Report::from_state(&state);
        assert_eq!(report.subject, "PASS: Report for kernel 4.19.0");
        assert!(report.passed);
        assert!(report.body.contains("We applied the following patch:"));
        assert!(report.body.contains("grabbed from https://patchwork.ozlabs.org/patch/976545/"));
        assert!(report.body.contains("on top of commit 84df9525b0c2"));
        assert!(report.body.contains("attached configuration (config)"));
        let names: Vec<_> = report.attachments.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["config"]);
    }

    #[test]
    fn failed_build_attaches_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = merged_state();
        state.record_build(build(StageResult::failure("`make` failed"), dir.path()));

        let report = Report::from_state(&state);
        assert_eq!(report.subject, "FAIL: Build failed for kernel 4.19.0");
        assert!(report.body.contains("However, the build failed."));
        assert!(report
            .attachments
            .iter()
            .any(|a| a.name == "build.log" && a.content.contains("expected ';'")));
    }

    #[test]
    fn merge_failure_quotes_git_output() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("merge.log");
        std::fs::write(
            &log,
            "Applying: tcp: fix\nerror: patch failed: net/ipv4/tcp.c:42\n\
             The copy of the patch that failed is found in: .git/rebase-apply/patch\n",
        )
        .unwrap();

        let mut state = RunState::default();
        state.record_merge(MergeRecord {
            failed_patch: Some("https://patchwork.ozlabs.org/patch/1/".to_string()),
            merge_log: Some(log),
            result: StageResult::failure("does not apply"),
            base: base(),
            merged: None,
            patches: vec![PatchReference::Patchwork {
                url: "https://patchwork.ozlabs.org/patch/1/".to_string(),
                name: "[PATCH] tcp: fix".to_string(),
                mbox_sha256: "00".to_string(),
            }],
        });

        let report = Report::from_state(&state);
        assert_eq!(report.subject, "FAIL: Patch application failed");
        assert!(report.body.contains("    error: patch failed: net/ipv4/tcp.c:42\n"));
        assert!(!report.body.contains("The copy of the patch"));
        assert!(report.body.contains("they weren't\napplied"));
    }

    #[test]
    fn baseline_merge_wording() {
        let mut state = merged_state();
        if let Some(merge) = state.merge.as_mut() {
            merge.patches.clear();
        }
        let report = Report::from_state(&state);
        assert!(report
            .body
            .contains("We cloned the git tree and checked out 84df9525b0c2 from the repository at"));
        assert!(report.body.contains(", with hope it\nwill help you"));
    }

    #[test]
    fn failed_boot_includes_trace_and_console() {
        let dir = tempfile::tempdir().unwrap();
        let console = dir.path().join("console.log");
        std::fs::write(&console, "Linux version 4.19.0\nBUG: oops\n").unwrap();

        let mut state = merged_state();
        state.record_build(build(StageResult::success("built"), dir.path()));
        state.record_test(TestRecord {
            verdict: TestVerdict::Fail,
            console_log: Some(console),
            first_trace: Some("BUG: oops\nCall Trace:".to_string()),
            result: StageResult::failure("a call trace was found in the console log"),
        });

        let report = Report::from_state(&state);
        assert_eq!(report.subject, "FAIL: Report for kernel 4.19.0");
        assert!(report.body.contains("  Boot test: FAIL"));
        assert!(report.body.contains("This is the first call trace we found:\n\n    BUG: oops\n"));
        assert!(report.attachments.iter().any(|a| a.name == "console.log"));
    }

    #[test]
    fn reporter_validation() {
        let mail = ReporterOptions {
            kind: "mail".to_string(),
            mail_from: Some("ci@example.com".to_string()),
            ..Default::default()
        };
        let err = reporter_from(&mail).err().unwrap();
        assert!(err.is_usage());
        assert!(err.to_string().contains("--mail-to"));

        let stdio = ReporterOptions {
            kind: "stdio".to_string(),
            mail_to: vec!["a@example.com".to_string()],
            ..Default::default()
        };
        let err = reporter_from(&stdio).err().unwrap();
        assert!(matches!(err, ReportError::UnexpectedOption { option: "--mail-to", .. }));

        let unknown = ReporterOptions {
            kind: "jabber".to_string(),
            ..Default::default()
        };
        assert!(reporter_from(&unknown).err().unwrap().is_usage());

        let artifact = ReporterOptions {
            kind: "artifact".to_string(),
            ..Default::default()
        };
        assert!(reporter_from(&artifact).err().unwrap().is_usage());
    }

    #[test]
    fn mail_addresses_cannot_inject_headers() {
        let valid = ReporterOptions {
            kind: "mail".to_string(),
            mail_to: vec!["netdev@example.com".to_string()],
            mail_from: Some("ci@example.com".to_string()),
            ..Default::default()
        };
        assert!(reporter_from(&valid).is_ok());

        let cases = [
            ReporterOptions {
                mail_to: vec!["netdev@example.com\nBcc: evil@example.com".to_string()],
                ..valid.clone()
            },
            ReporterOptions {
                mail_from: Some("ci@example.com\r\nBcc: evil@example.com".to_string()),
                ..valid.clone()
            },
            ReporterOptions {
                mail_subject: Some("PASS\nBcc: evil@example.com".to_string()),
                ..valid.clone()
            },
        ];
        for options in cases {
            let err = reporter_from(&options).err().unwrap();
            assert!(matches!(err, ReportError::LineBreak { .. }), "{err}");
            assert!(err.is_usage());
        }
    }

    #[test]
    fn delivery_errors_are_not_usage_errors() {
        let err = ReportError::Sendmail {
            program: "sendmail".to_string(),
            status: "exit status: 75".to_string(),
            output: String::new(),
        };
        assert!(!err.is_usage());
    }
}
