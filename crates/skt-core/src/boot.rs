//! Boot test stage.
//!
//! The kernel is booted through a [`BootTarget`]; the only built-in target
//! runs an operator-supplied command line (typically a qemu wrapper) with
//! the build artifacts substituted in. Everything the target prints is the
//! console log, which is then searched for oopses and call traces.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use skt_state::{BuildArtifact, PublishRecord, StageResult, TestRecord, TestVerdict};
use tokio::process::Command;
use tracing::{info, warn};

use crate::console::ConsoleLog;
use crate::error::{Result, SktError};
use crate::process::{run_logged, RunStatus};

/// Console output of the boot target.
pub const CONSOLE_LOG: &str = "console.log";

/// Boot watchdog used when none is configured.
pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Exit statuses of `sh -c` meaning the boot command could not be started.
const SHELL_CANNOT_EXECUTE: i32 = 126;
const SHELL_NOT_FOUND: i32 = 127;

/// What the boot target is given to work with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootJob {
    pub tarball: Option<PathBuf>,
    pub tarball_url: Option<String>,
    pub config: Option<PathBuf>,
    pub krelease: Option<String>,
    pub workdir: PathBuf,
    pub arch: String,
}

impl BootJob {
    pub fn new(artifact: &BuildArtifact, publish: Option<&PublishRecord>, workdir: &Path) -> Self {
        Self {
            tarball: artifact.tarball.clone(),
            tarball_url: publish.and_then(|p| p.tarball_url.clone()),
            config: artifact.config.clone(),
            krelease: artifact.krelease.clone(),
            workdir: workdir.to_path_buf(),
            arch: artifact.arch.clone(),
        }
    }
}

/// Something that can boot a built kernel.
#[async_trait]
pub trait BootTarget: Send + Sync {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// Boot `job`, writing the console to `console`.
    ///
    /// An `Err` means the target could not be used at all.
    async fn boot(&self, job: &BootJob, console: &File) -> Result<RunStatus>;
}

/// Boots through a shell command line.
///
/// Placeholders `{tarball}`, `{tarball_url}`, `{config}`, `{krelease}`,
/// `{workdir}` and `{arch}` are replaced by shell-quoted values.
#[derive(Debug, Clone)]
pub struct CommandTarget {
    template: String,
    timeout: Duration,
}

impl CommandTarget {
    pub fn new(template: impl Into<String>, timeout: Duration) -> Result<Self> {
        let template = template.into();
        if template.trim().is_empty() {
            return Err(SktError::Usage("the boot command is empty".to_string()));
        }
        if timeout.is_zero() {
            return Err(SktError::Usage("the boot timeout must be positive".to_string()));
        }
        Ok(Self { template, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn render_command(&self, job: &BootJob) -> String {
        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string());
        let values = [
            ("{tarball_url}", job.tarball_url.clone()),
            ("{tarball}", path(&job.tarball)),
            ("{config}", path(&job.config)),
            ("{krelease}", job.krelease.clone()),
            ("{workdir}", Some(job.workdir.display().to_string())),
            ("{arch}", Some(job.arch.clone())),
        ];
        values
            .iter()
            .fold(self.template.clone(), |line, (placeholder, value)| {
                line.replace(placeholder, &shell_quote(value.as_deref().unwrap_or("")))
            })
    }
}

#[async_trait]
impl BootTarget for CommandTarget {
    fn describe(&self) -> String {
        format!("command `{}`", self.template)
    }

    async fn boot(&self, job: &BootJob, console: &File) -> Result<RunStatus> {
        let line = self.render_command(job);
        info!(command = %line, timeout_secs = self.timeout.as_secs(), "booting kernel");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&line).current_dir(&job.workdir);
        run_logged(cmd, "sh", console, Some(self.timeout)).await
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Runs a boot target and classifies the result.
pub struct BootTestRunner {
    target: Box<dyn BootTarget>,
    success_pattern: Option<Regex>,
}

impl BootTestRunner {
    pub fn new(target: Box<dyn BootTarget>) -> Self {
        Self {
            target,
            success_pattern: None,
        }
    }

    /// Require `pattern` to appear in the console for a pass.
    pub fn with_success_pattern(mut self, pattern: &str) -> Result<Self> {
        let re = Regex::new(pattern)
            .map_err(|e| SktError::Usage(format!("invalid --success-pattern: {e}")))?;
        self.success_pattern = Some(re);
        Ok(self)
    }

    /// Boot the artifact and classify the run.
    ///
    /// Verdicts, in order of precedence: the watchdog fired (`timeout`),
    /// the target could not be started (`infra-error`), an oops or call
    /// trace, a non-zero exit or a missing success pattern (`fail`),
    /// otherwise `pass`.
    pub async fn test(
        &self,
        artifact: &BuildArtifact,
        publish: Option<&PublishRecord>,
        workdir: &Path,
    ) -> Result<TestRecord> {
        let job = BootJob::new(artifact, publish, workdir);
        let console_path = workdir.join(CONSOLE_LOG);
        let console = File::create(&console_path).map_err(|e| {
            SktError::io(format!("failed to create {}", console_path.display()), e)
        })?;

        let status = match self.target.boot(&job, &console).await {
            Ok(status) => status,
            Err(err @ (SktError::ToolchainMissing { .. } | SktError::Io { .. })) => {
                warn!(target = %self.target.describe(), error = %err, "boot target unusable");
                return Ok(TestRecord {
                    verdict: TestVerdict::InfraError,
                    console_log: Some(console_path),
                    first_trace: None,
                    result: StageResult::error(err.to_string()),
                });
            }
            Err(err) => return Err(err),
        };
        drop(console);

        let raw = std::fs::read(&console_path)
            .map_err(|e| SktError::io(format!("failed to read {}", console_path.display()), e))?;
        let text = String::from_utf8_lossy(&raw);
        let first_trace =
            ConsoleLog::parse(&text, artifact.krelease.as_deref()).first_trace();

        let (verdict, summary) = self.classify(status, &text, first_trace.is_some());
        info!(verdict = verdict.as_str(), summary = %summary, "boot test finished");

        Ok(TestRecord {
            verdict,
            console_log: Some(console_path),
            first_trace,
            result: StageResult::new(verdict.outcome(), summary),
        })
    }

    fn classify(&self, status: RunStatus, console: &str, has_trace: bool) -> (TestVerdict, String) {
        let exit = match status {
            RunStatus::TimedOut => {
                return (
                    TestVerdict::Timeout,
                    "the boot watchdog expired".to_string(),
                )
            }
            RunStatus::Exited(exit) => exit,
        };

        if let Some(code @ (SHELL_CANNOT_EXECUTE | SHELL_NOT_FOUND)) = exit.code() {
            return (
                TestVerdict::InfraError,
                format!("the boot command could not be started (exit status {code})"),
            );
        }

        if has_trace {
            return (
                TestVerdict::Fail,
                "a call trace was found in the console log".to_string(),
            );
        }
        if !exit.success() {
            return (TestVerdict::Fail, format!("the boot target failed with {exit}"));
        }
        if let Some(pattern) = &self.success_pattern {
            if !pattern.is_match(console) {
                return (
                    TestVerdict::Fail,
                    format!("success pattern {:?} not found in the console log", pattern.as_str()),
                );
            }
        }
        (TestVerdict::Pass, "the kernel booted".to_string())
    }
}
