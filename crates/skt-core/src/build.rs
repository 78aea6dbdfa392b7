//! Build stage: kernel config preparation and `make targz-pkg`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use sha2::{Digest, Sha256};
use skt_state::{BuildArtifact, BuildRecord, ConfigSource, MergedTree, StageResult};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, SktError};
use crate::process::{capture, describe, run_logged, RunStatus};
use crate::retry::{retry, RetryPolicy};

/// Default limit for the kernel build itself.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Toolchain output of the build stage, kept whatever the outcome.
pub const BUILD_LOG: &str = "build.log";

/// Config selector that builds the Red Hat configs.
pub const RH_CONFIGS: &str = "rh-configs";

/// Reasons a build fails. These are verdicts on the code under test.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("`{command}` failed with {status}")]
    CommandFailed { command: String, status: String },

    #[error("`{command}` was taking too long (limit {secs}s)")]
    TimedOut { command: String, secs: u64 },

    #[error("the --rh-configs-glob {0:?} did not match any generated kernel config")]
    NoRhConfig(String),

    #[error("failed to find the tarball path in the build output")]
    TarballNotReported,

    #[error("built kernel tarball {0} not found")]
    TarballMissing(PathBuf),

    #[error("failed to find the kernel release in `make kernelrelease` output")]
    NoKernelRelease,
}

/// Build architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetArch {
    /// Target as requested, e.g. `ppc64le`; names the config variant.
    pub name: String,
    /// Value of `ARCH` for make, e.g. `powerpc`.
    pub make_arch: &'static str,
}

/// Map a target to the kernel `ARCH`. No target means the host.
pub fn verify_target(target: Option<&str>) -> Result<TargetArch> {
    let name = target.unwrap_or(std::env::consts::ARCH);
    let make_arch = if name.starts_with("x86_64") {
        "x86_64"
    } else if name.starts_with("s390x") {
        "s390"
    } else if name.starts_with("ppc64") || name.starts_with("powerpc64") {
        "powerpc"
    } else if name.starts_with("aarch64") {
        "arm64"
    } else {
        return Err(SktError::UnsupportedTarget(name.to_string()));
    };
    Ok(TargetArch {
        name: name.to_string(),
        make_arch,
    })
}

/// How the kernel configuration is chosen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSpec {
    pub cfgtype: Option<String>,
    pub config_file: Option<PathBuf>,
    pub rh_configs_glob: Option<String>,
}

/// A validated [`ConfigSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigPlan {
    /// `make <target>`, e.g. `tinyconfig`.
    MakeTarget(String),
    /// `make rh-configs` and copy the generated file matching `glob`.
    RhConfigs { glob: String },
    /// Copy the file to `.config` and refresh it with `make olddefconfig`.
    File(PathBuf),
}

impl ConfigSpec {
    /// Exactly one of `cfgtype` and `config_file` must be set.
    pub fn resolve(&self) -> Result<ConfigPlan> {
        match (&self.cfgtype, &self.config_file) {
            (Some(_), Some(_)) => Err(SktError::AmbiguousConfig(
                "both a config type and a config file were given".to_string(),
            )),
            (None, None) => Err(SktError::AmbiguousConfig(
                "neither a config type (--cfgtype) nor a config file (-c) was given".to_string(),
            )),
            (None, Some(path)) => Ok(ConfigPlan::File(path.clone())),
            (Some(cfgtype), None) if cfgtype == RH_CONFIGS => match &self.rh_configs_glob {
                Some(glob) if !glob.trim().is_empty() => {
                    glob::Pattern::new(glob).map_err(|e| {
                        SktError::Usage(format!("invalid --rh-configs-glob {glob:?}: {e}"))
                    })?;
                    Ok(ConfigPlan::RhConfigs { glob: glob.clone() })
                }
                _ => Err(SktError::AmbiguousConfig(
                    "--cfgtype rh-configs requires --rh-configs-glob to be set".to_string(),
                )),
            },
            (Some(cfgtype), None) => {
                if is_make_config_target(cfgtype) {
                    Ok(ConfigPlan::MakeTarget(cfgtype.clone()))
                } else {
                    Err(SktError::AmbiguousConfig(format!(
                        "{cfgtype:?} is not a config target"
                    )))
                }
            }
        }
    }
}

impl ConfigPlan {
    pub fn source(&self) -> ConfigSource {
        match self {
            ConfigPlan::MakeTarget(target) => ConfigSource::Predefined {
                cfgtype: target.clone(),
            },
            ConfigPlan::RhConfigs { .. } => ConfigSource::Predefined {
                cfgtype: RH_CONFIGS.to_string(),
            },
            ConfigPlan::File(path) => ConfigSource::File { path: path.clone() },
        }
    }
}

fn is_make_config_target(cfgtype: &str) -> bool {
    cfgtype.len() > "config".len()
        && cfgtype.ends_with("config")
        && cfgtype
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Split `--makeopts` into make arguments with shell quoting rules.
pub fn split_makeopts(makeopts: &str) -> Result<Vec<String>> {
    shlex::split(makeopts)
        .ok_or_else(|| SktError::Usage(format!("unbalanced quotes in --makeopts {makeopts:?}")))
}

/// Inputs of one build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub target: TargetArch,
    pub config: ConfigPlan,
    pub makeopts: Vec<String>,
    pub enable_debuginfo: bool,
    /// Run `make mrproper` first.
    pub wipe: bool,
    pub timeout: Duration,
}

/// Drives the kernel build toolchain.
#[derive(Debug, Clone)]
pub struct BuildRunner {
    make: String,
    retry: RetryPolicy,
}

impl Default for BuildRunner {
    fn default() -> Self {
        Self::new("make")
    }
}

impl BuildRunner {
    /// `make` is the make program, normally just `make`.
    pub fn new(make: impl Into<String>) -> Self {
        Self {
            make: make.into(),
            retry: RetryPolicy {
                max_retries: 2,
                backoff_base_ms: 200,
            },
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Build the merged tree.
    ///
    /// A broken build is returned as a failed record with its log; only
    /// problems outside the code under test are errors.
    pub async fn build(&self, tree: &MergedTree, request: &BuildRequest) -> Result<BuildRecord> {
        let src = tree.path.as_path();
        let log_path = src.join(BUILD_LOG);
        let log = File::create(&log_path)
            .map_err(|e| SktError::io(format!("failed to create {}", log_path.display()), e))?;

        info!(src = %src.display(), arch = %request.target.name, config = %request.config.source(), "building kernel");
        let outcome = self.run_toolchain(src, request, &log, &log_path).await?;

        let mut artifact = BuildArtifact {
            arch: request.target.name.clone(),
            log: log_path,
            config: None,
            config_sha256: None,
            tarball: None,
            krelease: None,
        };

        let dot_config = src.join(".config");
        if dot_config.is_file() {
            let snapshot = src.join(format!("{}.config", tree.head));
            self.collect(&dot_config, &snapshot, false).await?;
            let content = std::fs::read(&snapshot)
                .map_err(|e| SktError::io(format!("failed to read {}", snapshot.display()), e))?;
            artifact.config_sha256 = Some(hex::encode(Sha256::digest(&content)));
            artifact.config = Some(snapshot);
        }

        artifact.krelease = self.kernel_release(src, request).await?;

        let verdict = match outcome {
            Ok(tarball) => {
                let dest = src.join(format!("{}.tar.gz", tree.head));
                self.collect(&tarball, &dest, true).await?;
                artifact.tarball = Some(dest);
                match &artifact.krelease {
                    Some(krelease) => Ok(format!(
                        "kernel {krelease} built for {}",
                        request.target.name
                    )),
                    None => Err(BuildError::NoKernelRelease),
                }
            }
            Err(err) => Err(err),
        };

        let result = match verdict {
            Ok(summary) => {
                info!(tarball = ?artifact.tarball, krelease = ?artifact.krelease, "build succeeded");
                StageResult::success(summary)
            }
            Err(err) => {
                warn!(error = %err, log = %artifact.log.display(), "build failed");
                StageResult::failure(err.to_string())
            }
        };

        Ok(BuildRecord {
            result,
            config_source: request.config.source(),
            artifact,
        })
    }

    fn make(&self, src: &Path, request: &BuildRequest) -> Command {
        let mut cmd = Command::new(&self.make);
        cmd.arg("-C").arg(src).env("ARCH", request.target.make_arch);
        cmd
    }

    /// Run a toolchain step into the build log. `Ok(Err(_))` is a failed
    /// step, `Err(_)` a missing toolchain or an I/O problem.
    async fn step(
        &self,
        cmd: Command,
        program: &str,
        log: &File,
        timeout: Option<Duration>,
    ) -> Result<std::result::Result<(), BuildError>> {
        let command = describe(&cmd);
        info!(command = %command, "toolchain step");
        match run_logged(cmd, program, log, timeout).await? {
            status if status.success() => Ok(Ok(())),
            RunStatus::Exited(status) => Ok(Err(BuildError::CommandFailed {
                command,
                status: status.to_string(),
            })),
            RunStatus::TimedOut => Ok(Err(BuildError::TimedOut {
                command,
                secs: timeout.map(|t| t.as_secs()).unwrap_or_default(),
            })),
        }
    }

    async fn run_toolchain(
        &self,
        src: &Path,
        request: &BuildRequest,
        log: &File,
        log_path: &Path,
    ) -> Result<std::result::Result<PathBuf, BuildError>> {
        macro_rules! try_step {
            ($step:expr) => {
                if let Err(err) = $step.await? {
                    return Ok(Err(err));
                }
            };
        }

        if request.wipe {
            let mut cmd = self.make(src, request);
            cmd.arg("mrproper");
            try_step!(self.step(cmd, &self.make, log, None));
        }

        match &request.config {
            ConfigPlan::MakeTarget(target) => {
                let mut cmd = self.make(src, request);
                cmd.arg(target);
                try_step!(self.step(cmd, &self.make, log, None));
            }
            ConfigPlan::RhConfigs { glob } => {
                let mut cmd = self.make(src, request);
                cmd.arg(RH_CONFIGS);
                try_step!(self.step(cmd, &self.make, log, None));
                let Some(generated) = find_glob(src, glob)? else {
                    return Ok(Err(BuildError::NoRhConfig(glob.clone())));
                };
                info!(config = %generated.display(), "using generated Red Hat config");
                copy_file(&generated, &src.join(".config"))?;
            }
            ConfigPlan::File(path) => {
                copy_file(path, &src.join(".config"))?;
                let mut cmd = self.make(src, request);
                cmd.arg("olddefconfig");
                try_step!(self.step(cmd, &self.make, log, None));
            }
        }

        if !request.enable_debuginfo {
            let script = src.join("scripts").join("config");
            let program = script.display().to_string();
            let mut cmd = Command::new(&script);
            cmd.arg("--file")
                .arg(src.join(".config"))
                .arg("--disable")
                .arg("debug_info");
            try_step!(self.step(cmd, &program, log, None));
        }

        let jobs = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let mut cmd = self.make(src, request);
        cmd.arg("INSTALL_MOD_STRIP=1")
            .arg(format!("-j{jobs}"))
            .arg("targz-pkg")
            .args(&request.makeopts);
        try_step!(self.step(cmd, &self.make, log, Some(request.timeout)));

        let output = std::fs::read_to_string(log_path)
            .map_err(|e| SktError::io(format!("failed to read {}", log_path.display()), e))?;
        let Some(reported) = parse_tarball_path(&output) else {
            return Ok(Err(BuildError::TarballNotReported));
        };
        let tarball = src.join(reported);
        if !tarball.is_file() {
            return Ok(Err(BuildError::TarballMissing(tarball)));
        }
        Ok(Ok(tarball))
    }

    /// `make -s kernelrelease`; `None` when the release cannot be determined.
    async fn kernel_release(&self, src: &Path, request: &BuildRequest) -> Result<Option<String>> {
        let mut cmd = self.make(src, request);
        cmd.arg("-s").arg("kernelrelease");
        let output = capture(cmd, &self.make).await?;
        if !output.status.success() {
            debug!(status = %output.status, "make kernelrelease failed");
            return Ok(None);
        }
        Ok(parse_kernel_release(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Move (or copy) a build product into place, retrying transient I/O.
    async fn collect(&self, from: &Path, to: &Path, remove_source: bool) -> Result<()> {
        retry(
            &self.retry,
            "collect build artifact",
            is_transient_io,
            || async { place_file(from, to, remove_source) },
        )
        .await
        .map_err(|e| {
            SktError::io(
                format!("failed to collect {} as {}", from.display(), to.display()),
                e,
            )
        })
    }
}

fn place_file(from: &Path, to: &Path, remove_source: bool) -> std::io::Result<()> {
    if remove_source && std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)?;
    if remove_source {
        std::fs::remove_file(from)?;
    }
    Ok(())
}

fn is_transient_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
    )
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    std::fs::copy(from, to).map(|_| ()).map_err(|e| {
        SktError::io(
            format!("failed to copy {} to {}", from.display(), to.display()),
            e,
        )
    })
}

/// Tarball path announced by `make targz-pkg`.
pub fn parse_tarball_path(output: &str) -> Option<String> {
    let re = Regex::new(r"(?m)^Tarball successfully created in (.*)$").ok()?;
    re.captures(output)
        .map(|caps| caps[1].trim_end_matches('\r').trim().to_string())
}

/// First line of `make kernelrelease` output that looks like a release.
pub fn parse_kernel_release(output: &str) -> Option<String> {
    let re = Regex::new(r"^\d+\.\d+\.\d+.*$").ok()?;
    output
        .lines()
        .map(str::trim)
        .find(|line| re.is_match(line))
        .map(str::to_string)
}

/// First match (in path order) of `pattern` relative to `src`.
fn find_glob(src: &Path, pattern: &str) -> Result<Option<PathBuf>> {
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&src.to_string_lossy()),
        pattern.trim_start_matches('/')
    );
    let entries = glob::glob(&full)
        .map_err(|e| SktError::Usage(format!("invalid --rh-configs-glob {pattern:?}: {e}")))?;

    let mut found = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => found.push(path),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "skipping unreadable path"),
        }
    }
    found.sort();
    Ok(found.into_iter().next())
}
