//! rc file settings.
//!
//! The rc file is a TOML document. `[config]` holds defaults for command
//! line options, `[publisher]`, `[runner]` and `[reporter]` configure the
//! pluggable backends, and `[state]` belongs to `skt_state::StateStore`.
//! Command line flags always win over rc values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SktError};

/// Parsed rc file, `[state]` excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RcFile {
    pub config: RcConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<PublisherConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner: Option<RunnerConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reporter: Option<ReporterConfig>,
}

/// Defaults for command line options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RcConfig {
    pub workdir: Option<PathBuf>,
    pub wipe: Option<bool>,
    pub target: Option<String>,

    pub baserepo: Option<String>,
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub fetch_depth: Option<u32>,
    pub pw: Vec<String>,
    pub patch: Vec<PathBuf>,
    pub merge_ref: Vec<String>,
    /// Retries of a failed Patchwork download.
    pub fetch_retries: Option<u32>,
    /// Per-request HTTP timeout, seconds.
    pub http_timeout: Option<u64>,

    pub cfgtype: Option<String>,
    pub baseconfig: Option<PathBuf>,
    pub rh_configs_glob: Option<String>,
    pub makeopts: Option<String>,
    pub enable_debuginfo: Option<bool>,
    /// Build timeout, seconds.
    pub build_timeout: Option<u64>,
    /// Make program.
    pub make: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub destination: String,
    pub baseurl: String,
}

/// Boot target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub boot_cmd: Option<String>,
    /// Watchdog, seconds.
    pub timeout: Option<u64>,
    pub success_pattern: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub mail_to: Vec<String>,
    pub mail_from: Option<String>,
    pub mail_subject: Option<String>,
    pub mail_header: Vec<String>,
    pub output_dir: Option<PathBuf>,
    /// sendmail-compatible program.
    pub sendmail: Option<String>,
}

impl RcFile {
    /// Load `path`. A missing file means no settings.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(SktError::io(
                    format!("failed to read rc file {}", path.display()),
                    e,
                ))
            }
        };
        Self::parse(&raw).map_err(|reason| SktError::Config {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn parse(raw: &str) -> std::result::Result<Self, String> {
        toml::from_str(raw).map_err(|e: toml::de::Error| e.message().to_string())
    }
}
