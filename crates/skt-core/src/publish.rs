//! Publishing build artifacts where a boot target can reach them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use skt_state::{BuildArtifact, PublishRecord, StageResult};
use tokio::process::Command;
use tracing::info;

use crate::error::{Result, SktError};
use crate::obs::emit_artifact_published;
use crate::process::{capture, combined_output, describe};
use crate::retry::{retry, RetryPolicy};

/// Makes a file reachable under a URL.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Publish `path` and return its public URL.
    async fn publish(&self, path: &Path) -> Result<String>;
}

/// Public URL of `file` published under `baseurl`.
pub fn url_for(baseurl: &str, file: &Path) -> Result<String> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SktError::Publish(format!("{} has no file name", file.display())))?;
    Ok(format!("{}/{}", baseurl.trim_end_matches('/'), name))
}

/// Copies files into a local directory, e.g. one served over HTTP.
#[derive(Debug, Clone)]
pub struct CpPublisher {
    destination: PathBuf,
    baseurl: String,
}

impl CpPublisher {
    pub fn new(destination: impl Into<PathBuf>, baseurl: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            baseurl: baseurl.into(),
        }
    }
}

#[async_trait]
impl Publisher for CpPublisher {
    fn kind(&self) -> &'static str {
        "cp"
    }

    async fn publish(&self, path: &Path) -> Result<String> {
        let url = url_for(&self.baseurl, path)?;
        std::fs::create_dir_all(&self.destination).map_err(|e| {
            SktError::io(format!("failed to create {}", self.destination.display()), e)
        })?;
        // url_for already checked the file name
        let target = self.destination.join(path.file_name().unwrap_or_default());
        std::fs::copy(path, &target).map_err(|e| {
            SktError::io(
                format!("failed to copy {} to {}", path.display(), target.display()),
                e,
            )
        })?;
        Ok(url)
    }
}

/// Copies files to a remote host with `scp`.
#[derive(Debug, Clone)]
pub struct ScpPublisher {
    program: String,
    destination: String,
    baseurl: String,
    retry: RetryPolicy,
}

impl ScpPublisher {
    pub fn new(destination: impl Into<String>, baseurl: impl Into<String>) -> Self {
        Self {
            program: "scp".to_string(),
            destination: destination.into(),
            baseurl: baseurl.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Use another `scp`-compatible program.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn copy_once(&self, path: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(path).arg(&self.destination);
        let line = describe(&cmd);
        let output = capture(cmd, &self.program).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(SktError::Publish(format!(
            "`{line}` failed with {}: {}",
            output.status,
            combined_output(&output).trim()
        )))
    }
}

#[async_trait]
impl Publisher for ScpPublisher {
    fn kind(&self) -> &'static str {
        "scp"
    }

    async fn publish(&self, path: &Path) -> Result<String> {
        let url = url_for(&self.baseurl, path)?;
        retry(
            &self.retry,
            "scp upload",
            |e: &SktError| matches!(e, SktError::Publish(_)),
            || self.copy_once(path),
        )
        .await?;
        Ok(url)
    }
}

/// Publisher for the `-p <type> <destination> <baseurl>` triple.
pub fn publisher_from(kind: &str, destination: &str, baseurl: &str) -> Result<Box<dyn Publisher>> {
    match kind {
        "cp" => Ok(Box::new(CpPublisher::new(destination, baseurl))),
        "scp" => Ok(Box::new(ScpPublisher::new(destination, baseurl))),
        other => Err(SktError::Usage(format!(
            "unknown publisher type {other:?} (expected cp or scp)"
        ))),
    }
}

/// Publish the tarball and config of a successful build.
pub async fn publish_artifact(
    publisher: &dyn Publisher,
    artifact: &BuildArtifact,
) -> Result<PublishRecord> {
    let tarball = artifact.tarball.as_deref().ok_or(SktError::NoBuild)?;

    let tarball_url = publisher.publish(tarball).await?;
    emit_artifact_published(&tarball_url);

    let config_url = match artifact.config.as_deref() {
        Some(config) => {
            let url = publisher.publish(config).await?;
            emit_artifact_published(&url);
            Some(url)
        }
        None => None,
    };

    info!(publisher = publisher.kind(), tarball_url = %tarball_url, "artifacts published");
    Ok(PublishRecord {
        result: StageResult::success(format!("published {tarball_url}")),
        tarball_url: Some(tarball_url),
        config_url,
    })
}
