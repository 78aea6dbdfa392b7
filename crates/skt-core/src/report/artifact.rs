//! Report delivery into a directory collected as CI artifacts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use super::{render_text, Report, ReportError, Reporter};
use crate::error::Result;

/// Text rendition written by the artifact reporter.
pub const REPORT_TXT: &str = "report.txt";
/// Machine-readable rendition: subject, verdict and per-stage summary.
pub const REPORT_JSON: &str = "report.json";

/// Writes the report and its attachments into a directory.
#[derive(Debug, Clone)]
pub struct ArtifactReporter {
    dir: PathBuf,
}

impl ArtifactReporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn write(&self, name: &str, content: &[u8]) -> std::result::Result<(), ReportError> {
        let path = self.dir.join(name);
        std::fs::write(&path, content).map_err(|source| ReportError::Write { path, source })
    }

    fn write_all(&self, report: &Report) -> std::result::Result<(), ReportError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| ReportError::Write {
            path: self.dir.clone(),
            source,
        })?;
        self.write(REPORT_TXT, render_text(report).as_bytes())?;
        let json = serde_json::to_vec_pretty(report)?;
        self.write(REPORT_JSON, &json)?;
        for attachment in &report.attachments {
            // attachment names are fixed by the renderer, never paths
            let name = Path::new(&attachment.name)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("attachment");
            self.write(name, attachment.content.as_bytes())?;
        }
        Ok(())
    }
}

#[async_trait]
impl Reporter for ArtifactReporter {
    fn kind(&self) -> &'static str {
        "artifact"
    }

    fn destination(&self) -> Option<String> {
        Some(self.dir.display().to_string())
    }

    async fn emit(&self, report: &Report) -> Result<()> {
        self.write_all(report)?;
        info!(dir = %self.dir.display(), "report written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::tests::merged_state;
    use crate::report::Attachment;

    #[tokio::test]
    async fn writes_text_json_and_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("artifacts");
        let mut report = Report::from_state(&merged_state());
        report.attachments.push(Attachment {
            name: "console.log".to_string(),
            content: "Linux version 4.19.0\n".to_string(),
        });

        ArtifactReporter::new(&out).emit(&report).await.unwrap();

        let text = std::fs::read_to_string(out.join(REPORT_TXT)).unwrap();
        assert!(text.starts_with("Subject: PASS: Report"));

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.join(REPORT_JSON)).unwrap()).unwrap();
        assert_eq!(json["subject"], "PASS: Report");
        assert_eq!(json["passed"], true);
        assert_eq!(json["stages"][0]["stage"], "merge");
        assert_eq!(json["stages"][0]["status"], "success");
        assert_eq!(json["stages"][3]["status"], "not run");
        assert_eq!(json["attachments"][0]["name"], "console.log");

        assert_eq!(
            std::fs::read_to_string(out.join("console.log")).unwrap(),
            "Linux version 4.19.0\n"
        );
    }
}
