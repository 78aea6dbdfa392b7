//! Report delivery on standard output.

use std::io::Write;

use async_trait::async_trait;

use super::{Report, Reporter};
use crate::error::{Result, SktError};

/// Plain-text rendition: subject, body and the list of attachments.
pub fn render_text(report: &Report) -> String {
    let mut text = format!("Subject: {}\n\n{}", report.subject, report.body);
    if !report.attachments.is_empty() {
        text.push_str("\nAttachments:\n");
        for attachment in &report.attachments {
            text.push_str(&format!("  - {}\n", attachment.name));
        }
    }
    text
}

/// Prints reports on standard output.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdioReporter;

#[async_trait]
impl Reporter for StdioReporter {
    fn kind(&self) -> &'static str {
        "stdio"
    }

    fn destination(&self) -> Option<String> {
        None
    }

    async fn emit(&self, report: &Report) -> Result<()> {
        print(&render_text(report)).map_err(|e| SktError::io("failed to print report", e))
    }
}

fn print(text: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()
}
