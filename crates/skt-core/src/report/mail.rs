//! Report delivery by mail through a sendmail-compatible program.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use tokio::process::Command;
use tracing::info;
use uuid::Uuid;

use super::{Report, ReportError, Reporter};
use crate::error::Result;
use crate::process::{capture_with_input, combined_output};

/// Default mail transfer program.
pub const SENDMAIL: &str = "sendmail";

const BASE64_LINE: usize = 76;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailSettings {
    pub to: Vec<String>,
    pub from: String,
    /// Replaces the generated subject.
    pub subject: Option<String>,
    /// Extra headers, e.g. `In-Reply-To`.
    pub headers: Vec<(String, String)>,
    pub sendmail: String,
}

/// Split `Name: value` header arguments.
pub(super) fn parse_headers(raw: &[String]) -> std::result::Result<Vec<(String, String)>, ReportError> {
    raw.iter()
        .map(|header| {
            let invalid = || ReportError::InvalidHeader(header.clone());
            if header.contains(|c: char| c == '\r' || c == '\n') {
                return Err(invalid());
            }
            let (name, value) = header.split_once(':').ok_or_else(invalid)?;
            let name_ok = !name.is_empty()
                && name.bytes().all(|b| b.is_ascii_graphic() && b != b':');
            if !name_ok {
                return Err(invalid());
            }
            Ok((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Sends reports with `sendmail -t -i`.
#[derive(Debug, Clone)]
pub struct MailReporter {
    settings: MailSettings,
}

impl MailReporter {
    pub fn new(settings: MailSettings) -> Self {
        Self { settings }
    }

    /// The complete RFC 822 message for `report`.
    pub fn render_message(&self, report: &Report) -> String {
        let boundary = format!("skt-{}", Uuid::new_v4().simple());
        let subject = self.settings.subject.as_deref().unwrap_or(&report.subject);

        let mut msg = String::new();
        msg.push_str(&format!("From: {}\n", self.settings.from));
        msg.push_str(&format!("To: {}\n", self.settings.to.join(", ")));
        msg.push_str(&format!("Subject: {}\n", encode_header(subject)));
        msg.push_str(&format!("Date: {}\n", Utc::now().to_rfc2822()));
        for (name, value) in &self.settings.headers {
            msg.push_str(&format!("{name}: {}\n", encode_header(value)));
        }
        msg.push_str("MIME-Version: 1.0\n");
        msg.push_str(&format!(
            "Content-Type: multipart/mixed; boundary=\"{boundary}\"\n\n"
        ));

        msg.push_str(&format!("--{boundary}\n"));
        msg.push_str("Content-Type: text/plain; charset=\"utf-8\"\n");
        msg.push_str("Content-Transfer-Encoding: 8bit\n\n");
        msg.push_str(&report.body);
        if !report.body.ends_with('\n') {
            msg.push('\n');
        }

        for attachment in &report.attachments {
            msg.push_str(&format!("--{boundary}\n"));
            msg.push_str(&format!(
                "Content-Type: text/plain; charset=\"utf-8\"; name=\"{}\"\n",
                attachment.name
            ));
            msg.push_str(&format!(
                "Content-Disposition: attachment; filename=\"{}\"\n",
                attachment.name
            ));
            msg.push_str("Content-Transfer-Encoding: base64\n\n");
            msg.push_str(&wrap_base64(attachment.content.as_bytes()));
        }
        msg.push_str(&format!("--{boundary}--\n"));
        msg
    }
}

/// RFC 2047 B encoding for non-ASCII header values.
fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?utf-8?B?{}?=", STANDARD.encode(value))
    }
}

fn wrap_base64(content: &[u8]) -> String {
    let encoded = STANDARD.encode(content);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE + 1);
    // base64 output is ASCII, so byte chunks are valid strings
    for chunk in encoded.as_bytes().chunks(BASE64_LINE) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out
}

#[async_trait]
impl Reporter for MailReporter {
    fn kind(&self) -> &'static str {
        "mail"
    }

    fn destination(&self) -> Option<String> {
        Some(self.settings.to.join(", "))
    }

    async fn emit(&self, report: &Report) -> Result<()> {
        let message = self.render_message(report);
        let mut cmd = Command::new(&self.settings.sendmail);
        cmd.arg("-t").arg("-i");

        let output = capture_with_input(cmd, &self.settings.sendmail, message.as_bytes()).await?;
        if !output.status.success() {
            return Err(ReportError::Sendmail {
                program: self.settings.sendmail.clone(),
                status: output.status.to_string(),
                output: combined_output(&output).trim().to_string(),
            }
            .into());
        }
        info!(to = %self.settings.to.join(", "), subject = %report.subject, "report mailed");
        Ok(())
    }
}
