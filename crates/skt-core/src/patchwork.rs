//! Patchwork mbox retrieval and patch naming.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::SktError;
use crate::retry::{retry, RetryPolicy};

/// Patch name used when the mbox has no `Subject` header.
pub const SUBJECT_MISSING: &str = "<SUBJECT MISSING>";
/// Patch name used when the `Subject` header cannot be decoded.
pub const SUBJECT_ENCODING_INVALID: &str = "<SUBJECT ENCODING INVALID>";

/// Failure to download an mbox.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("failed to retrieve patch from {url}, returned {status}")]
    Status { url: String, status: u16 },

    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },
}

impl FetchError {
    /// Server errors, throttling and transport problems may go away on
    /// their own; other HTTP answers will not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => *status >= 500 || *status == 429,
            FetchError::Transport { .. } => true,
        }
    }
}

impl From<FetchError> for SktError {
    fn from(err: FetchError) -> Self {
        SktError::Network(err.to_string())
    }
}

/// Source of patch mboxes.
#[async_trait]
pub trait MboxFetcher: Send + Sync {
    /// Download the mbox of the patch at `patch_url` (a single attempt).
    async fn fetch_mbox(&self, patch_url: &str) -> Result<Vec<u8>, FetchError>;
}

/// URL of the mbox rendition of a Patchwork patch page.
pub fn mbox_url(patch_url: &str) -> String {
    format!("{}/mbox", patch_url.trim_end_matches('/'))
}

/// HTTP client for Patchwork instances.
#[derive(Debug, Clone)]
pub struct PatchworkClient {
    http: reqwest::Client,
}

impl PatchworkClient {
    pub fn new(timeout: Duration) -> Result<Self, SktError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("skt/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| SktError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl MboxFetcher for PatchworkClient {
    async fn fetch_mbox(&self, patch_url: &str) -> Result<Vec<u8>, FetchError> {
        let url = mbox_url(patch_url);
        let transport = |e: reqwest::Error| FetchError::Transport {
            url: url.clone(),
            reason: e.to_string(),
        };

        let response = self.http.get(&url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: patch_url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await.map_err(transport)?;
        Ok(body.to_vec())
    }
}

/// Fetch an mbox, retrying transient failures under `policy`.
pub async fn fetch_with_retry(
    fetcher: &dyn MboxFetcher,
    patch_url: &str,
    policy: &RetryPolicy,
) -> Result<Vec<u8>, SktError> {
    info!(url = patch_url, "fetching patch mbox");
    let mbox = retry(
        policy,
        "patchwork mbox download",
        FetchError::is_transient,
        || fetcher.fetch_mbox(patch_url),
    )
    .await?;
    Ok(mbox)
}

/// SHA-256 of an mbox, hex encoded.
pub fn mbox_digest(mbox: &[u8]) -> String {
    hex::encode(Sha256::digest(mbox))
}

/// Patch name: the decoded `Subject` header of the mbox.
pub fn patch_name(mbox: &[u8]) -> String {
    let text = String::from_utf8_lossy(mbox);
    let Some(subject) = header(&text, "subject") else {
        return SUBJECT_MISSING.to_string();
    };
    if subject.trim().is_empty() {
        return SUBJECT_MISSING.to_string();
    }
    decode_encoded_words(subject.trim()).unwrap_or_else(|| SUBJECT_ENCODING_INVALID.to_string())
}

/// Unfolded value of the first header called `name` (case-insensitive).
fn header(message: &str, name: &str) -> Option<String> {
    let mut found: Option<String> = None;
    let mut collecting = false;

    for (idx, raw) in message.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        if idx == 0 && line.starts_with("From ") {
            continue;
        }
        if line.is_empty() {
            break;
        }
        if line.starts_with(|c: char| c == ' ' || c == '\t') {
            if collecting {
                if let Some(value) = found.as_mut() {
                    value.push_str(line);
                }
            }
            continue;
        }
        if collecting {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case(name) {
                found = Some(value.trim_start().to_string());
                collecting = true;
            }
        }
    }
    found
}

/// Decode RFC 2047 encoded words. `None` when a word cannot be decoded.
fn decode_encoded_words(value: &str) -> Option<String> {
    let word = Regex::new(r"=\?([^?\s]+)\?([BbQq])\?([^?\s]*)\?=").ok()?;

    let mut out = String::new();
    let mut last = 0;
    let mut previous_was_word = false;
    for caps in word.captures_iter(value) {
        let whole = caps.get(0)?;
        let between = &value[last..whole.start()];
        // Whitespace separating two encoded words is not part of the text.
        if !(previous_was_word && between.trim().is_empty()) {
            out.push_str(between);
        }

        let bytes = match &caps[2] {
            "B" | "b" => STANDARD
                .decode(&caps[3])
                .or_else(|_| STANDARD_NO_PAD.decode(&caps[3]))
                .ok()?,
            _ => decode_q(&caps[3])?,
        };
        out.push_str(&decode_charset(&caps[1], bytes)?);

        last = whole.end();
        previous_was_word = true;
    }
    out.push_str(&value[last..]);
    Some(out)
}

fn decode_q(text: &str) -> Option<Vec<u8>> {
    let raw = text.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'_' => out.push(b' '),
            b'=' => {
                let hex = text.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    Some(out)
}

fn decode_charset(charset: &str, bytes: Vec<u8>) -> Option<String> {
    // RFC 2231 allows a language suffix: utf-8*en
    let charset = charset.split('*').next().unwrap_or(charset);
    match charset.to_ascii_lowercase().as_str() {
        "iso-8859-1" | "latin1" | "latin-1" => Some(bytes.iter().map(|&b| b as char).collect()),
        _ => String::from_utf8(bytes).ok(),
    }
}
