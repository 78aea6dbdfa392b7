//! Error types for skt-state

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the state persistence layer
#[derive(Error, Debug)]
pub enum StateError {
    /// The rc file or its `[state]` table could not be parsed.
    ///
    /// The operator has to discard or repair the file; nothing is retried.
    #[error("corrupt state file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// The state was written by a newer skt.
    #[error("unsupported state schema version {found} (this skt understands up to {supported})")]
    UnsupportedSchema { found: u32, supported: u32 },

    /// Serialization error
    #[error("failed to serialize state: {0}")]
    Serialization(String),

    /// IO error while reading or replacing the rc file
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_error_names_the_file() {
        let err = StateError::Corrupt {
            path: PathBuf::from("/tmp/sktrc"),
            reason: "expected `=`".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/sktrc"));
        assert!(msg.contains("expected `=`"));
    }

    #[test]
    fn unsupported_schema_reports_both_versions() {
        let err = StateError::UnsupportedSchema {
            found: 9,
            supported: 1,
        };
        assert!(err.to_string().contains('9'));
        assert!(err.to_string().contains('1'));
    }
}
