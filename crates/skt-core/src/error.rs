//! Error taxonomy for skt stages.
//!
//! Stage *failures* (a conflicting patch, a broken build, an oops during
//! boot) are not errors: they are recorded in `RunState` and reported
//! through the stage outcome. The types here cover everything that stops a
//! stage from producing a verdict at all.

use std::path::PathBuf;

use skt_state::StateError;

/// Process exit status for a successful stage.
pub const EXIT_SUCCESS: i32 = 0;
/// The code under test failed: merge conflict, build failure, boot failure.
pub const EXIT_FAILURE: i32 = 1;
/// Bad invocation, ambiguous configuration or a missing prerequisite stage.
pub const EXIT_USAGE: i32 = 2;
/// Network, filesystem, toolchain or state file problem.
pub const EXIT_INFRA: i32 = 3;

/// skt errors.
#[derive(Debug, thiserror::Error)]
pub enum SktError {
    #[error("{0}")]
    Usage(String),

    #[error("ambiguous kernel config: {0}")]
    AmbiguousConfig(String),

    #[error("unsupported target architecture: {0}")]
    UnsupportedTarget(String),

    #[error("no merged tree: run `skt merge` successfully first")]
    NoMergedTree,

    #[error("no successful build: run `skt build` successfully first")]
    NoBuild,

    #[error("toolchain missing: `{program}` could not be executed")]
    ToolchainMissing { program: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("invalid rc file {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("publish failed: {0}")]
    Publish(String),

    #[error(transparent)]
    Report(#[from] crate::report::ReportError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SktError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SktError::Io {
            context: context.into(),
            source,
        }
    }

    /// Map the error to the process exit status.
    pub fn exit_code(&self) -> i32 {
        match self {
            SktError::Usage(_)
            | SktError::AmbiguousConfig(_)
            | SktError::UnsupportedTarget(_)
            | SktError::NoMergedTree
            | SktError::NoBuild => EXIT_USAGE,
            SktError::Report(e) if e.is_usage() => EXIT_USAGE,
            SktError::ToolchainMissing { .. }
            | SktError::Network(_)
            | SktError::Git(_)
            | SktError::Config { .. }
            | SktError::Publish(_)
            | SktError::Report(_)
            | SktError::State(_)
            | SktError::Io { .. } => EXIT_INFRA,
        }
    }
}

/// Result type for skt-core operations.
pub type Result<T> = std::result::Result<T, SktError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_class_errors_exit_2() {
        assert_eq!(SktError::NoMergedTree.exit_code(), EXIT_USAGE);
        assert_eq!(
            SktError::AmbiguousConfig("both set".to_string()).exit_code(),
            EXIT_USAGE
        );
        assert_eq!(SktError::Usage("bad".to_string()).exit_code(), EXIT_USAGE);
    }

    #[test]
    fn infra_class_errors_exit_3() {
        let corrupt = SktError::State(StateError::Corrupt {
            path: PathBuf::from("/tmp/sktrc"),
            reason: "expected `=`".to_string(),
        });
        assert_eq!(corrupt.exit_code(), EXIT_INFRA);
        assert_eq!(
            SktError::ToolchainMissing {
                program: "make".to_string()
            }
            .exit_code(),
            EXIT_INFRA
        );
        assert_eq!(
            SktError::io("copy", std::io::Error::other("disk full")).exit_code(),
            EXIT_INFRA
        );
    }

    #[test]
    fn no_merged_tree_message_is_actionable() {
        assert!(SktError::NoMergedTree.to_string().contains("no merged tree"));
    }
}
