//! skt-state: run-state persistence for skt
//!
//! Every `skt` invocation runs a single pipeline stage and exits. This crate
//! carries the context between those invocations: the `RunState` schema and
//! the `StateStore` that keeps it in the `[state]` table of the rc file.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: the on-disk state always reflects a completed stage boundary.
//! Writes go to a temporary file next to the rc file and are renamed into
//! place, so an interrupted write leaves the previous state loadable.
//!
//! ## Key Components
//!
//! - `RunState`: merge/build/publish/test/report records of one session
//! - `StateStore`: atomic load/save/clear of the `[state]` table

mod error;
mod schema;
mod store;

pub use error::StateError;
pub use schema::{
    BaseCheckout, BuildArtifact, BuildRecord, ConfigSource, MergeRecord, MergedTree, Outcome,
    PatchReference, PublishRecord, ReportRecord, RunState, Stage, StageResult, TestRecord,
    TestVerdict, SCHEMA_VERSION,
};
pub use store::StateStore;

/// Result type for skt-state operations
pub type Result<T> = std::result::Result<T, StateError>;
