//! skt core library
//!
//! The stages of the kernel patch validation pipeline and the
//! collaborators they drive: git, the kernel build toolchain, Patchwork,
//! publishers, boot targets and reporters.
//!
//! ## Stages
//!
//! - `merge`: check out a base and apply patches (`merge`, `git`,
//!   `patchwork`)
//! - `build`: configure and build a kernel tarball (`build`)
//! - `publish`: copy build artifacts where a boot target can reach them
//!   (`publish`)
//! - `test`: boot the kernel under a watchdog and look for oopses (`boot`,
//!   `console`)
//! - `report`: render the run state and deliver it (`report`)
//!
//! `pipeline::Session` ties them to the persisted `skt_state::RunState`.

pub mod boot;
pub mod build;
pub mod config;
pub mod console;
pub mod error;
pub mod git;
pub mod merge;
pub mod obs;
pub mod patchwork;
pub mod pipeline;
pub mod process;
pub mod publish;
pub mod report;
pub mod retry;
pub mod telemetry;

pub use boot::{BootTarget, BootTestRunner, CommandTarget};
pub use build::{verify_target, BuildRequest, BuildRunner, ConfigPlan, ConfigSpec};
pub use config::RcFile;
pub use console::ConsoleLog;
pub use error::{Result, SktError};
pub use merge::{MergeRequest, PatchResolver, PatchSet};
pub use patchwork::{MboxFetcher, PatchworkClient};
pub use pipeline::{AllStages, Session, StageReport};
pub use publish::{publisher_from, Publisher};
pub use report::{reporter_from, Report, ReportError, Reporter, ReporterOptions};
pub use retry::RetryPolicy;
pub use telemetry::{init_tracing, level_for_verbosity};
