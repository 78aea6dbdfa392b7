//! Contract tests for StateStore: round trip and crash safety.

use std::io::Write;
use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use skt_state::{
    BaseCheckout, BuildArtifact, BuildRecord, ConfigSource, MergeRecord, MergedTree, Outcome,
    PatchReference, PublishRecord, ReportRecord, RunState, StageResult, StateError, StateStore,
    TestRecord, TestVerdict,
};
use uuid::Uuid;

fn at(secs: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn result(outcome: Outcome, summary: &str, secs: i64) -> StageResult {
    StageResult {
        outcome,
        summary: summary.to_string(),
        finished_at: at(secs),
    }
}

/// A state with every record populated, including optional fields.
fn full_state() -> RunState {
    let mut state = RunState::default();
    state.run_id = Some(Uuid::new_v4());
    state.workdir = Some(PathBuf::from("/var/lib/skt/workdir"));
    state.record_merge(MergeRecord {
        failed_patch: None,
        merge_log: None,
        result: result(Outcome::Success, "applied 3 patches", 1_000),
        base: BaseCheckout {
            repo: "git://git.kernel.org/pub/scm/linux/kernel/git/stable/linux.git".to_string(),
            git_ref: "v4.19".to_string(),
            head: "84df9525b0c27f3ebc2ebb1864fa62a97fdedb7d".to_string(),
            commit_date: 1_540_069_390,
        },
        merged: Some(MergedTree {
            path: PathBuf::from("/var/lib/skt/workdir"),
            head: "0123456789abcdef0123456789abcdef01234567".to_string(),
            tree_id: "89abcdef0123456789abcdef0123456789abcdef".to_string(),
        }),
        patches: vec![
            PatchReference::Patchwork {
                url: "https://patchwork.ozlabs.org/patch/976545/".to_string(),
                name: "[v2] net: fix a \"quoted\" race, really".to_string(),
                mbox_sha256: "ab".repeat(32),
            },
            PatchReference::LocalFile {
                path: PathBuf::from("/tmp/0001-fix.patch"),
            },
            PatchReference::GitRef {
                url: "https://example.com/net-next.git".to_string(),
                git_ref: "master".to_string(),
                head: Some("fedcba".to_string()),
            },
        ],
    });
    state.record_build(BuildRecord {
        result: result(Outcome::Success, "kernel 4.19.0 built", 2_000),
        config_source: ConfigSource::Predefined {
            cfgtype: "tinyconfig".to_string(),
        },
        artifact: BuildArtifact {
            arch: "x86_64".to_string(),
            log: PathBuf::from("/var/lib/skt/workdir/build.log"),
            config: Some(PathBuf::from("/var/lib/skt/workdir/0123.config")),
            config_sha256: Some("cd".repeat(32)),
            tarball: Some(PathBuf::from("/var/lib/skt/workdir/0123.tar.gz")),
            krelease: Some("4.19.0".to_string()),
        },
    });
    state.record_publish(PublishRecord {
        tarball_url: Some("https://builds.example.com/0123.tar.gz".to_string()),
        config_url: Some("https://builds.example.com/0123.config".to_string()),
        result: result(Outcome::Success, "published", 2_500),
    });
    state.record_test(TestRecord {
        verdict: TestVerdict::Fail,
        console_log: Some(PathBuf::from("/var/lib/skt/workdir/console.log")),
        first_trace: Some("BUG: unable to handle kernel NULL pointer\n Call Trace:".to_string()),
        result: result(Outcome::Failure, "oops during boot", 3_000),
    });
    state.record_report(ReportRecord {
        reporter: "stdio".to_string(),
        destination: None,
        emitted_at: at(4_000),
    });
    state
}

#[test]
fn save_load_round_trip_full_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("sktrc"));
    let state = full_state();

    store.save(&state).unwrap();
    let loaded = store.load().unwrap();

    assert_eq!(loaded, state);
}

#[test]
fn save_load_round_trip_failed_merge() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("sktrc"));

    let mut state = RunState::default();
    state.record_merge(MergeRecord {
        failed_patch: Some("https://patchwork.ozlabs.org/patch/1/".to_string()),
        merge_log: Some(PathBuf::from("/w/merge.log")),
        result: result(Outcome::Failure, "patch does not apply", 10),
        base: BaseCheckout {
            repo: "r".to_string(),
            git_ref: "master".to_string(),
            head: "h".to_string(),
            commit_date: 0,
        },
        merged: None,
        patches: vec![],
    });

    store.save(&state).unwrap();
    let loaded = store.load().unwrap();
    assert_eq!(loaded, state);
    assert!(loaded.merged_tree().is_none());
}

#[test]
fn repeated_saves_replace_previous_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("sktrc"));

    store.save(&full_state()).unwrap();
    let mut smaller = RunState::default();
    smaller.workdir = Some(PathBuf::from("/other"));
    store.save(&smaller).unwrap();

    assert_eq!(store.load().unwrap(), smaller);
}

#[test]
fn interrupted_save_leaves_previous_state_loadable() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("sktrc"));
    let state = full_state();
    store.save(&state).unwrap();

    // A writer killed mid-write leaves a half-written temporary file next to
    // the rc file and never gets to the rename.
    let mut partial = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
    partial.write_all(b"[state]\nschema_version = 1\n[state.merge\nresu").unwrap();
    let _leftover = partial.into_temp_path().keep().unwrap();

    let loaded = store.load().unwrap();
    assert_eq!(loaded, state);
}

#[test]
fn no_temporary_files_left_after_save() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("sktrc"));
    store.save(&full_state()).unwrap();
    store.save(&RunState::default()).unwrap();

    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries, vec![std::ffi::OsString::from("sktrc")]);
}

#[test]
fn truncated_rc_file_is_reported_as_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sktrc");
    std::fs::write(&path, "[state]\nschema_version = 1\n[state.merge\n").unwrap();

    let err = StateStore::new(&path).load().unwrap_err();
    assert!(matches!(err, StateError::Corrupt { .. }), "got {err:?}");
}
