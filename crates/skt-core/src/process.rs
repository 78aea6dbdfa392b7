//! Child process execution shared by the git, toolchain, publish and boot
//! code.
//!
//! Every child is spawned with `kill_on_drop`, so cancelling the invocation
//! never leaves a build or a boot target running behind it. Watched children
//! lead their own process group; the watchdog kills the whole group.

use std::fs::File;
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SktError};

/// How a logged child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Exited(ExitStatus),
    /// The watchdog fired and the child was killed.
    TimedOut,
}

impl RunStatus {
    pub fn success(&self) -> bool {
        matches!(self, RunStatus::Exited(status) if status.success())
    }
}

/// Classify a spawn failure: a missing executable is a missing toolchain.
pub fn spawn_error(program: &str, err: std::io::Error) -> SktError {
    if err.kind() == std::io::ErrorKind::NotFound {
        SktError::ToolchainMissing {
            program: program.to_string(),
        }
    } else {
        SktError::io(format!("failed to run {program}"), err)
    }
}

/// SIGKILL the process group led by `pid`.
fn kill_group(pid: u32) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers; a negative pid names the group.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

/// Render a command line for logs.
pub fn describe(cmd: &Command) -> String {
    let std = cmd.as_std();
    let mut line = std.get_program().to_string_lossy().into_owned();
    for arg in std.get_args() {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}

/// Run `cmd` with stdout and stderr both appended to `log`.
///
/// With a `timeout` the child and everything it started are killed once it
/// expires and `RunStatus::TimedOut` is returned.
pub async fn run_logged(
    mut cmd: Command,
    program: &str,
    log: &File,
    timeout: Option<Duration>,
) -> Result<RunStatus> {
    let stdout = log
        .try_clone()
        .map_err(|e| SktError::io("failed to duplicate log handle", e))?;
    let stderr = log
        .try_clone()
        .map_err(|e| SktError::io("failed to duplicate log handle", e))?;

    debug!(command = %describe(&cmd), "spawning");
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .process_group(0)
        .spawn()
        .map_err(|e| spawn_error(program, e))?;

    let Some(limit) = timeout else {
        let status = child
            .wait()
            .await
            .map_err(|e| SktError::io(format!("failed to wait for {program}"), e))?;
        return Ok(RunStatus::Exited(status));
    };

    match tokio::time::timeout(limit, child.wait()).await {
        Ok(status) => {
            let status =
                status.map_err(|e| SktError::io(format!("failed to wait for {program}"), e))?;
            Ok(RunStatus::Exited(status))
        }
        Err(_elapsed) => {
            debug!(program, timeout_secs = limit.as_secs(), "watchdog expired, killing");
            if let Some(pid) = child.id() {
                kill_group(pid);
            }
            child.start_kill().ok();
            child.wait().await.ok();
            Ok(RunStatus::TimedOut)
        }
    }
}

/// Run `cmd` to completion and capture its output.
pub async fn capture(mut cmd: Command, program: &str) -> Result<Output> {
    debug!(command = %describe(&cmd), "spawning");
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| spawn_error(program, e))
}

/// Run `cmd` with `input` on stdin and capture its output.
pub async fn capture_with_input(mut cmd: Command, program: &str, input: &[u8]) -> Result<Output> {
    debug!(command = %describe(&cmd), "spawning with stdin");
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(program, e))?;

    let mut stdin = child.stdin.take();
    let feed = async move {
        if let Some(stdin) = stdin.as_mut() {
            // The child may exit without reading everything; that shows up
            // in its exit status.
            stdin.write_all(input).await.ok();
            stdin.shutdown().await.ok();
        }
        drop(stdin);
    };

    let ((), output) = tokio::join!(feed, child.wait_with_output());
    output.map_err(|e| SktError::io(format!("failed to wait for {program}"), e))
}

/// Concatenate stdout and stderr of a captured child.
pub fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn run_logged_captures_both_streams() {
        let mut log = tempfile::tempfile().unwrap();
        let status = run_logged(sh("echo out; echo err >&2"), "sh", &log, None)
            .await
            .unwrap();
        assert!(status.success());

        let mut text = String::new();
        use std::io::Seek;
        log.rewind().unwrap();
        log.read_to_string(&mut text).unwrap();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[tokio::test]
    async fn run_logged_reports_failure() {
        let log = tempfile::tempfile().unwrap();
        let status = run_logged(sh("exit 3"), "sh", &log, None).await.unwrap();
        assert!(!status.success());
        assert!(matches!(status, RunStatus::Exited(s) if s.code() == Some(3)));
    }

    #[tokio::test]
    async fn run_logged_watchdog_kills_hanging_child() {
        let log = tempfile::tempfile().unwrap();
        let started = std::time::Instant::now();
        let status = run_logged(
            sh("sleep 30"),
            "sh",
            &log,
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap();
        assert_eq!(status, RunStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[cfg(target_os = "linux")]
    fn running(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            // zombies wait for a reaper but are no longer running
            Ok(stat) => !stat
                .rsplit(')')
                .next()
                .unwrap_or("")
                .trim_start()
                .starts_with('Z'),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn run_logged_watchdog_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("vm.pid");
        let log = tempfile::tempfile().unwrap();
        let script = format!("sleep 60 & echo $! > {}; wait", pid_file.display());

        let status = run_logged(sh(&script), "sh", &log, Some(Duration::from_millis(500)))
            .await
            .unwrap();
        assert_eq!(status, RunStatus::TimedOut);

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let mut alive = running(&pid);
        for _ in 0..40 {
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            alive = running(&pid);
        }
        assert!(!alive, "background child {pid} survived the watchdog");
    }

    #[tokio::test]
    async fn missing_program_is_toolchain_missing() {
        let err = capture(Command::new("skt-no-such-program"), "skt-no-such-program")
            .await
            .unwrap_err();
        assert!(matches!(err, SktError::ToolchainMissing { .. }));
    }

    #[tokio::test]
    async fn capture_with_input_feeds_stdin() {
        let output = capture_with_input(Command::new("cat"), "cat", b"mbox body")
            .await
            .unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, b"mbox body");
    }

    #[test]
    fn describe_joins_program_and_args() {
        let mut cmd = Command::new("make");
        cmd.args(["-C", "/src", "tinyconfig"]);
        assert_eq!(describe(&cmd), "make -C /src tinyconfig");
    }
}
