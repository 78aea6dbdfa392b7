//! Git operations on the kernel work tree.
//!
//! All commands run with `LC_ALL=C` so their output can be parsed and
//! quoted in reports regardless of the operator's locale.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, SktError};
use crate::process::{capture, capture_with_input, combined_output};

/// Identity used for commits skt creates itself (merge commits) when the
/// repository has none configured.
const FALLBACK_NAME: &str = "skt";
const FALLBACK_EMAIL: &str = "skt@localhost";

/// Name of the file holding the output of a failed patch application.
pub const MERGE_LOG: &str = "merge.log";

/// Result of applying one change on top of the current HEAD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The change is now part of HEAD.
    Clean { head: String },
    /// Git refused the change; the output explains why.
    Rejected { output: String },
}

/// A kernel git checkout with a working directory.
#[derive(Debug, Clone)]
pub struct KernelTree {
    workdir: PathBuf,
}

impl KernelTree {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.workdir
    }

    pub fn merge_log_path(&self) -> PathBuf {
        self.workdir.join(MERGE_LOG)
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new("git");
        cmd.arg("--work-tree")
            .arg(&self.workdir)
            .arg("--git-dir")
            .arg(self.workdir.join(".git"))
            .args(args)
            .current_dir(&self.workdir)
            .env("LC_ALL", "C");
        cmd
    }

    /// Run git and return trimmed stdout, failing on a non-zero exit.
    async fn git<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let cmd = self.command(args);
        let line = crate::process::describe(&cmd);
        let output = capture(cmd, "git").await?;
        if !output.status.success() {
            return Err(SktError::Git(format!(
                "`{line}` failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Create the work tree and point `origin` at `repo`.
    ///
    /// A leftover `merge.log` from an earlier run is removed.
    pub async fn init(&self, repo: &str) -> Result<()> {
        std::fs::create_dir_all(&self.workdir)
            .map_err(|e| SktError::io(format!("failed to create {}", self.workdir.display()), e))?;
        match std::fs::remove_file(self.merge_log_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SktError::io("failed to remove stale merge.log", e)),
        }

        self.git(["init", "-q"]).await?;
        if self.git(["remote", "set-url", "origin", repo]).await.is_err() {
            self.git(["remote", "add", "origin", repo]).await?;
        }

        for (key, fallback) in [("user.name", FALLBACK_NAME), ("user.email", FALLBACK_EMAIL)] {
            if self.git(["config", "--get", key]).await.is_err() {
                self.git(["config", key, fallback]).await?;
            }
        }

        info!(repo, workdir = %self.workdir.display(), "initialised work tree");
        Ok(())
    }

    /// Fetch `git_ref` from `origin` and check it out detached.
    ///
    /// Returns the full hash of the checked-out commit.
    pub async fn checkout(&self, git_ref: &str, fetch_depth: Option<u32>) -> Result<String> {
        let dstref = remote_ref("origin", git_ref);
        let mut args = vec![
            "fetch".to_string(),
            "-n".to_string(),
            "origin".to_string(),
            format!("+{git_ref}:{dstref}"),
        ];
        if let Some(depth) = fetch_depth {
            args.push("--depth".to_string());
            args.push(depth.to_string());
        }

        info!(git_ref, ?fetch_depth, "fetching base");
        self.git(&args).await?;
        self.git(["checkout", "-q", "--detach", dstref.as_str()]).await?;
        self.git(["reset", "-q", "--hard", dstref.as_str()]).await?;

        let head = self.head().await?;
        info!(git_ref, head = %head, "checked out base");
        Ok(head)
    }

    pub async fn head(&self) -> Result<String> {
        self.rev_parse("HEAD").await
    }

    /// Tree object id of HEAD, equal for equal content.
    pub async fn tree_id(&self) -> Result<String> {
        self.rev_parse("HEAD^{tree}").await
    }

    async fn rev_parse(&self, rev: &str) -> Result<String> {
        let sha = self.git(["rev-parse", "--verify", rev]).await?;
        if sha.is_empty() {
            return Err(SktError::Git(format!("git rev-parse {rev} returned nothing")));
        }
        Ok(sha)
    }

    /// Committer date of `rev`, seconds since the epoch.
    pub async fn commit_date(&self, rev: &str) -> Result<i64> {
        let raw = self.git(["show", "-s", "--format=%ct", rev]).await?;
        raw.parse()
            .map_err(|_| SktError::Git(format!("unexpected commit date {raw:?} for {rev}")))
    }

    /// Apply an mbox with `git am`. A rejected mbox is aborted.
    pub async fn apply_mbox(&self, mbox: &[u8]) -> Result<Applied> {
        let output = capture_with_input(self.command(["am", "-"]), "git", mbox).await?;
        self.finish_am(output).await
    }

    /// Apply a patch file with `git am`. A rejected patch is aborted.
    pub async fn apply_patch_file(&self, path: &Path) -> Result<Applied> {
        let output = capture(self.command([OsStr::new("am"), path.as_os_str()]), "git").await?;
        self.finish_am(output).await
    }

    async fn finish_am(&self, output: std::process::Output) -> Result<Applied> {
        if output.status.success() {
            return Ok(Applied::Clean {
                head: self.head().await?,
            });
        }
        if let Err(e) = self.git(["am", "--abort"]).await {
            warn!(error = %e, "git am --abort failed");
        }
        Ok(Applied::Rejected {
            output: combined_output(&output),
        })
    }

    /// Fetch `git_ref` from `url` and merge it into HEAD.
    pub async fn merge_ref(&self, url: &str, git_ref: &str) -> Result<Applied> {
        let remote = self.remote_name_for(url).await?;
        let dstref = remote_ref(&remote, git_ref);

        info!(remote = %remote, git_ref, "fetching merge ref");
        let refspec = format!("+{git_ref}:{dstref}");
        self.git(["fetch", "-n", remote.as_str(), refspec.as_str()]).await?;

        let output = capture(self.command(["merge", "--no-edit", dstref.as_str()]), "git").await?;
        if output.status.success() {
            return Ok(Applied::Clean {
                head: self.head().await?,
            });
        }
        if let Err(e) = self.git(["merge", "--abort"]).await {
            debug!(error = %e, "git merge --abort failed");
        }
        Ok(Applied::Rejected {
            output: combined_output(&output),
        })
    }

    /// Find or add a remote for `url`, named after the repository.
    async fn remote_name_for(&self, url: &str) -> Result<String> {
        let mut name = remote_name(url);
        loop {
            match self.git(["remote", "get-url", name.as_str()]).await {
                Ok(existing) if existing == url => return Ok(name),
                Ok(_) => name.push('_'),
                Err(_) => {
                    self.git(["remote", "add", name.as_str(), url]).await?;
                    return Ok(name);
                }
            }
        }
    }

    /// Throw away everything on top of `rev`.
    pub async fn reset_hard(&self, rev: &str) -> Result<()> {
        self.git(["reset", "-q", "--hard", rev]).await?;
        Ok(())
    }
}

/// Local tracking ref for `git_ref` fetched from `remote`.
fn remote_ref(remote: &str, git_ref: &str) -> String {
    let last = git_ref.rsplit('/').next().unwrap_or(git_ref);
    format!("refs/remotes/{remote}/{last}")
}

/// Remote name derived from the last path component of a repository URL.
fn remote_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed.rsplit(|c: char| c == '/' || c == ':').next().unwrap_or(trimmed);
    let name = last.trim_end_matches(".git");
    if name.is_empty() {
        "merge".to_string()
    } else {
        name.to_string()
    }
}
