//! Merge stage: base checkout plus patch or ref application.

use std::path::{Path, PathBuf};

use skt_state::{BaseCheckout, MergeRecord, MergedTree, PatchReference, StageResult};
use tracing::{info, warn};

use crate::error::{Result, SktError};
use crate::git::{Applied, KernelTree};
use crate::obs::emit_patch_applied;
use crate::patchwork::{fetch_with_retry, mbox_digest, patch_name, MboxFetcher};
use crate::retry::RetryPolicy;

/// Base ref used when none is given.
pub const DEFAULT_REF: &str = "master";

/// A git reference to merge: `"<url> [ref]"` on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRef {
    pub url: String,
    pub git_ref: String,
}

impl MergeRef {
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.split_whitespace();
        let url = parts
            .next()
            .ok_or_else(|| SktError::Usage("empty merge ref".to_string()))?;
        let git_ref = parts.next().unwrap_or(DEFAULT_REF);
        if parts.next().is_some() {
            return Err(SktError::Usage(format!(
                "merge ref {spec:?} must be \"<url> [ref]\""
            )));
        }
        Ok(Self {
            url: url.to_string(),
            git_ref: git_ref.to_string(),
        })
    }
}

/// Changes applied on top of the base. A merge uses one kind only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PatchSet {
    #[default]
    Baseline,
    Patchwork(Vec<String>),
    LocalFiles(Vec<PathBuf>),
    GitRefs(Vec<MergeRef>),
}

impl PatchSet {
    /// Build a patch set from the `--pw`, `--patch` and `--merge-ref` lists.
    pub fn from_lists(pw: Vec<String>, patches: Vec<PathBuf>, merge_refs: Vec<String>) -> Result<Self> {
        let kinds = [!pw.is_empty(), !patches.is_empty(), !merge_refs.is_empty()];
        if kinds.iter().filter(|set| **set).count() > 1 {
            return Err(SktError::Usage(
                "--merge-ref, --patch and --pw options are mutually exclusive".to_string(),
            ));
        }

        if !pw.is_empty() {
            Ok(PatchSet::Patchwork(pw))
        } else if !patches.is_empty() {
            Ok(PatchSet::LocalFiles(patches))
        } else if !merge_refs.is_empty() {
            let refs = merge_refs
                .iter()
                .map(|spec| MergeRef::parse(spec))
                .collect::<Result<Vec<_>>>()?;
            Ok(PatchSet::GitRefs(refs))
        } else {
            Ok(PatchSet::Baseline)
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PatchSet::Baseline => 0,
            PatchSet::Patchwork(urls) => urls.len(),
            PatchSet::LocalFiles(paths) => paths.len(),
            PatchSet::GitRefs(refs) => refs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Inputs of one merge.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub repo: String,
    pub git_ref: String,
    pub fetch_depth: Option<u32>,
    pub patches: PatchSet,
}

/// Checks out the base and applies the patch set.
pub struct PatchResolver<'a> {
    fetcher: &'a dyn MboxFetcher,
    retry: RetryPolicy,
}

impl<'a> PatchResolver<'a> {
    pub fn new(fetcher: &'a dyn MboxFetcher, retry: RetryPolicy) -> Self {
        Self { fetcher, retry }
    }

    /// Merge into `workdir`.
    ///
    /// A change that does not apply is not an error: the returned record is
    /// a failure naming the change, its git output is kept in `merge.log`,
    /// and the work tree is reset to the base head. Patchwork mboxes are
    /// downloaded before the tree is touched, and an error while applying
    /// resets the tree to the base head before it is returned.
    pub async fn merge(&self, workdir: &Path, request: &MergeRequest) -> Result<MergeRecord> {
        let patches = resolve_local_paths(&request.patches)?;
        let mboxes = match &patches {
            PatchSet::Patchwork(urls) => self.download(urls).await?,
            _ => Vec::new(),
        };
        let tree = KernelTree::new(workdir);

        tree.init(&request.repo).await?;
        let base_head = tree.checkout(&request.git_ref, request.fetch_depth).await?;
        let base = BaseCheckout {
            repo: request.repo.clone(),
            git_ref: request.git_ref.clone(),
            head: base_head.clone(),
            commit_date: tree.commit_date(&base_head).await?,
        };

        let mut applied: Vec<PatchReference> = Vec::with_capacity(patches.len());
        let applying = match &patches {
            PatchSet::Baseline => Ok(None),
            PatchSet::Patchwork(_) => apply_mboxes(&tree, mboxes, &mut applied).await,
            PatchSet::LocalFiles(paths) => apply_files(&tree, paths, &mut applied).await,
            PatchSet::GitRefs(refs) => merge_refs(&tree, refs, &mut applied).await,
        };
        let rejection = match applying {
            Ok(rejection) => rejection,
            Err(err) => {
                if let Err(reset) = tree.reset_hard(&base_head).await {
                    warn!(error = %reset, "failed to reset the work tree after an error");
                }
                return Err(err);
            }
        };

        if let Some(output) = rejection {
            return conflict(&tree, base, applied, &output).await;
        }

        let merged = MergedTree {
            path: workdir.to_path_buf(),
            head: tree.head().await?,
            tree_id: tree.tree_id().await?,
        };
        let summary = if applied.is_empty() {
            format!("checked out {} at {}", request.git_ref, short(&base.head))
        } else {
            format!(
                "applied {} change(s) on top of {}",
                applied.len(),
                short(&base.head)
            )
        };
        info!(head = %merged.head, tree_id = %merged.tree_id, "merge complete");

        Ok(MergeRecord {
            failed_patch: None,
            merge_log: None,
            result: StageResult::success(summary),
            base,
            merged: Some(merged),
            patches: applied,
        })
    }

    async fn download(&self, urls: &[String]) -> Result<Vec<(PatchReference, Vec<u8>)>> {
        let mut mboxes = Vec::with_capacity(urls.len());
        for url in urls {
            let mbox = fetch_with_retry(self.fetcher, url, &self.retry).await?;
            let reference = PatchReference::Patchwork {
                url: url.clone(),
                name: patch_name(&mbox),
                mbox_sha256: mbox_digest(&mbox),
            };
            mboxes.push((reference, mbox));
        }
        Ok(mboxes)
    }
}

async fn apply_mboxes(
    tree: &KernelTree,
    mboxes: Vec<(PatchReference, Vec<u8>)>,
    applied: &mut Vec<PatchReference>,
) -> Result<Option<String>> {
    for (reference, mbox) in mboxes {
        let outcome = tree.apply_mbox(&mbox).await?;
        if let Some(output) = record(reference, outcome, applied) {
            return Ok(Some(output));
        }
    }
    Ok(None)
}

async fn apply_files(
    tree: &KernelTree,
    paths: &[PathBuf],
    applied: &mut Vec<PatchReference>,
) -> Result<Option<String>> {
    for path in paths {
        let outcome = tree.apply_patch_file(path).await?;
        let reference = PatchReference::LocalFile { path: path.clone() };
        if let Some(output) = record(reference, outcome, applied) {
            return Ok(Some(output));
        }
    }
    Ok(None)
}

async fn merge_refs(
    tree: &KernelTree,
    refs: &[MergeRef],
    applied: &mut Vec<PatchReference>,
) -> Result<Option<String>> {
    for merge_ref in refs {
        let outcome = tree.merge_ref(&merge_ref.url, &merge_ref.git_ref).await?;
        let head = match &outcome {
            Applied::Clean { head } => Some(head.clone()),
            Applied::Rejected { .. } => None,
        };
        let reference = PatchReference::GitRef {
            url: merge_ref.url.clone(),
            git_ref: merge_ref.git_ref.clone(),
            head,
        };
        if let Some(output) = record(reference, outcome, applied) {
            return Ok(Some(output));
        }
    }
    Ok(None)
}

/// Append `reference` to `applied`; return git's output if it was rejected.
fn record(
    reference: PatchReference,
    outcome: Applied,
    applied: &mut Vec<PatchReference>,
) -> Option<String> {
    let label = reference.label();
    applied.push(reference);
    match outcome {
        Applied::Clean { .. } => {
            emit_patch_applied(&label);
            None
        }
        Applied::Rejected { output } => {
            warn!(patch = %label, "change does not apply");
            Some(output)
        }
    }
}

async fn conflict(
    tree: &KernelTree,
    base: BaseCheckout,
    applied: Vec<PatchReference>,
    output: &str,
) -> Result<MergeRecord> {
    let log = tree.merge_log_path();
    std::fs::write(&log, output)
        .map_err(|e| SktError::io(format!("failed to write {}", log.display()), e))?;
    tree.reset_hard(&base.head).await?;

    let failed = applied.last().map(PatchReference::label);
    let summary = match &failed {
        Some(label) => format!("{label} does not apply on top of {}", short(&base.head)),
        None => "merge failed".to_string(),
    };

    Ok(MergeRecord {
        failed_patch: failed,
        merge_log: Some(log),
        result: StageResult::failure(summary),
        base,
        merged: None,
        patches: applied,
    })
}

/// Local patch files must exist; they are recorded with absolute paths.
fn resolve_local_paths(patches: &PatchSet) -> Result<PatchSet> {
    let PatchSet::LocalFiles(paths) = patches else {
        return Ok(patches.clone());
    };
    let resolved = paths
        .iter()
        .map(|path| {
            std::fs::canonicalize(path)
                .map_err(|_| SktError::Usage(format!("patch {} not found", path.display())))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(PatchSet::LocalFiles(resolved))
}

/// Abbreviated commit hash used in summaries and reports.
pub fn short(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_ref_defaults_to_master() {
        let parsed = MergeRef::parse("https://example.com/net-next.git").unwrap();
        assert_eq!(parsed.git_ref, "master");

        let parsed = MergeRef::parse("https://example.com/net-next.git  for-linus").unwrap();
        assert_eq!(parsed.url, "https://example.com/net-next.git");
        assert_eq!(parsed.git_ref, "for-linus");
    }

    #[test]
    fn merge_ref_rejects_extra_words() {
        assert!(MergeRef::parse("url ref extra").is_err());
        assert!(MergeRef::parse("   ").is_err());
    }

    #[test]
    fn patch_kinds_are_mutually_exclusive() {
        let err = PatchSet::from_lists(
            vec!["https://patchwork.example.com/patch/1/".to_string()],
            vec![PathBuf::from("0001.patch")],
            vec![],
        )
        .unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));

        assert!(PatchSet::from_lists(vec![], vec![PathBuf::from("a")], vec!["u".to_string()]).is_err());
    }

    #[test]
    fn empty_lists_mean_baseline() {
        let set = PatchSet::from_lists(vec![], vec![], vec![]).unwrap();
        assert_eq!(set, PatchSet::Baseline);
        assert!(set.is_empty());
    }

    #[test]
    fn missing_local_patch_is_a_usage_error() {
        let set = PatchSet::LocalFiles(vec![PathBuf::from("/nonexistent/0001.patch")]);
        let err = resolve_local_paths(&set).unwrap_err();
        assert!(matches!(err, SktError::Usage(_)));
    }

    #[test]
    fn short_hash() {
        assert_eq!(short("84df9525b0c27f3ebc2ebb1864fa62a97fdedb7d"), "84df9525b0c2");
        assert_eq!(short("abc"), "abc");
    }
}
